//! `Transport` over an FT2232H in synchronous FIFO mode, through `nusb`.
//!
//! Interface A carries the FIFO. Interface B only drives the board's reset and
//! program lines in bit-bang mode.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture};

use crate::{
    Completion, Direction, LinkConfig, Rejected, Request, SlotId, TransferStatus, Transport, TransportError,
};

const SIO_RESET: u8 = 0x00;
const SIO_SET_FLOW_CTRL: u8 = 0x02;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0B;
const SIO_READ_PINS: u8 = 0x0C;

const RESET_SIO: u16 = 0;
const PURGE_RX: u16 = 1;
const PURGE_TX: u16 = 2;

const INDEX_A: u16 = 1;
const INDEX_B: u16 = 2;

const FIFO_IN: u8 = 0x81;
const FIFO_OUT: u8 = 0x02;
const PINS_OUT: u8 = 0x04;

/// Bridge pin modes, shifted into the high byte of the bitmode request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u8)]
pub enum BitMode {
    Reset = 0x00,
    BitBang = 0x01,
    SyncFifo = 0x40,
}

/// Interface B lines wired to the FPGA.
pub const RESET_PIN: u8 = 0x40;
pub const PROGRAM_PIN: u8 = 0x10;
const PIN_MASK: u8 = RESET_PIN | PROGRAM_PIN;

const STROBE: Duration = Duration::from_millis(300);

fn bitmode_value(mode: BitMode, mask: u8) -> u16 {
    (mode as u16) << 8 | mask as u16
}

fn transfer_status(result: Result<(), TransferError>) -> TransferStatus {
    match result {
        Ok(()) => TransferStatus::Completed,
        Err(TransferError::Cancelled) => TransferStatus::Cancelled,
        Err(TransferError::Stall) => TransferStatus::Stall,
        Err(TransferError::Disconnected) => TransferStatus::NoDevice,
        Err(_) => TransferStatus::Error,
    }
}

struct Bridge {
    device: nusb::Device,
    fifo: Interface,
    reader: Endpoint<Bulk, In>,
    writer: Endpoint<Bulk, Out>,
    reads: VecDeque<SlotId>,
    writes: VecDeque<SlotId>,
}

impl Bridge {
    fn next(&mut self, direction: Direction, timeout: Duration) -> Option<Completion> {
        let (completion, queue) = match direction {
            Direction::In => (self.reader.wait_next_complete(timeout)?, &mut self.reads),
            Direction::Out => (self.writer.wait_next_complete(timeout)?, &mut self.writes),
        };
        let Some(slot) = queue.pop_front() else {
            warn!("{:?} completion with no transfer queued", direction);
            return None;
        };
        Some(Completion {
            slot,
            status: transfer_status(completion.status),
            actual_length: completion.actual_len,
            buffer: completion.buffer.into_vec(),
        })
    }
}

fn control(interface: &Interface, request: u8, value: u16, index: u16, timeout: Duration) -> Result<(), TransportError> {
    interface
        .control_out(
            ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value,
                index,
                data: &[],
            },
            timeout,
        )
        .wait()
        .map_err(|err| {
            warn!("control request {:02x} failed: {:?}", request, err);
            TransportError::Io("control request failed")
        })
}

pub struct FtdiTransport {
    bridge: Option<Bridge>,
    control_timeout: Duration,
}

impl Default for FtdiTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FtdiTransport {
    pub fn new() -> Self {
        Self {
            bridge: None,
            control_timeout: Duration::from_millis(1000),
        }
    }

    fn bridge(&self) -> Result<&Bridge, TransportError> {
        self.bridge.as_ref().ok_or(TransportError::NoDevice)
    }

    fn fifo_control(&self, request: u8, value: u16) -> Result<(), TransportError> {
        control(&self.bridge()?.fifo, request, value, INDEX_A, self.control_timeout)
    }

    /// Pulses the FPGA reset line low.
    pub fn soft_reset(&mut self) -> Result<(), TransportError> {
        info!("resetting FPGA");
        self.strobe(RESET_PIN)
    }

    /// Pulses the program line, the FPGA reloads its image from flash.
    pub fn program_fpga(&mut self) -> Result<(), TransportError> {
        info!("reprogramming FPGA");
        self.strobe(PROGRAM_PIN)
    }

    fn strobe(&mut self, pin: u8) -> Result<(), TransportError> {
        let timeout = self.control_timeout;
        let bridge = self.bridge()?;
        let pins = bridge.device.claim_interface(1).wait().map_err(|_| TransportError::Busy)?;
        let mut out = pins
            .endpoint::<Bulk, Out>(PINS_OUT)
            .map_err(|_| TransportError::Io("no bit-bang endpoint"))?;

        control(&pins, SIO_SET_BITMODE, bitmode_value(BitMode::BitBang, PIN_MASK), INDEX_B, timeout)?;
        let level = pins
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: SIO_READ_PINS,
                    value: 0,
                    index: INDEX_B,
                    length: 1,
                },
                timeout,
            )
            .wait()
            .map_err(|_| TransportError::Io("reading pins failed"))?;
        let level = level.first().copied().unwrap_or(PIN_MASK);
        debug!("pins {:02x}, strobing {:02x}", level, pin);

        let mut drive = |value: u8| {
            out.submit(Buffer::from(vec![value]));
            match out.wait_next_complete(timeout) {
                Some(completion) if completion.status.is_ok() => Ok(()),
                _ => Err(TransportError::Io("writing pins failed")),
            }
        };
        drive(level & !pin)?;
        thread::sleep(STROBE);
        drive(level | pin)?;

        control(&pins, SIO_SET_BITMODE, bitmode_value(BitMode::Reset, 0), INDEX_B, timeout)
    }
}

impl Transport for FtdiTransport {
    fn connect(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
        let info = nusb::list_devices()
            .wait()
            .map_err(|_| TransportError::Io("cannot enumerate USB devices"))?
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(TransportError::NotFound)?;
        let device = info.open().wait().map_err(|_| TransportError::Busy)?;
        let fifo = device.claim_interface(0).wait().map_err(|_| TransportError::Busy)?;
        let reader = fifo
            .endpoint::<Bulk, In>(FIFO_IN)
            .map_err(|_| TransportError::Unsupported)?;
        let writer = fifo
            .endpoint::<Bulk, Out>(FIFO_OUT)
            .map_err(|_| TransportError::Unsupported)?;
        info!(
            "bridge {:04x}:{:04x} claimed, packets of {} bytes",
            vendor_id,
            product_id,
            reader.max_packet_size()
        );
        self.bridge = Some(Bridge {
            device,
            fifo,
            reader,
            writer,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        });
        Ok(())
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), TransportError> {
        self.fifo_control(SIO_RESET, RESET_SIO)?;
        self.fifo_control(SIO_SET_BITMODE, bitmode_value(BitMode::Reset, 0xFF))?;
        self.purge()?;
        self.fifo_control(SIO_SET_LATENCY_TIMER, config.latency_ms as u16)?;
        let bridge = self.bridge()?;
        control(
            &bridge.fifo,
            SIO_SET_FLOW_CTRL,
            0,
            config.flow_control as u16 | INDEX_A,
            self.control_timeout,
        )?;
        self.fifo_control(SIO_SET_BITMODE, bitmode_value(BitMode::SyncFifo, 0xFF))?;
        self.purge()?;
        debug!(
            "bridge in sync FIFO mode, latency {} ms, {:?}, chunks of {}",
            config.latency_ms, config.flow_control, config.chunk_size
        );
        Ok(())
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.fifo_control(SIO_RESET, PURGE_RX)?;
        self.fifo_control(SIO_RESET, PURGE_TX)
    }

    fn disconnect(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.reader.cancel_all();
            bridge.writer.cancel_all();
            info!("bridge released");
        }
    }

    fn max_packet_size(&self) -> usize {
        self.bridge
            .as_ref()
            .map(|b| b.reader.max_packet_size())
            .unwrap_or(512)
    }

    fn submit(&mut self, slot: SlotId, request: Request) -> Result<(), Rejected> {
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(Rejected {
                error: TransportError::NoDevice,
                buffer: request.buffer,
            });
        };
        let mut data = request.buffer;
        match request.direction {
            Direction::Out => {
                data.truncate(request.length);
                bridge.writer.submit(Buffer::from(data));
                bridge.writes.push_back(slot);
            }
            Direction::In => {
                let packet = bridge.reader.max_packet_size();
                let length = (request.length.div_ceil(packet) * packet).min(data.len());
                let mut buffer = Buffer::from(data);
                buffer.clear();
                buffer.set_requested_len(length);
                bridge.reader.submit(buffer);
                bridge.reads.push_back(slot);
            }
        }
        Ok(())
    }

    /// Cancels the whole endpoint queue holding `slot`.
    fn cancel(&mut self, slot: SlotId) {
        let Some(bridge) = self.bridge.as_mut() else { return };
        if bridge.reads.contains(&slot) {
            bridge.reader.cancel_all();
        } else if bridge.writes.contains(&slot) {
            bridge.writer.cancel_all();
        }
    }

    fn poll_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if let Some(bridge) = self.bridge.as_mut() {
            if !bridge.writes.is_empty() {
                if let Some(completion) = bridge.next(Direction::Out, Duration::ZERO) {
                    return Some(completion);
                }
            }
            if !bridge.reads.is_empty() {
                return bridge.next(Direction::In, timeout);
            }
            if !bridge.writes.is_empty() {
                return bridge.next(Direction::Out, timeout);
            }
        }
        thread::sleep(timeout);
        None
    }
}
