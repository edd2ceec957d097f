//! Scripted stand-in for the bridge, with an optional emulated FPGA behind it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::{
    Command, Completion, Direction, LinkConfig, Opcode, Rejected, Request, Response, SlotId, Target, TransferStatus,
    Transport, TransportError, COMMAND_HEADER_LEN, MODEM_PREFIX_LEN, RESPONSE_ID, WORD_SIZE,
};

/// What an idle FT2232H puts in front of every packet.
const IDLE_STATUS: [u8; 2] = [0x32, 0x60];

struct Pending {
    slot: SlotId,
    direction: Direction,
    buffer: Vec<u8>,
    length: usize,
    cancelled: bool,
}

pub struct MockTransport {
    pub packet_size: usize,
    pub present: bool,
    pub fail_configure: Option<TransportError>,
    /// Refuse every submission with this error.
    pub refuse: Option<TransportError>,
    /// Report completions newest first.
    pub reverse: bool,
    /// Never complete anything and ignore cancellation.
    pub deaf: bool,
    /// Status-only packets between two data packets.
    pub noise: usize,
    /// Largest data part of one inbound packet.
    pub fragment: usize,
    /// After this many good completions, fail the next transfer.
    pub fail_after: Option<(usize, TransferStatus)>,
    /// Time a finished transfer takes to be reported.
    pub latency: Duration,
    pub fpga: Option<Fpga>,

    pub connected: bool,
    pub configured: Option<LinkConfig>,
    pub purges: usize,
    pub cancels: usize,
    pub written: Vec<u8>,
    pub out_lengths: Vec<usize>,

    outbox: VecDeque<u8>,
    pending: VecDeque<Pending>,
    done: VecDeque<Completion>,
    completed: usize,
    noise_left: usize,
}

impl MockTransport {
    /// Inbound data only comes from `respond`.
    pub fn scripted() -> Self {
        Self {
            packet_size: 64,
            present: true,
            fail_configure: None,
            refuse: None,
            reverse: false,
            deaf: false,
            noise: 0,
            fragment: usize::MAX,
            fail_after: None,
            latency: Duration::ZERO,
            fpga: None,
            connected: false,
            configured: None,
            purges: 0,
            cancels: 0,
            written: Vec::new(),
            out_lengths: Vec::new(),
            outbox: VecDeque::new(),
            pending: VecDeque::new(),
            done: VecDeque::new(),
            completed: 0,
            noise_left: 0,
        }
    }

    /// Commands written are answered by an emulated FPGA.
    pub fn with_fpga() -> Self {
        Self {
            fpga: Some(Fpga::default()),
            ..Self::scripted()
        }
    }

    pub fn fpga(&mut self) -> &mut Fpga {
        self.fpga.get_or_insert_with(Fpga::default)
    }

    /// Queues bytes the device sends next.
    pub fn respond(&mut self, bytes: &[u8]) {
        self.outbox.extend(bytes.iter().copied());
    }

    /// Queues an unsolicited interrupt frame.
    pub fn interrupt(&mut self, bitmap: u32) {
        let frame = Response {
            id: RESPONSE_ID,
            status: !(Opcode::InterruptPoll as u8),
            word_count: 0,
            target: [0; 4],
            data: bitmap,
        };
        self.respond(&frame.encode());
    }

    /// Marks everything queued as cancelled, as if cancelled from elsewhere.
    pub fn cancel_pending(&mut self) {
        for pending in self.pending.iter_mut() {
            pending.cancelled = true;
        }
    }

    fn packet(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.outbox.is_empty() {
            return None;
        }
        let mut packet = IDLE_STATUS.to_vec();
        if self.noise_left > 0 {
            self.noise_left -= 1;
            return Some(packet);
        }
        self.noise_left = self.noise;
        let room = self.packet_size.min(length).saturating_sub(MODEM_PREFIX_LEN).min(self.fragment);
        let n = room.min(self.outbox.len());
        packet.extend(self.outbox.drain(..n));
        Some(packet)
    }

    /// Completes whatever can complete, in submission order.
    fn step(&mut self) {
        let mut i = 0;
        let mut starved = false;
        while i < self.pending.len() {
            if self.pending[i].cancelled {
                i += 1;
                continue;
            }
            if let Some((after, status)) = self.fail_after {
                if self.completed == after {
                    self.fail_after = None;
                    if let Some(p) = self.pending.remove(i) {
                        self.done.push_back(Completion {
                            slot: p.slot,
                            status,
                            buffer: p.buffer,
                            actual_length: 0,
                        });
                    }
                    continue;
                }
            }
            let direction = self.pending[i].direction;
            match direction {
                Direction::Out => {
                    let Some(p) = self.pending.remove(i) else { break };
                    let data = &p.buffer[..p.length];
                    self.written.extend_from_slice(data);
                    self.out_lengths.push(p.length);
                    if let Some(fpga) = &mut self.fpga {
                        fpga.receive(data, &mut self.outbox);
                    }
                    self.completed += 1;
                    self.done.push_back(Completion {
                        slot: p.slot,
                        status: TransferStatus::Completed,
                        actual_length: p.length,
                        buffer: p.buffer,
                    });
                }
                Direction::In if starved => i += 1,
                Direction::In => match self.packet(self.pending[i].length) {
                    Some(packet) => {
                        let Some(mut p) = self.pending.remove(i) else { break };
                        let n = packet.len().min(p.buffer.len());
                        p.buffer[..n].copy_from_slice(&packet[..n]);
                        self.completed += 1;
                        self.done.push_back(Completion {
                            slot: p.slot,
                            status: TransferStatus::Completed,
                            buffer: p.buffer,
                            actual_length: n,
                        });
                    }
                    None => {
                        starved = true;
                        i += 1;
                    }
                },
            }
        }
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _vendor_id: u16, _product_id: u16) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::NotFound);
        }
        self.connected = true;
        Ok(())
    }

    fn configure(&mut self, config: &LinkConfig) -> Result<(), TransportError> {
        if let Some(err) = self.fail_configure {
            return Err(err);
        }
        self.configured = Some(config.clone());
        Ok(())
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.purges += 1;
        self.outbox.clear();
        if let Some(fpga) = &mut self.fpga {
            fpga.rx.clear();
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending.clear();
        self.done.clear();
    }

    fn max_packet_size(&self) -> usize {
        self.packet_size
    }

    fn submit(&mut self, slot: SlotId, request: Request) -> Result<(), Rejected> {
        if !self.connected {
            return Err(Rejected {
                error: TransportError::NoDevice,
                buffer: request.buffer,
            });
        }
        if let Some(error) = self.refuse {
            return Err(Rejected {
                error,
                buffer: request.buffer,
            });
        }
        self.pending.push_back(Pending {
            slot,
            direction: request.direction,
            buffer: request.buffer,
            length: request.length,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) {
        if self.deaf {
            return;
        }
        self.cancels += 1;
        if let Some(pending) = self.pending.iter_mut().find(|p| p.slot == slot) {
            pending.cancelled = true;
        }
    }

    fn poll_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if !self.deaf {
            if let Some(i) = self.pending.iter().position(|p| p.cancelled) {
                if let Some(p) = self.pending.remove(i) {
                    return Some(Completion {
                        slot: p.slot,
                        status: TransferStatus::Cancelled,
                        buffer: p.buffer,
                        actual_length: 0,
                    });
                }
            }
            if self.done.is_empty() {
                self.step();
            }
            let next = if self.reverse {
                self.done.pop_back()
            } else {
                self.done.pop_front()
            };
            if next.is_some() {
                std::thread::sleep(self.latency);
                return next;
            }
        }
        std::thread::sleep(timeout);
        None
    }
}

/// Answers command frames the way the FPGA's master core does.
#[derive(Default)]
pub struct Fpga {
    rx: Vec<u8>,
    pub registers: HashMap<(u8, u32), u32>,
    pub memory: HashMap<u32, u32>,
    pub commands: Vec<Command>,
    /// Answer with this status byte instead of the right one.
    pub status: Option<u8>,
}

impl Fpga {
    /// Preloads consecutive registers of `device`.
    pub fn load_registers(&mut self, device: u8, address: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.registers.insert((device, address + i as u32), *word);
        }
    }

    fn load(&self, target: Target, offset: u32) -> u32 {
        let value = match target {
            Target::Register { device, address } => self.registers.get(&(device, address + offset)),
            Target::Memory(address) => self.memory.get(&(address + offset)),
        };
        value.copied().unwrap_or(0)
    }

    fn store(&mut self, target: Target, offset: u32, value: u32) {
        match target {
            Target::Register { device, address } => self.registers.insert((device, address + offset), value),
            Target::Memory(address) => self.memory.insert(address + offset, value),
        };
    }

    fn receive(&mut self, bytes: &[u8], outbox: &mut VecDeque<u8>) {
        self.rx.extend_from_slice(bytes);
        while self.rx.len() >= COMMAND_HEADER_LEN {
            let Ok(command) = Command::decode(&self.rx) else {
                self.rx.clear();
                return;
            };
            let payload_len = match command.opcode {
                Opcode::Write => command.word_count as usize * WORD_SIZE,
                _ => 0,
            };
            if self.rx.len() < COMMAND_HEADER_LEN + payload_len {
                return;
            }
            let frame: Vec<u8> = self.rx.drain(..COMMAND_HEADER_LEN + payload_len).collect();

            let mut response = Response::answering(&command);
            if let Some(status) = self.status {
                response.status = status;
            }
            let mut data = Vec::new();
            match command.opcode {
                Opcode::Write => {
                    for (i, word) in frame[COMMAND_HEADER_LEN..].chunks(WORD_SIZE).enumerate() {
                        let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                        self.store(command.target, i as u32, value);
                    }
                }
                Opcode::Read => {
                    for i in 0..command.word_count {
                        data.extend_from_slice(&self.load(command.target, i).to_be_bytes());
                    }
                }
                _ => {}
            }
            outbox.extend(response.encode());
            outbox.extend(data);
            self.commands.push(command);
        }
    }
}
