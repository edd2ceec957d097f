use std::time::Duration;

use crate::{
    validate, Command, Error, Link, LinkConfig, LinkError, Response, ResponseError, Target, Transport,
    DEFAULT_TRANSFERS, RESPONSE_HEADER_LEN,
};

/// Register and memory access to the cores behind the FPGA's master.
///
/// Register data is one big-endian 32-bit word per address.
pub trait Bus {
    fn open(&mut self) -> Result<(), Error>;

    fn close(&mut self);

    /// Round trip with no side effect on the device.
    fn ping(&mut self) -> Result<(), Error>;

    /// Write consecutive registers of `device` starting at `address`.
    /// `data` must be a whole number of words.
    fn write_periph_data(&mut self, device: u8, address: u32, data: &[u8]) -> Result<(), Error>;

    fn read_periph_data(&mut self, device: u8, address: u32, buf: &mut [u8]) -> Result<(), Error>;

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Wait for the device to report interrupts.
    /// Returns the bitmap of devices that raised one, 0 if none did before `timeout`.
    fn wait_for_interrupts(&mut self, timeout: Duration) -> Result<u32, Error>;

    fn write_register(&mut self, device: u8, address: u32, value: u32) -> Result<(), Error> {
        self.write_periph_data(device, address, &value.to_be_bytes())
    }

    fn read_register(&mut self, device: u8, address: u32) -> Result<u32, Error> {
        let mut word = [0; 4];
        self.read_periph_data(device, address, &mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    fn set_register_bit(&mut self, device: u8, address: u32, bit: u8) -> Result<(), Error> {
        let value = self.read_register(device, address)?;
        self.write_register(device, address, value | 1 << bit)
    }

    fn clear_register_bit(&mut self, device: u8, address: u32, bit: u8) -> Result<(), Error> {
        let value = self.read_register(device, address)?;
        self.write_register(device, address, value & !(1 << bit))
    }

    fn read_register_bit(&mut self, device: u8, address: u32, bit: u8) -> Result<bool, Error> {
        Ok(self.read_register(device, address)? & 1 << bit != 0)
    }
}

/// The bus reached over the USB link.
pub struct UsbBus<T: Transport, const N: usize = DEFAULT_TRANSFERS> {
    link: Link<T, N>,
    timeout: Duration,
}

impl<T: Transport, const N: usize> UsbBus<T, N> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self {
            timeout: config.timeout,
            link: Link::new(transport, config),
        }
    }

    pub fn link(&self) -> &Link<T, N> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<T, N> {
        &mut self.link
    }

    /// Deadline of each half of a command.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Drops anything in flight or buffered, the way out of a desync.
    pub fn resync(&mut self) -> Result<(), Error> {
        self.link.flush()?;
        Ok(())
    }

    /// Sends `command` with its payload, then reads the response header and `response` bytes.
    fn transact(&mut self, command: &Command, payload: &[u8], response: &mut [u8]) -> Result<Response, Error> {
        let header = command.encode();
        let expected = header.len() + payload.len();
        let written = self.link.submit_write(&header, payload, self.timeout)?;
        if written < expected {
            return Err(Error::Incomplete {
                transferred: written,
                expected,
            });
        }

        let received = self.link.submit_read(RESPONSE_HEADER_LEN, response, self.timeout)?;
        if received.len < response.len() {
            return Err(Error::Incomplete {
                transferred: received.len,
                expected: response.len(),
            });
        }
        received.header.ok_or(Error::Incomplete {
            transferred: 0,
            expected: RESPONSE_HEADER_LEN,
        })
    }

    /// Data moving commands must be answered exactly.
    fn transact_strict(&mut self, command: &Command, payload: &[u8], response: &mut [u8]) -> Result<(), Error> {
        let answer = self.transact(command, payload, response)?;
        validate(&answer, command.command_byte())?;
        Ok(())
    }
}

impl<T: Transport, const N: usize> Bus for UsbBus<T, N> {
    fn open(&mut self) -> Result<(), Error> {
        let (vendor_id, product_id) = (self.link.config().vendor_id, self.link.config().product_id);
        self.link.open(vendor_id, product_id)?;
        Ok(())
    }

    fn close(&mut self) {
        self.link.close();
    }

    fn ping(&mut self) -> Result<(), Error> {
        let command = Command::ping();
        let answer = self.transact(&command, &[], &mut [])?;
        match validate(&answer, command.command_byte()) {
            Ok(()) => Ok(()),
            Err(ResponseError::StatusMismatch { expected, found }) => {
                warn!("ping answered with status {:02x}, expected {:02x}", found, expected);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_periph_data(&mut self, device: u8, address: u32, data: &[u8]) -> Result<(), Error> {
        let command = Command::write(Target::Register { device, address }, data.len())?;
        self.transact_strict(&command, data, &mut [])
    }

    fn read_periph_data(&mut self, device: u8, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let command = Command::read(Target::Register { device, address }, buf.len())?;
        self.transact_strict(&command, &[], buf)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let command = Command::write(Target::Memory(address), data.len())?;
        self.transact_strict(&command, data, &mut [])
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let command = Command::read(Target::Memory(address), buf.len())?;
        self.transact_strict(&command, &[], buf)
    }

    fn wait_for_interrupts(&mut self, timeout: Duration) -> Result<u32, Error> {
        match self.link.submit_read(RESPONSE_HEADER_LEN, &mut [], timeout) {
            Ok(received) => {
                let answer = received.header.ok_or(Error::Incomplete {
                    transferred: 0,
                    expected: RESPONSE_HEADER_LEN,
                })?;
                validate(&answer, Command::interrupt_poll().command_byte())?;
                trace!("interrupts {:08x}", answer.data);
                Ok(answer.data)
            }
            Err(LinkError::Timeout { transferred: 0 }) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}
