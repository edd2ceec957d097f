use std::time::Duration;

use crate::{Bus, DeviceIndex, Drt, Error};

pub mod gpio;

pub use gpio::*;

/// What a DMA engine or driver needs from the one core it drives.
pub trait DevicePort {
    fn read_register(&mut self, address: u32) -> Result<u32, Error>;

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), Error>;

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error>;

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;

    /// Bitmap of devices that raised an interrupt, 0 on timeout.
    fn wait_for_interrupts(&mut self, timeout: Duration) -> Result<u32, Error>;

    /// Does `interrupts` include this core?
    fn is_interrupt_for_device(&self, interrupts: u32) -> bool;
}

/// A core of the FPGA image, bound to its DRT index.
pub struct Device<'b, B: Bus + ?Sized> {
    bus: &'b mut B,
    index: DeviceIndex,
}

impl<'b, B: Bus + ?Sized> Device<'b, B> {
    /// Binds to the first core of `device_type` listed in `drt`.
    pub fn bind(bus: &'b mut B, drt: &Drt, device_type: u16) -> Result<Self, Error> {
        let index = drt.find_device(device_type).ok_or(Error::DeviceNotFound)?;
        debug!("device type {:04x} at index {}", device_type, index);
        Ok(Self { bus, index })
    }

    /// Binds to a known index. Index 0 is the DRT itself.
    pub fn at(bus: &'b mut B, index: DeviceIndex) -> Result<Self, Error> {
        if u8::from(index) == 0 {
            return Err(Error::DeviceNotSet);
        }
        Ok(Self { bus, index })
    }

    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    pub fn bus(&mut self) -> &mut B {
        &mut *self.bus
    }

    pub fn read_data(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.bus.read_periph_data(self.index.into(), address, buf)
    }

    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.bus.write_periph_data(self.index.into(), address, data)
    }

    pub fn set_register_bit(&mut self, address: u32, bit: u8) -> Result<(), Error> {
        self.bus.set_register_bit(self.index.into(), address, bit)
    }

    pub fn clear_register_bit(&mut self, address: u32, bit: u8) -> Result<(), Error> {
        self.bus.clear_register_bit(self.index.into(), address, bit)
    }

    pub fn read_register_bit(&mut self, address: u32, bit: u8) -> Result<bool, Error> {
        self.bus.read_register_bit(self.index.into(), address, bit)
    }

    /// Masked write of `bits` into the register at `address`.
    pub fn enable_register_bits(&mut self, address: u32, mask: u32, bits: u32) -> Result<(), Error> {
        let value = self.bus.read_register(self.index.into(), address)?;
        self.bus.write_register(self.index.into(), address, (value & !mask) | (bits & mask))
    }
}

impl<'b, B: Bus + ?Sized> DevicePort for Device<'b, B> {
    fn read_register(&mut self, address: u32) -> Result<u32, Error> {
        self.bus.read_register(self.index.into(), address)
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.bus.write_register(self.index.into(), address, value)
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.bus.read_memory(address, buf)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.bus.write_memory(address, data)
    }

    fn wait_for_interrupts(&mut self, timeout: Duration) -> Result<u32, Error> {
        self.bus.wait_for_interrupts(timeout)
    }

    fn is_interrupt_for_device(&self, interrupts: u32) -> bool {
        let bit = u8::from(self.index) as u32;
        bit < u32::BITS && interrupts & 1 << bit != 0
    }
}
