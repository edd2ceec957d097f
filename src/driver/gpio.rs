//! Driver for the GPIO core: one 32-bit port with per-pin direction and
//! edge or level interrupts.

use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};

use crate::{Bus, DeviceIndex, DevicePort, Drt, Error};

use super::Device;

pub const GPIO_DEVICE_TYPE: u16 = 1;

const PINS: u8 = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum GpioRegister {
    Port = 0,
    OutputEnable = 1,
    Interrupts = 2,
    InterruptsEnable = 3,
    /// Set bits trigger on edges, clear bits on levels.
    InterruptsEdge = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinMode {
    Input,
    Output,
}

pub struct Gpio<'b, B: Bus + ?Sized> {
    device: Device<'b, B>,
}

impl<'b, B: Bus + ?Sized> Gpio<'b, B> {
    pub fn new(device: Device<'b, B>) -> Self {
        Self { device }
    }

    /// Binds to the first GPIO core of the image.
    pub fn find(bus: &'b mut B, drt: &Drt) -> Result<Self, Error> {
        Device::bind(bus, drt, GPIO_DEVICE_TYPE).map(Self::new)
    }

    pub fn at(bus: &'b mut B, index: DeviceIndex) -> Result<Self, Error> {
        Device::at(bus, index).map(Self::new)
    }

    pub fn device(&mut self) -> &mut Device<'b, B> {
        &mut self.device
    }

    fn check(pin: u8) -> Result<u8, Error> {
        if pin < PINS {
            Ok(pin)
        } else {
            Err(Error::InvalidPin(pin))
        }
    }

    fn read(&mut self, register: GpioRegister) -> Result<u32, Error> {
        self.device.read_register(register as u32)
    }

    fn write(&mut self, register: GpioRegister, value: u32) -> Result<(), Error> {
        self.device.write_register(register as u32, value)
    }

    pub fn pin_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), Error> {
        let pin = Self::check(pin)?;
        let register = GpioRegister::OutputEnable as u32;
        match mode {
            PinMode::Output => self.device.set_register_bit(register, pin),
            PinMode::Input => self.device.clear_register_bit(register, pin),
        }
    }

    pub fn digital_write(&mut self, pin: u8, high: bool) -> Result<(), Error> {
        let pin = Self::check(pin)?;
        let register = GpioRegister::Port as u32;
        if high {
            self.device.set_register_bit(register, pin)
        } else {
            self.device.clear_register_bit(register, pin)
        }
    }

    pub fn digital_read(&mut self, pin: u8) -> Result<bool, Error> {
        let pin = Self::check(pin)?;
        self.device.read_register_bit(GpioRegister::Port as u32, pin)
    }

    pub fn toggle(&mut self, pin: u8) -> Result<(), Error> {
        let pin = Self::check(pin)?;
        let value = self.read(GpioRegister::Port)?;
        self.write(GpioRegister::Port, value ^ 1 << pin)
    }

    pub fn port(&mut self) -> Result<u32, Error> {
        self.read(GpioRegister::Port)
    }

    pub fn set_port(&mut self, value: u32) -> Result<(), Error> {
        self.write(GpioRegister::Port, value)
    }

    /// Set bits are outputs.
    pub fn output_mask(&mut self) -> Result<u32, Error> {
        self.read(GpioRegister::OutputEnable)
    }

    pub fn set_output_mask(&mut self, mask: u32) -> Result<(), Error> {
        self.write(GpioRegister::OutputEnable, mask)
    }

    pub fn set_interrupt_enable_mask(&mut self, mask: u32) -> Result<(), Error> {
        self.write(GpioRegister::InterruptsEnable, mask)
    }

    pub fn interrupt_enable_mask(&mut self) -> Result<u32, Error> {
        self.read(GpioRegister::InterruptsEnable)
    }

    pub fn set_interrupt_edge_mask(&mut self, mask: u32) -> Result<(), Error> {
        self.write(GpioRegister::InterruptsEdge, mask)
    }

    pub fn interrupt_edge_mask(&mut self) -> Result<u32, Error> {
        self.read(GpioRegister::InterruptsEdge)
    }

    /// Pins with a pending interrupt. Reading clears them on the device.
    pub fn pending_interrupts(&mut self) -> Result<u32, Error> {
        let pending = self.read(GpioRegister::Interrupts)?;
        if pending != 0 {
            debug!("GPIO {} interrupts {:08x}", self.device.index(), pending);
        }
        Ok(pending)
    }

    /// Borrows one pin as an `embedded-hal` output.
    pub fn pin(&mut self, pin: u8) -> Result<GpioPin<'_, 'b, B>, Error> {
        let pin = Self::check(pin)?;
        Ok(GpioPin { gpio: self, pin })
    }
}

pub struct GpioPin<'g, 'b, B: Bus + ?Sized> {
    gpio: &'g mut Gpio<'b, B>,
    pin: u8,
}

impl<'g, 'b, B: Bus + ?Sized> GpioPin<'g, 'b, B> {
    pub fn number(&self) -> u8 {
        self.pin
    }

    pub fn is_high(&mut self) -> Result<bool, Error> {
        self.gpio.digital_read(self.pin)
    }
}

impl<'g, 'b, B: Bus + ?Sized> OutputPin for GpioPin<'g, 'b, B> {
    type Error = Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.gpio.digital_write(self.pin, false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.gpio.digital_write(self.pin, true)
    }
}

impl<'g, 'b, B: Bus + ?Sized> ToggleableOutputPin for GpioPin<'g, 'b, B> {
    type Error = Error;

    fn toggle(&mut self) -> Result<(), Self::Error> {
        self.gpio.toggle(self.pin)
    }
}
