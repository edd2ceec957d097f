//! Device Resource Table: the list of cores the FPGA image carries.
//!
//! The table lives in the registers of device 0 as 32-byte records. Record 0
//! holds the table version and, at offset 4, the number of devices. Records
//! 1..=count describe one core each:
//!
//! ```text
//! type(2) sub_type(2) | nysa_flags(2) device_flags(2) | address(4) | size(4) | reserved(16)
//! ```

use core::fmt;

use crate::{Bus, Error};

pub const DRT_RECORD_SIZE: usize = 32;

/// Device index of the table itself.
pub const DRT_DEVICE: u8 = 0;

/// Device indexes are 8 bits on the wire.
pub const MAX_DEVICES: u32 = 255;

const NYSA_FLAG_MEMORY: u16 = 0x0001;

/// Position of a core in the table, also its device address on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceIndex(u8);

impl From<u8> for DeviceIndex {
    fn from(index: u8) -> Self {
        DeviceIndex(index)
    }
}

impl From<DeviceIndex> for u8 {
    fn from(index: DeviceIndex) -> Self {
        index.0
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrtError {
    Truncated { len: usize },
    TooManyDevices { count: u32 },
    NoSuchDevice { index: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DrtRecord {
    pub device_type: u16,
    pub sub_type: u16,
    pub nysa_flags: u16,
    pub device_flags: u16,
    pub address: u32,
    pub size: u32,
}

impl DrtRecord {
    fn parse(bytes: &[u8]) -> Self {
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            device_type: u16_at(0),
            sub_type: u16_at(2),
            nysa_flags: u16_at(4),
            device_flags: u16_at(6),
            address: u32_at(8),
            size: u32_at(12),
        }
    }

    /// Sits on the memory bus rather than the peripheral bus.
    pub fn is_memory(&self) -> bool {
        self.nysa_flags & NYSA_FLAG_MEMORY != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drt {
    raw: Vec<u8>,
}

impl Drt {
    /// Reads the header record, then the whole table.
    pub fn read<B: Bus + ?Sized>(bus: &mut B) -> Result<Self, Error> {
        let mut head = [0u8; DRT_RECORD_SIZE];
        bus.read_periph_data(DRT_DEVICE, 0, &mut head)?;
        let count = Self::count_in(&head);
        if count > MAX_DEVICES {
            return Err(DrtError::TooManyDevices { count }.into());
        }
        let mut raw = vec![0u8; (count as usize + 1) * DRT_RECORD_SIZE];
        bus.read_periph_data(DRT_DEVICE, 0, &mut raw)?;
        let drt = Self::from_bytes(raw)?;
        debug!("DRT version {:04x}, {} devices", drt.version(), drt.device_count());
        Ok(drt)
    }

    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, DrtError> {
        if raw.len() < DRT_RECORD_SIZE {
            return Err(DrtError::Truncated { len: raw.len() });
        }
        let count = Self::count_in(&raw);
        if count > MAX_DEVICES {
            return Err(DrtError::TooManyDevices { count });
        }
        if raw.len() < (count as usize + 1) * DRT_RECORD_SIZE {
            return Err(DrtError::Truncated { len: raw.len() });
        }
        Ok(Self { raw })
    }

    fn count_in(head: &[u8]) -> u32 {
        u32::from_be_bytes([head[4], head[5], head[6], head[7]])
    }

    pub fn version(&self) -> u16 {
        u16::from_be_bytes([self.raw[0], self.raw[1]])
    }

    pub fn device_count(&self) -> usize {
        Self::count_in(&self.raw) as usize
    }

    pub fn device(&self, index: DeviceIndex) -> Result<DrtRecord, DrtError> {
        let i = index.0 as usize;
        if i == 0 || i > self.device_count() {
            return Err(DrtError::NoSuchDevice { index: index.0 });
        }
        let start = i * DRT_RECORD_SIZE;
        Ok(DrtRecord::parse(&self.raw[start..start + DRT_RECORD_SIZE]))
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceIndex, DrtRecord)> + '_ {
        (1..=self.device_count()).filter_map(move |i| {
            let index = DeviceIndex(i as u8);
            self.device(index).ok().map(|record| (index, record))
        })
    }

    pub fn device_type(&self, index: DeviceIndex) -> Result<u16, DrtError> {
        Ok(self.device(index)?.device_type)
    }

    pub fn device_sub_type(&self, index: DeviceIndex) -> Result<u16, DrtError> {
        Ok(self.device(index)?.sub_type)
    }

    pub fn device_flags(&self, index: DeviceIndex) -> Result<u16, DrtError> {
        Ok(self.device(index)?.device_flags)
    }

    pub fn device_address(&self, index: DeviceIndex) -> Result<u32, DrtError> {
        Ok(self.device(index)?.address)
    }

    pub fn device_size(&self, index: DeviceIndex) -> Result<u32, DrtError> {
        Ok(self.device(index)?.size)
    }

    pub fn is_memory_device(&self, index: DeviceIndex) -> Result<bool, DrtError> {
        Ok(self.device(index)?.is_memory())
    }

    /// First core of `device_type`.
    pub fn find_device(&self, device_type: u16) -> Option<DeviceIndex> {
        self.devices()
            .find(|(_, record)| record.device_type == device_type)
            .map(|(index, _)| index)
    }
}
