//! Ping-pong exchange of fixed-size blocks with a DMA-capable core.
//!
//! The core owns two memory blocks. Writing a block's size register hands it
//! to the hardware; the status register tells which blocks are empty or
//! finished. Block state follows the last status read. The only thing the
//! engine remembers on its own is which full blocks it already copied out.

use core::time::Duration;

use crate::{DevicePort, Direction, Error, FrameError, WORD_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Strategy {
    /// Hand a block back to the hardware as soon as it is free.
    Immediate = 0,
    /// Alternate blocks, re-arming one only once its sibling is free too.
    Cadence = 1,
    /// Never keep both blocks in flight.
    SingleBuffer = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    Unknown,
    Empty,
    Busy,
    Full,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadState {
    Idle,
    Busy,
    Finished,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// Bytes moved by this call.
    Done(usize),
    /// Nothing could move before giving up; call again.
    NotReady,
}

/// Status register masks of the finished and empty flags of both blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusBits {
    finished: [u32; 2],
    empty: [u32; 2],
}

impl StatusBits {
    /// Takes bit positions, not masks.
    pub fn new(finished0: u8, finished1: u8, empty0: u8, empty1: u8) -> Self {
        let mask = |bit: u8| 1u32.checked_shl(bit as u32).unwrap_or(0);
        Self {
            finished: [mask(finished0), mask(finished1)],
            empty: [mask(empty0), mask(empty1)],
        }
    }

    fn inbound(&self, status: u32, slot: usize) -> SlotState {
        if status & self.finished[slot] != 0 {
            SlotState::Full
        } else if status & self.empty[slot] != 0 {
            SlotState::Empty
        } else {
            SlotState::Busy
        }
    }

    fn outbound(&self, status: u32, slot: usize) -> SlotState {
        if status & self.empty[slot] != 0 {
            SlotState::Empty
        } else {
            SlotState::Busy
        }
    }

    /// Whether either block reports empty.
    pub fn any_empty(&self, status: u32) -> bool {
        status & (self.empty[0] | self.empty[1]) != 0
    }
}

impl Default for StatusBits {
    fn default() -> Self {
        Self::new(0, 1, 2, 3)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaConfig {
    pub status_register: u32,
    /// Memory address of each block.
    pub base: [u32; 2],
    pub base_register: [u32; 2],
    pub size_register: [u32; 2],
    /// Bytes per block, a whole number of words.
    pub block_size: u32,
    pub blocking: bool,
    pub strategy: Strategy,
    /// Longest single interrupt wait.
    pub timeout: Duration,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            status_register: 0,
            base: [0; 2],
            base_register: [0; 2],
            size_register: [0; 2],
            block_size: 0,
            blocking: true,
            strategy: Strategy::Cadence,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// What the engine knows about one block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockSlot {
    /// As last read from the status register.
    pub state: SlotState,
    /// Contents already copied out, not yet re-armed.
    drained: bool,
}

impl Default for BlockSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Unknown,
            drained: false,
        }
    }
}

impl BlockSlot {
    fn observe(&mut self, state: SlotState) {
        self.state = state;
        if state != SlotState::Full {
            self.drained = false;
        }
    }

    /// Holds data nobody read yet.
    pub fn is_full(&self) -> bool {
        self.state == SlotState::Full && !self.drained
    }

    /// Free for software to hand out.
    pub fn is_available(&self) -> bool {
        match self.state {
            SlotState::Full => self.drained,
            SlotState::Empty => true,
            _ => false,
        }
    }
}

pub struct Dma {
    config: DmaConfig,
    direction: Option<Direction>,
    bits: StatusBits,
    slots: [BlockSlot; 2],
    read_state: ReadState,
    /// Block to drain first when both are full.
    block_select: usize,
    /// Block to fill first when both are free.
    next_write: usize,
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}

impl Dma {
    pub fn new() -> Self {
        Self {
            config: DmaConfig::default(),
            direction: None,
            bits: StatusBits::default(),
            slots: [BlockSlot::default(); 2],
            read_state: ReadState::Idle,
            block_select: 0,
            next_write: 0,
        }
    }

    pub fn set_status_bits(&mut self, bits: StatusBits) {
        self.bits = bits;
    }

    pub fn config(&self) -> &DmaConfig {
        &self.config
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn slot(&self, index: usize) -> Option<&BlockSlot> {
        self.slots.get(index)
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.config.strategy = strategy;
    }

    pub fn enable_blocking(&mut self, blocking: bool) {
        self.config.blocking = blocking;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// Moves block `index`. The core learns the new base right away once set up.
    pub fn set_base<P: DevicePort + ?Sized>(&mut self, port: &mut P, index: usize, address: u32) -> Result<(), Error> {
        if index > 1 {
            return Err(Error::InvalidSlot(index));
        }
        if self.direction.is_some() {
            port.write_register(self.config.base_register[index], address)?;
        }
        self.config.base[index] = address;
        Ok(())
    }

    /// Prepares streaming from the core into memory blocks.
    pub fn setup_read<P: DevicePort + ?Sized>(&mut self, port: &mut P, config: DmaConfig) -> Result<(), Error> {
        self.setup(port, config, Direction::In)
    }

    /// Prepares streaming from memory blocks out to the core.
    pub fn setup_write<P: DevicePort + ?Sized>(&mut self, port: &mut P, config: DmaConfig) -> Result<(), Error> {
        self.setup(port, config, Direction::Out)
    }

    fn setup<P: DevicePort + ?Sized>(&mut self, port: &mut P, config: DmaConfig, direction: Direction) -> Result<(), Error> {
        let block = config.block_size as usize;
        if block == 0 || block % WORD_SIZE != 0 {
            return Err(FrameError::Unaligned { len: block }.into());
        }
        for slot in 0..2 {
            port.write_register(config.base_register[slot], config.base[slot])?;
        }
        debug!(
            "DMA {:?} setup, blocks {:08x}/{:08x} of {} bytes, {:?}",
            direction, config.base[0], config.base[1], block, config.strategy
        );
        self.config = config;
        self.direction = Some(direction);
        self.slots = [BlockSlot::default(); 2];
        self.read_state = ReadState::Idle;
        self.block_select = 0;
        self.next_write = 0;
        Ok(())
    }

    fn check(&self, direction: Direction) -> Result<usize, Error> {
        match self.direction {
            Some(d) if d == direction => Ok(self.config.block_size as usize),
            _ => Err(Error::NotConfigured),
        }
    }

    fn transition(&mut self, next: ReadState) {
        if next != self.read_state {
            debug!("DMA read {:?} -> {:?}", self.read_state, next);
            self.read_state = next;
        }
    }

    fn arm<P: DevicePort + ?Sized>(&mut self, port: &mut P, slot: usize, len: usize) -> Result<(), Error> {
        port.write_register(self.config.size_register[slot], len as u32)?;
        self.slots[slot].drained = false;
        trace!("DMA block {} armed with {} bytes", slot, len);
        Ok(())
    }

    /// One interrupt wait. Returns the bitmap, 0 once it timed out.
    fn wait<P: DevicePort + ?Sized>(&self, port: &mut P) -> Result<u32, Error> {
        let interrupts = port.wait_for_interrupts(self.config.timeout)?;
        if interrupts == 0 {
            debug!("DMA wait timed out");
        } else if !port.is_interrupt_for_device(interrupts) {
            trace!("interrupts {:08x} are for other devices", interrupts);
        }
        Ok(interrupts)
    }

    /// Copies the next finished block into `buf`.
    ///
    /// Returns `Done(block_size)` once one block was read, or `NotReady` when
    /// non-blocking, or when blocking and no interrupt arrived in time.
    pub fn read<P: DevicePort + ?Sized>(&mut self, port: &mut P, buf: &mut [u8]) -> Result<Progress, Error> {
        let block = self.check(Direction::In)?;
        if buf.len() < block {
            return Err(Error::BufferTooSmall {
                needed: block,
                got: buf.len(),
            });
        }
        let mut expired = false;
        // armed during this call and not waited on since
        let mut fresh = false;
        let mut status: Option<u32> = None;
        loop {
            match self.read_state {
                ReadState::Idle => {
                    self.arm(port, 0, block)?;
                    if self.config.strategy == Strategy::Immediate {
                        self.arm(port, 1, block)?;
                    }
                    fresh = true;
                    self.transition(ReadState::Busy);
                }
                ReadState::Busy => {
                    let value = port.read_register(self.config.status_register)?;
                    self.observe_inbound(value);
                    let idle = self.slots.iter().all(|slot| slot.state == SlotState::Empty);
                    if self.slots.iter().any(BlockSlot::is_full) {
                        self.transition(ReadState::Finished);
                    } else if idle && !fresh {
                        status = Some(value);
                        self.transition(ReadState::Unknown);
                    } else if !self.config.blocking || expired {
                        return Ok(Progress::NotReady);
                    } else {
                        expired = self.wait(port)? == 0;
                        fresh = false;
                    }
                }
                ReadState::Finished => {
                    let slot = match (self.slots[0].is_full(), self.slots[1].is_full()) {
                        (true, true) => {
                            let slot = self.block_select;
                            self.block_select = 1 - slot;
                            slot
                        }
                        (true, false) => 0,
                        (false, true) => 1,
                        (false, false) => {
                            self.transition(ReadState::Unknown);
                            continue;
                        }
                    };
                    port.read_memory(self.config.base[slot], &mut buf[..block])?;
                    self.slots[slot].drained = true;
                    self.rearm_after_drain(port, slot, block)?;
                    self.transition(ReadState::Busy);
                    return Ok(Progress::Done(block));
                }
                ReadState::Unknown => {
                    let value = match status.take() {
                        Some(value) => value,
                        None => port.read_register(self.config.status_register)?,
                    };
                    self.observe_inbound(value);
                    let next = if self.slots.iter().any(BlockSlot::is_full) {
                        ReadState::Finished
                    } else if self.slots.iter().any(|slot| slot.state == SlotState::Busy) {
                        ReadState::Busy
                    } else {
                        ReadState::Idle
                    };
                    self.transition(next);
                }
            }
        }
    }

    fn observe_inbound(&mut self, status: u32) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.observe(self.bits.inbound(status, i));
        }
    }

    fn rearm_after_drain<P: DevicePort + ?Sized>(&mut self, port: &mut P, slot: usize, block: usize) -> Result<(), Error> {
        let other = 1 - slot;
        let other_free = self.slots[other].is_available();
        match self.config.strategy {
            Strategy::Immediate => {
                self.arm(port, slot, block)?;
                if other_free {
                    self.arm(port, other, block)?;
                }
            }
            Strategy::Cadence if other_free => {
                self.arm(port, other, block)?;
                self.arm(port, slot, block)?;
            }
            Strategy::SingleBuffer if other_free => self.arm(port, other, block)?,
            _ => {}
        }
        Ok(())
    }

    /// Streams `data` out one block at a time.
    ///
    /// Returns the bytes handed to the hardware. When no block frees up in
    /// time that count may be short, or `NotReady` if nothing moved at all.
    pub fn write<P: DevicePort + ?Sized>(&mut self, port: &mut P, data: &[u8]) -> Result<Progress, Error> {
        let block = self.check(Direction::Out)?;
        if data.len() % WORD_SIZE != 0 {
            return Err(FrameError::Unaligned { len: data.len() }.into());
        }
        let mut pos = 0;
        let mut expired = false;
        while pos < data.len() {
            let status = port.read_register(self.config.status_register)?;
            for (i, slot) in self.slots.iter_mut().enumerate() {
                slot.observe(self.bits.outbound(status, i));
            }
            let slot = if self.bits.any_empty(status) {
                self.pick_write_slot()
            } else {
                None
            };
            match slot {
                Some(slot) => {
                    let piece = &data[pos..data.len().min(pos + block)];
                    port.write_memory(self.config.base[slot], piece)?;
                    self.arm(port, slot, piece.len())?;
                    self.next_write = 1 - slot;
                    pos += piece.len();
                }
                None if !self.config.blocking || expired => {
                    return Ok(if pos > 0 { Progress::Done(pos) } else { Progress::NotReady });
                }
                None => expired = self.wait(port)? == 0,
            }
        }
        Ok(Progress::Done(pos))
    }

    fn pick_write_slot(&self) -> Option<usize> {
        let free = [self.slots[0].is_available(), self.slots[1].is_available()];
        let preferred = self.next_write;
        match self.config.strategy {
            Strategy::Immediate if free[preferred] => Some(preferred),
            Strategy::Immediate if free[1 - preferred] => Some(1 - preferred),
            Strategy::Cadence if free[preferred] => Some(preferred),
            Strategy::SingleBuffer if free[0] && free[1] => Some(preferred),
            _ => None,
        }
    }
}
