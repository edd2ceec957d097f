use crate::{Direction, SessionId, TransferStatus};

/// Default number of transfers that may be in flight at once.
pub const DEFAULT_TRANSFERS: usize = 256;

/// Handle of one pooled transfer, passed to the transport and back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotId(u32);

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        SlotId(id)
    }
}

impl From<SlotId> for usize {
    fn from(id: SlotId) -> Self {
        id.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    Pending,
    /// Done, data held in the slot until consumed in order.
    Completed,
    Failed(TransferStatus),
    Cancelled,
    TimedOut,
}

/// Bookkeeping of a lent slot.
#[derive(Clone, Copy, Debug)]
pub struct Transfer {
    pub direction: Direction,
    pub session: SessionId,
    /// Submission order within the session.
    pub seq: u32,
    pub requested: usize,
    pub transferred: usize,
    pub state: TransferState,
}

impl Transfer {
    pub fn new(direction: Direction, session: SessionId, seq: u32, requested: usize) -> Self {
        Self {
            direction,
            session,
            seq,
            requested,
            transferred: 0,
            state: TransferState::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolExhausted;

struct Slot {
    /// `None` while the transport holds it.
    buffer: Option<Vec<u8>>,
    transfer: Option<Transfer>,
}

/// Fixed arena of transfer slots with preallocated buffers.
///
/// A slot is lent with `acquire` and comes back with `release`; both are O(1).
/// Nothing grows after construction.
pub struct TransferPool<const N: usize> {
    slots: heapless::Vec<Slot, N>,
    free: heapless::Vec<SlotId, N>,
    chunk_size: usize,
}

impl<const N: usize> TransferPool<N> {
    pub fn new(chunk_size: usize) -> Self {
        let mut slots = heapless::Vec::new();
        let mut free = heapless::Vec::new();
        for i in 0..N {
            let _ = slots.push(Slot {
                buffer: Some(vec![0; chunk_size]),
                transfer: None,
            });
            // lowest ids come out first
            let _ = free.push(SlotId((N - 1 - i) as u32));
        }
        Self { slots, free, chunk_size }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Slots ready to be lent.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        N - self.free.len()
    }

    pub fn acquire(&mut self, transfer: Transfer) -> Result<SlotId, PoolExhausted> {
        let id = self.free.pop().ok_or(PoolExhausted)?;
        if let Some(slot) = self.slots.get_mut(usize::from(id)) {
            slot.transfer = Some(transfer);
        }
        Ok(id)
    }

    /// Returns a slot to the free list. Releasing a slot that is not lent does nothing.
    pub fn release(&mut self, id: SlotId) {
        let Some(slot) = self.slots.get_mut(usize::from(id)) else {
            warn!("release of unknown slot {:?}", id);
            return;
        };
        if slot.transfer.take().is_none() {
            warn!("double release of slot {:?}", id);
            return;
        }
        if slot.buffer.is_none() {
            slot.buffer = Some(vec![0; self.chunk_size]);
        }
        let _ = self.free.push(id);
    }

    /// Lends the slot's buffer to the transport.
    pub fn take_buffer(&mut self, id: SlotId) -> Option<Vec<u8>> {
        self.slots.get_mut(usize::from(id)).and_then(|slot| slot.buffer.take())
    }

    /// Puts a buffer back into its slot, regrown to chunk size if the transport shrank it.
    pub fn restore_buffer(&mut self, id: SlotId, mut buffer: Vec<u8>) {
        if buffer.len() < self.chunk_size {
            buffer.resize(self.chunk_size, 0);
        }
        if let Some(slot) = self.slots.get_mut(usize::from(id)) {
            slot.buffer = Some(buffer);
        }
    }

    pub fn buffer(&self, id: SlotId) -> Option<&[u8]> {
        self.slots.get(usize::from(id)).and_then(|slot| slot.buffer.as_deref())
    }

    pub fn transfer(&self, id: SlotId) -> Option<&Transfer> {
        self.slots.get(usize::from(id)).and_then(|slot| slot.transfer.as_ref())
    }

    pub fn transfer_mut(&mut self, id: SlotId) -> Option<&mut Transfer> {
        self.slots.get_mut(usize::from(id)).and_then(|slot| slot.transfer.as_mut())
    }

    /// Every lent slot matching `filter`.
    pub fn lent<F>(&self, filter: F) -> heapless::Vec<SlotId, N>
    where
        F: Fn(&Transfer) -> bool,
    {
        let mut ids = heapless::Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(transfer) = &slot.transfer {
                if filter(transfer) {
                    let _ = ids.push(SlotId(i as u32));
                }
            }
        }
        ids
    }

    /// First lent slot matching `filter`.
    pub fn find<F>(&self, filter: F) -> Option<SlotId>
    where
        F: Fn(&Transfer) -> bool,
    {
        self.slots
            .iter()
            .position(|slot| slot.transfer.as_ref().map_or(false, &filter))
            .map(|i| SlotId(i as u32))
    }
}
