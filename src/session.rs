use std::time::{Duration, Instant};

use crate::{Reassembler, TransferStatus, TransportError};

/// Tags every transfer lent during one logical read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionId(u32);

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        SessionId(id)
    }
}

impl SessionId {
    pub fn next(self) -> Self {
        SessionId(self.0.wrapping_add(1))
    }
}

/// First failure recorded by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    Transfer(TransferStatus),
    Submit(TransportError),
    /// Response marker byte was wrong.
    Desync(u8),
}

/// State of one logical call, owned by that call.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    started: Instant,
    timeout: Duration,
    outstanding: usize,
    error: Option<SessionError>,
    timed_out: bool,
    finished: bool,
}

impl Session {
    pub fn new(id: SessionId, timeout: Duration) -> Self {
        Self {
            id,
            started: Instant::now(),
            timeout,
            outstanding: 0,
            error: None,
            timed_out: false,
            finished: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// A transfer was lent for this session.
    pub fn lend(&mut self) {
        self.outstanding += 1;
    }

    /// A transfer of this session came back to the pool.
    pub fn recover(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Keeps the first error, later ones are consequences.
    pub fn fail(&mut self, error: SessionError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn error(&self) -> Option<SessionError> {
        self.error
    }

    pub fn time_out(&mut self) {
        self.timed_out = true;
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// All wanted bytes moved, leftovers are cancelled.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Whether more transfers may be submitted.
    pub fn accepting(&self) -> bool {
        !self.finished && !self.timed_out && self.error.is_none()
    }
}

/// Outbound stream: the header first, then the payload in order.
#[derive(Debug)]
pub struct WriteStream<'a> {
    header: &'a [u8],
    payload: &'a [u8],
    /// Offset of the next byte to submit.
    submitted: usize,
    /// Bytes the transport reported sent.
    accepted: usize,
}

impl<'a> WriteStream<'a> {
    pub fn new(header: &'a [u8], payload: &'a [u8]) -> Self {
        Self {
            header,
            payload,
            submitted: 0,
            accepted: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    /// Next chunk of at most `max` bytes. The header never shares a chunk with payload.
    pub fn next_chunk(&mut self, max: usize) -> Option<&'a [u8]> {
        let chunk = if self.submitted < self.header.len() {
            let end = self.header.len().min(self.submitted + max);
            &self.header[self.submitted..end]
        } else {
            let offset = self.submitted - self.header.len();
            let end = self.payload.len().min(offset + max);
            &self.payload[offset..end]
        };
        if chunk.is_empty() {
            return None;
        }
        self.submitted += chunk.len();
        Some(chunk)
    }

    pub fn has_more(&self) -> bool {
        self.submitted < self.total()
    }

    pub fn accept(&mut self, len: usize) {
        self.accepted += len;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

/// Inbound stream: reassembles transfers strictly in submission order.
#[derive(Debug)]
pub struct ReadStream<'a> {
    dest: &'a mut [u8],
    assembler: Reassembler,
    /// Sequence number of the next transfer to submit.
    next_seq: u32,
    /// Sequence number of the next transfer to consume.
    consume_seq: u32,
    /// Data bytes the transfers still in flight could bring.
    inflight: usize,
    /// Data bytes one transfer can bring.
    per_transfer: usize,
}

impl<'a> ReadStream<'a> {
    pub fn new(header_len: usize, dest: &'a mut [u8], per_transfer: usize, packet_size: usize) -> Self {
        let payload_len = dest.len();
        Self {
            dest,
            assembler: Reassembler::new(header_len, payload_len, packet_size),
            next_seq: 0,
            consume_seq: 0,
            inflight: 0,
            per_transfer: per_transfer.max(1),
        }
    }

    /// Whether another transfer is needed to cover what is still missing.
    pub fn wants_more(&self) -> bool {
        self.assembler.remaining() > self.inflight
    }

    /// Registers a submitted transfer, returns its sequence number.
    pub fn submitted(&mut self) -> u32 {
        self.inflight += self.per_transfer;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// A transfer left flight without its data being used.
    pub fn dropped(&mut self) {
        self.inflight = self.inflight.saturating_sub(self.per_transfer);
    }

    pub fn consume_seq(&self) -> u32 {
        self.consume_seq
    }

    /// Feeds the transfer with the next sequence number.
    pub fn consume(&mut self, data: &[u8]) -> crate::Feed {
        self.consume_seq = self.consume_seq.wrapping_add(1);
        self.dropped();
        self.assembler.feed(data, &mut self.dest[..])
    }

    pub fn assembler(&self) -> &Reassembler {
        &self.assembler
    }
}
