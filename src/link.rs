//! The transfer engine.
//!
//! A logical read or write is split into bulk transfers drawn from the pool
//! and kept in flight together. The calling thread then pumps the transport's
//! completion queue until every transfer it lent is back, the deadline passes
//! or a transfer fails. Completions may come back in any order; inbound data
//! is parked in its slot until all earlier transfers have been consumed.

use std::time::{Duration, Instant};

use crate::{
    decode_response, Completion, Direction, Feed, FrameError, LinkConfig, ModemStatus, ReadStream, Request, Response,
    Session, SessionError, SessionId, SlotId, Transfer, TransferPool, TransferState, TransferStatus, Transport,
    TransportError, WriteStream, DEFAULT_TRANSFERS, MODEM_PREFIX_LEN, RESPONSE_HEADER_LEN, RESPONSE_ID,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenError {
    DeviceNotFound,
    AlreadyOpen,
    TransportConfigFailed(TransportError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    NotOpen,
    /// No free transfer slot to start with.
    PoolExhausted,
    Timeout { transferred: usize },
    Failed { status: TransferStatus, transferred: usize },
    Cancelled { transferred: usize },
    /// The response did not start with the response marker.
    Desync { found: u8 },
    Submit(TransportError),
    /// Asked for more header than a response carries.
    HeaderTooLong { len: usize },
    Frame(FrameError),
}

impl From<FrameError> for LinkError {
    fn from(v: FrameError) -> Self {
        Self::Frame(v)
    }
}

/// Outcome of a completed read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Received {
    /// Payload bytes written to the destination.
    pub len: usize,
    /// Decoded header, when a full response header was asked for.
    pub header: Option<Response>,
}

enum Event {
    Completion(Completion),
    Idle,
    /// Deadline and cancellation grace both passed.
    Abandoned,
}

/// A settled completion belonging to the running session.
struct Done {
    slot: SlotId,
    status: TransferStatus,
}

pub struct Link<T: Transport, const N: usize = DEFAULT_TRANSFERS> {
    transport: T,
    config: LinkConfig,
    pool: TransferPool<N>,
    open: bool,
    session: SessionId,
    modem: Option<ModemStatus>,
}

impl<T: Transport, const N: usize> Link<T, N> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self {
            pool: TransferPool::new(config.chunk_size),
            transport,
            config,
            open: false,
            session: SessionId::from(0),
            modem: None,
        }
    }

    pub fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<(), OpenError> {
        if self.open {
            return Err(OpenError::AlreadyOpen);
        }
        self.transport.connect(vendor_id, product_id).map_err(|err| match err {
            TransportError::NotFound | TransportError::NoDevice => OpenError::DeviceNotFound,
            other => OpenError::TransportConfigFailed(other),
        })?;
        debug!("bridge {:04x}:{:04x} claimed", vendor_id, product_id);

        let configured = self.transport.configure(&self.config).and_then(|_| self.transport.purge());
        if let Err(err) = configured {
            warn!("bridge configuration failed: {:?}", err);
            self.transport.disconnect();
            return Err(OpenError::TransportConfigFailed(err));
        }
        self.open = true;
        info!("link open, {} transfers of {} bytes", N, self.config.chunk_size);
        Ok(())
    }

    /// Cancels whatever is in flight, collects it for a grace period and lets go of the bridge.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.cancel_all();
        let leaked = self.drain(self.config.cancel_grace);
        if leaked > 0 {
            warn!("{} transfers still in flight at close", leaked);
        }
        self.transport.disconnect();
        self.open = false;
        info!("link closed");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Free slots in the transfer pool.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Last modem status received from the bridge.
    pub fn modem_status(&self) -> Option<ModemStatus> {
        self.modem
    }

    /// Asks the transport to cancel every lent transfer. Does not wait.
    pub fn cancel_all(&mut self) {
        let pending = self.pool.lent(|t| t.state == TransferState::Pending);
        if !pending.is_empty() {
            debug!("cancelling {} transfers", pending.len());
        }
        for slot in pending {
            self.transport.cancel(slot);
        }
    }

    /// Collects completions until the pool is whole again or `grace` elapses.
    /// Returns the number of transfers still out.
    pub fn drain(&mut self, grace: Duration) -> usize {
        // parked data from abandoned sessions
        for slot in self.pool.lent(|t| t.state != TransferState::Pending) {
            self.pool.release(slot);
        }
        let until = Instant::now() + grace;
        while self.pool.in_use() > 0 {
            let now = Instant::now();
            if now >= until {
                break;
            }
            let wait = (until - now).min(self.config.poll_interval);
            if let Some(completion) = self.transport.poll_completion(wait) {
                trace!("slot {:?}: drained as {:?}", completion.slot, completion.status);
                self.pool.restore_buffer(completion.slot, completion.buffer);
                self.pool.release(completion.slot);
            }
        }
        self.pool.in_use()
    }

    /// Resynchronizes after a desync: drops everything in flight and buffered in the bridge.
    pub fn flush(&mut self) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        self.cancel_all();
        self.drain(self.config.cancel_grace);
        self.transport.purge().map_err(LinkError::Submit)?;
        info!("link flushed");
        Ok(())
    }

    /// Sends `header` then `payload`. Returns the bytes the transport accepted.
    pub fn submit_write(&mut self, header: &[u8], payload: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        let mut stream = WriteStream::new(header, payload);
        if stream.total() == 0 {
            return Ok(0);
        }
        if self.pool.available() == 0 {
            return Err(LinkError::PoolExhausted);
        }
        let max = self.transfer_size();
        let mut session = self.begin(timeout);
        debug!("session {:?}: write {} bytes", session.id(), stream.total());

        self.fill_write(&mut session, &mut stream, max);
        while session.outstanding() > 0 {
            match self.next_event(&mut session) {
                Event::Completion(completion) => self.on_write(&mut session, &mut stream, max, completion),
                Event::Idle => {}
                Event::Abandoned => break,
            }
        }
        self.end(&session);

        let sent = stream.accepted();
        Self::outcome(&session, !stream.has_more(), sent)?;
        Ok(sent)
    }

    /// Reads a response of `header_len` header bytes followed by `dest.len()` payload bytes.
    pub fn submit_read(&mut self, header_len: usize, dest: &mut [u8], timeout: Duration) -> Result<Received, LinkError> {
        if !self.open {
            return Err(LinkError::NotOpen);
        }
        if header_len > RESPONSE_HEADER_LEN {
            return Err(LinkError::HeaderTooLong { len: header_len });
        }
        if header_len == 0 && dest.is_empty() {
            return Ok(Received { len: 0, header: None });
        }
        if self.pool.available() == 0 {
            return Err(LinkError::PoolExhausted);
        }
        let packet = self.transport.max_packet_size();
        let length = self.read_size(packet);
        let per_transfer = Self::data_capacity(length, packet);
        let mut session = self.begin(timeout);
        debug!("session {:?}: read {} + {} bytes", session.id(), header_len, dest.len());

        let mut stream = ReadStream::new(header_len, dest, per_transfer, packet);
        self.fill_read(&mut session, &mut stream, length);
        while session.outstanding() > 0 {
            match self.next_event(&mut session) {
                Event::Completion(completion) => self.on_read(&mut session, &mut stream, length, completion),
                Event::Idle => {}
                Event::Abandoned => break,
            }
        }
        self.end(&session);

        let assembler = stream.assembler();
        if let Some(status) = assembler.modem_status() {
            if status.has_line_error() {
                warn!("bridge reports line errors, modem status {:04x}", status.bits());
            }
            self.modem = Some(status);
        }
        Self::outcome(&session, assembler.is_complete(), assembler.received())?;

        let header = match assembler.header() {
            Some(bytes) if header_len == RESPONSE_HEADER_LEN => Some(decode_response(bytes)?),
            _ => None,
        };
        Ok(Received {
            len: assembler.payload_filled(),
            header,
        })
    }

    fn begin(&mut self, timeout: Duration) -> Session {
        self.session = self.session.next();
        Session::new(self.session, timeout)
    }

    fn end(&self, session: &Session) {
        debug!(
            "session {:?}: done in {:?}, error {:?}, timed out {}",
            session.id(),
            session.elapsed(),
            session.error(),
            session.timed_out()
        );
        if session.outstanding() > 0 {
            warn!("session {:?}: {} transfers never came back", session.id(), session.outstanding());
        }
    }

    fn outcome(session: &Session, complete: bool, transferred: usize) -> Result<(), LinkError> {
        match session.error() {
            Some(SessionError::Transfer(TransferStatus::Cancelled)) => Err(LinkError::Cancelled { transferred }),
            Some(SessionError::Transfer(status)) => Err(LinkError::Failed { status, transferred }),
            Some(SessionError::Submit(err)) => Err(LinkError::Submit(err)),
            Some(SessionError::Desync(found)) => Err(LinkError::Desync { found }),
            None if complete => Ok(()),
            None if session.timed_out() => Err(LinkError::Timeout { transferred }),
            // slots held by earlier sessions ran the pool dry
            None => Err(LinkError::PoolExhausted),
        }
    }

    /// Largest outbound transfer.
    fn transfer_size(&self) -> usize {
        self.transport.max_packet_size().min(self.config.chunk_size).max(1)
    }

    /// Inbound transfers span whole packets, as many as fit a pool buffer.
    fn read_size(&self, packet: usize) -> usize {
        let packet = packet.max(MODEM_PREFIX_LEN + 1);
        if self.config.chunk_size < packet {
            return self.config.chunk_size;
        }
        self.config.chunk_size / packet * packet
    }

    /// Data bytes an inbound transfer of `length` can bring, every packet losing its status prefix.
    fn data_capacity(length: usize, packet: usize) -> usize {
        let packet = packet.max(MODEM_PREFIX_LEN + 1);
        let whole = length / packet * (packet - MODEM_PREFIX_LEN);
        whole + (length % packet).saturating_sub(MODEM_PREFIX_LEN)
    }

    fn lend(
        &mut self, session: &mut Session, direction: Direction, seq: u32, data: Option<&[u8]>, length: usize,
    ) -> Result<(), TransportError> {
        let transfer = Transfer::new(direction, session.id(), seq, length);
        let Ok(slot) = self.pool.acquire(transfer) else {
            return Err(TransportError::Busy);
        };
        match self.dispatch(slot, direction, data, length) {
            Ok(()) => {
                session.lend();
                Ok(())
            }
            Err(err) => {
                self.pool.release(slot);
                Err(err)
            }
        }
    }

    /// Hands the slot's buffer to the transport.
    fn dispatch(&mut self, slot: SlotId, direction: Direction, data: Option<&[u8]>, length: usize) -> Result<(), TransportError> {
        let Some(mut buffer) = self.pool.take_buffer(slot) else {
            return Err(TransportError::Io("slot buffer already lent"));
        };
        if let Some(data) = data {
            buffer[..data.len()].copy_from_slice(data);
        }
        trace!("slot {:?}: submit {:?} {} bytes", slot, direction, length);
        match self.transport.submit(slot, Request { direction, buffer, length }) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.pool.restore_buffer(slot, rejected.buffer);
                Err(rejected.error)
            }
        }
    }

    /// Gives back the session's transfers that already came home, parked data included.
    fn release_settled(&mut self, session: &mut Session) {
        let id = session.id();
        for slot in self.pool.lent(|t| t.session == id && t.state != TransferState::Pending) {
            trace!("slot {:?}: released unread", slot);
            self.give_back(session, slot);
        }
    }

    fn cancel_session(&mut self, id: SessionId) {
        for slot in self.pool.lent(|t| t.session == id && t.state == TransferState::Pending) {
            self.transport.cancel(slot);
        }
    }

    fn declare_timeout(&mut self, session: &mut Session) {
        session.time_out();
        warn!(
            "session {:?}: timed out after {:?}, cancelling {} transfers",
            session.id(),
            session.elapsed(),
            session.outstanding()
        );
        self.release_settled(session);
        self.cancel_session(session.id());
    }

    fn next_event(&mut self, session: &mut Session) -> Event {
        let now = Instant::now();
        if !session.timed_out() && session.expired(now) {
            self.declare_timeout(session);
        }
        let until = if session.timed_out() {
            session.deadline() + self.config.cancel_grace
        } else {
            session.deadline()
        };
        if session.timed_out() && now >= until {
            return Event::Abandoned;
        }
        let wait = until.saturating_duration_since(now).min(self.config.poll_interval);
        match self.transport.poll_completion(wait) {
            Some(completion) => Event::Completion(completion),
            None => Event::Idle,
        }
    }

    /// Takes the buffer back and filters out what the running session must not see.
    fn settle(&mut self, session: &mut Session, completion: Completion) -> Option<Done> {
        let Completion {
            slot,
            status,
            buffer,
            actual_length,
        } = completion;
        trace!("slot {:?}: {:?}, {} bytes", slot, status, actual_length);
        self.pool.restore_buffer(slot, buffer);

        let Some(transfer) = self.pool.transfer_mut(slot) else {
            warn!("completion for idle slot {:?}", slot);
            return None;
        };
        if transfer.session != session.id() {
            warn!(
                "late {:?} completion of slot {:?} from session {:?}",
                transfer.direction, slot, transfer.session
            );
            self.pool.release(slot);
            return None;
        }
        transfer.transferred = actual_length.min(transfer.requested);
        transfer.state = match status {
            TransferStatus::Completed => TransferState::Completed,
            TransferStatus::Cancelled => TransferState::Cancelled,
            TransferStatus::TimedOut => TransferState::TimedOut,
            other => TransferState::Failed(other),
        };

        // deadline is checked on every completion, not only in the pump
        if !session.finished() && (session.timed_out() || session.expired(Instant::now())) {
            if let Some(transfer) = self.pool.transfer_mut(slot) {
                transfer.state = TransferState::TimedOut;
            }
            self.give_back(session, slot);
            if !session.timed_out() {
                self.declare_timeout(session);
            }
            return None;
        }
        Some(Done { slot, status })
    }

    fn give_back(&mut self, session: &mut Session, slot: SlotId) {
        self.pool.release(slot);
        session.recover();
    }

    fn fail(&mut self, session: &mut Session, error: SessionError) {
        if session.accepting() {
            warn!("session {:?}: {:?}", session.id(), error);
        }
        session.fail(error);
        self.release_settled(session);
        self.cancel_session(session.id());
    }

    fn fill_write(&mut self, session: &mut Session, stream: &mut WriteStream<'_>, max: usize) {
        while session.accepting() && stream.has_more() && self.pool.available() > 0 {
            let Some(chunk) = stream.next_chunk(max) else {
                break;
            };
            if let Err(err) = self.lend(session, Direction::Out, 0, Some(chunk), chunk.len()) {
                self.fail(session, SessionError::Submit(err));
            }
        }
    }

    fn on_write(&mut self, session: &mut Session, stream: &mut WriteStream<'_>, max: usize, completion: Completion) {
        let Some(done) = self.settle(session, completion) else {
            return;
        };
        if done.status != TransferStatus::Completed {
            self.give_back(session, done.slot);
            self.fail(session, SessionError::Transfer(done.status));
            return;
        }
        let sent = self.pool.transfer(done.slot).map_or(0, |t| t.transferred);
        stream.accept(sent);

        // the slot goes straight back out with the next chunk
        if session.accepting() {
            if let Some(chunk) = stream.next_chunk(max) {
                if let Some(transfer) = self.pool.transfer_mut(done.slot) {
                    transfer.requested = chunk.len();
                    transfer.transferred = 0;
                    transfer.state = TransferState::Pending;
                }
                if let Err(err) = self.dispatch(done.slot, Direction::Out, Some(chunk), chunk.len()) {
                    self.give_back(session, done.slot);
                    self.fail(session, SessionError::Submit(err));
                }
                return;
            }
        }
        self.give_back(session, done.slot);
        self.fill_write(session, stream, max);
    }

    fn fill_read(&mut self, session: &mut Session, stream: &mut ReadStream<'_>, length: usize) {
        while session.accepting() && stream.wants_more() && self.pool.available() > 0 {
            let seq = stream.submitted();
            if let Err(err) = self.lend(session, Direction::In, seq, None, length) {
                stream.dropped();
                self.fail(session, SessionError::Submit(err));
            }
        }
    }

    fn on_read(&mut self, session: &mut Session, stream: &mut ReadStream<'_>, length: usize, completion: Completion) {
        let Some(done) = self.settle(session, completion) else {
            return;
        };
        if done.status != TransferStatus::Completed {
            self.give_back(session, done.slot);
            stream.dropped();
            if !session.finished() {
                self.fail(session, SessionError::Transfer(done.status));
            }
            return;
        }
        if !session.accepting() {
            self.give_back(session, done.slot);
            stream.dropped();
            return;
        }

        self.consume_in_order(session, stream);
        if stream.assembler().is_complete() {
            session.finish();
            self.release_settled(session);
            self.cancel_session(session.id());
        } else {
            self.fill_read(session, stream, length);
        }
    }

    /// Feeds parked transfers to the reassembler for as long as the next one in sequence is there.
    fn consume_in_order(&mut self, session: &mut Session, stream: &mut ReadStream<'_>) {
        let id = session.id();
        loop {
            let seq = stream.consume_seq();
            let Some(slot) = self
                .pool
                .find(|t| t.session == id && t.state == TransferState::Completed && t.seq == seq)
            else {
                break;
            };
            let len = self.pool.transfer(slot).map_or(0, |t| t.transferred);
            let fed = match self.pool.buffer(slot) {
                Some(buffer) => stream.consume(&buffer[..len.min(buffer.len())]),
                None => stream.consume(&[]),
            };
            match fed {
                Feed::Noise => trace!("slot {:?}: status only", slot),
                Feed::Consumed { excess, .. } if excess > 0 => {
                    warn!("slot {:?}: {} bytes past the end of the response", slot, excess)
                }
                Feed::Consumed { .. } => {}
            }
            self.give_back(session, slot);

            if let Some(&found) = stream.assembler().header().and_then(|h| h.first()) {
                if found != RESPONSE_ID {
                    error!("link desync: response starts with {:02x}", found);
                    self.fail(session, SessionError::Desync(found));
                    return;
                }
            }
            if stream.assembler().is_complete() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockTransport;
    use crate::{Command, Target, COMMAND_HEADER_LEN};

    fn config(chunk_size: usize) -> LinkConfig {
        LinkConfig {
            chunk_size,
            timeout: Duration::from_millis(200),
            cancel_grace: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            ..LinkConfig::default()
        }
    }

    fn open<const N: usize>(transport: MockTransport, chunk_size: usize) -> Link<MockTransport, N> {
        let mut link = Link::new(transport, config(chunk_size));
        link.open(0x0403, 0x8530).unwrap();
        link
    }

    fn short() -> Duration {
        Duration::from_millis(30)
    }

    /// Response header followed by `payload`.
    fn response(command: &Command, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Response::answering(command).encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn open_twice() {
        let mut link: Link<_, 4> = open(MockTransport::scripted(), 64);
        assert_eq!(link.open(0x0403, 0x8530), Err(OpenError::AlreadyOpen));
        assert_eq!(link.transport().purges, 1);
        assert_eq!(link.transport().configured.as_ref().map(|c| c.latency_ms), Some(2));
    }

    #[test]
    fn open_missing_device() {
        let mut transport = MockTransport::scripted();
        transport.present = false;
        let mut link: Link<_, 4> = Link::new(transport, config(64));
        assert_eq!(link.open(0x0403, 0x8530), Err(OpenError::DeviceNotFound));
        assert!(!link.is_open());
    }

    #[test]
    fn open_configure_failure_disconnects() {
        let mut transport = MockTransport::scripted();
        transport.fail_configure = Some(TransportError::Io("latency"));
        let mut link: Link<_, 4> = Link::new(transport, config(64));
        assert_eq!(
            link.open(0x0403, 0x8530),
            Err(OpenError::TransportConfigFailed(TransportError::Io("latency")))
        );
        assert!(!link.transport().connected);
        assert!(!link.is_open());
    }

    #[test]
    fn closed_link_refuses_io() {
        let mut link: Link<_, 4> = Link::new(MockTransport::scripted(), config(64));
        assert_eq!(link.submit_write(&[1], &[], short()), Err(LinkError::NotOpen));
        let mut buf = [0; 4];
        assert_eq!(link.submit_read(0, &mut buf, short()).map(|r| r.len), Err(LinkError::NotOpen));
        link.close();
    }

    #[test]
    fn close_is_idempotent() {
        let mut link: Link<_, 4> = open(MockTransport::scripted(), 64);
        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(!link.transport().connected);
    }

    #[test]
    fn write_is_chunked_in_order() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 16;
        let mut link: Link<_, 4> = open(transport, 64);
        let header = Command::write(Target::Memory(0), 40).unwrap().encode();
        let payload: Vec<u8> = (0..40).collect();

        assert_eq!(link.submit_write(&header, &payload, short()), Ok(53));
        let transport = link.transport();
        assert_eq!(transport.written[..COMMAND_HEADER_LEN], header);
        assert_eq!(transport.written[COMMAND_HEADER_LEN..], payload[..]);
        assert_eq!(transport.out_lengths, [13, 16, 16, 8]);
        assert_eq!(link.available(), 4);
    }

    #[test]
    fn write_reuses_slots_when_pool_is_small() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        let mut link: Link<_, 2> = open(transport, 64);
        let payload = [0xAB; 100];
        assert_eq!(link.submit_write(&[], &payload, short()), Ok(100));
        assert_eq!(link.transport().written, payload);
        assert_eq!(link.available(), 2);
    }

    #[test]
    fn write_failure_reports_progress() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        transport.fail_after = Some((2, TransferStatus::Stall));
        let mut link: Link<_, 1> = open(transport, 64);
        let payload = [0; 32];
        assert_eq!(
            link.submit_write(&[], &payload, short()),
            Err(LinkError::Failed { status: TransferStatus::Stall, transferred: 16 })
        );
        assert_eq!(link.available(), 1);
    }

    #[test]
    fn read_reassembles_out_of_order_fragments() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        transport.noise = 1;
        transport.reverse = true;
        let command = Command::read(Target::Register { device: 1, address: 0 }, 64).unwrap();
        let payload: Vec<u8> = (0..64).collect();
        transport.respond(&response(&command, &payload));

        let mut link: Link<_, 16> = open(transport, 8);
        let mut dest = [0u8; 64];
        let received = link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()).unwrap();
        assert_eq!(received.len, 64);
        assert_eq!(received.header, Some(Response::answering(&command)));
        assert_eq!(dest[..], payload[..]);
        assert_eq!(link.available(), 16);
        assert!(link.modem_status().is_some());
    }

    #[test]
    fn read_timeout_reports_partial_progress() {
        let mut transport = MockTransport::scripted();
        let command = Command::read(Target::Memory(0), 8).unwrap();
        let bytes = response(&command, &[1, 2, 3, 4]);
        transport.respond(&bytes);

        let mut link: Link<_, 8> = open(transport, 64);
        let mut dest = [0u8; 8];
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()).map(|r| r.len),
            Err(LinkError::Timeout { transferred: RESPONSE_HEADER_LEN + 4 })
        );
        assert_eq!(link.available(), 8);
        assert!(link.transport().cancels > 0);
    }

    #[test]
    fn read_desync() {
        let mut transport = MockTransport::scripted();
        let mut bytes = Response::answering(&Command::ping()).encode();
        bytes[0] = 0x55;
        transport.respond(&bytes);
        let mut link: Link<_, 8> = open(transport, 64);
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut [], short()).map(|r| r.len),
            Err(LinkError::Desync { found: 0x55 })
        );
        assert_eq!(link.available(), 8);
    }

    #[test]
    fn read_failure_cancels_siblings() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        transport.fail_after = Some((0, TransferStatus::Error));
        let mut link: Link<_, 8> = open(transport, 8);
        let mut dest = [0u8; 32];
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()).map(|r| r.len),
            Err(LinkError::Failed { status: TransferStatus::Error, transferred: 0 })
        );
        assert_eq!(link.available(), 8);
    }

    #[test]
    fn desync_with_parked_transfers_returns_at_once() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        transport.reverse = true;
        let mut bytes = Response::answering(&Command::ping()).encode().to_vec();
        bytes[0] = 0x55;
        bytes.extend_from_slice(&[0; 8]);
        transport.respond(&bytes);

        let mut link: Link<_, 16> = open(transport, 8);
        let mut dest = [0u8; 8];
        let started = Instant::now();
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut dest, Duration::from_secs(2)).map(|r| r.len),
            Err(LinkError::Desync { found: 0x55 })
        );
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(link.available(), 16);
    }

    #[test]
    fn read_of_tiny_packets() {
        let mut transport = MockTransport::scripted();
        transport.fragment = 3;
        let command = Command::read(Target::Memory(0x40), 16).unwrap();
        let payload: Vec<u8> = (100..116).collect();
        transport.respond(&response(&command, &payload));

        let mut link: Link<_, 4> = open(transport, 64);
        let mut dest = [0u8; 16];
        let received = link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()).unwrap();
        assert_eq!(received.len, 16);
        assert_eq!(received.header, Some(Response::answering(&command)));
        assert_eq!(dest[..], payload[..]);
        assert_eq!(link.available(), 4);
    }

    #[test]
    fn refused_submission() {
        let mut transport = MockTransport::scripted();
        transport.refuse = Some(TransportError::Io("queue full"));
        let mut link: Link<_, 4> = open(transport, 64);
        assert_eq!(
            link.submit_write(&[0; 4], &[], short()),
            Err(LinkError::Submit(TransportError::Io("queue full")))
        );
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut [], short()).map(|r| r.len),
            Err(LinkError::Submit(TransportError::Io("queue full")))
        );
        assert_eq!(link.available(), 4);
    }

    #[test]
    fn read_cancelled_midway() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        // the second transfer is cancelled from elsewhere
        transport.fail_after = Some((1, TransferStatus::Cancelled));
        let command = Command::read(Target::Memory(0), 8).unwrap();
        transport.respond(&response(&command, &[7; 8]));

        let mut link: Link<_, 8> = open(transport, 8);
        let mut dest = [0u8; 8];
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()).map(|r| r.len),
            Err(LinkError::Cancelled { transferred: 6 })
        );
        assert_eq!(link.available(), 8);
    }

    #[test]
    fn write_cancelled_midway() {
        let mut transport = MockTransport::scripted();
        transport.packet_size = 8;
        transport.fail_after = Some((1, TransferStatus::Cancelled));
        let mut link: Link<_, 1> = open(transport, 64);
        assert_eq!(
            link.submit_write(&[], &[0; 32], short()),
            Err(LinkError::Cancelled { transferred: 8 })
        );
        assert_eq!(link.available(), 1);
    }

    #[test]
    fn completion_past_the_deadline_is_dropped() {
        let mut transport = MockTransport::scripted();
        transport.latency = Duration::from_millis(60);
        transport.respond(&Response::answering(&Command::ping()).encode());
        let mut link: Link<_, 4> = open(transport, 64);
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut [], short()).map(|r| r.len),
            Err(LinkError::Timeout { transferred: 0 })
        );
        assert_eq!(link.available(), 4);
    }

    #[test]
    fn header_longer_than_response() {
        let mut link: Link<_, 4> = open(MockTransport::scripted(), 64);
        assert_eq!(
            link.submit_read(RESPONSE_HEADER_LEN + 1, &mut [], short()).map(|r| r.len),
            Err(LinkError::HeaderTooLong { len: RESPONSE_HEADER_LEN + 1 })
        );
    }

    #[test]
    fn exhausted_pool_fails_fast() {
        let mut transport = MockTransport::scripted();
        transport.deaf = true;
        let mut link: Link<_, 2> = open(transport, 8);
        let mut dest = [0u8; 64];
        assert!(matches!(
            link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short()),
            Err(LinkError::Timeout { transferred: 0 })
        ));
        assert_eq!(link.available(), 0);

        let started = Instant::now();
        assert_eq!(link.submit_write(&[0; 4], &[], Duration::from_secs(5)), Err(LinkError::PoolExhausted));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_all_returns_every_transfer() {
        let mut transport = MockTransport::scripted();
        transport.deaf = true;
        let mut link: Link<_, 8> = open(transport, 8);
        let mut dest = [0u8; 64];
        let _ = link.submit_read(RESPONSE_HEADER_LEN, &mut dest, short());
        let outstanding = link.capacity() - link.available();
        assert!(outstanding > 0);

        link.transport_mut().deaf = false;
        let before = link.transport().cancels;
        link.cancel_all();
        assert_eq!(link.transport().cancels - before, outstanding);
        assert_eq!(link.drain(Duration::from_millis(100)), 0);
        assert_eq!(link.available(), link.capacity());
    }

    #[test]
    fn cancel_all_when_idle() {
        let mut link: Link<_, 4> = open(MockTransport::scripted(), 64);
        link.cancel_all();
        assert_eq!(link.transport().cancels, 0);
    }

    #[test]
    fn late_completions_are_recycled() {
        let mut transport = MockTransport::scripted();
        transport.deaf = true;
        let mut link: Link<_, 4> = open(transport, 64);
        let _ = link.submit_read(RESPONSE_HEADER_LEN, &mut [], short());
        assert!(link.available() < 4);

        // stale transfers come back cancelled while the next call runs
        let transport = link.transport_mut();
        transport.deaf = false;
        transport.cancel_pending();
        transport.respond(&Response::answering(&Command::ping()).encode());
        let received = link.submit_read(RESPONSE_HEADER_LEN, &mut [], short()).unwrap();
        assert_eq!(received.header.map(|h| h.status), Some(0xFF));
        assert_eq!(link.available(), 4);
    }

    #[test]
    fn flush_purges_bridge() {
        let mut link: Link<_, 4> = open(MockTransport::scripted(), 64);
        link.flush().unwrap();
        assert_eq!(link.transport().purges, 2);
    }
}
