use std::time::Duration;

use crate::{Direction, SlotId};

/// Vendor and product of the Dionysus board's FT2232H.
pub const DEFAULT_VENDOR_ID: u16 = 0x0403;
pub const DEFAULT_PRODUCT_ID: u16 = 0x8530;

/// Final state of one bulk transfer as reported by the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No device with the requested vendor/product pair.
    NotFound,
    /// Device present but claimed elsewhere.
    Busy,
    Io(&'static str),
    NoDevice,
    Unsupported,
}

/// Hardware flow control, values as the bridge expects them in its request index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum FlowControl {
    Disabled = 0x0000,
    RtsCts = 0x0100,
    DtrDsr = 0x0200,
    XonXoff = 0x0400,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Size of every pooled transfer buffer, also the bridge's read/write chunk size.
    pub chunk_size: usize,
    pub latency_ms: u8,
    pub flow_control: FlowControl,
    /// Default deadline of one logical read or write.
    pub timeout: Duration,
    /// Time spent collecting cancelled transfers after a deadline passes.
    pub cancel_grace: Duration,
    /// Longest single wait on the transport's completion queue.
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            chunk_size: 4096,
            latency_ms: 2,
            flow_control: FlowControl::RtsCts,
            timeout: Duration::from_millis(1000),
            cancel_grace: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// One bulk transfer handed to the transport.
///
/// For `Out` the first `length` bytes of `buffer` are sent. For `In` at most
/// `length` bytes are received into the start of `buffer`.
#[derive(Debug)]
pub struct Request {
    pub direction: Direction,
    pub buffer: Vec<u8>,
    pub length: usize,
}

/// A finished transfer, buffer ownership returns with it.
#[derive(Debug)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

/// A request the transport refused to queue.
#[derive(Debug)]
pub struct Rejected {
    pub error: TransportError,
    pub buffer: Vec<u8>,
}

/// Asynchronous bulk transfer primitive under the link.
///
/// Nothing progresses on its own: completions are only collected through
/// `poll_completion`, from the same thread that submits.
pub trait Transport {
    /// Find and claim the bridge.
    fn connect(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError>;

    /// Put the bridge into streaming mode: chunk sizes, latency timer, flow control.
    fn configure(&mut self, config: &LinkConfig) -> Result<(), TransportError>;

    /// Drop anything buffered in the bridge in either direction.
    fn purge(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Largest packet of the bulk endpoints.
    /// Every inbound packet of this size starts with its own modem status.
    fn max_packet_size(&self) -> usize;

    /// Queue a transfer tagged with `slot`. Does not block.
    fn submit(&mut self, slot: SlotId, request: Request) -> Result<(), Rejected>;

    /// Ask for a queued transfer to end early. Its completion still comes
    /// through `poll_completion`, usually as `Cancelled`.
    fn cancel(&mut self, slot: SlotId);

    /// Wait up to `timeout` for the next finished transfer.
    fn poll_completion(&mut self, timeout: Duration) -> Option<Completion>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flow_control_repr() {
        assert_eq!(FlowControl::from_repr(0x0100), Some(FlowControl::RtsCts));
        assert_eq!(FlowControl::from_repr(0x0300), None);
    }

    #[test]
    fn default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.vendor_id, 0x0403);
        assert_eq!(config.product_id, 0x8530);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.flow_control, FlowControl::RtsCts);
        assert!(config.poll_interval < config.timeout);
    }
}
