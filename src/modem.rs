//! Modem status prefixed by the bridge chip to every inbound bulk packet.
//!
//! The two bytes are little-endian. The low nibble is reserved; bits 4..7
//! carry the modem lines and bits 8..15 the line status register.

/// Bytes of modem status at the head of each inbound packet.
pub const MODEM_PREFIX_LEN: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModemStatus(u16);

impl From<u16> for ModemStatus {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl ModemStatus {
    /// Decodes the prefix of one inbound packet, `None` if it is too short.
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        match packet {
            [lo, hi, ..] => Some(Self(u16::from_le_bytes([*lo, *hi]))),
            _ => None,
        }
    }

    /// Value in raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    fn bit(&self, pos: u8) -> bool {
        const MASK: u16 = 1;
        ((self.0 >> pos) & MASK) == 1
    }

    /// Clear to send.
    pub fn cts(&self) -> bool {
        self.bit(4)
    }

    /// Data set ready.
    pub fn dsr(&self) -> bool {
        self.bit(5)
    }

    /// Ring indicator.
    pub fn ri(&self) -> bool {
        self.bit(6)
    }

    /// Receive line signal detect.
    pub fn rlsd(&self) -> bool {
        self.bit(7)
    }

    /// Data ready.
    pub fn dr(&self) -> bool {
        self.bit(8)
    }

    /// Overrun error.
    pub fn oe(&self) -> bool {
        self.bit(9)
    }

    /// Parity error.
    pub fn pe(&self) -> bool {
        self.bit(10)
    }

    /// Framing error.
    pub fn fe(&self) -> bool {
        self.bit(11)
    }

    /// Break interrupt.
    pub fn bi(&self) -> bool {
        self.bit(12)
    }

    /// Transmitter holding register empty.
    pub fn thre(&self) -> bool {
        self.bit(13)
    }

    /// Transmitter empty.
    pub fn temt(&self) -> bool {
        self.bit(14)
    }

    /// Error in receiver FIFO.
    pub fn rcve(&self) -> bool {
        self.bit(15)
    }

    /// Any of the receive-side line errors.
    pub fn has_line_error(&self) -> bool {
        const ERRORS: u16 = 1 << 9 | 1 << 10 | 1 << 11 | 1 << 15;
        self.0 & ERRORS != 0
    }
}
