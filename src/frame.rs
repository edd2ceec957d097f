//! Command and response frames exchanged with the FPGA over the bulk link.
//!
//! Both frames are 13 bytes long and share one layout; the response carries a
//! status byte where the command carries its opcode:
//!
//! ```text
//! id(1) | opcode/status(1) | word_count(3) | target(4) | immediate(4)
//! ```
//!
//! Every multi-byte field is big-endian. The target is either a device index
//! followed by a 24-bit register address, or a flat 32-bit memory address
//! when the `MEMORY_FLAG` bit is set in the opcode.

/// Marker byte opening every command frame.
pub const COMMAND_ID: u8 = 0xCD;

/// Marker byte opening every response frame.
pub const RESPONSE_ID: u8 = 0xDC;

/// Selects flat memory addressing for the target field.
pub const MEMORY_FLAG: u8 = 0x10;

pub const COMMAND_HEADER_LEN: usize = 13;
pub const RESPONSE_HEADER_LEN: usize = 13;

/// Payloads move in 32-bit words.
pub const WORD_SIZE: usize = 4;

/// Largest value that fits the 24-bit word count field.
pub const MAX_WORD_COUNT: u32 = 0x00FF_FFFF;

/// Largest register address that fits next to the device index.
pub const MAX_REGISTER_ADDRESS: u32 = 0x00FF_FFFF;

const OPCODE_MASK: u8 = 0x0F;

const_assert_eq!(COMMAND_HEADER_LEN, 1 + 1 + 3 + 4 + 4);
const_assert_eq!(COMMAND_HEADER_LEN, RESPONSE_HEADER_LEN);

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::FromRepr)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    Ping = 0x00,
    Write = 0x01,
    Read = 0x02,
    Crash = 0x03,
    InterruptPoll = 0x0F,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than a full header.
    Truncated { len: usize },
    /// Byte length is not a whole number of words.
    Unaligned { len: usize },
    /// Word count does not fit in 24 bits.
    WordCountOverflow { words: usize },
    /// Register address does not fit in 24 bits.
    AddressOverflow { address: u32 },
    /// First byte is not the expected marker.
    BadMarker { found: u8 },
    UnknownOpcode { found: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseError {
    /// The stream is no longer aligned to frame boundaries.
    IdMismatch { found: u8 },
    /// The device answered a different command than the one sent.
    StatusMismatch { expected: u8, found: u8 },
}

/// What a frame addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Target {
    Register { device: u8, address: u32 },
    Memory(u32),
}

impl Target {
    pub fn is_memory(self) -> bool {
        matches!(self, Target::Memory(_))
    }

    fn to_bytes(self) -> [u8; 4] {
        match self {
            Target::Register { device, address } => {
                let a = address.to_be_bytes();
                [device, a[1], a[2], a[3]]
            }
            Target::Memory(address) => address.to_be_bytes(),
        }
    }

    fn from_bytes(bytes: [u8; 4], memory: bool) -> Self {
        if memory {
            Target::Memory(u32::from_be_bytes(bytes))
        } else {
            Target::Register {
                device: bytes[0],
                address: u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]),
            }
        }
    }
}

/// Converts a byte length into the word count carried by a frame.
pub fn words_for(len: usize) -> Result<u32, FrameError> {
    if len % WORD_SIZE != 0 {
        return Err(FrameError::Unaligned { len });
    }
    let words = len / WORD_SIZE;
    if words > MAX_WORD_COUNT as usize {
        return Err(FrameError::WordCountOverflow { words });
    }
    Ok(words as u32)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub opcode: Opcode,
    pub target: Target,
    pub word_count: u32,
    pub data: u32,
}

impl Command {
    pub fn ping() -> Self {
        Self {
            opcode: Opcode::Ping,
            target: Target::Register { device: 0, address: 0 },
            word_count: 0,
            data: 0,
        }
    }

    pub fn interrupt_poll() -> Self {
        Self {
            opcode: Opcode::InterruptPoll,
            ..Self::ping()
        }
    }

    /// Write `len` bytes of payload to `target`.
    pub fn write(target: Target, len: usize) -> Result<Self, FrameError> {
        Self::transfer(Opcode::Write, target, len)
    }

    /// Read `len` bytes of payload from `target`.
    pub fn read(target: Target, len: usize) -> Result<Self, FrameError> {
        Self::transfer(Opcode::Read, target, len)
    }

    fn transfer(opcode: Opcode, target: Target, len: usize) -> Result<Self, FrameError> {
        if let Target::Register { address, .. } = target {
            if address > MAX_REGISTER_ADDRESS {
                return Err(FrameError::AddressOverflow { address });
            }
        }
        Ok(Self {
            opcode,
            target,
            word_count: words_for(len)?,
            data: 0,
        })
    }

    /// The opcode byte as sent on the wire, memory flag included.
    pub fn command_byte(&self) -> u8 {
        let flag = if self.target.is_memory() { MEMORY_FLAG } else { 0 };
        self.opcode as u8 | flag
    }

    /// Status byte a well-behaved device answers this command with.
    pub fn expected_status(&self) -> u8 {
        !self.command_byte()
    }

    pub fn encode(&self) -> [u8; COMMAND_HEADER_LEN] {
        let mut out = [0u8; COMMAND_HEADER_LEN];
        out[0] = COMMAND_ID;
        out[1] = self.command_byte();
        out[2..5].copy_from_slice(&self.word_count.to_be_bytes()[1..]);
        out[5..9].copy_from_slice(&self.target.to_bytes());
        out[9..13].copy_from_slice(&self.data.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let raw = RawHeader::parse(bytes)?;
        if raw.id != COMMAND_ID {
            return Err(FrameError::BadMarker { found: raw.id });
        }
        let opcode = Opcode::from_repr(raw.code & OPCODE_MASK)
            .ok_or(FrameError::UnknownOpcode { found: raw.code })?;
        Ok(Self {
            opcode,
            target: Target::from_bytes(raw.target, raw.code & MEMORY_FLAG != 0),
            word_count: raw.word_count,
            data: raw.data,
        })
    }
}

/// Builds a command header from its raw fields.
///
/// For memory commands `dev_or_addr_hi` is the top byte of the address and
/// `reg_or_addr_lo` its low 24 bits; otherwise they are the device index
/// and the register address.
pub fn encode_command(
    opcode: Opcode, is_memory: bool, dev_or_addr_hi: u8, reg_or_addr_lo: u32, word_count: u32,
) -> Result<[u8; COMMAND_HEADER_LEN], FrameError> {
    if word_count > MAX_WORD_COUNT {
        return Err(FrameError::WordCountOverflow { words: word_count as usize });
    }
    if reg_or_addr_lo > MAX_REGISTER_ADDRESS {
        return Err(FrameError::AddressOverflow { address: reg_or_addr_lo });
    }
    let target = if is_memory {
        Target::Memory((dev_or_addr_hi as u32) << 24 | reg_or_addr_lo)
    } else {
        Target::Register {
            device: dev_or_addr_hi,
            address: reg_or_addr_lo,
        }
    };
    Ok(Command {
        opcode,
        target,
        word_count,
        data: 0,
    }
    .encode())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    pub id: u8,
    pub status: u8,
    pub word_count: u32,
    pub target: [u8; 4],
    pub data: u32,
}

impl Response {
    /// Response a device sends back for `command`.
    pub fn answering(command: &Command) -> Self {
        Self {
            id: RESPONSE_ID,
            status: command.expected_status(),
            word_count: command.word_count,
            target: command.target.to_bytes(),
            data: command.data,
        }
    }

    pub fn target(&self, memory: bool) -> Target {
        Target::from_bytes(self.target, memory)
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut out = [0u8; RESPONSE_HEADER_LEN];
        out[0] = self.id;
        out[1] = self.status;
        out[2..5].copy_from_slice(&self.word_count.to_be_bytes()[1..]);
        out[5..9].copy_from_slice(&self.target);
        out[9..13].copy_from_slice(&self.data.to_be_bytes());
        out
    }
}

/// Parses a response header. Marker and status are left for [`validate`].
pub fn decode_response(bytes: &[u8]) -> Result<Response, FrameError> {
    let raw = RawHeader::parse(bytes)?;
    Ok(Response {
        id: raw.id,
        status: raw.code,
        word_count: raw.word_count,
        target: raw.target,
        data: raw.data,
    })
}

/// Checks a response against the command byte it answers.
pub fn validate(response: &Response, command_byte: u8) -> Result<(), ResponseError> {
    if response.id != RESPONSE_ID {
        return Err(ResponseError::IdMismatch { found: response.id });
    }
    let expected = !command_byte;
    if response.status != expected {
        return Err(ResponseError::StatusMismatch {
            expected,
            found: response.status,
        });
    }
    Ok(())
}

struct RawHeader {
    id: u8,
    code: u8,
    word_count: u32,
    target: [u8; 4],
    data: u32,
}

impl RawHeader {
    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < COMMAND_HEADER_LEN {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        Ok(Self {
            id: bytes[0],
            code: bytes[1],
            word_count: u32::from_be_bytes([0, bytes[2], bytes[3], bytes[4]]),
            target: [bytes[5], bytes[6], bytes[7], bytes[8]],
            data: u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ping_layout() {
        let ping = Command::ping().encode();
        assert_eq!(ping, [0xCD, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn register_write_layout() {
        let cmd = Command::write(Target::Register { device: 3, address: 0x012345 }, 8).unwrap();
        assert_eq!(
            cmd.encode(),
            [0xCD, 0x01, 0x00, 0x00, 0x02, 0x03, 0x01, 0x23, 0x45, 0, 0, 0, 0]
        );
    }

    #[test]
    fn memory_read_layout() {
        let cmd = Command::read(Target::Memory(0xDEADBEEF), 0x40).unwrap();
        let bytes = cmd.encode();
        assert_eq!(bytes[1], MEMORY_FLAG | Opcode::Read as u8);
        assert_eq!(&bytes[2..5], &[0x00, 0x00, 0x10]);
        assert_eq!(&bytes[5..9], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn raw_encoder_matches_builder() {
        let raw = encode_command(Opcode::Read, true, 0xDE, 0xADBEEF, 0x10).unwrap();
        let built = Command::read(Target::Memory(0xDEADBEEF), 0x40).unwrap().encode();
        assert_eq!(raw, built);

        let raw = encode_command(Opcode::Write, false, 1, 0x10, 1).unwrap();
        let built = Command::write(Target::Register { device: 1, address: 0x10 }, 4).unwrap().encode();
        assert_eq!(raw, built);
    }

    #[test]
    fn unaligned_length_rejected() {
        assert_eq!(
            Command::write(Target::Memory(0), 6),
            Err(FrameError::Unaligned { len: 6 })
        );
        assert_eq!(words_for(12), Ok(3));
    }

    #[test]
    fn oversized_fields_rejected() {
        assert_eq!(
            encode_command(Opcode::Write, false, 0, 0, MAX_WORD_COUNT + 1),
            Err(FrameError::WordCountOverflow { words: MAX_WORD_COUNT as usize + 1 })
        );
        assert_eq!(
            Command::read(Target::Register { device: 0, address: 0x0100_0000 }, 4),
            Err(FrameError::AddressOverflow { address: 0x0100_0000 })
        );
    }

    #[test]
    fn command_survives_decode() {
        let cmd = Command::write(Target::Register { device: 7, address: 0xABCDEF }, 0x300).unwrap();
        let bytes = cmd.encode();
        assert_eq!(Command::decode(&bytes), Ok(cmd));

        let response = Response::answering(&cmd);
        let decoded = decode_response(&response.encode()).unwrap();
        assert_eq!(decoded.status, !bytes[1]);
        assert_eq!(decoded.word_count, 0xC0);
        assert_eq!(decoded.target, [bytes[5], bytes[6], bytes[7], bytes[8]]);
        assert_eq!(decoded.target(false), cmd.target);
    }

    #[test]
    fn truncated_header() {
        assert_eq!(decode_response(&[0xDC, 0xFF]), Err(FrameError::Truncated { len: 2 }));
    }

    #[test]
    fn validate_checks_marker_then_status() {
        let ping = Command::ping();
        let mut response = Response::answering(&ping);
        assert_eq!(response.status, 0xFF);
        assert_eq!(validate(&response, ping.command_byte()), Ok(()));

        response.status = 0xFE;
        assert_eq!(
            validate(&response, ping.command_byte()),
            Err(ResponseError::StatusMismatch { expected: 0xFF, found: 0xFE })
        );

        response.id = 0x00;
        assert_eq!(
            validate(&response, ping.command_byte()),
            Err(ResponseError::IdMismatch { found: 0x00 })
        );
    }
}
