//! Rebuilds a response out of the inbound packet stream.
//!
//! The bridge cuts the device's byte stream into packets of at most the
//! endpoint's max packet size and puts its modem status in front of each.
//! A transfer can carry several such packets back to back. Packets of two
//! bytes or fewer carry no data at all.

use crate::{ModemStatus, MODEM_PREFIX_LEN, RESPONSE_HEADER_LEN};

/// What one inbound transfer contributed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Feed {
    /// Status-only packet, nothing consumed.
    Noise,
    Consumed {
        header: usize,
        payload: usize,
        /// Bytes past the end of the expected response, dropped.
        excess: usize,
    },
}

#[derive(Clone, Debug)]
pub struct Reassembler {
    header: [u8; RESPONSE_HEADER_LEN],
    header_len: usize,
    header_filled: usize,
    payload_len: usize,
    payload_filled: usize,
    packet_size: usize,
    status: Option<ModemStatus>,
}

impl Reassembler {
    /// `header_len` is capped to a response header.
    pub fn new(header_len: usize, payload_len: usize, packet_size: usize) -> Self {
        Self {
            header: [0; RESPONSE_HEADER_LEN],
            header_len: header_len.min(RESPONSE_HEADER_LEN),
            header_filled: 0,
            payload_len,
            payload_filled: 0,
            packet_size: packet_size.max(MODEM_PREFIX_LEN + 1),
            status: None,
        }
    }

    /// Consumes one completed inbound transfer, payload bytes land in `dest`.
    pub fn feed(&mut self, data: &[u8], dest: &mut [u8]) -> Feed {
        if data.len() <= MODEM_PREFIX_LEN {
            if let Some(status) = ModemStatus::from_packet(data) {
                self.status = Some(status);
            }
            return Feed::Noise;
        }

        let mut header = 0;
        let mut payload = 0;
        let mut excess = 0;
        for packet in data.chunks(self.packet_size) {
            let Some(status) = ModemStatus::from_packet(packet) else {
                continue;
            };
            self.status = Some(status);
            let mut body = &packet[MODEM_PREFIX_LEN..];

            if self.header_filled < self.header_len {
                let n = body.len().min(self.header_len - self.header_filled);
                self.header[self.header_filled..self.header_filled + n].copy_from_slice(&body[..n]);
                self.header_filled += n;
                header += n;
                body = &body[n..];
            }

            let room = self.payload_len.min(dest.len()).saturating_sub(self.payload_filled);
            let n = body.len().min(room);
            dest[self.payload_filled..self.payload_filled + n].copy_from_slice(&body[..n]);
            self.payload_filled += n;
            payload += n;
            excess += body.len() - n;
        }
        Feed::Consumed { header, payload, excess }
    }

    pub fn header_complete(&self) -> bool {
        self.header_filled == self.header_len
    }

    /// Header bytes, once all of them arrived.
    pub fn header(&self) -> Option<&[u8]> {
        self.header_complete().then(|| &self.header[..self.header_len])
    }

    pub fn is_complete(&self) -> bool {
        self.header_complete() && self.payload_filled == self.payload_len
    }

    /// Header and payload bytes still expected.
    pub fn remaining(&self) -> usize {
        (self.header_len - self.header_filled) + (self.payload_len - self.payload_filled)
    }

    /// Header and payload bytes received so far.
    pub fn received(&self) -> usize {
        self.header_filled + self.payload_filled
    }

    pub fn payload_filled(&self) -> usize {
        self.payload_filled
    }

    /// Last modem status seen, noise packets included.
    pub fn modem_status(&self) -> Option<ModemStatus> {
        self.status
    }
}
