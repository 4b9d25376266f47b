//! # Packet Module
//!
//! Wire format and frame buffer for radio transmission and reception.
//!
//! ## Frame Structure
//!
//! Every frame on the air starts with a fixed 6-byte header, followed by
//! `len` payload bytes:
//!
//! - Byte 0: destination address
//! - Byte 1: source address
//! - Byte 2: flags
//! - Bytes 3-4: packet id, little-endian u16
//! - Byte 5: payload length
//!
//! The destination address MUST be the first byte on the wire: the radio's
//! hardware address filter inspects it before the rest of the frame is even
//! clocked in.
//!
//! ## Flags Byte
//!
//! The low nibble is an option bitfield ([`FLAG_SIN`], [`FLAG_ACK`]); the
//! high nibble is a 4-bit sequence counter incremented per retransmission
//! attempt of a non-ACK packet. The counter is diagnostic only — receivers
//! ignore it for duplicate detection and rely on the packet id instead.
//!
//! ## Design Considerations
//!
//! - **Public Fields**: `data` and `length` are public so radio drivers can
//!   fill the buffer in place without an intermediate copy.
//! - **Fixed Size**: every buffer is [`RADIO_FRAME_SIZE`] bytes for
//!   predictable memory usage; the actual frame occupies the first
//!   `length` bytes.

use crate::{Address, PacketId, RADIO_FRAME_SIZE};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Empty option nibble.
pub const FLAG_NONE: u8 = 0;
/// "Sender Is Needing-ack": the sender requests an acknowledgement.
pub const FLAG_SIN: u8 = 1 << 0;
/// This frame is an acknowledgement.
pub const FLAG_ACK: u8 = 1 << 1;

/// Packs the 4-bit sequence counter and the option nibble into a flags byte.
pub(crate) fn pack_flags(seq: u8, opts: u8) -> u8 {
    ((seq & 0x0F) << 4) | (opts & 0x0F)
}

/// Splits a flags byte into `(sequence counter, option nibble)`.
pub(crate) fn unpack_flags(flags: u8) -> (u8, u8) {
    (flags >> 4, flags & 0x0F)
}

/// Parsed form of the fixed frame header.
///
/// The packet id travels little-endian on the wire; peers must agree on the
/// byte order, so changing it breaks interoperability with deployed devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dst: Address,
    pub src: Address,
    pub flags: u8,
    pub pktid: PacketId,
    pub len: u8,
}

impl Header {
    pub(crate) fn parse(buf: &[u8]) -> Header {
        let mut pktid_bytes = [0u8; 2];
        pktid_bytes.copy_from_slice(&buf[3..5]);
        Header {
            dst: buf[0],
            src: buf[1],
            flags: buf[2],
            pktid: u16::from_le_bytes(pktid_bytes),
            len: buf[5],
        }
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.dst;
        buf[1] = self.src;
        buf[2] = self.flags;
        buf[3..5].copy_from_slice(&self.pktid.to_le_bytes());
        buf[5] = self.len;
    }
}

/// One frame, owned: header plus payload in a fixed-size buffer.
///
/// A buffer is either empty (`length == 0`) or holds a complete frame
/// (`length >= HEADER_LEN`). Tasks own the buffer of the frame they are
/// sending or have received; the engine owns one scratch buffer for the
/// interrupt-driven reception path.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct PacketBuffer {
    /// Raw frame bytes. Public for zero-copy access from radio drivers.
    pub data: [u8; RADIO_FRAME_SIZE],
    /// Number of valid bytes in `data`; zero when the buffer is empty.
    pub length: usize,
}

impl PacketBuffer {
    pub const fn new() -> Self {
        PacketBuffer {
            data: [0; RADIO_FRAME_SIZE],
            length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn clear(&mut self) {
        self.length = 0;
    }

    /// Materializes a full frame from a header and its payload.
    ///
    /// The header's declared length and the payload slice must agree; a
    /// mismatch is a programmer error.
    pub fn prepare_for_send(&mut self, header: &Header, payload: &[u8]) {
        debug_assert!(self.is_empty(), "buffer already holds a frame");
        debug_assert_eq!(header.len as usize, payload.len(), "header length disagrees with payload");
        header.write_to(&mut self.data);
        self.data[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        self.length = HEADER_LEN + payload.len();
    }

    pub fn copy_from(&mut self, other: &PacketBuffer) {
        self.data[..other.length].copy_from_slice(&other.data[..other.length]);
        self.length = other.length;
    }

    /// Validates a freshly drained frame of `nb_bytes` and commits its
    /// length on success.
    ///
    /// A frame is acceptable iff it is at least a header long, its declared
    /// payload length does not exceed the radio's maximum, and the on-wire
    /// size matches `HEADER_LEN + declared length` exactly. Anything else is
    /// dropped by the caller without consulting the duplicate cache.
    pub fn validate_received(&mut self, nb_bytes: usize, max_payload_len: u8) -> bool {
        if nb_bytes < HEADER_LEN {
            self.length = 0;
            return false;
        }
        let declared = self.data[5] as usize;
        if declared > max_payload_len as usize || HEADER_LEN + declared != nb_bytes {
            self.length = 0;
            return false;
        }
        self.length = nb_bytes;
        true
    }

    /// Drops the payload, keeping only the header with its length field
    /// zeroed. Used once the payload is no longer needed (after an ACK was
    /// received, or after the application retrieved the data) while the
    /// header must stay around for packet-id matching and re-ACKs.
    pub fn shrink_to_header(&mut self) {
        debug_assert!(!self.is_empty(), "cannot shrink an empty buffer");
        self.data[5] = 0;
        self.length = HEADER_LEN;
    }

    pub fn header(&self) -> Header {
        Header::parse(&self.data)
    }

    pub fn dst(&self) -> Address {
        self.data[0]
    }

    pub fn src(&self) -> Address {
        self.data[1]
    }

    pub fn flags(&self) -> u8 {
        self.data[2]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[2] = flags;
    }

    pub fn pktid(&self) -> PacketId {
        let mut pktid_bytes = [0u8; 2];
        pktid_bytes.copy_from_slice(&self.data[3..5]);
        u16::from_le_bytes(pktid_bytes)
    }

    pub fn payload_len(&self) -> u8 {
        self.data[5]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..HEADER_LEN + self.data[5] as usize]
    }

    /// The complete frame as transmitted on the air.
    pub fn frame(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Copies the payload into `buf`, truncating to the buffer size.
    /// Returns the number of bytes copied.
    pub(crate) fn copy_payload_into(&self, buf: &mut [u8]) -> usize {
        let rec_len = (self.data[5] as usize).min(buf.len());
        buf[..rec_len].copy_from_slice(&self.data[HEADER_LEN..HEADER_LEN + rec_len]);
        rec_len
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_byte_order_on_wire() {
        let header = Header {
            dst: 0x5E,
            src: 0x0B,
            flags: 0x01,
            pktid: 0x1234,
            len: 3,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.write_to(&mut buf);
        // destination first (hardware address filter), then source, flags,
        // little-endian packet id, length
        assert_eq!(buf, [0x5E, 0x0B, 0x01, 0x34, 0x12, 3]);
        assert_eq!(Header::parse(&buf), header);
    }

    #[test]
    fn flags_nibbles() {
        assert_eq!(pack_flags(0, FLAG_SIN), 0x01);
        assert_eq!(pack_flags(0, FLAG_ACK), 0x02);
        assert_eq!(pack_flags(3, FLAG_SIN), 0x31);
        assert_eq!(unpack_flags(0x31), (3, FLAG_SIN));
        // the sequence counter wraps at 4 bits
        assert_eq!(pack_flags(0x17, FLAG_NONE), 0x70);
    }

    #[test]
    fn prepare_for_send_builds_full_frame() {
        let header = Header {
            dst: 0x10,
            src: 0x20,
            flags: 0x01,
            pktid: 7,
            len: 3,
        };
        let mut pkt = PacketBuffer::new();
        pkt.prepare_for_send(&header, b"hi\0");
        assert_eq!(pkt.length, HEADER_LEN + 3);
        assert_eq!(pkt.frame(), &[0x10, 0x20, 0x01, 7, 0, 3, b'h', b'i', 0]);
        assert_eq!(pkt.payload(), b"hi\0");
        assert_eq!(pkt.pktid(), 7);
    }

    #[test]
    fn prepare_for_send_empty_payload() {
        let header = Header {
            dst: 0x10,
            src: 0x20,
            flags: 0x02,
            pktid: 7,
            len: 0,
        };
        let mut pkt = PacketBuffer::new();
        pkt.prepare_for_send(&header, &[]);
        assert_eq!(pkt.length, HEADER_LEN);
        assert_eq!(pkt.payload(), &[] as &[u8]);
    }

    #[test]
    fn validate_accepts_exact_frame() {
        let mut pkt = PacketBuffer::new();
        pkt.data[..9].copy_from_slice(&[0x10, 0x20, 0x01, 7, 0, 3, 1, 2, 3]);
        assert!(pkt.validate_received(9, 58));
        assert_eq!(pkt.length, 9);
    }

    #[test]
    fn validate_rejects_short_frame() {
        let mut pkt = PacketBuffer::new();
        pkt.data[..4].copy_from_slice(&[0x10, 0x20, 0x01, 7]);
        assert!(!pkt.validate_received(4, 58));
        assert!(pkt.is_empty());
        // zero bytes means nothing was pending at all
        assert!(!pkt.validate_received(0, 58));
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        let mut pkt = PacketBuffer::new();
        // header says 3 payload bytes but only 2 arrived
        pkt.data[..8].copy_from_slice(&[0x10, 0x20, 0x01, 7, 0, 3, 1, 2]);
        assert!(!pkt.validate_received(8, 58));
        // header says 2 but 3 arrived
        pkt.data[..9].copy_from_slice(&[0x10, 0x20, 0x01, 7, 0, 2, 1, 2, 3]);
        assert!(!pkt.validate_received(9, 58));
    }

    #[test]
    fn validate_rejects_declared_length_above_radio_maximum() {
        let mut pkt = PacketBuffer::new();
        pkt.data[..HEADER_LEN].copy_from_slice(&[0x10, 0x20, 0x01, 7, 0, 10]);
        assert!(!pkt.validate_received(HEADER_LEN + 10, 4));
    }

    #[test]
    fn shrink_keeps_header_and_drops_payload() {
        let header = Header {
            dst: 0x10,
            src: 0x20,
            flags: 0x01,
            pktid: 42,
            len: 4,
        };
        let mut pkt = PacketBuffer::new();
        pkt.prepare_for_send(&header, b"data");
        pkt.shrink_to_header();
        assert_eq!(pkt.length, HEADER_LEN);
        assert_eq!(pkt.payload_len(), 0);
        // matching fields survive for late ACK handling
        assert_eq!(pkt.pktid(), 42);
        assert_eq!(pkt.src(), 0x20);
        assert_eq!(pkt.flags(), 0x01);
    }

    #[test]
    fn copy_payload_truncates_to_caller_buffer() {
        let header = Header {
            dst: 0x10,
            src: 0x20,
            flags: 0,
            pktid: 1,
            len: 5,
        };
        let mut pkt = PacketBuffer::new();
        pkt.prepare_for_send(&header, b"abcde");
        let mut small = [0u8; 3];
        assert_eq!(pkt.copy_payload_into(&mut small), 3);
        assert_eq!(&small, b"abc");
        let mut large = [0u8; 16];
        assert_eq!(pkt.copy_payload_into(&mut large), 5);
        assert_eq!(&large[..5], b"abcde");
    }
}
