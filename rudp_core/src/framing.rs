//! Framing codec.
//!
//! `MessageWriter` builds a datagram payload out of nested length-prefixed
//! sub-messages into a pooled buffer; `MessageReader` parses the same
//! format back out. Wire format (see the send-option dispatch table):
//!
//! ```text
//! [sendOption:u8][reliableId:u16 BE, if reliable/hello/ping][sub-messages...]
//! sub-message := [length:u16 LE][tag:u8][body: length bytes]
//! ```
//!
//! The reliable id is big-endian; everything inside the payload is
//! little-endian. Strings and raw byte blobs are length-prefixed with a
//! packed (varint) integer.

use crate::error::{Result, TransportError};
use crate::pool::BufferPool;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

/// The 1-byte classifier at the head of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendOption {
    Normal = 0,
    Reliable = 1,
    Fragment = 2,
    Hello = 8,
    Disconnect = 9,
    Acknowledgement = 10,
    Ping = 12,
}

impl SendOption {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => SendOption::Normal,
            1 => SendOption::Reliable,
            2 => SendOption::Fragment,
            8 => SendOption::Hello,
            9 => SendOption::Disconnect,
            10 => SendOption::Acknowledgement,
            12 => SendOption::Ping,
            _ => return None,
        })
    }

    /// Whether this send option carries a reliable id and participates in
    /// ack/dedupe bookkeeping.
    pub fn is_reliable(self) -> bool {
        matches!(self, SendOption::Hello | SendOption::Reliable | SendOption::Ping)
    }
}

/// Length prefix plus tag of a datagram header, decoded once per inbound
/// datagram by the connection's dispatch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub send_option: SendOption,
    pub reliable_id: Option<u16>,
    /// Offset of the first sub-message within the datagram.
    pub body_offset: usize,
}

/// Parses the 1-byte send-option header (and, for reliable sends, the
/// following 2-byte big-endian reliable id) off the front of a datagram.
pub fn parse_datagram_header(data: &[u8]) -> Result<DatagramHeader> {
    if data.is_empty() {
        return Err(TransportError::Underflow);
    }
    let send_option = SendOption::from_u8(data[0]).unwrap_or(SendOption::Normal);
    if send_option.is_reliable() {
        if data.len() < 3 {
            return Err(TransportError::Underflow);
        }
        let reliable_id = u16::from_be_bytes([data[1], data[2]]);
        Ok(DatagramHeader {
            send_option,
            reliable_id: Some(reliable_id),
            body_offset: 3,
        })
    } else {
        Ok(DatagramHeader {
            send_option,
            reliable_id: None,
            body_offset: 1,
        })
    }
}

/// Writes the packed (7-bit group, little-endian, continuation-bit)
/// encoding of `v`. Values 0..127 occupy one byte.
pub fn write_packed(buf: &mut BytesMut, mut v: u32) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
            buf.put_u8(byte);
        } else {
            buf.put_u8(byte);
            break;
        }
    }
}

/// Reads a packed integer starting at `*pos`, advancing `*pos` past it.
pub fn read_packed(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(TransportError::Underflow)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 35 {
            return Err(TransportError::Underflow);
        }
    }
}

/// Number of bytes `write_packed` would emit for `v`.
pub fn packed_len(v: u32) -> usize {
    let bits = 32 - v.leading_zeros();
    std::cmp::max(1, ((bits + 6) / 7) as usize)
}

/// Builds a single datagram: a 1-byte (or 3-byte, for reliable sends)
/// header followed by zero or more nested length-prefixed sub-messages.
pub struct MessageWriter {
    buf: crate::pool::PooledBuffer,
    capacity: usize,
    /// High-water mark; always `>= buf.len()`.
    length: usize,
    message_starts: Vec<usize>,
}

impl MessageWriter {
    /// Starts a new datagram with the given send option and capacity, renting
    /// a buffer from `pool`. `reliable_id` must be `Some` iff `send_option`
    /// is reliable.
    pub fn new(
        pool: &Arc<BufferPool>,
        capacity: usize,
        send_option: SendOption,
        reliable_id: Option<u16>,
    ) -> Result<Self> {
        let mut writer = Self {
            buf: pool.checkout(),
            capacity,
            length: 0,
            message_starts: Vec::with_capacity(4),
        };
        writer.write_u8(send_option as u8)?;
        if let Some(id) = reliable_id {
            writer.write_u16_be(id)?;
        }
        Ok(writer)
    }

    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    fn ensure_capacity(&self, extra: usize) -> Result<()> {
        if extra > self.remaining() {
            Err(TransportError::BufferOverflow)
        } else {
            Ok(())
        }
    }

    fn bump_length(&mut self) {
        if self.buf.len() > self.length {
            self.length = self.buf.len();
        }
    }

    /// Current write cursor, equal to the number of bytes written so far.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// High-water mark ever reached by this writer.
    pub fn length(&self) -> usize {
        self.length
    }

    fn write_u16_be(&mut self, v: u16) -> Result<()> {
        self.ensure_capacity(2)?;
        self.buf.put_u16(v);
        self.bump_length();
        Ok(())
    }

    /// Opens a new nested sub-message tagged `tag`. Must be paired with
    /// `end_message` or `cancel_message`.
    pub fn start_message(&mut self, tag: u8) -> Result<()> {
        self.ensure_capacity(3)?;
        self.message_starts.push(self.buf.len());
        self.buf.put_u16_le(0); // placeholder length, back-patched on end_message
        self.buf.put_u8(tag);
        self.bump_length();
        Ok(())
    }

    /// Closes the current sub-message, back-patching its length prefix.
    pub fn end_message(&mut self) -> Result<()> {
        let start = self.message_starts.pop().ok_or(TransportError::Unbalanced)?;
        let body_len = self.buf.len() - start - 3;
        let len_bytes = (body_len as u16).to_le_bytes();
        self.buf[start] = len_bytes[0];
        self.buf[start + 1] = len_bytes[1];
        Ok(())
    }

    /// Discards the current sub-message entirely, rewinding the write
    /// cursor to where `start_message` was called.
    pub fn cancel_message(&mut self) -> Result<()> {
        let start = self.message_starts.pop().ok_or(TransportError::Unbalanced)?;
        self.buf.truncate(start);
        self.length = self.length.min(start);
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.ensure_capacity(1)?;
        self.buf.put_u8(v);
        self.bump_length();
        Ok(())
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.ensure_capacity(2)?;
        self.buf.put_u16_le(v);
        self.bump_length();
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_u16(v as u16)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.ensure_capacity(4)?;
        self.buf.put_u32_le(v);
        self.bump_length();
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_u32(v as u32)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.ensure_capacity(4)?;
        self.buf.put_f32_le(v);
        self.bump_length();
        Ok(())
    }

    pub fn write_packed(&mut self, v: u32) -> Result<()> {
        self.ensure_capacity(packed_len(v))?;
        write_packed(&mut self.buf, v);
        self.bump_length();
        Ok(())
    }

    /// Raw bytes with no length prefix.
    pub fn write_raw_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_capacity(data.len())?;
        self.buf.put_slice(data);
        self.bump_length();
        Ok(())
    }

    /// Bytes prefixed with their packed length.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_packed(data.len() as u32)?;
        self.write_raw_bytes(data)
    }

    /// UTF-8 string prefixed with its packed byte length.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())
    }

    /// Finalizes the datagram, consuming the writer and returning the bytes
    /// to transmit. Fails with `Unbalanced` if any sub-message was left
    /// open.
    pub fn finish(self) -> Result<Vec<u8>> {
        if !self.message_starts.is_empty() {
            return Err(TransportError::Unbalanced);
        }
        Ok(self.buf.to_vec())
    }
}

/// Parses sub-messages out of a datagram body (or a nested sub-message
/// body, via `read_message`).
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes remaining from the current cursor to the end of the window.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// A non-consuming window starting at `offset` from the current cursor.
    pub fn slice(&self, offset: usize) -> &'a [u8] {
        &self.data[(self.pos + offset).min(self.data.len())..]
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            Err(TransportError::Underflow)
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let mut chunk = &self.data[self.pos..self.pos + 2];
        let v = chunk.get_u16_le();
        self.pos += 2;
        Ok(v)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let mut chunk = &self.data[self.pos..self.pos + 4];
        let v = chunk.get_u32_le();
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.require(4)?;
        let mut chunk = &self.data[self.pos..self.pos + 4];
        let v = chunk.get_f32_le();
        self.pos += 4;
        Ok(v)
    }

    pub fn read_packed(&mut self) -> Result<u32> {
        read_packed(self.data, &mut self.pos)
    }

    /// Packed-length-prefixed raw bytes.
    pub fn read_bytes_and_size(&mut self) -> Result<&'a [u8]> {
        let len = self.read_packed()? as usize;
        self.require(len)?;
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes_and_size()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TransportError::Underflow)
    }

    /// Reads one `[length:u16 LE][tag:u8][body]` sub-message, returning its
    /// tag and a reader scoped to its body.
    pub fn read_message(&mut self) -> Result<(u8, MessageReader<'a>)> {
        self.require(3)?;
        let mut len_bytes = &self.data[self.pos..self.pos + 2];
        let len = len_bytes.get_u16_le() as usize;
        let tag = self.data[self.pos + 2];
        self.pos += 3;
        self.require(len)?;
        let body = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok((tag, MessageReader::new(body)))
    }

    pub fn has_next_message(&self) -> bool {
        self.remaining() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(65535)
    }

    #[test]
    fn round_trips_scalars() {
        let pool = pool();
        let mut w = MessageWriter::new(&pool, 65535, SendOption::Normal, None).unwrap();
        w.start_message(7).unwrap();
        w.write_u8(1).unwrap();
        w.write_i16(-5).unwrap();
        w.write_u32(0xdead_beef).unwrap();
        w.write_f32(1.5).unwrap();
        w.write_string("hi").unwrap();
        w.end_message().unwrap();
        let bytes = w.finish().unwrap();

        let mut r = MessageReader::new(&bytes[1..]); // skip send-option byte
        let (tag, mut body) = r.read_message().unwrap();
        assert_eq!(tag, 7);
        assert_eq!(body.read_u8().unwrap(), 1);
        assert_eq!(body.read_i16().unwrap(), -5);
        assert_eq!(body.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(body.read_f32().unwrap(), 1.5);
        assert_eq!(body.read_string().unwrap(), "hi");
        assert!(!r.has_next_message());
    }

    #[test]
    fn cancel_message_discards_bytes() {
        let pool = pool();
        let mut w = MessageWriter::new(&pool, 65535, SendOption::Normal, None).unwrap();
        let before = w.position();
        w.start_message(1).unwrap();
        w.write_bytes(b"throwaway").unwrap();
        w.cancel_message().unwrap();
        assert_eq!(w.position(), before);
        assert_eq!(w.length(), before, "cancel_message must rewind the high-water mark too");
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len(), before);
    }

    #[test]
    fn end_message_without_start_is_unbalanced() {
        let pool = pool();
        let mut w = MessageWriter::new(&pool, 65535, SendOption::Normal, None).unwrap();
        assert_eq!(w.end_message(), Err(TransportError::Unbalanced));
    }

    #[test]
    fn finish_with_open_message_is_unbalanced() {
        let pool = pool();
        let mut w = MessageWriter::new(&pool, 65535, SendOption::Normal, None).unwrap();
        w.start_message(1).unwrap();
        assert_eq!(w.finish(), Err(TransportError::Unbalanced));
    }

    #[test]
    fn overflow_is_reported() {
        let pool = pool();
        let mut w = MessageWriter::new(&pool, 4, SendOption::Normal, None).unwrap();
        assert_eq!(w.write_raw_bytes(&[0u8; 10]), Err(TransportError::BufferOverflow));
    }

    #[test]
    fn underflow_on_short_read() {
        let mut r = MessageReader::new(&[1, 2]);
        assert_eq!(r.read_u32(), Err(TransportError::Underflow));
    }

    #[test]
    fn packed_round_trip_and_length() {
        for v in [0u32, 1, 127, 128, 16384, u32::MAX, 300_000] {
            let mut buf = BytesMut::new();
            write_packed(&mut buf, v);
            assert_eq!(buf.len(), packed_len(v));
            let mut pos = 0;
            assert_eq!(read_packed(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn datagram_header_reliable() {
        let pool = pool();
        let w = MessageWriter::new(&pool, 65535, SendOption::Reliable, Some(42)).unwrap();
        let bytes = w.finish().unwrap();
        let header = parse_datagram_header(&bytes).unwrap();
        assert_eq!(header.send_option, SendOption::Reliable);
        assert_eq!(header.reliable_id, Some(42));
        assert_eq!(header.body_offset, 3);
    }

    #[test]
    fn datagram_header_normal() {
        let pool = pool();
        let w = MessageWriter::new(&pool, 65535, SendOption::Normal, None).unwrap();
        let bytes = w.finish().unwrap();
        let header = parse_datagram_header(&bytes).unwrap();
        assert_eq!(header.send_option, SendOption::Normal);
        assert_eq!(header.reliable_id, None);
        assert_eq!(header.body_offset, 1);
    }
}
