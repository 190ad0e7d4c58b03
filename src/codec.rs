//! Conversion between [`Message`] and its wire representation.
//!
//! The framing is the fixed 12-byte prelude (endianness tag, type, flags,
//! protocol version, body length, serial), the `a{yv}` header array,
//! padding to 8, then the body. Everything is written in the message's
//! own byte order and read back in whichever order the tag announces.

use crate::error::{Error, Result};
use crate::fdlist::FdList;
use crate::message::{HeaderField, Message, MessageFlags, MessageType};
use crate::signature::{Signature, Type, MAX_CONTAINER_DEPTH};
use crate::value::Value;

use byteorder::{ByteOrder, BE, LE};
use log::trace;
use std::collections::BTreeMap;

mod reader;
mod writer;

use reader::Reader;
use writer::Writer;

pub const PROTOCOL_VERSION: u8 = 1;
/// Largest permitted array, in bytes.
pub const MAX_ARRAY_LEN: usize = 1 << 26;
/// Largest permitted message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1 << 27;
/// Nesting levels allowed for one complete value: every container plus
/// the leaf.
pub const MAX_TYPE_DEPTH: usize = MAX_CONTAINER_DEPTH + 1;

const FIXED_HEADER_LEN: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn native() -> Endianness {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Endianness> {
        match tag {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Endianness::native()
    }
}

/// Computes the full length of the message starting at `blob` from its
/// first 16 bytes.
pub fn bytes_needed(blob: &[u8]) -> Result<usize> {
    if blob.len() < 16 {
        return Err(Error::invalid(format!(
            "Need at least 16 bytes to size a message, got {}",
            blob.len()
        )));
    }
    let (header_len, body_len) = match Endianness::from_tag(blob[0]) {
        Some(Endianness::Little) => (LE::read_u32(&blob[12..16]), LE::read_u32(&blob[4..8])),
        Some(Endianness::Big) => (BE::read_u32(&blob[12..16]), BE::read_u32(&blob[4..8])),
        None => {
            return Err(Error::invalid(format!(
                "Unable to determine message blob length - given blob is malformed \
                 (endianness tag 0x{:02x})",
                blob[0]
            )))
        }
    };
    let header_end = crate::align::align(FIXED_HEADER_LEN + 4 + header_len as usize, 8);
    let total = header_end + body_len as usize;
    if total > MAX_MESSAGE_LEN {
        return Err(Error::invalid(format!(
            "Blob indicates that message exceeds maximum message length (128MiB) ({} bytes)",
            total
        )));
    }
    Ok(total)
}

pub(crate) fn encode(message: &Message) -> Result<Vec<u8>> {
    match message.byte_order() {
        Endianness::Little => encode_with::<LE>(message),
        Endianness::Big => encode_with::<BE>(message),
    }
}

fn header_array(message: &Message) -> Value {
    let items = message
        .headers()
        .iter()
        .map(|(code, value)| {
            Value::DictEntry(
                Box::new(Value::Byte(*code)),
                Box::new(Value::Variant(Box::new(value.clone()))),
            )
        })
        .collect();
    Value::array_unchecked(
        Type::DictEntry(Box::new(Type::Byte), Box::new(Type::Variant)),
        items,
    )
}

fn encode_with<B: ByteOrder>(message: &Message) -> Result<Vec<u8>> {
    message.validate_for_send()?;

    let mut w = Writer::<B>::new();
    w.put(message.byte_order().tag());
    w.put(message.message_type() as u8);
    w.put(message.flags().bits());
    w.put(PROTOCOL_VERSION);
    w.put(0u32); // body length, patched below
    w.put(message.serial());
    w.write_value(&header_array(message))?;
    w.align(8);

    let body_start = w.len();
    if let Some(Value::Struct(fields)) = message.body() {
        for field in fields {
            w.write_value(field)?;
        }
    }
    let body_len = w.len() - body_start;
    w.put_u32_at(4, body_len as u32);

    let blob = w.complete();
    if blob.len() > MAX_MESSAGE_LEN {
        return Err(Error::invalid(format!(
            "Message of {} bytes exceeds the maximum of {}",
            blob.len(),
            MAX_MESSAGE_LEN
        )));
    }
    trace!(
        "encoded {:?} serial {}: {} bytes ({} body)",
        message.message_type(),
        message.serial(),
        blob.len(),
        body_len
    );
    Ok(blob)
}

pub(crate) fn decode(blob: &[u8], fd_list: Option<FdList>) -> Result<Message> {
    if blob.len() < 16 {
        return Err(Error::EndOfInput);
    }
    match Endianness::from_tag(blob[0]) {
        Some(Endianness::Little) => decode_with::<LE>(blob, Endianness::Little, fd_list),
        Some(Endianness::Big) => decode_with::<BE>(blob, Endianness::Big, fd_list),
        None => Err(Error::invalid(format!(
            "Invalid endianness value. Expected 0x6c ('l') or 0x42 ('B') but found value 0x{:02x}",
            blob[0]
        ))),
    }
}

fn decode_with<B: ByteOrder>(
    blob: &[u8],
    endianness: Endianness,
    fd_list: Option<FdList>,
) -> Result<Message> {
    let mut r = Reader::<B>::new(blob, 1, endianness);
    let type_code: u8 = r.get()?;
    let message_type = MessageType::from_code(type_code)
        .ok_or_else(|| Error::invalid(format!("Unknown message type {}", type_code)))?;
    let flags = MessageFlags::from_bits_retain(r.get()?);
    let version: u8 = r.get()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::invalid(format!(
            "Invalid major protocol version. Expected 1 but found {}",
            version
        )));
    }
    let body_len = r.get::<u32>()? as usize;
    let serial: u32 = r.get()?;

    let header_type = Type::Array(Box::new(Type::DictEntry(
        Box::new(Type::Byte),
        Box::new(Type::Variant),
    )));
    let header_value = r.read_value(&header_type, MAX_TYPE_DEPTH + 2)?;
    let mut headers = BTreeMap::new();
    if let Value::Array(array) = header_value {
        for entry in array.into_items() {
            if let Value::DictEntry(code, value) = entry {
                if let (Value::Byte(code), Value::Variant(value)) = (*code, *value) {
                    headers.insert(code, *value);
                }
            }
        }
    }
    r.align(8)?;

    let body_start = r.pos();
    let body_end = body_start.checked_add(body_len).ok_or(Error::EndOfInput)?;
    if body_end > blob.len() {
        return Err(Error::EndOfInput);
    }

    let signature = match headers.get(&(HeaderField::Signature as u8)) {
        None => None,
        Some(Value::Signature(sig)) => Some(sig.clone()),
        Some(_) => {
            return Err(Error::invalid(
                "Signature header found but is not of type signature",
            ))
        }
    };

    let body = match signature.as_ref().and_then(Signature::as_tuple) {
        Some(body_type) => {
            if body_len == 0 {
                return Err(Error::invalid(format!(
                    "Signature header with signature `{}` found but message body is empty",
                    signature.as_ref().map(Signature::as_str).unwrap_or_default()
                )));
            }
            let mut body_reader = Reader::<B>::new(&blob[..body_end], body_start, endianness);
            let body = body_reader.read_value(&body_type, MAX_TYPE_DEPTH + 1)?;
            if body_reader.pos() != body_end {
                return Err(Error::invalid(format!(
                    "Body has {} trailing bytes",
                    body_end - body_reader.pos()
                )));
            }
            Some(body)
        }
        None => {
            if body_len != 0 {
                return Err(Error::invalid(format!(
                    "No signature header in message but the message body is {} bytes",
                    body_len
                )));
            }
            None
        }
    };

    let message = Message::from_parts(
        message_type,
        flags,
        endianness,
        serial,
        headers,
        body,
        fd_list,
    );
    message.validate_headers()?;
    message.validate_fd_count()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use test_log::test;

    #[test]
    fn bytes_needed_rejects_bad_tag() {
        let mut blob = [0u8; 16];
        blob[0] = b'x';
        assert!(bytes_needed(&blob).is_err());
        assert!(bytes_needed(&blob[..15]).is_err());
    }

    #[test]
    fn bytes_needed_rounds_header() -> Result<()> {
        let mut blob = [0u8; 16];
        blob[0] = b'l';
        LE::write_u32(&mut blob[4..8], 5);
        LE::write_u32(&mut blob[12..16], 3);
        // 12 + 4 + 3 = 19 -> 24, plus 5 bytes of body
        assert_eq!(bytes_needed(&blob)?, 29);
        blob[0] = b'B';
        BE::write_u32(&mut blob[4..8], 0);
        BE::write_u32(&mut blob[12..16], 8);
        assert_eq!(bytes_needed(&blob)?, 24);
        Ok(())
    }

    #[test]
    fn bytes_needed_caps_size() {
        let mut blob = [0u8; 16];
        blob[0] = b'l';
        LE::write_u32(&mut blob[4..8], u32::MAX);
        let err = bytes_needed(&blob).err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn decode_rejects_short_or_bad_version() -> Result<()> {
        assert!(matches!(decode(&[b'l'; 8], None), Err(Error::EndOfInput)));
        let mut m = Message::new_signal("/a", "x.y", "Sig")?;
        m.set_byte_order(Endianness::Little)?;
        let mut blob = m.to_blob()?;
        blob[3] = 2;
        assert!(decode(&blob, None).is_err());
        Ok(())
    }
}
