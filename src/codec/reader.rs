use crate::align::padding;
use crate::codec::{Endianness, MAX_ARRAY_LEN};
use crate::error::{Error, Result};
use crate::names::{is_object_path, ObjectPath};
use crate::primitives::Primitive;
use crate::signature::{Signature, Type};
use crate::value::Value;

use byteorder::{ByteOrder, NativeEndian};
use log::{error, trace};
use std::marker::PhantomData;
use std::str::from_utf8;

/// A cursor over a received blob. Alignment is computed from the start of
/// `buf`, which is always the start of the message.
pub(super) struct Reader<'de, B: ByteOrder> {
    buf: &'de [u8],
    pos: usize,
    endianness: Endianness,
    phantom: PhantomData<B>,
}

impl<'de, B: ByteOrder> Reader<'de, B> {
    pub(super) fn new(buf: &'de [u8], pos: usize, endianness: Endianness) -> Self {
        Self {
            buf,
            pos,
            endianness,
            phantom: PhantomData,
        }
    }

    pub(super) fn pos(&self) -> usize {
        self.pos
    }

    /// A reader that cannot see past `end`.
    fn bounded(&self, end: usize) -> Reader<'de, B> {
        Reader::new(&self.buf[..end], self.pos, self.endianness)
    }

    pub(super) fn align(&mut self, alignment: usize) -> Result<()> {
        let new_pos = self.pos + padding(self.pos, alignment);
        if new_pos > self.buf.len() {
            return Err(Error::EndOfInput);
        }
        if self.buf[self.pos..new_pos].iter().any(|b| *b != 0) {
            error!("Non-zero padding at {}", self.pos);
            return Err(Error::invalid(format!(
                "Non-zero padding bytes at offset {}",
                self.pos
            )));
        }
        self.pos = new_pos;
        Ok(())
    }

    pub(super) fn read(&mut self, len: usize) -> Result<&'de [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::EndOfInput)?;
        if end > self.buf.len() {
            return Err(Error::EndOfInput);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(super) fn get<P: Primitive>(&mut self) -> Result<P> {
        self.align(P::ALIGNMENT)?;
        Ok(P::get::<B>(self.read(P::SIZE)?))
    }

    fn read_nul(&mut self) -> Result<()> {
        match self.read(1)?[0] {
            0 => Ok(()),
            other => Err(Error::invalid(format!(
                "Expected NUL terminator, found 0x{:02x}",
                other
            ))),
        }
    }

    pub(super) fn read_str(&mut self) -> Result<&'de str> {
        let len = self.get::<u32>()? as usize;
        trace!("string of {} bytes at {}", len, self.pos);
        let bytes = self.read(len)?;
        self.read_nul()?;
        Ok(from_utf8(bytes)?)
    }

    pub(super) fn read_signature_str(&mut self) -> Result<&'de str> {
        let len = self.read(1)?[0] as usize;
        let bytes = self.read(len)?;
        self.read_nul()?;
        Ok(from_utf8(bytes)?)
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.get::<u32>()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::invalid(format!("Invalid boolean value {}", other))),
        }
    }

    /// Reads one value of type `ty`. `max_depth` is the number of nesting
    /// levels still permitted, counting this value.
    pub(super) fn read_value(&mut self, ty: &Type, max_depth: usize) -> Result<Value> {
        if max_depth == 0 {
            return Err(Error::NestingExceeded);
        }
        let value = match ty {
            Type::Byte => Value::Byte(self.get()?),
            Type::Boolean => Value::Boolean(self.read_bool()?),
            Type::Int16 => Value::Int16(self.get()?),
            Type::UInt16 => Value::UInt16(self.get()?),
            Type::Int32 => Value::Int32(self.get()?),
            Type::UInt32 => Value::UInt32(self.get()?),
            Type::Int64 => Value::Int64(self.get()?),
            Type::UInt64 => Value::UInt64(self.get()?),
            Type::Double => Value::Double(self.get()?),
            Type::Handle => Value::Handle(self.get()?),
            Type::String => Value::String(self.read_str()?.to_owned()),
            Type::ObjectPath => {
                let path = self.read_str()?;
                if !is_object_path(path) {
                    return Err(Error::invalid(format!(
                        "Parsed value `{}` is not a valid object path",
                        path
                    )));
                }
                Value::ObjectPath(ObjectPath::new(path)?)
            }
            Type::Signature => Value::Signature(Signature::new(self.read_signature_str()?)?),
            Type::Array(elem) => self.read_array(elem, max_depth)?,
            Type::Struct(fields) => {
                if fields.is_empty() {
                    return Err(Error::invalid("Empty structs are not allowed"));
                }
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.read_value(field, max_depth - 1)?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(k, v) => {
                self.align(8)?;
                let key = self.read_value(k, max_depth - 1)?;
                let value = self.read_value(v, max_depth - 1)?;
                Value::DictEntry(Box::new(key), Box::new(value))
            }
            Type::Variant => {
                let sig = self.read_signature_str()?;
                let inner_ty = Type::parse(sig).map_err(|_| {
                    Error::invalid(format!(
                        "Parsed value `{}` for variant is not a valid D-Bus signature",
                        sig
                    ))
                })?;
                if max_depth <= inner_ty.depth() {
                    return Err(Error::NestingExceeded);
                }
                Value::Variant(Box::new(self.read_value(&inner_ty, max_depth - 1)?))
            }
        };
        Ok(value)
    }

    fn read_array(&mut self, elem: &Type, max_depth: usize) -> Result<Value> {
        let len = self.get::<u32>()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(Error::invalid(format!(
                "Encountered array of length {} bytes. Maximum length is {} bytes",
                len, MAX_ARRAY_LEN
            )));
        }
        if max_depth <= elem.depth() {
            return Err(Error::NestingExceeded);
        }
        // Padding to the element alignment is present even when empty.
        self.align(elem.alignment())?;
        let end = self.pos.checked_add(len).ok_or(Error::EndOfInput)?;
        if end > self.buf.len() {
            return Err(Error::EndOfInput);
        }

        if let Some(size) = elem.fixed_size() {
            if len % size != 0 {
                return Err(Error::invalid(format!(
                    "Encountered array of type `a{}`, expected to have a length a multiple \
                     of {} bytes, but found to be {} bytes in length",
                    elem, size, len
                )));
            }
            let raw = self.read(len)?;
            let items = raw.chunks_exact(size).map(|c| fixed_from_native(elem, c)).collect();
            return Ok(Value::array_unchecked(elem.clone(), items).normalize(self.endianness));
        }

        let mut items = Vec::new();
        let mut sub = self.bounded(end);
        while sub.pos < end {
            let before = sub.pos;
            items.push(sub.read_value(elem, max_depth - 1)?);
            if sub.pos <= before {
                return Err(Error::invalid("Array element did not advance the read position"));
            }
        }
        self.pos = end;
        Ok(Value::array_unchecked(elem.clone(), items))
    }
}

/// Decodes one element of a fixed-size array as if it were in host order;
/// the whole array is normalized afterwards.
fn fixed_from_native(ty: &Type, chunk: &[u8]) -> Value {
    match ty {
        Type::Byte => Value::Byte(chunk[0]),
        Type::Int16 => Value::Int16(NativeEndian::read_i16(chunk)),
        Type::UInt16 => Value::UInt16(NativeEndian::read_u16(chunk)),
        Type::Int32 => Value::Int32(NativeEndian::read_i32(chunk)),
        Type::UInt32 => Value::UInt32(NativeEndian::read_u32(chunk)),
        Type::Handle => Value::Handle(NativeEndian::read_i32(chunk)),
        Type::Int64 => Value::Int64(NativeEndian::read_i64(chunk)),
        Type::UInt64 => Value::UInt64(NativeEndian::read_u64(chunk)),
        _ => Value::Double(NativeEndian::read_f64(chunk)),
    }
}

#[cfg(test)]
mod tests {
    use super::Reader;
    use crate::codec::Endianness;
    use crate::error::{Error, ErrorKind, Result};
    use crate::signature::Type;
    use crate::value::Value;
    use byteorder::{BE, LE};
    use test_log::test;

    fn decode_le(buf: &[u8], sig: &str) -> Result<Value> {
        let mut r = Reader::<LE>::new(buf, 0, Endianness::Little);
        r.read_value(&Type::parse(sig)?, 64)
    }

    #[test]
    fn read_struct() -> Result<()> {
        let data = vec![
            2u8, 0, 0, 0, 72, 105, 0, 0, 154, 153, 153, 153, 153, 153, 201, 63, 5, 0, 0, 0, 72,
            101, 108, 108, 111, 0, 0, 0, 0, 0, 0, 0, 154, 153, 153, 153, 153, 153, 32, 64,
        ];
        let v = decode_le(&data, "(sd(sd))")?;
        assert_eq!(
            v,
            Value::tuple(vec![
                "Hi".into(),
                0.2f64.into(),
                Value::tuple(vec!["Hello".into(), 8.3f64.into()]),
            ])
        );
        Ok(())
    }

    #[test]
    fn big_endian_int_array() -> Result<()> {
        let data = vec![0, 0, 0, 12, 0, 0, 0, 1, 0, 0, 0, 2, 1, 2, 3, 4];
        let mut r = Reader::<BE>::new(&data, 0, Endianness::Big);
        let v = r.read_value(&Type::parse("ai")?, 64)?;
        let items: Vec<i32> = v
            .as_array()
            .map(|a| a.items().iter().filter_map(Value::as_i32).collect())
            .unwrap_or_default();
        assert_eq!(items, vec![1, 2, 0x0102_0304]);
        Ok(())
    }

    #[test]
    fn rejects_bad_fixed_array_length() -> Result<()> {
        let data = vec![3, 0, 0, 0, 1, 2, 3, 0];
        let err = decode_le(&data, "ai").err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::InvalidArgument));
        Ok(())
    }

    #[test]
    fn rejects_nonzero_padding() -> Result<()> {
        let data = vec![1, 7, 0, 0, 5, 0, 0, 0];
        assert!(decode_le(&data, "(yu)").is_err());
        let data = vec![1, 0, 0, 0, 5, 0, 0, 0];
        assert_eq!(
            decode_le(&data, "(yu)")?,
            Value::tuple(vec![1u8.into(), 5u32.into()])
        );
        Ok(())
    }

    #[test]
    fn rejects_invalid_strings() -> Result<()> {
        // Missing NUL.
        assert!(decode_le(&[1, 0, 0, 0, b'a', b'b'], "s").is_err());
        // Invalid UTF-8.
        assert!(decode_le(&[1, 0, 0, 0, 0xff, 0], "s").is_err());
        // Not an object path.
        assert!(decode_le(&[1, 0, 0, 0, b'a', 0], "o").is_err());
        assert!(matches!(
            decode_le(&[5, 0, 0, 0, b'a', 0], "s"),
            Err(Error::EndOfInput)
        ));
        Ok(())
    }

    #[test]
    fn nested_variants_hit_depth_limit() -> Result<()> {
        let mut data = Vec::new();
        for _ in 0..70 {
            data.extend_from_slice(&[1, b'v', 0]);
        }
        data.extend_from_slice(&[1, b'y', 0, 9]);
        assert!(matches!(decode_le(&data, "v"), Err(Error::NestingExceeded)));
        Ok(())
    }

    #[test]
    fn array_elements_stay_inside_the_array() -> Result<()> {
        let exact = vec![7, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0];
        assert_eq!(decode_le(&exact, "as")?, Value::from(vec!["ab".to_owned()]));
        // two bytes past the first element: the next one cannot fit
        let mut overlong = vec![9, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0, 0];
        overlong.extend_from_slice(&[0; 8]);
        assert!(decode_le(&overlong, "as").is_err());
        Ok(())
    }

    #[test]
    fn arrays_count_towards_depth() -> Result<()> {
        let empty = [0u8, 0, 0, 0];
        for sig in ["ai", "as"] {
            let ty = Type::parse(sig)?;
            let mut r = Reader::<LE>::new(&empty, 0, Endianness::Little);
            assert!(matches!(r.read_value(&ty, 1), Err(Error::NestingExceeded)));
            let mut r = Reader::<LE>::new(&empty, 0, Endianness::Little);
            assert_eq!(r.read_value(&ty, 2)?.n_children(), 0);
        }
        let ty = Type::parse("aai")?;
        let mut r = Reader::<LE>::new(&empty, 0, Endianness::Little);
        assert!(matches!(r.read_value(&ty, 2), Err(Error::NestingExceeded)));
        Ok(())
    }

    #[test]
    fn rejects_bad_booleans() {
        assert!(decode_le(&[2, 0, 0, 0], "b").is_err());
    }
}
