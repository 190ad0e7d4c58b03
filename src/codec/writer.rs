use crate::align::align;
use crate::codec::MAX_ARRAY_LEN;
use crate::error::{Error, Result};
use crate::primitives::Primitive;
use crate::value::Value;

use byteorder::ByteOrder;
use log::trace;
use std::marker::PhantomData;

/// Position of a `u32` length to be backfilled once the data it measures
/// has been written. The measured range starts after the padding that
/// follows the length.
pub(super) struct LengthToken {
    fill_ix: usize,
    begin_ix: usize,
}

pub(super) struct Writer<B: ByteOrder> {
    buf: Vec<u8>,
    phantom: PhantomData<B>,
}

impl<B: ByteOrder> Writer<B> {
    pub(super) fn new() -> Self {
        Self {
            buf: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(super) fn complete(self) -> Vec<u8> {
        self.buf
    }

    pub(super) fn align(&mut self, alignment: usize) {
        let new_len = align(self.buf.len(), alignment);
        self.buf.resize(new_len, 0);
    }

    pub(super) fn put<P: Primitive>(&mut self, value: P) {
        self.align(P::ALIGNMENT);
        let start = self.buf.len();
        self.buf.resize(start + P::SIZE, 0);
        value.put::<B>(&mut self.buf[start..]);
    }

    pub(super) fn put_u32_at(&mut self, ix: usize, value: u32) {
        B::write_u32(&mut self.buf[ix..ix + 4], value);
    }

    pub(super) fn put_string(&mut self, s: &str) {
        self.put(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub(super) fn put_signature(&mut self, s: &str) -> Result<()> {
        let len = u8::try_from(s.len())
            .map_err(|_| Error::invalid(format!("Signature `{}` is too long", s)))?;
        self.buf.push(len);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub(super) fn start_length(&mut self, element_alignment: usize) -> LengthToken {
        self.align(4);
        let fill_ix = self.buf.len();
        self.buf.extend_from_slice(&[0u8; 4]);
        // Empty arrays still carry the element padding; it is not counted.
        self.align(element_alignment);
        LengthToken {
            fill_ix,
            begin_ix: self.buf.len(),
        }
    }

    pub(super) fn finish_length(&mut self, token: LengthToken) -> Result<()> {
        let length = self.buf.len() - token.begin_ix;
        if length > MAX_ARRAY_LEN {
            return Err(Error::invalid(format!(
                "Array of {} bytes exceeds the maximum of {}",
                length, MAX_ARRAY_LEN
            )));
        }
        self.put_u32_at(token.fill_ix, length as u32);
        Ok(())
    }

    pub(super) fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.put(*v),
            Value::Boolean(v) => self.put(*v as u32),
            Value::Int16(v) => self.put(*v),
            Value::UInt16(v) => self.put(*v),
            Value::Int32(v) => self.put(*v),
            Value::UInt32(v) => self.put(*v),
            Value::Int64(v) => self.put(*v),
            Value::UInt64(v) => self.put(*v),
            Value::Double(v) => self.put(*v),
            Value::Handle(v) => self.put(*v),
            Value::String(s) => self.put_string(s),
            Value::ObjectPath(p) => self.put_string(p.as_str()),
            Value::Signature(s) => self.put_signature(s.as_str())?,
            Value::Array(a) => {
                let token = self.start_length(a.element_type().alignment());
                for item in a.items() {
                    self.write_value(item)?;
                }
                self.finish_length(token)?;
            }
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::DictEntry(k, v) => {
                self.align(8);
                self.write_value(k)?;
                self.write_value(v)?;
            }
            Value::Variant(inner) => {
                let sig = inner.type_string();
                trace!("variant of `{}` at {}", sig, self.buf.len());
                self.put_signature(&sig)?;
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}
