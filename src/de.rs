use crate::error::{Error, Result};
use crate::message::Message;
use crate::signature::Type;
use crate::value::Value;

use serde::de::{
    self, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess, VariantAccess,
    Visitor,
};
use serde::Deserialize;

/// Deserializes a `T` out of a [`Value`]. Variants are unwrapped wherever
/// they appear, so `a{sv}` dictionaries map naturally onto structs.
pub fn from_value<'a, T: Deserialize<'a>>(value: &'a Value) -> Result<T> {
    T::deserialize(Deserializer::new(value))
}

/// Deserializes the body of `mesg` as a tuple. A message without a body
/// deserializes as `()`.
pub fn from_message<'a, T: Deserialize<'a>>(mesg: &'a Message) -> Result<T> {
    match mesg.body() {
        Some(body) => from_value(body),
        None => from_value(&EMPTY_BODY),
    }
}

static EMPTY_BODY: Value = Value::Struct(Vec::new());

#[derive(Copy, Clone)]
struct Deserializer<'de> {
    value: &'de Value,
}

impl<'de> Deserializer<'de> {
    fn new(value: &'de Value) -> Self {
        Deserializer { value }
    }

    /// Sees through any number of variant wrappers.
    fn possible_variant(self) -> Self {
        let mut value = self.value;
        while let Value::Variant(inner) = value {
            value = &**inner;
        }
        Deserializer { value }
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::Deserializing(format!(
            "expected {}, found value of type `{}`",
            expected,
            self.value.type_string()
        ))
    }
}

impl<'de> de::Deserializer<'de> for Deserializer<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Byte(v) => visitor.visit_u8(*v),
            Value::Boolean(v) => visitor.visit_bool(*v),
            Value::Int16(v) => visitor.visit_i16(*v),
            Value::UInt16(v) => visitor.visit_u16(*v),
            Value::Int32(v) => visitor.visit_i32(*v),
            Value::UInt32(v) => visitor.visit_u32(*v),
            Value::Int64(v) => visitor.visit_i64(*v),
            Value::UInt64(v) => visitor.visit_u64(*v),
            Value::Double(v) => visitor.visit_f64(*v),
            Value::Handle(v) => visitor.visit_i32(*v),
            Value::String(s) => visitor.visit_borrowed_str(s),
            Value::ObjectPath(p) => visitor.visit_borrowed_str(p.as_str()),
            Value::Signature(s) => visitor.visit_borrowed_str(s.as_str()),
            Value::Array(a) => match a.element_type() {
                Type::DictEntry(_, _) => visitor.visit_map(ArrayDeserializer::new(a.items())),
                _ => visitor.visit_seq(ArrayDeserializer::new(a.items())),
            },
            Value::Struct(fields) if fields.is_empty() => visitor.visit_unit(),
            Value::Struct(fields) => visitor.visit_seq(ArrayDeserializer::new(fields)),
            Value::DictEntry(k, v) => {
                visitor.visit_seq(PairDeserializer {
                    items: [&**k, &**v],
                    ix: 0,
                })
            }
            Value::Variant(_) => Err(de.unexpected("a value")),
        }
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::UInt32(v) => match char::from_u32(*v) {
                Some(c) => visitor.visit_char(c),
                None => Err(Error::Deserializing(format!("{} is not a valid char", v))),
            },
            _ => de::Deserializer::deserialize_any(de, visitor),
        }
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Array(a) => {
                let bytes = a
                    .items()
                    .iter()
                    .map(Value::as_u8)
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| de.unexpected("a byte array"))?;
                visitor.visit_byte_buf(bytes)
            }
            Value::String(s) => visitor.visit_borrowed_bytes(s.as_bytes()),
            _ => Err(de.unexpected("a byte array")),
        }
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_bytes(self, visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Struct(fields) if fields.is_empty() => visitor.visit_none(),
            _ => visitor.visit_some(de),
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Struct(fields) if fields.is_empty() => visitor.visit_unit(),
            _ => Err(de.unexpected("()")),
        }
    }

    fn deserialize_unit_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_unit(self, visitor)
    }

    fn deserialize_newtype_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Array(a) => visitor.visit_seq(ArrayDeserializer::new(a.items())),
            Value::Struct(fields) => visitor.visit_seq(ArrayDeserializer::new(fields)),
            _ => Err(de.unexpected("an array or struct")),
        }
    }

    fn deserialize_tuple<V>(self, _: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_seq(self, visitor)
    }

    fn deserialize_tuple_struct<V>(self, _: &'static str, sz: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_tuple(self, sz, visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Array(a) => visitor.visit_map(ArrayDeserializer::new(a.items())),
            _ => Err(de.unexpected("a dictionary")),
        }
    }

    fn deserialize_struct<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Struct(fields) => visitor.visit_seq(ArrayDeserializer::new(fields)),
            Value::Array(a) => visitor.visit_map(ArrayDeserializer::new(a.items())),
            _ => Err(de.unexpected("a struct or dictionary")),
        }
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.value {
            Value::Array(a) if a.len() == 1 => match &a.items()[0] {
                Value::DictEntry(k, v) => visitor.visit_enum(EnumDeserializer {
                    tag: Deserializer::new(&**k),
                    content: Some(Deserializer::new(&**v)),
                }),
                _ => Err(de.unexpected("an enum")),
            },
            Value::UInt32(_) | Value::String(_) => visitor.visit_enum(EnumDeserializer {
                tag: de,
                content: None,
            }),
            _ => Err(de.unexpected("an enum")),
        }
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 u8 u16 u32 u64 f32 f64 str string identifier ignored_any
    }
}

/// Walks the items of an array or the fields of a struct. Dict entries
/// are split into key and value when accessed as a map.
struct ArrayDeserializer<'de> {
    items: std::slice::Iter<'de, Value>,
    pending_value: Option<&'de Value>,
}

impl<'de> ArrayDeserializer<'de> {
    fn new(items: &'de [Value]) -> Self {
        ArrayDeserializer {
            items: items.iter(),
            pending_value: None,
        }
    }
}

impl<'de> SeqAccess<'de> for ArrayDeserializer<'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        match self.items.next() {
            Some(item) => Ok(Some(seed.deserialize(Deserializer::new(item))?)),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

impl<'de> MapAccess<'de> for ArrayDeserializer<'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        match self.items.next() {
            Some(Value::DictEntry(k, v)) => {
                self.pending_value = Some(&**v);
                Ok(Some(seed.deserialize(Deserializer::new(&**k))?))
            }
            Some(other) => Err(Deserializer::new(other).unexpected("a dictionary entry")),
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        match self.pending_value.take() {
            Some(value) => seed.deserialize(Deserializer::new(value)),
            None => Err(Error::Deserializing(
                "dictionary value requested before its key".to_owned(),
            )),
        }
    }
}

struct PairDeserializer<'de> {
    items: [&'de Value; 2],
    ix: usize,
}

impl<'de> SeqAccess<'de> for PairDeserializer<'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        match self.items.get(self.ix).copied() {
            Some(item) => {
                self.ix += 1;
                Ok(Some(seed.deserialize(Deserializer::new(item))?))
            }
            None => Ok(None),
        }
    }
}

struct EnumDeserializer<'de> {
    tag: Deserializer<'de>,
    content: Option<Deserializer<'de>>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer<'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: DeserializeSeed<'de>,
    {
        // Unit variants are written as their index.
        let tag = match self.tag.value {
            Value::UInt32(ix) => {
                seed.deserialize(IntoDeserializer::<'de, Error>::into_deserializer(*ix))?
            }
            _ => seed.deserialize(self.tag)?,
        };
        Ok((tag, self))
    }
}

impl<'de> VariantAccess<'de> for EnumDeserializer<'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        match self.content {
            Some(de) => seed.deserialize(de),
            None => Err(Error::Deserializing("missing enum content".to_owned())),
        }
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.content {
            Some(de) => de::Deserializer::deserialize_seq(de, visitor),
            None => Err(Error::Deserializing("missing enum content".to_owned())),
        }
    }

    fn struct_variant<V>(self, fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.content {
            Some(de) => de::Deserializer::deserialize_struct(de, "", fields, visitor),
            None => Err(Error::Deserializing("missing enum content".to_owned())),
        }
    }
}
