use crate::error::{Error, Result};
use crate::message::Message;
use crate::names::ObjectPath;
use crate::signature::{Signature, Type};
use crate::value::Value;

use serde::{ser, Serialize};

pub mod serializer_policy;

use serializer_policy::{DefaultSerializerPolicy, SerializerPolicy, StructSerializationStyle};

/// Newtype names that make [`ObjectPath`] and [`Signature`] come out as
/// `o` and `g` rather than plain strings.
pub(crate) const OBJECT_PATH_TOKEN: &str = "dbus_core::ObjectPath";
pub(crate) const SIGNATURE_TOKEN: &str = "dbus_core::Signature";

/// This is the entry point to the serializer. The default
/// serialization policy, [`DefaultSerializerPolicy`]
/// serializes tuples and tuple structs in "struct" style,
/// e.g. a tuple with two `i32`s and a `String` would serialize
/// as `(iis)`. Structs with named fields are serialized in dictionary
/// style, as `a{sv}` where the keys of the dictionary are the names
/// of the fields, and the values are the values of those fields,
/// wrapped in variants, which is DBus's mechanism for type erasure.
///
/// Instead, to always use struct-style serialization,
/// you can use [`StronglyTypedSerializerPolicy`].
///
/// To make these decisions on a struct-by-struct basis, you can
/// create a custom implementation of the [`SerializerPolicy`] trait.
///
/// Sequences whose elements all have the same type become typed arrays;
/// empty or mixed sequences become `av`.
///
/// [`DefaultSerializerPolicy`]: serializer_policy::DefaultSerializerPolicy
/// [`StronglyTypedSerializerPolicy`]: serializer_policy::StronglyTypedSerializerPolicy
/// [`SerializerPolicy`]: serializer_policy::SerializerPolicy
pub fn to_value_with_policy(value: impl Serialize, config: impl SerializerPolicy) -> Result<Value> {
    value.serialize(Serializer { config })
}

/// This is a convenience function that simply calls [`to_value_with_policy`]
/// with the default policy.
///
/// [`to_value_with_policy`]: to_value_with_policy
pub fn to_value(value: impl Serialize) -> Result<Value> {
    to_value_with_policy(value, DefaultSerializerPolicy)
}

/// Serializes `args` (usually a tuple) as the body of `message`. A value
/// that does not serialize to a struct becomes a one-element body.
pub fn set_body_from(message: &mut Message, args: impl Serialize) -> Result<()> {
    let body = match to_value(args)? {
        body @ Value::Struct(_) => body,
        other => Value::tuple(vec![other]),
    };
    message.set_body(Some(body))
}

fn is_unit(value: &Value) -> bool {
    matches!(value, Value::Struct(fields) if fields.is_empty())
}

fn variant_dict(name: &str, value: Value) -> Value {
    Value::vardict(vec![(name, value)])
}

fn finish_seq(items: Vec<Value>) -> Result<Value> {
    let homogeneous = match items.split_first() {
        Some((first, rest)) => {
            let ty = first.type_();
            if rest.iter().all(|item| item.type_() == ty) {
                Some(ty)
            } else {
                None
            }
        }
        None => None,
    };
    match homogeneous {
        Some(ty) => Value::array(ty, items),
        None => Value::array(
            Type::Variant,
            items.into_iter().map(Value::variant).collect(),
        ),
    }
}

struct Serializer<T: SerializerPolicy> {
    config: T,
}

impl<C: SerializerPolicy> ser::Serializer for Serializer<C> {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = SerializeSeq<C>;
    type SerializeTuple = SerializeTuple<C>;
    type SerializeTupleStruct = SerializeTuple<C>;
    type SerializeTupleVariant = SerializeTupleVariant<C>;
    type SerializeMap = SerializeMap<C>;
    type SerializeStruct = SerializeStruct<C>;
    type SerializeStructVariant = SerializeStructVariant<C>;

    fn serialize_bool(self, val: bool) -> Result<Value> {
        Ok(Value::Boolean(val))
    }

    fn serialize_i8(self, val: i8) -> Result<Value> {
        Ok(Value::Int16(val as i16))
    }

    fn serialize_i16(self, val: i16) -> Result<Value> {
        Ok(Value::Int16(val))
    }

    fn serialize_i32(self, val: i32) -> Result<Value> {
        Ok(Value::Int32(val))
    }

    fn serialize_i64(self, val: i64) -> Result<Value> {
        Ok(Value::Int64(val))
    }

    fn serialize_u8(self, val: u8) -> Result<Value> {
        Ok(Value::Byte(val))
    }

    fn serialize_u16(self, val: u16) -> Result<Value> {
        Ok(Value::UInt16(val))
    }

    fn serialize_u32(self, val: u32) -> Result<Value> {
        Ok(Value::UInt32(val))
    }

    fn serialize_u64(self, val: u64) -> Result<Value> {
        Ok(Value::UInt64(val))
    }

    fn serialize_f32(self, val: f32) -> Result<Value> {
        Ok(Value::Double(val as f64))
    }

    fn serialize_f64(self, val: f64) -> Result<Value> {
        Ok(Value::Double(val))
    }

    fn serialize_char(self, val: char) -> Result<Value> {
        Ok(Value::UInt32(val as u32))
    }

    fn serialize_str(self, val: &str) -> Result<Value> {
        Ok(Value::String(val.to_owned()))
    }

    fn serialize_bytes(self, val: &[u8]) -> Result<Value> {
        Value::array(Type::Byte, val.iter().map(|b| Value::Byte(*b)).collect())
    }

    fn serialize_none(self) -> Result<Value> {
        self.serialize_unit()
    }

    fn serialize_some<T>(self, val: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        val.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value> {
        Ok(Value::tuple(vec![]))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<Value> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        variant_index: u32,
        _: &'static str,
    ) -> Result<Value> {
        variant_index.serialize(self)
    }

    fn serialize_newtype_struct<T>(self, name: &'static str, value: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let inner = value.serialize(self)?;
        match (name, inner) {
            (OBJECT_PATH_TOKEN, Value::String(s)) => Ok(Value::ObjectPath(ObjectPath::new(&s)?)),
            (SIGNATURE_TOKEN, Value::String(s)) => Ok(Value::Signature(Signature::new(&s)?)),
            (_, inner) => Ok(inner),
        }
    }

    fn serialize_newtype_variant<T>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(self)?;
        Ok(variant_dict(variant, item))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(SerializeSeq {
            items: Vec::with_capacity(len.unwrap_or(0)),
            config: self.config,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        Ok(SerializeTuple {
            fields: Vec::with_capacity(len),
            config: self.config,
        })
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_tuple(len)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            fields: Vec::with_capacity(len),
            name: variant,
            config: self.config,
        })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(SerializeMap {
            entries: Vec::new(),
            pending_key: None,
            config: self.config,
        })
    }

    fn serialize_struct(self, name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        let internal = match self.config.query_struct_name(name) {
            StructSerializationStyle::Dict => SerializeStructInternal::Dict(Vec::new()),
            StructSerializationStyle::StronglyTyped => {
                SerializeStructInternal::Struct(Vec::with_capacity(len))
            }
        };

        Ok(SerializeStruct {
            internal,
            config: self.config,
        })
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Ok(SerializeStructVariant {
            fields: Vec::new(),
            name: variant,
            config: self.config,
        })
    }
}

struct SerializeSeq<T: SerializerPolicy> {
    items: Vec<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeSeq for SerializeSeq<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.items.push(item);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        finish_seq(self.items)
    }
}

struct SerializeTuple<T: SerializerPolicy> {
    fields: Vec<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeTuple for SerializeTuple<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.fields.push(item);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(Value::tuple(self.fields))
    }
}

impl<C: SerializerPolicy> ser::SerializeTupleStruct for SerializeTuple<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        ser::SerializeTuple::serialize_element(self, value)
    }

    fn end(self) -> Result<Value> {
        ser::SerializeTuple::end(self)
    }
}

struct SerializeTupleVariant<T: SerializerPolicy> {
    fields: Vec<Value>,
    name: &'static str,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeTupleVariant for SerializeTupleVariant<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.fields.push(item);
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(variant_dict(self.name, Value::tuple(self.fields)))
    }
}

struct SerializeMap<T: SerializerPolicy> {
    entries: Vec<(Value, Value)>,
    pending_key: Option<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeMap for SerializeMap<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        if !key.type_().is_basic() {
            return Err(Error::Serializing(format!(
                "Dictionary keys must be basic types, not `{}`",
                key.type_string()
            )));
        }
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| Error::Serializing("Map value without a key".to_owned()))?;
        let value = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        self.entries.push((key, Value::variant(value)));
        Ok(())
    }

    fn end(self) -> Result<Value> {
        let key_type = self
            .entries
            .first()
            .map(|(k, _)| k.type_())
            .unwrap_or(Type::String);
        Value::dict(key_type, Type::Variant, self.entries)
            .map_err(|e| Error::Serializing(e.to_string()))
    }
}

enum SerializeStructInternal {
    Dict(Vec<(&'static str, Value)>),
    Struct(Vec<Value>),
}

struct SerializeStruct<T: SerializerPolicy> {
    internal: SerializeStructInternal,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStruct for SerializeStruct<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        match &mut self.internal {
            // Absent optional fields are left out of the dictionary.
            SerializeStructInternal::Dict(_) if is_unit(&item) => {}
            SerializeStructInternal::Dict(entries) => entries.push((name, item)),
            SerializeStructInternal::Struct(fields) => fields.push(item),
        }
        Ok(())
    }

    fn end(self) -> Result<Value> {
        match self.internal {
            SerializeStructInternal::Dict(entries) => Ok(Value::vardict(entries)),
            SerializeStructInternal::Struct(fields) => Ok(Value::tuple(fields)),
        }
    }
}

struct SerializeStructVariant<T: SerializerPolicy> {
    fields: Vec<(&'static str, Value)>,
    name: &'static str,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStructVariant for SerializeStructVariant<C> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(Serializer {
            config: self.config.clone(),
        })?;
        if !is_unit(&item) {
            self.fields.push((name, item));
        }
        Ok(())
    }

    fn end(self) -> Result<Value> {
        Ok(variant_dict(self.name, Value::vardict(self.fields)))
    }
}
