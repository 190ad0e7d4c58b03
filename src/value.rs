//! The typed value model carried in message bodies and headers.
//!
//! [`Value`] is a closed sum type mirroring the D-Bus type system. Values
//! are always held in host byte order; the codec converts at the wire
//! boundary.

use crate::codec::Endianness;
use crate::error::{Error, Result};
use crate::names::ObjectPath;
use crate::signature::{Signature, Type};

use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};

/// A homogeneous array. The element type is kept so that empty arrays
/// still know their signature.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    element_type: Type,
    items: Vec<Value>,
}

impl Array {
    pub fn element_type(&self) -> &Type {
        &self.element_type
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Index into the file descriptor list attached to the message.
    Handle(i32),
    Array(Array),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// Builds an array, checking that every item has `element_type`.
    pub fn array(element_type: Type, items: Vec<Value>) -> Result<Value> {
        if let Type::DictEntry(key, _) = &element_type {
            if !key.is_basic() {
                return Err(Error::invalid("Dict entry key must be a basic type"));
            }
        }
        for item in &items {
            let ty = item.type_();
            if ty != element_type {
                return Err(Error::invalid(format!(
                    "Array of `{}` cannot hold a value of type `{}`",
                    element_type, ty
                )));
            }
        }
        Ok(Value::Array(Array {
            element_type,
            items,
        }))
    }

    /// Array whose element type is taken from the first item.
    pub fn array_from(items: Vec<Value>) -> Result<Value> {
        let element_type = match items.first() {
            Some(first) => first.type_(),
            None => return Err(Error::invalid("Cannot infer the type of an empty array")),
        };
        Value::array(element_type, items)
    }

    pub(crate) fn array_unchecked(element_type: Type, items: Vec<Value>) -> Value {
        Value::Array(Array {
            element_type,
            items,
        })
    }

    /// Builds `a{KV}` from key/value pairs.
    pub fn dict<I>(key_type: Type, value_type: Type, entries: I) -> Result<Value>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let items = entries
            .into_iter()
            .map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v)))
            .collect();
        Value::array(
            Type::DictEntry(Box::new(key_type), Box::new(value_type)),
            items,
        )
    }

    /// Builds the ubiquitous `a{sv}`, wrapping each value in a variant.
    pub fn vardict<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let items = entries
            .into_iter()
            .map(|(k, v)| {
                Value::DictEntry(
                    Box::new(Value::String(k.into())),
                    Box::new(Value::Variant(Box::new(v))),
                )
            })
            .collect();
        Value::array_unchecked(vardict_entry_type(), items)
    }

    pub fn variant(inner: Value) -> Value {
        Value::Variant(Box::new(inner))
    }

    /// A struct value. Message bodies use this with any number of fields,
    /// including none.
    pub fn tuple(fields: Vec<Value>) -> Value {
        Value::Struct(fields)
    }

    pub fn object_path(path: &str) -> Result<Value> {
        Ok(Value::ObjectPath(ObjectPath::new(path)?))
    }

    pub fn signature(sig: &str) -> Result<Value> {
        Ok(Value::Signature(Signature::new(sig)?))
    }

    /// The type of this value. Empty structs only occur as message bodies;
    /// they report `Type::Struct(vec![])`, which prints as `()`.
    pub fn type_(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Handle(_) => Type::Handle,
            Value::Array(a) => Type::Array(Box::new(a.element_type.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::type_).collect()),
            Value::DictEntry(k, v) => Type::DictEntry(Box::new(k.type_()), Box::new(v.type_())),
            Value::Variant(_) => Type::Variant,
        }
    }

    /// The type string of this value, e.g. `(si)`.
    pub fn type_string(&self) -> String {
        self.type_().to_string()
    }

    /// The type code of this value's outermost type.
    pub fn classify(&self) -> u8 {
        match self {
            Value::Byte(_) => b'y',
            Value::Boolean(_) => b'b',
            Value::Int16(_) => b'n',
            Value::UInt16(_) => b'q',
            Value::Int32(_) => b'i',
            Value::UInt32(_) => b'u',
            Value::Int64(_) => b'x',
            Value::UInt64(_) => b't',
            Value::Double(_) => b'd',
            Value::String(_) => b's',
            Value::ObjectPath(_) => b'o',
            Value::Signature(_) => b'g',
            Value::Handle(_) => b'h',
            Value::Array(_) => b'a',
            Value::Struct(_) => b'(',
            Value::DictEntry(_, _) => b'{',
            Value::Variant(_) => b'v',
        }
    }

    pub fn is_fixed_size(&self) -> bool {
        self.type_().fixed_size().is_some()
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Struct(_) | Value::DictEntry(_, _) | Value::Variant(_)
        )
    }

    /// Nesting depth, counting each container and the leaf. Unlike
    /// [`Type::depth`] this looks inside variants.
    pub fn depth(&self) -> usize {
        match self {
            Value::Variant(inner) => 1 + inner.depth(),
            Value::Array(a) => {
                1 + a
                    .items
                    .iter()
                    .map(Value::depth)
                    .max()
                    .unwrap_or_else(|| a.element_type.depth())
            }
            Value::Struct(fields) => 1 + fields.iter().map(Value::depth).max().unwrap_or(0),
            Value::DictEntry(k, v) => 1 + k.depth().max(v.depth()),
            _ => 1,
        }
    }

    pub fn n_children(&self) -> usize {
        match self {
            Value::Array(a) => a.items.len(),
            Value::Struct(fields) => fields.len(),
            Value::DictEntry(_, _) => 2,
            Value::Variant(_) => 1,
            _ => 0,
        }
    }

    pub fn child(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(a) => a.items.get(index),
            Value::Struct(fields) => fields.get(index),
            Value::DictEntry(k, _) if index == 0 => Some(k),
            Value::DictEntry(_, v) if index == 1 => Some(v),
            Value::Variant(inner) if index == 0 => Some(inner),
            _ => None,
        }
    }

    pub fn children(&self) -> Children<'_> {
        Children {
            value: self,
            index: 0,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<i32> {
        match self {
            Value::Handle(v) => Some(*v),
            _ => None,
        }
    }

    /// The text of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&ObjectPath> {
        match self {
            Value::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant(inner) => Some(inner),
            _ => None,
        }
    }

    /// Collects the string items of an `as` (or `ao`) array.
    pub fn as_str_vec(&self) -> Option<Vec<&str>> {
        self.as_array()?.items.iter().map(Value::as_str).collect()
    }

    /// Looks a key up in a dictionary array. For `a{?v}` dictionaries the
    /// variant wrapper is removed.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        let array = self.as_array()?;
        array.items.iter().find_map(|entry| match entry {
            Value::DictEntry(k, v) if k.as_str() == Some(key) => match &**v {
                Value::Variant(inner) => Some(&**inner),
                other => Some(other),
            },
            _ => None,
        })
    }

    /// Iterates `(key, value)` pairs of an `a{sv}`, unwrapping the
    /// variants. Entries of any other shape are skipped.
    pub fn vardict_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.as_array()
            .map(|a| a.items.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|entry| match entry {
                Value::DictEntry(k, v) => match (k.as_str(), &**v) {
                    (Some(k), Value::Variant(inner)) => Some((k, &**inner)),
                    _ => None,
                },
                _ => None,
            })
    }

    /// Converts an `a{sv}` into an owned map.
    pub fn to_vardict(&self) -> BTreeMap<String, Value> {
        self.vardict_entries()
            .map(|(k, v)| (k.to_owned(), v.clone()))
            .collect()
    }

    /// Reverses the byte order of every numeric leaf. Booleans, strings
    /// and the structure itself are unchanged.
    pub fn byteswap(&self) -> Value {
        match self {
            Value::Int16(v) => Value::Int16(v.swap_bytes()),
            Value::UInt16(v) => Value::UInt16(v.swap_bytes()),
            Value::Int32(v) => Value::Int32(v.swap_bytes()),
            Value::UInt32(v) => Value::UInt32(v.swap_bytes()),
            Value::Int64(v) => Value::Int64(v.swap_bytes()),
            Value::UInt64(v) => Value::UInt64(v.swap_bytes()),
            Value::Double(v) => Value::Double(f64::from_bits(v.to_bits().swap_bytes())),
            Value::Handle(v) => Value::Handle(v.swap_bytes()),
            Value::Array(a) => Value::Array(Array {
                element_type: a.element_type.clone(),
                items: a.items.iter().map(Value::byteswap).collect(),
            }),
            Value::Struct(fields) => Value::Struct(fields.iter().map(Value::byteswap).collect()),
            Value::DictEntry(k, v) => {
                Value::DictEntry(Box::new(k.byteswap()), Box::new(v.byteswap()))
            }
            Value::Variant(inner) => Value::Variant(Box::new(inner.byteswap())),
            other => other.clone(),
        }
    }

    /// Brings a value decoded in `from` byte order into host order.
    pub fn normalize(self, from: Endianness) -> Value {
        if from == Endianness::native() {
            self
        } else {
            self.byteswap()
        }
    }

    /// Renders the value in GVariant text format. With `annotate`, types
    /// that would otherwise be ambiguous carry a type prefix.
    pub fn print(&self, annotate: bool) -> String {
        let mut out = String::new();
        self.print_into(&mut out, annotate);
        out
    }

    fn print_into(&self, out: &mut String, annotate: bool) {
        let _ = match self {
            Value::Byte(v) if annotate => write!(out, "byte 0x{:02x}", v),
            Value::Byte(v) => write!(out, "0x{:02x}", v),
            Value::Boolean(v) => write!(out, "{}", v),
            Value::Int16(v) if annotate => write!(out, "int16 {}", v),
            Value::UInt16(v) if annotate => write!(out, "uint16 {}", v),
            Value::UInt32(v) if annotate => write!(out, "uint32 {}", v),
            Value::Int64(v) if annotate => write!(out, "int64 {}", v),
            Value::UInt64(v) if annotate => write!(out, "uint64 {}", v),
            Value::Handle(v) if annotate => write!(out, "handle {}", v),
            Value::Int16(v) => write!(out, "{}", v),
            Value::UInt16(v) => write!(out, "{}", v),
            Value::Int32(v) => write!(out, "{}", v),
            Value::UInt32(v) => write!(out, "{}", v),
            Value::Int64(v) => write!(out, "{}", v),
            Value::UInt64(v) => write!(out, "{}", v),
            Value::Handle(v) => write!(out, "{}", v),
            Value::Double(v) if v.fract() == 0.0 && v.is_finite() => write!(out, "{:.1}", v),
            Value::Double(v) => write!(out, "{}", v),
            Value::String(s) => write_quoted(out, s),
            Value::ObjectPath(p) => {
                out.push_str("objectpath ");
                write_quoted(out, p.as_str())
            }
            Value::Signature(s) => {
                out.push_str("signature ");
                write_quoted(out, s.as_str())
            }
            Value::Array(a) => {
                let is_dict = matches!(a.element_type, Type::DictEntry(_, _));
                if a.items.is_empty() {
                    if annotate {
                        let _ = write!(out, "@a{} ", a.element_type);
                    }
                    out.push_str(if is_dict { "{}" } else { "[]" });
                    return;
                }
                out.push(if is_dict { '{' } else { '[' });
                for (i, item) in a.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match item {
                        Value::DictEntry(k, v) => {
                            k.print_into(out, annotate && i == 0);
                            out.push_str(": ");
                            v.print_into(out, annotate && i == 0);
                        }
                        other => other.print_into(out, annotate && i == 0),
                    }
                }
                out.push(if is_dict { '}' } else { ']' });
                Ok(())
            }
            Value::Struct(fields) => {
                out.push('(');
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    field.print_into(out, annotate);
                }
                if fields.len() == 1 {
                    out.push(',');
                }
                out.push(')');
                Ok(())
            }
            Value::DictEntry(k, v) => {
                out.push_str("{");
                k.print_into(out, annotate);
                out.push_str(", ");
                v.print_into(out, annotate);
                out.push('}');
                Ok(())
            }
            Value::Variant(inner) => {
                out.push('<');
                inner.print_into(out, annotate);
                out.push('>');
                Ok(())
            }
        };
    }
}

fn write_quoted(out: &mut String, s: &str) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    Ok(())
}

/// `{sv}`, the element of a vardict.
fn vardict_entry_type() -> Type {
    Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant))
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print(false))
    }
}

pub struct Children<'a> {
    value: &'a Value,
    index: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        let child = self.value.child(self.index)?;
        self.index += 1;
        Some(child)
    }
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(v: $type) -> Value {
                Value::$variant(v)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Boolean);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, String);
value_from!(ObjectPath, ObjectPath);
value_from!(Signature, Signature);

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        Value::array_unchecked(Type::String, v.into_iter().map(Value::String).collect())
    }
}
