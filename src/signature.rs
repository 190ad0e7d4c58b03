use crate::error::{Error, Result};

use std::fmt::{self, Display, Write};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Containers allowed inside one complete type. A leaf value adds one
/// more level, for a total nesting depth of 65.
pub const MAX_CONTAINER_DEPTH: usize = 64;
pub const MAX_SIGNATURE_LEN: usize = 255;

pub(crate) const TY_BYTE: u8 = b'y';
pub(crate) const TY_BOOLEAN: u8 = b'b';
pub(crate) const TY_INT16: u8 = b'n';
pub(crate) const TY_UINT16: u8 = b'q';
pub(crate) const TY_INT32: u8 = b'i';
pub(crate) const TY_UINT32: u8 = b'u';
pub(crate) const TY_INT64: u8 = b'x';
pub(crate) const TY_UINT64: u8 = b't';
pub(crate) const TY_DOUBLE: u8 = b'd';
pub(crate) const TY_STRING: u8 = b's';
pub(crate) const TY_OBJECT_PATH: u8 = b'o';
pub(crate) const TY_SIGNATURE: u8 = b'g';
pub(crate) const TY_UNIX_FD: u8 = b'h';
pub(crate) const TY_VARIANT: u8 = b'v';
pub(crate) const TY_ARRAY: u8 = b'a';

/// A single complete D-Bus type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Handle,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Parses exactly one complete type. Trailing characters are an error.
    pub fn parse(s: &str) -> Result<Type> {
        let (ty, rest) = Self::parse_prefix(s.as_bytes(), 0, false)?;
        if !rest.is_empty() {
            return Err(Error::invalid(format!(
                "`{}` is not a single complete type",
                s
            )));
        }
        Ok(ty)
    }

    /// Parses a sequence of zero or more complete types.
    pub fn parse_many(s: &str) -> Result<Vec<Type>> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(Error::invalid(format!(
                "Signature is {} bytes, longer than {}",
                s.len(),
                MAX_SIGNATURE_LEN
            )));
        }
        let mut rest = s.as_bytes();
        let mut types = Vec::new();
        while !rest.is_empty() {
            let (ty, r) = Self::parse_prefix(rest, 0, false)?;
            types.push(ty);
            rest = r;
        }
        Ok(types)
    }

    fn parse_prefix(s: &[u8], depth: usize, in_array: bool) -> Result<(Type, &[u8])> {
        let (first, mut s) = match s.split_first() {
            Some((first, rest)) => (*first, rest),
            None => return Err(Error::invalid("Incomplete type in signature")),
        };
        let ty = match first {
            TY_BYTE => Type::Byte,
            TY_BOOLEAN => Type::Boolean,
            TY_INT16 => Type::Int16,
            TY_UINT16 => Type::UInt16,
            TY_INT32 => Type::Int32,
            TY_UINT32 => Type::UInt32,
            TY_INT64 => Type::Int64,
            TY_UINT64 => Type::UInt64,
            TY_DOUBLE => Type::Double,
            TY_STRING => Type::String,
            TY_OBJECT_PATH => Type::ObjectPath,
            TY_SIGNATURE => Type::Signature,
            TY_UNIX_FD => Type::Handle,
            TY_VARIANT => Type::Variant,
            TY_ARRAY | b'(' | b'{' if depth >= MAX_CONTAINER_DEPTH => {
                return Err(Error::NestingExceeded);
            }
            TY_ARRAY => {
                let (elem, rest) = Self::parse_prefix(s, depth + 1, true)?;
                s = rest;
                Type::Array(Box::new(elem))
            }
            b'{' => {
                if !in_array {
                    return Err(Error::invalid("Dict entry outside of an array"));
                }
                let (key, rest) = Self::parse_prefix(s, depth + 1, false)?;
                if !key.is_basic() {
                    return Err(Error::invalid(format!(
                        "Dict entry key `{}` is not a basic type",
                        key
                    )));
                }
                let (value, rest) = Self::parse_prefix(rest, depth + 1, false)?;
                match rest.split_first() {
                    Some((b'}', rest)) => s = rest,
                    _ => return Err(Error::invalid("Dict entry must have exactly two fields")),
                }
                Type::DictEntry(Box::new(key), Box::new(value))
            }
            b'(' => {
                let mut fields = Vec::new();
                loop {
                    match s.split_first() {
                        None => return Err(Error::invalid("Unterminated struct in signature")),
                        Some((b')', rest)) => {
                            s = rest;
                            break;
                        }
                        Some(_) => {
                            let (field, rest) = Self::parse_prefix(s, depth + 1, false)?;
                            fields.push(field);
                            s = rest;
                        }
                    }
                }
                if fields.is_empty() {
                    return Err(Error::invalid("Empty struct in signature"));
                }
                Type::Struct(fields)
            }
            other => {
                return Err(Error::invalid(format!(
                    "Unknown type code `{}` in signature",
                    other as char
                )))
            }
        };
        Ok((ty, s))
    }

    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte => 1,
            Type::Boolean => 4,
            Type::Int16 => 2,
            Type::UInt16 => 2,
            Type::Int32 => 4,
            Type::UInt32 => 4,
            Type::Int64 => 8,
            Type::UInt64 => 8,
            Type::Double => 8,
            Type::String => 4,
            Type::ObjectPath => 4,
            Type::Signature => 1,
            Type::Handle => 4,
            Type::Variant => 1,
            Type::Array(_) => 4,
            Type::Struct(_) => 8,
            Type::DictEntry(_, _) => 8,
        }
    }

    /// Wire width of the fixed-size types whose in-memory layout matches
    /// the wire. Booleans are excluded because they travel as 32 bits.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Type::Byte => Some(1),
            Type::Int16 | Type::UInt16 => Some(2),
            Type::Int32 | Type::UInt32 | Type::Handle => Some(4),
            Type::Int64 | Type::UInt64 | Type::Double => Some(8),
            _ => None,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(_, _)
        )
    }

    /// Nesting depth, counting each container and the leaf value.
    pub fn depth(&self) -> usize {
        match self {
            Type::Array(elem) => 1 + elem.depth(),
            Type::Struct(fields) => 1 + fields.iter().map(Type::depth).max().unwrap_or(0),
            Type::DictEntry(k, v) => 1 + k.depth().max(v.depth()),
            _ => 1,
        }
    }

    pub fn write_signature(&self, w: &mut String) {
        let c = match self {
            Type::Byte => TY_BYTE,
            Type::Boolean => TY_BOOLEAN,
            Type::Int16 => TY_INT16,
            Type::UInt16 => TY_UINT16,
            Type::Int32 => TY_INT32,
            Type::UInt32 => TY_UINT32,
            Type::Int64 => TY_INT64,
            Type::UInt64 => TY_UINT64,
            Type::Double => TY_DOUBLE,
            Type::String => TY_STRING,
            Type::ObjectPath => TY_OBJECT_PATH,
            Type::Signature => TY_SIGNATURE,
            Type::Handle => TY_UNIX_FD,
            Type::Variant => TY_VARIANT,
            Type::Array(elem) => {
                w.push(TY_ARRAY as char);
                elem.write_signature(w);
                return;
            }
            Type::DictEntry(k, v) => {
                w.push('{');
                k.write_signature(w);
                v.write_signature(w);
                w.push('}');
                return;
            }
            Type::Struct(fields) => {
                w.push('(');
                for f in fields {
                    f.write_signature(w);
                }
                w.push(')');
                return;
            }
        };
        w.push(c as char);
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write_signature(&mut s);
        f.write_str(&s)
    }
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(s: &str) -> Result<Type> {
        Type::parse(s)
    }
}

/// A validated signature: zero or more complete types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature {
    text: String,
    types: Vec<Type>,
}

impl Signature {
    pub fn new(text: &str) -> Result<Signature> {
        let types = Type::parse_many(text)?;
        Ok(Signature {
            text: text.to_owned(),
            types,
        })
    }

    pub fn from_types(types: Vec<Type>) -> Signature {
        let mut text = String::new();
        for ty in &types {
            ty.write_signature(&mut text);
        }
        Signature { text, types }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The signature as a single tuple type, as used for message bodies.
    /// `None` for the empty signature, since empty structs are not types.
    pub fn as_tuple(&self) -> Option<Type> {
        if self.types.is_empty() {
            None
        } else {
            Some(Type::Struct(self.types.clone()))
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Signature> {
        Signature::new(s)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(crate::ser::SIGNATURE_TOKEN, &self.text)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::new(&s).map_err(de::Error::custom)
    }
}

/// Renders the inner types of a tuple as a signature string, `()` for the
/// empty tuple.
pub(crate) fn tuple_signature(types: &[Type]) -> String {
    let mut s = String::new();
    s.push('(');
    for ty in types {
        let _ = write!(s, "{}", ty);
    }
    s.push(')');
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_single_types() -> Result<()> {
        assert_eq!(Type::parse("s")?, Type::String);
        assert_eq!(
            Type::parse("a{sv}")?,
            Type::Array(Box::new(Type::DictEntry(
                Box::new(Type::String),
                Box::new(Type::Variant)
            )))
        );
        assert_eq!(Type::parse("(sd(sd))")?.to_string(), "(sd(sd))");
        Ok(())
    }

    #[test]
    fn rejects_incomplete_or_multiple() {
        assert!(Type::parse("").is_err());
        assert!(Type::parse("a").is_err());
        assert!(Type::parse("si").is_err());
        assert!(Type::parse("(si").is_err());
        assert!(Type::parse("()").is_err());
        assert!(Type::parse("z").is_err());
    }

    #[test]
    fn dict_entry_rules() {
        assert!(Type::parse("{sv}").is_err());
        assert!(Type::parse("a{vs}").is_err());
        assert!(Type::parse("a{sss}").is_err());
        assert!(Type::parse("a{oa{sa{sv}}}").is_ok());
    }

    #[test]
    fn nesting_limit() {
        let ok = format!("{}y", "a".repeat(MAX_CONTAINER_DEPTH));
        assert_eq!(Type::parse(&ok).map(|t| t.depth()).ok(), Some(65));
        let too_deep = format!("{}y", "a".repeat(MAX_CONTAINER_DEPTH + 1));
        let err = Type::parse(&too_deep).err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn signatures() -> Result<()> {
        let sig = Signature::new("sa{sv}as")?;
        assert_eq!(sig.types().len(), 3);
        assert_eq!(sig.as_tuple().map(|t| t.to_string()), Some("(sa{sv}as)".into()));
        assert!(Signature::new("")?.is_empty());
        assert!(Signature::new(&"y".repeat(256)).is_err());
        assert_eq!(tuple_signature(&[]), "()");
        Ok(())
    }

    #[test]
    fn fixed_sizes() {
        assert_eq!(Type::Boolean.fixed_size(), None);
        assert_eq!(Type::Handle.fixed_size(), Some(4));
        assert_eq!(Type::Double.fixed_size(), Some(8));
        assert_eq!(Type::String.fixed_size(), None);
    }
}
