//! Lexical checks for the names that appear in message headers.

use crate::error::{Error, Result};

use std::borrow::Borrow;
use std::convert::TryFrom;
use std::fmt::{self, Display};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const MAX_NAME_LEN: usize = 255;

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// `/`, or `/`-separated non-empty elements of `[A-Za-z0-9_]`, with no
/// trailing slash.
pub fn is_object_path(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'/') {
        return false;
    }
    if bytes.len() == 1 {
        return true;
    }
    bytes[1..]
        .split(|c| *c == b'/')
        .all(|elem| !elem.is_empty() && elem.iter().all(|c| is_ident_char(*c)))
}

/// A valid bus name, unique (`:1.42`) or well-known (`com.example.Svc`).
pub fn is_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    let (unique, body) = match bytes[0] {
        b':' => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    let mut elements = 0;
    for elem in body.split(|c| *c == b'.') {
        if elem.is_empty() {
            return false;
        }
        if !unique && elem[0].is_ascii_digit() {
            return false;
        }
        if !elem.iter().all(|c| is_ident_char(*c) || *c == b'-') {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

pub fn is_unique_name(s: &str) -> bool {
    s.starts_with(':') && is_name(s)
}

pub fn is_member_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.split_first() {
        Some((first, rest)) => {
            bytes.len() <= MAX_NAME_LEN && is_ident_start(*first) && rest.iter().all(|c| is_ident_char(*c))
        }
        None => false,
    }
}

pub fn is_interface_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = 0;
    for elem in s.split('.') {
        if !is_member_name(elem) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

pub fn is_error_name(s: &str) -> bool {
    is_interface_name(s)
}

/// A string known to satisfy [`is_object_path`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: &str) -> Result<ObjectPath> {
        if is_object_path(path) {
            Ok(ObjectPath(path.to_owned()))
        } else {
            Err(Error::invalid(format!("`{}` is not a valid object path", path)))
        }
    }

    pub fn root() -> ObjectPath {
        ObjectPath("/".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` is `prefix` or lies below it.
    pub fn is_in_namespace(&self, prefix: &str) -> bool {
        prefix == "/"
            || self.0 == prefix
            || (self.0.starts_with(prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'/'))
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ObjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(path: &str) -> Result<ObjectPath> {
        ObjectPath::new(path)
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> String {
        path.0
    }
}

impl Serialize for ObjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(crate::ser::OBJECT_PATH_TOKEN, &self.0)
    }
}

impl<'de> Deserialize<'de> for ObjectPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectPath::new(&s).map_err(de::Error::custom)
    }
}
