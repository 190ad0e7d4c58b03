//! Choices the serializer makes where D-Bus allows more than one encoding.

use std::collections::BTreeSet;
use std::sync::Arc;

/// How a struct with named fields is encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StructSerializationStyle {
    /// As a D-Bus struct, fields in declaration order.
    StronglyTyped,
    /// As an `a{sv}` keyed by field name.
    Dict,
}

pub trait SerializerPolicy: Clone {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle;
}

#[derive(Clone, Debug)]
pub struct DefaultSerializerPolicy;

impl SerializerPolicy for DefaultSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::Dict
    }
}

#[derive(Clone, Debug)]
pub struct StronglyTypedSerializerPolicy;

impl SerializerPolicy for StronglyTypedSerializerPolicy {
    fn query_struct_name(&self, _: &str) -> StructSerializationStyle {
        StructSerializationStyle::StronglyTyped
    }
}

/// Dictionary style by default, struct style for the listed type names.
#[derive(Clone, Debug, Default)]
pub struct NamedStructsPolicy {
    strongly_typed: Arc<BTreeSet<String>>,
}

impl NamedStructsPolicy {
    pub fn new<I, S>(strongly_typed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NamedStructsPolicy {
            strongly_typed: Arc::new(strongly_typed.into_iter().map(Into::into).collect()),
        }
    }
}

impl SerializerPolicy for NamedStructsPolicy {
    fn query_struct_name(&self, name: &str) -> StructSerializationStyle {
        if self.strongly_typed.contains(name) {
            StructSerializationStyle::StronglyTyped
        } else {
            StructSerializationStyle::Dict
        }
    }
}
