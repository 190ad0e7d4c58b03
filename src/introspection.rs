//! Descriptions of remote interfaces.
//!
//! A proxy given an [`InterfaceInfo`] uses it to check property and signal
//! types and to derive reply types for method calls. The structures derive
//! serde so they can be loaded from any self-describing format.

use crate::error::{Error, Result};
use crate::signature::{tuple_signature, Type};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationInfo {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgInfo {
    #[serde(default)]
    pub name: Option<String>,
    /// A single complete type.
    pub signature: String,
    #[serde(default)]
    pub annotations: Vec<AnnotationInfo>,
}

impl ArgInfo {
    pub fn new(name: &str, signature: &str) -> Self {
        ArgInfo {
            name: Some(name.to_owned()),
            signature: signature.to_owned(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    #[serde(default)]
    pub in_args: Vec<ArgInfo>,
    #[serde(default)]
    pub out_args: Vec<ArgInfo>,
    #[serde(default)]
    pub annotations: Vec<AnnotationInfo>,
}

impl MethodInfo {
    pub fn in_signature(&self) -> String {
        args_signature(&self.in_args)
    }

    /// The tuple type of the reply body, e.g. `(sa{sv})`.
    pub fn out_signature(&self) -> String {
        args_signature(&self.out_args)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgInfo>,
    #[serde(default)]
    pub annotations: Vec<AnnotationInfo>,
}

impl SignalInfo {
    pub fn signature(&self) -> String {
        args_signature(&self.args)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyAccess {
    Read,
    Write,
    #[default]
    #[serde(rename = "readwrite")]
    ReadWrite,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub access: PropertyAccess,
    #[serde(default)]
    pub annotations: Vec<AnnotationInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodInfo>,
    #[serde(default)]
    pub signals: Vec<SignalInfo>,
    #[serde(default)]
    pub properties: Vec<PropertyInfo>,
    #[serde(default)]
    pub annotations: Vec<AnnotationInfo>,
}

impl InterfaceInfo {
    pub fn new(name: &str) -> Self {
        InterfaceInfo {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, name: &str, signature: &str, access: PropertyAccess) -> Self {
        self.properties.push(PropertyInfo {
            name: name.to_owned(),
            signature: signature.to_owned(),
            access,
            annotations: Vec::new(),
        });
        self
    }

    pub fn with_method(mut self, name: &str, in_args: Vec<ArgInfo>, out_args: Vec<ArgInfo>) -> Self {
        self.methods.push(MethodInfo {
            name: name.to_owned(),
            in_args,
            out_args,
            annotations: Vec::new(),
        });
        self
    }

    pub fn with_signal(mut self, name: &str, args: Vec<ArgInfo>) -> Self {
        self.signals.push(SignalInfo {
            name: name.to_owned(),
            args,
            annotations: Vec::new(),
        });
        self
    }

    pub fn lookup_method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn lookup_signal(&self, name: &str) -> Option<&SignalInfo> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn lookup_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Checks every signature in the description.
    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, sig: &str| {
            Type::parse(sig).map(|_| ()).map_err(|_| {
                Error::invalid(format!(
                    "Interface {}: {} has invalid type `{}`",
                    self.name, what, sig
                ))
            })
        };
        for method in &self.methods {
            for arg in method.in_args.iter().chain(&method.out_args) {
                check(&method.name, &arg.signature)?;
            }
        }
        for signal in &self.signals {
            for arg in &signal.args {
                check(&signal.name, &arg.signature)?;
            }
        }
        for property in &self.properties {
            check(&property.name, &property.signature)?;
        }
        Ok(())
    }
}

fn args_signature(args: &[ArgInfo]) -> String {
    let types: Vec<Type> = args
        .iter()
        .filter_map(|a| Type::parse(&a.signature).ok())
        .collect();
    tuple_signature(&types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample() -> InterfaceInfo {
        InterfaceInfo::new("com.example.X")
            .with_property("P", "s", PropertyAccess::Read)
            .with_method(
                "Frob",
                vec![ArgInfo::new("a", "i")],
                vec![ArgInfo::new("r", "s"), ArgInfo::new("opts", "a{sv}")],
            )
            .with_signal("Changed", vec![ArgInfo::new("what", "s")])
    }

    #[test]
    fn lookups_and_signatures() -> Result<()> {
        let info = sample();
        info.validate()?;
        let frob = info.lookup_method("Frob").map(MethodInfo::out_signature);
        assert_eq!(frob.as_deref(), Some("(sa{sv})"));
        assert_eq!(info.lookup_method("Frob").map(MethodInfo::in_signature).as_deref(), Some("(i)"));
        assert_eq!(info.lookup_signal("Changed").map(SignalInfo::signature).as_deref(), Some("(s)"));
        assert_eq!(info.lookup_property("P").map(|p| p.signature.as_str()), Some("s"));
        assert!(info.lookup_property("Q").is_none());
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_types() {
        let info = InterfaceInfo::new("com.example.X").with_property("P", "a{", PropertyAccess::Read);
        assert!(info.validate().is_err());
    }

    #[test]
    fn round_trips_through_values() -> Result<()> {
        let info = sample();
        let value = crate::ser::to_value(&info)?;
        let back: InterfaceInfo = crate::de::from_value(&value)?;
        assert_eq!(back, info);
        Ok(())
    }
}
