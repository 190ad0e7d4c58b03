//! The [`Message`] object: header fields, body and attached descriptors.

use crate::codec::{self, Endianness};
use crate::error::{DBusError, Error, Result};
use crate::fdlist::FdList;
use crate::names::{
    is_error_name, is_interface_name, is_member_name, is_name, is_object_path, ObjectPath,
};
use crate::signature::{tuple_signature, Signature, Type};
use crate::value::Value;

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};
use std::sync::atomic::{AtomicBool, Ordering};

pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invalid = 0,
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            0 => Some(MessageType::Invalid),
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    fn nick(self) -> &'static str {
        match self {
            MessageType::Invalid => "invalid",
            MessageType::MethodCall => "method-call",
            MessageType::MethodReturn => "method-return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const NO_AUTO_START = 0x02;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x04;
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    NumUnixFds = 9,
}

impl HeaderField {
    pub fn from_code(code: u8) -> Option<HeaderField> {
        match code {
            1 => Some(HeaderField::Path),
            2 => Some(HeaderField::Interface),
            3 => Some(HeaderField::Member),
            4 => Some(HeaderField::ErrorName),
            5 => Some(HeaderField::ReplySerial),
            6 => Some(HeaderField::Destination),
            7 => Some(HeaderField::Sender),
            8 => Some(HeaderField::Signature),
            9 => Some(HeaderField::NumUnixFds),
            _ => None,
        }
    }

    fn expected_type(self) -> Type {
        match self {
            HeaderField::Path => Type::ObjectPath,
            HeaderField::Interface
            | HeaderField::Member
            | HeaderField::ErrorName
            | HeaderField::Destination
            | HeaderField::Sender => Type::String,
            HeaderField::ReplySerial | HeaderField::NumUnixFds => Type::UInt32,
            HeaderField::Signature => Type::Signature,
        }
    }

    fn nick(self) -> &'static str {
        match self {
            HeaderField::Path => "path",
            HeaderField::Interface => "interface",
            HeaderField::Member => "member",
            HeaderField::ErrorName => "error-name",
            HeaderField::ReplySerial => "reply-serial",
            HeaderField::Destination => "destination",
            HeaderField::Sender => "sender",
            HeaderField::Signature => "signature",
            HeaderField::NumUnixFds => "num-unix-fds",
        }
    }
}

/// A D-Bus message.
///
/// Messages are freely mutable until they are locked, which happens
/// explicitly through [`Message::lock`] or implicitly on the first
/// successful [`Message::to_blob`]. After that every setter fails with
/// [`Error::MessageLocked`].
#[derive(Debug)]
pub struct Message {
    message_type: MessageType,
    flags: MessageFlags,
    byte_order: Endianness,
    serial: u32,
    headers: BTreeMap<u8, Value>,
    body: Option<Value>,
    fd_list: Option<FdList>,
    locked: AtomicBool,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Message {
    /// An empty message of type `Invalid`.
    pub fn new() -> Message {
        Message {
            message_type: MessageType::Invalid,
            flags: MessageFlags::empty(),
            byte_order: Endianness::native(),
            serial: 0,
            headers: BTreeMap::new(),
            body: None,
            fd_list: None,
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn from_parts(
        message_type: MessageType,
        flags: MessageFlags,
        byte_order: Endianness,
        serial: u32,
        headers: BTreeMap<u8, Value>,
        body: Option<Value>,
        fd_list: Option<FdList>,
    ) -> Message {
        Message {
            message_type,
            flags,
            byte_order,
            serial,
            headers,
            body,
            fd_list,
            locked: AtomicBool::new(false),
        }
    }

    pub fn new_method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        method: &str,
    ) -> Result<Message> {
        let mut m = Message::new();
        m.message_type = MessageType::MethodCall;
        m.set_path(Some(path))?;
        m.set_member(Some(method))?;
        m.set_interface(interface)?;
        m.set_destination(destination)?;
        Ok(m)
    }

    pub fn new_signal(path: &str, interface: &str, signal: &str) -> Result<Message> {
        let mut m = Message::new();
        m.message_type = MessageType::Signal;
        m.flags = MessageFlags::NO_REPLY_EXPECTED;
        m.set_path(Some(path))?;
        m.set_member(Some(signal))?;
        m.set_interface(Some(interface))?;
        Ok(m)
    }

    fn new_reply_to(&self, message_type: MessageType) -> Result<Message> {
        if self.message_type != MessageType::MethodCall {
            return Err(Error::invalid(format!(
                "Cannot reply to a message of type {}",
                self.message_type.nick()
            )));
        }
        let mut m = Message::new();
        m.message_type = message_type;
        m.flags = MessageFlags::NO_REPLY_EXPECTED;
        m.byte_order = self.byte_order;
        m.set_reply_serial(self.serial)?;
        m.set_destination(self.sender())?;
        Ok(m)
    }

    /// A `MethodReturn` answering this method call.
    pub fn new_method_reply(&self) -> Result<Message> {
        self.new_reply_to(MessageType::MethodReturn)
    }

    /// An `Error` answering this method call, with `message` as the body.
    pub fn new_method_error(&self, error_name: &str, message: &str) -> Result<Message> {
        let mut m = self.new_reply_to(MessageType::Error)?;
        m.set_error_name(Some(error_name))?;
        m.set_body(Some(Value::tuple(vec![message.into()])))?;
        Ok(m)
    }

    /// Parses a complete message. `fd_list` carries the descriptors that
    /// arrived with it; their number must match the NUM_UNIX_FDS header.
    pub fn from_blob(blob: &[u8], fd_list: Option<FdList>) -> Result<Message> {
        codec::decode(blob, fd_list)
    }

    /// Serializes the message in its own byte order and locks it.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let blob = codec::encode(self)?;
        self.lock();
        Ok(blob)
    }

    /// Deep copy. The copy is unlocked and owns duplicates of any
    /// attached descriptors.
    pub fn copy(&self) -> Result<Message> {
        let fd_list = match &self.fd_list {
            Some(list) => Some(list.try_clone()?),
            None => None,
        };
        Ok(Message::from_parts(
            self.message_type,
            self.flags,
            self.byte_order,
            self.serial,
            self.headers.clone(),
            self.body.clone(),
            fd_list,
        ))
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            Err(Error::MessageLocked)
        } else {
            Ok(())
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) -> Result<()> {
        self.check_unlocked()?;
        self.message_type = message_type;
        Ok(())
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: MessageFlags) -> Result<()> {
        self.check_unlocked()?;
        self.flags = flags;
        Ok(())
    }

    pub fn byte_order(&self) -> Endianness {
        self.byte_order
    }

    pub fn set_byte_order(&mut self, byte_order: Endianness) -> Result<()> {
        self.check_unlocked()?;
        self.byte_order = byte_order;
        Ok(())
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u32) -> Result<()> {
        self.check_unlocked()?;
        self.serial = serial;
        Ok(())
    }

    pub fn headers(&self) -> &BTreeMap<u8, Value> {
        &self.headers
    }

    pub fn header(&self, field: HeaderField) -> Option<&Value> {
        self.headers.get(&(field as u8))
    }

    /// Sets or clears a raw header field. No type checking happens until
    /// the message is serialized.
    pub fn set_header(&mut self, field: HeaderField, value: Option<Value>) -> Result<()> {
        self.check_unlocked()?;
        match value {
            Some(value) => self.headers.insert(field as u8, value),
            None => self.headers.remove(&(field as u8)),
        };
        Ok(())
    }

    fn header_str(&self, field: HeaderField) -> Option<&str> {
        self.header(field).and_then(Value::as_str)
    }

    fn header_u32(&self, field: HeaderField) -> Option<u32> {
        self.header(field).and_then(Value::as_u32)
    }

    fn set_checked_str(
        &mut self,
        field: HeaderField,
        value: Option<&str>,
        valid: fn(&str) -> bool,
    ) -> Result<()> {
        match value {
            Some(s) if !valid(s) => Err(Error::invalid(format!(
                "`{}` is not a valid {} header",
                s,
                field.nick()
            ))),
            Some(s) => self.set_header(field, Some(Value::String(s.to_owned()))),
            None => self.set_header(field, None),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.header_str(HeaderField::Path)
    }

    pub fn set_path(&mut self, path: Option<&str>) -> Result<()> {
        match path {
            Some(p) if !is_object_path(p) => Err(Error::invalid(format!(
                "`{}` is not a valid object path",
                p
            ))),
            Some(p) => self.set_header(HeaderField::Path, Some(Value::ObjectPath(ObjectPath::new(p)?))),
            None => self.set_header(HeaderField::Path, None),
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.header_str(HeaderField::Interface)
    }

    pub fn set_interface(&mut self, interface: Option<&str>) -> Result<()> {
        self.set_checked_str(HeaderField::Interface, interface, is_interface_name)
    }

    pub fn member(&self) -> Option<&str> {
        self.header_str(HeaderField::Member)
    }

    pub fn set_member(&mut self, member: Option<&str>) -> Result<()> {
        self.set_checked_str(HeaderField::Member, member, is_member_name)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header_str(HeaderField::ErrorName)
    }

    pub fn set_error_name(&mut self, name: Option<&str>) -> Result<()> {
        self.set_checked_str(HeaderField::ErrorName, name, is_error_name)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_str(HeaderField::Destination)
    }

    pub fn set_destination(&mut self, destination: Option<&str>) -> Result<()> {
        self.set_checked_str(HeaderField::Destination, destination, is_name)
    }

    pub fn sender(&self) -> Option<&str> {
        self.header_str(HeaderField::Sender)
    }

    pub fn set_sender(&mut self, sender: Option<&str>) -> Result<()> {
        self.set_checked_str(HeaderField::Sender, sender, is_name)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header_u32(HeaderField::ReplySerial)
    }

    pub fn set_reply_serial(&mut self, serial: u32) -> Result<()> {
        self.set_header(HeaderField::ReplySerial, Some(Value::UInt32(serial)))
    }

    /// The SIGNATURE header, or `""` when absent.
    pub fn signature(&self) -> &str {
        self.header_str(HeaderField::Signature).unwrap_or("")
    }

    pub fn set_signature(&mut self, signature: Option<&str>) -> Result<()> {
        match signature {
            Some(s) => {
                let sig = Signature::new(s)?;
                self.set_header(HeaderField::Signature, Some(Value::Signature(sig)))
            }
            None => self.set_header(HeaderField::Signature, None),
        }
    }

    pub fn num_unix_fds(&self) -> u32 {
        self.header_u32(HeaderField::NumUnixFds).unwrap_or(0)
    }

    pub fn set_num_unix_fds(&mut self, count: u32) -> Result<()> {
        self.set_header(HeaderField::NumUnixFds, Some(Value::UInt32(count)))
    }

    /// The body tuple, `None` for messages without arguments.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Sets the body and rewrites the SIGNATURE header to match. The body
    /// must be a struct; an empty struct is the same as no body.
    pub fn set_body(&mut self, body: Option<Value>) -> Result<()> {
        self.check_unlocked()?;
        match body {
            Some(Value::Struct(fields)) if fields.is_empty() => {
                self.body = None;
                self.set_signature(None)
            }
            Some(Value::Struct(fields)) => {
                let sig = body_signature(&fields)?;
                self.headers
                    .insert(HeaderField::Signature as u8, Value::Signature(sig));
                self.body = Some(Value::Struct(fields));
                Ok(())
            }
            Some(other) => Err(Error::invalid(format!(
                "Message body must be a tuple, not `{}`",
                other.type_string()
            ))),
            None => {
                self.body = None;
                self.set_signature(None)
            }
        }
    }

    /// The body's fields, empty for messages without a body.
    pub fn args(&self) -> &[Value] {
        match &self.body {
            Some(Value::Struct(fields)) => fields,
            _ => &[],
        }
    }

    /// The first argument if it is a string.
    pub fn arg0(&self) -> Option<&str> {
        self.args().first().and_then(Value::as_str)
    }

    /// The inner type string of the body as a tuple, e.g. `(si)`.
    pub fn body_type_string(&self) -> String {
        let types: Vec<Type> = self.args().iter().map(Value::type_).collect();
        tuple_signature(&types)
    }

    pub fn unix_fd_list(&self) -> Option<&FdList> {
        self.fd_list.as_ref()
    }

    /// Attaches descriptors and keeps NUM_UNIX_FDS in step with them.
    pub fn set_unix_fd_list(&mut self, fd_list: Option<FdList>) -> Result<()> {
        self.check_unlocked()?;
        match fd_list {
            Some(list) if !list.is_empty() => {
                self.set_num_unix_fds(list.len() as u32)?;
                self.fd_list = Some(list);
            }
            _ => {
                self.set_header(HeaderField::NumUnixFds, None)?;
                self.fd_list = None;
            }
        }
        Ok(())
    }

    pub fn take_unix_fd_list(&mut self) -> Option<FdList> {
        self.fd_list.take()
    }

    /// Converts an `Error` message into the error it carries. `None` for
    /// any other message type.
    pub fn to_error(&self) -> Option<Error> {
        if self.message_type != MessageType::Error {
            return None;
        }
        let name = self
            .error_name()
            .unwrap_or("org.freedesktop.DBus.Error.Failed");
        let text = self.arg0().unwrap_or("");
        Some(Error::DBus(DBusError::new(name, text)))
    }

    /// Checks the per-type header requirements and the types of the known
    /// header fields.
    pub fn validate_headers(&self) -> Result<()> {
        for (code, value) in &self.headers {
            if let Some(field) = HeaderField::from_code(*code) {
                if value.type_() != field.expected_type() {
                    return Err(Error::invalid(format!(
                        "Header field {} has type `{}`, expected `{}`",
                        field.nick(),
                        value.type_string(),
                        field.expected_type()
                    )));
                }
            }
        }

        let has = |field: HeaderField| self.headers.contains_key(&(field as u8));
        match self.message_type {
            MessageType::Invalid => Err(Error::invalid("type is INVALID")),
            MessageType::MethodCall => {
                if !has(HeaderField::Path) || !has(HeaderField::Member) {
                    return Err(Error::invalid(
                        "METHOD_CALL message: PATH or MEMBER header field is missing",
                    ));
                }
                Ok(())
            }
            MessageType::MethodReturn => {
                if !has(HeaderField::ReplySerial) {
                    return Err(Error::invalid(
                        "METHOD_RETURN message: REPLY_SERIAL header field is missing",
                    ));
                }
                Ok(())
            }
            MessageType::Error => {
                if !has(HeaderField::ErrorName) || !has(HeaderField::ReplySerial) {
                    return Err(Error::invalid(
                        "ERROR message: REPLY_SERIAL or ERROR_NAME header field is missing",
                    ));
                }
                Ok(())
            }
            MessageType::Signal => {
                if !has(HeaderField::Path)
                    || !has(HeaderField::Interface)
                    || !has(HeaderField::Member)
                {
                    return Err(Error::invalid(
                        "SIGNAL message: PATH, INTERFACE or MEMBER header field is missing",
                    ));
                }
                if self.path() == Some(LOCAL_PATH) {
                    return Err(Error::invalid(format!(
                        "SIGNAL message: The PATH header field is using the reserved value {}",
                        LOCAL_PATH
                    )));
                }
                if self.interface() == Some(LOCAL_INTERFACE) {
                    return Err(Error::invalid(format!(
                        "SIGNAL message: The INTERFACE header field is using the reserved value {}",
                        LOCAL_INTERFACE
                    )));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn validate_fd_count(&self) -> Result<()> {
        let attached = self.fd_list.as_ref().map(FdList::len).unwrap_or(0);
        let declared = self.num_unix_fds() as usize;
        if attached != declared {
            return Err(Error::invalid(format!(
                "Number of file descriptors in message ({}) does not match header field ({})",
                attached, declared
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_for_send(&self) -> Result<()> {
        self.validate_headers()?;
        self.validate_fd_count()?;
        let body_sig = match &self.body {
            Some(Value::Struct(fields)) => body_signature(fields)?.as_str().to_owned(),
            Some(other) => {
                return Err(Error::invalid(format!(
                    "Message body must be a tuple, not `{}`",
                    other.type_string()
                )))
            }
            None => String::new(),
        };
        let header_sig = self.signature();
        if header_sig != body_sig {
            return Err(Error::SignatureBodyMismatch {
                header: header_sig.to_owned(),
                body: body_sig,
            });
        }
        Ok(())
    }

    /// A multi-line dump of the message, for debugging.
    pub fn print(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut out = String::new();
        let _ = writeln!(out, "{}Type:    {}", pad, self.message_type.nick());
        let flags: Vec<&str> = self
            .flags
            .iter_names()
            .map(|(name, _)| name)
            .collect();
        let _ = writeln!(
            out,
            "{}  Flags:   {}",
            pad,
            if flags.is_empty() {
                "none".to_owned()
            } else {
                flags.join("|").to_lowercase().replace('_', "-")
            }
        );
        let _ = writeln!(out, "{}  Version: 0", pad);
        let _ = writeln!(out, "{}  Serial:  {}", pad, self.serial);
        let _ = writeln!(out, "{}  Headers:", pad);
        if self.headers.is_empty() {
            let _ = writeln!(out, "{}    (none)", pad);
        }
        for (code, value) in &self.headers {
            let name = HeaderField::from_code(*code)
                .map(|f| f.nick().to_owned())
                .unwrap_or_else(|| format!("unknown ({})", code));
            let _ = writeln!(out, "{}    {} -> {}", pad, name, value.print(true));
        }
        match &self.body {
            Some(body) => {
                let _ = writeln!(out, "{}  Body: {}", pad, body.print(true));
            }
            None => {
                let _ = writeln!(out, "{}  Body: ()", pad);
            }
        }
        let _ = writeln!(out, "{}  UNIX File Descriptors:", pad);
        match &self.fd_list {
            Some(list) if !list.is_empty() => {
                for fd in list.peek_fds() {
                    let _ = writeln!(out, "{}    fd {}", pad, fd);
                }
            }
            _ => {
                let _ = writeln!(out, "{}    (none)", pad);
            }
        }
        out
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print(0))
    }
}

// Locking state and descriptor identity are not part of a message's value.
impl PartialEq for Message {
    fn eq(&self, other: &Message) -> bool {
        self.message_type == other.message_type
            && self.flags == other.flags
            && self.byte_order == other.byte_order
            && self.serial == other.serial
            && self.headers == other.headers
            && self.body == other.body
            && self.fd_list.as_ref().map(FdList::len) == other.fd_list.as_ref().map(FdList::len)
    }
}

/// The signature of a body made of `fields`, refusing anything the decoder
/// would reject: empty structs, dict entries outside arrays, bad variant
/// contents and nesting past the depth limit.
fn body_signature(fields: &[Value]) -> Result<Signature> {
    let sig = Signature::from_types(fields.iter().map(Value::type_).collect());
    Signature::new(sig.as_str())?;
    for field in fields {
        if field.depth() > codec::MAX_TYPE_DEPTH {
            return Err(Error::NestingExceeded);
        }
        check_variants(field)?;
    }
    Ok(sig)
}

fn check_variants(value: &Value) -> Result<()> {
    if let Value::Variant(inner) = value {
        Type::parse(&inner.type_().to_string())?;
    }
    value.children().try_for_each(check_variants)
}
