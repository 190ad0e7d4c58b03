//! The contract between the proxy runtime and whatever moves messages.
//!
//! A [`Connection`] assigns serials, correlates replies with their calls,
//! and demultiplexes incoming signals onto subscriptions. Callbacks are
//! always delivered through the [`MainContext`] that was the thread
//! default when the call was made or the subscription was installed.
//! [`MessageConnection`] implements the contract over any [`Transport`].

use crate::cancellable::Cancellable;
use crate::context::MainContext;
use crate::error::{Error, Result};
use crate::fdlist::FdList;
use crate::handlers::HandlerId;
use crate::message::{Message, MessageFlags, MessageType};
use crate::names::{is_unique_name, ObjectPath};
use crate::value::Value;

use bitflags::bitflags;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;

mod message_connection;

pub use message_connection::{MessageConnection, Transport};

pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Sentinel timeout meaning "use the default".
pub const DEFAULT_TIMEOUT: i32 = -1;
/// Sentinel timeout meaning "never time out".
pub const NO_TIMEOUT: i32 = i32::MAX;

pub type SignalCallback = Arc<dyn Fn(&Message) + Send + Sync>;
/// Receives the reply message. `Error` replies are delivered as messages
/// too; [`ConnectionExt`] turns them into errors.
pub type ReplyCallback = Box<dyn FnOnce(Result<Message>) + Send>;
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;
/// Receives the outcome of acquiring a bus connection. Name owning and
/// name watching take a getter that eventually calls one of these.
pub type BusCallback = Box<dyn FnOnce(Result<Arc<dyn Connection>>) + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u32);

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const UNIX_FD_PASSING = 1 << 0;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SignalFlags: u32 {
        /// Route matching signals locally without asking the bus for them.
        const NO_MATCH_RULE = 1 << 0;
        const MATCH_ARG0_NAMESPACE = 1 << 1;
        const MATCH_ARG0_PATH = 1 << 2;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u32 {
        const NO_AUTO_START = 1 << 0;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 1 << 1;
    }
}

/// Settings for [`MessageConnection`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Used when a call passes [`DEFAULT_TIMEOUT`].
    pub default_timeout_ms: u32,
    /// Whether the peer is a bus daemon. Subscriptions then register
    /// match rules with `AddMatch`.
    pub message_bus: bool,
    pub unix_fd_passing: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_timeout_ms: 25000,
            message_bus: true,
            unix_fd_passing: true,
        }
    }
}

/// Which signals a subscription wants. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub arg0: Option<String>,
    pub flags: SignalFlags,
}

impl SignalRule {
    /// The match rule string understood by the bus daemon.
    pub fn to_match_rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                let _ = write!(rule, ",{}='{}'", key, value);
            }
        }
        if let Some(arg0) = &self.arg0 {
            let key = if self.flags.contains(SignalFlags::MATCH_ARG0_PATH) {
                "arg0path"
            } else if self.flags.contains(SignalFlags::MATCH_ARG0_NAMESPACE) {
                "arg0namespace"
            } else {
                "arg0"
            };
            let _ = write!(rule, ",{}='{}'", key, arg0);
        }
        rule
    }

    /// Whether `message` is a signal this rule selects.
    ///
    /// A well-known sender name cannot be checked locally, because the bus
    /// rewrites it to the owner's unique name; such rules accept any sender.
    pub fn matches(&self, message: &Message) -> bool {
        if message.message_type() != MessageType::Signal {
            return false;
        }
        if let Some(sender) = &self.sender {
            if (is_unique_name(sender) || sender == DBUS_NAME)
                && message.sender() != Some(sender.as_str())
            {
                return false;
            }
        }
        let exact = [
            (&self.interface, message.interface()),
            (&self.member, message.member()),
            (&self.path, message.path()),
        ];
        for (want, have) in exact {
            if let Some(want) = want {
                if have != Some(want.as_str()) {
                    return false;
                }
            }
        }
        if let Some(namespace) = &self.path_namespace {
            let in_namespace = message
                .path()
                .and_then(|p| ObjectPath::new(p).ok())
                .map_or(false, |p| p.is_in_namespace(namespace));
            if !in_namespace {
                return false;
            }
        }
        if let Some(want) = &self.arg0 {
            let arg0 = match message.arg0() {
                Some(arg0) => arg0,
                None => return false,
            };
            let matched = if self.flags.contains(SignalFlags::MATCH_ARG0_NAMESPACE) {
                namespace_matches(want, arg0)
            } else if self.flags.contains(SignalFlags::MATCH_ARG0_PATH) {
                path_prefix_matches(want, arg0)
            } else {
                want == arg0
            };
            if !matched {
                return false;
            }
        }
        true
    }

    /// `NameAcquired` and `NameLost` are sent to us unconditionally, so no
    /// match rule is needed for them.
    pub(crate) fn is_for_name_ownership(&self) -> bool {
        self.sender.as_deref() == Some(DBUS_NAME)
            && self.interface.as_deref() == Some(DBUS_INTERFACE)
            && self.path.as_deref() == Some(DBUS_PATH)
            && matches!(self.member.as_deref(), Some("NameAcquired" | "NameLost"))
    }
}

fn namespace_matches(namespace: &str, name: &str) -> bool {
    match name.strip_prefix(namespace) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

fn path_prefix_matches(a: &str, b: &str) -> bool {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.len() < longer.len() && !shorter.ends_with('/') {
        return false;
    }
    longer.starts_with(shorter)
}

pub trait Connection: Send + Sync {
    /// Our name on the bus, once assigned.
    fn unique_name(&self) -> Option<String>;

    fn is_closed(&self) -> bool;

    fn capabilities(&self) -> Capabilities;

    /// Whether the peer is a bus daemon (and so understands `AddMatch`,
    /// `GetNameOwner` and friends).
    fn is_message_bus(&self) -> bool;

    /// Assigns a serial, locks and sends `message`. Returns the serial.
    fn send_message(&self, message: Message) -> Result<u32>;

    /// Sends a method call and arranges for `callback` to receive the reply.
    /// `timeout_ms` is in milliseconds; [`DEFAULT_TIMEOUT`] and
    /// [`NO_TIMEOUT`] are recognized.
    fn send_message_with_reply(
        &self,
        message: Message,
        timeout_ms: i32,
        cancellable: Option<&Cancellable>,
        callback: ReplyCallback,
    );

    fn signal_subscribe(&self, rule: SignalRule, callback: SignalCallback) -> SubscriptionId;

    fn signal_unsubscribe(&self, id: SubscriptionId);

    fn connect_closed(&self, callback: ClosedCallback) -> HandlerId;

    fn disconnect_closed(&self, id: HandlerId);
}

/// A method call about to be made.
#[derive(Debug)]
pub struct MethodCall {
    destination: Option<String>,
    path: String,
    interface: Option<String>,
    method: String,
    body: Option<Value>,
    reply_type: Option<String>,
    flags: CallFlags,
    timeout_ms: i32,
    fd_list: Option<FdList>,
}

impl MethodCall {
    pub fn new(destination: Option<&str>, path: &str, interface: Option<&str>, method: &str) -> Self {
        MethodCall {
            destination: destination.map(str::to_owned),
            path: path.to_owned(),
            interface: interface.map(str::to_owned),
            method: method.to_owned(),
            body: None,
            reply_type: None,
            flags: CallFlags::empty(),
            timeout_ms: DEFAULT_TIMEOUT,
            fd_list: None,
        }
    }

    /// A call to the bus daemon itself.
    pub fn bus(method: &str) -> Self {
        MethodCall::new(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_INTERFACE), method)
    }

    /// Arguments as a struct value.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Reply signature, e.g. `(a{sv})`, that the reply must have.
    pub fn with_reply_type(mut self, reply_type: &str) -> Self {
        self.reply_type = Some(reply_type.to_owned());
        self
    }

    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_unix_fd_list(mut self, fd_list: Option<FdList>) -> Self {
        self.fd_list = fd_list;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn timeout_ms(&self) -> i32 {
        self.timeout_ms
    }

    fn into_message(self, no_reply: bool) -> Result<(Message, i32, Option<String>)> {
        let mut message = Message::new_method_call(
            self.destination.as_deref(),
            &self.path,
            self.interface.as_deref(),
            &self.method,
        )?;
        let mut flags = MessageFlags::empty();
        if self.flags.contains(CallFlags::NO_AUTO_START) {
            flags |= MessageFlags::NO_AUTO_START;
        }
        if self.flags.contains(CallFlags::ALLOW_INTERACTIVE_AUTHORIZATION) {
            flags |= MessageFlags::ALLOW_INTERACTIVE_AUTHORIZATION;
        }
        if no_reply {
            flags |= MessageFlags::NO_REPLY_EXPECTED;
        }
        message.set_flags(flags)?;
        message.set_body(self.body)?;
        message.set_unix_fd_list(self.fd_list)?;
        Ok((message, self.timeout_ms, self.reply_type))
    }
}

/// Checks a reply against the call it answers.
fn finish_reply(method: &str, reply_type: Option<&str>, reply: Message) -> Result<Message> {
    if let Some(error) = reply.to_error() {
        return Err(error);
    }
    if let Some(expected) = reply_type {
        let actual = reply.body_type_string();
        if actual != expected {
            return Err(Error::invalid(format!(
                "Method '{}' returned type '{}', but expected '{}'",
                method, actual, expected
            )));
        }
    }
    Ok(reply)
}

/// Method calls on top of [`Connection`].
pub trait ConnectionExt: Connection {
    /// Makes the call. Without a callback the message is sent with
    /// NO_REPLY_EXPECTED and failures are only logged.
    fn call_with_callback(
        &self,
        call: MethodCall,
        cancellable: Option<&Cancellable>,
        callback: Option<ReplyCallback>,
    ) {
        let method = call.method.clone();
        let callback = match callback {
            Some(callback) => callback,
            None => {
                let sent = call
                    .into_message(true)
                    .and_then(|(message, _, _)| self.send_message(message));
                if let Err(e) = sent {
                    log::debug!("Error sending {} without reply: {}", method, e);
                }
                return;
            }
        };
        match call.into_message(false) {
            Ok((message, timeout_ms, reply_type)) => self.send_message_with_reply(
                message,
                timeout_ms,
                cancellable,
                Box::new(move |result| {
                    callback(result.and_then(|reply| finish_reply(&method, reply_type.as_deref(), reply)))
                }),
            ),
            Err(e) => MainContext::ref_thread_default().invoke(move || callback(Err(e))),
        }
    }

    fn call(&self, call: MethodCall, cancellable: Option<&Cancellable>) -> BoxFuture<'static, Result<Message>> {
        let (tx, rx) = oneshot::channel();
        self.call_with_callback(
            call,
            cancellable,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.map(|received| received.unwrap_or(Err(Error::Cancelled))).boxed()
    }

    /// Blocks until the reply arrives. Replies are dispatched on a private
    /// context, so this is safe to use from a thread that is itself
    /// responsible for iterating a context.
    fn call_sync(&self, call: MethodCall, cancellable: Option<&Cancellable>) -> Result<Message> {
        MainContext::run_sync(|done| self.call_with_callback(call, cancellable, Some(done)))
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn signal(sender: &str, path: &str, arg0: &str) -> Result<Message> {
        let mut m = Message::new_signal(path, "org.example.Iface", "Changed")?;
        m.set_sender(Some(sender))?;
        m.set_body(Some(Value::tuple(vec![arg0.into()])))?;
        Ok(m)
    }

    #[test]
    fn match_rule_text() {
        let rule = SignalRule {
            sender: Some("org.example.Svc".into()),
            interface: Some("org.example.Iface".into()),
            path: Some("/org/example".into()),
            arg0: Some("org.example".into()),
            flags: SignalFlags::MATCH_ARG0_NAMESPACE,
            ..Default::default()
        };
        assert_eq!(
            rule.to_match_rule(),
            "type='signal',sender='org.example.Svc',interface='org.example.Iface',\
             path='/org/example',arg0namespace='org.example'"
        );
        assert_eq!(SignalRule::default().to_match_rule(), "type='signal'");
    }

    #[test]
    fn rule_matching() -> Result<()> {
        let msg = signal(":1.5", "/org/example/a", "org.example.Thing")?;
        let mut rule = SignalRule {
            sender: Some(":1.5".into()),
            member: Some("Changed".into()),
            ..Default::default()
        };
        assert!(rule.matches(&msg));
        rule.sender = Some(":1.6".into());
        assert!(!rule.matches(&msg));
        rule.sender = Some("org.example.Svc".into());
        assert!(rule.matches(&msg));

        rule.path_namespace = Some("/org/example".into());
        assert!(rule.matches(&msg));
        rule.path_namespace = Some("/org/other".into());
        assert!(!rule.matches(&msg));
        rule.path_namespace = None;

        rule.arg0 = Some("org.example".into());
        assert!(!rule.matches(&msg));
        rule.flags = SignalFlags::MATCH_ARG0_NAMESPACE;
        assert!(rule.matches(&msg));
        rule.arg0 = Some("org.exam".into());
        assert!(!rule.matches(&msg));
        Ok(())
    }

    #[test]
    fn arg0_path_rules() {
        assert!(path_prefix_matches("/aa/", "/aa/bb"));
        assert!(path_prefix_matches("/aa/bb", "/aa/"));
        assert!(path_prefix_matches("/aa", "/aa"));
        assert!(!path_prefix_matches("/aa", "/aa/bb"));
        assert!(namespace_matches("com.example", "com.example.Foo"));
        assert!(!namespace_matches("com.example", "com.examples"));
    }

    #[test]
    fn reply_checking() -> Result<()> {
        let mut call = Message::new_method_call(Some(":1.2"), "/", Some("a.b"), "M")?;
        call.set_serial(4)?;
        call.set_sender(Some(":1.9"))?;
        let mut reply = call.new_method_reply()?;
        reply.set_body(Some(Value::tuple(vec!["x".into()])))?;
        let reply = finish_reply("M", Some("(s)"), reply)?;
        let err = finish_reply("M", Some("(i)"), reply).err().map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("Method 'M' returned type '(s)', but expected '(i)'")
        );
        let error = call.new_method_error("org.example.Error.Nope", "no")?;
        let err = finish_reply("M", None, error).err();
        assert_eq!(err.as_ref().and_then(Error::dbus_name), Some("org.example.Error.Nope"));
        Ok(())
    }
}
