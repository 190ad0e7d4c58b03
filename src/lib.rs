//! The core of a D-Bus client.
//!
//! This crate covers everything between the bytes on the wire and the
//! objects an application talks to, but not the socket itself. Bring your
//! own transport, implement [`Transport`] for it, and feed received
//! messages to a [`MessageConnection`].
//!
//! The layers, bottom up:
//!
//! * Values and types. [`Value`] is the dynamic representation of any
//!   D-Bus value; [`Type`] and [`Signature`] describe them. The [`ser`]
//!   and [`de`] modules bridge to `serde`, so ordinary `Serialize` and
//!   `Deserialize` types can be used as message bodies.
//! * The wire codec in [`codec`], which reads and writes both byte orders,
//!   and [`Message`], the message object built on it.
//! * [`Connection`], the contract for sending calls and receiving replies
//!   and signals, with [`MessageConnection`] implementing it over a
//!   [`Transport`]. Callbacks are delivered through a [`MainContext`].
//! * [`Proxy`], a cached view of one interface on one remote object,
//!   and [`ObjectManagerClient`], which mirrors a whole object tree.
//! * Owning and watching bus names, in [`name_owning`] and
//!   [`name_watching`].
//!
//! Rust values become D-Bus values through [`to_value`]. Whether Rust
//! structs are encoded as D-Bus structs or as string-keyed dictionaries
//! is decided by a [`SerializerPolicy`] passed to [`to_value_with_policy`].
//!
//! Failures are reported as [`Error`]. Logging goes through the `log`
//! facade; the library never installs a logger.
//!
//! [`Transport`]: crate::connection::Transport
//! [`MessageConnection`]: crate::connection::MessageConnection
//! [`Connection`]: crate::connection::Connection
//! [`MainContext`]: crate::context::MainContext
//! [`Message`]: crate::message::Message
//! [`Proxy`]: crate::proxy::Proxy
//! [`ObjectManagerClient`]: crate::object_manager::ObjectManagerClient
//! [`Type`]: crate::signature::Type
//! [`Signature`]: crate::signature::Signature
//! [`to_value`]: crate::ser::to_value()
//! [`to_value_with_policy`]: crate::ser::to_value_with_policy()
//! [`SerializerPolicy`]: crate::ser::serializer_policy::SerializerPolicy

mod align;
pub mod cancellable;
pub mod codec;
pub mod connection;
pub mod context;
pub mod de;
pub mod error;
pub mod fdlist;
mod handlers;
pub mod introspection;
pub mod message;
pub mod name_owning;
pub mod name_watching;
pub mod names;
pub mod object_manager;
pub mod object_proxy;
mod primitives;
pub mod proxy;
pub mod ser;
pub mod signature;
pub mod value;

pub use cancellable::Cancellable;
pub use connection::{Connection, ConnectionExt, MessageConnection, MethodCall};
pub use context::MainContext;
pub use error::{Error, Result};
pub use handlers::HandlerId;
pub use message::Message;
pub use names::ObjectPath;
pub use object_manager::ObjectManagerClient;
pub use object_proxy::ObjectProxy;
pub use proxy::{Proxy, ProxyFlags};
pub use signature::{Signature, Type};
pub use value::Value;
