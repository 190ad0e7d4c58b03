//! Client-side view of one interface on one remote object.
//!
//! A [`Proxy`] caches the remote interface's properties, re-emits its
//! signals, tracks which unique name currently owns the bus name it talks
//! to, and makes method calls with the right destination. All state sits
//! behind one lock that is never held while user callbacks run; callbacks
//! are delivered through the [`MainContext`] that was the thread default
//! when the proxy was built.
//!
//! ```ignore
//! let proxy = Proxy::builder(connection, "/org/example/Thing", "org.example.Thing")
//!     .name("org.example.Service")
//!     .build_sync(None)?;
//! let reply = proxy.call_sync("Frob", Some(Value::tuple(vec![1i32.into()])), CallFlags::empty(), -1, None)?;
//! ```

use crate::cancellable::Cancellable;
use crate::connection::{
    CallFlags, Connection, ConnectionExt, MethodCall, SignalFlags, SignalRule, SubscriptionId,
    DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, DEFAULT_TIMEOUT, PROPERTIES_INTERFACE,
};
use crate::context::MainContext;
use crate::de::from_value;
use crate::error::{DBusError, Error, Result};
use crate::fdlist::FdList;
use crate::handlers::{HandlerId, HandlerList};
use crate::introspection::InterfaceInfo;
use crate::message::Message;
use crate::names::{is_interface_name, is_name, is_object_path, is_unique_name};
use crate::object_proxy::ObjectProxy;
use crate::value::Value;

use bitflags::bitflags;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ProxyFlags: u32 {
        /// Neither load properties initially nor track `PropertiesChanged`.
        const DO_NOT_LOAD_PROPERTIES = 1 << 0;
        /// Do not subscribe to the interface's signals.
        const DO_NOT_CONNECT_SIGNALS = 1 << 1;
        /// Never ask the bus to start the name's owner.
        const DO_NOT_AUTO_START = 1 << 2;
        /// On `PropertiesChanged`, fetch invalidated properties with `Get`
        /// instead of dropping them.
        const GET_INVALIDATED_PROPERTIES = 1 << 3;
        /// Like `DO_NOT_AUTO_START`, but only while building the proxy.
        const DO_NOT_AUTO_START_AT_CONSTRUCTION = 1 << 4;
        /// Subscribe without asking the bus for match rules.
        const NO_MATCH_RULE = 1 << 5;
    }
}

/// The observable fields reported through [`Proxy::connect_notify`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyProperty {
    NameOwner,
    DefaultTimeout,
    InterfaceInfo,
}

/// Something that exposes a D-Bus interface and may belong to an object.
pub trait DBusInterface: Send + Sync {
    fn info(&self) -> Option<Arc<InterfaceInfo>>;

    fn object(&self) -> Option<Arc<ObjectProxy>>;

    fn set_object(&self, object: Option<&Arc<ObjectProxy>>);
}

type PropertiesChangedFn = dyn Fn(&BTreeMap<String, Value>, &[String]) + Send + Sync;
type NotifyFn = dyn Fn(ProxyProperty) + Send + Sync;
type SignalFn = dyn Fn(Option<&str>, &str, &Value) + Send + Sync;

struct SignalHandler {
    signal_name: Option<String>,
    callback: Box<SignalFn>,
}

/// Completion of a proxy-level method call: the reply body and any
/// descriptors that came with it.
pub type CallCallback = Box<dyn FnOnce(Result<(Value, Option<FdList>)>) + Send>;

struct ProxyState {
    name_owner: Option<String>,
    timeout_ms: i32,
    expected_interface: Option<Arc<InterfaceInfo>>,
    properties: BTreeMap<String, Value>,
    object: Weak<ObjectProxy>,
    get_all_cancellable: Option<Cancellable>,
    initialized: bool,
}

pub struct Proxy {
    connection: Arc<dyn Connection>,
    flags: ProxyFlags,
    name: Option<String>,
    object_path: String,
    interface_name: String,
    context: MainContext,
    state: RwLock<ProxyState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    properties_changed_handlers: HandlerList<PropertiesChangedFn>,
    signal_handlers: HandlerList<SignalHandler>,
    notify_handlers: HandlerList<NotifyFn>,
    weak_self: Weak<Proxy>,
}

/// Collects construction parameters for a [`Proxy`].
pub struct ProxyBuilder {
    connection: Arc<dyn Connection>,
    flags: ProxyFlags,
    info: Option<Arc<InterfaceInfo>>,
    name: Option<String>,
    object_path: String,
    interface_name: String,
}

impl ProxyBuilder {
    pub fn flags(mut self, flags: ProxyFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The interface the remote object is expected to implement. Property
    /// and signal types are checked against it.
    pub fn interface_info(mut self, info: InterfaceInfo) -> Self {
        self.info = Some(Arc::new(info));
        self
    }

    /// The bus name to talk to. Without one the proxy addresses its peer
    /// directly, as on a peer-to-peer connection.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    fn create(self) -> Result<Arc<Proxy>> {
        if let Some(name) = &self.name {
            if !is_name(name) {
                return Err(Error::invalid(format!("`{}` is not a valid bus name", name)));
            }
            if !self.connection.is_message_bus() {
                return Err(Error::invalid(format!(
                    "Cannot use bus name `{}` on a connection that is not to a message bus",
                    name
                )));
            }
        }
        if !is_object_path(&self.object_path) {
            return Err(Error::invalid(format!(
                "`{}` is not a valid object path",
                self.object_path
            )));
        }
        if !is_interface_name(&self.interface_name) {
            return Err(Error::invalid(format!(
                "`{}` is not a valid interface name",
                self.interface_name
            )));
        }
        let proxy = Arc::new_cyclic(|weak_self| Proxy {
            connection: self.connection,
            flags: self.flags,
            name: self.name,
            object_path: self.object_path,
            interface_name: self.interface_name,
            context: MainContext::ref_thread_default(),
            state: RwLock::new(ProxyState {
                name_owner: None,
                timeout_ms: DEFAULT_TIMEOUT,
                expected_interface: self.info,
                properties: BTreeMap::new(),
                object: Weak::new(),
                get_all_cancellable: None,
                initialized: false,
            }),
            subscriptions: Mutex::new(Vec::new()),
            properties_changed_handlers: HandlerList::new(),
            signal_handlers: HandlerList::new(),
            notify_handlers: HandlerList::new(),
            weak_self: weak_self.clone(),
        });
        proxy.subscribe();
        Ok(proxy)
    }

    /// Builds the proxy and reports through `callback` once the name owner
    /// is resolved and properties are loaded.
    pub fn build_with_callback(
        self,
        cancellable: Option<&Cancellable>,
        callback: Box<dyn FnOnce(Result<Arc<Proxy>>) + Send>,
    ) {
        let proxy = match self.create() {
            Ok(proxy) => proxy,
            Err(e) => {
                MainContext::ref_thread_default().invoke(move || callback(Err(e)));
                return;
            }
        };
        let result_proxy = proxy.clone();
        proxy.init(
            cancellable.cloned(),
            Box::new(move |result| callback(result.map(|()| result_proxy))),
        );
    }

    pub fn build(self, cancellable: Option<&Cancellable>) -> BoxFuture<'static, Result<Arc<Proxy>>> {
        let (tx, rx) = oneshot::channel();
        self.build_with_callback(
            cancellable,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.map(|received| received.unwrap_or(Err(Error::Cancelled))).boxed()
    }

    /// Builds the proxy, blocking until initialization completes. Signal
    /// subscriptions are still bound to the calling thread's context.
    pub fn build_sync(self, cancellable: Option<&Cancellable>) -> Result<Arc<Proxy>> {
        let proxy = self.create()?;
        let cancellable = cancellable.cloned();
        let init = proxy.clone();
        MainContext::run_sync(move |done| init.init(cancellable, done))?;
        Ok(proxy)
    }
}

impl Proxy {
    pub fn builder(
        connection: Arc<dyn Connection>,
        object_path: &str,
        interface_name: &str,
    ) -> ProxyBuilder {
        ProxyBuilder {
            connection,
            flags: ProxyFlags::empty(),
            info: None,
            name: None,
            object_path: object_path.to_owned(),
            interface_name: interface_name.to_owned(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn flags(&self) -> ProxyFlags {
        self.flags
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// The unique name currently owning [`Proxy::name`].
    pub fn name_owner(&self) -> Option<String> {
        self.state.read().name_owner.clone()
    }

    pub fn default_timeout(&self) -> i32 {
        self.state.read().timeout_ms
    }

    /// Timeout for calls made with a timeout of -1. Notifies
    /// [`ProxyProperty::DefaultTimeout`] when the value changes.
    pub fn set_default_timeout(&self, timeout_ms: i32) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.timeout_ms != timeout_ms;
            state.timeout_ms = timeout_ms;
            changed
        };
        if changed {
            self.notify(ProxyProperty::DefaultTimeout);
        }
    }

    pub fn interface_info(&self) -> Option<Arc<InterfaceInfo>> {
        self.state.read().expected_interface.clone()
    }

    pub fn set_interface_info(&self, info: Option<InterfaceInfo>) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.expected_interface.as_deref() != info.as_ref();
            state.expected_interface = info.map(Arc::new);
            changed
        };
        if changed {
            self.notify(ProxyProperty::InterfaceInfo);
        }
    }

    /// A cached property. Values whose type disagrees with the expected
    /// interface are reported as absent.
    pub fn cached_property(&self, name: &str) -> Option<Value> {
        let state = self.state.read();
        let value = state.properties.get(name)?;
        if let Some(info) = state
            .expected_interface
            .as_ref()
            .and_then(|i| i.lookup_property(name))
        {
            let actual = value.type_string();
            if info.signature != actual {
                warn!(
                    "Trying to get property {} with type {} but according to the expected \
                     interface the type is {}",
                    name, actual, info.signature
                );
                return None;
            }
        }
        Some(value.clone())
    }

    /// A cached property converted with serde.
    pub fn cached_property_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.cached_property(name) {
            Some(value) => Ok(Some(from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Names of all cached properties, sorted.
    pub fn cached_property_names(&self) -> Vec<String> {
        self.state.read().properties.keys().cloned().collect()
    }

    /// Replaces (or with `None`, removes) a cached property locally. Values
    /// whose type disagrees with the expected interface are dropped.
    pub fn set_cached_property(&self, name: &str, value: Option<Value>) {
        let mut state = self.state.write();
        match value {
            Some(value) => {
                if let Some(info) = state
                    .expected_interface
                    .as_ref()
                    .and_then(|i| i.lookup_property(name))
                {
                    let actual = value.type_string();
                    if info.signature != actual {
                        warn!(
                            "Trying to set property {} of type {} but according to the expected \
                             interface the type is {}",
                            name, actual, info.signature
                        );
                        return;
                    }
                }
                state.properties.insert(name.to_owned(), value);
            }
            None => {
                state.properties.remove(name);
            }
        }
    }

    pub fn connect_properties_changed<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&BTreeMap<String, Value>, &[String]) + Send + Sync + 'static,
    {
        self.properties_changed_handlers.connect(Arc::new(callback))
    }

    /// Observes remote signals, all of them or only `signal_name`. The
    /// callback receives the sender, the signal name and the argument tuple.
    pub fn connect_signal<F>(&self, signal_name: Option<&str>, callback: F) -> HandlerId
    where
        F: Fn(Option<&str>, &str, &Value) + Send + Sync + 'static,
    {
        self.signal_handlers.connect(Arc::new(SignalHandler {
            signal_name: signal_name.map(str::to_owned),
            callback: Box::new(callback),
        }))
    }

    pub fn connect_notify<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(ProxyProperty) + Send + Sync + 'static,
    {
        self.notify_handlers.connect(Arc::new(callback))
    }

    pub fn disconnect(&self, id: HandlerId) {
        let _ = self.properties_changed_handlers.disconnect(id)
            || self.signal_handlers.disconnect(id)
            || self.notify_handlers.disconnect(id);
    }

    pub(crate) fn emit_properties_changed(&self, changed: BTreeMap<String, Value>, invalidated: Vec<String>) {
        let handlers = self.properties_changed_handlers.snapshot();
        if handlers.is_empty() {
            return;
        }
        self.context.invoke(move || {
            for handler in handlers {
                handler(&changed, &invalidated);
            }
        });
    }

    pub(crate) fn emit_signal(&self, sender: Option<String>, signal_name: String, parameters: Value) {
        let handlers: Vec<_> = self
            .signal_handlers
            .snapshot()
            .into_iter()
            .filter(|h| h.signal_name.as_deref().map_or(true, |n| n == signal_name))
            .collect();
        if handlers.is_empty() {
            return;
        }
        self.context.invoke(move || {
            for handler in handlers {
                (handler.callback)(sender.as_deref(), &signal_name, &parameters);
            }
        });
    }

    fn notify(&self, property: ProxyProperty) {
        let handlers = self.notify_handlers.snapshot();
        if handlers.is_empty() {
            return;
        }
        self.context.invoke(move || {
            for handler in handlers {
                handler(property);
            }
        });
    }

    /// Installs the signal subscriptions. Runs before the name owner is
    /// resolved so that no change between resolution and subscription is
    /// missed.
    fn subscribe(&self) {
        let signal_flags = if self.flags.contains(ProxyFlags::NO_MATCH_RULE) {
            SignalFlags::NO_MATCH_RULE
        } else {
            SignalFlags::empty()
        };
        let mut ids = Vec::new();
        if !self.flags.contains(ProxyFlags::DO_NOT_LOAD_PROPERTIES) {
            let weak = self.weak_self.clone();
            ids.push(self.connection.signal_subscribe(
                SignalRule {
                    sender: self.name.clone(),
                    interface: Some(PROPERTIES_INTERFACE.into()),
                    member: Some("PropertiesChanged".into()),
                    path: Some(self.object_path.clone()),
                    arg0: Some(self.interface_name.clone()),
                    flags: signal_flags,
                    ..Default::default()
                },
                Arc::new(move |message| {
                    if let Some(proxy) = weak.upgrade() {
                        proxy.on_properties_changed(message);
                    }
                }),
            ));
        }
        if !self.flags.contains(ProxyFlags::DO_NOT_CONNECT_SIGNALS) {
            let weak = self.weak_self.clone();
            ids.push(self.connection.signal_subscribe(
                SignalRule {
                    sender: self.name.clone(),
                    interface: Some(self.interface_name.clone()),
                    path: Some(self.object_path.clone()),
                    flags: signal_flags,
                    ..Default::default()
                },
                Arc::new(move |message| {
                    if let Some(proxy) = weak.upgrade() {
                        proxy.on_signal_received(message);
                    }
                }),
            ));
        }
        if let Some(name) = &self.name {
            if self.connection.is_message_bus() {
                let weak = self.weak_self.clone();
                ids.push(self.connection.signal_subscribe(
                    SignalRule {
                        sender: Some(DBUS_NAME.into()),
                        interface: Some(DBUS_INTERFACE.into()),
                        member: Some("NameOwnerChanged".into()),
                        path: Some(DBUS_PATH.into()),
                        arg0: Some(name.clone()),
                        flags: signal_flags,
                        ..Default::default()
                    },
                    Arc::new(move |message| {
                        if let Some(proxy) = weak.upgrade() {
                            proxy.on_name_owner_changed(message);
                        }
                    }),
                ));
            }
        }
        self.subscriptions.lock().extend(ids);
    }

    /// Caches `value` unless the expected interface declares another type.
    fn insert_property_checked(state: &mut ProxyState, name: &str, value: Value) {
        if let Some(info) = state
            .expected_interface
            .as_ref()
            .and_then(|i| i.lookup_property(name))
        {
            let actual = value.type_string();
            if info.signature != actual {
                warn!(
                    "Received property {} with type {} does not match expected type {} in the \
                     expected interface",
                    name, actual, info.signature
                );
                return;
            }
        }
        state.properties.insert(name.to_owned(), value);
    }

    /// Whether a signal from `sender` may be acted on.
    fn accepts_sender(state: &ProxyState, sender: Option<&str>) -> bool {
        state.initialized
            && match &state.name_owner {
                Some(owner) => sender == Some(owner.as_str()),
                None => true,
            }
    }

    fn on_signal_received(&self, message: &Message) {
        let signal_name = match message.member() {
            Some(member) => member.to_owned(),
            None => return,
        };
        let parameters = message.body().cloned().unwrap_or_else(|| Value::tuple(Vec::new()));
        {
            let state = self.state.read();
            if !Self::accepts_sender(&state, message.sender()) {
                return;
            }
            if let Some(info) = state
                .expected_interface
                .as_ref()
                .and_then(|i| i.lookup_signal(&signal_name))
            {
                let expected = info.signature();
                let actual = message.body_type_string();
                if expected != actual {
                    warn!(
                        "Dropping signal {} of type {} since the type from the expected interface is {}",
                        signal_name, actual, expected
                    );
                    return;
                }
            }
        }
        self.emit_signal(message.sender().map(str::to_owned), signal_name, parameters);
    }

    fn on_properties_changed(&self, message: &Message) {
        let body_type = message.body_type_string();
        let (changed, invalidated, fetch) = {
            let mut state = self.state.write();
            if !Self::accepts_sender(&state, message.sender()) {
                return;
            }
            if body_type != "(sa{sv}as)" {
                warn!(
                    "Value for PropertiesChanged signal with type '{}' does not match '(sa{{sv}}as)'",
                    body_type
                );
                return;
            }
            let args = message.args();
            if args[0].as_str() != Some(self.interface_name.as_str()) {
                return;
            }
            let changed = args[1].to_vardict();
            let invalidated: Vec<String> = args[2]
                .as_str_vec()
                .unwrap_or_default()
                .into_iter()
                .map(str::to_owned)
                .collect();
            for (name, value) in &changed {
                Self::insert_property_checked(&mut state, name, value.clone());
            }
            let fetch = if self.flags.contains(ProxyFlags::GET_INVALIDATED_PROPERTIES) {
                state.name_owner.clone()
            } else {
                for name in &invalidated {
                    state.properties.remove(name);
                }
                None
            };
            (changed, invalidated, fetch)
        };
        let emit = match &fetch {
            Some(owner) => {
                for name in &invalidated {
                    self.fetch_invalidated_property(owner, name);
                }
                !changed.is_empty()
            }
            None if self.flags.contains(ProxyFlags::GET_INVALIDATED_PROPERTIES) => !changed.is_empty(),
            None => true,
        };
        if emit {
            self.emit_properties_changed(changed, invalidated);
        }
    }

    /// Fetches one invalidated property and reports it as a one-entry
    /// change. Errors are ignored; the owner may already be gone.
    fn fetch_invalidated_property(&self, owner: &str, name: &str) {
        let weak = self.weak_self.clone();
        let property = name.to_owned();
        let call = MethodCall::new(
            Some(owner),
            &self.object_path,
            Some(PROPERTIES_INTERFACE),
            "Get",
        )
        .with_body(Value::tuple(vec![
            self.interface_name.as_str().into(),
            name.into(),
        ]))
        .with_reply_type("(v)");
        self.connection.call_with_callback(
            call,
            None,
            Some(Box::new(move |result| {
                let (proxy, reply) = match (weak.upgrade(), result) {
                    (Some(proxy), Ok(reply)) => (proxy, reply),
                    _ => return,
                };
                let value = match reply.args().first() {
                    Some(Value::Variant(inner)) => (**inner).clone(),
                    _ => return,
                };
                Self::insert_property_checked(&mut proxy.state.write(), &property, value.clone());
                let mut changed = BTreeMap::new();
                changed.insert(property, value);
                proxy.emit_properties_changed(changed, Vec::new());
            })),
        );
    }

    /// Ingests a `GetAll` reply and reports its content as changed if the
    /// cache ends up non-empty.
    fn process_get_all_reply(&self, reply: &Message) {
        let body_type = reply.body_type_string();
        if body_type != "(a{sv})" {
            warn!(
                "Value for GetAll reply with type '{}' does not match '(a{{sv}})'",
                body_type
            );
            return;
        }
        let changed = reply.args()[0].to_vardict();
        let populated = {
            let mut state = self.state.write();
            for (name, value) in &changed {
                Self::insert_property_checked(&mut state, name, value.clone());
            }
            !state.properties.is_empty()
        };
        if populated {
            self.emit_properties_changed(changed, Vec::new());
        }
    }

    fn get_all_call(&self, destination: Option<&str>) -> MethodCall {
        MethodCall::new(
            destination,
            &self.object_path,
            Some(PROPERTIES_INTERFACE),
            "GetAll",
        )
        .with_body(Value::tuple(vec![self.interface_name.as_str().into()]))
        .with_reply_type("(a{sv})")
    }

    fn on_name_owner_changed(&self, message: &Message) {
        let cancel = self.state.write().get_all_cancellable.take();
        if let Some(cancellable) = cancel {
            cancellable.cancel();
        }

        let new_owner = match message.args() {
            [_, _, Value::String(new_owner)] => new_owner.clone(),
            _ => return,
        };

        if new_owner.is_empty() {
            let invalidated = {
                let mut state = self.state.write();
                state.name_owner = None;
                if self.flags.contains(ProxyFlags::DO_NOT_LOAD_PROPERTIES) {
                    Vec::new()
                } else {
                    let keys: Vec<String> = state.properties.keys().cloned().collect();
                    state.properties.clear();
                    keys
                }
            };
            if !invalidated.is_empty() {
                self.emit_properties_changed(BTreeMap::new(), invalidated);
            }
            self.notify(ProxyProperty::NameOwner);
            return;
        }

        if self.state.read().name_owner.as_deref() == Some(new_owner.as_str()) {
            return;
        }

        if self.flags.contains(ProxyFlags::DO_NOT_LOAD_PROPERTIES) {
            {
                let mut state = self.state.write();
                state.name_owner = Some(new_owner);
                state.properties.clear();
            }
            self.notify(ProxyProperty::NameOwner);
            return;
        }

        let cancellable = Cancellable::new();
        self.state.write().get_all_cancellable = Some(cancellable.clone());
        let weak = self.weak_self.clone();
        let call = self.get_all_call(Some(&new_owner));
        let token = cancellable.clone();
        self.connection.call_with_callback(
            call,
            Some(&cancellable),
            Some(Box::new(move |result| {
                let proxy = match weak.upgrade() {
                    Some(proxy) => proxy,
                    None => return,
                };
                {
                    let mut state = proxy.state.write();
                    if state
                        .get_all_cancellable
                        .as_ref()
                        .map_or(false, |c| c.ptr_eq(&token))
                    {
                        state.get_all_cancellable = None;
                    }
                    if token.is_cancelled() || matches!(result, Err(Error::Cancelled)) {
                        return;
                    }
                    state.name_owner = Some(new_owner);
                    state.properties.clear();
                }
                match result {
                    Ok(reply) => proxy.process_get_all_reply(&reply),
                    Err(e) => debug!("Error loading properties after owner change: {}", e),
                }
                proxy.notify(ProxyProperty::NameOwner);
            })),
        );
    }

    /// Resolves the owner, loads properties, then calls `done`.
    fn init(self: &Arc<Self>, cancellable: Option<Cancellable>, done: Box<dyn FnOnce(Result<()>) + Send>) {
        match self.name.clone() {
            None => self.init_resolved(None, cancellable, done),
            Some(name) if is_unique_name(&name) => self.init_resolved(Some(name), cancellable, done),
            Some(name) => {
                if self.flags.intersects(
                    ProxyFlags::DO_NOT_AUTO_START | ProxyFlags::DO_NOT_AUTO_START_AT_CONSTRUCTION,
                ) {
                    self.init_get_name_owner(name, cancellable, done);
                } else {
                    self.init_start_service(name, cancellable, done);
                }
            }
        }
    }

    fn init_start_service(
        self: &Arc<Self>,
        name: String,
        cancellable: Option<Cancellable>,
        done: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let proxy = self.clone();
        let call = MethodCall::bus("StartServiceByName")
            .with_body(Value::tuple(vec![name.as_str().into(), Value::UInt32(0)]))
            .with_reply_type("(u)");
        let inner_cancellable = cancellable.clone();
        self.connection.call_with_callback(
            call,
            cancellable.as_ref(),
            Some(Box::new(move |result| match result {
                Ok(reply) => match reply.args().first().and_then(Value::as_u32) {
                    Some(1) | Some(2) => proxy.init_get_name_owner(name, inner_cancellable, done),
                    code => done(Err(Error::invalid(format!(
                        "Unexpected reply {} from StartServiceByName(\"{}\") method",
                        code.unwrap_or(0),
                        name
                    )))),
                },
                Err(e) => match e.dbus_name() {
                    Some("org.freedesktop.DBus.Error.ServiceUnknown")
                    | Some("org.freedesktop.systemd1.Masked") => {
                        debug!("Not starting {}: {}", name, e);
                        proxy.init_get_name_owner(name, inner_cancellable, done)
                    }
                    _ => done(Err(prefix_error(
                        e,
                        &format!("Error calling StartServiceByName for {}: ", name),
                    ))),
                },
            })),
        );
    }

    fn init_get_name_owner(
        self: &Arc<Self>,
        name: String,
        cancellable: Option<Cancellable>,
        done: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let proxy = self.clone();
        let call = MethodCall::bus("GetNameOwner")
            .with_body(Value::tuple(vec![name.as_str().into()]))
            .with_reply_type("(s)");
        let inner_cancellable = cancellable.clone();
        self.connection.call_with_callback(
            call,
            cancellable.as_ref(),
            Some(Box::new(move |result| match result {
                Ok(reply) => {
                    let owner = reply.arg0().map(str::to_owned);
                    proxy.init_resolved(owner, inner_cancellable, done)
                }
                Err(e) if e.dbus_name() == Some("org.freedesktop.DBus.Error.NameHasNoOwner") => {
                    proxy.init_resolved(None, inner_cancellable, done)
                }
                Err(e) => done(Err(e)),
            })),
        );
    }

    fn init_resolved(
        self: &Arc<Self>,
        owner: Option<String>,
        cancellable: Option<Cancellable>,
        done: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let get_all = !self.flags.contains(ProxyFlags::DO_NOT_LOAD_PROPERTIES)
            && !(owner.is_none() && self.name.is_some());
        self.state.write().name_owner = owner.clone();
        if !get_all {
            self.init_done(done);
            return;
        }
        let proxy = self.clone();
        self.connection.call_with_callback(
            self.get_all_call(owner.as_deref()),
            cancellable.as_ref(),
            Some(Box::new(move |result| {
                match result {
                    Ok(reply) => proxy.process_get_all_reply(&reply),
                    Err(e) => debug!(
                        "Ignoring error loading properties of {} at {}: {}",
                        proxy.interface_name, proxy.object_path, e
                    ),
                }
                proxy.init_done(done);
            })),
        );
    }

    fn init_done(&self, done: Box<dyn FnOnce(Result<()>) + Send>) {
        self.state.write().initialized = true;
        done(Ok(()));
    }

    /// Computes where a call goes and which reply type the expected
    /// interface declares for it.
    fn prepare_call(
        &self,
        method_name: &str,
        timeout_ms: i32,
    ) -> Result<(Option<String>, String, String, Option<String>, i32)> {
        let (interface, method, split) = match method_name.rfind('.') {
            Some(ix) => (&method_name[..ix], &method_name[ix + 1..], true),
            None => (self.interface_name.as_str(), method_name, false),
        };
        let state = self.state.read();
        let reply_type = if split {
            None
        } else {
            state
                .expected_interface
                .as_ref()
                .and_then(|i| i.lookup_method(method))
                .map(|m| m.out_signature())
        };
        let destination = match &self.name {
            None => None,
            Some(name) => match &state.name_owner {
                Some(owner) => Some(owner.clone()),
                None if self.flags.contains(ProxyFlags::DO_NOT_AUTO_START) => {
                    return Err(Error::invalid(format!(
                        "Cannot invoke method; proxy is for the well-known name {} without an \
                         owner, and proxy was constructed with the DO_NOT_AUTO_START flag",
                        name
                    )))
                }
                None => Some(name.clone()),
            },
        };
        let timeout_ms = if timeout_ms == DEFAULT_TIMEOUT {
            state.timeout_ms
        } else {
            timeout_ms
        };
        Ok((
            destination,
            interface.to_owned(),
            method.to_owned(),
            reply_type,
            timeout_ms,
        ))
    }

    /// Calls `method_name` (optionally `interface.Method`) on the remote
    /// object. Without a callback the call is sent with NO_REPLY_EXPECTED.
    #[allow(clippy::too_many_arguments)]
    pub fn call_with_callback(
        &self,
        method_name: &str,
        parameters: Option<Value>,
        flags: CallFlags,
        timeout_ms: i32,
        fd_list: Option<FdList>,
        cancellable: Option<&Cancellable>,
        callback: Option<CallCallback>,
    ) {
        let (destination, interface, method, reply_type, timeout_ms) =
            match self.prepare_call(method_name, timeout_ms) {
                Ok(prepared) => prepared,
                Err(e) => {
                    match callback {
                        Some(callback) => MainContext::ref_thread_default().invoke(move || callback(Err(e))),
                        None => debug!("Not calling {}: {}", method_name, e),
                    }
                    return;
                }
            };
        let mut call = MethodCall::new(
            destination.as_deref(),
            &self.object_path,
            Some(&interface),
            &method,
        )
        .with_flags(flags)
        .with_timeout(timeout_ms)
        .with_unix_fd_list(fd_list);
        if let Some(parameters) = parameters {
            call = call.with_body(parameters);
        }
        let callback = callback.map(|callback| -> crate::connection::ReplyCallback {
            Box::new(move |result: Result<Message>| {
                callback(result.map(|mut reply| {
                    if let Some(expected) = &reply_type {
                        let actual = reply.body_type_string();
                        if actual != *expected {
                            warn!(
                                "Method {} returned type {} but the expected interface declares {}",
                                method, actual, expected
                            );
                        }
                    }
                    let fd_list = reply.take_unix_fd_list();
                    let body = reply.body().cloned().unwrap_or_else(|| Value::tuple(Vec::new()));
                    (body, fd_list)
                }))
            })
        });
        self.connection.call_with_callback(call, cancellable, callback);
    }

    pub fn call(
        &self,
        method_name: &str,
        parameters: Option<Value>,
        flags: CallFlags,
        timeout_ms: i32,
        cancellable: Option<&Cancellable>,
    ) -> BoxFuture<'static, Result<Value>> {
        self.call_with_unix_fd_list(method_name, parameters, flags, timeout_ms, None, cancellable)
            .map(|result| result.map(|(body, _)| body))
            .boxed()
    }

    pub fn call_with_unix_fd_list(
        &self,
        method_name: &str,
        parameters: Option<Value>,
        flags: CallFlags,
        timeout_ms: i32,
        fd_list: Option<FdList>,
        cancellable: Option<&Cancellable>,
    ) -> BoxFuture<'static, Result<(Value, Option<FdList>)>> {
        let (tx, rx) = oneshot::channel();
        self.call_with_callback(
            method_name,
            parameters,
            flags,
            timeout_ms,
            fd_list,
            cancellable,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.map(|received| received.unwrap_or(Err(Error::Cancelled))).boxed()
    }

    pub fn call_sync(
        &self,
        method_name: &str,
        parameters: Option<Value>,
        flags: CallFlags,
        timeout_ms: i32,
        cancellable: Option<&Cancellable>,
    ) -> Result<Value> {
        self.call_with_unix_fd_list_sync(method_name, parameters, flags, timeout_ms, None, cancellable)
            .map(|(body, _)| body)
    }

    pub fn call_with_unix_fd_list_sync(
        &self,
        method_name: &str,
        parameters: Option<Value>,
        flags: CallFlags,
        timeout_ms: i32,
        fd_list: Option<FdList>,
        cancellable: Option<&Cancellable>,
    ) -> Result<(Value, Option<FdList>)> {
        MainContext::run_sync(|done| {
            self.call_with_callback(
                method_name,
                parameters,
                flags,
                timeout_ms,
                fd_list,
                cancellable,
                Some(done),
            )
        })
    }
}

/// Keeps the error's kind and puts `prefix` in front of its text.
fn prefix_error(error: Error, prefix: &str) -> Error {
    match error {
        Error::DBus(e) => Error::DBus(DBusError::new(e.name, format!("{}{}", prefix, e.message))),
        Error::InvalidArgument(s) => Error::InvalidArgument(format!("{}{}", prefix, s)),
        Error::NotSupported(s) => Error::NotSupported(format!("{}{}", prefix, s)),
        other => other,
    }
}

impl DBusInterface for Proxy {
    fn info(&self) -> Option<Arc<InterfaceInfo>> {
        self.interface_info()
    }

    fn object(&self) -> Option<Arc<ObjectProxy>> {
        self.state.read().object.upgrade()
    }

    fn set_object(&self, object: Option<&Arc<ObjectProxy>>) {
        self.state.write().object = object.map(Arc::downgrade).unwrap_or_default();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        for id in self.subscriptions.get_mut().drain(..) {
            self.connection.signal_unsubscribe(id);
        }
        if let Some(cancellable) = self.state.get_mut().get_all_cancellable.take() {
            cancellable.cancel();
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("object_path", &self.object_path)
            .field("interface_name", &self.interface_name)
            .field("flags", &self.flags)
            .field("name_owner", &self.state.read().name_owner)
            .finish()
    }
}
