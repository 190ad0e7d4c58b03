//! Client side of `org.freedesktop.DBus.ObjectManager`.
//!
//! [`ObjectManagerClient`] mirrors the object tree a remote object manager
//! publishes. It loads the tree with `GetManagedObjects`, keeps it current
//! from `InterfacesAdded` / `InterfacesRemoved`, and routes every other
//! signal under the manager path to the interface proxy it concerns. When
//! the remote name changes hands the tree is dropped and reloaded from the
//! new owner.
//!
//! The tree is rebuilt in a fixed order: `ObjectAdded` for a new object,
//! then `InterfaceAdded` for each of its interfaces. Name-owner
//! notifications come after the objects of a new owner are in place, and
//! before the objects of a vanished owner are reported removed.

use crate::cancellable::Cancellable;
use crate::connection::{
    CallFlags, Connection, ConnectionExt, MethodCall, SignalFlags, SignalRule, SubscriptionId,
    DEFAULT_TIMEOUT, OBJECT_MANAGER_INTERFACE, PROPERTIES_INTERFACE,
};
use crate::context::MainContext;
use crate::error::Result;
use crate::handlers::{HandlerId, HandlerList};
use crate::message::Message;
use crate::object_proxy::ObjectProxy;
use crate::proxy::{Proxy, ProxyBuilder, ProxyFlags, ProxyProperty};
use crate::value::Value;

use bitflags::bitflags;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ObjectManagerFlags: u32 {
        /// Do not ask the bus to start the manager's owner.
        const DO_NOT_AUTO_START = 1 << 0;
    }
}

/// Decides how interface proxies are built for the objects a manager
/// discovers.
///
/// The builder passed in already carries the connection, the current
/// owner as bus name, the object path and interface name, and the flags
/// `DO_NOT_LOAD_PROPERTIES | DO_NOT_CONNECT_SIGNALS`; the manager feeds the
/// proxy its properties and signals. Factories typically attach an
/// [`InterfaceInfo`](crate::introspection::InterfaceInfo) for known
/// interfaces.
pub trait ProxyFactory: Send + Sync {
    fn build_interface_proxy(
        &self,
        object_path: &str,
        interface_name: &str,
        builder: ProxyBuilder,
    ) -> Result<Arc<Proxy>> {
        let _ = (object_path, interface_name);
        builder.build_sync(None)
    }
}

/// Builds plain proxies.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultProxyFactory;

impl ProxyFactory for DefaultProxyFactory {}

type ObjectFn = dyn Fn(&Arc<ObjectProxy>) + Send + Sync;
type InterfaceFn = dyn Fn(&Arc<ObjectProxy>, &Arc<Proxy>) + Send + Sync;
type InterfacePropertiesFn =
    dyn Fn(&Arc<ObjectProxy>, &Arc<Proxy>, &BTreeMap<String, Value>, &[String]) + Send + Sync;
type InterfaceSignalFn =
    dyn Fn(&Arc<ObjectProxy>, &Arc<Proxy>, Option<&str>, &str, &Value) + Send + Sync;
type NotifyFn = dyn Fn() + Send + Sync;

#[derive(Default)]
struct ManagerState {
    name_owner: Option<String>,
    objects: BTreeMap<String, Arc<ObjectProxy>>,
    signal_subscription: Option<SubscriptionId>,
    match_rule: Option<String>,
    load_cancellable: Option<Cancellable>,
}

pub struct ObjectManagerClient {
    connection: Arc<dyn Connection>,
    name: Option<String>,
    object_path: String,
    flags: ObjectManagerFlags,
    factory: Arc<dyn ProxyFactory>,
    context: MainContext,
    control_proxy: Arc<Proxy>,
    control_handlers: Mutex<Vec<HandlerId>>,
    state: Mutex<ManagerState>,
    object_added: HandlerList<ObjectFn>,
    object_removed: HandlerList<ObjectFn>,
    interface_added: HandlerList<InterfaceFn>,
    interface_removed: HandlerList<InterfaceFn>,
    interface_properties_changed: HandlerList<InterfacePropertiesFn>,
    interface_signal: HandlerList<InterfaceSignalFn>,
    name_owner_notify: HandlerList<NotifyFn>,
    weak_self: Weak<ObjectManagerClient>,
}

pub struct ObjectManagerClientBuilder {
    connection: Arc<dyn Connection>,
    name: Option<String>,
    object_path: String,
    flags: ObjectManagerFlags,
    factory: Arc<dyn ProxyFactory>,
}

impl ObjectManagerClientBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn flags(mut self, flags: ObjectManagerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ProxyFactory>) -> Self {
        self.factory = factory;
        self
    }

    fn control_proxy_builder(&self) -> ProxyBuilder {
        let mut flags = ProxyFlags::DO_NOT_LOAD_PROPERTIES;
        if self.flags.contains(ObjectManagerFlags::DO_NOT_AUTO_START) {
            flags |= ProxyFlags::DO_NOT_AUTO_START;
        }
        let builder = Proxy::builder(
            self.connection.clone(),
            &self.object_path,
            OBJECT_MANAGER_INTERFACE,
        )
        .flags(flags);
        match &self.name {
            Some(name) => builder.name(name),
            None => builder,
        }
    }

    fn assemble(self, control_proxy: Arc<Proxy>) -> Arc<ObjectManagerClient> {
        let manager = Arc::new_cyclic(|weak_self| ObjectManagerClient {
            connection: self.connection,
            name: self.name,
            object_path: self.object_path,
            flags: self.flags,
            factory: self.factory,
            context: MainContext::ref_thread_default(),
            control_proxy,
            control_handlers: Mutex::new(Vec::new()),
            state: Mutex::new(ManagerState::default()),
            object_added: HandlerList::new(),
            object_removed: HandlerList::new(),
            interface_added: HandlerList::new(),
            interface_removed: HandlerList::new(),
            interface_properties_changed: HandlerList::new(),
            interface_signal: HandlerList::new(),
            name_owner_notify: HandlerList::new(),
            weak_self: weak_self.clone(),
        });
        let weak = manager.weak_self.clone();
        let notify = manager.control_proxy.connect_notify(move |property| {
            if property != ProxyProperty::NameOwner {
                return;
            }
            if let Some(manager) = weak.upgrade() {
                manager.on_name_owner_changed();
            }
        });
        let weak = manager.weak_self.clone();
        let signal = manager
            .control_proxy
            .connect_signal(None, move |_, signal_name, parameters| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_control_signal(signal_name, parameters);
                }
            });
        manager.control_handlers.lock().extend([notify, signal]);
        manager
    }

    pub fn build_with_callback(
        self,
        cancellable: Option<&Cancellable>,
        callback: Box<dyn FnOnce(Result<Arc<ObjectManagerClient>>) + Send>,
    ) {
        let control_builder = self.control_proxy_builder();
        let load_cancellable = cancellable.cloned();
        control_builder.build_with_callback(
            cancellable,
            Box::new(move |result| match result {
                Ok(control_proxy) => {
                    let manager = self.assemble(control_proxy);
                    let loaded = manager.clone();
                    manager.load_initial(
                        load_cancellable,
                        Box::new(move |result| callback(result.map(|()| loaded))),
                    );
                }
                Err(e) => callback(Err(e)),
            }),
        );
    }

    pub fn build(
        self,
        cancellable: Option<&Cancellable>,
    ) -> BoxFuture<'static, Result<Arc<ObjectManagerClient>>> {
        let (tx, rx) = oneshot::channel();
        self.build_with_callback(
            cancellable,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.map(|received| received.unwrap_or(Err(crate::error::Error::Cancelled)))
            .boxed()
    }

    /// Builds the client and loads the initial object tree. Failing to
    /// load the tree from a known owner fails construction.
    pub fn build_sync(self, cancellable: Option<&Cancellable>) -> Result<Arc<ObjectManagerClient>> {
        let control_proxy = self.control_proxy_builder().build_sync(cancellable)?;
        let manager = self.assemble(control_proxy);
        let cancellable = cancellable.cloned();
        let loading = manager.clone();
        MainContext::run_sync(move |done| loading.load_initial(cancellable, done))?;
        Ok(manager)
    }
}

/// Iterates the entries of any dictionary array.
fn dict_entries(value: &Value) -> impl Iterator<Item = (&Value, &Value)> {
    value
        .as_array()
        .map(|a| a.items())
        .unwrap_or(&[])
        .iter()
        .filter_map(|entry| match entry {
            Value::DictEntry(k, v) => Some((&**k, &**v)),
            _ => None,
        })
}

impl ObjectManagerClient {
    pub fn builder(connection: Arc<dyn Connection>, object_path: &str) -> ObjectManagerClientBuilder {
        ObjectManagerClientBuilder {
            connection,
            name: None,
            object_path: object_path.to_owned(),
            flags: ObjectManagerFlags::empty(),
            factory: Arc::new(DefaultProxyFactory),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn flags(&self) -> ObjectManagerFlags {
        self.flags
    }

    /// The unique name the tree was loaded from. `None` while the remote
    /// name has no owner or a reload is in progress.
    pub fn name_owner(&self) -> Option<String> {
        self.state.lock().name_owner.clone()
    }

    pub fn objects(&self) -> Vec<Arc<ObjectProxy>> {
        self.state.lock().objects.values().cloned().collect()
    }

    pub fn object(&self, object_path: &str) -> Option<Arc<ObjectProxy>> {
        self.state.lock().objects.get(object_path).cloned()
    }

    pub fn interface(&self, object_path: &str, interface_name: &str) -> Option<Arc<Proxy>> {
        self.object(object_path)?.interface(interface_name)
    }

    pub fn connect_object_added<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>) + Send + Sync + 'static,
    {
        self.object_added.connect(Arc::new(callback))
    }

    pub fn connect_object_removed<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>) + Send + Sync + 'static,
    {
        self.object_removed.connect(Arc::new(callback))
    }

    pub fn connect_interface_added<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>, &Arc<Proxy>) + Send + Sync + 'static,
    {
        self.interface_added.connect(Arc::new(callback))
    }

    pub fn connect_interface_removed<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>, &Arc<Proxy>) + Send + Sync + 'static,
    {
        self.interface_removed.connect(Arc::new(callback))
    }

    /// Called after an interface proxy's cache took a remote
    /// `PropertiesChanged`.
    pub fn connect_interface_proxy_properties_changed<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>, &Arc<Proxy>, &BTreeMap<String, Value>, &[String])
            + Send
            + Sync
            + 'static,
    {
        self.interface_properties_changed.connect(Arc::new(callback))
    }

    pub fn connect_interface_proxy_signal<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Arc<ObjectProxy>, &Arc<Proxy>, Option<&str>, &str, &Value) + Send + Sync + 'static,
    {
        self.interface_signal.connect(Arc::new(callback))
    }

    /// Called whenever [`ObjectManagerClient::name_owner`] changes.
    pub fn connect_name_owner_notify<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.name_owner_notify.connect(Arc::new(callback))
    }

    pub fn disconnect(&self, id: HandlerId) {
        let _ = self.object_added.disconnect(id)
            || self.object_removed.disconnect(id)
            || self.interface_added.disconnect(id)
            || self.interface_removed.disconnect(id)
            || self.interface_properties_changed.disconnect(id)
            || self.interface_signal.disconnect(id)
            || self.name_owner_notify.disconnect(id);
    }

    fn emit<F, C>(&self, handlers: &HandlerList<F>, call: C)
    where
        F: ?Sized + Send + Sync + 'static,
        C: Fn(&F) + Send + 'static,
    {
        let handlers = handlers.snapshot();
        if handlers.is_empty() {
            return;
        }
        self.context.invoke(move || {
            for handler in &handlers {
                call(handler.as_ref());
            }
        });
    }

    fn emit_object_added(&self, object: &Arc<ObjectProxy>) {
        let object = object.clone();
        self.emit(&self.object_added, move |h| h(&object));
    }

    fn emit_object_removed(&self, object: &Arc<ObjectProxy>) {
        let object = object.clone();
        self.emit(&self.object_removed, move |h| h(&object));
    }

    fn emit_interface_added(&self, object: &Arc<ObjectProxy>, proxy: &Arc<Proxy>) {
        let (object, proxy) = (object.clone(), proxy.clone());
        self.emit(&self.interface_added, move |h| h(&object, &proxy));
    }

    fn emit_interface_removed(&self, object: &Arc<ObjectProxy>, proxy: &Arc<Proxy>) {
        let (object, proxy) = (object.clone(), proxy.clone());
        self.emit(&self.interface_removed, move |h| h(&object, &proxy));
    }

    fn emit_name_owner_notify(&self) {
        self.emit(&self.name_owner_notify, |h| h());
    }

    /// Loads the tree from the owner the control proxy resolved. A
    /// well-known name without an owner leaves the tree empty.
    fn load_initial(
        self: &Arc<Self>,
        cancellable: Option<Cancellable>,
        done: Box<dyn FnOnce(Result<()>) + Send>,
    ) {
        let owner = self.control_proxy.name_owner();
        self.state.lock().name_owner = owner.clone();
        if owner.is_none() && self.name.is_some() {
            done(Ok(()));
            return;
        }
        self.subscribe_signals(owner.as_deref());
        let manager = self.clone();
        self.control_proxy.call_with_callback(
            "GetManagedObjects",
            None,
            CallFlags::empty(),
            DEFAULT_TIMEOUT,
            None,
            cancellable.as_ref(),
            Some(Box::new(move |result| match result {
                Ok((body, _)) => {
                    manager.process_managed_objects(&body, owner.as_deref());
                    done(Ok(()))
                }
                Err(e) => {
                    manager.unsubscribe_signals();
                    done(Err(e))
                }
            })),
        );
    }

    /// Installs the single subscription that carries signals for managed
    /// objects, backed by a broker match rule when the broker accepts one.
    fn subscribe_signals(&self, owner: Option<&str>) {
        self.unsubscribe_signals();
        let mut match_rule = None;
        let mut flags = SignalFlags::NO_MATCH_RULE;
        if let Some(owner) = owner {
            // path_namespace='/' matches nothing on some brokers
            let rule = if self.object_path == "/" {
                format!("type='signal',sender='{}'", owner)
            } else {
                format!(
                    "type='signal',sender='{}',path_namespace='{}'",
                    owner, self.object_path
                )
            };
            let add = MethodCall::bus("AddMatch").with_body(Value::tuple(vec![rule.as_str().into()]));
            match self.connection.call_sync(add, None) {
                Ok(_) => match_rule = Some(rule),
                Err(e) => {
                    debug!(
                        "Broker refused match rule {}, subscribing to all signals of {}: {}",
                        rule, owner, e
                    );
                    flags = SignalFlags::empty();
                }
            }
        }
        let weak = self.weak_self.clone();
        let rule = SignalRule {
            sender: owner.map(str::to_owned),
            flags,
            ..Default::default()
        };
        let id = self.context.with_thread_default(|| {
            self.connection.signal_subscribe(
                rule,
                Arc::new(move |message| {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_signal(message);
                    }
                }),
            )
        });
        let mut state = self.state.lock();
        state.signal_subscription = Some(id);
        state.match_rule = match_rule;
    }

    fn unsubscribe_signals(&self) {
        let (subscription, match_rule) = {
            let mut state = self.state.lock();
            (state.signal_subscription.take(), state.match_rule.take())
        };
        if let Some(id) = subscription {
            self.connection.signal_unsubscribe(id);
        }
        if let Some(rule) = match_rule {
            let remove =
                MethodCall::bus("RemoveMatch").with_body(Value::tuple(vec![rule.as_str().into()]));
            self.connection.call_with_callback(remove, None, None);
        }
    }

    fn process_managed_objects(&self, body: &Value, owner: Option<&str>) {
        let body_type = body.type_string();
        if body_type != "(a{oa{sa{sv}}})" {
            warn!(
                "GetManagedObjects returned type '{}', expected '(a{{oa{{sa{{sv}}}}}})'",
                body_type
            );
            return;
        }
        if let Some(objects) = body.child(0) {
            for (path, interfaces) in dict_entries(objects) {
                if let Some(path) = path.as_str() {
                    self.add_interfaces(path, interfaces, owner);
                }
            }
        }
    }

    fn build_interface_proxy(
        &self,
        object_path: &str,
        interface_name: &str,
        owner: Option<&str>,
    ) -> Result<Arc<Proxy>> {
        let builder = Proxy::builder(self.connection.clone(), object_path, interface_name).flags(
            ProxyFlags::DO_NOT_LOAD_PROPERTIES | ProxyFlags::DO_NOT_CONNECT_SIGNALS,
        );
        let builder = match owner {
            Some(owner) => builder.name(owner),
            None => builder,
        };
        // interface proxies deliver their callbacks where the manager does
        self.context.with_thread_default(|| {
            self.factory
                .build_interface_proxy(object_path, interface_name, builder)
        })
    }

    /// Merges `{interface → {property → value}}` into the object at
    /// `object_path`, creating the object if needed.
    fn add_interfaces(&self, object_path: &str, interfaces: &Value, owner: Option<&str>) {
        let existing = self.state.lock().objects.get(object_path).cloned();
        let (object, is_new) = match existing {
            Some(object) => (object, false),
            None => (ObjectProxy::new(self.connection.clone(), object_path), true),
        };
        let mut added = Vec::new();
        for (interface_name, properties) in dict_entries(interfaces) {
            let interface_name = match interface_name.as_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(proxy) = object.interface(interface_name) {
                for (name, value) in properties.vardict_entries() {
                    proxy.set_cached_property(name, Some(value.clone()));
                }
                continue;
            }
            let proxy = match self.build_interface_proxy(object_path, interface_name, owner) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(
                        "Error constructing proxy for path {} and interface {}: {}",
                        object_path, interface_name, e
                    );
                    continue;
                }
            };
            for (name, value) in properties.vardict_entries() {
                proxy.set_cached_property(name, Some(value.clone()));
            }
            object.add_interface(proxy.clone());
            added.push(proxy);
        }
        if is_new {
            self.state
                .lock()
                .objects
                .insert(object_path.to_owned(), object.clone());
            self.emit_object_added(&object);
        }
        for proxy in &added {
            self.emit_interface_added(&object, proxy);
        }
    }

    fn remove_interfaces(&self, object_path: &str, interface_names: &[&str]) {
        let object = {
            let mut state = self.state.lock();
            let object = match state.objects.get(object_path) {
                Some(object) => object.clone(),
                None => {
                    debug!(
                        "InterfacesRemoved for path {} but no object proxy exists",
                        object_path
                    );
                    return;
                }
            };
            if object.is_covered_by(interface_names) {
                state.objects.remove(object_path);
                drop(state);
                self.emit_object_removed(&object);
                return;
            }
            object
        };
        for name in interface_names {
            if let Some(proxy) = object.remove_interface(name) {
                self.emit_interface_removed(&object, &proxy);
            }
        }
    }

    fn on_control_signal(&self, signal_name: &str, parameters: &Value) {
        match (signal_name, parameters.as_struct()) {
            ("InterfacesAdded", Some([path, interfaces]))
                if parameters.type_string() == "(oa{sa{sv}})" =>
            {
                if let Some(path) = path.as_str() {
                    let owner = self.state.lock().name_owner.clone();
                    self.add_interfaces(path, interfaces, owner.as_deref());
                }
            }
            ("InterfacesRemoved", Some([path, names])) if parameters.type_string() == "(oas)" => {
                if let (Some(path), Some(names)) = (path.as_str(), names.as_str_vec()) {
                    self.remove_interfaces(path, &names);
                }
            }
            _ => {}
        }
    }

    /// Routes a signal from a managed object to its interface proxy, after
    /// updating that proxy's cache for `PropertiesChanged`.
    fn on_signal(&self, message: &Message) {
        let object = match message
            .path()
            .and_then(|path| self.state.lock().objects.get(path).cloned())
        {
            Some(object) => object,
            None => return,
        };
        let (interface, member) = match (message.interface(), message.member()) {
            (Some(interface), Some(member)) => (interface, member),
            _ => return,
        };
        if interface == PROPERTIES_INTERFACE {
            if member != "PropertiesChanged" || message.body_type_string() != "(sa{sv}as)" {
                return;
            }
            let args = message.args();
            let proxy = match args[0].as_str().and_then(|name| object.interface(name)) {
                Some(proxy) => proxy,
                None => return,
            };
            let changed = args[1].to_vardict();
            let invalidated: Vec<String> = args[2]
                .as_str_vec()
                .unwrap_or_default()
                .into_iter()
                .map(str::to_owned)
                .collect();
            for (name, value) in &changed {
                proxy.set_cached_property(name, Some(value.clone()));
            }
            for name in &invalidated {
                proxy.set_cached_property(name, None);
            }
            proxy.emit_properties_changed(changed.clone(), invalidated.clone());
            self.emit(&self.interface_properties_changed, move |h| {
                h(&object, &proxy, &changed, &invalidated)
            });
        } else {
            let proxy = match object.interface(interface) {
                Some(proxy) => proxy,
                None => return,
            };
            let sender = message.sender().map(str::to_owned);
            let signal_name = member.to_owned();
            let parameters = message
                .body()
                .cloned()
                .unwrap_or_else(|| Value::tuple(Vec::new()));
            proxy.emit_signal(sender.clone(), signal_name.clone(), parameters.clone());
            self.emit(&self.interface_signal, move |h| {
                h(&object, &proxy, sender.as_deref(), &signal_name, &parameters)
            });
        }
    }

    /// Drops the tree of the previous owner and reloads it from the new
    /// one. A load still running for an earlier owner is cancelled and
    /// its result discarded.
    fn on_name_owner_changed(&self) {
        let new_owner = self.control_proxy.name_owner();
        let (old_owner, superseded) = {
            let mut state = self.state.lock();
            (state.name_owner.take(), state.load_cancellable.take())
        };
        if let Some(cancellable) = superseded {
            cancellable.cancel();
        }

        if old_owner != new_owner {
            let objects: Vec<Arc<ObjectProxy>> = {
                let mut state = self.state.lock();
                std::mem::take(&mut state.objects).into_values().collect()
            };
            // name_owner() already read None if there was no old owner
            if old_owner.is_some() {
                self.emit_name_owner_notify();
            }
            for object in &objects {
                self.emit_object_removed(object);
            }
            self.unsubscribe_signals();
        }

        let owner = match new_owner {
            Some(owner) => owner,
            None => return,
        };
        self.subscribe_signals(Some(&owner));
        let cancellable = Cancellable::new();
        self.state.lock().load_cancellable = Some(cancellable.clone());
        let weak = self.weak_self.clone();
        let token = cancellable.clone();
        self.control_proxy.call_with_callback(
            "GetManagedObjects",
            None,
            CallFlags::empty(),
            DEFAULT_TIMEOUT,
            None,
            Some(&cancellable),
            Some(Box::new(move |result| {
                let manager = match weak.upgrade() {
                    Some(manager) => manager,
                    None => return,
                };
                if token.is_cancelled() {
                    return;
                }
                {
                    let mut state = manager.state.lock();
                    if state
                        .load_cancellable
                        .as_ref()
                        .map_or(false, |c| c.ptr_eq(&token))
                    {
                        state.load_cancellable = None;
                    }
                }
                match result {
                    Ok((body, _)) => manager.process_managed_objects(&body, Some(&owner)),
                    Err(e) => {
                        manager.unsubscribe_signals();
                        warn!(
                            "Error calling GetManagedObjects() when name owner {} for name {:?} came back: {}",
                            owner, manager.name, e
                        );
                    }
                }
                manager.state.lock().name_owner = Some(owner);
                manager.emit_name_owner_notify();
            })),
        );
    }
}

impl Drop for ObjectManagerClient {
    fn drop(&mut self) {
        for id in self.control_handlers.get_mut().drain(..) {
            self.control_proxy.disconnect(id);
        }
        if let Some(cancellable) = self.state.get_mut().load_cancellable.take() {
            cancellable.cancel();
        }
        self.unsubscribe_signals();
    }
}

impl fmt::Debug for ObjectManagerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectManagerClient")
            .field("name", &self.name)
            .field("object_path", &self.object_path)
            .field("name_owner", &state.name_owner)
            .field("objects", &state.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}
