//! Watching a bus name for owners coming and going.
//!
//! [`watch_name_on_connection`] reports `name_appeared` with the unique
//! name of the current owner and `name_vanished` when there is none. The
//! two strictly alternate, starting with whichever holds when the watch is
//! set up. A closed connection counts as the name vanishing.

use crate::connection::{
    BusCallback, Connection, ConnectionExt, MethodCall, SignalRule, SubscriptionId, DBUS_INTERFACE,
    DBUS_NAME, DBUS_PATH,
};
use crate::context::MainContext;
use crate::error::{Error, Result};
use crate::handlers::HandlerId;
use crate::message::Message;
use crate::names::is_name;
use crate::value::Value;

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::{const_mutex, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BusNameWatcherFlags: u32 {
        /// Ask the bus to start the name's owner when setting up the watch.
        const AUTO_START = 1 << 0;
    }
}

/// Receives the connection, the watched name and its owner.
pub type NameAppearedCallback = Arc<dyn Fn(&Arc<dyn Connection>, &str, &str) + Send + Sync>;
/// Receives the connection (`None` once it is gone) and the watched name.
pub type NameVanishedCallback = Arc<dyn Fn(Option<&Arc<dyn Connection>>, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct WatchNameHandlers {
    name_appeared: Option<NameAppearedCallback>,
    name_vanished: Option<NameVanishedCallback>,
}

impl WatchNameHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_name_appeared<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<dyn Connection>, &str, &str) + Send + Sync + 'static,
    {
        self.name_appeared = Some(Arc::new(f));
        self
    }

    pub fn on_name_vanished<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Arc<dyn Connection>>, &str) + Send + Sync + 'static,
    {
        self.name_vanished = Some(Arc::new(f));
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PreviousCall {
    None,
    Appeared,
    Vanished,
}

struct WatcherState {
    connection: Option<Arc<dyn Connection>>,
    name_owner: Option<String>,
    previous_call: PreviousCall,
    cancelled: bool,
    initialized: bool,
    subscription: Option<SubscriptionId>,
    closed_handler: Option<HandlerId>,
}

struct Watcher {
    id: u32,
    name: String,
    flags: BusNameWatcherFlags,
    handlers: WatchNameHandlers,
    context: MainContext,
    state: Mutex<WatcherState>,
}

static WATCHERS: Mutex<BTreeMap<u32, Arc<Watcher>>> = const_mutex(BTreeMap::new());
static NEXT_WATCHER_ID: AtomicU32 = AtomicU32::new(1);

fn lookup(id: u32) -> Option<Arc<Watcher>> {
    WATCHERS.lock().get(&id).cloned()
}

fn register(name: &str, flags: BusNameWatcherFlags, handlers: WatchNameHandlers) -> Result<Arc<Watcher>> {
    if !is_name(name) {
        return Err(Error::invalid(format!("`{}` is not a valid bus name", name)));
    }
    let id = NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed);
    let watcher = Arc::new(Watcher {
        id,
        name: name.to_owned(),
        flags,
        handlers,
        context: MainContext::ref_thread_default(),
        state: Mutex::new(WatcherState {
            connection: None,
            name_owner: None,
            previous_call: PreviousCall::None,
            cancelled: false,
            initialized: false,
            subscription: None,
            closed_handler: None,
        }),
    });
    WATCHERS.lock().insert(id, watcher.clone());
    Ok(watcher)
}

pub fn watch_name_on_connection(
    connection: Arc<dyn Connection>,
    name: &str,
    flags: BusNameWatcherFlags,
    handlers: WatchNameHandlers,
) -> Result<WatcherId> {
    let watcher = register(name, flags, handlers)?;
    watcher.state.lock().connection = Some(connection);
    watcher.has_connection();
    Ok(WatcherId(watcher.id))
}

/// Watches `name` on the connection `get_bus` produces. If no connection
/// can be had, `name_vanished` runs with no connection.
pub fn watch_name<G>(
    get_bus: G,
    name: &str,
    flags: BusNameWatcherFlags,
    handlers: WatchNameHandlers,
) -> Result<WatcherId>
where
    G: FnOnce(BusCallback),
{
    let watcher = register(name, flags, handlers)?;
    let id = WatcherId(watcher.id);
    get_bus(Box::new(move |result| {
        if watcher.state.lock().cancelled {
            return;
        }
        match result {
            Ok(connection) => {
                watcher.state.lock().connection = Some(connection);
                watcher.has_connection();
            }
            Err(e) => {
                debug!("No bus connection to watch {} on: {}", watcher.name, e);
                watcher.call_vanished_handler();
            }
        }
    }));
    Ok(id)
}

/// Stops watching. No callbacks run afterwards.
pub fn unwatch_name(id: WatcherId) {
    let watcher = match WATCHERS.lock().remove(&id.0) {
        Some(watcher) => watcher,
        None => {
            warn!("Invalid id {:?} passed to unwatch_name()", id);
            return;
        }
    };
    watcher.state.lock().cancelled = true;
    watcher.detach();
}

impl Watcher {
    fn has_connection(self: &Arc<Self>) {
        let connection = match self.state.lock().connection.clone() {
            Some(connection) => connection,
            None => return,
        };
        let id = self.id;
        let closed = connection.connect_closed(Arc::new(move || {
            if let Some(watcher) = lookup(id) {
                watcher.on_connection_closed();
            }
        }));
        let subscription = connection.signal_subscribe(
            SignalRule {
                sender: Some(DBUS_NAME.into()),
                interface: Some(DBUS_INTERFACE.into()),
                member: Some("NameOwnerChanged".into()),
                path: Some(DBUS_PATH.into()),
                arg0: Some(self.name.clone()),
                ..Default::default()
            },
            Arc::new(move |message| {
                if let Some(watcher) = lookup(id) {
                    watcher.on_name_owner_changed(message);
                }
            }),
        );
        {
            let mut state = self.state.lock();
            state.closed_handler = Some(closed);
            state.subscription = Some(subscription);
        }
        if self.flags.contains(BusNameWatcherFlags::AUTO_START) {
            self.start_service(&connection);
        } else {
            self.get_name_owner(&connection);
        }
    }

    fn start_service(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let watcher = self.clone();
        let retry = connection.clone();
        let call = MethodCall::bus("StartServiceByName")
            .with_body(Value::tuple(vec![self.name.as_str().into(), Value::UInt32(0)]))
            .with_reply_type("(u)");
        connection.call_with_callback(
            call,
            None,
            Some(Box::new(move |result| match result {
                Ok(reply) => match reply.args().first().and_then(Value::as_u32) {
                    Some(1) | Some(2) => watcher.get_name_owner(&retry),
                    code => {
                        warn!(
                            "Unexpected reply {} from StartServiceByName() method",
                            code.unwrap_or(0)
                        );
                        watcher.call_vanished_handler();
                        watcher.state.lock().initialized = true;
                    }
                },
                // not being activatable says nothing about having an owner
                Err(e) => {
                    debug!("StartServiceByName({}) failed: {}", watcher.name, e);
                    watcher.get_name_owner(&retry)
                }
            })),
        );
    }

    fn get_name_owner(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let watcher = self.clone();
        let call = MethodCall::bus("GetNameOwner")
            .with_body(Value::tuple(vec![self.name.as_str().into()]))
            .with_reply_type("(s)");
        connection.call_with_callback(
            call,
            None,
            Some(Box::new(move |result| {
                let owner = result.ok().and_then(|reply| reply.arg0().map(str::to_owned));
                match owner {
                    Some(owner) => {
                        watcher.state.lock().name_owner = Some(owner);
                        watcher.call_appeared_handler();
                    }
                    None => watcher.call_vanished_handler(),
                }
                watcher.state.lock().initialized = true;
            })),
        );
    }

    fn on_name_owner_changed(&self, message: &Message) {
        if !self.state.lock().initialized {
            return;
        }
        if message.path() != Some(DBUS_PATH)
            || message.interface() != Some(DBUS_INTERFACE)
            || message.sender() != Some(DBUS_NAME)
        {
            return;
        }
        let (name, old_owner, new_owner) = match message.args() {
            [Value::String(name), Value::String(old), Value::String(new)] => (name, old, new),
            _ => return,
        };
        if *name != self.name {
            return;
        }
        if !old_owner.is_empty() && self.state.lock().name_owner.take().is_some() {
            self.call_vanished_handler();
        }
        if !new_owner.is_empty() {
            self.state.lock().name_owner = Some(new_owner.clone());
            self.call_appeared_handler();
        }
    }

    fn on_connection_closed(&self) {
        self.detach();
        self.call_vanished_handler();
    }

    fn detach(&self) {
        let (connection, subscription, closed_handler) = {
            let mut state = self.state.lock();
            (
                state.connection.take(),
                state.subscription.take(),
                state.closed_handler.take(),
            )
        };
        if let Some(connection) = connection {
            if let Some(id) = closed_handler {
                connection.disconnect_closed(id);
            }
            if let Some(id) = subscription {
                connection.signal_unsubscribe(id);
            }
        }
    }

    fn transition(&self, to: PreviousCall) -> bool {
        let mut state = self.state.lock();
        if state.previous_call == to {
            return false;
        }
        state.previous_call = to;
        !state.cancelled
    }

    fn call_appeared_handler(&self) {
        if !self.transition(PreviousCall::Appeared) {
            return;
        }
        let handler = match self.handlers.name_appeared.clone() {
            Some(handler) => handler,
            None => return,
        };
        let (connection, owner) = {
            let state = self.state.lock();
            (state.connection.clone(), state.name_owner.clone())
        };
        let (connection, owner) = match (connection, owner) {
            (Some(connection), Some(owner)) => (connection, owner),
            _ => return,
        };
        let name = self.name.clone();
        let id = self.id;
        self.context.invoke(move || {
            if lookup(id).is_some() {
                handler(&connection, &name, &owner);
            }
        });
    }

    fn call_vanished_handler(&self) {
        if !self.transition(PreviousCall::Vanished) {
            return;
        }
        let handler = match self.handlers.name_vanished.clone() {
            Some(handler) => handler,
            None => return,
        };
        let connection = self.state.lock().connection.clone();
        let name = self.name.clone();
        let id = self.id;
        self.context.invoke(move || {
            if lookup(id).is_some() {
                handler(connection.as_ref(), &name);
            }
        });
    }
}
