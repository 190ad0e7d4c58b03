//! Owning a well-known bus name.
//!
//! [`own_name_on_connection`] asks the bus for a name and reports, for as
//! long as the request is active, whether this connection currently holds
//! it. `name_acquired` and `name_lost` strictly alternate; a transition the
//! bus reports twice is reported once. All callbacks run on the
//! [`MainContext`] that was the thread default when the name was requested.
//!
//! ```ignore
//! let id = own_name_on_connection(
//!     connection,
//!     "com.example.Svc",
//!     BusNameOwnerFlags::empty(),
//!     OwnNameHandlers::new()
//!         .on_name_acquired(|_, name| println!("own {}", name))
//!         .on_name_lost(|_, name| println!("lost {}", name)),
//! )?;
//! // ...
//! unown_name(id);
//! ```

use crate::connection::{
    BusCallback, Connection, ConnectionExt, MethodCall, SignalRule, SubscriptionId, DBUS_INTERFACE,
    DBUS_NAME, DBUS_PATH,
};
use crate::context::MainContext;
use crate::error::{Error, Result};
use crate::handlers::HandlerId;
use crate::message::Message;
use crate::names::{is_name, is_unique_name};
use crate::value::Value;

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::{const_mutex, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

bitflags! {
    /// Flags passed to `RequestName`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BusNameOwnerFlags: u32 {
        const ALLOW_REPLACEMENT = 1 << 0;
        const REPLACE = 1 << 1;
        const DO_NOT_QUEUE = 1 << 2;
    }
}

const REQUEST_NAME_PRIMARY_OWNER: u32 = 1;
const REQUEST_NAME_IN_QUEUE: u32 = 2;
const RELEASE_NAME_RELEASED: u32 = 1;

pub type BusAcquiredCallback = Arc<dyn Fn(&Arc<dyn Connection>, &str) + Send + Sync>;
/// Receives the connection (`None` once it is gone) and the name.
pub type NameCallback = Arc<dyn Fn(Option<&Arc<dyn Connection>>, &str) + Send + Sync>;

/// The callbacks of one name request. All are optional.
#[derive(Clone, Default)]
pub struct OwnNameHandlers {
    bus_acquired: Option<BusAcquiredCallback>,
    name_acquired: Option<NameCallback>,
    name_lost: Option<NameCallback>,
}

impl OwnNameHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the connection is available, before the name is
    /// requested. Only [`own_name`] calls it.
    pub fn on_bus_acquired<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<dyn Connection>, &str) + Send + Sync + 'static,
    {
        self.bus_acquired = Some(Arc::new(f));
        self
    }

    pub fn on_name_acquired<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Arc<dyn Connection>>, &str) + Send + Sync + 'static,
    {
        self.name_acquired = Some(Arc::new(f));
        self
    }

    pub fn on_name_lost<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Arc<dyn Connection>>, &str) + Send + Sync + 'static,
    {
        self.name_lost = Some(Arc::new(f));
        self
    }
}

/// Identifies an active name request; pass it to [`unown_name`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PreviousCall {
    None,
    Acquired,
    Lost,
}

struct ClientState {
    connection: Option<Arc<dyn Connection>>,
    previous_call: PreviousCall,
    cancelled: bool,
    needs_release: bool,
    subscriptions: Vec<SubscriptionId>,
    closed_handler: Option<HandlerId>,
}

struct Client {
    name: String,
    flags: BusNameOwnerFlags,
    handlers: OwnNameHandlers,
    context: MainContext,
    state: Mutex<ClientState>,
}

static CLIENTS: Mutex<BTreeMap<u32, Arc<Client>>> = const_mutex(BTreeMap::new());
static NEXT_OWNER_ID: AtomicU32 = AtomicU32::new(1);

fn check_name(name: &str) -> Result<()> {
    if !is_name(name) || is_unique_name(name) {
        return Err(Error::invalid(format!(
            "`{}` is not a valid well-known bus name",
            name
        )));
    }
    Ok(())
}

fn register(name: &str, flags: BusNameOwnerFlags, handlers: OwnNameHandlers) -> (OwnerId, Arc<Client>) {
    let client = Arc::new(Client {
        name: name.to_owned(),
        flags,
        handlers,
        context: MainContext::ref_thread_default(),
        state: Mutex::new(ClientState {
            connection: None,
            previous_call: PreviousCall::None,
            cancelled: false,
            needs_release: false,
            subscriptions: Vec::new(),
            closed_handler: None,
        }),
    });
    let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
    CLIENTS.lock().insert(id, client.clone());
    (OwnerId(id), client)
}

/// Requests `name` on an existing connection. `bus_acquired` is not
/// called.
pub fn own_name_on_connection(
    connection: Arc<dyn Connection>,
    name: &str,
    flags: BusNameOwnerFlags,
    handlers: OwnNameHandlers,
) -> Result<OwnerId> {
    check_name(name)?;
    let (id, client) = register(name, flags, handlers);
    client.state.lock().connection = Some(connection);
    client.has_connection();
    Ok(id)
}

/// Requests `name` on the connection `get_bus` produces. `bus_acquired`
/// runs before the request is made. If no connection can be had,
/// `name_lost` runs with no connection.
pub fn own_name<G>(
    get_bus: G,
    name: &str,
    flags: BusNameOwnerFlags,
    handlers: OwnNameHandlers,
) -> Result<OwnerId>
where
    G: FnOnce(BusCallback),
{
    check_name(name)?;
    let (id, client) = register(name, flags, handlers);
    get_bus(Box::new(move |result| {
        if client.state.lock().cancelled {
            return;
        }
        match result {
            Ok(connection) => {
                client.state.lock().connection = Some(connection.clone());
                if let Some(bus_acquired) = client.handlers.bus_acquired.clone() {
                    let name = client.name.clone();
                    client.context.invoke(move || bus_acquired(&connection, &name));
                }
                client.has_connection();
            }
            Err(e) => {
                debug!("No bus connection to own {} on: {}", client.name, e);
                client.call_lost_handler();
            }
        }
    }));
    Ok(id)
}

/// Stops owning the name. If the name was requested, it is released on
/// the bus before this returns. No callbacks run afterwards.
pub fn unown_name(id: OwnerId) {
    let client = match CLIENTS.lock().remove(&id.0) {
        Some(client) => client,
        None => {
            warn!("Invalid id {:?} passed to unown_name()", id);
            return;
        }
    };
    let (connection, needs_release) = {
        let mut state = client.state.lock();
        state.cancelled = true;
        (state.connection.clone(), state.needs_release)
    };
    if let Some(connection) = &connection {
        if needs_release && !connection.is_closed() {
            client.release(connection);
        }
    }
    client.detach();
}

impl Client {
    /// Subscribes to name transitions, then requests the name.
    fn has_connection(self: &Arc<Self>) {
        let connection = match self.state.lock().connection.clone() {
            Some(connection) => connection,
            None => return,
        };

        let weak = Arc::downgrade(self);
        let closed = connection.connect_closed(Arc::new(move || {
            if let Some(client) = weak.upgrade() {
                client.on_connection_closed();
            }
        }));

        let mut subscriptions = Vec::new();
        for member in ["NameLost", "NameAcquired"] {
            let weak: Weak<Client> = Arc::downgrade(self);
            subscriptions.push(connection.signal_subscribe(
                SignalRule {
                    sender: Some(DBUS_NAME.into()),
                    interface: Some(DBUS_INTERFACE.into()),
                    member: Some(member.into()),
                    path: Some(DBUS_PATH.into()),
                    arg0: Some(self.name.clone()),
                    ..Default::default()
                },
                Arc::new(move |message| {
                    if let Some(client) = weak.upgrade() {
                        client.on_name_lost_or_acquired(message);
                    }
                }),
            ));
        }

        {
            let mut state = self.state.lock();
            state.closed_handler = Some(closed);
            state.subscriptions = subscriptions;
            state.needs_release = true;
        }

        let client = self.clone();
        let request = MethodCall::bus("RequestName")
            .with_body(Value::tuple(vec![
                self.name.as_str().into(),
                Value::UInt32(self.flags.bits()),
            ]))
            .with_reply_type("(u)");
        connection.call_with_callback(
            request,
            None,
            Some(Box::new(move |result| {
                let code = match result {
                    Ok(reply) => reply.args().first().and_then(Value::as_u32).unwrap_or(0),
                    Err(e) => {
                        debug!("RequestName for {} failed: {}", client.name, e);
                        0
                    }
                };
                client.on_request_name_reply(code);
            })),
        );
    }

    fn on_request_name_reply(&self, code: u32) {
        match code {
            REQUEST_NAME_PRIMARY_OWNER => self.call_acquired_handler(),
            REQUEST_NAME_IN_QUEUE => self.call_lost_handler(),
            _ => {
                // neither owner nor queued: stop listening
                self.call_lost_handler();
                let (connection, subscriptions) = {
                    let mut state = self.state.lock();
                    state.needs_release = false;
                    if state.cancelled {
                        return;
                    }
                    (state.connection.clone(), std::mem::take(&mut state.subscriptions))
                };
                if let Some(connection) = connection {
                    for id in subscriptions {
                        connection.signal_unsubscribe(id);
                    }
                }
            }
        }
    }

    fn on_name_lost_or_acquired(&self, message: &Message) {
        if message.path() != Some(DBUS_PATH)
            || message.interface() != Some(DBUS_INTERFACE)
            || message.sender() != Some(DBUS_NAME)
        {
            return;
        }
        let body_type = message.body_type_string();
        if body_type != "(s)" {
            warn!(
                "{} signal had unexpected signature {}",
                message.member().unwrap_or_default(),
                body_type
            );
            return;
        }
        if message.arg0() != Some(self.name.as_str()) {
            return;
        }
        match message.member() {
            Some("NameLost") => self.call_lost_handler(),
            Some("NameAcquired") => self.call_acquired_handler(),
            _ => {}
        }
    }

    fn on_connection_closed(&self) {
        self.detach();
        self.call_lost_handler();
    }

    /// Drops the subscriptions, the closed handler and the connection.
    fn detach(&self) {
        let (connection, subscriptions, closed_handler) = {
            let mut state = self.state.lock();
            (
                state.connection.take(),
                std::mem::take(&mut state.subscriptions),
                state.closed_handler.take(),
            )
        };
        if let Some(connection) = connection {
            if let Some(id) = closed_handler {
                connection.disconnect_closed(id);
            }
            for id in subscriptions {
                connection.signal_unsubscribe(id);
            }
        }
    }

    fn release(&self, connection: &Arc<dyn Connection>) {
        let call = MethodCall::bus("ReleaseName")
            .with_body(Value::tuple(vec![self.name.as_str().into()]))
            .with_reply_type("(u)");
        match connection.call_sync(call, None) {
            Ok(reply) => match reply.args().first().and_then(Value::as_u32) {
                Some(RELEASE_NAME_RELEASED) => self.state.lock().needs_release = false,
                code => warn!(
                    "Unexpected reply {} when releasing name {}",
                    code.unwrap_or(0),
                    self.name
                ),
            },
            Err(e) => warn!("Error releasing name {}: {}", self.name, e),
        }
    }

    fn call_acquired_handler(&self) {
        if self.transition(PreviousCall::Acquired) {
            self.dispatch(self.handlers.name_acquired.clone());
        }
    }

    fn call_lost_handler(&self) {
        if self.transition(PreviousCall::Lost) {
            self.dispatch(self.handlers.name_lost.clone());
        }
    }

    /// Records `to` as the latest report. False if it repeats the previous
    /// one or the request was withdrawn.
    fn transition(&self, to: PreviousCall) -> bool {
        let mut state = self.state.lock();
        if state.previous_call == to {
            return false;
        }
        state.previous_call = to;
        !state.cancelled
    }

    fn dispatch(&self, handler: Option<NameCallback>) {
        let handler = match handler {
            Some(handler) => handler,
            None => return,
        };
        let connection = self.state.lock().connection.clone();
        let name = self.name.clone();
        self.context
            .invoke(move || handler(connection.as_ref(), &name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rejects_unique_and_invalid_names() {
        let handlers = OwnNameHandlers::new();
        let lost = own_name(|_| {}, ":1.5", BusNameOwnerFlags::empty(), handlers.clone());
        assert!(lost.is_err());
        let lost = own_name(|_| {}, "nodot", BusNameOwnerFlags::empty(), handlers);
        assert!(lost.is_err());
    }

    #[test]
    fn bus_failure_reports_lost_without_connection() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (acquired, lost) = (seen.clone(), seen.clone());
        let handlers = OwnNameHandlers::new()
            .on_bus_acquired(move |_, _| acquired.lock().push("bus"))
            .on_name_lost(move |connection, name| {
                assert!(connection.is_none());
                assert_eq!(name, "com.example.Nobus");
                lost.lock().push("lost");
            });
        let id = own_name(
            |done| done(Err(Error::Closed)),
            "com.example.Nobus",
            BusNameOwnerFlags::empty(),
            handlers,
        )?;
        assert_eq!(*seen.lock(), vec!["lost"]);
        unown_name(id);
        Ok(())
    }

    #[test]
    fn transitions_alternate() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (acquired, lost) = (seen.clone(), seen.clone());
        let handlers = OwnNameHandlers::new()
            .on_name_acquired(move |_, _| acquired.lock().push("acquired"))
            .on_name_lost(move |_, _| lost.lock().push("lost"));
        let (id, client) = register("com.example.Alt", BusNameOwnerFlags::empty(), handlers);
        client.call_lost_handler();
        client.call_lost_handler();
        client.call_acquired_handler();
        client.call_acquired_handler();
        client.call_lost_handler();
        assert_eq!(*seen.lock(), vec!["lost", "acquired", "lost"]);
        unown_name(id);
        client.call_acquired_handler();
        assert_eq!(seen.lock().len(), 3);
        Ok(())
    }
}
