use super::{
    Capabilities, ClosedCallback, Connection, ConnectionConfig, ConnectionExt, MethodCall,
    ReplyCallback, SignalCallback, SignalFlags, SignalRule, SubscriptionId, NO_TIMEOUT,
};
use crate::cancellable::Cancellable;
use crate::codec::bytes_needed;
use crate::context::MainContext;
use crate::error::{Error, Result};
use crate::fdlist::FdList;
use crate::handlers::{HandlerId, HandlerList};
use crate::message::{Message, MessageFlags, MessageType};
use crate::value::Value;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Moves serialized messages to the peer.
pub trait Transport: Send + Sync {
    fn send(&self, blob: Vec<u8>, fd_list: Option<FdList>) -> Result<()>;

    fn close(&self) {}
}

struct PendingCall {
    callback: ReplyCallback,
    context: MainContext,
    deadline: Option<Instant>,
    cancel: Option<(Cancellable, u64)>,
}

impl PendingCall {
    fn complete(self, result: Result<Message>) {
        if let Some((cancellable, id)) = self.cancel {
            cancellable.disconnect(id);
        }
        let callback = self.callback;
        self.context.invoke(move || callback(result));
    }
}

struct Subscription {
    rule: SignalRule,
    match_rule: Option<String>,
    callback: SignalCallback,
    context: MainContext,
}

#[derive(Default)]
struct State {
    unique_name: Option<String>,
    closed: bool,
    pending: HashMap<u32, PendingCall>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    match_rules: HashMap<String, usize>,
}

static NEXT_SUBSCRIPTION_ID: AtomicU32 = AtomicU32::new(1);

/// Correlates calls and replies over a [`Transport`].
///
/// Outgoing messages get a serial and are handed to the transport as
/// blobs. Incoming blobs are fed to [`MessageConnection::receive`]; replies
/// complete their pending call, signals fan out to matching
/// subscriptions. Timeouts are enforced when the owner calls
/// [`MessageConnection::expire_timeouts`].
pub struct MessageConnection {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    next_serial: AtomicU32,
    state: Mutex<State>,
    closed_handlers: HandlerList<dyn Fn() + Send + Sync>,
    weak_self: Weak<MessageConnection>,
}

impl MessageConnection {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Arc<MessageConnection> {
        Arc::new_cyclic(|weak_self| MessageConnection {
            transport,
            config,
            next_serial: AtomicU32::new(1),
            state: Mutex::new(State::default()),
            closed_handlers: HandlerList::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn set_unique_name(&self, name: &str) {
        self.state.lock().unique_name = Some(name.to_owned());
    }

    /// Registers with the bus and records the unique name it assigns.
    pub fn hello(&self) -> BoxFuture<'static, Result<String>> {
        let weak = self.weak_self.clone();
        self.call(MethodCall::bus("Hello").with_reply_type("(s)"), None)
            .map(move |reply| {
                let reply = reply?;
                let name = reply
                    .arg0()
                    .ok_or_else(|| Error::invalid("Hello reply carries no name"))?
                    .to_owned();
                if let Some(this) = weak.upgrade() {
                    this.set_unique_name(&name);
                }
                Ok(name)
            })
            .boxed()
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    fn deadline(&self, timeout_ms: i32) -> Option<Instant> {
        let ms = match timeout_ms {
            NO_TIMEOUT => return None,
            t if t < 0 => self.config.default_timeout_ms as u64,
            t => t as u64,
        };
        Some(Instant::now() + Duration::from_millis(ms))
    }

    /// Serializes `message` and hands it to the transport.
    fn write_message(&self, mut message: Message, serial: u32) -> Result<()> {
        if message.is_locked() {
            return Err(Error::invalid(
                "Cannot send a locked message; use Message::copy to make a new one",
            ));
        }
        if message.unix_fd_list().map_or(false, |fds| !fds.is_empty())
            && !self.capabilities().contains(Capabilities::UNIX_FD_PASSING)
        {
            return Err(Error::NotSupported(
                "Connection does not support file descriptor passing".into(),
            ));
        }
        message.set_serial(serial)?;
        let blob = message.to_blob()?;
        let fd_list = message.take_unix_fd_list();
        trace!(
            "sending {:?} serial {} ({} bytes)",
            message.message_type(),
            serial,
            blob.len()
        );
        self.transport.send(blob, fd_list)
    }

    fn fail_pending(&self, serial: u32, error: Error) {
        let pending = self.state.lock().pending.remove(&serial);
        if let Some(pending) = pending {
            pending.complete(Err(error));
        }
    }

    /// Feeds one complete message received from the peer.
    pub fn receive(&self, blob: &[u8], fd_list: Option<FdList>) -> Result<()> {
        let needed = bytes_needed(blob)?;
        if needed != blob.len() {
            return Err(Error::invalid(format!(
                "Blob holds {} bytes but the message is {} bytes",
                blob.len(),
                needed
            )));
        }
        let message = Message::from_blob(blob, fd_list)?;
        self.dispatch(message);
        Ok(())
    }

    /// Routes a parsed incoming message.
    pub fn dispatch(&self, message: Message) {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                let serial = match message.reply_serial() {
                    Some(serial) => serial,
                    None => return,
                };
                let pending = self.state.lock().pending.remove(&serial);
                match pending {
                    Some(pending) => pending.complete(Ok(message)),
                    None => trace!("dropping reply to unknown serial {}", serial),
                }
            }
            MessageType::Signal => {
                let targets: Vec<(SignalCallback, MainContext)> = self
                    .state
                    .lock()
                    .subscriptions
                    .values()
                    .filter(|s| s.rule.matches(&message))
                    .map(|s| (s.callback.clone(), s.context.clone()))
                    .collect();
                if targets.is_empty() {
                    return;
                }
                let message = Arc::new(message);
                for (callback, context) in targets {
                    let message = message.clone();
                    context.invoke(move || callback(&message));
                }
            }
            MessageType::MethodCall => {
                if message.flags().contains(MessageFlags::NO_REPLY_EXPECTED) {
                    return;
                }
                let text = format!(
                    "No such method '{}' on interface '{}' at object path '{}'",
                    message.member().unwrap_or_default(),
                    message.interface().unwrap_or_default(),
                    message.path().unwrap_or_default()
                );
                let reply = message
                    .new_method_error("org.freedesktop.DBus.Error.UnknownMethod", &text)
                    .and_then(|reply| self.send_message(reply));
                if let Err(e) = reply {
                    debug!("Error replying to unhandled method call: {}", e);
                }
            }
            MessageType::Invalid => {}
        }
    }

    /// Fails every call whose deadline is at or before `now`. Returns how
    /// many calls expired.
    pub fn expire_timeouts(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut state = self.state.lock();
            let due: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline.map_or(false, |d| d <= now))
                .map(|(serial, _)| *serial)
                .collect();
            due.iter()
                .filter_map(|serial| state.pending.remove(serial))
                .collect()
        };
        let count = expired.len();
        for pending in expired {
            pending.complete(Err(Error::TimedOut));
        }
        count
    }

    /// The earliest deadline of an outstanding call.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .pending
            .values()
            .filter_map(|p| p.deadline)
            .min()
    }

    /// Closes the connection: outstanding calls fail with
    /// [`Error::Closed`] and the closed handlers run. Idempotent.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        self.transport.close();
        for (_, call) in pending {
            call.complete(Err(Error::Closed));
        }
        for handler in self.closed_handlers.snapshot() {
            handler();
        }
    }

    fn bus_call_no_reply(&self, method: &str, match_rule: &str) {
        let call = MethodCall::bus(method).with_body(Value::tuple(vec![match_rule.into()]));
        self.call_with_callback(call, None, None);
    }
}

impl Connection for MessageConnection {
    fn unique_name(&self) -> Option<String> {
        self.state.lock().unique_name.clone()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn capabilities(&self) -> Capabilities {
        if self.config.unix_fd_passing {
            Capabilities::UNIX_FD_PASSING
        } else {
            Capabilities::empty()
        }
    }

    fn is_message_bus(&self) -> bool {
        self.config.message_bus
    }

    fn send_message(&self, message: Message) -> Result<u32> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let serial = self.next_serial();
        self.write_message(message, serial)?;
        Ok(serial)
    }

    fn send_message_with_reply(
        &self,
        message: Message,
        timeout_ms: i32,
        cancellable: Option<&Cancellable>,
        callback: ReplyCallback,
    ) {
        let context = MainContext::ref_thread_default();
        if let Some(c) = cancellable {
            if c.is_cancelled() {
                context.invoke(move || callback(Err(Error::Cancelled)));
                return;
            }
        }
        let serial = self.next_serial();
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                context.invoke(move || callback(Err(Error::Closed)));
                return;
            }
            // registered first, so a reply that arrives during the send finds it
            state.pending.insert(
                serial,
                PendingCall {
                    callback,
                    context,
                    deadline: self.deadline(timeout_ms),
                    cancel: None,
                },
            );
        }
        if let Err(e) = self.write_message(message, serial) {
            self.fail_pending(serial, e);
            return;
        }
        if let Some(c) = cancellable {
            let weak = self.weak_self.clone();
            let id = c.connect(move || {
                if let Some(this) = weak.upgrade() {
                    this.fail_pending(serial, Error::Cancelled);
                }
            });
            let mut state = self.state.lock();
            match state.pending.get_mut(&serial) {
                Some(pending) => pending.cancel = Some((c.clone(), id)),
                None => {
                    drop(state);
                    c.disconnect(id);
                }
            }
        }
    }

    fn signal_subscribe(&self, rule: SignalRule, callback: SignalCallback) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        let wants_rule = self.config.message_bus
            && !rule.flags.contains(SignalFlags::NO_MATCH_RULE)
            && !rule.is_for_name_ownership();
        let match_rule = wants_rule.then(|| rule.to_match_rule());
        let add = {
            let mut state = self.state.lock();
            let add = match &match_rule {
                Some(text) => {
                    let count = state.match_rules.entry(text.clone()).or_insert(0);
                    *count += 1;
                    *count == 1 && !state.closed
                }
                None => false,
            };
            state.subscriptions.insert(
                id,
                Subscription {
                    rule,
                    match_rule: match_rule.clone(),
                    callback,
                    context: MainContext::ref_thread_default(),
                },
            );
            add
        };
        if let (true, Some(text)) = (add, &match_rule) {
            self.bus_call_no_reply("AddMatch", text);
        }
        id
    }

    fn signal_unsubscribe(&self, id: SubscriptionId) {
        let remove = {
            let mut state = self.state.lock();
            let subscription = match state.subscriptions.remove(&id) {
                Some(s) => s,
                None => {
                    warn!("signal_unsubscribe: no subscription {:?}", id);
                    return;
                }
            };
            match subscription.match_rule {
                Some(text) => {
                    let last = match state.match_rules.get_mut(&text) {
                        Some(count) => {
                            *count -= 1;
                            *count == 0
                        }
                        None => false,
                    };
                    if last {
                        state.match_rules.remove(&text);
                    }
                    (last && !state.closed).then_some(text)
                }
                None => None,
            }
        };
        if let Some(text) = remove {
            self.bus_call_no_reply("RemoveMatch", &text);
        }
    }

    fn connect_closed(&self, callback: ClosedCallback) -> HandlerId {
        let context = MainContext::ref_thread_default();
        self.closed_handlers.connect(Arc::new(move || {
            let callback = callback.clone();
            context.invoke(move || callback());
        }))
    }

    fn disconnect_closed(&self, id: HandlerId) {
        self.closed_handlers.disconnect(id);
    }
}
