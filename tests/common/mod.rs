//! An in-process stand-in for a bus daemon and the services behind it.
//!
//! Messages sent on the connection are decoded on a bus thread, answered
//! from a small model, and fed back through `MessageConnection::receive`.
//! Tests push their own `MainContext` and call [`FakeBus::settle`] to run
//! everything the bus delivered.

#![allow(dead_code)]

use dbus_core::connection::{
    ConnectionConfig, Transport, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, OBJECT_MANAGER_INTERFACE,
    PROPERTIES_INTERFACE,
};
use dbus_core::fdlist::FdList;
use dbus_core::message::{MessageFlags, MessageType};
use dbus_core::{Error, MainContext, Message, MessageConnection, Result, Type, Value};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;

/// The unique name the bus hands the connection under test.
pub const CLIENT_NAME: &str = ":1.1";

enum Job {
    Incoming(Vec<u8>),
    Deliver(Message),
}

type Reply = std::result::Result<Vec<Value>, (&'static str, String)>;

#[derive(Default)]
struct Model {
    owners: BTreeMap<String, String>,
    properties: BTreeMap<(String, String), BTreeMap<String, Value>>,
    methods: BTreeMap<String, Vec<Value>>,
    request_name_reply: Option<u32>,
    crash_on: Option<String>,
    received: Vec<Message>,
    serial: u32,
}

struct Shared {
    model: Mutex<Model>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    // set when the bus thread panicked; queued jobs will never finish
    broken: AtomicBool,
    connection: Mutex<Weak<MessageConnection>>,
}

pub struct FakeBus {
    jobs: Mutex<Sender<Job>>,
    shared: Arc<Shared>,
}

impl Transport for FakeBus {
    fn send(&self, blob: Vec<u8>, _fd_list: Option<FdList>) -> Result<()> {
        self.push(Job::Incoming(blob))
    }
}

impl FakeBus {
    /// A bus with a connection to it whose unique name is [`CLIENT_NAME`].
    pub fn connect() -> (Arc<FakeBus>, Arc<MessageConnection>) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            model: Mutex::new(Model::default()),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            broken: AtomicBool::new(false),
            connection: Mutex::new(Weak::new()),
        });
        let bus = Arc::new(FakeBus {
            jobs: Mutex::new(tx),
            shared: shared.clone(),
        });
        let connection = MessageConnection::new(bus.clone(), ConnectionConfig::default());
        connection.set_unique_name(CLIENT_NAME);
        *shared.connection.lock() = Arc::downgrade(&connection);
        thread::spawn(move || run(shared, rx));
        (bus, connection)
    }

    fn push(&self, job: Job) -> Result<()> {
        *self.shared.in_flight.lock() += 1;
        if self.jobs.lock().send(job).is_err() {
            self.shared.finish_job();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Waits for the bus to go idle and runs what it queued on `context`,
    /// until neither side has anything left to do.
    pub fn settle(&self, context: &MainContext) {
        loop {
            {
                let mut in_flight = self.shared.in_flight.lock();
                while *in_flight > 0 && !self.shared.is_broken() {
                    self.shared.idle.wait(&mut in_flight);
                }
            }
            assert!(!self.shared.is_broken(), "fake bus thread panicked");
            if context.iteration(false) == 0 && *self.shared.in_flight.lock() == 0 {
                return;
            }
        }
    }

    /// Gives `name` a new owner, or none, and broadcasts NameOwnerChanged.
    pub fn set_owner(&self, name: &str, owner: Option<&str>) -> Result<()> {
        let old = {
            let mut model = self.shared.model.lock();
            match owner {
                Some(owner) => model.owners.insert(name.to_owned(), owner.to_owned()),
                None => model.owners.remove(name),
            }
        };
        self.emit(
            DBUS_NAME,
            DBUS_PATH,
            DBUS_INTERFACE,
            "NameOwnerChanged",
            vec![
                name.into(),
                old.unwrap_or_default().into(),
                owner.unwrap_or_default().into(),
            ],
        )
    }

    /// Records an owner without announcing it.
    pub fn add_owner(&self, name: &str, owner: &str) {
        self.shared
            .model
            .lock()
            .owners
            .insert(name.to_owned(), owner.to_owned());
    }

    pub fn set_property(&self, path: &str, interface: &str, name: &str, value: Value) {
        self.shared
            .model
            .lock()
            .properties
            .entry((path.to_owned(), interface.to_owned()))
            .or_default()
            .insert(name.to_owned(), value);
    }

    /// Makes `path` carry `interface`, with no properties yet.
    pub fn add_interface(&self, path: &str, interface: &str) {
        self.shared
            .model
            .lock()
            .properties
            .entry((path.to_owned(), interface.to_owned()))
            .or_default();
    }

    /// Canned reply for calls to `member` on any service object.
    pub fn on_method(&self, member: &str, reply: Vec<Value>) {
        self.shared
            .model
            .lock()
            .methods
            .insert(member.to_owned(), reply);
    }

    /// Makes the bus thread panic when it is asked to run `member`.
    pub fn crash_on(&self, member: &str) {
        self.shared.model.lock().crash_on = Some(member.to_owned());
    }

    pub fn set_request_name_reply(&self, code: u32) {
        self.shared.model.lock().request_name_reply = Some(code);
    }

    pub fn emit(
        &self,
        sender: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let mut signal = Message::new_signal(path, interface, member)?;
        signal.set_sender(Some(sender))?;
        signal.set_body(Some(Value::tuple(args)))?;
        self.push(Job::Deliver(signal))
    }

    pub fn emit_properties_changed(
        &self,
        sender: &str,
        path: &str,
        interface: &str,
        changed: Vec<(&str, Value)>,
        invalidated: Vec<&str>,
    ) -> Result<()> {
        let invalidated: Vec<String> = invalidated.into_iter().map(str::to_owned).collect();
        self.emit(
            sender,
            path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            vec![interface.into(), Value::vardict(changed), invalidated.into()],
        )
    }

    /// Sends NameAcquired or NameLost the way the bus addresses them.
    pub fn emit_name_signal(&self, member: &str, name: &str) -> Result<()> {
        let mut signal = Message::new_signal(DBUS_PATH, DBUS_INTERFACE, member)?;
        signal.set_sender(Some(DBUS_NAME))?;
        signal.set_destination(Some(CLIENT_NAME))?;
        signal.set_body(Some(Value::tuple(vec![name.into()])))?;
        self.push(Job::Deliver(signal))
    }

    /// Method calls the bus received for `member`, oldest first.
    pub fn received(&self, member: &str) -> Vec<Message> {
        self.shared
            .model
            .lock()
            .received
            .iter()
            .filter(|m| m.member() == Some(member))
            .filter_map(|m| m.copy().ok())
            .collect()
    }
}

fn run(shared: Arc<Shared>, jobs: Receiver<Job>) {
    // nothing delivered from here may run inline
    let context = MainContext::new();
    context.push_thread_default();
    for job in jobs {
        let _done = JobDone(&shared);
        let outgoing = match job {
            Job::Incoming(blob) => shared.handle(&blob),
            Job::Deliver(message) => vec![message],
        };
        let connection = shared.connection.lock().upgrade();
        if let Some(connection) = connection {
            for mut message in outgoing {
                let serial = shared.next_serial();
                let delivered = message
                    .set_serial(serial)
                    .and_then(|()| message.to_blob())
                    .and_then(|blob| connection.receive(&blob, None));
                if let Err(e) = delivered {
                    warn!("fake bus could not deliver message: {}", e);
                }
            }
        }
    }
}

/// Finishes the current job even if handling it panicked.
struct JobDone<'a>(&'a Shared);

impl Drop for JobDone<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.broken.store(true, Ordering::SeqCst);
        }
        self.0.finish_job();
    }
}

impl Shared {
    fn finish_job(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 || self.is_broken() {
            self.idle.notify_all();
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn next_serial(&self) -> u32 {
        let mut model = self.model.lock();
        model.serial += 1;
        model.serial
    }

    fn handle(&self, blob: &[u8]) -> Vec<Message> {
        let call = match Message::from_blob(blob, None) {
            Ok(call) => call,
            Err(e) => {
                warn!("fake bus got an undecodable message: {}", e);
                return Vec::new();
            }
        };
        trace!("fake bus received {}", call.print(0));
        if let Ok(copy) = call.copy() {
            self.model.lock().received.push(copy);
        }
        if call.message_type() != MessageType::MethodCall {
            return Vec::new();
        }
        let (sender, reply) = if call.destination() == Some(DBUS_NAME) {
            (DBUS_NAME.to_owned(), self.bus_method(&call))
        } else {
            match self.resolve(call.destination()) {
                Some(owner) => (owner, self.service_method(&call)),
                None => (
                    DBUS_NAME.to_owned(),
                    Err((
                        "org.freedesktop.DBus.Error.ServiceUnknown",
                        format!("The name {:?} has no owner", call.destination()),
                    )),
                ),
            }
        };
        if call.flags().contains(MessageFlags::NO_REPLY_EXPECTED) {
            return Vec::new();
        }
        let message = match reply {
            Ok(args) => call.new_method_reply().and_then(|mut m| {
                m.set_body(Some(Value::tuple(args)))?;
                Ok(m)
            }),
            Err((name, text)) => call.new_method_error(name, &text),
        };
        match message.and_then(|mut m| {
            m.set_sender(Some(&sender))?;
            m.set_destination(Some(CLIENT_NAME))?;
            Ok(m)
        }) {
            Ok(m) => vec![m],
            Err(e) => {
                warn!("fake bus could not build a reply: {}", e);
                Vec::new()
            }
        }
    }

    fn resolve(&self, destination: Option<&str>) -> Option<String> {
        let destination = destination?;
        let model = self.model.lock();
        if destination.starts_with(':') {
            model
                .owners
                .values()
                .any(|owner| owner == destination)
                .then(|| destination.to_owned())
        } else {
            model.owners.get(destination).cloned()
        }
    }

    fn bus_method(&self, call: &Message) -> Reply {
        let arg0 = call.arg0().unwrap_or_default().to_owned();
        let mut model = self.model.lock();
        match call.member().unwrap_or_default() {
            "Hello" => Ok(vec![CLIENT_NAME.into()]),
            "AddMatch" | "RemoveMatch" => Ok(Vec::new()),
            "GetNameOwner" => match model.owners.get(&arg0) {
                Some(owner) => Ok(vec![owner.as_str().into()]),
                None => Err((
                    "org.freedesktop.DBus.Error.NameHasNoOwner",
                    format!("Could not get owner of name '{}': no such name", arg0),
                )),
            },
            "StartServiceByName" if model.owners.contains_key(&arg0) => Ok(vec![Value::UInt32(2)]),
            "StartServiceByName" => Err((
                "org.freedesktop.DBus.Error.ServiceUnknown",
                format!("The name {} was not provided by any .service files", arg0),
            )),
            "RequestName" => {
                let code = model.request_name_reply.unwrap_or(1);
                if code == 1 {
                    model.owners.insert(arg0, CLIENT_NAME.to_owned());
                }
                Ok(vec![Value::UInt32(code)])
            }
            "ReleaseName" => {
                if model.owners.get(&arg0).map(String::as_str) == Some(CLIENT_NAME) {
                    model.owners.remove(&arg0);
                }
                Ok(vec![Value::UInt32(1)])
            }
            member => Err((
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("Unknown bus method {}", member),
            )),
        }
    }

    fn service_method(&self, call: &Message) -> Reply {
        let path = call.path().unwrap_or_default().to_owned();
        let args = call.args();
        let model = self.model.lock();
        if model.crash_on.is_some() && model.crash_on.as_deref() == call.member() {
            panic!("bus crashed on {:?}", call.member());
        }
        match (call.interface(), call.member().unwrap_or_default()) {
            (Some(PROPERTIES_INTERFACE), "GetAll") => {
                let key = (path, args[0].as_str().unwrap_or_default().to_owned());
                let properties = model.properties.get(&key).cloned().unwrap_or_default();
                Ok(vec![Value::vardict(properties)])
            }
            (Some(PROPERTIES_INTERFACE), "Get") => {
                let interface = args[0].as_str().unwrap_or_default();
                let name = args[1].as_str().unwrap_or_default();
                model
                    .properties
                    .get(&(path, interface.to_owned()))
                    .and_then(|properties| properties.get(name))
                    .map(|value| vec![Value::variant(value.clone())])
                    .ok_or((
                        "org.freedesktop.DBus.Error.InvalidArgs",
                        format!("No such property {}", name),
                    ))
            }
            (Some(OBJECT_MANAGER_INTERFACE), "GetManagedObjects") => managed_objects(&model, &path)
                .map(|objects| vec![objects])
                .map_err(|e| ("org.freedesktop.DBus.Error.Failed", e.to_string())),
            (_, member) => model.methods.get(member).cloned().ok_or((
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("No such method {}", member),
            )),
        }
    }
}

/// Every object but the manager itself, as `a{oa{sa{sv}}}`.
fn managed_objects(model: &Model, manager_path: &str) -> Result<Value> {
    let mut objects: BTreeMap<&str, Vec<(Value, Value)>> = BTreeMap::new();
    for ((path, interface), properties) in &model.properties {
        if path == manager_path {
            continue;
        }
        objects.entry(path).or_default().push((
            interface.as_str().into(),
            Value::vardict(properties.clone()),
        ));
    }
    let interfaces_type = Type::parse("a{sa{sv}}")?;
    let entries = objects
        .into_iter()
        .map(|(path, interfaces)| {
            let interfaces = Value::dict(Type::String, Type::parse("a{sv}")?, interfaces)?;
            Ok((Value::object_path(path)?, interfaces))
        })
        .collect::<Result<Vec<_>>>()?;
    Value::dict(Type::ObjectPath, interfaces_type, entries)
}

/// Ordered record of callbacks, shared between handlers and assertions.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}
