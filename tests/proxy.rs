mod common;

use common::{EventLog, FakeBus};
use dbus_core::connection::{CallFlags, DEFAULT_TIMEOUT};
use dbus_core::introspection::{ArgInfo, InterfaceInfo, PropertyAccess};
use dbus_core::proxy::{Proxy, ProxyFlags};
use dbus_core::{MainContext, Result, Value};

use std::sync::Arc;
use test_log::test;

const SVC: &str = "com.example.Svc";
const IFACE: &str = "com.example.X";
const PATH: &str = "/com/example/Obj";

fn interface_info() -> InterfaceInfo {
    InterfaceInfo::new(IFACE)
        .with_property("P", "s", PropertyAccess::Read)
        .with_method("Echo", vec![ArgInfo::new("in", "s")], vec![ArgInfo::new("out", "s")])
        .with_signal("Ping", vec![ArgInfo::new("what", "s")])
}

/// Logs property changes and notifications in arrival order.
fn observe(proxy: &Arc<Proxy>) -> EventLog {
    let events = EventLog::default();
    let log = events.clone();
    proxy.connect_properties_changed(move |changed, invalidated| {
        log.push(format!(
            "changed {:?} invalidated {:?}",
            changed.keys().collect::<Vec<_>>(),
            invalidated
        ));
    });
    let (log, weak) = (events.clone(), Arc::downgrade(proxy));
    proxy.connect_notify(move |property| {
        let owner = weak.upgrade().and_then(|proxy| proxy.name_owner());
        log.push(format!("notify {:?} {:?}", property, owner));
    });
    events
}

#[test]
fn property_cache_lifecycle() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .interface_info(interface_info())
        .build_sync(None)?;
    assert_eq!(proxy.name_owner().as_deref(), Some(":1.10"));
    assert_eq!(bus.received("StartServiceByName").len(), 1);
    let events = observe(&proxy);

    bus.emit_properties_changed(":1.10", PATH, IFACE, vec![("P", "hi".into())], vec![])?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), Some(Value::from("hi")));
    assert_eq!(events.take(), vec![r#"changed ["P"] invalidated []"#]);

    bus.set_owner(SVC, None)?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), None);
    assert!(proxy.cached_property_names().is_empty());
    assert_eq!(
        events.take(),
        vec![r#"changed [] invalidated ["P"]"#, "notify NameOwner None"]
    );
    context.pop_thread_default();
    Ok(())
}

#[test]
fn declared_types_guard_the_cache() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.set_property(PATH, IFACE, "P", "initial".into());
    bus.set_property(PATH, IFACE, "Extra", Value::UInt32(7));

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .interface_info(interface_info())
        .build_sync(None)?;
    assert_eq!(proxy.cached_property_as::<String>("P")?.as_deref(), Some("initial"));
    assert_eq!(proxy.cached_property("Extra"), Some(Value::UInt32(7)));

    bus.emit_properties_changed(":1.10", PATH, IFACE, vec![("P", Value::Int32(5))], vec![])?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), Some(Value::from("initial")));

    // undeclared properties are cached whatever their type
    bus.emit_properties_changed(":1.10", PATH, IFACE, vec![("Extra", "now text".into())], vec![])?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("Extra"), Some(Value::from("now text")));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn owner_change_reloads_properties() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.set_property(PATH, IFACE, "P", "one".into());

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .build_sync(None)?;
    assert_eq!(proxy.cached_property("P"), Some(Value::from("one")));
    let events = observe(&proxy);
    let signals = EventLog::default();
    let log = signals.clone();
    proxy.connect_signal(Some("Ping"), move |sender, name, args| {
        log.push(format!("{} from {:?}: {}", name, sender, args.print(false)));
    });

    bus.set_property(PATH, IFACE, "P", "two".into());
    bus.set_owner(SVC, Some(":1.11"))?;
    bus.settle(&context);
    assert_eq!(proxy.name_owner().as_deref(), Some(":1.11"));
    assert_eq!(proxy.cached_property("P"), Some(Value::from("two")));
    assert_eq!(
        events.take(),
        vec![
            r#"changed ["P"] invalidated []"#,
            r#"notify NameOwner Some(":1.11")"#
        ]
    );
    let get_all = bus.received("GetAll");
    assert_eq!(get_all.last().and_then(|m| m.destination()), Some(":1.11"));

    // only the current owner is listened to
    bus.emit(":1.10", PATH, IFACE, "Ping", vec!["stale".into()])?;
    bus.emit(":1.11", PATH, IFACE, "Ping", vec!["fresh".into()])?;
    bus.emit(":1.11", PATH, IFACE, "Pong", vec![])?;
    bus.settle(&context);
    let seen = signals.take();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with(r#"Ping from Some(":1.11")"#));
    assert!(seen[0].contains("fresh"));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn invalidated_properties_are_refetched() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.set_property(PATH, IFACE, "P", "stale".into());

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .flags(ProxyFlags::GET_INVALIDATED_PROPERTIES)
        .build_sync(None)?;
    let events = observe(&proxy);

    bus.set_property(PATH, IFACE, "P", "fresh".into());
    bus.emit_properties_changed(":1.10", PATH, IFACE, vec![], vec!["P"])?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), Some(Value::from("fresh")));
    assert_eq!(events.take(), vec![r#"changed ["P"] invalidated []"#]);
    let get = bus.received("Get");
    assert_eq!(get.len(), 1);
    assert_eq!(get[0].destination(), Some(":1.10"));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn name_without_owner() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .build_sync(None)?;
    assert_eq!(proxy.name_owner(), None);
    assert!(bus.received("GetAll").is_empty());
    let events = observe(&proxy);

    bus.set_property(PATH, IFACE, "P", "up".into());
    bus.set_owner(SVC, Some(":1.12"))?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), Some(Value::from("up")));
    assert_eq!(
        events.take(),
        vec![
            r#"changed ["P"] invalidated []"#,
            r#"notify NameOwner Some(":1.12")"#
        ]
    );
    context.pop_thread_default();
    Ok(())
}

#[test]
fn do_not_auto_start_needs_an_owner() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .flags(ProxyFlags::DO_NOT_AUTO_START)
        .build_sync(None)?;
    assert!(bus.received("StartServiceByName").is_empty());
    let e = proxy
        .call_sync("Echo", None, CallFlags::empty(), DEFAULT_TIMEOUT, None)
        .unwrap_err();
    assert!(e.to_string().contains("DO_NOT_AUTO_START"));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn method_calls_go_to_the_owner() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.on_method("Echo", vec!["pong".into()]);

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .flags(ProxyFlags::DO_NOT_LOAD_PROPERTIES)
        .interface_info(interface_info())
        .build_sync(None)?;
    let reply = proxy.call_sync(
        "Echo",
        Some(Value::tuple(vec!["ping".into()])),
        CallFlags::empty(),
        DEFAULT_TIMEOUT,
        None,
    )?;
    assert_eq!(reply, Value::tuple(vec!["pong".into()]));
    let calls = bus.received("Echo");
    assert_eq!(calls[0].destination(), Some(":1.10"));
    assert_eq!(calls[0].interface(), Some(IFACE));
    assert_eq!(calls[0].arg0(), Some("ping"));

    let pending = proxy.call(
        "org.example.Other.Missing",
        None,
        CallFlags::empty(),
        DEFAULT_TIMEOUT,
        None,
    );
    bus.settle(&context);
    let e = futures::executor::block_on(pending).unwrap_err();
    assert_eq!(e.dbus_name(), Some("org.freedesktop.DBus.Error.UnknownMethod"));
    assert_eq!(bus.received("Missing")[0].interface(), Some("org.example.Other"));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn crashed_bus_fails_instead_of_hanging() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.crash_on("Echo");

    let proxy = Proxy::builder(connection, PATH, IFACE)
        .name(SVC)
        .flags(ProxyFlags::DO_NOT_LOAD_PROPERTIES)
        .build_sync(None)?;
    let _pending = proxy.call("Echo", None, CallFlags::empty(), DEFAULT_TIMEOUT, None);
    let settled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| bus.settle(&context)));
    assert!(settled.is_err());
    context.pop_thread_default();
    Ok(())
}
