mod common;

use common::{EventLog, FakeBus};
use dbus_core::connection::OBJECT_MANAGER_INTERFACE;
use dbus_core::object_manager::{ObjectManagerClient, ObjectManagerFlags};
use dbus_core::{MainContext, MessageConnection, Result, Type, Value};

use std::sync::Arc;
use test_log::test;

const SVC: &str = "com.example.Svc";
const MANAGER_PATH: &str = "/org/example";

fn observe(manager: &Arc<ObjectManagerClient>) -> EventLog {
    let events = EventLog::default();
    let log = events.clone();
    manager.connect_object_added(move |object| log.push(format!("object-added {}", object.object_path())));
    let log = events.clone();
    manager.connect_object_removed(move |object| {
        log.push(format!("object-removed {}", object.object_path()))
    });
    let log = events.clone();
    manager.connect_interface_added(move |object, proxy| {
        log.push(format!(
            "interface-added {} {}",
            object.object_path(),
            proxy.interface_name()
        ))
    });
    let log = events.clone();
    manager.connect_interface_removed(move |object, proxy| {
        log.push(format!(
            "interface-removed {} {}",
            object.object_path(),
            proxy.interface_name()
        ))
    });
    let (log, weak) = (events.clone(), Arc::downgrade(manager));
    manager.connect_name_owner_notify(move || {
        let owner = weak.upgrade().and_then(|manager| manager.name_owner());
        log.push(format!("owner {:?}", owner));
    });
    events
}

fn build(connection: Arc<MessageConnection>) -> Result<Arc<ObjectManagerClient>> {
    ObjectManagerClient::builder(connection, MANAGER_PATH)
        .name(SVC)
        .build_sync(None)
}

fn interfaces_added(path: &str, interface: &str) -> Result<Vec<Value>> {
    let properties = Value::vardict(Vec::<(&str, Value)>::new());
    let interfaces = Value::dict(
        Type::String,
        Type::parse("a{sv}")?,
        vec![(interface.into(), properties)],
    )?;
    Ok(vec![Value::object_path(path)?, interfaces])
}

fn interfaces_removed(path: &str, interfaces: &[&str]) -> Result<Vec<Value>> {
    let names: Vec<String> = interfaces.iter().map(|s| s.to_string()).collect();
    Ok(vec![Value::object_path(path)?, names.into()])
}

#[test]
fn object_tree_is_rebuilt_in_order() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.set_property("/o/1", "x.y", "P", Value::Int32(1));

    let manager = build(connection)?;
    assert_eq!(manager.name_owner(), None);
    assert!(manager.objects().is_empty());
    let events = observe(&manager);

    bus.set_owner(SVC, Some(":1.10"))?;
    bus.settle(&context);
    assert_eq!(
        events.take(),
        vec![
            "object-added /o/1",
            "interface-added /o/1 x.y",
            r#"owner Some(":1.10")"#
        ]
    );
    let proxy = manager.interface("/o/1", "x.y").expect("x.y on /o/1");
    assert_eq!(proxy.cached_property("P"), Some(Value::Int32(1)));
    assert_eq!(proxy.name(), Some(":1.10"));

    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesAdded",
        interfaces_added("/o/1", "x.z")?,
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["interface-added /o/1 x.z"]);
    let object = manager.object("/o/1").expect("/o/1");
    assert_eq!(object.interfaces().len(), 2);

    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["x.y", "x.z"])?,
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["object-removed /o/1"]);
    assert!(manager.objects().is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn partial_removal_keeps_the_object() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.add_interface("/o/1", "x.y");
    bus.add_interface("/o/1", "x.z");

    let manager = build(connection)?;
    assert_eq!(manager.name_owner().as_deref(), Some(":1.10"));
    let events = observe(&manager);

    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["x.y"])?,
    )?;
    // signals from anyone but the owner are ignored
    bus.emit(
        ":1.99",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["x.z"])?,
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["interface-removed /o/1 x.y"]);
    let object = manager.object("/o/1").expect("/o/1");
    assert!(object.interface("x.y").is_none());
    assert!(object.interface("x.z").is_some());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn unknown_interface_names_do_not_remove_the_object() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.add_interface("/o/1", "x.y");
    bus.add_interface("/o/1", "x.z");

    let manager = build(connection)?;
    let events = observe(&manager);

    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["x.y", "bogus.I"])?,
    )?;
    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["x.y", "x.y"])?,
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["interface-removed /o/1 x.y"]);
    let object = manager.object("/o/1").expect("/o/1");
    assert!(object.interface("x.z").is_some());

    bus.emit(
        ":1.10",
        MANAGER_PATH,
        OBJECT_MANAGER_INTERFACE,
        "InterfacesRemoved",
        interfaces_removed("/o/1", &["bogus.I", "x.z"])?,
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["object-removed /o/1"]);
    assert!(manager.objects().is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn signals_reach_interface_proxies() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.set_property("/o/1", "x.y", "P", Value::Int32(1));

    let manager = build(connection)?;
    let proxy = manager.interface("/o/1", "x.y").expect("x.y on /o/1");
    let events = EventLog::default();
    let log = events.clone();
    manager.connect_interface_proxy_properties_changed(move |object, proxy, changed, invalidated| {
        log.push(format!(
            "properties {} {} {:?} {:?}",
            object.object_path(),
            proxy.interface_name(),
            changed.keys().collect::<Vec<_>>(),
            invalidated
        ))
    });
    let log = events.clone();
    manager.connect_interface_proxy_signal(move |object, proxy, sender, name, _| {
        log.push(format!(
            "signal {} {} {} {:?}",
            object.object_path(),
            proxy.interface_name(),
            name,
            sender
        ))
    });
    let log = events.clone();
    proxy.connect_signal(None, move |_, name, _| log.push(format!("proxy {}", name)));

    bus.emit_properties_changed(":1.10", "/o/1", "x.y", vec![("P", Value::Int32(2))], vec![])?;
    bus.emit(":1.10", "/o/1", "x.y", "Poked", vec!["hard".into()])?;
    // unknown objects are not routed
    bus.emit(":1.10", "/o/2", "x.y", "Poked", vec![])?;
    bus.settle(&context);
    assert_eq!(proxy.cached_property("P"), Some(Value::Int32(2)));
    assert_eq!(
        events.take(),
        vec![
            r#"properties /o/1 x.y ["P"] []"#,
            "proxy Poked",
            r#"signal /o/1 x.y Poked Some(":1.10")"#
        ]
    );
    context.pop_thread_default();
    Ok(())
}

#[test]
fn owner_churn_replaces_the_tree() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    bus.add_interface("/o/1", "x.y");

    let manager = build(connection)?;
    let first = manager.interface("/o/1", "x.y").expect("x.y on /o/1");
    assert_eq!(first.name(), Some(":1.10"));
    let events = observe(&manager);

    bus.set_owner(SVC, None)?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["owner None", "object-removed /o/1"]);
    assert!(manager.objects().is_empty());
    let removed = bus.received("RemoveMatch");
    assert!(removed
        .iter()
        .any(|m| m.arg0() == Some("type='signal',sender=':1.10',path_namespace='/org/example'")));

    bus.add_interface("/o/2", "x.w");
    bus.set_owner(SVC, Some(":1.11"))?;
    bus.settle(&context);
    assert_eq!(
        events.take(),
        vec![
            "object-added /o/1",
            "interface-added /o/1 x.y",
            "object-added /o/2",
            "interface-added /o/2 x.w",
            r#"owner Some(":1.11")"#
        ]
    );
    let second = manager.interface("/o/1", "x.y").expect("x.y on /o/1");
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.name(), Some(":1.11"));
    let added = bus.received("AddMatch");
    assert!(added
        .iter()
        .any(|m| m.arg0() == Some("type='signal',sender=':1.11',path_namespace='/org/example'")));
    context.pop_thread_default();
    Ok(())
}

#[test]
fn no_auto_start_skips_activation() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();

    let manager = ObjectManagerClient::builder(connection, MANAGER_PATH)
        .name(SVC)
        .flags(ObjectManagerFlags::DO_NOT_AUTO_START)
        .build_sync(None)?;
    assert_eq!(manager.name_owner(), None);
    assert!(bus.received("StartServiceByName").is_empty());
    assert!(bus.received("GetManagedObjects").is_empty());
    context.pop_thread_default();
    Ok(())
}
