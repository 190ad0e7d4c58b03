mod common;

use common::{EventLog, FakeBus};
use dbus_core::connection::Connection;
use dbus_core::name_owning::{
    own_name, own_name_on_connection, unown_name, BusNameOwnerFlags, OwnNameHandlers,
};
use dbus_core::name_watching::{
    unwatch_name, watch_name_on_connection, BusNameWatcherFlags, WatchNameHandlers,
};
use dbus_core::{MainContext, Result, Value};

use std::sync::Arc;
use test_log::test;

const SVC: &str = "com.example.Svc";

fn owner_handlers(events: &EventLog) -> OwnNameHandlers {
    let (acquired, lost) = (events.clone(), events.clone());
    OwnNameHandlers::new()
        .on_name_acquired(move |_, name| acquired.push(format!("acquired {}", name)))
        .on_name_lost(move |connection, name| {
            lost.push(format!("lost {} connected={}", name, connection.is_some()))
        })
}

fn watcher_handlers(events: &EventLog) -> WatchNameHandlers {
    let (appeared, vanished) = (events.clone(), events.clone());
    WatchNameHandlers::new()
        .on_name_appeared(move |_, name, owner| appeared.push(format!("appeared {} {}", name, owner)))
        .on_name_vanished(move |_, name| vanished.push(format!("vanished {}", name)))
}

#[test]
fn owning_alternates_and_releases() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.set_request_name_reply(2);
    let events = EventLog::default();

    let id = own_name_on_connection(
        connection,
        SVC,
        BusNameOwnerFlags::ALLOW_REPLACEMENT,
        owner_handlers(&events),
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["lost com.example.Svc connected=true"]);
    let request = &bus.received("RequestName")[0];
    assert_eq!(request.args(), &[Value::from(SVC), Value::UInt32(1)]);

    bus.emit_name_signal("NameAcquired", SVC)?;
    bus.emit_name_signal("NameAcquired", SVC)?;
    bus.emit_name_signal("NameAcquired", "com.example.Other")?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["acquired com.example.Svc"]);

    bus.emit_name_signal("NameLost", SVC)?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["lost com.example.Svc connected=true"]);

    unown_name(id);
    let release = bus.received("ReleaseName");
    assert_eq!(release.len(), 1);
    assert_eq!(release[0].arg0(), Some(SVC));

    bus.emit_name_signal("NameAcquired", SVC)?;
    bus.settle(&context);
    assert!(events.take().is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn refused_request_stops_listening() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    // DBUS_REQUEST_NAME_REPLY_EXISTS
    bus.set_request_name_reply(3);
    let events = EventLog::default();

    let id = own_name_on_connection(
        connection,
        SVC,
        BusNameOwnerFlags::DO_NOT_QUEUE,
        owner_handlers(&events),
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["lost com.example.Svc connected=true"]);

    bus.emit_name_signal("NameAcquired", SVC)?;
    bus.settle(&context);
    assert!(events.take().is_empty());

    unown_name(id);
    assert!(bus.received("ReleaseName").is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn bus_acquired_comes_first_and_close_means_lost() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    let events = EventLog::default();
    let bus_log = events.clone();
    let handlers = owner_handlers(&events)
        .on_bus_acquired(move |_, name| bus_log.push(format!("bus {}", name)));

    let shared: Arc<dyn Connection> = connection.clone();
    let id = own_name(
        move |done| done(Ok(shared)),
        SVC,
        BusNameOwnerFlags::empty(),
        handlers,
    )?;
    bus.settle(&context);
    assert_eq!(
        events.take(),
        vec!["bus com.example.Svc", "acquired com.example.Svc"]
    );

    connection.close();
    bus.settle(&context);
    assert_eq!(events.take(), vec!["lost com.example.Svc connected=false"]);

    unown_name(id);
    assert!(bus.received("ReleaseName").is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn watching_follows_the_owner() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    bus.add_owner(SVC, ":1.10");
    let events = EventLog::default();

    let id = watch_name_on_connection(
        connection,
        SVC,
        BusNameWatcherFlags::empty(),
        watcher_handlers(&events),
    )?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["appeared com.example.Svc :1.10"]);
    assert!(bus.received("StartServiceByName").is_empty());

    bus.set_owner(SVC, Some(":1.11"))?;
    bus.settle(&context);
    assert_eq!(
        events.take(),
        vec!["vanished com.example.Svc", "appeared com.example.Svc :1.11"]
    );

    bus.set_owner(SVC, None)?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["vanished com.example.Svc"]);

    unwatch_name(id);
    bus.set_owner(SVC, Some(":1.12"))?;
    bus.settle(&context);
    assert!(events.take().is_empty());
    context.pop_thread_default();
    Ok(())
}

#[test]
fn watching_with_auto_start() -> Result<()> {
    let context = MainContext::new();
    context.push_thread_default();
    let (bus, connection) = FakeBus::connect();
    let events = EventLog::default();

    let id = watch_name_on_connection(
        connection.clone(),
        SVC,
        BusNameWatcherFlags::AUTO_START,
        watcher_handlers(&events),
    )?;
    bus.settle(&context);
    // not activatable, so the owner lookup decides
    assert_eq!(events.take(), vec!["vanished com.example.Svc"]);
    assert_eq!(bus.received("StartServiceByName").len(), 1);
    assert_eq!(bus.received("GetNameOwner").len(), 1);

    bus.set_owner(SVC, Some(":1.10"))?;
    bus.settle(&context);
    assert_eq!(events.take(), vec!["appeared com.example.Svc :1.10"]);

    connection.close();
    bus.settle(&context);
    assert_eq!(events.take(), vec!["vanished com.example.Svc"]);
    unwatch_name(id);
    context.pop_thread_default();
    Ok(())
}
