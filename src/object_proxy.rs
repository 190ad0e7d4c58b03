//! A remote object as seen through an object manager: one path and the
//! interface proxies found on it.

use crate::connection::Connection;
use crate::proxy::{DBusInterface, Proxy};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub struct ObjectProxy {
    connection: Arc<dyn Connection>,
    object_path: String,
    interfaces: Mutex<BTreeMap<String, Arc<Proxy>>>,
}

impl ObjectProxy {
    pub(crate) fn new(connection: Arc<dyn Connection>, object_path: &str) -> Arc<ObjectProxy> {
        Arc::new(ObjectProxy {
            connection,
            object_path: object_path.to_owned(),
            interfaces: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn interface(&self, interface_name: &str) -> Option<Arc<Proxy>> {
        self.interfaces.lock().get(interface_name).cloned()
    }

    /// All interface proxies, ordered by interface name.
    pub fn interfaces(&self) -> Vec<Arc<Proxy>> {
        self.interfaces.lock().values().cloned().collect()
    }

    /// True when every attached interface is named in `interface_names`.
    pub(crate) fn is_covered_by(&self, interface_names: &[&str]) -> bool {
        self.interfaces
            .lock()
            .keys()
            .all(|name| interface_names.contains(&name.as_str()))
    }

    /// Attaches `proxy`, replacing any proxy for the same interface.
    pub(crate) fn add_interface(self: &Arc<Self>, proxy: Arc<Proxy>) {
        proxy.set_object(Some(self));
        let replaced = self
            .interfaces
            .lock()
            .insert(proxy.interface_name().to_owned(), proxy);
        if let Some(old) = replaced {
            old.set_object(None);
        }
    }

    pub(crate) fn remove_interface(&self, interface_name: &str) -> Option<Arc<Proxy>> {
        let removed = self.interfaces.lock().remove(interface_name);
        if let Some(proxy) = &removed {
            proxy.set_object(None);
        }
        removed
    }
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("object_path", &self.object_path)
            .field("interfaces", &self.interfaces.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, MessageConnection, Transport};
    use crate::error::Result;
    use crate::fdlist::FdList;
    use crate::proxy::ProxyFlags;
    use test_log::test;

    struct Sink;

    impl Transport for Sink {
        fn send(&self, _: Vec<u8>, _: Option<FdList>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn attach_and_detach() -> Result<()> {
        let connection: Arc<dyn Connection> =
            MessageConnection::new(Arc::new(Sink), ConnectionConfig::default());
        let object = ObjectProxy::new(connection.clone(), "/o/1");
        let proxy = Proxy::builder(connection, "/o/1", "x.y")
            .name(":1.10")
            .flags(ProxyFlags::DO_NOT_LOAD_PROPERTIES | ProxyFlags::DO_NOT_CONNECT_SIGNALS)
            .build_sync(None)?;
        object.add_interface(proxy.clone());
        assert_eq!(object.interfaces().len(), 1);
        assert!(object.is_covered_by(&["x.y", "x.z"]));
        assert!(!object.is_covered_by(&["x.z", "x.z"]));
        assert!(proxy.object().map_or(false, |o| Arc::ptr_eq(&o, &object)));
        assert!(object.interface("x.y").is_some());
        assert!(object.remove_interface("x.y").is_some());
        assert!(proxy.object().is_none());
        assert!(object.interfaces().is_empty());
        Ok(())
    }
}
