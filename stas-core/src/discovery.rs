//! Narrow interface to an mDNS/DNS-SD service-discovery source. The wire
//! protocol itself is out of scope here - this module defines only the
//! boundary the Finder consumes, plus a no-op implementation used when
//! zeroconf discovery is disabled and a scriptable test double.

use async_trait::async_trait;
use std::net::SocketAddr;

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ServiceKey {
    pub instance: String,
    pub stype: String,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added { key: ServiceKey, addr: SocketAddr, txt: Vec<(String, String)> },
    Removed { key: ServiceKey },
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Begin browsing the given service types, delivering events on the
    /// returned channel until the receiver is dropped.
    async fn browse(&self, stypes: &[&str]) -> mpsc::UnboundedReceiver<ServiceEvent>;
}

/// Used when zeroconf is disabled in config - never yields any event.
pub struct NullDiscovery;

#[async_trait]
impl ServiceDiscovery for NullDiscovery {
    async fn browse(&self, _stypes: &[&str]) -> mpsc::UnboundedReceiver<ServiceEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}

/// Test double: queue up events ahead of time, then have `browse` replay
/// them in order.
#[derive(Default)]
pub struct ScriptedDiscovery {
    pub events: std::sync::Mutex<Vec<ServiceEvent>>,
}

#[async_trait]
impl ServiceDiscovery for ScriptedDiscovery {
    async fn browse(&self, _stypes: &[&str]) -> mpsc::UnboundedReceiver<ServiceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        for event in events {
            let _ = tx.send(event);
        }
        rx
    }
}
