/// Device persistence.
///
/// The farm records device presence, status and identity somewhere else
/// (a database behind the dashboard). Components only see this trait.
use farm_transport::Publisher;

use crate::envelope::{
    encode, DeviceAbsentMessage, DeviceIdentityMessage, DevicePresentMessage, DeviceStatusMessage,
    Message,
};
use crate::identity::Identity;
use crate::types::DeviceStatus;

pub trait DeviceStore: Send + Sync {
    fn set_present(&self, serial: &str, provider: &str);
    fn set_absent(&self, serial: &str);
    fn set_status(&self, serial: &str, status: DeviceStatus);
    fn save_identity(&self, serial: &str, identity: &Identity);
}

/// Publishes every record as a message on one bus channel, for the
/// persistence service to consume.
#[derive(Clone)]
pub struct BusStore {
    publisher: Publisher,
    channel: String,
}

impl BusStore {
    pub fn new(publisher: Publisher, channel: impl Into<String>) -> Self {
        Self {
            publisher,
            channel: channel.into(),
        }
    }

    fn send(&self, message: Message) {
        match encode(&message) {
            Ok(bytes) => self.publisher.publish(&self.channel, bytes),
            Err(e) => tracing::warn!("store: cannot encode {:?}: {e}", message.message_type()),
        }
    }
}

impl DeviceStore for BusStore {
    fn set_present(&self, serial: &str, provider: &str) {
        self.send(Message::DevicePresent(DevicePresentMessage {
            serial: serial.to_string(),
            provider: provider.to_string(),
        }));
    }

    fn set_absent(&self, serial: &str) {
        self.send(Message::DeviceAbsent(DeviceAbsentMessage {
            serial: serial.to_string(),
        }));
    }

    fn set_status(&self, serial: &str, status: DeviceStatus) {
        self.send(Message::DeviceStatus(DeviceStatusMessage {
            serial: serial.to_string(),
            status,
        }));
    }

    fn save_identity(&self, serial: &str, identity: &Identity) {
        self.send(Message::DeviceIdentity(DeviceIdentityMessage {
            serial: serial.to_string(),
            identity: identity.clone(),
        }));
    }
}

/// Records to the log only. Used when no persistence service is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStore;

impl DeviceStore for LogStore {
    fn set_present(&self, serial: &str, provider: &str) {
        tracing::info!(serial, provider, "device present");
    }

    fn set_absent(&self, serial: &str) {
        tracing::info!(serial, "device absent");
    }

    fn set_status(&self, serial: &str, status: DeviceStatus) {
        tracing::info!(serial, ?status, "device status");
    }

    fn save_identity(&self, serial: &str, identity: &Identity) {
        tracing::info!(serial, attributes = ?identity.attributes(), "device identity");
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: std::sync::Mutex<Vec<StoreRecord>>,
}

/// One call made on a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRecord {
    Present { serial: String, provider: String },
    Absent { serial: String },
    Status { serial: String, status: DeviceStatus },
    Identity { serial: String, identity: Identity },
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StoreRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoreRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceStore for MemoryStore {
    fn set_present(&self, serial: &str, provider: &str) {
        self.lock().push(StoreRecord::Present {
            serial: serial.to_string(),
            provider: provider.to_string(),
        });
    }

    fn set_absent(&self, serial: &str) {
        self.lock().push(StoreRecord::Absent {
            serial: serial.to_string(),
        });
    }

    fn set_status(&self, serial: &str, status: DeviceStatus) {
        self.lock().push(StoreRecord::Status {
            serial: serial.to_string(),
            status,
        });
    }

    fn save_identity(&self, serial: &str, identity: &Identity) {
        self.lock().push(StoreRecord::Identity {
            serial: serial.to_string(),
            identity: identity.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_records_in_order() {
        let store = MemoryStore::new();
        store.set_present("A", "p1");
        store.set_status("A", DeviceStatus::Online);
        store.set_absent("A");
        assert_eq!(
            store.records(),
            vec![
                StoreRecord::Present {
                    serial: "A".into(),
                    provider: "p1".into()
                },
                StoreRecord::Status {
                    serial: "A".into(),
                    status: DeviceStatus::Online
                },
                StoreRecord::Absent { serial: "A".into() },
            ]
        );
    }

    #[test]
    fn bus_store_without_connections_drops_quietly() {
        let store = BusStore::new(Publisher::disconnected(), "devices");
        store.set_present("A", "p1");
        store.save_identity("A", &Identity::default());
    }
}
