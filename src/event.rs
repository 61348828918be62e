//! Lifecycle events and the listener bus.
//!
//! The pool publishes a typed event whenever a device's supervision state
//! changes. Publication is synchronous on the task that produced the event,
//! so listeners must return quickly; a listener that panics is isolated and
//! does not stop delivery to the others.
//!
//! Events carry the device id plus a [`Weak`] handle. Listeners may upgrade
//! the handle for the duration of the callback but must not cache it: the
//! registry may evict the device at any time.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use log::warn;

use crate::device::ModbusDevice;

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    /// First successful connect through the pool.
    Connected,
    /// Explicit disconnect through the pool.
    Disconnected,
    /// A heartbeat probe failed; recovery is starting.
    PingFailed,
    /// A failed device came back after a refresh.
    Recovered,
    /// A failed non-persistent device was evicted from the registry.
    Removed,
}

impl std::fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceEventKind::Connected => "connected",
            DeviceEventKind::Disconnected => "disconnected",
            DeviceEventKind::PingFailed => "ping-failed",
            DeviceEventKind::Recovered => "recovered",
            DeviceEventKind::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// One lifecycle event.
#[derive(Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device_id: String,
    /// Weak handle to the device; upgrade inside the callback only.
    pub device: Weak<dyn ModbusDevice>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    /// Build an event for `device`, stamped with the current time.
    pub fn new(kind: DeviceEventKind, device: &Arc<dyn ModbusDevice>) -> Self {
        Self {
            kind,
            device_id: device.device_id(),
            device: Arc::downgrade(device),
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Callback registered with [`EventBus::subscribe`].
pub type EventListener = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Synchronous fan-out of device events to any number of listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all subsequent events.
    pub fn subscribe(&self, listener: EventListener) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Deliver `event` to every listener on the calling task.
    pub fn publish(&self, event: DeviceEvent) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("event listener panicked on {} for {}", event.kind, event.device_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TcpModbusDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_device() -> Arc<dyn ModbusDevice> {
        Arc::new(TcpModbusDevice::new())
    }

    #[test]
    fn delivers_to_all_listeners() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |event: &DeviceEvent| {
                assert_eq!(event.kind, DeviceEventKind::Connected);
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let device = test_device();
        bus.publish(DeviceEvent::new(DeviceEventKind::Connected, &device));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_event: &DeviceEvent| panic!("bad listener")));
        let tail = seen.clone();
        bus.subscribe(Arc::new(move |_event: &DeviceEvent| {
            tail.fetch_add(1, Ordering::SeqCst);
        }));

        let device = test_device();
        bus.publish(DeviceEvent::new(DeviceEventKind::Removed, &device));
        // The second listener still ran, and the bus stays usable.
        bus.publish(DeviceEvent::new(DeviceEventKind::Removed, &device));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn weak_handle_does_not_keep_device_alive() {
        let bus = EventBus::new();
        let captured: Arc<RwLock<Option<Weak<dyn ModbusDevice>>>> = Arc::default();
        let slot = captured.clone();
        bus.subscribe(Arc::new(move |event: &DeviceEvent| {
            *slot.write().unwrap() = Some(event.device.clone());
        }));

        let device = test_device();
        bus.publish(DeviceEvent::new(DeviceEventKind::Disconnected, &device));
        let weak = captured.read().unwrap().clone().unwrap();
        assert!(weak.upgrade().is_some());

        drop(device);
        assert!(weak.upgrade().is_none());
    }
}
