//! Device-change notifications
//!
//! A [`DeviceMonitor`] turns raw backend notifications into three
//! application-level events:
//!
//! - [`DeviceChangeKind::ListChanged`]: an endpoint was added, removed or
//!   changed state
//! - [`DeviceChangeKind::DefaultInputChanged`] /
//!   [`DeviceChangeKind::DefaultOutputChanged`]: the console default moved
//!
//! Each kind holds at most one callback, backed by its own backend
//! subscription. Callbacks run synchronously on whatever thread the backend
//! delivers notifications on, so they should be short and hand heavy work
//! elsewhere (see [`DeviceMonitor::event_channel`]). Releasing a
//! subscription waits for a delivery already in progress, so a callback
//! must not call back into its own monitor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audio::backend::{platform_backend, AudioBackend, NotificationHandler, SubscriptionId};
use crate::audio::error::AudioResult;
use crate::audio::types::{DeviceNotification, DeviceRole, Direction};

/// Application-visible device change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceChangeKind {
    /// The set of endpoints changed
    ListChanged,
    /// The default capture endpoint changed
    DefaultInputChanged,
    /// The default render endpoint changed
    DefaultOutputChanged,
}

impl DeviceChangeKind {
    pub const ALL: [Self; 3] = [
        Self::ListChanged,
        Self::DefaultInputChanged,
        Self::DefaultOutputChanged,
    ];

    fn index(self) -> usize {
        match self {
            Self::ListChanged => 0,
            Self::DefaultInputChanged => 1,
            Self::DefaultOutputChanged => 2,
        }
    }

    /// Whether a raw notification should fire this kind
    ///
    /// Default changes only count for the console role.
    pub fn matches(self, notification: &DeviceNotification) -> bool {
        match notification {
            DeviceNotification::DeviceAdded { .. }
            | DeviceNotification::DeviceRemoved { .. }
            | DeviceNotification::DeviceStateChanged { .. } => self == Self::ListChanged,
            DeviceNotification::DefaultDeviceChanged {
                direction, role, ..
            } => {
                if *role != DeviceRole::Console {
                    return false;
                }
                match direction {
                    Direction::Input => self == Self::DefaultInputChanged,
                    Direction::Output => self == Self::DefaultOutputChanged,
                }
            }
            DeviceNotification::PropertyValueChanged { .. } => false,
        }
    }
}

/// Callback for a device change
pub type DeviceChangeCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Routes backend endpoint notifications to application callbacks
///
/// Dropping the monitor unsubscribes everything before its state goes
/// away, so no callback runs after `drop` returns.
pub struct DeviceMonitor {
    backend: Arc<dyn AudioBackend>,
    subscriptions: Mutex<[Option<SubscriptionId>; 3]>,
}

impl DeviceMonitor {
    /// Create a monitor with no callbacks over `backend`
    ///
    /// Nothing is subscribed until a callback is registered.
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            subscriptions: Mutex::new([None; 3]),
        }
    }

    /// Install or clear the callback for `kind`
    ///
    /// Any previous subscription for `kind` is released first. `None`
    /// just clears it.
    pub fn set_callback(
        &self,
        kind: DeviceChangeKind,
        callback: Option<DeviceChangeCallback>,
    ) -> AudioResult<()> {
        let mut subscriptions = lock(&self.subscriptions);
        let slot = &mut subscriptions[kind.index()];

        if let Some(previous) = slot.take() {
            self.backend.unsubscribe(previous);
            debug!(?kind, "Released device change subscription");
        }

        let Some(callback) = callback else {
            return Ok(());
        };

        let handler: NotificationHandler = Arc::new(move |notification: &DeviceNotification| {
            if kind.matches(notification) {
                callback();
            }
        });

        *slot = Some(self.backend.subscribe(handler)?);
        info!(?kind, backend = self.backend.name(), "Device change callback registered");
        Ok(())
    }

    /// Install the callback for `kind`, replacing any previous one
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use stdaudio::audio::{DeviceChangeKind, DeviceMonitor, SimulatedBackend};
    ///
    /// let backend = Arc::new(SimulatedBackend::new());
    /// let monitor = DeviceMonitor::new(backend);
    ///
    /// monitor
    ///     .register_callback(DeviceChangeKind::DefaultOutputChanged, || {
    ///         println!("default output changed");
    ///     })
    ///     .unwrap();
    /// ```
    pub fn register_callback<F>(&self, kind: DeviceChangeKind, callback: F) -> AudioResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.set_callback(kind, Some(Box::new(callback)))
    }

    /// Remove the callback for `kind`
    pub fn clear(&self, kind: DeviceChangeKind) {
        // Clearing never subscribes, so it cannot fail
        let _ = self.set_callback(kind, None);
    }

    /// Whether `kind` currently has a callback
    pub fn is_registered(&self, kind: DeviceChangeKind) -> bool {
        lock(&self.subscriptions)[kind.index()].is_some()
    }

    /// Receive `kind` events on a channel instead of a callback
    ///
    /// Replaces any callback registered for `kind`. The receiver can be
    /// awaited from async code; sending never blocks the backend thread.
    pub fn event_channel(
        &self,
        kind: DeviceChangeKind,
    ) -> AudioResult<mpsc::UnboundedReceiver<DeviceChangeKind>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_callback(kind, move || {
            // Receiver gone means nobody is listening any more
            let _ = tx.send(kind);
        })?;
        Ok(rx)
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for id in subscriptions.iter_mut().filter_map(Option::take) {
            self.backend.unsubscribe(id);
        }
        debug!("Device monitor torn down");
    }
}

static GLOBAL_MONITOR: Mutex<Option<DeviceMonitor>> = Mutex::new(None);

/// Install or clear a device change callback on the process-wide monitor
///
/// The monitor is created over the platform backend on first use. Callers
/// that need their own backend should construct a [`DeviceMonitor`].
pub fn set_device_change_callback(
    kind: DeviceChangeKind,
    callback: Option<DeviceChangeCallback>,
) -> AudioResult<()> {
    let mut global = lock(&GLOBAL_MONITOR);

    if global.is_none() {
        if callback.is_none() {
            return Ok(());
        }
        *global = Some(DeviceMonitor::new(platform_backend()?));
    }

    match global.as_ref() {
        Some(monitor) => monitor.set_callback(kind, callback),
        None => Ok(()),
    }
}

/// Tear down the process-wide monitor, unsubscribing every callback
pub fn shutdown_device_monitor() {
    let monitor = lock(&GLOBAL_MONITOR).take();
    drop(monitor);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
