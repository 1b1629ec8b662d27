use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::audio::backend::{platform_backend, AudioBackend};
use crate::audio::device::AudioDevice;
use crate::audio::error::{AudioError, AudioResult};
use crate::audio::types::{Direction, Endpoint};
use crate::config::{AudioConfig, ConfigResult};

/// Devices produced by one enumeration call
///
/// A snapshot: it does not follow hardware changes. Use
/// [`DeviceMonitor`](crate::audio::DeviceMonitor) to learn when to enumerate again.
pub type DeviceList = Vec<AudioDevice>;

/// Enumerates endpoints and constructs [`AudioDevice`]s
///
/// Endpoints that fail to activate or negotiate a usable format are left
/// out of the results. Only a missing enumerator is reported as an error.
pub struct DeviceRegistry {
    backend: Arc<dyn AudioBackend>,
    config: ArcSwap<AudioConfig>,
}

impl DeviceRegistry {
    /// Create a registry with default device settings
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_config(backend, AudioConfig::default())
    }

    /// Create a registry applying `config` to every device it constructs
    ///
    /// Out-of-range values are not rejected here; endpoints that cannot be
    /// opened with them are skipped during enumeration.
    pub fn with_config(backend: Arc<dyn AudioBackend>, config: AudioConfig) -> Self {
        Self {
            backend,
            config: ArcSwap::new(Arc::new(config)),
        }
    }

    /// Create a registry over the platform backend
    ///
    /// # Errors
    /// Returns `AudioError::NotSupported` on platforms without a backend.
    pub fn platform() -> AudioResult<Self> {
        Ok(Self::new(platform_backend()?))
    }

    /// Backend this registry enumerates
    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Current device settings
    pub fn config(&self) -> Arc<AudioConfig> {
        self.config.load_full()
    }

    /// Replace the settings used for devices constructed from now on
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` and keeps the current settings if
    /// `config` fails validation.
    pub fn set_config(&self, config: AudioConfig) -> ConfigResult<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Raw endpoint list, without activating anything
    pub fn endpoints(&self, direction: Direction) -> AudioResult<Vec<Endpoint>> {
        let endpoints = self.backend.enumerate_endpoints(direction)?;
        Ok(endpoints
            .into_iter()
            .filter(|endpoint| endpoint.direction == direction)
            .collect())
    }

    /// All active capture devices
    pub fn list_input_devices(&self) -> AudioResult<DeviceList> {
        self.list_devices(Direction::Input)
    }

    /// All active render devices
    pub fn list_output_devices(&self) -> AudioResult<DeviceList> {
        self.list_devices(Direction::Output)
    }

    /// All active devices of one direction
    ///
    /// # Errors
    /// Returns `AudioError::EnumeratorUnavailable` if the backend cannot
    /// enumerate at all. No devices is an empty list.
    pub fn list_devices(&self, direction: Direction) -> AudioResult<DeviceList> {
        let config = self.config.load();
        let endpoints = self.endpoints(direction)?;
        let total = endpoints.len();

        let devices: DeviceList = endpoints
            .into_iter()
            .filter_map(|endpoint| {
                let label = endpoint.id.clone();
                match AudioDevice::open(self.backend.as_ref(), endpoint, &config) {
                    Ok(device) => Some(device),
                    Err(e) => {
                        warn!(endpoint = %label, error = %e, "Skipping audio endpoint");
                        None
                    }
                }
            })
            .collect();

        debug!(
            backend = self.backend.name(),
            %direction,
            found = total,
            usable = devices.len(),
            "Enumerated audio devices"
        );
        Ok(devices)
    }

    /// The default capture device
    pub fn default_input_device(&self) -> AudioResult<Option<AudioDevice>> {
        self.default_device(Direction::Input)
    }

    /// The default render device
    pub fn default_output_device(&self) -> AudioResult<Option<AudioDevice>> {
        self.default_device(Direction::Output)
    }

    /// The default device of one direction
    ///
    /// `Ok(None)` when there is no default or it cannot be constructed.
    pub fn default_device(&self, direction: Direction) -> AudioResult<Option<AudioDevice>> {
        let endpoint = match self.backend.default_endpoint(direction) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                debug!(%direction, "No default audio device");
                return Ok(None);
            }
            Err(e @ AudioError::EnumeratorUnavailable(_)) => return Err(e),
            Err(e) => {
                debug!(%direction, error = %e, "Default endpoint lookup failed");
                return Ok(None);
            }
        };

        let config = self.config.load();
        match AudioDevice::open(self.backend.as_ref(), endpoint, &config) {
            Ok(device) => Ok(Some(device)),
            Err(e) => {
                warn!(%direction, error = %e, "Default audio device unusable");
                Ok(None)
            }
        }
    }
}

/// List capture devices of the platform backend
///
/// # Example
/// ```no_run
/// use stdaudio::audio::list_input_devices;
///
/// for device in list_input_devices().unwrap() {
///     println!("{} ({} ch @ {} Hz)", device.name(), device.channels(), device.sample_rate());
/// }
/// ```
pub fn list_input_devices() -> AudioResult<DeviceList> {
    DeviceRegistry::platform()?.list_input_devices()
}

/// List render devices of the platform backend
pub fn list_output_devices() -> AudioResult<DeviceList> {
    DeviceRegistry::platform()?.list_output_devices()
}

/// Default capture device of the platform backend
pub fn default_input_device() -> AudioResult<Option<AudioDevice>> {
    DeviceRegistry::platform()?.default_input_device()
}

/// Default render device of the platform backend
pub fn default_output_device() -> AudioResult<Option<AudioDevice>> {
    DeviceRegistry::platform()?.default_output_device()
}
