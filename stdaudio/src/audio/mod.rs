/// Hardware backend traits
pub mod backend;

/// Interleaved sample views
pub mod buffer;

/// Audio device handle and processing thread
pub mod device;

/// Audio-related error types
pub mod error;

/// Device-change notifications
pub mod monitor;

/// Device enumeration
pub mod registry;

/// In-process backend
pub mod simulated;

/// Endpoint and format types
pub mod types;

/// WASAPI backend
#[cfg(target_os = "windows")]
pub mod wasapi;

// Re-export commonly used types
pub use backend::{
    platform_backend, AudioBackend, AudioClient, CaptureService, NotificationHandler,
    RenderService, SubscriptionId, WaitSignal,
};
pub use buffer::InterleavedBuffer;
pub use device::{AudioDevice, DeviceState, ProcessCallback, StreamContext};
pub use error::{AudioError, AudioResult};
pub use monitor::{
    set_device_change_callback, shutdown_device_monitor, DeviceChangeCallback, DeviceChangeKind,
    DeviceMonitor,
};
pub use registry::{
    default_input_device, default_output_device, list_input_devices, list_output_devices,
    DeviceList, DeviceRegistry,
};
pub use simulated::{SimulatedBackend, SimulatedEndpoint, SimulatedStats};
pub use types::{
    DeviceNotification, DeviceRole, Direction, Endpoint, MixFormat, SampleFormat, MAX_CHANNELS,
};
#[cfg(target_os = "windows")]
pub use wasapi::WasapiBackend;
