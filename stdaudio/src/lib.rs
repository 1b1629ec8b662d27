//! Audio endpoints as devices with event-driven real-time callbacks
//!
//! ```no_run
//! use stdaudio::audio::{DeviceRegistry, SimulatedBackend};
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new(Arc::new(SimulatedBackend::with_default_endpoints()));
//! let mut device = registry.default_output_device().unwrap().unwrap();
//!
//! device.connect(|_, buffer| buffer.fill(0.0)).unwrap();
//! device.start().unwrap();
//! device.stop();
//! ```

/// Audio devices, enumeration and notifications
pub mod audio;

/// Device configuration
pub mod config;

/// Utility modules
pub mod utils;

pub use audio::{AudioDevice, AudioError, AudioResult, DeviceRegistry, InterleavedBuffer};
pub use config::{AudioConfig, ConfigManager};
