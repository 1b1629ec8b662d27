//! Hardware backend abstraction
//!
//! The device layer never calls a platform API directly. Everything it
//! needs from the hardware goes through the traits in this file:
//!
//! - [`AudioBackend`]: enumerator, default endpoints, activation and
//!   endpoint notifications
//! - [`AudioClient`]: one activated endpoint (format, stream, wait signal)
//! - [`RenderService`] / [`CaptureService`]: buffer acquire/release
//! - [`WaitSignal`]: the event the hardware sets once per period
//!
//! This file must not contain platform-specific imports. Implementations
//! live in `wasapi.rs` (Windows) and `simulated.rs` (everywhere).

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::error::{AudioError, AudioResult};
use crate::audio::types::{DeviceNotification, Direction, Endpoint, MixFormat};

/// Handle returned by [`AudioBackend::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handler invoked by a backend on its own notification thread
pub type NotificationHandler = Arc<dyn Fn(&DeviceNotification) + Send + Sync>;

/// Platform audio backend
///
/// # Example
///
/// ```no_run
/// use stdaudio::audio::backend::platform_backend;
/// use stdaudio::audio::Direction;
///
/// let backend = platform_backend().unwrap();
/// for endpoint in backend.enumerate_endpoints(Direction::Output).unwrap() {
///     println!("{} ({})", endpoint.name, endpoint.id);
/// }
/// ```
pub trait AudioBackend: Send + Sync {
    /// Backend name (e.g. "WASAPI")
    fn name(&self) -> &'static str;

    /// All active endpoints for a direction
    ///
    /// Returns `Err(AudioError::EnumeratorUnavailable)` only when the
    /// platform enumerator itself cannot be reached. No endpoints is `Ok(vec![])`.
    fn enumerate_endpoints(&self, direction: Direction) -> AudioResult<Vec<Endpoint>>;

    /// The console default endpoint for a direction, if any
    fn default_endpoint(&self, direction: Direction) -> AudioResult<Option<Endpoint>>;

    /// Activate an endpoint and return a client for it
    fn activate(&self, endpoint: &Endpoint) -> AudioResult<Box<dyn AudioClient>>;

    /// Register for endpoint notifications
    ///
    /// The handler may be called from any thread until `unsubscribe`
    /// returns for the same id.
    fn subscribe(&self, handler: NotificationHandler) -> AudioResult<SubscriptionId>;

    /// Unregister a notification handler
    fn unsubscribe(&self, id: SubscriptionId);
}

/// An activated endpoint
pub trait AudioClient: Send {
    /// Current shared-mode mix format
    fn mix_format(&mut self) -> AudioResult<MixFormat>;

    /// Initialise the stream in shared, event-driven mode
    fn initialize(&mut self, format: &MixFormat, buffer_duration: Duration) -> AudioResult<()>;

    /// Actual hardware buffer size in frames (valid after `initialize`)
    fn buffer_frame_count(&mut self) -> AudioResult<u32>;

    /// Frames queued in the hardware buffer
    fn current_padding(&mut self) -> AudioResult<u32>;

    /// Render service (output endpoints)
    fn render_service(&mut self) -> AudioResult<Box<dyn RenderService>>;

    /// Capture service (input endpoints)
    fn capture_service(&mut self) -> AudioResult<Box<dyn CaptureService>>;

    /// Create the signal the stream will set once per period
    fn create_wait_signal(&mut self) -> AudioResult<Arc<dyn WaitSignal>>;

    /// Hand the signal to the stream
    fn arm_wait_signal(&mut self, signal: &Arc<dyn WaitSignal>) -> AudioResult<()>;

    fn start_stream(&mut self) -> AudioResult<()>;

    fn stop_stream(&mut self) -> AudioResult<()>;

    /// Discard the initialised stream
    ///
    /// A client can be initialised once. After a stop, or after a failed
    /// `initialize`, this must be called before the next `initialize`.
    /// Services obtained from the old stream must not be used afterwards.
    fn reset(&mut self) -> AudioResult<()>;

    /// Raise the calling thread's priority; best-effort
    ///
    /// Returns `true` if the request was honoured.
    fn promote_current_thread(&self) -> bool {
        false
    }
}

/// Buffer access for a render stream
pub trait RenderService: Send {
    /// Lease `frames` frames of writable memory
    ///
    /// `Ok(None)` means the backend had nothing to hand out this period.
    fn acquire_buffer(&mut self, frames: u32) -> AudioResult<Option<NonNull<f32>>>;

    /// Return the lease
    fn release_buffer(&mut self, frames: u32) -> AudioResult<()>;
}

/// Buffer access for a capture stream
pub trait CaptureService: Send {
    /// Frames in the next captured packet (0 if none)
    fn next_packet_size(&mut self) -> AudioResult<u32>;

    /// Lease the next packet as `(data, frames)`
    fn acquire_buffer(&mut self) -> AudioResult<Option<(NonNull<f32>, u32)>>;

    /// Return the lease
    fn release_buffer(&mut self, frames: u32) -> AudioResult<()>;
}

/// Event set by the hardware once per buffer period
pub trait WaitSignal: Send + Sync {
    /// Block until the signal fires or `timeout` elapses
    ///
    /// Returns `true` if the signal fired.
    fn wait(&self, timeout: Duration) -> bool;

    /// Release the signal; pending and future waits return immediately
    fn close(&self);

    /// OS handle the stream should set, for backends that need one
    fn raw_handle(&self) -> Option<*mut std::ffi::c_void> {
        None
    }
}

/// Buffer duration covering `frames` at `sample_rate`
///
/// Zero frames yields a zero duration, which lets the hardware pick its
/// default period.
pub fn buffer_duration(frames: u32, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = u64::from(frames) * 1_000_000_000 / u64::from(sample_rate);
    Duration::from_nanos(nanos)
}

/// Frames covered by `duration` at `sample_rate`, rounded up
pub fn duration_frames(duration: Duration, sample_rate: u32) -> u32 {
    let nanos = duration.as_nanos() * u128::from(sample_rate);
    nanos.div_ceil(1_000_000_000) as u32
}

/// Create the backend for the current platform
pub fn platform_backend() -> AudioResult<Arc<dyn AudioBackend>> {
    #[cfg(target_os = "windows")]
    {
        use crate::audio::wasapi::WasapiBackend;
        Ok(Arc::new(WasapiBackend::new()?))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Err(AudioError::NotSupported(
            "No native audio backend for this platform".to_string(),
        ))
    }
}
