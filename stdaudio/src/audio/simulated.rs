//! In-process backend with scriptable endpoints
//!
//! Behaves like a shared-mode, event-driven audio engine without touching
//! hardware: streams tick at their buffer period, render buffers are
//! recorded, capture buffers are filled with a constant, and endpoint
//! notifications are delivered on demand. Every backend call is counted in
//! [`SimulatedStats`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stdaudio::audio::{DeviceRegistry, SimulatedBackend, SimulatedEndpoint};
//!
//! let backend = Arc::new(
//!     SimulatedBackend::new()
//!         .with_endpoint(SimulatedEndpoint::output("spk", "Speakers"))
//!         .with_endpoint(SimulatedEndpoint::output("hdmi", "HDMI").failing_activation()),
//! );
//!
//! let registry = DeviceRegistry::new(backend);
//! assert_eq!(registry.list_output_devices().unwrap().len(), 1);
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::audio::backend::{
    duration_frames, AudioBackend, AudioClient, CaptureService, NotificationHandler,
    RenderService, SubscriptionId, WaitSignal,
};
use crate::audio::error::{AudioError, AudioResult};
use crate::audio::types::{DeviceNotification, Direction, Endpoint, MixFormat};

const BACKEND_NAME: &str = "Simulated";

/// Period used when the stream is initialised with a zero duration
pub const DEFAULT_BUFFER_FRAMES: u32 = 480;

/// Script for one simulated endpoint
#[derive(Debug, Clone)]
pub struct SimulatedEndpoint {
    pub endpoint: Endpoint,
    pub mix_format: MixFormat,
    /// Activation returns an error
    pub fail_activation: bool,
    /// Stream initialisation returns an error
    pub fail_initialize: bool,
    /// Granted buffer sizes are rounded up to a multiple of this
    pub buffer_granularity: u32,
    /// Reject requests that are not a multiple of the granularity
    pub strict_alignment: bool,
    /// Frames reported as queued on render streams
    pub padding: u32,
    /// Value written into every captured sample
    pub capture_value: f32,
}

impl SimulatedEndpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            endpoint: Endpoint::new(id, name, direction),
            mix_format: MixFormat::float32(48_000, 2),
            fail_activation: false,
            fail_initialize: false,
            buffer_granularity: 1,
            strict_alignment: false,
            padding: 0,
            capture_value: 0.5,
        }
    }

    /// A stereo 48 kHz render endpoint
    pub fn output(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, Direction::Output)
    }

    /// A stereo 48 kHz capture endpoint
    pub fn input(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, Direction::Input)
    }

    pub fn with_format(mut self, mix_format: MixFormat) -> Self {
        self.mix_format = mix_format;
        self
    }

    pub fn failing_activation(mut self) -> Self {
        self.fail_activation = true;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn with_granularity(mut self, frames: u32) -> Self {
        self.buffer_granularity = frames.max(1);
        self
    }

    /// Fail initialisation for unaligned buffer sizes instead of rounding
    pub fn with_strict_alignment(mut self) -> Self {
        self.strict_alignment = true;
        self
    }

    pub fn with_padding(mut self, frames: u32) -> Self {
        self.padding = frames;
        self
    }

    pub fn with_capture_value(mut self, value: f32) -> Self {
        self.capture_value = value;
        self
    }

    /// Buffer size the fake hardware grants for a request
    fn granted_frames(&self, requested: u32) -> u32 {
        let requested = if requested == 0 {
            DEFAULT_BUFFER_FRAMES
        } else {
            requested
        };
        requested.div_ceil(self.buffer_granularity) * self.buffer_granularity
    }
}

/// Call counters
#[derive(Debug, Default)]
pub struct SimulatedStats {
    pub activations: AtomicUsize,
    pub initializations: AtomicUsize,
    pub resets: AtomicUsize,
    pub stream_starts: AtomicUsize,
    pub stream_stops: AtomicUsize,
    pub signals_created: AtomicUsize,
    pub signals_closed: AtomicUsize,
    pub priority_requests: AtomicUsize,
    pub render_periods: AtomicUsize,
    pub capture_periods: AtomicUsize,
    pub overlapping_leases: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
}

impl SimulatedStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// One registered handler
///
/// Deliveries hold `live` for reading; `unsubscribe` takes it for writing,
/// so it returns only after in-flight deliveries finish.
struct Subscription {
    id: SubscriptionId,
    handler: NotificationHandler,
    live: RwLock<bool>,
}

type Subscriptions = ArcSwap<Vec<Arc<Subscription>>>;

fn dispatch(subscriptions: &Subscriptions, notification: &DeviceNotification) {
    let current = subscriptions.load_full();
    for subscription in current.iter() {
        let live = subscription
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if *live {
            (subscription.handler)(notification);
        }
    }
}

/// Scriptable in-process [`AudioBackend`]
pub struct SimulatedBackend {
    endpoints: Mutex<Vec<SimulatedEndpoint>>,
    default_input: Mutex<Option<String>>,
    default_output: Mutex<Option<String>>,
    enumerator_available: AtomicBool,
    handlers: Arc<Subscriptions>,
    next_subscription: AtomicU64,
    stats: Arc<SimulatedStats>,
    rendered: Arc<Mutex<Vec<f32>>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// A backend with no endpoints
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(Vec::new()),
            default_input: Mutex::new(None),
            default_output: Mutex::new(None),
            enumerator_available: AtomicBool::new(true),
            handlers: Arc::new(ArcSwap::from_pointee(Vec::new())),
            next_subscription: AtomicU64::new(1),
            stats: Arc::new(SimulatedStats::default()),
            rendered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A backend with one default speaker and one default microphone
    pub fn with_default_endpoints() -> Self {
        let backend = Self::new()
            .with_endpoint(SimulatedEndpoint::output("sim-speakers", "Simulated Speakers"))
            .with_endpoint(SimulatedEndpoint::input("sim-microphone", "Simulated Microphone"));
        backend.set_default(Direction::Output, Some("sim-speakers"));
        backend.set_default(Direction::Input, Some("sim-microphone"));
        backend
    }

    /// Add an endpoint (builder form)
    pub fn with_endpoint(self, endpoint: SimulatedEndpoint) -> Self {
        self.add_endpoint(endpoint);
        self
    }

    /// Add an endpoint; notifications are not sent automatically
    pub fn add_endpoint(&self, endpoint: SimulatedEndpoint) {
        lock(&self.endpoints).push(endpoint);
    }

    /// Remove an endpoint by id
    pub fn remove_endpoint(&self, id: &str) -> bool {
        let mut endpoints = lock(&self.endpoints);
        let before = endpoints.len();
        endpoints.retain(|e| e.endpoint.id != id);
        before != endpoints.len()
    }

    /// Set or clear the default endpoint of a direction
    pub fn set_default(&self, direction: Direction, id: Option<&str>) {
        let slot = match direction {
            Direction::Input => &self.default_input,
            Direction::Output => &self.default_output,
        };
        *lock(slot) = id.map(str::to_string);
    }

    /// Make enumeration fail as if the platform enumerator were missing
    pub fn set_enumerator_available(&self, available: bool) {
        self.enumerator_available.store(available, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<SimulatedStats> {
        Arc::clone(&self.stats)
    }

    /// Samples written by the most recent render period
    pub fn last_rendered(&self) -> Vec<f32> {
        lock(&self.rendered).clone()
    }

    /// Number of live notification subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.handlers.load().len()
    }

    /// Deliver a notification synchronously on the calling thread
    pub fn notify(&self, notification: &DeviceNotification) {
        dispatch(&self.handlers, notification);
    }

    /// Deliver a notification from a separate thread, as real hardware does
    ///
    /// Handlers are looked up on the delivering thread; one unsubscribed
    /// before delivery starts is not called.
    pub fn notify_from_thread(&self, notification: DeviceNotification) -> JoinHandle<()> {
        let handlers = Arc::clone(&self.handlers);
        thread::spawn(move || dispatch(&handlers, &notification))
    }

    fn check_enumerator(&self) -> AudioResult<()> {
        if self.enumerator_available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AudioError::EnumeratorUnavailable(
                "simulated enumerator disabled".to_string(),
            ))
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn enumerate_endpoints(&self, direction: Direction) -> AudioResult<Vec<Endpoint>> {
        self.check_enumerator()?;
        Ok(lock(&self.endpoints)
            .iter()
            .filter(|e| e.endpoint.direction == direction)
            .map(|e| e.endpoint.clone())
            .collect())
    }

    fn default_endpoint(&self, direction: Direction) -> AudioResult<Option<Endpoint>> {
        self.check_enumerator()?;
        let slot = match direction {
            Direction::Input => &self.default_input,
            Direction::Output => &self.default_output,
        };
        let Some(id) = lock(slot).clone() else {
            return Ok(None);
        };

        Ok(lock(&self.endpoints)
            .iter()
            .find(|e| e.endpoint.id == id && e.endpoint.direction == direction)
            .map(|e| e.endpoint.clone()))
    }

    fn activate(&self, endpoint: &Endpoint) -> AudioResult<Box<dyn AudioClient>> {
        let script = lock(&self.endpoints)
            .iter()
            .find(|e| e.endpoint.id == endpoint.id)
            .cloned()
            .ok_or_else(|| AudioError::ActivationFailed {
                endpoint: endpoint.id.clone(),
                reason: "unknown endpoint".to_string(),
            })?;

        if script.fail_activation {
            return Err(AudioError::ActivationFailed {
                endpoint: endpoint.id.clone(),
                reason: "simulated activation failure".to_string(),
            });
        }

        SimulatedStats::bump(&self.stats.activations);
        Ok(Box::new(SimulatedClient {
            script,
            stats: Arc::clone(&self.stats),
            rendered: Arc::clone(&self.rendered),
            stream: None,
            needs_reset: false,
            started: Arc::new(AtomicBool::new(false)),
            signal: None,
        }))
    }

    fn subscribe(&self, handler: NotificationHandler) -> AudioResult<SubscriptionId> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let subscription = Arc::new(Subscription {
            id,
            handler,
            live: RwLock::new(true),
        });
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&subscription));
            next
        });
        SimulatedStats::bump(&self.stats.subscribes);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let previous = self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.retain(|existing| existing.id != id);
            next
        });

        // Waits for deliveries already inside the handler
        if let Some(removed) = previous.iter().find(|existing| existing.id == id) {
            *removed.live.write().unwrap_or_else(PoisonError::into_inner) = false;
        }
        SimulatedStats::bump(&self.stats.unsubscribes);
    }
}

/// Negotiated stream parameters
#[derive(Debug, Clone, Copy)]
struct StreamShape {
    frames: u32,
    channels: usize,
    period: Duration,
}

struct SimulatedClient {
    script: SimulatedEndpoint,
    stats: Arc<SimulatedStats>,
    rendered: Arc<Mutex<Vec<f32>>>,
    stream: Option<StreamShape>,
    /// Set by any `initialize` attempt, cleared by `reset`
    needs_reset: bool,
    started: Arc<AtomicBool>,
    signal: Option<Arc<SimulatedSignal>>,
}

impl SimulatedClient {
    fn shape(&self) -> AudioResult<StreamShape> {
        self.stream
            .ok_or_else(|| AudioError::backend(BACKEND_NAME, "stream not initialized"))
    }
}

impl AudioClient for SimulatedClient {
    fn mix_format(&mut self) -> AudioResult<MixFormat> {
        Ok(self.script.mix_format)
    }

    fn initialize(&mut self, format: &MixFormat, buffer_duration: Duration) -> AudioResult<()> {
        if self.needs_reset {
            return Err(AudioError::StreamInitFailed(
                "stream already initialized".to_string(),
            ));
        }
        self.needs_reset = true;

        if self.script.fail_initialize {
            return Err(AudioError::StreamInitFailed(
                "simulated initialize failure".to_string(),
            ));
        }
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::StreamInitFailed(
                "invalid stream format".to_string(),
            ));
        }

        let requested = duration_frames(buffer_duration, format.sample_rate);
        if self.script.strict_alignment && requested % self.script.buffer_granularity != 0 {
            return Err(AudioError::StreamInitFailed(format!(
                "buffer size {requested} not aligned to {} frames",
                self.script.buffer_granularity
            )));
        }
        let frames = self.script.granted_frames(requested);
        let period = Duration::from_nanos(
            u64::from(frames) * 1_000_000_000 / u64::from(format.sample_rate),
        )
        .max(Duration::from_millis(1));

        self.stream = Some(StreamShape {
            frames,
            channels: usize::from(format.channels),
            period,
        });
        SimulatedStats::bump(&self.stats.initializations);
        Ok(())
    }

    fn buffer_frame_count(&mut self) -> AudioResult<u32> {
        self.stream
            .map(|shape| shape.frames)
            .ok_or_else(|| AudioError::BufferSizeFailed("stream not initialized".to_string()))
    }

    fn current_padding(&mut self) -> AudioResult<u32> {
        let shape = self.shape()?;
        match self.script.endpoint.direction {
            Direction::Output => Ok(self.script.padding.min(shape.frames)),
            Direction::Input => Ok(0),
        }
    }

    fn render_service(&mut self) -> AudioResult<Box<dyn RenderService>> {
        let shape = self
            .stream
            .filter(|_| self.script.endpoint.direction.is_output())
            .ok_or(AudioError::ServiceUnavailable(Direction::Output))?;

        Ok(Box::new(SimulatedRender {
            memory: vec![0.0; shape.frames as usize * shape.channels],
            channels: shape.channels,
            leased: false,
            stats: Arc::clone(&self.stats),
            rendered: Arc::clone(&self.rendered),
        }))
    }

    fn capture_service(&mut self) -> AudioResult<Box<dyn CaptureService>> {
        let shape = self
            .stream
            .filter(|_| self.script.endpoint.direction.is_input())
            .ok_or(AudioError::ServiceUnavailable(Direction::Input))?;

        Ok(Box::new(SimulatedCapture {
            memory: vec![0.0; shape.frames as usize * shape.channels],
            frames: shape.frames,
            value: self.script.capture_value,
            leased: false,
            started: Arc::clone(&self.started),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn create_wait_signal(&mut self) -> AudioResult<Arc<dyn WaitSignal>> {
        let signal = Arc::new(SimulatedSignal {
            state: Mutex::new(SignalState::default()),
            wake: Condvar::new(),
            started: Arc::clone(&self.started),
            stats: Arc::clone(&self.stats),
        });
        self.signal = Some(Arc::clone(&signal));
        SimulatedStats::bump(&self.stats.signals_created);
        Ok(signal)
    }

    fn arm_wait_signal(&mut self, _signal: &Arc<dyn WaitSignal>) -> AudioResult<()> {
        let shape = self.shape()?;
        let signal = self
            .signal
            .as_ref()
            .ok_or_else(|| AudioError::WaitSignalFailed("no signal created".to_string()))?;
        lock(&signal.state).period = Some(shape.period);
        Ok(())
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        if self.stream.is_none() {
            return Err(AudioError::StreamStartFailed(
                "stream not initialized".to_string(),
            ));
        }
        self.started.store(true, Ordering::SeqCst);
        SimulatedStats::bump(&self.stats.stream_starts);
        Ok(())
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        self.started.store(false, Ordering::SeqCst);
        SimulatedStats::bump(&self.stats.stream_stops);
        Ok(())
    }

    fn reset(&mut self) -> AudioResult<()> {
        self.started.store(false, Ordering::SeqCst);
        self.stream = None;
        self.signal = None;
        self.needs_reset = false;
        SimulatedStats::bump(&self.stats.resets);
        Ok(())
    }

    fn promote_current_thread(&self) -> bool {
        SimulatedStats::bump(&self.stats.priority_requests);
        true
    }
}

struct SimulatedRender {
    memory: Vec<f32>,
    channels: usize,
    leased: bool,
    stats: Arc<SimulatedStats>,
    rendered: Arc<Mutex<Vec<f32>>>,
}

impl RenderService for SimulatedRender {
    fn acquire_buffer(&mut self, frames: u32) -> AudioResult<Option<NonNull<f32>>> {
        let len = frames as usize * self.channels;
        if len > self.memory.len() {
            return Err(AudioError::backend(
                BACKEND_NAME,
                format!("requested {frames} frames, buffer holds {}", self.memory.len() / self.channels.max(1)),
            ));
        }
        if self.leased {
            SimulatedStats::bump(&self.stats.overlapping_leases);
        }
        self.leased = true;
        self.memory[..len].fill(0.0);
        Ok(NonNull::new(self.memory.as_mut_ptr()))
    }

    fn release_buffer(&mut self, frames: u32) -> AudioResult<()> {
        let len = (frames as usize * self.channels).min(self.memory.len());
        *lock(&self.rendered) = self.memory[..len].to_vec();
        self.leased = false;
        SimulatedStats::bump(&self.stats.render_periods);
        Ok(())
    }
}

struct SimulatedCapture {
    memory: Vec<f32>,
    frames: u32,
    value: f32,
    leased: bool,
    started: Arc<AtomicBool>,
    stats: Arc<SimulatedStats>,
}

impl CaptureService for SimulatedCapture {
    fn next_packet_size(&mut self) -> AudioResult<u32> {
        if self.started.load(Ordering::SeqCst) {
            Ok(self.frames)
        } else {
            Ok(0)
        }
    }

    fn acquire_buffer(&mut self) -> AudioResult<Option<(NonNull<f32>, u32)>> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.leased {
            SimulatedStats::bump(&self.stats.overlapping_leases);
        }
        self.leased = true;
        self.memory.fill(self.value);
        Ok(NonNull::new(self.memory.as_mut_ptr()).map(|ptr| (ptr, self.frames)))
    }

    fn release_buffer(&mut self, _frames: u32) -> AudioResult<()> {
        self.leased = false;
        SimulatedStats::bump(&self.stats.capture_periods);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SignalState {
    period: Option<Duration>,
    closed: bool,
}

/// Fires once per period while the stream is started
struct SimulatedSignal {
    state: Mutex<SignalState>,
    wake: Condvar,
    started: Arc<AtomicBool>,
    stats: Arc<SimulatedStats>,
}

impl WaitSignal for SimulatedSignal {
    fn wait(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        if state.closed {
            return false;
        }

        let running = self.started.load(Ordering::SeqCst);
        let wait_for = match state.period {
            Some(period) if running => period.min(timeout),
            _ => timeout,
        };

        let (state, _) = self
            .wake
            .wait_timeout_while(state, wait_for, |s| !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        !state.closed && self.started.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if !state.closed {
            state.closed = true;
            SimulatedStats::bump(&self.stats.signals_closed);
        }
        self.wake.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
