use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audio::backend::{
    buffer_duration, AudioBackend, AudioClient, CaptureService, RenderService, WaitSignal,
};
use crate::audio::buffer::InterleavedBuffer;
use crate::audio::error::{AudioError, AudioResult};
use crate::audio::types::{Direction, Endpoint, MixFormat, SampleFormat, MAX_CHANNELS};
use crate::config::{AudioConfig, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};

/// Processing callback run once per hardware period on the real-time thread
pub type ProcessCallback =
    Box<dyn FnMut(&StreamContext, &mut InterleavedBuffer<'_>) + Send + 'static>;

type StopCallback = Box<dyn FnOnce(&StreamContext) + Send + 'static>;

type SharedClient = Arc<Mutex<Box<dyn AudioClient>>>;

/// Snapshot of a running device as seen from the processing thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamContext {
    /// Endpoint identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Stream direction
    pub direction: Direction,
    /// Frames per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Hardware buffer size in frames
    pub buffer_frames: u32,
}

/// Lifecycle state of an [`AudioDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Constructed or stopped; may be configured and started
    Configured,
    /// Inside `start`
    Starting,
    /// Processing thread is live
    Running,
    /// Inside `stop`
    Stopping,
}

/// One audio endpoint with its own real-time processing thread
///
/// Devices are produced by [`DeviceRegistry`](crate::audio::DeviceRegistry);
/// they cannot be cloned. Dropping a device stops it.
///
/// # Example
/// ```no_run
/// use stdaudio::audio::default_output_device;
///
/// let mut device = default_output_device().unwrap().expect("no output device");
/// let channels = device.channels() as usize;
///
/// device
///     .connect(move |_, buffer| {
///         for frame in buffer.frames_mut() {
///             frame[..channels].fill(0.0);
///         }
///     })
///     .unwrap();
///
/// device.start().unwrap();
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// device.stop();
/// ```
pub struct AudioDevice {
    endpoint: Endpoint,
    client: SharedClient,
    mix_format: MixFormat,
    /// Requested size before start, hardware size after
    buffer_frames: u32,
    realtime_priority: bool,
    wait_timeout: Duration,
    state: DeviceState,
    running: Arc<AtomicBool>,
    /// Locked by the processing thread for its whole lifetime
    callback: Arc<Mutex<Option<ProcessCallback>>>,
    stop_callback: Option<StopCallback>,
    signal: Option<Arc<dyn WaitSignal>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioDevice {
    /// Activate an endpoint and negotiate its mix format
    pub(crate) fn open(
        backend: &dyn AudioBackend,
        endpoint: Endpoint,
        config: &AudioConfig,
    ) -> AudioResult<Self> {
        if endpoint.id.is_empty() {
            return Err(AudioError::InvalidEndpoint(
                "could not get device id".to_string(),
            ));
        }
        if endpoint.name.is_empty() {
            return Err(AudioError::InvalidEndpoint(format!(
                "could not get name of device {}",
                endpoint.id
            )));
        }

        let mut client = backend.activate(&endpoint)?;
        let mut mix_format = client.mix_format()?;
        validate_mix_format(&mix_format)?;

        if let Some(rate) = config.sample_rate {
            check_sample_rate(rate)?;
            mix_format.sample_rate = rate;
            mix_format.fixup();
        }

        debug!(
            device = %endpoint.name,
            direction = %endpoint.direction,
            sample_rate = mix_format.sample_rate,
            channels = mix_format.channels,
            format = ?mix_format.sample_format,
            "Opened audio device"
        );

        Ok(Self {
            endpoint,
            client: Arc::new(Mutex::new(client)),
            mix_format,
            buffer_frames: config.buffer_size_frames,
            realtime_priority: config.realtime_priority,
            wait_timeout: config.wait_timeout(),
            state: DeviceState::Configured,
            running: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(None)),
            stop_callback: None,
            signal: None,
            thread: None,
        })
    }

    /// Endpoint identifier
    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    /// Stream direction of the endpoint
    pub fn direction(&self) -> Direction {
        self.endpoint.direction
    }

    /// Check if this is a capture device
    pub fn is_input(&self) -> bool {
        self.endpoint.direction.is_input()
    }

    /// Check if this is a render device
    pub fn is_output(&self) -> bool {
        self.endpoint.direction.is_output()
    }

    /// Channel count of the negotiated format
    pub fn channels(&self) -> u16 {
        self.mix_format.channels
    }

    /// Capture channels (0 for output devices)
    pub fn input_channels(&self) -> u16 {
        if self.is_input() { self.channels() } else { 0 }
    }

    /// Render channels (0 for input devices)
    pub fn output_channels(&self) -> u16 {
        if self.is_output() { self.channels() } else { 0 }
    }

    /// Frames per second the stream is opened with
    pub fn sample_rate(&self) -> u32 {
        self.mix_format.sample_rate
    }

    /// Buffer size in frames
    ///
    /// Before `start` this is the requested size; once started it is the
    /// size the hardware actually granted.
    pub fn buffer_size_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Format the stream is opened with
    ///
    /// This is the endpoint's mix format, switched to float samples by
    /// [`connect`](Self::connect) and carrying any sample rate override.
    pub fn mix_format(&self) -> &MixFormat {
        &self.mix_format
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Check if the processing thread is live
    ///
    /// Stays `true` after a processing error ends the thread, until `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check whether the hardware has room to render or data to capture
    ///
    /// Polls the backend for the current padding.
    pub fn has_unprocessed_io(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        match lock(&self.client).current_padding() {
            Ok(padding) => self.buffer_frames.saturating_sub(padding) > 0,
            Err(e) => {
                debug!(device = %self.endpoint.name, error = %e, "Padding query failed");
                false
            }
        }
    }

    /// Change the sample rate used at the next `start`
    ///
    /// # Arguments
    /// * `sample_rate` - Frames per second, within
    ///   `MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE`
    ///
    /// # Errors
    /// Returns `AudioError::DeviceRunning` if the device is running and
    /// `AudioError::UnsupportedFormat` if the rate is out of range.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> AudioResult<()> {
        if self.is_running() {
            return Err(AudioError::DeviceRunning("change the sample rate"));
        }
        check_sample_rate(sample_rate)?;

        self.mix_format.sample_rate = sample_rate;
        self.mix_format.fixup();
        Ok(())
    }

    /// Change the buffer size requested at the next `start`
    ///
    /// Zero lets the hardware pick its default period. The granted size may
    /// differ and replaces this value once the device starts.
    ///
    /// # Errors
    /// Returns `AudioError::DeviceRunning` if the device is running.
    pub fn set_buffer_size_frames(&mut self, frames: u32) -> AudioResult<()> {
        if self.is_running() {
            return Err(AudioError::DeviceRunning("change the buffer size"));
        }

        self.buffer_frames = frames;
        Ok(())
    }

    /// Register the processing callback
    ///
    /// Replaces any previous callback and switches the stream format to
    /// 32-bit float samples.
    ///
    /// # Errors
    /// Returns `AudioError::DeviceRunning` if the device is running.
    pub fn connect<F>(&mut self, callback: F) -> AudioResult<()>
    where
        F: FnMut(&StreamContext, &mut InterleavedBuffer<'_>) + Send + 'static,
    {
        if self.is_running() {
            return Err(AudioError::DeviceRunning("connect a callback"));
        }

        self.mix_format.set_float32();
        *lock(&self.callback) = Some(Box::new(callback));
        debug!(device = %self.endpoint.name, "Processing callback connected");
        Ok(())
    }

    /// Start streaming with no start/stop hooks
    pub fn start(&mut self) -> AudioResult<()> {
        self.start_with(|_| {}, |_| {})
    }

    /// Start streaming
    ///
    /// `on_start` runs on the calling thread once the processing thread is
    /// spawned. `on_stop` runs at the end of the next `stop`.
    ///
    /// Starting a running device is a no-op. On failure the device stays
    /// stopped and everything acquired so far is released, so the call can
    /// be retried (for example after adjusting the buffer size).
    ///
    /// # Errors
    /// Returns the error of the first step that failed: stream
    /// initialisation, service lookup, buffer size query, wait signal,
    /// stream start or thread spawn.
    pub fn start_with<S, T>(&mut self, on_start: S, on_stop: T) -> AudioResult<()>
    where
        S: FnOnce(&StreamContext),
        T: FnOnce(&StreamContext) + Send + 'static,
    {
        if self.is_running() {
            debug!(device = %self.endpoint.name, "Audio device already started");
            return Ok(());
        }

        info!(device = %self.endpoint.name, direction = %self.endpoint.direction, "Starting audio device");
        self.state = DeviceState::Starting;

        match self.launch() {
            Ok(context) => {
                self.state = DeviceState::Running;
                on_start(&context);
                self.stop_callback = Some(Box::new(on_stop));
                info!(
                    device = %context.name,
                    sample_rate = context.sample_rate,
                    frames = context.buffer_frames,
                    "Audio device started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Configured;
                warn!(device = %self.endpoint.name, error = %e, "Failed to start audio device");
                Err(e)
            }
        }
    }

    /// Stop streaming
    ///
    /// Joins the processing thread, stops the hardware stream, closes the
    /// wait signal and runs the stop hook. Safe to call on a stopped device.
    /// Blocks for as long as the current callback invocation takes.
    pub fn stop(&mut self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!(device = %self.endpoint.name, "Stopping audio device");
        self.state = DeviceState::Stopping;

        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(device = %self.endpoint.name, "Processing thread panicked");
            }
        }

        {
            let mut client = lock(&self.client);
            if let Err(e) = client.stop_stream() {
                warn!(device = %self.endpoint.name, error = %e, "Failed to stop hardware stream");
            }
            if let Err(e) = client.reset() {
                warn!(device = %self.endpoint.name, error = %e, "Failed to reset audio client");
            }
        }

        if let Some(signal) = self.signal.take() {
            signal.close();
        }

        self.state = DeviceState::Configured;

        if let Some(on_stop) = self.stop_callback.take() {
            on_stop(&self.context());
        }

        debug!(device = %self.endpoint.name, "Audio device stopped");
    }

    fn context(&self) -> StreamContext {
        StreamContext {
            id: self.endpoint.id.clone(),
            name: self.endpoint.name.clone(),
            direction: self.endpoint.direction,
            sample_rate: self.mix_format.sample_rate,
            channels: self.mix_format.channels,
            buffer_frames: self.buffer_frames,
        }
    }

    /// Bring up the hardware stream and spawn the processing thread
    fn launch(&mut self) -> AudioResult<StreamContext> {
        let duration = buffer_duration(self.buffer_frames, self.mix_format.sample_rate);

        let (signal, io) = {
            let shared = Arc::clone(&self.client);
            let mut client = lock(&shared);
            let signal = client.create_wait_signal()?;

            match self.prepare_stream(&mut **client, &signal, duration) {
                Ok(io) => (signal, io),
                Err(e) => {
                    if let Err(reset_err) = client.reset() {
                        warn!(error = %reset_err, "Failed to reset audio client after start failure");
                    }
                    signal.close();
                    return Err(e);
                }
            }
        };

        let context = self.context();
        let mut processor = Processor {
            context: context.clone(),
            format: self.mix_format,
            client: Arc::clone(&self.client),
            io,
        };
        let running = Arc::clone(&self.running);
        let callback_slot = Arc::clone(&self.callback);
        let thread_signal = Arc::clone(&signal);
        let realtime_priority = self.realtime_priority;
        let wait_timeout = self.wait_timeout;

        self.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(format!("stdaudio-{}", self.endpoint.direction))
            .spawn(move || {
                if realtime_priority {
                    let promoted = lock(&processor.client).promote_current_thread();
                    debug!(promoted, "Processing thread priority requested");
                }

                let mut callback = lock(&callback_slot);
                debug!(device = %processor.context.name, "Processing thread running");

                while running.load(Ordering::Acquire) {
                    if let Some(callback) = callback.as_mut() {
                        if let Err(e) = processor.process(callback) {
                            error!(device = %processor.context.name, error = %e, "Audio processing failed");
                            break;
                        }
                    }
                    thread_signal.wait(wait_timeout);
                }

                debug!(device = %processor.context.name, "Processing thread exiting");
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.signal = Some(signal);
                Ok(context)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                let mut client = lock(&self.client);
                if let Err(stop_err) = client.stop_stream() {
                    warn!(error = %stop_err, "Failed to stop hardware stream after spawn failure");
                }
                if let Err(reset_err) = client.reset() {
                    warn!(error = %reset_err, "Failed to reset audio client after spawn failure");
                }
                drop(client);
                signal.close();
                Err(AudioError::ThreadSpawnFailed(e))
            }
        }
    }

    /// Initialise, fetch services, adopt the hardware buffer size, arm and start
    fn prepare_stream(
        &mut self,
        client: &mut dyn AudioClient,
        signal: &Arc<dyn WaitSignal>,
        duration: Duration,
    ) -> AudioResult<StreamIo> {
        client.initialize(&self.mix_format, duration)?;

        let io = match self.endpoint.direction {
            Direction::Output => StreamIo::Render(client.render_service()?),
            Direction::Input => StreamIo::Capture(client.capture_service()?),
        };

        let frames = client.buffer_frame_count()?;
        if frames != self.buffer_frames {
            debug!(
                device = %self.endpoint.name,
                requested = self.buffer_frames,
                actual = frames,
                "Hardware adjusted buffer size"
            );
        }
        self.buffer_frames = frames;

        client.arm_wait_signal(signal)?;
        client.start_stream()?;
        Ok(io)
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice")
            .field("id", &self.endpoint.id)
            .field("name", &self.endpoint.name)
            .field("direction", &self.endpoint.direction)
            .field("mix_format", &self.mix_format)
            .field("buffer_frames", &self.buffer_frames)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

enum StreamIo {
    Render(Box<dyn RenderService>),
    Capture(Box<dyn CaptureService>),
}

/// State owned by the processing thread
struct Processor {
    context: StreamContext,
    format: MixFormat,
    client: SharedClient,
    io: StreamIo,
}

impl Processor {
    /// Hand one period of hardware memory to the callback
    ///
    /// Returns `Ok(false)` when the hardware had nothing to offer. The float
    /// check only fails for a stream that was started without `connect`
    /// having switched its format.
    fn process(&mut self, callback: &mut ProcessCallback) -> AudioResult<bool> {
        if !self.format.is_float32() {
            return Err(AudioError::SampleFormatMismatch(self.format.sample_format));
        }

        let channels = usize::from(self.context.channels);

        match &mut self.io {
            StreamIo::Render(render) => {
                let padding = lock(&self.client).current_padding()?;
                let available = self.context.buffer_frames.saturating_sub(padding);
                if available == 0 {
                    return Ok(false);
                }

                let Some(data) = render.acquire_buffer(available)? else {
                    return Ok(false);
                };

                {
                    // SAFETY: the backend leased `available` frames of `channels`
                    // f32 samples; the view is dropped before the lease is released.
                    let mut buffer = unsafe {
                        InterleavedBuffer::from_raw_parts(data, available as usize, channels)
                    };
                    callback(&self.context, &mut buffer);
                }

                render.release_buffer(available)?;
                Ok(true)
            }
            StreamIo::Capture(capture) => {
                if capture.next_packet_size()? == 0 {
                    return Ok(false);
                }

                let Some((data, frames)) = capture.acquire_buffer()? else {
                    return Ok(false);
                };

                {
                    // SAFETY: the backend leased `frames` frames of `channels`
                    // f32 samples; the view is dropped before the lease is released.
                    let mut buffer = unsafe {
                        InterleavedBuffer::from_raw_parts(data, frames as usize, channels)
                    };
                    callback(&self.context, &mut buffer);
                }

                capture.release_buffer(frames)?;
                Ok(true)
            }
        }
    }
}

fn validate_mix_format(format: &MixFormat) -> AudioResult<()> {
    if format.sample_format == SampleFormat::Unknown {
        return Err(AudioError::UnsupportedFormat(
            "mix format cannot supply float samples".to_string(),
        ));
    }
    if format.channels == 0 || usize::from(format.channels) > MAX_CHANNELS {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} channels (supported: 1..={MAX_CHANNELS})",
            format.channels
        )));
    }
    if format.sample_rate == 0 {
        return Err(AudioError::UnsupportedFormat(
            "sample rate is zero".to_string(),
        ));
    }
    Ok(())
}

fn check_sample_rate(sample_rate: u32) -> AudioResult<()> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        Ok(())
    } else {
        Err(AudioError::UnsupportedFormat(format!(
            "sample rate {sample_rate} outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE}"
        )))
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedEndpoint};

    fn render_processor(format: MixFormat) -> Processor {
        let backend =
            SimulatedBackend::new().with_endpoint(SimulatedEndpoint::output("spk", "Speakers"));
        let endpoint = Endpoint::new("spk", "Speakers", Direction::Output);
        let mut client = backend.activate(&endpoint).unwrap();
        client
            .initialize(&MixFormat::float32(48_000, 2), Duration::ZERO)
            .unwrap();
        let render = client.render_service().unwrap();

        Processor {
            context: StreamContext {
                id: endpoint.id.clone(),
                name: endpoint.name.clone(),
                direction: endpoint.direction,
                sample_rate: format.sample_rate,
                channels: format.channels,
                buffer_frames: client.buffer_frame_count().unwrap(),
            },
            format,
            client: Arc::new(Mutex::new(client)),
            io: StreamIo::Render(render),
        }
    }

    #[test]
    fn test_process_rejects_integer_format() {
        let mut format = MixFormat::float32(48_000, 2);
        format.sample_format = SampleFormat::Int16;
        format.bits_per_sample = 16;
        format.fixup();

        let mut processor = render_processor(format);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let mut callback: ProcessCallback = Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = processor.process(&mut callback);
        assert!(matches!(
            result,
            Err(AudioError::SampleFormatMismatch(SampleFormat::Int16))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_process_hands_float_buffer_to_callback() {
        let mut processor = render_processor(MixFormat::float32(48_000, 2));
        let mut callback: ProcessCallback = Box::new(|ctx, buffer| {
            assert_eq!(buffer.frames(), ctx.buffer_frames as usize);
            buffer.fill(0.5);
        });

        assert!(processor.process(&mut callback).unwrap());
    }

    #[test]
    fn test_check_sample_rate_bounds() {
        assert!(check_sample_rate(MIN_SAMPLE_RATE).is_ok());
        assert!(check_sample_rate(48_000).is_ok());
        assert!(check_sample_rate(MAX_SAMPLE_RATE).is_ok());
        assert!(check_sample_rate(0).is_err());
        assert!(check_sample_rate(MAX_SAMPLE_RATE + 1).is_err());
        assert!(check_sample_rate(100_000_000).is_err());
    }
}
