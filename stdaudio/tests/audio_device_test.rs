/// Integration tests for the audio device lifecycle
///
/// Everything runs against `SimulatedBackend`, so no audio hardware is needed.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stdaudio::audio::{
    AudioDevice, AudioError, DeviceRegistry, DeviceState, MixFormat, SampleFormat,
    SimulatedBackend, SimulatedEndpoint, SimulatedStats,
};
use stdaudio::config::{AudioConfig, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};

fn registry_with(endpoints: Vec<SimulatedEndpoint>) -> (Arc<SimulatedBackend>, DeviceRegistry) {
    let backend = endpoints
        .into_iter()
        .fold(SimulatedBackend::new(), SimulatedBackend::with_endpoint);
    let backend = Arc::new(backend);
    let registry = DeviceRegistry::new(backend.clone());
    (backend, registry)
}

fn only_output(registry: &DeviceRegistry) -> AudioDevice {
    registry
        .list_output_devices()
        .unwrap()
        .into_iter()
        .next()
        .expect("one output device")
}

fn only_input(registry: &DeviceRegistry) -> AudioDevice {
    registry
        .list_input_devices()
        .unwrap()
        .into_iter()
        .next()
        .expect("one input device")
}

/// Poll until `condition` holds or two seconds pass
fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_device_properties() {
    let (_backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .with_format(MixFormat::float32(44_100, 2))]);
    let device = only_output(&registry);

    assert_eq!(device.id(), "spk");
    assert_eq!(device.name(), "Speakers");
    assert!(device.is_output());
    assert!(!device.is_input());
    assert_eq!(device.channels(), 2);
    assert_eq!(device.output_channels(), 2);
    assert_eq!(device.input_channels(), 0);
    assert_eq!(device.sample_rate(), 44_100);
    assert_eq!(device.state(), DeviceState::Configured);
    assert!(!device.is_running());
    assert!(!device.has_unprocessed_io());
}

#[test]
fn test_start_twice_spawns_one_thread() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let stats = backend.stats();
    let mut device = only_output(&registry);
    device.connect(|_, buffer| buffer.fill(0.0)).unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    device
        .start_with(move |_| { counter.fetch_add(1, Ordering::SeqCst); }, |_| {})
        .unwrap();
    let counter = started.clone();
    device
        .start_with(move |_| { counter.fetch_add(1, Ordering::SeqCst); }, |_| {})
        .unwrap();

    assert!(device.is_running());
    assert_eq!(device.state(), DeviceState::Running);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(SimulatedStats::get(&stats.stream_starts), 1);
    assert_eq!(SimulatedStats::get(&stats.signals_created), 1);

    // Each processing thread requests a priority boost exactly once
    assert!(wait_for(|| SimulatedStats::get(&stats.priority_requests) == 1));

    device.stop();
    assert_eq!(SimulatedStats::get(&stats.priority_requests), 1);
}

#[test]
fn test_stop_never_started_returns_immediately() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let mut device = only_output(&registry);

    let begin = Instant::now();
    device.stop();
    device.stop();

    assert!(begin.elapsed() < Duration::from_millis(100));
    assert!(!device.is_running());
    assert_eq!(device.state(), DeviceState::Configured);
    assert_eq!(SimulatedStats::get(&backend.stats().stream_stops), 0);
}

#[test]
fn test_buffer_size_adopts_hardware_value() {
    let (_backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .with_granularity(128)]);
    let mut device = only_output(&registry);

    device.set_buffer_size_frames(300).unwrap();
    assert_eq!(device.buffer_size_frames(), 300);

    device.start().unwrap();
    assert_eq!(device.buffer_size_frames(), 384);
    device.stop();
    assert_eq!(device.buffer_size_frames(), 384);
}

#[test]
fn test_connect_before_and_after_start() {
    let (_backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let mut device = only_output(&registry);

    assert!(device.connect(|_, _| {}).is_ok());
    device.start().unwrap();

    let err = device.connect(|_, _| {}).unwrap_err();
    assert!(matches!(err, AudioError::DeviceRunning(_)));
    assert!(err.is_misuse());

    assert!(matches!(
        device.set_sample_rate(96_000),
        Err(AudioError::DeviceRunning(_))
    ));
    assert!(matches!(
        device.set_buffer_size_frames(64),
        Err(AudioError::DeviceRunning(_))
    ));

    device.stop();
    assert!(device.connect(|_, _| {}).is_ok());
}

#[test]
fn test_connect_switches_format_to_float() {
    let mut int_format = MixFormat::float32(48_000, 2);
    int_format.sample_format = SampleFormat::Int16;
    int_format.bits_per_sample = 16;
    int_format.valid_bits_per_sample = 16;
    int_format.fixup();

    let (_backend, registry) =
        registry_with(vec![SimulatedEndpoint::output("spk", "Speakers").with_format(int_format)]);
    let mut device = only_output(&registry);
    assert!(!device.mix_format().is_float32());

    device.connect(|_, _| {}).unwrap();
    assert!(device.mix_format().is_float32());
    assert_eq!(device.mix_format().block_align, 8);
}

#[test]
fn test_render_callback_fills_hardware_buffer() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .with_padding(160)]);
    let stats = backend.stats();
    let mut device = only_output(&registry);
    device.set_buffer_size_frames(480).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    device
        .connect(move |ctx, buffer| {
            sink.lock().unwrap().push((buffer.frames(), buffer.channels(), ctx.buffer_frames));
            for frame in 0..buffer.frames() {
                for channel in 0..buffer.channels() {
                    *buffer.at_mut(frame, channel) = channel as f32 + 1.0;
                }
            }
        })
        .unwrap();

    device.start().unwrap();
    assert!(device.has_unprocessed_io());
    assert!(wait_for(|| SimulatedStats::get(&stats.render_periods) >= 2));
    device.stop();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    // Available space is the hardware buffer minus the queued padding
    assert!(seen.iter().all(|&(frames, channels, total)| {
        frames == 320 && channels == 2 && total == 480
    }));

    let rendered = backend.last_rendered();
    assert_eq!(rendered.len(), 320 * 2);
    assert!(rendered.chunks(2).all(|frame| frame == [1.0, 2.0]));
    assert_eq!(SimulatedStats::get(&stats.overlapping_leases), 0);
}

#[test]
fn test_render_skips_when_buffer_full() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .with_padding(u32::MAX)]);
    let stats = backend.stats();
    let mut device = only_output(&registry);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    device
        .connect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    device.start().unwrap();
    assert!(!device.has_unprocessed_io());
    std::thread::sleep(Duration::from_millis(50));
    device.stop();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(SimulatedStats::get(&stats.render_periods), 0);
}

#[test]
fn test_capture_callback_receives_packets() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::input("mic", "Microphone")
        .with_format(MixFormat::float32(16_000, 1))
        .with_capture_value(0.25)]);
    let stats = backend.stats();
    let mut device = only_input(&registry);
    device.set_buffer_size_frames(160).unwrap();

    let total = Arc::new(Mutex::new((0usize, 0.0f32)));
    let sink = total.clone();
    device
        .connect(move |ctx, buffer| {
            assert_eq!(ctx.channels, 1);
            let mut total = sink.lock().unwrap();
            total.0 += buffer.frames();
            total.1 = buffer.as_slice().iter().copied().fold(0.0, f32::max);
        })
        .unwrap();

    device.start().unwrap();
    assert!(wait_for(|| SimulatedStats::get(&stats.capture_periods) >= 3));
    device.stop();

    let (frames, peak) = *total.lock().unwrap();
    assert!(frames >= 3 * 160);
    assert_eq!(frames % 160, 0);
    assert_eq!(peak, 0.25);
}

#[test]
fn test_restart_keeps_callback() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let stats = backend.stats();
    let mut device = only_output(&registry);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    device
        .connect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    device.start().unwrap();
    assert!(wait_for(|| calls.load(Ordering::SeqCst) > 0));
    device.stop();

    let before = calls.load(Ordering::SeqCst);
    device.start().unwrap();
    assert!(wait_for(|| calls.load(Ordering::SeqCst) > before));
    device.stop();

    assert_eq!(SimulatedStats::get(&stats.stream_starts), 2);
    assert_eq!(SimulatedStats::get(&stats.stream_stops), 2);
    assert_eq!(SimulatedStats::get(&stats.signals_closed), 2);

    // Each start initialises a stream the previous stop discarded
    assert_eq!(SimulatedStats::get(&stats.initializations), 2);
    assert_eq!(SimulatedStats::get(&stats.resets), 2);
    assert_eq!(SimulatedStats::get(&stats.activations), 1);
}

#[test]
fn test_retry_after_unaligned_buffer_size() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .with_granularity(128)
        .with_strict_alignment()]);
    let stats = backend.stats();
    let mut device = only_output(&registry);
    device.connect(|_, _| {}).unwrap();

    device.set_buffer_size_frames(300).unwrap();
    let err = device.start().unwrap_err();
    assert!(matches!(err, AudioError::StreamInitFailed(_)));
    assert!(err.is_recoverable());
    assert_eq!(SimulatedStats::get(&stats.resets), 1);

    device.set_buffer_size_frames(384).unwrap();
    device.start().unwrap();
    assert!(device.is_running());
    assert_eq!(device.buffer_size_frames(), 384);
    device.stop();
}

#[test]
fn test_start_and_stop_hooks() {
    let (_backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let mut device = only_output(&registry);
    device.connect(|_, _| {}).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let on_start = events.clone();
    let on_stop = events.clone();

    device
        .start_with(
            move |ctx| on_start.lock().unwrap().push(format!("start {}", ctx.id)),
            move |ctx| on_stop.lock().unwrap().push(format!("stop {}", ctx.id)),
        )
        .unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["start spk".to_string()]);

    device.stop();
    device.stop();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["start spk".to_string(), "stop spk".to_string()]
    );
}

#[test]
fn test_failed_start_leaves_device_stopped() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")
        .failing_initialize()]);
    let stats = backend.stats();
    let mut device = only_output(&registry);
    device.connect(|_, _| {}).unwrap();

    let err = device.start().unwrap_err();
    assert!(matches!(err, AudioError::StreamInitFailed(_)));
    assert!(err.is_recoverable());
    assert!(!device.is_running());
    assert_eq!(device.state(), DeviceState::Configured);

    // The signal created before the failing step is released
    assert_eq!(SimulatedStats::get(&stats.signals_created), 1);
    assert_eq!(SimulatedStats::get(&stats.signals_closed), 1);
    assert_eq!(SimulatedStats::get(&stats.stream_starts), 0);
    assert_eq!(SimulatedStats::get(&stats.resets), 1);
}

#[test]
fn test_drop_stops_running_device() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let stats = backend.stats();

    {
        let mut device = only_output(&registry);
        device.connect(|_, _| {}).unwrap();
        device.start().unwrap();
    }

    assert_eq!(SimulatedStats::get(&stats.stream_stops), 1);
    assert_eq!(SimulatedStats::get(&stats.signals_closed), 1);
}

#[test]
fn test_device_can_move_between_threads() {
    let (backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let mut device = only_output(&registry);
    device.connect(|_, _| {}).unwrap();
    device.start().unwrap();

    let handle = std::thread::spawn(move || {
        assert!(device.is_running());
        device.stop();
        device.is_running()
    });

    assert!(!handle.join().unwrap());
    assert_eq!(SimulatedStats::get(&backend.stats().stream_stops), 1);
}

#[test]
fn test_sample_rate_override_from_config() {
    let backend = Arc::new(SimulatedBackend::new().with_endpoint(SimulatedEndpoint::output("spk", "Speakers")));
    let config = AudioConfig {
        sample_rate: Some(96_000),
        buffer_size_frames: 256,
        ..AudioConfig::default()
    };
    let registry = DeviceRegistry::with_config(backend, config);
    let mut device = only_output(&registry);

    assert_eq!(device.sample_rate(), 96_000);
    assert_eq!(device.buffer_size_frames(), 256);
    assert_eq!(device.mix_format().avg_bytes_per_sec, 96_000 * 2 * 4);

    device.set_sample_rate(44_100).unwrap();
    assert_eq!(device.sample_rate(), 44_100);
    assert!(matches!(
        device.set_sample_rate(0),
        Err(AudioError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_set_sample_rate_rejects_out_of_range() {
    let (_backend, registry) = registry_with(vec![SimulatedEndpoint::output("spk", "Speakers")]);
    let mut device = only_output(&registry);

    for rate in [100_000_000, MAX_SAMPLE_RATE + 1, MIN_SAMPLE_RATE - 1] {
        assert!(
            matches!(device.set_sample_rate(rate), Err(AudioError::UnsupportedFormat(_))),
            "rate {rate} accepted"
        );
    }
    assert_eq!(device.sample_rate(), 48_000);
    assert_eq!(device.mix_format().avg_bytes_per_sec, 48_000 * 2 * 4);

    device.set_sample_rate(MAX_SAMPLE_RATE).unwrap();
    assert_eq!(device.sample_rate(), MAX_SAMPLE_RATE);
}
