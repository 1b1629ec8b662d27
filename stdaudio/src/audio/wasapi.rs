//! WASAPI backend (Windows)
//!
//! Shared-mode, event-driven streams over the MMDevice API. COM is
//! initialised multithreaded on every thread that touches it; MMDevice and
//! audio client objects are free-threaded in the MTA, which is what the
//! `Send`/`Sync` impls below rely on.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};
use windows::core::{implement, GUID, HRESULT, PCWSTR, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::{
    PKEY_DeviceInterface_FriendlyName, PKEY_Device_DeviceDesc, PKEY_Device_FriendlyName,
};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::{
    eCapture, eCommunications, eConsole, eMultimedia, eRender, EDataFlow, ERole,
    IAudioCaptureClient, IAudioClient, IAudioRenderClient, IMMDevice, IMMDeviceEnumerator,
    IMMNotificationClient, IMMNotificationClient_Impl, MMDeviceEnumerator,
    AUDCLNT_SHAREMODE_SHARED, AUDCLNT_STREAMFLAGS_EVENTCALLBACK, AUDCLNT_STREAMFLAGS_RATEADJUST,
    DEVICE_STATE, DEVICE_STATE_ACTIVE, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
    WAVEFORMATEXTENSIBLE_0,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{
    CreateEventW, GetCurrentThread, SetEvent, SetThreadPriority, WaitForSingleObject,
    THREAD_PRIORITY_TIME_CRITICAL,
};
use windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY;

use crate::audio::backend::{
    AudioBackend, AudioClient, CaptureService, NotificationHandler, RenderService,
    SubscriptionId, WaitSignal,
};
use crate::audio::error::{AudioError, AudioResult};
use crate::audio::types::{
    DeviceNotification, DeviceRole, Direction, Endpoint, MixFormat, SampleFormat,
};

const BACKEND_NAME: &str = "WASAPI";

/// RPC_E_CHANGED_MODE: COM already initialised with another threading model
const RPC_E_CHANGED_MODE: HRESULT = HRESULT(0x8001_0106_u32 as i32);

/// REFERENCE_TIME units per second (100 ns)
const REFTIMES_PER_SEC: u128 = 10_000_000;

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Size of the WAVEFORMATEXTENSIBLE tail after WAVEFORMATEX
const EXTENSIBLE_EXTRA_BYTES: u16 = 22;

/// KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
const SUBTYPE_IEEE_FLOAT: GUID = GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// KSDATAFORMAT_SUBTYPE_PCM
const SUBTYPE_PCM: GUID = GUID::from_u128(0x00000001_0000_0010_8000_00aa00389b71);

struct ComGuard {
    owned: bool,
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: balances the successful CoInitializeEx on this thread
            unsafe { CoUninitialize() };
        }
    }
}

thread_local! {
    static COM: std::cell::RefCell<Option<ComGuard>> = const { std::cell::RefCell::new(None) };
}

/// Initialise COM (MTA) on the calling thread once
fn ensure_com() -> AudioResult<()> {
    COM.with(|slot| {
        if slot.borrow().is_some() {
            return Ok(());
        }

        // SAFETY: plain COM initialisation; balanced by ComGuard on thread exit
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        let owned = if hr.is_ok() {
            true
        } else if hr == RPC_E_CHANGED_MODE {
            false
        } else {
            return Err(AudioError::backend(
                BACKEND_NAME,
                format!("COM initialization failed: HRESULT 0x{:08X}", hr.0 as u32),
            ));
        };

        *slot.borrow_mut() = Some(ComGuard { owned });
        Ok(())
    })
}

fn backend_error(context: &str, e: windows::core::Error) -> AudioError {
    AudioError::backend(BACKEND_NAME, format!("{context}: {e}"))
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Input => eCapture,
        Direction::Output => eRender,
    }
}

/// WASAPI implementation of [`AudioBackend`]
pub struct WasapiBackend {
    enumerator: IMMDeviceEnumerator,
    subscriptions: Mutex<HashMap<SubscriptionId, IMMNotificationClient>>,
    next_subscription: AtomicU64,
}

// SAFETY: the enumerator lives in the MTA and is free-threaded
unsafe impl Send for WasapiBackend {}
unsafe impl Sync for WasapiBackend {}

impl WasapiBackend {
    /// Initialise COM and obtain the device enumerator
    ///
    /// # Errors
    /// `AudioError::EnumeratorUnavailable` if the enumerator cannot be created.
    pub fn new() -> AudioResult<Self> {
        ensure_com()?;

        // SAFETY: COM is initialised on this thread
        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(|e| AudioError::EnumeratorUnavailable(e.to_string()))?;

        debug!("WASAPI device enumerator created");
        Ok(Self {
            enumerator,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn describe(&self, device: &IMMDevice, direction: Direction) -> AudioResult<Endpoint> {
        // SAFETY: GetId hands us a CoTaskMem string that we free below
        let id = unsafe {
            let raw: PWSTR = device.GetId().map_err(|e| backend_error("GetId", e))?;
            let id = raw.to_string().unwrap_or_default();
            CoTaskMemFree(Some(raw.0 as *const c_void));
            id
        };

        Ok(Endpoint::new(id, friendly_name(device), direction))
    }
}

/// Friendly name, then interface name, then description; empty if none
fn friendly_name(device: &IMMDevice) -> String {
    // SAFETY: property store reads on a valid device
    let Ok(store) = (unsafe { device.OpenPropertyStore(STGM_READ) }) else {
        return String::new();
    };

    let keys: [&PROPERTYKEY; 3] = [
        &PKEY_Device_FriendlyName,
        &PKEY_DeviceInterface_FriendlyName,
        &PKEY_Device_DeviceDesc,
    ];

    keys.into_iter()
        .filter_map(|key| unsafe { store.GetValue(key) }.ok())
        .map(|value| value.to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_default()
}

impl AudioBackend for WasapiBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn enumerate_endpoints(&self, direction: Direction) -> AudioResult<Vec<Endpoint>> {
        ensure_com()?;

        // SAFETY: enumerator is valid; collection items are owned interfaces
        let collection = unsafe {
            self.enumerator
                .EnumAudioEndpoints(data_flow(direction), DEVICE_STATE_ACTIVE)
        }
        .map_err(|e| AudioError::EnumeratorUnavailable(e.to_string()))?;

        let count = unsafe { collection.GetCount() }
            .map_err(|e| AudioError::EnumeratorUnavailable(e.to_string()))?;

        let mut endpoints = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = match unsafe { collection.Item(index) } {
                Ok(device) => device,
                Err(e) => {
                    warn!(index, error = %e, "Skipping unreadable endpoint");
                    continue;
                }
            };
            match self.describe(&device, direction) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!(index, error = %e, "Skipping unreadable endpoint"),
            }
        }
        Ok(endpoints)
    }

    fn default_endpoint(&self, direction: Direction) -> AudioResult<Option<Endpoint>> {
        ensure_com()?;

        // SAFETY: enumerator is valid
        match unsafe {
            self.enumerator
                .GetDefaultAudioEndpoint(data_flow(direction), eConsole)
        } {
            Ok(device) => self.describe(&device, direction).map(Some),
            Err(e) => {
                debug!(%direction, error = %e, "No default endpoint");
                Ok(None)
            }
        }
    }

    fn activate(&self, endpoint: &Endpoint) -> AudioResult<Box<dyn AudioClient>> {
        ensure_com()?;

        let activation_error = |e: windows::core::Error| AudioError::ActivationFailed {
            endpoint: endpoint.id.clone(),
            reason: e.to_string(),
        };

        let wide: Vec<u16> = endpoint.id.encode_utf16().chain(Some(0)).collect();
        // SAFETY: `wide` is NUL-terminated and outlives the call
        let device = unsafe { self.enumerator.GetDevice(PCWSTR(wide.as_ptr())) }
            .map_err(activation_error)?;
        let client: IAudioClient =
            unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(activation_error)?;

        Ok(Box::new(WasapiClient {
            device,
            client,
            channel_mask: 0,
            initialized: false,
        }))
    }

    fn subscribe(&self, handler: NotificationHandler) -> AudioResult<SubscriptionId> {
        ensure_com()?;

        let client: IMMNotificationClient = NotificationClient { handler }.into();
        // SAFETY: the enumerator keeps a reference until we unregister
        unsafe { self.enumerator.RegisterEndpointNotificationCallback(&client) }
            .map_err(|e| AudioError::SubscriptionFailed(e.to_string()))?;

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscriptions).insert(id, client);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let Some(client) = lock(&self.subscriptions).remove(&id) else {
            return;
        };
        if ensure_com().is_err() {
            return;
        }

        // SAFETY: `client` was registered with this enumerator
        if let Err(e) = unsafe { self.enumerator.UnregisterEndpointNotificationCallback(&client) } {
            warn!(error = %e, "Failed to unregister endpoint notifications");
        }
    }
}

/// Forwards endpoint notifications to one handler
#[implement(IMMNotificationClient)]
struct NotificationClient {
    handler: NotificationHandler,
}

fn wide_to_string(value: &PCWSTR) -> Option<String> {
    if value.is_null() {
        return None;
    }
    // SAFETY: the notification source passes a valid NUL-terminated string
    unsafe { value.to_string() }.ok()
}

impl IMMNotificationClient_Impl for NotificationClient_Impl {
    fn OnDeviceStateChanged(&self, device_id: &PCWSTR, new_state: DEVICE_STATE) -> windows::core::Result<()> {
        (self.handler)(&DeviceNotification::DeviceStateChanged {
            id: wide_to_string(device_id).unwrap_or_default(),
            state: new_state.0,
        });
        Ok(())
    }

    fn OnDeviceAdded(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        (self.handler)(&DeviceNotification::DeviceAdded {
            id: wide_to_string(device_id).unwrap_or_default(),
        });
        Ok(())
    }

    fn OnDeviceRemoved(&self, device_id: &PCWSTR) -> windows::core::Result<()> {
        (self.handler)(&DeviceNotification::DeviceRemoved {
            id: wide_to_string(device_id).unwrap_or_default(),
        });
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        device_id: &PCWSTR,
    ) -> windows::core::Result<()> {
        let direction = match flow {
            f if f == eRender => Direction::Output,
            f if f == eCapture => Direction::Input,
            _ => return Ok(()),
        };
        let role = match role {
            r if r == eConsole => DeviceRole::Console,
            r if r == eMultimedia => DeviceRole::Multimedia,
            r if r == eCommunications => DeviceRole::Communications,
            _ => return Ok(()),
        };

        (self.handler)(&DeviceNotification::DefaultDeviceChanged {
            direction,
            role,
            id: wide_to_string(device_id),
        });
        Ok(())
    }

    fn OnPropertyValueChanged(&self, device_id: &PCWSTR, _key: &PROPERTYKEY) -> windows::core::Result<()> {
        (self.handler)(&DeviceNotification::PropertyValueChanged {
            id: wide_to_string(device_id).unwrap_or_default(),
        });
        Ok(())
    }
}

struct WasapiClient {
    device: IMMDevice,
    client: IAudioClient,
    channel_mask: u32,
    /// An IAudioClient accepts one Initialize call, successful or not
    initialized: bool,
}

impl WasapiClient {
    /// Replace the audio client with a freshly activated one
    fn reactivate(&mut self) -> AudioResult<()> {
        ensure_com()?;
        self.client = unsafe { self.device.Activate(CLSCTX_ALL, None) }
            .map_err(|e| backend_error("Activate", e))?;
        self.initialized = false;
        debug!("Audio client reactivated");
        Ok(())
    }
}

// SAFETY: IAudioClient is free-threaded in the MTA
unsafe impl Send for WasapiClient {}

impl AudioClient for WasapiClient {
    fn mix_format(&mut self) -> AudioResult<MixFormat> {
        ensure_com()?;

        // SAFETY: GetMixFormat returns a CoTaskMem WAVEFORMATEX(-TENSIBLE)
        // that we read unaligned and free before returning.
        unsafe {
            let raw = self
                .client
                .GetMixFormat()
                .map_err(|e| backend_error("GetMixFormat", e))?;
            if raw.is_null() {
                return Err(AudioError::UnsupportedFormat("mix format is null".to_string()));
            }

            let base = ptr::read_unaligned(raw);
            let mut sample_format = match base.wFormatTag {
                WAVE_FORMAT_IEEE_FLOAT if base.wBitsPerSample == 32 => SampleFormat::Float32,
                WAVE_FORMAT_PCM => pcm_format(base.wBitsPerSample),
                _ => SampleFormat::Unknown,
            };
            let mut valid_bits = base.wBitsPerSample;

            if base.wFormatTag == WAVE_FORMAT_EXTENSIBLE && base.cbSize >= EXTENSIBLE_EXTRA_BYTES {
                let ext = ptr::read_unaligned(raw as *const WAVEFORMATEXTENSIBLE);
                valid_bits = ext.Samples.wValidBitsPerSample;
                self.channel_mask = ext.dwChannelMask;
                let sub_format = ext.SubFormat;
                sample_format = if sub_format == SUBTYPE_IEEE_FLOAT && base.wBitsPerSample == 32 {
                    SampleFormat::Float32
                } else if sub_format == SUBTYPE_PCM {
                    pcm_format(base.wBitsPerSample)
                } else {
                    SampleFormat::Unknown
                };
            }

            CoTaskMemFree(Some(raw as *const c_void));

            Ok(MixFormat {
                sample_rate: base.nSamplesPerSec,
                channels: base.nChannels,
                bits_per_sample: base.wBitsPerSample,
                valid_bits_per_sample: valid_bits,
                sample_format,
                block_align: base.nBlockAlign,
                avg_bytes_per_sec: base.nAvgBytesPerSec,
            })
        }
    }

    fn initialize(&mut self, format: &MixFormat, buffer_duration: Duration) -> AudioResult<()> {
        ensure_com()?;
        if self.initialized {
            self.reactivate()?;
        }

        let wave = WAVEFORMATEXTENSIBLE {
            Format: WAVEFORMATEX {
                wFormatTag: WAVE_FORMAT_EXTENSIBLE,
                nChannels: format.channels,
                nSamplesPerSec: format.sample_rate,
                nAvgBytesPerSec: format.avg_bytes_per_sec,
                nBlockAlign: format.block_align,
                wBitsPerSample: format.bits_per_sample,
                cbSize: EXTENSIBLE_EXTRA_BYTES,
            },
            Samples: WAVEFORMATEXTENSIBLE_0 {
                wValidBitsPerSample: format.valid_bits_per_sample,
            },
            dwChannelMask: self.channel_mask,
            SubFormat: if format.is_float32() {
                SUBTYPE_IEEE_FLOAT
            } else {
                SUBTYPE_PCM
            },
        };

        let hns = (buffer_duration.as_nanos() * REFTIMES_PER_SEC / 1_000_000_000) as i64;

        self.initialized = true;

        // SAFETY: `wave` outlives the call
        unsafe {
            self.client.Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_EVENTCALLBACK | AUDCLNT_STREAMFLAGS_RATEADJUST,
                hns,
                0,
                &wave.Format,
                None,
            )
        }
        .map_err(|e| AudioError::StreamInitFailed(e.to_string()))
    }

    fn buffer_frame_count(&mut self) -> AudioResult<u32> {
        unsafe { self.client.GetBufferSize() }
            .map_err(|e| AudioError::BufferSizeFailed(e.to_string()))
    }

    fn current_padding(&mut self) -> AudioResult<u32> {
        unsafe { self.client.GetCurrentPadding() }
            .map_err(|e| backend_error("GetCurrentPadding", e))
    }

    fn render_service(&mut self) -> AudioResult<Box<dyn RenderService>> {
        let render: IAudioRenderClient = unsafe { self.client.GetService() }
            .map_err(|_| AudioError::ServiceUnavailable(Direction::Output))?;
        Ok(Box::new(WasapiRender { render }))
    }

    fn capture_service(&mut self) -> AudioResult<Box<dyn CaptureService>> {
        let capture: IAudioCaptureClient = unsafe { self.client.GetService() }
            .map_err(|_| AudioError::ServiceUnavailable(Direction::Input))?;
        Ok(Box::new(WasapiCapture { capture }))
    }

    fn create_wait_signal(&mut self) -> AudioResult<Arc<dyn WaitSignal>> {
        // SAFETY: unnamed auto-reset event, closed when the signal drops
        let handle = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(|e| AudioError::WaitSignalFailed(e.to_string()))?;
        Ok(Arc::new(EventSignal {
            handle,
            closed: AtomicBool::new(false),
        }))
    }

    fn arm_wait_signal(&mut self, signal: &Arc<dyn WaitSignal>) -> AudioResult<()> {
        let handle = signal
            .raw_handle()
            .ok_or_else(|| AudioError::WaitSignalFailed("signal has no event handle".to_string()))?;
        unsafe { self.client.SetEventHandle(HANDLE(handle)) }
            .map_err(|e| AudioError::WaitSignalFailed(e.to_string()))
    }

    fn start_stream(&mut self) -> AudioResult<()> {
        unsafe { self.client.Start() }.map_err(|e| AudioError::StreamStartFailed(e.to_string()))
    }

    fn stop_stream(&mut self) -> AudioResult<()> {
        unsafe { self.client.Stop() }.map_err(|e| backend_error("Stop", e))
    }

    fn reset(&mut self) -> AudioResult<()> {
        if self.initialized {
            self.reactivate()?;
        }
        Ok(())
    }

    fn promote_current_thread(&self) -> bool {
        if let Err(e) = ensure_com() {
            warn!(error = %e, "COM unavailable on processing thread");
        }
        // SAFETY: adjusts the calling thread only
        unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) }.is_ok()
    }
}

fn pcm_format(bits: u16) -> SampleFormat {
    match bits {
        16 => SampleFormat::Int16,
        24 => SampleFormat::Int24,
        32 => SampleFormat::Int32,
        _ => SampleFormat::Unknown,
    }
}

struct WasapiRender {
    render: IAudioRenderClient,
}

// SAFETY: render client is free-threaded in the MTA
unsafe impl Send for WasapiRender {}

impl RenderService for WasapiRender {
    fn acquire_buffer(&mut self, frames: u32) -> AudioResult<Option<NonNull<f32>>> {
        let data = unsafe { self.render.GetBuffer(frames) }
            .map_err(|e| backend_error("GetBuffer", e))?;
        Ok(NonNull::new(data.cast::<f32>()))
    }

    fn release_buffer(&mut self, frames: u32) -> AudioResult<()> {
        unsafe { self.render.ReleaseBuffer(frames, 0) }
            .map_err(|e| backend_error("ReleaseBuffer", e))
    }
}

struct WasapiCapture {
    capture: IAudioCaptureClient,
}

// SAFETY: capture client is free-threaded in the MTA
unsafe impl Send for WasapiCapture {}

impl CaptureService for WasapiCapture {
    fn next_packet_size(&mut self) -> AudioResult<u32> {
        unsafe { self.capture.GetNextPacketSize() }
            .map_err(|e| backend_error("GetNextPacketSize", e))
    }

    fn acquire_buffer(&mut self) -> AudioResult<Option<(NonNull<f32>, u32)>> {
        let mut data: *mut u8 = ptr::null_mut();
        let mut frames = 0u32;
        let mut flags = 0u32;

        // SAFETY: out-pointers are valid locals
        unsafe {
            self.capture
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
        }
        .map_err(|e| backend_error("GetBuffer", e))?;

        Ok(NonNull::new(data.cast::<f32>()).map(|data| (data, frames)))
    }

    fn release_buffer(&mut self, frames: u32) -> AudioResult<()> {
        unsafe { self.capture.ReleaseBuffer(frames) }
            .map_err(|e| backend_error("ReleaseBuffer", e))
    }
}

/// Auto-reset Win32 event
struct EventSignal {
    handle: HANDLE,
    closed: AtomicBool,
}

// SAFETY: event handles may be waited on and set from any thread
unsafe impl Send for EventSignal {}
unsafe impl Sync for EventSignal {}

impl WaitSignal for EventSignal {
    fn wait(&self, timeout: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let fired = unsafe { WaitForSingleObject(self.handle, millis) } == WAIT_OBJECT_0;
        fired && !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wake any waiter; the handle itself is closed on drop
            let _ = unsafe { SetEvent(self.handle) };
        }
    }

    fn raw_handle(&self) -> Option<*mut c_void> {
        Some(self.handle.0)
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.handle) } {
            warn!(error = %e, "Failed to close event handle");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
