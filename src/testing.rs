//! In-memory platform doubles shared by the unit tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::platform::{BluetoothPlatform, Equalizer, MediaPlayer, PlatformError, PlatformResult};
use tokio::sync::watch;

use crate::types::{
    Address, ClassOfDevice, ConnectionPolicy, ConnectionStatus, Device, PlayerState, Profile,
    ScanMode,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetDeviceClass(ClassOfDevice),
    SetScanMode(ScanMode, Duration),
    Acquire(Profile),
    Release(Profile),
    Policy(Profile, Address, ConnectionPolicy),
    BondedDevices,
    StartDiscovery,
    CancelDiscovery,
    CreateBond(Address),
    SinkConnect(Address),
    UnregisterListener,
    TogglePlayPause,
    SkipNext,
    SkipPrevious,
    SeekTo(u64),
    ReleasePlayer,
    EqEnabled(bool),
    EqBandLevel(u16, i16),
    ReleaseEqualizer,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Default)]
pub struct FakePlatform {
    pub calls: CallLog,
    pub bonded: Mutex<Vec<Device>>,
    pub discovering: AtomicBool,
    /// What `sink_connect` answers
    pub connect_result: Mutex<Option<PlatformResult<bool>>>,
    /// When set, `sink_connect` notes the published status it sees
    pub published: Mutex<Option<watch::Receiver<PlayerState>>>,
    pub status_during_connect: Mutex<Vec<ConnectionStatus>>,
    pub fail_discovery_query: AtomicBool,
    pub hidden_api_missing: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_unregister: AtomicBool,
}

impl FakePlatform {
    pub fn with_log(calls: CallLog) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn hidden(&self, operation: &'static str) -> PlatformResult<()> {
        if self.hidden_api_missing.load(Ordering::SeqCst) {
            Err(PlatformError::Unsupported(operation))
        } else {
            Ok(())
        }
    }
}

impl BluetoothPlatform for FakePlatform {
    fn set_device_class(&self, class: ClassOfDevice) -> PlatformResult<()> {
        self.record(Call::SetDeviceClass(class));
        self.hidden("set_device_class")
    }

    fn set_scan_mode(&self, mode: ScanMode, duration: Duration) -> PlatformResult<()> {
        self.record(Call::SetScanMode(mode, duration));
        self.hidden("set_scan_mode")
    }

    fn acquire_profile_proxy(&self, profile: Profile) -> PlatformResult<()> {
        self.record(Call::Acquire(profile));
        Ok(())
    }

    fn release_profile_proxy(&self, profile: Profile) -> PlatformResult<()> {
        self.record(Call::Release(profile));
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(PlatformError::Io("proxy already closed".into()));
        }
        Ok(())
    }

    fn set_connection_policy(
        &self,
        profile: Profile,
        device: &Address,
        policy: ConnectionPolicy,
    ) -> PlatformResult<()> {
        self.record(Call::Policy(profile, *device, policy));
        Ok(())
    }

    fn bonded_devices(&self) -> PlatformResult<Vec<Device>> {
        self.record(Call::BondedDevices);
        Ok(self.bonded.lock().clone())
    }

    fn is_discovering(&self) -> PlatformResult<bool> {
        if self.fail_discovery_query.load(Ordering::SeqCst) {
            return Err(PlatformError::Timeout("is_discovering"));
        }
        Ok(self.discovering.load(Ordering::SeqCst))
    }

    fn start_discovery(&self) -> PlatformResult<()> {
        self.record(Call::StartDiscovery);
        self.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cancel_discovery(&self) -> PlatformResult<()> {
        self.record(Call::CancelDiscovery);
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn create_bond(&self, device: &Address) -> PlatformResult<()> {
        self.record(Call::CreateBond(*device));
        Ok(())
    }

    fn sink_connect(&self, device: &Address) -> PlatformResult<bool> {
        self.record(Call::SinkConnect(*device));
        if let Some(published) = self.published.lock().as_ref() {
            let status = published.borrow().connection_status;
            self.status_during_connect.lock().push(status);
        }
        self.hidden("sink_connect")?;
        self.connect_result.lock().clone().unwrap_or(Ok(true))
    }

    fn unregister_listener(&self) -> PlatformResult<()> {
        self.record(Call::UnregisterListener);
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(PlatformError::Disconnected);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlayer {
    pub calls: CallLog,
    position: AtomicU64,
    read_delay_ms: AtomicU64,
    pub equalizer: Mutex<Option<FakeEqualizer>>,
    pub fail_release: AtomicBool,
}

impl FakePlayer {
    pub fn with_log(calls: CallLog) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    pub fn with_equalizer(self, equalizer: FakeEqualizer) -> Self {
        *self.equalizer.lock() = Some(equalizer);
        self
    }

    pub fn set_position(&self, position_ms: u64) {
        self.position.store(position_ms, Ordering::SeqCst);
    }

    /// Make every position read block the calling thread
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl MediaPlayer for FakePlayer {
    fn toggle_play_pause(&self) -> PlatformResult<()> {
        self.record(Call::TogglePlayPause);
        Ok(())
    }

    fn skip_next(&self) -> PlatformResult<()> {
        self.record(Call::SkipNext);
        Ok(())
    }

    fn skip_previous(&self) -> PlatformResult<()> {
        self.record(Call::SkipPrevious);
        Ok(())
    }

    fn seek_to(&self, position_ms: u64) -> PlatformResult<()> {
        self.record(Call::SeekTo(position_ms));
        Ok(())
    }

    fn current_position(&self) -> PlatformResult<u64> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(self.position.load(Ordering::SeqCst))
    }

    fn open_equalizer(&self) -> PlatformResult<Box<dyn Equalizer>> {
        match self.equalizer.lock().take() {
            Some(eq) => Ok(Box::new(eq)),
            None => Err(PlatformError::Unsupported("equalizer")),
        }
    }

    fn release(&self) -> PlatformResult<()> {
        self.record(Call::ReleasePlayer);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(PlatformError::Io("session already released".into()));
        }
        Ok(())
    }
}

pub struct FakeEqualizer {
    pub calls: CallLog,
    pub levels: Vec<i16>,
    pub range: (i16, i16),
    pub enabled: bool,
}

impl FakeEqualizer {
    /// Five bands at the usual 60Hz..14kHz centers
    pub fn five_band(calls: CallLog) -> Self {
        Self {
            calls,
            levels: vec![300, 0, 0, 0, 300],
            range: (-1500, 1500),
            enabled: false,
        }
    }
}

const CENTERS_MHZ: [u32; 5] = [60_000, 230_000, 910_000, 3_600_000, 14_000_000];

impl Equalizer for FakeEqualizer {
    fn is_enabled(&self) -> PlatformResult<bool> {
        Ok(self.enabled)
    }

    fn band_count(&self) -> PlatformResult<u16> {
        Ok(self.levels.len() as u16)
    }

    fn band_level(&self, band: u16) -> PlatformResult<i16> {
        self.levels
            .get(band as usize)
            .copied()
            .ok_or_else(|| PlatformError::Protocol(format!("no band {}", band)))
    }

    fn center_freq(&self, band: u16) -> PlatformResult<u32> {
        Ok(CENTERS_MHZ.get(band as usize).copied().unwrap_or(0))
    }

    fn level_range(&self) -> PlatformResult<(i16, i16)> {
        Ok(self.range)
    }

    fn set_enabled(&self, enabled: bool) -> PlatformResult<()> {
        self.calls.lock().push(Call::EqEnabled(enabled));
        Ok(())
    }

    fn set_band_level(&self, band: u16, level: i16) -> PlatformResult<()> {
        self.calls.lock().push(Call::EqBandLevel(band, level));
        Ok(())
    }

    fn release(&self) -> PlatformResult<()> {
        self.calls.lock().push(Call::ReleaseEqualizer);
        Ok(())
    }
}
