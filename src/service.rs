use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::format::{format_frequency, format_time};
use crate::platform::{BluetoothPlatform, Equalizer, MediaPlayer, PlatformError, PlatformResult};
use crate::poller::PositionPoller;
use crate::state::{Effect, Event, SinkState};
use crate::types::{
    Address, BandLevel, ClassOfDevice, ConnectionPolicy, Device, PlayerState, Profile, ScanMode,
};

/// Everything the service loop consumes, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Event(Event),
    Tick { generation: u64, position_ms: u64 },
    Command(Command),
    Shutdown,
}

/// Control surface commands
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    TogglePlayPause,
    SkipNext,
    SkipPrevious,
    SeekTo { position_ms: u64 },
    Connect { address: Address },
    CreateBond { address: Address },
    /// Connect when bonded, pair otherwise
    SelectDevice { address: Address },
    StartDiscovery,
    CancelDiscovery,
    RefreshPairedDevices,
    SetEqEnabled { enabled: bool },
    SetBandLevel { band: u16, level: i16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOptions {
    pub discoverable_for: Duration,
    pub position_interval: Duration,
    pub disable_pan: bool,
    pub discovery: bool,
}

impl ServiceOptions {
    fn profiles(&self) -> Vec<Profile> {
        let mut profiles = vec![Profile::A2dpSink, Profile::AvrcpController];
        if self.disable_pan {
            profiles.push(Profile::Pan);
        }
        profiles
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            discoverable_for: config.discoverable_for,
            position_interval: config.position_interval,
            disable_pan: config.disable_pan,
            discovery: config.discovery,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

struct Publishers {
    player: watch::Sender<PlayerState>,
    paired: watch::Sender<Vec<Device>>,
    discovered: watch::Sender<Vec<Device>>,
    scanning: watch::Sender<bool>,
}

fn publish<T: PartialEq + Clone>(sender: &watch::Sender<T>, value: &T) {
    sender.send_if_modified(|current| {
        if current != value {
            *current = value.clone();
            true
        } else {
            false
        }
    });
}

fn log_failure(operation: &str, error: &PlatformError) {
    if error.is_unsupported() {
        log::warn!("{} unavailable, continuing without it: {}", operation, error);
    } else {
        log::error!("Failed to {}: {}", operation, error);
    }
}

fn best_effort(operation: &str, result: PlatformResult<()>) {
    if let Err(e) = result {
        log_failure(operation, &e);
    }
}

fn describe_equalizer(eq: &dyn Equalizer) -> PlatformResult<(bool, Vec<BandLevel>)> {
    let (min_level, max_level) = eq.level_range()?;
    let bands = (0..eq.band_count()?)
        .map(|band| {
            Ok(BandLevel {
                band,
                level: eq.band_level(band)?,
                center_freq_mhz: eq.center_freq(band)?,
                min_level,
                max_level,
            })
        })
        .collect::<PlatformResult<Vec<_>>>()?;
    Ok((eq.is_enabled()?, bands))
}

/// Owns the sink state and applies every input to it from a single task
pub struct SinkService {
    state: SinkState,
    platform: Arc<dyn BluetoothPlatform>,
    player: Arc<dyn MediaPlayer>,
    equalizer: Option<Box<dyn Equalizer>>,
    poller: PositionPoller,
    options: ServiceOptions,
    inputs: mpsc::UnboundedSender<Input>,
    receiver: mpsc::UnboundedReceiver<Input>,
    publishers: Publishers,
    acquired: Vec<Profile>,
    torn_down: bool,
}

impl SinkService {
    pub fn new(
        options: ServiceOptions,
        platform: Arc<dyn BluetoothPlatform>,
        player: Arc<dyn MediaPlayer>,
    ) -> (Self, SinkHandle) {
        let (inputs, receiver) = mpsc::unbounded_channel();
        Self::with_inputs(options, platform, player, inputs, receiver)
    }

    /// Build on an existing input channel, for platforms that need the sender
    /// before the service exists
    pub fn with_inputs(
        options: ServiceOptions,
        platform: Arc<dyn BluetoothPlatform>,
        player: Arc<dyn MediaPlayer>,
        inputs: mpsc::UnboundedSender<Input>,
        receiver: mpsc::UnboundedReceiver<Input>,
    ) -> (Self, SinkHandle) {
        let state = SinkState::new();

        let (player_tx, player_rx) = watch::channel(state.player.clone());
        let (paired_tx, paired_rx) = watch::channel(Vec::new());
        let (discovered_tx, discovered_rx) = watch::channel(Vec::new());
        let (scanning_tx, scanning_rx) = watch::channel(false);

        let handle = SinkHandle {
            inputs: inputs.clone(),
            player_state: player_rx,
            paired_devices: paired_rx,
            discovered_devices: discovered_rx,
            scanning: scanning_rx,
        };

        let service = Self {
            state,
            platform,
            player,
            equalizer: None,
            poller: PositionPoller::new(options.position_interval),
            options,
            inputs,
            receiver,
            publishers: Publishers {
                player: player_tx,
                paired: paired_tx,
                discovered: discovered_tx,
                scanning: scanning_tx,
            },
            acquired: Vec::new(),
            torn_down: false,
        };

        (service, handle)
    }

    /// Sender for platform events, used by whatever bridges the platform
    pub fn inputs(&self) -> mpsc::UnboundedSender<Input> {
        self.inputs.clone()
    }

    pub fn state(&self) -> &SinkState {
        &self.state
    }

    pub fn poller_running(&self) -> bool {
        self.poller.is_running()
    }

    /// Bring up the sink role. Every step is best-effort.
    pub fn start(&mut self) {
        log::info!("Starting Bluetooth sink service");

        best_effort(
            "set device class",
            self.platform.set_device_class(ClassOfDevice::CAR_AUDIO),
        );
        best_effort(
            "set scan mode",
            self.platform
                .set_scan_mode(ScanMode::ConnectableDiscoverable, self.options.discoverable_for),
        );

        for profile in self.options.profiles() {
            match self.platform.acquire_profile_proxy(profile) {
                Ok(()) => {
                    log::debug!("Requested {} profile proxy", profile);
                    self.acquired.push(profile);
                }
                Err(e) => log_failure(&format!("acquire {} profile proxy", profile), &e),
            }
        }

        self.setup_equalizer();
        self.refresh_paired_devices();

        self.publish();
    }

    fn setup_equalizer(&mut self) {
        let eq = match self.player.open_equalizer() {
            Ok(eq) => eq,
            Err(e) => {
                log_failure("create equalizer", &e);
                return;
            }
        };

        match describe_equalizer(eq.as_ref()) {
            Ok((enabled, bands)) => {
                let centers: Vec<String> = bands
                    .iter()
                    .map(|b| format_frequency(b.center_freq_mhz))
                    .collect();
                log::info!(
                    "Equalizer ready: {} bands [{}] Hz, enabled={}",
                    bands.len(),
                    centers.join(", "),
                    enabled
                );
                self.state.install_equalizer(enabled, bands);
                self.equalizer = Some(eq);
            }
            Err(e) => {
                log_failure("read equalizer bands", &e);
                best_effort("release equalizer", eq.release());
            }
        }
    }

    /// Drain inputs until shutdown, then tear down
    pub async fn run(mut self) {
        while let Some(input) = self.receiver.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        self.teardown();
    }

    /// Apply one input. Returns false once shutdown was requested.
    pub fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Event(event) => self.handle_event(event),
            Input::Tick {
                generation,
                position_ms,
            } => {
                if self.poller.accepts(generation) && self.state.player.is_playing {
                    self.state.apply(Event::PositionTick { position_ms });
                } else {
                    log::trace!("Dropping stale position tick (generation {})", generation);
                }
            }
            Input::Command(command) => self.handle_command(command),
            Input::Shutdown => {
                log::info!("Shutdown requested");
                return false;
            }
        }
        self.publish();
        true
    }

    fn handle_event(&mut self, event: Event) {
        log::debug!("Platform event: {:?}", event);
        let is_metadata = matches!(event, Event::MetadataChanged { .. });

        let effects = self.state.apply(event);

        if is_metadata {
            let track = &self.state.player.track_info;
            log::info!(
                "Now playing: {} - {} ({})",
                track.title,
                track.artist,
                format_time(track.duration_ms as i64)
            );
        }
        self.run_effects(effects);
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartPoller => self.poller.start(self.player.clone(), self.inputs.clone()),
                Effect::StopPoller => self.poller.stop(),
                Effect::RefreshPairedDevices => self.refresh_paired_devices(),
                Effect::PrioritizeSink => {
                    self.set_policy_for_bonded(Profile::A2dpSink, ConnectionPolicy::Allowed)
                }
                Effect::DisablePan => {
                    if self.options.disable_pan {
                        self.set_policy_for_bonded(Profile::Pan, ConnectionPolicy::Forbidden)
                    }
                }
            }
        }
    }

    fn set_policy_for_bonded(&self, profile: Profile, policy: ConnectionPolicy) {
        let bonded = match self.platform.bonded_devices() {
            Ok(devices) => devices,
            Err(e) => {
                log_failure("list bonded devices", &e);
                return;
            }
        };
        for device in &bonded {
            best_effort(
                &format!("set {} policy for {}", profile, device.address),
                self.platform
                    .set_connection_policy(profile, &device.address, policy),
            );
        }
        log::info!(
            "{} connection policy set to {:?} for {} bonded devices",
            profile,
            policy,
            bonded.len()
        );
    }

    fn handle_command(&mut self, command: Command) {
        log::debug!("Command: {:?}", command);
        match command {
            Command::TogglePlayPause => best_effort("toggle playback", self.player.toggle_play_pause()),
            Command::SkipNext => best_effort("skip to next", self.player.skip_next()),
            Command::SkipPrevious => best_effort("skip to previous", self.player.skip_previous()),
            Command::SeekTo { position_ms } => best_effort("seek", self.player.seek_to(position_ms)),
            Command::Connect { address } => self.connect(address),
            Command::CreateBond { address } => self.create_bond(address),
            Command::SelectDevice { address } => self.select_device(address),
            Command::StartDiscovery => self.start_discovery(),
            Command::CancelDiscovery => self.cancel_discovery(),
            Command::RefreshPairedDevices => self.refresh_paired_devices(),
            Command::SetEqEnabled { enabled } => self.set_eq_enabled(enabled),
            Command::SetBandLevel { band, level } => self.set_band_level(band, level),
        }
    }

    fn connect(&mut self, address: Address) {
        log::info!("Connecting to {}", address);
        self.state.begin_connect();
        self.publish();

        let accepted = match self.platform.sink_connect(&address) {
            Ok(accepted) => accepted,
            Err(e) => {
                log_failure("connect A2DP sink", &e);
                false
            }
        };
        if !accepted {
            log::warn!("Connection to {} was not started", address);
            let effects = self.state.connect_failed();
            self.run_effects(effects);
        }
    }

    fn create_bond(&self, address: Address) {
        if !self.options.discovery {
            log::warn!("Pairing is disabled, ignoring bond request for {}", address);
            return;
        }
        log::info!("Pairing with {}", address);
        best_effort("create bond", self.platform.create_bond(&address));
    }

    fn select_device(&mut self, address: Address) {
        let bonded = self
            .state
            .paired_devices
            .iter()
            .any(|d| d.address == address)
            || self.state.find_device(&address).is_some_and(Device::is_bonded);
        if bonded {
            self.connect(address);
        } else {
            self.create_bond(address);
        }
    }

    fn start_discovery(&mut self) {
        if !self.options.discovery {
            log::warn!("Discovery is disabled");
            return;
        }
        self.cancel_running_discovery();

        self.state.discovery_started();
        match self.platform.start_discovery() {
            Ok(()) => log::info!("Discovery started"),
            Err(e) => {
                log_failure("start discovery", &e);
                self.state.discovery_stopped();
            }
        }
    }

    fn cancel_discovery(&mut self) {
        if !self.options.discovery {
            log::warn!("Discovery is disabled");
            return;
        }
        self.cancel_running_discovery();
        self.state.discovery_stopped();
    }

    /// Cancel a scan in progress. An unknown scan state counts as running.
    fn cancel_running_discovery(&self) {
        match self.platform.is_discovering() {
            Ok(false) => {}
            Ok(true) => best_effort("cancel discovery", self.platform.cancel_discovery()),
            Err(e) => {
                log_failure("query discovery state", &e);
                best_effort("cancel discovery", self.platform.cancel_discovery());
            }
        }
    }

    fn refresh_paired_devices(&mut self) {
        if !self.options.discovery {
            log::debug!("Discovery is disabled, not listing paired devices");
            return;
        }
        match self.platform.bonded_devices() {
            Ok(devices) => {
                log::debug!("{} paired devices", devices.len());
                self.state.set_paired_devices(devices);
            }
            Err(e) => log_failure("list bonded devices", &e),
        }
    }

    fn set_eq_enabled(&mut self, enabled: bool) {
        let Some(eq) = self.equalizer.as_ref() else {
            log::warn!("Equalizer unavailable, ignoring enable={}", enabled);
            return;
        };
        match eq.set_enabled(enabled) {
            Ok(()) => self.state.set_eq_enabled(enabled),
            Err(e) => log_failure("toggle equalizer", &e),
        }
    }

    fn set_band_level(&mut self, band: u16, level: i16) {
        let Some(eq) = self.equalizer.as_ref() else {
            log::warn!("Equalizer unavailable, ignoring band {} level", band);
            return;
        };
        let Some(level) = self.state.clamp_band_level(band, level) else {
            log::warn!("No equalizer band {}", band);
            return;
        };
        match eq.set_band_level(band, level) {
            Ok(()) => {
                self.state.set_band_level(band, level);
            }
            Err(e) => log_failure("set band level", &e),
        }
    }

    fn publish(&self) {
        publish(&self.publishers.player, &self.state.player);
        publish(&self.publishers.paired, &self.state.paired_devices);
        publish(&self.publishers.discovered, &self.state.discovered_devices);
        publish(&self.publishers.scanning, &self.state.scanning);
    }

    /// Release everything acquired at start. Each step runs even when an
    /// earlier one fails; calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::info!("Tearing down Bluetooth sink service");

        self.poller.stop();
        if self.state.scanning {
            best_effort("cancel discovery", self.platform.cancel_discovery());
            self.state.discovery_stopped();
        }
        best_effort("unregister event listener", self.platform.unregister_listener());
        best_effort("release media player", self.player.release());
        if let Some(eq) = self.equalizer.take() {
            best_effort("release equalizer", eq.release());
        }
        for profile in std::mem::take(&mut self.acquired) {
            best_effort(
                &format!("release {} profile proxy", profile),
                self.platform.release_profile_proxy(profile),
            );
        }

        self.publish();
    }
}

impl Drop for SinkService {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cloneable front end: sends commands and hands out snapshot receivers
#[derive(Clone)]
pub struct SinkHandle {
    inputs: mpsc::UnboundedSender<Input>,
    player_state: watch::Receiver<PlayerState>,
    paired_devices: watch::Receiver<Vec<Device>>,
    discovered_devices: watch::Receiver<Vec<Device>>,
    scanning: watch::Receiver<bool>,
}

impl SinkHandle {
    fn send(&self, command: Command) {
        if self.inputs.send(Input::Command(command)).is_err() {
            log::warn!("Sink service has stopped, dropping command");
        }
    }

    pub fn toggle_play_pause(&self) {
        self.send(Command::TogglePlayPause);
    }

    pub fn skip_next(&self) {
        self.send(Command::SkipNext);
    }

    pub fn skip_previous(&self) {
        self.send(Command::SkipPrevious);
    }

    pub fn seek_to(&self, position_ms: u64) {
        self.send(Command::SeekTo { position_ms });
    }

    pub fn connect(&self, address: Address) {
        self.send(Command::Connect { address });
    }

    pub fn create_bond(&self, address: Address) {
        self.send(Command::CreateBond { address });
    }

    pub fn select_device(&self, address: Address) {
        self.send(Command::SelectDevice { address });
    }

    pub fn start_discovery(&self) {
        self.send(Command::StartDiscovery);
    }

    pub fn cancel_discovery(&self) {
        self.send(Command::CancelDiscovery);
    }

    pub fn refresh_paired_devices(&self) {
        self.send(Command::RefreshPairedDevices);
    }

    pub fn set_eq_enabled(&self, enabled: bool) {
        self.send(Command::SetEqEnabled { enabled });
    }

    pub fn set_band_level(&self, band: u16, level: i16) {
        self.send(Command::SetBandLevel { band, level });
    }

    pub fn shutdown(&self) {
        let _ = self.inputs.send(Input::Shutdown);
    }

    pub fn player_state(&self) -> watch::Receiver<PlayerState> {
        self.player_state.clone()
    }

    pub fn paired_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.paired_devices.clone()
    }

    pub fn discovered_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.discovered_devices.clone()
    }

    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.scanning.clone()
    }
}
