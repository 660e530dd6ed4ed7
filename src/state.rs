use serde::Deserialize;
use std::collections::BTreeSet;

use crate::types::{
    Address, BandLevel, ConnectionStatus, Device, LinkState, PlayerState, Profile, TrackInfo,
    CONNECTED_DEVICE, UNKNOWN_ALBUM, UNKNOWN_ARTIST, UNKNOWN_TITLE,
};

/// Signals from the platform, as delivered by the profile listener, the
/// broadcast listener, the media observer and the position poller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ProfileConnected {
        profile: Profile,
        #[serde(default)]
        connected_devices: Vec<Device>,
    },
    ProfileDisconnected {
        profile: Profile,
    },
    LinkStateChanged {
        state: LinkState,
        device: Option<Device>,
    },
    DeviceFound {
        device: Device,
    },
    DiscoveryFinished,
    BondStateChanged {
        device: Device,
    },
    MetadataChanged {
        title: Option<String>,
        artist: Option<String>,
        album: Option<String>,
        artwork: Option<String>,
        #[serde(default)]
        duration_ms: i64,
    },
    PlaybackActiveChanged {
        playing: bool,
    },
    PositionTick {
        position_ms: u64,
    },
}

/// Side effects a transition asks the service to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartPoller,
    StopPoller,
    RefreshPairedDevices,
    PrioritizeSink,
    DisablePan,
}

/// Everything the service publishes, owned by a single writer
#[derive(Debug, Clone, Default)]
pub struct SinkState {
    pub player: PlayerState,
    pub paired_devices: Vec<Device>,
    pub discovered_devices: Vec<Device>,
    pub scanning: bool,
    profiles: BTreeSet<Profile>,
}

impl SinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profiles whose proxy is currently connected
    pub fn has_profile(&self, profile: Profile) -> bool {
        self.profiles.contains(&profile)
    }

    /// Apply one event and return the effects it requires
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::ProfileConnected {
                profile,
                connected_devices,
            } => self.on_profile_connected(profile, &connected_devices),
            Event::ProfileDisconnected { profile } => {
                self.profiles.remove(&profile);
                Vec::new()
            }
            Event::LinkStateChanged { state, device } => {
                self.on_link_state_changed(state, device.as_ref())
            }
            Event::DeviceFound { device } => {
                self.on_device_found(device);
                Vec::new()
            }
            Event::DiscoveryFinished => {
                self.scanning = false;
                Vec::new()
            }
            Event::BondStateChanged { device } => {
                if let Some(known) = self
                    .discovered_devices
                    .iter_mut()
                    .find(|d| d.address == device.address)
                {
                    known.bond_state = device.bond_state;
                }
                vec![Effect::RefreshPairedDevices]
            }
            Event::MetadataChanged {
                title,
                artist,
                album,
                artwork,
                duration_ms,
            } => {
                let track = TrackInfo {
                    title: title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                    artist: artist.unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
                    album: album.unwrap_or_else(|| UNKNOWN_ALBUM.to_string()),
                    artwork,
                    duration_ms: duration_ms.max(0) as u64,
                };
                if !track.same_track(&self.player.track_info) {
                    self.player.current_position_ms = 0;
                }
                self.player.track_info = track;
                Vec::new()
            }
            Event::PlaybackActiveChanged { playing } => {
                self.player.is_playing = playing;
                if playing {
                    vec![Effect::StartPoller]
                } else {
                    vec![Effect::StopPoller]
                }
            }
            Event::PositionTick { position_ms } => {
                self.player.current_position_ms = position_ms;
                Vec::new()
            }
        }
    }

    fn on_profile_connected(&mut self, profile: Profile, connected: &[Device]) -> Vec<Effect> {
        self.profiles.insert(profile);
        match profile {
            Profile::A2dpSink => {
                if let Some(device) = connected.first() {
                    self.player.connection_status = ConnectionStatus::Connected;
                    self.player.track_info.artist = device.display_name().to_string();
                }
                vec![Effect::PrioritizeSink]
            }
            Profile::Pan => vec![Effect::DisablePan],
            Profile::AvrcpController => Vec::new(),
        }
    }

    fn on_link_state_changed(&mut self, state: LinkState, device: Option<&Device>) -> Vec<Effect> {
        match state {
            LinkState::Connecting => {
                self.player.connection_status = ConnectionStatus::Connecting;
                Vec::new()
            }
            LinkState::Connected => {
                self.player.connection_status = ConnectionStatus::Connected;
                self.player.track_info.artist = device
                    .map(Device::display_name)
                    .unwrap_or(CONNECTED_DEVICE)
                    .to_string();
                Vec::new()
            }
            LinkState::Disconnected => self.disconnect(),
            // Only the final disconnected state matters
            LinkState::Disconnecting => Vec::new(),
        }
    }

    fn on_device_found(&mut self, device: Device) {
        if !device.has_name() {
            return;
        }
        if self
            .discovered_devices
            .iter()
            .any(|d| d.address == device.address)
        {
            return;
        }
        self.discovered_devices.push(device);
    }

    fn disconnect(&mut self) -> Vec<Effect> {
        self.player.connection_status = ConnectionStatus::Disconnected;
        self.player.is_playing = false;
        self.player.track_info = TrackInfo::default();
        self.player.current_position_ms = 0;
        vec![Effect::StopPoller]
    }

    /// Optimistic status while a connect request is in flight
    pub fn begin_connect(&mut self) {
        self.player.connection_status = ConnectionStatus::Connecting;
    }

    /// The platform refused the connect request
    pub fn connect_failed(&mut self) -> Vec<Effect> {
        self.disconnect()
    }

    pub fn discovery_started(&mut self) {
        self.discovered_devices.clear();
        self.scanning = true;
    }

    pub fn discovery_stopped(&mut self) {
        self.scanning = false;
    }

    pub fn set_paired_devices(&mut self, devices: Vec<Device>) {
        self.paired_devices = devices;
    }

    /// Look up a device by address among paired and discovered devices
    pub fn find_device(&self, address: &Address) -> Option<&Device> {
        self.paired_devices
            .iter()
            .chain(self.discovered_devices.iter())
            .find(|d| &d.address == address)
    }

    pub fn install_equalizer(&mut self, enabled: bool, bands: Vec<BandLevel>) {
        self.player.eq_settings.enabled = enabled;
        self.player.eq_settings.bands = bands;
    }

    pub fn set_eq_enabled(&mut self, enabled: bool) {
        self.player.eq_settings.enabled = enabled;
    }

    /// Set the level of one band, clamped to its range. Returns the applied
    /// level, or `None` when no band has that index.
    pub fn set_band_level(&mut self, band: u16, level: i16) -> Option<i16> {
        let entry = self
            .player
            .eq_settings
            .bands
            .iter_mut()
            .find(|b| b.band == band)?;
        entry.level = level.clamp(entry.min_level, entry.max_level);
        Some(entry.level)
    }

    /// Clamp a requested level into a band's range without changing state
    pub fn clamp_band_level(&self, band: u16, level: i16) -> Option<i16> {
        self.player
            .eq_settings
            .bands
            .iter()
            .find(|b| b.band == band)
            .map(|b| level.clamp(b.min_level, b.max_level))
    }
}
