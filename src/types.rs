use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const CONNECTED_DEVICE: &str = "Connected Device";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Metadata of the track currently streamed by the source device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork: Option<String>, // artwork URI as reported by the player
    pub duration_ms: u64,
}

impl Default for TrackInfo {
    fn default() -> Self {
        Self {
            title: "Waiting for music...".to_string(),
            artist: "No device connected".to_string(),
            album: String::new(),
            artwork: None,
            duration_ms: 0,
        }
    }
}

impl TrackInfo {
    /// Two tracks are the same song when title, artist and album agree
    pub fn same_track(&self, other: &TrackInfo) -> bool {
        self.title == other.title && self.artist == other.artist && self.album == other.album
    }
}

/// One equalizer band. Levels are millibels, the center frequency is milli-hertz.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BandLevel {
    pub band: u16,
    pub level: i16,
    pub center_freq_mhz: u32,
    pub min_level: i16,
    pub max_level: i16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EqSettings {
    pub enabled: bool,
    pub bands: Vec<BandLevel>,
}

impl EqSettings {
    /// An equalizer that never came up has no bands
    pub fn is_available(&self) -> bool {
        !self.bands.is_empty()
    }
}

/// Snapshot observed by the UI layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerState {
    pub connection_status: ConnectionStatus,
    pub is_playing: bool,
    pub track_info: TrackInfo,
    pub current_position_ms: u64,
    pub eq_settings: EqSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0:?}")]
pub struct AddressParseError(pub String);

/// Bluetooth device address (`BD_ADDR`), printed as `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// A remote device known to the platform Bluetooth stack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bond_state: BondState,
    #[serde(default)]
    pub connected: bool,
}

impl Device {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            bond_state: BondState::None,
            connected: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_bond_state(mut self, bond_state: BondState) -> Self {
        self.bond_state = bond_state;
        self
    }

    /// True when the device advertised a non-empty name
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => CONNECTED_DEVICE,
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.bond_state == BondState::Bonded
    }
}

/// Bluetooth profiles the sink participates in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    A2dpSink,
    AvrcpController,
    Pan,
}

impl Profile {
    /// Numeric profile id used by the platform Bluetooth stack
    pub fn platform_id(self) -> u8 {
        match self {
            Profile::Pan => 5,
            Profile::A2dpSink => 11,
            Profile::AvrcpController => 12,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Profile::A2dpSink => "A2DP Sink",
            Profile::AvrcpController => "AVRCP Controller",
            Profile::Pan => "PAN",
        };
        f.write_str(name)
    }
}

/// Link state reported for the A2DP sink connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    None,
    Connectable,
    ConnectableDiscoverable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    Forbidden,
    Allowed,
}

/// 24-bit Class of Device advertised during inquiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassOfDevice(u32);

impl ClassOfDevice {
    const AUDIO_SERVICE: u32 = 1 << 21;
    const RENDERING_SERVICE: u32 = 1 << 18;
    const MAJOR_AUDIO_VIDEO: u32 = 0x04;
    const MINOR_CAR_AUDIO: u32 = 0x08;

    /// Audio/Video major class, Car Audio minor class, Audio + Rendering services
    pub const CAR_AUDIO: ClassOfDevice = ClassOfDevice(
        Self::AUDIO_SERVICE
            | Self::RENDERING_SERVICE
            | (Self::MAJOR_AUDIO_VIDEO << 8)
            | (Self::MINOR_CAR_AUDIO << 2),
    );

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & 0x00FF_FFFF)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn major_device_class(&self) -> u8 {
        ((self.0 >> 8) & 0x1F) as u8
    }

    pub fn minor_device_class(&self) -> u8 {
        ((self.0 >> 2) & 0x3F) as u8
    }

    pub fn major_service_classes(&self) -> u16 {
        ((self.0 >> 13) & 0x07FF) as u16
    }

    pub fn has_audio_service(&self) -> bool {
        self.0 & Self::AUDIO_SERVICE != 0
    }
}

impl fmt::Display for ClassOfDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.0)
    }
}
