use std::time::Duration;

use crate::types::{Address, ClassOfDevice, ConnectionPolicy, Device, Profile, ScanMode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The operation relies on platform surface that is missing on this host
    #[error("{0} is not supported by this platform")]
    Unsupported(&'static str),
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
    #[error("{0} timed out waiting for the platform")]
    Timeout(&'static str),
    #[error("platform sidecar is not running")]
    Disconnected,
    #[error("platform I/O error: {0}")]
    Io(String),
    #[error("malformed platform reply: {0}")]
    Protocol(String),
}

impl PlatformError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, PlatformError::Unsupported(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Bluetooth adapter capabilities the sink needs from the host stack.
///
/// `set_device_class`, `set_scan_mode` and `sink_connect` reach platform
/// surface that is not part of any stable API. They require the Bluetooth
/// admin/privileged permission and a stack that still carries the hidden
/// entry points; implementations report `PlatformError::Unsupported` when
/// the entry point is gone so callers can degrade instead of failing.
pub trait BluetoothPlatform: Send + Sync {
    fn set_device_class(&self, class: ClassOfDevice) -> PlatformResult<()>;
    fn set_scan_mode(&self, mode: ScanMode, duration: Duration) -> PlatformResult<()>;

    /// Request a profile proxy. The proxy itself arrives later as a
    /// `profile_connected` event.
    fn acquire_profile_proxy(&self, profile: Profile) -> PlatformResult<()>;
    fn release_profile_proxy(&self, profile: Profile) -> PlatformResult<()>;
    fn set_connection_policy(
        &self,
        profile: Profile,
        device: &Address,
        policy: ConnectionPolicy,
    ) -> PlatformResult<()>;

    fn bonded_devices(&self) -> PlatformResult<Vec<Device>>;
    fn is_discovering(&self) -> PlatformResult<bool>;
    fn start_discovery(&self) -> PlatformResult<()>;
    fn cancel_discovery(&self) -> PlatformResult<()>;
    fn create_bond(&self, device: &Address) -> PlatformResult<()>;

    /// Ask the A2DP sink to connect. `Ok(false)` means the stack refused the
    /// request synchronously; the outcome otherwise arrives as a link state event.
    fn sink_connect(&self, device: &Address) -> PlatformResult<bool>;

    /// Stop delivering broadcast events
    fn unregister_listener(&self) -> PlatformResult<()>;
}

/// The media session fed by the AVRCP controller
pub trait MediaPlayer: Send + Sync {
    fn toggle_play_pause(&self) -> PlatformResult<()>;
    fn skip_next(&self) -> PlatformResult<()>;
    fn skip_previous(&self) -> PlatformResult<()>;
    fn seek_to(&self, position_ms: u64) -> PlatformResult<()>;
    fn current_position(&self) -> PlatformResult<u64>;

    /// Attach an equalizer to the player's audio session
    fn open_equalizer(&self) -> PlatformResult<Box<dyn Equalizer>>;
    fn release(&self) -> PlatformResult<()>;
}

pub trait Equalizer: Send {
    fn is_enabled(&self) -> PlatformResult<bool>;
    fn band_count(&self) -> PlatformResult<u16>;
    fn band_level(&self, band: u16) -> PlatformResult<i16>;
    fn center_freq(&self, band: u16) -> PlatformResult<u32>;
    /// `(min, max)` level in millibels, shared by all bands
    fn level_range(&self) -> PlatformResult<(i16, i16)>;
    fn set_enabled(&self, enabled: bool) -> PlatformResult<()>;
    fn set_band_level(&self, band: u16, level: i16) -> PlatformResult<()>;
    fn release(&self) -> PlatformResult<()>;
}
