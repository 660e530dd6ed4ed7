use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Config;
use crate::platform::{BluetoothPlatform, Equalizer, MediaPlayer, PlatformError, PlatformResult};
use crate::service::{Command as ControlCommand, Input};
use crate::state::Event;
use crate::types::{Address, ClassOfDevice, ConnectionPolicy, Device, Profile, ScanMode};

/// Requests understood by the platform sidecar. Written to its stdin as one
/// JSON object per line, tagged by `command` and carrying a numeric `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    SetDeviceClass { class: ClassOfDevice },
    SetScanMode { mode: ScanMode, duration_secs: u64 },
    AcquireProfileProxy { profile: Profile },
    ReleaseProfileProxy { profile: Profile },
    SetConnectionPolicy {
        profile: Profile,
        address: Address,
        policy: ConnectionPolicy,
    },
    BondedDevices,
    IsDiscovering,
    StartDiscovery,
    CancelDiscovery,
    CreateBond { address: Address },
    SinkConnect { address: Address },
    UnregisterListener,
    TogglePlayPause,
    SkipNext,
    SkipPrevious,
    SeekTo { position_ms: u64 },
    CurrentPosition,
    ReleasePlayer,
    OpenEqualizer,
    EqualizerSetEnabled { enabled: bool },
    EqualizerSetBandLevel { band: u16, level: i16 },
    ReleaseEqualizer,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    value: Value,
}

impl Reply {
    fn into_result(self, operation: &'static str) -> PlatformResult<Value> {
        if self.ok {
            return Ok(self.value);
        }
        match self.error.as_deref() {
            Some("unsupported") => Err(PlatformError::Unsupported(operation)),
            reason => Err(PlatformError::Rejected {
                operation,
                reason: reason.unwrap_or("no reason given").to_string(),
            }),
        }
    }
}

/// One line of sidecar output
#[derive(Debug, PartialEq)]
enum Message {
    Reply(Reply),
    Event(Event),
    Control(ControlCommand),
}

fn parse_line(line: &str) -> Result<Message> {
    let mut value: Value = serde_json::from_str(line).context("Invalid JSON")?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("Message has no type")?;

    match kind.as_str() {
        "reply" => Ok(Message::Reply(
            serde_json::from_value(value).context("Malformed reply")?,
        )),
        "control" => {
            if let Some(object) = value.as_object_mut() {
                object.remove("type");
            }
            Ok(Message::Control(
                serde_json::from_value(value).context("Unknown control action")?,
            ))
        }
        _ => Ok(Message::Event(
            serde_json::from_value(value).with_context(|| format!("Unknown event {:?}", kind))?,
        )),
    }
}

fn encode_request(id: u64, request: &Request) -> PlatformResult<String> {
    let mut message =
        serde_json::to_value(request).map_err(|e| PlatformError::Protocol(e.to_string()))?;
    if let Some(object) = message.as_object_mut() {
        object.insert("id".to_string(), Value::from(id));
    }
    Ok(message.to_string())
}

fn decode<T: DeserializeOwned>(operation: &'static str, value: Value) -> PlatformResult<T> {
    serde_json::from_value(value)
        .map_err(|e| PlatformError::Protocol(format!("{}: {}", operation, e)))
}

/// What the sidecar reports when it attaches an equalizer
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct EqualizerDescription {
    enabled: bool,
    levels: Vec<i16>,
    center_freqs_mhz: Vec<u32>,
    min_level: i16,
    max_level: i16,
}

struct Inner {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<Box<dyn Write + Send>>>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Reply>>>,
    next_id: AtomicU64,
    /// Events are forwarded until the listener is unregistered
    listening: AtomicBool,
    stopping: AtomicBool,
    inputs: UnboundedSender<Input>,
    reply_timeout: Duration,
    stop_grace: Duration,
}

impl Inner {
    fn new(
        stdin: Box<dyn Write + Send>,
        inputs: UnboundedSender<Input>,
        reply_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            child: Mutex::new(None),
            stdin: Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listening: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            inputs,
            reply_timeout,
            stop_grace,
        }
    }

    fn write_line(&self, line: &str) -> PlatformResult<()> {
        let mut stdin = self.stdin.lock();
        let writer = stdin.as_mut().ok_or(PlatformError::Disconnected)?;
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| PlatformError::Io(e.to_string()))
    }

    fn handle_line(&self, line: &str) {
        match parse_line(line) {
            Ok(Message::Reply(reply)) => match self.pending.lock().remove(&reply.id) {
                Some(waiter) => {
                    // The caller may have timed out already
                    let _ = waiter.send(reply);
                }
                None => log::warn!("Dropping reply {} nobody is waiting for", reply.id),
            },
            Ok(Message::Event(event)) => {
                if !self.listening.load(Ordering::SeqCst) {
                    log::debug!("Listener unregistered, ignoring {:?}", event);
                    return;
                }
                if self.inputs.send(Input::Event(event)).is_err() {
                    log::debug!("Service loop is gone, dropping sidecar event");
                }
            }
            Ok(Message::Control(command)) => {
                log::info!("Control from sidecar: {:?}", command);
                if self.inputs.send(Input::Command(command)).is_err() {
                    log::debug!("Service loop is gone, dropping sidecar control");
                }
            }
            Err(e) => {
                log::error!("Failed to parse sidecar message: {:#} - {}", e, line);
            }
        }
    }

    /// Read stdout from the sidecar (JSON messages)
    fn read_stdout(&self, stdout: impl std::io::Read) {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    // Undecodable bytes end up as a parse error for this line only
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    log::debug!("Sidecar stdout: {}", line);
                    self.handle_line(line);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Error reading sidecar stdout: {}", e);
                    break;
                }
            }
        }

        log::warn!("Sidecar stdout reader stopped");

        // Wake every waiter with a disconnect
        self.pending.lock().clear();
        self.stdin.lock().take();

        if !self.stopping.load(Ordering::SeqCst) {
            log::error!("Platform sidecar exited unexpectedly, shutting down");
            let _ = self.inputs.send(Input::Shutdown);
        }
    }

    fn call(&self, operation: &'static str, request: Request) -> PlatformResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = encode_request(id, &request)?;
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(id, tx);

        log::trace!("Sidecar request: {}", line);
        if let Err(e) = self.write_line(&line) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(self.reply_timeout) {
            Ok(reply) => reply.into_result(operation),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                Err(PlatformError::Timeout(operation))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PlatformError::Disconnected),
        }
    }

    fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        // Closing stdin is the first hint to exit
        self.stdin.lock().take();

        let child_option = self.child.lock().take();
        if let Some(mut child) = child_option {
            log::info!("Stopping sidecar process with PID {}...", child.id());

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let pid = child.id();
                log::info!("Sending SIGTERM to sidecar process {}", pid);
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::warn!("Failed to signal sidecar: {}", e);
                }
            }

            let check_interval = Duration::from_millis(100);
            let mut waited = Duration::ZERO;

            while waited < self.stop_grace {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::info!("Sidecar process exited gracefully with status: {:?}", status);
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("Error checking sidecar status: {}", e);
                        break;
                    }
                }
                thread::sleep(check_interval);
                waited += check_interval;
            }

            if let Ok(Some(status)) = child.try_wait() {
                log::info!("Sidecar process exited with status: {:?}", status);
                return Ok(());
            }

            log::warn!(
                "Sidecar didn't stop after {}ms, sending SIGKILL...",
                self.stop_grace.as_millis()
            );
            child.kill().context("Failed to kill sidecar process")?;
            child.wait().context("Failed to wait for sidecar process")?;
            log::info!("Sidecar process forcefully terminated");
        }

        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Error stopping sidecar in Drop: {}", e);
        }
    }
}

/// Bridge to the out-of-process platform helper.
///
/// The helper owns the real Bluetooth and media APIs. Requests go out on its
/// stdin, replies and broadcast events come back on its stdout, and anything
/// it writes to stderr lands in the log. Calls block the caller for at most
/// the configured reply timeout.
#[derive(Clone)]
pub struct Sidecar {
    inner: Arc<Inner>,
}

impl Sidecar {
    /// Spawn the sidecar process and start reading its output
    pub fn spawn(config: &Config, inputs: UnboundedSender<Input>) -> Result<Self> {
        log::info!(
            "Spawning platform sidecar: {} {}",
            config.sidecar_command,
            config.sidecar_args.join(" ")
        );

        let mut child = Command::new(&config.sidecar_command)
            .args(&config.sidecar_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn sidecar {:?}", config.sidecar_command))?;

        log::info!("Sidecar process spawned with PID: {}", child.id());

        let stdin = child.stdin.take().context("Failed to capture sidecar stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("Failed to capture sidecar stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to capture sidecar stderr")?;

        let inner = Arc::new(Inner::new(
            Box::new(stdin),
            inputs,
            config.reply_timeout,
            config.stop_grace,
        ));
        *inner.child.lock() = Some(child);

        let reader = inner.clone();
        thread::Builder::new()
            .name("sidecar-stdout".into())
            .spawn(move || reader.read_stdout(stdout))
            .context("Failed to start sidecar stdout reader")?;

        thread::Builder::new()
            .name("sidecar-stderr".into())
            .spawn(move || read_stderr(stderr))
            .context("Failed to start sidecar stderr reader")?;

        Ok(Self { inner })
    }

    /// Check if the sidecar is still running
    pub fn is_running(&self) -> bool {
        let mut child_guard = self.inner.child.lock();
        match child_guard.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                log::warn!("Sidecar process has exited with {:?}", status);
                false
            }
            Some(Err(e)) => {
                log::error!("Error checking sidecar status: {}", e);
                false
            }
            None => false,
        }
    }

    /// Stop the sidecar process: SIGTERM, then SIGKILL after the grace period
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    fn call(&self, operation: &'static str, request: Request) -> PlatformResult<Value> {
        self.inner.call(operation, request)
    }

    fn call_unit(&self, operation: &'static str, request: Request) -> PlatformResult<()> {
        self.call(operation, request).map(|_| ())
    }
}

/// Read stderr from the sidecar (debug logs)
fn read_stderr(stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);

    for line in reader.split(b'\n') {
        match line {
            Ok(line) => {
                let line = String::from_utf8_lossy(&line);
                if !line.trim().is_empty() {
                    log::info!("[Sidecar] {}", line.trim_end());
                }
            }
            Err(e) => {
                log::error!("Error reading sidecar stderr: {}", e);
                break;
            }
        }
    }

    log::warn!("Sidecar stderr reader stopped");
}

impl BluetoothPlatform for Sidecar {
    fn set_device_class(&self, class: ClassOfDevice) -> PlatformResult<()> {
        self.call_unit("set_device_class", Request::SetDeviceClass { class })
    }

    fn set_scan_mode(&self, mode: ScanMode, duration: Duration) -> PlatformResult<()> {
        self.call_unit(
            "set_scan_mode",
            Request::SetScanMode {
                mode,
                duration_secs: duration.as_secs(),
            },
        )
    }

    fn acquire_profile_proxy(&self, profile: Profile) -> PlatformResult<()> {
        self.call_unit("acquire_profile_proxy", Request::AcquireProfileProxy { profile })
    }

    fn release_profile_proxy(&self, profile: Profile) -> PlatformResult<()> {
        self.call_unit("release_profile_proxy", Request::ReleaseProfileProxy { profile })
    }

    fn set_connection_policy(
        &self,
        profile: Profile,
        device: &Address,
        policy: ConnectionPolicy,
    ) -> PlatformResult<()> {
        self.call_unit(
            "set_connection_policy",
            Request::SetConnectionPolicy {
                profile,
                address: *device,
                policy,
            },
        )
    }

    fn bonded_devices(&self) -> PlatformResult<Vec<Device>> {
        let value = self.call("bonded_devices", Request::BondedDevices)?;
        decode("bonded_devices", value)
    }

    fn is_discovering(&self) -> PlatformResult<bool> {
        let value = self.call("is_discovering", Request::IsDiscovering)?;
        decode("is_discovering", value)
    }

    fn start_discovery(&self) -> PlatformResult<()> {
        self.call_unit("start_discovery", Request::StartDiscovery)
    }

    fn cancel_discovery(&self) -> PlatformResult<()> {
        self.call_unit("cancel_discovery", Request::CancelDiscovery)
    }

    fn create_bond(&self, device: &Address) -> PlatformResult<()> {
        self.call_unit("create_bond", Request::CreateBond { address: *device })
    }

    fn sink_connect(&self, device: &Address) -> PlatformResult<bool> {
        let value = self.call("sink_connect", Request::SinkConnect { address: *device })?;
        decode("sink_connect", value)
    }

    fn unregister_listener(&self) -> PlatformResult<()> {
        // Stop forwarding right away, even if the sidecar never answers
        self.inner.listening.store(false, Ordering::SeqCst);
        self.call_unit("unregister_listener", Request::UnregisterListener)
    }
}

impl MediaPlayer for Sidecar {
    fn toggle_play_pause(&self) -> PlatformResult<()> {
        self.call_unit("toggle_play_pause", Request::TogglePlayPause)
    }

    fn skip_next(&self) -> PlatformResult<()> {
        self.call_unit("skip_next", Request::SkipNext)
    }

    fn skip_previous(&self) -> PlatformResult<()> {
        self.call_unit("skip_previous", Request::SkipPrevious)
    }

    fn seek_to(&self, position_ms: u64) -> PlatformResult<()> {
        self.call_unit("seek_to", Request::SeekTo { position_ms })
    }

    fn current_position(&self) -> PlatformResult<u64> {
        let value = self.call("current_position", Request::CurrentPosition)?;
        decode("current_position", value)
    }

    fn open_equalizer(&self) -> PlatformResult<Box<dyn Equalizer>> {
        let value = self.call("open_equalizer", Request::OpenEqualizer)?;
        let description: EqualizerDescription = decode("open_equalizer", value)?;
        if description.levels.len() != description.center_freqs_mhz.len() {
            return Err(PlatformError::Protocol(format!(
                "open_equalizer: {} levels but {} center frequencies",
                description.levels.len(),
                description.center_freqs_mhz.len()
            )));
        }
        if description.min_level > description.max_level {
            return Err(PlatformError::Protocol(format!(
                "open_equalizer: level range {}..{} is empty",
                description.min_level, description.max_level
            )));
        }
        Ok(Box::new(SidecarEqualizer {
            sidecar: self.clone(),
            description: Mutex::new(description),
        }))
    }

    fn release(&self) -> PlatformResult<()> {
        self.call_unit("release_player", Request::ReleasePlayer)
    }
}

/// Equalizer attached through the sidecar. Reads come from the description
/// taken when it was opened, kept current as writes succeed.
struct SidecarEqualizer {
    sidecar: Sidecar,
    description: Mutex<EqualizerDescription>,
}

impl SidecarEqualizer {
    fn band_index(&self, band: u16) -> PlatformResult<usize> {
        let index = band as usize;
        if index < self.description.lock().levels.len() {
            Ok(index)
        } else {
            Err(PlatformError::Rejected {
                operation: "equalizer",
                reason: format!("no band {}", band),
            })
        }
    }
}

impl Equalizer for SidecarEqualizer {
    fn is_enabled(&self) -> PlatformResult<bool> {
        Ok(self.description.lock().enabled)
    }

    fn band_count(&self) -> PlatformResult<u16> {
        Ok(self.description.lock().levels.len() as u16)
    }

    fn band_level(&self, band: u16) -> PlatformResult<i16> {
        let index = self.band_index(band)?;
        Ok(self.description.lock().levels[index])
    }

    fn center_freq(&self, band: u16) -> PlatformResult<u32> {
        let index = self.band_index(band)?;
        Ok(self.description.lock().center_freqs_mhz[index])
    }

    fn level_range(&self) -> PlatformResult<(i16, i16)> {
        let description = self.description.lock();
        Ok((description.min_level, description.max_level))
    }

    fn set_enabled(&self, enabled: bool) -> PlatformResult<()> {
        self.sidecar
            .call_unit("equalizer_set_enabled", Request::EqualizerSetEnabled { enabled })?;
        self.description.lock().enabled = enabled;
        Ok(())
    }

    fn set_band_level(&self, band: u16, level: i16) -> PlatformResult<()> {
        let index = self.band_index(band)?;
        self.sidecar.call_unit(
            "equalizer_set_band_level",
            Request::EqualizerSetBandLevel { band, level },
        )?;
        self.description.lock().levels[index] = level;
        Ok(())
    }

    fn release(&self) -> PlatformResult<()> {
        self.sidecar
            .call_unit("release_equalizer", Request::ReleaseEqualizer)
    }
}
