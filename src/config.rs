use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Runtime settings, read from `CARSINK_*` environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Platform sidecar executable and its arguments
    pub sidecar_command: String,
    pub sidecar_args: Vec<String>,
    pub discoverable_for: Duration,
    pub position_interval: Duration,
    pub reply_timeout: Duration,
    pub stop_grace: Duration,
    /// Turn PAN (tethering) off for bonded devices so it can't grab the link
    pub disable_pan: bool,
    /// Offer discovery and pairing
    pub discovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sidecar_command: "carsink-platform".to_string(),
            sidecar_args: Vec::new(),
            discoverable_for: Duration::from_secs(300),
            position_interval: Duration::from_millis(1000),
            reply_timeout: Duration::from_millis(2000),
            stop_grace: Duration::from_millis(2000),
            disable_pan: true,
            discovery: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(command) = lookup("CARSINK_SIDECAR") {
            if command.trim().is_empty() {
                bail!("CARSINK_SIDECAR must not be empty");
            }
            config.sidecar_command = command.trim().to_string();
        }
        if let Some(args) = lookup("CARSINK_SIDECAR_ARGS") {
            config.sidecar_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = lookup("CARSINK_DISCOVERABLE_SECS") {
            config.discoverable_for = Duration::from_secs(parse_number("CARSINK_DISCOVERABLE_SECS", &secs)?);
        }
        if let Some(ms) = lookup("CARSINK_POSITION_INTERVAL_MS") {
            config.position_interval = positive_millis("CARSINK_POSITION_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("CARSINK_REPLY_TIMEOUT_MS") {
            config.reply_timeout = positive_millis("CARSINK_REPLY_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("CARSINK_STOP_GRACE_MS") {
            config.stop_grace = Duration::from_millis(parse_number("CARSINK_STOP_GRACE_MS", &ms)?);
        }
        if let Some(flag) = lookup("CARSINK_DISABLE_PAN") {
            config.disable_pan = parse_flag("CARSINK_DISABLE_PAN", &flag)?;
        }
        if let Some(flag) = lookup("CARSINK_DISCOVERY") {
            config.discovery = parse_flag("CARSINK_DISCOVERY", &flag)?;
        }

        Ok(config)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, value))
}

fn positive_millis(key: &str, value: &str) -> Result<Duration> {
    let ms = parse_number(key, value)?;
    if ms == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_millis(ms))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{} must be a boolean, got {:?}", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.discoverable_for, Duration::from_secs(300));
        assert_eq!(config.position_interval, Duration::from_millis(1000));
        assert!(config.disable_pan);
        assert!(config.discovery);
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("CARSINK_SIDECAR", "/usr/libexec/bt-helper"),
            ("CARSINK_SIDECAR_ARGS", "--adapter hci1  --verbose"),
            ("CARSINK_DISCOVERABLE_SECS", "120"),
            ("CARSINK_POSITION_INTERVAL_MS", "500"),
            ("CARSINK_REPLY_TIMEOUT_MS", "750"),
            ("CARSINK_STOP_GRACE_MS", "0"),
            ("CARSINK_DISABLE_PAN", "off"),
            ("CARSINK_DISCOVERY", "No"),
        ]))
        .unwrap();

        assert_eq!(config.sidecar_command, "/usr/libexec/bt-helper");
        assert_eq!(config.sidecar_args, vec!["--adapter", "hci1", "--verbose"]);
        assert_eq!(config.discoverable_for, Duration::from_secs(120));
        assert_eq!(config.position_interval, Duration::from_millis(500));
        assert_eq!(config.reply_timeout, Duration::from_millis(750));
        assert_eq!(config.stop_grace, Duration::ZERO);
        assert!(!config.disable_pan);
        assert!(!config.discovery);
    }

    #[test]
    fn rejects_bad_values_naming_the_variable() {
        let err = Config::from_lookup(lookup(&[("CARSINK_POSITION_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("CARSINK_POSITION_INTERVAL_MS"));

        let err = Config::from_lookup(lookup(&[("CARSINK_DISCOVERABLE_SECS", "five")])).unwrap_err();
        assert!(err.to_string().contains("CARSINK_DISCOVERABLE_SECS"));

        let err = Config::from_lookup(lookup(&[("CARSINK_DISCOVERY", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("CARSINK_DISCOVERY"));

        assert!(Config::from_lookup(lookup(&[("CARSINK_SIDECAR", "  ")])).is_err());
    }
}
