use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use crate::{errors::Error, retry::Backoff, Result};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Typed configuration for the bridge. Read-only once the bridge is built.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    // Backend
    pub base_url: String,
    pub send_path: String,
    pub events_path: String,

    // Outbound retries
    pub max_retry: u32,
    pub retry_delay: Duration,
    pub retry_backoff: Backoff,

    // Timeouts
    pub request_timeout: Duration,
    pub stream_read_timeout: Duration,

    // Stream reconnects
    pub reconnect_backoff: Backoff,

    pub dead_letter_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            send_path: "/send".to_string(),
            events_path: "/events".to_string(),
            max_retry: 5,
            retry_delay: Duration::from_secs(300),
            retry_backoff: Backoff::new(Duration::from_millis(1000), Duration::from_millis(60_000)),
            request_timeout: Duration::from_secs(30),
            stream_read_timeout: Duration::from_secs(80),
            reconnect_backoff: Backoff::new(
                Duration::from_millis(500),
                Duration::from_millis(30_000),
            ),
            dead_letter_capacity: 1000,
        }
    }
}

impl BridgeConfig {
    /// Load from the environment, falling back to `.env` for unset keys.
    /// The process environment is never modified.
    pub fn load() -> Result<Self> {
        let dotenv = read_dotenv(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    /// Build from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);
        let get_u64 = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|s| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("{key}: {e}")))
                })
                .transpose()
        };

        let base_url = normalize_base_url(
            get("BRIDGE_BASE_URL")
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL),
        )?;
        let send_path = normalize_path(get("BRIDGE_SEND_PATH").unwrap_or(defaults.send_path));
        let events_path =
            normalize_path(get("BRIDGE_EVENTS_PATH").unwrap_or(defaults.events_path));

        let max_retry = match get_u64("BRIDGE_MAX_RETRY")? {
            Some(v) => u32::try_from(v)
                .map_err(|_| Error::Config(format!("BRIDGE_MAX_RETRY out of range: {v}")))?,
            None => defaults.max_retry,
        };
        let retry_delay = get_u64("BRIDGE_RETRY_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry_delay);

        let retry_backoff = Backoff::new(
            get_u64("BRIDGE_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff.initial),
            get_u64("BRIDGE_RETRY_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff.max),
        );

        let request_timeout = get_u64("BRIDGE_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let stream_read_timeout = get_u64("BRIDGE_STREAM_READ_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.stream_read_timeout);
        if request_timeout.is_zero() || stream_read_timeout.is_zero() {
            return Err(Error::Config("timeouts must be greater than zero".to_string()));
        }

        let reconnect_backoff = Backoff::new(
            get_u64("BRIDGE_RECONNECT_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_backoff.initial),
            get_u64("BRIDGE_RECONNECT_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_backoff.max),
        );

        let dead_letter_capacity = get_u64("BRIDGE_DEAD_LETTER_CAPACITY")?
            .map(|v| v as usize)
            .unwrap_or(defaults.dead_letter_capacity);

        Ok(Self {
            base_url,
            send_path,
            events_path,
            max_retry,
            retry_delay,
            retry_backoff,
            request_timeout,
            stream_read_timeout,
            reconnect_backoff,
            dead_letter_capacity,
        })
    }

    pub fn send_url(&self) -> String {
        format!("{}{}", self.base_url, self.send_path)
    }

    pub fn events_url(&self) -> String {
        format!("{}{}", self.base_url, self.events_path)
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let url = raw.trim().trim_end_matches('/');
    let host = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| {
            Error::Config(format!(
                "BRIDGE_BASE_URL must be an http(s) URL, got {raw:?}"
            ))
        })?;
    if host.is_empty() {
        return Err(Error::Config("BRIDGE_BASE_URL has no host".to_string()));
    }
    Ok(url.to_string())
}

fn normalize_path(p: String) -> String {
    let p = p.trim();
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

fn read_dotenv(path: &Path) -> HashMap<String, String> {
    fs::read_to_string(path)
        .map(|contents| parse_dotenv(&contents))
        .unwrap_or_default()
}

/// `KEY=value` pairs; blank lines and `#` comments are skipped, and a value
/// wrapped in matching single or double quotes is unquoted.
fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.trim().trim_start_matches("export ").trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
                .unwrap_or(value);
            Some((key.to_string(), unquoted.to_string()))
        })
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
