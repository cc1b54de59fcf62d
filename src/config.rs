//! Runtime configuration, loaded from the process environment.
//!
//! `VAPI_BRIDGE_ENV_FILE` (default `.env`) is read first with a small
//! hand-rolled parser matching the device firmware's existing `.env`
//! convention (not a general dotenv implementation): blank lines and `#`
//! comments are skipped, a leading `export ` is stripped, and a single pair
//! of matching quotes around the value is removed. Keys already present in
//! the process environment are never overwritten by the file.

use std::path::Path;

use crate::error::{BridgeError, Result};

fn load_env_file(path: &str) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return,
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            let first = bytes[0];
            let last = bytes[bytes.len() - 1];
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                value = &value[1..value.len() - 1];
            }
        }
        // SAFETY: single-threaded at startup, before any other task reads env vars.
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn getenv_int(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| BridgeError::config(format!("{name} must be an integer, got {value:?}"))),
        _ => Ok(default),
    }
}

fn getenv_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| BridgeError::config(format!("{name} must be a number, got {value:?}"))),
        _ => Ok(default),
    }
}

/// Fully resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub vapi_private_api_key: String,
    pub vapi_assistant_id: String,

    pub udp_bind_host: String,
    pub udp_port: u16,

    /// Fixed for now; see spec.md §6.
    pub vapi_sample_rate: u32,

    pub device_speaker_sample_rate: u32,
    pub device_speaker_bits_per_sample: u32,
    pub device_speaker_channels: u8,

    pub idle_timeout_s: f64,
    pub voice_rms_threshold: u32,
}

impl Config {
    /// Load configuration from the environment, first merging in the
    /// optional env file named by `VAPI_BRIDGE_ENV_FILE`.
    pub fn from_env() -> Result<Self> {
        let env_file = std::env::var("VAPI_BRIDGE_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
        if Path::new(&env_file).is_file() {
            load_env_file(&env_file);
        }

        let vapi_private_api_key = std::env::var("VAPI_PRIVATE_API_KEY").unwrap_or_default();
        let vapi_assistant_id = std::env::var("VAPI_ASSISTANT_ID").unwrap_or_default();
        if vapi_private_api_key.trim().is_empty() {
            return Err(BridgeError::config("missing env var: VAPI_PRIVATE_API_KEY"));
        }
        if vapi_assistant_id.trim().is_empty() {
            return Err(BridgeError::config("missing env var: VAPI_ASSISTANT_ID"));
        }

        let udp_port = getenv_int("VAPI_BRIDGE_UDP_PORT", 9123)?;
        let udp_port = u16::try_from(udp_port)
            .map_err(|_| BridgeError::config("VAPI_BRIDGE_UDP_PORT out of range"))?;

        Ok(Config {
            vapi_private_api_key,
            vapi_assistant_id,
            udp_bind_host: std::env::var("VAPI_BRIDGE_UDP_BIND_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            udp_port,
            vapi_sample_rate: 16000,
            device_speaker_sample_rate: 16000,
            device_speaker_bits_per_sample: 16,
            device_speaker_channels: 2,
            idle_timeout_s: getenv_f64("VAPI_BRIDGE_IDLE_TIMEOUT_S", 20.0)?,
            voice_rms_threshold: getenv_int("VAPI_BRIDGE_VOICE_RMS_THRESHOLD", 500)?,
        })
    }
}
