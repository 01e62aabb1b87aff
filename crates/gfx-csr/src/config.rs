//! CSR configuration.
//!
//! Defaults are explicit; [`CsrConfig::apply_env`] layers `GFX_UMD_*` overrides on top of a
//! value loaded from JSON or built in code.

use std::path::Path;
use std::time::Duration;

use gfx_hw::ComputeModeTriggers;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Every flush is submitted on its own.
    #[default]
    Immediate,
    /// Flushes accumulate and are submitted together as one contiguous stream.
    Batched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// When false the KMD wait is unbounded.
    pub enable_timeout: bool,
    /// How long the tag is polled before falling back to the KMD wait.
    pub poll_timeout_us: u64,
    pub kmd_wait_timeout_us: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            enable_timeout: true,
            poll_timeout_us: 2_000,
            kmd_wait_timeout_us: 5_000_000,
        }
    }
}

impl WaitConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_micros(self.poll_timeout_us)
    }

    pub fn kmd_wait_timeout(&self) -> Option<Duration> {
        self.enable_timeout
            .then(|| Duration::from_micros(self.kmd_wait_timeout_us))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrConfig {
    pub dispatch_mode: DispatchMode,
    pub wait: WaitConfig,
    /// Tags per pool page handed out by the timestamp-packet allocator.
    pub tag_pool_size: usize,
    /// Minimum usable bytes of each command-buffer segment.
    pub command_buffer_size: u64,
    /// Batched mode: submit after this many enqueues. Zero disables the trigger.
    pub implicit_flush_every: u32,
    /// Batched mode: submit as soon as the engine reports idle.
    pub flush_on_gpu_idle: bool,
    /// Overrides the family's compute-mode diff policy.
    pub compute_mode_triggers: Option<ComputeModeTriggers>,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Immediate,
            wait: WaitConfig::default(),
            tag_pool_size: 2048,
            command_buffer_size: 64 * 1024,
            implicit_flush_every: 0,
            flush_on_gpu_idle: false,
            compute_mode_triggers: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "on" => Ok(true),
        "0" | "false" | "FALSE" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

impl CsrConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Default configuration with the process environment applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("GFX_UMD_DISPATCH_MODE") {
            self.dispatch_mode = match value.trim().to_ascii_lowercase().as_str() {
                "immediate" => DispatchMode::Immediate,
                "batched" => DispatchMode::Batched,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GFX_UMD_DISPATCH_MODE",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("GFX_UMD_ENABLE_TIMEOUT") {
            self.wait.enable_timeout = parse_bool("GFX_UMD_ENABLE_TIMEOUT", value)?;
        }
        if let Some(us) = parse_env(&lookup, "GFX_UMD_POLL_TIMEOUT_US")? {
            self.wait.poll_timeout_us = us;
        }
        if let Some(us) = parse_env(&lookup, "GFX_UMD_KMD_WAIT_TIMEOUT_US")? {
            self.wait.kmd_wait_timeout_us = us;
        }
        if let Some(every) = parse_env(&lookup, "GFX_UMD_IMPLICIT_FLUSH_EVERY")? {
            self.implicit_flush_every = every;
        }
        if let Some(size) = parse_env(&lookup, "GFX_UMD_TAG_POOL_SIZE")? {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "GFX_UMD_TAG_POOL_SIZE",
                    value: "0".to_string(),
                });
            }
            self.tag_pool_size = size;
        }
        if let Some(value) = lookup("GFX_UMD_COMPUTE_MODE_TRIGGERS") {
            let triggers = bitflags::parser::from_str::<ComputeModeTriggers>(value.trim())
                .map_err(|_| ConfigError::InvalidValue {
                    key: "GFX_UMD_COMPUTE_MODE_TRIGGERS",
                    value,
                })?;
            self.compute_mode_triggers = Some(triggers);
        }
        Ok(())
    }
}
