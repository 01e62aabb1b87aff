use std::path::Path;

use gfx_csr::{ConfigError, CsrConfig};
use gfx_hw::{GfxCoreFamily, HardwareInfo};
use gfx_pagefault::PageFaultConfig;
use serde::{Deserialize, Serialize};

/// How CPU access to GPU-owned unified memory is trapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFaultBackend {
    /// No page fault manager; unified allocations are unavailable.
    Disabled,
    /// `mprotect` plus the process-wide `SIGSEGV` handler.
    #[default]
    Host,
    /// Protection calls are recorded only and faults are delivered through
    /// [`gfx_pagefault::dispatch_fault`].
    Manual,
}

/// Everything an [`ExecutionEnvironment`](crate::ExecutionEnvironment) is built from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// One entry per root device, in root-device-index order.
    pub root_devices: Vec<HardwareInfo>,
    pub csr: CsrConfig,
    pub page_fault_backend: PageFaultBackend,
    pub page_faults: PageFaultConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            root_devices: vec![HardwareInfo::for_family(GfxCoreFamily::Gen12Lp)],
            csr: CsrConfig::default(),
            page_fault_backend: PageFaultBackend::default(),
            page_faults: PageFaultConfig::default(),
        }
    }
}

impl EnvironmentConfig {
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

    /// Apply `GFX_UMD_*` overrides. `GFX_UMD_ROOT_DEVICES` is a comma-separated list of
    /// families (`Gen9,XeHpg`); the CSR keys are handled by [`CsrConfig::apply_env`].
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = lookup("GFX_UMD_ROOT_DEVICES") {
            self.root_devices = value
                .split(',')
                .map(|name| parse_family(name.trim()))
                .collect::<Option<Vec<_>>>()
                .filter(|families| !families.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "GFX_UMD_ROOT_DEVICES",
                    value: value.clone(),
                })?
                .into_iter()
                .map(HardwareInfo::for_family)
                .collect();
        }
        if let Some(value) = lookup("GFX_UMD_PAGE_FAULT_BACKEND") {
            self.page_fault_backend =
                serde_json::from_value(serde_json::Value::String(value.trim().to_string()))
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "GFX_UMD_PAGE_FAULT_BACKEND",
                        value,
                    })?;
        }
        self.csr.apply_env(lookup)
    }
}

fn parse_family(name: &str) -> Option<GfxCoreFamily> {
    GfxCoreFamily::ALL
        .into_iter()
        .find(|family| format!("{family:?}").eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfx_csr::DispatchMode;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_selects_root_devices_and_backend() {
        let mut config = EnvironmentConfig::default();
        config
            .apply_env(env(&[
                ("GFX_UMD_ROOT_DEVICES", "gen9, XeHpg"),
                ("GFX_UMD_PAGE_FAULT_BACKEND", "manual"),
                ("GFX_UMD_DISPATCH_MODE", "batched"),
            ]))
            .unwrap();

        let families: Vec<_> = config.root_devices.iter().map(|hw| hw.family).collect();
        assert_eq!(families, vec![GfxCoreFamily::Gen9, GfxCoreFamily::XeHpg]);
        assert_eq!(config.page_fault_backend, PageFaultBackend::Manual);
        assert_eq!(config.csr.dispatch_mode, DispatchMode::Batched);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let mut config = EnvironmentConfig::default();
        let err = config
            .apply_env(env(&[("GFX_UMD_ROOT_DEVICES", "gen9,gen42")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "GFX_UMD_ROOT_DEVICES",
                ..
            }
        ));
        assert_eq!(config.root_devices.len(), 1);
    }

    #[test]
    fn partial_json_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "page_fault_backend": "disabled", "page_faults": {{ "max_tracked_ranges": 16 }} }}"#
        )
        .unwrap();

        let config = EnvironmentConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.page_fault_backend, PageFaultBackend::Disabled);
        assert_eq!(config.page_faults.max_tracked_ranges, 16);
        assert!(config.page_faults.install_signal_handler);
        assert_eq!(config.root_devices, EnvironmentConfig::default().root_devices);
    }
}
