use serde::{Deserialize, Serialize};

use crate::{GfxCoreFamily, PreemptionMode};

/// Per-SKU workarounds consumed by the command-stream core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkaroundTable {
    /// Mid-thread preemption needs GPR0 toggled around every GPGPU walker.
    pub wa_modify_vfe_state_after_gpgpu_preemption: bool,
    /// Allows thread-group preemption for kernels using fences on read/write images.
    pub wa_disable_lsqcroperf_for_ocl: bool,
}

/// Device description handed in by device enumeration. Treated as configuration data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub family: GfxCoreFamily,
    pub device_name: String,
    pub default_preemption_mode: PreemptionMode,
    pub slice_count: u32,
    pub dss_count: u32,
    /// Zero when the SKU has no per-DSS backed buffer.
    pub per_dss_backed_buffer_size: u64,
    /// Size of the system routine used for mid-thread preemption.
    pub sip_kernel_size: u64,
    #[serde(default)]
    pub workarounds: WorkaroundTable,
}

impl HardwareInfo {
    pub fn for_family(family: GfxCoreFamily) -> Self {
        match family {
            GfxCoreFamily::Gen9 => Self {
                family,
                device_name: "gen9-gt2".to_string(),
                default_preemption_mode: PreemptionMode::MidThread,
                slice_count: 1,
                dss_count: 3,
                per_dss_backed_buffer_size: 0,
                sip_kernel_size: 0x1000,
                workarounds: WorkaroundTable {
                    wa_modify_vfe_state_after_gpgpu_preemption: true,
                    wa_disable_lsqcroperf_for_ocl: true,
                },
            },
            GfxCoreFamily::Gen11 => Self {
                family,
                device_name: "gen11-gt2".to_string(),
                default_preemption_mode: PreemptionMode::MidThread,
                slice_count: 1,
                dss_count: 4,
                per_dss_backed_buffer_size: 0,
                sip_kernel_size: 0x1000,
                workarounds: WorkaroundTable {
                    wa_modify_vfe_state_after_gpgpu_preemption: true,
                    wa_disable_lsqcroperf_for_ocl: false,
                },
            },
            GfxCoreFamily::Gen12Lp => Self {
                family,
                device_name: "gen12lp-gt2".to_string(),
                default_preemption_mode: PreemptionMode::ThreadGroup,
                slice_count: 1,
                dss_count: 6,
                per_dss_backed_buffer_size: 0,
                sip_kernel_size: 0x2000,
                workarounds: WorkaroundTable::default(),
            },
            GfxCoreFamily::XeHpg => Self {
                family,
                device_name: "xe-hpg".to_string(),
                default_preemption_mode: PreemptionMode::ThreadGroup,
                slice_count: 2,
                dss_count: 16,
                per_dss_backed_buffer_size: 0x1_0000,
                sip_kernel_size: 0x2000,
                workarounds: WorkaroundTable::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_json_with_default_workarounds() {
        let json = r#"{
            "family": "Gen12Lp",
            "device_name": "custom",
            "default_preemption_mode": "MidBatch",
            "slice_count": 1,
            "dss_count": 2,
            "per_dss_backed_buffer_size": 0,
            "sip_kernel_size": 4096
        }"#;
        let info: HardwareInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.family, GfxCoreFamily::Gen12Lp);
        assert_eq!(info.default_preemption_mode, PreemptionMode::MidBatch);
        assert_eq!(info.workarounds, WorkaroundTable::default());
    }

    #[test]
    fn gen9_defaults_carry_the_gpgpu_preemption_workaround() {
        let info = HardwareInfo::for_family(GfxCoreFamily::Gen9);
        assert!(info.workarounds.wa_modify_vfe_state_after_gpgpu_preemption);
        assert_eq!(info.default_preemption_mode, PreemptionMode::MidThread);
    }
}
