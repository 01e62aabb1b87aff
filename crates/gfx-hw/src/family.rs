//! Per-generation dispatch.
//!
//! The set of supported generations is closed, so each one is a unit struct implementing
//! [`GfxFamily`] and [`gfx_family`] indexes a static table with the enum discriminant.

use gfx_cmdbuf::Result;
use serde::{Deserialize, Serialize};

use crate::commands::{compute_mode_bits, emit, size_of, StateComputeMode};
use crate::memory_sync::{pipe_control_size, program_pipe_control, PipeControlArgs};
use crate::preemption::PreemptionRegisters;
use crate::state::{ComputeModeTriggers, L3CachingSettings, ThreadArbitrationPolicy};
use crate::CommandSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GfxCoreFamily {
    Gen9 = 0,
    Gen11 = 1,
    Gen12Lp = 2,
    XeHpg = 3,
}

impl GfxCoreFamily {
    pub const ALL: [GfxCoreFamily; 4] = [
        GfxCoreFamily::Gen9,
        GfxCoreFamily::Gen11,
        GfxCoreFamily::Gen12Lp,
        GfxCoreFamily::XeHpg,
    ];
}

/// Generation-specific values and encodings used by the command-stream core.
pub trait GfxFamily: Send + Sync {
    fn family(&self) -> GfxCoreFamily;

    fn name(&self) -> &'static str;

    fn preemption_registers(&self) -> PreemptionRegisters {
        PreemptionRegisters::DEFAULT
    }

    /// L3 cache configuration for the ring, or `None` when the KMD owns it.
    fn l3_config(&self, use_slm: bool) -> Option<u32>;

    fn mocs_index(&self, settings: L3CachingSettings) -> u32;

    fn supports_compute_mode(&self) -> bool {
        false
    }

    fn supports_large_grf_mode(&self) -> bool {
        false
    }

    /// Diff flags that trigger a compute-mode command when configuration does not override them.
    fn default_compute_mode_triggers(&self) -> ComputeModeTriggers {
        ComputeModeTriggers::empty()
    }

    fn supports_special_pipeline_select(&self) -> bool {
        false
    }

    fn supports_media_sampler_dop_gating(&self) -> bool {
        false
    }

    fn pipe_control_prior_to_pipeline_select(&self) -> bool {
        false
    }

    fn thread_arbitration_value(&self, policy: ThreadArbitrationPolicy) -> Option<u32> {
        match policy {
            ThreadArbitrationPolicy::AgeBased => Some(0x0),
            ThreadArbitrationPolicy::RoundRobin => Some(0x100),
            ThreadArbitrationPolicy::RoundRobinAfterDependency => Some(0x80),
            ThreadArbitrationPolicy::NotPresent => None,
        }
    }

    /// Commands appended after the payload when the dispatch asks for an epilogue.
    fn epilogue_size(&self) -> usize {
        0
    }

    fn program_epilogue(&self, _sink: &mut dyn CommandSink) -> Result<()> {
        Ok(())
    }
}

pub struct Gen9Family;
pub struct Gen11Family;
pub struct Gen12LpFamily;
pub struct XeHpgFamily;

impl GfxFamily for Gen9Family {
    fn family(&self) -> GfxCoreFamily {
        GfxCoreFamily::Gen9
    }

    fn name(&self) -> &'static str {
        "Gen9"
    }

    fn l3_config(&self, use_slm: bool) -> Option<u32> {
        Some(if use_slm { 0x6000_0321 } else { 0x8000_0340 })
    }

    fn mocs_index(&self, settings: L3CachingSettings) -> u32 {
        match settings {
            L3CachingSettings::L3CacheOff => 0,
            _ => 2,
        }
    }

    fn supports_media_sampler_dop_gating(&self) -> bool {
        true
    }

    fn pipe_control_prior_to_pipeline_select(&self) -> bool {
        true
    }
}

impl GfxFamily for Gen11Family {
    fn family(&self) -> GfxCoreFamily {
        GfxCoreFamily::Gen11
    }

    fn name(&self) -> &'static str {
        "Gen11"
    }

    fn l3_config(&self, use_slm: bool) -> Option<u32> {
        Some(if use_slm { 0xA000_0420 } else { 0xC000_0440 })
    }

    fn mocs_index(&self, settings: L3CachingSettings) -> u32 {
        match settings {
            L3CachingSettings::L3CacheOff => 0,
            _ => 2,
        }
    }

    fn supports_media_sampler_dop_gating(&self) -> bool {
        true
    }

    fn pipe_control_prior_to_pipeline_select(&self) -> bool {
        true
    }
}

impl GfxFamily for Gen12LpFamily {
    fn family(&self) -> GfxCoreFamily {
        GfxCoreFamily::Gen12Lp
    }

    fn name(&self) -> &'static str {
        "Gen12LP"
    }

    fn l3_config(&self, _use_slm: bool) -> Option<u32> {
        None
    }

    fn mocs_index(&self, settings: L3CachingSettings) -> u32 {
        match settings {
            L3CachingSettings::L3CacheOff => 0,
            L3CachingSettings::L3AndL1On => 6,
            _ => 4,
        }
    }

    fn supports_compute_mode(&self) -> bool {
        true
    }

    fn default_compute_mode_triggers(&self) -> ComputeModeTriggers {
        ComputeModeTriggers::COHERENCY | ComputeModeTriggers::SHARED_HANDLES
    }

    fn supports_special_pipeline_select(&self) -> bool {
        true
    }

    fn epilogue_size(&self) -> usize {
        pipe_control_size()
    }

    fn program_epilogue(&self, sink: &mut dyn CommandSink) -> Result<()> {
        program_pipe_control(sink, PipeControlArgs::default())
    }
}

impl GfxFamily for XeHpgFamily {
    fn family(&self) -> GfxCoreFamily {
        GfxCoreFamily::XeHpg
    }

    fn name(&self) -> &'static str {
        "XeHPG"
    }

    fn l3_config(&self, _use_slm: bool) -> Option<u32> {
        None
    }

    fn mocs_index(&self, settings: L3CachingSettings) -> u32 {
        match settings {
            L3CachingSettings::L3CacheOff => 0,
            L3CachingSettings::L3AndL1On => 8,
            _ => 6,
        }
    }

    fn supports_compute_mode(&self) -> bool {
        true
    }

    fn supports_large_grf_mode(&self) -> bool {
        true
    }

    fn default_compute_mode_triggers(&self) -> ComputeModeTriggers {
        ComputeModeTriggers::COHERENCY
            | ComputeModeTriggers::NUM_GRF
            | ComputeModeTriggers::SHARED_HANDLES
    }

    fn supports_special_pipeline_select(&self) -> bool {
        true
    }

    fn thread_arbitration_value(&self, policy: ThreadArbitrationPolicy) -> Option<u32> {
        match policy {
            ThreadArbitrationPolicy::AgeBased => Some(0x0),
            ThreadArbitrationPolicy::RoundRobin => Some(0x100),
            // No after-dependency variant; the engine falls back to round robin.
            ThreadArbitrationPolicy::RoundRobinAfterDependency => Some(0x100),
            ThreadArbitrationPolicy::NotPresent => None,
        }
    }

    /// Leave large-GRF mode off so the next context starts from the default.
    fn epilogue_size(&self) -> usize {
        size_of::<StateComputeMode>()
    }

    fn program_epilogue(&self, sink: &mut dyn CommandSink) -> Result<()> {
        emit(
            sink,
            &StateComputeMode::new(compute_mode_bits::LARGE_GRF_MODE, 0),
        )
    }
}

static FAMILY_TABLE: [&(dyn GfxFamily); 4] =
    [&Gen9Family, &Gen11Family, &Gen12LpFamily, &XeHpgFamily];

pub fn gfx_family(family: GfxCoreFamily) -> &'static dyn GfxFamily {
    FAMILY_TABLE[family as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_discriminant() {
        for family in GfxCoreFamily::ALL {
            assert_eq!(gfx_family(family).family(), family);
        }
    }

    #[test]
    fn epilogue_sizes_match_encoded_bytes() {
        for family in GfxCoreFamily::ALL.map(gfx_family) {
            let mut bytes: Vec<u8> = Vec::new();
            family.program_epilogue(&mut bytes).unwrap();
            assert_eq!(bytes.len(), family.epilogue_size(), "{}", family.name());
        }
    }

    #[test]
    fn compute_mode_capabilities_are_consistent() {
        for family in GfxCoreFamily::ALL.map(gfx_family) {
            if !family.supports_compute_mode() {
                assert!(family.default_compute_mode_triggers().is_empty());
                assert!(!family.supports_large_grf_mode());
            }
            if family
                .default_compute_mode_triggers()
                .contains(ComputeModeTriggers::NUM_GRF)
            {
                assert!(family.supports_large_grf_mode());
            }
        }
    }

    #[test]
    fn l3_off_selects_uncached_mocs() {
        for family in GfxCoreFamily::ALL.map(gfx_family) {
            assert_eq!(family.mocs_index(L3CachingSettings::L3CacheOff), 0);
            assert_ne!(family.mocs_index(L3CachingSettings::L3CacheOn), 0);
        }
    }
}
