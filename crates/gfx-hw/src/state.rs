//! Preamble and state-transition commands.

use bitflags::bitflags;
use gfx_cmdbuf::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::commands::{
    compute_mode_bits, emit, pipeline_select_bits, size_of, MiLoadRegisterImm, PipeControl,
    PipelineSelect, StateBaseAddress, StateComputeMode,
};
use crate::memory_sync::{program_pipe_control, PipeControlArgs};
use crate::{CommandSink, GfxFamily};

pub const L3CNTL_REGISTER: u32 = 0x7034;
pub const DEBUG_CONTROL_REG2: u32 = 0xE404;

pub const DEFAULT_GRF_NUMBER: u32 = 128;
pub const LARGE_GRF_NUMBER: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L3CachingSettings {
    NotApplicable,
    L3CacheOn,
    L3CacheOff,
    L3AndL1On,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadArbitrationPolicy {
    AgeBased,
    RoundRobin,
    RoundRobinAfterDependency,
    /// Keep whatever policy is currently programmed.
    NotPresent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PipelineSelectArgs {
    pub special_pipeline_select_mode: bool,
    pub media_sampler_required: bool,
}

bitflags! {
    /// Which "changed since last dispatch" flags make the CSR emit a compute-mode command.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ComputeModeTriggers: u32 {
        const COHERENCY = 1 << 0;
        const NUM_GRF = 1 << 1;
        const SHARED_HANDLES = 1 << 2;
    }
}

pub fn pipeline_select_size(family: &dyn GfxFamily) -> usize {
    let mut size = size_of::<PipelineSelect>();
    if family.pipe_control_prior_to_pipeline_select() {
        size += size_of::<PipeControl>();
    }
    size
}

pub fn program_pipeline_select(
    sink: &mut dyn CommandSink,
    family: &dyn GfxFamily,
    args: PipelineSelectArgs,
) -> Result<()> {
    if family.pipe_control_prior_to_pipeline_select() {
        program_pipe_control(
            sink,
            PipeControlArgs {
                texture_cache_invalidation: true,
                ..PipeControlArgs::default()
            },
        )?;
    }

    let mut mask = pipeline_select_bits::PIPELINE_MASK;
    let mut value = pipeline_select_bits::PIPELINE_GPGPU;
    if family.supports_media_sampler_dop_gating() {
        mask |= pipeline_select_bits::MEDIA_SAMPLER_DOP_CLOCK_GATE_ENABLE;
        if !args.media_sampler_required {
            value |= pipeline_select_bits::MEDIA_SAMPLER_DOP_CLOCK_GATE_ENABLE;
        }
    }
    if family.supports_special_pipeline_select() {
        mask |= pipeline_select_bits::SYSTOLIC_MODE_ENABLE;
        if args.special_pipeline_select_mode {
            value |= pipeline_select_bits::SYSTOLIC_MODE_ENABLE;
        }
    }
    trace!(family = family.name(), mask, value, "pipeline select");
    emit(sink, &PipelineSelect::new(mask, value))
}

pub fn l3_config_size(family: &dyn GfxFamily, use_slm: bool) -> usize {
    match family.l3_config(use_slm) {
        Some(_) => size_of::<MiLoadRegisterImm>(),
        None => 0,
    }
}

pub fn program_l3(sink: &mut dyn CommandSink, family: &dyn GfxFamily, use_slm: bool) -> Result<()> {
    match family.l3_config(use_slm) {
        Some(value) => {
            trace!(family = family.name(), use_slm, value, "l3 config");
            emit(sink, &MiLoadRegisterImm::new(L3CNTL_REGISTER, value))
        }
        None => Ok(()),
    }
}

pub fn thread_arbitration_size(family: &dyn GfxFamily, policy: ThreadArbitrationPolicy) -> usize {
    match family.thread_arbitration_value(policy) {
        Some(_) => size_of::<MiLoadRegisterImm>(),
        None => 0,
    }
}

pub fn program_thread_arbitration(
    sink: &mut dyn CommandSink,
    family: &dyn GfxFamily,
    policy: ThreadArbitrationPolicy,
) -> Result<()> {
    match family.thread_arbitration_value(policy) {
        Some(value) => {
            trace!(family = family.name(), ?policy, value, "thread arbitration");
            emit(sink, &MiLoadRegisterImm::new(DEBUG_CONTROL_REG2, value))
        }
        None => Ok(()),
    }
}

pub fn compute_mode_size(family: &dyn GfxFamily) -> usize {
    if family.supports_compute_mode() {
        size_of::<StateComputeMode>()
    } else {
        0
    }
}

pub fn program_compute_mode(
    sink: &mut dyn CommandSink,
    family: &dyn GfxFamily,
    requires_coherency: bool,
    num_grf_required: u32,
) -> Result<()> {
    if !family.supports_compute_mode() {
        return Ok(());
    }
    let mut mask = compute_mode_bits::FORCE_NON_COHERENT_MASK;
    let mut value = 0;
    if !requires_coherency {
        value |= compute_mode_bits::FORCE_GPU_NON_COHERENT;
    }
    if family.supports_large_grf_mode() {
        mask |= compute_mode_bits::LARGE_GRF_MODE;
        if num_grf_required > DEFAULT_GRF_NUMBER {
            value |= compute_mode_bits::LARGE_GRF_MODE;
        }
    }
    trace!(
        family = family.name(),
        requires_coherency,
        num_grf_required,
        value,
        "compute mode"
    );
    emit(sink, &StateComputeMode::new(mask, value))
}

/// Stalling flush plus the state-base-address command it protects.
pub fn state_base_address_size() -> usize {
    size_of::<PipeControl>() + size_of::<StateBaseAddress>()
}

pub fn program_state_base_address(
    sink: &mut dyn CommandSink,
    general_state_base: u64,
    mocs_index: u32,
) -> Result<()> {
    trace!(general_state_base, mocs_index, "state base address");
    program_pipe_control(
        sink,
        PipeControlArgs {
            dc_flush: true,
            texture_cache_invalidation: true,
            ..PipeControlArgs::default()
        },
    )?;
    emit(sink, &StateBaseAddress::new(general_state_base, mocs_index))
}
