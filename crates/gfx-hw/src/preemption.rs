//! Preemption-mode programming.
//!
//! Every `*_size` function returns exactly the number of bytes its `program_*` counterpart
//! writes for the same arguments; the CSR sizes its stream with the former and relies on it.

use bitflags::bitflags;
use gfx_cmdbuf::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::commands::{emit, size_of, MiLoadRegisterImm, StateSip};
use crate::{CommandSink, GfxFamily, HardwareInfo};

/// Ordered from least to most fine-grained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreemptionMode {
    /// Never programmed; only used as the CSR's starting state.
    Initial,
    Disabled,
    MidBatch,
    ThreadGroup,
    MidThread,
}

impl PreemptionMode {
    pub const ALL: [PreemptionMode; 5] = [
        PreemptionMode::Initial,
        PreemptionMode::Disabled,
        PreemptionMode::MidBatch,
        PreemptionMode::ThreadGroup,
        PreemptionMode::MidThread,
    ];
}

bitflags! {
    /// Kernel and device properties that restrict the preemption granularity of a dispatch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PreemptionFlags: u32 {
        const DISABLED_MID_THREAD_PREEMPTION_KERNEL = 1 << 0;
        const VME_KERNEL = 1 << 1;
        const DEVICE_SUPPORTS_VME_MID_THREAD_PREEMPTION = 1 << 2;
        const USES_FENCES_FOR_READ_WRITE_IMAGES = 1 << 3;
        const DISABLE_LSQCROPERF_FOR_OCL = 1 << 4;
        const SCHEDULER_KERNEL = 1 << 5;
        const DISABLE_PER_CTXT_PREEMPTION_GRANULARITY_CONTROL = 1 << 6;
    }
}

/// Register layout of the preemption-control MMIO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreemptionRegisters {
    pub mmio_address: u32,
    pub mask: u32,
    pub mid_thread: u32,
    pub thread_group: u32,
    pub command_level: u32,
}

impl PreemptionRegisters {
    pub const DEFAULT: PreemptionRegisters = PreemptionRegisters {
        mmio_address: 0x2580,
        mask: ((1 << 1) | (1 << 2)) << 16,
        mid_thread: 0,
        thread_group: 1 << 1,
        command_level: 1 << 2,
    };

    pub fn value_for(&self, mode: PreemptionMode) -> u32 {
        let granularity = match mode {
            PreemptionMode::MidThread => self.mid_thread,
            PreemptionMode::ThreadGroup => self.thread_group,
            PreemptionMode::Initial | PreemptionMode::Disabled | PreemptionMode::MidBatch => {
                self.command_level
            }
        };
        granularity | self.mask
    }
}

/// General purpose register 0 of the render command streamer.
pub const CS_GPR_R0: u32 = 0x2600;

fn allows_preemption(mode: PreemptionMode) -> bool {
    mode > PreemptionMode::Disabled
}

fn allows_mid_thread(flags: PreemptionFlags) -> bool {
    let vme_blocks = flags.contains(PreemptionFlags::VME_KERNEL)
        && !flags.contains(PreemptionFlags::DEVICE_SUPPORTS_VME_MID_THREAD_PREEMPTION);
    !flags.contains(PreemptionFlags::DISABLED_MID_THREAD_PREEMPTION_KERNEL) && !vme_blocks
}

fn allows_thread_group(flags: PreemptionFlags) -> bool {
    let fences_ok = !flags.contains(PreemptionFlags::USES_FENCES_FOR_READ_WRITE_IMAGES)
        || flags.contains(PreemptionFlags::DISABLE_LSQCROPERF_FOR_OCL);
    fences_ok
        && !flags.contains(PreemptionFlags::SCHEDULER_KERNEL)
        && !flags.contains(PreemptionFlags::DISABLE_PER_CTXT_PREEMPTION_GRANULARITY_CONTROL)
}

/// Finest mode both the device and the kernel allow.
pub fn task_preemption_mode(device_mode: PreemptionMode, flags: PreemptionFlags) -> PreemptionMode {
    if !allows_preemption(device_mode) {
        return device_mode;
    }
    if device_mode == PreemptionMode::MidThread && allows_mid_thread(flags) {
        return PreemptionMode::MidThread;
    }
    if device_mode >= PreemptionMode::ThreadGroup && allows_thread_group(flags) {
        return PreemptionMode::ThreadGroup;
    }
    PreemptionMode::MidBatch
}

pub fn required_cmd_stream_size(new_mode: PreemptionMode, old_mode: PreemptionMode) -> usize {
    if new_mode == old_mode {
        return 0;
    }
    size_of::<MiLoadRegisterImm>()
}

pub fn program_cmd_stream(
    sink: &mut dyn CommandSink,
    family: &dyn GfxFamily,
    new_mode: PreemptionMode,
    old_mode: PreemptionMode,
) -> Result<()> {
    if new_mode == old_mode {
        return Ok(());
    }
    let registers = family.preemption_registers();
    trace!(family = family.name(), ?old_mode, ?new_mode, "preemption mode");
    emit(
        sink,
        &MiLoadRegisterImm::new(registers.mmio_address, registers.value_for(new_mode)),
    )
}

/// One-time preamble bytes: the system routine pointer for mid-thread preemption.
pub fn required_preamble_size(mode: PreemptionMode) -> usize {
    match mode {
        PreemptionMode::MidThread => size_of::<StateSip>(),
        _ => 0,
    }
}

pub fn program_preamble(
    sink: &mut dyn CommandSink,
    mode: PreemptionMode,
    sip_address: u64,
) -> Result<()> {
    if mode == PreemptionMode::MidThread {
        trace!(sip_address, "state sip");
        emit(sink, &StateSip::new(sip_address))?;
    }
    Ok(())
}

/// Bytes added around one walker (begin plus end) by the GPGPU preemption workaround.
pub fn preemption_wa_cs_size(hw_info: &HardwareInfo, mode: PreemptionMode) -> usize {
    if mode == PreemptionMode::MidThread
        && hw_info.workarounds.wa_modify_vfe_state_after_gpgpu_preemption
    {
        2 * size_of::<MiLoadRegisterImm>()
    } else {
        0
    }
}

pub fn apply_preemption_wa_cmds_begin(
    sink: &mut dyn CommandSink,
    hw_info: &HardwareInfo,
    mode: PreemptionMode,
) -> Result<()> {
    if preemption_wa_cs_size(hw_info, mode) > 0 {
        emit(sink, &MiLoadRegisterImm::new(CS_GPR_R0, 0xFFFF_FFFF))?;
    }
    Ok(())
}

pub fn apply_preemption_wa_cmds_end(
    sink: &mut dyn CommandSink,
    hw_info: &HardwareInfo,
    mode: PreemptionMode,
) -> Result<()> {
    if preemption_wa_cs_size(hw_info, mode) > 0 {
        emit(sink, &MiLoadRegisterImm::new(CS_GPR_R0, 0))?;
    }
    Ok(())
}
