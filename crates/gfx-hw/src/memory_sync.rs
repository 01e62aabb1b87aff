use gfx_cmdbuf::{ChainEncoder, Result};

use crate::commands::{
    emit, pipe_control_bits, size_of, CompareOperation, MiBatchBufferEnd, MiBatchBufferStart,
    MiSemaphoreWait, MiStoreDataImm, PipeControl, PostSyncOperation,
};
use crate::CommandSink;

/// Cache and TLB operations of one pipe control. Every pipe control also stalls the
/// command streamer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeControlArgs {
    pub dc_flush: bool,
    pub texture_cache_invalidation: bool,
    pub instruction_cache_invalidation: bool,
    pub tlb_invalidation: bool,
    pub notify_enable: bool,
}

impl PipeControlArgs {
    fn flags(&self) -> u32 {
        let mut flags = pipe_control_bits::COMMAND_STREAMER_STALL_ENABLE;
        if self.dc_flush {
            flags |= pipe_control_bits::DC_FLUSH_ENABLE;
        }
        if self.texture_cache_invalidation {
            flags |= pipe_control_bits::TEXTURE_CACHE_INVALIDATION_ENABLE;
        }
        if self.instruction_cache_invalidation {
            flags |= pipe_control_bits::INSTRUCTION_CACHE_INVALIDATE_ENABLE;
        }
        if self.tlb_invalidation {
            flags |= pipe_control_bits::TLB_INVALIDATE;
        }
        if self.notify_enable {
            flags |= pipe_control_bits::NOTIFY_ENABLE;
        }
        flags
    }
}

pub fn pipe_control_size() -> usize {
    size_of::<PipeControl>()
}

pub fn program_pipe_control(sink: &mut dyn CommandSink, args: PipeControlArgs) -> Result<()> {
    emit(sink, &PipeControl::new(args.flags()))
}

/// Pipe control whose post-sync operation writes `immediate` to `address` once all prior
/// work retired.
pub fn program_pipe_control_with_post_sync(
    sink: &mut dyn CommandSink,
    args: PipeControlArgs,
    address: u64,
    immediate: u64,
) -> Result<()> {
    emit(
        sink,
        &PipeControl::new(args.flags()).with_post_sync(
            PostSyncOperation::WriteImmediateData,
            address,
            immediate,
        ),
    )
}

pub fn semaphore_wait_size() -> usize {
    size_of::<MiSemaphoreWait>()
}

/// Stall the engine until the dword at `address` is at least `value`.
pub fn program_semaphore_wait(sink: &mut dyn CommandSink, address: u64, value: u32) -> Result<()> {
    emit(
        sink,
        &MiSemaphoreWait::new(address, value, CompareOperation::GreaterThanOrEqual),
    )
}

pub fn store_data_imm_size() -> usize {
    size_of::<MiStoreDataImm>()
}

pub fn program_store_data_imm(sink: &mut dyn CommandSink, address: u64, value: u32) -> Result<()> {
    emit(sink, &MiStoreDataImm::new(address, value))
}

pub fn batch_buffer_end_size() -> usize {
    size_of::<MiBatchBufferEnd>()
}

pub fn batch_buffer_start_size() -> usize {
    size_of::<MiBatchBufferStart>()
}

pub fn program_batch_buffer_end(sink: &mut dyn CommandSink) -> Result<()> {
    emit(sink, &MiBatchBufferEnd::new())
}

pub fn program_batch_buffer_start(sink: &mut dyn CommandSink, address: u64) -> Result<()> {
    emit(sink, &MiBatchBufferStart::new(address))
}

/// Closes a full command-buffer segment with a jump into the next one.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchBufferChain;

impl ChainEncoder for BatchBufferChain {
    fn chain_size(&self) -> usize {
        batch_buffer_start_size()
    }

    fn encode_chain(&self, dst: &mut [u8], target_gpu_address: u64) {
        dst.copy_from_slice(bytemuck::bytes_of(&MiBatchBufferStart::new(target_gpu_address)));
    }
}
