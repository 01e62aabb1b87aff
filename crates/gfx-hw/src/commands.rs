//! DWORD command encodings used by the command-stream core.
//!
//! Layouts follow the hardware header conventions (command type in bits 31:29, MI opcode in
//! bits 28:23 or GFXPIPE pipeline/opcode/sub-opcode in bits 28:16, dword length minus two in
//! the low bits) but only carry the fields the core programs.

use bytemuck::{Pod, Zeroable};
use gfx_cmdbuf::{LinearStream, Result};

/// Destination for encoded commands: the CSR's own stream or a client payload buffer.
pub trait CommandSink {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()>;
}

impl CommandSink for LinearStream {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }
}

impl CommandSink for Vec<u8> {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

pub fn emit<C: Pod>(sink: &mut dyn CommandSink, command: &C) -> Result<()> {
    sink.put_bytes(bytemuck::bytes_of(command))
}

pub const fn size_of<C: Pod>() -> usize {
    std::mem::size_of::<C>()
}

const fn mi_header(opcode: u32, dword_length: u32) -> u32 {
    (opcode << 23) | dword_length
}

const fn gfxpipe_header(pipeline: u32, opcode: u32, sub_opcode: u32, dword_length: u32) -> u32 {
    (3 << 29) | (pipeline << 27) | (opcode << 24) | (sub_opcode << 16) | dword_length
}

fn lo(value: u64) -> u32 {
    value as u32
}

fn hi(value: u64) -> u32 {
    (value >> 32) as u32
}

pub(crate) fn join(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

pub const MI_NOOP: u32 = 0;

pub mod opcode {
    pub const MI_BATCH_BUFFER_END: u32 = 0x0A;
    pub const MI_SEMAPHORE_WAIT: u32 = 0x1C;
    pub const MI_STORE_DATA_IMM: u32 = 0x20;
    pub const MI_LOAD_REGISTER_IMM: u32 = 0x22;
    pub const MI_COPY_MEM_MEM: u32 = 0x2E;
    pub const MI_BATCH_BUFFER_START: u32 = 0x31;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferEnd {
    pub header: u32,
}

impl MiBatchBufferEnd {
    pub const HEADER: u32 = mi_header(opcode::MI_BATCH_BUFFER_END, 0);

    pub fn new() -> Self {
        Self {
            header: Self::HEADER,
        }
    }
}

impl Default for MiBatchBufferEnd {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiBatchBufferStart {
    pub header: u32,
    pub address_lo: u32,
    pub address_hi: u32,
}

impl MiBatchBufferStart {
    /// PPGTT address space select (bit 8).
    pub const HEADER: u32 = mi_header(opcode::MI_BATCH_BUFFER_START, 1) | (1 << 8);

    pub fn new(address: u64) -> Self {
        Self {
            header: Self::HEADER,
            address_lo: lo(address),
            address_hi: hi(address),
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_lo, self.address_hi)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiLoadRegisterImm {
    pub header: u32,
    pub register_offset: u32,
    pub data: u32,
}

impl MiLoadRegisterImm {
    pub const HEADER: u32 = mi_header(opcode::MI_LOAD_REGISTER_IMM, 1);

    pub fn new(register_offset: u32, data: u32) -> Self {
        Self {
            header: Self::HEADER,
            register_offset,
            data,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompareOperation {
    GreaterThan = 0,
    GreaterThanOrEqual = 1,
    LessThan = 2,
    LessThanOrEqual = 3,
    Equal = 4,
    NotEqual = 5,
}

impl CompareOperation {
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => Self::GreaterThan,
            1 => Self::GreaterThanOrEqual,
            2 => Self::LessThan,
            3 => Self::LessThanOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return None,
        })
    }

    /// `memory_value <op> semaphore_data`.
    pub fn evaluate(self, memory_value: u32, semaphore_data: u32) -> bool {
        match self {
            Self::GreaterThan => memory_value > semaphore_data,
            Self::GreaterThanOrEqual => memory_value >= semaphore_data,
            Self::LessThan => memory_value < semaphore_data,
            Self::LessThanOrEqual => memory_value <= semaphore_data,
            Self::Equal => memory_value == semaphore_data,
            Self::NotEqual => memory_value != semaphore_data,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiSemaphoreWait {
    pub header: u32,
    pub semaphore_data: u32,
    pub address_lo: u32,
    pub address_hi: u32,
}

impl MiSemaphoreWait {
    const POLLING_MODE: u32 = 1 << 15;

    pub fn new(address: u64, semaphore_data: u32, compare: CompareOperation) -> Self {
        Self {
            header: mi_header(opcode::MI_SEMAPHORE_WAIT, 2)
                | Self::POLLING_MODE
                | ((compare as u32) << 12),
            semaphore_data,
            address_lo: lo(address),
            address_hi: hi(address),
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_lo, self.address_hi)
    }

    pub fn compare_operation(&self) -> Option<CompareOperation> {
        CompareOperation::from_bits((self.header >> 12) & 0x7)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiStoreDataImm {
    pub header: u32,
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

impl MiStoreDataImm {
    pub const HEADER: u32 = mi_header(opcode::MI_STORE_DATA_IMM, 2);

    pub fn new(address: u64, data: u32) -> Self {
        Self {
            header: Self::HEADER,
            address_lo: lo(address),
            address_hi: hi(address),
            data,
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_lo, self.address_hi)
    }
}

/// Copies one dword from `source` to `destination`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MiCopyMemMem {
    pub header: u32,
    pub destination_lo: u32,
    pub destination_hi: u32,
    pub source_lo: u32,
    pub source_hi: u32,
}

impl MiCopyMemMem {
    pub const HEADER: u32 = mi_header(opcode::MI_COPY_MEM_MEM, 3);

    pub fn new(destination: u64, source: u64) -> Self {
        Self {
            header: Self::HEADER,
            destination_lo: lo(destination),
            destination_hi: hi(destination),
            source_lo: lo(source),
            source_hi: hi(source),
        }
    }

    pub fn destination(&self) -> u64 {
        join(self.destination_lo, self.destination_hi)
    }

    pub fn source(&self) -> u64 {
        join(self.source_lo, self.source_hi)
    }
}

pub mod pipe_control_bits {
    pub const DC_FLUSH_ENABLE: u32 = 1 << 5;
    pub const NOTIFY_ENABLE: u32 = 1 << 8;
    pub const TEXTURE_CACHE_INVALIDATION_ENABLE: u32 = 1 << 10;
    pub const INSTRUCTION_CACHE_INVALIDATE_ENABLE: u32 = 1 << 11;
    pub const POST_SYNC_SHIFT: u32 = 14;
    pub const POST_SYNC_MASK: u32 = 0x3 << POST_SYNC_SHIFT;
    pub const TLB_INVALIDATE: u32 = 1 << 18;
    pub const COMMAND_STREAMER_STALL_ENABLE: u32 = 1 << 20;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PostSyncOperation {
    NoWrite = 0,
    WriteImmediateData = 1,
    WriteTimestamp = 3,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PipeControl {
    pub header: u32,
    pub flags: u32,
    pub address_lo: u32,
    pub address_hi: u32,
    pub immediate_lo: u32,
    pub immediate_hi: u32,
}

impl PipeControl {
    pub const HEADER: u32 = gfxpipe_header(3, 2, 0, 4);

    pub fn new(flags: u32) -> Self {
        Self {
            header: Self::HEADER,
            flags,
            address_lo: 0,
            address_hi: 0,
            immediate_lo: 0,
            immediate_hi: 0,
        }
    }

    pub fn with_post_sync(mut self, operation: PostSyncOperation, address: u64, immediate: u64) -> Self {
        self.flags = (self.flags & !pipe_control_bits::POST_SYNC_MASK)
            | ((operation as u32) << pipe_control_bits::POST_SYNC_SHIFT);
        self.address_lo = lo(address);
        self.address_hi = hi(address);
        self.immediate_lo = lo(immediate);
        self.immediate_hi = hi(immediate);
        self
    }

    pub fn post_sync_operation(&self) -> PostSyncOperation {
        match (self.flags & pipe_control_bits::POST_SYNC_MASK) >> pipe_control_bits::POST_SYNC_SHIFT {
            1 => PostSyncOperation::WriteImmediateData,
            3 => PostSyncOperation::WriteTimestamp,
            _ => PostSyncOperation::NoWrite,
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_lo, self.address_hi)
    }

    pub fn immediate(&self) -> u64 {
        join(self.immediate_lo, self.immediate_hi)
    }

    pub fn has(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }
}

pub mod pipeline_select_bits {
    pub const PIPELINE_GPGPU: u32 = 2;
    pub const PIPELINE_MASK: u32 = 0x3;
    pub const MEDIA_SAMPLER_DOP_CLOCK_GATE_ENABLE: u32 = 1 << 4;
    pub const SYSTOLIC_MODE_ENABLE: u32 = 1 << 6;
    /// Mask bits live in 15:8 and mirror the value bits they unlock.
    pub const MASK_SHIFT: u32 = 8;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineSelect {
    pub dword0: u32,
}

impl PipelineSelect {
    pub const HEADER: u32 = gfxpipe_header(1, 1, 4, 0);
    pub const HEADER_MASK: u32 = 0xFFFF_0000;

    pub fn new(mask: u32, value: u32) -> Self {
        Self {
            dword0: Self::HEADER | ((mask & 0xFF) << pipeline_select_bits::MASK_SHIFT) | (value & 0xFF),
        }
    }

    pub fn mask(&self) -> u32 {
        (self.dword0 >> pipeline_select_bits::MASK_SHIFT) & 0xFF
    }

    pub fn value(&self) -> u32 {
        self.dword0 & 0xFF
    }
}

pub mod compute_mode_bits {
    /// Two-bit "force non-coherent" field at bits 4:3; 2 forces GPU non-coherent.
    pub const FORCE_NON_COHERENT_SHIFT: u32 = 3;
    pub const FORCE_NON_COHERENT_MASK: u32 = 0x3 << FORCE_NON_COHERENT_SHIFT;
    pub const FORCE_GPU_NON_COHERENT: u32 = 2 << FORCE_NON_COHERENT_SHIFT;
    pub const LARGE_GRF_MODE: u32 = 1 << 15;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StateComputeMode {
    pub header: u32,
    /// Value bits 15:0, mask bits 31:16.
    pub dword1: u32,
}

impl StateComputeMode {
    pub const HEADER: u32 = gfxpipe_header(0, 1, 5, 0);

    pub fn new(mask: u32, value: u32) -> Self {
        Self {
            header: Self::HEADER,
            dword1: ((mask & 0xFFFF) << 16) | (value & 0xFFFF),
        }
    }

    pub fn mask(&self) -> u32 {
        self.dword1 >> 16
    }

    pub fn value(&self) -> u32 {
        self.dword1 & 0xFFFF
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StateSip {
    pub header: u32,
    pub sip_lo: u32,
    pub sip_hi: u32,
}

impl StateSip {
    pub const HEADER: u32 = gfxpipe_header(0, 1, 2, 1);

    pub fn new(system_instruction_pointer: u64) -> Self {
        Self {
            header: Self::HEADER,
            sip_lo: lo(system_instruction_pointer),
            sip_hi: hi(system_instruction_pointer),
        }
    }

    pub fn address(&self) -> u64 {
        join(self.sip_lo, self.sip_hi)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StateBaseAddress {
    pub header: u32,
    pub general_state_base_lo: u32,
    pub general_state_base_hi: u32,
    /// Stateless data-port MOCS in bits 22:16.
    pub stateless_mocs: u32,
    pub surface_state_base_lo: u32,
    pub surface_state_base_hi: u32,
    pub dynamic_state_base_lo: u32,
    pub dynamic_state_base_hi: u32,
    pub indirect_object_base_lo: u32,
    pub indirect_object_base_hi: u32,
    pub instruction_base_lo: u32,
    pub instruction_base_hi: u32,
    pub general_state_buffer_size: u32,
    pub dynamic_state_buffer_size: u32,
    pub indirect_object_buffer_size: u32,
    pub instruction_buffer_size: u32,
    pub bindless_surface_state_base_lo: u32,
    pub bindless_surface_state_base_hi: u32,
    pub bindless_surface_state_size: u32,
}

impl StateBaseAddress {
    pub const HEADER: u32 = gfxpipe_header(0, 1, 1, 17);
    const MOCS_SHIFT: u32 = 16;
    /// Base-address-modify enable in bit 0 of every base dword.
    const MODIFY_ENABLE: u32 = 1;

    pub fn new(general_state_base: u64, mocs_index: u32) -> Self {
        let mut sba = Self::zeroed();
        sba.header = Self::HEADER;
        sba.general_state_base_lo = lo(general_state_base) | Self::MODIFY_ENABLE;
        sba.general_state_base_hi = hi(general_state_base);
        sba.stateless_mocs = (mocs_index & 0x7F) << Self::MOCS_SHIFT;
        sba.general_state_buffer_size = 0xFFFF_F000;
        sba
    }

    pub fn general_state_base(&self) -> u64 {
        join(self.general_state_base_lo & !Self::MODIFY_ENABLE, self.general_state_base_hi)
    }

    pub fn mocs_index(&self) -> u32 {
        (self.stateless_mocs >> Self::MOCS_SHIFT) & 0x7F
    }
}

/// Compute dispatch. The software engine treats `kernel_id` as the kernel to "run".
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GpgpuWalker {
    pub header: u32,
    pub kernel_id: u32,
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
    pub reserved: [u32; 10],
}

impl GpgpuWalker {
    pub const HEADER: u32 = gfxpipe_header(2, 1, 5, 13);

    pub fn new(kernel_id: u32, groups: [u32; 3]) -> Self {
        Self {
            header: Self::HEADER,
            kernel_id,
            thread_group_count_x: groups[0],
            thread_group_count_y: groups[1],
            thread_group_count_z: groups[2],
            reserved: [0; 10],
        }
    }
}
