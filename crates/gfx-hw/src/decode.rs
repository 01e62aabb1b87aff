use bytemuck::Pod;
use thiserror::Error;

use crate::commands::{
    opcode, GpgpuWalker, MiBatchBufferEnd, MiBatchBufferStart, MiCopyMemMem, MiLoadRegisterImm,
    MiSemaphoreWait, MiStoreDataImm, PipeControl, PipelineSelect, StateBaseAddress, StateComputeMode,
    StateSip, MI_NOOP,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated command at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown command header {header:#010x} at offset {offset}")]
    Unknown { header: u32, offset: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Noop,
    BatchBufferEnd,
    BatchBufferStart(MiBatchBufferStart),
    LoadRegisterImm(MiLoadRegisterImm),
    SemaphoreWait(MiSemaphoreWait),
    StoreDataImm(MiStoreDataImm),
    CopyMemMem(MiCopyMemMem),
    PipeControl(PipeControl),
    PipelineSelect(PipelineSelect),
    StateComputeMode(StateComputeMode),
    StateSip(StateSip),
    StateBaseAddress(StateBaseAddress),
    GpgpuWalker(GpgpuWalker),
}

impl Command {
    pub fn size(&self) -> usize {
        use std::mem::size_of;
        match self {
            Command::Noop => 4,
            Command::BatchBufferEnd => size_of::<MiBatchBufferEnd>(),
            Command::BatchBufferStart(_) => size_of::<MiBatchBufferStart>(),
            Command::LoadRegisterImm(_) => size_of::<MiLoadRegisterImm>(),
            Command::SemaphoreWait(_) => size_of::<MiSemaphoreWait>(),
            Command::StoreDataImm(_) => size_of::<MiStoreDataImm>(),
            Command::CopyMemMem(_) => size_of::<MiCopyMemMem>(),
            Command::PipeControl(_) => size_of::<PipeControl>(),
            Command::PipelineSelect(_) => size_of::<PipelineSelect>(),
            Command::StateComputeMode(_) => size_of::<StateComputeMode>(),
            Command::StateSip(_) => size_of::<StateSip>(),
            Command::StateBaseAddress(_) => size_of::<StateBaseAddress>(),
            Command::GpgpuWalker(_) => size_of::<GpgpuWalker>(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "MI_NOOP",
            Command::BatchBufferEnd => "MI_BATCH_BUFFER_END",
            Command::BatchBufferStart(_) => "MI_BATCH_BUFFER_START",
            Command::LoadRegisterImm(_) => "MI_LOAD_REGISTER_IMM",
            Command::SemaphoreWait(_) => "MI_SEMAPHORE_WAIT",
            Command::StoreDataImm(_) => "MI_STORE_DATA_IMM",
            Command::CopyMemMem(_) => "MI_COPY_MEM_MEM",
            Command::PipeControl(_) => "PIPE_CONTROL",
            Command::PipelineSelect(_) => "PIPELINE_SELECT",
            Command::StateComputeMode(_) => "STATE_COMPUTE_MODE",
            Command::StateSip(_) => "STATE_SIP",
            Command::StateBaseAddress(_) => "STATE_BASE_ADDRESS",
            Command::GpgpuWalker(_) => "GPGPU_WALKER",
        }
    }
}

fn read<T: Pod>(bytes: &[u8], offset: usize) -> Result<T, DecodeError> {
    let needed = std::mem::size_of::<T>();
    let available = bytes.len().saturating_sub(offset);
    if available < needed {
        return Err(DecodeError::Truncated {
            offset,
            needed,
            available,
        });
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[offset..offset + needed]))
}

/// Decode the command starting at `offset`.
pub fn decode_at(bytes: &[u8], offset: usize) -> Result<Command, DecodeError> {
    let header: u32 = read(bytes, offset)?;

    if header == MI_NOOP {
        return Ok(Command::Noop);
    }
    if header == MiBatchBufferEnd::HEADER {
        return Ok(Command::BatchBufferEnd);
    }

    let command_type = header >> 29;
    if command_type == 0 {
        let mi_opcode = (header >> 23) & 0x3F;
        return match mi_opcode {
            opcode::MI_BATCH_BUFFER_START => read(bytes, offset).map(Command::BatchBufferStart),
            opcode::MI_LOAD_REGISTER_IMM => read(bytes, offset).map(Command::LoadRegisterImm),
            opcode::MI_SEMAPHORE_WAIT => read(bytes, offset).map(Command::SemaphoreWait),
            opcode::MI_STORE_DATA_IMM => read(bytes, offset).map(Command::StoreDataImm),
            opcode::MI_COPY_MEM_MEM => read(bytes, offset).map(Command::CopyMemMem),
            _ => Err(DecodeError::Unknown { header, offset }),
        };
    }

    if header & PipelineSelect::HEADER_MASK == PipelineSelect::HEADER {
        return read(bytes, offset).map(Command::PipelineSelect);
    }
    match header {
        PipeControl::HEADER => read(bytes, offset).map(Command::PipeControl),
        StateComputeMode::HEADER => read(bytes, offset).map(Command::StateComputeMode),
        StateSip::HEADER => read(bytes, offset).map(Command::StateSip),
        StateBaseAddress::HEADER => read(bytes, offset).map(Command::StateBaseAddress),
        GpgpuWalker::HEADER => read(bytes, offset).map(Command::GpgpuWalker),
        _ => Err(DecodeError::Unknown { header, offset }),
    }
}

/// Iterates `(offset, command)` pairs over a byte slice of back-to-back commands.
pub struct CommandIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> CommandIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for CommandIter<'_> {
    type Item = Result<(usize, Command), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        match decode_at(self.bytes, self.offset) {
            Ok(command) => {
                let at = self.offset;
                self.offset += command.size();
                Some(Ok((at, command)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

pub fn decode_all(bytes: &[u8]) -> Result<Vec<Command>, DecodeError> {
    CommandIter::new(bytes)
        .map(|item| item.map(|(_, command)| command))
        .collect()
}
