//! Client-side payload encoding.
//!
//! Enqueue paths build the dispatch body here and hand the bytes to
//! [`CommandStreamReceiver::flush_task`](crate::CommandStreamReceiver::flush_task).

use gfx_hw::commands::{emit, GpgpuWalker, MiCopyMemMem};
use gfx_hw::memory_sync::{program_semaphore_wait, program_store_data_imm};
use gfx_hw::preemption::{apply_preemption_wa_cmds_begin, apply_preemption_wa_cmds_end};
use gfx_hw::{HardwareInfo, PreemptionMode};

use crate::tags::TagNode;
use crate::Result;

#[derive(Clone, Debug, Default)]
pub struct PayloadBuilder {
    bytes: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute walker, bracketed by the preemption workaround when the SKU needs it.
    pub fn walker(
        &mut self,
        hw_info: &HardwareInfo,
        preemption_mode: PreemptionMode,
        kernel_id: u32,
        groups: [u32; 3],
    ) -> Result<&mut Self> {
        apply_preemption_wa_cmds_begin(&mut self.bytes, hw_info, preemption_mode)?;
        emit(&mut self.bytes, &GpgpuWalker::new(kernel_id, groups))?;
        apply_preemption_wa_cmds_end(&mut self.bytes, hw_info, preemption_mode)?;
        Ok(self)
    }

    pub fn store_dword(&mut self, gpu_address: u64, value: u32) -> Result<&mut Self> {
        program_store_data_imm(&mut self.bytes, gpu_address, value)?;
        Ok(self)
    }

    /// Copy `len` bytes (rounded up to whole dwords) one dword at a time.
    pub fn copy_dwords(&mut self, destination: u64, source: u64, len: u64) -> Result<&mut Self> {
        for offset in (0..len).step_by(4) {
            emit(
                &mut self.bytes,
                &MiCopyMemMem::new(destination + offset, source + offset),
            )?;
        }
        Ok(self)
    }

    pub fn wait_for(&mut self, gpu_address: u64, value: u32) -> Result<&mut Self> {
        program_semaphore_wait(&mut self.bytes, gpu_address, value)?;
        Ok(self)
    }

    /// Signal `node` as soon as the engine reaches this point.
    pub fn signal(&mut self, node: &TagNode) -> Result<&mut Self> {
        self.store_dword(node.gpu_address(), node.completion_value())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfx_hw::{decode_all, Command, GfxCoreFamily};

    #[test]
    fn walker_carries_workaround_only_where_needed() {
        let gen9 = HardwareInfo::for_family(GfxCoreFamily::Gen9);
        let mut payload = PayloadBuilder::new();
        payload
            .walker(&gen9, PreemptionMode::MidThread, 3, [1, 1, 1])
            .unwrap();
        let commands = decode_all(payload.as_bytes()).unwrap();
        assert!(matches!(
            commands.as_slice(),
            [
                Command::LoadRegisterImm(_),
                Command::GpgpuWalker(walker),
                Command::LoadRegisterImm(_)
            ] if walker.kernel_id == 3
        ));

        let xe = HardwareInfo::for_family(GfxCoreFamily::XeHpg);
        let mut payload = PayloadBuilder::new();
        payload
            .walker(&xe, PreemptionMode::MidThread, 3, [1, 1, 1])
            .unwrap();
        assert_eq!(decode_all(payload.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn copy_covers_partial_trailing_dword() {
        let mut payload = PayloadBuilder::new();
        payload.copy_dwords(0x2000, 0x1000, 10).unwrap();
        let commands = decode_all(payload.as_bytes()).unwrap();
        assert_eq!(commands.len(), 3);
        let Command::CopyMemMem(last) = commands[2] else {
            panic!("expected copies, got {commands:?}");
        };
        assert_eq!(last.destination(), 0x2008);
        assert_eq!(last.source(), 0x1008);
    }
}
