//! Hardware command encodings and per-generation programming helpers.
//!
//! Everything here is a pure function of its inputs: `*_size` helpers report exactly the bytes
//! their `program_*` counterparts write, so the CSR can size a dispatch before encoding it.
//! [`decode`] turns a byte stream back into [`decode::Command`]s for tests and the software
//! engine.

#![forbid(unsafe_code)]

pub mod commands;
pub mod decode;
mod family;
mod hw_info;
pub mod memory_sync;
pub mod preemption;
pub mod state;

pub use commands::CommandSink;
pub use decode::{decode_all, decode_at, Command, CommandIter, DecodeError};
pub use family::{
    gfx_family, Gen11Family, Gen12LpFamily, Gen9Family, GfxCoreFamily, GfxFamily, XeHpgFamily,
};
pub use hw_info::{HardwareInfo, WorkaroundTable};
pub use memory_sync::{BatchBufferChain, PipeControlArgs};
pub use preemption::{PreemptionFlags, PreemptionMode};
pub use state::{ComputeModeTriggers, L3CachingSettings, PipelineSelectArgs, ThreadArbitrationPolicy};
