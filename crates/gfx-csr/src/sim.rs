//! Software engine.
//!
//! [`SimulatedEngine`] implements [`OsInterface`] for one engine context. A worker thread pulls
//! submissions in order and executes the command subset the core emits directly against the
//! root device's [`GpuAddressSpace`]: it follows batch-buffer chains, performs post-sync and
//! store-data writes, copies dwords, blocks on semaphores and records every executed command.
//! An engine that fails to fetch, decode or finish a command reports device lost and stops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gfx_hw::commands::{CompareOperation, PostSyncOperation};
use gfx_hw::{decode_at, Command, DecodeError};
use gfx_memory::{GpuAddressSpace, GpuMemory, MemoryError};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::os_interface::{BatchBuffer, EngineId, FlushStamp, OsInterface, SubmitError, WaitOutcome};

/// Largest encoded command the engine fetches in one go.
const MAX_COMMAND_BYTES: usize = 128;
/// Commands executed per submission before the engine declares a runaway batch.
const MAX_COMMANDS_PER_SUBMISSION: usize = 1 << 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimConfig {
    /// A semaphore that stays unsatisfied this long hangs the engine.
    pub hang_timeout: Duration,
    pub start_paused: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hang_timeout: Duration::from_secs(5),
            start_paused: false,
        }
    }
}

#[derive(Debug, Error)]
enum EngineFault {
    #[error("memory access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("decode failed at {address:#x}: {source}")]
    Decode {
        address: u64,
        #[source]
        source: DecodeError,
    },

    #[error("semaphore at {address:#x} never reached {value}")]
    SemaphoreTimeout { address: u64, value: u32 },

    #[error("batch did not terminate")]
    Runaway,

    #[error("engine stopped")]
    Stopped,
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutedCommand {
    pub flush_stamp: FlushStamp,
    pub gpu_address: u64,
    pub command: Command,
    pub at: Instant,
}

struct Submission {
    stamp: FlushStamp,
    start: u64,
}

#[derive(Default)]
struct EngineQueue {
    pending: VecDeque<Submission>,
    last_issued: FlushStamp,
    completed: FlushStamp,
    busy: bool,
    paused: bool,
    device_lost: bool,
    shutdown: bool,
}

struct EngineShared {
    engine: EngineId,
    memory: Arc<GpuAddressSpace>,
    config: SimConfig,
    created: Instant,
    queue: Mutex<EngineQueue>,
    work: Condvar,
    retired: Condvar,
    stopping: AtomicBool,
    fail_next_submit: AtomicBool,
    registers: Mutex<HashMap<u32, u32>>,
    executed: Mutex<Vec<ExecutedCommand>>,
}

impl EngineShared {
    fn queue(&self) -> MutexGuard<'_, EngineQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(self: Arc<Self>) {
        loop {
            let submission = {
                let mut queue = self.queue();
                loop {
                    if queue.shutdown {
                        return;
                    }
                    if !queue.paused && !queue.device_lost {
                        if let Some(next) = queue.pending.pop_front() {
                            queue.busy = true;
                            break next;
                        }
                    }
                    queue = self.work.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
            };

            let result = self.execute(&submission);

            let mut queue = self.queue();
            queue.busy = false;
            match result {
                Ok(()) => {
                    queue.completed = submission.stamp;
                    trace!(engine = %self.engine, flush_stamp = submission.stamp, "submission retired");
                }
                Err(EngineFault::Stopped) => {}
                Err(fault) => {
                    error!(engine = %self.engine, flush_stamp = submission.stamp, %fault, "engine hung, device lost");
                    queue.device_lost = true;
                    queue.pending.clear();
                }
            }
            drop(queue);
            self.retired.notify_all();
        }
    }

    fn fetch(&self, address: u64) -> Result<Command, EngineFault> {
        let region = self.memory.resolve(address, 4)?;
        let offset = address - region.gpu_base();
        let available = (region.size() - offset).min(MAX_COMMAND_BYTES as u64) as usize;
        let mut bytes = [0u8; MAX_COMMAND_BYTES];
        region.read_bytes(offset, &mut bytes[..available])?;
        decode_at(&bytes[..available], 0).map_err(|source| EngineFault::Decode { address, source })
    }

    fn execute(&self, submission: &Submission) -> Result<(), EngineFault> {
        let mut address = submission.start;
        for _ in 0..MAX_COMMANDS_PER_SUBMISSION {
            let command = self.fetch(address)?;
            if !matches!(command, Command::Noop) {
                self.executed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ExecutedCommand {
                        flush_stamp: submission.stamp,
                        gpu_address: address,
                        command,
                        at: Instant::now(),
                    });
            }

            match command {
                Command::BatchBufferEnd => return Ok(()),
                Command::BatchBufferStart(bbs) => {
                    address = bbs.address();
                    continue;
                }
                Command::LoadRegisterImm(lri) => {
                    self.registers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(lri.register_offset, lri.data);
                }
                Command::SemaphoreWait(wait) => {
                    let compare = wait
                        .compare_operation()
                        .unwrap_or(CompareOperation::GreaterThanOrEqual);
                    self.wait_semaphore(wait.address(), wait.semaphore_data, compare)?;
                }
                Command::StoreDataImm(store) => {
                    self.memory.write_u32(store.address(), store.data)?;
                }
                Command::CopyMemMem(copy) => {
                    let value = self.memory.read_u32(copy.source())?;
                    self.memory.write_u32(copy.destination(), value)?;
                }
                Command::PipeControl(pc) => match pc.post_sync_operation() {
                    // Tag cells are dwords; only the low half of the immediate is written.
                    PostSyncOperation::WriteImmediateData => {
                        self.memory.write_u32(pc.address(), pc.immediate() as u32)?;
                    }
                    PostSyncOperation::WriteTimestamp => {
                        let nanos = self.created.elapsed().as_nanos() as u64;
                        self.memory.write_u64(pc.address(), nanos)?;
                    }
                    PostSyncOperation::NoWrite => {}
                },
                Command::Noop
                | Command::PipelineSelect(_)
                | Command::StateComputeMode(_)
                | Command::StateSip(_)
                | Command::StateBaseAddress(_)
                | Command::GpgpuWalker(_) => {}
            }
            address += command.size() as u64;
        }
        Err(EngineFault::Runaway)
    }

    fn wait_semaphore(
        &self,
        address: u64,
        value: u32,
        compare: CompareOperation,
    ) -> Result<(), EngineFault> {
        let deadline = Instant::now() + self.config.hang_timeout;
        let mut spins = 0u32;
        loop {
            if compare.evaluate(self.memory.read_u32(address)?, value) {
                return Ok(());
            }
            if self.stopping.load(Ordering::Acquire) {
                return Err(EngineFault::Stopped);
            }
            if Instant::now() >= deadline {
                return Err(EngineFault::SemaphoreTimeout { address, value });
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

/// One engine context of a software GPU.
pub struct SimulatedEngine {
    shared: Arc<EngineShared>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedEngine {
    pub fn new(engine: EngineId, memory: Arc<GpuAddressSpace>, config: SimConfig) -> Self {
        let shared = Arc::new(EngineShared {
            engine,
            memory,
            config,
            created: Instant::now(),
            queue: Mutex::new(EngineQueue {
                paused: config.start_paused,
                ..EngineQueue::default()
            }),
            work: Condvar::new(),
            retired: Condvar::new(),
            stopping: AtomicBool::new(false),
            fail_next_submit: AtomicBool::new(false),
            registers: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        });
        let worker = std::thread::Builder::new()
            .name(format!("gfx-sim-{engine}"))
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.run()
            })
            .ok();
        if worker.is_none() {
            error!(%engine, "failed to spawn engine worker; submissions will never retire");
        }
        Self { shared, worker }
    }

    pub fn engine(&self) -> EngineId {
        self.shared.engine
    }

    pub fn memory(&self) -> &Arc<GpuAddressSpace> {
        &self.shared.memory
    }

    /// Stop picking up new submissions. The one in flight (if any) still finishes.
    pub fn pause(&self) {
        self.shared.queue().paused = true;
    }

    pub fn resume(&self) {
        self.shared.queue().paused = false;
        self.shared.work.notify_all();
    }

    /// Make the next `submit` fail as if the KMD rejected it.
    pub fn fail_next_submit(&self) {
        self.shared.fail_next_submit.store(true, Ordering::Release);
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.queue().device_lost
    }

    pub fn completed_stamp(&self) -> FlushStamp {
        self.shared.queue().completed
    }

    pub fn register(&self, offset: u32) -> Option<u32> {
        self.shared
            .registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&offset)
            .copied()
    }

    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.shared
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until every submission so far retired (or the device was lost).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let target = self.shared.queue().last_issued;
        self.wait_on_completion(target, Some(timeout)) == WaitOutcome::Completed
    }
}

impl OsInterface for SimulatedEngine {
    fn submit(&self, batch: &BatchBuffer) -> Result<FlushStamp, SubmitError> {
        if self.shared.fail_next_submit.swap(false, Ordering::AcqRel) {
            return Err(SubmitError::Rejected("injected failure".to_string()));
        }
        if batch.engine != self.shared.engine {
            return Err(SubmitError::Rejected(format!(
                "batch for {} submitted to {}",
                batch.engine, self.shared.engine
            )));
        }
        if let Some(range) = batch
            .ranges
            .iter()
            .find(|range| !batch.residency.iter().any(|a| a.ptr_eq(&range.allocation)))
        {
            return Err(SubmitError::Rejected(format!(
                "command buffer at {:#x} is not resident",
                range.gpu_start()
            )));
        }

        let mut queue = self.shared.queue();
        if queue.device_lost {
            return Err(SubmitError::DeviceLost);
        }
        queue.last_issued += 1;
        let stamp = queue.last_issued;
        queue.pending.push_back(Submission {
            stamp,
            start: batch.start_gpu_address,
        });
        drop(queue);
        self.shared.work.notify_all();

        debug!(
            engine = %self.shared.engine,
            flush_stamp = stamp,
            start = batch.start_gpu_address,
            bytes = batch.used_bytes(),
            throttle = ?batch.throttle,
            low_priority = batch.low_priority,
            "batch submitted"
        );
        Ok(stamp)
    }

    fn wait_on_completion(&self, flush_stamp: FlushStamp, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut queue = self.shared.queue();
        loop {
            if queue.device_lost {
                return WaitOutcome::DeviceLost;
            }
            if queue.completed >= flush_stamp {
                return WaitOutcome::Completed;
            }
            queue = match deadline {
                None => self
                    .shared
                    .retired
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    self.shared
                        .retired
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn is_idle(&self) -> bool {
        let queue = self.shared.queue();
        queue.pending.is_empty() && !queue.busy
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.queue().shutdown = true;
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.retired.notify_all();
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.queue();
        f.debug_struct("SimulatedEngine")
            .field("engine", &self.shared.engine)
            .field("last_issued", &queue.last_issued)
            .field("completed", &queue.completed)
            .field("pending", &queue.pending.len())
            .field("device_lost", &queue.device_lost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os_interface::EngineType;
    use crate::QueueThrottle;
    use gfx_cmdbuf::{LinearStream, NoChain};
    use gfx_hw::memory_sync::{
        program_batch_buffer_end, program_pipe_control_with_post_sync, program_semaphore_wait,
        program_store_data_imm,
    };
    use gfx_hw::{BatchBufferChain, CommandSink, PipeControlArgs};
    use gfx_memory::{AllocationProperties, AllocationType, GraphicsAllocation};

    struct Fixture {
        memory: Arc<GpuAddressSpace>,
        engine: SimulatedEngine,
        scratch: GraphicsAllocation,
    }

    fn fixture(config: SimConfig) -> Fixture {
        let memory = Arc::new(GpuAddressSpace::new(0));
        let engine = SimulatedEngine::new(
            EngineId::new(0, EngineType::Compute, 0),
            Arc::clone(&memory),
            config,
        );
        let scratch = memory
            .allocate(AllocationProperties::new(0x1000, AllocationType::Buffer))
            .unwrap();
        Fixture {
            memory,
            engine,
            scratch,
        }
    }

    fn submit_stream(
        fixture: &Fixture,
        stream: &mut LinearStream,
        encode: impl FnOnce(&mut dyn CommandSink),
    ) -> Result<FlushStamp, SubmitError> {
        let start = stream.position();
        encode(stream);
        program_batch_buffer_end(stream).unwrap();
        stream.commit().unwrap();
        let ranges = stream.ranges(start, stream.position()).unwrap();
        let residency = ranges.iter().map(|r| r.allocation.clone()).collect();
        fixture.engine.submit(&BatchBuffer {
            engine: fixture.engine.engine(),
            start_gpu_address: stream.gpu_address(start).unwrap(),
            ranges,
            throttle: QueueThrottle::Medium,
            low_priority: false,
            slice_count: 0,
            residency,
        })
    }

    #[test]
    fn executes_post_sync_and_store_writes_in_order() {
        let fx = fixture(SimConfig::default());
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(NoChain), 0x1000).unwrap();
        let base = fx.scratch.gpu_address();

        let stamp = submit_stream(&fx, &mut stream, |sink| {
            program_store_data_imm(sink, base, 11).unwrap();
            program_pipe_control_with_post_sync(sink, PipeControlArgs::default(), base + 4, 22)
                .unwrap();
        })
        .unwrap();

        assert_eq!(
            fx.engine.wait_on_completion(stamp, Some(Duration::from_secs(5))),
            WaitOutcome::Completed
        );
        assert_eq!(fx.scratch.read_u32(0).unwrap(), 11);
        assert_eq!(fx.scratch.read_u32(4).unwrap(), 22);
        assert!(fx.engine.is_idle());
    }

    #[test]
    fn follows_chains_across_segments() {
        let fx = fixture(SimConfig::default());
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(BatchBufferChain), 1).unwrap();
        let base = fx.scratch.gpu_address();

        let stamp = submit_stream(&fx, &mut stream, |sink| {
            // Enough stores to overflow the first segment.
            for i in 0..8192u32 {
                program_store_data_imm(sink, base + u64::from(i % 1024) * 4, i).unwrap();
            }
        })
        .unwrap();
        assert!(stream.segment_count() > 1);

        assert!(fx.engine.wait_idle(Duration::from_secs(10)));
        assert_eq!(fx.engine.completed_stamp(), stamp);
        assert_eq!(fx.scratch.read_u32(1023 * 4).unwrap(), 8191);
    }

    #[test]
    fn semaphore_blocks_until_memory_satisfies_it() {
        let fx = fixture(SimConfig::default());
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(NoChain), 0x1000).unwrap();
        let base = fx.scratch.gpu_address();

        let stamp = submit_stream(&fx, &mut stream, |sink| {
            program_semaphore_wait(sink, base, 1).unwrap();
            program_store_data_imm(sink, base + 8, 99).unwrap();
        })
        .unwrap();

        assert_eq!(
            fx.engine.wait_on_completion(stamp, Some(Duration::from_millis(50))),
            WaitOutcome::TimedOut
        );
        assert_eq!(fx.scratch.read_u32(8).unwrap(), 0);

        fx.scratch.write_u32(0, 1).unwrap();
        assert_eq!(
            fx.engine.wait_on_completion(stamp, Some(Duration::from_secs(5))),
            WaitOutcome::Completed
        );
        assert_eq!(fx.scratch.read_u32(8).unwrap(), 99);
    }

    #[test]
    fn unsatisfied_semaphore_loses_the_device() {
        let fx = fixture(SimConfig {
            hang_timeout: Duration::from_millis(20),
            start_paused: false,
        });
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(NoChain), 0x1000).unwrap();
        let base = fx.scratch.gpu_address();

        let stamp = submit_stream(&fx, &mut stream, |sink| {
            program_semaphore_wait(sink, base, 1).unwrap();
        })
        .unwrap();

        assert_eq!(
            fx.engine.wait_on_completion(stamp, Some(Duration::from_secs(5))),
            WaitOutcome::DeviceLost
        );
        assert!(fx.engine.is_device_lost());
        assert_eq!(
            submit_stream(&fx, &mut stream, |_| {}),
            Err(SubmitError::DeviceLost)
        );
    }

    #[test]
    fn paused_engine_holds_submissions() {
        let fx = fixture(SimConfig {
            start_paused: true,
            ..SimConfig::default()
        });
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(NoChain), 0x1000).unwrap();
        let base = fx.scratch.gpu_address();
        let stamp = submit_stream(&fx, &mut stream, |sink| {
            program_store_data_imm(sink, base, 5).unwrap();
        })
        .unwrap();

        assert!(!fx.engine.is_idle());
        assert_eq!(
            fx.engine.wait_on_completion(stamp, Some(Duration::from_millis(20))),
            WaitOutcome::TimedOut
        );
        fx.engine.resume();
        assert!(fx.engine.wait_idle(Duration::from_secs(5)));
        assert_eq!(fx.scratch.read_u32(0).unwrap(), 5);
    }

    #[test]
    fn injected_failure_rejects_once() {
        let fx = fixture(SimConfig::default());
        let mut stream =
            LinearStream::new(fx.memory.clone(), Arc::new(NoChain), 0x1000).unwrap();
        fx.engine.fail_next_submit();
        assert!(matches!(
            submit_stream(&fx, &mut stream, |_| {}),
            Err(SubmitError::Rejected(_))
        ));
        assert!(submit_stream(&fx, &mut stream, |_| {}).is_ok());
    }
}
