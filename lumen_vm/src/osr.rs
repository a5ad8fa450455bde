//! On-stack replacement of hot loops.
//!
//! Every backward jump reports to the [`OsrCoordinator`]. Once a loop's
//! backedge count crosses the configured threshold the coordinator asks
//! its [`LoopCompiler`] for a [`CompiledLoop`]; compilation runs on a
//! background worker thread by default so the interpreter never stalls,
//! or synchronously for deterministic tests. Compiled bodies are cached
//! by `(unit id, loop target bci)` and entered directly from the
//! backedge on subsequent reports.
//!
//! The reference backend does not generate code at all: it re-enters
//! the dispatch loop in OSR mode over the same frame, exiting when the
//! program counter moves past the loop's backedge. That exercises the
//! full entry/exit/deopt contract while staying observably identical to
//! plain interpretation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use lumen_core::Value;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::code::CompiledUnit;
use crate::dispatch::{self, Completion, RunMode};
use crate::engine::Engine;
use crate::exception::ExecResult;
use crate::frame::Frame;

// =============================================================================
// Configuration
// =============================================================================

/// OSR tuning knobs.
#[derive(Debug, Clone)]
pub struct OsrConfig {
    /// Backedge count at which a loop becomes a compilation candidate.
    pub backedge_threshold: u32,
    /// Compile on the reporting thread instead of the background
    /// worker. Makes entry timing deterministic.
    pub synchronous: bool,
}

impl Default for OsrConfig {
    fn default() -> Self {
        Self {
            backedge_threshold: 1024,
            synchronous: false,
        }
    }
}

impl OsrConfig {
    /// Threshold 1, synchronous: the first backedge compiles and enters.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            backedge_threshold: 1,
            synchronous: true,
        }
    }
}

// =============================================================================
// Compiled loops
// =============================================================================

/// How a compiled loop body hands control back to the interpreter.
#[derive(Debug)]
pub enum LoopExit {
    /// Control left the loop; interpretation resumes at this bci.
    Fallthrough(u32),
    /// The activation returned from inside the loop.
    Return(Value),
    /// The activation suspended at a yield inside the loop.
    Yield {
        /// Bci of the `ResumeYield` to execute on resumption.
        resume_bci: u32,
        /// The yielded value.
        value: Value,
    },
}

/// An executable replacement for one loop.
///
/// `execute` observes and mutates the live frame in place, so locals
/// and operand stack are always current when control returns to the
/// interpreter; there is no separate state copy-back step. Uncaught
/// exceptions propagate as `Err` with handler search already performed.
pub trait CompiledLoop: Send + Sync {
    /// Run the loop starting at the frame's current bci.
    fn execute(&self, engine: &Engine, depth: usize, frame: &mut Frame)
        -> ExecResult<LoopExit>;
}

/// Produces compiled loops. `None` means the loop is not compilable;
/// the coordinator will not ask again.
pub trait LoopCompiler: Send + Sync {
    /// Compile the loop whose backedge at `backedge` jumps to `target`.
    fn compile(
        &self,
        unit: &Arc<CompiledUnit>,
        target: u32,
        backedge: u32,
    ) -> Option<Arc<dyn CompiledLoop>>;
}

/// Reference backend: the interpreter itself, constrained to the loop
/// region.
#[derive(Debug, Default)]
pub struct InterpreterLoopCompiler;

struct InterpreterLoop {
    exit_after: u32,
}

impl CompiledLoop for InterpreterLoop {
    fn execute(
        &self,
        engine: &Engine,
        depth: usize,
        frame: &mut Frame,
    ) -> ExecResult<LoopExit> {
        let completion = dispatch::run(
            engine,
            depth,
            frame,
            RunMode::OsrLoop {
                exit_after: self.exit_after,
            },
        )?;
        Ok(match completion {
            Completion::Return(value) => LoopExit::Return(value),
            Completion::Yield { resume_bci, value } => LoopExit::Yield { resume_bci, value },
            Completion::OsrExit { bci } => LoopExit::Fallthrough(bci),
        })
    }
}

impl LoopCompiler for InterpreterLoopCompiler {
    fn compile(
        &self,
        _unit: &Arc<CompiledUnit>,
        _target: u32,
        backedge: u32,
    ) -> Option<Arc<dyn CompiledLoop>> {
        Some(Arc::new(InterpreterLoop {
            exit_after: backedge,
        }))
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LoopKey {
    unit: u64,
    target: u32,
}

/// Counter snapshot for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OsrStats {
    /// Backedges reported.
    pub backedges: u64,
    /// Compilations requested.
    pub requests: u64,
    /// Compilations finished (cache inserts).
    pub compiled: u64,
    /// Compiled-loop entries.
    pub entries: u64,
}

#[derive(Default)]
struct Counters {
    backedges: AtomicU64,
    requests: AtomicU64,
    compiled: AtomicU64,
    entries: AtomicU64,
}

struct Shared {
    compiler: Box<dyn LoopCompiler>,
    cache: RwLock<FxHashMap<LoopKey, Arc<dyn CompiledLoop>>>,
    counters: Counters,
}

impl Shared {
    fn compile_into_cache(&self, unit: &Arc<CompiledUnit>, key: LoopKey, backedge: u32) {
        if let Some(compiled) = self.compiler.compile(unit, key.target, backedge) {
            self.counters.compiled.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "compiled loop {}@{} (backedge {backedge})",
                unit.name,
                key.target
            );
            self.cache.write().insert(key, compiled);
        }
    }
}

struct Job {
    unit: Arc<CompiledUnit>,
    key: LoopKey,
    backedge: u32,
}

/// Tracks loop heat, owns the compiled-loop cache, and drives the
/// background compile worker.
pub struct OsrCoordinator {
    config: OsrConfig,
    shared: Arc<Shared>,
    /// Per-loop backedge counts; a loop is removed once requested.
    heat: Mutex<FxHashMap<LoopKey, u32>>,
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl OsrCoordinator {
    /// Create a coordinator around a backend.
    #[must_use]
    pub fn new(config: OsrConfig, compiler: Box<dyn LoopCompiler>) -> Self {
        let shared = Arc::new(Shared {
            compiler,
            cache: RwLock::new(FxHashMap::default()),
            counters: Counters::default(),
        });
        let (sender, worker) = if config.synchronous {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel::<Job>();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("lumen-osr".into())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        shared.compile_into_cache(&job.unit, job.key, job.backedge);
                    }
                })
                .expect("failed to spawn the OSR worker thread");
            (Some(tx), Some(handle))
        };
        Self {
            config,
            shared,
            heat: Mutex::new(FxHashMap::default()),
            sender,
            worker,
        }
    }

    /// Reference setup: interpreter backend, default thresholds.
    #[must_use]
    pub fn with_default_backend(config: OsrConfig) -> Self {
        Self::new(config, Box::new(InterpreterLoopCompiler))
    }

    /// Report one backedge of the loop at `target` (jump site at
    /// `backedge`). Returns the compiled body to enter, if one is ready.
    pub(crate) fn on_backedge(
        &self,
        unit: &Arc<CompiledUnit>,
        target: u32,
        backedge: u32,
    ) -> Option<Arc<dyn CompiledLoop>> {
        let counters = &self.shared.counters;
        counters.backedges.fetch_add(1, Ordering::Relaxed);
        let key = LoopKey {
            unit: unit.id,
            target,
        };

        if let Some(compiled) = self.shared.cache.read().get(&key) {
            counters.entries.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(compiled));
        }

        let hot = {
            let mut heat = self.heat.lock();
            let count = heat.entry(key).or_insert(0);
            *count += 1;
            if *count >= self.config.backedge_threshold {
                heat.remove(&key);
                true
            } else {
                false
            }
        };
        if !hot {
            return None;
        }

        counters.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = &self.sender {
            let _ = sender.send(Job {
                unit: Arc::clone(unit),
                key,
                backedge,
            });
            return None;
        }

        // Synchronous mode: compile here and enter immediately.
        self.shared.compile_into_cache(unit, key, backedge);
        let compiled = self.shared.cache.read().get(&key).cloned();
        if compiled.is_some() {
            counters.entries.fetch_add(1, Ordering::Relaxed);
        }
        compiled
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> OsrStats {
        let counters = &self.shared.counters;
        OsrStats {
            backedges: counters.backedges.load(Ordering::Relaxed),
            requests: counters.requests.load(Ordering::Relaxed),
            compiled: counters.compiled.load(Ordering::Relaxed),
            entries: counters.entries.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OsrCoordinator {
    fn drop(&mut self) {
        // Closing the channel stops the worker.
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for OsrCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsrCoordinator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Opcode, UnitBuilder};

    fn loop_unit() -> Arc<CompiledUnit> {
        let mut b = UnitBuilder::new("hot");
        let top = b.here();
        b.op(Opcode::Nop);
        b.jump_back(top);
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        b.build()
    }

    #[test]
    fn test_threshold_counts_per_loop() {
        let osr = OsrCoordinator::with_default_backend(OsrConfig {
            backedge_threshold: 3,
            synchronous: true,
        });
        let unit = loop_unit();
        assert!(osr.on_backedge(&unit, 0, 1).is_none());
        assert!(osr.on_backedge(&unit, 0, 1).is_none());
        assert!(osr.on_backedge(&unit, 0, 1).is_some());
        assert_eq!(osr.stats().requests, 1);
        assert_eq!(osr.stats().compiled, 1);
        // Cached from now on.
        assert!(osr.on_backedge(&unit, 0, 1).is_some());
        assert_eq!(osr.stats().requests, 1);
        assert_eq!(osr.stats().entries, 2);
    }

    #[test]
    fn test_distinct_units_do_not_share_heat() {
        let osr = OsrCoordinator::with_default_backend(OsrConfig {
            backedge_threshold: 2,
            synchronous: true,
        });
        let a = loop_unit();
        let b = loop_unit();
        assert!(osr.on_backedge(&a, 0, 1).is_none());
        assert!(osr.on_backedge(&b, 0, 1).is_none());
        assert!(osr.on_backedge(&a, 0, 1).is_some());
    }

    #[test]
    fn test_background_worker_eventually_compiles() {
        let osr = OsrCoordinator::with_default_backend(OsrConfig {
            backedge_threshold: 1,
            synchronous: false,
        });
        let unit = loop_unit();
        assert!(osr.on_backedge(&unit, 0, 1).is_none());
        // The worker owns compilation; wait for the cache insert.
        for _ in 0..200 {
            if osr.stats().compiled == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(osr.stats().compiled, 1);
        assert!(osr.on_backedge(&unit, 0, 1).is_some());
    }
}
