//! Generator objects.
//!
//! A generator owns the persisted [`Frame`] of its suspended activation
//! plus a packed atomic header: two state bits and a 30-bit resume bci
//! in one `AtomicU32`, so state transitions need no lock and a resume
//! attempt on a running generator is detected by CAS failure rather
//! than by deadlocking on the frame.
//!
//! While the generator runs, its frame is taken out of the object and
//! lives on the interpreter's Rust stack like any other activation; on
//! suspension it moves back. Exhaustion (return, uncaught error, or a
//! throw that terminates it) drops the frame so captured values are
//! released promptly.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lumen_core::{LanguageError, LanguageResult, Object, Value};
use parking_lot::Mutex;

use crate::dispatch::{self, Completion, ResumeSignal, RunMode};
use crate::engine::Engine;
use crate::exception::{ExecResult, ExceptionObject};
use crate::frame::Frame;

// =============================================================================
// Header
// =============================================================================

const STATE_MASK: u32 = 0b11;
const BCI_SHIFT: u32 = 2;
const MAX_RESUME_BCI: u32 = (1 << 30) - 1;

const STATE_CREATED: u32 = 0;
const STATE_RUNNING: u32 = 1;
const STATE_SUSPENDED: u32 = 2;
const STATE_EXHAUSTED: u32 = 3;

/// Observable generator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    /// Never resumed.
    Created,
    /// Currently executing on some thread.
    Running,
    /// Suspended at a yield.
    Suspended,
    /// Completed, errored out, or closed.
    Exhausted,
}

#[derive(Debug)]
enum Begin {
    Fresh,
    At(u32),
    Exhausted,
}

/// State bits and resume bci packed into one atomic word.
#[derive(Debug)]
struct GeneratorHeader(AtomicU32);

impl GeneratorHeader {
    fn new() -> Self {
        Self(AtomicU32::new(STATE_CREATED))
    }

    fn state(&self) -> GenState {
        match self.0.load(Ordering::Acquire) & STATE_MASK {
            STATE_CREATED => GenState::Created,
            STATE_RUNNING => GenState::Running,
            STATE_SUSPENDED => GenState::Suspended,
            _ => GenState::Exhausted,
        }
    }

    /// Transition to `Running`, claiming exclusive execution rights.
    fn begin(&self) -> LanguageResult<Begin> {
        loop {
            let word = self.0.load(Ordering::Acquire);
            let claimed = (word & !STATE_MASK) | STATE_RUNNING;
            match word & STATE_MASK {
                STATE_CREATED => {
                    if self
                        .0
                        .compare_exchange(word, claimed, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(Begin::Fresh);
                    }
                }
                STATE_SUSPENDED => {
                    if self
                        .0
                        .compare_exchange(word, claimed, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(Begin::At(word >> BCI_SHIFT));
                    }
                }
                STATE_RUNNING => {
                    return Err(LanguageError::runtime("generator already executing"));
                }
                _ => return Ok(Begin::Exhausted),
            }
        }
    }

    /// Running → Suspended at `resume_bci`.
    fn suspend(&self, resume_bci: u32) {
        debug_assert!(resume_bci <= MAX_RESUME_BCI);
        self.0
            .store((resume_bci << BCI_SHIFT) | STATE_SUSPENDED, Ordering::Release);
    }

    /// Running → Exhausted.
    fn finish(&self) {
        self.0.store(STATE_EXHAUSTED, Ordering::Release);
    }

    /// Running → Created, undoing a claim that failed validation.
    fn rollback_fresh(&self) {
        self.0.store(STATE_CREATED, Ordering::Release);
    }
}

// =============================================================================
// Generator objects
// =============================================================================

/// What a resume attempt carries into the generator.
#[derive(Debug)]
pub enum ResumeInput {
    /// Plain resume; the yield expression produces `None`.
    Next,
    /// The yield expression produces this value. Must be `None` for a
    /// generator that has not started yet.
    Send(Value),
    /// Raise this exception at the yield expression. Rejected before
    /// the first resume; no bytecode runs.
    Throw(Arc<ExceptionObject>),
}

/// Outcome of one resume.
#[derive(Debug)]
pub enum GeneratorStep {
    /// The generator suspended at a yield with this value.
    Yielded(Value),
    /// The generator returned; it is now exhausted.
    Done(Value),
}

/// A suspended (or running, or finished) generator activation.
#[derive(Debug)]
pub struct GeneratorObject {
    name: Arc<str>,
    header: GeneratorHeader,
    frame: Mutex<Option<Frame>>,
}

impl GeneratorObject {
    /// Wrap a bound, unstarted frame.
    #[must_use]
    pub(crate) fn new(frame: Frame) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::clone(&frame.unit.name),
            header: GeneratorHeader::new(),
            frame: Mutex::new(Some(frame)),
        })
    }

    /// The generator's function name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GenState {
        self.header.state()
    }
}

impl Object for GeneratorObject {
    fn type_name(&self) -> &'static str {
        "generator"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Drive one resume step.
pub(crate) fn resume(
    engine: &Engine,
    depth: usize,
    gen: &GeneratorObject,
    input: ResumeInput,
) -> ExecResult<GeneratorStep> {
    let (mut frame, signal) = match gen.header.begin().map_err(ExceptionObject::new)? {
        Begin::Exhausted => {
            return Err(match input {
                // A throw into an exhausted generator re-raises the
                // thrown exception itself.
                ResumeInput::Throw(exc) => exc,
                _ => ExceptionObject::new(LanguageError::stop_iteration(format!(
                    "generator '{}' already exhausted",
                    gen.name
                ))),
            });
        }
        Begin::Fresh => {
            match &input {
                ResumeInput::Send(value) if !value.is_none() => {
                    gen.header.rollback_fresh();
                    return Err(ExceptionObject::new(LanguageError::type_error(
                        "can't send non-None value to a just-started generator",
                    )));
                }
                ResumeInput::Throw(_) => {
                    // There is no yield to raise at yet. The generator
                    // stays unstarted and usable.
                    gen.header.rollback_fresh();
                    return Err(ExceptionObject::new(LanguageError::runtime(
                        "can't throw into a just-started generator",
                    )));
                }
                _ => {}
            }
            let frame = gen.frame.lock().take().ok_or_else(|| {
                ExceptionObject::new(LanguageError::internal("generator lost its frame"))
            })?;
            (frame, None)
        }
        Begin::At(resume_bci) => {
            let mut frame = gen.frame.lock().take().ok_or_else(|| {
                ExceptionObject::new(LanguageError::internal("generator lost its frame"))
            })?;
            frame.bci = resume_bci;
            let signal = match input {
                ResumeInput::Next => ResumeSignal::Send(Value::None),
                ResumeInput::Send(value) => ResumeSignal::Send(value),
                ResumeInput::Throw(exc) => ResumeSignal::Throw(exc),
            };
            (frame, Some(signal))
        }
    };

    let mode = match signal {
        None => RunMode::Normal,
        Some(signal) => RunMode::Resume(signal),
    };

    match dispatch::run(engine, depth, &mut frame, mode) {
        Ok(Completion::Return(value)) => {
            gen.header.finish();
            log::trace!("generator '{}' completed", gen.name);
            Ok(GeneratorStep::Done(value))
        }
        Ok(Completion::Yield { resume_bci, value }) => {
            *gen.frame.lock() = Some(frame);
            gen.header.suspend(resume_bci);
            Ok(GeneratorStep::Yielded(value))
        }
        Ok(Completion::OsrExit { .. }) => {
            gen.header.finish();
            Err(ExceptionObject::new(LanguageError::internal(
                "loop exit escaped to the generator boundary",
            )))
        }
        Err(exc) => {
            gen.header.finish();
            Err(exc)
        }
    }
}
