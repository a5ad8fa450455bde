//! The execution engine.
//!
//! An [`Engine`] owns the pieces shared by every activation: the
//! operation layer, the optional OSR coordinator, the cooperative
//! cancellation flag, and the recursion limit. It is the only public
//! entry point for running compiled units and for driving generators.
//!
//! Engines are `Sync`; independent activations of the same unit may run
//! on different threads and share all quickening state through the
//! unit itself.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lumen_core::{LanguageError, Object, Value};

use crate::code::CompiledUnit;
use crate::dispatch::{self, Completion, RunMode};
use crate::exception::{ExecResult, ExceptionObject};
use crate::frame::{Cell, Frame};
use crate::generator::{self, GeneratorObject, GeneratorStep, ResumeInput};
use crate::ops::{DefaultOperations, Operations};
use crate::osr::{OsrConfig, OsrCoordinator, OsrStats};

// =============================================================================
// Functions
// =============================================================================

/// A callable: a compiled unit plus its captured cells.
#[derive(Debug)]
pub struct Function {
    unit: Arc<CompiledUnit>,
    closure: Box<[Arc<Cell>]>,
}

impl Function {
    /// Build a function from a unit and the cells matching its free
    /// variables (validated at activation).
    #[must_use]
    pub fn new(unit: Arc<CompiledUnit>, closure: Box<[Arc<Cell>]>) -> Self {
        Self { unit, closure }
    }

    /// The compiled unit behind this function.
    #[must_use]
    pub fn unit(&self) -> &Arc<CompiledUnit> {
        &self.unit
    }
}

impl Object for Function {
    fn type_name(&self) -> &'static str {
        "function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum activation nesting before `RecursionError`.
    pub max_recursion_depth: usize,
    /// OSR setup, or `None` to interpret every backedge.
    pub osr: Option<OsrConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 1000,
            osr: Some(OsrConfig::default()),
        }
    }
}

/// The shared execution engine.
pub struct Engine {
    config: EngineConfig,
    ops: Box<dyn Operations>,
    osr: Option<OsrCoordinator>,
    cancelled: AtomicBool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with the reference operation layer and default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with the reference operation layer.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_operations(config, Box::new(DefaultOperations))
    }

    /// Engine with a custom operation layer.
    #[must_use]
    pub fn with_operations(config: EngineConfig, ops: Box<dyn Operations>) -> Self {
        let osr = config
            .osr
            .clone()
            .map(OsrCoordinator::with_default_backend);
        Self {
            config,
            ops,
            osr,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn ops(&self) -> &dyn Operations {
        &*self.ops
    }

    pub(crate) fn osr(&self) -> Option<&OsrCoordinator> {
        self.osr.as_ref()
    }

    /// OSR counter snapshot, if OSR is enabled.
    #[must_use]
    pub fn osr_stats(&self) -> Option<OsrStats> {
        self.osr.as_ref().map(OsrCoordinator::stats)
    }

    /// Request cooperative cancellation. Running activations observe the
    /// flag at their next backward jump and unwind with an uncatchable
    /// `Cancelled` error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clear a previous cancellation request.
    pub fn reset_cancellation(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    // -- calls ------------------------------------------------------------

    /// Run a top-level unit (no free variables) to completion. Uncaught
    /// exceptions surface as the in-flight exception object, traceback
    /// and context chain intact.
    pub fn execute(&self, unit: &Arc<CompiledUnit>, args: &[Value]) -> ExecResult<Value> {
        self.activate(0, unit, &[], args, &[])
    }

    /// Call a function value from the host.
    pub fn call(
        &self,
        callee: &Value,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
    ) -> ExecResult<Value> {
        self.call_value(0, callee, args, kwargs)
    }

    /// Call a value from inside an activation at nesting `depth`.
    pub(crate) fn call_value(
        &self,
        depth: usize,
        callee: &Value,
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
    ) -> ExecResult<Value> {
        let Some(function) = callee.downcast::<Function>() else {
            return Err(ExceptionObject::new(LanguageError::type_error(format!(
                "'{}' object is not callable",
                callee.type_name()
            ))));
        };
        self.activate(depth + 1, &function.unit, &function.closure, args, kwargs)
    }

    fn activate(
        &self,
        depth: usize,
        unit: &Arc<CompiledUnit>,
        closure: &[Arc<Cell>],
        args: &[Value],
        kwargs: &[(Arc<str>, Value)],
    ) -> ExecResult<Value> {
        if depth > self.config.max_recursion_depth {
            return Err(ExceptionObject::new(LanguageError::Recursion));
        }
        let mut frame = Frame::new(Arc::clone(unit), closure).map_err(ExceptionObject::new)?;
        frame
            .bind_args(args, kwargs)
            .map_err(ExceptionObject::new)?;

        if unit.is_generator {
            // Calling a generator function builds the object; the body
            // runs only on resume.
            return Ok(Value::obj(GeneratorObject::new(frame)));
        }

        log::trace!("entering '{}' at depth {depth}", unit.name);
        match dispatch::run(self, depth, &mut frame, RunMode::Normal)? {
            Completion::Return(value) => Ok(value),
            Completion::Yield { .. } => Err(ExceptionObject::new(LanguageError::internal(
                "yield outside a generator activation",
            ))),
            Completion::OsrExit { .. } => Err(ExceptionObject::new(LanguageError::internal(
                "loop exit escaped to the activation boundary",
            ))),
        }
    }

    // -- generators -------------------------------------------------------

    /// Instantiate a generator from its unit, binding `args` without
    /// running any bytecode. Equivalent to [`Self::execute`] on a
    /// generator unit, but hands back the typed object.
    pub fn create_generator(
        &self,
        unit: &Arc<CompiledUnit>,
        args: &[Value],
    ) -> ExecResult<Arc<GeneratorObject>> {
        if !unit.is_generator {
            return Err(ExceptionObject::new(LanguageError::type_error(format!(
                "'{}' is not a generator function",
                unit.name
            ))));
        }
        let mut frame = Frame::new(Arc::clone(unit), &[]).map_err(ExceptionObject::new)?;
        frame.bind_args(args, &[]).map_err(ExceptionObject::new)?;
        Ok(GeneratorObject::new(frame))
    }

    /// Resume a generator; the suspended yield produces `None`.
    pub fn resume(&self, gen: &Value) -> ExecResult<GeneratorStep> {
        generator::resume(self, 0, Self::as_generator(gen)?, ResumeInput::Next)
    }

    /// Resume a generator with a value for the suspended yield.
    pub fn send(&self, gen: &Value, value: Value) -> ExecResult<GeneratorStep> {
        generator::resume(self, 0, Self::as_generator(gen)?, ResumeInput::Send(value))
    }

    /// Raise an error at a generator's suspended yield.
    pub fn throw_into(&self, gen: &Value, error: LanguageError) -> ExecResult<GeneratorStep> {
        generator::resume(
            self,
            0,
            Self::as_generator(gen)?,
            ResumeInput::Throw(ExceptionObject::new(error)),
        )
    }

    fn as_generator(value: &Value) -> ExecResult<&GeneratorObject> {
        value.downcast::<GeneratorObject>().ok_or_else(|| {
            ExceptionObject::new(LanguageError::type_error(format!(
                "'{}' object is not a generator",
                value.type_name()
            )))
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
