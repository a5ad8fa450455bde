//! Lumen's bytecode execution engine.
//!
//! The crate centers on a quickening interpreter: bytecode sites start
//! in an adaptive form, rewrite themselves in place toward unboxed
//! specializations as they observe operand representations, and fall
//! back to generic forms when speculation fails. Around that loop sit
//! range-based exception unwinding, suspendable generator activations,
//! and on-stack replacement of hot loops behind a pluggable backend.
//!
//! Typical use: assemble a [`code::CompiledUnit`] with
//! [`code::UnitBuilder`], then run it through an [`engine::Engine`].
//!
//! ```
//! use lumen_core::Value;
//! use lumen_vm::code::{BinaryOp, Opcode, UnitBuilder};
//! use lumen_vm::engine::Engine;
//!
//! let mut b = UnitBuilder::new("double");
//! let x = b.param("x");
//! b.op1(Opcode::LoadLocal, u32::from(x));
//! b.op1(Opcode::LoadLocal, u32::from(x));
//! b.binary(BinaryOp::Add);
//! b.op(Opcode::Return);
//! let unit = b.build();
//!
//! let engine = Engine::new();
//! let result = engine.execute(&unit, &[Value::Int(21)]).unwrap();
//! assert_eq!(result.as_int(), Some(42));
//! ```

pub mod code;
mod dispatch;
pub mod engine;
pub mod exception;
pub mod frame;
pub mod generator;
pub mod ops;
pub mod osr;
mod quicken;

pub use code::{BinaryOp, CompiledUnit, Opcode, UnitBuilder};
pub use engine::{Engine, EngineConfig, Function};
pub use exception::{ExecResult, ExceptionObject};
pub use generator::{GenState, GeneratorObject, GeneratorStep};
pub use ops::{DefaultOperations, Operations};
pub use osr::{OsrConfig, OsrStats};
