//! Core value and error types shared across the Lumen runtime.
//!
//! This crate is the leaf of the workspace: it defines the boxed value
//! representation the execution engine traffics in, the language-level
//! error hierarchy, and the slot-representation tags used by the
//! interpreter's quickening machinery. It knows nothing about bytecode,
//! frames, or the engine itself.

pub mod error;
pub mod tags;
pub mod value;

pub use error::{LanguageError, LanguageResult};
pub use value::{Object, Value};
