//! The bytecode dispatch loop.
//!
//! One `run` call executes one activation until it returns, suspends at
//! a yield, or exits an on-stack-replacement region. The loop decodes
//! the unit's (possibly concurrently rewritten) bytecode one instruction
//! at a time; adaptive sites specialize themselves on first execution
//! and specialized sites fall back through [`crate::quicken`] when an
//! operand shows up in an unexpected representation, completing the
//! failed instruction generically in the same step.
//!
//! Errors raised by an instruction unwind within the activation through
//! the unit's handler-range table. Only uncaught exceptions (and the
//! uncatchable ones) surface as `Err` from `run`, and they surface as
//! the in-flight exception object so traceback and context cross the
//! activation boundary intact.

use std::sync::Arc;

use lumen_core::{LanguageError, LanguageResult, Value};
use smallvec::SmallVec;

use crate::code::{BinaryOp, CodeConst, CompiledUnit, Opcode};
use crate::engine::{Engine, Function};
use crate::exception::{find_handler, to_exception, ExecResult, ExceptionObject};
use crate::frame::{Cell, Frame, Slot};
use crate::ops;
use crate::osr::LoopExit;
use crate::quicken;

/// Signal injected into a suspended generator at its resume point.
#[derive(Debug)]
pub(crate) enum ResumeSignal {
    /// Value to surface from the yield expression.
    Send(Value),
    /// Exception to raise at the yield expression.
    Throw(Arc<ExceptionObject>),
}

/// How an activation (re-)enters the loop.
#[derive(Debug)]
pub(crate) enum RunMode {
    /// Fresh activation starting at `frame.bci`.
    Normal,
    /// Generator resumption: the first instruction executed is the
    /// `ResumeYield` at `frame.bci` and it consumes the signal.
    Resume(ResumeSignal),
    /// On-stack-replacement body: behave normally but hand control back
    /// as soon as the program counter moves past `exit_after` (the
    /// backedge of the replaced loop).
    OsrLoop {
        /// Bci of the loop's backward jump.
        exit_after: u32,
    },
}

/// How an activation left the loop.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Normal completion.
    Return(Value),
    /// Generator suspension. The frame's locals, stack, and `bci` have
    /// been updated for the next resume.
    Yield {
        /// Bci of the `ResumeYield` to execute on resumption.
        resume_bci: u32,
        /// The yielded value.
        value: Value,
    },
    /// Control moved past an OSR region; interpretation continues at
    /// `bci` in the caller's loop.
    OsrExit {
        /// First bci outside the replaced region.
        bci: u32,
    },
}

/// Per-instruction outcome inside the loop.
enum Flow {
    Next,
    Jump(u32),
    Return(Value),
    SuspendAt { resume_bci: u32, value: Value },
    Raise(Arc<ExceptionObject>),
    /// Exception that already went through handler search in a nested
    /// OSR execution of this same frame; propagate without searching
    /// again.
    Propagate(Arc<ExceptionObject>),
}

/// Execute `frame` until completion.
pub(crate) fn run(
    engine: &Engine,
    depth: usize,
    frame: &mut Frame,
    mode: RunMode,
) -> ExecResult<Completion> {
    let unit = Arc::clone(&frame.unit);
    let mut bci = frame.bci;
    let mut oparg: u32 = 0;
    let (mut pending, osr_exit) = match mode {
        RunMode::Normal => (None, None),
        RunMode::Resume(signal) => (Some(signal), None),
        RunMode::OsrLoop { exit_after } => (None, Some(exit_after)),
    };

    loop {
        if let Some(exit_after) = osr_exit {
            if bci > exit_after {
                frame.bci = bci;
                return Ok(Completion::OsrExit { bci });
            }
        }

        let op = unit.opcode_at(bci).map_err(ExceptionObject::new)?;
        if op == Opcode::ExtendArg {
            oparg = (oparg | u32::from(unit.imm_at(bci))) << 8;
            bci += op.size();
            continue;
        }
        let imm = if op.has_imm() {
            oparg | u32::from(unit.imm_at(bci))
        } else {
            debug_assert_eq!(oparg, 0, "operand prefix before an operand-less opcode");
            0
        };
        oparg = 0;

        let flow = step(
            engine,
            depth,
            frame,
            &unit,
            bci,
            op,
            imm,
            &mut pending,
            osr_exit.is_some(),
        );

        match flow {
            Ok(Flow::Next) => bci += op.size(),
            Ok(Flow::Jump(target)) => bci = target,
            Ok(Flow::Return(value)) => {
                frame.bci = bci;
                return Ok(Completion::Return(value));
            }
            Ok(Flow::SuspendAt { resume_bci, value }) => {
                frame.bci = resume_bci;
                return Ok(Completion::Yield { resume_bci, value });
            }
            Ok(Flow::Raise(exc)) => bci = deliver(frame, &unit, bci, exc)?,
            Ok(Flow::Propagate(err)) => return Err(err),
            Err(err) => bci = deliver(frame, &unit, bci, ExceptionObject::new(err))?,
        }
    }
}

/// Execute a single instruction.
#[allow(clippy::too_many_arguments)]
fn step(
    engine: &Engine,
    depth: usize,
    frame: &mut Frame,
    unit: &Arc<CompiledUnit>,
    bci: u32,
    op: Opcode,
    imm: u32,
    pending: &mut Option<ResumeSignal>,
    in_osr: bool,
) -> LanguageResult<Flow> {
    match op {
        Opcode::Nop => Ok(Flow::Next),
        Opcode::ExtendArg => Err(LanguageError::internal("operand prefix reached step")),

        Opcode::Pop => {
            let _ = frame.pop();
            Ok(Flow::Next)
        }
        Opcode::Dup => {
            let top = frame.peek().clone();
            frame.push(top);
            Ok(Flow::Next)
        }

        Opcode::LoadNone => {
            frame.push(Slot::Obj(Value::None));
            Ok(Flow::Next)
        }
        Opcode::LoadTrue => {
            frame.push(Slot::Obj(Value::Bool(true)));
            Ok(Flow::Next)
        }
        Opcode::LoadFalse => {
            frame.push(Slot::Obj(Value::Bool(false)));
            Ok(Flow::Next)
        }
        Opcode::LoadConst => {
            let value = unit.consts[imm as usize].clone();
            let hint = unit.allowed_output(bci);
            let slot = match value {
                Value::Int(i) if hint.allows_int() => Slot::Int(i),
                Value::Bool(b) if hint.allows_bool() => Slot::Bool(b),
                boxed => Slot::Obj(boxed),
            };
            frame.push(slot);
            Ok(Flow::Next)
        }

        // -- local variables ---------------------------------------------

        Opcode::LoadLocal => {
            let idx = imm as u16;
            let hint = unit.allowed_output(bci);
            let tag = unit.local_tag(idx);
            match frame.local(idx) {
                Slot::Unset => Err(LanguageError::unbound_local(unit.local_name(idx))),
                Slot::Int(i) if hint.allows_int() && tag.allows_int() => {
                    let i = *i;
                    unit.rewrite(bci, Opcode::LoadLocalI);
                    frame.push(Slot::Int(i));
                    Ok(Flow::Next)
                }
                Slot::Bool(b) if hint.allows_bool() && tag.allows_bool() => {
                    let b = *b;
                    unit.rewrite(bci, Opcode::LoadLocalB);
                    frame.push(Slot::Bool(b));
                    Ok(Flow::Next)
                }
                other => {
                    let value = other.clone().into_value().ok_or_else(|| {
                        LanguageError::unbound_local(unit.local_name(idx))
                    })?;
                    unit.rewrite(bci, Opcode::LoadLocalO);
                    frame.push(Slot::Obj(value));
                    Ok(Flow::Next)
                }
            }
        }
        Opcode::LoadLocalI => {
            let idx = imm as u16;
            match frame.local(idx) {
                Slot::Int(i) => {
                    let i = *i;
                    frame.push(Slot::Int(i));
                    Ok(Flow::Next)
                }
                Slot::Unset => Err(LanguageError::unbound_local(unit.local_name(idx))),
                other => {
                    // The variable widened since this site specialized.
                    let value = other.clone().into_value().ok_or_else(|| {
                        LanguageError::unbound_local(unit.local_name(idx))
                    })?;
                    quicken::generalize_site(unit, bci);
                    frame.push(Slot::Obj(value));
                    Ok(Flow::Next)
                }
            }
        }
        Opcode::LoadLocalB => {
            let idx = imm as u16;
            match frame.local(idx) {
                Slot::Bool(b) => {
                    let b = *b;
                    frame.push(Slot::Bool(b));
                    Ok(Flow::Next)
                }
                Slot::Unset => Err(LanguageError::unbound_local(unit.local_name(idx))),
                other => {
                    let value = other.clone().into_value().ok_or_else(|| {
                        LanguageError::unbound_local(unit.local_name(idx))
                    })?;
                    quicken::generalize_site(unit, bci);
                    frame.push(Slot::Obj(value));
                    Ok(Flow::Next)
                }
            }
        }
        Opcode::LoadLocalO => {
            let idx = imm as u16;
            let value = frame
                .local(idx)
                .clone()
                .into_value()
                .ok_or_else(|| LanguageError::unbound_local(unit.local_name(idx)))?;
            frame.push(Slot::Obj(value));
            Ok(Flow::Next)
        }

        Opcode::StoreLocal => {
            let idx = imm as u16;
            let slot = frame.pop();
            let tag = unit.local_tag(idx);
            match slot {
                Slot::Int(i) if tag.allows_int() => {
                    unit.rewrite(bci, Opcode::StoreLocalI);
                    frame.set_local(idx, Slot::Int(i));
                }
                Slot::Bool(b) if tag.allows_bool() => {
                    unit.rewrite(bci, Opcode::StoreLocalB);
                    frame.set_local(idx, Slot::Bool(b));
                }
                other => {
                    let value = other
                        .into_value()
                        .ok_or_else(|| LanguageError::internal("store of an unset slot"))?;
                    unit.rewrite(bci, Opcode::StoreLocalO);
                    quicken::generalize_var_stores(unit, idx);
                    frame.set_local(idx, Slot::Obj(value));
                }
            }
            Ok(Flow::Next)
        }
        Opcode::StoreLocalI => {
            let idx = imm as u16;
            match frame.pop() {
                Slot::Int(i) if unit.local_tag(idx).allows_int() => {
                    frame.set_local(idx, Slot::Int(i));
                }
                other => {
                    let value = other
                        .into_value()
                        .ok_or_else(|| LanguageError::internal("store of an unset slot"))?;
                    quicken::generalize_var_stores(unit, idx);
                    quicken::generalize_inputs(unit, bci);
                    frame.set_local(idx, Slot::Obj(value));
                }
            }
            Ok(Flow::Next)
        }
        Opcode::StoreLocalB => {
            let idx = imm as u16;
            match frame.pop() {
                Slot::Bool(b) if unit.local_tag(idx).allows_bool() => {
                    frame.set_local(idx, Slot::Bool(b));
                }
                other => {
                    let value = other
                        .into_value()
                        .ok_or_else(|| LanguageError::internal("store of an unset slot"))?;
                    quicken::generalize_var_stores(unit, idx);
                    quicken::generalize_inputs(unit, bci);
                    frame.set_local(idx, Slot::Obj(value));
                }
            }
            Ok(Flow::Next)
        }
        Opcode::StoreLocalO => {
            let idx = imm as u16;
            let value = frame.pop_value()?;
            frame.set_local(idx, Slot::Obj(value));
            Ok(Flow::Next)
        }

        // -- cells --------------------------------------------------------

        Opcode::LoadCell => {
            let idx = imm as u16;
            let value = frame.cells[idx as usize]
                .get()
                .ok_or_else(|| LanguageError::unbound_cell(unit.cell_name(idx)))?;
            frame.push(Slot::Obj(value));
            Ok(Flow::Next)
        }
        Opcode::StoreCell => {
            let value = frame.pop_value()?;
            frame.cells[imm as usize].set(value);
            Ok(Flow::Next)
        }
        Opcode::LoadCellRef => {
            let cell = Arc::clone(&frame.cells[imm as usize]);
            frame.push(Slot::Obj(Value::obj(cell)));
            Ok(Flow::Next)
        }
        Opcode::MakeFunction => {
            let code = unit.consts[imm as usize]
                .downcast::<CodeConst>()
                .ok_or_else(|| LanguageError::internal("MakeFunction on a non-code constant"))?;
            let child = Arc::clone(&code.0);
            let nfree = child.free_names.len();
            let mut closure: Vec<Arc<Cell>> = Vec::with_capacity(nfree);
            for _ in 0..nfree {
                let value = frame.pop_value()?;
                let Value::Obj(obj) = value else {
                    return Err(LanguageError::internal("closure operand is not a cell"));
                };
                if !obj.as_any().is::<Cell>() {
                    return Err(LanguageError::internal("closure operand is not a cell"));
                }
                let cell = obj
                    .into_any()
                    .downcast::<Cell>()
                    .map_err(|_| LanguageError::internal("closure cell downcast failed"))?;
                closure.push(cell);
            }
            closure.reverse();
            let function = Function::new(child, closure.into());
            frame.push(Slot::Obj(Value::obj(Arc::new(function))));
            Ok(Flow::Next)
        }

        // -- binary operations --------------------------------------------

        Opcode::BinaryOp => {
            let operator = decode_operator(imm)?;
            let rhs = frame.pop();
            let lhs = frame.pop();
            if let (Slot::Int(a), Slot::Int(b)) = (&lhs, &rhs) {
                let (a, b) = (*a, *b);
                let hint = unit.allowed_output(bci);
                if operator.is_comparison() && hint.allows_bool() {
                    unit.rewrite(bci, Opcode::BinaryOpIIB);
                    frame.push(Slot::Bool(ops::int_compare(operator, a, b)));
                    return Ok(Flow::Next);
                }
                if matches!(
                    operator,
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::FloorDiv | BinaryOp::Mod
                ) && hint.allows_int()
                {
                    unit.rewrite(bci, Opcode::BinaryOpIII);
                    let result = ops::int_arith(operator, a, b).map(Slot::Int);
                    return int_lane(engine, frame, unit, bci, operator, result, lhs, rhs);
                }
                unit.rewrite(bci, Opcode::BinaryOpIIO);
                let result = int_boxed(operator, a, b).map(Slot::Obj);
                return int_lane(engine, frame, unit, bci, operator, result, lhs, rhs);
            }
            unit.rewrite(bci, Opcode::BinaryOpOOO);
            quicken::generalize_inputs(unit, bci);
            generic_binary(engine, frame, operator, lhs, rhs)
        }
        Opcode::BinaryOpIII => {
            let operator = decode_operator(imm)?;
            let rhs = frame.pop();
            let lhs = frame.pop();
            if let (Slot::Int(a), Slot::Int(b)) = (&lhs, &rhs) {
                let (a, b) = (*a, *b);
                let result = ops::int_arith(operator, a, b).map(Slot::Int);
                return int_lane(engine, frame, unit, bci, operator, result, lhs, rhs);
            }
            quicken::generalize_site(unit, bci);
            generic_binary(engine, frame, operator, lhs, rhs)
        }
        Opcode::BinaryOpIIB => {
            let operator = decode_operator(imm)?;
            let rhs = frame.pop();
            let lhs = frame.pop();
            if let (Slot::Int(a), Slot::Int(b)) = (&lhs, &rhs) {
                frame.push(Slot::Bool(ops::int_compare(operator, *a, *b)));
                return Ok(Flow::Next);
            }
            quicken::generalize_site(unit, bci);
            generic_binary(engine, frame, operator, lhs, rhs)
        }
        Opcode::BinaryOpIIO => {
            let operator = decode_operator(imm)?;
            let rhs = frame.pop();
            let lhs = frame.pop();
            if let (Slot::Int(a), Slot::Int(b)) = (&lhs, &rhs) {
                let (a, b) = (*a, *b);
                let result = int_boxed(operator, a, b).map(Slot::Obj);
                return int_lane(engine, frame, unit, bci, operator, result, lhs, rhs);
            }
            quicken::generalize_site(unit, bci);
            generic_binary(engine, frame, operator, lhs, rhs)
        }
        Opcode::BinaryOpOOO => {
            let operator = decode_operator(imm)?;
            let rhs = frame.pop();
            let lhs = frame.pop();
            generic_binary(engine, frame, operator, lhs, rhs)
        }

        // -- control flow -------------------------------------------------

        Opcode::JumpForward => Ok(Flow::Jump(bci + imm)),
        Opcode::JumpBackward => {
            if engine.is_cancelled() {
                return Ok(Flow::Raise(ExceptionObject::new(LanguageError::Cancelled)));
            }
            let target = bci - imm;
            if !in_osr {
                if let Some(osr) = engine.osr() {
                    if let Some(compiled) = osr.on_backedge(unit, target, bci) {
                        frame.bci = target;
                        return match compiled.execute(engine, depth, frame) {
                            Ok(LoopExit::Fallthrough(next)) => Ok(Flow::Jump(next)),
                            Ok(LoopExit::Return(value)) => Ok(Flow::Return(value)),
                            Ok(LoopExit::Yield { resume_bci, value }) => {
                                Ok(Flow::SuspendAt { resume_bci, value })
                            }
                            // Handler search already ran inside.
                            Err(exc) => Ok(Flow::Propagate(exc)),
                        };
                    }
                }
            }
            Ok(Flow::Jump(target))
        }

        Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
            let want = op == Opcode::JumpIfTrue;
            match frame.pop() {
                Slot::Bool(b) => {
                    unit.rewrite(
                        bci,
                        if want {
                            Opcode::JumpIfTrueB
                        } else {
                            Opcode::JumpIfFalseB
                        },
                    );
                    Ok(branch(b == want, bci, imm, op))
                }
                other => {
                    unit.rewrite(
                        bci,
                        if want {
                            Opcode::JumpIfTrueO
                        } else {
                            Opcode::JumpIfFalseO
                        },
                    );
                    quicken::generalize_inputs(unit, bci);
                    let value = other
                        .into_value()
                        .ok_or_else(|| LanguageError::internal("branch on an unset slot"))?;
                    let truth = engine.ops().truthy(&value)?;
                    Ok(branch(truth == want, bci, imm, op))
                }
            }
        }
        Opcode::JumpIfFalseB | Opcode::JumpIfTrueB => {
            let want = op == Opcode::JumpIfTrueB;
            match frame.pop() {
                Slot::Bool(b) => Ok(branch(b == want, bci, imm, op)),
                other => {
                    quicken::generalize_site(unit, bci);
                    let value = other
                        .into_value()
                        .ok_or_else(|| LanguageError::internal("branch on an unset slot"))?;
                    let truth = engine.ops().truthy(&value)?;
                    Ok(branch(truth == want, bci, imm, op))
                }
            }
        }
        Opcode::JumpIfFalseO | Opcode::JumpIfTrueO => {
            let want = op == Opcode::JumpIfTrueO;
            let value = frame
                .pop()
                .into_value()
                .ok_or_else(|| LanguageError::internal("branch on an unset slot"))?;
            let truth = engine.ops().truthy(&value)?;
            Ok(branch(truth == want, bci, imm, op))
        }

        // -- calls --------------------------------------------------------

        Opcode::CallFunction => {
            let argc = imm as usize;
            let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(argc);
            for _ in 0..argc {
                args.push(frame.pop_value()?);
            }
            args.reverse();
            let callee = frame.pop_value()?;
            match engine.call_value(depth, &callee, &args, &[]) {
                Ok(result) => {
                    frame.push(Slot::Obj(result));
                    Ok(Flow::Next)
                }
                Err(exc) => Ok(Flow::Raise(exc)),
            }
        }
        Opcode::CallVarargs => {
            let packed = frame.pop_value()?;
            let Value::Tuple(args) = packed else {
                return Err(LanguageError::type_error(format!(
                    "argument unpacking requires a tuple, not '{}'",
                    packed.type_name()
                )));
            };
            let callee = frame.pop_value()?;
            match engine.call_value(depth, &callee, &args, &[]) {
                Ok(result) => {
                    frame.push(Slot::Obj(result));
                    Ok(Flow::Next)
                }
                Err(exc) => Ok(Flow::Raise(exc)),
            }
        }
        Opcode::CallKeywords => {
            let packed = frame.pop_value()?;
            let Value::Tuple(pairs) = packed else {
                return Err(LanguageError::internal("keyword operand is not a tuple"));
            };
            if pairs.len() % 2 != 0 {
                return Err(LanguageError::internal("odd keyword pair tuple"));
            }
            let mut kwargs: Vec<(Arc<str>, Value)> = Vec::with_capacity(pairs.len() / 2);
            for chunk in pairs.chunks(2) {
                let Value::Str(name) = &chunk[0] else {
                    return Err(LanguageError::internal("keyword name is not a string"));
                };
                kwargs.push((Arc::clone(name), chunk[1].clone()));
            }
            let argc = imm as usize;
            let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(argc);
            for _ in 0..argc {
                args.push(frame.pop_value()?);
            }
            args.reverse();
            let callee = frame.pop_value()?;
            match engine.call_value(depth, &callee, &args, &kwargs) {
                Ok(result) => {
                    frame.push(Slot::Obj(result));
                    Ok(Flow::Next)
                }
                Err(exc) => Ok(Flow::Raise(exc)),
            }
        }

        // -- completion and exceptions ------------------------------------

        Opcode::Return => Ok(Flow::Return(frame.pop_value()?)),

        Opcode::Yield => {
            let value = frame.pop_value()?;
            Ok(Flow::SuspendAt {
                resume_bci: bci + op.size(),
                value,
            })
        }
        Opcode::ResumeYield => match pending.take() {
            Some(ResumeSignal::Send(value)) => {
                frame.push(Slot::Obj(value));
                Ok(Flow::Next)
            }
            Some(ResumeSignal::Throw(exc)) => Ok(Flow::Raise(exc)),
            None => Err(LanguageError::internal(
                "resume point reached without a pending signal",
            )),
        },

        Opcode::Raise => {
            let value = frame.pop_value()?;
            match to_exception(value) {
                Ok(exc) => Ok(Flow::Raise(exc)),
                Err(err) => Ok(Flow::Raise(ExceptionObject::new(err))),
            }
        }
        Opcode::PopExcept => {
            let saved = frame.pop_value()?;
            frame.active_exc = match saved {
                Value::None => None,
                value => Some(value),
            };
            Ok(Flow::Next)
        }
        Opcode::EndExcHandler => {
            let current = frame.pop_value()?;
            let saved = frame.pop_value()?;
            frame.active_exc = match saved {
                Value::None => None,
                value => Some(value),
            };
            match to_exception(current) {
                Ok(exc) => Ok(Flow::Raise(exc)),
                Err(err) => Ok(Flow::Raise(ExceptionObject::new(err))),
            }
        }
    }
}

/// Unwind within the frame: find the innermost enclosing handler, set
/// up its stack discipline, and return its entry bci. Errors that are
/// uncatchable or uncaught leave the activation as `Err`.
fn deliver(
    frame: &mut Frame,
    unit: &Arc<CompiledUnit>,
    bci: u32,
    exc: Arc<ExceptionObject>,
) -> ExecResult<u32> {
    frame.bci = bci;

    // Implicit chaining: raising while another exception is being
    // handled links the two. This happens at the raise point, before
    // handler lookup, so the chain is visible wherever the exception is
    // eventually caught.
    let prev = frame.active_exc.clone().unwrap_or(Value::None);
    if let Ok(prev_exc) = to_exception(prev.clone()) {
        exc.chain_context(prev_exc);
    }

    if !exc.error.is_catchable() {
        return Err(uncaught(unit, bci, &exc));
    }
    let Some(range) = find_handler(unit, bci) else {
        return Err(uncaught(unit, bci, &exc));
    };

    frame.truncate_stack(range.stack_depth);
    let exc_value = Value::obj(Arc::clone(&exc));
    frame.active_exc = Some(exc_value.clone());
    frame.push(Slot::Obj(prev));
    frame.push(Slot::Obj(exc_value));
    log::trace!(
        "{}@{bci}: {} handled at bci {}",
        unit.name,
        exc.error.kind_name(),
        range.handler
    );
    Ok(range.handler)
}

fn uncaught(
    unit: &Arc<CompiledUnit>,
    bci: u32,
    exc: &Arc<ExceptionObject>,
) -> Arc<ExceptionObject> {
    exc.push_traceback(Arc::clone(&unit.name), unit.bci_to_line(bci), bci);
    log::debug!(
        "uncaught {} leaving '{}' at bci {bci}",
        exc.error.kind_name(),
        unit.name
    );
    Arc::clone(exc)
}

fn branch(take: bool, bci: u32, delta: u32, op: Opcode) -> Flow {
    if take {
        Flow::Jump(bci + delta)
    } else {
        Flow::Jump(bci + op.size())
    }
}

fn decode_operator(imm: u32) -> LanguageResult<BinaryOp> {
    BinaryOp::from_byte(imm as u8)
        .ok_or_else(|| LanguageError::internal(format!("unknown binary operator {imm}")))
}

/// Finish an int × int arithmetic site. The operation layer owns
/// arithmetic semantics, so overflow is not raised from the unboxed
/// lane: the site and its producers generalize and the instruction
/// retries through [`Operations::binary`] within the same step. Other
/// errors (zero division) raise directly; the generic lane would
/// produce the identical error.
///
/// [`Operations::binary`]: crate::ops::Operations::binary
#[allow(clippy::too_many_arguments)]
fn int_lane(
    engine: &Engine,
    frame: &mut Frame,
    unit: &Arc<CompiledUnit>,
    bci: u32,
    operator: BinaryOp,
    result: LanguageResult<Slot>,
    lhs: Slot,
    rhs: Slot,
) -> LanguageResult<Flow> {
    match result {
        Ok(slot) => {
            frame.push(slot);
            Ok(Flow::Next)
        }
        Err(LanguageError::Overflow { .. }) => {
            quicken::generalize_site(unit, bci);
            generic_binary(engine, frame, operator, lhs, rhs)
        }
        Err(err) => Err(err),
    }
}

/// int × int with a boxed result (true division, or any operator whose
/// unboxed output the hint forbids).
fn int_boxed(operator: BinaryOp, a: i64, b: i64) -> LanguageResult<Value> {
    Ok(match operator {
        BinaryOp::TrueDiv => Value::Float(ops::int_truediv(a, b)?),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::FloorDiv | BinaryOp::Mod => {
            Value::Int(ops::int_arith(operator, a, b)?)
        }
        _ => Value::Bool(ops::int_compare(operator, a, b)),
    })
}

/// Complete a binary instruction generically after (or instead of)
/// specialization.
fn generic_binary(
    engine: &Engine,
    frame: &mut Frame,
    operator: BinaryOp,
    lhs: Slot,
    rhs: Slot,
) -> LanguageResult<Flow> {
    let lhs = lhs
        .into_value()
        .ok_or_else(|| LanguageError::internal("binary operand is unset"))?;
    let rhs = rhs
        .into_value()
        .ok_or_else(|| LanguageError::internal("binary operand is unset"))?;
    let result = engine.ops().binary(operator, &lhs, &rhs)?;
    frame.push(Slot::Obj(result));
    Ok(Flow::Next)
}
