//! Compiled units and the instruction set.
//!
//! A [`CompiledUnit`] is the sole contract between the front-end compiler
//! and the engine: bytecode plus the tables the dispatch loop, unwinder,
//! and quickening machinery consume. The unit is immutable except for two
//! kinds of controlled site state, both monotonic and idempotent so
//! racing activations need no locking:
//!
//! - the bytecode bytes themselves (`AtomicU8`), rewritten in place by
//!   quickening (adaptive → specialized → generic, never back);
//! - one representation tag per local variable, narrowed toward the
//!   boxed representation as store-site speculation fails.
//!
//! [`UnitBuilder`] stands in for the external compiler: it assembles
//! bytecode, resolves jump offsets, and runs the linear def-use pass that
//! produces the static generalize-dependency maps and permitted-output
//! hints. The engine treats those maps as read-only input and never
//! recomputes them.

use std::any::Any;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use lumen_core::tags::TagSet;
use lumen_core::{LanguageError, Object, Value};
use rustc_hash::FxHashMap;

/// Fresh unit ids, used as the static half of OSR loop keys.
static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Opcodes
// =============================================================================

/// Bytecode operations.
///
/// Adaptive opcodes (`LoadLocal`, `StoreLocal`, `BinaryOp`, `JumpIfFalse`,
/// `JumpIfTrue`) rewrite themselves on first execution to a specialized
/// form matching the observed operand representations, or to their generic
/// `…O` form. Generic forms never re-specialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// No operation.
    Nop = 0,
    /// Pop and discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Push `None`.
    LoadNone,
    /// Push boxed `True`.
    LoadTrue,
    /// Push boxed `False`.
    LoadFalse,
    /// Push a constant. Immediate: constant index.
    LoadConst,
    /// Pop the return value and leave the activation.
    Return,
    /// Pop an exception value and raise it.
    Raise,
    /// Pop the saved previous exception and restore it as active.
    PopExcept,
    /// Restore the saved previous exception and re-raise the current one.
    /// Stack on entry: `[saved_previous, current]`.
    EndExcHandler,
    /// Pop a value and suspend the generator with it.
    Yield,
    /// Push the injected resume signal (or raise a thrown exception).
    /// Always the instruction at a yield's resume point.
    ResumeYield,
    /// Accumulate a high operand byte for the next instruction.
    ExtendArg,

    /// Adaptive local load. Immediate: local index.
    LoadLocal,
    /// Boxed local load.
    LoadLocalO,
    /// Unboxed int local load.
    LoadLocalI,
    /// Unboxed bool local load.
    LoadLocalB,
    /// Adaptive local store. Immediate: local index.
    StoreLocal,
    /// Boxed local store.
    StoreLocalO,
    /// Unboxed int local store.
    StoreLocalI,
    /// Unboxed bool local store.
    StoreLocalB,

    /// Load through a closure cell. Immediate: cell index
    /// (cell variables first, then free variables).
    LoadCell,
    /// Store through a closure cell.
    StoreCell,
    /// Push the cell itself (for closure construction).
    LoadCellRef,
    /// Build a function from a code constant plus captured cells.
    /// Immediate: constant index of a [`CodeConst`]. Pops one cell ref
    /// per free variable of the child unit, last-pushed on top.
    MakeFunction,

    /// Adaptive binary operation. Immediate: a [`BinaryOp`].
    BinaryOp,
    /// Generic boxed binary operation.
    BinaryOpOOO,
    /// int × int → int, overflow-checked.
    BinaryOpIII,
    /// int × int → bool (comparisons).
    BinaryOpIIB,
    /// int × int → boxed result (true division).
    BinaryOpIIO,

    /// Unconditional forward jump. Immediate: bci delta.
    JumpForward,
    /// Unconditional backward jump (loop backedge). Immediate: bci delta.
    JumpBackward,
    /// Adaptive pop-and-branch-if-false. Immediate: forward delta.
    JumpIfFalse,
    /// Boxed conditional branch (consults the operation layer for truth).
    JumpIfFalseO,
    /// Unboxed bool conditional branch.
    JumpIfFalseB,
    /// Adaptive pop-and-branch-if-true.
    JumpIfTrue,
    /// Boxed variant.
    JumpIfTrueO,
    /// Unboxed bool variant.
    JumpIfTrueB,

    /// Call with 0–4 fixed arguments. Immediate: argument count.
    /// Stack: `[callee, arg0 .. argN-1]`.
    CallFunction,
    /// Call with an argument tuple. Stack: `[callee, args_tuple]`.
    CallVarargs,
    /// Call with fixed arguments plus keyword pairs. Immediate:
    /// positional count. Stack: `[callee, args.., kwpairs_tuple]` where
    /// the tuple alternates name and value.
    CallKeywords,
}

impl Opcode {
    const MAX: u8 = Opcode::CallKeywords as u8;

    /// Decode a raw byte.
    #[inline]
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte <= Self::MAX {
            // Safety: repr(u8), contiguous discriminants starting at 0.
            Some(unsafe { std::mem::transmute::<u8, Opcode>(byte) })
        } else {
            None
        }
    }

    /// Whether the instruction carries an immediate operand byte.
    #[must_use]
    pub const fn has_imm(self) -> bool {
        matches!(
            self,
            Self::LoadConst
                | Self::ExtendArg
                | Self::LoadLocal
                | Self::LoadLocalO
                | Self::LoadLocalI
                | Self::LoadLocalB
                | Self::StoreLocal
                | Self::StoreLocalO
                | Self::StoreLocalI
                | Self::StoreLocalB
                | Self::LoadCell
                | Self::StoreCell
                | Self::LoadCellRef
                | Self::MakeFunction
                | Self::BinaryOp
                | Self::BinaryOpOOO
                | Self::BinaryOpIII
                | Self::BinaryOpIIB
                | Self::BinaryOpIIO
                | Self::JumpForward
                | Self::JumpBackward
                | Self::JumpIfFalse
                | Self::JumpIfFalseO
                | Self::JumpIfFalseB
                | Self::JumpIfTrue
                | Self::JumpIfTrueO
                | Self::JumpIfTrueB
                | Self::CallFunction
                | Self::CallKeywords
        )
    }

    /// Instruction size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u32 {
        if self.has_imm() { 2 } else { 1 }
    }

    /// The generic form a specialized site reverts to, if any.
    /// Adaptive and generic forms return `None` (adaptive sites re-adapt
    /// on their next execution; generic sites stay generic).
    #[must_use]
    pub const fn generalizes_to(self) -> Option<Self> {
        match self {
            Self::LoadLocalI | Self::LoadLocalB => Some(Self::LoadLocalO),
            Self::StoreLocalI | Self::StoreLocalB => Some(Self::StoreLocalO),
            Self::BinaryOpIII | Self::BinaryOpIIB | Self::BinaryOpIIO => Some(Self::BinaryOpOOO),
            Self::JumpIfFalseB => Some(Self::JumpIfFalseO),
            Self::JumpIfTrueB => Some(Self::JumpIfTrueO),
            _ => None,
        }
    }
}

/// Binary operator selector carried as the immediate of the
/// `BinaryOp` opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryOp {
    /// Addition / concatenation.
    Add = 0,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Floor division.
    FloorDiv,
    /// Modulo.
    Mod,
    /// True division (always produces a float for ints).
    TrueDiv,
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Less-than.
    Lt,
    /// Less-or-equal.
    Le,
    /// Greater-than.
    Gt,
    /// Greater-or-equal.
    Ge,
}

impl BinaryOp {
    /// Decode a raw immediate byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte <= Self::Ge as u8 {
            // Safety: repr(u8), contiguous discriminants starting at 0.
            Some(unsafe { std::mem::transmute::<u8, BinaryOp>(byte) })
        } else {
            None
        }
    }

    /// Whether the operator compares (specializes int × int → bool).
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Operator glyph for error messages.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::TrueDiv => "/",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

// =============================================================================
// Handler ranges
// =============================================================================

/// A protected bytecode region and its handler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    /// First protected bci (inclusive).
    pub start: u32,
    /// End of the protected region (exclusive).
    pub end: u32,
    /// Handler entry bci.
    pub handler: u32,
    /// Operand stack depth on entry to the protected region. The
    /// unwinder truncates to exactly this depth before pushing the
    /// exception state.
    pub stack_depth: u16,
}

impl HandlerRange {
    /// Whether `bci` lies inside the protected region.
    #[inline]
    #[must_use]
    pub const fn contains(&self, bci: u32) -> bool {
        self.start <= bci && bci < self.end
    }
}

// =============================================================================
// Compiled unit
// =============================================================================

/// An immutable compiled program plus its metadata tables, shared by
/// every activation of the function it describes.
pub struct CompiledUnit {
    /// Unique id; the static half of OSR loop keys.
    pub id: u64,
    /// Function name, used in tracebacks.
    pub name: Arc<str>,
    /// Bytecode. Atomic bytes are the per-site quickening state.
    bytecode: Box<[AtomicU8]>,
    /// Constant pool.
    pub consts: Box<[Value]>,
    /// Local variable names; arguments bind to the leading entries.
    pub local_names: Box<[Arc<str>]>,
    /// Cell variable names (locals captured by nested closures).
    pub cell_names: Box<[Arc<str>]>,
    /// Free variable names (cells received from the enclosing closure).
    pub free_names: Box<[Arc<str>]>,
    /// For each cell variable, the argument index it is pre-seeded from,
    /// or -1.
    pub cell2arg: Box<[i32]>,
    /// Exception handler ranges, sorted by start.
    pub handlers: Box<[HandlerRange]>,
    /// Number of declared parameters.
    pub param_count: u16,
    /// Maximum operand stack depth.
    pub stack_size: u16,
    /// Whether activations suspend instead of completing eagerly.
    pub is_generator: bool,
    /// Static permitted-output hint per bci ([`TagSet`] bits).
    allowed_output: Box<[u8]>,
    /// consumer bci → producer bcis to generalize alongside it.
    generalize_inputs: FxHashMap<u32, Box<[u32]>>,
    /// local index → store bcis to generalize when the variable widens.
    generalize_var_stores: FxHashMap<u16, Box<[u32]>>,
    /// Runtime representation tag per local variable.
    local_tags: Box<[AtomicU8]>,
    /// Sorted (bci, source line) pairs.
    line_table: Box<[(u32, u32)]>,
}

impl std::fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("len", &self.bytecode.len())
            .field("is_generator", &self.is_generator)
            .finish_non_exhaustive()
    }
}

impl CompiledUnit {
    /// Bytecode length in bytes.
    #[inline]
    #[must_use]
    pub fn code_len(&self) -> u32 {
        self.bytecode.len() as u32
    }

    /// Raw byte at `bci`.
    #[inline]
    #[must_use]
    pub fn byte_at(&self, bci: u32) -> u8 {
        self.bytecode[bci as usize].load(Ordering::Relaxed)
    }

    /// Decoded opcode at `bci`. A byte that does not decode is a corrupt
    /// unit: fatal, never delivered to language handlers.
    pub fn opcode_at(&self, bci: u32) -> Result<Opcode, LanguageError> {
        let byte = self.byte_at(bci);
        Opcode::from_byte(byte)
            .ok_or_else(|| LanguageError::internal(format!("unknown opcode {byte:#04x} at bci {bci}")))
    }

    /// Immediate operand byte of the instruction at `bci`.
    #[inline]
    #[must_use]
    pub fn imm_at(&self, bci: u32) -> u8 {
        self.bytecode[bci as usize + 1].load(Ordering::Relaxed)
    }

    /// Rewrite the instruction at `bci` in place. Racing rewrites are
    /// harmless: transitions are monotonic and idempotent.
    #[inline]
    pub fn rewrite(&self, bci: u32, op: Opcode) {
        self.bytecode[bci as usize].store(op as u8, Ordering::Relaxed);
    }

    /// Static permitted-output hint for the instruction at `bci`.
    #[inline]
    #[must_use]
    pub fn allowed_output(&self, bci: u32) -> TagSet {
        TagSet::from_bits(self.allowed_output[bci as usize])
    }

    /// Producer sites to generalize together with the site at `bci`.
    #[must_use]
    pub fn generalize_inputs_of(&self, bci: u32) -> &[u32] {
        self.generalize_inputs
            .get(&bci)
            .map_or(&[], |sites| &sites[..])
    }

    /// Store sites of a local variable.
    #[must_use]
    pub fn stores_of_local(&self, index: u16) -> &[u32] {
        self.generalize_var_stores
            .get(&index)
            .map_or(&[], |sites| &sites[..])
    }

    /// Current representation tag of a local variable.
    #[inline]
    #[must_use]
    pub fn local_tag(&self, index: u16) -> TagSet {
        TagSet::from_bits(self.local_tags[index as usize].load(Ordering::Relaxed))
    }

    /// Widen a local variable to the boxed representation.
    #[inline]
    pub fn widen_local_tag(&self, index: u16) {
        self.local_tags[index as usize].store(TagSet::OBJECT.bits(), Ordering::Relaxed);
    }

    /// Total cell count (cell variables plus free variables).
    #[inline]
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cell_names.len() + self.free_names.len()
    }

    /// Map a bci to its source line via the position table.
    #[must_use]
    pub fn bci_to_line(&self, bci: u32) -> Option<u32> {
        let idx = self.line_table.partition_point(|&(b, _)| b <= bci);
        idx.checked_sub(1).map(|i| self.line_table[i].1)
    }

    /// Name of a local variable, for error messages.
    #[must_use]
    pub fn local_name(&self, index: u16) -> &str {
        &self.local_names[index as usize]
    }

    /// Name of a cell (cell variables first, then free variables).
    #[must_use]
    pub fn cell_name(&self, index: u16) -> &str {
        let index = index as usize;
        if index < self.cell_names.len() {
            &self.cell_names[index]
        } else {
            &self.free_names[index - self.cell_names.len()]
        }
    }
}

/// A nested compiled unit stored in a constant pool, consumed by
/// `MakeFunction`.
#[derive(Debug)]
pub struct CodeConst(pub Arc<CompiledUnit>);

impl Object for CodeConst {
    fn type_name(&self) -> &'static str {
        "code"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Builder
// =============================================================================

/// A forward-jump patch site.
#[derive(Debug, Clone, Copy)]
#[must_use = "unbound labels leave a zero-length jump"]
pub struct Label(u32);

/// Assembles a [`CompiledUnit`].
///
/// Jump immediates are bci deltas relative to the jump instruction
/// itself: forward jumps add, backward jumps subtract. Operands wider
/// than one byte are emitted through `ExtendArg` prefixes.
pub struct UnitBuilder {
    name: Arc<str>,
    code: Vec<u8>,
    consts: Vec<Value>,
    local_names: Vec<Arc<str>>,
    cell_names: Vec<Arc<str>>,
    free_names: Vec<Arc<str>>,
    cell2arg: Vec<i32>,
    handlers: Vec<HandlerRange>,
    param_count: u16,
    is_generator: bool,
    lines: Vec<(u32, u32)>,
    /// Free-variable counts of code constants, for the def-use pass.
    code_free_counts: FxHashMap<u16, usize>,
}

impl UnitBuilder {
    /// Start a new unit.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            consts: Vec::new(),
            local_names: Vec::new(),
            cell_names: Vec::new(),
            free_names: Vec::new(),
            cell2arg: Vec::new(),
            handlers: Vec::new(),
            param_count: 0,
            is_generator: false,
            lines: Vec::new(),
            code_free_counts: FxHashMap::default(),
        }
    }

    /// Mark the unit as a generator.
    pub fn generator(&mut self) -> &mut Self {
        self.is_generator = true;
        self
    }

    /// Declare a parameter (binds to the next local slot).
    pub fn param(&mut self, name: &str) -> u16 {
        assert_eq!(
            self.param_count as usize,
            self.local_names.len(),
            "declare parameters before plain locals"
        );
        self.param_count += 1;
        self.local(name)
    }

    /// Declare a plain local.
    pub fn local(&mut self, name: &str) -> u16 {
        self.local_names.push(Arc::from(name));
        (self.local_names.len() - 1) as u16
    }

    /// Declare a cell variable (captured local).
    pub fn cell_var(&mut self, name: &str) -> u16 {
        self.cell_names.push(Arc::from(name));
        self.cell2arg.push(-1);
        (self.cell_names.len() - 1) as u16
    }

    /// Declare a cell variable pre-seeded from an argument slot.
    pub fn cell_for_param(&mut self, name: &str, arg: u16) -> u16 {
        self.cell_names.push(Arc::from(name));
        self.cell2arg.push(i32::from(arg));
        (self.cell_names.len() - 1) as u16
    }

    /// Declare a free variable (cell received from the closure).
    /// Returns the combined cell index used by the cell opcodes.
    pub fn free_var(&mut self, name: &str) -> u16 {
        self.free_names.push(Arc::from(name));
        (self.cell_names.len() + self.free_names.len() - 1) as u16
    }

    /// Intern a constant.
    pub fn const_(&mut self, value: Value) -> u16 {
        self.consts.push(value);
        (self.consts.len() - 1) as u16
    }

    /// Intern a nested code object.
    pub fn code_const(&mut self, unit: Arc<CompiledUnit>) -> u16 {
        let free = unit.free_names.len();
        let idx = self.const_(Value::obj(Arc::new(CodeConst(unit))));
        self.code_free_counts.insert(idx, free);
        idx
    }

    /// Current bci.
    #[must_use]
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Record the source line for subsequent instructions.
    pub fn line(&mut self, line: u32) {
        self.lines.push((self.here(), line));
    }

    /// Emit an operand-less instruction.
    pub fn op(&mut self, op: Opcode) -> u32 {
        debug_assert!(!op.has_imm(), "{op:?} takes an operand");
        let bci = self.here();
        self.code.push(op as u8);
        bci
    }

    /// Emit an instruction with an operand, prefixing `ExtendArg` bytes
    /// as needed. Returns the bci of the instruction itself.
    pub fn op1(&mut self, op: Opcode, operand: u32) -> u32 {
        debug_assert!(op.has_imm(), "{op:?} takes no operand");
        if operand > 0xFF {
            self.op1(Opcode::ExtendArg, operand >> 8);
        }
        let bci = self.here();
        self.code.push(op as u8);
        self.code.push((operand & 0xFF) as u8);
        bci
    }

    /// Emit a binary operation.
    pub fn binary(&mut self, op: BinaryOp) -> u32 {
        self.op1(Opcode::BinaryOp, op as u32)
    }

    /// Emit a forward jump with an unresolved target.
    ///
    /// The displacement patched in by [`Self::bind`] must fit the single
    /// operand byte reserved here (a branch of at most 255 bytes); a
    /// wider region needs an intermediate jump. `ExtendArg` prefixes
    /// cannot be retrofitted, since inserting bytes would shift every
    /// bci already referenced by labels and handler ranges.
    pub fn jump(&mut self, op: Opcode) -> Label {
        Label(self.op1(op, 0))
    }

    /// Resolve a forward jump to the current bci. Panics if the
    /// displacement exceeds the operand byte reserved by [`Self::jump`].
    pub fn bind(&mut self, label: Label) {
        let delta = self.here() - label.0;
        assert!(
            delta <= 0xFF,
            "forward branch displacement {delta} exceeds one operand byte; \
             split the region with an intermediate jump"
        );
        self.code[label.0 as usize + 1] = delta as u8;
    }

    /// Emit a backward jump to an already-emitted target bci. The same
    /// one-byte displacement limit as [`Self::jump`] applies.
    pub fn jump_back(&mut self, target: u32) -> u32 {
        let bci = self.here();
        let delta = bci - target;
        assert!(
            delta <= 0xFF,
            "backward branch displacement {delta} exceeds one operand byte; \
             split the loop body with an intermediate jump"
        );
        self.op1(Opcode::JumpBackward, delta)
    }

    /// Declare a protected region. `stack_depth` is the operand stack
    /// depth on entry to the region.
    pub fn handler(&mut self, start: u32, end: u32, handler: u32, stack_depth: u16) {
        self.handlers.push(HandlerRange {
            start,
            end,
            handler,
            stack_depth,
        });
    }

    /// Finish the unit: validates the handler table, runs the def-use
    /// pass, and freezes everything.
    pub fn build(mut self) -> Arc<CompiledUnit> {
        self.handlers.sort_by_key(|r| (r.start, std::cmp::Reverse(r.end)));
        for pair in self.handlers.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(
                b.start >= a.end || b.end <= a.end,
                "handler ranges must nest or be disjoint: {a:?} vs {b:?}"
            );
        }

        let analysis = DefUsePass::run(&self.code, &self.code_free_counts, &self.handlers);

        let bytecode: Box<[AtomicU8]> = self.code.iter().map(|&b| AtomicU8::new(b)).collect();
        let local_tags: Box<[AtomicU8]> = self
            .local_names
            .iter()
            .map(|_| AtomicU8::new(TagSet::ALL.bits()))
            .collect();

        Arc::new(CompiledUnit {
            id: NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            bytecode,
            consts: self.consts.into(),
            local_names: self.local_names.into(),
            cell_names: self.cell_names.into(),
            free_names: self.free_names.into(),
            cell2arg: self.cell2arg.into(),
            handlers: self.handlers.into(),
            param_count: self.param_count,
            stack_size: analysis.max_depth,
            is_generator: self.is_generator,
            allowed_output: analysis.allowed_output,
            generalize_inputs: analysis.generalize_inputs,
            generalize_var_stores: analysis.generalize_var_stores,
            local_tags,
            line_table: self.lines.into(),
        })
    }
}

// =============================================================================
// Def-use pass
// =============================================================================

struct DefUsePass {
    max_depth: u16,
    allowed_output: Box<[u8]>,
    generalize_inputs: FxHashMap<u32, Box<[u32]>>,
    generalize_var_stores: FxHashMap<u16, Box<[u32]>>,
}

impl DefUsePass {
    /// One linear walk over the bytecode tracking, per operand-stack
    /// slot, the bci that produced it. Control-flow merge points (any
    /// jump target or handler entry) forget producers, which loses
    /// precision but never soundness: a consumer with an unknown
    /// producer simply records no dependency and the producer keeps its
    /// unconstrained hint; generic consumers widen unboxed slots on
    /// their own.
    fn run(code: &[u8], code_free_counts: &FxHashMap<u16, usize>, handlers: &[HandlerRange]) -> Self {
        let mut targets = vec![false; code.len() + 1];
        let mut allowed = vec![TagSet::default().bits(); code.len()];
        let mut inputs: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
        let mut var_stores: FxHashMap<u16, Vec<u32>> = FxHashMap::default();

        // Handler entries execute with the declared stack depth plus the
        // saved and raised exception pushed by the unwinder.
        let mut entry_depths: FxHashMap<u32, usize> = FxHashMap::default();
        for range in handlers {
            targets[range.handler as usize] = true;
            let depth = range.stack_depth as usize + 2;
            let slot = entry_depths.entry(range.handler).or_insert(depth);
            *slot = (*slot).max(depth);
        }

        // First walk: jump targets.
        Self::walk(code, |bci, op, oparg| {
            match op {
                Opcode::JumpForward | Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                    targets[(bci + oparg) as usize] = true;
                }
                Opcode::JumpBackward => {
                    targets[(bci - oparg) as usize] = true;
                }
                _ => {}
            }
        });

        // Second walk: symbolic stack of producer bcis.
        let mut sym: Vec<Option<u32>> = Vec::new();
        let mut max_depth = 0usize;
        Self::walk(code, |bci, op, oparg| {
            if let Some(&depth) = entry_depths.get(&bci) {
                sym.clear();
                sym.resize(depth, None);
                max_depth = max_depth.max(depth);
            } else if targets[bci as usize] {
                for slot in sym.iter_mut() {
                    *slot = None;
                }
            }
            let (pops, pushes) = Self::effect(op, oparg, code_free_counts);
            let mut popped = SmallVecPopped::default();
            for _ in 0..pops {
                popped.push(sym.pop().flatten());
            }

            match op {
                // Quickenable consumers: record producer dependencies and
                // the representations they accept.
                Opcode::StoreLocal | Opcode::BinaryOp => {
                    let mut deps = Vec::new();
                    for p in popped.iter().flatten() {
                        deps.push(*p);
                        allowed[*p as usize] = TagSet::from_bits(allowed[*p as usize])
                            .union(TagSet::ALL)
                            .bits();
                    }
                    if !deps.is_empty() {
                        deps.sort_unstable();
                        inputs.insert(bci, deps);
                    }
                    if op == Opcode::StoreLocal {
                        var_stores.entry(oparg as u16).or_default().push(bci);
                    }
                }
                Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                    let mut deps = Vec::new();
                    for p in popped.iter().flatten() {
                        deps.push(*p);
                        allowed[*p as usize] = TagSet::from_bits(allowed[*p as usize])
                            .union(TagSet::OBJECT.union(TagSet::BOOL))
                            .bits();
                    }
                    if !deps.is_empty() {
                        inputs.insert(bci, deps);
                    }
                }
                // Every other consumer needs boxed operands.
                _ => {
                    for p in popped.iter().flatten() {
                        allowed[*p as usize] = TagSet::from_bits(allowed[*p as usize])
                            .union(TagSet::OBJECT)
                            .bits();
                    }
                }
            }

            for _ in 0..pushes {
                // Only adaptive sites are interesting producers.
                let producer = matches!(
                    op,
                    Opcode::LoadLocal | Opcode::BinaryOp | Opcode::LoadConst
                )
                .then_some(bci);
                sym.push(producer);
            }
            max_depth = max_depth.max(sym.len());
        });

        // A producer nobody constrained was never consumed on a tracked
        // path; leave it unrestricted (it may still quicken, and generic
        // consumers widen).
        for slot in allowed.iter_mut() {
            if *slot == 0 {
                *slot = TagSet::ALL.bits();
            }
        }

        Self {
            max_depth: max_depth as u16,
            allowed_output: allowed.into(),
            generalize_inputs: inputs
                .into_iter()
                .map(|(k, v)| (k, v.into_boxed_slice()))
                .collect(),
            generalize_var_stores: var_stores
                .into_iter()
                .map(|(k, v)| (k, v.into_boxed_slice()))
                .collect(),
        }
    }

    /// Decode one instruction at a time, folding `ExtendArg` prefixes
    /// into the operand handed to `visit`.
    fn walk(code: &[u8], mut visit: impl FnMut(u32, Opcode, u32)) {
        let mut bci = 0u32;
        let mut oparg = 0u32;
        while (bci as usize) < code.len() {
            let op = Opcode::from_byte(code[bci as usize]).expect("builder emitted a bad opcode");
            if op == Opcode::ExtendArg {
                oparg = (oparg | u32::from(code[bci as usize + 1])) << 8;
                bci += op.size();
                continue;
            }
            if op.has_imm() {
                oparg |= u32::from(code[bci as usize + 1]);
            }
            visit(bci, op, oparg);
            oparg = 0;
            bci += op.size();
        }
    }

    /// (pops, pushes) for the def-use pass.
    fn effect(op: Opcode, oparg: u32, code_free_counts: &FxHashMap<u16, usize>) -> (usize, usize) {
        match op {
            Opcode::Nop | Opcode::ExtendArg | Opcode::JumpForward | Opcode::JumpBackward => (0, 0),
            Opcode::Pop
            | Opcode::Return
            | Opcode::Raise
            | Opcode::PopExcept
            | Opcode::Yield
            | Opcode::JumpIfFalse
            | Opcode::JumpIfFalseO
            | Opcode::JumpIfFalseB
            | Opcode::JumpIfTrue
            | Opcode::JumpIfTrueO
            | Opcode::JumpIfTrueB => (1, 0),
            Opcode::EndExcHandler => (2, 0),
            Opcode::Dup => (1, 2),
            Opcode::LoadNone
            | Opcode::LoadTrue
            | Opcode::LoadFalse
            | Opcode::LoadConst
            | Opcode::LoadLocal
            | Opcode::LoadLocalO
            | Opcode::LoadLocalI
            | Opcode::LoadLocalB
            | Opcode::LoadCell
            | Opcode::LoadCellRef
            | Opcode::ResumeYield => (0, 1),
            Opcode::StoreLocal
            | Opcode::StoreLocalO
            | Opcode::StoreLocalI
            | Opcode::StoreLocalB
            | Opcode::StoreCell => (1, 0),
            Opcode::MakeFunction => {
                let free = code_free_counts.get(&(oparg as u16)).copied().unwrap_or(0);
                (free, 1)
            }
            Opcode::BinaryOp
            | Opcode::BinaryOpOOO
            | Opcode::BinaryOpIII
            | Opcode::BinaryOpIIB
            | Opcode::BinaryOpIIO => (2, 1),
            Opcode::CallFunction => (oparg as usize + 1, 1),
            Opcode::CallVarargs => (2, 1),
            Opcode::CallKeywords => (oparg as usize + 2, 1),
        }
    }
}

/// Tiny fixed inline buffer for popped producers; binary ops and calls
/// never pop more than a handful of tracked slots.
type SmallVecPopped = smallvec::SmallVec<[Option<u32>; 4]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=Opcode::MAX {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte);
            assert_eq!(op.size(), if op.has_imm() { 2 } else { 1 });
        }
        assert!(Opcode::from_byte(Opcode::MAX + 1).is_none());
    }

    #[test]
    fn test_generalizes_to_is_generic() {
        assert_eq!(Opcode::LoadLocalI.generalizes_to(), Some(Opcode::LoadLocalO));
        assert_eq!(Opcode::BinaryOpIIB.generalizes_to(), Some(Opcode::BinaryOpOOO));
        // Generic forms stay generic.
        assert_eq!(Opcode::LoadLocalO.generalizes_to(), None);
        assert_eq!(Opcode::BinaryOpOOO.generalizes_to(), None);
    }

    #[test]
    fn test_builder_jumps() {
        let mut b = UnitBuilder::new("jumps");
        b.op(Opcode::LoadTrue);
        let end = b.jump(Opcode::JumpIfFalse);
        let top = b.here();
        b.op(Opcode::Nop);
        b.jump_back(top);
        b.bind(end);
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();

        // JumpIfFalse at bci 1 resolves past the backedge to bci 6.
        assert_eq!(unit.opcode_at(1).unwrap(), Opcode::JumpIfFalse);
        assert_eq!(unit.imm_at(1), 5);
        assert_eq!(unit.opcode_at(4).unwrap(), Opcode::JumpBackward);
        assert_eq!(unit.imm_at(4), 1);
    }

    #[test]
    fn test_builder_wide_operand() {
        let mut b = UnitBuilder::new("wide");
        for _ in 0..300 {
            b.const_(Value::None);
        }
        let idx = b.const_(Value::Int(9));
        assert!(idx > 0xFF);
        let bci = b.op1(Opcode::LoadConst, u32::from(idx));
        b.op(Opcode::Return);
        let unit = b.build();
        assert_eq!(unit.opcode_at(0).unwrap(), Opcode::ExtendArg);
        assert_eq!(u32::from(unit.imm_at(0)), u32::from(idx) >> 8);
        assert_eq!(unit.opcode_at(bci).unwrap(), Opcode::LoadConst);
        assert_eq!(u32::from(unit.imm_at(bci)), u32::from(idx) & 0xFF);
    }

    #[test]
    fn test_defuse_records_store_dependency() {
        let mut b = UnitBuilder::new("defuse");
        let x = b.local("x");
        let one = b.const_(Value::Int(1));
        b.op1(Opcode::LoadConst, u32::from(one));
        let store = b.op1(Opcode::StoreLocal, u32::from(x));
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();

        assert_eq!(unit.generalize_inputs_of(store), &[0]);
        assert_eq!(unit.stores_of_local(x), &[store]);
    }

    #[test]
    fn test_defuse_binary_dependencies() {
        let mut b = UnitBuilder::new("binary");
        let x = b.local("x");
        let y = b.local("y");
        let lx = b.op1(Opcode::LoadLocal, u32::from(x));
        let ly = b.op1(Opcode::LoadLocal, u32::from(y));
        let add = b.binary(BinaryOp::Add);
        b.op(Opcode::Return);
        let unit = b.build();

        assert_eq!(unit.generalize_inputs_of(add), &[lx, ly]);
        // The loads feed an adaptive consumer, so any representation is
        // permitted; the add result feeds Return, so it must stay boxed.
        assert!(unit.allowed_output(lx).allows_int());
        assert!(!unit.allowed_output(add).allows_int());
    }

    #[test]
    fn test_defuse_forgets_across_merge_points() {
        let mut b = UnitBuilder::new("merge");
        let x = b.local("x");
        b.op(Opcode::LoadTrue);
        let merge = b.jump(Opcode::JumpIfFalse);
        b.op1(Opcode::LoadLocal, u32::from(x));
        b.op(Opcode::Pop);
        b.bind(merge);
        b.op(Opcode::LoadNone);
        let store = b.op1(Opcode::StoreLocal, u32::from(x));
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();

        // LoadNone after the merge point is not an adaptive producer and
        // the merge wiped the symbolic stack before it anyway.
        assert!(unit.generalize_inputs_of(store).len() <= 1);
    }

    #[test]
    fn test_handler_table_validation() {
        let mut b = UnitBuilder::new("handlers");
        for _ in 0..12 {
            b.op(Opcode::Nop);
        }
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        // Nested is fine.
        b.handler(0, 10, 11, 0);
        b.handler(2, 6, 8, 1);
        let unit = b.build();
        assert_eq!(unit.handlers.len(), 2);
        assert_eq!(unit.handlers[0].start, 0);
    }

    #[test]
    #[should_panic(expected = "handler ranges must nest or be disjoint")]
    fn test_handler_table_rejects_partial_overlap() {
        let mut b = UnitBuilder::new("bad");
        for _ in 0..12 {
            b.op(Opcode::Nop);
        }
        b.handler(0, 6, 10, 0);
        b.handler(4, 9, 11, 0);
        let _ = b.build();
    }

    #[test]
    fn test_line_table() {
        let mut b = UnitBuilder::new("lines");
        b.line(10);
        b.op(Opcode::LoadNone);
        b.line(11);
        b.op(Opcode::Return);
        let unit = b.build();
        assert_eq!(unit.bci_to_line(0), Some(10));
        assert_eq!(unit.bci_to_line(1), Some(11));
    }

    #[test]
    fn test_rewrite_is_visible() {
        let mut b = UnitBuilder::new("rewrite");
        let x = b.local("x");
        b.op1(Opcode::LoadLocal, u32::from(x));
        b.op(Opcode::Return);
        let unit = b.build();
        unit.rewrite(0, Opcode::LoadLocalI);
        assert_eq!(unit.opcode_at(0).unwrap(), Opcode::LoadLocalI);
        assert_eq!(unit.imm_at(0), x as u8);
    }
}
