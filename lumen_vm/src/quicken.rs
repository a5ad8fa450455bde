//! Quickening and generalization.
//!
//! Sites start adaptive, rewrite themselves to a specialized form the
//! first time they execute, and fall back to the generic form when a
//! speculative assumption fails. All state lives in the unit's atomic
//! bytecode and per-local tags; transitions are monotonic (specialized
//! forms only ever move to their generic form) and idempotent, so
//! concurrent activations may race on them freely.
//!
//! When a consumer site generalizes, the producers feeding it must stop
//! pushing unboxed slots or the consumer would keep observing
//! representations it no longer expects. The static def-use map computed
//! at build time names exactly those producer sites.

use crate::code::CompiledUnit;

/// Generalize the site at `bci` to its generic form, if it has one,
/// together with every producer site feeding it.
pub(crate) fn generalize_site(unit: &CompiledUnit, bci: u32) {
    if let Ok(op) = unit.opcode_at(bci) {
        if let Some(generic) = op.generalizes_to() {
            log::trace!("generalizing {}@{bci}: {op:?} -> {generic:?}", unit.name);
            unit.rewrite(bci, generic);
        }
    }
    generalize_inputs(unit, bci);
}

/// Generalize the producer sites recorded for the consumer at `bci`.
/// Producers still in their adaptive form are left alone; they re-adapt
/// against the narrowed output hint on their next execution.
pub(crate) fn generalize_inputs(unit: &CompiledUnit, bci: u32) {
    for &producer in unit.generalize_inputs_of(bci) {
        if let Ok(op) = unit.opcode_at(producer) {
            if let Some(generic) = op.generalizes_to() {
                log::trace!(
                    "generalizing input {}@{producer}: {op:?} -> {generic:?}",
                    unit.name
                );
                unit.rewrite(producer, generic);
            }
        }
    }
}

/// Widen a local variable to the boxed representation and generalize
/// every specialized store site of that variable, so loads can no
/// longer observe a stale unboxed slot.
pub(crate) fn generalize_var_stores(unit: &CompiledUnit, local: u16) {
    log::trace!("widening local '{}' in {}", unit.local_name(local), unit.name);
    unit.widen_local_tag(local);
    for &store in unit.stores_of_local(local) {
        if let Ok(op) = unit.opcode_at(store) {
            if let Some(generic) = op.generalizes_to() {
                unit.rewrite(store, generic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{BinaryOp, Opcode, UnitBuilder};
    use lumen_core::tags::TagSet;
    use lumen_core::Value;

    #[test]
    fn test_generalize_site_rewrites_inputs() {
        let mut b = UnitBuilder::new("q");
        let x = b.local("x");
        let y = b.local("y");
        let lx = b.op1(Opcode::LoadLocal, u32::from(x));
        let ly = b.op1(Opcode::LoadLocal, u32::from(y));
        let add = b.binary(BinaryOp::Add);
        b.op(Opcode::Return);
        let unit = b.build();

        // Simulate the sites having specialized.
        unit.rewrite(lx, Opcode::LoadLocalI);
        unit.rewrite(ly, Opcode::LoadLocalI);
        unit.rewrite(add, Opcode::BinaryOpIII);

        generalize_site(&unit, add);
        assert_eq!(unit.opcode_at(add).unwrap(), Opcode::BinaryOpOOO);
        assert_eq!(unit.opcode_at(lx).unwrap(), Opcode::LoadLocalO);
        assert_eq!(unit.opcode_at(ly).unwrap(), Opcode::LoadLocalO);

        // Idempotent.
        generalize_site(&unit, add);
        assert_eq!(unit.opcode_at(add).unwrap(), Opcode::BinaryOpOOO);
    }

    #[test]
    fn test_generalize_leaves_adaptive_producers() {
        let mut b = UnitBuilder::new("q2");
        let x = b.local("x");
        let lx = b.op1(Opcode::LoadLocal, u32::from(x));
        let store = b.op1(Opcode::StoreLocal, u32::from(x));
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();

        generalize_inputs(&unit, store);
        // Never executed, still adaptive.
        assert_eq!(unit.opcode_at(lx).unwrap(), Opcode::LoadLocal);
    }

    #[test]
    fn test_generalize_var_stores_widens_tag() {
        let mut b = UnitBuilder::new("q3");
        let x = b.local("x");
        let one = b.const_(Value::Int(1));
        b.op1(Opcode::LoadConst, u32::from(one));
        let s1 = b.op1(Opcode::StoreLocal, u32::from(x));
        b.op1(Opcode::LoadConst, u32::from(one));
        let s2 = b.op1(Opcode::StoreLocal, u32::from(x));
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        let unit = b.build();

        unit.rewrite(s1, Opcode::StoreLocalI);
        assert!(unit.local_tag(x).allows_int());

        generalize_var_stores(&unit, x);
        assert_eq!(unit.local_tag(x), TagSet::OBJECT);
        assert_eq!(unit.opcode_at(s1).unwrap(), Opcode::StoreLocalO);
        // The second store never specialized; it stays adaptive and will
        // consult the widened tag when it runs.
        assert_eq!(unit.opcode_at(s2).unwrap(), Opcode::StoreLocal);
    }
}
