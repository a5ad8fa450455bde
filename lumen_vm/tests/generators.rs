//! Generator lifecycle: suspension, sends, throws, state errors, and
//! interaction with hot-loop replacement.

use std::sync::Arc;

use lumen_core::{LanguageError, Value};
use lumen_vm::code::{BinaryOp, CompiledUnit, Opcode, UnitBuilder};
use lumen_vm::generator::GeneratorObject;
use lumen_vm::{Engine, EngineConfig, GenState, GeneratorStep, OsrConfig};

fn interp_only() -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::with_config(EngineConfig {
        max_recursion_depth: 100,
        osr: None,
    })
}

fn expect_yield(step: GeneratorStep) -> Value {
    match step {
        GeneratorStep::Yielded(value) => value,
        GeneratorStep::Done(value) => panic!("expected a yield, generator returned {value}"),
    }
}

fn expect_done(step: GeneratorStep) -> Value {
    match step {
        GeneratorStep::Done(value) => value,
        GeneratorStep::Yielded(value) => panic!("expected completion, generator yielded {value}"),
    }
}

/// `yield 1; yield 2; return 3`
fn three_step_unit() -> Arc<CompiledUnit> {
    let mut b = UnitBuilder::new("steps");
    b.generator();
    let c1 = b.const_(Value::Int(1));
    let c2 = b.const_(Value::Int(2));
    let c3 = b.const_(Value::Int(3));
    b.op1(Opcode::LoadConst, u32::from(c1));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    b.op1(Opcode::LoadConst, u32::from(c2));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    b.op1(Opcode::LoadConst, u32::from(c3));
    b.op(Opcode::Return);
    b.build()
}

#[test]
fn generator_yields_then_completes() {
    let engine = interp_only();
    let gen = engine.execute(&three_step_unit(), &[]).unwrap();

    let obj = gen.downcast::<GeneratorObject>().unwrap();
    assert_eq!(obj.state(), GenState::Created);

    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(1));
    assert_eq!(obj.state(), GenState::Suspended);
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(2));
    assert_eq!(expect_done(engine.resume(&gen).unwrap()).as_int(), Some(3));
    assert_eq!(obj.state(), GenState::Exhausted);

    // Resuming past the end raises StopIteration.
    let err = engine.resume(&gen).unwrap_err();
    assert_eq!(err.kind_name(), "StopIteration");
}

#[test]
fn send_delivers_the_value_to_the_yield_expression() {
    // v = yield 1; return v + 1
    let mut b = UnitBuilder::new("echo");
    b.generator();
    let v = b.local("v");
    let c1 = b.const_(Value::Int(1));
    b.op1(Opcode::LoadConst, u32::from(c1));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op1(Opcode::StoreLocal, u32::from(v));
    b.op1(Opcode::LoadLocal, u32::from(v));
    b.op1(Opcode::LoadConst, u32::from(c1));
    b.binary(BinaryOp::Add);
    b.op(Opcode::Return);
    let unit = b.build();

    let engine = interp_only();
    let gen = engine.execute(&unit, &[]).unwrap();
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(1));
    assert_eq!(
        expect_done(engine.send(&gen, Value::Int(41)).unwrap()).as_int(),
        Some(42)
    );
}

#[test]
fn locals_persist_across_suspensions() {
    // total = a; total = total + (yield total); yield total; return total
    let mut b = UnitBuilder::new("acc");
    b.generator();
    let a = b.param("a");
    let total = b.local("total");
    b.op1(Opcode::LoadLocal, u32::from(a));
    b.op1(Opcode::StoreLocal, u32::from(total));
    b.op1(Opcode::LoadLocal, u32::from(total));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op1(Opcode::LoadLocal, u32::from(total));
    b.binary(BinaryOp::Add);
    b.op1(Opcode::StoreLocal, u32::from(total));
    b.op1(Opcode::LoadLocal, u32::from(total));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    b.op1(Opcode::LoadLocal, u32::from(total));
    b.op(Opcode::Return);
    let unit = b.build();

    let engine = interp_only();
    let gen = engine.execute(&unit, &[Value::Int(10)]).unwrap();
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(10));
    assert_eq!(
        expect_yield(engine.send(&gen, Value::Int(5)).unwrap()).as_int(),
        Some(15)
    );
    assert_eq!(expect_done(engine.resume(&gen).unwrap()).as_int(), Some(15));
}

#[test]
fn send_before_start_requires_none() {
    let engine = interp_only();
    let gen = engine.execute(&three_step_unit(), &[]).unwrap();

    let err = engine.send(&gen, Value::Int(1)).unwrap_err();
    assert_eq!(err.kind_name(), "TypeError");
    assert!(err.to_string().contains("just-started generator"));

    // The failed send did not consume the generator.
    let obj = gen.downcast::<GeneratorObject>().unwrap();
    assert_eq!(obj.state(), GenState::Created);
    assert_eq!(expect_yield(engine.send(&gen, Value::None).unwrap()).as_int(), Some(1));
}

#[test]
fn throw_before_start_is_rejected_without_running_anything() {
    let engine = interp_only();
    let gen = engine.execute(&three_step_unit(), &[]).unwrap();

    let err = engine
        .throw_into(&gen, LanguageError::value_error("boom"))
        .unwrap_err();
    assert_eq!(err.kind_name(), "RuntimeError");
    assert!(err.to_string().contains("just-started generator"));

    // No bytecode ran and the generator is still usable.
    let obj = gen.downcast::<GeneratorObject>().unwrap();
    assert_eq!(obj.state(), GenState::Created);
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(1));
}

#[test]
fn throw_at_a_yield_can_be_caught_inside_the_generator() {
    // try: yield 1  except: yield 99; return 0
    let mut b = UnitBuilder::new("guarded");
    b.generator();
    let c1 = b.const_(Value::Int(1));
    let c99 = b.const_(Value::Int(99));
    let c0 = b.const_(Value::Int(0));

    let start = b.here();
    b.op1(Opcode::LoadConst, u32::from(c1));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    let end = b.here();
    let done = b.jump(Opcode::JumpForward);

    let handler = b.here();
    b.op(Opcode::Pop);
    b.op(Opcode::PopExcept);
    b.op1(Opcode::LoadConst, u32::from(c99));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    b.bind(done);
    b.op1(Opcode::LoadConst, u32::from(c0));
    b.op(Opcode::Return);
    b.handler(start, end, handler, 0);
    let unit = b.build();

    let engine = interp_only();
    let gen = engine.execute(&unit, &[]).unwrap();
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(1));
    let step = engine
        .throw_into(&gen, LanguageError::value_error("poke"))
        .unwrap();
    assert_eq!(expect_yield(step).as_int(), Some(99));
    assert_eq!(expect_done(engine.resume(&gen).unwrap()).as_int(), Some(0));
}

#[test]
fn uncaught_throw_exhausts_the_generator() {
    let engine = interp_only();
    let gen = engine.execute(&three_step_unit(), &[]).unwrap();
    let _ = engine.resume(&gen).unwrap();

    let err = engine
        .throw_into(&gen, LanguageError::type_error("no handler here"))
        .unwrap_err();
    assert_eq!(err.kind_name(), "TypeError");
    let obj = gen.downcast::<GeneratorObject>().unwrap();
    assert_eq!(obj.state(), GenState::Exhausted);
}

#[test]
fn generator_loop_yields_through_osr() {
    // i = 0; while i < n: yield i; i = i + 1; return None
    fn range_unit() -> Arc<CompiledUnit> {
        let mut b = UnitBuilder::new("range");
        b.generator();
        let n = b.param("n");
        let i = b.local("i");
        let c0 = b.const_(Value::Int(0));
        let c1 = b.const_(Value::Int(1));

        b.op1(Opcode::LoadConst, u32::from(c0));
        b.op1(Opcode::StoreLocal, u32::from(i));
        let top = b.here();
        b.op1(Opcode::LoadLocal, u32::from(i));
        b.op1(Opcode::LoadLocal, u32::from(n));
        b.binary(BinaryOp::Lt);
        let out = b.jump(Opcode::JumpIfFalse);
        b.op1(Opcode::LoadLocal, u32::from(i));
        b.op(Opcode::Yield);
        b.op(Opcode::ResumeYield);
        b.op(Opcode::Pop);
        b.op1(Opcode::LoadLocal, u32::from(i));
        b.op1(Opcode::LoadConst, u32::from(c1));
        b.binary(BinaryOp::Add);
        b.op1(Opcode::StoreLocal, u32::from(i));
        b.jump_back(top);
        b.bind(out);
        b.op(Opcode::LoadNone);
        b.op(Opcode::Return);
        b.build()
    }

    fn drain(engine: &Engine, unit: &Arc<CompiledUnit>, n: i64) -> Vec<i64> {
        let gen = engine.execute(unit, &[Value::Int(n)]).unwrap();
        let mut out = Vec::new();
        loop {
            match engine.resume(&gen).unwrap() {
                GeneratorStep::Yielded(value) => out.push(value.as_int().unwrap()),
                GeneratorStep::Done(value) => {
                    assert!(value.is_none());
                    return out;
                }
            }
        }
    }

    let interp = interp_only();
    let osr = Engine::with_config(EngineConfig {
        max_recursion_depth: 100,
        osr: Some(OsrConfig::for_testing()),
    });

    let expected: Vec<i64> = (0..20).collect();
    assert_eq!(drain(&interp, &range_unit(), 20), expected);
    assert_eq!(drain(&osr, &range_unit(), 20), expected);
    assert!(osr.osr_stats().unwrap().entries >= 1);
}

#[test]
fn throw_into_an_exhausted_generator_reraises() {
    let engine = interp_only();
    let gen = engine.execute(&three_step_unit(), &[]).unwrap();
    let _ = engine.resume(&gen).unwrap();
    // Uncaught throw at the yield exhausts the generator.
    let _ = engine
        .throw_into(&gen, LanguageError::value_error("first"))
        .unwrap_err();
    let err = engine
        .throw_into(&gen, LanguageError::type_error("second"))
        .unwrap_err();
    assert_eq!(err.kind_name(), "TypeError");
}

#[test]
fn create_generator_binds_arguments_without_running() {
    // total = a; yield total; return total
    let mut b = UnitBuilder::new("seeded");
    b.generator();
    let a = b.param("a");
    b.op1(Opcode::LoadLocal, u32::from(a));
    b.op(Opcode::Yield);
    b.op(Opcode::ResumeYield);
    b.op(Opcode::Pop);
    b.op1(Opcode::LoadLocal, u32::from(a));
    b.op(Opcode::Return);
    let unit = b.build();

    let engine = interp_only();
    let obj = engine.create_generator(&unit, &[Value::Int(9)]).unwrap();
    assert_eq!(obj.state(), GenState::Created);

    let gen = Value::obj(obj);
    assert_eq!(expect_yield(engine.resume(&gen).unwrap()).as_int(), Some(9));
    assert_eq!(expect_done(engine.resume(&gen).unwrap()).as_int(), Some(9));

    // Binding errors surface immediately.
    let err = engine.create_generator(&unit, &[]).unwrap_err();
    assert_eq!(err.kind_name(), "TypeError");
}
