//! Demo programs: small bytecode methods that drive each tier behavior —
//! promotion, recursion, rescue, redefinition, inlining, and constant
//! rebinding.

use clap::ValueEnum;
use kestrel_vm::method::{CatchEntry, MethodIseq, SymbolId};
use kestrel_vm::opcodes::Insn;
use kestrel_vm::value::Value;
use kestrel_vm::vm::Vm;
use tracing::info;

use crate::cli::Options;
use crate::initializers::build_vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoKind {
    /// Hot arithmetic loop crossing the promotion threshold.
    SumLoop,
    /// Recursion dispatched through the call boundary.
    Fib,
    /// Exceptions raised in generated code and rescued by a handler.
    Rescue,
    /// Method redefinition retiring generated code mid-run.
    Redefine,
    /// Leaf calls folded into their caller behind version guards.
    Inline,
    /// Constant folding, rebinding, and the resulting bailout.
    Constants,
}

pub fn run_all(opts: &Options) -> eyre::Result<()> {
    for kind in DemoKind::value_variants() {
        run_one(*kind, opts)?;
    }
    Ok(())
}

pub fn run_one(kind: DemoKind, opts: &Options) -> eyre::Result<()> {
    let name = kind
        .to_possible_value()
        .map(|value| value.get_name().to_owned())
        .unwrap_or_default();
    println!("== {name} ==");
    let mut vm = build_vm(opts);
    match kind {
        DemoKind::SumLoop => sum_loop(&mut vm, opts)?,
        DemoKind::Fib => fib(&mut vm, opts)?,
        DemoKind::Rescue => rescue(&mut vm, opts)?,
        DemoKind::Redefine => redefine(&mut vm, opts)?,
        DemoKind::Inline => inline(&mut vm, opts)?,
        DemoKind::Constants => constants(&mut vm, opts)?,
    }
    report(&vm);
    Ok(())
}

fn define(vm: &mut Vm, name: &str, iseq: MethodIseq) -> SymbolId {
    let sym = vm.intern(name);
    vm.define_method(sym, iseq);
    sym
}

/// Replay the retained event ring and the counters after a demo.
fn report(vm: &Vm) {
    let metrics = vm.jit().metrics();
    info!(
        compiled = metrics.compiled_units,
        native_calls = metrics.native_calls,
        interpreted_calls = metrics.interpreted_calls,
        bailouts = metrics.bailouts,
        invalidated = metrics.invalidated_units,
        "tier counters"
    );
    for event in vm.jit().events() {
        println!("  {event}");
    }
}

/// sum(n): accumulate n..1 in a loop. The classic promotion candidate.
fn sum_loop(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let sum = define(
        vm,
        "sum",
        MethodIseq::new(
            vec![
                Insn::PushInt(0),
                Insn::StoreLocal(1),
                // 2: loop head
                Insn::PushInt(0),
                Insn::LoadLocal(0),
                Insn::Lt,
                Insn::BranchUnless(15),
                Insn::LoadLocal(1),
                Insn::LoadLocal(0),
                Insn::Add,
                Insn::StoreLocal(1),
                Insn::LoadLocal(0),
                Insn::PushInt(1),
                Insn::Sub,
                Insn::StoreLocal(0),
                Insn::Jump(2),
                // 15: exit
                Insn::LoadLocal(1),
                Insn::Return,
            ],
            1,
            2,
        ),
    );
    let mut last = Value::Nil;
    for _ in 0..opts.iterations {
        last = vm.call(sum, vec![Value::Int(100)])?;
    }
    println!("  sum(100) = {last}");
    Ok(())
}

/// fib(n): two recursive sends per activation.
fn fib(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let fib = vm.intern("fib");
    vm.define_method(
        fib,
        MethodIseq::new(
            vec![
                Insn::LoadLocal(0),
                Insn::PushInt(2),
                Insn::Lt,
                Insn::BranchUnless(6),
                Insn::LoadLocal(0),
                Insn::Return,
                // 6: fib(n - 1) + fib(n - 2)
                Insn::LoadLocal(0),
                Insn::PushInt(1),
                Insn::Sub,
                Insn::Send { name: fib, argc: 1 },
                Insn::LoadLocal(0),
                Insn::PushInt(2),
                Insn::Sub,
                Insn::Send { name: fib, argc: 1 },
                Insn::Add,
                Insn::Return,
            ],
            1,
            1,
        ),
    );
    let mut last = Value::Nil;
    for _ in 0..opts.iterations {
        last = vm.call(fib, vec![Value::Int(15)])?;
    }
    println!("  fib(15) = {last}");
    Ok(())
}

/// A method that always raises into its own handler.
fn rescue(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let guarded = define(
        vm,
        "guarded",
        MethodIseq::new(
            vec![
                Insn::PushInt(1),
                Insn::Raise,
                Insn::Return,
                // 3: handler
                Insn::PushInt(42),
                Insn::Print,
                Insn::PushNil,
                Insn::Return,
            ],
            0,
            0,
        )
        .with_catch(vec![CatchEntry {
            start: 0,
            end: 3,
            handler: 3,
        }]),
    );
    for _ in 0..opts.iterations {
        vm.call(guarded, vec![])?;
    }
    let rescued = vm.take_output().len();
    println!("  handler ran {rescued} times");
    Ok(())
}

/// Redefine a hot callee and watch its generated code retire.
fn redefine(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let answer = define(
        vm,
        "answer",
        MethodIseq::new(vec![Insn::PushInt(1), Insn::Return], 0, 0),
    );
    let greet = define(
        vm,
        "greet",
        MethodIseq::new(
            vec![
                Insn::Send {
                    name: answer,
                    argc: 0,
                },
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let mut before = Value::Nil;
    for _ in 0..opts.iterations {
        before = vm.call(greet, vec![])?;
    }
    vm.define_method(
        answer,
        MethodIseq::new(vec![Insn::PushInt(2), Insn::Return], 0, 0),
    );
    let after = vm.call(greet, vec![])?;
    println!("  greet() = {before} before redefinition, {after} after");
    Ok(())
}

/// Two pure leaves folded into their caller behind version guards.
fn inline(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let seven = define(
        vm,
        "seven",
        MethodIseq::new(vec![Insn::PushInt(7), Insn::Return], 0, 0),
    );
    let thirteen = define(
        vm,
        "thirteen",
        MethodIseq::new(vec![Insn::PushInt(13), Insn::Return], 0, 0),
    );
    let combine = define(
        vm,
        "combine",
        MethodIseq::new(
            vec![
                Insn::Send {
                    name: seven,
                    argc: 0,
                },
                Insn::Send {
                    name: thirteen,
                    argc: 0,
                },
                Insn::Add,
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let mut last = Value::Nil;
    for _ in 0..opts.iterations {
        last = vm.call(combine, vec![])?;
    }
    println!("  combine() = {last}");
    Ok(())
}

/// Fold a constant into generated code, then rebind it out from under it.
fn constants(vm: &mut Vm, opts: &Options) -> eyre::Result<()> {
    let slot = vm.define_const(Value::Int(40));
    let reader = define(
        vm,
        "reader",
        MethodIseq::new(
            vec![
                Insn::LoadConst(slot),
                Insn::PushInt(2),
                Insn::Add,
                Insn::Return,
            ],
            0,
            0,
        ),
    );
    let mut before = Value::Nil;
    for _ in 0..opts.iterations {
        before = vm.call(reader, vec![])?;
    }
    vm.const_store(slot, Value::Int(98))?;
    let after = vm.call(reader, vec![])?;
    println!("  reader() = {before} then {after} after rebinding");
    Ok(())
}
