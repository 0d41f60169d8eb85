//! Interpreted and compiled execution must agree on return value, memory,
//! stack and output for the same routine and starting state.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use proptest::prelude::*;
use quill_vm_bytecode::assembler::{global, large, local, small, sp};
use quill_vm_bytecode::{Assembler, Opcode, Variable};
use quill_vm_core::{BufferedHost, Processor, ProcessorOptions, VmError};
use quill_vm_exec::{Compiled, Executable, Interpreted, JitRuntime};

#[derive(Debug, PartialEq, Eq)]
struct Observed {
    result: Result<Option<u16>, VmError>,
    memory: Vec<u8>,
    stack: Vec<u16>,
    output: String,
}

/// Assemble a v5 story whose main routine quits; `build` adds the routine
/// under test and returns its address.
fn story(build: impl FnOnce(&mut Assembler) -> u32) -> (Vec<u8>, u32) {
    let mut asm = Assembler::new(5);
    asm.globals(&[]);
    let main = asm.routine(&[]);
    asm.set_main(main);
    asm.op(Opcode::Quit, &[]);
    let routine = build(&mut asm);
    (asm.finish().unwrap(), routine)
}

fn observe(image: &[u8], address: u32, args: &[u16], executable: &mut dyn Executable) -> Observed {
    let options = ProcessorOptions {
        random_seed: Some(42),
        ..ProcessorOptions::default()
    };
    let mut processor = Processor::new(image.to_vec(), options).unwrap();
    let mut host = BufferedHost::new();
    let result = executable
        .execute(&mut processor, &mut host, address, args)
        .map_err(|error| error.root().clone());
    let stack = match result {
        Ok(_) => processor.stack().values().to_vec(),
        // A faulted call leaves its frame behind; only the error matters.
        Err(_) => Vec::new(),
    };
    Observed {
        result,
        memory: processor.memory().as_bytes().to_vec(),
        stack,
        output: host.take_output(),
    }
}

/// Run the routine both ways and return both observations.
fn both(image: &[u8], address: u32, args: &[u16]) -> (Observed, Observed) {
    let interpreted = observe(image, address, args, &mut Interpreted);
    let runtime = JitRuntime::new(false, Arc::new(AtomicBool::new(false))).unwrap();
    let compiled = observe(image, address, args, &mut Compiled::new(runtime));
    (interpreted, compiled)
}

fn binary(opcode: Opcode) -> (Vec<u8>, u32) {
    story(|asm| {
        let routine = asm.routine(&[0, 0]);
        asm.op(opcode, &[local(0), local(1)])
            .store(Variable::Global(0));
        asm.op(Opcode::Push, &[global(0)]);
        asm.op(Opcode::Ret, &[global(0)]);
        routine
    })
}

fn branching(opcode: Opcode, operands: usize) -> (Vec<u8>, u32) {
    story(|asm| {
        let routine = asm.routine(&[0, 0, 0]);
        let taken = asm.label();
        let args = [local(0), local(1), local(2)];
        asm.op(opcode, &args[..operands]).branch(true, taken);
        asm.op(Opcode::Ret, &[small(2)]);
        asm.bind(taken);
        asm.op(Opcode::Ret, &[small(3)]);
        routine
    })
}

fn word() -> impl Strategy<Value = u16> {
    prop_oneof![
        Just(0u16),
        Just(1),
        Just(0x7fff),
        Just(0x8000),
        Just(0xffff),
        any::<u16>(),
    ]
}

const BINARY: [Opcode; 9] = [
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Mod,
    Opcode::And,
    Opcode::Or,
    Opcode::LogShift,
    Opcode::ArtShift,
];

const BRANCHES: [(Opcode, usize); 6] = [
    (Opcode::Je, 2),
    (Opcode::Je, 3),
    (Opcode::Jl, 2),
    (Opcode::Jg, 2),
    (Opcode::Jz, 1),
    (Opcode::Test, 2),
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arithmetic_agrees(index in 0..BINARY.len(), a in word(), b in word()) {
        let (image, address) = binary(BINARY[index]);
        let (interpreted, compiled) = both(&image, address, &[a, b]);
        prop_assert_eq!(interpreted, compiled);
    }

    #[test]
    fn branches_agree(index in 0..BRANCHES.len(), a in word(), b in word(), c in word()) {
        let (opcode, operands) = BRANCHES[index];
        let (image, address) = branching(opcode, operands);
        let (interpreted, compiled) = both(&image, address, &[a, b, c]);
        prop_assert_eq!(interpreted, compiled);
    }

    #[test]
    fn not_agrees(a in word()) {
        let (image, address) = story(|asm| {
            let routine = asm.routine(&[0]);
            asm.op(Opcode::Not, &[local(0)]).store(Variable::Stack);
            asm.op(Opcode::RetPopped, &[]);
            routine
        });
        let (interpreted, compiled) = both(&image, address, &[a]);
        prop_assert_eq!(interpreted, compiled);
    }
}

#[test]
fn division_by_zero_is_the_same_error() {
    let (image, address) = binary(Opcode::Mod);
    let (interpreted, compiled) = both(&image, address, &[9, 0]);
    assert_eq!(interpreted.result, Err(VmError::DivisionByZero));
    assert_eq!(interpreted, compiled);
}

#[test]
fn table_loops_agree() {
    let (image, address) = story(|asm| {
        let table = asm.zeros(20) as u16;
        let routine = asm.routine(&[0, 0]);
        let fill = asm.here();
        asm.op(Opcode::Mul, &[local(0), local(0)])
            .store(Variable::Stack);
        asm.op(Opcode::Storew, &[large(table), local(0), sp()]);
        asm.op(Opcode::IncChk, &[small(1), small(9)])
            .branch(false, fill);
        asm.op(Opcode::Store, &[small(1), small(0)]);
        let sum = asm.here();
        asm.op(Opcode::Loadw, &[large(table), local(0)])
            .store(Variable::Stack);
        asm.op(Opcode::Add, &[local(1), sp()])
            .store(Variable::Local(1));
        asm.op(Opcode::IncChk, &[small(1), small(9)])
            .branch(false, sum);
        asm.op(Opcode::Ret, &[local(1)]);
        routine
    });
    let (interpreted, compiled) = both(&image, address, &[]);
    assert_eq!(interpreted.result, Ok(Some(285)));
    assert_eq!(interpreted, compiled);
}

#[test]
fn calls_agree() {
    let (image, address) = story(|asm| {
        let callee = asm.routine(&[0, 0]);
        asm.op(Opcode::Sub, &[local(0), local(1)])
            .store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);

        let packed = asm.pack(callee);
        let caller = asm.routine(&[0]);
        asm.op(Opcode::Push, &[small(7)]);
        asm.op(Opcode::CallVS, &[large(packed), small(50), small(8)])
            .store(Variable::Local(0));
        asm.op(Opcode::Store, &[small(16), large(packed)]);
        asm.op(Opcode::CallVS, &[global(0), local(0), small(2)])
            .store(Variable::Stack);
        asm.op(Opcode::Add, &[sp(), sp()]).store(Variable::Stack);
        asm.op(Opcode::Call1N, &[small(0)]);
        asm.op(Opcode::RetPopped, &[]);
        caller
    });
    let (interpreted, compiled) = both(&image, address, &[]);
    assert_eq!(interpreted.result, Ok(Some(47)));
    assert_eq!(interpreted, compiled);
}

#[test]
fn indirect_variables_agree() {
    let (image, address) = story(|asm| {
        let routine = asm.routine(&[0, 0]);
        asm.op(Opcode::Push, &[small(5)]);
        asm.op(Opcode::Inc, &[small(0)]);
        asm.op(Opcode::Store, &[local(0), small(7)]);
        asm.op(Opcode::Load, &[small(0)]).store(Variable::Local(1));
        asm.op(Opcode::Add, &[local(1), global(1)])
            .store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);
        routine
    });
    let (interpreted, compiled) = both(&image, address, &[17]);
    assert_eq!(interpreted.result, Ok(Some(13)));
    assert_eq!(interpreted, compiled);
}

#[test]
fn output_agrees() {
    let (image, address) = story(|asm| {
        let routine = asm.routine(&[]);
        asm.print("Score: ");
        asm.op(Opcode::PrintNum, &[large(0xfff6)]);
        asm.op(Opcode::NewLine, &[]);
        asm.op(Opcode::PrintChar, &[small(b'!')]);
        asm.op(Opcode::Rtrue, &[]);
        routine
    });
    let (interpreted, compiled) = both(&image, address, &[]);
    assert_eq!(interpreted.output, "Score: -10\n!");
    assert_eq!(interpreted, compiled);
}

#[test]
fn seeded_random_agrees() {
    let (image, address) = story(|asm| {
        let routine = asm.routine(&[]);
        asm.op(Opcode::Random, &[small(100)]).store(Variable::Stack);
        asm.op(Opcode::Random, &[small(100)]).store(Variable::Stack);
        asm.op(Opcode::Mul, &[sp(), large(1000)])
            .store(Variable::Stack);
        asm.op(Opcode::Add, &[sp(), sp()]).store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);
        routine
    });
    let (interpreted, compiled) = both(&image, address, &[]);
    assert!(interpreted.result.is_ok());
    assert_eq!(interpreted, compiled);
}
