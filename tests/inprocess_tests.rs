//! In-process integration tests that contribute to coverage.
//!
//! These tests compile and run programs through the library API instead of
//! spawning the binary. PRINT is routed to a thread-local buffer so tests
//! running in parallel do not see each other's output.

use std::cell::RefCell;
use std::sync::Arc;

use tjit::bytecode::{DecodeError, ProgramBuilder, sample_multiply};
use tjit::jit::linker::LinkError;
use tjit::jit::{CompileOptions, CompiledFunction, JitError, compile_with};

thread_local! {
    static PRINTED: RefCell<Vec<i64>> = const { RefCell::new(Vec::new()) };
}

extern "C" fn capture(value: i64) {
    PRINTED.with(|out| out.borrow_mut().push(value));
}

fn capturing() -> CompileOptions {
    CompileOptions {
        print: capture,
        ..CompileOptions::default()
    }
}

fn compile(program: &[u8]) -> Result<CompiledFunction, JitError> {
    compile_with(program, capturing())
}

/// Run `function` on this thread and return what it printed.
fn run(function: &CompiledFunction, input: &[i64]) -> Vec<i64> {
    PRINTED.with(|out| out.borrow_mut().clear());
    unsafe { function.run(input) };
    PRINTED.with(|out| out.borrow_mut().drain(..).collect())
}

fn run_program(program: &[u8], input: &[i64]) -> Vec<i64> {
    let function = compile(program).unwrap();
    run(&function, input)
}

#[cfg(all(target_arch = "x86_64", unix))]
mod execution {
    use super::*;

    #[test]
    fn test_add_two_inputs() {
        let program = ProgramBuilder::new().input().input().add().print().halt().build();
        assert_eq!(run_program(&program, &[3, 4]), vec![7]);
    }

    #[test]
    fn test_multiply_sample() {
        let function = compile(&sample_multiply()).unwrap();
        assert_eq!(run(&function, &[0, 0]), vec![0]);
        assert_eq!(run(&function, &[3, 4]), vec![12]);
        assert_eq!(run(&function, &[-6, 7]), vec![-42]);
        // The body runs once even when the count is not positive.
        assert_eq!(run(&function, &[5, -3]), vec![5]);
    }

    #[test]
    fn test_constant_add_prints_sum() {
        let cases = [
            (0, 0, 0),
            (1, 2, 3),
            (-5, 3, -2),
            (1_000_000, -1_000_001, -1),
            (i32::MAX, 1, i32::MIN as i64),
            (i32::MIN, -1, i32::MAX as i64),
        ];
        for (a, b, expected) in cases {
            let program = ProgramBuilder::new().constant(a).constant(b).add().print().halt().build();
            assert_eq!(run_program(&program, &[]), vec![expected], "{} + {}", a, b);
        }
    }

    #[test]
    fn test_cmp_pushes_sign_of_difference() {
        let cases = [
            (1, 2, -1),
            (2, 1, 1),
            (7, 7, 0),
            (-3, 3, -1),
            (i32::MIN, 1, -1),
            (i32::MAX, i32::MIN, 1),
        ];
        for (a, b, expected) in cases {
            let program = ProgramBuilder::new().constant(a).constant(b).cmp().print().halt().build();
            assert_eq!(run_program(&program, &[]), vec![expected], "cmp {} {}", a, b);
        }
    }

    #[test]
    fn test_input_reads_low_32_bits() {
        let program = ProgramBuilder::new().input().print().input().print().halt().build();
        assert_eq!(
            run_program(&program, &[0x1_0000_0005, -1]),
            vec![5, -1]
        );
    }

    #[test]
    fn test_get_set_discard() {
        let program = ProgramBuilder::new()
            .constant(10)
            .constant(20)
            .constant(30)
            // copy 10 to the top
            .get(2)
            .print()
            // overwrite 20 with 99
            .constant(99)
            .set(1)
            .discard()
            .print()
            .print()
            .halt()
            .build();
        assert_eq!(run_program(&program, &[]), vec![10, 99, 10]);
    }

    #[test]
    fn test_print_at_every_stack_parity() {
        // PRINT with an odd and an even number of slots below it
        let program = ProgramBuilder::new()
            .constant(1)
            .constant(2)
            .print()
            .constant(3)
            .constant(4)
            .print()
            .print()
            .print()
            .halt()
            .build();
        assert_eq!(run_program(&program, &[]), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_jgt_not_taken_on_zero_or_negative() {
        let mut b = ProgramBuilder::new();
        // JGT at 1 jumps over `CONSTANT 0; PRINT; HALT` to 13
        b.input().jgt(12).constant(0).print().halt();
        b.constant(1).print().halt();
        let program = b.build();

        assert_eq!(run_program(&program, &[0]), vec![0]);
        assert_eq!(run_program(&program, &[-8]), vec![0]);
        assert_eq!(run_program(&program, &[8]), vec![1]);
    }

    #[test]
    fn test_halt_with_values_left_on_stack() {
        let program = ProgramBuilder::new().constant(1).constant(2).constant(3).halt().build();
        assert_eq!(run_program(&program, &[]), Vec::<i64>::new());
    }

    #[test]
    fn test_execution_is_deterministic() {
        let program = sample_multiply();
        let first = compile(&program).unwrap();
        let second = compile(&program).unwrap();
        assert_eq!(first.code(), second.code());

        let expected = run(&first, &[9, 11]);
        for _ in 0..10 {
            assert_eq!(run(&first, &[9, 11]), expected);
            assert_eq!(run(&second, &[9, 11]), expected);
        }
    }

    #[test]
    fn test_concurrent_invocation() {
        let function = Arc::new(compile(&sample_multiply()).unwrap());

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let function = Arc::clone(&function);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|j| run(&function, &[i, j + 1]))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for (i, handle) in (1..=8).zip(handles) {
            let outputs = handle.join().unwrap();
            for (j, printed) in (0..100).zip(outputs) {
                assert_eq!(printed, vec![i * (j + 1)]);
            }
        }
    }

    #[test]
    fn test_compiled_function_metadata() {
        let program = sample_multiply();
        let function = compile(&program).unwrap();
        let stats = function.stats();

        assert_eq!(stats.instructions, 18);
        assert_eq!(stats.branches, 1);
        assert_eq!(stats.code_size, function.code_size());
        assert_eq!(function.code().len(), function.code_size());
        assert!(function.region_size() >= function.code_size());
        assert_eq!(function.instruction_offsets().count(), 18);
        assert!(function.native_offset(0).is_some());
        assert!(function.native_offset(1).is_some());
        // Mid-operand offsets are not instruction boundaries.
        assert_eq!(function.native_offset(3), None);
    }

    #[test]
    fn test_breakpoints_add_a_trap_per_instruction() {
        let program = sample_multiply();
        let plain = compile(&program).unwrap();
        let traced = compile_with(
            &program,
            CompileOptions {
                breakpoints: true,
                ..capturing()
            },
        )
        .unwrap();
        assert_eq!(traced.code_size(), plain.code_size() + 18);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let program = ProgramBuilder::new().input().raw(0x2a).halt().build();
        let err = compile(&program).unwrap_err();
        assert!(matches!(
            err,
            JitError::Decode(DecodeError::UnknownOpcode {
                offset: 1,
                byte: 0x2a
            })
        ));
    }

    #[test]
    fn test_truncated_operand_is_rejected() {
        let program = [0x00, 0x01, 0x02];
        let err = compile(&program).unwrap_err();
        assert!(matches!(
            err,
            JitError::Decode(DecodeError::TruncatedOperand { offset: 0, .. })
        ));
    }

    #[test]
    fn test_branch_to_non_boundary_is_rejected() {
        let program = ProgramBuilder::new().constant(1).jgt(2).halt().build();
        let err = compile(&program).unwrap_err();
        assert!(matches!(
            err,
            JitError::Link(LinkError::UnresolvedLabel { target: 7, .. })
        ));
    }

    #[test]
    fn test_empty_program_compiles() {
        let function = compile(&[]).unwrap();
        assert_eq!(function.stats().instructions, 0);
        assert_eq!(function.instruction_offsets().count(), 0);
    }
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
#[test]
fn test_unsupported_host() {
    assert!(matches!(
        compile(&sample_multiply()),
        Err(JitError::UnsupportedHost)
    ));
}
