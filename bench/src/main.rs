use serde::Serialize;
use std::hint::black_box;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tjit::bytecode::{ProgramBuilder, sample_multiply};
use tjit::jit::{CompileOptions, compile_with};

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    compile_secs: f64,
    code_size: usize,
    jit_run_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

static LAST_PRINTED: AtomicI64 = AtomicI64::new(0);

extern "C" fn record(value: i64) {
    LAST_PRINTED.store(value, Ordering::Relaxed);
}

// Rust reference implementations

fn rust_multiply(a: i32, b: i32) -> i32 {
    let mut total: i32 = 0;
    let mut b = b;
    loop {
        total = total.wrapping_add(a);
        b = b.wrapping_sub(1);
        if b <= 0 {
            break;
        }
    }
    total
}

fn rust_countdown(n: i32) -> i32 {
    let mut n = n;
    while n > 0 {
        n -= 1;
    }
    n
}

/// Count the input down to zero, then print it.
fn countdown_program() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    b.input();
    let head = b.here();
    b.constant(-1).add().get(0).jgt_to(head);
    b.print().halt();
    b.build()
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn run_jit_benchmark(name: &str, program: &[u8], input: &[i64], expected: i64, rust_time: f64) -> BenchmarkResult {
    let options = CompileOptions {
        print: record,
        ..CompileOptions::default()
    };

    let start = Instant::now();
    let function = match compile_with(program, options) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("Benchmark {} failed to compile: {}", name, e);
            std::process::exit(1);
        }
    };
    let compile_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    // SAFETY: each benchmark program reads exactly `input.len()` words.
    unsafe { function.run(input) };
    let jit_run_secs = start.elapsed().as_secs_f64();

    let printed = LAST_PRINTED.load(Ordering::Relaxed);
    if printed != expected {
        eprintln!(
            "Benchmark {} printed {}, expected {}",
            name, printed, expected
        );
    }

    BenchmarkResult {
        name: name.to_string(),
        compile_secs,
        code_size: function.code_size(),
        jit_run_secs,
        rust_time_secs: rust_time,
    }
}

fn main() {
    let mut results = Vec::new();
    let multiply = sample_multiply();
    let countdown = countdown_program();

    for n in [1_000, 1_000_000, 100_000_000] {
        let mut expected = 0;
        let rust_time = time_rust(|| expected = rust_multiply(black_box(3), black_box(n)));
        results.push(run_jit_benchmark(
            &format!("multiply_{}", n),
            &multiply,
            &[3, n as i64],
            expected as i64,
            rust_time,
        ));
    }

    let mut expected = 0;
    let rust_time = time_rust(|| expected = rust_countdown(black_box(100_000_000)));
    results.push(run_jit_benchmark(
        "countdown",
        &countdown,
        &[100_000_000],
        expected as i64,
        rust_time,
    ));

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
