//! Example: mapping a FIR filter loop
//!
//! Builds the data-flow graph of a FIR inner loop, maps it onto the
//! default 4x4 CGRA, and prints the schedule report.
//!
//! Run with: cargo run --example fir_mapping

use cgra_mapper::{map_kernel_source, ParamConfig, ReportKind};

const FIR: &str = "\
func fir {
  loop 0 {
    %i = phi %i.next
    %p = getelementptr %input, %i
    %v = load %p
    %m = fmul %v, %coef
    %acc = phi %acc.next
    %acc.next = fadd %acc, %m
    %i.next = add %i, 1
    %cmp = icmp %i.next, %n
    br %cmp
  }
}
";

fn main() {
    println!("=== FIR mapping example ===\n");

    let config = ParamConfig::default(); // 4x4 grid, heuristic mapping
    let report = map_kernel_source(FIR, &config, None).unwrap();

    print!("{}", report.text);

    match report.kind {
        ReportKind::Success { ii } => {
            println!("achieved II: {}", ii);
            println!("ResMII: {}, RecMII: {}", report.res_mii, report.rec_mii);
        }
        other => println!("mapping did not succeed: {:?}", other),
    }
}
