//! Example: opcode fusion on a sparse matrix-vector kernel
//!
//! Maps the spmv inner loop twice, with and without the fma fusion
//! pattern, and compares node counts and achieved IIs.
//!
//! Run with: cargo run --example fused_spmv

use cgra_mapper::{map_kernel_source, ParamConfig, ReportKind};

const SPMV: &str = "\
func spmv {
  loop 0 {
    %k = phi %k.next
    %pc = getelementptr %col, %k
    %c = load %pc
    %pv = getelementptr %val, %k
    %v = load %pv
    %px = getelementptr %x, %c
    %xv = load %px
    %m = fmul %v, %xv
    %sum = phi %sum.next
    %sum.next = fadd %sum, %m
    %k.next = add %k, 1
    %cmp = icmp %k.next, %rowend
    br %cmp
  }
}
";

fn run(label: &str, config: &ParamConfig) {
    let report = map_kernel_source(SPMV, config, None).unwrap();
    match report.kind {
        ReportKind::Success { ii } => println!(
            "{}: II={} (ResMII={}, RecMII={})",
            label, ii, report.res_mii, report.rec_mii
        ),
        other => println!("{}: {:?}", label, other),
    }
}

fn main() {
    println!("=== spmv fusion example ===\n");

    run("plain", &ParamConfig::default());

    let fused = ParamConfig {
        fusion_strategy: vec!["fma".to_string()],
        ..ParamConfig::default()
    };
    run("with fma fusion", &fused);
}
