//! CGRA mapper CLI
//!
//! Usage:
//!   cgramap kernel.ir
//!   cgramap kernel.ir --param ./param.json --output-dir ./out
//!   cat kernel.ir | cgramap
//!
//! Reads a kernel in the textual IR format, maps it onto the CGRA
//! described by the parameter file, and writes dfg.dot, dfg.json,
//! schedule.json and incremental.json next to the report.

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use cgra_mapper::{map_kernel_source, IncrementalSeed, MappingReport, ParamConfig, ReportKind};

#[derive(ClapParser, Debug)]
#[command(name = "cgramap")]
#[command(version = "0.1.0")]
#[command(about = "Maps loop kernels onto a CGRA via modulo scheduling")]
struct Args {
    /// Kernel IR file (reads stdin when omitted)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Parameter JSON file
    #[arg(short = 'p', long = "param", default_value = "./param.json")]
    param: PathBuf,

    /// Directory the artifacts are written to
    #[arg(short = 'o', long = "output-dir", default_value = ".")]
    output_dir: PathBuf,

    /// Print the full report instead of the summary
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match ParamConfig::load(&args.param) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Configuration error".red(), e);
            std::process::exit(1);
        }
    };

    let source = match &args.input {
        Some(path) => fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read {:?}: {}", "Error".red(), path, e);
            std::process::exit(1);
        }),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
                eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
                std::process::exit(1);
            });
            buffer
        }
    };

    // A prior placement file seeds incremental mapping; a missing file
    // just means a full mapping runs.
    let seed = if config.incremental_mapping {
        load_seed(&args.output_dir.join("incremental.json"))
    } else {
        None
    };

    let report = match map_kernel_source(&source, &config, seed.as_ref()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    if args.verbose {
        print!("{}", report.text);
    }
    print_summary(&report);

    if let Err(e) = write_artifacts(&args.output_dir, &report) {
        eprintln!("{}: Failed to write artifacts: {}", "Error".red(), e);
        std::process::exit(1);
    }

    match report.kind {
        ReportKind::MappingFail { .. } | ReportKind::Infeasible { .. } => std::process::exit(1),
        _ => {}
    }
}

fn load_seed(path: &Path) -> Option<IncrementalSeed> {
    let text = fs::read_to_string(path).ok()?;
    match IncrementalSeed::from_json_str(&text) {
        Ok(seed) => Some(seed),
        Err(e) => {
            eprintln!(
                "{}: ignoring unreadable seed {:?}: {}",
                "Warning".yellow(),
                path,
                e
            );
            None
        }
    }
}

fn print_summary(report: &MappingReport) {
    match &report.kind {
        ReportKind::Success { ii } => {
            println!(
                "{}: II={} (ResMII={}, RecMII={}), scheduled in {}ms",
                "Mapping success".green().bold(),
                ii,
                report.res_mii,
                report.rec_mii,
                report.elapsed_ms
            );
        }
        ReportKind::AnalysisOnly => {
            println!("{}: DFG analysis only, mapping disabled", "Done".green());
        }
        ReportKind::NotApplicable => {
            println!("{}", "Function is not in the target list".yellow());
        }
        ReportKind::MappingFail { missing } => {
            println!(
                "{}: missing functional units: {}",
                "Mapping fail".red().bold(),
                missing.join(" ")
            );
        }
        ReportKind::Infeasible { ii_cap } => {
            println!(
                "{}: no feasible mapping up to II={}",
                "Mapping fail".red().bold(),
                ii_cap
            );
        }
    }
}

fn write_artifacts(dir: &Path, report: &MappingReport) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let artifacts = [
        ("dfg.dot", &report.dfg_dot),
        ("dfg.json", &report.dfg_json),
        ("schedule.json", &report.schedule_json),
        ("incremental.json", &report.incremental_json),
    ];
    for (name, payload) in artifacts {
        if let Some(content) = payload {
            fs::write(dir.join(name), content)?;
            println!("wrote {}", dir.join(name).display());
        }
    }
    Ok(())
}
