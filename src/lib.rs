//! CGRA loop mapper
//!
//! Maps the data-flow graph of a compute kernel's loop onto a
//! coarse-grained reconfigurable array as a modulo-scheduled pipeline:
//! every operation lands on a (tile, slot) pair and every dependency is
//! routed through the mesh over time, at the smallest feasible
//! initiation interval.
//!
//! # Example
//!
//! ```rust
//! use cgra_mapper::{map_kernel_source, ParamConfig};
//!
//! let config = ParamConfig::default(); // 4x4 array, heuristic mapping
//! let source = "func fir { loop 0 {\n%a = phi %a.next\n%a.next = add %a, 1\n} }";
//! let report = map_kernel_source(source, &config, None).unwrap();
//! assert!(report.text.contains("[Mapping Success]"));
//! ```

pub mod cgra;
pub mod config;
pub mod dfg;
pub mod error;
pub mod ir;
pub mod kernels;
pub mod lexer;
pub mod mapper;
pub mod parser;
pub mod router;
pub mod schedule;

use std::fmt::Write as _;
use std::time::Instant;

pub use cgra::Cgra;
pub use config::{MultiCycleStrategy, ParamConfig};
pub use dfg::{Dfg, DfgOptions};
pub use error::{MapperError, MapperResult};
pub use mapper::Mapper;
pub use parser::{Module, Parser};
pub use schedule::{IncrementalSeed, Schedule};

/// Outcome class of one mapping run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportKind {
    /// A valid schedule was found at the reported II.
    Success { ii: usize },
    /// DFG analysis ran, mapping was disabled by configuration.
    AnalysisOnly,
    /// The function is not a mapping target.
    NotApplicable,
    /// No tile can host some opcodes; II escalation cannot help.
    MappingFail { missing: Vec<String> },
    /// The II cap was reached without a valid schedule.
    Infeasible { ii_cap: usize },
}

/// Everything one mapping run produced: the report text the pass prints,
/// the achieved bounds, and the artifact payloads the caller may write
/// out. The host IR is never touched.
#[derive(Debug, Clone)]
pub struct MappingReport {
    pub kind: ReportKind,
    pub text: String,
    pub res_mii: usize,
    pub rec_mii: usize,
    pub ii: Option<usize>,
    pub dfg_dot: Option<String>,
    pub dfg_json: Option<String>,
    pub schedule_json: Option<String>,
    pub incremental_json: Option<String>,
    /// Wall-clock time of the scheduling phase only.
    pub elapsed_ms: u128,
}

impl MappingReport {
    fn not_applicable(name: &str) -> Self {
        Self {
            kind: ReportKind::NotApplicable,
            text: format!("[function '{}' is not in our target list]\n", name),
            res_mii: 0,
            rec_mii: 0,
            ii: None,
            dfg_dot: None,
            dfg_json: None,
            schedule_json: None,
            incremental_json: None,
            elapsed_ms: 0,
        }
    }
}

const SEPARATOR: &str = "==================================";

/// Maps one function onto the configured CGRA.
///
/// Runs the full pass flow: target check, loop selection, DFG build and
/// analysis, CGRA construction, lower bounds, feasibility check, then
/// modulo scheduling with II escalation. `seed` supplies prior placements
/// for incremental mapping; pass `None` to map from scratch (incremental
/// runs fall back to a full mapping in that case).
pub fn map_function(
    function: &ir::Function,
    loop_tree: &ir::LoopTree,
    config: &ParamConfig,
    seed: Option<&IncrementalSeed>,
) -> MapperResult<MappingReport> {
    let Some(target_loops) = config.target_loops_for(&function.name) else {
        return Ok(MappingReport::not_applicable(&function.name));
    };

    let mut text = String::new();
    let _ = writeln!(text, "{}", SEPARATOR);
    let _ = writeln!(text, "[function '{}' is one of our targets]", function.name);

    let loops = loop_tree.select_targets(&target_loops, config.target_nested);
    if loops.is_empty() && !config.target_function {
        let _ = writeln!(text, "... no loop detected in the target kernel ...");
    }

    let mut dfg = Dfg::build(
        function,
        &loops,
        config.target_function,
        &DfgOptions::from_config(config),
    );
    if config.expandable_mapping {
        dfg.reorder_in_critical_first();
    }

    let cgra = Cgra::new(config);
    let mapper = Mapper::new(config);

    let _ = writeln!(text, "{}", SEPARATOR);
    let _ = writeln!(text, "[show opcode count]");
    text.push_str(&dfg.show_opcode_distribution());

    let dfg_dot = dfg.to_dot(config.is_trimmed_demo);
    let dfg_json = dfg.to_json()?;

    let res_mii = mapper.res_mii(&dfg, &cgra);
    let rec_mii = mapper.rec_mii(&dfg);
    let _ = writeln!(text, "{}", SEPARATOR);
    let _ = writeln!(text, "[ResMII: {}]", res_mii);
    let _ = writeln!(text, "{}", SEPARATOR);
    let _ = writeln!(text, "[RecMII: {}]", rec_mii);
    let start_ii = res_mii.max(rec_mii);

    if config.support_dvfs {
        dfg.init_dvfs_latency_multiple();
    }

    let mut report = MappingReport {
        kind: ReportKind::AnalysisOnly,
        text: String::new(),
        res_mii,
        rec_mii,
        ii: None,
        dfg_dot: Some(dfg_dot),
        dfg_json: Some(dfg_json),
        schedule_json: None,
        incremental_json: None,
        elapsed_ms: 0,
    };

    if !config.do_cgra_mapping {
        let _ = writeln!(text, "{}", SEPARATOR);
        report.text = text;
        return Ok(report);
    }

    if let Err(missing) = mapper.can_map(&cgra, &dfg) {
        let _ = writeln!(text, "{}", SEPARATOR);
        let _ = writeln!(
            text,
            "[canMap] Missing functional units: {}",
            missing.join(" ")
        );
        let _ = writeln!(text, "[Mapping Fail]");
        report.kind = ReportKind::MappingFail { missing };
        report.text = text;
        return Ok(report);
    }

    // An empty DFG pipelines trivially.
    if dfg.nodes.is_empty() {
        let mut cgra = cgra;
        cgra.reset(1);
        let schedule = Schedule::new(dfg.kernel.clone(), 0);
        let _ = writeln!(text, "{}", SEPARATOR);
        let _ = writeln!(text, "[Mapping Success]");
        report.kind = ReportKind::Success { ii: 0 };
        report.ii = Some(0);
        report.schedule_json = Some(schedule.to_json(&cgra, &dfg)?);
        report.incremental_json = Some(schedule.to_incremental_json(&dfg)?);
        report.text = text;
        return Ok(report);
    }

    let mut cgra = cgra;
    let _ = writeln!(text, "{}", SEPARATOR);
    let timer = Instant::now();
    let outcome = if config.is_static_elastic_cgra {
        // Static-elastic fabrics always take the exhaustive branch.
        let _ = writeln!(text, "[exhaustive]");
        mapper.exhaustive_map(&mut cgra, &dfg, start_ii)
    } else if !config.heuristic_mapping {
        let _ = writeln!(text, "[exhaustive]");
        mapper.exhaustive_map(&mut cgra, &dfg, start_ii)
    } else if config.incremental_mapping {
        match seed {
            Some(seed) => {
                let _ = writeln!(text, "[Incremental]");
                mapper.incremental_map(&mut cgra, &dfg, start_ii, seed)
            }
            None => {
                let _ = writeln!(text, "[heuristic]");
                mapper.heuristic_map(&mut cgra, &dfg, start_ii)
            }
        }
    } else {
        let _ = writeln!(text, "[heuristic]");
        mapper.heuristic_map(&mut cgra, &dfg, start_ii)
    };
    report.elapsed_ms = timer.elapsed().as_millis();
    let _ = writeln!(
        text,
        "Mapping algorithm elapsed time={}ms",
        report.elapsed_ms
    );

    match outcome {
        None => {
            let ii_cap = mapper.ii_cap(&dfg, &cgra);
            let _ = writeln!(text, "[fail]");
            report.kind = ReportKind::Infeasible { ii_cap };
        }
        Some((ii, schedule)) => {
            text.push_str(&schedule.show_schedule(&cgra, &dfg));
            let _ = writeln!(text, "[Mapping Success]");
            let _ = writeln!(text, "{}", SEPARATOR);
            if config.expandable_mapping {
                let _ = writeln!(text, "[ExpandableII: {}]", mapper.expandable_ii(&dfg, ii));
                let _ = writeln!(text, "{}", SEPARATOR);
            }
            let _ = writeln!(text, "[Utilization & DVFS stats]");
            text.push_str(&schedule.show_utilization(&cgra, &dfg, config.enable_power_gating));
            report.schedule_json = Some(schedule.to_json(&cgra, &dfg)?);
            // The seed file for the next incremental run; skipped when
            // this run itself consumed one.
            if !config.incremental_mapping || seed.is_none() {
                report.incremental_json = Some(schedule.to_incremental_json(&dfg)?);
            }
            report.kind = ReportKind::Success { ii };
            report.ii = Some(ii);
        }
    }
    let _ = writeln!(text, "{}", SEPARATOR);
    report.text = text;
    Ok(report)
}

/// Parses kernel-IR text and maps the target function it contains.
///
/// The target is the configured kernel when the module defines it,
/// otherwise the first function with a kernel-registry entry.
pub fn map_kernel_source(
    source: &str,
    config: &ParamConfig,
    seed: Option<&IncrementalSeed>,
) -> MapperResult<MappingReport> {
    let mut parser = Parser::new(source);
    let module = parser.parse_module()?;

    let selected = config
        .kernel
        .as_ref()
        .and_then(|kernel| module.function(kernel))
        .or_else(|| {
            module
                .functions
                .iter()
                .find(|(f, _)| config.target_loops_for(&f.name).is_some())
        })
        .or(module.functions.first());

    let (function, loop_tree) = selected.expect("parse_module guarantees a function");
    map_function(function, loop_tree, config, seed)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_fir_end_to_end() {
        let report = map_kernel_source(FIR, &ParamConfig::default(), None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
        assert_eq!(report.res_mii, 1);
        assert!(report.text.contains("[Mapping Success]"));
        assert!(report.dfg_dot.is_some());
        assert!(report.dfg_json.is_some());
        assert!(report.schedule_json.is_some());
        assert!(report.incremental_json.is_some());
    }

    #[test]
    fn test_reruns_are_byte_identical() {
        let a = map_kernel_source(FIR, &ParamConfig::default(), None).unwrap();
        let b = map_kernel_source(FIR, &ParamConfig::default(), None).unwrap();
        assert_eq!(a.schedule_json, b.schedule_json);
        assert_eq!(a.dfg_json, b.dfg_json);
        assert_eq!(a.incremental_json, b.incremental_json);
    }

    #[test]
    fn test_unknown_function_is_not_applicable() {
        let source = "func mystery { loop 0 {\n%a = add %x, %y\n} }";
        let report = map_kernel_source(source, &ParamConfig::default(), None).unwrap();
        assert_eq!(report.kind, ReportKind::NotApplicable);
        assert!(report.text.contains("not in our target list"));
        assert!(report.dfg_dot.is_none());
        assert!(report.schedule_json.is_none());
    }

    #[test]
    fn test_configured_kernel_overrides_registry() {
        let source = "func mystery { loop 0 {\n%a = add %x, %y\n} }";
        let config = ParamConfig {
            kernel: Some("mystery".to_string()),
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { ii: 1 }));
    }

    #[test]
    fn test_analysis_only_mode() {
        let config = ParamConfig {
            do_cgra_mapping: false,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(FIR, &config, None).unwrap();
        assert_eq!(report.kind, ReportKind::AnalysisOnly);
        assert!(report.dfg_dot.is_some());
        assert!(report.dfg_json.is_some());
        assert!(report.schedule_json.is_none());
    }

    #[test]
    fn test_unsupported_opcode_reports_mapping_fail() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %q = sdiv %i, %d
    %i.next = add %q, 1
  }
}
";
        let report = map_kernel_source(source, &ParamConfig::default(), None).unwrap();
        assert_eq!(
            report.kind,
            ReportKind::MappingFail {
                missing: vec!["sdiv".to_string()]
            }
        );
        assert!(report.text.contains("[canMap] Missing functional units: sdiv"));
        assert!(report.text.contains("[Mapping Fail]"));
    }

    #[test]
    fn test_distributed_idiv_split_maps() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %q = sdiv %i, %d
    %i.next = add %q, 1
  }
}
";
        let config = ParamConfig {
            multi_cycle_strategy: MultiCycleStrategy::Distributed,
            vector_factor_for_idiv: 4,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
    }

    #[test]
    fn test_missing_target_loop_maps_empty() {
        let config = ParamConfig {
            kernel: Some("kernel".to_string()),
            target_loops_id: vec![7],
            ..ParamConfig::default()
        };
        let source = "func kernel { loop 0 {\n%a = add %x, %y\n} }";
        let report = map_kernel_source(source, &config, None).unwrap();
        assert_eq!(report.kind, ReportKind::Success { ii: 0 });
        assert!(report.text.contains("no loop detected"));
        assert!(report.text.contains("[Mapping Success]"));
    }

    #[test]
    fn test_incremental_round_trip_reuses_placements() {
        let full = map_kernel_source(FIR, &ParamConfig::default(), None).unwrap();
        let seed = IncrementalSeed::from_json_str(full.incremental_json.as_ref().unwrap()).unwrap();

        let config = ParamConfig {
            incremental_mapping: true,
            ..ParamConfig::default()
        };
        let incremental = map_kernel_source(FIR, &config, Some(&seed)).unwrap();
        assert_eq!(incremental.kind, full.kind);
        assert!(incremental.text.contains("[Incremental]"));
        // No seed file is produced when a seed was consumed.
        assert!(incremental.incremental_json.is_none());

        // Placements are unchanged: there was no work to do.
        let full_json: serde_json::Value =
            serde_json::from_str(full.schedule_json.as_ref().unwrap()).unwrap();
        let inc_json: serde_json::Value =
            serde_json::from_str(incremental.schedule_json.as_ref().unwrap()).unwrap();
        assert_eq!(full_json["ii"], inc_json["ii"]);
        assert_eq!(full_json["placements"], inc_json["placements"]);
    }

    #[test]
    fn test_incremental_without_seed_runs_full_mapping() {
        let config = ParamConfig {
            incremental_mapping: true,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(FIR, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
        assert!(report.text.contains("[heuristic]"));
        // The seed file is emitted so the next run can be incremental.
        assert!(report.incremental_json.is_some());
    }

    #[test]
    fn test_static_elastic_uses_exhaustive() {
        let source = "func kernel { loop 0 {\n%a = phi %b\n%b = add %a, 1\n} }";
        let config = ParamConfig {
            kernel: Some("kernel".to_string()),
            is_static_elastic_cgra: true,
            rows: 2,
            columns: 2,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(report.text.contains("[exhaustive]"));
        assert!(matches!(report.kind, ReportKind::Success { .. }));
    }

    #[test]
    fn test_expandable_mapping_reports_expandable_ii() {
        let config = ParamConfig {
            expandable_mapping: true,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(FIR, &config, None).unwrap();
        assert!(report.text.contains("[ExpandableII:"));
    }

    #[test]
    fn test_power_gating_reports_island_stats() {
        let config = ParamConfig {
            enable_power_gating: true,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(FIR, &config, None).unwrap();
        assert!(report.text.contains("islands idle"));
    }

    #[test]
    fn test_nested_kernel_targets_innermost_loop() {
        let source = "\
func kernel_gemm {
  loop 0 {
    %j = phi %j.next
    loop 1 {
      %i = phi %i.next
      %pa = getelementptr %a, %i
      %va = load %pa
      %m = mul %va, %vb
      store %m, %pc
      %i.next = add %i, 1
    }
    %j.next = add %j, 1
  }
}
";
        // Innermost descent: the j-counter ops stay out of the DFG.
        let report = map_kernel_source(source, &ParamConfig::default(), None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
        let dfg_json: serde_json::Value =
            serde_json::from_str(report.dfg_json.as_ref().unwrap()).unwrap();
        assert_eq!(dfg_json["nodes"].as_array().unwrap().len(), 6);

        // targetNested keeps the outer loop body, j-counter included.
        let config = ParamConfig {
            target_nested: true,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        let dfg_json: serde_json::Value =
            serde_json::from_str(report.dfg_json.as_ref().unwrap()).unwrap();
        assert_eq!(dfg_json["nodes"].as_array().unwrap().len(), 9);
    }

    #[test]
    fn test_registry_targets_second_loop_of_latnrm() {
        let source = "\
func latnrm {
  loop 0 {
    %a = add %x, %y
  }
  loop 1 {
    %i = phi %i.next
    %i.next = add %i, 1
  }
}
";
        let report = map_kernel_source(source, &ParamConfig::default(), None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
        let dfg_json: serde_json::Value =
            serde_json::from_str(report.dfg_json.as_ref().unwrap()).unwrap();
        // Only the phi/add counter of loop 1 is mapped.
        let nodes = dfg_json["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["opcode"], "phi");
    }

    #[test]
    fn test_inclusive_strategy_maps_denser() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %a = load %pa
    %m = fmul %a, %c
    store %m, %pb
    %i.next = add %i, 1
  }
}
";
        let config = ParamConfig {
            kernel: Some("kernel".to_string()),
            rows: 2,
            columns: 2,
            multi_cycle_strategy: MultiCycleStrategy::Inclusive,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
    }

    #[test]
    fn test_vector_ops_respect_vectorization_mode() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %v = vload %p
    %s = vmul %v, %w
    vstore %s, %q
    %i.next = add %i, 1
  }
}
";
        let config = ParamConfig {
            kernel: Some("kernel".to_string()),
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));

        let config = ParamConfig {
            kernel: Some("kernel".to_string()),
            vectorization_mode: "none".to_string(),
            ..ParamConfig::default()
        };
        let report = map_kernel_source(source, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::MappingFail { .. }));
        assert!(report.text.contains("vload"));
    }

    #[test]
    fn test_dvfs_aware_mapping_succeeds() {
        let config = ParamConfig {
            support_dvfs: true,
            dvfs_aware_mapping: true,
            ..ParamConfig::default()
        };
        let report = map_kernel_source(FIR, &config, None).unwrap();
        assert!(matches!(report.kind, ReportKind::Success { .. }));
    }
}
