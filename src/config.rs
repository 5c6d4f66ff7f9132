//! Parameter configuration for the mapper
//!
//! The `param.json` format: a flat JSON object with camelCase keys.
//! `row`, `column`, `kernel` and `targetLoopsID` are required when a
//! file is supplied; everything else has a default. A missing file falls
//! back to the full default set with a warning, in which case no kernel
//! override is active and only the built-in registry selects targets.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::error::{MapperError, MapperResult};

/// How multi-cycle operations occupy tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiCycleStrategy {
    /// A multi-cycle op owns its tile for all of its latency slots.
    Exclusive,
    /// Integer divisions are split into chains of single-cycle `divstep` ops.
    Distributed,
    /// Other ops may share the tile during drain slots.
    Inclusive,
}

impl Default for MultiCycleStrategy {
    fn default() -> Self {
        MultiCycleStrategy::Exclusive
    }
}

/// Resolved mapper parameters.
#[derive(Debug, Clone)]
pub struct ParamConfig {
    pub rows: usize,
    pub columns: usize,
    /// Kernel symbol the configuration targets, if a file was supplied.
    pub kernel: Option<String>,
    pub target_loops_id: Vec<usize>,
    pub target_function: bool,
    pub target_nested: bool,
    pub do_cgra_mapping: bool,
    pub is_static_elastic_cgra: bool,
    pub is_trimmed_demo: bool,
    pub ctrl_mem_constraint: usize,
    pub bypass_constraint: usize,
    pub reg_constraint: usize,
    pub precision_aware: bool,
    pub vectorization_mode: String,
    pub heuristic_mapping: bool,
    pub parameterizable_cgra: bool,
    pub incremental_mapping: bool,
    pub support_dvfs: bool,
    pub dvfs_aware_mapping: bool,
    pub dvfs_island_dim: usize,
    pub enable_power_gating: bool,
    pub expandable_mapping: bool,
    pub vector_factor_for_idiv: usize,
    pub multi_cycle_strategy: MultiCycleStrategy,
    /// Opcode -> execution latency overrides.
    pub opt_latency: BTreeMap<String, u32>,
    /// Opcodes whose FUs accept a new operation every cycle.
    pub opt_pipelined: Vec<String>,
    /// Names of the active fusion patterns, in priority registration order.
    pub fusion_strategy: Vec<String>,
    /// Pattern name -> ordered opcode sequence. Merged over the built-ins.
    pub fusion_pattern: BTreeMap<String, Vec<String>>,
    /// Tile id -> extra opcodes that tile supports.
    pub additional_func: BTreeMap<usize, Vec<String>>,
    /// Offset applied to numeric opcode ids in the DFG JSON artifact.
    pub testing_opcode_offset: i64,
    /// Extra router cost per occupied resource on a transit tile.
    pub router_congestion_weight: u64,
    /// Total failed placements tolerated before a mapping attempt at one II
    /// gives up.
    pub backtrack_budget: usize,
    /// Number of placements undone per backtrack step.
    pub backtrack_depth: usize,
}

impl Default for ParamConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            columns: 4,
            kernel: None,
            target_loops_id: vec![0],
            target_function: false,
            target_nested: false,
            do_cgra_mapping: true,
            is_static_elastic_cgra: false,
            is_trimmed_demo: true,
            ctrl_mem_constraint: 200,
            bypass_constraint: 4,
            reg_constraint: 8,
            precision_aware: false,
            vectorization_mode: "all".to_string(),
            heuristic_mapping: true,
            parameterizable_cgra: false,
            incremental_mapping: false,
            support_dvfs: false,
            dvfs_aware_mapping: false,
            dvfs_island_dim: 2,
            enable_power_gating: false,
            expandable_mapping: false,
            vector_factor_for_idiv: 1,
            multi_cycle_strategy: MultiCycleStrategy::Exclusive,
            opt_latency: BTreeMap::new(),
            opt_pipelined: Vec::new(),
            fusion_strategy: Vec::new(),
            fusion_pattern: BTreeMap::new(),
            additional_func: BTreeMap::new(),
            testing_opcode_offset: 0,
            router_congestion_weight: 1,
            backtrack_budget: 64,
            backtrack_depth: 1,
        }
    }
}

/// Raw deserialization target matching the JSON key spelling.
#[derive(Debug, Default, Deserialize)]
struct RawParam {
    row: Option<usize>,
    column: Option<usize>,
    kernel: Option<String>,
    #[serde(rename = "targetLoopsID")]
    target_loops_id: Option<Vec<usize>>,
    #[serde(rename = "targetFunction")]
    target_function: Option<bool>,
    #[serde(rename = "targetNested")]
    target_nested: Option<bool>,
    #[serde(rename = "doCGRAMapping")]
    do_cgra_mapping: Option<bool>,
    #[serde(rename = "isStaticElasticCGRA")]
    is_static_elastic_cgra: Option<bool>,
    #[serde(rename = "isTrimmedDemo")]
    is_trimmed_demo: Option<bool>,
    #[serde(rename = "ctrlMemConstraint")]
    ctrl_mem_constraint: Option<usize>,
    #[serde(rename = "bypassConstraint")]
    bypass_constraint: Option<usize>,
    #[serde(rename = "regConstraint")]
    reg_constraint: Option<usize>,
    #[serde(rename = "precisionAware")]
    precision_aware: Option<bool>,
    #[serde(rename = "vectorizationMode")]
    vectorization_mode: Option<String>,
    #[serde(rename = "heuristicMapping")]
    heuristic_mapping: Option<bool>,
    #[serde(rename = "parameterizableCGRA")]
    parameterizable_cgra: Option<bool>,
    #[serde(rename = "incrementalMapping")]
    incremental_mapping: Option<bool>,
    #[serde(rename = "supportDVFS")]
    support_dvfs: Option<bool>,
    #[serde(rename = "DVFSAwareMapping")]
    dvfs_aware_mapping: Option<bool>,
    #[serde(rename = "DVFSIslandDim")]
    dvfs_island_dim: Option<usize>,
    #[serde(rename = "enablePowerGating")]
    enable_power_gating: Option<bool>,
    #[serde(rename = "expandableMapping")]
    expandable_mapping: Option<bool>,
    #[serde(rename = "vectorFactorForIdiv")]
    vector_factor_for_idiv: Option<usize>,
    // Old parameter files carry this key with a trailing space.
    #[serde(rename = "vectorFactorForIdiv ")]
    vector_factor_for_idiv_spaced: Option<usize>,
    #[serde(rename = "multiCycleStrategy")]
    multi_cycle_strategy: Option<MultiCycleStrategy>,
    #[serde(rename = "optLatency")]
    opt_latency: Option<BTreeMap<String, u32>>,
    #[serde(rename = "optPipelined")]
    opt_pipelined: Option<Vec<String>>,
    #[serde(rename = "fusionStrategy")]
    fusion_strategy: Option<Vec<String>>,
    #[serde(rename = "fusionPattern")]
    fusion_pattern: Option<BTreeMap<String, Vec<String>>>,
    #[serde(rename = "additionalFunc")]
    additional_func: Option<BTreeMap<String, Vec<String>>>,
    #[serde(rename = "testingOpcodeOffset")]
    testing_opcode_offset: Option<i64>,
    #[serde(rename = "routerCongestionWeight")]
    router_congestion_weight: Option<u64>,
    #[serde(rename = "backtrackBudget")]
    backtrack_budget: Option<usize>,
    #[serde(rename = "backtrackDepth")]
    backtrack_depth: Option<usize>,
}

impl ParamConfig {
    /// Parse a parameter JSON string, failing fast when a required key is
    /// missing. The error names every absent key.
    pub fn from_json_str(text: &str) -> MapperResult<Self> {
        let raw: RawParam = serde_json::from_str(text)?;

        let mut missing = Vec::new();
        if raw.row.is_none() {
            missing.push("row");
        }
        if raw.column.is_none() {
            missing.push("column");
        }
        if raw.kernel.is_none() {
            missing.push("kernel");
        }
        if raw.target_loops_id.is_none() {
            missing.push("targetLoopsID");
        }
        if !missing.is_empty() {
            return Err(MapperError::config(missing.join(", ")));
        }

        let defaults = ParamConfig::default();

        let vector_factor_for_idiv = match (raw.vector_factor_for_idiv, raw.vector_factor_for_idiv_spaced)
        {
            (Some(v), _) => v,
            (None, Some(v)) => {
                warn!("parameter key \"vectorFactorForIdiv \" (trailing space) is deprecated");
                v
            }
            (None, None) => defaults.vector_factor_for_idiv,
        };

        let mut additional_func = BTreeMap::new();
        if let Some(raw_funcs) = raw.additional_func {
            for (key, opcodes) in raw_funcs {
                let tile: usize = key.parse().map_err(|_| {
                    MapperError::config(format!("additionalFunc tile id '{}'", key))
                })?;
                additional_func.insert(tile, opcodes);
            }
        }

        Ok(Self {
            rows: raw.row.unwrap(),
            columns: raw.column.unwrap(),
            kernel: raw.kernel,
            target_loops_id: raw.target_loops_id.unwrap(),
            target_function: raw.target_function.unwrap_or(defaults.target_function),
            target_nested: raw.target_nested.unwrap_or(defaults.target_nested),
            do_cgra_mapping: raw.do_cgra_mapping.unwrap_or(defaults.do_cgra_mapping),
            is_static_elastic_cgra: raw
                .is_static_elastic_cgra
                .unwrap_or(defaults.is_static_elastic_cgra),
            is_trimmed_demo: raw.is_trimmed_demo.unwrap_or(defaults.is_trimmed_demo),
            ctrl_mem_constraint: raw
                .ctrl_mem_constraint
                .unwrap_or(defaults.ctrl_mem_constraint),
            bypass_constraint: raw.bypass_constraint.unwrap_or(defaults.bypass_constraint),
            reg_constraint: raw.reg_constraint.unwrap_or(defaults.reg_constraint),
            precision_aware: raw.precision_aware.unwrap_or(defaults.precision_aware),
            vectorization_mode: raw
                .vectorization_mode
                .unwrap_or_else(|| defaults.vectorization_mode.clone()),
            heuristic_mapping: raw.heuristic_mapping.unwrap_or(defaults.heuristic_mapping),
            parameterizable_cgra: raw
                .parameterizable_cgra
                .unwrap_or(defaults.parameterizable_cgra),
            incremental_mapping: raw
                .incremental_mapping
                .unwrap_or(defaults.incremental_mapping),
            support_dvfs: raw.support_dvfs.unwrap_or(defaults.support_dvfs),
            dvfs_aware_mapping: raw
                .dvfs_aware_mapping
                .unwrap_or(defaults.dvfs_aware_mapping),
            dvfs_island_dim: raw.dvfs_island_dim.unwrap_or(defaults.dvfs_island_dim),
            enable_power_gating: raw
                .enable_power_gating
                .unwrap_or(defaults.enable_power_gating),
            expandable_mapping: raw
                .expandable_mapping
                .unwrap_or(defaults.expandable_mapping),
            vector_factor_for_idiv,
            multi_cycle_strategy: raw
                .multi_cycle_strategy
                .unwrap_or(defaults.multi_cycle_strategy),
            opt_latency: raw.opt_latency.unwrap_or_default(),
            opt_pipelined: raw.opt_pipelined.unwrap_or_default(),
            fusion_strategy: raw.fusion_strategy.unwrap_or_default(),
            fusion_pattern: raw.fusion_pattern.unwrap_or_default(),
            additional_func,
            testing_opcode_offset: raw
                .testing_opcode_offset
                .unwrap_or(defaults.testing_opcode_offset),
            router_congestion_weight: raw
                .router_congestion_weight
                .unwrap_or(defaults.router_congestion_weight),
            backtrack_budget: raw.backtrack_budget.unwrap_or(defaults.backtrack_budget),
            backtrack_depth: raw.backtrack_depth.unwrap_or(defaults.backtrack_depth),
        })
    }

    /// Load a parameter file; a missing file yields the defaults with a
    /// warning.
    pub fn load(path: &Path) -> MapperResult<Self> {
        if !path.exists() {
            warn!(
                "no parameter file at {:?}; a set of default parameters is leveraged",
                path
            );
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Target loop ids for `function_name`: the configured kernel wins,
    /// otherwise the built-in registry. `None` means the function is not a
    /// mapping target at all.
    pub fn target_loops_for(&self, function_name: &str) -> Option<Vec<usize>> {
        if let Some(kernel) = &self.kernel {
            if kernel == function_name {
                return Some(self.target_loops_id.clone());
            }
        }
        crate::kernels::default_kernels().get(function_name).cloned()
    }
}
