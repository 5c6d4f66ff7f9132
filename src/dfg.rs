//! Data-flow graph of a loop kernel
//!
//! Nodes are operations, edges are value dependencies carrying an
//! iteration distance (0 = same iteration, >=1 = loop-carried). Nodes and
//! edges live in dense arenas and reference each other by id, which keeps
//! serialization and backtracking cheap and iteration order deterministic.
//!
//! The builder consumes the abstract IR view, collapses address
//! computation chains, applies opcode fusion, and optionally splits
//! integer divisions into single-cycle chains (distributed multi-cycle
//! strategy). Strongly-connected components and critical-path lengths are
//! computed once the structure is final.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use serde::Serialize;

use crate::config::{MultiCycleStrategy, ParamConfig};
use crate::error::MapperResult;
use crate::ir::{
    self, default_latency, is_integer_div, opcode_index, type_class_of, Function, Loop, TypeClass,
};

/// Dense id of a DFG node.
pub type NodeId = usize;

/// Dense id of a DFG edge.
pub type EdgeId = usize;

/// A single operation in the DFG.
#[derive(Debug, Clone)]
pub struct DfgNode {
    pub id: NodeId,
    pub opcode: String,
    pub type_class: TypeClass,
    /// Precision class, populated under precision-aware packing.
    pub precision: Option<String>,
    /// Execution latency in cycles at nominal frequency.
    pub cycles: u32,
    /// FU accepts a new operation each cycle while this one drains.
    pub pipelined: bool,
    /// Group index when this node is the product of pattern fusion.
    pub fusion_group: Option<usize>,
    /// Latency multiplier from DVFS island assignment (1 = full speed).
    pub dvfs_multiple: u32,
    /// Opcode is in the supported whitelist.
    pub supported: bool,
    pub preds: Vec<EdgeId>,
    pub succs: Vec<EdgeId>,
}

impl DfgNode {
    /// Effective latency including the DVFS slowdown.
    pub fn latency(&self) -> u32 {
        self.cycles * self.dvfs_multiple
    }
}

/// A value dependency between two DFG nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfgEdge {
    pub id: EdgeId,
    pub src: NodeId,
    pub dst: NodeId,
    /// Iteration distance: 0 within an iteration, >=1 loop-carried.
    pub distance: u32,
}

/// A strongly-connected component and its recurrence weight.
#[derive(Debug, Clone)]
pub struct Scc {
    pub nodes: Vec<NodeId>,
    /// ceil(sum of node cycles / sum of edge distances) over the SCC.
    pub weight: u32,
}

/// Build-time options distilled from the parameter configuration.
#[derive(Debug, Clone, Default)]
pub struct DfgOptions {
    pub precision_aware: bool,
    pub vector_factor_for_idiv: usize,
    pub multi_cycle_strategy: MultiCycleStrategy,
    pub opt_latency: BTreeMap<String, u32>,
    pub opt_pipelined: Vec<String>,
    pub fusion_strategy: Vec<String>,
    pub fusion_pattern: BTreeMap<String, Vec<String>>,
    pub testing_opcode_offset: i64,
}

impl DfgOptions {
    pub fn from_config(config: &ParamConfig) -> Self {
        Self {
            precision_aware: config.precision_aware,
            vector_factor_for_idiv: config.vector_factor_for_idiv,
            multi_cycle_strategy: config.multi_cycle_strategy,
            opt_latency: config.opt_latency.clone(),
            opt_pipelined: config.opt_pipelined.clone(),
            fusion_strategy: config.fusion_strategy.clone(),
            fusion_pattern: config.fusion_pattern.clone(),
            testing_opcode_offset: config.testing_opcode_offset,
        }
    }
}

/// Fusion patterns every build knows about; the configuration may add or
/// override entries under the same names.
pub fn builtin_fusion_patterns() -> BTreeMap<String, Vec<String>> {
    let mut patterns = BTreeMap::new();
    patterns.insert(
        "fma".to_string(),
        vec!["fmul".to_string(), "fadd".to_string()],
    );
    patterns.insert(
        "mac".to_string(),
        vec!["mul".to_string(), "add".to_string()],
    );
    patterns.insert(
        "mux".to_string(),
        vec!["icmp".to_string(), "select".to_string()],
    );
    patterns.insert(
        "ldadd".to_string(),
        vec!["load".to_string(), "add".to_string()],
    );
    patterns
}

/// The data-flow graph of one kernel.
#[derive(Debug, Clone)]
pub struct Dfg {
    pub kernel: String,
    pub nodes: Vec<DfgNode>,
    pub edges: Vec<DfgEdge>,
    pub sccs: Vec<Scc>,
    critical_order: Option<Vec<NodeId>>,
    precision_aware: bool,
    testing_opcode_offset: i64,
    opt_latency: BTreeMap<String, u32>,
    opt_pipelined: Vec<String>,
}

impl Dfg {
    /// Builds the DFG of the selected loops (or the whole function).
    pub fn build(
        function: &Function,
        loops: &[&Loop],
        entire_function: bool,
        options: &DfgOptions,
    ) -> Dfg {
        let mut dfg = Dfg {
            kernel: function.name.clone(),
            nodes: Vec::new(),
            edges: Vec::new(),
            sccs: Vec::new(),
            critical_order: None,
            precision_aware: options.precision_aware,
            testing_opcode_offset: options.testing_opcode_offset,
            opt_latency: options.opt_latency.clone(),
            opt_pipelined: options.opt_pipelined.clone(),
        };

        let members: BTreeSet<ir::OpId> = if entire_function {
            (0..function.operations.len()).collect()
        } else {
            loops.iter().flat_map(|l| l.body.iter().copied()).collect()
        };

        let repr = collapse_gep_chains(function, &members);

        // One node per non-collapsed member operation, in program order.
        let mut node_of: HashMap<ir::OpId, NodeId> = HashMap::new();
        for &op_id in &members {
            if repr.get(&op_id).copied().unwrap_or(op_id) != op_id {
                continue;
            }
            let op = &function.operations[op_id];
            let id = dfg.nodes.len();
            let node = dfg.make_node(id, &op.opcode);
            dfg.nodes.push(node);
            node_of.insert(op_id, id);
        }

        // Dependency edges; phi operands defined inside the loop body are
        // loop-carried.
        let mut seen = BTreeSet::new();
        for &op_id in &members {
            let op = &function.operations[op_id];
            let dst = node_of[&repr.get(&op_id).copied().unwrap_or(op_id)];
            for &value in &op.operands {
                let Some(def) = function.defining_op(value) else {
                    continue;
                };
                if !members.contains(&def) {
                    continue;
                }
                let src = node_of[&repr.get(&def).copied().unwrap_or(def)];
                if src == dst && op.opcode != "phi" {
                    // Internal edge of a collapsed address chain.
                    continue;
                }
                let distance = if op.opcode == "phi" { 1 } else { 0 };
                if seen.insert((src, dst, distance)) {
                    dfg.add_edge(src, dst, distance);
                }
            }
        }

        dfg.fuse(&options.fusion_strategy, &options.fusion_pattern);

        if options.multi_cycle_strategy == MultiCycleStrategy::Distributed
            && options.vector_factor_for_idiv > 1
        {
            dfg.split_integer_divisions(options.vector_factor_for_idiv);
        }

        dfg.recompute_sccs();
        dfg
    }

    fn make_node(&self, id: NodeId, opcode: &str) -> DfgNode {
        let type_class = type_class_of(opcode);
        let precision = if self.precision_aware {
            Some(
                match type_class {
                    TypeClass::Float => "single",
                    _ => "word",
                }
                .to_string(),
            )
        } else {
            None
        };
        DfgNode {
            id,
            opcode: opcode.to_string(),
            type_class,
            precision,
            cycles: self
                .opt_latency
                .get(opcode)
                .copied()
                .unwrap_or_else(|| default_latency(opcode)),
            pipelined: self.opt_pipelined.iter().any(|op| op == opcode),
            fusion_group: None,
            dvfs_multiple: 1,
            supported: opcode_index(opcode).is_some(),
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    fn add_edge(&mut self, src: NodeId, dst: NodeId, distance: u32) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(DfgEdge {
            id,
            src,
            dst,
            distance,
        });
        self.nodes[src].succs.push(id);
        self.nodes[dst].preds.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &DfgNode {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &DfgEdge {
        &self.edges[id]
    }

    /// Fuses matching opcode chains into single nodes.
    ///
    /// Active patterns are tried longest first; equal lengths keep the
    /// registration order of `strategy`. A chain matches when every
    /// interior node's value is consumed only by the next node in the
    /// chain, along distance-0 edges. Fusion is idempotent: fused opcodes
    /// never match the plain-opcode patterns again.
    pub fn fuse(&mut self, strategy: &[String], patterns: &BTreeMap<String, Vec<String>>) {
        if strategy.is_empty() {
            return;
        }
        let mut table = builtin_fusion_patterns();
        for (name, seq) in patterns {
            table.insert(name.clone(), seq.clone());
        }

        let mut active: Vec<(String, Vec<String>)> = strategy
            .iter()
            .filter_map(|name| table.get(name).map(|seq| (name.clone(), seq.clone())))
            .collect();
        active.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut group_of: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut groups: Vec<(String, Vec<NodeId>)> = Vec::new();

        for (name, seq) in &active {
            if seq.len() < 2 {
                continue;
            }
            for start in 0..self.nodes.len() {
                if group_of[start].is_some() || self.nodes[start].opcode != seq[0] {
                    continue;
                }
                if let Some(chain) = self.match_chain(start, seq, &group_of) {
                    let group = groups.len();
                    for &member in &chain {
                        group_of[member] = Some(group);
                    }
                    groups.push((name.clone(), chain));
                }
            }
        }

        if !groups.is_empty() {
            self.merge_groups(&group_of, &groups);
        }
    }

    /// Tries to extend a chain from `start` along the opcode sequence.
    fn match_chain(
        &self,
        start: NodeId,
        seq: &[String],
        group_of: &[Option<usize>],
    ) -> Option<Vec<NodeId>> {
        let mut chain = vec![start];
        let mut current = start;
        for expect in &seq[1..] {
            // The interior value must feed exactly one consumer.
            if self.nodes[current].succs.len() != 1 {
                return None;
            }
            let edge = &self.edges[self.nodes[current].succs[0]];
            if edge.distance != 0 {
                return None;
            }
            let next = edge.dst;
            if group_of[next].is_some() || self.nodes[next].opcode != *expect {
                return None;
            }
            chain.push(next);
            current = next;
        }
        Some(chain)
    }

    /// Rebuilds the arenas with each fusion group merged into one node.
    fn merge_groups(&mut self, group_of: &[Option<usize>], groups: &[(String, Vec<NodeId>)]) {
        let mut new_id_of: Vec<Option<NodeId>> = vec![None; self.nodes.len()];
        let mut new_nodes: Vec<DfgNode> = Vec::new();

        for old in 0..self.nodes.len() {
            match group_of[old] {
                Some(group) => {
                    let (name, members) = &groups[group];
                    let head = members[0];
                    if old == head {
                        let id = new_nodes.len();
                        let mut node = self.make_node(id, name);
                        node.fusion_group = Some(group);
                        new_nodes.push(node);
                        new_id_of[old] = Some(id);
                    } else {
                        new_id_of[old] = None;
                    }
                }
                None => {
                    let id = new_nodes.len();
                    let mut node = self.nodes[old].clone();
                    node.id = id;
                    node.preds.clear();
                    node.succs.clear();
                    new_id_of[old] = Some(id);
                    new_nodes.push(node);
                }
            }
        }

        // Resolve a collapsed member to its group head's new id.
        let resolve = |old: NodeId| -> NodeId {
            match group_of[old] {
                Some(group) => new_id_of[groups[group].1[0]].unwrap(),
                None => new_id_of[old].unwrap(),
            }
        };

        let old_edges = std::mem::take(&mut self.edges);
        self.nodes = new_nodes;
        let mut seen = BTreeSet::new();
        for edge in &old_edges {
            let src = resolve(edge.src);
            let dst = resolve(edge.dst);
            if src == dst && edge.distance == 0 {
                continue;
            }
            if seen.insert((src, dst, edge.distance)) {
                self.add_edge(src, dst, edge.distance);
            }
        }
        self.critical_order = None;
    }

    /// Splits each integer division into `factor` chained `divstep` nodes
    /// (distributed multi-cycle strategy).
    fn split_integer_divisions(&mut self, factor: usize) {
        if !self.nodes.iter().any(|n| is_integer_div(&n.opcode)) {
            return;
        }

        // first/last new id per old node.
        let mut span_of: Vec<(NodeId, NodeId)> = Vec::with_capacity(self.nodes.len());
        let mut new_nodes: Vec<DfgNode> = Vec::new();
        let mut chains: Vec<(NodeId, NodeId)> = Vec::new();

        for old in &self.nodes {
            if is_integer_div(&old.opcode) {
                let first = new_nodes.len();
                for _ in 0..factor {
                    let id = new_nodes.len();
                    new_nodes.push(self.make_node(id, "divstep"));
                }
                let last = new_nodes.len() - 1;
                span_of.push((first, last));
                chains.push((first, last));
            } else {
                let id = new_nodes.len();
                let mut node = old.clone();
                node.id = id;
                node.preds.clear();
                node.succs.clear();
                span_of.push((id, id));
                new_nodes.push(node);
            }
        }

        let old_edges = std::mem::take(&mut self.edges);
        self.nodes = new_nodes;
        let mut seen = BTreeSet::new();
        for edge in &old_edges {
            let src = span_of[edge.src].1;
            let dst = span_of[edge.dst].0;
            if seen.insert((src, dst, edge.distance)) {
                self.add_edge(src, dst, edge.distance);
            }
        }
        for (first, last) in chains {
            for step in first..last {
                self.add_edge(step, step + 1, 0);
            }
        }
        self.critical_order = None;
    }

    /// Recomputes strongly-connected components and their recurrence
    /// weights. Only cyclic components (size > 1 or a self-edge) are kept.
    pub fn recompute_sccs(&mut self) {
        let components = tarjan_sccs(&self.nodes, &self.edges);
        let mut sccs = Vec::new();
        for nodes in components {
            let in_scc: BTreeSet<NodeId> = nodes.iter().copied().collect();
            let cyclic = nodes.len() > 1
                || self
                    .edges
                    .iter()
                    .any(|e| e.src == nodes[0] && e.dst == nodes[0]);
            if !cyclic {
                continue;
            }
            let cycles: u32 = nodes.iter().map(|&n| self.nodes[n].cycles).sum();
            let distance: u32 = self
                .edges
                .iter()
                .filter(|e| in_scc.contains(&e.src) && in_scc.contains(&e.dst))
                .map(|e| e.distance)
                .sum();
            let weight = if distance == 0 {
                cycles
            } else {
                cycles.div_ceil(distance)
            };
            sccs.push(Scc { nodes, weight });
        }
        sccs.sort_by_key(|scc| scc.nodes[0]);
        self.sccs = sccs;
    }

    /// Whether a node participates in any recurrence cycle.
    pub fn in_recurrence(&self, node: NodeId) -> bool {
        self.sccs.iter().any(|scc| scc.nodes.contains(&node))
    }

    /// Marks nodes of the heaviest SCCs as hot (true) for DVFS-aware
    /// priority.
    pub fn hot_nodes(&self) -> Vec<bool> {
        let mut hot = vec![false; self.nodes.len()];
        let Some(max) = self.sccs.iter().map(|s| s.weight).max() else {
            return hot;
        };
        for scc in self.sccs.iter().filter(|s| s.weight == max) {
            for &n in &scc.nodes {
                hot[n] = true;
            }
        }
        hot
    }

    /// Assigns DVFS latency multiples: recurrence nodes stay at full
    /// frequency, everything else tolerates a half-frequency island.
    pub fn init_dvfs_latency_multiple(&mut self) {
        let in_cycle: Vec<bool> = (0..self.nodes.len())
            .map(|n| self.in_recurrence(n))
            .collect();
        for node in &mut self.nodes {
            node.dvfs_multiple = if in_cycle[node.id] { 1 } else { 2 };
        }
    }

    /// Longest distance-0 path from each node to a sink, in effective
    /// cycles. This is the primary scheduling priority.
    pub fn critical_path_lengths(&self) -> Vec<u32> {
        let order = self.topological_order();
        let mut cp = vec![0u32; self.nodes.len()];
        for &n in order.iter().rev() {
            let mut best = 0;
            for &e in &self.nodes[n].succs {
                let edge = &self.edges[e];
                if edge.distance == 0 {
                    best = best.max(cp[edge.dst]);
                }
            }
            cp[n] = self.nodes[n].latency() + best;
        }
        cp
    }

    /// Topological order over distance-0 edges, smallest id first among
    /// ready nodes.
    fn topological_order(&self) -> Vec<NodeId> {
        let mut indeg = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            if edge.distance == 0 {
                indeg[edge.dst] += 1;
            }
        }
        let mut ready: BTreeSet<NodeId> = indeg
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&n) = ready.iter().next() {
            ready.remove(&n);
            order.push(n);
            for &e in &self.nodes[n].succs {
                let edge = &self.edges[e];
                if edge.distance == 0 {
                    indeg[edge.dst] -= 1;
                    if indeg[edge.dst] == 0 {
                        ready.insert(edge.dst);
                    }
                }
            }
        }
        order
    }

    /// Produces and caches a topological ordering with critical-path
    /// length as the secondary key; consumed by the scheduler under
    /// expandable mapping.
    pub fn reorder_in_critical_first(&mut self) {
        let cp = self.critical_path_lengths();
        let mut indeg = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            if edge.distance == 0 {
                indeg[edge.dst] += 1;
            }
        }
        // Ready set ordered by (critical path desc, id asc).
        let mut ready: BTreeSet<(std::cmp::Reverse<u32>, NodeId)> = indeg
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| (std::cmp::Reverse(cp[n]), n))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&(key, n)) = ready.iter().next() {
            ready.remove(&(key, n));
            order.push(n);
            for &e in &self.nodes[n].succs {
                let edge = &self.edges[e];
                if edge.distance == 0 {
                    indeg[edge.dst] -= 1;
                    if indeg[edge.dst] == 0 {
                        ready.insert((std::cmp::Reverse(cp[edge.dst]), edge.dst));
                    }
                }
            }
        }
        self.critical_order = Some(order);
    }

    pub fn critical_order(&self) -> Option<&[NodeId]> {
        self.critical_order.as_deref()
    }

    /// Histogram of opcode occurrences.
    pub fn opcode_distribution(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.opcode.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Renders the opcode histogram as report text.
    pub fn show_opcode_distribution(&self) -> String {
        let mut out = String::new();
        for (opcode, count) in self.opcode_distribution() {
            let _ = writeln!(out, "{} : {}", opcode, count);
        }
        let _ = writeln!(out, "total : {}", self.nodes.len());
        out
    }

    /// Graphviz rendering. The trimmed demo form omits type annotations.
    pub fn to_dot(&self, trimmed: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"DFG for {} kernel\" {{", self.kernel);
        for node in &self.nodes {
            if trimmed {
                let _ = writeln!(out, "  n{} [label=\"{}{}\"];", node.id, node.opcode, node.id);
            } else {
                let precision = node.precision.as_deref().unwrap_or("-");
                let _ = writeln!(
                    out,
                    "  n{} [label=\"{}{} ({:?}, {} cyc, {})\"];",
                    node.id, node.opcode, node.id, node.type_class, node.cycles, precision
                );
            }
        }
        for edge in &self.edges {
            if edge.distance == 0 {
                let _ = writeln!(out, "  n{} -> n{};", edge.src, edge.dst);
            } else {
                let _ = writeln!(
                    out,
                    "  n{} -> n{} [style=dashed label=\"{}\"];",
                    edge.src, edge.dst, edge.distance
                );
            }
        }
        let _ = writeln!(out, "}}");
        out
    }

    /// JSON artifact listing nodes and edges. Numeric opcode ids carry the
    /// configured testing offset; key order is deterministic.
    pub fn to_json(&self) -> MapperResult<String> {
        #[derive(Serialize)]
        struct NodeJson<'a> {
            id: NodeId,
            opcode: &'a str,
            opcode_id: i64,
            cycles: u32,
            #[serde(rename = "type")]
            type_class: TypeClass,
            #[serde(skip_serializing_if = "Option::is_none")]
            precision: Option<&'a str>,
        }
        #[derive(Serialize)]
        struct EdgeJson {
            src: NodeId,
            dst: NodeId,
            distance: u32,
        }
        #[derive(Serialize)]
        struct DfgJson<'a> {
            kernel: &'a str,
            nodes: Vec<NodeJson<'a>>,
            edges: Vec<EdgeJson>,
        }

        let doc = DfgJson {
            kernel: &self.kernel,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeJson {
                    id: n.id,
                    opcode: &n.opcode,
                    opcode_id: opcode_index(&n.opcode)
                        .map(|i| i as i64 + self.testing_opcode_offset)
                        .unwrap_or(-1),
                    cycles: n.cycles,
                    type_class: n.type_class,
                    precision: n.precision.as_deref(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeJson {
                    src: e.src,
                    dst: e.dst,
                    distance: e.distance,
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// Union-find based collapse of getelementptr chains: every chain of GEPs
/// connected through operands maps to a single representative (the chain's
/// sink, which feeds the memory access).
fn collapse_gep_chains(
    function: &Function,
    members: &BTreeSet<ir::OpId>,
) -> HashMap<ir::OpId, ir::OpId> {
    let is_member_gep =
        |op: ir::OpId| members.contains(&op) && function.operations[op].opcode == "getelementptr";

    let mut parent: HashMap<ir::OpId, ir::OpId> = HashMap::new();
    fn find(parent: &mut HashMap<usize, usize>, op: usize) -> usize {
        let p = *parent.get(&op).unwrap_or(&op);
        if p == op {
            return op;
        }
        let root = find(parent, p);
        parent.insert(op, root);
        root
    }

    let mut consumed_by_gep: BTreeSet<ir::OpId> = BTreeSet::new();
    for &op_id in members {
        if !is_member_gep(op_id) {
            continue;
        }
        for &value in &function.operations[op_id].operands {
            if let Some(def) = function.defining_op(value) {
                if is_member_gep(def) {
                    let a = find(&mut parent, op_id);
                    let b = find(&mut parent, def);
                    if a != b {
                        parent.insert(b, a);
                    }
                    consumed_by_gep.insert(def);
                }
            }
        }
    }

    // Representative per component: the smallest-id GEP whose result is
    // not consumed by another GEP in the chain.
    let mut sink_of_root: HashMap<ir::OpId, ir::OpId> = HashMap::new();
    for &op_id in members {
        if !is_member_gep(op_id) || consumed_by_gep.contains(&op_id) {
            continue;
        }
        let root = find(&mut parent, op_id);
        sink_of_root.entry(root).or_insert(op_id);
    }

    let mut repr = HashMap::new();
    for &op_id in members {
        if !is_member_gep(op_id) {
            continue;
        }
        let root = find(&mut parent, op_id);
        if let Some(&sink) = sink_of_root.get(&root) {
            repr.insert(op_id, sink);
        }
    }
    repr
}

/// Iterative Tarjan: components in deterministic order (sorted by their
/// smallest node id), each component's nodes sorted ascending.
fn tarjan_sccs(nodes: &[DfgNode], edges: &[DfgEdge]) -> Vec<Vec<NodeId>> {
    let n = nodes.len();
    let mut succs: Vec<Vec<NodeId>> = vec![Vec::new(); n];
    for edge in edges {
        succs[edge.src].push(edge.dst);
    }
    for list in &mut succs {
        list.sort_unstable();
        list.dedup();
    }

    const UNVISITED: usize = usize::MAX;
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<NodeId> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<NodeId>> = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        let mut frames: Vec<(NodeId, usize)> = vec![(root, 0)];
        index[root] = next_index;
        low[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if frame.1 < succs[v].len() {
                let w = succs[v][frame.1];
                frame.1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    low[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    frames.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
            } else {
                frames.pop();
                if let Some(parent) = frames.last() {
                    let p = parent.0;
                    low[p] = low[p].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }
    }

    components.sort_by_key(|c| c[0]);
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn build_from(source: &str, options: &DfgOptions) -> Dfg {
        let mut parser = Parser::new(source);
        let module = parser.parse_module().unwrap();
        let (function, tree) = &module.functions[0];
        let loops = tree.select_targets(&[0], false);
        Dfg::build(function, &loops, false, options)
    }

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
    fn test_build_fir() {
        let dfg = build_from(FIR, &DfgOptions::default());
        assert_eq!(dfg.nodes.len(), 9);

        // Adjacency lists are mutually consistent.
        for edge in &dfg.edges {
            assert!(dfg.nodes[edge.src].succs.contains(&edge.id));
            assert!(dfg.nodes[edge.dst].preds.contains(&edge.id));
        }

        // Both phis sit on distance-1 back-edges.
        let carried: Vec<_> = dfg.edges.iter().filter(|e| e.distance == 1).collect();
        assert_eq!(carried.len(), 2);
        for e in carried {
            assert_eq!(dfg.nodes[e.dst].opcode, "phi");
        }

        // i-counter and accumulator recurrences.
        assert_eq!(dfg.sccs.len(), 2);
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build_from(FIR, &DfgOptions::default());
        let b = build_from(FIR, &DfgOptions::default());
        assert_eq!(a.nodes.len(), b.nodes.len());
        for (x, y) in a.nodes.iter().zip(&b.nodes) {
            assert_eq!(x.opcode, y.opcode);
        }
        for (x, y) in a.edges.iter().zip(&b.edges) {
            assert_eq!((x.src, x.dst, x.distance), (y.src, y.dst, y.distance));
        }
    }

    #[test]
    fn test_gep_chain_collapses() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %p0 = getelementptr %base, %i
    %p1 = getelementptr %p0, %i
    %v = load %p1
    %i.next = add %i, 1
  }
}
";
        let dfg = build_from(source, &DfgOptions::default());
        let geps = dfg
            .nodes
            .iter()
            .filter(|n| n.opcode == "getelementptr")
            .count();
        assert_eq!(geps, 1);
        // The load consumes the collapsed address node.
        let load = dfg.nodes.iter().find(|n| n.opcode == "load").unwrap();
        let pred_edge = &dfg.edges[load.preds[0]];
        assert_eq!(dfg.nodes[pred_edge.src].opcode, "getelementptr");
    }

    #[test]
    fn test_fusion_collapses_fma() {
        let mut options = DfgOptions::default();
        options.fusion_strategy = vec!["fma".to_string()];
        let dfg = build_from(FIR, &options);

        assert_eq!(dfg.nodes.len(), 8);
        let fma = dfg.nodes.iter().find(|n| n.opcode == "fma").unwrap();
        assert!(fma.fusion_group.is_some());
        assert!(dfg.nodes.iter().all(|n| n.opcode != "fmul"));
        assert!(dfg.nodes.iter().all(|n| n.opcode != "fadd"));

        // The accumulator recurrence now runs through the fused node.
        assert!(dfg
            .edges
            .iter()
            .any(|e| e.distance == 1 && e.src == fma.id));
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let mut options = DfgOptions::default();
        options.fusion_strategy = vec!["fma".to_string()];
        let mut dfg = build_from(FIR, &options);
        let nodes_before = dfg.nodes.len();
        let edges_before: Vec<_> = dfg
            .edges
            .iter()
            .map(|e| (e.src, e.dst, e.distance))
            .collect();

        dfg.fuse(&options.fusion_strategy, &options.fusion_pattern);
        dfg.recompute_sccs();

        assert_eq!(dfg.nodes.len(), nodes_before);
        let edges_after: Vec<_> = dfg
            .edges
            .iter()
            .map(|e| (e.src, e.dst, e.distance))
            .collect();
        assert_eq!(edges_before, edges_after);
    }

    #[test]
    fn test_fusion_skips_multi_consumer_values() {
        // %m feeds both the fadd and the store, so no fusion applies.
        let source = "\
func kernel {
  loop 0 {
    %a = phi %a.next
    %m = fmul %x, %y
    %a.next = fadd %a, %m
    store %m, %p
  }
}
";
        let mut options = DfgOptions::default();
        options.fusion_strategy = vec!["fma".to_string()];
        let dfg = build_from(source, &options);
        assert!(dfg.nodes.iter().any(|n| n.opcode == "fmul"));
        assert!(dfg.nodes.iter().all(|n| n.opcode != "fma"));
    }

    #[test]
    fn test_distributed_split_of_idiv() {
        let source = "\
func kernel {
  loop 0 {
    %i = phi %i.next
    %q = sdiv %i, %d
    store %q, %p
    %i.next = add %i, 1
  }
}
";
        let mut options = DfgOptions::default();
        options.multi_cycle_strategy = MultiCycleStrategy::Distributed;
        options.vector_factor_for_idiv = 4;
        let dfg = build_from(source, &options);

        let steps: Vec<_> = dfg
            .nodes
            .iter()
            .filter(|n| n.opcode == "divstep")
            .collect();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|n| n.cycles == 1));
        assert!(dfg.nodes.iter().all(|n| n.opcode != "sdiv"));

        // The chain is linear: first step fed by the phi, last feeds the
        // store.
        let store = dfg.nodes.iter().find(|n| n.opcode == "store").unwrap();
        let feed = &dfg.edges[store.preds[0]];
        assert_eq!(dfg.nodes[feed.src].opcode, "divstep");
    }

    #[test]
    fn test_self_recurrence_weight() {
        let source = "func kernel { loop 0 {\n%a = phi %a\n} }";
        let mut options = DfgOptions::default();
        options.opt_latency.insert("phi".to_string(), 3);
        let dfg = build_from(source, &options);
        assert_eq!(dfg.sccs.len(), 1);
        assert_eq!(dfg.sccs[0].weight, 3);
    }

    #[test]
    fn test_recurrence_weight_rounds_up() {
        // Three single-cycle ops around a cycle with total distance 2.
        let source = "\
func kernel {
  loop 0 {
    %a = phi %c
    %b = phi %a
    %c = add %b, %x
  }
}
";
        let dfg = build_from(source, &DfgOptions::default());
        assert_eq!(dfg.sccs.len(), 1);
        assert_eq!(dfg.sccs[0].weight, 2); // ceil(3 / 2)
    }

    #[test]
    fn test_critical_path_and_reorder() {
        let dfg = build_from(FIR, &DfgOptions::default());
        let cp = dfg.critical_path_lengths();
        // The address chain (gep -> load -> fmul -> fadd) dominates.
        let gep_id = dfg
            .nodes
            .iter()
            .find(|n| n.opcode == "getelementptr")
            .unwrap()
            .id;
        let br_id = dfg.nodes.iter().find(|n| n.opcode == "br").unwrap().id;
        assert!(cp[gep_id] > cp[br_id]);

        let mut dfg = dfg;
        dfg.reorder_in_critical_first();
        let order = dfg.critical_order().unwrap();
        assert_eq!(order.len(), dfg.nodes.len());
        // Topological: the load never precedes its address computation.
        let pos = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        let load_id = dfg.nodes.iter().find(|n| n.opcode == "load").unwrap().id;
        assert!(pos(gep_id) < pos(load_id));
    }

    #[test]
    fn test_opcode_distribution() {
        let dfg = build_from(FIR, &DfgOptions::default());
        let dist = dfg.opcode_distribution();
        assert_eq!(dist["phi"], 2);
        assert_eq!(dist["fmul"], 1);
        let shown = dfg.show_opcode_distribution();
        assert!(shown.contains("total : 9"));
    }

    #[test]
    fn test_unsupported_opcode_is_flagged() {
        let source = "func kernel { loop 0 {\n%a = phi %b\n%b = frobnicate %a\n} }";
        let dfg = build_from(source, &DfgOptions::default());
        let node = dfg.nodes.iter().find(|n| n.opcode == "frobnicate").unwrap();
        assert!(!node.supported);
    }

    #[test]
    fn test_dvfs_latency_multiple() {
        let mut dfg = build_from(FIR, &DfgOptions::default());
        dfg.init_dvfs_latency_multiple();
        for node in &dfg.nodes {
            if dfg.in_recurrence(node.id) {
                assert_eq!(node.dvfs_multiple, 1);
            } else {
                assert_eq!(node.dvfs_multiple, 2);
            }
        }
    }

    #[test]
    fn test_artifacts_are_deterministic() {
        let dfg = build_from(FIR, &DfgOptions::default());
        assert_eq!(dfg.to_json().unwrap(), dfg.to_json().unwrap());
        let dot = dfg.to_dot(true);
        assert!(dot.contains("digraph"));
        assert!(dot.contains("style=dashed"));

        let mut options = DfgOptions::default();
        options.testing_opcode_offset = 100;
        let offset_dfg = build_from(FIR, &options);
        let json = offset_dfg.to_json().unwrap();
        let plain = dfg.to_json().unwrap();
        assert_ne!(json, plain);
    }
}
