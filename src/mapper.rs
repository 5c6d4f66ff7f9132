//! Modulo scheduler
//!
//! Searches for a placement of every DFG node onto a (tile, slot) pair
//! and a route for every edge, at the smallest feasible initiation
//! interval. The heuristic path is list scheduling ordered by critical
//! path with bounded backtracking; the exhaustive path is a
//! branch-and-bound DFS used for static-elastic fabrics and small
//! graphs. Incremental mapping seeds placements from a prior run and
//! falls over to full mapping when the seed no longer fits.
//!
//! All iteration orders are deterministic (sorted by id), so identical
//! inputs produce identical schedules.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::cgra::{Cgra, TileId, TileRole};
use crate::config::ParamConfig;
use crate::dfg::{Dfg, EdgeId, NodeId};
use crate::router::{Route, Router};
use crate::schedule::{IncrementalSeed, Placement, Schedule};

/// Record of one committed placement, for backtracking.
struct PlacedRecord {
    node: NodeId,
    checkpoint: usize,
    routed: Vec<EdgeId>,
}

/// The mapping engine.
pub struct Mapper {
    dvfs_aware: bool,
    backtrack_budget: usize,
    backtrack_depth: usize,
    router: Router,
}

impl Mapper {
    pub fn new(config: &ParamConfig) -> Self {
        Self {
            dvfs_aware: config.dvfs_aware_mapping,
            backtrack_budget: config.backtrack_budget,
            backtrack_depth: config.backtrack_depth.max(1),
            router: Router::new(config.router_congestion_weight),
        }
    }

    /// Resource-limited lower bound on II: the scarcest opcode class,
    /// additionally bounded by total operations over total tiles.
    pub fn res_mii(&self, dfg: &Dfg, cgra: &Cgra) -> usize {
        if dfg.nodes.is_empty() {
            return 0;
        }
        let mut bound = dfg.nodes.len().div_ceil(cgra.fu_count());
        for (opcode, count) in dfg.opcode_distribution() {
            let capable = cgra.capable_tile_count(&opcode);
            if capable > 0 {
                bound = bound.max(count.div_ceil(capable));
            }
        }
        bound.max(1)
    }

    /// Recurrence-limited lower bound on II: the heaviest SCC.
    pub fn rec_mii(&self, dfg: &Dfg) -> usize {
        dfg.sccs.iter().map(|s| s.weight as usize).max().unwrap_or(1)
    }

    /// Largest II the escalation loop will try.
    pub fn ii_cap(&self, dfg: &Dfg, cgra: &Cgra) -> usize {
        self.res_mii(dfg, cgra) + cgra.fu_count()
    }

    /// Early feasibility check: every DFG opcode must be hosted by at
    /// least one tile. Returns the sorted list of missing FUs otherwise.
    pub fn can_map(&self, cgra: &Cgra, dfg: &Dfg) -> Result<(), Vec<String>> {
        let mut missing = BTreeSet::new();
        for node in &dfg.nodes {
            if cgra.capable_tile_count(&node.opcode) == 0 {
                missing.insert(node.opcode.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing.into_iter().collect())
        }
    }

    /// Heuristic mapping with II escalation. Returns the achieved II and
    /// schedule; the CGRA retains the successful occupancy for reporting.
    pub fn heuristic_map(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        start_ii: usize,
    ) -> Option<(usize, Schedule)> {
        let cap = self.ii_cap(dfg, cgra);
        for ii in start_ii.max(1)..=cap {
            debug!("heuristic attempt at II={}", ii);
            if let Some(schedule) = self.try_map_at(cgra, dfg, ii, &BTreeMap::new()) {
                return Some((ii, schedule));
            }
        }
        None
    }

    /// Exhaustive branch-and-bound mapping with II escalation.
    pub fn exhaustive_map(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        start_ii: usize,
    ) -> Option<(usize, Schedule)> {
        let cap = self.ii_cap(dfg, cgra);
        for ii in start_ii.max(1)..=cap {
            debug!("exhaustive attempt at II={}", ii);
            if let Some(schedule) = self.exhaustive_at(cgra, dfg, ii) {
                return Some((ii, schedule));
            }
        }
        None
    }

    /// Incremental mapping: node placements from the seed whose (id,
    /// opcode) still match are pinned, removed nodes free their slots,
    /// and only the remaining nodes are scheduled. Falls over to full
    /// mapping when the pinned placements prove infeasible.
    pub fn incremental_map(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        start_ii: usize,
        seed: &IncrementalSeed,
    ) -> Option<(usize, Schedule)> {
        let mut fixed = BTreeMap::new();
        for placement in &seed.placements {
            let Some(node) = dfg.nodes.get(placement.id) else {
                continue;
            };
            if node.opcode != placement.opcode || placement.tile >= cgra.fu_count() {
                continue;
            }
            fixed.insert(
                placement.id,
                Placement {
                    tile: placement.tile,
                    slot: placement.slot,
                },
            );
        }

        let ii = start_ii.max(seed.ii).max(1);
        if let Some(schedule) = self.try_map_at(cgra, dfg, ii, &fixed) {
            return Some((ii, schedule));
        }
        debug!("seeded placements infeasible at II={}, falling over to full mapping", ii);
        self.heuristic_map(cgra, dfg, start_ii)
    }

    /// Smallest II' >= II a relaxed schedule would admit, obtained by
    /// dilating every recurrence edge by one slot.
    pub fn expandable_ii(&self, dfg: &Dfg, ii: usize) -> usize {
        let mut relaxed = ii;
        for scc in &dfg.sccs {
            let in_scc: BTreeSet<NodeId> = scc.nodes.iter().copied().collect();
            let mut cycles: u32 = scc.nodes.iter().map(|&n| dfg.node(n).cycles).sum();
            let mut distance = 0u32;
            for edge in &dfg.edges {
                if in_scc.contains(&edge.src) && in_scc.contains(&edge.dst) && edge.distance > 0 {
                    distance += edge.distance;
                    cycles += 1;
                }
            }
            if distance > 0 {
                relaxed = relaxed.max(cycles.div_ceil(distance) as usize);
            }
        }
        relaxed
    }

    /// One full list-scheduling attempt at a fixed II.
    fn try_map_at(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        ii: usize,
        fixed: &BTreeMap<NodeId, Placement>,
    ) -> Option<Schedule> {
        cgra.reset(ii);
        let mut placed: BTreeMap<NodeId, Placement> = BTreeMap::new();
        let mut routes: BTreeMap<EdgeId, Route> = BTreeMap::new();

        // Pin seeded placements first, then route the edges among them.
        for (&node_id, &placement) in fixed {
            let node = dfg.node(node_id);
            if !cgra.tile(placement.tile).can_support(&node.opcode)
                || !self.reserve_exec(cgra, dfg, node_id, placement.tile, placement.slot)
            {
                return None;
            }
            placed.insert(node_id, placement);
        }
        for edge in &dfg.edges {
            let (Some(&src), Some(&dst)) = (placed.get(&edge.src), placed.get(&edge.dst)) else {
                continue;
            };
            let leave = src.slot + dfg.node(edge.src).latency() as usize;
            let deadline = dst.slot + edge.distance as usize * ii;
            let route = self
                .router
                .route(cgra, edge.id, src.tile, leave, dst.tile, deadline)?;
            routes.insert(edge.id, route);
        }

        let mut order: Vec<NodeId> = self
            .priority_order(dfg)
            .into_iter()
            .filter(|n| !fixed.contains_key(n))
            .collect();

        let mut stack: Vec<PlacedRecord> = Vec::new();
        let mut pos = 0;
        let mut backtracks = 0;
        while pos < order.len() {
            let node = order[pos];
            let checkpoint = cgra.checkpoint();
            match self.place_node(cgra, dfg, ii, node, &placed) {
                Some((placement, node_routes)) => {
                    placed.insert(node, placement);
                    let mut routed = Vec::with_capacity(node_routes.len());
                    for route in node_routes {
                        routed.push(route.edge);
                        routes.insert(route.edge, route);
                    }
                    stack.push(PlacedRecord {
                        node,
                        checkpoint,
                        routed,
                    });
                    pos += 1;
                }
                None => {
                    if backtracks >= self.backtrack_budget || stack.is_empty() {
                        debug!("mapping failed at II={} on node {}", ii, node);
                        return None;
                    }
                    backtracks += 1;
                    let undo = self.backtrack_depth.min(stack.len());
                    let restart = pos - undo;
                    for _ in 0..undo {
                        let record = stack.pop().unwrap();
                        cgra.rollback_to(record.checkpoint);
                        placed.remove(&record.node);
                        for edge in record.routed {
                            routes.remove(&edge);
                        }
                    }
                    // Perturb the priority: the stuck node goes ahead of
                    // the placements it displaced.
                    order.remove(pos);
                    order.insert(restart, node);
                    pos = restart;
                }
            }
        }

        let mut schedule = Schedule::new(dfg.kernel.clone(), ii);
        for (node, placement) in placed {
            schedule.place(node, placement.tile, placement.slot);
        }
        for (_, route) in routes {
            schedule.add_route(route);
        }
        Some(schedule)
    }

    /// Scheduling priority: critical-path first, ties broken by fan-out
    /// then id. DVFS-aware mapping boosts nodes of the hottest SCCs. A
    /// cached critical-first ordering (expandable mapping) wins outright.
    fn priority_order(&self, dfg: &Dfg) -> Vec<NodeId> {
        if let Some(order) = dfg.critical_order() {
            return order.to_vec();
        }
        let cp = dfg.critical_path_lengths();
        let hot = if self.dvfs_aware {
            dfg.hot_nodes()
        } else {
            vec![false; dfg.nodes.len()]
        };
        let mut nodes: Vec<NodeId> = (0..dfg.nodes.len()).collect();
        nodes.sort_by(|&a, &b| {
            hot[b]
                .cmp(&hot[a])
                .then(cp[b].cmp(&cp[a]))
                .then(dfg.node(b).succs.len().cmp(&dfg.node(a).succs.len()))
                .then(a.cmp(&b))
        });
        nodes
    }

    /// Attempts to place one node: enumerate candidate (tile, slot) pairs
    /// in widening rings around the placed neighbours' centroid, and
    /// accept the first candidate whose execution slots reserve and whose
    /// incident edges all route.
    fn place_node(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        ii: usize,
        node_id: NodeId,
        placed: &BTreeMap<NodeId, Placement>,
    ) -> Option<(Placement, Vec<Route>)> {
        let node = dfg.node(node_id);
        let latency = node.latency() as usize;

        let earliest = self.earliest_start(dfg, node_id, placed, ii);
        // Latest start admissible under already-placed consumers.
        let mut latest: Option<usize> = None;
        for &e in &node.succs {
            let edge = dfg.edge(e);
            if edge.src == edge.dst {
                continue;
            }
            if let Some(c) = placed.get(&edge.dst) {
                let deadline = c.slot + edge.distance as usize * ii;
                let bound = deadline.checked_sub(latency)?;
                latest = Some(latest.map_or(bound, |l: usize| l.min(bound)));
            }
        }
        let last_slot = match latest {
            Some(l) => l.min(earliest + ii - 1),
            None => earliest + ii - 1,
        };
        if last_slot < earliest {
            return None;
        }

        // Incident edges whose other endpoint is already placed, plus
        // self-recurrences; routed per candidate in edge-id order.
        let mut edges_to_route: BTreeSet<EdgeId> = BTreeSet::new();
        for &e in &node.preds {
            let edge = dfg.edge(e);
            if edge.src == node_id || placed.contains_key(&edge.src) {
                edges_to_route.insert(e);
            }
        }
        for &e in &node.succs {
            let edge = dfg.edge(e);
            if edge.dst == node_id || placed.contains_key(&edge.dst) {
                edges_to_route.insert(e);
            }
        }

        for tile in self.candidate_tiles(cgra, dfg, node_id, placed) {
            for slot in earliest..=last_slot {
                let checkpoint = cgra.checkpoint();
                if !self.reserve_exec(cgra, dfg, node_id, tile, slot) {
                    cgra.rollback_to(checkpoint);
                    continue;
                }
                let mut node_routes = Vec::with_capacity(edges_to_route.len());
                let mut ok = true;
                for &e in &edges_to_route {
                    let edge = dfg.edge(e);
                    let (src_tile, leave) = if edge.src == node_id {
                        (tile, slot + latency)
                    } else {
                        let p = placed[&edge.src];
                        (p.tile, p.slot + dfg.node(edge.src).latency() as usize)
                    };
                    let (dst_tile, consume) = if edge.dst == node_id {
                        (tile, slot)
                    } else {
                        let c = placed[&edge.dst];
                        (c.tile, c.slot)
                    };
                    let deadline = consume + edge.distance as usize * ii;
                    match self
                        .router
                        .route(cgra, e, src_tile, leave, dst_tile, deadline)
                    {
                        Some(route) => node_routes.push(route),
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    return Some((Placement { tile, slot }, node_routes));
                }
                cgra.rollback_to(checkpoint);
            }
        }
        None
    }

    /// Earliest start slot admissible under already-placed producers.
    fn earliest_start(
        &self,
        dfg: &Dfg,
        node_id: NodeId,
        placed: &BTreeMap<NodeId, Placement>,
        ii: usize,
    ) -> usize {
        let mut earliest = 0usize;
        for &e in &dfg.node(node_id).preds {
            let edge = dfg.edge(e);
            if edge.src == node_id {
                continue;
            }
            if let Some(p) = placed.get(&edge.src) {
                let ready = p.slot + dfg.node(edge.src).latency() as usize;
                earliest = earliest.max(ready.saturating_sub(edge.distance as usize * ii));
            }
        }
        earliest
    }

    /// Reserves the execution slots of a node under the multi-cycle
    /// policy: the issue slot executes, the drain slots occupy the tile
    /// unless the FU is pipelined. Latencies beyond II wrap onto every
    /// modulo slot once.
    fn reserve_exec(
        &self,
        cgra: &mut Cgra,
        dfg: &Dfg,
        node_id: NodeId,
        tile: TileId,
        slot: usize,
    ) -> bool {
        let node = dfg.node(node_id);
        let ii = cgra.ii();
        let span = if node.pipelined {
            1
        } else {
            (node.latency() as usize).clamp(1, ii)
        };
        for offset in 0..span {
            let role = if offset == 0 {
                TileRole::Exec
            } else {
                TileRole::Drain
            };
            if !cgra.try_reserve_tile(tile, slot + offset, role, node_id) {
                return false;
            }
        }
        true
    }

    /// Capable tiles ordered by Manhattan distance from the centroid of
    /// the placed neighbours (producers preferred, consumers otherwise),
    /// ties broken by (row, column). With no placed neighbour the scan is
    /// plain row-major.
    fn candidate_tiles(
        &self,
        cgra: &Cgra,
        dfg: &Dfg,
        node_id: NodeId,
        placed: &BTreeMap<NodeId, Placement>,
    ) -> Vec<TileId> {
        let node = dfg.node(node_id);
        let mut anchors: Vec<TileId> = node
            .preds
            .iter()
            .filter_map(|&e| placed.get(&dfg.edge(e).src).map(|p| p.tile))
            .collect();
        if anchors.is_empty() {
            anchors = node
                .succs
                .iter()
                .filter_map(|&e| placed.get(&dfg.edge(e).dst).map(|p| p.tile))
                .collect();
        }

        let mut capable: Vec<TileId> = cgra
            .nodes
            .iter()
            .filter(|t| t.can_support(&node.opcode))
            .map(|t| t.id)
            .collect();
        if anchors.is_empty() {
            return capable;
        }

        let rows: usize = anchors.iter().map(|&t| cgra.tile(t).row).sum();
        let cols: usize = anchors.iter().map(|&t| cgra.tile(t).col).sum();
        let center = (rows / anchors.len(), cols / anchors.len());
        capable.sort_by_key(|&t| {
            let tile = cgra.tile(t);
            let ring = tile.row.abs_diff(center.0) + tile.col.abs_diff(center.1);
            (ring, tile.row, tile.col)
        });
        capable
    }

    /// Exhaustive DFS at one II, keeping the schedule with the smallest
    /// makespan. A step budget bounds pathological searches; within the
    /// budget exploration order is deterministic.
    fn exhaustive_at(&self, cgra: &mut Cgra, dfg: &Dfg, ii: usize) -> Option<Schedule> {
        const STEP_LIMIT: usize = 1 << 20;

        cgra.reset(ii);
        let order = self.priority_order(dfg);
        let mut search = ExhaustiveSearch {
            mapper: self,
            dfg,
            ii,
            order,
            steps: 0,
            step_limit: STEP_LIMIT,
            best_makespan: usize::MAX,
            best: None,
        };
        let mut placed = BTreeMap::new();
        let mut routes = BTreeMap::new();
        search.dfs(cgra, 0, &mut placed, &mut routes);

        let (placed, routes) = search.best?;
        // Replay the best assignment so the CGRA occupancy matches it.
        cgra.reset(ii);
        for (&node, &placement) in &placed {
            if !self.reserve_exec(cgra, dfg, node, placement.tile, placement.slot) {
                return None;
            }
        }
        let mut schedule = Schedule::new(dfg.kernel.clone(), ii);
        for (node, placement) in &placed {
            schedule.place(*node, placement.tile, placement.slot);
        }
        for (_, route) in routes {
            for &(link, slot) in &route.links {
                if !cgra.try_reserve_link(link, slot, route.edge) {
                    return None;
                }
            }
            for &(tile, slot, role) in &route.transits {
                if !cgra.try_reserve_tile(tile, slot, role, route.edge) {
                    return None;
                }
            }
            for &slot in &route.holds {
                if !cgra.try_reserve_tile(route.dst_tile, slot, TileRole::RegHold, route.edge) {
                    return None;
                }
            }
            schedule.add_route(route);
        }
        Some(schedule)
    }
}

/// State of one exhaustive search.
struct ExhaustiveSearch<'a> {
    mapper: &'a Mapper,
    dfg: &'a Dfg,
    ii: usize,
    order: Vec<NodeId>,
    steps: usize,
    step_limit: usize,
    best_makespan: usize,
    best: Option<(BTreeMap<NodeId, Placement>, BTreeMap<EdgeId, Route>)>,
}

impl ExhaustiveSearch<'_> {
    fn dfs(
        &mut self,
        cgra: &mut Cgra,
        depth: usize,
        placed: &mut BTreeMap<NodeId, Placement>,
        routes: &mut BTreeMap<EdgeId, Route>,
    ) {
        if depth == self.order.len() {
            let makespan = placed
                .iter()
                .map(|(&n, p)| p.slot + self.dfg.node(n).latency() as usize)
                .max()
                .unwrap_or(0);
            if makespan < self.best_makespan {
                self.best_makespan = makespan;
                self.best = Some((placed.clone(), routes.clone()));
            }
            return;
        }
        if self.steps >= self.step_limit {
            return;
        }

        let node_id = self.order[depth];
        let latency = self.dfg.node(node_id).latency() as usize;
        let earliest = self.mapper.earliest_start(self.dfg, node_id, placed, self.ii);
        for tile in self.mapper.candidate_tiles(cgra, self.dfg, node_id, placed) {
            for slot in earliest..earliest + self.ii {
                self.steps += 1;
                if self.steps >= self.step_limit {
                    return;
                }
                // Bound: a partial schedule already as long as the best
                // complete one cannot improve.
                if slot + latency >= self.best_makespan {
                    continue;
                }
                let checkpoint = cgra.checkpoint();
                let attempt =
                    self.try_candidate(cgra, node_id, tile, slot, placed);
                match attempt {
                    Some(node_routes) => {
                        placed.insert(node_id, Placement { tile, slot });
                        let edge_ids: Vec<EdgeId> =
                            node_routes.iter().map(|r| r.edge).collect();
                        for route in node_routes {
                            routes.insert(route.edge, route);
                        }
                        self.dfs(cgra, depth + 1, placed, routes);
                        placed.remove(&node_id);
                        for edge in edge_ids {
                            routes.remove(&edge);
                        }
                        cgra.rollback_to(checkpoint);
                    }
                    None => cgra.rollback_to(checkpoint),
                }
            }
        }
    }

    /// Reserve + route one candidate; reservations stay committed on
    /// success (caller rolls back after exploring the subtree).
    fn try_candidate(
        &self,
        cgra: &mut Cgra,
        node_id: NodeId,
        tile: TileId,
        slot: usize,
        placed: &BTreeMap<NodeId, Placement>,
    ) -> Option<Vec<Route>> {
        let node = self.dfg.node(node_id);
        let latency = node.latency() as usize;
        if !self
            .mapper
            .reserve_exec(cgra, self.dfg, node_id, tile, slot)
        {
            return None;
        }

        let mut edges_to_route: BTreeSet<EdgeId> = BTreeSet::new();
        for &e in &node.preds {
            let edge = self.dfg.edge(e);
            if edge.src == node_id || placed.contains_key(&edge.src) {
                edges_to_route.insert(e);
            }
        }
        for &e in &node.succs {
            let edge = self.dfg.edge(e);
            if edge.dst == node_id || placed.contains_key(&edge.dst) {
                edges_to_route.insert(e);
            }
        }

        let mut node_routes = Vec::with_capacity(edges_to_route.len());
        for &e in &edges_to_route {
            let edge = self.dfg.edge(e);
            let (src_tile, leave) = if edge.src == node_id {
                (tile, slot + latency)
            } else {
                let p = placed[&edge.src];
                (p.tile, p.slot + self.dfg.node(edge.src).latency() as usize)
            };
            let (dst_tile, consume) = if edge.dst == node_id {
                (tile, slot)
            } else {
                (placed[&edge.dst].tile, placed[&edge.dst].slot)
            };
            let deadline = consume + edge.distance as usize * self.ii;
            let route = self
                .mapper
                .router
                .route(cgra, e, src_tile, leave, dst_tile, deadline)?;
            node_routes.push(route);
        }
        Some(node_routes)
    }
}
