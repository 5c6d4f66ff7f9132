//! Mapping result: placements plus routes
//!
//! A `Schedule` records where every DFG node executes (tile, start slot)
//! and how every edge travels through the mesh. It renders the textual
//! per-slot report, the utilization summary, and the JSON artifacts. All
//! keyed collections are BTreeMaps so artifact key order is deterministic
//! across runs.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::cgra::{Cgra, TileId, TileRole};
use crate::dfg::{Dfg, EdgeId, NodeId};
use crate::error::MapperResult;
use crate::router::Route;

/// Where a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub tile: TileId,
    /// Absolute start slot; occupancy wraps modulo II.
    pub slot: usize,
}

/// A complete (or in-progress) mapping at one II.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub ii: usize,
    pub kernel: String,
    placements: BTreeMap<NodeId, Placement>,
    routes: BTreeMap<EdgeId, Route>,
}

impl Schedule {
    pub fn new(kernel: impl Into<String>, ii: usize) -> Self {
        Self {
            ii,
            kernel: kernel.into(),
            placements: BTreeMap::new(),
            routes: BTreeMap::new(),
        }
    }

    pub fn place(&mut self, node: NodeId, tile: TileId, slot: usize) {
        self.placements.insert(node, Placement { tile, slot });
    }

    pub fn unplace(&mut self, node: NodeId) {
        self.placements.remove(&node);
    }

    pub fn placement(&self, node: NodeId) -> Option<Placement> {
        self.placements.get(&node).copied()
    }

    pub fn placed_count(&self) -> usize {
        self.placements.len()
    }

    pub fn placements(&self) -> impl Iterator<Item = (NodeId, Placement)> + '_ {
        self.placements.iter().map(|(&n, &p)| (n, p))
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.insert(route.edge, route);
    }

    pub fn remove_route(&mut self, edge: EdgeId) {
        self.routes.remove(&edge);
    }

    pub fn route(&self, edge: EdgeId) -> Option<&Route> {
        self.routes.get(&edge)
    }

    /// Per-slot, per-tile rendering of operations and routing.
    pub fn show_schedule(&self, cgra: &Cgra, dfg: &Dfg) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[schedule for '{}' at II={}]", self.kernel, self.ii);
        for slot in 0..self.ii {
            let _ = writeln!(out, "slot {}:", slot);
            for row in 0..cgra.rows {
                let mut line = String::from(" ");
                for col in 0..cgra.columns {
                    let tile = cgra.tile_at(row, col);
                    let cell = match tile.exec_at(slot) {
                        Some(node) => format!("{}{}", dfg.node(node).opcode, node),
                        None => {
                            let entries = tile.entries(slot);
                            if entries.iter().any(|e| e.role == TileRole::Drain) {
                                "(drain)".to_string()
                            } else if !entries.is_empty() {
                                "(route)".to_string()
                            } else {
                                "-".to_string()
                            }
                        }
                    };
                    let _ = write!(line, " {:<12}", cell);
                }
                let _ = writeln!(out, "{}", line);
            }
        }
        for (edge_id, route) in &self.routes {
            if route.links.is_empty() {
                continue;
            }
            let edge = dfg.edge(*edge_id);
            let mut hops = String::new();
            for (link_id, slot) in &route.links {
                let link = cgra.link(*link_id);
                let src = cgra.tile(link.src);
                let dst = cgra.tile(link.dst);
                let _ = write!(
                    hops,
                    " ({},{})->({},{})@{}",
                    src.row, src.col, dst.row, dst.col, slot
                );
            }
            let _ = writeln!(out, "route {} -> {}:{}", edge.src, edge.dst, hops);
        }
        out
    }

    /// Aggregate FU / link / register usage; with power gating enabled the
    /// per-island idle counts and a DVFS savings estimate are appended.
    pub fn show_utilization(&self, cgra: &Cgra, dfg: &Dfg, power_gating: bool) -> String {
        let mut out = String::new();
        if self.ii == 0 {
            let _ = writeln!(out, "empty schedule, nothing to report");
            return out;
        }

        let total_tile_slots = cgra.fu_count() * self.ii;
        let mut exec = 0usize;
        let mut drain = 0usize;
        let mut bypass = 0usize;
        let mut regs = 0usize;
        let mut island_busy: BTreeMap<usize, usize> = BTreeMap::new();
        for tile in &cgra.nodes {
            island_busy.entry(tile.island).or_insert(0);
            for slot in 0..self.ii {
                for entry in tile.entries(slot) {
                    match entry.role {
                        TileRole::Exec => {
                            exec += 1;
                            *island_busy.entry(tile.island).or_insert(0) += 1;
                        }
                        TileRole::Drain => drain += 1,
                        TileRole::Bypass => bypass += 1,
                        TileRole::RegHold => regs += 1,
                    }
                }
            }
        }
        let links_used: usize = cgra.links.iter().map(|l| l.occupied_count()).sum();
        let total_link_slots = cgra.links.len() * self.ii;

        let _ = writeln!(
            out,
            "FU slots: {}/{} exec ({} drain), {:.1}% busy",
            exec,
            total_tile_slots,
            drain,
            100.0 * (exec + drain) as f64 / total_tile_slots as f64
        );
        let _ = writeln!(
            out,
            "link slots: {}/{} occupied, {:.1}% busy",
            links_used,
            total_link_slots,
            100.0 * links_used as f64 / total_link_slots as f64
        );
        let _ = writeln!(out, "bypass lanes in use: {}", bypass);
        let _ = writeln!(out, "registers in use: {}", regs);
        let _ = writeln!(out, "operations mapped: {}", dfg.nodes.len());

        if power_gating {
            let idle: Vec<usize> = island_busy
                .iter()
                .filter(|(_, &busy)| busy == 0)
                .map(|(&island, _)| island)
                .collect();
            for (island, busy) in &island_busy {
                let _ = writeln!(out, "island {}: {} exec slots", island, busy);
            }
            let total = cgra.island_count();
            let _ = writeln!(
                out,
                "power gating: {}/{} islands idle, est. {:.1}% static power saved",
                idle.len(),
                total,
                100.0 * idle.len() as f64 / total as f64
            );
        }
        out
    }

    /// `schedule.json` payload: placements and routes with stable key
    /// order.
    pub fn to_json(&self, cgra: &Cgra, dfg: &Dfg) -> MapperResult<String> {
        #[derive(Serialize)]
        struct LinkJson {
            from: (usize, usize),
            to: (usize, usize),
            slot: usize,
        }
        #[derive(Serialize)]
        struct RouteJson {
            edge: EdgeId,
            src: NodeId,
            dst: NodeId,
            distance: u32,
            links: Vec<LinkJson>,
            holds: Vec<usize>,
        }
        #[derive(Serialize)]
        struct PlacementJson<'a> {
            node: NodeId,
            opcode: &'a str,
            tile: TileId,
            row: usize,
            col: usize,
            slot: usize,
        }
        #[derive(Serialize)]
        struct ScheduleJson<'a> {
            kernel: &'a str,
            ii: usize,
            placements: Vec<PlacementJson<'a>>,
            routes: Vec<RouteJson>,
        }

        let doc = ScheduleJson {
            kernel: &self.kernel,
            ii: self.ii,
            placements: self
                .placements
                .iter()
                .map(|(&node, p)| {
                    let tile = cgra.tile(p.tile);
                    PlacementJson {
                        node,
                        opcode: &dfg.node(node).opcode,
                        tile: p.tile,
                        row: tile.row,
                        col: tile.col,
                        slot: p.slot,
                    }
                })
                .collect(),
            routes: self
                .routes
                .iter()
                .map(|(&edge_id, route)| {
                    let edge = dfg.edge(edge_id);
                    RouteJson {
                        edge: edge_id,
                        src: edge.src,
                        dst: edge.dst,
                        distance: edge.distance,
                        links: route
                            .links
                            .iter()
                            .map(|&(link_id, slot)| {
                                let link = cgra.link(link_id);
                                let src = cgra.tile(link.src);
                                let dst = cgra.tile(link.dst);
                                LinkJson {
                                    from: (src.row, src.col),
                                    to: (dst.row, dst.col),
                                    slot,
                                }
                            })
                            .collect(),
                        holds: route.holds.clone(),
                    }
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// `incremental.json` payload: stable node ids with their placements,
    /// consumable as a seed by a later incremental mapping run.
    pub fn to_incremental_json(&self, dfg: &Dfg) -> MapperResult<String> {
        let seed = IncrementalSeed {
            ii: self.ii,
            placements: self
                .placements
                .iter()
                .map(|(&node, p)| SeedPlacement {
                    id: node,
                    opcode: dfg.node(node).opcode.clone(),
                    tile: p.tile,
                    slot: p.slot,
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&seed)?)
    }
}

/// Prior placements loaded for incremental mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSeed {
    pub ii: usize,
    pub placements: Vec<SeedPlacement>,
}

/// One seeded placement, keyed by stable node id and opcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedPlacement {
    pub id: NodeId,
    pub opcode: String,
    pub tile: TileId,
    pub slot: usize,
}

impl IncrementalSeed {
    pub fn from_json_str(text: &str) -> MapperResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
