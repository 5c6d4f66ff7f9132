//! CGRA resource model
//!
//! A rectangular grid of tiles joined by a 4-neighbour mesh of directed
//! links. Tiles carry an FU capability set, bounded register / bypass /
//! control-memory budgets and a DVFS island id. Occupancy is tracked per
//! slot modulo the current II; reservations go through a journal so a
//! failed placement can be rolled back wholesale.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{MultiCycleStrategy, ParamConfig};
use crate::ir::{DEFAULT_FU_OPCODES, VECTOR_OPCODES};

/// Dense id of a tile.
pub type TileId = usize;

/// Dense id of a directed link.
pub type LinkId = usize;

/// What a tile-slot reservation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRole {
    /// The owning DFG node executes here.
    Exec,
    /// Drain slot of a multi-cycle operation.
    Drain,
    /// A routed value passes through without landing in a register.
    Bypass,
    /// A routed value waits in the register file.
    RegHold,
}

/// One occupancy entry on a tile slot. `owner` is a DFG node id for
/// Exec/Drain and a DFG edge id for Bypass/RegHold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    pub owner: usize,
    pub role: TileRole,
}

/// A tile of the array.
#[derive(Debug, Clone)]
pub struct CgraNode {
    pub id: TileId,
    pub row: usize,
    pub col: usize,
    pub island: usize,
    fu: BTreeSet<String>,
    slots: Vec<Vec<TileEntry>>,
}

impl CgraNode {
    /// True iff this tile's FU set covers the opcode.
    pub fn can_support(&self, opcode: &str) -> bool {
        self.fu.contains(opcode)
    }

    /// Occupancy entries at a modulo slot.
    pub fn entries(&self, slot: usize) -> &[TileEntry] {
        &self.slots[slot]
    }

    /// The node executing at a modulo slot, if any.
    pub fn exec_at(&self, slot: usize) -> Option<usize> {
        self.slots[slot]
            .iter()
            .find(|e| e.role == TileRole::Exec)
            .map(|e| e.owner)
    }

    fn occupied_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    fn role_count(&self, slot: usize, role: TileRole) -> usize {
        self.slots[slot].iter().filter(|e| e.role == role).count()
    }
}

/// A directed link between two orthogonal neighbour tiles.
#[derive(Debug, Clone)]
pub struct CgraLink {
    pub id: LinkId,
    pub src: TileId,
    pub dst: TileId,
    slots: Vec<Option<usize>>,
}

impl CgraLink {
    /// The DFG edge using this link at a modulo slot, if any.
    pub fn edge_at(&self, slot: usize) -> Option<usize> {
        self.slots[slot]
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Journal entry for one committed reservation.
#[derive(Debug, Clone, Copy)]
enum Reservation {
    Tile {
        tile: TileId,
        slot: usize,
        entry: TileEntry,
    },
    Link {
        link: LinkId,
        slot: usize,
    },
}

/// The reconfigurable array.
#[derive(Debug, Clone)]
pub struct Cgra {
    pub rows: usize,
    pub columns: usize,
    pub nodes: Vec<CgraNode>,
    pub links: Vec<CgraLink>,
    /// Outgoing links per tile, ordered by destination (row, col).
    out_links: Vec<Vec<LinkId>>,
    link_of: BTreeMap<(TileId, TileId), LinkId>,
    ii: usize,
    reg_constraint: usize,
    bypass_constraint: usize,
    ctrl_mem_constraint: usize,
    /// Inclusive multi-cycle strategy: drain slots may share the tile.
    multiple_ops: bool,
    pub island_dim: usize,
    journal: Vec<Reservation>,
}

impl Cgra {
    /// Builds the grid described by the configuration. Topology is fixed;
    /// occupancy starts empty and is sized by `reset`.
    pub fn new(config: &ParamConfig) -> Cgra {
        let rows = config.rows;
        let columns = config.columns;
        let island_dim = config.dvfs_island_dim.max(1);
        let islands_per_row = columns.div_ceil(island_dim);

        let mut default_fu: BTreeSet<String> =
            DEFAULT_FU_OPCODES.iter().map(|op| op.to_string()).collect();
        // Active fusion patterns imply a combined FU on every tile.
        for pattern in &config.fusion_strategy {
            default_fu.insert(pattern.clone());
        }

        let mut nodes = Vec::with_capacity(rows * columns);
        for row in 0..rows {
            for col in 0..columns {
                let id = row * columns + col;
                let mut fu = default_fu.clone();
                if vectorized_tile(&config.vectorization_mode, col) {
                    for op in VECTOR_OPCODES {
                        fu.insert(op.to_string());
                    }
                }
                if config.parameterizable_cgra {
                    if let Some(extra) = config.additional_func.get(&id) {
                        for op in extra {
                            fu.insert(op.clone());
                        }
                    }
                }
                let island = (row / island_dim) * islands_per_row + col / island_dim;
                nodes.push(CgraNode {
                    id,
                    row,
                    col,
                    island,
                    fu,
                    slots: Vec::new(),
                });
            }
        }

        // Two directed links per orthogonal neighbour pair.
        let mut links = Vec::new();
        let mut link_of = BTreeMap::new();
        let mut out_links = vec![Vec::new(); rows * columns];
        let mut connect = |src: TileId, dst: TileId| {
            let id = links.len();
            links.push(CgraLink {
                id,
                src,
                dst,
                slots: Vec::new(),
            });
            link_of.insert((src, dst), id);
        };
        for row in 0..rows {
            for col in 0..columns {
                let here = row * columns + col;
                if row + 1 < rows {
                    let below = (row + 1) * columns + col;
                    connect(here, below);
                    connect(below, here);
                }
                if col + 1 < columns {
                    let right = row * columns + col + 1;
                    connect(here, right);
                    connect(right, here);
                }
            }
        }
        for link in &links {
            out_links[link.src].push(link.id);
        }
        for list in out_links.iter_mut() {
            list.sort_by_key(|&l| {
                let dst = links[l].dst;
                (dst / columns, dst % columns)
            });
        }

        Cgra {
            rows,
            columns,
            nodes,
            links,
            out_links,
            link_of,
            ii: 0,
            reg_constraint: config.reg_constraint,
            bypass_constraint: config.bypass_constraint,
            ctrl_mem_constraint: config.ctrl_mem_constraint,
            multiple_ops: config.multi_cycle_strategy == MultiCycleStrategy::Inclusive,
            island_dim,
            journal: Vec::new(),
        }
    }

    /// Total number of functional units (tiles).
    pub fn fu_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of DVFS islands the grid partitions into.
    pub fn island_count(&self) -> usize {
        self.rows.div_ceil(self.island_dim) * self.columns.div_ceil(self.island_dim)
    }

    pub fn tile(&self, id: TileId) -> &CgraNode {
        &self.nodes[id]
    }

    pub fn tile_at(&self, row: usize, col: usize) -> &CgraNode {
        &self.nodes[row * self.columns + col]
    }

    pub fn link(&self, id: LinkId) -> &CgraLink {
        &self.links[id]
    }

    /// Outgoing links of a tile, in deterministic destination order.
    pub fn out_links(&self, tile: TileId) -> &[LinkId] {
        &self.out_links[tile]
    }

    /// The directed link between two neighbouring tiles, if one exists.
    pub fn link_between(&self, src: TileId, dst: TileId) -> Option<LinkId> {
        self.link_of.get(&(src, dst)).copied()
    }

    /// Number of tiles whose FU set covers an opcode.
    pub fn capable_tile_count(&self, opcode: &str) -> usize {
        self.nodes.iter().filter(|n| n.can_support(opcode)).count()
    }

    /// Current initiation interval the occupancy tables are sized for.
    pub fn ii(&self) -> usize {
        self.ii
    }

    /// Clears all occupancy and sizes the modulo tables for a new II
    /// attempt.
    pub fn reset(&mut self, ii: usize) {
        self.ii = ii;
        for node in &mut self.nodes {
            node.slots = vec![Vec::new(); ii];
        }
        for link in &mut self.links {
            link.slots = vec![None; ii];
        }
        self.journal.clear();
    }

    /// Marks the current journal position for a later rollback.
    pub fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    /// Undoes every reservation made after the checkpoint.
    pub fn rollback_to(&mut self, checkpoint: usize) {
        while self.journal.len() > checkpoint {
            match self.journal.pop().unwrap() {
                Reservation::Tile { tile, slot, entry } => {
                    let slots = &mut self.nodes[tile].slots[slot];
                    if let Some(pos) = slots.iter().rposition(|e| *e == entry) {
                        slots.remove(pos);
                    }
                }
                Reservation::Link { link, slot } => {
                    self.links[link].slots[slot] = None;
                }
            }
        }
    }

    /// Attempts to reserve a tile at an absolute slot (taken modulo II).
    ///
    /// Exec conflicts with Exec always, and with Drain unless the
    /// inclusive strategy is active. Bypass and RegHold are counted
    /// against their per-slot budgets. A reservation that would occupy a
    /// previously idle slot on a tile whose control memory is exhausted
    /// is rejected.
    pub fn try_reserve_tile(
        &mut self,
        tile: TileId,
        slot: usize,
        role: TileRole,
        owner: usize,
    ) -> bool {
        debug_assert!(self.ii > 0);
        let slot = slot % self.ii;
        let node = &self.nodes[tile];

        let admissible = match role {
            TileRole::Exec | TileRole::Drain => node.slots[slot].iter().all(|e| match e.role {
                TileRole::Exec => role == TileRole::Drain && self.multiple_ops,
                TileRole::Drain => self.multiple_ops,
                _ => true,
            }),
            TileRole::Bypass => node.role_count(slot, TileRole::Bypass) < self.bypass_constraint,
            TileRole::RegHold => node.role_count(slot, TileRole::RegHold) < self.reg_constraint,
        };
        if !admissible {
            return false;
        }
        if node.slots[slot].is_empty() && node.occupied_slot_count() >= self.ctrl_mem_constraint {
            return false;
        }

        let entry = TileEntry { owner, role };
        self.nodes[tile].slots[slot].push(entry);
        self.journal.push(Reservation::Tile { tile, slot, entry });
        true
    }

    /// Total occupancy entries on a tile at an absolute slot.
    pub fn occupancy_count(&self, tile: TileId, slot: usize) -> usize {
        self.nodes[tile].slots[slot % self.ii].len()
    }

    /// Whether a routed value could still transit this tile at this slot,
    /// through either a bypass lane or a register.
    pub fn transit_available(&self, tile: TileId, slot: usize) -> bool {
        let slot = slot % self.ii;
        let node = &self.nodes[tile];
        if node.slots[slot].is_empty() && node.occupied_slot_count() >= self.ctrl_mem_constraint {
            return false;
        }
        node.role_count(slot, TileRole::Bypass) < self.bypass_constraint
            || node.role_count(slot, TileRole::RegHold) < self.reg_constraint
    }

    /// Whether a register is free on this tile at this slot.
    pub fn register_available(&self, tile: TileId, slot: usize) -> bool {
        let slot = slot % self.ii;
        let node = &self.nodes[tile];
        if node.slots[slot].is_empty() && node.occupied_slot_count() >= self.ctrl_mem_constraint {
            return false;
        }
        node.role_count(slot, TileRole::RegHold) < self.reg_constraint
    }

    /// Attempts to reserve a link at an absolute slot (taken modulo II).
    pub fn try_reserve_link(&mut self, link: LinkId, slot: usize, edge: usize) -> bool {
        debug_assert!(self.ii > 0);
        let slot = slot % self.ii;
        if self.links[link].slots[slot].is_some() {
            return false;
        }
        self.links[link].slots[slot] = Some(edge);
        self.journal.push(Reservation::Link { link, slot });
        true
    }
}

/// Whether a tile column receives vector FUs under the given mode.
fn vectorized_tile(mode: &str, col: usize) -> bool {
    match mode {
        "all" => true,
        "none" => false,
        "even" => col % 2 == 0,
        "odd" => col % 2 == 1,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_4x4() -> ParamConfig {
        ParamConfig {
            rows: 4,
            columns: 4,
            ..ParamConfig::default()
        }
    }

    #[test]
    fn test_grid_and_mesh() {
        let cgra = Cgra::new(&config_4x4());
        assert_eq!(cgra.fu_count(), 16);
        // 4x4 mesh: 2 * (3*4 + 4*3) directed links.
        assert_eq!(cgra.links.len(), 48);

        // Corner tiles have two neighbours, interior tiles four.
        assert_eq!(cgra.out_links(0).len(), 2);
        assert_eq!(cgra.out_links(5).len(), 4);

        // Every link is registered in both directions.
        let a = cgra.tile_at(1, 1).id;
        let b = cgra.tile_at(1, 2).id;
        assert!(cgra.link_between(a, b).is_some());
        assert!(cgra.link_between(b, a).is_some());
        assert!(cgra.link_between(a, cgra.tile_at(2, 2).id).is_none());
    }

    #[test]
    fn test_default_fu_set() {
        let cgra = Cgra::new(&config_4x4());
        let tile = cgra.tile(0);
        assert!(tile.can_support("add"));
        assert!(tile.can_support("fmul"));
        assert!(!tile.can_support("sdiv"));
        // vectorizationMode defaults to "all".
        assert!(tile.can_support("vadd"));
    }

    #[test]
    fn test_vectorization_mode_none() {
        let mut config = config_4x4();
        config.vectorization_mode = "none".to_string();
        let cgra = Cgra::new(&config);
        assert!(!cgra.tile(0).can_support("vload"));
    }

    #[test]
    fn test_fusion_strategy_extends_fus() {
        let mut config = config_4x4();
        config.fusion_strategy = vec!["fma".to_string()];
        let cgra = Cgra::new(&config);
        assert_eq!(cgra.capable_tile_count("fma"), 16);
    }

    #[test]
    fn test_additional_func_requires_parameterizable() {
        let mut config = config_4x4();
        config.additional_func.insert(5, vec!["sdiv".to_string()]);
        let cgra = Cgra::new(&config);
        assert_eq!(cgra.capable_tile_count("sdiv"), 0);

        config.parameterizable_cgra = true;
        let cgra = Cgra::new(&config);
        assert_eq!(cgra.capable_tile_count("sdiv"), 1);
        assert!(cgra.tile(5).can_support("sdiv"));
    }

    #[test]
    fn test_island_partitioning() {
        let cgra = Cgra::new(&config_4x4());
        assert_eq!(cgra.island_count(), 4);
        assert_eq!(cgra.tile_at(0, 0).island, 0);
        assert_eq!(cgra.tile_at(0, 1).island, 0);
        assert_eq!(cgra.tile_at(0, 2).island, 1);
        assert_eq!(cgra.tile_at(2, 0).island, 2);
        assert_eq!(cgra.tile_at(3, 3).island, 3);
    }

    #[test]
    fn test_exec_conflicts_modulo_ii() {
        let mut cgra = Cgra::new(&config_4x4());
        cgra.reset(2);
        assert!(cgra.try_reserve_tile(0, 0, TileRole::Exec, 0));
        // Slot 2 wraps onto slot 0.
        assert!(!cgra.try_reserve_tile(0, 2, TileRole::Exec, 1));
        assert!(cgra.try_reserve_tile(0, 1, TileRole::Exec, 1));
    }

    #[test]
    fn test_inclusive_strategy_allows_drain_sharing() {
        let mut config = config_4x4();
        config.multi_cycle_strategy = MultiCycleStrategy::Inclusive;
        let mut cgra = Cgra::new(&config);
        cgra.reset(4);
        assert!(cgra.try_reserve_tile(0, 1, TileRole::Drain, 0));
        assert!(cgra.try_reserve_tile(0, 1, TileRole::Exec, 1));
        // Admission is order-independent: a drain over an exec works too.
        assert!(cgra.try_reserve_tile(0, 2, TileRole::Exec, 2));
        assert!(cgra.try_reserve_tile(0, 2, TileRole::Drain, 3));
        // Two execs never share a slot.
        assert!(!cgra.try_reserve_tile(0, 1, TileRole::Exec, 4));

        // Exclusive rejects the same sharing.
        let mut cgra = Cgra::new(&config_4x4());
        cgra.reset(4);
        assert!(cgra.try_reserve_tile(0, 1, TileRole::Drain, 0));
        assert!(!cgra.try_reserve_tile(0, 1, TileRole::Exec, 1));
    }

    #[test]
    fn test_bypass_and_register_budgets() {
        let mut config = config_4x4();
        config.bypass_constraint = 2;
        config.reg_constraint = 1;
        let mut cgra = Cgra::new(&config);
        cgra.reset(4);

        assert!(cgra.try_reserve_tile(3, 0, TileRole::Bypass, 10));
        assert!(cgra.try_reserve_tile(3, 0, TileRole::Bypass, 11));
        assert!(!cgra.try_reserve_tile(3, 0, TileRole::Bypass, 12));

        assert!(cgra.try_reserve_tile(3, 0, TileRole::RegHold, 13));
        assert!(!cgra.try_reserve_tile(3, 0, TileRole::RegHold, 14));
        // Other slots are unaffected.
        assert!(cgra.try_reserve_tile(3, 1, TileRole::RegHold, 14));
    }

    #[test]
    fn test_ctrl_mem_bounds_occupied_slots() {
        let mut config = config_4x4();
        config.ctrl_mem_constraint = 2;
        let mut cgra = Cgra::new(&config);
        cgra.reset(4);

        assert!(cgra.try_reserve_tile(0, 0, TileRole::Exec, 0));
        assert!(cgra.try_reserve_tile(0, 1, TileRole::Exec, 1));
        // A third distinct slot exceeds the control memory.
        assert!(!cgra.try_reserve_tile(0, 2, TileRole::Exec, 2));
        // Reusing an occupied slot in a compatible role is fine.
        assert!(cgra.try_reserve_tile(0, 1, TileRole::RegHold, 3));
    }

    #[test]
    fn test_link_occupancy_is_exclusive() {
        let mut cgra = Cgra::new(&config_4x4());
        cgra.reset(3);
        let link = cgra.link_between(0, 1).unwrap();
        assert!(cgra.try_reserve_link(link, 1, 7));
        assert!(!cgra.try_reserve_link(link, 4, 8)); // wraps onto slot 1
        assert!(cgra.try_reserve_link(link, 2, 8));
        assert_eq!(cgra.link(link).edge_at(1), Some(7));
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut cgra = Cgra::new(&config_4x4());
        cgra.reset(2);
        assert!(cgra.try_reserve_tile(0, 0, TileRole::Exec, 0));

        let checkpoint = cgra.checkpoint();
        let link = cgra.link_between(0, 1).unwrap();
        assert!(cgra.try_reserve_tile(1, 1, TileRole::Exec, 1));
        assert!(cgra.try_reserve_link(link, 0, 5));
        assert!(cgra.try_reserve_tile(2, 1, TileRole::Bypass, 5));

        cgra.rollback_to(checkpoint);
        assert_eq!(cgra.tile(1).exec_at(1), None);
        assert_eq!(cgra.link(link).edge_at(0), None);
        assert!(cgra.tile(2).entries(1).is_empty());
        // The pre-checkpoint reservation survives.
        assert_eq!(cgra.tile(0).exec_at(0), Some(0));
    }
}
