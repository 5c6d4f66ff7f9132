//! Modulo-time router
//!
//! Carries a value from its producer's output to its consumer's input
//! through the mesh, one step per cycle. A step either traverses a link
//! to a neighbour tile or waits in the current tile's register file. The
//! search runs Dijkstra over (tile, slot mod II) states with a
//! congestion-avoidance weight on busy tiles; ties break
//! deterministically on (row, column).
//!
//! Timing model: the value leaves the producer tile at the start of slot
//! `leave`. Step i happens during slot `leave + i`. A tile that receives
//! a value and forwards it in the very next slot spends a bypass lane (or
//! a register when the lanes are full); a tile that keeps the value for a
//! later departure spends a register per waited slot. Arrival must not
//! overshoot the consumer's deadline; leftover cycles are spent in the
//! destination tile's register file.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::cgra::{Cgra, LinkId, TileId, TileRole};
use crate::dfg::EdgeId;

/// A committed route for one DFG edge.
#[derive(Debug, Clone)]
pub struct Route {
    pub edge: EdgeId,
    /// Links traversed, with the absolute slot of each traversal.
    pub links: Vec<(LinkId, usize)>,
    /// Transit reservations along the way: tile, absolute slot, and
    /// whether a bypass lane or a register was spent.
    pub transits: Vec<(TileId, usize, TileRole)>,
    /// Absolute slots the value waits in the destination register file.
    pub holds: Vec<usize>,
    pub dst_tile: TileId,
}

impl Route {
    /// Number of link hops.
    pub fn hops(&self) -> usize {
        self.links.len()
    }
}

/// Router over one CGRA instance.
#[derive(Debug, Clone)]
pub struct Router {
    congestion_weight: u64,
}

impl Router {
    pub fn new(congestion_weight: u64) -> Self {
        Self { congestion_weight }
    }

    /// Routes `edge` from `src_tile` (value ready at slot `leave`) to
    /// `dst_tile` (consumed at slot `deadline`). On success the needed
    /// link, transit, and register reservations are committed to the CGRA
    /// journal; the caller owns checkpoint/rollback around composite
    /// attempts. Returns `None` when no admissible path exists within the
    /// slack.
    pub fn route(
        &self,
        cgra: &mut Cgra,
        edge: EdgeId,
        src_tile: TileId,
        leave: usize,
        dst_tile: TileId,
        deadline: usize,
    ) -> Option<Route> {
        let ii = cgra.ii();
        debug_assert!(ii > 0);
        let slack = deadline.checked_sub(leave)?;

        let chain = if src_tile == dst_tile {
            vec![src_tile]
        } else {
            self.search(cgra, src_tile, leave, dst_tile, slack)?
        };
        let steps = chain.len() - 1;

        let mut route = Route {
            edge,
            links: Vec::new(),
            transits: Vec::new(),
            holds: Vec::new(),
            dst_tile,
        };

        for i in 0..steps {
            let slot = leave + i;
            if chain[i + 1] == chain[i] {
                // Wait a slot in this tile's register file.
                if !cgra.try_reserve_tile(chain[i], slot, TileRole::RegHold, edge) {
                    return None;
                }
                route.transits.push((chain[i], slot, TileRole::RegHold));
            } else {
                let link = cgra
                    .link_between(chain[i], chain[i + 1])
                    .expect("search produced a non-adjacent hop");
                if !cgra.try_reserve_link(link, slot, edge) {
                    return None;
                }
                route.links.push((link, slot));
                // A hop-arrived value forwarding immediately needs a
                // bypass lane; one already parked in a register does not.
                if i > 0 && chain[i - 1] != chain[i] {
                    let role = if cgra.try_reserve_tile(chain[i], slot, TileRole::Bypass, edge) {
                        TileRole::Bypass
                    } else if cgra.try_reserve_tile(chain[i], slot, TileRole::RegHold, edge) {
                        TileRole::RegHold
                    } else {
                        return None;
                    };
                    route.transits.push((chain[i], slot, role));
                }
            }
        }

        // Leftover slack waits in the destination register file; modulo
        // wrap means at most II distinct slots.
        let arrival = leave + steps;
        let mut held_mods = BTreeSet::new();
        for slot in arrival..deadline {
            if !held_mods.insert(slot % ii) {
                break;
            }
            if !cgra.try_reserve_tile(dst_tile, slot, TileRole::RegHold, edge) {
                return None;
            }
            route.holds.push(slot);
        }

        Some(route)
    }

    /// Dijkstra in (tile, slot mod II) space with hop and wait
    /// transitions. Returns the per-slot tile chain from src to dst
    /// inclusive, or `None` when the slack is exhausted first.
    fn search(
        &self,
        cgra: &Cgra,
        src_tile: TileId,
        leave: usize,
        dst_tile: TileId,
        slack: usize,
    ) -> Option<Vec<TileId>> {
        let ii = cgra.ii();
        type Key = (TileId, usize);

        let mut dist: HashMap<Key, (u64, usize)> = HashMap::new();
        let mut parent: HashMap<Key, Key> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u64, usize, usize, usize)>> = BinaryHeap::new();

        let start: Key = (src_tile, leave % ii);
        dist.insert(start, (0, 0));
        let src = cgra.tile(src_tile);
        heap.push(Reverse((0, 0, src.row, src.col)));

        let mut found: Option<(Key, usize)> = None;
        while let Some(Reverse((cost, steps, row, col))) = heap.pop() {
            let tile = row * cgra.columns + col;
            let key = (tile, (leave + steps) % ii);
            if dist.get(&key) != Some(&(cost, steps)) {
                continue;
            }
            if tile == dst_tile {
                found = Some((key, steps));
                break;
            }
            if steps == slack {
                continue;
            }
            let slot = leave + steps;

            let mut candidates: Vec<(TileId, u64)> = Vec::new();

            // Hop to a neighbour. Departing a tile the value only just
            // reached needs transit capacity there.
            if tile == src_tile || cgra.transit_available(tile, slot) {
                for &link_id in cgra.out_links(tile) {
                    let link = cgra.link(link_id);
                    if link.edge_at(slot % ii).is_some() {
                        continue;
                    }
                    let next_cost = cost
                        + 1
                        + self.congestion_weight * cgra.occupancy_count(link.dst, slot + 1) as u64;
                    candidates.push((link.dst, next_cost));
                }
            }

            // Wait a slot in this tile's register file.
            if cgra.register_available(tile, slot) {
                candidates.push((tile, cost + 1));
            }

            for (next, next_cost) in candidates {
                let next_steps = steps + 1;
                let next_key = (next, (leave + next_steps) % ii);
                let better = match dist.get(&next_key) {
                    Some(&(best, _)) => next_cost < best,
                    None => true,
                };
                if better {
                    dist.insert(next_key, (next_cost, next_steps));
                    parent.insert(next_key, key);
                    let nt = cgra.tile(next);
                    heap.push(Reverse((next_cost, next_steps, nt.row, nt.col)));
                }
            }
        }

        let (end, steps) = found?;
        let mut chain = Vec::with_capacity(steps + 1);
        chain.push(end.0);
        let mut cursor = end;
        while cursor != start {
            cursor = parent[&cursor];
            chain.push(cursor.0);
        }
        chain.reverse();
        Some(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamConfig;

    fn cgra_with_ii(ii: usize) -> Cgra {
        let config = ParamConfig {
            rows: 4,
            columns: 4,
            ..ParamConfig::default()
        };
        let mut cgra = Cgra::new(&config);
        cgra.reset(ii);
        cgra
    }

    #[test]
    fn test_same_tile_zero_slack() {
        let mut cgra = cgra_with_ii(2);
        let route = Router::new(1).route(&mut cgra, 0, 5, 3, 5, 3).unwrap();
        assert_eq!(route.hops(), 0);
        assert!(route.holds.is_empty());
    }

    #[test]
    fn test_same_tile_holds_in_registers() {
        let mut cgra = cgra_with_ii(4);
        let route = Router::new(1).route(&mut cgra, 0, 5, 1, 5, 3).unwrap();
        assert_eq!(route.hops(), 0);
        assert_eq!(route.holds, vec![1, 2]);
        assert_eq!(cgra.occupancy_count(5, 1), 1);
    }

    #[test]
    fn test_adjacent_hop() {
        let mut cgra = cgra_with_ii(4);
        // Tile 0 -> tile 1, one hop, leave at 2, consume at 3.
        let route = Router::new(1).route(&mut cgra, 7, 0, 2, 1, 3).unwrap();
        assert_eq!(route.hops(), 1);
        assert!(route.transits.is_empty());
        assert!(route.holds.is_empty());
        let link = cgra.link_between(0, 1).unwrap();
        assert_eq!(cgra.link(link).edge_at(2), Some(7));
    }

    #[test]
    fn test_manhattan_path_reserves_transits() {
        let mut cgra = cgra_with_ii(8);
        // Tile (0,0) -> (1,2): 3 hops, exactly on deadline.
        let dst = cgra.tile_at(1, 2).id;
        let route = Router::new(1).route(&mut cgra, 3, 0, 0, dst, 3).unwrap();
        assert_eq!(route.hops(), 3);
        assert_eq!(route.transits.len(), 2);
        assert!(route
            .transits
            .iter()
            .all(|&(_, _, role)| role == TileRole::Bypass));
    }

    #[test]
    fn test_insufficient_slack_fails() {
        let mut cgra = cgra_with_ii(8);
        let dst = cgra.tile_at(1, 2).id;
        assert!(Router::new(1).route(&mut cgra, 3, 0, 0, dst, 2).is_none());
        // Deadline before leave is rejected outright.
        assert!(Router::new(1).route(&mut cgra, 3, 0, 5, dst, 4).is_none());
    }

    #[test]
    fn test_waits_out_an_occupied_link() {
        let mut cgra = cgra_with_ii(2);
        // Block 0 -> 1 at slot 0, the immediate departure slot.
        let direct = cgra.link_between(0, 1).unwrap();
        assert!(cgra.try_reserve_link(direct, 0, 99));

        // With 2 slots of slack the value waits one cycle at the source,
        // then takes the direct link at slot 1.
        let route = Router::new(1).route(&mut cgra, 5, 0, 0, 1, 2).unwrap();
        assert_eq!(route.hops(), 1);
        assert_eq!(route.links, vec![(direct, 1)]);
        assert_eq!(route.transits, vec![(0, 0, TileRole::RegHold)]);
        // The previously blocked slot is untouched.
        assert_eq!(cgra.link(direct).edge_at(0), Some(99));
    }

    #[test]
    fn test_deterministic_tie_break() {
        // Two equal-length paths exist from (0,0) to (1,1); the route is
        // identical across runs.
        let mut a = cgra_with_ii(4);
        let mut b = cgra_with_ii(4);
        let dst = a.tile_at(1, 1).id;
        let ra = Router::new(1).route(&mut a, 0, 0, 0, dst, 2).unwrap();
        let rb = Router::new(1).route(&mut b, 0, 0, 0, dst, 2).unwrap();
        assert_eq!(ra.links, rb.links);
        assert_eq!(ra.transits, rb.transits);
    }

    #[test]
    fn test_register_fallback_when_bypass_full() {
        let config = ParamConfig {
            rows: 4,
            columns: 4,
            bypass_constraint: 0,
            ..ParamConfig::default()
        };
        let mut cgra = Cgra::new(&config);
        cgra.reset(8);
        let dst = cgra.tile_at(0, 2).id;
        let route = Router::new(1).route(&mut cgra, 1, 0, 0, dst, 2).unwrap();
        assert_eq!(route.transits.len(), 1);
        assert_eq!(route.transits[0].2, TileRole::RegHold);
    }
}
