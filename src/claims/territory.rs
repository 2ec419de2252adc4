//! Territory index: which town owns which grid cell.
//!
//! Cells are keyed by `(world, x, z)`. A town grows only by claiming cells that
//! touch its existing territory (3×3 neighbourhood, diagonals included); a town
//! without any cell may start anywhere. Claiming a cell held by another town
//! reassigns it without touching the losing town's contiguity.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use sled::transaction::TransactionalTree;
use sled::Transactional;

use crate::claims::errors::ClaimError;
use crate::claims::storage::{keys, tx_abort, tx_decode, tx_encode, ClaimStore, TxResult};
use crate::claims::types::{CellCoord, Town, TownChunk, TownId, CHUNK_SCHEMA_VERSION};

/// Result of a single-cell claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The cell was free and now belongs to the town.
    Claimed,
    /// The town already owned the cell; nothing changed.
    AlreadyOwned,
    /// The cell was taken over from another town.
    Annexed { from: TownId },
}

/// Cells written by a claim, with the town each one was taken from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ClaimDelta {
    pub claimed: Vec<CellCoord>,
    pub annexed: Vec<(CellCoord, TownId)>,
}

impl ClaimDelta {
    pub fn len(&self) -> usize {
        self.claimed.len() + self.annexed.len()
    }
}

fn chunk_in_tx(
    territory: &TransactionalTree,
    world: &str,
    cell: CellCoord,
) -> TxResult<Option<TownChunk>> {
    match territory.get(keys::cell(world, cell))? {
        Some(bytes) => Ok(Some(tx_decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Claim `cells` for `town` inside an open transaction.
///
/// Contiguity is checked for every cell against the cells the town held
/// before the batch; all checks run before the first write. `ids` supplies
/// row ids for cells that have never been claimed and must be at least as
/// long as `cells`.
pub(crate) fn claim_in_tx(
    towns: &TransactionalTree,
    territory: &TransactionalTree,
    town: &mut Town,
    world: &str,
    cells: &[CellCoord],
    ids: &[u64],
) -> TxResult<ClaimDelta> {
    let mut pending: Vec<(CellCoord, Option<TownChunk>)> = Vec::new();
    for cell in cells {
        let existing = chunk_in_tx(territory, world, *cell)?;
        if existing.as_ref().is_some_and(|c| c.town == town.id) {
            continue;
        }
        if town.cell_count > 0 {
            let mut touches = false;
            for neighbor in cell.neighbors() {
                if let Some(chunk) = chunk_in_tx(territory, world, neighbor)? {
                    if chunk.town == town.id {
                        touches = true;
                        break;
                    }
                }
            }
            if !touches {
                return tx_abort(ClaimError::Contiguity {
                    town: town.id,
                    world: world.to_string(),
                    x: cell.x,
                    z: cell.z,
                });
            }
        }
        pending.push((*cell, existing));
    }

    let mut delta = ClaimDelta::default();
    for (index, (cell, existing)) in pending.into_iter().enumerate() {
        let row_id = match &existing {
            Some(previous) => {
                if let Some(bytes) = towns.get(keys::town(previous.town))? {
                    let mut loser: Town = tx_decode(&bytes)?;
                    loser.cell_count = loser.cell_count.saturating_sub(1);
                    towns.insert(keys::town(loser.id), tx_encode(&loser)?)?;
                }
                territory.remove(keys::town_cell(previous.town, world, cell))?;
                delta.annexed.push((cell, previous.town));
                previous.id
            }
            None => {
                delta.claimed.push(cell);
                ids[index]
            }
        };
        let chunk = TownChunk {
            id: row_id,
            town: town.id,
            world: world.to_string(),
            x: cell.x,
            z: cell.z,
            schema_version: CHUNK_SCHEMA_VERSION,
        };
        territory.insert(keys::cell(world, cell), tx_encode(&chunk)?)?;
        territory.insert(keys::town_cell(town.id, world, cell), keys::cell(world, cell))?;
    }

    town.cell_count = town.cell_count.saturating_add(delta.len() as u32);
    towns.insert(keys::town(town.id), tx_encode(&*town)?)?;
    Ok(delta)
}

/// Load a town record inside a transaction, aborting with `NotFound`.
pub(crate) fn town_in_tx(towns: &TransactionalTree, id: TownId) -> TxResult<Town> {
    match towns.get(keys::town(id))? {
        Some(bytes) => tx_decode(&bytes),
        None => tx_abort(ClaimError::NotFound(format!("town: {}", id))),
    }
}

/// Deduplicate while keeping the caller's order.
pub(crate) fn unique_cells(cells: &[CellCoord]) -> Vec<CellCoord> {
    let mut seen = BTreeSet::new();
    cells.iter().copied().filter(|c| seen.insert(*c)).collect()
}

pub(crate) fn log_delta(town: &Town, world: &str, delta: &ClaimDelta) {
    if !delta.claimed.is_empty() {
        info!(
            "town {} ({}) claimed {} cell(s) in {}",
            town.id,
            town.name,
            delta.claimed.len(),
            world
        );
    }
    for (cell, from) in &delta.annexed {
        warn!(
            "town {} ({}) annexed cell {},{} in {} from town {}",
            town.id, town.name, cell.x, cell.z, world, from
        );
    }
}

impl ClaimStore {
    /// The cell row at `(world, cell)`, if any.
    pub fn chunk_at(&self, world: &str, cell: CellCoord) -> Result<Option<TownChunk>, ClaimError> {
        match self.territory.get(keys::cell(world, cell))? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Town owning `(world, cell)`. A row pointing at a vanished town reads as
    /// unowned.
    pub fn owner_of(&self, world: &str, cell: CellCoord) -> Result<Option<Town>, ClaimError> {
        let Some(chunk) = self.chunk_at(world, cell)? else {
            return Ok(None);
        };
        match self.get_town(chunk.town) {
            Ok(town) => Ok(Some(town)),
            Err(ClaimError::NotFound(_)) => {
                warn!(
                    "cell {},{} in {} references missing town {}",
                    cell.x, cell.z, world, chunk.town
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Claim one cell for `town`.
    pub fn claim(
        &self,
        town: TownId,
        world: &str,
        cell: CellCoord,
    ) -> Result<ClaimOutcome, ClaimError> {
        let ids = [self.next_id()?];
        let (record, delta) = (&self.towns, &self.territory).transaction(
            |(towns, territory)| -> TxResult<(Town, ClaimDelta)> {
                let mut record = town_in_tx(towns, town)?;
                let delta = claim_in_tx(towns, territory, &mut record, world, &[cell], &ids)?;
                Ok((record, delta))
            },
        )?;
        log_delta(&record, world, &delta);
        if let Some((_, from)) = delta.annexed.first() {
            return Ok(ClaimOutcome::Annexed { from: *from });
        }
        if delta.claimed.is_empty() {
            debug!("town {} already owns {},{} in {}", town, cell.x, cell.z, world);
            return Ok(ClaimOutcome::AlreadyOwned);
        }
        Ok(ClaimOutcome::Claimed)
    }

    /// Claim a set of cells as one unit. Returns how many of them the town did
    /// not already own.
    pub fn claim_all(
        &self,
        town: TownId,
        world: &str,
        cells: &[CellCoord],
    ) -> Result<usize, ClaimError> {
        let cells = unique_cells(cells);
        let ids = cells
            .iter()
            .map(|_| self.next_id())
            .collect::<Result<Vec<_>, _>>()?;
        let (record, delta) = (&self.towns, &self.territory).transaction(
            |(towns, territory)| -> TxResult<(Town, ClaimDelta)> {
                let mut record = town_in_tx(towns, town)?;
                let delta = claim_in_tx(towns, territory, &mut record, world, &cells, &ids)?;
                Ok((record, delta))
            },
        )?;
        log_delta(&record, world, &delta);
        Ok(delta.len())
    }

    pub fn owns(&self, town: TownId, world: &str, cell: CellCoord) -> Result<bool, ClaimError> {
        Ok(self
            .chunk_at(world, cell)?
            .is_some_and(|chunk| chunk.town == town))
    }

    pub fn owns_all(
        &self,
        town: TownId,
        world: &str,
        cells: &[CellCoord],
    ) -> Result<bool, ClaimError> {
        for cell in cells {
            if !self.owns(town, world, *cell)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every cell row held by `town`, across all worlds.
    pub fn cells_of(&self, town: TownId) -> Result<Vec<TownChunk>, ClaimError> {
        let mut out = Vec::new();
        for entry in self.territory.scan_prefix(keys::town_cell_prefix(town)) {
            let (_, cell_key) = entry?;
            if let Some(bytes) = self.territory.get(&cell_key)? {
                let chunk: TownChunk = Self::deserialize(bytes)?;
                if chunk.town == town {
                    out.push(chunk);
                }
            }
        }
        Ok(out)
    }

    /// Count of cells `cells` would add to `town` (those it does not own yet).
    pub fn count_unowned_by(
        &self,
        town: TownId,
        world: &str,
        cells: &[CellCoord],
    ) -> Result<usize, ClaimError> {
        let mut count = 0;
        for cell in unique_cells(cells) {
            if !self.owns(town, world, cell)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::storage::ClaimStoreBuilder;
    use tempfile::TempDir;

    fn store_with_town(dir: &TempDir, name: &str) -> (ClaimStore, TownId) {
        let store = ClaimStoreBuilder::new(dir.path()).open().expect("store");
        let id = store.next_id().expect("id");
        store.put_town(Town::new(id, name)).expect("town");
        (store, id)
    }

    #[test]
    fn first_claim_may_land_anywhere() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        let outcome = store.claim(town, "w", CellCoord::new(100, -40)).expect("claim");
        assert_eq!(outcome, ClaimOutcome::Claimed);
        assert!(store.owns(town, "w", CellCoord::new(100, -40)).expect("owns"));
        assert_eq!(store.get_town(town).expect("town").cell_count, 1);
    }

    #[test]
    fn claims_must_touch_existing_cells() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        store.claim(town, "w", CellCoord::new(0, 0)).expect("seed");

        // Diagonal neighbour is fine.
        store.claim(town, "w", CellCoord::new(1, 1)).expect("diagonal");

        let err = store
            .claim(town, "w", CellCoord::new(3, 0))
            .expect_err("gap of one cell");
        assert!(matches!(err, ClaimError::Contiguity { x: 3, z: 0, .. }));
        assert!(!store.owns(town, "w", CellCoord::new(3, 0)).expect("owns"));
        assert_eq!(store.get_town(town).expect("town").cell_count, 2);
    }

    #[test]
    fn claims_at_the_edge_of_the_grid() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Brink");
        store
            .claim(town, "w", CellCoord::new(i32::MAX - 1, 0))
            .expect("seed");
        store
            .claim(town, "w", CellCoord::new(i32::MAX, 0))
            .expect("edge cell");
        let err = store
            .claim(town, "w", CellCoord::new(i32::MAX, 5))
            .expect_err("detached edge cell");
        assert!(matches!(err, ClaimError::Contiguity { .. }));
        assert_eq!(store.get_town(town).expect("town").cell_count, 2);
    }

    #[test]
    fn adjacency_is_per_world() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        store.claim(town, "overworld", CellCoord::new(0, 0)).expect("seed");
        let err = store
            .claim(town, "nether", CellCoord::new(0, 1))
            .expect_err("different world");
        assert!(matches!(err, ClaimError::Contiguity { .. }));
    }

    #[test]
    fn reclaiming_own_cell_is_a_noop() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        store.claim(town, "w", CellCoord::new(5, 5)).expect("seed");
        let outcome = store.claim(town, "w", CellCoord::new(5, 5)).expect("again");
        assert_eq!(outcome, ClaimOutcome::AlreadyOwned);
        assert_eq!(store.get_town(town).expect("town").cell_count, 1);
        assert_eq!(store.cells_of(town).expect("cells").len(), 1);
    }

    #[test]
    fn claiming_foreign_cell_reassigns_it() {
        let dir = TempDir::new().expect("tempdir");
        let (store, first) = store_with_town(&dir, "Hollow");
        let second = store.next_id().expect("id");
        store.put_town(Town::new(second, "Ridge")).expect("town");

        store.claim(first, "w", CellCoord::new(0, 0)).expect("first seed");
        store.claim(first, "w", CellCoord::new(1, 0)).expect("first grows");
        store.claim(second, "w", CellCoord::new(2, 0)).expect("second seed");

        let outcome = store.claim(second, "w", CellCoord::new(1, 0)).expect("annex");
        assert_eq!(outcome, ClaimOutcome::Annexed { from: first });
        let owner = store.owner_of("w", CellCoord::new(1, 0)).expect("owner").expect("some");
        assert_eq!(owner.id, second);
        assert_eq!(store.get_town(first).expect("first").cell_count, 1);
        assert_eq!(store.get_town(second).expect("second").cell_count, 2);
        assert_eq!(store.cells_of(first).expect("cells").len(), 1);
    }

    #[test]
    fn claim_all_checks_against_pre_batch_cells() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        store.claim(town, "w", CellCoord::new(0, 0)).expect("seed");

        // Mutually adjacent, but the batch never touches (0,0).
        let island = [CellCoord::new(5, 5), CellCoord::new(5, 6), CellCoord::new(6, 6)];
        let err = store.claim_all(town, "w", &island).expect_err("island");
        assert!(matches!(err, ClaimError::Contiguity { .. }));
        for cell in island {
            assert!(!store.owns(town, "w", cell).expect("owns"));
        }

        // A chain where only the first link touches is also rejected.
        let chain = [CellCoord::new(1, 0), CellCoord::new(2, 0)];
        assert!(store.claim_all(town, "w", &chain).is_err());
        assert!(!store.owns(town, "w", CellCoord::new(1, 0)).expect("owns"));
    }

    #[test]
    fn claim_all_counts_only_new_cells() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town) = store_with_town(&dir, "Hollow");
        store.claim(town, "w", CellCoord::new(0, 0)).expect("seed");
        let ring: Vec<_> = CellCoord::new(0, 0).neighbors().collect();
        let mut batch = ring.clone();
        batch.push(CellCoord::new(0, 0));
        batch.push(ring[0]);
        let added = store.claim_all(town, "w", &batch).expect("ring");
        assert_eq!(added, 8);
        assert!(store.owns_all(town, "w", &batch).expect("owns all"));
        assert_eq!(store.get_town(town).expect("town").cell_count, 9);
    }

    #[test]
    fn missing_town_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClaimStoreBuilder::new(dir.path()).open().expect("store");
        let err = store.claim(404, "w", CellCoord::new(0, 0)).expect_err("missing");
        assert!(matches!(err, ClaimError::NotFound(_)));
        assert!(store.owner_of("w", CellCoord::new(0, 0)).expect("lookup").is_none());
    }
}
