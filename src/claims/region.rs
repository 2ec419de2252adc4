//! Region index: residences by the boxes they occupy.
//!
//! Each area is bucketed under every grid column it spans (`col:` keys), so a
//! point or cube query only scans the handful of columns it touches before the
//! exact box test. Areas spanning more than [`MAX_INDEXED_COLUMNS`] columns
//! get a single `wide:` row per world instead, and every query scans those.
//! A query wider than that limit reads the area rows directly, so the cost of
//! a query is bounded by the number of residences rather than its size.

use std::collections::BTreeSet;

use log::{debug, info};
use sled::transaction::TransactionalTree;

use crate::claims::errors::ClaimError;
use crate::claims::storage::{keys, tx_decode, tx_encode, ClaimStore, TxResult};
use crate::claims::types::{
    column_span, BlockPos, CellCoord, Location, Residence, ResidenceArea, ResidenceId,
    AREA_SCHEMA_VERSION,
};

/// Widest area, in grid columns, that is bucketed per column.
pub const MAX_INDEXED_COLUMNS: u64 = 1024;

fn unindex_area(
    regions: &TransactionalTree,
    area: &ResidenceArea,
    cell_size: i32,
) -> TxResult<()> {
    if area.column_span(cell_size) > MAX_INDEXED_COLUMNS {
        regions.remove(keys::wide_area(&area.world, area.residence))?;
        return Ok(());
    }
    for cell in area.cells(cell_size) {
        regions.remove(keys::column(&area.world, cell, area.residence))?;
    }
    Ok(())
}

fn index_area(regions: &TransactionalTree, area: &ResidenceArea, cell_size: i32) -> TxResult<()> {
    if area.column_span(cell_size) > MAX_INDEXED_COLUMNS {
        regions.insert(keys::wide_area(&area.world, area.residence), Vec::<u8>::new())?;
        return Ok(());
    }
    for cell in area.cells(cell_size) {
        regions.insert(keys::column(&area.world, cell, area.residence), Vec::<u8>::new())?;
    }
    Ok(())
}

/// Write `area` for its residence inside a transaction, dropping whatever
/// box (and index entries) the residence had before. The row id survives.
pub(crate) fn replace_area_in_tx(
    regions: &TransactionalTree,
    area: &ResidenceArea,
    fresh_id: u64,
    cell_size: i32,
) -> TxResult<ResidenceArea> {
    let mut stored = area.clone();
    stored.schema_version = AREA_SCHEMA_VERSION;
    stored.id = fresh_id;
    if let Some(bytes) = regions.get(keys::area(area.residence))? {
        let previous: ResidenceArea = tx_decode(&bytes)?;
        stored.id = previous.id;
        unindex_area(regions, &previous, cell_size)?;
    }
    index_area(regions, &stored, cell_size)?;
    regions.insert(keys::area(stored.residence), tx_encode(&stored)?)?;
    Ok(stored)
}

impl ClaimStore {
    /// The box of `residence`.
    pub fn area_of(&self, residence: ResidenceId) -> Result<ResidenceArea, ClaimError> {
        match self.regions.get(keys::area(residence))? {
            Some(bytes) => Ok(Self::deserialize(bytes)?),
            None => Err(ClaimError::NotFound(format!("area of residence: {}", residence))),
        }
    }

    /// Store or redefine the box of a residence, keeping the row id.
    pub fn replace_area(&self, area: &ResidenceArea) -> Result<ResidenceArea, ClaimError> {
        let fresh = self.next_id()?;
        let cell_size = self.cell_size();
        let stored = self
            .regions
            .transaction(|regions| replace_area_in_tx(regions, area, fresh, cell_size))?;
        self.regions.flush()?;
        info!(
            "residence {} area set to {:?}..{:?} in {}",
            stored.residence, stored.low, stored.high, stored.world
        );
        Ok(stored)
    }

    /// Residence ids that may intersect the columns `[lo, hi]`: those
    /// bucketed under one of them plus the wide areas of the world.
    fn candidates(
        &self,
        world: &str,
        lo: CellCoord,
        hi: CellCoord,
    ) -> Result<BTreeSet<ResidenceId>, ClaimError> {
        if column_span(lo, hi) > MAX_INDEXED_COLUMNS {
            return Ok(self.list_area_residence_ids()?.into_iter().collect());
        }
        let mut ids = BTreeSet::new();
        for entry in self.regions.scan_prefix(keys::wide_area_prefix(world)) {
            let (key, _) = entry?;
            if let Some(id) = keys::trailing_id(&key) {
                ids.insert(id);
            }
        }
        for x in lo.x..=hi.x {
            for z in lo.z..=hi.z {
                for entry in self
                    .regions
                    .scan_prefix(keys::column_prefix(world, CellCoord::new(x, z)))
                {
                    let (key, _) = entry?;
                    if let Some(id) = keys::trailing_id(&key) {
                        ids.insert(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Areas intersecting the inclusive box `[low, high]` in `world`.
    pub fn areas_intersecting(
        &self,
        world: &str,
        low: BlockPos,
        high: BlockPos,
    ) -> Result<Vec<ResidenceArea>, ClaimError> {
        let lo = CellCoord::containing(low, self.cell_size());
        let hi = CellCoord::containing(high, self.cell_size());
        let mut out = Vec::new();
        for id in self.candidates(world, lo, hi)? {
            match self.area_of(id) {
                Ok(area) if area.intersects(world, low, high) => out.push(area),
                Ok(_) => {}
                Err(ClaimError::NotFound(_)) => {
                    debug!("column index points at residence {} without area", id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// The residence whose box contains `loc` (all six faces inclusive).
    pub fn residence_at(&self, loc: &Location) -> Result<Option<Residence>, ClaimError> {
        for area in self.areas_intersecting(&loc.world, loc.pos, loc.pos)? {
            if area.contains(loc) {
                match self.get_residence(area.residence) {
                    Ok(residence) => return Ok(Some(residence)),
                    Err(ClaimError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Every residence whose box meets the cube of side `2 * distance + 1`
    /// centred on `loc`.
    pub fn residences_near(
        &self,
        loc: &Location,
        distance: u32,
    ) -> Result<Vec<Residence>, ClaimError> {
        let d = i32::try_from(distance).unwrap_or(i32::MAX);
        let low = BlockPos::new(
            loc.pos.x.saturating_sub(d),
            loc.pos.y.saturating_sub(d),
            loc.pos.z.saturating_sub(d),
        );
        let high = BlockPos::new(
            loc.pos.x.saturating_add(d),
            loc.pos.y.saturating_add(d),
            loc.pos.z.saturating_add(d),
        );
        let mut out = Vec::new();
        for area in self.areas_intersecting(&loc.world, low, high)? {
            match self.get_residence(area.residence) {
                Ok(residence) => out.push(residence),
                Err(ClaimError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Residence ids that have an area row, straight from the `area:` keys.
    pub fn list_area_residence_ids(&self) -> Result<Vec<ResidenceId>, ClaimError> {
        let mut ids = Vec::new();
        for entry in self.regions.scan_prefix(b"area:") {
            let (key, _) = entry?;
            if let Some(id) = keys::trailing_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
