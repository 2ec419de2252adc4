//! Consistency sweep over the claims store.
//!
//! Looks for rows that point at records which no longer exist:
//! * areas whose residence is gone, and residences without an area
//! * cells held by a missing town, and towns whose cell count disagrees with
//!   their cell index
//! * flags of missing towns or residences
//! * memberships, leaderships and likes naming a missing residence, town or
//!   subject
//!
//! The sweep only reads. It runs off the calling thread through
//! [`spawn_sweep`] and reports back through a callback; two sweeps may run at
//! the same time and each sees whatever state the store had while it ran.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::claims::errors::ClaimError;
use crate::claims::flags::{FlagKind, ResidenceFlags, TownFlags};
use crate::claims::storage::{keys, ClaimStore};
use crate::claims::types::{Leadership, Like, Membership, ResidenceId, TownChunk, TownId};

/// Findings of one sweep.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub residences_checked: usize,
    pub cells_checked: usize,
    pub orphan_areas: Vec<ResidenceId>,
    pub residences_without_area: Vec<ResidenceId>,
    pub orphan_cells: Vec<TownChunk>,
    /// `(town, recorded cell_count, cells in the index)`.
    pub cell_count_drift: Vec<(TownId, u32, usize)>,
    /// `(namespace, entity)` of flags whose entity is gone.
    pub orphan_flags: Vec<(String, u64)>,
    pub dangling_members: Vec<Membership>,
    pub dangling_leaders: Vec<Leadership>,
    pub dangling_likes: Vec<Like>,
}

impl SweepReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            elapsed_ms: 0,
            residences_checked: 0,
            cells_checked: 0,
            orphan_areas: Vec::new(),
            residences_without_area: Vec::new(),
            orphan_cells: Vec::new(),
            cell_count_drift: Vec::new(),
            orphan_flags: Vec::new(),
            dangling_members: Vec::new(),
            dangling_leaders: Vec::new(),
            dangling_likes: Vec::new(),
        }
    }

    pub fn issue_count(&self) -> usize {
        self.orphan_areas.len()
            + self.residences_without_area.len()
            + self.orphan_cells.len()
            + self.cell_count_drift.len()
            + self.orphan_flags.len()
            + self.dangling_members.len()
            + self.dangling_leaders.len()
            + self.dangling_likes.len()
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }

    /// Format a compact one-line summary
    pub fn summary_line(&self) -> String {
        format!(
            "{} residences, {} cells checked in {} ms | {} issues (areas {}, unplaced {}, cells {}, drift {}, flags {}, members {}, leaders {}, likes {})",
            self.residences_checked,
            self.cells_checked,
            self.elapsed_ms,
            self.issue_count(),
            self.orphan_areas.len(),
            self.residences_without_area.len(),
            self.orphan_cells.len(),
            self.cell_count_drift.len(),
            self.orphan_flags.len(),
            self.dangling_members.len(),
            self.dangling_leaders.len(),
            self.dangling_likes.len(),
        )
    }
}

/// Entity id in the second `:` segment of a key.
fn second_segment_id(key: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(key).ok()?;
    text.split(':').nth(1)?.parse().ok()
}

fn town_exists(store: &ClaimStore, id: TownId) -> Result<bool, ClaimError> {
    Ok(store.towns.contains_key(keys::town(id))?)
}

fn residence_exists(store: &ClaimStore, id: ResidenceId) -> Result<bool, ClaimError> {
    Ok(store.residences.contains_key(keys::residence(id))?)
}

fn subject_exists(store: &ClaimStore, id: u64) -> Result<bool, ClaimError> {
    Ok(store.subjects.contains_key(keys::subject(id))?)
}

fn scan_regions(store: &ClaimStore, report: &mut SweepReport) -> Result<(), ClaimError> {
    for id in store.list_area_residence_ids()? {
        if !residence_exists(store, id)? {
            report.orphan_areas.push(id);
        }
    }
    for residence in store.list_residences()? {
        report.residences_checked += 1;
        if !store.regions.contains_key(keys::area(residence.id))? {
            report.residences_without_area.push(residence.id);
        }
    }
    Ok(())
}

fn scan_territory(store: &ClaimStore, report: &mut SweepReport) -> Result<(), ClaimError> {
    for entry in store.territory.scan_prefix(b"cell:") {
        let (_, value) = entry?;
        let chunk: TownChunk = ClaimStore::deserialize(value)?;
        report.cells_checked += 1;
        if !town_exists(store, chunk.town)? {
            report.orphan_cells.push(chunk);
        }
    }
    for id in store.list_town_ids()? {
        let town = store.get_town(id)?;
        let indexed = store
            .territory
            .scan_prefix(keys::town_cell_prefix(id))
            .count();
        if indexed != town.cell_count as usize {
            report.cell_count_drift.push((id, town.cell_count, indexed));
        }
    }
    Ok(())
}

fn scan_flag_namespace<K: FlagKind>(
    store: &ClaimStore,
    report: &mut SweepReport,
) -> Result<(), ClaimError> {
    let prefix = format!("{}:", K::NAMESPACE);
    let mut last = None;
    for entry in store.flags.scan_prefix(prefix.as_bytes()) {
        let (key, _) = entry?;
        let Some(entity) = second_segment_id(&key) else {
            warn!("unparseable flag key {}", String::from_utf8_lossy(&key));
            continue;
        };
        // Keys are ordered, so each entity's flags are contiguous.
        if last == Some(entity) {
            continue;
        }
        last = Some(entity);
        if !K::entity_exists(store, entity)? {
            report.orphan_flags.push((K::NAMESPACE.to_string(), entity));
        }
    }
    Ok(())
}

fn scan_membership(store: &ClaimStore, report: &mut SweepReport) -> Result<(), ClaimError> {
    for entry in store.membership.scan_prefix(b"member:") {
        let (_, value) = entry?;
        let row: Membership = ClaimStore::deserialize(value)?;
        if !residence_exists(store, row.residence)? || !subject_exists(store, row.subject)? {
            report.dangling_members.push(row);
        }
    }
    for entry in store.membership.scan_prefix(b"leader:") {
        let (_, value) = entry?;
        let row: Leadership = ClaimStore::deserialize(value)?;
        if !town_exists(store, row.town)? || !subject_exists(store, row.subject)? {
            report.dangling_leaders.push(row);
        }
    }
    for entry in store.membership.scan_prefix(b"like:") {
        let (_, value) = entry?;
        let row: Like = ClaimStore::deserialize(value)?;
        if !residence_exists(store, row.residence)? || !subject_exists(store, row.subject)? {
            report.dangling_likes.push(row);
        }
    }
    Ok(())
}

/// Run the whole sweep on the current thread.
pub fn scan(store: &ClaimStore) -> Result<SweepReport, ClaimError> {
    let clock = Instant::now();
    let mut report = SweepReport::new();
    scan_regions(store, &mut report)?;
    scan_territory(store, &mut report)?;
    scan_flag_namespace::<TownFlags>(store, &mut report)?;
    scan_flag_namespace::<ResidenceFlags>(store, &mut report)?;
    scan_membership(store, &mut report)?;
    report.elapsed_ms = clock.elapsed().as_millis();
    if report.is_clean() {
        info!("claims sweep clean: {}", report.summary_line());
    } else {
        warn!("claims sweep found problems: {}", report.summary_line());
    }
    Ok(report)
}

/// Run [`scan`] on the blocking pool and hand the result to `on_done`.
pub fn spawn_sweep<F>(store: Arc<ClaimStore>, on_done: F) -> JoinHandle<()>
where
    F: FnOnce(Result<SweepReport, ClaimError>) + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = scan(&store);
        if let Err(e) = &result {
            error!("claims sweep failed: {}", e);
        }
        on_done(result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::flags::ResidenceFlag;
    use crate::claims::storage::ClaimStoreBuilder;
    use crate::claims::types::{BlockPos, CellCoord};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    #[test]
    fn fresh_estate_is_clean() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClaimStoreBuilder::new(dir.path()).open().expect("store");
        let alice = store.resolve_subject("alice").expect("alice");
        let town = store
            .create_town("Hollow", alice, "w", CellCoord::new(0, 0))
            .expect("town");
        store
            .buy_cells(town.id, "w", &[CellCoord::new(1, 0)], 0)
            .expect("cells");
        let house = store
            .create_residence("Cottage", Some(town.id), Some(alice), "w", BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3))
            .expect("house");
        store.residence_flags().set(house.id, ResidenceFlag::Public).expect("flag");
        store.like(house.id, alice).expect("like");

        let report = scan(&store).expect("scan");
        assert!(report.is_clean(), "{}", report.summary_line());
        assert_eq!(report.residences_checked, 1);
        assert_eq!(report.cells_checked, 2);
    }

    #[test]
    fn deleted_residence_leaves_orphans_behind() {
        let dir = TempDir::new().expect("tempdir");
        let store = ClaimStoreBuilder::new(dir.path()).open().expect("store");
        let alice = store.resolve_subject("alice").expect("alice");
        let bob = store.resolve_subject("bob").expect("bob");
        let house = store
            .create_residence("Cottage", None, Some(alice), "w", BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3))
            .expect("house");
        store.residence_flags().set(house.id, ResidenceFlag::Hidden).expect("flag");
        store.add_member(house.id, bob).expect("member");
        store.like(house.id, bob).expect("like");

        store.residences.remove(keys::residence(house.id)).expect("raw delete");

        let report = scan(&store).expect("scan");
        assert_eq!(report.orphan_areas, vec![house.id]);
        assert_eq!(report.orphan_flags, vec![("residence".to_string(), house.id)]);
        assert_eq!(report.dangling_members.len(), 1);
        assert_eq!(report.dangling_likes.len(), 1);
        assert_eq!(report.issue_count(), 4);
    }

    #[tokio::test]
    async fn background_sweep_reports_through_callback() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ClaimStoreBuilder::new(dir.path()).open().expect("store"));
        let (tx, rx) = oneshot::channel();
        let first = spawn_sweep(store.clone(), move |result| {
            let _ = tx.send(result.map(|r| r.issue_count()));
        });
        let second = spawn_sweep(store, |result| assert!(result.is_ok()));
        first.await.expect("join");
        second.await.expect("join");
        assert_eq!(rx.await.expect("callback").expect("scan"), 0);
    }
}
