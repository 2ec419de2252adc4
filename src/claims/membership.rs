//! Membership graph: who belongs to a residence, who lives in and leads a town.
//!
//! A town has at most one primary leader, stored under a fixed key so that
//! installing a new one overwrites the old row in the same write. Co-leaders
//! (hidden leadership rows) live under per-subject keys. The `led:` reverse
//! index answers "which towns does this subject lead".

use log::info;
use sled::transaction::TransactionalTree;
use sled::Transactional;

use crate::claims::errors::ClaimError;
use crate::claims::storage::{
    keys, tx_abort, tx_decode, tx_encode, ClaimStore, TxResult,
};
use crate::claims::types::{
    Leadership, Like, Membership, ResidenceId, SubjectId, SubjectRecord, TownId,
};

/// Remove every leadership row `subject` holds in `town`. Returns whether
/// any row existed.
pub(crate) fn drop_leadership_in_tx(
    membership: &TransactionalTree,
    town: TownId,
    subject: SubjectId,
) -> TxResult<bool> {
    let mut removed = false;
    if let Some(bytes) = membership.get(keys::primary_leader(town))? {
        let primary: Leadership = tx_decode(&bytes)?;
        if primary.subject == subject {
            membership.remove(keys::primary_leader(town))?;
            removed = true;
        }
    }
    if membership.remove(keys::co_leader(town, subject))?.is_some() {
        removed = true;
    }
    membership.remove(keys::led_by(subject, town))?;
    Ok(removed)
}

impl ClaimStore {
    /// Owner or explicit member.
    pub fn is_member(&self, residence: ResidenceId, subject: SubjectId) -> Result<bool, ClaimError> {
        let record = self.get_residence(residence)?;
        if record.owner == Some(subject) {
            return Ok(true);
        }
        Ok(self
            .membership
            .contains_key(keys::member(residence, subject))?)
    }

    /// Add an explicit member. Returns `false` if the row already existed.
    pub fn add_member(&self, residence: ResidenceId, subject: SubjectId) -> Result<bool, ClaimError> {
        self.get_residence(residence)?;
        self.get_subject(subject)?;
        let row = Membership {
            id: self.next_id()?,
            residence,
            subject,
        };
        let swapped = self.membership.compare_and_swap(
            keys::member(residence, subject),
            None as Option<&[u8]>,
            Some(Self::serialize(&row)?),
        )?;
        if swapped.is_ok() {
            self.membership.flush()?;
            info!("subject {} joined residence {}", subject, residence);
        }
        Ok(swapped.is_ok())
    }

    pub fn remove_member(&self, residence: ResidenceId, subject: SubjectId) -> Result<bool, ClaimError> {
        let removed = self.membership.remove(keys::member(residence, subject))?;
        if removed.is_some() {
            self.membership.flush()?;
            info!("subject {} left residence {}", subject, residence);
        }
        Ok(removed.is_some())
    }

    /// Ids of explicit member rows (owner not included).
    pub fn explicit_member_ids(&self, residence: ResidenceId) -> Result<Vec<SubjectId>, ClaimError> {
        let mut ids = Vec::new();
        for entry in self.membership.scan_prefix(keys::member_prefix(residence)) {
            let (key, _) = entry?;
            if let Some(id) = keys::trailing_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Owner plus explicit members, sorted by display name.
    pub fn members(&self, residence: ResidenceId) -> Result<Vec<SubjectRecord>, ClaimError> {
        let record = self.get_residence(residence)?;
        let mut ids = self.explicit_member_ids(residence)?;
        if let Some(owner) = record.owner {
            if !ids.contains(&owner) {
                ids.push(owner);
            }
        }
        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_subject(id) {
                Ok(subject) => members.push(subject),
                Err(ClaimError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        members.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        Ok(members)
    }

    pub fn is_inhabitant(&self, town: TownId, subject: SubjectId) -> Result<bool, ClaimError> {
        match self.get_subject(subject) {
            Ok(record) => Ok(record.town == Some(town)),
            Err(ClaimError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn inhabitants(&self, town: TownId) -> Result<Vec<SubjectRecord>, ClaimError> {
        let mut out = Vec::new();
        for entry in self.subjects.scan_prefix(b"subject:") {
            let (_, value) = entry?;
            let subject: SubjectRecord = Self::deserialize(value)?;
            if subject.town == Some(town) {
                out.push(subject);
            }
        }
        out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(out)
    }

    /// Make `subject` an inhabitant of `town`. Leaving the previous town
    /// drops any leadership held there, in the same transaction.
    pub fn join_town(&self, subject: SubjectId, town: TownId) -> Result<(), ClaimError> {
        let previous = (&self.towns, &self.subjects, &self.membership).transaction(
            |(towns, subjects, membership)| -> TxResult<Option<TownId>> {
                if towns.get(keys::town(town))?.is_none() {
                    return tx_abort(ClaimError::NotFound(format!("town: {}", town)));
                }
                let Some(bytes) = subjects.get(keys::subject(subject))? else {
                    return tx_abort(ClaimError::NotFound(format!("subject: {}", subject)));
                };
                let mut record: SubjectRecord = tx_decode(&bytes)?;
                let previous = record.town.filter(|t| *t != town);
                if let Some(old) = previous {
                    drop_leadership_in_tx(membership, old, subject)?;
                }
                record.town = Some(town);
                subjects.insert(keys::subject(subject), tx_encode(&record)?)?;
                Ok(previous)
            },
        )?;
        self.subjects.flush()?;
        self.membership.flush()?;
        match previous {
            Some(old) => info!("subject {} moved from town {} to town {}", subject, old, town),
            None => info!("subject {} now lives in town {}", subject, town),
        }
        Ok(())
    }

    /// Drop the subject's inhabitancy together with any leadership it held
    /// in that town.
    pub fn leave_town(&self, subject: SubjectId) -> Result<Option<TownId>, ClaimError> {
        let left = (&self.subjects, &self.membership).transaction(
            |(subjects, membership)| -> TxResult<Option<TownId>> {
                let Some(bytes) = subjects.get(keys::subject(subject))? else {
                    return tx_abort(ClaimError::NotFound(format!("subject: {}", subject)));
                };
                let mut record: SubjectRecord = tx_decode(&bytes)?;
                let Some(town) = record.town.take() else {
                    return Ok(None);
                };
                drop_leadership_in_tx(membership, town, subject)?;
                subjects.insert(keys::subject(subject), tx_encode(&record)?)?;
                Ok(Some(town))
            },
        )?;
        if let Some(town) = left {
            info!("subject {} left town {}", subject, town);
        }
        Ok(left)
    }

    fn primary_leader(&self, town: TownId) -> Result<Option<Leadership>, ClaimError> {
        match self.membership.get(keys::primary_leader(town))? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_leader(&self, town: TownId, subject: SubjectId) -> Result<bool, ClaimError> {
        if self
            .primary_leader(town)?
            .is_some_and(|row| row.subject == subject)
        {
            return Ok(true);
        }
        Ok(self.membership.contains_key(keys::co_leader(town, subject))?)
    }

    /// Primary leader first, then co-leaders.
    pub fn leaders(&self, town: TownId) -> Result<Vec<Leadership>, ClaimError> {
        let mut out = Vec::new();
        if let Some(primary) = self.primary_leader(town)? {
            out.push(primary);
        }
        for entry in self.membership.scan_prefix(keys::co_leader_prefix(town)) {
            let (_, value) = entry?;
            out.push(Self::deserialize(value)?);
        }
        Ok(out)
    }

    /// Towns in which `subject` holds any leadership row.
    pub fn towns_led_by(&self, subject: SubjectId) -> Result<Vec<TownId>, ClaimError> {
        let mut ids = Vec::new();
        for entry in self.membership.scan_prefix(keys::led_by_prefix(subject)) {
            let (key, _) = entry?;
            if let Some(id) = keys::trailing_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Install `subject` as a leader of `town`. A primary (`co == false`)
    /// replaces the previous primary in the same transaction; the displaced
    /// leader keeps inhabitancy but loses leadership. Leaders always become
    /// inhabitants of the town, so moving in from another town drops the
    /// leadership held there.
    pub fn set_leader(&self, town: TownId, subject: SubjectId, co: bool) -> Result<(), ClaimError> {
        let row_id = self.next_id()?;
        (&self.towns, &self.membership, &self.subjects).transaction(
            |(towns, membership, subjects)| -> TxResult<()> {
                if towns.get(keys::town(town))?.is_none() {
                    return tx_abort(ClaimError::NotFound(format!("town: {}", town)));
                }
                let Some(bytes) = subjects.get(keys::subject(subject))? else {
                    return tx_abort(ClaimError::NotFound(format!("subject: {}", subject)));
                };
                let mut record: SubjectRecord = tx_decode(&bytes)?;

                let current: Option<Leadership> = match membership.get(keys::primary_leader(town))? {
                    Some(bytes) => Some(tx_decode(&bytes)?),
                    None => None,
                };
                let row = Leadership {
                    id: row_id,
                    town,
                    subject,
                    hidden: co,
                };
                if co {
                    if current.as_ref().is_some_and(|p| p.subject == subject) {
                        membership.remove(keys::primary_leader(town))?;
                    }
                    membership.insert(keys::co_leader(town, subject), tx_encode(&row)?)?;
                } else {
                    if let Some(previous) = &current {
                        if previous.subject != subject {
                            membership.remove(keys::led_by(previous.subject, town))?;
                        }
                    }
                    membership.remove(keys::co_leader(town, subject))?;
                    membership.insert(keys::primary_leader(town), tx_encode(&row)?)?;
                }
                membership.insert(keys::led_by(subject, town), Vec::<u8>::new())?;
                if record.town != Some(town) {
                    if let Some(previous) = record.town {
                        drop_leadership_in_tx(membership, previous, subject)?;
                    }
                    record.town = Some(town);
                    subjects.insert(keys::subject(subject), tx_encode(&record)?)?;
                }
                Ok(())
            },
        )?;
        self.membership.flush()?;
        info!(
            "subject {} is now {} of town {}",
            subject,
            if co { "co-leader" } else { "leader" },
            town
        );
        Ok(())
    }

    /// Remove any leadership `subject` holds in `town`.
    pub fn unset_leader(&self, town: TownId, subject: SubjectId) -> Result<bool, ClaimError> {
        let removed = self
            .membership
            .transaction(|membership| drop_leadership_in_tx(membership, town, subject))?;
        if removed {
            self.membership.flush()?;
            info!("subject {} no longer leads town {}", subject, town);
        }
        Ok(removed)
    }

    /// Record that `subject` likes `residence`; liking again replaces the row.
    pub fn like(&self, residence: ResidenceId, subject: SubjectId) -> Result<Like, ClaimError> {
        self.get_residence(residence)?;
        self.get_subject(subject)?;
        let like = Like {
            id: self.next_id()?,
            residence,
            subject,
            liked_at: chrono::Utc::now(),
        };
        self.membership
            .insert(keys::like(residence, subject), Self::serialize(&like)?)?;
        self.membership.flush()?;
        Ok(like)
    }

    pub fn unlike(&self, residence: ResidenceId, subject: SubjectId) -> Result<bool, ClaimError> {
        Ok(self
            .membership
            .remove(keys::like(residence, subject))?
            .is_some())
    }

    pub fn like_count(&self, residence: ResidenceId) -> Result<usize, ClaimError> {
        let mut count = 0;
        for entry in self.membership.scan_prefix(keys::like_prefix(residence)) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn likes_of(&self, residence: ResidenceId) -> Result<Vec<Like>, ClaimError> {
        let mut out = Vec::new();
        for entry in self.membership.scan_prefix(keys::like_prefix(residence)) {
            let (_, value) = entry?;
            out.push(Self::deserialize(value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::storage::ClaimStoreBuilder;
    use crate::claims::types::{Residence, Town};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (ClaimStore, TownId, ResidenceId, SubjectId, SubjectId) {
        let store = ClaimStoreBuilder::new(dir.path()).open().expect("store");
        let alice = store.resolve_subject("alice").expect("alice");
        let bob = store.resolve_subject("Bob").expect("bob");
        let town = store.next_id().expect("id");
        store.put_town(Town::new(town, "Hollow")).expect("town");
        let residence = store.next_id().expect("id");
        store
            .put_residence(Residence::new(residence, "Cottage", Some(town), Some(alice)))
            .expect("residence");
        (store, town, residence, alice, bob)
    }

    #[test]
    fn owner_is_implicit_member() {
        let dir = TempDir::new().expect("tempdir");
        let (store, _, residence, alice, bob) = setup(&dir);
        assert!(store.is_member(residence, alice).expect("owner"));
        assert!(!store.is_member(residence, bob).expect("stranger"));
        assert!(store.add_member(residence, bob).expect("add"));
        assert!(!store.add_member(residence, bob).expect("add again"));
        assert!(store.is_member(residence, bob).expect("member"));
        assert!(store.remove_member(residence, bob).expect("remove"));
        assert!(!store.is_member(residence, bob).expect("gone"));
    }

    #[test]
    fn members_sorted_by_display_name() {
        let dir = TempDir::new().expect("tempdir");
        let (store, _, residence, _alice, bob) = setup(&dir);
        let carol = store.resolve_subject("carol").expect("carol");
        store.add_member(residence, carol).expect("carol");
        store.add_member(residence, bob).expect("bob");
        let names: Vec<_> = store
            .members(residence)
            .expect("members")
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["alice", "Bob", "carol"]);
    }

    #[test]
    fn new_primary_replaces_previous_primary() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, bob) = setup(&dir);
        store.set_leader(town, alice, false).expect("alice leads");
        store.set_leader(town, bob, false).expect("bob leads");

        let leaders = store.leaders(town).expect("leaders");
        assert_eq!(leaders.iter().filter(|l| !l.hidden).count(), 1);
        assert_eq!(leaders[0].subject, bob);
        assert!(!store.is_leader(town, alice).expect("alice"));
        assert!(store.towns_led_by(alice).expect("alice towns").is_empty());
        assert_eq!(store.towns_led_by(bob).expect("bob towns"), vec![town]);
        // Displaced leader still lives there.
        assert!(store.is_inhabitant(town, alice).expect("inhabitant"));
    }

    #[test]
    fn co_leaders_follow_primary() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, bob) = setup(&dir);
        let carol = store.resolve_subject("carol").expect("carol");
        store.set_leader(town, carol, true).expect("carol co");
        store.set_leader(town, alice, false).expect("alice primary");
        store.set_leader(town, bob, true).expect("bob co");

        let leaders = store.leaders(town).expect("leaders");
        assert_eq!(leaders.len(), 3);
        assert_eq!(leaders[0].subject, alice);
        assert!(!leaders[0].hidden);
        assert!(leaders[1..].iter().all(|l| l.hidden));
        assert!(store.is_leader(town, carol).expect("carol"));

        // Promoting a co-leader drops their co row.
        store.set_leader(town, bob, false).expect("bob promoted");
        let leaders = store.leaders(town).expect("leaders");
        assert_eq!(leaders[0].subject, bob);
        assert_eq!(leaders.iter().filter(|l| l.subject == bob).count(), 1);
        assert!(!store.is_leader(town, alice).expect("alice demoted"));
    }

    #[test]
    fn leaving_town_drops_leadership() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, _) = setup(&dir);
        store.set_leader(town, alice, false).expect("lead");
        assert!(store.is_inhabitant(town, alice).expect("inhabitant"));
        assert_eq!(store.leave_town(alice).expect("leave"), Some(town));
        assert!(!store.is_leader(town, alice).expect("leader"));
        assert!(!store.is_inhabitant(town, alice).expect("inhabitant"));
        assert!(store.leaders(town).expect("leaders").is_empty());
    }

    #[test]
    fn leading_another_town_drops_the_old_leadership() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, _) = setup(&dir);
        let other = store.next_id().expect("id");
        store.put_town(Town::new(other, "Ferry")).expect("other town");
        store.set_leader(town, alice, false).expect("lead");

        store.set_leader(other, alice, true).expect("co-lead other");
        assert!(!store.is_leader(town, alice).expect("old town"));
        assert!(store.leaders(town).expect("leaders").is_empty());
        assert!(store.is_leader(other, alice).expect("new town"));
        assert!(store.is_inhabitant(other, alice).expect("inhabitant"));
        assert_eq!(store.towns_led_by(alice).expect("led"), vec![other]);
    }

    #[test]
    fn joining_another_town_moves_inhabitancy_and_drops_leadership() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, _) = setup(&dir);
        let other = store.next_id().expect("id");
        store.put_town(Town::new(other, "Ferry")).expect("other town");
        store.set_leader(town, alice, false).expect("lead");

        assert!(matches!(
            store.join_town(alice, other + 1000),
            Err(ClaimError::NotFound(_))
        ));
        assert!(store.is_leader(town, alice).expect("still leads"));
        assert!(store.is_inhabitant(town, alice).expect("still lives"));

        store.join_town(alice, other).expect("move");
        assert!(store.is_inhabitant(other, alice).expect("moved"));
        assert!(!store.is_inhabitant(town, alice).expect("left"));
        assert!(!store.is_leader(town, alice).expect("leadership dropped"));
        assert!(store.towns_led_by(alice).expect("led").is_empty());

        store.join_town(alice, other).expect("rejoin is a no-op");
        assert!(store.is_inhabitant(other, alice).expect("still moved"));
    }

    #[test]
    fn unset_leader_reports_changes() {
        let dir = TempDir::new().expect("tempdir");
        let (store, town, _, alice, bob) = setup(&dir);
        store.set_leader(town, alice, true).expect("co");
        assert!(!store.unset_leader(town, bob).expect("bob not leader"));
        assert!(store.unset_leader(town, alice).expect("alice"));
        assert!(!store.is_leader(town, alice).expect("gone"));
    }

    #[test]
    fn liking_again_replaces_the_row() {
        let dir = TempDir::new().expect("tempdir");
        let (store, _, residence, alice, bob) = setup(&dir);
        let first = store.like(residence, bob).expect("like");
        let second = store.like(residence, bob).expect("like again");
        assert_ne!(first.id, second.id);
        store.like(residence, alice).expect("alice likes");
        assert_eq!(store.like_count(residence).expect("count"), 2);
        assert!(store.unlike(residence, bob).expect("unlike"));
        assert_eq!(store.like_count(residence).expect("count"), 1);
    }
}
