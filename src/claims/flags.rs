//! Boolean capability tags attached to towns and residences.
//!
//! One storage implementation serves both entity kinds; a [`FlagKind`] picks the
//! key namespace and the closed tag enumeration.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::claims::errors::ClaimError;
use crate::claims::storage::{keys, ClaimStore};

/// A closed set of flag tags.
pub trait FlagTag:
    Copy + Eq + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(&wanted))
    }
}

/// Entity kind a flag set hangs off.
pub trait FlagKind {
    const NAMESPACE: &'static str;
    type Tag: FlagTag;

    fn entity_exists(store: &ClaimStore, id: u64) -> Result<bool, ClaimError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TownFlag {
    CanBuildByInhabitants,
    AllowPvp,
}

impl FlagTag for TownFlag {
    const ALL: &'static [Self] = &[TownFlag::CanBuildByInhabitants, TownFlag::AllowPvp];

    fn as_str(&self) -> &'static str {
        match self {
            TownFlag::CanBuildByInhabitants => "can-build-by-inhabitants",
            TownFlag::AllowPvp => "allow-pvp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResidenceFlag {
    Public,
    Local,
    Hidden,
    AllowPvp,
    MobSpawning,
}

impl FlagTag for ResidenceFlag {
    const ALL: &'static [Self] = &[
        ResidenceFlag::Public,
        ResidenceFlag::Local,
        ResidenceFlag::Hidden,
        ResidenceFlag::AllowPvp,
        ResidenceFlag::MobSpawning,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            ResidenceFlag::Public => "public",
            ResidenceFlag::Local => "local",
            ResidenceFlag::Hidden => "hidden",
            ResidenceFlag::AllowPvp => "allow-pvp",
            ResidenceFlag::MobSpawning => "mob-spawning",
        }
    }
}

pub struct TownFlags;

impl FlagKind for TownFlags {
    const NAMESPACE: &'static str = "town";
    type Tag = TownFlag;

    fn entity_exists(store: &ClaimStore, id: u64) -> Result<bool, ClaimError> {
        Ok(store.towns.contains_key(keys::town(id))?)
    }
}

pub struct ResidenceFlags;

impl FlagKind for ResidenceFlags {
    const NAMESPACE: &'static str = "residence";
    type Tag = ResidenceFlag;

    fn entity_exists(store: &ClaimStore, id: u64) -> Result<bool, ClaimError> {
        Ok(store.residences.contains_key(keys::residence(id))?)
    }
}

/// Stored flag row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRecord<T> {
    pub id: u64,
    pub entity: u64,
    pub tag: T,
}

/// Flag operations for one entity kind.
pub struct FlagStore<'a, K: FlagKind> {
    store: &'a ClaimStore,
    _kind: PhantomData<K>,
}

impl<'a, K: FlagKind> FlagStore<'a, K> {
    pub fn new(store: &'a ClaimStore) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    fn key(entity: u64, tag: K::Tag) -> Vec<u8> {
        keys::flag(K::NAMESPACE, entity, tag.as_str())
    }

    pub fn has(&self, entity: u64, tag: K::Tag) -> Result<bool, ClaimError> {
        Ok(self.store.flags.contains_key(Self::key(entity, tag))?)
    }

    pub fn list(&self, entity: u64) -> Result<BTreeSet<K::Tag>, ClaimError> {
        let mut tags = BTreeSet::new();
        for entry in self
            .store
            .flags
            .scan_prefix(keys::flag_prefix(K::NAMESPACE, entity))
        {
            let (_, value) = entry?;
            let record: FlagRecord<K::Tag> = ClaimStore::deserialize(value)?;
            tags.insert(record.tag);
        }
        Ok(tags)
    }

    /// Set a flag. Returns `false` when it was already set.
    pub fn set(&self, entity: u64, tag: K::Tag) -> Result<bool, ClaimError> {
        if !K::entity_exists(self.store, entity)? {
            return Err(ClaimError::NotFound(format!("{}: {}", K::NAMESPACE, entity)));
        }
        let record = FlagRecord {
            id: self.store.next_id()?,
            entity,
            tag,
        };
        let bytes = ClaimStore::serialize(&record)?;
        let swapped = self.store.flags.compare_and_swap(
            Self::key(entity, tag),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        if swapped.is_ok() {
            self.store.flags.flush()?;
            debug!("{} {} flag {} set", K::NAMESPACE, entity, tag.as_str());
        }
        Ok(swapped.is_ok())
    }

    /// Clear a flag. Returns `false` when it was not set.
    pub fn remove(&self, entity: u64, tag: K::Tag) -> Result<bool, ClaimError> {
        let removed = self.store.flags.remove(Self::key(entity, tag))?;
        if removed.is_some() {
            self.store.flags.flush()?;
            debug!("{} {} flag {} removed", K::NAMESPACE, entity, tag.as_str());
        }
        Ok(removed.is_some())
    }

    /// Drop every flag of `entity`.
    pub fn clear(&self, entity: u64) -> Result<usize, ClaimError> {
        let mut removed = 0;
        for entry in self
            .store
            .flags
            .scan_prefix(keys::flag_prefix(K::NAMESPACE, entity))
        {
            let (key, _) = entry?;
            self.store.flags.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl ClaimStore {
    pub fn town_flags(&self) -> FlagStore<'_, TownFlags> {
        FlagStore::new(self)
    }

    pub fn residence_flags(&self) -> FlagStore<'_, ResidenceFlags> {
        FlagStore::new(self)
    }
}
