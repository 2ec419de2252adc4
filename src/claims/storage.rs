use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::IVec;

use crate::claims::errors::ClaimError;
use crate::claims::types::{
    CellCoord, Residence, ResidenceId, SubjectId, SubjectRecord, Town, TownId,
    DEFAULT_CELL_SIZE, RESIDENCE_SCHEMA_VERSION, SUBJECT_SCHEMA_VERSION, TOWN_SCHEMA_VERSION,
};
use crate::validation::{escape_log, validate_claim_name};

const TREE_TOWNS: &str = "towns";
const TREE_TERRITORY: &str = "territory";
const TREE_RESIDENCES: &str = "residences";
const TREE_REGIONS: &str = "regions";
const TREE_FLAGS: &str = "flags";
const TREE_MEMBERSHIP: &str = "membership";
const TREE_SUBJECTS: &str = "subjects";

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, ClaimError>;

/// Key layouts for every tree. Ids are zero padded so prefix scans come back
/// in numeric order; world names are percent-encoded so they never contain
/// the `:` separator.
pub(crate) mod keys {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

    use crate::claims::types::CellCoord;

    pub fn world(world: &str) -> String {
        utf8_percent_encode(world, NON_ALPHANUMERIC).to_string()
    }

    pub fn name(name: &str) -> Vec<u8> {
        format!("name:{}", name.to_lowercase()).into_bytes()
    }

    pub fn town(id: u64) -> Vec<u8> {
        format!("town:{:020}", id).into_bytes()
    }

    pub fn cell(w: &str, cell: CellCoord) -> Vec<u8> {
        format!("cell:{}:{}:{}", world(w), cell.x, cell.z).into_bytes()
    }

    pub fn town_cell(town: u64, w: &str, cell: CellCoord) -> Vec<u8> {
        format!("town:{:020}:{}:{}:{}", town, world(w), cell.x, cell.z).into_bytes()
    }

    pub fn town_cell_prefix(town: u64) -> Vec<u8> {
        format!("town:{:020}:", town).into_bytes()
    }

    pub fn residence(id: u64) -> Vec<u8> {
        format!("res:{:020}", id).into_bytes()
    }

    pub fn area(residence: u64) -> Vec<u8> {
        format!("area:{:020}", residence).into_bytes()
    }

    pub fn column(w: &str, cell: CellCoord, residence: u64) -> Vec<u8> {
        let mut key = column_prefix(w, cell);
        key.extend_from_slice(format!("{:020}", residence).as_bytes());
        key
    }

    pub fn column_prefix(w: &str, cell: CellCoord) -> Vec<u8> {
        format!("col:{}:{}:{}:", world(w), cell.x, cell.z).into_bytes()
    }

    /// Areas too wide for the column index, one row per residence.
    pub fn wide_area(w: &str, residence: u64) -> Vec<u8> {
        format!("wide:{}:{:020}", world(w), residence).into_bytes()
    }

    pub fn wide_area_prefix(w: &str) -> Vec<u8> {
        format!("wide:{}:", world(w)).into_bytes()
    }

    pub fn flag(namespace: &str, entity: u64, tag: &str) -> Vec<u8> {
        format!("{}:{:020}:{}", namespace, entity, tag).into_bytes()
    }

    pub fn flag_prefix(namespace: &str, entity: u64) -> Vec<u8> {
        format!("{}:{:020}:", namespace, entity).into_bytes()
    }

    pub fn member(residence: u64, subject: u64) -> Vec<u8> {
        format!("member:{:020}:{:020}", residence, subject).into_bytes()
    }

    pub fn member_prefix(residence: u64) -> Vec<u8> {
        format!("member:{:020}:", residence).into_bytes()
    }

    pub fn primary_leader(town: u64) -> Vec<u8> {
        format!("leader:{:020}:primary", town).into_bytes()
    }

    pub fn co_leader(town: u64, subject: u64) -> Vec<u8> {
        format!("leader:{:020}:co:{:020}", town, subject).into_bytes()
    }

    pub fn co_leader_prefix(town: u64) -> Vec<u8> {
        format!("leader:{:020}:co:", town).into_bytes()
    }

    pub fn led_by(subject: u64, town: u64) -> Vec<u8> {
        format!("led:{:020}:{:020}", subject, town).into_bytes()
    }

    pub fn led_by_prefix(subject: u64) -> Vec<u8> {
        format!("led:{:020}:", subject).into_bytes()
    }

    pub fn like(residence: u64, subject: u64) -> Vec<u8> {
        format!("like:{:020}:{:020}", residence, subject).into_bytes()
    }

    pub fn like_prefix(residence: u64) -> Vec<u8> {
        format!("like:{:020}:", residence).into_bytes()
    }

    pub fn subject(id: u64) -> Vec<u8> {
        format!("subject:{:020}", id).into_bytes()
    }

    /// Parse the trailing zero-padded id of a key.
    pub fn trailing_id(key: &[u8]) -> Option<u64> {
        let text = std::str::from_utf8(key).ok()?;
        text.rsplit(':').next()?.parse().ok()
    }
}

pub(crate) fn encode_id(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub(crate) fn decode_id(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// Serialize inside a transaction closure.
pub(crate) fn tx_encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

/// Deserialize inside a transaction closure.
pub(crate) fn tx_decode<T: DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    bincode::deserialize(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

/// Abort the surrounding transaction with a domain error.
pub(crate) fn tx_abort<T>(err: ClaimError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct ClaimStoreBuilder {
    path: PathBuf,
    cell_size: i32,
}

impl ClaimStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell_size: DEFAULT_CELL_SIZE,
        }
    }

    /// Override the grid cell edge (blocks). Non-positive values are ignored.
    pub fn cell_size(mut self, cell_size: i32) -> Self {
        if cell_size > 0 {
            self.cell_size = cell_size;
        }
        self
    }

    pub fn open(self) -> Result<ClaimStore, ClaimError> {
        ClaimStore::open_with_options(self.path, self.cell_size)
    }
}

/// Sled-backed persistence for towns, residences and everything hanging off them.
pub struct ClaimStore {
    db: sled::Db,
    cell_size: i32,
    pub(crate) towns: sled::Tree,
    pub(crate) territory: sled::Tree,
    pub(crate) residences: sled::Tree,
    pub(crate) regions: sled::Tree,
    pub(crate) flags: sled::Tree,
    pub(crate) membership: sled::Tree,
    pub(crate) subjects: sled::Tree,
}

impl ClaimStore {
    /// Open (or create) the claims store rooted at `path` with 16-block cells.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ClaimError> {
        Self::open_with_options(path, DEFAULT_CELL_SIZE)
    }

    fn open_with_options<P: AsRef<Path>>(path: P, cell_size: i32) -> Result<Self, ClaimError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let store = Self {
            towns: db.open_tree(TREE_TOWNS)?,
            territory: db.open_tree(TREE_TERRITORY)?,
            residences: db.open_tree(TREE_RESIDENCES)?,
            regions: db.open_tree(TREE_REGIONS)?,
            flags: db.open_tree(TREE_FLAGS)?,
            membership: db.open_tree(TREE_MEMBERSHIP)?,
            subjects: db.open_tree(TREE_SUBJECTS)?,
            db,
            cell_size,
        };
        debug!("claims store opened at {}", path_ref.display());
        Ok(store)
    }

    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    /// Mint a fresh record id.
    pub(crate) fn next_id(&self) -> Result<u64, ClaimError> {
        // generate_id may hand out 0 on a fresh database; keep 0 free.
        Ok(self.db.generate_id()? + 1)
    }

    pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, ClaimError> {
        Ok(bincode::serialize(value)?)
    }

    pub(crate) fn deserialize<T: DeserializeOwned>(bytes: IVec) -> Result<T, ClaimError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    /// Flush every tree to disk.
    pub fn flush(&self) -> Result<(), ClaimError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_town(&self, id: TownId) -> Result<Town, ClaimError> {
        let Some(bytes) = self.towns.get(keys::town(id))? else {
            return Err(ClaimError::NotFound(format!("town: {}", id)));
        };
        let record: Town = Self::deserialize(bytes)?;
        if record.schema_version != TOWN_SCHEMA_VERSION {
            return Err(ClaimError::SchemaMismatch {
                entity: "town",
                expected: TOWN_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    /// Look a town up by name (case-insensitive).
    pub fn find_town(&self, name: &str) -> Result<Option<Town>, ClaimError> {
        match self.towns.get(keys::name(name))? {
            Some(bytes) => match decode_id(&bytes) {
                Some(id) => Ok(Some(self.get_town(id)?)),
                None => Err(ClaimError::Internal(format!("corrupt town name index for {}", name))),
            },
            None => Ok(None),
        }
    }

    pub fn list_town_ids(&self) -> Result<Vec<TownId>, ClaimError> {
        let mut ids = Vec::new();
        for entry in self.towns.scan_prefix(b"town:") {
            let (key, _) = entry?;
            if let Some(id) = keys::trailing_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Insert or update a town record; the name index follows renames.
    pub fn put_town(&self, mut town: Town) -> Result<(), ClaimError> {
        town.schema_version = TOWN_SCHEMA_VERSION;
        let name = validate_claim_name(&town.name)?;
        let town_bytes = Self::serialize(&town)?;
        let id = town.id;
        self.towns.transaction(|tx| -> TxResult<()> {
            if let Some(owner) = tx.get(keys::name(&name))? {
                if decode_id(&owner) != Some(id) {
                    return tx_abort(ClaimError::NameTaken(name.clone()));
                }
            }
            if let Some(previous) = tx.get(keys::town(id))? {
                let previous: Town = tx_decode(&previous)?;
                if previous.name.to_lowercase() != name.to_lowercase() {
                    tx.remove(keys::name(&previous.name))?;
                }
            }
            tx.insert(keys::name(&name), encode_id(id))?;
            tx.insert(keys::town(id), town_bytes.clone())?;
            Ok(())
        })?;
        self.towns.flush()?;
        Ok(())
    }

    pub fn get_residence(&self, id: ResidenceId) -> Result<Residence, ClaimError> {
        let Some(bytes) = self.residences.get(keys::residence(id))? else {
            return Err(ClaimError::NotFound(format!("residence: {}", id)));
        };
        let record: Residence = Self::deserialize(bytes)?;
        if record.schema_version != RESIDENCE_SCHEMA_VERSION {
            return Err(ClaimError::SchemaMismatch {
                entity: "residence",
                expected: RESIDENCE_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    pub fn find_residence(&self, name: &str) -> Result<Option<Residence>, ClaimError> {
        match self.residences.get(keys::name(name))? {
            Some(bytes) => match decode_id(&bytes) {
                Some(id) => Ok(Some(self.get_residence(id)?)),
                None => Err(ClaimError::Internal(format!(
                    "corrupt residence name index for {}",
                    name
                ))),
            },
            None => Ok(None),
        }
    }

    pub fn list_residences(&self) -> Result<Vec<Residence>, ClaimError> {
        let mut out = Vec::new();
        for entry in self.residences.scan_prefix(b"res:") {
            let (_, value) = entry?;
            out.push(Self::deserialize(value)?);
        }
        Ok(out)
    }

    /// Update an existing residence record (name index included).
    pub fn put_residence(&self, mut residence: Residence) -> Result<(), ClaimError> {
        residence.schema_version = RESIDENCE_SCHEMA_VERSION;
        let name = validate_claim_name(&residence.name)?;
        let bytes = Self::serialize(&residence)?;
        let id = residence.id;
        self.residences.transaction(|tx| -> TxResult<()> {
            if let Some(owner) = tx.get(keys::name(&name))? {
                if decode_id(&owner) != Some(id) {
                    return tx_abort(ClaimError::NameTaken(name.clone()));
                }
            }
            if let Some(previous) = tx.get(keys::residence(id))? {
                let previous: Residence = tx_decode(&previous)?;
                if previous.name.to_lowercase() != name.to_lowercase() {
                    tx.remove(keys::name(&previous.name))?;
                }
            }
            tx.insert(keys::name(&name), encode_id(id))?;
            tx.insert(keys::residence(id), bytes.clone())?;
            Ok(())
        })?;
        self.residences.flush()?;
        Ok(())
    }

    /// Resolve a display name to a stable subject id, creating the record on
    /// first sight.
    pub fn resolve_subject(&self, name: &str) -> Result<SubjectId, ClaimError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ClaimError::NotFound("subject: <empty>".to_string()));
        }
        if let Some(bytes) = self.subjects.get(keys::name(trimmed))? {
            if let Some(id) = decode_id(&bytes) {
                return Ok(id);
            }
        }
        let fresh = self.next_id()?;
        let record = SubjectRecord::new(fresh, trimmed);
        let bytes = Self::serialize(&record)?;
        let id = self.subjects.transaction(|tx| -> TxResult<u64> {
            // Another caller may have created the same name in between.
            if let Some(existing) = tx.get(keys::name(trimmed))? {
                if let Some(id) = decode_id(&existing) {
                    return Ok(id);
                }
            }
            tx.insert(keys::name(trimmed), encode_id(fresh))?;
            tx.insert(keys::subject(fresh), bytes.clone())?;
            Ok(fresh)
        })?;
        if id == fresh {
            debug!("registered subject {} as {}", escape_log(trimmed), id);
        }
        Ok(id)
    }

    pub fn get_subject(&self, id: SubjectId) -> Result<SubjectRecord, ClaimError> {
        let Some(bytes) = self.subjects.get(keys::subject(id))? else {
            return Err(ClaimError::NotFound(format!("subject: {}", id)));
        };
        let record: SubjectRecord = Self::deserialize(bytes)?;
        if record.schema_version != SUBJECT_SCHEMA_VERSION {
            return Err(ClaimError::SchemaMismatch {
                entity: "subject",
                expected: SUBJECT_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        Ok(record)
    }

    pub fn put_subject(&self, mut subject: SubjectRecord) -> Result<(), ClaimError> {
        subject.schema_version = SUBJECT_SCHEMA_VERSION;
        let bytes = Self::serialize(&subject)?;
        self.subjects.insert(keys::subject(subject.id), bytes)?;
        self.subjects.flush()?;
        Ok(())
    }

    /// Change a subject's privilege level.
    pub fn set_level(&self, id: SubjectId, level: u8) -> Result<(), ClaimError> {
        let mut subject = self.get_subject(id)?;
        subject.level = level;
        self.put_subject(subject)
    }

    /// Display name of a subject, falling back to its id.
    pub fn subject_name(&self, id: SubjectId) -> String {
        match self.get_subject(id) {
            Ok(record) => record.name,
            Err(_) => format!("#{}", id),
        }
    }

    pub fn count_towns(&self) -> usize {
        self.towns.scan_prefix(b"town:").count()
    }

    pub fn count_residences(&self) -> usize {
        self.residences.scan_prefix(b"res:").count()
    }

    pub fn count_cells(&self) -> usize {
        self.territory.scan_prefix(b"cell:").count()
    }

    pub fn count_subjects(&self) -> usize {
        self.subjects.scan_prefix(b"subject:").count()
    }

    /// Grid cell holding a block coordinate under this store's cell size.
    pub fn cell_at(&self, x: i32, z: i32) -> CellCoord {
        CellCoord::new(x.div_euclid(self.cell_size), z.div_euclid(self.cell_size))
    }
}
