use thiserror::Error;

use crate::claims::types::{ResidenceId, TownId};
use crate::validation::NameError;

/// Errors that can arise while interacting with the claims storage layer.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A claimed cell does not touch the town's existing territory.
    #[error("cell {x},{z} in {world} is not adjacent to territory of town {town}")]
    Contiguity {
        town: TownId,
        world: String,
        x: i32,
        z: i32,
    },

    /// No current town/residence could be determined for the subject.
    #[error("unresolved selection: {0}")]
    UnresolvedSelection(String),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Treasury or balance too low for a debit.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    /// A town or residence with that name already exists.
    #[error("name already taken: {0}")]
    NameTaken(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// The requested box intersects another residence.
    #[error("area overlaps residence {residence}")]
    Overlap { residence: ResidenceId },

    /// Amounts moved in or out of a treasury must be positive; prices must
    /// not be negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The residence is not on the market, or the buyer already owns it.
    #[error("residence {0} is not for sale")]
    NotForSale(ResidenceId),

    /// Confirm was issued with nothing awaiting confirmation.
    #[error("nothing pending")]
    NothingPending,

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// Internal error (task join errors, unexpected conditions)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sled::transaction::TransactionError<ClaimError>> for ClaimError {
    fn from(err: sled::transaction::TransactionError<ClaimError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => ClaimError::Sled(inner),
        }
    }
}
