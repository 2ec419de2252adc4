//! Land claims: towns holding grid cells, residences holding boxes, and the
//! permission resolver that turns both into yes/no answers.
//!
//! ## Components
//!
//! - [`storage`] - sled-backed [`ClaimStore`] and the subject directory
//! - [`territory`] - cell ownership with the contiguity rule
//! - [`region`] - residence boxes and point/cube queries
//! - [`flags`] - boolean capability tags for towns and residences
//! - [`membership`] - members, inhabitants, leaders, likes
//! - [`estate`] - founding towns, treasury, buying cells and residences
//! - [`permission`] - the decision algorithm
//! - [`session`] - per-subject selections and pending confirmations
//! - [`sweep`] - background consistency scan

pub mod errors;
pub mod estate;
pub mod flags;
pub mod membership;
pub mod permission;
pub mod region;
pub mod roles;
pub mod session;
pub mod storage;
pub mod sweep;
pub mod territory;
pub mod types;

pub use errors::ClaimError;
pub use estate::CellPurchase;
pub use flags::{FlagStore, FlagTag, ResidenceFlag, TownFlag};
pub use permission::{Decision, PermissionResolver, Reason};
pub use session::{
    ActionExecutor, ActionOutcome, Activator, PendingAction, PendingTask, Session,
    SessionRegistry, SessionState, StoreExecutor, Target,
};
pub use storage::{ClaimStore, ClaimStoreBuilder};
pub use territory::ClaimOutcome;
pub use types::{
    ActionKind, BlockPos, CellCoord, Location, Residence, ResidenceArea, ResidenceId,
    SpawnReason, SubjectId, SubjectRecord, Town, TownChunk, TownId,
};
