use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::claims::errors::ClaimError;
use crate::claims::estate::CellPurchase;
use crate::claims::storage::ClaimStore;
use crate::claims::types::{
    BlockPos, CellCoord, Location, Residence, ResidenceArea, ResidenceId, SubjectId, TownId,
};
use crate::config::Config;

/// What fires a pending task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Activator {
    /// An explicit confirm.
    Confirm,
    /// The next designated target (sign click or selection command).
    SignClick,
}

/// An operation parked until the subject confirms or designates a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PendingAction {
    BuyCells {
        town: TownId,
        world: String,
        cells: Vec<CellCoord>,
    },
    BuyResidence {
        residence: ResidenceId,
    },
    RedefineArea {
        residence: ResidenceId,
        world: String,
        low: BlockPos,
        high: BlockPos,
    },
    TransferLeadership {
        town: TownId,
        to: SubjectId,
    },
    /// Uses the sign the subject designates (or has selected).
    AttachSign {
        residence: ResidenceId,
    },
}

impl PendingAction {
    pub fn label(&self) -> &'static str {
        match self {
            PendingAction::BuyCells { .. } => "buy-cells",
            PendingAction::BuyResidence { .. } => "buy-residence",
            PendingAction::RedefineArea { .. } => "redefine-area",
            PendingAction::TransferLeadership { .. } => "transfer-leadership",
            PendingAction::AttachSign { .. } => "attach-sign",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTask {
    pub activator: Activator,
    pub action: PendingAction,
}

impl PendingTask {
    pub fn on_confirm(action: PendingAction) -> Self {
        Self {
            activator: Activator::Confirm,
            action,
        }
    }

    pub fn on_sign_click(action: PendingAction) -> Self {
        Self {
            activator: Activator::SignClick,
            action,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingSignSelection,
    AwaitingConfirmation,
}

/// Something a subject can point at.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Sign(Location),
    Town(TownId),
    Residence(ResidenceId),
}

/// Result of running a pending action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    CellsBought(CellPurchase),
    ResidenceBought(Residence),
    AreaRedefined(ResidenceArea),
    LeadershipTransferred { town: TownId, to: SubjectId },
    SignAttached { residence: ResidenceId, sign: Location },
}

/// Runs pending actions on behalf of a subject.
pub trait ActionExecutor {
    /// `sign` is the sign the subject has selected, if any.
    fn execute(
        &self,
        subject: SubjectId,
        action: &PendingAction,
        sign: Option<&Location>,
    ) -> Result<ActionOutcome, ClaimError>;
}

/// Executor backed by the claims store; cell prices come from the world rules.
pub struct StoreExecutor<'a> {
    store: &'a ClaimStore,
    config: &'a Config,
}

impl<'a> StoreExecutor<'a> {
    pub fn new(store: &'a ClaimStore, config: &'a Config) -> Self {
        Self { store, config }
    }
}

impl ActionExecutor for StoreExecutor<'_> {
    fn execute(
        &self,
        subject: SubjectId,
        action: &PendingAction,
        sign: Option<&Location>,
    ) -> Result<ActionOutcome, ClaimError> {
        match action {
            PendingAction::BuyCells { town, world, cells } => {
                let price = self.config.rules_for(world).chunk_price;
                let purchase = self.store.buy_cells(*town, world, cells, price)?;
                Ok(ActionOutcome::CellsBought(purchase))
            }
            PendingAction::BuyResidence { residence } => {
                let bought = self.store.buy_residence(*residence, subject)?;
                Ok(ActionOutcome::ResidenceBought(bought))
            }
            PendingAction::RedefineArea {
                residence,
                world,
                low,
                high,
            } => {
                let area = self.store.redefine_area(*residence, world, *low, *high)?;
                Ok(ActionOutcome::AreaRedefined(area))
            }
            PendingAction::TransferLeadership { town, to } => {
                self.store.set_leader(*town, *to, false)?;
                Ok(ActionOutcome::LeadershipTransferred {
                    town: *town,
                    to: *to,
                })
            }
            PendingAction::AttachSign { residence } => {
                let Some(sign) = sign else {
                    return Err(ClaimError::UnresolvedSelection(
                        "no sign selected".to_string(),
                    ));
                };
                self.store.attach_sign(*residence, sign.clone())?;
                Ok(ActionOutcome::SignAttached {
                    residence: *residence,
                    sign: sign.clone(),
                })
            }
        }
    }
}

/// # Selection Session
///
/// Short-lived, per-subject state: what the subject last pointed at and at
/// most one task waiting to be fired. Never persisted.
///
/// ## States
///
/// 1. **Idle** - nothing pending
/// 2. **AwaitingSignSelection** - the next designated target fires the task
/// 3. **AwaitingConfirmation** - only confirm or cancel leave this state
///
/// Parking a new task replaces the old one; there is no queue.
#[derive(Debug, Clone)]
pub struct Session {
    pub subject: SubjectId,
    pub selected_sign: Option<Location>,
    pub selected_town: Option<TownId>,
    pub selected_residence: Option<ResidenceId>,
    pub debug: bool,
    pub pending: Option<PendingTask>,
    pub opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(subject: SubjectId) -> Self {
        Self {
            subject,
            selected_sign: None,
            selected_town: None,
            selected_residence: None,
            debug: false,
            pending: None,
            opened_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.pending {
            None => SessionState::Idle,
            Some(task) => match task.activator {
                Activator::Confirm => SessionState::AwaitingConfirmation,
                Activator::SignClick => SessionState::AwaitingSignSelection,
            },
        }
    }

    fn designate(&mut self, target: Target) {
        match target {
            Target::Sign(loc) => self.selected_sign = Some(loc),
            Target::Town(town) => self.selected_town = Some(town),
            Target::Residence(residence) => self.selected_residence = Some(residence),
        }
    }
}

/// Sessions of connected subjects. Created when the service starts; entries
/// appear on first access and go away on [`SessionRegistry::close`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SubjectId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session of `subject`, created on demand.
    pub fn get(&mut self, subject: SubjectId) -> &mut Session {
        self.sessions.entry(subject).or_insert_with(|| {
            debug!("session opened for subject {}", subject);
            Session::new(subject)
        })
    }

    pub fn peek(&self, subject: SubjectId) -> Option<&Session> {
        self.sessions.get(&subject)
    }

    /// Drop the session on disconnect, pending task included.
    pub fn close(&mut self, subject: SubjectId) -> Option<Session> {
        let closed = self.sessions.remove(&subject);
        if let Some(session) = &closed {
            if let Some(task) = &session.pending {
                info!(
                    "subject {} disconnected with {} pending",
                    subject,
                    task.action.label()
                );
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Park a task, replacing any task already waiting. Returns the replaced one.
    pub fn set_pending(&mut self, subject: SubjectId, task: PendingTask) -> Option<PendingTask> {
        let session = self.get(subject);
        let replaced = session.pending.replace(task);
        if let Some(old) = &replaced {
            debug!(
                "subject {} replaced pending {} with {}",
                subject,
                old.action.label(),
                session
                    .pending
                    .as_ref()
                    .map(|t| t.action.label())
                    .unwrap_or_default()
            );
        }
        replaced
    }

    /// Run the task waiting for confirmation. The task leaves the session
    /// before it runs, so it fires at most once whatever the outcome.
    pub fn confirm(
        &mut self,
        subject: SubjectId,
        executor: &dyn ActionExecutor,
    ) -> Result<ActionOutcome, ClaimError> {
        let session = self.get(subject);
        if session.state() != SessionState::AwaitingConfirmation {
            return Err(ClaimError::NothingPending);
        }
        let Some(task) = session.pending.take() else {
            return Err(ClaimError::NothingPending);
        };
        let sign = session.selected_sign.clone();
        info!("subject {} confirmed {}", subject, task.action.label());
        executor.execute(subject, &task.action, sign.as_ref())
    }

    /// Discard the pending task. Returns whether there was one.
    pub fn cancel(&mut self, subject: SubjectId) -> bool {
        let cancelled = self.get(subject).pending.take();
        if let Some(task) = &cancelled {
            debug!("subject {} cancelled {}", subject, task.action.label());
        }
        cancelled.is_some()
    }

    /// Record a designated target. A task waiting for a sign click fires
    /// right away and the session returns to idle.
    pub fn designate(
        &mut self,
        subject: SubjectId,
        target: Target,
        executor: &dyn ActionExecutor,
    ) -> Result<Option<ActionOutcome>, ClaimError> {
        let session = self.get(subject);
        session.designate(target);
        if session.state() != SessionState::AwaitingSignSelection {
            return Ok(None);
        }
        let Some(task) = session.pending.take() else {
            return Ok(None);
        };
        let sign = session.selected_sign.clone();
        executor
            .execute(subject, &task.action, sign.as_ref())
            .map(Some)
    }

    pub fn select_sign(
        &mut self,
        subject: SubjectId,
        sign: Location,
        executor: &dyn ActionExecutor,
    ) -> Result<Option<ActionOutcome>, ClaimError> {
        self.designate(subject, Target::Sign(sign), executor)
    }

    pub fn select_town(
        &mut self,
        subject: SubjectId,
        town: TownId,
        executor: &dyn ActionExecutor,
    ) -> Result<Option<ActionOutcome>, ClaimError> {
        self.designate(subject, Target::Town(town), executor)
    }

    pub fn select_residence(
        &mut self,
        subject: SubjectId,
        residence: ResidenceId,
        executor: &dyn ActionExecutor,
    ) -> Result<Option<ActionOutcome>, ClaimError> {
        self.designate(subject, Target::Residence(residence), executor)
    }

    pub fn set_debug(&mut self, subject: SubjectId, on: bool) {
        self.get(subject).debug = on;
    }

    /// Explicitly selected town, else the only town the subject leads.
    pub fn current_town(
        &mut self,
        subject: SubjectId,
        store: &ClaimStore,
    ) -> Result<TownId, ClaimError> {
        if let Some(town) = self.get(subject).selected_town {
            return Ok(town);
        }
        match store.towns_led_by(subject)?.as_slice() {
            [town] => Ok(*town),
            [] => Err(ClaimError::UnresolvedSelection(
                "no town selected and none led".to_string(),
            )),
            many => Err(ClaimError::UnresolvedSelection(format!(
                "no town selected and {} towns led",
                many.len()
            ))),
        }
    }

    /// Explicitly selected residence, else the only residence the subject owns.
    pub fn current_residence(
        &mut self,
        subject: SubjectId,
        store: &ClaimStore,
    ) -> Result<ResidenceId, ClaimError> {
        if let Some(residence) = self.get(subject).selected_residence {
            return Ok(residence);
        }
        let owned: Vec<ResidenceId> = store
            .list_residences()?
            .into_iter()
            .filter(|r| r.owner == Some(subject))
            .map(|r| r.id)
            .collect();
        match owned.as_slice() {
            [residence] => Ok(*residence),
            [] => Err(ClaimError::UnresolvedSelection(
                "no residence selected and none owned".to_string(),
            )),
            many => Err(ClaimError::UnresolvedSelection(format!(
                "no residence selected and {} residences owned",
                many.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records every action it is asked to run.
    #[derive(Default)]
    struct Recorder {
        runs: RefCell<Vec<PendingAction>>,
    }

    impl ActionExecutor for Recorder {
        fn execute(
            &self,
            _subject: SubjectId,
            action: &PendingAction,
            sign: Option<&Location>,
        ) -> Result<ActionOutcome, ClaimError> {
            self.runs.borrow_mut().push(action.clone());
            Ok(ActionOutcome::SignAttached {
                residence: 0,
                sign: sign.cloned().unwrap_or_else(|| Location::new("w", 0, 0, 0)),
            })
        }
    }

    #[test]
    fn sessions_are_created_on_demand_and_closed() {
        let mut registry = SessionRegistry::new();
        assert!(registry.peek(7).is_none());
        assert_eq!(registry.get(7).state(), SessionState::Idle);
        assert_eq!(registry.len(), 1);
        registry.close(7);
        assert!(registry.is_empty());
    }

    #[test]
    fn second_confirmation_task_replaces_the_first() {
        let mut registry = SessionRegistry::new();
        let recorder = Recorder::default();
        let first = PendingAction::BuyResidence { residence: 1 };
        let second = PendingAction::BuyResidence { residence: 2 };

        assert!(registry
            .set_pending(3, PendingTask::on_confirm(first.clone()))
            .is_none());
        let replaced = registry.set_pending(3, PendingTask::on_confirm(second.clone()));
        assert_eq!(replaced.map(|t| t.action), Some(first));

        registry.confirm(3, &recorder).expect("confirm");
        assert!(matches!(
            registry.confirm(3, &recorder),
            Err(ClaimError::NothingPending)
        ));
        assert_eq!(*recorder.runs.borrow(), vec![second]);
        assert_eq!(registry.get(3).state(), SessionState::Idle);
    }

    #[test]
    fn cancel_discards_without_running() {
        let mut registry = SessionRegistry::new();
        let recorder = Recorder::default();
        registry.set_pending(
            3,
            PendingTask::on_confirm(PendingAction::TransferLeadership { town: 1, to: 2 }),
        );
        assert!(registry.cancel(3));
        assert!(!registry.cancel(3));
        assert!(registry.confirm(3, &recorder).is_err());
        assert!(recorder.runs.borrow().is_empty());
    }

    #[test]
    fn designating_fires_a_sign_click_task() {
        let mut registry = SessionRegistry::new();
        let recorder = Recorder::default();
        registry.set_pending(
            5,
            PendingTask::on_sign_click(PendingAction::AttachSign { residence: 9 }),
        );
        assert_eq!(registry.get(5).state(), SessionState::AwaitingSignSelection);
        assert!(matches!(
            registry.confirm(5, &recorder),
            Err(ClaimError::NothingPending)
        ));

        let sign = Location::new("w", 4, 70, 4);
        let outcome = registry
            .select_sign(5, sign.clone(), &recorder)
            .expect("designate");
        assert!(matches!(
            outcome,
            Some(ActionOutcome::SignAttached { sign: s, .. }) if s == sign
        ));
        assert_eq!(registry.get(5).state(), SessionState::Idle);
        assert_eq!(registry.get(5).selected_sign, Some(sign));

        assert_eq!(
            registry.select_town(5, 1, &recorder).expect("plain select"),
            None
        );
        assert_eq!(recorder.runs.borrow().len(), 1);
    }

    #[test]
    fn confirmation_task_ignores_designations() {
        let mut registry = SessionRegistry::new();
        let recorder = Recorder::default();
        registry.set_pending(
            5,
            PendingTask::on_confirm(PendingAction::BuyResidence { residence: 4 }),
        );
        registry
            .select_residence(5, 4, &recorder)
            .expect("designate");
        assert_eq!(registry.get(5).state(), SessionState::AwaitingConfirmation);
        assert!(recorder.runs.borrow().is_empty());
    }
}
