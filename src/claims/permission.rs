//! Permission resolver: yes/no answers for place, destroy, interact and spawn.
//!
//! Decision order for edits, first match wins:
//! 1. trusted players and administrators;
//! 2. residences at or within the overlay distance of the target; every one
//!    of them has to accept the subject;
//! 3. the town owning the cell: its build flag, its leaders, or the town
//!    allow-list for the material;
//! 4. the wildness allow-list.
//!
//! Interaction only consults the residence containing the point. Creature
//! spawns look at the spawner policy and the `mob-spawning` flag.
//!
//! The resolver never fails. A missing residence or town is ordinary data; a
//! storage error denies the action and is logged.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, error};

use crate::claims::errors::ClaimError;
use crate::claims::flags::{ResidenceFlag, TownFlag};
use crate::claims::roles::is_privileged;
use crate::claims::storage::ClaimStore;
use crate::claims::types::{
    ActionKind, Location, Residence, ResidenceId, SpawnReason, SubjectId, TownId,
};
use crate::config::{Config, WorldRules};
use crate::metrics;

/// Which rule settled a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Privileged,
    /// Every residence in reach accepted the subject.
    ResidenceAccepted { residence: ResidenceId },
    /// This residence refused the subject.
    ResidenceRefused { residence: ResidenceId },
    TownBuildFlag { town: TownId },
    TownLeader { town: TownId },
    TownAllowList { town: TownId },
    TownRefused { town: TownId },
    WildAllowList,
    WildRefused,
    /// No residence claims the point.
    Unclaimed,
    SpawnerDenied,
    MobSpawningAllowed { residence: ResidenceId },
    MobSpawningRefused { residence: ResidenceId },
    LookupFailed,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Privileged => write!(f, "privileged subject"),
            Reason::ResidenceAccepted { residence } => {
                write!(f, "accepted by residence {}", residence)
            }
            Reason::ResidenceRefused { residence } => write!(f, "refused by residence {}", residence),
            Reason::TownBuildFlag { town } => write!(f, "town {} has building open", town),
            Reason::TownLeader { town } => write!(f, "leader of town {}", town),
            Reason::TownAllowList { town } => write!(f, "material allowed in town {}", town),
            Reason::TownRefused { town } => write!(f, "refused by town {}", town),
            Reason::WildAllowList => write!(f, "material allowed in the wildness"),
            Reason::WildRefused => write!(f, "material not allowed in the wildness"),
            Reason::Unclaimed => write!(f, "no residence claims this spot"),
            Reason::SpawnerDenied => write!(f, "spawner spawns are denied in this world"),
            Reason::MobSpawningAllowed { residence } => {
                write!(f, "residence {} allows mob spawning", residence)
            }
            Reason::MobSpawningRefused { residence } => {
                write!(f, "residence {} forbids mob spawning", residence)
            }
            Reason::LookupFailed => write!(f, "ownership lookup failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: ActionKind,
    pub allowed: bool,
    pub reason: Reason,
}

impl Decision {
    fn allow(action: ActionKind, reason: Reason) -> Self {
        Self {
            action,
            allowed: true,
            reason,
        }
    }

    fn deny(action: ActionKind, reason: Reason) -> Self {
        Self {
            action,
            allowed: false,
            reason,
        }
    }
}

fn listed(list: &BTreeSet<String>, material: &str) -> bool {
    list.iter().any(|m| m.eq_ignore_ascii_case(material))
}

/// Stateless resolver over the store and the world rules.
pub struct PermissionResolver<'a> {
    store: &'a ClaimStore,
    config: &'a Config,
}

impl<'a> PermissionResolver<'a> {
    pub fn new(store: &'a ClaimStore, config: &'a Config) -> Self {
        Self { store, config }
    }

    pub fn can_place(&self, subject: SubjectId, loc: &Location, material: &str) -> bool {
        self.decide_edit(ActionKind::Place, subject, loc, material).allowed
    }

    pub fn can_destroy(&self, subject: SubjectId, loc: &Location, material: &str) -> bool {
        self.decide_edit(ActionKind::Destroy, subject, loc, material).allowed
    }

    pub fn can_interact(&self, subject: SubjectId, loc: &Location) -> bool {
        self.decide_interact(subject, loc).allowed
    }

    pub fn can_spawn(&self, subject: Option<SubjectId>, loc: &Location, reason: SpawnReason) -> bool {
        self.decide_spawn(subject, loc, reason).allowed
    }

    /// Place or destroy decision with its reason.
    pub fn decide_edit(
        &self,
        action: ActionKind,
        subject: SubjectId,
        loc: &Location,
        material: &str,
    ) -> Decision {
        let result = self.try_edit(action, subject, loc, material);
        self.settle(action, subject, loc, result)
    }

    pub fn decide_interact(&self, subject: SubjectId, loc: &Location) -> Decision {
        let result = self.try_interact(subject, loc);
        self.settle(ActionKind::Interact, subject, loc, result)
    }

    pub fn decide_spawn(
        &self,
        subject: Option<SubjectId>,
        loc: &Location,
        reason: SpawnReason,
    ) -> Decision {
        let result = self.try_spawn(loc, reason);
        self.settle(ActionKind::Spawn, subject.unwrap_or_default(), loc, result)
    }

    /// Residence predicate shared by edits and interaction: public flag,
    /// membership, or local flag plus inhabitancy of the residence's town.
    pub fn can_act_on_residence(
        &self,
        residence: &Residence,
        subject: SubjectId,
    ) -> Result<bool, ClaimError> {
        let flags = self.store.residence_flags();
        if flags.has(residence.id, ResidenceFlag::Public)? {
            return Ok(true);
        }
        if self.store.is_member(residence.id, subject)? {
            return Ok(true);
        }
        if let Some(town) = residence.town {
            if flags.has(residence.id, ResidenceFlag::Local)?
                && self.store.is_inhabitant(town, subject)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn rules(&self, loc: &Location) -> &WorldRules {
        self.config.rules_for(&loc.world)
    }

    fn privileged(&self, subject: SubjectId) -> Result<bool, ClaimError> {
        match self.store.get_subject(subject) {
            Ok(record) => Ok(is_privileged(record.level)),
            Err(ClaimError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Conjunction over every residence in `residences`; `None` when the
    /// list is empty.
    fn judge_residences(
        &self,
        action: ActionKind,
        residences: &[Residence],
        subject: SubjectId,
    ) -> Result<Option<Decision>, ClaimError> {
        let Some(first) = residences.first() else {
            return Ok(None);
        };
        for residence in residences {
            if !self.can_act_on_residence(residence, subject)? {
                return Ok(Some(Decision::deny(
                    action,
                    Reason::ResidenceRefused {
                        residence: residence.id,
                    },
                )));
            }
        }
        Ok(Some(Decision::allow(
            action,
            Reason::ResidenceAccepted {
                residence: first.id,
            },
        )))
    }

    fn try_edit(
        &self,
        action: ActionKind,
        subject: SubjectId,
        loc: &Location,
        material: &str,
    ) -> Result<Decision, ClaimError> {
        if self.privileged(subject)? {
            return Ok(Decision::allow(action, Reason::Privileged));
        }
        let rules = self.rules(loc);

        let nearby = self.store.residences_near(loc, rules.overlay_distance)?;
        if let Some(decision) = self.judge_residences(action, &nearby, subject)? {
            return Ok(decision);
        }

        let (town_list, wild_list) = match action {
            ActionKind::Destroy => (&rules.town_destroy, &rules.wild_destroy),
            _ => (&rules.town_place, &rules.wild_place),
        };

        let cell = loc.cell(self.store.cell_size());
        match self.store.owner_of(&loc.world, cell)? {
            Some(town) => {
                if self
                    .store
                    .town_flags()
                    .has(town.id, TownFlag::CanBuildByInhabitants)?
                {
                    return Ok(Decision::allow(action, Reason::TownBuildFlag { town: town.id }));
                }
                if self.store.is_leader(town.id, subject)? {
                    return Ok(Decision::allow(action, Reason::TownLeader { town: town.id }));
                }
                if listed(town_list, material) {
                    return Ok(Decision::allow(action, Reason::TownAllowList { town: town.id }));
                }
                Ok(Decision::deny(action, Reason::TownRefused { town: town.id }))
            }
            None => {
                if listed(wild_list, material) {
                    Ok(Decision::allow(action, Reason::WildAllowList))
                } else {
                    Ok(Decision::deny(action, Reason::WildRefused))
                }
            }
        }
    }

    fn try_interact(&self, subject: SubjectId, loc: &Location) -> Result<Decision, ClaimError> {
        let action = ActionKind::Interact;
        if self.privileged(subject)? {
            return Ok(Decision::allow(action, Reason::Privileged));
        }
        let containing = self.store.residences_near(loc, 0)?;
        Ok(self
            .judge_residences(action, &containing, subject)?
            .unwrap_or_else(|| Decision::allow(action, Reason::Unclaimed)))
    }

    fn try_spawn(&self, loc: &Location, reason: SpawnReason) -> Result<Decision, ClaimError> {
        let action = ActionKind::Spawn;
        if reason.is_artificial_spawner() && self.rules(loc).deny_spawner_spawns {
            return Ok(Decision::deny(action, Reason::SpawnerDenied));
        }
        match self.store.residence_at(loc)? {
            None => Ok(Decision::allow(action, Reason::Unclaimed)),
            Some(residence) => {
                if self
                    .store
                    .residence_flags()
                    .has(residence.id, ResidenceFlag::MobSpawning)?
                {
                    Ok(Decision::allow(
                        action,
                        Reason::MobSpawningAllowed {
                            residence: residence.id,
                        },
                    ))
                } else {
                    Ok(Decision::deny(
                        action,
                        Reason::MobSpawningRefused {
                            residence: residence.id,
                        },
                    ))
                }
            }
        }
    }

    fn settle(
        &self,
        action: ActionKind,
        subject: SubjectId,
        loc: &Location,
        result: Result<Decision, ClaimError>,
    ) -> Decision {
        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    "{} check for subject {} at {} {:?} failed: {}",
                    action.as_str(),
                    subject,
                    loc.world,
                    loc.pos,
                    e
                );
                metrics::inc_lookup_failures();
                Decision::deny(action, Reason::LookupFailed)
            }
        };
        metrics::record_decision(action, decision.allowed);
        debug!(
            "{} by {} at {} {:?}: {} ({})",
            action.as_str(),
            subject,
            loc.world,
            loc.pos,
            if decision.allowed { "allowed" } else { "denied" },
            decision.reason
        );
        decision
    }
}
