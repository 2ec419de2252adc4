//! # Townward - land claims and build permissions for block worlds
//!
//! Townward keeps track of who owns which part of a block-based world and
//! answers, for every edit, interaction or creature spawn, whether it may
//! happen.
//!
//! ## Features
//!
//! - **Towns**: grow cell by cell on a fixed grid; new cells must touch existing territory.
//! - **Residences**: inclusive boxes with an owner, members, flags, likes and a sale price.
//! - **Permission Resolver**: privileged override, residence conjunction, town tier, wildness allow-lists.
//! - **Sessions**: per-subject selections and two-phase confirm/cancel of costly actions.
//! - **Consistency Sweep**: background scan for orphaned rows reported through a callback.
//! - **Durable Storage**: sled trees with multi-tree transactions; nothing is half-applied.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use townward::claims::{ClaimStoreBuilder, Location, PermissionResolver};
//! use townward::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = ClaimStoreBuilder::new(config.storage.claims_db_path())
//!         .cell_size(config.rules.cell_size)
//!         .open()?;
//!
//!     let alice = store.resolve_subject("alice")?;
//!     let resolver = PermissionResolver::new(&store, &config);
//!     let allowed = resolver.can_place(alice, &Location::new("overworld", 10, 64, -3), "torch");
//!     println!("alice may place a torch: {}", allowed);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`claims`] - storage, indexes, resolver, sessions and sweep
//! - [`config`] - configuration loading and validation
//! - [`metrics`] - decision counters
//! - [`validation`] - name validation and log escaping

pub mod claims;
pub mod config;
pub mod metrics;
pub mod validation;
