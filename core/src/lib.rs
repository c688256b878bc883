//! XP ledger core: turns an append-only stream of task completions into
//! per-user skill-pillar XP and subject credit, derives mastery levels and
//! achievement tiers, and reconciles the materialized totals against the
//! ledger.
//!
//! Layering (leaves first):
//!   category, distribution, mastery  : pure
//!   store                            : SQLite, the only module with SQL
//!   aggregation                      : ledger → authoritative totals
//!   award, reconciliation            : the two writers of the aggregates
//!   service                          : wiring and read surface

pub mod aggregation;
pub mod award;
pub mod category;
pub mod clock;
pub mod config;
pub mod distribution;
pub mod error;
pub mod event;
pub mod mastery;
pub mod reconciliation;
pub mod service;
pub mod store;
pub mod types;
