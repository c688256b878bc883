//! The XP service: wiring point and read surface of the engine.
//!
//! RULES:
//!   - Constructed once at start-up from an explicit config, clock and
//!     store handle. No module-level singletons.
//!   - Dashboards read through this type only. Reads never write.
//!   - Mastery and tiers are recomputed from stored totals on every read,
//!     so an award is visible on the next read with nothing to invalidate.

use crate::{
    aggregation::AggregationEngine,
    award::{AwardResult, XpAwardCoordinator},
    category::{Category, CategoryKind, CategoryResolver, Pillar, Subject},
    clock::{Clock, SystemClock},
    config::EngineConfig,
    error::XpResult,
    event::CompletionEvent,
    mastery::{self, AchievementTier, MasteryLevel, NextTierInfo},
    reconciliation::{ReconcileMode, ReconcileScope, ReconciliationReport, ReconciliationService},
    store::{AggregateStore, CompletionLedger, XpStore},
    types::Xp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id:            String,
    pub total_xp:           Xp,
    pub xp_by_pillar:       BTreeMap<Pillar, Xp>,
    pub credits_by_subject: BTreeMap<Subject, Xp>,
    pub mastery:            MasteryLevel,
    pub achievement_tier:   AchievementTier,
    pub next_tier:          Option<NextTierInfo>,
    pub tier_progress_pct:  f64,
}

pub struct XpService {
    engine:         Arc<AggregationEngine>,
    awards:         XpAwardCoordinator,
    reconciliation: ReconciliationService,
    store:          Arc<dyn AggregateStore>,
}

impl XpService {
    /// Wire the engine over a SQLite store.
    pub fn build(config: &EngineConfig, store: Arc<XpStore>, clock: Arc<dyn Clock>) -> XpResult<Self> {
        Self::build_with(config, store.clone(), store, clock)
    }

    /// Wire the engine over any ledger / aggregate store pair.
    pub fn build_with(
        config: &EngineConfig,
        ledger: Arc<dyn CompletionLedger>,
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
    ) -> XpResult<Self> {
        let resolver = Arc::new(CategoryResolver::from_config(&config.categories)?);
        let engine = Arc::new(AggregationEngine::new(resolver, ledger.clone()));

        let awards = XpAwardCoordinator::new(
            engine.clone(),
            ledger.clone(),
            store.clone(),
            clock.clone(),
            config.award.clone(),
        );
        let reconciliation = ReconciliationService::new(
            engine.clone(),
            ledger,
            store.clone(),
            clock,
            config.reconciliation.clone(),
        );

        Ok(Self { engine, awards, reconciliation, store })
    }

    /// Test wiring: default_test config, system clock.
    pub fn build_test(store: Arc<XpStore>) -> XpResult<Self> {
        Self::build(&EngineConfig::default_test(), store, Arc::new(SystemClock))
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    pub fn awards(&self) -> &XpAwardCoordinator {
        &self.awards
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    // ── Write path ─────────────────────────────────────────────────

    pub fn award(&self, event: &CompletionEvent) -> XpResult<AwardResult> {
        self.awards.award(event)
    }

    // ── Operations ─────────────────────────────────────────────────

    /// One user, or every stale user when `user_id` is None.
    /// Apply runs without reduction sign-off; use `reconcile_with` for that.
    pub fn reconcile(&self, user_id: Option<&str>, dry_run: bool) -> XpResult<ReconciliationReport> {
        let scope = match user_id {
            Some(id) => ReconcileScope::User(id.to_string()),
            None => ReconcileScope::Stale,
        };
        self.reconciliation
            .reconcile(&scope, ReconcileMode::from_dry_run(dry_run), false)
    }

    pub fn reconcile_with(
        &self,
        scope: &ReconcileScope,
        mode: ReconcileMode,
        confirm_reductions: bool,
    ) -> XpResult<ReconciliationReport> {
        self.reconciliation.reconcile(scope, mode, confirm_reductions)
    }

    // ── Read surface ───────────────────────────────────────────────

    /// Stored pillar XP, zero-filled for pillars with no row.
    pub fn get_xp_by_pillar(&self, user_id: &str) -> XpResult<BTreeMap<Pillar, Xp>> {
        let mut out: BTreeMap<Pillar, Xp> = Pillar::ALL.iter().map(|p| (*p, 0)).collect();
        for record in self.store.records(CategoryKind::Pillar, user_id)? {
            match Category::from_stored(CategoryKind::Pillar, &record.category) {
                Some(Category::Pillar(p)) => *out.entry(p).or_insert(0) += record.xp_amount,
                _ => log::debug!(
                    "user={user_id} ignoring non-canonical pillar row '{}'",
                    record.category
                ),
            }
        }
        Ok(out)
    }

    /// Stored subject credit, zero-filled for subjects with no row.
    pub fn get_credits_by_subject(&self, user_id: &str) -> XpResult<BTreeMap<Subject, Xp>> {
        let mut out: BTreeMap<Subject, Xp> = Subject::ALL.iter().map(|s| (*s, 0)).collect();
        for record in self.store.records(CategoryKind::Subject, user_id)? {
            match Category::from_stored(CategoryKind::Subject, &record.category) {
                Some(Category::Subject(s)) => *out.entry(s).or_insert(0) += record.xp_amount,
                _ => log::debug!(
                    "user={user_id} ignoring non-canonical subject row '{}'",
                    record.category
                ),
            }
        }
        Ok(out)
    }

    pub fn get_total_xp(&self, user_id: &str) -> XpResult<Xp> {
        Ok(self.get_xp_by_pillar(user_id)?.values().sum())
    }

    pub fn get_mastery(&self, user_id: &str) -> XpResult<MasteryLevel> {
        Ok(mastery::mastery_level(self.get_total_xp(user_id)?))
    }

    pub fn get_achievement_tier(&self, user_id: &str) -> XpResult<AchievementTier> {
        Ok(mastery::achievement_tier(self.get_total_xp(user_id)?))
    }

    pub fn get_next_tier_info(&self, user_id: &str) -> XpResult<Option<NextTierInfo>> {
        Ok(mastery::next_tier_info(self.get_total_xp(user_id)?))
    }

    /// Everything a dashboard card needs, from a single pair of reads.
    pub fn get_user_summary(&self, user_id: &str) -> XpResult<UserSummary> {
        let xp_by_pillar = self.get_xp_by_pillar(user_id)?;
        let credits_by_subject = self.get_credits_by_subject(user_id)?;
        let total_xp: Xp = xp_by_pillar.values().sum();

        Ok(UserSummary {
            user_id: user_id.to_string(),
            total_xp,
            xp_by_pillar,
            credits_by_subject,
            mastery: mastery::mastery_level(total_xp),
            achievement_tier: mastery::achievement_tier(total_xp),
            next_tier: mastery::next_tier_info(total_xp),
            tier_progress_pct: mastery::progress_percentage(total_xp, None),
        })
    }
}
