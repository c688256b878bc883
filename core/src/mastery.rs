//! Mastery levels and achievement tiers.
//!
//! Both ladders are pure functions of cumulative XP over fixed tables.
//! Nothing here is persisted or cached: callers recompute from the
//! current aggregate totals on every read.

use crate::types::Xp;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementTier {
    Explorer,
    Builder,
    Creator,
    Scholar,
    Sage,
}

impl AchievementTier {
    /// Lowest to highest.
    pub const ORDER: [AchievementTier; 5] = [
        AchievementTier::Explorer,
        AchievementTier::Builder,
        AchievementTier::Creator,
        AchievementTier::Scholar,
        AchievementTier::Sage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AchievementTier::Explorer => "explorer",
            AchievementTier::Builder  => "builder",
            AchievementTier::Creator  => "creator",
            AchievementTier::Scholar  => "scholar",
            AchievementTier::Sage     => "sage",
        }
    }

    pub fn min_xp(self) -> Xp {
        match self {
            AchievementTier::Explorer => 0,
            AchievementTier::Builder  => 250,
            AchievementTier::Creator  => 750,
            AchievementTier::Scholar  => 1500,
            AchievementTier::Sage     => 3000,
        }
    }

    pub fn next(self) -> Option<Self> {
        let idx = Self::ORDER.iter().position(|t| *t == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

impl fmt::Display for AchievementTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteryLevel {
    pub level: u32,
    pub name:  String,
    pub tier:  AchievementTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTierInfo {
    pub tier:      AchievementTier,
    pub min_xp:    Xp,
    pub xp_needed: Xp,
}

/// (threshold, name, tier) ascending. Level number is position + 1.
const MASTERY_LADDER: [(Xp, &str, AchievementTier); 10] = [
    (0,      "Novice",       AchievementTier::Explorer),
    (500,    "Learner",      AchievementTier::Explorer),
    (1_500,  "Practitioner", AchievementTier::Builder),
    (3_500,  "Specialist",   AchievementTier::Builder),
    (7_000,  "Expert",       AchievementTier::Creator),
    (12_500, "Master",       AchievementTier::Creator),
    (20_000, "Virtuoso",     AchievementTier::Scholar),
    (30_000, "Legend",       AchievementTier::Scholar),
    (45_000, "Sage",         AchievementTier::Sage),
    (65_000, "Grandmaster",  AchievementTier::Sage),
];

fn ladder_entry(idx: usize) -> MasteryLevel {
    let (_, name, tier) = MASTERY_LADDER[idx];
    MasteryLevel {
        level: idx as u32 + 1,
        name: name.to_string(),
        tier,
    }
}

/// Highest ladder entry whose threshold is at or below `total_xp`.
pub fn mastery_level(total_xp: Xp) -> MasteryLevel {
    let idx = MASTERY_LADDER
        .iter()
        .rposition(|(threshold, _, _)| *threshold <= total_xp)
        .unwrap_or(0);
    ladder_entry(idx)
}

/// The next mastery level and the XP still needed, or None at Grandmaster.
pub fn next_mastery_level(total_xp: Xp) -> Option<(MasteryLevel, Xp)> {
    let current = mastery_level(total_xp).level as usize;
    if current >= MASTERY_LADDER.len() {
        return None;
    }
    let threshold = MASTERY_LADDER[current].0;
    Some((ladder_entry(current), threshold - total_xp.max(0)))
}

pub fn achievement_tier(total_xp: Xp) -> AchievementTier {
    AchievementTier::ORDER
        .iter()
        .rev()
        .copied()
        .find(|t| t.min_xp() <= total_xp)
        .unwrap_or(AchievementTier::Explorer)
}

pub fn next_tier_info(total_xp: Xp) -> Option<NextTierInfo> {
    let next = achievement_tier(total_xp).next()?;
    Some(NextTierInfo {
        tier: next,
        min_xp: next.min_xp(),
        xp_needed: next.min_xp() - total_xp.max(0),
    })
}

/// Progress from the current tier's floor towards `target` (default: the
/// next tier), in [0, 100].
pub fn progress_percentage(current_xp: Xp, target: Option<AchievementTier>) -> f64 {
    let current = achievement_tier(current_xp);
    let ceiling_tier = match target.or_else(|| current.next()) {
        Some(t) => t,
        None => return 100.0,
    };

    let floor = current.min_xp();
    let ceiling = ceiling_tier.min_xp();
    if floor == ceiling || current_xp >= ceiling {
        return 100.0;
    }

    let pct = (current_xp - floor) as f64 / (ceiling - floor) as f64 * 100.0;
    pct.clamp(0.0, 100.0)
}

/// Quest completion bonus: half the base XP, rounded to the nearest 50.
/// Ties round to even, so 50 base XP earns no bonus and 150 earns 100.
pub fn completion_bonus(base_xp: Xp) -> Xp {
    let units = base_xp as f64 * 0.5 / 50.0;
    units.round_ties_even() as Xp * 50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mastery_boundaries() {
        assert_eq!(
            mastery_level(0),
            MasteryLevel { level: 1, name: "Novice".into(), tier: AchievementTier::Explorer }
        );
        let l = mastery_level(1_499);
        assert_eq!((l.level, l.name.as_str(), l.tier), (2, "Learner", AchievementTier::Explorer));
        let l = mastery_level(1_500);
        assert_eq!((l.level, l.name.as_str(), l.tier), (3, "Practitioner", AchievementTier::Builder));
        let l = mastery_level(1_000_000);
        assert_eq!((l.level, l.name.as_str()), (10, "Grandmaster"));
        assert_eq!(mastery_level(-5).level, 1);
    }

    #[test]
    fn next_mastery_level_counts_down() {
        let (next, needed) = next_mastery_level(1_200).unwrap();
        assert_eq!(next.name, "Practitioner");
        assert_eq!(needed, 300);
        assert!(next_mastery_level(65_000).is_none());
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(achievement_tier(249), AchievementTier::Explorer);
        assert_eq!(achievement_tier(250), AchievementTier::Builder);
        assert_eq!(achievement_tier(749), AchievementTier::Builder);
        assert_eq!(achievement_tier(750), AchievementTier::Creator);
        assert_eq!(achievement_tier(1_500), AchievementTier::Scholar);
        assert_eq!(achievement_tier(3_000), AchievementTier::Sage);
        assert_eq!(achievement_tier(-1), AchievementTier::Explorer);
    }

    #[test]
    fn next_tier_info_stops_at_sage() {
        assert_eq!(
            next_tier_info(100),
            Some(NextTierInfo { tier: AchievementTier::Builder, min_xp: 250, xp_needed: 150 })
        );
        assert_eq!(next_tier_info(2_999).map(|n| n.tier), Some(AchievementTier::Sage));
        assert_eq!(next_tier_info(3_000), None);
    }

    #[test]
    fn progress_is_clamped_and_saturates() {
        assert_eq!(progress_percentage(0, None), 0.0);
        assert!((progress_percentage(125, None) - 50.0).abs() < 1e-9);
        assert!((progress_percentage(500, None) - 50.0).abs() < 1e-9);
        assert_eq!(progress_percentage(3_000, None), 100.0);
        assert_eq!(progress_percentage(5_000, Some(AchievementTier::Sage)), 100.0);
        // already past the requested target
        assert_eq!(progress_percentage(800, Some(AchievementTier::Builder)), 100.0);
        // 250 -> 3000 from the builder floor
        let p = progress_percentage(525, Some(AchievementTier::Sage));
        assert!((p - 10.0).abs() < 1e-9);
    }

    #[test]
    fn bonus_rounds_to_nearest_fifty() {
        assert_eq!(completion_bonus(100), 50);
        assert_eq!(completion_bonus(200), 100);
        assert_eq!(completion_bonus(130), 50);
        assert_eq!(completion_bonus(170), 100);
        assert_eq!(completion_bonus(50), 0);
        assert_eq!(completion_bonus(150), 100);
        assert_eq!(completion_bonus(0), 0);
    }
}
