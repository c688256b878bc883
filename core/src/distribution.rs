//! Subject credit distribution.
//!
//! Both modes round DOWN and drop the remainder:
//!   - Percentages: floor(xp * pct / 100) per subject; any share not covered
//!     by the map is credited nowhere.
//!   - Even split:  xp / n (integer division) per subject; 100 over three
//!     subjects is 33 each, one unit lost.
//! Downstream diploma totals depend on these exact numbers.

use crate::{event::SubjectDistribution, types::Xp};
use std::collections::BTreeMap;

/// Why a distribution cannot be used.
#[derive(Debug, Clone, PartialEq)]
pub enum Malformed {
    BlankSubject,
    PercentageOutOfRange { subject: String, pct: f64 },
}

impl std::fmt::Display for Malformed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Malformed::BlankSubject => write!(f, "blank subject key"),
            Malformed::PercentageOutOfRange { subject, pct } => {
                write!(f, "percentage {pct} for '{subject}' outside 0..=100")
            }
        }
    }
}

/// Structural check used by the award path to reject bad input up front.
pub fn validate(distribution: &SubjectDistribution) -> Result<(), Malformed> {
    match distribution {
        SubjectDistribution::Percentages(map) => {
            for (subject, pct) in map {
                if subject.trim().is_empty() {
                    return Err(Malformed::BlankSubject);
                }
                if !pct.is_finite() || *pct < 0.0 || *pct > 100.0 {
                    return Err(Malformed::PercentageOutOfRange {
                        subject: subject.clone(),
                        pct: *pct,
                    });
                }
            }
        }
        SubjectDistribution::EvenSplit(subjects) => {
            if subjects.iter().any(|s| s.trim().is_empty()) {
                return Err(Malformed::BlankSubject);
            }
        }
    }
    Ok(())
}

/// Credit per raw subject key. Empty or malformed input yields an empty map.
pub fn compute(xp_value: Xp, distribution: &SubjectDistribution) -> BTreeMap<String, Xp> {
    let mut credits = BTreeMap::new();

    if xp_value <= 0 {
        return credits;
    }
    if distribution.is_empty() {
        log::warn!("empty subject distribution for {xp_value} xp; no subject credit");
        return credits;
    }
    if let Err(reason) = validate(distribution) {
        log::warn!("malformed subject distribution ({reason}); no subject credit");
        return credits;
    }

    match distribution {
        SubjectDistribution::Percentages(map) => {
            for (subject, pct) in map {
                let credit = (xp_value as f64 * pct / 100.0).floor() as Xp;
                *credits.entry(subject.clone()).or_insert(0) += credit;
            }
        }
        SubjectDistribution::EvenSplit(subjects) => {
            let per_subject = xp_value / subjects.len() as Xp;
            for subject in subjects {
                *credits.entry(subject.clone()).or_insert(0) += per_subject;
            }
        }
    }

    credits
}
