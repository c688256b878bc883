//! Category vocabulary and resolution.
//!
//! Two closed vocabularies feed the aggregates: skill pillars (XP) and
//! academic subjects (diploma credit). Incoming strings may be current keys,
//! legacy keys from older pillar models, or display names typed by people.
//! Anything the alias table cannot place comes back as `UnresolvedCategory`;
//! the resolver never guesses a bucket on its own.

use crate::{config::CategoryConfig, error::XpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Bumped whenever a canonical key is added, removed or re-pointed.
pub const VOCABULARY_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pillar {
    Art,
    Stem,
    Wellness,
    Communication,
    Civics,
}

impl Pillar {
    pub const ALL: [Pillar; 5] = [
        Pillar::Art,
        Pillar::Stem,
        Pillar::Wellness,
        Pillar::Communication,
        Pillar::Civics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Pillar::Art           => "art",
            Pillar::Stem          => "stem",
            Pillar::Wellness      => "wellness",
            Pillar::Communication => "communication",
            Pillar::Civics        => "civics",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Pillar::Art           => "Art",
            Pillar::Stem          => "STEM",
            Pillar::Wellness      => "Wellness",
            Pillar::Communication => "Communication",
            Pillar::Civics        => "Civics",
        }
    }

    /// Exact canonical key match only. Use the resolver for anything else.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == key)
    }
}

impl fmt::Display for Pillar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    LanguageArts,
    Math,
    Science,
    SocialStudies,
    FinancialLiteracy,
    Health,
    Pe,
    FineArts,
    Cte,
    DigitalLiteracy,
    Electives,
}

impl Subject {
    pub const ALL: [Subject; 11] = [
        Subject::LanguageArts,
        Subject::Math,
        Subject::Science,
        Subject::SocialStudies,
        Subject::FinancialLiteracy,
        Subject::Health,
        Subject::Pe,
        Subject::FineArts,
        Subject::Cte,
        Subject::DigitalLiteracy,
        Subject::Electives,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subject::LanguageArts      => "language_arts",
            Subject::Math              => "math",
            Subject::Science           => "science",
            Subject::SocialStudies     => "social_studies",
            Subject::FinancialLiteracy => "financial_literacy",
            Subject::Health            => "health",
            Subject::Pe                => "pe",
            Subject::FineArts          => "fine_arts",
            Subject::Cte               => "cte",
            Subject::DigitalLiteracy   => "digital_literacy",
            Subject::Electives         => "electives",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Subject::LanguageArts      => "Language Arts",
            Subject::Math              => "Math",
            Subject::Science           => "Science",
            Subject::SocialStudies     => "Social Studies",
            Subject::FinancialLiteracy => "Financial Literacy",
            Subject::Health            => "Health",
            Subject::Pe                => "PE",
            Subject::FineArts          => "Fine Arts",
            Subject::Cte               => "CTE",
            Subject::DigitalLiteracy   => "Digital Literacy",
            Subject::Electives         => "Electives",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == key)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which vocabulary (and which aggregate table) a category belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Pillar,
    Subject,
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryKind::Pillar  => f.write_str("pillar"),
            CategoryKind::Subject => f.write_str("subject"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Category {
    Pillar(Pillar),
    Subject(Subject),
}

impl Category {
    pub fn kind(self) -> CategoryKind {
        match self {
            Category::Pillar(_)  => CategoryKind::Pillar,
            Category::Subject(_) => CategoryKind::Subject,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Category::Pillar(p)  => p.as_str(),
            Category::Subject(s) => s.as_str(),
        }
    }

    /// Parse a canonical key stored in an aggregate table.
    pub fn from_stored(kind: CategoryKind, key: &str) -> Option<Self> {
        match kind {
            CategoryKind::Pillar  => Pillar::from_key(key).map(Category::Pillar),
            CategoryKind::Subject => Subject::from_key(key).map(Category::Subject),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("unresolved {kind} category '{raw}'")]
pub struct UnresolvedCategory {
    pub kind: CategoryKind,
    pub raw: String,
}

/// Built-in aliases: legacy keys, display names and curated synonyms.
/// Keys are written pre-normalised.
const PILLAR_ALIASES: &[(&str, Pillar)] = &[
    // five-pillar display names
    ("arts", Pillar::Art),
    ("science_technology_engineering_math", Pillar::Stem),
    ("civic", Pillar::Civics),
    // legacy multi-word pillars
    ("arts_creativity", Pillar::Art),
    ("arts_and_creativity", Pillar::Art),
    ("stem_logic", Pillar::Stem),
    ("stem_and_logic", Pillar::Stem),
    ("life_wellness", Pillar::Wellness),
    ("life_and_wellness", Pillar::Wellness),
    ("language_communication", Pillar::Communication),
    ("language_and_communication", Pillar::Communication),
    ("society_culture", Pillar::Civics),
    ("society_and_culture", Pillar::Civics),
    // first-generation skill categories
    ("creativity", Pillar::Art),
    ("critical_thinking", Pillar::Stem),
    ("practical_skills", Pillar::Wellness),
    ("cultural_literacy", Pillar::Civics),
];

const SUBJECT_ALIASES: &[(&str, Subject)] = &[
    ("english", Subject::LanguageArts),
    ("ela", Subject::LanguageArts),
    ("english_language_arts", Subject::LanguageArts),
    ("mathematics", Subject::Math),
    ("maths", Subject::Math),
    ("personal_finance", Subject::FinancialLiteracy),
    ("physical_education", Subject::Pe),
    ("p_e", Subject::Pe),
    ("career_and_technical_education", Subject::Cte),
    ("career_technical_education", Subject::Cte),
    ("elective", Subject::Electives),
];

/// Lowercase, trim, spell out `&`, and collapse every run of
/// non-alphanumeric characters into a single underscore.
pub fn normalize(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace('&', " and ");
    let mut out = String::with_capacity(lowered.len());
    let mut pending_sep = false;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct CategoryResolver {
    pillar_aliases: HashMap<String, Pillar>,
    subject_aliases: HashMap<String, Subject>,
    fallback_pillar: Option<Pillar>,
    fallback_subject: Option<Subject>,
}

impl Default for CategoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryResolver {
    /// Resolver over the built-in vocabulary, with no fallbacks.
    pub fn new() -> Self {
        let mut pillar_aliases = HashMap::new();
        for p in Pillar::ALL {
            pillar_aliases.insert(p.as_str().to_string(), p);
            pillar_aliases.insert(normalize(p.display_name()), p);
        }
        for (alias, p) in PILLAR_ALIASES {
            pillar_aliases.insert((*alias).to_string(), *p);
        }

        let mut subject_aliases = HashMap::new();
        for s in Subject::ALL {
            subject_aliases.insert(s.as_str().to_string(), s);
            subject_aliases.insert(normalize(s.display_name()), s);
        }
        for (alias, s) in SUBJECT_ALIASES {
            subject_aliases.insert((*alias).to_string(), *s);
        }

        Self {
            pillar_aliases,
            subject_aliases,
            fallback_pillar: None,
            fallback_subject: None,
        }
    }

    /// Built-in vocabulary extended with operator-supplied aliases.
    /// Every alias and fallback must point at a canonical key.
    pub fn from_config(cfg: &CategoryConfig) -> XpResult<Self> {
        let mut resolver = Self::new();

        for (alias, target) in &cfg.pillar_aliases {
            let pillar = Pillar::from_key(target).ok_or_else(|| UnresolvedCategory {
                kind: CategoryKind::Pillar,
                raw: target.clone(),
            })?;
            resolver.pillar_aliases.insert(normalize(alias), pillar);
        }
        for (alias, target) in &cfg.subject_aliases {
            let subject = Subject::from_key(target).ok_or_else(|| UnresolvedCategory {
                kind: CategoryKind::Subject,
                raw: target.clone(),
            })?;
            resolver.subject_aliases.insert(normalize(alias), subject);
        }

        if let Some(key) = &cfg.fallback_pillar {
            resolver.fallback_pillar = Some(Pillar::from_key(key).ok_or_else(|| {
                UnresolvedCategory {
                    kind: CategoryKind::Pillar,
                    raw: key.clone(),
                }
            })?);
        }
        if let Some(key) = &cfg.fallback_subject {
            resolver.fallback_subject = Some(Subject::from_key(key).ok_or_else(|| {
                UnresolvedCategory {
                    kind: CategoryKind::Subject,
                    raw: key.clone(),
                }
            })?);
        }

        Ok(resolver)
    }

    pub fn resolve(&self, raw: &str, kind: CategoryKind) -> Result<Category, UnresolvedCategory> {
        match kind {
            CategoryKind::Pillar  => self.resolve_pillar(raw).map(Category::Pillar),
            CategoryKind::Subject => self.resolve_subject(raw).map(Category::Subject),
        }
    }

    pub fn resolve_pillar(&self, raw: &str) -> Result<Pillar, UnresolvedCategory> {
        if let Some(p) = Pillar::from_key(raw) {
            return Ok(p);
        }
        if let Some(p) = self.pillar_aliases.get(&normalize(raw)) {
            return Ok(*p);
        }
        match self.fallback_pillar {
            Some(p) => {
                log::warn!("pillar '{raw}' not in vocabulary v{VOCABULARY_VERSION}; using configured fallback '{p}'");
                Ok(p)
            }
            None => {
                log::warn!("unresolved pillar '{raw}' (vocabulary v{VOCABULARY_VERSION})");
                Err(UnresolvedCategory {
                    kind: CategoryKind::Pillar,
                    raw: raw.to_string(),
                })
            }
        }
    }

    pub fn resolve_subject(&self, raw: &str) -> Result<Subject, UnresolvedCategory> {
        if let Some(s) = Subject::from_key(raw) {
            return Ok(s);
        }
        if let Some(s) = self.subject_aliases.get(&normalize(raw)) {
            return Ok(*s);
        }
        match self.fallback_subject {
            Some(s) => {
                log::warn!("subject '{raw}' not in vocabulary v{VOCABULARY_VERSION}; using configured fallback '{s}'");
                Ok(s)
            }
            None => {
                log::warn!("unresolved subject '{raw}' (vocabulary v{VOCABULARY_VERSION})");
                Err(UnresolvedCategory {
                    kind: CategoryKind::Subject,
                    raw: raw.to_string(),
                })
            }
        }
    }
}
