use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardConfig {
    /// Upper bound on the aggregate-update step of an award, covering lock
    /// waits, SQLite busy waits and watermark conflict retries.
    pub store_timeout_ms: u64,
    /// Compare-and-set attempts before the award degrades to a partial failure.
    pub max_commit_attempts: u32,
}

impl AwardConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Users per batch in a sweep.
    pub batch_size: usize,
    /// Compare-and-set attempts per user before the user is reported as failed.
    pub max_commit_attempts: u32,
    /// Timeout applied to each store write during Apply.
    pub store_timeout_ms: u64,
    /// Net-negative corrections need `confirm_reductions` on the run.
    pub require_signoff_for_reductions: bool,
}

impl ReconciliationConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Operator extensions to the built-in category vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// alias → canonical pillar key
    #[serde(default)]
    pub pillar_aliases: BTreeMap<String, String>,
    /// alias → canonical subject key
    #[serde(default)]
    pub subject_aliases: BTreeMap<String, String>,
    /// Canonical key used for unknown pillars. None rejects them.
    #[serde(default)]
    pub fallback_pillar: Option<String>,
    #[serde(default)]
    pub fallback_subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EngineFile {
    award: AwardConfig,
    reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub award: AwardConfig,
    pub reconciliation: ReconciliationConfig,
    pub categories: CategoryConfig,
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let engine_path = format!("{data_dir}/engine/xp_engine.json");
        let engine_content = std::fs::read_to_string(&engine_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {engine_path}: {e}"))?;
        let engine_file: EngineFile = serde_json::from_str(&engine_content)?;

        let alias_path = format!("{data_dir}/categories/category_aliases.json");
        let alias_content = std::fs::read_to_string(&alias_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {alias_path}: {e}"))?;
        let categories: CategoryConfig = serde_json::from_str(&alias_content)?;

        let config = Self {
            award: engine_file.award,
            reconciliation: engine_file.reconciliation,
            categories,
        };
        config.check()?;
        Ok(config)
    }

    /// Config with hardcoded defaults for use in unit tests.
    pub fn default_test() -> Self {
        Self {
            award: AwardConfig {
                store_timeout_ms: 2_000,
                max_commit_attempts: 64,
            },
            reconciliation: ReconciliationConfig {
                batch_size: 100,
                max_commit_attempts: 3,
                store_timeout_ms: 5_000,
                require_signoff_for_reductions: true,
            },
            categories: CategoryConfig::default(),
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.award.max_commit_attempts == 0 {
            anyhow::bail!("award.max_commit_attempts must be at least 1");
        }
        if self.reconciliation.max_commit_attempts == 0 {
            anyhow::bail!("reconciliation.max_commit_attempts must be at least 1");
        }
        if self.reconciliation.batch_size == 0 {
            anyhow::bail!("reconciliation.batch_size must be at least 1");
        }
        Ok(())
    }
}
