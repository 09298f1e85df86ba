//! Node Configuration
//!
//! Settings for one allocator node. Values come from the defaults, an optional
//! JSON file, then command-line overrides (see `main.rs`).

use crate::allocator::{AllocationPolicy, KarmaAllocator, MaxMinAllocator};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Karma,
    MaxMin,
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "karma" => Ok(PolicyKind::Karma),
            "maxmin" | "max-min" => Ok(PolicyKind::MaxMin),
            other => Err(anyhow::anyhow!("Unknown allocation policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub policy: PolicyKind,
    /// Fixed tenant population. Reconciliation waits until this many tenants reported.
    pub num_tenants: u32,
    /// Blocks registered with the allocator at startup.
    pub num_blocks: usize,
    /// Capacity of the shared public pool (Karma only).
    pub public_blocks: u64,
    /// Credits granted to every tenant on registration (Karma only).
    pub init_credits: u64,
    /// 0 disables the background reconciliation loop.
    pub reconcile_interval_ms: u64,
    /// 0 disables the utilization reporter.
    pub stats_interval_ms: u64,
    pub log_level: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Karma,
            num_tenants: 4,
            num_blocks: 64,
            public_blocks: 0,
            init_credits: 100,
            reconcile_interval_ms: 1000,
            stats_interval_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl AllocatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: AllocatorConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_tenants == 0 {
            return Err(anyhow::anyhow!("num_tenants must be at least 1"));
        }
        if self.policy == PolicyKind::Karma && self.public_blocks > self.num_blocks as u64 {
            return Err(anyhow::anyhow!(
                "public_blocks ({}) exceeds num_blocks ({})",
                self.public_blocks,
                self.num_blocks
            ));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level> {
        tracing::Level::from_str(&self.log_level)
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", self.log_level))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn build_policy(&self) -> Arc<dyn AllocationPolicy> {
        match self.policy {
            PolicyKind::Karma => Arc::new(KarmaAllocator::new(
                self.num_tenants,
                self.public_blocks,
                self.init_credits,
            )),
            PolicyKind::MaxMin => Arc::new(MaxMinAllocator::new(self.num_tenants)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AllocatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconcile_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "policy": "maxmin", "num_tenants": 3, "reconcile_interval_ms": 0 }}"#
        )
        .unwrap();

        let config = AllocatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.policy, PolicyKind::MaxMin);
        assert_eq!(config.num_tenants, 3);
        assert_eq!(config.reconcile_interval_ms, 0);
        assert_eq!(config.num_blocks, AllocatorConfig::default().num_blocks);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AllocatorConfig::from_file("/definitely/not/here.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = AllocatorConfig {
            num_tenants: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AllocatorConfig {
            num_blocks: 2,
            public_blocks: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AllocatorConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_kind_parsing() {
        assert_eq!("Karma".parse::<PolicyKind>().unwrap(), PolicyKind::Karma);
        assert_eq!("max-min".parse::<PolicyKind>().unwrap(), PolicyKind::MaxMin);
        assert!("random".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn test_build_policy_starts_empty() {
        let config = AllocatorConfig {
            policy: PolicyKind::MaxMin,
            ..Default::default()
        };
        let policy = config.build_policy();
        assert_eq!(policy.num_total_blocks(), 0);
    }
}
