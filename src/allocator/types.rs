//! Allocator Data Model
//!
//! Per-tenant and per-block bookkeeping shared by both fairness policies, plus
//! the `<name>:<seq>` block id format handed to clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::error::{AllocatorError, Result};

/// Id of the synthetic tenant standing for the shared, non-borrowing pool.
pub const PUBLIC_TENANT: &str = "$public$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenantKind {
    Real,
    Public,
}

impl TenantKind {
    pub fn of(tenant_id: &str) -> Self {
        if tenant_id == PUBLIC_TENANT {
            TenantKind::Public
        } else {
            TenantKind::Real
        }
    }
}

/// Per-tenant bookkeeping.
///
/// `rate` is the net flow of the current epoch (positive when lending) and is
/// folded into `credits` once per reconciliation.
#[derive(Debug, Clone, Default)]
pub struct TenantState {
    pub demand: u64,
    /// Hint advertised alongside the demand. Informational only.
    pub oracle_demand: u64,
    pub credits: u64,
    pub rate: i64,
    pub allocation: u64,
    pub active_blocks: BTreeSet<String>,
    /// Set once the tenant advertised a demand through `update_demand`.
    pub reported: bool,
}

impl TenantState {
    pub fn held(&self) -> u64 {
        self.active_blocks.len() as u64
    }
}

/// Credits and rate of the public pool. It lends but never borrows.
#[derive(Debug, Clone, Default)]
pub struct PublicPool {
    pub credits: u64,
    pub rate: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BlockState {
    /// Bumped only when the block changes owning tenant.
    pub seq_no: u64,
    pub last_tenant: Option<String>,
    pub used: bool,
    pub used_prev_epoch: bool,
}

/// Point-in-time view of an allocator, used by the stats reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub utilization: f64,
}

impl AllocatorStats {
    pub fn new(total_blocks: usize, free_blocks: usize, allocated_blocks: usize) -> Self {
        let utilization = if total_blocks == 0 {
            0.0
        } else {
            (total_blocks - free_blocks) as f64 / total_blocks as f64
        };
        Self {
            total_blocks,
            free_blocks,
            allocated_blocks,
            utilization,
        }
    }
}

pub fn append_seq_no(block: &str, seq_no: u64) -> String {
    format!("{}:{}", block, seq_no)
}

/// Strips the trailing `:<seq>` from a block id. Block names may contain `:`
/// themselves, so only the last separator counts.
pub fn strip_seq_no(block_id: &str) -> Result<&str> {
    block_id
        .rsplit_once(':')
        .map(|(name, _)| name)
        .ok_or_else(|| {
            AllocatorError::InvalidArgument(format!(
                "block id '{}' has no sequence number",
                block_id
            ))
        })
}
