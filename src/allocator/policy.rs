//! Allocation Contract
//!
//! The capability set every block allocation policy provides. The namespace service
//! only ever talks to an `Arc<dyn AllocationPolicy>`.

use super::error::Result;
use super::types::AllocatorStats;

pub trait AllocationPolicy: Send + Sync {
    /// Grants `count` blocks to `tenant_id`. Returned ids carry a `:<seq>` suffix.
    fn allocate(
        &self,
        count: usize,
        exclude_list: &[String],
        tenant_id: &str,
    ) -> Result<Vec<String>>;

    /// Returns blocks (ids as handed out by `allocate`) to the free pool.
    fn free(&self, blocks: &[String], tenant_id: &str) -> Result<()>;

    fn add_blocks(&self, names: &[String]);

    fn remove_blocks(&self, names: &[String]) -> Result<()>;

    fn num_free_blocks(&self) -> usize;

    fn num_allocated_blocks(&self) -> usize;

    fn num_total_blocks(&self) -> usize;

    /// Records a tenant's demand for the next reconciliation pass.
    fn update_demand(&self, _tenant_id: &str, _demand: u64, _oracle_demand: u64) {}

    fn register_tenant(&self, _tenant_id: &str) {}

    /// Recomputes per-tenant caps. Policies without a fairness model have nothing to do.
    fn compute_allocations(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats::new(
            self.num_total_blocks(),
            self.num_free_blocks(),
            self.num_allocated_blocks(),
        )
    }
}

/// Tenant owning `path`: its first path segment.
pub fn tenant_of_path(path: &str) -> Option<&str> {
    path.split('/').find(|segment| !segment.is_empty())
}
