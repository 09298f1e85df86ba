//! Block Pool
//!
//! Registered blocks and the free list, shared by every fairness policy. The pool
//! only knows which blocks are free; per-tenant ownership lives in the tenant
//! records of the owning allocator.

use super::error::{AllocatorError, Result};
use super::types::{BlockState, append_seq_no};

use rand::Rng;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct BlockPool {
    free: BTreeSet<String>,
    blocks: HashMap<String, BlockState>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers new blocks as free. Names that are already known are skipped.
    pub fn add(&mut self, names: &[String]) -> usize {
        let mut added = 0;
        for name in names {
            if self.blocks.contains_key(name) {
                tracing::warn!("Block {} is already registered", name);
                continue;
            }
            self.blocks.insert(name.clone(), BlockState::default());
            self.free.insert(name.clone());
            added += 1;
        }
        added
    }

    /// Unregisters blocks. Nothing is removed unless every name is currently free.
    pub fn remove(&mut self, names: &[String]) -> Result<()> {
        if let Some(name) = names.iter().find(|name| !self.free.contains(*name)) {
            return Err(AllocatorError::InvalidArgument(format!(
                "Trying to remove an allocated block: {}",
                name
            )));
        }
        for name in names {
            self.free.remove(name);
            self.blocks.remove(name);
        }
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn free_names(&self) -> BTreeSet<String> {
        self.free.clone()
    }

    pub fn seq_no(&self, name: &str) -> Option<u64> {
        self.blocks.get(name).map(|block| block.seq_no)
    }

    /// Hands a random free block to `tenant_id` and returns its id with the
    /// sequence number appended.
    pub fn grant(&mut self, tenant_id: &str) -> Option<(String, String)> {
        let name = take_random(&mut self.free)?;
        let block = self.blocks.entry(name.clone()).or_default();
        if block.last_tenant.as_deref() != Some(tenant_id) {
            block.seq_no += 1;
            block.last_tenant = Some(tenant_id.to_string());
        }
        block.used = true;
        let id = append_seq_no(&name, block.seq_no);
        Some((name, id))
    }

    pub fn release(&mut self, name: String) {
        if let Some(block) = self.blocks.get_mut(&name) {
            block.used = false;
        }
        self.free.insert(name);
    }

    /// Starts a new utilization epoch.
    pub fn snapshot_epoch(&mut self) {
        for block in self.blocks.values_mut() {
            block.used_prev_epoch = block.used;
        }
    }

    /// Number of blocks that were in use at the last epoch boundary.
    pub fn used_prev_epoch(&self) -> usize {
        self.blocks
            .values()
            .filter(|block| block.used_prev_epoch)
            .count()
    }
}

/// Removes and returns a uniformly random element.
pub fn take_random(set: &mut BTreeSet<String>) -> Option<String> {
    if set.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..set.len());
    let name = set.iter().nth(idx)?.clone();
    set.remove(&name);
    Some(name)
}
