//! Max-Min Allocator
//!
//! Credit-free baseline. Each reconciliation water-fills the registered blocks
//! across tenant demands: nobody gets less than `min(demand, equal share)`, and
//! whatever low-demand tenants leave over flows equally to the rest. Nothing
//! carries over between epochs.

use super::error::{AllocatorError, Result};
use super::policy::AllocationPolicy;
use super::pool::{BlockPool, take_random};
use super::types::*;
use super::waterfill::{Participant, water_fill};

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

pub struct MaxMinAllocator {
    state: Mutex<MaxMinState>,
}

impl MaxMinAllocator {
    pub fn new(num_tenants: u32) -> Self {
        tracing::info!("Max-min allocator: {} tenants", num_tenants);
        Self {
            state: Mutex::new(MaxMinState::new(num_tenants)),
        }
    }

    pub fn fair_share(&self) -> u64 {
        self.state.lock().fair_share()
    }

    pub fn allocation(&self, tenant_id: &str) -> Option<u64> {
        self.state
            .lock()
            .tenants
            .get(tenant_id)
            .map(|t| t.allocation)
    }

    /// Capacity the last reconciliation left unassigned.
    pub fn not_allocated(&self) -> u64 {
        self.state.lock().not_allocated
    }

    pub fn active_blocks(&self, tenant_id: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .tenants
            .get(tenant_id)
            .map(|t| t.active_blocks.clone())
    }

    pub fn free_blocks(&self) -> BTreeSet<String> {
        self.state.lock().pool.free_names()
    }
}

impl AllocationPolicy for MaxMinAllocator {
    fn allocate(
        &self,
        count: usize,
        _exclude_list: &[String],
        tenant_id: &str,
    ) -> Result<Vec<String>> {
        self.state.lock().allocate(count, tenant_id)
    }

    fn free(&self, blocks: &[String], tenant_id: &str) -> Result<()> {
        self.state.lock().free(blocks, tenant_id)
    }

    fn add_blocks(&self, names: &[String]) {
        let mut state = self.state.lock();
        let added = state.pool.add(names);
        tracing::info!("Added {} blocks, total={}", added, state.pool.total());
    }

    fn remove_blocks(&self, names: &[String]) -> Result<()> {
        self.state.lock().pool.remove(names)
    }

    fn num_free_blocks(&self) -> usize {
        self.state.lock().pool.free_count()
    }

    fn num_allocated_blocks(&self) -> usize {
        self.state.lock().num_allocated_blocks()
    }

    fn num_total_blocks(&self) -> usize {
        self.state.lock().pool.total()
    }

    fn update_demand(&self, tenant_id: &str, demand: u64, oracle_demand: u64) {
        tracing::debug!("Demand advertisement: {} {}", tenant_id, demand);
        let mut state = self.state.lock();
        let tenant = state.register_tenant(tenant_id);
        tenant.demand = demand;
        tenant.oracle_demand = oracle_demand;
        tenant.reported = true;
    }

    fn register_tenant(&self, tenant_id: &str) {
        self.state.lock().register_tenant(tenant_id);
    }

    fn compute_allocations(&self) -> Result<()> {
        self.state.lock().compute_allocations();
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats::new(
            state.pool.total(),
            state.pool.free_count(),
            state.num_allocated_blocks(),
        )
    }
}

#[derive(Debug)]
pub(crate) struct MaxMinState {
    pub(crate) num_tenants: u64,
    pub(crate) pool: BlockPool,
    pub(crate) tenants: HashMap<String, TenantState>,
    pub(crate) not_allocated: u64,
}

impl MaxMinState {
    pub(crate) fn new(num_tenants: u32) -> Self {
        Self {
            num_tenants: num_tenants as u64,
            pool: BlockPool::new(),
            tenants: HashMap::new(),
            not_allocated: 0,
        }
    }

    pub(crate) fn fair_share(&self) -> u64 {
        (self.pool.total() as u64)
            .checked_div(self.num_tenants)
            .unwrap_or(0)
    }

    fn num_allocated_blocks(&self) -> usize {
        self.tenants.values().map(|t| t.active_blocks.len()).sum()
    }

    fn register_tenant(&mut self, tenant_id: &str) -> &mut TenantState {
        let fair_share = self.fair_share();
        self.tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                tracing::info!("Registered tenant {}", tenant_id);
                TenantState {
                    demand: fair_share,
                    allocation: fair_share,
                    ..Default::default()
                }
            })
    }

    fn allocate(&mut self, count: usize, tenant_id: &str) -> Result<Vec<String>> {
        tracing::debug!("Allocation request for tenant {}", tenant_id);
        if count != 1 {
            return Err(AllocatorError::InvalidArgument(format!(
                "multi-block allocation not supported (requested {})",
                count
            )));
        }

        let fair_share = self.fair_share();
        let tenant = self.register_tenant(tenant_id);
        let (held, allocation) = (tenant.held(), tenant.allocation);

        if held >= allocation {
            if allocation >= fair_share {
                return Err(exhausted());
            }
            if self.not_allocated > 0 {
                if self.pool.free_count() == 0 {
                    return Err(exhausted());
                }
                self.not_allocated -= 1;
            } else {
                // Take the unit from whoever holds the largest cap.
                let (victim, evict) = self
                    .tenants
                    .iter()
                    .filter(|(id, t)| id.as_str() != tenant_id && t.allocation > fair_share)
                    .max_by(|(a_id, a), (b_id, b)| {
                        a.allocation.cmp(&b.allocation).then(b_id.cmp(a_id))
                    })
                    .map(|(id, t)| (id.clone(), t.held() >= t.allocation))
                    .ok_or_else(exhausted)?;
                if self.pool.free_count() == 0 && !evict {
                    return Err(exhausted());
                }
                tracing::debug!("Tenant {} reclaims one block from {}", tenant_id, victim);
                if let Some(t) = self.tenants.get_mut(&victim) {
                    if evict && let Some(name) = take_random(&mut t.active_blocks) {
                        self.pool.release(name);
                    }
                    t.allocation -= 1;
                }
            }
            if let Some(t) = self.tenants.get_mut(tenant_id) {
                t.allocation += 1;
            }
        }

        let (name, block_id) = self.pool.grant(tenant_id).ok_or_else(exhausted)?;
        if let Some(t) = self.tenants.get_mut(tenant_id) {
            t.active_blocks.insert(name);
        }
        Ok(vec![block_id])
    }

    fn free(&mut self, blocks: &[String], tenant_id: &str) -> Result<()> {
        if !self.tenants.contains_key(tenant_id) {
            return Err(AllocatorError::UnknownTenant(tenant_id.to_string()));
        }
        let names = blocks
            .iter()
            .map(|id| strip_seq_no(id))
            .collect::<Result<Vec<_>>>()?;

        let tenant = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| AllocatorError::UnknownTenant(tenant_id.to_string()))?;

        let mut not_freed = Vec::new();
        for name in names {
            if tenant.active_blocks.remove(name) {
                self.pool.release(name.to_string());
            } else {
                not_freed.push(name.to_string());
            }
        }

        if !not_freed.is_empty() {
            return Err(AllocatorError::NotAllocated(not_freed));
        }
        Ok(())
    }

    pub(crate) fn compute_allocations(&mut self) {
        let reported = self.tenants.values().filter(|t| t.reported).count() as u64;
        if reported < self.num_tenants {
            tracing::debug!(
                "Skipping reconciliation: {}/{} tenants reported demand",
                reported,
                self.num_tenants
            );
            return;
        }

        let total = self.pool.total() as u64;
        let demands: HashMap<String, u64> = self
            .tenants
            .iter()
            .map(|(id, t)| (id.clone(), t.demand.max(t.held()).min(total)))
            .collect();

        self.maxmin_algorithm_fast(&demands);

        let mut evicted = 0;
        for tenant in self.tenants.values_mut() {
            while tenant.held() > tenant.allocation {
                match take_random(&mut tenant.active_blocks) {
                    Some(name) => {
                        self.pool.release(name);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }

        self.pool.snapshot_epoch();

        tracing::info!(
            "Reconciled {} tenants: not_allocated={}, evicted={}",
            self.tenants.len(),
            self.not_allocated,
            evicted
        );
    }

    pub(crate) fn maxmin_algorithm_fast(&mut self, demands: &HashMap<String, u64>) {
        let total = self.pool.total() as u64;
        let total_demand = demands
            .values()
            .fold(0u64, |sum, &demand| sum.saturating_add(demand));

        if total >= total_demand {
            for (id, &demand) in demands {
                if let Some(tenant) = self.tenants.get_mut(id) {
                    tenant.allocation = demand;
                }
            }
            self.not_allocated = total - total_demand;
            return;
        }

        let mut ids: Vec<&String> = demands.keys().collect();
        ids.sort();
        let participants = ids
            .into_iter()
            .map(|id| Participant {
                id: id.clone(),
                level: 0,
                capacity: demands[id],
            })
            .collect();

        let outcome = water_fill(participants, total);
        for (id, granted) in outcome.taken {
            if let Some(tenant) = self.tenants.get_mut(&id) {
                tenant.allocation = granted;
            }
        }
        self.not_allocated = outcome.leftover;
    }
}

fn exhausted() -> AllocatorError {
    AllocatorError::ResourceExhausted("Could not find free blocks".to_string())
}
