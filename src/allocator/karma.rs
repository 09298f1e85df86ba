//! Karma Allocator
//!
//! Credit-based max-min fair block allocation. Every tenant is guaranteed
//! `min(demand, fair_share)` blocks. Tenants that need less than their fair share
//! lend the rest and earn one credit per block per epoch; tenants that need more
//! borrow, spending one credit per block. A shared public pool lends too but
//! never borrows.
//!
//! ## Epoch reconciliation
//! `compute_allocations` is the only place where caps, rates and credits are
//! recomputed. When supply covers every borrower's credit-capped want, the
//! poorest donors lend first. Otherwise the richest borrowers are served first.
//! Both cases run a tiered water-fill (see `waterfill`).
//!
//! ## Request path
//! `allocate` and `free` only consume the caps set by the last reconciliation,
//! raising a cap by one below fair share by moving a unit from a donor or
//! reclaiming it from the poorest over-fair-share borrower.

use super::error::{AllocatorError, Result};
use super::policy::AllocationPolicy;
use super::pool::{BlockPool, take_random};
use super::types::*;
use super::waterfill::{Participant, water_fill};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Read-only view of one tenant, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSnapshot {
    pub tenant_id: String,
    pub demand: u64,
    pub credits: u64,
    pub rate: i64,
    pub allocation: u64,
    pub held: u64,
}

pub struct KarmaAllocator {
    state: Mutex<KarmaState>,
}

impl KarmaAllocator {
    pub fn new(num_tenants: u32, public_blocks: u64, init_credits: u64) -> Self {
        tracing::info!(
            "Karma allocator: {} tenants, {} public blocks, {} initial credits",
            num_tenants,
            public_blocks,
            init_credits
        );
        Self {
            state: Mutex::new(KarmaState::new(num_tenants, public_blocks, init_credits)),
        }
    }

    pub fn fair_share(&self) -> u64 {
        self.state.lock().fair_share()
    }

    /// Credits of a tenant, or of the public pool for `PUBLIC_TENANT`.
    pub fn credits(&self, tenant_id: &str) -> Option<u64> {
        let state = self.state.lock();
        match TenantKind::of(tenant_id) {
            TenantKind::Public => Some(state.public.credits),
            TenantKind::Real => state.tenants.get(tenant_id).map(|t| t.credits),
        }
    }

    pub fn rate(&self, tenant_id: &str) -> Option<i64> {
        let state = self.state.lock();
        match TenantKind::of(tenant_id) {
            TenantKind::Public => Some(state.public.rate),
            TenantKind::Real => state.tenants.get(tenant_id).map(|t| t.rate),
        }
    }

    pub fn allocation(&self, tenant_id: &str) -> Option<u64> {
        self.state
            .lock()
            .tenants
            .get(tenant_id)
            .map(|t| t.allocation)
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

    pub fn block_seq_no(&self, name: &str) -> Option<u64> {
        self.state.lock().pool.seq_no(name)
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KarmaState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn tenants(&self) -> Vec<TenantSnapshot> {
        let state = self.state.lock();
        let mut snapshots: Vec<TenantSnapshot> = state
            .tenants
            .iter()
            .map(|(id, t)| TenantSnapshot {
                tenant_id: id.clone(),
                demand: t.demand,
                credits: t.credits,
                rate: t.rate,
                allocation: t.allocation,
                held: t.held(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        snapshots
    }
}

impl AllocationPolicy for KarmaAllocator {
    /// `exclude_list` is accepted for contract compatibility; single-block
    /// grants never need it.
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
        tracing::info!(
            "Added {} blocks, total={}, fair_share={}",
            added,
            state.pool.total(),
            state.fair_share()
        );
    }

    fn remove_blocks(&self, names: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.pool.remove(names)?;
        tracing::info!(
            "Removed {} blocks, total={}",
            names.len(),
            state.pool.total()
        );
        Ok(())
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
        if let Some(tenant) = state.register_tenant(tenant_id) {
            tenant.demand = demand;
            tenant.oracle_demand = oracle_demand;
            tenant.reported = true;
        }
    }

    fn register_tenant(&self, tenant_id: &str) {
        self.state.lock().register_tenant(tenant_id);
    }

    fn compute_allocations(&self) -> Result<()> {
        self.state.lock().compute_allocations()
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

/// Where the extra unit comes from when a tenant below fair share raises its cap.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CapSource {
    /// The tenant has headroom of its own that nobody borrowed.
    OwnHeadroom,
    Donor(String),
    PublicPool,
    Reclaim { victim: String, evict: bool },
}

/// Everything guarded by the allocator lock.
#[derive(Debug)]
pub(crate) struct KarmaState {
    pub(crate) num_tenants: u64,
    pub(crate) public_blocks: u64,
    pub(crate) init_credits: u64,
    pub(crate) pool: BlockPool,
    pub(crate) tenants: HashMap<String, TenantState>,
    pub(crate) public: PublicPool,
}

impl KarmaState {
    pub(crate) fn new(num_tenants: u32, public_blocks: u64, init_credits: u64) -> Self {
        Self {
            num_tenants: num_tenants as u64,
            public_blocks,
            init_credits,
            pool: BlockPool::new(),
            tenants: HashMap::new(),
            public: PublicPool::default(),
        }
    }

    pub(crate) fn fair_share(&self) -> u64 {
        (self.pool.total() as u64)
            .saturating_sub(self.public_blocks)
            .checked_div(self.num_tenants)
            .unwrap_or(0)
    }

    fn num_allocated_blocks(&self) -> usize {
        self.tenants.values().map(|t| t.active_blocks.len()).sum()
    }

    /// Creates the tenant record on first contact. The public pool id is reserved
    /// and yields `None`.
    pub(crate) fn register_tenant(&mut self, tenant_id: &str) -> Option<&mut TenantState> {
        if TenantKind::of(tenant_id) == TenantKind::Public {
            tracing::warn!("Refusing to register reserved tenant id {}", tenant_id);
            return None;
        }
        let fair_share = self.fair_share();
        let init_credits = self.init_credits;
        let tenant = self
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                tracing::info!("Registered tenant {}", tenant_id);
                TenantState {
                    demand: fair_share,
                    allocation: fair_share,
                    credits: init_credits,
                    ..Default::default()
                }
            });
        Some(tenant)
    }

    pub(crate) fn allocate(&mut self, count: usize, tenant_id: &str) -> Result<Vec<String>> {
        tracing::debug!("Allocation request for tenant {}", tenant_id);
        if count != 1 {
            return Err(AllocatorError::InvalidArgument(format!(
                "multi-block allocation not supported (requested {})",
                count
            )));
        }

        let fair_share = self.fair_share();
        let (held, allocation) = match self.register_tenant(tenant_id) {
            Some(tenant) => (tenant.held(), tenant.allocation),
            None => {
                return Err(AllocatorError::InvalidArgument(format!(
                    "tenant id {} is reserved",
                    tenant_id
                )));
            }
        };

        if held >= allocation {
            if allocation >= fair_share {
                return Err(AllocatorError::ResourceExhausted(
                    "Could not find free blocks".to_string(),
                ));
            }
            let source = self.find_cap_source(tenant_id, fair_share).ok_or_else(|| {
                AllocatorError::ResourceExhausted("Could not find free blocks".to_string())
            })?;
            // Any transfer costs the requester one credit.
            let requester_credits = self.tenants.get(tenant_id).map_or(0, |t| t.credits);
            if source != CapSource::OwnHeadroom && requester_credits == 0 {
                tracing::debug!("Tenant {} has no credits left to pay for a block", tenant_id);
                return Err(AllocatorError::ResourceExhausted(
                    "No credits left to borrow a block".to_string(),
                ));
            }
            let frees_block = matches!(source, CapSource::Reclaim { evict: true, .. });
            if self.pool.free_count() == 0 && !frees_block {
                return Err(AllocatorError::ResourceExhausted(
                    "Could not find free blocks".to_string(),
                ));
            }
            self.apply_cap_source(tenant_id, source);
            if let Some(tenant) = self.tenants.get_mut(tenant_id) {
                tenant.allocation += 1;
            }
        }

        let (name, block_id) = self.pool.grant(tenant_id).ok_or_else(|| {
            AllocatorError::ResourceExhausted("Could not find free blocks".to_string())
        })?;
        if let Some(tenant) = self.tenants.get_mut(tenant_id) {
            tenant.active_blocks.insert(name);
        }
        Ok(vec![block_id])
    }

    fn find_cap_source(&self, tenant_id: &str, fair_share: u64) -> Option<CapSource> {
        let tenant = self.tenants.get(tenant_id)?;
        if tenant.rate < (fair_share - tenant.allocation) as i64 {
            return Some(CapSource::OwnHeadroom);
        }

        // Poorest donor with un-lent headroom pays first.
        let donor = self
            .tenants
            .iter()
            .filter(|(id, t)| {
                id.as_str() != tenant_id
                    && t.allocation < fair_share
                    && t.rate < (fair_share - t.allocation) as i64
            })
            .min_by(|(a_id, a), (b_id, b)| a.credits.cmp(&b.credits).then(a_id.cmp(b_id)));
        if let Some((id, _)) = donor {
            return Some(CapSource::Donor(id.clone()));
        }
        if self.public.rate < self.public_blocks as i64 {
            return Some(CapSource::PublicPool);
        }

        self.tenants
            .iter()
            .filter(|(_, t)| t.allocation > fair_share)
            .min_by(|(a_id, a), (b_id, b)| a.credits.cmp(&b.credits).then(a_id.cmp(b_id)))
            .map(|(id, t)| CapSource::Reclaim {
                victim: id.clone(),
                evict: t.held() >= t.allocation,
            })
    }

    fn apply_cap_source(&mut self, tenant_id: &str, source: CapSource) {
        match source {
            CapSource::OwnHeadroom => return,
            CapSource::Donor(donor) => {
                tracing::debug!("Tenant {} borrows one block from {}", tenant_id, donor);
                if let Some(t) = self.tenants.get_mut(&donor) {
                    t.credits += 1;
                    t.rate += 1;
                }
            }
            CapSource::PublicPool => {
                tracing::debug!("Tenant {} borrows one block from the public pool", tenant_id);
                self.public.credits += 1;
                self.public.rate += 1;
            }
            CapSource::Reclaim { victim, evict } => {
                tracing::debug!("Tenant {} reclaims one block from {}", tenant_id, victim);
                if let Some(t) = self.tenants.get_mut(&victim) {
                    if evict && let Some(name) = take_random(&mut t.active_blocks) {
                        self.pool.release(name);
                    }
                    t.allocation -= 1;
                    t.credits += 1;
                    t.rate += 1;
                }
            }
        }

        if let Some(t) = self.tenants.get_mut(tenant_id) {
            t.credits -= 1;
            t.rate -= 1;
        }
    }

    pub(crate) fn free(&mut self, blocks: &[String], tenant_id: &str) -> Result<()> {
        tracing::debug!("Free request for tenant {}", tenant_id);
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

    pub(crate) fn compute_allocations(&mut self) -> Result<()> {
        let reported = self.tenants.values().filter(|t| t.reported).count() as u64;
        if reported < self.num_tenants {
            tracing::debug!(
                "Skipping reconciliation: {}/{} tenants reported demand",
                reported,
                self.num_tenants
            );
            return Ok(());
        }

        // Never plan below what a tenant still holds; it has not released those yet.
        // Nobody can be granted more than the whole pool.
        let total = self.pool.total() as u64;
        let demands: HashMap<String, u64> = self
            .tenants
            .iter()
            .map(|(id, t)| (id.clone(), t.demand.max(t.held()).min(total)))
            .collect();

        self.karma_algorithm_fast(&demands)?;

        for tenant in self.tenants.values_mut() {
            tenant.credits = tenant.credits.saturating_add_signed(tenant.rate);
        }
        self.public.credits = self.public.credits.saturating_add_signed(self.public.rate);

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

        tracing::debug!(
            "Demands: {:?} Allocs: {:?} Credits: {:?}",
            demands,
            self.tenants
                .iter()
                .map(|(id, t)| (id.as_str(), t.allocation))
                .collect::<HashMap<_, _>>(),
            self.tenants
                .iter()
                .map(|(id, t)| (id.as_str(), t.credits))
                .collect::<HashMap<_, _>>()
        );
        tracing::info!(
            "Reconciled {} tenants: fair_share={}, public_credits={}, evicted={}",
            self.tenants.len(),
            self.fair_share(),
            self.public.credits,
            evicted
        );
        Ok(())
    }

    pub(crate) fn karma_algorithm_fast(&mut self, demands: &HashMap<String, u64>) -> Result<()> {
        let fair_share = self.fair_share();

        for tenant in self.tenants.values_mut() {
            tenant.rate = 0;
        }
        self.public.rate = 0;

        // Hand the public pool's earnings back so its currency does not pile up.
        // Split over the tenants actually registered, which may exceed `num_tenants`.
        let population = self.tenants.len() as u64;
        if population > 0 && self.public.credits >= population {
            let share = self.public.credits / population;
            for tenant in self.tenants.values_mut() {
                tenant.credits += share;
            }
            self.public.credits -= share * population;
        }

        let mut donors = Vec::new();
        let mut borrowers = Vec::new();
        for (id, &demand) in demands {
            let tenant = self.tenant_mut(id)?;
            tenant.allocation = demand.min(fair_share);
            if demand < fair_share {
                donors.push(id.clone());
            } else if demand > fair_share {
                borrowers.push(id.clone());
            }
        }
        donors.sort();
        borrowers.sort();

        let total_supply = self.public_blocks
            + donors
                .iter()
                .map(|id| fair_share - demands[id])
                .sum::<u64>();
        let mut total_demand = 0;
        for id in &borrowers {
            let credits = self.tenant_mut(id)?.credits;
            total_demand += (demands[id] - fair_share).min(credits);
        }

        if total_supply >= total_demand {
            self.borrow_from_poorest_fast(demands, &donors, &borrowers)
        } else {
            self.give_to_richest_fast(demands, &donors, &borrowers)
        }
    }

    /// Supply covers every borrower's credit-capped want. Borrowers get it all;
    /// donors lend poorest first, the public pool last.
    pub(crate) fn borrow_from_poorest_fast(
        &mut self,
        demands: &HashMap<String, u64>,
        donors: &[String],
        borrowers: &[String],
    ) -> Result<()> {
        let fair_share = self.fair_share();

        let mut owed = 0;
        for id in borrowers {
            let demand = demand_of(demands, id)?;
            let tenant = self.tenant_mut(id)?;
            let want = tenant.credits.min(demand.saturating_sub(fair_share));
            tenant.allocation += want;
            tenant.rate -= want as i64;
            owed += want;
        }

        let mut participants = Vec::with_capacity(donors.len() + 1);
        for id in donors {
            let demand = demand_of(demands, id)?;
            participants.push(Participant {
                id: id.clone(),
                level: self.tenant_mut(id)?.credits,
                capacity: fair_share.saturating_sub(demand),
            });
        }
        if self.public_blocks > 0 {
            participants.push(Participant {
                id: PUBLIC_TENANT.to_string(),
                level: u64::MAX,
                capacity: self.public_blocks,
            });
        }

        let outcome = water_fill(participants, owed);
        if outcome.leftover > 0 {
            return Err(AllocatorError::Internal(format!(
                "donor supply exhausted with {} blocks still owed to borrowers",
                outcome.leftover
            )));
        }
        for (id, lent) in outcome.taken {
            self.add_rate(&id, lent as i64)?;
        }
        Ok(())
    }

    /// Supply falls short of borrower want. Every donor lends everything; the
    /// richest borrowers are served first.
    pub(crate) fn give_to_richest_fast(
        &mut self,
        demands: &HashMap<String, u64>,
        donors: &[String],
        borrowers: &[String],
    ) -> Result<()> {
        let fair_share = self.fair_share();

        let mut supply = self.public_blocks;
        self.public.rate += self.public_blocks as i64;
        for id in donors {
            let lent = fair_share.saturating_sub(demand_of(demands, id)?);
            self.tenant_mut(id)?.rate += lent as i64;
            supply += lent;
        }

        let mut participants = Vec::with_capacity(borrowers.len());
        for id in borrowers {
            let demand = demand_of(demands, id)?;
            let tenant = self.tenant_mut(id)?;
            participants.push(Participant {
                id: id.clone(),
                // richest first: invert credits into an ascending level
                level: u64::MAX - tenant.credits,
                capacity: tenant.credits.min(demand.saturating_sub(fair_share)),
            });
        }

        let outcome = water_fill(participants, supply);
        if outcome.leftover > 0 {
            return Err(AllocatorError::Internal(format!(
                "{} lent blocks left unclaimed although borrower demand exceeds supply",
                outcome.leftover
            )));
        }
        for (id, borrowed) in outcome.taken {
            let tenant = self.tenant_mut(&id)?;
            tenant.allocation += borrowed;
            tenant.rate -= borrowed as i64;
        }
        Ok(())
    }

    fn tenant_mut(&mut self, tenant_id: &str) -> Result<&mut TenantState> {
        self.tenants
            .get_mut(tenant_id)
            .ok_or_else(|| AllocatorError::Internal(format!("no record for tenant {}", tenant_id)))
    }

    fn add_rate(&mut self, tenant_id: &str, delta: i64) -> Result<()> {
        match TenantKind::of(tenant_id) {
            TenantKind::Public => self.public.rate += delta,
            TenantKind::Real => self.tenant_mut(tenant_id)?.rate += delta,
        }
        Ok(())
    }
}

fn demand_of(demands: &HashMap<String, u64>, tenant_id: &str) -> Result<u64> {
    demands
        .get(tenant_id)
        .copied()
        .ok_or_else(|| AllocatorError::Internal(format!("no demand for tenant {}", tenant_id)))
}
