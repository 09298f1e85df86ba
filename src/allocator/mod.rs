//! Fair-Share Block Allocation Module
//!
//! Decides how many storage blocks each tenant owns as demand fluctuates.
//!
//! ## Core Concepts
//! - **Fair share**: `(total blocks - public blocks) / tenants`, every tenant's guaranteed floor.
//! - **Karma**: tenants below their fair share lend the rest and earn credits; tenants above it
//!   borrow and spend credits. Poorest donors lend first, richest borrowers are served first.
//! - **Max-min**: credit-free water-filling baseline.
//! - **Epochs**: `compute_allocations` recomputes caps on a fixed period (`Reconciler`);
//!   `allocate`/`free` only consume the caps of the last epoch.
//! - **Sequence numbers**: block ids carry `:<seq>`, bumped on ownership transfer, so clients
//!   can detect stale ownership.

pub mod accumulator;
pub mod error;
pub mod karma;
pub mod maxmin;
pub mod policy;
pub mod pool;
pub mod reconciler;
pub mod types;
pub mod waterfill;

pub use error::{AllocatorError, Result};
pub use karma::KarmaAllocator;
pub use maxmin::MaxMinAllocator;
pub use policy::{AllocationPolicy, tenant_of_path};
pub use reconciler::Reconciler;
