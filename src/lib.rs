//! Fair-Share Block Allocator Library
//!
//! This library crate defines the allocation core of a multi-tenant storage node.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`allocator`**: Block pool, the `AllocationPolicy` contract, the Karma and
//!   Max-min policies, and the background reconciliation loop that recomputes
//!   per-tenant caps every epoch.
//! - **`config`**: Node settings (policy, tenant count, pool sizes, periods) loaded
//!   from defaults, an optional JSON file and command-line overrides.

pub mod allocator;
pub mod config;
