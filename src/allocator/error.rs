//! Allocator Error Taxonomy
//!
//! Every failure is returned synchronously to the immediate caller. The allocator
//! never retries internally.

pub type Result<T, E = AllocatorError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// Malformed request: `count != 1`, removing a block that is in use,
    /// or a block id without its `:<seq>` suffix.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No donor, no reclaim target, or no free block left to hand out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Blocks that the tenant tried to free but does not hold.
    #[error(
        "Could not free these blocks because they have not been allocated: {}",
        .0.join("; ")
    )]
    NotAllocated(Vec<String>),

    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),

    /// A modeling invariant of the fairness algorithm was violated
    /// (e.g. the public pool is too small for the configured tenant count).
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
