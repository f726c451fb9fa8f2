//! Operation interface consumed by the transform engine.
//!
//! The engine itself lives behind this seam: the directory only needs
//! operations that can be transformed against concurrent operations,
//! applied to a buffer, reverted, and copied (operations are stored by
//! value, so `Clone` is the copy). Per-type behavior comes from the note
//! plugin that defines the operation.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperationFlags: u32 {
        /// Applying the operation changes buffer content.
        const AFFECTS_BUFFER = 1 << 0;
        /// `revert` produces an exact inverse.
        const REVERSIBLE = 1 << 1;
    }
}

/// Tie-breaker for transform pairs that position alone cannot order.
/// The two sides of a concurrent pair must be handed opposite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyId {
    /// This operation wins the tie: its effect stays in place.
    Mine,
    /// The other operation wins: this one is displaced past it.
    Theirs,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("attempt to insert text after the end of the document")]
    InvalidInsert,
    #[error("content to delete does not match the document")]
    InconsistentDelete,
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::InvalidInsert => "invalid-insert",
            ApplyError::InconsistentDelete => "inconsistent-delete",
        }
    }
}

pub trait Operation: Clone + Sized {
    type Buffer;

    /// `true` when transforming against `against` needs a [`ConcurrencyId`]
    /// to break a positional tie.
    fn need_concurrency_id(&self, against: &Self) -> bool;

    /// Rewrite this operation to apply after `against` has been applied.
    fn transform(&self, against: &Self, cid: Option<ConcurrencyId>) -> Self;

    fn apply(&self, buffer: &mut Self::Buffer) -> Result<(), ApplyError>;

    /// The inverse operation. Only meaningful when
    /// [`OperationFlags::REVERSIBLE`] is set.
    fn revert(&self) -> Self;

    fn flags(&self) -> OperationFlags;
}
