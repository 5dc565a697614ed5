// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Error types for space operations.
//!
//! Failure *during propagation* is in-band: a propagator returns
//! [`ExecStatus::Failed`](crate::actor::ExecStatus) and the space records it
//! by clearing its active queue cursor. The error values here cover the
//! out-of-band precondition violations that search engines can run into when
//! driving a space.

use std::fmt;
use strum_macros::EnumCount as EnumCountMacro;

/// Errors reported by space operations invoked from search engines.
#[derive(Debug, Clone, PartialEq, Eq, EnumCountMacro)]
pub enum SpaceError {
    /// Operation requires a space that has not failed.
    Failed { op: &'static str },

    /// Operation requires a stable space (status must have run to fixpoint).
    NotStable { op: &'static str },

    /// Commit was attempted but the space has no current branching left.
    NoBranching,

    /// Commit was given an alternative outside the description's range.
    IllegalAlternative { alt: u32, alternatives: u32 },

    /// Best-solution search was used but the model does not define
    /// `constrain`.
    ConstrainUndefined,
}

impl fmt::Display for SpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceError::Failed { op } => {
                write!(f, "{}: space is failed", op)
            }
            SpaceError::NotStable { op } => {
                write!(f, "{}: space is not stable", op)
            }
            SpaceError::NoBranching => {
                write!(f, "commit: space has no current branching")
            }
            SpaceError::IllegalAlternative { alt, alternatives } => {
                write!(
                    f,
                    "commit: alternative {} out of range (description has {})",
                    alt, alternatives
                )
            }
            SpaceError::ConstrainUndefined => {
                write!(f, "constrain: model does not define a constrain function")
            }
        }
    }
}

impl std::error::Error for SpaceError {}
