// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Search dispatch.
//!
//! Exposes [`bab`], the branch-and-bound entry point shared by all search
//! frontends: it inspects the configured thread count and hands the root
//! space to either the sequential or the parallel engine. The engines
//! drive spaces exclusively through `status` / `description` / `clone` /
//! `commit` and report improving solutions through [`Engine::next`].

pub mod sequential;

#[cfg(feature = "threads")]
pub mod parallel;

use tracing::debug;

use crate::errors::SpaceError;
use crate::space::{Space, Statistics};

/// Search configuration.
///
/// `threads` selects the engine: zero probes the machine, one forces the
/// sequential engine, anything larger the parallel one. The recomputation
/// distances `c_d` and `a_d` are tuning knobs consumed by engines that
/// implement hybrid recomputation; the engines shipped here explore by
/// cloning and carry them for compatibility.
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker threads; 0 = one per available hardware thread.
    pub threads: usize,
    /// Commit recomputation distance.
    pub c_d: usize,
    /// Adaptive recomputation distance.
    pub a_d: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { threads: 1, c_d: 8, a_d: 2 }
    }
}

impl Options {
    /// The effective thread count, probing the OS when `threads` is 0.
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.threads
        }
    }
}

/// A running search.
pub trait Engine: Send {
    /// The next solution, each better than the one before, or `None` once
    /// the search space is exhausted.
    fn next(&mut self) -> Result<Option<Space>, SpaceError>;

    /// Counters accumulated so far.
    fn statistics(&self) -> Statistics;
}

/// Create a branch-and-bound engine for `space`.
///
/// With an effective thread count of one, or without the `threads`
/// feature, the sequential engine runs; otherwise the parallel one.
pub fn bab(space: Space, options: &Options) -> Box<dyn Engine> {
    let threads = options.resolved_threads();
    #[cfg(feature = "threads")]
    {
        if threads > 1 {
            debug!(threads, "branch-and-bound: parallel engine");
            return Box::new(parallel::ParBab::new(space, threads));
        }
    }
    let _ = threads;
    debug!("branch-and-bound: sequential engine");
    Box::new(sequential::SeqBab::new(space))
}
