// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Kernel of a finite-domain constraint programming engine.
//!
//! The crate hosts *computation spaces*: self-contained constraint stores
//! that can be propagated to fixpoint, cloned cheaply for search, committed
//! to a branching alternative and torn down deterministically. Propagator
//! and branching libraries, concrete variable domains and search strategies
//! plug in from the outside; this crate is the runtime substrate they run
//! on.
//!
//! # Architecture
//!
//! The kernel has a two-tier memory model:
//!
//! ## Tier 1: per-space pools
//!
//! Each space owns a memory manager ([`alloc::SpaceAlloc`]) backing all
//! high-churn intra-space allocations (above all variable subscription
//! arrays), plus slot arenas for actors and advisors. Freed storage is
//! recycled within the space and released only when the space dies.
//!
//! ## Tier 2: the actor machinery
//!
//! Propagators and branchings live on an intrusive doubly-linked structure
//! whose links double as the eight cost-indexed propagation queues.
//! Variables keep partitioned subscription arrays; modification events
//! schedule subscribers by propagation condition and notify advisors
//! synchronously.
//!
//! # Search
//!
//! Search engines drive spaces through `status` / `description` / `clone`
//! / `commit` and never look inside. Cloning is a copying collection with
//! forward marks and a single reset pass, which is also the only sharing
//! primitive parallel search needs: a clone taken with `share = false`
//! owns everything it can reach and may move to another thread.
//!
//! [`search::bab`] picks the sequential or the parallel branch-and-bound
//! engine from the configured thread count.
//!
//! # Example
//!
//! ```no_run
//! use fdspace::search::{bab, Engine, Options};
//! use fdspace::space::Space;
//!
//! let space = Space::new();
//! // ... register variable types, create variables, post propagators and
//! // branchings, install the model ...
//! let mut engine = bab(space, &Options::default());
//! while let Some(better) = engine.next().unwrap() {
//!     // each yielded space is a solution better than the previous one
//!     let _ = better;
//! }
//! ```

pub mod actor;
pub mod advisor;
pub mod alloc;
pub mod errors;
pub mod handle;
pub mod search;
pub mod space;
pub mod support;
pub mod var;

// Re-export commonly used types
pub use actor::{
    ActorId, ActorProperty, Branch, BranchId, DescBase, Description, ExecStatus, PropCost,
    Propagate,
};
pub use advisor::{Advice, AdvisorId, Advisors, Council};
pub use errors::SpaceError;
pub use handle::{CopiedHandle, CopyObject, ShareObject, SharedHandle};
pub use space::{CloneCtx, Counter, Model, Space, SpaceStatus, Statistics};
pub use var::{
    Delta, ModEvent, ModEventDelta, PropCond, VarConf, VarImp, VarRef, VarType, ME_GEN_ASSIGNED,
    ME_GEN_FAILED, ME_GEN_NONE, PC_GEN_ASSIGNED, PC_GEN_NONE,
};
