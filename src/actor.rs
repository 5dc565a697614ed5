// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Actors: propagators and branchings, and the doubly-linked structure that
//! organizes them inside a space.
//!
//! Every actor occupies one cell in the space's actor arena. A cell carries
//! the `(next, prev)` links of an intrusive doubly-linked list, expressed as
//! arena indices rather than pointers. The same links serve two purposes:
//! idle actors hang off the space's actor-list sentinel (propagators toward
//! the head, branchings toward the tail), while scheduled propagators hang
//! off one of the eight cost-queue sentinels. An actor is in exactly one of
//! these lists at any time.
//!
//! Cells `0..=7` are the cost-queue sentinels, cell `8` is the actor-list
//! sentinel and real actors start at cell `9`. Freed cells are recycled
//! through a free list, so actor churn does not grow the arena.

use std::fmt;

use crate::advisor::AdvisorId;
use crate::space::{CloneCtx, Space};
use crate::var::{Delta, ModEventDelta};

/// Handle to an actor cell within one space.
///
/// Handles are only meaningful for the space that issued them; a clone
/// issues its own handles during copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(pub(crate) u32);

/// Identity a branching stamps into the descriptions it produces.
///
/// Monotonically increasing per space and preserved across cloning, which
/// is what lets a description produced by one space be committed on a
/// clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub(crate) u32);

impl BranchId {
    /// Raw id value, mainly useful in traces.
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Status of executing a propagator, an advisor or a commit.
///
/// `Failed`, `Nofix` and `Fix` are shared by all three contracts.
/// `Subsumed` and `Partial` may only be returned from
/// [`Propagate::propagate`]; `SubsumedFix` and `SubsumedNofix` only from
/// [`Propagate::advise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Execution has resulted in failure.
    Failed,
    /// Propagation has not computed a fixpoint (for commit: okay).
    Nofix,
    /// Propagation has computed a fixpoint.
    Fix,
    /// The propagator is done for good and must be removed and reclaimed.
    /// Carries the byte size to reclaim. The propagator must have cancelled
    /// all of its subscriptions (usually by calling its own `dispose`)
    /// before returning this.
    Subsumed(usize),
    /// The propagator has consumed part of its pending events.
    ///
    /// With `fix: true` the propagator is at fixpoint with respect to the
    /// events it consumed and `med` holds the remaining ones; with
    /// `fix: false` the events in `med` are merged into the pending delta.
    Partial { med: ModEventDelta, fix: bool },
    /// The advisor is subsumed; its propagator need not run.
    SubsumedFix,
    /// The advisor is subsumed; its propagator must run.
    SubsumedNofix,
}

impl ExecStatus {
    /// Execution is okay (alias used by commit implementations).
    pub const OK: ExecStatus = ExecStatus::Nofix;
}

/// Classification of propagation cost.
///
/// The class (0 = exponential .. 7 = unary) selects the queue a scheduled
/// propagator waits in; higher classes are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropCost {
    /// Exponential complexity, cheap.
    CrazyLo,
    /// Exponential complexity, expensive.
    CrazyHi,
    /// Cubic complexity, cheap.
    CubicLo,
    /// Cubic complexity, expensive.
    CubicHi,
    /// Quadratic complexity, cheap.
    QuadraticLo,
    /// Quadratic complexity, expensive.
    QuadraticHi,
    /// Linear complexity, expensive.
    LinearHi,
    /// Linear complexity, cheap.
    LinearLo,
    /// Three variables, expensive.
    TernaryHi,
    /// Two variables, expensive.
    BinaryHi,
    /// Three variables, cheap.
    TernaryLo,
    /// Two variables, cheap.
    BinaryLo,
    /// Single variable, cheap.
    UnaryLo,
    /// Single variable, expensive.
    UnaryHi,
}

/// Highest cost class.
pub const PC_MAX: usize = 7;

impl PropCost {
    /// Queue index for this cost.
    pub fn class(self) -> usize {
        match self {
            PropCost::CrazyLo | PropCost::CrazyHi => 0,
            PropCost::CubicLo | PropCost::CubicHi => 1,
            PropCost::QuadraticLo | PropCost::QuadraticHi => 2,
            PropCost::LinearHi => 3,
            PropCost::LinearLo => 4,
            PropCost::TernaryHi => 5,
            PropCost::BinaryHi | PropCost::TernaryLo => 6,
            PropCost::BinaryLo | PropCost::UnaryLo | PropCost::UnaryHi => 7,
        }
    }
}

/// Properties an actor can register with its space via
/// [`Space::notice`](crate::space::Space::notice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorProperty {
    /// The actor holds external resources and must be disposed even when
    /// its space is torn down.
    Dispose,
    /// The propagator is only weakly monotonic (monotonic on assignments
    /// only).
    WeaklyMonotonic,
}

/// Base record every branching description carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescBase {
    id: u32,
    alternatives: u32,
}

impl DescBase {
    /// Initialize for the branching identified by `id` with `alternatives`
    /// alternatives.
    pub fn new(id: BranchId, alternatives: u32) -> Self {
        Self { id: id.0, alternatives }
    }

    /// Number of alternatives of this description.
    pub fn alternatives(&self) -> u32 {
        self.alternatives
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

/// A replayable record of a choice point.
///
/// Descriptions live on the plain heap, are owned by the search engine and
/// may outlive the space that produced them. The payload must be sufficient
/// for the branching's `commit` to redo the tell; `commit` recovers it by
/// downcasting through [`Description::as_any`].
pub trait Description: Send {
    /// The identity and alternative count of this description.
    fn base(&self) -> &DescBase;

    /// Downcast access to the concrete description.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Contract for propagators.
///
/// A propagator narrows variable domains until it reaches a fixpoint,
/// proves itself redundant or detects failure. It runs to completion; there
/// are no suspension points inside `propagate`.
pub trait Propagate: Send {
    /// Perform propagation for the pending modification event delta `med`.
    ///
    /// May return `Failed`, `Nofix`, `Fix`, `Subsumed` or `Partial`; the
    /// meaning of each is documented on [`ExecStatus`]. A propagator that
    /// returns `Subsumed` must already have cancelled its subscriptions.
    fn propagate(&mut self, home: &mut Space, med: ModEventDelta) -> ExecStatus;

    /// Cost of running this propagator given the pending delta `med`.
    fn cost(&self, med: ModEventDelta) -> PropCost;

    /// React to a modification of a variable one of this propagator's
    /// advisors is subscribed to.
    ///
    /// May return `Failed`, `Fix`, `Nofix`, `SubsumedFix` or
    /// `SubsumedNofix`. Advisors run from the modification call site and
    /// must not modify variable domains.
    fn advise(&mut self, home: &mut Space, a: AdvisorId, d: &Delta) -> ExecStatus {
        let _ = (home, a, d);
        ExecStatus::Fix
    }

    /// Create this propagator's copy for a clone in progress.
    ///
    /// Variable handles and councils must be pushed through `ctx` so the
    /// clone refers to the copied variables and advisors.
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate>;

    /// Cancel all subscriptions, release resources and report the byte size
    /// occupied by this propagator.
    fn dispose(&mut self, home: &mut Space) -> usize {
        let _ = home;
        std::mem::size_of_val(self)
    }

    /// Bytes of additional heap data owned by this propagator.
    fn allocated(&self) -> usize {
        0
    }
}

/// Contract for branchings.
pub trait Branch: Send {
    /// Whether this branching still has alternatives for the current space
    /// state. Called once propagation has reached a fixpoint.
    fn status(&self, home: &Space) -> bool;

    /// Produce a fresh description for the current choice point.
    ///
    /// Called exactly once after `status` returned true, before any other
    /// non-const operation on the space. `id` is this branching's identity
    /// and must be stored in the description's [`DescBase`].
    fn description(&mut self, home: &mut Space, id: BranchId) -> Box<dyn Description>;

    /// Apply alternative `alt` of description `d`.
    ///
    /// Returns [`ExecStatus::Failed`] if the commit directly failed, else
    /// [`ExecStatus::OK`].
    fn commit(&mut self, home: &mut Space, d: &dyn Description, alt: u32) -> ExecStatus;

    /// Create this branching's copy for a clone in progress.
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Branch>;

    /// Release resources and report the byte size occupied.
    fn dispose(&mut self, home: &mut Space) -> usize {
        let _ = home;
        std::mem::size_of_val(self)
    }
}

/// The disjoint interpretations of a propagator's scratch word across its
/// lifecycle. During propagation it holds the pending event delta; upon
/// subsumption the byte size the space reclaims. (The advisor-chain resets
/// of the cloning phase are queued in the space's cloning control block
/// instead of here.)
#[derive(Debug)]
pub(crate) enum PropTag {
    /// During propagation: the pending modification event delta.
    Med(ModEventDelta),
    /// Upon subsumption: the byte size to reclaim.
    Size(usize),
}

pub(crate) enum ActorBody {
    /// Queue or list sentinel; never holds an actor.
    Sentinel,
    /// Freed cell, chained into the arena free list.
    Vacant { next_free: Option<u32> },
    /// Cell reserved by a post in progress.
    Reserved,
    /// A propagator. `body` is `None` only while checked out for a call.
    Prop { body: Option<Box<dyn Propagate>>, tag: PropTag },
    /// A branching with its description-matching identity.
    Branch { body: Option<Box<dyn Branch>>, bid: u32 },
}

pub(crate) struct ActorCell {
    next: u32,
    prev: u32,
    pub(crate) body: ActorBody,
    /// During cloning: index of this actor's copy in the clone.
    pub(crate) fwd: Option<u32>,
}

impl ActorCell {
    /// A self-linked propagator cell with an empty pending delta.
    pub(crate) fn new_prop(i: u32, body: Box<dyn Propagate>) -> Self {
        ActorCell {
            next: i,
            prev: i,
            body: ActorBody::Prop { body: Some(body), tag: PropTag::Med(0) },
            fwd: None,
        }
    }

    /// A propagator cell whose body is still under construction;
    /// subscriptions made meanwhile accumulate events in the delta.
    pub(crate) fn new_prop_pending(i: u32) -> Self {
        ActorCell {
            next: i,
            prev: i,
            body: ActorBody::Prop { body: None, tag: PropTag::Med(0) },
            fwd: None,
        }
    }

    /// A self-linked branching cell carrying identity `bid`.
    pub(crate) fn new_branch(i: u32, body: Box<dyn Branch>, bid: u32) -> Self {
        ActorCell { next: i, prev: i, body: ActorBody::Branch { body: Some(body), bid }, fwd: None }
    }
}

/// Number of cost queues.
pub(crate) const N_QUEUES: u32 = (PC_MAX + 1) as u32;
/// Arena index of the actor-list sentinel.
pub(crate) const SENTINEL_ACTORS: u32 = N_QUEUES;
/// First arena index that can hold a real actor.
pub(crate) const FIRST_ACTOR: u32 = SENTINEL_ACTORS + 1;

/// Arena of actor cells plus the intrusive link structure.
pub(crate) struct ActorArena {
    cells: Vec<ActorCell>,
    free_head: Option<u32>,
}

impl ActorArena {
    pub(crate) fn new() -> Self {
        let mut cells = Vec::with_capacity(FIRST_ACTOR as usize + 8);
        for i in 0..FIRST_ACTOR {
            cells.push(ActorCell { next: i, prev: i, body: ActorBody::Sentinel, fwd: None });
        }
        Self { cells, free_head: None }
    }

    /// Reserve a cell for a post in progress; the cell is self-linked.
    pub(crate) fn reserve(&mut self) -> u32 {
        let i = match self.free_head {
            Some(i) => {
                self.free_head = match self.cells[i as usize].body {
                    ActorBody::Vacant { next_free } => next_free,
                    _ => unreachable!("actor free list points at live cell"),
                };
                self.cells[i as usize].body = ActorBody::Reserved;
                i
            }
            None => {
                let i = self.cells.len() as u32;
                self.cells.push(ActorCell {
                    next: i,
                    prev: i,
                    body: ActorBody::Reserved,
                    fwd: None,
                });
                i
            }
        };
        self.cells[i as usize].next = i;
        self.cells[i as usize].prev = i;
        i
    }

    /// Free a cell for reuse. The cell must already be unlinked.
    pub(crate) fn release(&mut self, i: u32) {
        debug_assert!(i >= FIRST_ACTOR);
        self.cells[i as usize].body = ActorBody::Vacant { next_free: self.free_head };
        self.cells[i as usize].fwd = None;
        self.free_head = Some(i);
    }

    pub(crate) fn cell(&self, i: u32) -> &ActorCell {
        &self.cells[i as usize]
    }

    pub(crate) fn cell_mut(&mut self, i: u32) -> &mut ActorCell {
        &mut self.cells[i as usize]
    }

    pub(crate) fn next(&self, i: u32) -> u32 {
        self.cells[i as usize].next
    }

    pub(crate) fn prev(&self, i: u32) -> u32 {
        self.cells[i as usize].prev
    }

    /// Remove `i` from its list and leave it self-linked.
    pub(crate) fn unlink(&mut self, i: u32) {
        let p = self.cells[i as usize].prev;
        let n = self.cells[i as usize].next;
        self.cells[p as usize].next = n;
        self.cells[n as usize].prev = p;
        self.cells[i as usize].next = i;
        self.cells[i as usize].prev = i;
    }

    /// Insert `n` directly after `at` (at the head of `at`'s chain).
    pub(crate) fn head(&mut self, at: u32, n: u32) {
        let old = self.cells[at as usize].next;
        self.cells[at as usize].next = n;
        self.cells[n as usize].prev = at;
        self.cells[n as usize].next = old;
        self.cells[old as usize].prev = n;
    }

    /// Insert `n` directly before `at` (at the tail of `at`'s chain).
    pub(crate) fn tail(&mut self, at: u32, n: u32) {
        let old = self.cells[at as usize].prev;
        self.cells[n as usize].next = at;
        self.cells[at as usize].prev = n;
        self.cells[old as usize].next = n;
        self.cells[n as usize].prev = old;
    }

    /// Whether the list hanging off sentinel `s` is empty.
    pub(crate) fn list_empty(&self, s: u32) -> bool {
        self.cells[s as usize].next == s
    }
}

impl fmt::Debug for ActorArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorArena").field("cells", &self.cells.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_self_linked() {
        let a = ActorArena::new();
        for i in 0..FIRST_ACTOR {
            assert_eq!(a.next(i), i);
            assert_eq!(a.prev(i), i);
            assert!(a.list_empty(i));
        }
    }

    #[test]
    fn test_head_and_tail_order() {
        let mut a = ActorArena::new();
        let x = a.reserve();
        let y = a.reserve();
        let z = a.reserve();
        // head inserts in reverse arrival order, tail in arrival order
        a.head(SENTINEL_ACTORS, x);
        a.head(SENTINEL_ACTORS, y);
        a.tail(SENTINEL_ACTORS, z);
        assert_eq!(a.next(SENTINEL_ACTORS), y);
        assert_eq!(a.next(y), x);
        assert_eq!(a.next(x), z);
        assert_eq!(a.next(z), SENTINEL_ACTORS);
        assert_eq!(a.prev(SENTINEL_ACTORS), z);
    }

    #[test]
    fn test_unlink_relinks_neighbours() {
        let mut a = ActorArena::new();
        let x = a.reserve();
        let y = a.reserve();
        a.tail(SENTINEL_ACTORS, x);
        a.tail(SENTINEL_ACTORS, y);
        a.unlink(x);
        assert_eq!(a.next(SENTINEL_ACTORS), y);
        assert_eq!(a.prev(y), SENTINEL_ACTORS);
        // Unlinked cell is self-linked.
        assert_eq!(a.next(x), x);
        assert_eq!(a.prev(x), x);
    }

    #[test]
    fn test_release_recycles_cells() {
        let mut a = ActorArena::new();
        let x = a.reserve();
        a.release(x);
        let y = a.reserve();
        assert_eq!(x, y);
    }

    #[test]
    fn test_cost_classes() {
        assert_eq!(PropCost::CrazyHi.class(), 0);
        assert_eq!(PropCost::LinearHi.class(), 3);
        assert_eq!(PropCost::LinearLo.class(), 4);
        assert_eq!(PropCost::TernaryLo.class(), 6);
        assert_eq!(PropCost::UnaryHi.class(), PC_MAX);
        assert_eq!(PropCost::BinaryLo.class(), 7);
    }

    #[test]
    fn test_exec_status_ok_alias() {
        assert_eq!(ExecStatus::OK, ExecStatus::Nofix);
    }
}
