// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Advisors and councils.
//!
//! An advisor is a fine-grained callback attached to one propagator: when a
//! variable the advisor is subscribed to changes, the propagator's `advise`
//! runs synchronously from the modification call site, receiving the
//! advisor and a [`Delta`](crate::var::Delta) describing the change.
//!
//! A propagator keeps its advisors in a [`Council`]: a singly-linked chain
//! through the space's advisor arena. Advisors never move and are never
//! compacted while their propagator is alive; disposal only marks the
//! advisor, and traversals skip and lazily unlink marked entries. This is
//! load-bearing for the advise scan: an advisor that disposes itself in the
//! middle of a notification must not cause a live neighbour to be skipped.
//! Disposed entries drop out of subscription arrays for good when the space
//! is cloned.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::actor::ActorId;
use crate::space::{CloneCtx, Space};

/// Handle to an advisor cell within one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisorId(pub(crate) u32);

/// User payload carried by an advisor.
///
/// Typically stores the view the advisor watches plus whatever the
/// propagator needs to interpret the notification cheaply.
pub trait Advice: Send + 'static {
    /// Duplicate the payload for a clone in progress; variable handles must
    /// be pushed through `ctx`.
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Advice>;

    /// Downcast access.
    fn as_any(&self) -> &dyn Any;

    /// Downcast access, mutable.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct AdvCell {
    /// The advisor's propagator.
    pub(crate) prop: ActorId,
    /// Next advisor in the owning council's chain.
    pub(crate) next: Option<AdvisorId>,
    /// `None` once disposed (the payload is dropped on disposal).
    pub(crate) payload: Option<Box<dyn Advice>>,
    pub(crate) disposed: bool,
    /// During cloning: index of this advisor's copy in the clone.
    pub(crate) fwd: Option<AdvisorId>,
}

/// Arena of advisor cells.
///
/// Append-only: cells are marked disposed rather than removed, so stale
/// subscription entries can always be recognized; a clone copies only live
/// advisors and thereby compacts.
pub(crate) struct AdvisorArena {
    cells: Vec<AdvCell>,
}

impl AdvisorArena {
    pub(crate) fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub(crate) fn insert(&mut self, cell: AdvCell) -> AdvisorId {
        let i = self.cells.len() as u32;
        self.cells.push(cell);
        AdvisorId(i)
    }

    pub(crate) fn cell(&self, a: AdvisorId) -> &AdvCell {
        &self.cells[a.0 as usize]
    }

    pub(crate) fn cell_mut(&mut self, a: AdvisorId) -> &mut AdvCell {
        &mut self.cells[a.0 as usize]
    }

    pub(crate) fn disposed(&self, a: AdvisorId) -> bool {
        self.cells[a.0 as usize].disposed
    }

    pub(crate) fn prop_of(&self, a: AdvisorId) -> ActorId {
        debug_assert!(!self.disposed(a));
        self.cells[a.0 as usize].prop
    }

    /// Mark `a` disposed and drop its payload. Shortens the chain by one if
    /// the successor is already disposed.
    pub(crate) fn mark_disposed(&mut self, a: AdvisorId) {
        let next = self.cells[a.0 as usize].next;
        if let Some(n) = next {
            if self.cells[n.0 as usize].disposed {
                self.cells[a.0 as usize].next = self.cells[n.0 as usize].next;
            }
        }
        let cell = &mut self.cells[a.0 as usize];
        debug_assert!(!cell.disposed, "advisor disposed twice");
        cell.disposed = true;
        cell.payload = None;
    }

    pub(crate) fn fwd(&self, a: AdvisorId) -> Option<AdvisorId> {
        self.cells[a.0 as usize].fwd
    }

    pub(crate) fn set_fwd(&mut self, a: AdvisorId, to: AdvisorId) {
        self.cells[a.0 as usize].fwd = Some(to);
    }

    pub(crate) fn clear_fwd(&mut self, a: AdvisorId) {
        self.cells[a.0 as usize].fwd = None;
    }
}

impl fmt::Debug for AdvisorArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisorArena").field("cells", &self.cells.len()).finish()
    }
}

/// A propagator's collection of advisors.
///
/// Holds the head of a singly-linked chain through the space's advisor
/// arena. Traversal lazily unlinks disposed entries.
pub struct Council<A: Advice> {
    head: Option<AdvisorId>,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Advice> Council<A> {
    /// An empty council.
    pub fn new() -> Self {
        Self { head: None, _marker: PhantomData }
    }

    pub(crate) fn head(&self) -> Option<AdvisorId> {
        self.head
    }

    pub(crate) fn with_head(head: Option<AdvisorId>) -> Self {
        Self { head, _marker: PhantomData }
    }

    pub(crate) fn set_head(&mut self, head: Option<AdvisorId>) {
        self.head = head;
    }

    /// Whether no live advisor is left. Skips and unlinks disposed entries
    /// from the head of the chain.
    pub fn empty(&mut self, home: &Space) -> bool {
        let mut h = self.head;
        while let Some(a) = h {
            if !home.core.advisors.disposed(a) {
                break;
            }
            h = home.core.advisors.cell(a).next;
        }
        self.head = h;
        h.is_none()
    }

    /// Iterate over the live advisors of this council.
    pub fn advisors<'a>(&self, home: &'a Space) -> Advisors<'a, A> {
        Advisors { next: self.head, arena: &home.core.advisors, _marker: PhantomData }
    }

    /// Dispose every remaining live advisor.
    ///
    /// Subscriptions held by the advisors must already have been cancelled
    /// (the propagator's `dispose` does that before calling this).
    pub fn dispose(&mut self, home: &mut Space) {
        let mut h = self.head;
        while let Some(a) = h {
            h = home.core.advisors.cell(a).next;
            if !home.core.advisors.disposed(a) {
                home.core.advisors.mark_disposed(a);
            }
        }
        self.head = None;
    }
}

impl<A: Advice> Default for Council<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Advice> fmt::Debug for Council<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Council").field("head", &self.head).finish()
    }
}

/// Iterator over the live advisors of a council.
pub struct Advisors<'a, A: Advice> {
    next: Option<AdvisorId>,
    arena: &'a AdvisorArena,
    _marker: PhantomData<fn() -> A>,
}

impl<'a, A: Advice> Iterator for Advisors<'a, A> {
    type Item = (AdvisorId, &'a A);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(a) = self.next {
            let cell = self.arena.cell(a);
            self.next = cell.next;
            if cell.disposed {
                continue;
            }
            let payload = cell
                .payload
                .as_ref()
                .expect("live advisor has payload")
                .as_any()
                .downcast_ref::<A>()
                .expect("council advisor type");
            return Some((a, payload));
        }
        None
    }
}
