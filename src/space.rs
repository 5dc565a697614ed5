// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Computation spaces.
//!
//! A [`Space`] is a self-contained constraint store: it owns a memory
//! manager, the actor arena (propagators and branchings), the advisor
//! arena, per-category variable stores and the cost-indexed propagation
//! queues. Search engines drive it through four operations: `status`
//! propagates to fixpoint or failure, `description` asks the current
//! branching for an alternative set, `clone` duplicates the space, and
//! `commit` applies one alternative of a description.
//!
//! # States
//!
//! A space is in exactly one of four states: *propagating* (the active
//! cursor points at a cost queue), *idle-stable* (the cursor slid below
//! queue 0), *failed* (the cursor is cleared) or *cloning* (the control
//! block is switched to the per-category update lists of a clone in
//! progress). The first three share the propagation-mode control block.
//!
//! # Propagation
//!
//! Scheduled propagators wait in one of eight queues indexed by
//! [`PropCost`](crate::actor::PropCost) class; the active cursor starts at
//! the highest occupied class and slides down, so more expensive classes
//! run first and ties are broken FIFO within a queue. A propagator's
//! pending events accumulate in its modification event delta, which is
//! cleared when the propagator is dequeued; scheduling is therefore
//! idempotent per propagation round.
//!
//! # Cloning
//!
//! Cloning is a copying collection: only variables and objects reachable
//! from the actors and the model's `copy` hook make it into the clone.
//! The first encounter of a variable copies it and records a forward mark
//! in the original; after all actors are copied, a single reset pass
//! rebuilds every clone variable's subscription array into one contiguous
//! region (mapping subscriptions through the actor forwards) and clears
//! the marks, leaving the original exactly as it was.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use strum::EnumCount;
use strum_macros::EnumCount as EnumCountMacro;
use tracing::trace;

use crate::actor::{
    ActorArena, ActorBody, ActorId, ActorProperty, Branch, BranchId, Description, ExecStatus,
    Propagate, PropTag, SENTINEL_ACTORS,
};
use crate::advisor::{AdvCell, Advice, AdvisorArena, AdvisorId, Council};
use crate::alloc::SpaceAlloc;
use crate::errors::SpaceError;
use crate::handle::CopiedCell;
use crate::support::SlotArena;
use crate::var::{
    sub_bytes, Delta, ModEvent, ModEventDelta, PropCond, SubCursor, VarConf, VarRef, VarTable,
    VarType,
};

/// Result of querying a space's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceStatus {
    /// The space is failed.
    Failed,
    /// The space is solved (no branching left).
    Solved,
    /// The space must be branched (at least one branching left).
    Branch,
}

/// Counters tracked across propagation and search.
#[derive(EnumCountMacro, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Counter {
    /// Propagator executions.
    Propagations,
    /// Search tree nodes expanded.
    Nodes,
    /// Failed spaces encountered during search.
    Failures,
    /// Solutions found.
    Solutions,
    /// Clones created.
    Clones,
    /// Commits performed.
    Commits,
}

/// Counter block shared by spaces and search engines.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    stats: [u64; Counter::COUNT],
    /// Set by `status` when a weakly monotonic propagator existed at any
    /// point since the last fixpoint.
    pub weakly_monotonic: bool,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics::default()
    }

    /// Current value of `counter`.
    pub fn get(&self, counter: Counter) -> u64 {
        self.stats[counter as usize]
    }

    /// Add `n` to `counter`.
    pub fn add(&mut self, counter: Counter, n: u64) {
        self.stats[counter as usize] += n;
    }

    /// Increment `counter` by one.
    pub fn incr(&mut self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Fold another counter block into this one.
    pub fn merge(&mut self, other: &Statistics) {
        for i in 0..Counter::COUNT {
            self.stats[i] += other.stats[i];
        }
        self.weakly_monotonic |= other.weakly_monotonic;
    }
}

/// The user model: root variable handles and problem-specific state.
///
/// The search-facing mirror of subclassing a space: `copy` duplicates the
/// roots for a clone (pushing every handle through the clone context) and
/// `constrain` posts the betterness constraint for best-solution search.
pub trait Model: Send {
    /// Duplicate the model for a clone in progress.
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Model>;

    /// Constrain `home` to admit only solutions better than `best`.
    fn constrain(&mut self, home: &mut Space, best: &Space) -> Result<(), SpaceError> {
        let _ = (home, best);
        Err(SpaceError::ConstrainUndefined)
    }

    /// Downcast access for solution extraction.
    fn as_any(&self) -> &dyn Any;
}

/// Where the active cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    /// The space is failed.
    Failed,
    /// Below the queues: stable.
    Idle,
    /// Propagation pending at this cost class or below.
    Queue(u8),
}

/// Cloning-mode control block.
struct CloneCtl {
    /// Per-category lists of original variable indices awaiting the reset
    /// pass.
    updates: Vec<Vec<u32>>,
    /// Copied-object originals whose forward marks need clearing.
    copied: Vec<u32>,
    /// Advisors whose forward marks need clearing (the queued advisor
    /// resets).
    adv_reset: Vec<AdvisorId>,
    saved_branch_id: u32,
    saved_n_sub: u32,
}

/// Union-valued control block: propagation mode or cloning mode.
enum Ctl {
    Prop { active: Active, branch_id: u32, n_sub: u32 },
    Clone(CloneCtl),
}

/// Everything of a space except variable storage and the model.
///
/// Variable implementation methods take a `&mut Core` so that a borrowed
/// variable and the scheduling machinery can be used side by side.
pub struct Core {
    pub(crate) mm: SpaceAlloc,
    pub(crate) actors: ActorArena,
    pub(crate) advisors: AdvisorArena,
    pub(crate) copied: SlotArena<CopiedCell>,
    ctl: Ctl,
    /// First branching to be used for status; `SENTINEL_ACTORS` if none.
    b_status: u32,
    /// First branching to be used for commit. May trail `b_status`: an
    /// earlier branching can be exhausted while descriptions referring to
    /// it are still pending.
    b_commit: u32,
    /// Weakly-monotonic bookkeeping: 0 = none; 1 = none now, but one
    /// existed since the last fixpoint; n >= 2 = n - 1 live.
    n_wmp: u32,
    /// Actors registered for forced disposal; `None` once teardown has
    /// claimed the list.
    d: Option<Vec<ActorId>>,
    /// Bytes reclaimed from subsumed propagators and spent branchings.
    reclaimed: usize,
}

impl Core {
    fn new() -> Self {
        Self {
            mm: SpaceAlloc::new(),
            actors: ActorArena::new(),
            advisors: AdvisorArena::new(),
            copied: SlotArena::new(),
            ctl: Ctl::Prop { active: Active::Idle, branch_id: 0, n_sub: 0 },
            b_status: SENTINEL_ACTORS,
            b_commit: SENTINEL_ACTORS,
            n_wmp: 0,
            d: Some(Vec::new()),
            reclaimed: 0,
        }
    }

    fn active(&self) -> Option<Active> {
        match self.ctl {
            Ctl::Prop { active, .. } => Some(active),
            Ctl::Clone(_) => None,
        }
    }

    fn set_active(&mut self, a: Active) {
        match &mut self.ctl {
            Ctl::Prop { active, .. } => *active = a,
            Ctl::Clone(_) => panic!("space is cloning"),
        }
    }

    pub(crate) fn n_sub_add(&mut self, n: u32) {
        match &mut self.ctl {
            Ctl::Prop { n_sub, .. } => *n_sub += n,
            Ctl::Clone(_) => panic!("subscriptions may not change while cloning"),
        }
    }

    pub(crate) fn n_sub_sub(&mut self, n: u32) {
        match &mut self.ctl {
            Ctl::Prop { n_sub, .. } => *n_sub -= n,
            Ctl::Clone(_) => panic!("subscriptions may not change while cloning"),
        }
    }

    /// Schedule propagator `p` with event `me` of variable type `C`.
    ///
    /// Merges `me` into the propagator's pending delta; enqueues only when
    /// the delta changed. If the propagator is currently executing, only
    /// the delta is updated; the propagation loop relinks it according to
    /// its returned status.
    pub fn schedule<C: VarConf>(&mut self, p: ActorId, me: ModEvent) {
        let wants_queue = {
            let cell = self.actors.cell_mut(p.0);
            match &mut cell.body {
                ActorBody::Prop { body, tag } => {
                    let med = match tag {
                        PropTag::Med(m) => m,
                        _ => panic!("scheduled propagator is not in propagation phase"),
                    };
                    C::med_update(med, me) && body.is_some()
                }
                _ => panic!("scheduled actor is not a propagator"),
            }
        };
        if wants_queue {
            self.enqueue(p.0);
        }
    }

    /// Put propagator cell `p` into the queue matching its cost.
    fn enqueue(&mut self, p: u32) {
        let class = {
            let cell = self.actors.cell(p);
            match &cell.body {
                ActorBody::Prop { body: Some(b), tag: PropTag::Med(m) } => b.cost(*m).class(),
                _ => panic!("enqueue on propagator without body"),
            }
        };
        self.actors.unlink(p);
        self.actors.tail(class as u32, p);
        match self.active() {
            Some(Active::Idle) => self.set_active(Active::Queue(class as u8)),
            Some(Active::Queue(a)) if (class as u8) > a => {
                self.set_active(Active::Queue(class as u8))
            }
            // A failed space stays failed; a cloning space cannot get here.
            _ => {}
        }
    }

    fn take_prop_body(&mut self, i: u32) -> Option<Box<dyn Propagate>> {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Prop { body, .. } => body.take(),
            _ => panic!("actor {} is not a propagator", i),
        }
    }

    fn put_prop_body(&mut self, i: u32, b: Box<dyn Propagate>) {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Prop { body, .. } => {
                debug_assert!(body.is_none());
                *body = Some(b);
            }
            _ => panic!("actor {} is not a propagator", i),
        }
    }

    fn take_branch_body(&mut self, i: u32) -> Box<dyn Branch> {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Branch { body, .. } => body.take().expect("branching body present"),
            _ => panic!("actor {} is not a branching", i),
        }
    }

    fn put_branch_body(&mut self, i: u32, b: Box<dyn Branch>) {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Branch { body, .. } => {
                debug_assert!(body.is_none());
                *body = Some(b);
            }
            _ => panic!("actor {} is not a branching", i),
        }
    }

    fn branch_bid(&self, i: u32) -> u32 {
        match &self.actors.cell(i).body {
            ActorBody::Branch { bid, .. } => *bid,
            _ => panic!("actor {} is not a branching", i),
        }
    }

    fn peek_med(&self, i: u32) -> ModEventDelta {
        match &self.actors.cell(i).body {
            ActorBody::Prop { tag: PropTag::Med(m), .. } => *m,
            _ => panic!("actor {} has no pending delta", i),
        }
    }

    /// Take the propagator's pending delta, leaving it consumed.
    fn take_med(&mut self, i: u32) -> ModEventDelta {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Prop { tag: PropTag::Med(m), .. } => std::mem::replace(m, 0),
            _ => panic!("actor {} has no pending delta", i),
        }
    }

    fn set_med(&mut self, i: u32, med: ModEventDelta) {
        match &mut self.actors.cell_mut(i).body {
            ActorBody::Prop { tag, .. } => *tag = PropTag::Med(med),
            _ => panic!("actor {} is not a propagator", i),
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("actors", &self.actors)
            .field("n_wmp", &self.n_wmp)
            .finish()
    }
}

/// A computation space.
pub struct Space {
    pub(crate) core: Core,
    pub(crate) vars: VarTable,
    model: Option<Box<dyn Model>>,
}

impl Space {
    /// Create an empty space with no registered variable categories.
    pub fn new() -> Self {
        Self { core: Core::new(), vars: VarTable::new(), model: None }
    }

    /// Register the variable category `V`; idempotent.
    ///
    /// All categories must be registered before the first clone so that
    /// clones share the category layout.
    pub fn register<V: VarType>(&mut self) {
        self.vars.register::<V>();
    }

    /// Move a variable into the space, returning its handle.
    pub fn new_var<V: VarType>(&mut self, v: V) -> VarRef<V> {
        VarRef::new(self.vars.store_mut::<V>().push(v))
    }

    /// Shared access to a variable.
    pub fn var<V: VarType>(&self, x: VarRef<V>) -> &V {
        self.vars.store::<V>().var(x.idx)
    }

    /// Exclusive access to a variable.
    ///
    /// Domain modules must pair domain changes with the matching
    /// [`Self::schedule_range`] / [`Self::advise`] notifications.
    pub fn var_mut<V: VarType>(&mut self, x: VarRef<V>) -> &mut V {
        self.vars.store_mut::<V>().var_mut(x.idx)
    }

    /// Install the user model.
    pub fn set_model(&mut self, m: Box<dyn Model>) {
        self.model = Some(m);
    }

    /// Downcast access to the model.
    pub fn model_ref<M: Model + 'static>(&self) -> Option<&M> {
        self.model.as_ref()?.as_any().downcast_ref()
    }

    /// Post a propagator; it links at the head of the actor list.
    ///
    /// Subscribe it to its variables right after posting. When posting from
    /// inside a running propagator, subscribe with `schedule = false`.
    pub fn post(&mut self, body: Box<dyn Propagate>) -> ActorId {
        self.post_with(|_, _| body)
    }

    /// Post a propagator whose construction needs the home space and its
    /// own identity: to create advisors, and to subscribe under the
    /// identity it later cancels with.
    ///
    /// Subscriptions made inside `make` accumulate scheduling events; the
    /// propagator is enqueued once its body is installed.
    pub fn post_with(
        &mut self,
        make: impl FnOnce(&mut Space, ActorId) -> Box<dyn Propagate>,
    ) -> ActorId {
        let i = self.core.actors.reserve();
        *self.core.actors.cell_mut(i) = crate::actor::ActorCell::new_prop_pending(i);
        let body = make(self, ActorId(i));
        self.core.put_prop_body(i, body);
        self.core.actors.head(SENTINEL_ACTORS, i);
        if self.core.peek_med(i) != 0 {
            self.core.enqueue(i);
        }
        ActorId(i)
    }

    /// Post a branching; it links at the tail of the actor list and
    /// receives the next branching identity.
    pub fn post_branch(&mut self, body: Box<dyn Branch>) -> ActorId {
        let bid = match &mut self.core.ctl {
            Ctl::Prop { branch_id, .. } => {
                let b = *branch_id;
                *branch_id += 1;
                b
            }
            Ctl::Clone(_) => panic!("branchings may not be posted while cloning"),
        };
        let i = self.core.actors.reserve();
        *self.core.actors.cell_mut(i) = crate::actor::ActorCell::new_branch(i, body, bid);
        if self.core.b_status == SENTINEL_ACTORS {
            self.core.b_status = i;
            if self.core.b_commit == SENTINEL_ACTORS {
                self.core.b_commit = i;
            }
        }
        self.core.actors.tail(SENTINEL_ACTORS, i);
        ActorId(i)
    }

    /// Subscribe propagator `p` to variable `x` with condition `pc`.
    ///
    /// See [`crate::var::VarImp::subscribe`] for the assigned/schedule
    /// semantics; the assigned test is taken from the variable itself.
    pub fn subscribe<V: VarType>(
        &mut self,
        x: VarRef<V>,
        p: ActorId,
        pc: PropCond,
        me: ModEvent,
        schedule: bool,
    ) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        let v = vars.store_mut::<V>().var_mut(x.idx);
        let assigned = v.assigned();
        v.imp_mut().subscribe(core, p, pc, assigned, me, schedule);
    }

    /// Cancel the subscription of `p` on `x` with condition `pc`.
    pub fn cancel<V: VarType>(&mut self, x: VarRef<V>, p: ActorId, pc: PropCond) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        let v = vars.store_mut::<V>().var_mut(x.idx);
        let assigned = v.assigned();
        v.imp_mut().cancel(core, p, pc, assigned);
    }

    /// Create an advisor for propagator `p` in council `c`.
    pub fn new_advisor<A: Advice>(
        &mut self,
        p: ActorId,
        c: &mut Council<A>,
        payload: A,
    ) -> AdvisorId {
        let id = self.core.advisors.insert(AdvCell {
            prop: p,
            next: c.head(),
            payload: Some(Box::new(payload)),
            disposed: false,
            fwd: None,
        });
        c.set_head(Some(id));
        id
    }

    /// Downcast access to an advisor's payload.
    pub fn advisor<A: Advice>(&self, a: AdvisorId) -> &A {
        self.core
            .advisors
            .cell(a)
            .payload
            .as_ref()
            .expect("advisor is disposed")
            .as_any()
            .downcast_ref()
            .expect("advisor payload type")
    }

    /// Downcast access to an advisor's payload, mutable.
    pub fn advisor_mut<A: Advice>(&mut self, a: AdvisorId) -> &mut A {
        self.core
            .advisors
            .cell_mut(a)
            .payload
            .as_mut()
            .expect("advisor is disposed")
            .as_any_mut()
            .downcast_mut()
            .expect("advisor payload type")
    }

    /// Subscribe advisor `a` to variable `x`.
    pub fn subscribe_advisor<V: VarType>(&mut self, x: VarRef<V>, a: AdvisorId) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        let v = vars.store_mut::<V>().var_mut(x.idx);
        let assigned = v.assigned();
        v.imp_mut().subscribe_advisor(core, a, assigned);
    }

    /// Cancel the subscription of advisor `a` on `x`.
    pub fn cancel_advisor<V: VarType>(&mut self, x: VarRef<V>, a: AdvisorId) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        let v = vars.store_mut::<V>().var_mut(x.idx);
        let assigned = v.assigned();
        v.imp_mut().cancel_advisor(core, a, assigned);
    }

    /// Drop all subscriptions of `x` (used when `x` becomes assigned).
    pub fn cancel_all<V: VarType>(&mut self, x: VarRef<V>) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        vars.store_mut::<V>().var_mut(x.idx).imp_mut().cancel_all(core);
    }

    /// Schedule the propagators subscribed to `x` with conditions
    /// `pc1..=pc2`, with event `me`.
    pub fn schedule_range<V: VarType>(
        &mut self,
        x: VarRef<V>,
        pc1: PropCond,
        pc2: PropCond,
        me: ModEvent,
    ) {
        let (vars, core) = (&mut self.vars, &mut self.core);
        vars.store::<V>().var(x.idx).imp().schedule_range(core, pc1, pc2, me);
    }

    /// Run the advisors subscribed to `x` for modification event `me`.
    ///
    /// Returns false if an advisor failed. Advisors that dispose themselves
    /// mid-scan are only marked; the scan never compacts, so a
    /// self-disposing advisor cannot cause a live neighbour to be skipped.
    pub fn advise<V: VarType>(&mut self, x: VarRef<V>, me: ModEvent) -> bool {
        let (start, end) = self.vars.store::<V>().var(x.idx).imp().advisor_range();
        if start == end {
            return true;
        }
        let d = Delta::new(me);
        let mut i = start;
        while i < end {
            let e = self.vars.store::<V>().var(x.idx).imp().entry_at(i);
            debug_assert!(e.is_advisor());
            let a = e.advisor_id();
            i += 1;
            if self.core.advisors.disposed(a) {
                continue;
            }
            let p = self.core.advisors.prop_of(a);
            let mut body = match self.core.take_prop_body(p.0) {
                Some(b) => b,
                None => {
                    // The advised propagator is the one currently running;
                    // fall back to plain scheduling, it sees the event in
                    // its delta.
                    self.core.schedule::<V::Conf>(p, me);
                    continue;
                }
            };
            let st = body.advise(self, a, &d);
            self.core.put_prop_body(p.0, body);
            match st {
                ExecStatus::Fix => {}
                ExecStatus::Failed => return false,
                ExecStatus::Nofix => self.core.schedule::<V::Conf>(p, me),
                ExecStatus::SubsumedFix => self.core.advisors.mark_disposed(a),
                ExecStatus::SubsumedNofix => {
                    self.core.advisors.mark_disposed(a);
                    self.core.schedule::<V::Conf>(p, me);
                }
                ExecStatus::Subsumed(_) | ExecStatus::Partial { .. } => {
                    panic!("invalid status returned from advise")
                }
            }
        }
        true
    }

    /// Combine two modification event deltas across all registered
    /// categories.
    fn med_combine(&self, m1: ModEventDelta, m2: ModEventDelta) -> ModEventDelta {
        self.vars.cats.iter().fold(0, |acc, c| acc | (c.ops.med_combine)(m1, m2))
    }

    /// Query the space status, driving propagation to fixpoint or failure.
    ///
    /// Adds the number of propagator executions to
    /// [`Counter::Propagations`] and sets
    /// [`Statistics::weakly_monotonic`].
    pub fn status(&mut self, stats: &mut Statistics) -> SpaceStatus {
        let s = self._status(stats);
        stats.weakly_monotonic = self.core.n_wmp > 0;
        if self.core.n_wmp == 1 {
            self.core.n_wmp = 0;
        }
        s
    }

    fn _status(&mut self, stats: &mut Statistics) -> SpaceStatus {
        let mut executed: u64 = 0;
        let result = loop {
            match self.core.active().expect("status while cloning") {
                Active::Failed => break SpaceStatus::Failed,
                Active::Idle => {
                    break if self.advance_b_status() {
                        SpaceStatus::Branch
                    } else {
                        SpaceStatus::Solved
                    }
                }
                Active::Queue(c) => {
                    let q = c as u32;
                    if self.core.actors.list_empty(q) {
                        self.core.set_active(if c == 0 {
                            Active::Idle
                        } else {
                            Active::Queue(c - 1)
                        });
                        continue;
                    }
                    let p = self.core.actors.next(q);
                    self.core.actors.unlink(p);
                    // The pending delta is consumed by this execution.
                    let med = self.core.take_med(p);
                    let mut body = self.core.take_prop_body(p).expect("queued propagator body");
                    let st = body.propagate(self, med);
                    executed += 1;
                    match st {
                        ExecStatus::Failed => {
                            self.core.put_prop_body(p, body);
                            self.core.set_active(Active::Failed);
                            break SpaceStatus::Failed;
                        }
                        ExecStatus::Fix => {
                            // At fixpoint: events the propagator caused on
                            // itself are accounted for. Back to idle.
                            self.core.put_prop_body(p, body);
                            self.core.set_med(p, 0);
                            self.core.actors.head(SENTINEL_ACTORS, p);
                        }
                        ExecStatus::Nofix => {
                            self.core.put_prop_body(p, body);
                            self.core.enqueue(p);
                        }
                        ExecStatus::Subsumed(size) => {
                            // The propagator has cancelled its own
                            // subscriptions. Park the size in its scratch
                            // word, then reclaim.
                            self.core.actors.cell_mut(p).body = ActorBody::Prop {
                                body: None,
                                tag: PropTag::Size(size),
                            };
                            drop(body);
                            let size = match self.core.actors.cell(p).body {
                                ActorBody::Prop { tag: PropTag::Size(s), .. } => s,
                                _ => unreachable!("subsumed propagator carries its size"),
                            };
                            self.core.actors.release(p);
                            self.core.reclaimed += size;
                        }
                        ExecStatus::Partial { med: m, fix } => {
                            debug_assert!(m != 0);
                            self.core.put_prop_body(p, body);
                            let merged = if fix {
                                m
                            } else {
                                let pending = self.core.take_med(p);
                                self.med_combine(pending, m)
                            };
                            self.core.set_med(p, merged);
                            self.core.enqueue(p);
                        }
                        ExecStatus::SubsumedFix | ExecStatus::SubsumedNofix => {
                            panic!("invalid status returned from propagate")
                        }
                    }
                }
            }
        };
        stats.add(Counter::Propagations, executed);
        trace!(?result, executed, "space status");
        result
    }

    /// Advance the status cursor past exhausted branchings; true if a
    /// branching with alternatives remains.
    fn advance_b_status(&mut self) -> bool {
        loop {
            if self.core.b_status == SENTINEL_ACTORS {
                return false;
            }
            let b = self.core.b_status;
            let body = self.core.take_branch_body(b);
            let keep = body.status(self);
            self.core.put_branch_body(b, body);
            if keep {
                return true;
            }
            let next = self.core.actors.next(b);
            if self.core.b_commit == b {
                // No description can still refer to this branching; safe
                // to reclaim now. Otherwise disposal waits for the commit
                // cursor to pass it.
                self.core.b_commit = next;
                self.core.b_status = next;
                self.dispose_branch(b);
            } else {
                self.core.b_status = next;
            }
        }
    }

    /// Create a branching description for the current branching.
    ///
    /// Requires a stable, non-failed space whose status was `Branch`; may
    /// be called at most once per such status, before any non-const
    /// operation.
    pub fn description(&mut self) -> Result<Box<dyn Description>, SpaceError> {
        if self.failed() {
            return Err(SpaceError::Failed { op: "Space::description" });
        }
        if !self.stable() {
            return Err(SpaceError::NotStable { op: "Space::description" });
        }
        if self.core.b_status == SENTINEL_ACTORS {
            return Err(SpaceError::NoBranching);
        }
        let b = self.core.b_status;
        let bid = self.core.branch_bid(b);
        let mut body = self.core.take_branch_body(b);
        let d = body.description(self, BranchId(bid));
        self.core.put_branch_body(b, body);
        debug_assert_eq!(d.base().id(), bid, "description must carry the branching id");
        Ok(d)
    }

    /// Commit alternative `alt` of description `d`.
    ///
    /// Advances the commit cursor to the branching that produced `d`,
    /// disposing branchings that were skipped (their descriptions have all
    /// been consumed). No propagation is performed; call
    /// [`Self::status`] afterwards.
    pub fn commit(&mut self, d: &dyn Description, alt: u32) -> Result<(), SpaceError> {
        let base = d.base();
        if alt >= base.alternatives() {
            return Err(SpaceError::IllegalAlternative {
                alt,
                alternatives: base.alternatives(),
            });
        }
        if self.core.b_commit == SENTINEL_ACTORS {
            return Err(SpaceError::NoBranching);
        }
        while self.core.branch_bid(self.core.b_commit) != base.id() {
            let b = self.core.b_commit;
            let next = self.core.actors.next(b);
            if self.core.b_status == b {
                self.core.b_status = next;
            }
            self.core.b_commit = next;
            self.dispose_branch(b);
            if self.core.b_commit == SENTINEL_ACTORS {
                return Err(SpaceError::NoBranching);
            }
        }
        let b = self.core.b_commit;
        let mut body = self.core.take_branch_body(b);
        let st = body.commit(self, d, alt);
        self.core.put_branch_body(b, body);
        trace!(id = base.id(), alt, failed = (st == ExecStatus::Failed), "commit");
        if st == ExecStatus::Failed {
            self.core.set_active(Active::Failed);
        }
        Ok(())
    }

    fn dispose_branch(&mut self, b: u32) {
        self.core.actors.unlink(b);
        let mut body = self.core.take_branch_body(b);
        let size = body.dispose(self);
        drop(body);
        self.core.actors.release(b);
        self.core.reclaimed += size;
    }

    /// Fail the space. Never call from inside `propagate` or `commit`;
    /// report [`ExecStatus::Failed`] there instead.
    pub fn fail(&mut self) {
        self.core.set_active(Active::Failed);
    }

    /// Whether the space is failed. Performs no propagation.
    pub fn failed(&self) -> bool {
        matches!(self.core.active(), Some(Active::Failed))
    }

    /// Whether the space is stable (at fixpoint or failed).
    pub fn stable(&self) -> bool {
        matches!(self.core.active(), Some(Active::Idle) | Some(Active::Failed))
    }

    /// Number of propagators; linear in the number of actors.
    pub fn propagators(&self) -> u32 {
        let mut n = 0;
        for s in (0..crate::actor::N_QUEUES).chain([SENTINEL_ACTORS]) {
            let mut cur = self.core.actors.next(s);
            while cur != s {
                if matches!(self.core.actors.cell(cur).body, ActorBody::Prop { .. }) {
                    n += 1;
                }
                cur = self.core.actors.next(cur);
            }
        }
        n
    }

    /// Number of branchings; linear in the number of actors.
    pub fn branchings(&self) -> u32 {
        let mut n = 0;
        let mut cur = self.core.actors.next(SENTINEL_ACTORS);
        while cur != SENTINEL_ACTORS {
            if matches!(self.core.actors.cell(cur).body, ActorBody::Branch { .. }) {
                n += 1;
            }
            cur = self.core.actors.next(cur);
        }
        n
    }

    /// Bytes reclaimed from subsumed propagators and spent branchings over
    /// this space's lifetime.
    pub fn reclaimed(&self) -> usize {
        self.core.reclaimed
    }

    /// Heap bytes held by this space: the memory manager's chunks plus
    /// additional state reported by propagators.
    pub fn allocated(&self) -> usize {
        let mut total = self.core.mm.allocated();
        for s in (0..crate::actor::N_QUEUES).chain([SENTINEL_ACTORS]) {
            let mut cur = self.core.actors.next(s);
            while cur != s {
                if let ActorBody::Prop { body: Some(b), .. } = &self.core.actors.cell(cur).body {
                    total += b.allocated();
                }
                cur = self.core.actors.next(cur);
            }
        }
        total
    }

    /// Notice that actor `a` has property `p`.
    pub fn notice(&mut self, a: ActorId, p: ActorProperty) {
        match p {
            ActorProperty::Dispose => {
                if let Some(d) = &mut self.core.d {
                    d.push(a);
                }
            }
            ActorProperty::WeaklyMonotonic => {
                if self.core.n_wmp == 0 {
                    self.core.n_wmp = 2;
                } else {
                    self.core.n_wmp += 1;
                }
            }
        }
    }

    /// Ignore property `p` of actor `a`; must precede the actor's
    /// disposal. Tolerates being called after teardown has claimed the
    /// dispose list.
    pub fn ignore(&mut self, a: ActorId, p: ActorProperty) {
        match p {
            ActorProperty::Dispose => {
                if let Some(d) = &mut self.core.d {
                    if let Some(pos) = d.iter().position(|x| *x == a) {
                        d.swap_remove(pos);
                    }
                }
            }
            ActorProperty::WeaklyMonotonic => {
                if self.core.n_wmp == 2 {
                    // Leave the residual marker: one existed since the
                    // last fixpoint.
                    self.core.n_wmp = 1;
                } else {
                    self.core.n_wmp -= 1;
                }
            }
        }
    }

    /// Branch identities at the status and commit cursors, for
    /// diagnostics. The status id is always >= the commit id.
    pub fn branch_cursors(&self) -> (Option<BranchId>, Option<BranchId>) {
        let f = |i: u32| {
            if i == SENTINEL_ACTORS {
                None
            } else {
                Some(BranchId(self.core.branch_bid(i)))
            }
        };
        (f(self.core.b_status), f(self.core.b_commit))
    }

    /// Clone the space.
    ///
    /// Requires a stable, non-failed space. With `share = false` the clone
    /// shares no mutable state with the original and may be used on
    /// another thread.
    #[allow(clippy::should_implement_trait)]
    pub fn clone(&mut self, share: bool) -> Result<Space, SpaceError> {
        if self.failed() {
            return Err(SpaceError::Failed { op: "Space::clone" });
        }
        if !self.stable() {
            return Err(SpaceError::NotStable { op: "Space::clone" });
        }
        let (branch_id, n_sub) = match self.core.ctl {
            Ctl::Prop { branch_id, n_sub, .. } => (branch_id, n_sub),
            Ctl::Clone(_) => unreachable!("stable space is not cloning"),
        };

        // Switch to cloning mode.
        self.core.ctl = Ctl::Clone(CloneCtl {
            updates: vec![Vec::new(); self.vars.ncats()],
            copied: Vec::new(),
            adv_reset: Vec::new(),
            saved_branch_id: branch_id,
            saved_n_sub: n_sub,
        });

        let mut to = Space { core: Core::new(), vars: self.vars.fresh_like(), model: None };
        to.core.ctl = Ctl::Prop { active: Active::Idle, branch_id, n_sub: 0 };
        to.core.n_wmp = 0;

        {
            let mut ctx = CloneCtx {
                from: self,
                to: &mut to,
                share,
                cur_actor: None,
                shared_fwd: HashMap::new(),
            };

            // Copy all actors in list order; each actor records its
            // forward before its body copies, so councils and views
            // resolve through it.
            let mut cur = ctx.from.core.actors.next(SENTINEL_ACTORS);
            while cur != SENTINEL_ACTORS {
                let new_id = ctx.to.core.actors.reserve();
                ctx.from.core.actors.cell_mut(cur).fwd = Some(new_id);
                ctx.cur_actor = Some(ActorId(new_id));
                let is_prop =
                    matches!(ctx.from.core.actors.cell(cur).body, ActorBody::Prop { .. });
                if is_prop {
                    let body = ctx.from.core.take_prop_body(cur).expect("idle propagator body");
                    let copy = body.copy(&mut ctx);
                    ctx.from.core.put_prop_body(cur, body);
                    *ctx.to.core.actors.cell_mut(new_id) =
                        crate::actor::ActorCell::new_prop(new_id, copy);
                } else {
                    let bid = ctx.from.core.branch_bid(cur);
                    let body = ctx.from.core.take_branch_body(cur);
                    let copy = body.copy(&mut ctx);
                    ctx.from.core.put_branch_body(cur, body);
                    *ctx.to.core.actors.cell_mut(new_id) =
                        crate::actor::ActorCell::new_branch(new_id, copy, bid);
                }
                ctx.to.core.actors.tail(SENTINEL_ACTORS, new_id);
                if ctx.from.core.b_status == cur {
                    ctx.to.core.b_status = new_id;
                }
                if ctx.from.core.b_commit == cur {
                    ctx.to.core.b_commit = new_id;
                }
                cur = ctx.from.core.actors.next(cur);
            }

            ctx.cur_actor = None;

            // The model copies all root-held handles.
            if let Some(m) = ctx.from.model.take() {
                let copy = m.copy(&mut ctx);
                ctx.from.model = Some(m);
                ctx.to.model = Some(copy);
            }
        }

        // Reset phase: rebuild every clone variable's subscriptions into
        // one contiguous region, then clear all forward marks so the
        // original is externally untouched.
        let ctl = std::mem::replace(
            &mut self.core.ctl,
            Ctl::Prop { active: Active::Idle, branch_id, n_sub },
        );
        let clone_ctl = match ctl {
            Ctl::Clone(c) => c,
            Ctl::Prop { .. } => unreachable!("clone left propagation mode"),
        };

        // Each rebuilt slice may take one padding slot to stay on the
        // allocation granule, so the region is sized for the worst case.
        let n_regs: u32 = clone_ctl.updates.iter().map(|u| u.len() as u32).sum();
        let region_slots = clone_ctl.saved_n_sub + n_regs;
        let region = to.core.mm.alloc_sub_region(sub_bytes(region_slots));
        let mut cursor = SubCursor::new(region, region_slots);
        let mut new_n_sub = 0;
        for (cat, ups) in clone_ctl.updates.iter().enumerate() {
            let ops = self.vars.cats[cat].ops;
            new_n_sub += (ops.rebuild)(
                self.vars.cats[cat].store.as_mut(),
                to.vars.cats[cat].store.as_mut(),
                ups,
                &self.core.actors,
                &self.core.advisors,
                &mut cursor,
            );
        }
        match &mut to.core.ctl {
            Ctl::Prop { n_sub, .. } => *n_sub = new_n_sub,
            Ctl::Clone(_) => unreachable!(),
        }

        for a in clone_ctl.adv_reset {
            self.core.advisors.clear_fwd(a);
        }
        for ci in clone_ctl.copied {
            self.core.copied[ci].fwd = None;
        }
        let mut cur = self.core.actors.next(SENTINEL_ACTORS);
        while cur != SENTINEL_ACTORS {
            self.core.actors.cell_mut(cur).fwd = None;
            cur = self.core.actors.next(cur);
        }

        trace!(share, n_sub = new_n_sub, "cloned space");
        Ok(to)
    }

    /// Constrain this space to admit only solutions better than `best`.
    pub fn constrain(&mut self, best: &Space) -> Result<(), SpaceError> {
        let mut m = self.model.take().ok_or(SpaceError::ConstrainUndefined)?;
        let r = m.constrain(self, best);
        self.model = Some(m);
        r
    }

    // Space-memory management veneer.

    /// Allocate `s` bytes from the space pool.
    pub fn ralloc(&mut self, s: usize) -> std::ptr::NonNull<u8> {
        self.core.mm.ralloc(s)
    }

    /// Return `s` bytes at `p` to the space pool.
    pub fn rfree(&mut self, p: std::ptr::NonNull<u8>, s: usize) {
        self.core.mm.rfree(p, s)
    }

    /// Reallocate a block from `n` to `m` bytes.
    pub fn rrealloc(
        &mut self,
        b: std::ptr::NonNull<u8>,
        n: usize,
        m: usize,
    ) -> std::ptr::NonNull<u8> {
        self.core.mm.rrealloc(b, n, m)
    }

    /// Allocate from the fixed-size free list for size `S`.
    pub fn fl_alloc<const S: usize>(&mut self) -> std::ptr::NonNull<u8> {
        self.core.mm.fl_alloc::<S>()
    }

    /// Return a pre-linked chain of fixed-size blocks.
    pub fn fl_dispose<const S: usize>(
        &mut self,
        f: std::ptr::NonNull<u8>,
        l: std::ptr::NonNull<u8>,
    ) {
        self.core.mm.fl_dispose::<S>(f, l)
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("failed", &self.failed())
            .field("stable", &self.stable())
            .field("core", &self.core)
            .finish()
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        // Actors with forced disposal run before any storage is torn
        // down; their dispose may still cancel subscriptions and call
        // ignore (which tolerates the claimed list).
        if let Some(d) = self.core.d.take() {
            enum Taken {
                P(Box<dyn Propagate>),
                B(Box<dyn Branch>),
            }
            for ActorId(i) in d {
                let taken = match &mut self.core.actors.cell_mut(i).body {
                    ActorBody::Prop { body, .. } => body.take().map(Taken::P),
                    ActorBody::Branch { body, .. } => body.take().map(Taken::B),
                    _ => None,
                };
                match taken {
                    Some(Taken::P(mut b)) => {
                        b.dispose(self);
                    }
                    Some(Taken::B(mut b)) => {
                        b.dispose(self);
                    }
                    None => {}
                }
            }
        }
        // Variable storage, advisors, remaining actors and finally the
        // memory manager drop in declaration order.
    }
}

/// Context of a clone in progress.
///
/// Hands every handle from the original to its counterpart in the clone,
/// copying on first encounter.
pub struct CloneCtx<'a> {
    pub(crate) from: &'a mut Space,
    pub(crate) to: &'a mut Space,
    share: bool,
    /// Identity of the actor copy currently being created.
    cur_actor: Option<ActorId>,
    shared_fwd: HashMap<usize, Box<dyn Any + Send>>,
}

impl CloneCtx<'_> {
    /// Whether this is a sharing clone.
    pub fn share(&self) -> bool {
        self.share
    }

    /// The identity the copy being created will have in the clone.
    ///
    /// Only valid while an actor's `copy` runs.
    pub fn self_id(&self) -> ActorId {
        self.cur_actor.expect("self_id outside an actor copy")
    }

    /// The original space.
    pub fn from_space(&self) -> &Space {
        self.from
    }

    /// The clone under construction.
    pub fn to_space(&mut self) -> &mut Space {
        self.to
    }

    /// Update a variable handle: copy the variable on first encounter,
    /// reuse the forward afterwards.
    pub fn update<V: VarType>(&mut self, x: VarRef<V>) -> VarRef<V> {
        let cat = self.from.vars.cat_of::<V>() as usize;
        if let Some(f) = self.from.vars.store::<V>().cells[x.idx as usize].fwd {
            return VarRef::new(f);
        }
        // Check the variable out so its copy hook can reenter the context.
        let var = self.from.vars.store_mut::<V>().cells[x.idx as usize]
            .var
            .take()
            .expect("variable checked out twice during clone");
        let share = self.share;
        let mut copy = var.copy(self, share);
        *copy.imp_mut() = var.imp().cloned_shell();
        self.from.vars.store_mut::<V>().cells[x.idx as usize].var = Some(var);

        let ni = self.to.vars.store_mut::<V>().push(copy);
        self.from.vars.store_mut::<V>().cells[x.idx as usize].fwd = Some(ni);
        match &mut self.from.core.ctl {
            Ctl::Clone(c) => c.updates[cat].push(x.idx),
            Ctl::Prop { .. } => unreachable!("update outside cloning"),
        }
        VarRef::new(ni)
    }

    /// Update a council: copies all live advisors of `orig` (their
    /// payloads resolve variable handles through this context) and records
    /// the originals for the forward reset.
    pub fn update_council<A: Advice>(&mut self, orig: &Council<A>) -> Council<A> {
        let mut cur = orig.head();
        let mut new_head: Option<AdvisorId> = None;
        while let Some(a) = cur {
            let next = self.from.core.advisors.cell(a).next;
            if !self.from.core.advisors.disposed(a) {
                let payload = self.from.core.advisors.cell_mut(a)
                    .payload
                    .take()
                    .expect("live advisor has payload");
                let copy = payload.copy(self);
                self.from.core.advisors.cell_mut(a).payload = Some(payload);
                let p_old = self.from.core.advisors.cell(a).prop;
                let p_new = self.from.core.actors.cell(p_old.0)
                    .fwd
                    .expect("propagator copied before its council");
                let id = self.to.core.advisors.insert(AdvCell {
                    prop: ActorId(p_new),
                    next: new_head,
                    payload: Some(copy),
                    disposed: false,
                    fwd: None,
                });
                new_head = Some(id);
                self.from.core.advisors.set_fwd(a, id);
                match &mut self.from.core.ctl {
                    Ctl::Clone(c) => c.adv_reset.push(a),
                    Ctl::Prop { .. } => unreachable!("council update outside cloning"),
                }
            }
            cur = next;
        }
        Council::with_head(new_head)
    }

    pub(crate) fn register_copied(&mut self, idx: u32) {
        match &mut self.from.core.ctl {
            Ctl::Clone(c) => c.copied.push(idx),
            Ctl::Prop { .. } => unreachable!("copied-handle update outside cloning"),
        }
    }

    pub(crate) fn shared_fwd(&self, key: usize) -> Option<&(dyn Any + Send)> {
        self.shared_fwd.get(&key).map(|b| b.as_ref())
    }

    pub(crate) fn record_shared_fwd(&mut self, key: usize, arc: Box<dyn Any + Send>) {
        self.shared_fwd.insert(key, arc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{DescBase, PropCost};
    use crate::var::{VarImp, ME_GEN_ASSIGNED, PC_GEN_ASSIGNED};
    use std::sync::{Arc, Mutex};

    struct UnitConf;

    impl VarConf for UnitConf {
        const PC_MAX: PropCond = 0;
        const FREE_BITS: u32 = 0;
        const MED_FST: u32 = 0;
        const MED_LST: u32 = 1;
        const MED_MASK: ModEventDelta = 0b1;
        type Idx = [u32; 1];

        fn me_combine(me1: ModEvent, me2: ModEvent) -> ModEvent {
            me1.max(me2)
        }

        fn med_update(med: &mut ModEventDelta, me: ModEvent) -> bool {
            let old = Self::me(*med);
            let new = Self::me_combine(old, me);
            if new == old {
                false
            } else {
                *med = (*med & !Self::MED_MASK) | Self::med(new);
                true
            }
        }
    }

    /// Always-assigned token variable; subscribing to it with scheduling
    /// is the cheapest way to get a propagator queued.
    struct UnitVar {
        imp: VarImp<UnitConf>,
    }

    impl UnitVar {
        fn new() -> Self {
            Self { imp: VarImp::new() }
        }
    }

    impl VarType for UnitVar {
        type Conf = UnitConf;

        fn imp(&self) -> &VarImp<UnitConf> {
            &self.imp
        }

        fn imp_mut(&mut self) -> &mut VarImp<UnitConf> {
            &mut self.imp
        }

        fn assigned(&self) -> bool {
            true
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>, _share: bool) -> Self {
            UnitVar::new()
        }
    }

    struct TraceProp {
        name: &'static str,
        cost: PropCost,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Propagate for TraceProp {
        fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
            self.log.lock().unwrap().push(self.name);
            ExecStatus::Fix
        }

        fn cost(&self, _med: ModEventDelta) -> PropCost {
            self.cost
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
            Box::new(TraceProp { name: self.name, cost: self.cost, log: Arc::clone(&self.log) })
        }
    }

    struct FailProp;

    impl Propagate for FailProp {
        fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
            ExecStatus::Failed
        }

        fn cost(&self, _med: ModEventDelta) -> PropCost {
            PropCost::UnaryLo
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
            Box::new(FailProp)
        }
    }

    struct SubsumeProp;

    impl Propagate for SubsumeProp {
        fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
            // No subscriptions were entered (the variable is assigned), so
            // nothing to cancel.
            ExecStatus::Subsumed(std::mem::size_of::<Self>())
        }

        fn cost(&self, _med: ModEventDelta) -> PropCost {
            PropCost::UnaryLo
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
            Box::new(SubsumeProp)
        }
    }

    struct DisposeProp {
        disposals: Arc<Mutex<u32>>,
    }

    impl Propagate for DisposeProp {
        fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
            ExecStatus::Fix
        }

        fn cost(&self, _med: ModEventDelta) -> PropCost {
            PropCost::UnaryLo
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
            Box::new(DisposeProp { disposals: Arc::clone(&self.disposals) })
        }

        fn dispose(&mut self, _home: &mut Space) -> usize {
            *self.disposals.lock().unwrap() += 1;
            std::mem::size_of_val(self)
        }
    }

    struct CountDesc {
        base: DescBase,
    }

    impl Description for CountDesc {
        fn base(&self) -> &DescBase {
            &self.base
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountBranch {
        rounds: u32,
    }

    impl Branch for CountBranch {
        fn status(&self, _home: &Space) -> bool {
            self.rounds > 0
        }

        fn description(&mut self, _home: &mut Space, id: BranchId) -> Box<dyn Description> {
            Box::new(CountDesc { base: DescBase::new(id, 2) })
        }

        fn commit(&mut self, _home: &mut Space, _d: &dyn Description, _alt: u32) -> ExecStatus {
            self.rounds -= 1;
            ExecStatus::OK
        }

        fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Branch> {
            Box::new(CountBranch { rounds: self.rounds })
        }
    }

    fn unit_space() -> (Space, VarRef<UnitVar>) {
        let mut s = Space::new();
        s.register::<UnitVar>();
        let x = s.new_var(UnitVar::new());
        (s, x)
    }

    #[test]
    fn test_empty_space_is_solved() {
        let mut s = Space::new();
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        assert_eq!(stats.get(Counter::Propagations), 0);
        assert!(matches!(s.description(), Err(SpaceError::NoBranching)));
    }

    #[test]
    fn test_cost_ordering_higher_class_first() {
        let (mut s, x) = unit_space();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = s.post(Box::new(TraceProp {
            name: "a",
            cost: PropCost::LinearLo,
            log: Arc::clone(&log),
        }));
        let b = s.post(Box::new(TraceProp {
            name: "b",
            cost: PropCost::UnaryLo,
            log: Arc::clone(&log),
        }));
        s.subscribe(x, a, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        s.subscribe(x, b, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        // Unary (class 7) runs before linear-cheap (class 4).
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
        assert_eq!(stats.get(Counter::Propagations), 2);
    }

    #[test]
    fn test_status_idempotent_once_stable() {
        let (mut s, x) = unit_space();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = s.post(Box::new(TraceProp {
            name: "a",
            cost: PropCost::BinaryHi,
            log: Arc::clone(&log),
        }));
        s.subscribe(x, a, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        assert_eq!(stats.get(Counter::Propagations), 1);
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        // No further propagator executions.
        assert_eq!(stats.get(Counter::Propagations), 1);
        assert!(s.stable());
        assert!(!s.failed());
    }

    #[test]
    fn test_failing_propagator_fails_space() {
        let (mut s, x) = unit_space();
        let p = s.post(Box::new(FailProp));
        s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Failed);
        assert!(s.failed());
        assert!(s.stable());
        assert!(matches!(s.clone(false), Err(SpaceError::Failed { .. })));
    }

    #[test]
    fn test_subsumption_reclaims_propagator() {
        let (mut s, x) = unit_space();
        let p = s.post(Box::new(SubsumeProp));
        s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        assert_eq!(s.propagators(), 1);
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        assert_eq!(s.propagators(), 0);
    }

    #[test]
    fn test_subsumption_rounds_do_not_grow_memory() {
        let (mut s, x) = unit_space();
        let mut stats = Statistics::new();
        // Warm up one round, then memory use must not keep growing.
        let p = s.post(Box::new(SubsumeProp));
        s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        s.status(&mut stats);
        let baseline = s.allocated();
        for _ in 0..100 {
            let p = s.post(Box::new(SubsumeProp));
            s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
            s.status(&mut stats);
        }
        assert_eq!(s.propagators(), 0);
        assert_eq!(s.allocated(), baseline);
    }

    #[test]
    fn test_explicit_fail() {
        let mut s = Space::new();
        s.fail();
        assert!(s.failed());
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Failed);
    }

    #[test]
    fn test_branching_lifecycle() {
        let mut s = Space::new();
        s.post_branch(Box::new(CountBranch { rounds: 1 }));
        assert_eq!(s.branchings(), 1);
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Branch);
        let d = s.description().unwrap();
        assert_eq!(d.base().alternatives(), 2);
        s.commit(&*d, 0).unwrap();
        // The branching is exhausted and gets reclaimed on the next
        // status.
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        assert_eq!(s.branchings(), 0);
    }

    #[test]
    fn test_commit_illegal_alternative() {
        let mut s = Space::new();
        s.post_branch(Box::new(CountBranch { rounds: 1 }));
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Branch);
        let d = s.description().unwrap();
        assert!(matches!(
            s.commit(&*d, 5),
            Err(SpaceError::IllegalAlternative { alt: 5, alternatives: 2 })
        ));
    }

    #[test]
    fn test_commit_without_branching() {
        let mut s = Space::new();
        let d = CountDesc { base: DescBase::new(BranchId(0), 2) };
        assert!(matches!(s.commit(&d, 0), Err(SpaceError::NoBranching)));
    }

    #[test]
    fn test_description_requires_stability() {
        let (mut s, x) = unit_space();
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = s.post(Box::new(TraceProp { name: "p", cost: PropCost::UnaryLo, log }));
        s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        // Propagation pending: not stable.
        assert!(!s.stable());
        assert!(matches!(s.description(), Err(SpaceError::NotStable { .. })));
        assert!(matches!(s.clone(false), Err(SpaceError::NotStable { .. })));
    }

    #[test]
    fn test_two_branchings_cursor_order() {
        let mut s = Space::new();
        s.post_branch(Box::new(CountBranch { rounds: 1 }));
        s.post_branch(Box::new(CountBranch { rounds: 1 }));
        let mut stats = Statistics::new();
        assert_eq!(s.status(&mut stats), SpaceStatus::Branch);
        let (bs, bc) = s.branch_cursors();
        assert_eq!(bs, bc);
        let d = s.description().unwrap();
        assert_eq!(d.base().id(), 0);
        s.commit(&*d, 0).unwrap();
        assert_eq!(s.status(&mut stats), SpaceStatus::Branch);
        let d2 = s.description().unwrap();
        assert_eq!(d2.base().id(), 1);
        let (bs, bc) = s.branch_cursors();
        assert!(bs.unwrap().value() >= bc.unwrap().value());
        s.commit(&*d2, 1).unwrap();
        assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
        assert_eq!(s.branchings(), 0);
    }

    #[test]
    fn test_weakly_monotonic_residual() {
        let (mut s, x) = unit_space();
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = s.post(Box::new(TraceProp { name: "p", cost: PropCost::UnaryLo, log }));
        s.subscribe(x, p, PC_GEN_ASSIGNED, ME_GEN_ASSIGNED, true);
        s.notice(p, ActorProperty::WeaklyMonotonic);
        let mut stats = Statistics::new();
        s.status(&mut stats);
        assert!(stats.weakly_monotonic);
        // Remove the property: the residual marker survives exactly one
        // more status call.
        s.ignore(p, ActorProperty::WeaklyMonotonic);
        s.status(&mut stats);
        assert!(stats.weakly_monotonic);
        s.status(&mut stats);
        assert!(!stats.weakly_monotonic);
    }

    #[test]
    fn test_forced_disposal_runs_exactly_once() {
        let disposals = Arc::new(Mutex::new(0));
        {
            let mut s = Space::new();
            let p = s.post(Box::new(DisposeProp { disposals: Arc::clone(&disposals) }));
            s.notice(p, ActorProperty::Dispose);
            drop(s);
        }
        assert_eq!(*disposals.lock().unwrap(), 1);
    }

    #[test]
    fn test_ignore_dispose_prevents_forced_disposal() {
        let disposals = Arc::new(Mutex::new(0));
        {
            let mut s = Space::new();
            let p = s.post(Box::new(DisposeProp { disposals: Arc::clone(&disposals) }));
            s.notice(p, ActorProperty::Dispose);
            s.ignore(p, ActorProperty::Dispose);
            drop(s);
        }
        assert_eq!(*disposals.lock().unwrap(), 0);
    }
}
