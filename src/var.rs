// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Variable implementations: subscriptions, scheduling and cloning.
//!
//! A variable implementation [`VarImp`] owns the array of actors subscribed
//! to the variable. The array lives in the space memory manager and is
//! partitioned by propagation condition: entries `[0, idx[1])` are
//! propagators subscribed with condition `0`, `[idx[pc-1], idx[pc])` those
//! with condition `pc`, and `[idx[pc_max], entries)` are advisors. The
//! partition boundaries are weakly increasing and no propagator appears
//! twice in the same bucket.
//!
//! `VarImp` is parameterized by a variable-implementation configuration
//! [`VarConf`] supplying the maximal propagation condition, the number of
//! freely usable bits, the layout of this variable type's slice of the
//! combined modification event delta, and the two event combinators.
//!
//! Concrete variable types embed a `VarImp` next to their domain
//! representation and implement [`VarType`]; spaces store them in
//! per-category arenas registered up front (see
//! [`Space::register`](crate::space::Space::register)).
//!
//! # Safety
//!
//! Subscription arrays are raw blocks in the owning space's memory manager.
//! All reads and writes go through the accessors here, which bound every
//! access by `entries + free`. The array pointer never aliases Rust-owned
//! storage, which is what lets the advise scan walk a variable's advisors
//! while the space hands out `&mut` access to propagators.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::actor::{ActorArena, ActorId};
use crate::advisor::{AdvisorArena, AdvisorId};
use crate::space::{CloneCtx, Core};

/// Type for modification events.
pub type ModEvent = i32;

/// Generic modification event: failed variable.
pub const ME_GEN_FAILED: ModEvent = -1;
/// Generic modification event: no modification.
pub const ME_GEN_NONE: ModEvent = 0;
/// Generic modification event: variable is assigned a value.
pub const ME_GEN_ASSIGNED: ModEvent = 1;

/// Type for propagation conditions.
pub type PropCond = i32;

/// Propagation condition to be ignored (convenience).
pub const PC_GEN_NONE: PropCond = -1;
/// Propagation condition for an assigned variable.
pub const PC_GEN_ASSIGNED: PropCond = 0;

/// A packed set of modification events, one slice per variable type.
///
/// A propagator accumulates one of these across all variable types it is
/// subscribed to; each [`VarConf`] masks out and combines its own slice.
pub type ModEventDelta = i32;

/// Domain change information handed to advisors.
///
/// Ephemeral; lives only for the duration of one notification.
#[derive(Debug, Clone, Copy)]
pub struct Delta {
    me: ModEvent,
}

impl Delta {
    pub(crate) fn new(me: ModEvent) -> Self {
        Self { me }
    }

    /// The modification event that triggered the notification.
    pub fn modevent(&self) -> ModEvent {
        self.me
    }
}

/// Configuration of a variable implementation type.
///
/// Collects the per-type constants and the two event combinators. The
/// partition array type `Idx` must be `[u32; PC_MAX + 1]` for the type's
/// `PC_MAX`; it is an associated type because array lengths cannot yet
/// depend on associated consts on stable Rust.
pub trait VarConf: 'static {
    /// Maximal propagation condition.
    const PC_MAX: PropCond;
    /// Number of freely usable bits in the variable implementation.
    const FREE_BITS: u32;
    /// First bit of this type's modification event delta slice.
    const MED_FST: u32;
    /// Bit after the last bit of the slice.
    const MED_LST: u32;
    /// Bitmask of the slice.
    const MED_MASK: ModEventDelta;

    /// Partition boundary storage, `[u32; PC_MAX + 1]`.
    type Idx: Copy + Default + Send + AsRef<[u32]> + AsMut<[u32]> + fmt::Debug + 'static;

    /// Combine two modification events of this type.
    ///
    /// Must satisfy `me_combine(ME_GEN_NONE, me) == me`.
    fn me_combine(me1: ModEvent, me2: ModEvent) -> ModEvent;

    /// Merge `me` into the delta `med`; returns true if the delta changed.
    fn med_update(med: &mut ModEventDelta, me: ModEvent) -> bool;

    /// Project this type's modification event out of a combined delta.
    fn me(med: ModEventDelta) -> ModEvent {
        (med & Self::MED_MASK) >> Self::MED_FST
    }

    /// Lift a modification event of this type into a combined delta.
    fn med(me: ModEvent) -> ModEventDelta {
        me << Self::MED_FST
    }
}

/// Combine the `C` slices of two deltas, leaving other slices zero.
pub(crate) fn med_combine_cat<C: VarConf>(
    m1: ModEventDelta,
    m2: ModEventDelta,
) -> ModEventDelta {
    C::med(C::me_combine(C::me(m1), C::me(m2)))
}

/// One subscription array entry: a propagator or an advisor reference.
///
/// Packed into 32 bits; the high bit distinguishes advisors.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubEntry(u32);

const ADV_BIT: u32 = 1 << 31;

impl SubEntry {
    pub(crate) fn prop(p: ActorId) -> Self {
        debug_assert!(p.0 & ADV_BIT == 0);
        SubEntry(p.0)
    }

    pub(crate) fn advisor(a: AdvisorId) -> Self {
        debug_assert!(a.0 & ADV_BIT == 0);
        SubEntry(a.0 | ADV_BIT)
    }

    pub(crate) fn is_advisor(self) -> bool {
        self.0 & ADV_BIT != 0
    }

    pub(crate) fn actor(self) -> ActorId {
        debug_assert!(!self.is_advisor());
        ActorId(self.0)
    }

    pub(crate) fn advisor_id(self) -> AdvisorId {
        debug_assert!(self.is_advisor());
        AdvisorId(self.0 & !ADV_BIT)
    }
}

impl fmt::Debug for SubEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_advisor() {
            write!(f, "adv#{}", self.0 & !ADV_BIT)
        } else {
            write!(f, "prop#{}", self.0)
        }
    }
}

/// Bytes occupied by `slots` subscription entries.
#[inline]
pub(crate) fn sub_bytes(slots: u32) -> usize {
    slots as usize * std::mem::size_of::<SubEntry>()
}

/// Variable implementation core.
///
/// Embedded by concrete variable types; holds the subscription array, its
/// partition boundaries, the free-slot count and the freely usable bits.
pub struct VarImp<C: VarConf> {
    /// Subscription array in the space memory manager; `None` until the
    /// first subscription arrives.
    sub: Option<NonNull<SubEntry>>,
    /// Number of used slots.
    entries: u32,
    /// Free slot count above `C::FREE_BITS` user bits.
    free_and_bits: u32,
    /// Partition boundaries; `idx[pc]` is the end of bucket `pc`.
    idx: C::Idx,
    _marker: PhantomData<fn() -> C>,
}

// The array pointer targets the owning space's arena, which moves between
// threads only together with the whole space.
unsafe impl<C: VarConf> Send for VarImp<C> {}

impl<C: VarConf> VarImp<C> {
    /// Create a variable implementation with no subscriptions.
    pub fn new() -> Self {
        debug_assert_eq!(
            C::Idx::default().as_ref().len(),
            C::PC_MAX as usize + 1,
            "VarConf::Idx must have PC_MAX + 1 entries"
        );
        Self {
            sub: None,
            entries: 0,
            free_and_bits: 0,
            idx: C::Idx::default(),
            _marker: PhantomData,
        }
    }

    /// Number of free slots.
    #[inline]
    fn free(&self) -> u32 {
        self.free_and_bits >> C::FREE_BITS
    }

    /// The freely usable bits.
    pub fn bits(&self) -> u32 {
        self.free_and_bits & ((1 << C::FREE_BITS) - 1)
    }

    /// Set the freely usable bits.
    pub fn set_bits(&mut self, b: u32) {
        debug_assert!(b < (1 << C::FREE_BITS));
        self.free_and_bits = (self.free_and_bits & !((1 << C::FREE_BITS) - 1)) | b;
    }

    /// Degree: number of subscribed propagators and advisors.
    pub fn degree(&self) -> u32 {
        self.entries
    }

    #[inline]
    fn idx_get(&self, pc: PropCond) -> u32 {
        debug_assert!(pc >= 1 && pc <= C::PC_MAX + 1);
        self.idx.as_ref()[(pc - 1) as usize]
    }

    #[inline]
    fn idx_add(&mut self, pc: PropCond, d: i32) {
        debug_assert!(pc >= 1 && pc <= C::PC_MAX + 1);
        let r = &mut self.idx.as_mut()[(pc - 1) as usize];
        *r = (*r as i32 + d) as u32;
    }

    /// Start of the bucket for condition `pc`.
    #[inline]
    fn bucket_start(&self, pc: PropCond) -> u32 {
        debug_assert!(pc >= 0 && pc <= C::PC_MAX + 1);
        if pc == 0 {
            0
        } else {
            self.idx_get(pc)
        }
    }

    /// Start of the advisor bucket.
    #[inline]
    pub(crate) fn advisor_start(&self) -> u32 {
        self.bucket_start(C::PC_MAX + 1)
    }

    /// `(advisor bucket start, entries)` for the advise scan.
    pub(crate) fn advisor_range(&self) -> (u32, u32) {
        (self.advisor_start(), self.entries)
    }

    #[inline]
    unsafe fn slot(&self, i: u32) -> SubEntry {
        debug_assert!(i < self.entries + self.free());
        self.sub.expect("subscription array present").as_ptr().add(i as usize).read()
    }

    #[inline]
    unsafe fn set_slot(&mut self, i: u32, e: SubEntry) {
        debug_assert!(i < self.entries + self.free());
        self.sub.expect("subscription array present").as_ptr().add(i as usize).write(e)
    }

    /// Read the entry at slot `i`; used by the space's notification scans.
    pub(crate) fn entry_at(&self, i: u32) -> SubEntry {
        debug_assert!(i < self.entries);
        unsafe { self.slot(i) }
    }

    /// Subscribe propagator `p` with propagation condition `pc`.
    ///
    /// If the variable is `assigned`, the propagator is only scheduled
    /// (with [`ME_GEN_ASSIGNED`]) when `schedule` is true and never enters
    /// the array. Otherwise it enters the bucket for `pc` and, when
    /// `schedule` is true and `pc` is not [`PC_GEN_ASSIGNED`], is scheduled
    /// with `me`. Pass `schedule = false` when subscribing from inside a
    /// running propagator.
    pub fn subscribe(
        &mut self,
        core: &mut Core,
        p: ActorId,
        pc: PropCond,
        assigned: bool,
        me: ModEvent,
        schedule: bool,
    ) {
        if assigned {
            if schedule {
                core.schedule::<C>(p, ME_GEN_ASSIGNED);
            }
        } else {
            self.enter_prop(core, p, pc);
            if schedule && pc != PC_GEN_ASSIGNED {
                core.schedule::<C>(p, me);
            }
        }
    }

    /// Cancel the subscription of `p` with condition `pc`.
    ///
    /// A no-op when the variable is `assigned` (the subscription was never
    /// entered).
    pub fn cancel(&mut self, core: &mut Core, p: ActorId, pc: PropCond, assigned: bool) {
        if !assigned {
            self.remove_prop(core, p, pc);
        }
    }

    /// Subscribe advisor `a`; only entered when the variable is not
    /// assigned.
    pub fn subscribe_advisor(&mut self, core: &mut Core, a: AdvisorId, assigned: bool) {
        if !assigned {
            self.enter_advisor(core, a);
        }
    }

    /// Cancel the subscription of advisor `a`.
    pub fn cancel_advisor(&mut self, core: &mut Core, a: AdvisorId, assigned: bool) {
        if !assigned {
            self.remove_advisor(core, a);
        }
    }

    /// Drop all subscriptions and return the array to the space pool.
    ///
    /// Used when the variable becomes assigned and its subscriptions have
    /// been handed their final schedule.
    pub fn cancel_all(&mut self, core: &mut Core) {
        core.n_sub_sub(self.entries);
        if let Some(p) = self.sub.take() {
            let total = self.entries + self.free();
            core.mm.rfree(p.cast(), sub_bytes(total));
        }
        self.entries = 0;
        self.free_and_bits &= (1 << C::FREE_BITS) - 1;
        self.idx = C::Idx::default();
    }

    /// Schedule propagator `p` with event `me`.
    ///
    /// Idempotent for events already accumulated in `p`'s pending delta.
    pub fn schedule(core: &mut Core, p: ActorId, me: ModEvent) {
        core.schedule::<C>(p, me);
    }

    /// Schedule all propagators subscribed with conditions `pc1..=pc2`.
    ///
    /// Iterates in reverse; within a cost class this keeps dequeue order
    /// aligned with subscription order.
    pub fn schedule_range(
        &self,
        core: &mut Core,
        pc1: PropCond,
        pc2: PropCond,
        me: ModEvent,
    ) {
        debug_assert!(pc1 >= 0 && pc1 <= pc2 && pc2 <= C::PC_MAX);
        let b = self.bucket_start(pc1);
        let e = self.idx_get(pc2 + 1);
        let mut i = e;
        while i > b {
            i -= 1;
            let entry = unsafe { self.slot(i) };
            debug_assert!(!entry.is_advisor());
            core.schedule::<C>(entry.actor(), me);
        }
    }

    fn enter_prop(&mut self, core: &mut Core, p: ActorId, pc: PropCond) {
        debug_assert!(pc >= 0 && pc <= C::PC_MAX);
        core.n_sub_add(1);
        if self.free() == 0 {
            self.resize(core);
        }

        unsafe {
            // Make room: the first advisor moves to the end, then each
            // bucket above pc rotates its first element to its end. Slots
            // beyond `entries` are zero-filled by resize, so the shuffles
            // below only ever move initialized words.
            let adv = self.advisor_start();
            let e = self.entries;
            let v = self.slot(adv);
            self.set_slot(e, v);
            self.entries += 1;
            let mut j = C::PC_MAX;
            while j > pc {
                let dst = self.idx_get(j + 1);
                let v = self.slot(self.idx_get(j));
                self.set_slot(dst, v);
                self.idx_add(j + 1, 1);
                j -= 1;
            }
            let dst = self.idx_get(pc + 1);
            let src = self.bucket_start(pc);
            let v = self.slot(src);
            self.set_slot(dst, v);
            self.idx_add(pc + 1, 1);
            self.set_slot(src, SubEntry::prop(p));
        }
        self.free_and_bits -= 1 << C::FREE_BITS;
        self.audit();
    }

    fn enter_advisor(&mut self, core: &mut Core, a: AdvisorId) {
        core.n_sub_add(1);
        if self.free() == 0 {
            self.resize(core);
        }

        unsafe {
            // First advisor moves to the end; the new advisor takes the
            // front of the advisor bucket.
            let adv = self.advisor_start();
            let e = self.entries;
            let v = self.slot(adv);
            self.set_slot(e, v);
            self.entries += 1;
            self.set_slot(adv, SubEntry::advisor(a));
        }
        self.free_and_bits -= 1 << C::FREE_BITS;
        self.audit();
    }

    fn remove_prop(&mut self, core: &mut Core, p: ActorId, pc: PropCond) {
        debug_assert!(pc >= 0 && pc <= C::PC_MAX);
        unsafe {
            let b = self.bucket_start(pc);
            let e = self.idx_get(pc + 1);
            let mut f = b;
            while f < e && self.slot(f) != SubEntry::prop(p) {
                f += 1;
            }
            assert!(f < e, "cancelled propagator is not subscribed at this condition");

            // Close the hole from the end of the bucket, then cascade the
            // last element of each higher bucket down one.
            let v = self.slot(e - 1);
            self.set_slot(f, v);
            let mut j = pc + 1;
            while j <= C::PC_MAX {
                let lo = self.idx_get(j);
                let hi = self.idx_get(j + 1);
                let v = self.slot(hi - 1);
                self.set_slot(lo - 1, v);
                self.idx_add(j, -1);
                j += 1;
            }
            let adv = self.idx_get(C::PC_MAX + 1);
            let v = self.slot(self.entries - 1);
            self.set_slot(adv - 1, v);
            self.idx_add(C::PC_MAX + 1, -1);
        }
        self.entries -= 1;
        self.free_and_bits += 1 << C::FREE_BITS;
        core.n_sub_sub(1);
        self.audit();
    }

    fn remove_advisor(&mut self, core: &mut Core, a: AdvisorId) {
        unsafe {
            let b = self.advisor_start();
            let e = self.entries;
            let mut f = b;
            while f < e && self.slot(f) != SubEntry::advisor(a) {
                f += 1;
            }
            assert!(f < e, "cancelled advisor is not subscribed");
            let v = self.slot(e - 1);
            self.set_slot(f, v);
        }
        self.entries -= 1;
        self.free_and_bits += 1 << C::FREE_BITS;
        core.n_sub_sub(1);
        self.audit();
    }

    fn resize(&mut self, core: &mut Core) {
        match self.sub {
            None => {
                debug_assert_eq!(self.free(), 0);
                // Fresh dependency array with four entries.
                self.free_and_bits += 4 << C::FREE_BITS;
                let p = core.mm.fl_alloc::<16>().cast::<SubEntry>();
                unsafe { std::ptr::write_bytes(p.as_ptr(), 0, 4) };
                self.sub = Some(p);
            }
            Some(old) => {
                let n = self.entries;
                // Arrays inside the clone-time subscription area grow
                // mildly; detached arrays grow geometrically.
                let m = if core.mm.in_sub_region(old.cast()) {
                    n + 4
                } else {
                    ((n + 1) * 3) >> 1
                };
                let new = core.mm.ralloc(sub_bytes(m)).cast::<SubEntry>();
                unsafe {
                    std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), n as usize);
                    std::ptr::write_bytes(new.as_ptr().add(n as usize), 0, (m - n) as usize);
                }
                core.mm.rfree(old.cast(), sub_bytes(n));
                self.free_and_bits += (m - n) << C::FREE_BITS;
                self.sub = Some(new);
            }
        }
    }

    /// The clone-side shell created in the register phase of cloning:
    /// no subscriptions yet, user bits preserved.
    pub(crate) fn cloned_shell(&self) -> VarImp<C> {
        VarImp {
            sub: None,
            entries: 0,
            free_and_bits: self.free_and_bits & ((1 << C::FREE_BITS) - 1),
            idx: C::Idx::default(),
            _marker: PhantomData,
        }
    }

    /// Install the rebuilt, compacted subscription array on a clone.
    ///
    /// `pad` is the number of trailing padding slots that keep the slice
    /// on the allocation granule; they are accounted as free slots so the
    /// slice is always freed with the size it occupies.
    pub(crate) fn install_rebuilt(
        &mut self,
        sub: Option<NonNull<SubEntry>>,
        entries: u32,
        pad: u32,
        idx: C::Idx,
    ) {
        debug_assert_eq!(self.entries, 0);
        self.sub = sub;
        self.entries = entries;
        self.free_and_bits += pad << C::FREE_BITS;
        self.idx = idx;
    }

    pub(crate) fn idx_copy(&self) -> C::Idx {
        self.idx
    }

    /// Partition soundness; cheap enough to keep on in debug builds.
    fn audit(&self) {
        #[cfg(debug_assertions)]
        {
            let mut prev = 0u32;
            for pc in 1..=C::PC_MAX + 1 {
                let b = self.idx_get(pc);
                debug_assert!(b >= prev, "partition boundaries must be weakly increasing");
                prev = b;
            }
            debug_assert!(prev <= self.entries);
        }
    }
}

impl<C: VarConf> Default for VarImp<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: VarConf> fmt::Debug for VarImp<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarImp")
            .field("entries", &self.entries)
            .field("free", &self.free())
            .field("idx", &self.idx.as_ref())
            .finish()
    }
}

/// A concrete variable type: domain representation plus embedded
/// [`VarImp`].
pub trait VarType: Send + 'static {
    /// The variable-implementation configuration of this type.
    type Conf: VarConf;

    /// The embedded subscription core.
    fn imp(&self) -> &VarImp<Self::Conf>;

    /// The embedded subscription core, mutably.
    fn imp_mut(&mut self) -> &mut VarImp<Self::Conf>;

    /// Whether the variable is assigned to a single value.
    fn assigned(&self) -> bool;

    /// Duplicate the domain for a clone in progress.
    ///
    /// Only the domain needs copying; the kernel replaces the copy's
    /// subscription core and rebuilds it in the reset phase. Handles held
    /// inside the domain must be pushed through `ctx`.
    fn copy(&self, ctx: &mut CloneCtx<'_>, share: bool) -> Self;
}

/// Handle to a variable of type `V` within one space lineage.
///
/// Handles must be carried through [`CloneCtx::update`] when a space is
/// cloned; clones re-index their variables.
pub struct VarRef<V> {
    pub(crate) idx: u32,
    _marker: PhantomData<fn() -> V>,
}

impl<V> VarRef<V> {
    pub(crate) fn new(idx: u32) -> Self {
        Self { idx, _marker: PhantomData }
    }
}

impl<V> Clone for VarRef<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for VarRef<V> {}

impl<V> PartialEq for VarRef<V> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}

impl<V> Eq for VarRef<V> {}

impl<V> fmt::Debug for VarRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarRef({})", self.idx)
    }
}

pub(crate) struct VarCell<V> {
    /// `None` only transiently while the variable is checked out during
    /// cloning.
    pub(crate) var: Option<V>,
    /// During cloning: index of this variable's copy in the clone.
    pub(crate) fwd: Option<u32>,
}

/// Per-category variable storage.
pub(crate) struct TypedStore<V: VarType> {
    pub(crate) cells: Vec<VarCell<V>>,
}

impl<V: VarType> TypedStore<V> {
    fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub(crate) fn push(&mut self, v: V) -> u32 {
        let i = self.cells.len() as u32;
        self.cells.push(VarCell { var: Some(v), fwd: None });
        i
    }

    pub(crate) fn var(&self, i: u32) -> &V {
        self.cells[i as usize].var.as_ref().expect("variable checked out")
    }

    pub(crate) fn var_mut(&mut self, i: u32) -> &mut V {
        self.cells[i as usize].var.as_mut().expect("variable checked out")
    }
}

/// Cursor carving the contiguous subscription region during the reset
/// phase of cloning.
pub(crate) struct SubCursor {
    cur: *mut SubEntry,
    remaining: u32,
}

impl SubCursor {
    pub(crate) fn new(base: NonNull<u8>, slots: u32) -> Self {
        Self { cur: base.cast::<SubEntry>().as_ptr(), remaining: slots }
    }

    fn start(&self) -> NonNull<SubEntry> {
        NonNull::new(self.cur).expect("subscription cursor")
    }

    fn advance(&mut self, n: u32) {
        debug_assert!(n <= self.remaining, "subscription region overrun");
        self.remaining -= n;
        self.cur = unsafe { self.cur.add(n as usize) };
    }
}

/// Erased per-category operations, instantiated once per registered type.
#[derive(Clone, Copy)]
pub(crate) struct CatOps {
    pub(crate) new_store: fn() -> Box<dyn Any + Send>,
    pub(crate) rebuild: fn(
        orig: &mut (dyn Any + Send),
        clone: &mut (dyn Any + Send),
        updates: &[u32],
        actors: &ActorArena,
        advisors: &AdvisorArena,
        cursor: &mut SubCursor,
    ) -> u32,
    pub(crate) med_combine: fn(ModEventDelta, ModEventDelta) -> ModEventDelta,
}

/// Rebuild the subscription arrays of all registered clones of one
/// category, mapping actor and advisor references through the forwards
/// recorded while copying actors. Entries referring to advisors that were
/// disposed before the clone are dropped here; this is where lazy advisor
/// removal completes.
fn rebuild_category<V: VarType>(
    orig: &mut (dyn Any + Send),
    clone: &mut (dyn Any + Send),
    updates: &[u32],
    actors: &ActorArena,
    advisors: &AdvisorArena,
    cursor: &mut SubCursor,
) -> u32 {
    let orig = orig.downcast_mut::<TypedStore<V>>().expect("category store type");
    let clone = clone.downcast_mut::<TypedStore<V>>().expect("category store type");
    let mut written = 0;
    for &oi in updates {
        let ni = orig.cells[oi as usize].fwd.take().expect("registered original has forward");
        let oimp = orig.cells[oi as usize]
            .var
            .as_ref()
            .expect("original variable present")
            .imp();
        let o_entries = oimp.degree();
        let adv_start = oimp.advisor_start();
        let had_array = oimp.sub.is_some();
        let mut idx = oimp.idx_copy();

        let dst = cursor.start();
        let mut kept: u32 = 0;
        for k in 0..o_entries {
            let e = oimp.entry_at(k);
            let mapped = if e.is_advisor() {
                debug_assert!(k >= adv_start);
                match advisors.fwd(e.advisor_id()) {
                    Some(na) => SubEntry::advisor(na),
                    None => {
                        debug_assert!(advisors.disposed(e.advisor_id()));
                        continue;
                    }
                }
            } else {
                let na = actors
                    .cell(e.actor().0)
                    .fwd
                    .expect("subscribed propagator was not copied");
                SubEntry::prop(ActorId(na))
            };
            unsafe { dst.as_ptr().add(kept as usize).write(mapped) };
            kept += 1;
        }
        // Slices stay on the 8-byte allocation granule; an odd entry
        // count leaves one zeroed padding slot.
        let pad = kept & 1;
        if pad == 1 {
            unsafe { dst.as_ptr().add(kept as usize).write(SubEntry(0)) };
        }
        cursor.advance(kept + pad);

        // Dropped entries were all advisors, so only the total shrinks;
        // the propagator partition boundaries carry over unchanged.
        for b in idx.as_mut() {
            debug_assert!(*b <= o_entries);
        }
        let nimp = clone.cells[ni as usize]
            .var
            .as_mut()
            .expect("clone variable present")
            .imp_mut();
        nimp.install_rebuilt(if had_array { Some(dst) } else { None }, kept, pad, idx);
        written += kept;
    }
    written
}

fn new_store<V: VarType>() -> Box<dyn Any + Send> {
    Box::new(TypedStore::<V>::new())
}

pub(crate) struct Category {
    pub(crate) store: Box<dyn Any + Send>,
    pub(crate) ops: CatOps,
}

/// The registry of variable categories of one space.
///
/// Registration order assigns the category index; clones replicate the
/// registry with empty stores.
pub(crate) struct VarTable {
    pub(crate) cats: Vec<Category>,
    by_type: HashMap<TypeId, u16>,
}

impl VarTable {
    pub(crate) fn new() -> Self {
        Self { cats: Vec::new(), by_type: HashMap::new() }
    }

    pub(crate) fn register<V: VarType>(&mut self) -> u16 {
        if let Some(&c) = self.by_type.get(&TypeId::of::<V>()) {
            return c;
        }
        let c = self.cats.len() as u16;
        self.cats.push(Category {
            store: new_store::<V>(),
            ops: CatOps {
                new_store: new_store::<V>,
                rebuild: rebuild_category::<V>,
                med_combine: med_combine_cat::<V::Conf>,
            },
        });
        self.by_type.insert(TypeId::of::<V>(), c);
        c
    }

    pub(crate) fn cat_of<V: VarType>(&self) -> u16 {
        *self
            .by_type
            .get(&TypeId::of::<V>())
            .expect("variable type not registered with this space")
    }

    pub(crate) fn store<V: VarType>(&self) -> &TypedStore<V> {
        let c = self.cat_of::<V>();
        self.cats[c as usize].store.downcast_ref().expect("category store type")
    }

    pub(crate) fn store_mut<V: VarType>(&mut self) -> &mut TypedStore<V> {
        let c = self.cat_of::<V>();
        self.cats[c as usize].store.downcast_mut().expect("category store type")
    }

    pub(crate) fn ncats(&self) -> usize {
        self.cats.len()
    }

    /// Same categories, empty stores; used to seed a clone.
    pub(crate) fn fresh_like(&self) -> VarTable {
        VarTable {
            cats: self
                .cats
                .iter()
                .map(|c| Category { store: (c.ops.new_store)(), ops: c.ops })
                .collect(),
            by_type: self.by_type.clone(),
        }
    }
}

impl fmt::Debug for VarTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarTable").field("categories", &self.cats.len()).finish()
    }
}
