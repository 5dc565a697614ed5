// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Shared test fixture: a bounds-interval variable type with matching
//! propagators, a naive branching and a model for best-solution search.
//!
//! This plays the role a finite-domain library plays in production: the
//! kernel under test only ever sees it through the `VarType` / `Propagate`
//! / `Branch` / `Model` contracts.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fdspace::actor::{
    ActorId, Branch, BranchId, DescBase, Description, ExecStatus, PropCost, Propagate,
};
use fdspace::advisor::{Advice, AdvisorId, Council};
use fdspace::space::{CloneCtx, Model, Space};
use fdspace::var::{
    Delta, ModEvent, ModEventDelta, PropCond, VarConf, VarImp, VarRef, VarType, ME_GEN_NONE,
};
use fdspace::SpaceError;

/// Modification event: variable assigned.
pub const ME_IV_VAL: ModEvent = 1;
/// Modification event: a bound changed.
pub const ME_IV_BND: ModEvent = 2;

/// Propagation condition: wake on assignment only.
pub const PC_IV_VAL: PropCond = 0;
/// Propagation condition: wake on any bound change.
pub const PC_IV_BND: PropCond = 1;

/// Configuration of the interval variable type.
pub struct IvConf;

impl VarConf for IvConf {
    const PC_MAX: PropCond = PC_IV_BND;
    const FREE_BITS: u32 = 0;
    const MED_FST: u32 = 0;
    const MED_LST: u32 = 2;
    const MED_MASK: ModEventDelta = 0b11;
    type Idx = [u32; 2];

    fn me_combine(me1: ModEvent, me2: ModEvent) -> ModEvent {
        match (me1, me2) {
            (ME_GEN_NONE, me) | (me, ME_GEN_NONE) => me,
            (ME_IV_VAL, _) | (_, ME_IV_VAL) => ME_IV_VAL,
            _ => ME_IV_BND,
        }
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

/// An integer variable with interval (bounds) domain.
pub struct IntervalVar {
    min: i32,
    max: i32,
    imp: VarImp<IvConf>,
}

impl IntervalVar {
    pub fn new(min: i32, max: i32) -> Self {
        assert!(min <= max);
        Self { min, max, imp: VarImp::new() }
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    /// The assigned value.
    pub fn val(&self) -> i32 {
        assert!(self.assigned());
        self.min
    }
}

impl VarType for IntervalVar {
    type Conf = IvConf;

    fn imp(&self) -> &VarImp<IvConf> {
        &self.imp
    }

    fn imp_mut(&mut self) -> &mut VarImp<IvConf> {
        &mut self.imp
    }

    fn assigned(&self) -> bool {
        self.min == self.max
    }

    fn copy(&self, _ctx: &mut CloneCtx<'_>, _share: bool) -> Self {
        IntervalVar::new(self.min, self.max)
    }
}

/// Tell failure: the domain would become empty.
#[derive(Debug, PartialEq, Eq)]
pub struct TellFailed;

fn notify(home: &mut Space, x: VarRef<IntervalVar>, me: ModEvent) -> Result<(), TellFailed> {
    match me {
        ME_IV_VAL => home.schedule_range(x, PC_IV_VAL, PC_IV_BND, me),
        _ => home.schedule_range(x, PC_IV_BND, PC_IV_BND, me),
    }
    if !home.advise(x, me) {
        return Err(TellFailed);
    }
    if me == ME_IV_VAL {
        // Assigned: all subscriptions got their final schedule.
        home.cancel_all(x);
    }
    Ok(())
}

/// Tell `x <= n`.
pub fn tell_max(
    home: &mut Space,
    x: VarRef<IntervalVar>,
    n: i32,
) -> Result<ModEvent, TellFailed> {
    let me = {
        let v = home.var_mut(x);
        if n >= v.max {
            return Ok(ME_GEN_NONE);
        }
        if n < v.min {
            return Err(TellFailed);
        }
        v.max = n;
        if v.assigned() {
            ME_IV_VAL
        } else {
            ME_IV_BND
        }
    };
    notify(home, x, me)?;
    Ok(me)
}

/// Tell `x >= n`.
pub fn tell_min(
    home: &mut Space,
    x: VarRef<IntervalVar>,
    n: i32,
) -> Result<ModEvent, TellFailed> {
    let me = {
        let v = home.var_mut(x);
        if n <= v.min {
            return Ok(ME_GEN_NONE);
        }
        if n > v.max {
            return Err(TellFailed);
        }
        v.min = n;
        if v.assigned() {
            ME_IV_VAL
        } else {
            ME_IV_BND
        }
    };
    notify(home, x, me)?;
    Ok(me)
}

/// Tell `x = n`.
pub fn tell_eq(
    home: &mut Space,
    x: VarRef<IntervalVar>,
    n: i32,
) -> Result<(), TellFailed> {
    tell_min(home, x, n)?;
    tell_max(home, x, n)?;
    Ok(())
}

/// Bounds-consistent `x <= y`.
pub struct LeProp {
    id: ActorId,
    x: VarRef<IntervalVar>,
    y: VarRef<IntervalVar>,
}

impl LeProp {
    /// Post `x <= y` on `home`.
    pub fn post(home: &mut Space, x: VarRef<IntervalVar>, y: VarRef<IntervalVar>) -> ActorId {
        home.post_with(|home, id| {
            home.subscribe(x, id, PC_IV_BND, ME_IV_BND, true);
            home.subscribe(y, id, PC_IV_BND, ME_IV_BND, true);
            Box::new(LeProp { id, x, y })
        })
    }
}

impl Propagate for LeProp {
    fn propagate(&mut self, home: &mut Space, _med: ModEventDelta) -> ExecStatus {
        let (ymax, xmin) = (home.var(self.y).max(), home.var(self.x).min());
        if tell_max(home, self.x, ymax).is_err() {
            return ExecStatus::Failed;
        }
        if tell_min(home, self.y, xmin).is_err() {
            return ExecStatus::Failed;
        }
        if home.var(self.x).max() <= home.var(self.y).min() {
            let size = self.dispose(home);
            return ExecStatus::Subsumed(size);
        }
        ExecStatus::Fix
    }

    fn cost(&self, _med: ModEventDelta) -> PropCost {
        PropCost::BinaryLo
    }

    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
        Box::new(LeProp {
            id: ctx.self_id(),
            x: ctx.update(self.x),
            y: ctx.update(self.y),
        })
    }

    fn dispose(&mut self, home: &mut Space) -> usize {
        home.cancel(self.x, self.id, PC_IV_BND);
        home.cancel(self.y, self.id, PC_IV_BND);
        std::mem::size_of_val(self)
    }
}

/// Propagator that only records its executions.
pub struct TraceIvProp {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<&'static str>>>,
}

impl TraceIvProp {
    /// Post a tracer subscribed to `vars` with condition `pc`. With
    /// `schedule = false` it only runs once an event of sufficient
    /// severity arrives.
    pub fn post(
        home: &mut Space,
        vars: &[VarRef<IntervalVar>],
        pc: PropCond,
        schedule: bool,
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> ActorId {
        home.post_with(|home, id| {
            for &x in vars {
                home.subscribe(x, id, pc, ME_IV_BND, schedule);
            }
            Box::new(TraceIvProp { name, log })
        })
    }
}

impl Propagate for TraceIvProp {
    fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
        self.log.lock().unwrap().push(self.name);
        ExecStatus::Fix
    }

    fn cost(&self, _med: ModEventDelta) -> PropCost {
        PropCost::UnaryLo
    }

    fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
        Box::new(TraceIvProp { name: self.name, log: Arc::clone(&self.log) })
    }
}

/// Propagator rejecting one value of a variable, checked only once the
/// variable is assigned.
pub struct ForbidValProp {
    id: ActorId,
    x: VarRef<IntervalVar>,
    forbidden: i32,
}

impl ForbidValProp {
    pub fn post(home: &mut Space, x: VarRef<IntervalVar>, forbidden: i32) -> ActorId {
        home.post_with(|home, id| {
            home.subscribe(x, id, PC_IV_VAL, ME_IV_VAL, false);
            Box::new(ForbidValProp { id, x, forbidden })
        })
    }
}

impl Propagate for ForbidValProp {
    fn propagate(&mut self, home: &mut Space, _med: ModEventDelta) -> ExecStatus {
        if home.var(self.x).assigned() {
            if home.var(self.x).val() == self.forbidden {
                return ExecStatus::Failed;
            }
            let size = self.dispose(home);
            return ExecStatus::Subsumed(size);
        }
        ExecStatus::Fix
    }

    fn cost(&self, _med: ModEventDelta) -> PropCost {
        PropCost::UnaryLo
    }

    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
        Box::new(ForbidValProp {
            id: ctx.self_id(),
            x: ctx.update(self.x),
            forbidden: self.forbidden,
        })
    }

    fn dispose(&mut self, home: &mut Space) -> usize {
        home.cancel(self.x, self.id, PC_IV_VAL);
        std::mem::size_of_val(self)
    }
}

/// Propagator failing on first execution.
pub struct FalseProp;

impl FalseProp {
    pub fn post(home: &mut Space, x: VarRef<IntervalVar>) -> ActorId {
        home.post_with(|home, id| {
            home.subscribe(x, id, PC_IV_BND, ME_IV_BND, true);
            Box::new(FalseProp)
        })
    }
}

impl Propagate for FalseProp {
    fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
        ExecStatus::Failed
    }

    fn cost(&self, _med: ModEventDelta) -> PropCost {
        PropCost::UnaryLo
    }

    fn copy(&self, _ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
        Box::new(FalseProp)
    }
}

/// Advisor payload: which variable is watched and a tag for the trace.
pub struct Watch {
    pub x: VarRef<IntervalVar>,
    pub tag: usize,
}

impl Advice for Watch {
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Advice> {
        Box::new(Watch { x: ctx.update(self.x), tag: self.tag })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Propagator observing a variable through advisors.
///
/// Every advisor logs its tag when advised; the advisor whose tag equals
/// `subsume_tag` subsumes itself on its first notification. Advise always
/// reports fixpoint, so the propagator itself never gets scheduled.
pub struct WatchProp {
    pub council: Council<Watch>,
    subsume_tag: Option<usize>,
    log: Arc<Mutex<Vec<usize>>>,
}

impl WatchProp {
    /// Post a watcher with one advisor per tag on `x`.
    pub fn post(
        home: &mut Space,
        x: VarRef<IntervalVar>,
        tags: &[usize],
        subsume_tag: Option<usize>,
        log: Arc<Mutex<Vec<usize>>>,
    ) -> ActorId {
        home.post_with(|home, id| {
            let mut council = Council::new();
            for &tag in tags {
                let a = home.new_advisor(id, &mut council, Watch { x, tag });
                home.subscribe_advisor(x, a);
            }
            Box::new(WatchProp { council, subsume_tag, log })
        })
    }
}

impl Propagate for WatchProp {
    fn propagate(&mut self, _home: &mut Space, _med: ModEventDelta) -> ExecStatus {
        ExecStatus::Fix
    }

    fn cost(&self, _med: ModEventDelta) -> PropCost {
        PropCost::UnaryLo
    }

    fn advise(&mut self, home: &mut Space, a: AdvisorId, _d: &Delta) -> ExecStatus {
        let tag = home.advisor::<Watch>(a).tag;
        self.log.lock().unwrap().push(tag);
        if self.subsume_tag == Some(tag) {
            ExecStatus::SubsumedFix
        } else {
            ExecStatus::Fix
        }
    }

    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Propagate> {
        Box::new(WatchProp {
            council: ctx.update_council(&self.council),
            subsume_tag: self.subsume_tag,
            log: Arc::clone(&self.log),
        })
    }

    fn dispose(&mut self, home: &mut Space) -> usize {
        let subs: Vec<(AdvisorId, VarRef<IntervalVar>)> =
            self.council.advisors(home).map(|(id, w)| (id, w.x)).collect();
        for (id, x) in subs {
            home.cancel_advisor(x, id);
        }
        self.council.dispose(home);
        std::mem::size_of_val(self)
    }
}

/// First-unassigned, smallest-value branching over a set of variables.
pub struct MinBranch {
    vars: Vec<VarRef<IntervalVar>>,
}

impl MinBranch {
    pub fn post(home: &mut Space, vars: Vec<VarRef<IntervalVar>>) -> ActorId {
        home.post_branch(Box::new(MinBranch { vars }))
    }
}

/// Description of a position/value choice with two alternatives:
/// `vars[pos] = val` or `vars[pos] >= val + 1`.
pub struct PosValDesc {
    base: DescBase,
    pos: usize,
    val: i32,
}

impl Description for PosValDesc {
    fn base(&self) -> &DescBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Branch for MinBranch {
    fn status(&self, home: &Space) -> bool {
        self.vars.iter().any(|&x| !home.var(x).assigned())
    }

    fn description(&mut self, home: &mut Space, id: BranchId) -> Box<dyn Description> {
        let (pos, val) = self
            .vars
            .iter()
            .enumerate()
            .find(|(_, &x)| !home.var(x).assigned())
            .map(|(i, &x)| (i, home.var(x).min()))
            .expect("description follows a positive status");
        Box::new(PosValDesc { base: DescBase::new(id, 2), pos, val })
    }

    fn commit(&mut self, home: &mut Space, d: &dyn Description, alt: u32) -> ExecStatus {
        let d = d.as_any().downcast_ref::<PosValDesc>().expect("description type");
        let x = self.vars[d.pos];
        let r = match alt {
            0 => tell_eq(home, x, d.val),
            _ => tell_min(home, x, d.val + 1).map(|_| ()),
        };
        match r {
            Ok(()) => ExecStatus::OK,
            Err(TellFailed) => ExecStatus::Failed,
        }
    }

    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Branch> {
        Box::new(MinBranch { vars: self.vars.iter().map(|&x| ctx.update(x)).collect() })
    }
}

/// Model maximizing its first variable.
pub struct MaxModel {
    pub vars: Vec<VarRef<IntervalVar>>,
}

impl Model for MaxModel {
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Model> {
        Box::new(MaxModel { vars: self.vars.iter().map(|&x| ctx.update(x)).collect() })
    }

    fn constrain(&mut self, home: &mut Space, best: &Space) -> Result<(), SpaceError> {
        let bm = best.model_ref::<MaxModel>().expect("best space carries the same model");
        let bound = best.var(bm.vars[0]).val();
        if tell_min(home, self.vars[0], bound + 1).is_err() {
            home.fail();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Model without a `constrain` implementation.
pub struct PlainModel {
    pub vars: Vec<VarRef<IntervalVar>>,
}

impl Model for PlainModel {
    fn copy(&self, ctx: &mut CloneCtx<'_>) -> Box<dyn Model> {
        Box::new(PlainModel { vars: self.vars.iter().map(|&x| ctx.update(x)).collect() })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
