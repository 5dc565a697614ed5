// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Propagation behaviour over a real variable type: condition-selective
//! scheduling, event accumulation and fixpoint stability.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use fdspace::space::{Counter, Space, SpaceStatus, Statistics};
use fdspace::var::VarType;
use fdspace::SpaceError;

fn iv_space() -> Space {
    let mut s = Space::new();
    s.register::<IntervalVar>();
    s
}

#[test]
fn test_empty_space_is_solved() {
    let mut s = iv_space();
    let _x = s.new_var(IntervalVar::new(0, 9));
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(stats.get(Counter::Propagations), 0);
    assert!(matches!(s.description(), Err(SpaceError::NoBranching)));
}

#[test]
fn test_failing_propagator_and_clone_on_failed() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    FalseProp::post(&mut s, x);
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Failed);
    assert!(matches!(s.clone(false), Err(SpaceError::Failed { .. })));
    assert!(matches!(s.clone(true), Err(SpaceError::Failed { .. })));
}

#[test]
fn test_le_narrows_both_bounds() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let y = s.new_var(IntervalVar::new(3, 5));
    LeProp::post(&mut s, x, y);
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(s.var(x).max(), 5);
    assert_eq!(s.var(x).min(), 0);
    assert_eq!(s.var(y).min(), 3);
}

#[test]
fn test_le_chain_reaches_fixpoint() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let y = s.new_var(IntervalVar::new(0, 9));
    let z = s.new_var(IntervalVar::new(0, 2));
    LeProp::post(&mut s, x, y);
    LeProp::post(&mut s, y, z);
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(s.var(x).max(), 2);
    assert_eq!(s.var(y).max(), 2);
    // Stability: a second status performs no work.
    let before = stats.get(Counter::Propagations);
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(stats.get(Counter::Propagations), before);
}

#[test]
fn test_propagation_condition_selects_subscribers() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let log = Arc::new(Mutex::new(Vec::new()));
    TraceIvProp::post(&mut s, &[x], PC_IV_VAL, false, "val", Arc::clone(&log));
    TraceIvProp::post(&mut s, &[x], PC_IV_BND, false, "bnd", Arc::clone(&log));

    // A bound change wakes only the bound subscriber.
    tell_max(&mut s, x, 7).unwrap();
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(*log.lock().unwrap(), vec!["bnd"]);

    // Assignment wakes both.
    log.lock().unwrap().clear();
    tell_eq(&mut s, x, 3).unwrap();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    let mut woken = log.lock().unwrap().clone();
    woken.sort();
    assert_eq!(woken, vec!["bnd", "val"]);
}

#[test]
fn test_events_accumulate_to_one_execution() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let y = s.new_var(IntervalVar::new(0, 9));
    let log = Arc::new(Mutex::new(Vec::new()));
    TraceIvProp::post(&mut s, &[x, y], PC_IV_BND, false, "p", Arc::clone(&log));

    // Two events on two subscribed variables before the next fixpoint:
    // the propagator still runs exactly once.
    tell_max(&mut s, x, 7).unwrap();
    tell_max(&mut s, y, 6).unwrap();
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn test_subscription_growth_and_cancel() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut props = Vec::new();
    for _ in 0..10 {
        props.push(TraceIvProp::post(&mut s, &[x], PC_IV_BND, false, "p", Arc::clone(&log)));
    }
    assert_eq!(s.var(x).imp().degree(), 10);
    for p in &props[..4] {
        s.cancel(x, *p, PC_IV_BND);
    }
    assert_eq!(s.var(x).imp().degree(), 6);

    // The remaining subscribers all still wake exactly once.
    tell_max(&mut s, x, 4).unwrap();
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(log.lock().unwrap().len(), 6);
}

#[test]
fn test_tell_to_empty_domain_fails() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(3, 7));
    assert_eq!(tell_max(&mut s, x, 2), Err(TellFailed));
    assert_eq!(tell_min(&mut s, x, 8), Err(TellFailed));
}

#[test]
fn test_assignment_cancels_subscriptions() {
    let mut s = iv_space();
    let x = s.new_var(IntervalVar::new(0, 9));
    let log = Arc::new(Mutex::new(Vec::new()));
    TraceIvProp::post(&mut s, &[x], PC_IV_BND, false, "p", Arc::clone(&log));
    assert_eq!(s.var(x).imp().degree(), 1);
    tell_eq(&mut s, x, 5).unwrap();
    // The assignment delivered the final schedule and dropped the array.
    assert_eq!(s.var(x).imp().degree(), 0);
    let mut stats = Statistics::new();
    assert_eq!(s.status(&mut stats), SpaceStatus::Solved);
    assert_eq!(log.lock().unwrap().len(), 1);
}
