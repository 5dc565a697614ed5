// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Parallel branch-and-bound.
//!
//! A fixed pool of workers shares a frontier of open subtrees. Cloning is
//! the only sharing primitive: every space handed across threads was
//! cloned with `share = false`, so workers never touch common mutable
//! state. Each worker runs the same depth-first loop as the sequential
//! engine on its subtree and donates committed siblings to the shared
//! frontier while it runs low.
//!
//! The best solution is a single master copy behind a mutex. Acceptance is
//! serialized: a candidate is constrained against the current best and
//! re-propagated under the lock, so the stream of solutions reported by
//! [`Engine::next`] is strictly improving, exactly as in the sequential
//! engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::actor::Description;
use crate::errors::SpaceError;
use crate::search::Engine;
use crate::space::{Counter, Space, SpaceStatus, Statistics};

struct Frontier {
    queue: Vec<(Space, u64)>,
    waiting: usize,
    done: bool,
}

struct Shared {
    frontier: Mutex<Frontier>,
    work_ready: Condvar,
    best: Mutex<Option<Space>>,
    best_gen: AtomicU64,
    stop: AtomicBool,
    stats: Mutex<Statistics>,
    threads: usize,
}

/// Parallel branch-and-bound engine.
pub struct ParBab {
    shared: Arc<Shared>,
    rx: Receiver<Result<Space, SpaceError>>,
    tx: Option<Sender<Result<Space, SpaceError>>>,
    root: Option<Space>,
    workers: Vec<JoinHandle<()>>,
}

impl ParBab {
    /// Create an engine exploring from `root` with `threads` workers.
    pub fn new(root: Space, threads: usize) -> Self {
        debug_assert!(threads > 1);
        let (tx, rx) = channel();
        Self {
            shared: Arc::new(Shared {
                frontier: Mutex::new(Frontier { queue: Vec::new(), waiting: 0, done: false }),
                work_ready: Condvar::new(),
                best: Mutex::new(None),
                best_gen: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                stats: Mutex::new(Statistics::new()),
                threads,
            }),
            rx,
            tx: Some(tx),
            root: Some(root),
            workers: Vec::new(),
        }
    }

    fn start(&mut self) {
        let root = match self.root.take() {
            Some(r) => r,
            None => return,
        };
        self.shared.frontier.lock().queue.push((root, 0));
        let tx = self.tx.take().expect("workers started once");
        for _ in 0..self.shared.threads {
            let shared = Arc::clone(&self.shared);
            let tx = tx.clone();
            self.workers.push(std::thread::spawn(move || worker(shared, tx)));
        }
        // Workers hold the only senders; the channel closes when the last
        // one exits.
    }
}

impl Engine for ParBab {
    fn next(&mut self) -> Result<Option<Space>, SpaceError> {
        self.start();
        match self.rx.recv() {
            Ok(Ok(solution)) => Ok(Some(solution)),
            Ok(Err(e)) => Err(e),
            // All workers exited: search space exhausted.
            Err(_) => Ok(None),
        }
    }

    fn statistics(&self) -> Statistics {
        self.shared.stats.lock().clone()
    }
}

impl Drop for ParBab {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.work_ready.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// Fetch the next subtree, or park until one arrives. Returns `None` once
/// every worker is waiting on an empty frontier (exhaustion) or the engine
/// is stopping.
fn fetch(shared: &Shared) -> Option<(Space, u64)> {
    let mut f = shared.frontier.lock();
    loop {
        if shared.stop.load(Ordering::Relaxed) || f.done {
            return None;
        }
        if let Some(it) = f.queue.pop() {
            return Some(it);
        }
        f.waiting += 1;
        if f.waiting == shared.threads {
            f.done = true;
            shared.work_ready.notify_all();
            return None;
        }
        shared.work_ready.wait(&mut f);
        f.waiting -= 1;
    }
}

/// Donate a committed sibling to the frontier when it runs low; keep it
/// local otherwise.
fn donate_or_keep(shared: &Shared, local: &mut Vec<(Space, u64)>, item: (Space, u64)) {
    let mut f = shared.frontier.lock();
    if f.waiting > 0 || f.queue.len() < shared.threads {
        f.queue.push(item);
        shared.work_ready.notify_one();
    } else {
        drop(f);
        local.push(item);
    }
}

fn worker(shared: Arc<Shared>, tx: Sender<Result<Space, SpaceError>>) {
    let mut local: Vec<(Space, u64)> = Vec::new();
    let mut stats = Statistics::new();

    let report = |e: SpaceError, shared: &Shared, tx: &Sender<Result<Space, SpaceError>>| {
        let _ = tx.send(Err(e));
        shared.stop.store(true, Ordering::Relaxed);
        shared.work_ready.notify_all();
    };

    'outer: loop {
        let (mut space, mut gen) = match local.pop().or_else(|| fetch(&shared)) {
            Some(it) => it,
            None => break,
        };
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        // Constrain against a best solution this subtree has not seen.
        if gen < shared.best_gen.load(Ordering::Acquire) {
            let best = shared.best.lock();
            if let Some(b) = &*best {
                if let Err(e) = space.constrain(b) {
                    report(e, &shared, &tx);
                    break;
                }
            }
            gen = shared.best_gen.load(Ordering::Acquire);
        }

        match space.status(&mut stats) {
            SpaceStatus::Failed => {
                stats.incr(Counter::Failures);
            }
            SpaceStatus::Solved => {
                // Serialize acceptance: the candidate must still beat the
                // current best.
                let mut best = shared.best.lock();
                let mut candidate = space;
                if best.is_some() {
                    let verdict: Result<bool, SpaceError> = {
                        let b = best.as_ref().expect("checked above");
                        candidate
                            .constrain(b)
                            .map(|()| candidate.status(&mut stats) == SpaceStatus::Solved)
                    };
                    match verdict {
                        Ok(true) => {}
                        Ok(false) => {
                            stats.incr(Counter::Failures);
                            continue;
                        }
                        Err(e) => {
                            drop(best);
                            report(e, &shared, &tx);
                            break 'outer;
                        }
                    }
                }
                match candidate.clone(true) {
                    Ok(master) => {
                        *best = Some(master);
                        shared.best_gen.fetch_add(1, Ordering::Release);
                        stats.incr(Counter::Solutions);
                        trace!("parallel bab: improving solution");
                        drop(best);
                        if tx.send(Ok(candidate)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        drop(best);
                        report(e, &shared, &tx);
                        break;
                    }
                }
            }
            SpaceStatus::Branch => {
                stats.incr(Counter::Nodes);
                let d = match space.description() {
                    Ok(d) => d,
                    Err(e) => {
                        report(e, &shared, &tx);
                        break;
                    }
                };
                let alts = d.base().alternatives();
                for alt in (1..alts).rev() {
                    let sib = space.clone(false).and_then(|mut sib| {
                        sib.commit(&*d, alt)?;
                        Ok(sib)
                    });
                    match sib {
                        Ok(sib) => {
                            stats.incr(Counter::Clones);
                            stats.incr(Counter::Commits);
                            donate_or_keep(&shared, &mut local, (sib, gen));
                        }
                        Err(e) => {
                            report(e, &shared, &tx);
                            break 'outer;
                        }
                    }
                }
                if let Err(e) = space.commit(&*d, 0) {
                    report(e, &shared, &tx);
                    break;
                }
                stats.incr(Counter::Commits);
                local.push((space, gen));
            }
        }
    }

    shared.stats.lock().merge(&stats);
}
