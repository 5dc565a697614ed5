// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Sequential branch-and-bound.
//!
//! Depth-first exploration with clone-before-commit: at every choice point
//! the engine clones one sibling per remaining alternative, commits each
//! clone to its alternative and stacks it, then follows the first
//! alternative. Whenever a solution is found, later nodes are constrained
//! against it lazily: each stacked node remembers the best-solution
//! generation it was last constrained with, and is re-constrained when
//! popped if a better solution arrived in the meantime.

use crate::actor::Description;
use crate::errors::SpaceError;
use crate::search::Engine;
use crate::space::{Counter, Space, SpaceStatus, Statistics};

/// A stacked node: a space already committed to its alternative, plus the
/// best-solution generation it has been constrained with.
struct Node {
    space: Space,
    best_gen: u64,
}

/// Sequential branch-and-bound engine.
pub struct SeqBab {
    /// Space currently being followed down the tree.
    cur: Option<Node>,
    /// Open nodes awaiting exploration.
    stack: Vec<Node>,
    /// Master copy of the best solution found so far.
    best: Option<Space>,
    /// Bumped whenever `best` improves.
    best_gen: u64,
    stats: Statistics,
}

impl SeqBab {
    /// Create an engine exploring from `root`.
    pub fn new(root: Space) -> Self {
        Self {
            cur: Some(Node { space: root, best_gen: 0 }),
            stack: Vec::new(),
            best: None,
            best_gen: 0,
            stats: Statistics::new(),
        }
    }

    fn take_next_node(&mut self) -> Option<Node> {
        self.cur.take().or_else(|| self.stack.pop())
    }
}

impl Engine for SeqBab {
    fn next(&mut self) -> Result<Option<Space>, SpaceError> {
        while let Some(mut node) = self.take_next_node() {
            if node.best_gen < self.best_gen {
                let best = self.best.as_ref().expect("generation implies a best solution");
                node.space.constrain(best)?;
                node.best_gen = self.best_gen;
            }
            match node.space.status(&mut self.stats) {
                SpaceStatus::Failed => {
                    self.stats.incr(Counter::Failures);
                }
                SpaceStatus::Solved => {
                    let mut solution = node.space;
                    self.best = Some(solution.clone(true)?);
                    self.best_gen += 1;
                    self.stats.incr(Counter::Solutions);
                    return Ok(Some(solution));
                }
                SpaceStatus::Branch => {
                    self.stats.incr(Counter::Nodes);
                    let d = node.space.description()?;
                    let alts = d.base().alternatives();
                    // Stack the right siblings committed to their
                    // alternatives, then follow the leftmost.
                    for alt in (1..alts).rev() {
                        let mut sib = node.space.clone(false)?;
                        self.stats.incr(Counter::Clones);
                        sib.commit(&*d, alt)?;
                        self.stats.incr(Counter::Commits);
                        self.stack.push(Node { space: sib, best_gen: node.best_gen });
                    }
                    node.space.commit(&*d, 0)?;
                    self.stats.incr(Counter::Commits);
                    self.cur = Some(node);
                }
            }
        }
        Ok(None)
    }

    fn statistics(&self) -> Statistics {
        self.stats.clone()
    }
}
