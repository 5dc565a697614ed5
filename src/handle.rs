// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Copied and shared handles.
//!
//! A [`CopiedHandle`] gives entities inside a space access to an object
//! that lives in that space; updating during cloning guarantees exactly one
//! copy of the object per clone, with later encounters reusing the first
//! copy through a forward mark.
//!
//! A [`SharedHandle`] gives access to a reference-counted object outside
//! any space. An update with sharing just bumps the count; a non-sharing
//! update creates one copy per clone, tracked in the clone context's side
//! table so multiple handles to the same object converge on the same copy.

use std::any::Any;
use std::sync::Arc;

use crate::space::{CloneCtx, Space};

/// An object owned by a space and accessed through [`CopiedHandle`]s.
pub trait CopyObject: Send + 'static {
    /// Return a fresh copy for a clone in progress.
    fn copy(&self) -> Box<dyn CopyObject>;

    /// Downcast access.
    fn as_any(&self) -> &dyn Any;

    /// Downcast access, mutable.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct CopiedCell {
    pub(crate) obj: Box<dyn CopyObject>,
    /// During cloning: index of this object's copy in the clone.
    pub(crate) fwd: Option<u32>,
}

/// Handle to an object living inside a space, copied once per clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopiedHandle {
    idx: Option<u32>,
}

impl CopiedHandle {
    /// A handle pointing to no object.
    pub fn none() -> Self {
        Self { idx: None }
    }

    /// Move `obj` into `home` and return a handle to it.
    pub fn new(home: &mut Space, obj: Box<dyn CopyObject>) -> Self {
        let idx = home.core.copied.insert(CopiedCell { obj, fwd: None });
        Self { idx: Some(idx) }
    }

    /// Whether the handle points to an object.
    pub fn is_some(&self) -> bool {
        self.idx.is_some()
    }

    /// Access the object, downcast to `T`.
    pub fn get<'a, T: CopyObject>(&self, home: &'a Space) -> Option<&'a T> {
        let idx = self.idx?;
        home.core.copied.get(idx).and_then(|c| c.obj.as_any().downcast_ref())
    }

    /// Access the object mutably, downcast to `T`.
    pub fn get_mut<'a, T: CopyObject>(&self, home: &'a mut Space) -> Option<&'a mut T> {
        let idx = self.idx?;
        home.core.copied.get_mut(idx).and_then(|c| c.obj.as_any_mut().downcast_mut())
    }

    /// Update during cloning: the first encounter copies the object into
    /// the clone and records a forward; later encounters reuse it.
    pub fn update(ctx: &mut CloneCtx<'_>, other: &CopiedHandle) -> CopiedHandle {
        let idx = match other.idx {
            None => return CopiedHandle::none(),
            Some(i) => i,
        };
        if let Some(f) = ctx.from.core.copied[idx].fwd {
            return CopiedHandle { idx: Some(f) };
        }
        let copy = ctx.from.core.copied[idx].obj.copy();
        let ni = ctx.to.core.copied.insert(CopiedCell { obj: copy, fwd: None });
        ctx.from.core.copied[idx].fwd = Some(ni);
        ctx.register_copied(idx);
        CopiedHandle { idx: Some(ni) }
    }

    /// Drop the object and return its slot to the space.
    pub fn dispose(&mut self, home: &mut Space) {
        if let Some(idx) = self.idx.take() {
            home.core.copied.remove(idx);
        }
    }
}

impl Default for CopiedHandle {
    fn default() -> Self {
        Self::none()
    }
}

/// An object living outside any space, shared through [`SharedHandle`]s.
pub trait ShareObject: Send + Sync + 'static {
    /// Return a fresh copy for a non-sharing clone.
    fn copy(&self) -> Self
    where
        Self: Sized;
}

/// Reference-counted handle to an object outside any space.
///
/// The object lives as long as the longest-holding space; the count drops
/// with each handle and the object destroys itself at zero (all via
/// [`Arc`]).
pub struct SharedHandle<T: ShareObject> {
    o: Option<Arc<T>>,
}

impl<T: ShareObject> SharedHandle<T> {
    /// A handle pointing to no object.
    pub fn none() -> Self {
        Self { o: None }
    }

    /// Create a handle owning a fresh object.
    pub fn new(obj: T) -> Self {
        Self { o: Some(Arc::new(obj)) }
    }

    /// Access the object.
    pub fn get(&self) -> Option<&T> {
        self.o.as_deref()
    }

    /// Update during cloning.
    ///
    /// With `share = true` the clone's handle refers to the same object;
    /// otherwise the first encounter during this clone copies the object
    /// and later encounters converge on that copy.
    pub fn update(ctx: &mut CloneCtx<'_>, share: bool, other: &SharedHandle<T>) -> Self {
        let o = match &other.o {
            None => return Self::none(),
            Some(o) => o,
        };
        if share {
            return Self { o: Some(Arc::clone(o)) };
        }
        let key = Arc::as_ptr(o) as usize;
        if let Some(fwd) = ctx.shared_fwd(key) {
            let arc = fwd.downcast_ref::<Arc<T>>().expect("shared forward type");
            return Self { o: Some(Arc::clone(arc)) };
        }
        let copy = Arc::new(o.copy());
        ctx.record_shared_fwd(key, Box::new(Arc::clone(&copy)));
        Self { o: Some(copy) }
    }
}

impl<T: ShareObject> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        Self { o: self.o.clone() }
    }
}

impl<T: ShareObject> Default for SharedHandle<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T: ShareObject> std::fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHandle").field("some", &self.o.is_some()).finish()
    }
}
