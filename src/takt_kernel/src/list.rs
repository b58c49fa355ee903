//! Intrusive sorted thread lists.
//!
//! Every scheduling and blocking structure in the kernel is the same
//! doubly-linked list, kept sorted by effective priority (descending)
//! with ties broken by insertion order. The link lives inside the thread
//! control block, so blocking never allocates.
use core::fmt;
use core::ptr::NonNull;

use crate::{
    klock::{CpuLockCell, CriticalSection},
    task::{TaskCb, TaskRef, TaskSt},
};

/// The intrusive link embedded in each [`TaskCb`].
pub(crate) struct ListLink {
    prev: CpuLockCell<Option<TaskRef>>,
    next: CpuLockCell<Option<TaskRef>>,
}

impl ListLink {
    pub(crate) const fn new() -> Self {
        Self {
            prev: CpuLockCell::new(None),
            next: CpuLockCell::new(None),
        }
    }
}

/// A reference to a [`ThreadList`], compared by identity.
///
/// Lists owned by synchronization primitives may live on a thread's
/// stack; the pointee is valid for as long as any thread is a member,
/// because a member thread keeps a borrow of the owning primitive alive
/// for the whole blocking call.
#[derive(Clone, Copy)]
pub(crate) struct ListRef(NonNull<ThreadList>);

// Safety: see the validity argument above; all accesses happen under the
// kernel critical section.
unsafe impl Send for ListRef {}
unsafe impl Sync for ListRef {}

impl ListRef {
    /// Dereference the list.
    ///
    /// # Safety
    ///
    /// The list must still be alive, which holds whenever this reference
    /// was read from a blocked thread's `list` field.
    #[inline]
    pub(crate) unsafe fn get(&self) -> &ThreadList {
        // Safety: upheld by the caller.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ListRef {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ListRef {}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ListRef").field(&self.0).finish()
    }
}

/// A doubly-linked list of thread control blocks sorted by effective
/// priority, descending, FIFO within a priority. Carries the lifecycle
/// state it stamps onto every inserted thread.
pub(crate) struct ThreadList {
    head: CpuLockCell<Option<TaskRef>>,
    tail: CpuLockCell<Option<TaskRef>>,
    state: TaskSt,
}

impl ThreadList {
    pub(crate) const fn new(state: TaskSt) -> Self {
        Self {
            head: CpuLockCell::new(None),
            tail: CpuLockCell::new(None),
            state,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self, cs: CriticalSection<'_>) -> bool {
        self.head.get(cs).is_none()
    }

    /// The highest-effective-priority, earliest-inserted member.
    #[inline]
    pub(crate) fn front(&self, cs: CriticalSection<'_>) -> Option<TaskRef> {
        self.head.get(cs)
    }

    /// Insert `task` at the tail of its effective-priority group: after
    /// every member of equal or higher effective priority, before every
    /// member of lower. Stamps the list's state onto `task`.
    pub(crate) fn insert(&self, cs: CriticalSection<'_>, task: TaskRef) {
        let key = task.effective_priority(cs) as u16;
        self.insert_with_key(cs, task, key);
    }

    /// Insert using an explicit sort key. [`reposition`] passes
    /// `effective priority + 1` to move a thread to the head of its
    /// group when lowering its priority.
    ///
    /// [`reposition`]: crate::task::reposition
    pub(crate) fn insert_with_key(&self, cs: CriticalSection<'_>, task: TaskRef, key: u16) {
        debug_assert!(task.list.get(cs).is_none());

        // Find the first member with a strictly lower key.
        let mut prev: Option<TaskRef> = None;
        let mut cursor = self.head.get(cs);
        while let Some(t) = cursor {
            if (t.effective_priority(cs) as u16) < key {
                break;
            }
            prev = Some(t);
            cursor = t.link.next.get(cs);
        }

        task.link.prev.set(cs, prev);
        task.link.next.set(cs, cursor);
        match prev {
            Some(p) => p.link.next.set(cs, Some(task)),
            None => self.head.set(cs, Some(task)),
        }
        match cursor {
            Some(n) => n.link.prev.set(cs, Some(task)),
            None => self.tail.set(cs, Some(task)),
        }

        task.list.set(cs, Some(ListRef(NonNull::from(self))));
        task.get().state.set(cs, self.state);
    }

    /// Unlink `task` in O(1). Clears its list membership.
    pub(crate) fn remove(&self, cs: CriticalSection<'_>, task: TaskRef) {
        debug_assert_eq!(task.list.get(cs), Some(ListRef(NonNull::from(self))));

        let prev = task.link.prev.get(cs);
        let next = task.link.next.get(cs);
        match prev {
            Some(p) => p.link.next.set(cs, next),
            None => self.head.set(cs, next),
        }
        match next {
            Some(n) => n.link.prev.set(cs, prev),
            None => self.tail.set(cs, prev),
        }

        task.link.prev.set(cs, None);
        task.link.next.set(cs, None);
        task.list.set(cs, None);
    }

    /// Iterate the members front to back.
    #[cfg(test)]
    pub(crate) fn iter<'a>(
        &'a self,
        cs: CriticalSection<'a>,
    ) -> impl Iterator<Item = TaskRef> + 'a {
        let mut cursor = self.head.get(cs);
        core::iter::from_fn(move || {
            let t = cursor?;
            cursor = t.link.next.get(cs);
            Some(t)
        })
    }
}

impl fmt::Debug for ThreadList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadList")
            .field("state", &self.state)
            .finish()
    }
}
