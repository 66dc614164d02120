//! Intrusive lists of thread descriptors.
//!
//! The kernel threads its lists directly through the `prev`/`next` links
//! embedded in each [`Tcb`], so queue operations never allocate. Two
//! flavours exist: [`ThreadList`], a plain FIFO used for the ready queues
//! and the pool, and [`TimeoutList`], an ordered list of sleepers in which
//! each node stores its expiry as a delta relative to its predecessor, so
//! the millisecond tick only ever decrements the head.
//!
//! Lists are single-ownership: a descriptor is on at most one list at a
//! time, recorded in its [`QueueTag`]. Inserting a node that is already
//! linked is a contract violation.

use core::ptr::NonNull;

use crate::thread::{QueueTag, Tcb};

/// A FIFO doubly-linked list of thread descriptors.
pub(crate) struct ThreadList {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
    /// Tag stamped onto every member's `queue` field.
    tag: QueueTag,
}

impl ThreadList {
    pub(crate) const fn new(tag: QueueTag) -> ThreadList {
        ThreadList {
            head: None,
            tail: None,
            tag,
        }
    }

    pub(crate) fn head(&self) -> Option<NonNull<Tcb>> {
        self.head
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of descriptors on the list.
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            n += 1;
            cur = unsafe { node.as_ref().next };
        }
        n
    }

    /// Adds `node` to the back of the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a live descriptor that is not on any list.
    pub(crate) unsafe fn append(&mut self, mut node: NonNull<Tcb>) {
        let tcb = unsafe { node.as_mut() };
        debug_assert!(tcb.queue == QueueTag::None, "descriptor already listed");

        tcb.prev = self.tail;
        tcb.next = None;
        tcb.queue = self.tag;

        match self.tail {
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    /// Adds `node` to the front of the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a live descriptor that is not on any list.
    pub(crate) unsafe fn prepend(&mut self, mut node: NonNull<Tcb>) {
        let tcb = unsafe { node.as_mut() };
        debug_assert!(tcb.queue == QueueTag::None, "descriptor already listed");

        tcb.prev = None;
        tcb.next = self.head;
        tcb.queue = self.tag;

        match self.head {
            Some(mut head) => unsafe { head.as_mut().prev = Some(node) },
            None => self.tail = Some(node),
        }
        self.head = Some(node);
    }

    /// Inserts `node` immediately before `before`, or at the back when
    /// `before` is `None`.
    ///
    /// # Safety
    ///
    /// `node` must point to a live unlisted descriptor; `before`, when
    /// present, must be a member of this list.
    pub(crate) unsafe fn insert_before(
        &mut self,
        mut node: NonNull<Tcb>,
        before: Option<NonNull<Tcb>>,
    ) {
        let Some(mut succ) = before else {
            unsafe { self.append(node) };
            return;
        };

        let tcb = unsafe { node.as_mut() };
        debug_assert!(tcb.queue == QueueTag::None, "descriptor already listed");

        let pred = unsafe { succ.as_ref().prev };
        tcb.prev = pred;
        tcb.next = Some(succ);
        tcb.queue = self.tag;

        unsafe { succ.as_mut().prev = Some(node) };
        match pred {
            Some(mut p) => unsafe { p.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
    }

    /// Unlinks `node` from the list.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this list.
    pub(crate) unsafe fn remove(&mut self, mut node: NonNull<Tcb>) {
        let tcb = unsafe { node.as_mut() };
        debug_assert!(tcb.queue == self.tag, "descriptor not on this list");

        match tcb.prev {
            Some(mut p) => unsafe { p.as_mut().next = tcb.next },
            None => self.head = tcb.next,
        }
        match tcb.next {
            Some(mut n) => unsafe { n.as_mut().prev = tcb.prev },
            None => self.tail = tcb.prev,
        }

        tcb.prev = None;
        tcb.next = None;
        tcb.queue = QueueTag::None;
    }

    /// Iterates the list front to back.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<Tcb>> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let node = cur?;
            cur = unsafe { node.as_ref().next };
            Some(node)
        })
    }
}

/// An ordered list of sleeping threads keyed by time-to-expire.
///
/// Each member's `timeout_offset` is relative to its predecessor, so the
/// head's offset alone equals the time to the next expiration.
pub(crate) struct TimeoutList {
    list: ThreadList,
}

impl TimeoutList {
    pub(crate) const fn new() -> TimeoutList {
        TimeoutList {
            list: ThreadList::new(QueueTag::Sleeping),
        }
    }

    pub(crate) fn head(&self) -> Option<NonNull<Tcb>> {
        self.list.head()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    /// Iterates the sleepers, soonest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<Tcb>> + '_ {
        self.list.iter()
    }

    /// Inserts `node` so that it expires `offset` milliseconds from now.
    ///
    /// Walks the list accumulating deltas to find the slot, stores the
    /// residual delta on `node` and shrinks the successor's delta so every
    /// absolute expiry downstream is preserved. Equal expiries order FIFO.
    ///
    /// # Safety
    ///
    /// `node` must point to a live descriptor that is not on any list.
    pub(crate) unsafe fn insert_by_offset(&mut self, mut node: NonNull<Tcb>, offset: u32) {
        let mut running = 0u32;
        let mut slot = self.list.head();

        while let Some(cur) = slot {
            let cur_offset = unsafe { cur.as_ref().timeout_offset };
            if running + cur_offset > offset {
                break;
            }
            running += cur_offset;
            slot = unsafe { cur.as_ref().next };
        }

        let delta = offset - running;
        unsafe { node.as_mut().timeout_offset = delta };
        unsafe { self.list.insert_before(node, slot) };

        if let Some(mut succ) = slot {
            unsafe { succ.as_mut().timeout_offset -= delta };
        }
    }

    /// Unlinks `node`, folding its delta into the successor so downstream
    /// expiries are unchanged.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this list.
    pub(crate) unsafe fn remove(&mut self, node: NonNull<Tcb>) {
        let delta = unsafe { node.as_ref().timeout_offset };
        if let Some(mut succ) = unsafe { node.as_ref().next } {
            unsafe { succ.as_mut().timeout_offset += delta };
        }
        unsafe { self.list.remove(node) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadFlags;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn tcb() -> NonNull<Tcb> {
        let boxed = Box::new(Tcb::new(core::ptr::null_mut(), 0, ThreadFlags::NONE));
        NonNull::from(Box::leak(boxed))
    }

    fn ids(list: &ThreadList) -> Vec<u16> {
        list.iter().map(|n| unsafe { n.as_ref().id }).collect()
    }

    fn make(n: usize) -> Vec<NonNull<Tcb>> {
        (0..n)
            .map(|i| {
                let mut t = tcb();
                unsafe { t.as_mut().id = i as u16 };
                t
            })
            .collect()
    }

    #[test]
    fn append_preserves_fifo_order() {
        let nodes = make(3);
        let mut list = ThreadList::new(QueueTag::Pool);

        for &n in &nodes {
            unsafe { list.append(n) };
        }

        assert_eq!(ids(&list), [0, 1, 2]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.head(), Some(nodes[0]));
    }

    #[test]
    fn prepend_puts_node_at_head() {
        let nodes = make(3);
        let mut list = ThreadList::new(QueueTag::Pool);

        unsafe {
            list.append(nodes[0]);
            list.append(nodes[1]);
            list.prepend(nodes[2]);
        }

        assert_eq!(ids(&list), [2, 0, 1]);
    }

    #[test]
    fn remove_handles_head_middle_and_tail() {
        let nodes = make(4);
        let mut list = ThreadList::new(QueueTag::Pool);
        for &n in &nodes {
            unsafe { list.append(n) };
        }

        unsafe { list.remove(nodes[1]) };
        assert_eq!(ids(&list), [0, 2, 3]);

        unsafe { list.remove(nodes[0]) };
        assert_eq!(ids(&list), [2, 3]);

        unsafe { list.remove(nodes[3]) };
        assert_eq!(ids(&list), [2]);

        unsafe { list.remove(nodes[2]) };
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);

        // every removed node is fully unlinked
        for &n in &nodes {
            let t = unsafe { n.as_ref() };
            assert!(t.prev.is_none());
            assert!(t.next.is_none());
            assert_eq!(t.queue, QueueTag::None);
        }
    }

    #[test]
    fn membership_is_tagged() {
        let nodes = make(1);
        let mut list = ThreadList::new(QueueTag::Ready(1));

        unsafe { list.append(nodes[0]) };
        assert_eq!(unsafe { nodes[0].as_ref().queue }, QueueTag::Ready(1));

        unsafe { list.remove(nodes[0]) };
        assert_eq!(unsafe { nodes[0].as_ref().queue }, QueueTag::None);
    }

    fn offsets(list: &TimeoutList) -> Vec<(u16, u32)> {
        list.list
            .iter()
            .map(|n| unsafe { (n.as_ref().id, n.as_ref().timeout_offset) })
            .collect()
    }

    #[test]
    fn offset_insert_stores_deltas() {
        let nodes = make(3);
        let mut list = TimeoutList::new();

        // expiries: 10, 25, 4 -> ordered 4, 10, 25 with deltas 4, 6, 15
        unsafe {
            list.insert_by_offset(nodes[0], 10);
            list.insert_by_offset(nodes[1], 25);
            list.insert_by_offset(nodes[2], 4);
        }

        assert_eq!(offsets(&list), [(2, 4), (0, 6), (1, 15)]);
    }

    #[test]
    fn offset_insert_orders_equal_expiries_fifo() {
        let nodes = make(2);
        let mut list = TimeoutList::new();

        unsafe {
            list.insert_by_offset(nodes[0], 7);
            list.insert_by_offset(nodes[1], 7);
        }

        assert_eq!(offsets(&list), [(0, 7), (1, 0)]);
    }

    #[test]
    fn offset_remove_preserves_downstream_expiries() {
        let nodes = make(3);
        let mut list = TimeoutList::new();

        unsafe {
            list.insert_by_offset(nodes[0], 5);
            list.insert_by_offset(nodes[1], 12);
            list.insert_by_offset(nodes[2], 30);
        }
        assert_eq!(offsets(&list), [(0, 5), (1, 7), (2, 18)]);

        // removing the middle sleeper folds its delta into the successor,
        // so node 2 still expires at 30 absolute
        unsafe { list.remove(nodes[1]) };
        assert_eq!(offsets(&list), [(0, 5), (2, 25)]);

        unsafe { list.remove(nodes[0]) };
        assert_eq!(offsets(&list), [(2, 30)]);
    }

    #[test]
    fn offset_insert_at_head_shrinks_old_head() {
        let nodes = make(2);
        let mut list = TimeoutList::new();

        unsafe {
            list.insert_by_offset(nodes[0], 20);
            list.insert_by_offset(nodes[1], 3);
        }

        assert_eq!(offsets(&list), [(1, 3), (0, 17)]);
        assert_eq!(list.head(), Some(nodes[1]));
    }
}
