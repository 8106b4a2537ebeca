//! FIFO buffer for requests issued while the connection is down.
//!
//! The queue accepts requests between connection epochs and drains them, in
//! submission order, when the connection becomes ready. It can be frozen,
//! after which every enqueue fails immediately instead of letting callers
//! wait on a connection that will never come.

use std::collections::VecDeque;

use crate::ldap::RequestSpec;
use crate::result::LdapError;

pub(crate) struct RequestQueue {
    q: VecDeque<RequestSpec>,
    /// Maximum number of buffered requests; 0 means unbounded.
    size: usize,
    frozen: bool,
}

impl RequestQueue {
    pub fn new(size: usize, frozen: bool) -> RequestQueue {
        RequestQueue {
            q: VecDeque::new(),
            size,
            frozen,
        }
    }

    /// Buffer a request, or hand it back with the reason it can't be taken.
    pub fn enqueue(&mut self, spec: RequestSpec) -> Result<(), (RequestSpec, LdapError)> {
        if self.frozen {
            return Err((spec, LdapError::QueueUnavailable));
        }
        if self.size > 0 && self.q.len() >= self.size {
            return Err((spec, LdapError::QueueFull));
        }
        self.q.push_back(spec);
        Ok(())
    }

    /// Take all buffered requests, oldest first.
    pub fn drain(&mut self) -> VecDeque<RequestSpec> {
        std::mem::take(&mut self.q)
    }

    /// Put back requests that could not be flushed, ahead of anything
    /// enqueued in the meantime.
    pub fn requeue_front(&mut self, specs: VecDeque<RequestSpec>) {
        for spec in specs.into_iter().rev() {
            self.q.push_front(spec);
        }
    }

    /// Remove the buffered request with the given message ID, if present.
    pub fn remove(&mut self, id: crate::RequestId) -> Option<RequestSpec> {
        let pos = self.q.iter().position(|spec| spec.id == id)?;
        self.q.remove(pos)
    }

    /// Drain the queue into an error-producing sink.
    pub fn purge<F>(&mut self, mut f: F)
    where
        F: FnMut(RequestSpec),
    {
        for spec in self.q.drain(..) {
            f(spec);
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.frozen = false;
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msgmap::MsgHandler;
    use crate::RequestId;

    use lber::common::TagClass;
    use lber::structures::{Null, Tag};
    use tokio::sync::oneshot;

    fn spec(id: RequestId) -> RequestSpec {
        let (tx, rx) = oneshot::channel();
        std::mem::forget(rx);
        RequestSpec {
            id,
            req: Tag::Null(Null {
                id: 2,
                class: TagClass::Application,
                inner: (),
            }),
            controls: None,
            handler: MsgHandler::Single { expect: &[0], tx },
        }
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut q = RequestQueue::new(0, false);
        for id in 1..=3 {
            q.enqueue(spec(id)).ok().expect("enqueue");
        }
        let ids: Vec<RequestId> = q.drain().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn frozen_queue_rejects_immediately() {
        let mut q = RequestQueue::new(0, true);
        match q.enqueue(spec(1)) {
            Err((_, LdapError::QueueUnavailable)) => (),
            _ => panic!("expected QueueUnavailable"),
        }
        q.thaw();
        assert!(q.enqueue(spec(1)).is_ok());
    }

    #[test]
    fn size_bound_is_enforced() {
        let mut q = RequestQueue::new(2, false);
        assert!(q.enqueue(spec(1)).is_ok());
        assert!(q.enqueue(spec(2)).is_ok());
        match q.enqueue(spec(3)) {
            Err((_, LdapError::QueueFull)) => (),
            _ => panic!("expected QueueFull"),
        }
    }

    #[test]
    fn remove_plucks_by_id() {
        let mut q = RequestQueue::new(0, false);
        for id in 1..=3 {
            q.enqueue(spec(id)).ok().expect("enqueue");
        }
        assert_eq!(q.remove(2).map(|s| s.id), Some(2));
        assert!(q.remove(2).is_none());
        let ids: Vec<RequestId> = q.drain().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn requeue_front_preserves_order() {
        let mut q = RequestQueue::new(0, false);
        q.enqueue(spec(3)).ok().expect("enqueue");
        let mut unsent = VecDeque::new();
        unsent.push_back(spec(1));
        unsent.push_back(spec(2));
        q.requeue_front(unsent);
        let ids: Vec<RequestId> = q.drain().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn purge_empties_into_the_sink() {
        let mut q = RequestQueue::new(0, false);
        for id in 1..=2 {
            q.enqueue(spec(id)).ok().expect("enqueue");
        }
        let mut seen = Vec::new();
        q.purge(|s| seen.push(s.id));
        assert_eq!(seen, vec![1, 2]);
        assert!(q.is_empty());
    }
}
