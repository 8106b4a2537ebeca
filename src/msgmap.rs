//! Outstanding-request bookkeeping keyed by LDAP message ID.
//!
//! One `MsgMap` is shared between the operation handles and the connection
//! driver. Handles allocate message IDs when an operation is submitted, so a
//! request can be abandoned by ID even if it times out while still queued;
//! the driver registers the response handler only when the request is
//! actually written to the socket. Purging on connection loss therefore only
//! affects requests that were in flight, never queued ones.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};

use crate::exop::Exop;
use crate::result::{LdapResult, Result};
use crate::search::SearchItem;
use crate::RequestId;

/// Message IDs live in [1, 2^31-1] and wrap back to 1.
pub(crate) const MAX_MSGID: RequestId = i32::MAX;

/// Routing target for responses to a tracked request.
pub(crate) enum MsgHandler {
    /// An operation with a single terminal response. `expect` lists the
    /// result codes considered regular for the operation; anything else is
    /// additionally reported through the `ResultError` event.
    Single {
        expect: &'static [u32],
        tx: oneshot::Sender<Result<(LdapResult, Exop)>>,
    },
    /// A Search; intermediate and terminal responses stream into the sink.
    Search { tx: mpsc::UnboundedSender<SearchItem> },
    /// An Unbind request. No response arrives; the handler is resolved with
    /// a synthetic success when the connection closes.
    Unbind { tx: oneshot::Sender<Result<()>> },
}

pub(crate) struct MsgMap {
    next_id: RequestId,
    /// IDs handed out but not yet completed, whether queued or in flight.
    reserved: HashSet<RequestId>,
    /// In-flight requests on the current connection.
    pending: HashMap<RequestId, MsgHandler>,
    /// IDs whose late responses must be dropped on the floor.
    abandoned: HashSet<RequestId>,
}

impl MsgMap {
    pub fn new() -> MsgMap {
        MsgMap {
            next_id: 1,
            reserved: HashSet::new(),
            pending: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    /// Reserve the next free message ID, skipping any ID that is still live
    /// or abandoned. Wraps from 2^31-1 back to 1.
    pub fn alloc_id(&mut self) -> RequestId {
        loop {
            let id = self.next_id;
            self.next_id = if id == MAX_MSGID { 1 } else { id + 1 };
            if !self.reserved.contains(&id) && !self.abandoned.contains(&id) {
                self.reserved.insert(id);
                return id;
            }
        }
    }

    /// Register the response handler for an ID at socket-send time.
    pub fn track(&mut self, id: RequestId, handler: MsgHandler) {
        self.pending.insert(id, handler);
    }

    /// Look up the handler for an ID without removing it; used for the
    /// intermediate responses of a Search.
    pub fn fetch(&self, id: RequestId) -> Option<&MsgHandler> {
        self.pending.get(&id)
    }

    /// Complete an ID: drop the handler and release the reservation.
    pub fn remove(&mut self, id: RequestId) -> Option<MsgHandler> {
        self.reserved.remove(&id);
        self.pending.remove(&id)
    }

    /// Release a reservation for an ID that was never (or no longer) tracked.
    pub fn release(&mut self, id: RequestId) {
        self.reserved.remove(&id);
    }

    /// Mark an ID abandoned: its handler is dropped, and any response the
    /// server still produces for it will be discarded.
    pub fn abandon(&mut self, id: RequestId) -> Option<MsgHandler> {
        self.reserved.remove(&id);
        self.abandoned.insert(id);
        self.pending.remove(&id)
    }

    /// If `id` is abandoned, consume the marker and report `true`, telling
    /// the caller to discard the response. The marker is kept while further
    /// responses may arrive (a search), and dropped on the terminal one.
    pub fn discard(&mut self, id: RequestId, terminal: bool) -> bool {
        if terminal {
            self.abandoned.remove(&id)
        } else {
            self.abandoned.contains(&id)
        }
    }

    /// Drain every in-flight handler through `f`, leaving the map empty.
    /// Ends the connection epoch: abandoned-ID markers are dropped too,
    /// since the IDs cannot collide with anything on a future connection.
    pub fn purge<F>(&mut self, mut f: F)
    where
        F: FnMut(RequestId, MsgHandler),
    {
        for (id, handler) in self.pending.drain() {
            self.reserved.remove(&id);
            f(id, handler);
        }
        self.abandoned.clear();
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn single() -> (MsgHandler, oneshot::Receiver<Result<(LdapResult, Exop)>>) {
        let (tx, rx) = oneshot::channel();
        (MsgHandler::Single { expect: &[0], tx }, rx)
    }

    #[test]
    fn alloc_is_monotonic_and_unique() {
        let mut mm = MsgMap::new();
        let a = mm.alloc_id();
        let b = mm.alloc_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn fetch_returns_tracked_handler_until_removed() {
        let mut mm = MsgMap::new();
        let id = mm.alloc_id();
        let (h, _rx) = single();
        mm.track(id, h);
        assert!(mm.fetch(id).is_some());
        assert_eq!(mm.pending_count(), 1);
        assert!(mm.remove(id).is_some());
        assert!(mm.fetch(id).is_none());
        assert_eq!(mm.pending_count(), 0);
    }

    #[test]
    fn abandon_discards_late_responses() {
        let mut mm = MsgMap::new();
        let id = mm.alloc_id();
        let (h, _rx) = single();
        mm.track(id, h);
        assert!(mm.abandon(id).is_some());
        assert!(mm.fetch(id).is_none());
        assert!(mm.discard(id, false));
        assert!(mm.discard(id, true));
        assert!(!mm.discard(id, false));
    }

    #[test]
    fn wrap_skips_live_ids() {
        let mut mm = MsgMap::new();
        mm.next_id = MAX_MSGID;
        let last = mm.alloc_id();
        assert_eq!(last, MAX_MSGID);
        // 1 is still reserved by an in-flight request; the wrap must skip it
        mm.reserved.insert(1);
        mm.abandoned.insert(2);
        assert_eq!(mm.alloc_id(), 3);
    }

    #[test]
    fn purge_is_idempotent_and_empties_the_map() {
        let mut mm = MsgMap::new();
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let id = mm.alloc_id();
            let (h, rx) = single();
            mm.track(id, h);
            rxs.push(rx);
        }
        let mut purged = 0;
        mm.purge(|_, _| purged += 1);
        assert_eq!(purged, 3);
        assert_eq!(mm.pending_count(), 0);
        mm.purge(|_, _| purged += 1);
        assert_eq!(purged, 3);
        // all reservations were released together with the handlers
        assert_eq!(mm.alloc_id(), 4);
    }
}
