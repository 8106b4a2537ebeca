//! The operation handle and request dispatch.
//!
//! `Ldap` is the public face of the client: it validates and encodes
//! operations, hands them to the connection driver, and maps responses back
//! to the caller. A handle is cheap to clone; all clones dispatch into the
//! same connection.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{Boolean, Enumerated, Integer, OctetString, Sequence, Set, Tag};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;

use crate::conn::ClientEvent;
use crate::controls::{RawControl, PAGED_RESULTS_OID};
use crate::exop::{construct_exop, Exop};
use crate::filter;
use crate::msgmap::{MsgHandler, MsgMap};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, Result, SearchResult,
};
use crate::search::{
    parse_refs, Paged, PagedState, Scope, SearchItem, SearchOptions, SearchParts, SearchStream,
};
use crate::util::split_dn_once;
use crate::RequestId;

/// Result codes considered regular for operations expecting plain success.
const EXPECT_SUCCESS: &[u32] = &[0];
/// Compare terminates with compareFalse or compareTrue.
const EXPECT_COMPARE: &[u32] = &[5, 6];

/// Operations sent from handles to the connection driver.
pub(crate) enum ConnOp {
    /// Dispatch a request: send it if connected, queue it otherwise.
    Request(RequestSpec),
    /// Abandon the request with the given message ID, whether queued or in
    /// flight. The optional channel is resolved once the abandon took
    /// local effect and any AbandonRequest write completed.
    Abandon {
        id: RequestId,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Write an UnbindRequest and close the write side; the channel is
    /// resolved when the connection is fully down.
    Unbind { tx: oneshot::Sender<Result<()>> },
    /// Tear the client down: fail everything, stop reconnecting.
    Destroy,
}

/// A fully built request together with its response routing.
pub(crate) struct RequestSpec {
    pub id: RequestId,
    pub req: Tag,
    pub controls: Option<Vec<StructureTag>>,
    pub handler: MsgHandler,
}

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the
    /// set, or delete it if no values are given.
    Replace(S, HashSet<S>),
}

/// Asynchronous handle for LDAP operations.
///
/// Obtained together with the connection by one of the
/// [`LdapConnAsync`](struct.LdapConnAsync.html) constructors. All operations
/// are issued through a handle; it can be cloned freely, and every clone
/// multiplexes its requests over the same connection.
///
/// A series of request controls can be attached to the next operation with
/// [`with_controls()`](#method.with_controls), and a response wait limit
/// imposed on it with [`with_timeout()`](#method.with_timeout). Both
/// modifiers apply to a single subsequent operation.
#[derive(Clone)]
pub struct Ldap {
    pub(crate) tx: mpsc::UnboundedSender<ConnOp>,
    pub(crate) msgmap: Arc<Mutex<MsgMap>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) op_timeout: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) controls: Option<Vec<RawControl>>,
    pub(crate) search_opts: Option<SearchOptions>,
    pub(crate) last_id: RequestId,
}

fn conn_gone() -> LdapError {
    LdapError::Connection("connection driver is gone".into())
}

impl Ldap {
    /// Subscribe to the stream of connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The message ID of the most recently dispatched operation.
    pub fn last_id(&self) -> RequestId {
        self.last_id
    }

    /// Pass the provided request controls to the next operation.
    pub fn with_controls<I, C>(&mut self, ctrls: I) -> &mut Self
    where
        I: IntoIterator<Item = C>,
        C: Into<RawControl>,
    {
        self.controls = Some(ctrls.into_iter().map(Into::into).collect());
        self
    }

    /// Perform the next operation with the given response timeout. On
    /// expiry the operation fails with a timeout error and an
    /// AbandonRequest is sent for its message ID. Overrides the
    /// connection-wide default for one operation.
    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use the provided `SearchOptions` with the next Search operation.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    fn alloc_id(&mut self) -> RequestId {
        let id = self.msgmap.lock().expect("msgmap mutex").alloc_id();
        self.last_id = id;
        id
    }

    fn take_controls(&mut self) -> Option<Vec<StructureTag>> {
        self.controls
            .take()
            .map(|ctrls| ctrls.into_iter().map(StructureTag::from).collect())
    }

    pub(crate) async fn op_call(
        &mut self,
        req: Tag,
        expect: &'static [u32],
    ) -> Result<(LdapResult, Exop)> {
        let controls = self.take_controls();
        let id = self.alloc_id();
        let (tx, rx) = oneshot::channel();
        let spec = RequestSpec {
            id,
            req,
            controls,
            handler: MsgHandler::Single { expect, tx },
        };
        self.tx
            .send(ConnOp::Request(spec))
            .map_err(|_| conn_gone())?;
        let timeout = self.timeout.take().or(self.op_timeout);
        let res = match timeout {
            Some(timeout) => match time::timeout(timeout, rx).await {
                Ok(res) => res,
                Err(_) => {
                    self.abandon_nowait(id);
                    let _ = self.events.send(ClientEvent::Timeout);
                    return Err(LdapError::Timeout);
                }
            },
            None => rx.await,
        };
        match res {
            Ok(res) => res,
            Err(_) => Err(LdapError::Abandoned),
        }
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password
    /// (`bind_pw`).
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        let req = bind_request(bind_dn, bind_pw);
        Ok(self.op_call(req, EXPECT_SUCCESS).await?.0)
    }

    /// Add an entry named by `dn`, with the list of attributes and their
    /// values given in `attrs`. None of the value sets of an attribute may
    /// be empty.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        let mut any_empty = false;
        let req = Tag::Sequence(Sequence {
            id: 8,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: attrs
                        .into_iter()
                        .map(|(name, vals)| {
                            if vals.is_empty() {
                                any_empty = true;
                            }
                            Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::OctetString(OctetString {
                                        inner: Vec::from(name.as_ref()),
                                        ..Default::default()
                                    }),
                                    Tag::Set(Set {
                                        inner: vals
                                            .into_iter()
                                            .map(|v| {
                                                Tag::OctetString(OctetString {
                                                    inner: Vec::from(v.as_ref()),
                                                    ..Default::default()
                                                })
                                            })
                                            .collect(),
                                        ..Default::default()
                                    }),
                                ],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        if any_empty {
            return Err(LdapError::AddNoValues);
        }
        Ok(self.op_call(req, EXPECT_SUCCESS).await?.0)
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by
    /// `dn` with the value `val`. The result is 6 (`compareTrue`) if any of
    /// the values is identical to the provided one, 5 (`compareFalse`)
    /// otherwise; [`CompareResult::equal()`](result/struct.CompareResult.html#method.equal)
    /// turns those into a boolean.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        let req = Tag::Sequence(Sequence {
            id: 14,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: Vec::from(attr.as_bytes()),
                            ..Default::default()
                        }),
                        Tag::OctetString(OctetString {
                            inner: Vec::from(val.as_ref()),
                            ..Default::default()
                        }),
                    ],
                    ..Default::default()
                }),
            ],
        });
        Ok(CompareResult(self.op_call(req, EXPECT_COMPARE).await?.0))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let req = Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Application,
            inner: Vec::from(dn.as_bytes()),
        });
        Ok(self.op_call(req, EXPECT_SUCCESS).await?.0)
    }

    /// Modify an entry named by `dn` by sequentially applying the
    /// modifications given by `mods`. See the [`Mod`](enum.Mod.html)
    /// documentation for the description of possible values.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        let mut any_add_empty = false;
        let req = Tag::Sequence(Sequence {
            id: 6,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: mods
                        .into_iter()
                        .map(|m| {
                            let mut is_add = false;
                            let (op, attr, set) = match m {
                                Mod::Add(attr, set) => {
                                    is_add = true;
                                    (0, attr, set)
                                }
                                Mod::Delete(attr, set) => (1, attr, set),
                                Mod::Replace(attr, set) => (2, attr, set),
                            };
                            if set.is_empty() && is_add {
                                any_add_empty = true;
                            }
                            Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::Enumerated(Enumerated {
                                        inner: op,
                                        ..Default::default()
                                    }),
                                    Tag::Sequence(Sequence {
                                        inner: vec![
                                            Tag::OctetString(OctetString {
                                                inner: Vec::from(attr.as_ref()),
                                                ..Default::default()
                                            }),
                                            Tag::Set(Set {
                                                inner: set
                                                    .into_iter()
                                                    .map(|val| {
                                                        Tag::OctetString(OctetString {
                                                            inner: Vec::from(val.as_ref()),
                                                            ..Default::default()
                                                        })
                                                    })
                                                    .collect(),
                                                ..Default::default()
                                            }),
                                        ],
                                        ..Default::default()
                                    }),
                                ],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        if any_add_empty {
            return Err(LdapError::AddNoValues);
        }
        Ok(self.op_call(req, EXPECT_SUCCESS).await?.0)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by
    /// `rdn`. If `delete_old` is `true`, delete the previous value of the
    /// naming attribute from the entry. If the entry is to be moved
    /// elsewhere in the DIT, `new_sup` gives the new superior entry where
    /// the moved entry will be anchored.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let mut params = vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(rdn.as_bytes()),
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: delete_old,
                ..Default::default()
            }),
        ];
        if let Some(new_sup) = new_sup {
            params.push(Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(new_sup.as_bytes()),
            }));
        }
        let req = Tag::Sequence(Sequence {
            id: 12,
            class: TagClass::Application,
            inner: params,
        });
        Ok(self.op_call(req, EXPECT_SUCCESS).await?.0)
    }

    /// Rename an entry to a new DN. When `new_dn` has more than one RDN, the
    /// leading RDN becomes the entry's new name and the remainder its new
    /// superior. The old naming attribute value is always deleted.
    pub async fn rename(&mut self, dn: &str, new_dn: &str) -> Result<LdapResult> {
        let (rdn, new_sup) = split_dn_once(new_dn);
        self.modifydn(dn, rdn, true, new_sup).await
    }

    /// Perform an Extended operation given by `exop`. Extended operations
    /// are defined in the [`exop`](exop/index.html) module.
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(exop.into()),
        });
        let (result, exop) = self.op_call(req, EXPECT_SUCCESS).await?;
        Ok(ExopResult(exop, result))
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and
    /// the list of attributes to be returned (`attrs`). If `attrs` is empty,
    /// or if it contains a special name `*` (asterisk), return all (user)
    /// attributes.
    ///
    /// The returned structure wraps the vector of result entries and the
    /// overall result of the operation. This method should be used if it's
    /// known that the result set won't be large; for other situations, one
    /// can use [`streaming_search()`](#method.streaming_search). References
    /// received during the search are folded into the `refs` component of
    /// the overall result.
    pub async fn search<S: AsRef<str>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<S>,
    ) -> Result<SearchResult> {
        let mut stream = self.streaming_search(base, scope, filter, attrs).await?;
        let mut entries = Vec::new();
        let mut refs = Vec::new();
        loop {
            match stream.next().await? {
                None => {
                    if stream.at_page_boundary() {
                        stream.next_page()?;
                        continue;
                    }
                    break;
                }
                Some(re) if re.is_ref() => refs.extend(parse_refs(re.0)),
                Some(re) if re.is_intermediate() => continue,
                Some(re) => entries.push(re),
            }
        }
        let mut res = stream.finish();
        res.refs.extend(refs);
        Ok(SearchResult(entries, res))
    }

    /// Perform a Search, but unlike [`search()`](#method.search) (q.v., also
    /// for the parameters), which returns all results at once, return a
    /// handle used for retrieving entries one by one. See
    /// [`SearchStream`](struct.SearchStream.html) for the protocol which
    /// must be adhered to in this case.
    ///
    /// Paging engages when the active `SearchOptions` carry a
    /// [`Paged`](struct.Paged.html) setting, or when a Paged Results control
    /// is supplied through `with_controls()`; the driver then chains the
    /// per-page requests by itself.
    pub async fn streaming_search<S: AsRef<str>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<S>,
    ) -> Result<SearchStream> {
        let opts = self.search_opts.take().unwrap_or_default();
        let filter = filter::parse(if filter.is_empty() {
            "(objectClass=*)"
        } else {
            filter
        })?;
        let mut controls = self.controls.take();
        let mut paged = opts.paged;
        if let Some(ctrls) = controls.as_mut() {
            let mut i = 0;
            while i < ctrls.len() {
                if ctrls[i].ctype == PAGED_RESULTS_OID {
                    if paged.is_some() {
                        return Err(LdapError::Paging(
                            "both a Paged Results control and paged options given",
                        ));
                    }
                    let pr: crate::controls::PagedResults = ctrls[i].parse();
                    paged = Some(Paged::new(pr.size));
                    ctrls.remove(i);
                } else {
                    i += 1;
                }
            }
        }
        let paged = paged.map(|p| PagedState {
            size: derive_page_size(p.size, opts.sizelimit),
            cookie: Vec::new(),
            pause: p.pause,
        });
        let controls = controls
            .filter(|c| !c.is_empty())
            .map(|c| c.into_iter().map(StructureTag::from).collect());
        let parts = SearchParts {
            base: base.to_owned(),
            scope,
            deref: opts.deref,
            sizelimit: opts.sizelimit,
            timelimit: opts.timelimit,
            typesonly: opts.typesonly,
            filter,
            attrs: attrs.into_iter().map(|s| s.as_ref().to_owned()).collect(),
            controls,
        };
        let timeout = self.timeout.take().or(self.op_timeout);
        let mut stream = SearchStream::create(self.clone(), parts, paged, timeout);
        stream.start()?;
        Ok(stream)
    }

    pub(crate) fn submit_search(
        &mut self,
        req: Tag,
        controls: Option<Vec<StructureTag>>,
        tx: mpsc::UnboundedSender<SearchItem>,
    ) -> Result<RequestId> {
        let id = self.alloc_id();
        let spec = RequestSpec {
            id,
            req,
            controls,
            handler: MsgHandler::Search { tx },
        };
        self.tx
            .send(ConnOp::Request(spec))
            .map_err(|_| conn_gone())?;
        Ok(id)
    }

    /// Ask the server to abandon the operation with the given message ID,
    /// and drop its local tracking. No further results will be delivered
    /// for the ID, even if the server still produces some.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ConnOp::Abandon {
                id: msgid,
                ack: Some(tx),
            })
            .map_err(|_| conn_gone())?;
        rx.await.map_err(|_| conn_gone())?
    }

    pub(crate) fn abandon_nowait(&mut self, msgid: RequestId) {
        let _ = self.tx.send(ConnOp::Abandon {
            id: msgid,
            ack: None,
        });
    }

    /// Terminate the connection. If connected, an UnbindRequest is written
    /// and the write side of the socket is closed; the call resolves when
    /// the connection is fully down. If already disconnected, the call
    /// resolves immediately. An unbound connection is not reconnected
    /// automatically, but a later operation will re-trigger the connect
    /// cycle when reconnection is configured.
    pub async fn unbind(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ConnOp::Unbind { tx })
            .map_err(|_| conn_gone())?;
        rx.await.map_err(|_| conn_gone())?
    }

    /// Tear the client down. The request queue is frozen and purged, every
    /// in-flight operation fails with a connection error, a courtesy
    /// UnbindRequest is written if the socket is up, and reconnection is
    /// disabled. All subsequent operations fail. Calling `destroy` more
    /// than once has no additional effect.
    pub fn destroy(&mut self) {
        let _ = self.tx.send(ConnOp::Destroy);
    }
}

/// Simple Bind request PDU; also used by the implicit bind of the
/// connection setup phase.
pub(crate) fn bind_request(bind_dn: &str, bind_pw: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(bind_dn.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(bind_pw.as_bytes()),
            }),
        ],
    })
}

fn derive_page_size(size: i32, sizelimit: i32) -> i32 {
    if size > 0 {
        size
    } else if sizelimit > 1 {
        sizelimit - 1
    } else {
        100
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_derivation() {
        assert_eq!(derive_page_size(25, 0), 25);
        assert_eq!(derive_page_size(0, 500), 499);
        assert_eq!(derive_page_size(0, 1), 100);
        assert_eq!(derive_page_size(0, 0), 100);
        assert_eq!(derive_page_size(-1, 0), 100);
    }
}
