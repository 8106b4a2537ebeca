//! Search request plumbing and the result stream.
//!
//! A Search differs from every other operation: it produces an arbitrary
//! number of intermediate responses before the terminal one, and it may
//! span several wire requests when the Paged Results control is in play.
//! The connection driver feeds everything it receives for a search into an
//! unbounded channel; [`SearchStream`] is the consumer end of that channel,
//! dressed up as an async pull iterator. Since the channel buffers items
//! until the consumer polls, no event is lost between issuing the search
//! and the first read, and the server-side order is preserved.

use std::collections::HashMap;
use std::time::Duration;

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{Boolean, Enumerated, Integer, OctetString, Sequence, Tag};
use tokio::sync::mpsc;
use tokio::time;

use crate::controls::types::ControlType;
use crate::controls::{Control, PagedResults, RawControl};
use crate::ldap::Ldap;
use crate::result::{LdapError, LdapResult, Result};
use crate::RequestId;

/// Possible values for search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Base object; search only the object named in the base.
    Base = 0,
    /// Search the objects immediately below the base.
    OneLevel = 1,
    /// Search the object named in the base and the whole subtree below it.
    Subtree = 2,
}

/// Possible values for alias dereferencing during search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerefAliases {
    /// Never dereference.
    Never = 0,
    /// Dereference while retrieving objects according to search scope.
    InSearch = 1,
    /// Dereference while finding the base object.
    FindingBaseObj = 2,
    /// Always dereference.
    Always = 3,
}

/// Parameters for the paged portion of a search.
#[derive(Clone, Copy, Debug)]
pub struct Paged {
    /// Requested page size. Zero or negative means "derive": the size
    /// limit minus one if a size limit above one is set, otherwise 100.
    pub size: i32,
    /// Stop at each page boundary and wait for
    /// [`next_page()`](struct.SearchStream.html#method.next_page).
    pub pause: bool,
}

impl Paged {
    /// Paged search with the given page size.
    pub fn new(size: i32) -> Paged {
        Paged { size, pause: false }
    }

    /// Paged search with a derived page size.
    pub fn auto() -> Paged {
        Paged {
            size: 0,
            pause: false,
        }
    }

    /// Set per-page pausing.
    pub fn pause(mut self, pause: bool) -> Paged {
        self.pause = pause;
        self
    }
}

/// Additional parameters for the Search operation.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub(crate) deref: DerefAliases,
    pub(crate) typesonly: bool,
    pub(crate) timelimit: i32,
    pub(crate) sizelimit: i32,
    pub(crate) paged: Option<Paged>,
}

impl SearchOptions {
    /// Create an instance of the structure with default values.
    pub fn new() -> Self {
        SearchOptions {
            deref: DerefAliases::Never,
            typesonly: false,
            timelimit: 10,
            sizelimit: 0,
            paged: None,
        }
    }

    /// Set the method for dereferencing aliases.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Set the indicator of returning just attribute names (`true`) vs. names
    /// and values (`false`).
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the time limit, in seconds, for the whole search operation.
    ///
    /// This is a server-side limit of the elapsed time for the operation,
    /// _not_ a network timeout for retrieving result entries.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the size limit, in entries, for the whole search operation.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }

    /// Run the search with the Paged Results control.
    pub fn paged(mut self, paged: Paged) -> Self {
        self.paged = Some(paged);
        self
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions::new()
    }
}

/// Events flowing from the connection driver into a search stream.
pub(crate) enum SearchItem {
    /// A request for this search was flushed to the socket.
    Start(RequestId),
    /// An entry, reference, or intermediate message.
    Entry(ResultEntry),
    /// The terminal response of one wire request.
    Done(LdapResult),
    /// The connection failed underneath the search.
    Error(LdapError),
}

/// State of a [`SearchStream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Fetching entries from the server.
    Active,
    /// A paused paged search sits between pages.
    PageBoundary,
    /// The stream terminated regularly.
    Done,
    /// The stream terminated with an error.
    Error,
}

/// Everything needed to (re-)issue the wire request for a search.
pub(crate) struct SearchParts {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub sizelimit: i32,
    pub timelimit: i32,
    pub typesonly: bool,
    pub filter: Tag,
    pub attrs: Vec<String>,
    /// User request controls, with any Paged Results control scrubbed out.
    pub controls: Option<Vec<StructureTag>>,
}

/// Per-search paging state; the response cookie is copied back here
/// before each follow-up request.
pub(crate) struct PagedState {
    pub size: i32,
    pub cookie: Vec<u8>,
    pub pause: bool,
}

impl SearchParts {
    pub fn to_request(&self) -> Tag {
        Tag::Sequence(Sequence {
            id: 3,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(self.base.as_bytes()),
                    ..Default::default()
                }),
                Tag::Enumerated(Enumerated {
                    inner: self.scope as i64,
                    ..Default::default()
                }),
                Tag::Enumerated(Enumerated {
                    inner: self.deref as i64,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: self.sizelimit as i64,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: self.timelimit as i64,
                    ..Default::default()
                }),
                Tag::Boolean(Boolean {
                    inner: self.typesonly,
                    ..Default::default()
                }),
                self.filter.clone(),
                Tag::Sequence(Sequence {
                    inner: self
                        .attrs
                        .iter()
                        .map(|s| {
                            Tag::OctetString(OctetString {
                                inner: Vec::from(s.as_bytes()),
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        })
    }

    /// Request controls for the next wire request: the user's controls plus
    /// the Paged Results control carrying the current cookie, if paging.
    pub fn controls_for(&self, paged: Option<&PagedState>) -> Option<Vec<StructureTag>> {
        let mut ctrls = self.controls.clone().unwrap_or_default();
        if let Some(pg) = paged {
            ctrls.push(
                RawControl::from(PagedResults {
                    size: pg.size,
                    cookie: pg.cookie.clone(),
                })
                .into(),
            );
        }
        if ctrls.is_empty() {
            None
        } else {
            Some(ctrls)
        }
    }
}

fn abandoned_result() -> LdapResult {
    LdapResult {
        rc: 88,
        ..Default::default()
    }
}

/// Stream of search results.
///
/// The stream is driven to completion by repeatedly calling
/// [`next()`](#method.next) until it returns `Ok(None)` or an error, after
/// which the overall result of the operation is retrieved with
/// [`finish()`](#method.finish). For a paged search with
/// [`Paged::pause`](struct.Paged.html) set, `next()` also returns `Ok(None)`
/// at every page boundary; [`at_page_boundary()`](#method.at_page_boundary)
/// distinguishes that case, and [`next_page()`](#method.next_page) resumes
/// the search, while `finish()` stops it with the last page's result.
pub struct SearchStream {
    ldap: Ldap,
    rx: mpsc::UnboundedReceiver<SearchItem>,
    tx: mpsc::UnboundedSender<SearchItem>,
    parts: SearchParts,
    paged: Option<PagedState>,
    state: StreamState,
    msgid: RequestId,
    res: Option<LdapResult>,
    pages: u32,
    requests: u32,
    timeout: Option<Duration>,
}

impl SearchStream {
    pub(crate) fn create(
        ldap: Ldap,
        parts: SearchParts,
        paged: Option<PagedState>,
        timeout: Option<Duration>,
    ) -> SearchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        SearchStream {
            ldap,
            rx,
            tx,
            parts,
            paged,
            state: StreamState::Active,
            msgid: 0,
            res: None,
            pages: 0,
            requests: 0,
            timeout,
        }
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.issue_request()
    }

    fn issue_request(&mut self) -> Result<()> {
        let req = self.parts.to_request();
        let controls = self.parts.controls_for(self.paged.as_ref());
        let id = self.ldap.submit_search(req, controls, self.tx.clone())?;
        self.msgid = id;
        Ok(())
    }

    /// Fetch the next item of the result stream. `Ok(None)` signals either
    /// the end of the stream or, for a pausing paged search, a page
    /// boundary. References and intermediate messages are returned along
    /// with entries; use the [`ResultEntry`](struct.ResultEntry.html)
    /// discriminator methods to tell them apart.
    ///
    /// If a per-operation timeout is active, it limits the wait for every
    /// single item; on expiry the search is abandoned and the call returns
    /// a timeout error.
    pub async fn next(&mut self) -> Result<Option<ResultEntry>> {
        loop {
            if self.state != StreamState::Active {
                return Ok(None);
            }
            let item = match self.timeout {
                Some(timeout) => match time::timeout(timeout, self.rx.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.state = StreamState::Error;
                        self.ldap.abandon_nowait(self.msgid);
                        return Err(LdapError::Timeout);
                    }
                },
                None => self.rx.recv().await,
            };
            match item {
                // The driver dropped its sender without a terminal item:
                // the operation was abandoned out from under the stream.
                None => {
                    self.state = StreamState::Done;
                    self.res.get_or_insert_with(abandoned_result);
                    return Ok(None);
                }
                Some(SearchItem::Start(id)) => {
                    self.msgid = id;
                    self.requests += 1;
                }
                Some(SearchItem::Entry(entry)) => return Ok(Some(entry)),
                Some(SearchItem::Done(result)) => {
                    if self.handle_done(result)? {
                        return Ok(None);
                    }
                }
                Some(SearchItem::Error(e)) => {
                    self.state = StreamState::Error;
                    return Err(e);
                }
            }
        }
    }

    /// One wire request is complete. For an unpaged search that's the end of
    /// the stream; for a paged one it is a page boundary, and the cookie
    /// decides whether the search is exhausted. Returns `true` when `next()`
    /// should yield `Ok(None)`.
    fn handle_done(&mut self, mut result: LdapResult) -> Result<bool> {
        if self.paged.is_none() {
            self.res = Some(result);
            self.state = StreamState::Done;
            return Ok(true);
        }
        let mut pr = None;
        for (index, ctrl) in result.ctrls.iter().enumerate() {
            if let Control(Some(ControlType::PagedResults), ref raw) = *ctrl {
                pr = Some((index, raw.parse::<PagedResults>()));
                break;
            }
        }
        let (index, pr) = match pr {
            Some(found) => found,
            None => {
                self.res = Some(result);
                self.state = StreamState::Error;
                return Err(LdapError::PagedResultsNotSupported);
            }
        };
        result.ctrls.remove(index);
        self.pages += 1;
        self.res = Some(result);
        if pr.cookie.is_empty() {
            self.state = StreamState::Done;
            return Ok(true);
        }
        let pause = {
            let pg = self.paged.as_mut().expect("paged state");
            pg.cookie = pr.cookie;
            pg.pause
        };
        if pause {
            self.state = StreamState::PageBoundary;
            return Ok(true);
        }
        self.issue_request()?;
        Ok(false)
    }

    /// Resume a paged search paused at a page boundary. Returns `true` if a
    /// new page request was issued, `false` if the stream wasn't paused.
    pub fn next_page(&mut self) -> Result<bool> {
        if self.state != StreamState::PageBoundary {
            return Ok(false);
        }
        self.state = StreamState::Active;
        self.issue_request()?;
        Ok(true)
    }

    /// Return the overall result of the search. Regularly called after
    /// `next()` returns `Ok(None)` at the end of the stream; calling it at a
    /// page boundary stops the paged search with the last page's result.
    pub fn finish(&mut self) -> LdapResult {
        self.state = StreamState::Done;
        self.res.take().unwrap_or_else(abandoned_result)
    }

    /// Abandon the search. The overall result will have the result code of
    /// the Abandoned error condition.
    pub async fn abandon(&mut self) -> Result<()> {
        if self.state == StreamState::Active || self.state == StreamState::PageBoundary {
            self.state = StreamState::Done;
            self.res = Some(abandoned_result());
            return self.ldap.abandon(self.msgid).await;
        }
        Ok(())
    }

    /// Stream state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// `true` while a pausing paged search waits at a page boundary.
    pub fn at_page_boundary(&self) -> bool {
        self.state == StreamState::PageBoundary
    }

    /// Number of completed pages, for a paged search.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Number of wire requests flushed to the server for this search.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    /// The message ID of the currently active wire request.
    pub fn last_id(&self) -> RequestId {
        self.msgid
    }
}

/// Wrapper for the raw contents of a single search response.
#[derive(Clone, Debug)]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    /// A directory entry.
    pub fn is_entry(&self) -> bool {
        self.0.id == 4
    }

    /// A search reference.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// An intermediate message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }
}

/// Parsed search result entry.
///
/// While LDAP attributes can have a variety of syntaxes, they're all returned
/// in search results as octet strings, without any associated type
/// information. A general-purpose library like this one can't know which
/// attributes are textual, so the entry constructor sorts attributes by
/// checking whether all values of an attribute are valid UTF-8: those go
/// into `attrs`, the rest into `bin_attrs`.
#[derive(Clone, Debug, Default)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes with all-UTF-8 values.
    pub attrs: HashMap<String, Vec<String>>,
    /// Attributes with at least one non-UTF-8 value.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl SearchEntry {
    /// Parse raw BER data and convert it into attribute maps.
    ///
    /// The raw data must be a search result entry; this will panic on
    /// references and intermediate messages.
    pub fn construct(re: ResultEntry) -> SearchEntry {
        let mut tags = re
            .0
            .expect_constructed()
            .expect("entry components")
            .into_iter();
        let dn = String::from_utf8(
            tags.next()
                .expect("object name")
                .expect_primitive()
                .expect("octet string"),
        )
        .expect("dn utf8");
        let mut attrs = HashMap::new();
        let mut bin_attrs = HashMap::new();
        let attr_list = tags
            .next()
            .expect("attribute list")
            .expect_constructed()
            .unwrap_or_default();
        for partial in attr_list {
            let mut components = partial
                .expect_constructed()
                .expect("partial attribute")
                .into_iter();
            let name = String::from_utf8(
                components
                    .next()
                    .expect("attribute type")
                    .expect_primitive()
                    .expect("octet string"),
            )
            .expect("attribute name utf8");
            let raw_vals: Vec<Vec<u8>> = components
                .next()
                .expect("attribute values")
                .expect_constructed()
                .unwrap_or_default()
                .into_iter()
                .map(|v| v.expect_primitive().expect("octet string"))
                .collect();
            if raw_vals.iter().all(|v| std::str::from_utf8(v).is_ok()) {
                attrs.insert(
                    name,
                    raw_vals
                        .into_iter()
                        .map(|v| String::from_utf8(v).expect("checked utf8"))
                        .collect(),
                );
            } else {
                bin_attrs.insert(name, raw_vals);
            }
        }
        SearchEntry {
            dn,
            attrs,
            bin_attrs,
        }
    }
}

/// Parse the referral URIs of a search reference or a result referral.
pub fn parse_refs(t: StructureTag) -> Vec<String> {
    t.expect_constructed()
        .expect("referrals")
        .into_iter()
        .map(|t| t.expect_primitive().expect("octet string"))
        .map(|v| String::from_utf8(v).expect("uri utf8"))
        .collect()
}
