//! A multiplexed LDAP client with automatic reconnection.
//!
//! The library implements the client side of LDAPv3 (RFC 4511) on top of
//! tokio. One connection carries any number of concurrent operations,
//! correlated by message ID; requests issued while the connection is down
//! are buffered and replayed once a connection is (re-)established, with
//! round-robin failover across server URLs and exponential backoff between
//! attempts. Search results are streamed, with built-in chaining of the
//! Paged Results control.
//!
//! ## Usage
//!
//! The connection and the operation handle are created together; the
//! connection must be driven on its own task, which the [`drive!`](macro.drive.html)
//! macro arranges:
//!
//! ```rust,no_run
//! use ldapmux::{LdapConnAsync, Scope};
//!
//! # async fn x() -> ldapmux::result::Result<()> {
//! let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:2389")?;
//! ldapmux::drive!(conn);
//! ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
//!     .await?
//!     .success()?;
//! let (rs, _res) = ldap
//!     .search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])
//!     .await?
//!     .success()?;
//! ldap.unbind().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Operations return their result both ways required by the protocol
//! design: the future resolves with a [`LdapResult`](result/struct.LdapResult.html)
//! whose result code can be inspected directly, or converted to a Rust
//! error with `success()`. Connection lifecycle notifications (connects,
//! failures, idle periods) are published on a broadcast channel; see
//! [`ClientEvent`](enum.ClientEvent.html).

#[macro_use]
extern crate lazy_static;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! This section is deliberately under-documented; if you need examples
    //! of using the present interface for, e.g., implementing a new
    //! extended operation or a control, consult the source of existing
    //! exops/controls.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{StructureTag, PL};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
    pub use lber::IResult;
}
mod conn;
pub mod controls {
    //! Control construction and parsing.
    //!
    //! A control can be associated with a request or a response. The one
    //! control the connection engine itself depends on,
    //! [`PagedResults`](struct.PagedResults.html), is implemented here
    //! directly; it has the same form for requests and responses, so there
    //! is a single structure for both.
    //!
    //! A request control is attached to an operation by calling
    //! [`with_controls()`](../struct.Ldap.html#method.with_controls) on the
    //! handle; anything convertible into [`RawControl`](struct.RawControl.html),
    //! the general form of a control, is accepted. A third-party control
    //! must implement that conversion for instances of itself.
    //!
    //! `RawControl`, together with an optional instance of
    //! [`ControlType`](types/index.html), forms the type
    //! [`Control`](struct.Control.html); a vector of `Control`s is part of
    //! the result of every LDAP operation which returns one. The first
    //! element will have a value if the parser recognizes the control's OID
    //! as one implemented by the library itself. Since the list of
    //! recognized controls is expected to grow, matching on it cannot be
    //! exhaustive. A recognized response control can be parsed by calling
    //! [`parse()`](struct.RawControl.html#method.parse) on its `RawControl`;
    //! a third-party control must implement the
    //! [`ControlParser`](trait.ControlParser.html) trait to support this
    //! interface.
    pub use crate::controls_impl::types;
    pub use crate::controls_impl::{
        Control, ControlParser, CriticalControl, MakeCritical, PagedResults, RawControl,
        PAGED_RESULTS_OID,
    };
}
mod controls_impl;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). A
    //! request struct for a particular exop must implement the `From`
    //! conversion of itself into `Exop`; a response struct must implement
    //! the [`ExopParser`](trait.ExopParser.html) trait.
    pub use crate::exop_impl::{Exop, ExopParser, StartTLS, STARTTLS_OID};

    pub(crate) use crate::exop_impl::construct_exop;
}
mod filter;
mod ldap;
mod msgmap;
mod protocol;
mod queue;
pub mod result;
mod search;
#[cfg(feature = "sync")]
mod sync;
mod util;

pub use conn::{ClientEvent, LdapConnAsync, LdapConnSettings, ReconnectOpts};
pub use filter::parse as parse_filter;
pub use ldap::{Ldap, Mod};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::{
    parse_refs, DerefAliases, Paged, ResultEntry, Scope, SearchEntry, SearchOptions, SearchStream,
    StreamState,
};
#[cfg(feature = "sync")]
pub use sync::LdapConn;
pub use util::{dn_escape, ldap_escape};

/// Spawn the connection driver on a new task, logging a terminal error.
///
/// The connection created by [`LdapConnAsync`](struct.LdapConnAsync.html)
/// constructors must be driven for the client to make progress; this macro
/// is the no-frills way of doing that.
#[macro_export]
macro_rules! drive {
    ($conn:expr) => {
        tokio::spawn(async move {
            if let Err(e) = $conn.drive().await {
                log::warn!("LDAP connection error: {}", e);
            }
        });
    };
}
