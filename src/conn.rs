//! Connection driver.
//!
//! `LdapConnAsync` owns the socket and everything attached to it: the
//! codec, the message tracker, the request queue, and the timers. It is a
//! single task which must be driven by the caller (see the `drive!` macro);
//! all client state mutation happens on that task, while operation handles
//! communicate with it over a channel.
//!
//! The driver cycles through three coarse states. While disconnected it
//! waits for work, buffering requests in the queue; the connect cycle picks
//! server URLs round-robin and retries with exponential backoff; while
//! connected it multiplexes requests and responses over the framed socket.
//! Destruction absorbs every state.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lber::common::TagClass;
use lber::structure::StructureTag;
#[cfg(feature = "tls")]
use lber::structures::Sequence;
use lber::structures::{Integer, Null, Tag};
use log::{debug, trace, warn};
#[cfg(feature = "tls")]
use native_tls::TlsConnector;
#[cfg(unix)]
use percent_encoding::percent_decode;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;
use tokio_util::codec::Framed;
use url::Url;

use crate::controls_impl::parse_controls;
#[cfg(feature = "tls")]
use crate::exop_impl::{construct_exop, StartTLS};
use crate::ldap::{bind_request, ConnOp, Ldap, RequestSpec};
use crate::msgmap::{MsgHandler, MsgMap};
use crate::protocol::{LdapCodec, LdapResultExt};
use crate::queue::RequestQueue;
use crate::result::{LdapError, LdapResult, Result};
use crate::search::{ResultEntry, SearchItem};
use crate::RequestId;

/// Connection lifecycle events.
///
/// Events are delivered on a broadcast channel obtained from
/// [`events()`](struct.LdapConnAsync.html#method.events) on the connection
/// or the operation handle. They are notifications: every operation also
/// reports its own outcome through its return value, so subscribing is
/// optional, and a lagging subscriber only loses events, never results.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    /// A connection is ready: socket up, setup done, queue flushed.
    Connect {
        /// URL of the server the client connected to.
        url: String,
    },
    /// A connect attempt failed; further attempts may follow.
    ConnectError(Arc<LdapError>),
    /// The retry budget ran out, last failing on the connect timer.
    ConnectTimeout,
    /// The retry budget ran out, last failing with a refused connection.
    ConnectRefused,
    /// Socket or protocol failure while setting up a fresh connection.
    SetupError(Arc<LdapError>),
    /// Fatal connection-level error.
    Error(Arc<LdapError>),
    /// A response carried a result code outside the set its operation
    /// treats as regular.
    ResultError(LdapResult),
    /// A per-request timer fired; the request was abandoned.
    Timeout,
    /// No requests were outstanding for the configured idle interval.
    Idle,
    /// The server closed its side of the connection.
    End,
    /// The connection is down.
    Close,
    /// The client was destroyed.
    Destroy,
}

/// Reconnection policy.
///
/// The delay between consecutive connect attempts starts at
/// `initial_delay` and doubles up to `max_delay`. `fail_after` bounds the
/// number of attempts *per server URL*: one connect cycle gives up after
/// `urls × fail_after` consecutive failures. Zero means no bound.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectOpts {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the doubling retry delay.
    pub max_delay: Duration,
    /// Connect attempts per URL before giving up; 0 = unbounded.
    pub fail_after: u32,
}

impl Default for ReconnectOpts {
    fn default() -> ReconnectOpts {
        ReconnectOpts {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            fail_after: 0,
        }
    }
}

impl ReconnectOpts {
    pub fn new() -> ReconnectOpts {
        ReconnectOpts::default()
    }
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    std::cmp::min(delay.saturating_mul(2), max)
}

/// Additional settings for an LDAP connection.
///
/// The structure is opaque to user code; instances are constructed through
/// the `new()` method and a number of setters, and passed to one of the
/// `LdapConnAsync` constructors.
#[derive(Clone, Default)]
pub struct LdapConnSettings {
    conn_timeout: Option<Duration>,
    op_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    reconnect: Option<ReconnectOpts>,
    queue_size: usize,
    queue_disable: bool,
    bind_dn: Option<String>,
    bind_pw: Option<String>,
    starttls: bool,
    #[cfg(feature = "tls")]
    connector: Option<TlsConnector>,
    #[cfg(feature = "tls")]
    no_tls_verify: bool,
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings::default()
    }

    /// Set the network timeout for establishing a connection, covering the
    /// socket open, the TLS handshake, and each setup exchange.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the default per-request response timeout. An expired request
    /// fails with a timeout error and is abandoned on the server.
    pub fn set_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Emit an `Idle` event after no requests have been outstanding for
    /// this long.
    pub fn set_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Reconnect automatically with the given policy.
    pub fn set_reconnect(mut self, reconnect: ReconnectOpts) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Bound the number of requests buffered while disconnected;
    /// 0 = unbounded.
    pub fn set_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Start with the queue frozen: requests submitted while disconnected
    /// fail immediately instead of being buffered.
    pub fn set_queue_disable(mut self, disable: bool) -> Self {
        self.queue_disable = disable;
        self
    }

    /// Do an implicit simple Bind with these credentials as part of
    /// connection setup.
    pub fn set_bind(mut self, bind_dn: &str, bind_pw: &str) -> Self {
        self.bind_dn = Some(bind_dn.to_owned());
        self.bind_pw = Some(bind_pw.to_owned());
        self
    }

    #[cfg(feature = "tls")]
    /// Upgrade plain connections with StartTLS as part of connection setup.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(feature = "tls")]
    /// Use a custom TlsConnector for `ldaps` connections and StartTLS.
    pub fn set_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    #[cfg(feature = "tls")]
    /// If `true`, try to establish a TLS context without hostname or
    /// certificate verification.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }
}

/// A single parsed server URL.
#[derive(Clone, Debug)]
struct ServerEndpoint {
    url: String,
    host: String,
    port: u16,
    secure: bool,
    #[cfg(unix)]
    path: Option<String>,
}

impl ServerEndpoint {
    #[cfg(unix)]
    fn is_unix(&self) -> bool {
        self.path.is_some()
    }

    #[cfg(not(unix))]
    fn is_unix(&self) -> bool {
        false
    }
}

fn parse_endpoint(url: &str) -> Result<ServerEndpoint> {
    #[cfg(unix)]
    if url.starts_with("ldapi://") {
        let path = url.split('/').nth(2).unwrap_or("");
        if path.is_empty() {
            return Err(LdapError::EmptyUnixPath);
        }
        if path.contains(':') {
            return Err(LdapError::PortInUnixPath);
        }
        let path = percent_decode(path.as_bytes()).decode_utf8_lossy().into_owned();
        return Ok(ServerEndpoint {
            url: url.to_owned(),
            host: String::new(),
            port: 0,
            secure: false,
            path: Some(path),
        });
    }
    let parsed = Url::parse(url)?;
    let mut port = 389;
    let secure = match parsed.scheme() {
        "ldap" => false,
        #[cfg(feature = "tls")]
        "ldaps" => {
            port = 636;
            true
        }
        s => return Err(LdapError::UnknownScheme(s.to_owned())),
    };
    if let Some(url_port) = parsed.port() {
        port = url_port;
    }
    let host = parsed.host_str().unwrap_or("localhost").to_owned();
    Ok(ServerEndpoint {
        url: url.to_owned(),
        host,
        port,
        secure,
        #[cfg(unix)]
        path: None,
    })
}

/// The transport under the codec. StartTLS swaps a `Tcp` variant for a
/// `Tls` one on the same underlying socket.
pub(crate) enum ConnType {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ref mut s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(ref mut s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(ref mut s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ref mut s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(ref mut s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(ref mut s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ref mut s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(ref mut s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ConnType::Unix(ref mut s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ref mut s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(ref mut s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ConnType::Unix(ref mut s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connected,
    Destroyed,
}

fn unbind_request() -> Tag {
    Tag::Null(Null {
        id: 2,
        class: TagClass::Application,
        inner: (),
    })
}

fn fail_handler(handler: MsgHandler, err: LdapError) {
    match handler {
        MsgHandler::Single { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        MsgHandler::Search { tx } => {
            let _ = tx.send(SearchItem::Error(err));
        }
        // an interrupted unbind achieved what it was after
        MsgHandler::Unbind { tx } => {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Asynchronous connection to an LDAP server.
///
/// Constructing an instance does not touch the network. The connection
/// is established, and re-established after failures when so configured,
/// by the [`drive()`](#method.drive) future, which must be polled
/// continuously for the whole lifetime of the client; the customary way is
/// to spawn it on its own task, which is what the [`drive!`](../macro.drive.html)
/// macro does. Operations submitted before the connection is ready are
/// buffered and flushed, in order, once it is.
pub struct LdapConnAsync {
    settings: LdapConnSettings,
    urls: Vec<ServerEndpoint>,
    next_url: usize,
    msgmap: Arc<Mutex<MsgMap>>,
    queue: RequestQueue,
    rx: mpsc::UnboundedReceiver<ConnOp>,
    events: broadcast::Sender<ClientEvent>,
    stream: Option<Framed<ConnType, LdapCodec>>,
    state: ConnState,
    unbinding: bool,
    reconnect_now: bool,
    idle_at: Option<Instant>,
}

impl LdapConnAsync {
    /// Open a connection to the LDAP server named by `url`, with default
    /// settings. The scheme can be __ldap__, __ldaps__ (with the `tls`
    /// feature), or, on Unix-like systems, __ldapi__ with a percent-encoded
    /// path of a Unix domain socket.
    pub fn new(url: &str) -> Result<(LdapConnAsync, Ldap)> {
        LdapConnAsync::with_settings(LdapConnSettings::new(), url)
    }

    /// Open a connection to the LDAP server named by `url`, with the
    /// provided settings.
    pub fn with_settings(settings: LdapConnSettings, url: &str) -> Result<(LdapConnAsync, Ldap)> {
        LdapConnAsync::with_urls(settings, &[url])
    }

    /// Open a connection to one of several equivalent servers. The connect
    /// cycle tries the URLs round-robin, and reconnection carries on from
    /// the next URL in the list.
    pub fn with_urls(settings: LdapConnSettings, urls: &[&str]) -> Result<(LdapConnAsync, Ldap)> {
        if urls.is_empty() {
            return Err(LdapError::Connection("no server URLs given".into()));
        }
        let urls = urls
            .iter()
            .map(|url| parse_endpoint(url))
            .collect::<Result<Vec<_>>>()?;
        let msgmap = Arc::new(Mutex::new(MsgMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let queue = RequestQueue::new(settings.queue_size, settings.queue_disable);
        let ldap = Ldap {
            tx,
            msgmap: msgmap.clone(),
            events: events.clone(),
            op_timeout: settings.op_timeout,
            timeout: None,
            controls: None,
            search_opts: None,
            last_id: 0,
        };
        let conn = LdapConnAsync {
            settings,
            urls,
            next_url: 0,
            msgmap,
            queue,
            rx,
            events,
            stream: None,
            state: ConnState::Disconnected,
            unbinding: false,
            reconnect_now: true,
            idle_at: None,
        };
        Ok((conn, ldap))
    }

    /// Subscribe to the stream of connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Run the connection engine. The future resolves when every operation
    /// handle has been dropped, or after destruction once the last handle
    /// goes away.
    pub async fn drive(mut self) -> Result<()> {
        loop {
            match self.state {
                ConnState::Disconnected => {
                    if self.reconnect_now {
                        self.reconnect_now = false;
                        self.connect_cycle().await;
                    } else if !self.serve_disconnected().await {
                        return Ok(());
                    }
                }
                ConnState::Connected => self.run_connected().await,
                ConnState::Destroyed => {
                    if !self.serve_destroyed().await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn serve_disconnected(&mut self) -> bool {
        match self.rx.recv().await {
            None => false,
            Some(op) => {
                self.handle_offline_op(op).await;
                true
            }
        }
    }

    async fn handle_offline_op(&mut self, op: ConnOp) {
        match op {
            ConnOp::Request(spec) => {
                if self.enqueue(spec) && self.settings.reconnect.is_some() {
                    self.reconnect_now = true;
                }
            }
            ConnOp::Abandon { id, ack } => {
                self.drop_queued(id);
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            ConnOp::Unbind { tx } => {
                let _ = tx.send(Ok(()));
            }
            ConnOp::Destroy => self.do_destroy().await,
        }
    }

    async fn serve_destroyed(&mut self) -> bool {
        match self.rx.recv().await {
            None => false,
            Some(ConnOp::Request(spec)) => {
                self.fail_spec(spec, LdapError::Connection("client destroyed".into()));
                true
            }
            Some(ConnOp::Abandon { ack, .. }) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Err(LdapError::Connection("client destroyed".into())));
                }
                true
            }
            Some(ConnOp::Unbind { tx }) => {
                let _ = tx.send(Ok(()));
                true
            }
            Some(ConnOp::Destroy) => true,
        }
    }

    fn enqueue(&mut self, spec: RequestSpec) -> bool {
        match self.queue.enqueue(spec) {
            Ok(()) => true,
            Err((spec, err)) => {
                self.fail_spec(spec, err);
                false
            }
        }
    }

    fn drop_queued(&mut self, id: RequestId) {
        if let Some(spec) = self.queue.remove(id) {
            self.msgmap.lock().expect("msgmap mutex").release(id);
            // dropping the handler resolves the caller as abandoned
            drop(spec);
        }
    }

    fn fail_spec(&mut self, spec: RequestSpec, err: LdapError) {
        self.msgmap.lock().expect("msgmap mutex").release(spec.id);
        fail_handler(spec.handler, err);
    }

    async fn connect_cycle(&mut self) {
        let reconnect = self.settings.reconnect;
        let mut delay = reconnect
            .map(|r| r.initial_delay)
            .unwrap_or(Duration::from_millis(100));
        let budget = match reconnect {
            Some(r) if r.fail_after > 0 => r.fail_after.saturating_mul(self.urls.len() as u32),
            Some(_) => u32::MAX,
            None => 1,
        };
        let mut attempts = 0u32;
        loop {
            if self.state == ConnState::Destroyed {
                return;
            }
            let ep = self.urls[self.next_url].clone();
            self.next_url = (self.next_url + 1) % self.urls.len();
            debug!("connecting to {}", ep.url);
            match self.try_connect(&ep).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.state = ConnState::Connected;
                    self.unbinding = false;
                    self.reconnect_now = false;
                    if !self.flush_queue().await {
                        // the fresh connection died during the flush;
                        // on_closed has already decided what happens next
                        return;
                    }
                    debug!("connection ready: {}", ep.url);
                    let _ = self.events.send(ClientEvent::Connect { url: ep.url });
                    self.maybe_arm_idle();
                    return;
                }
                Err((err, during_setup)) => {
                    attempts += 1;
                    warn!("connect attempt {} to {} failed: {}", attempts, ep.url, err);
                    let timed_out = matches!(err, LdapError::ConnectTimeout);
                    let refused = matches!(
                        err,
                        LdapError::Io { ref source }
                            if source.kind() == io::ErrorKind::ConnectionRefused
                    );
                    let err = Arc::new(err);
                    let _ = self.events.send(if during_setup {
                        ClientEvent::SetupError(err.clone())
                    } else {
                        ClientEvent::ConnectError(err.clone())
                    });
                    if attempts >= budget {
                        let _ = self.events.send(if timed_out {
                            ClientEvent::ConnectTimeout
                        } else if refused {
                            ClientEvent::ConnectRefused
                        } else {
                            ClientEvent::Error(err)
                        });
                        self.give_up();
                        return;
                    }
                    if !self.backoff_sleep(delay).await {
                        return;
                    }
                    if let Some(r) = reconnect {
                        delay = next_backoff(delay, r.max_delay);
                    }
                }
            }
        }
    }

    /// No further connect attempts: fail queued requests fast instead of
    /// letting them hang on a connection that won't come.
    fn give_up(&mut self) {
        warn!("giving up on connecting");
        self.reconnect_now = false;
        self.queue.freeze();
        let mut purged = Vec::new();
        self.queue.purge(|spec| purged.push(spec));
        for spec in purged {
            self.fail_spec(spec, LdapError::Connection("connect failed".into()));
        }
    }

    /// Sleep out the backoff delay while staying responsive to incoming
    /// operations. `false` aborts the connect cycle.
    async fn backoff_sleep(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return true,
                op = self.rx.recv() => match op {
                    None => {
                        self.state = ConnState::Destroyed;
                        return false;
                    }
                    Some(op) => {
                        self.handle_offline_op(op).await;
                        if self.state == ConnState::Destroyed {
                            return false;
                        }
                    }
                },
            }
        }
    }

    async fn try_connect(
        &mut self,
        ep: &ServerEndpoint,
    ) -> std::result::Result<Framed<ConnType, LdapCodec>, (LdapError, bool)> {
        let io = self.open_socket(ep).await.map_err(|e| (e, false))?;
        #[allow(unused_mut)]
        let mut framed = Framed::new(io, LdapCodec);
        #[cfg(feature = "tls")]
        if self.settings.starttls && !ep.secure && !ep.is_unix() {
            framed = match self.starttls(framed, ep).await {
                Ok(framed) => framed,
                Err(e) => return Err((e, true)),
            };
        }
        if let (Some(dn), Some(pw)) = (self.settings.bind_dn.clone(), self.settings.bind_pw.clone())
        {
            if let Err(e) = self.setup_bind(&mut framed, &dn, &pw).await {
                return Err((e, true));
            }
        }
        Ok(framed)
    }

    async fn open_socket(&mut self, ep: &ServerEndpoint) -> Result<ConnType> {
        #[cfg(unix)]
        if let Some(path) = ep.path.clone() {
            let stream = self.maybe_timeout(UnixStream::connect(path)).await?;
            return Ok(ConnType::Unix(stream));
        }
        let tcp = self
            .maybe_timeout(TcpStream::connect((ep.host.as_str(), ep.port)))
            .await?;
        if ep.secure {
            #[cfg(feature = "tls")]
            {
                let connector = self.tls_connector()?;
                let tls = self.maybe_timeout(connector.connect(&ep.host, tcp)).await?;
                return Ok(ConnType::Tls(tls));
            }
            #[cfg(not(feature = "tls"))]
            unreachable!("ldaps is rejected at URL parse without the tls feature");
        }
        Ok(ConnType::Tcp(tcp))
    }

    async fn maybe_timeout<F, T, E>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, E>>,
        LdapError: From<E>,
    {
        match self.settings.conn_timeout {
            Some(timeout) => match time::timeout(timeout, fut).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(LdapError::ConnectTimeout),
            },
            None => Ok(fut.await?),
        }
    }

    #[cfg(feature = "tls")]
    fn tls_connector(&self) -> Result<tokio_native_tls::TlsConnector> {
        if let Some(connector) = self.settings.connector.clone() {
            return Ok(tokio_native_tls::TlsConnector::from(connector));
        }
        let mut builder = TlsConnector::builder();
        if self.settings.no_tls_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        Ok(tokio_native_tls::TlsConnector::from(builder.build()?))
    }

    /// Upgrade the live connection to TLS. The framed transport is taken
    /// apart, the TLS handshake runs over the same TCP stream, and the
    /// codec is re-installed on top of the TLS stream. Any LDAP bytes
    /// arriving between the StartTLS response and the handshake would be
    /// lost, so their presence is treated as a protocol error.
    #[cfg(feature = "tls")]
    async fn starttls(
        &mut self,
        mut framed: Framed<ConnType, LdapCodec>,
        ep: &ServerEndpoint,
    ) -> Result<Framed<ConnType, LdapCodec>> {
        debug!("negotiating StartTLS with {}", ep.url);
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(StartTLS.into()),
        });
        let ext = self.setup_exchange(&mut framed, req).await?;
        ext.0.success()?;
        let parts = framed.into_parts();
        if !parts.read_buf.is_empty() {
            return Err(LdapError::Protocol("data following the StartTLS response"));
        }
        let tcp = match parts.io {
            ConnType::Tcp(tcp) => tcp,
            _ => return Err(LdapError::Protocol("StartTLS needs a plain TCP connection")),
        };
        let connector = self.tls_connector()?;
        let tls = self.maybe_timeout(connector.connect(&ep.host, tcp)).await?;
        Ok(Framed::new(ConnType::Tls(tls), LdapCodec))
    }

    async fn setup_bind(
        &mut self,
        framed: &mut Framed<ConnType, LdapCodec>,
        dn: &str,
        pw: &str,
    ) -> Result<()> {
        debug!("binding as {}", dn);
        let ext = self.setup_exchange(framed, bind_request(dn, pw)).await?;
        ext.0.success()?;
        Ok(())
    }

    /// One request/response exchange during setup, before the connection
    /// joins the regular multiplexing loop.
    async fn setup_exchange(
        &mut self,
        framed: &mut Framed<ConnType, LdapCodec>,
        req: Tag,
    ) -> Result<LdapResultExt> {
        let id = self.msgmap.lock().expect("msgmap mutex").alloc_id();
        let res = match self.settings.conn_timeout {
            Some(timeout) => match time::timeout(timeout, raw_exchange(framed, id, req)).await {
                Ok(res) => res,
                Err(_) => Err(LdapError::ConnectTimeout),
            },
            None => raw_exchange(framed, id, req).await,
        };
        self.msgmap.lock().expect("msgmap mutex").release(id);
        res
    }

    async fn run_connected(&mut self) {
        while self.state == ConnState::Connected {
            let idle_at = self
                .idle_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
            tokio::select! {
                op = self.rx.recv() => match op {
                    None => {
                        self.stream = None;
                        self.state = ConnState::Destroyed;
                        return;
                    }
                    Some(ConnOp::Request(spec)) => self.send_request(spec).await,
                    Some(ConnOp::Abandon { id, ack }) => self.do_abandon(id, ack).await,
                    Some(ConnOp::Unbind { tx }) => self.do_unbind(tx).await,
                    Some(ConnOp::Destroy) => self.do_destroy().await,
                },
                msg = self.stream.as_mut().expect("connected stream").next() => match msg {
                    Some(Ok((id, (tag, controls)))) => self.route_frame(id, tag, controls),
                    Some(Err(e)) => {
                        warn!("connection error: {}", e);
                        let _ = self.events.send(ClientEvent::Error(Arc::new(e)));
                        self.on_closed();
                    }
                    None => {
                        debug!("server closed the connection");
                        let _ = self.events.send(ClientEvent::End);
                        self.on_closed();
                    }
                },
                _ = time::sleep_until(idle_at), if self.idle_at.is_some() => {
                    self.idle_at = None;
                    let _ = self.events.send(ClientEvent::Idle);
                }
            }
        }
    }

    /// Replay queued requests onto a fresh connection, strictly FIFO.
    /// `false` if the connection was lost along the way; whatever wasn't
    /// sent goes back into the queue.
    async fn flush_queue(&mut self) -> bool {
        let mut entries = self.queue.drain();
        while let Some(spec) = entries.pop_front() {
            self.send_request(spec).await;
            if self.state != ConnState::Connected {
                self.queue.requeue_front(entries);
                return false;
            }
        }
        true
    }

    async fn send_request(&mut self, spec: RequestSpec) {
        let RequestSpec {
            id,
            req,
            controls,
            handler,
        } = spec;
        let search_tx = match handler {
            MsgHandler::Search { ref tx } => Some(tx.clone()),
            _ => None,
        };
        self.msgmap.lock().expect("msgmap mutex").track(id, handler);
        self.idle_at = None;
        let stream = self.stream.as_mut().expect("connected stream");
        match stream.send((id, req, controls)).await {
            Ok(()) => {
                trace!("flushed request msgid={}", id);
                if let Some(tx) = search_tx {
                    let _ = tx.send(SearchItem::Start(id));
                }
            }
            Err(e) => {
                warn!("write failed for msgid {}: {}", id, e);
                let _ = self.events.send(ClientEvent::Error(Arc::new(e)));
                self.on_closed();
            }
        }
    }

    fn route_frame(&mut self, id: RequestId, tag: Tag, controls: Option<StructureTag>) {
        // message ID zero marks an unsolicited notification, most likely
        // a Notice of Disconnection
        if id == 0 {
            warn!("unsolicited notification; closing the connection");
            let _ = self.events.send(ClientEvent::Error(Arc::new(LdapError::Protocol(
                "unsolicited notification",
            ))));
            self.on_closed();
            return;
        }
        let op_id = match tag {
            Tag::StructureTag(ref t) => t.id,
            _ => 0,
        };
        let terminal = !matches!(op_id, 4 | 19 | 25);
        enum Kind {
            Search,
            Single,
            Unbind,
            Unknown,
        }
        let mut mm = self.msgmap.lock().expect("msgmap mutex");
        if mm.discard(id, terminal) {
            trace!("discarding frame for abandoned msgid {}", id);
            return;
        }
        let kind = match mm.fetch(id) {
            Some(MsgHandler::Search { .. }) => Kind::Search,
            Some(MsgHandler::Single { .. }) => Kind::Single,
            Some(MsgHandler::Unbind { .. }) => Kind::Unbind,
            None => Kind::Unknown,
        };
        match kind {
            Kind::Unknown => {
                drop(mm);
                warn!("response for unknown msgid {}", id);
            }
            // no response is defined for unbind; ignore whatever this is
            Kind::Unbind => (),
            Kind::Search if !terminal => {
                let tx = match mm.fetch(id) {
                    Some(MsgHandler::Search { tx }) => tx.clone(),
                    _ => return,
                };
                drop(mm);
                let st = match tag {
                    Tag::StructureTag(st) => st,
                    _ => return,
                };
                let ctrls = controls.map(parse_controls).unwrap_or_default();
                let _ = tx.send(SearchItem::Entry(ResultEntry(st, ctrls)));
            }
            Kind::Search => {
                let handler = mm.remove(id);
                drop(mm);
                let mut result = LdapResultExt::from(tag).0;
                if let Some(ctrls) = controls {
                    result.ctrls = parse_controls(ctrls);
                }
                if let Some(MsgHandler::Search { tx }) = handler {
                    let _ = tx.send(SearchItem::Done(result));
                }
                self.maybe_arm_idle();
            }
            Kind::Single => {
                let handler = mm.remove(id);
                drop(mm);
                let ext = LdapResultExt::from(tag);
                let mut result = ext.0;
                if let Some(ctrls) = controls {
                    result.ctrls = parse_controls(ctrls);
                }
                if let Some(MsgHandler::Single { expect, tx }) = handler {
                    if !expect.contains(&result.rc) {
                        let _ = self.events.send(ClientEvent::ResultError(result.clone()));
                    }
                    let _ = tx.send(Ok((result, ext.1)));
                }
                self.maybe_arm_idle();
            }
        }
    }

    async fn do_abandon(&mut self, target: RequestId, ack: Option<oneshot::Sender<Result<()>>>) {
        if self.queue.remove(target).is_some() {
            self.msgmap.lock().expect("msgmap mutex").release(target);
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            return;
        }
        let id = {
            let mut mm = self.msgmap.lock().expect("msgmap mutex");
            if mm.fetch(target).is_none() {
                None
            } else {
                Some(mm.alloc_id())
            }
        };
        let id = match id {
            // nothing in flight under that ID; nothing to tell the server
            None => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
            Some(id) => id,
        };
        debug!("abandoning msgid {}", target);
        let req = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: target as i64,
        });
        let res = self
            .stream
            .as_mut()
            .expect("connected stream")
            .send((id, req, None))
            .await;
        {
            let mut mm = self.msgmap.lock().expect("msgmap mutex");
            mm.release(id);
            mm.abandon(target);
        }
        if let Some(ack) = ack {
            let _ = ack.send(Ok(()));
        }
        if let Err(e) = res {
            warn!("abandon write failed: {}", e);
            let _ = self.events.send(ClientEvent::Error(Arc::new(e)));
            self.on_closed();
        }
    }

    async fn do_unbind(&mut self, tx: oneshot::Sender<Result<()>>) {
        let id = {
            let mut mm = self.msgmap.lock().expect("msgmap mutex");
            let id = mm.alloc_id();
            mm.track(id, MsgHandler::Unbind { tx });
            id
        };
        self.unbinding = true;
        let stream = self.stream.as_mut().expect("connected stream");
        if let Err(e) = stream.send((id, unbind_request(), None)).await {
            debug!("unbind write failed: {}", e);
            self.on_closed();
            return;
        }
        // half-close the write side; the close purge resolves the caller
        // once the server hangs up
        let _ = stream.close().await;
    }

    async fn do_destroy(&mut self) {
        if self.state == ConnState::Destroyed {
            return;
        }
        debug!("destroying the client");
        self.queue.freeze();
        let mut purged = Vec::new();
        self.queue.purge(|spec| purged.push(spec));
        for spec in purged {
            self.fail_spec(spec, LdapError::Connection("client destroyed".into()));
        }
        if let Some(stream) = self.stream.as_mut() {
            // courtesy unbind; the socket is going away either way
            let id = self.msgmap.lock().expect("msgmap mutex").alloc_id();
            let _ = stream.send((id, unbind_request(), None)).await;
            self.msgmap.lock().expect("msgmap mutex").release(id);
        }
        self.stream = None;
        self.idle_at = None;
        self.purge_pending("client destroyed");
        self.state = ConnState::Destroyed;
        let _ = self.events.send(ClientEvent::Destroy);
    }

    /// The socket is gone. Purge in-flight requests, emit `Close`, and
    /// decide whether the connect cycle is re-entered.
    fn on_closed(&mut self) {
        self.stream = None;
        self.idle_at = None;
        self.purge_pending("connection closed");
        let _ = self.events.send(ClientEvent::Close);
        let unbinding = std::mem::replace(&mut self.unbinding, false);
        if self.state == ConnState::Destroyed {
            return;
        }
        self.state = ConnState::Disconnected;
        if self.settings.reconnect.is_some() {
            if !unbinding {
                self.reconnect_now = true;
            }
        } else {
            // without reconnection nothing will ever drain the queue
            self.give_up();
        }
    }

    /// Deliver a connection error to every in-flight request, except an
    /// outstanding unbind, which gets the success it was waiting for.
    fn purge_pending(&mut self, reason: &str) {
        let mut purged = Vec::new();
        self.msgmap
            .lock()
            .expect("msgmap mutex")
            .purge(|id, handler| purged.push((id, handler)));
        for (id, handler) in purged {
            trace!("purging msgid {}", id);
            fail_handler(handler, LdapError::Connection(reason.to_owned()));
        }
    }

    fn maybe_arm_idle(&mut self) {
        if let Some(idle) = self.settings.idle_timeout {
            if self.state == ConnState::Connected
                && self.msgmap.lock().expect("msgmap mutex").pending_count() == 0
            {
                self.idle_at = Some(Instant::now() + idle);
            }
        }
    }
}

async fn raw_exchange(
    framed: &mut Framed<ConnType, LdapCodec>,
    id: RequestId,
    req: Tag,
) -> Result<LdapResultExt> {
    framed.send((id, req, None)).await?;
    loop {
        match framed.next().await {
            None => return Err(LdapError::EndOfStream),
            Some(Err(e)) => return Err(e),
            Some(Ok((rid, (tag, _)))) if rid == id => return Ok(LdapResultExt::from(tag)),
            Some(Ok((rid, _))) => warn!("ignoring msgid {} during setup", rid),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let ep = parse_endpoint("ldap://ldap.example.org").expect("parse");
        assert_eq!(ep.host, "ldap.example.org");
        assert_eq!(ep.port, 389);
        assert!(!ep.secure);

        let ep = parse_endpoint("ldap://localhost:2389").expect("parse");
        assert_eq!(ep.port, 2389);

        assert!(matches!(
            parse_endpoint("http://example.org"),
            Err(LdapError::UnknownScheme(_))
        ));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn ldaps_endpoint_defaults() {
        let ep = parse_endpoint("ldaps://ldap.example.org").expect("parse");
        assert_eq!(ep.port, 636);
        assert!(ep.secure);
    }

    #[cfg(unix)]
    #[test]
    fn ldapi_endpoint_parsing() {
        let ep = parse_endpoint("ldapi://%2Fvar%2Frun%2Fldapi").expect("parse");
        assert_eq!(ep.path.as_deref(), Some("/var/run/ldapi"));
        assert!(matches!(
            parse_endpoint("ldapi://"),
            Err(LdapError::EmptyUnixPath)
        ));
        assert!(matches!(
            parse_endpoint("ldapi://sock:123"),
            Err(LdapError::PortInUnixPath)
        ));
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let max = Duration::from_secs(10);
        let mut delay = Duration::from_millis(100);
        let mut seen = Vec::new();
        for _ in 0..9 {
            seen.push(delay);
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen[0], Duration::from_millis(100));
        assert_eq!(seen[1], Duration::from_millis(200));
        assert_eq!(seen[6], Duration::from_millis(6400));
        assert_eq!(seen[7], max);
        assert_eq!(seen[8], max);
        assert_eq!(next_backoff(max, max), max);
    }
}
