//! Session builder, configuration and the request queue.
//!
//! The [`SessionBuilder`] provides a fluent API for configuring the
//! session. [`SessionBuilder::connect`] runs the lifecycle:
//! 1. Obtain the byte stream from the [`Connector`]
//! 2. Tversion (tag 0); the server's msize becomes the ceiling
//! 3. Tattach the root on fid 0
//! 4. Spawn the worker task that owns the connection and handle table
//!
//! # Architecture
//!
//! ```text
//! open() ─┐
//! read() ─┼─► mpsc::UnboundedSender<Command> ─► Worker ─► Connection ─► Stream
//! close() ┘        (FIFO, arrival order)          │
//!                                                 └─► oneshot reply per call
//! ```
//!
//! Exactly one request is on the wire at a time. Commands are queued in
//! the order the calls were made and each one resolves before the next is
//! written.
//!
//! # Example
//!
//! ```ignore
//! use ninep_client::{OpenMode, Session, StreamConnector};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:564").await?;
//! let session = Session::builder()
//!     .uname("glenda")
//!     .connect(StreamConnector::new(stream))
//!     .await?;
//!
//! let handle = session.open("lib/motd", OpenMode::READ).await?;
//! let data = session.read(&handle, 0, 4096).await?;
//! session.close(handle)?;
//! ```

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{unexpected, Connection, DEFAULT_READ_BUFFER_SIZE};
use crate::error::{NineError, Result};
use crate::handle::{Handle, HandleTable, OpenEntry, ROOT_FID};
use crate::protocol::{
    OpenMode, Qid, Rmessage, Stat, Tmessage, DEFAULT_MSIZE, IOHDRSZ, MAXWELEM, NOFID,
    VERSION_9P2000,
};
use crate::transport::{ConnectionState, Connector, EventSink, NoopSink};

/// Default number of fids, the attached root included.
pub const DEFAULT_MAX_FIDS: u32 = 1024;

/// Tag used for Tversion.
const VERSION_TAG: u16 = 0;

/// Session parameters.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use ninep_client::SessionConfig;
///
/// let config = SessionConfig::from_json(r#"{ "uname": "glenda", "msize": 16384 }"#).unwrap();
/// assert_eq!(config.uname, "glenda");
/// assert_eq!(config.msize, 16384);
/// assert_eq!(config.version, "9P2000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// msize proposed in Tversion. The server may lower it.
    pub msize: u32,
    /// Protocol version string proposed in Tversion.
    pub version: String,
    /// User name sent in Tattach.
    pub uname: String,
    /// File tree selected in Tattach.
    pub aname: String,
    /// Size of the fid space, the root fid included.
    pub max_fids: u32,
    /// Size of a single read from the stream.
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            version: VERSION_9P2000.to_string(),
            uname: String::new(),
            aname: String::new(),
            max_fids: DEFAULT_MAX_FIDS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn validate(&self) -> Result<()> {
        if self.msize <= IOHDRSZ {
            return Err(NineError::InvalidArgument(format!(
                "msize {} leaves no room for data",
                self.msize
            )));
        }
        if self.max_fids < 2 {
            return Err(NineError::InvalidArgument(format!(
                "max_fids {} leaves no fid beside the root",
                self.max_fids
            )));
        }
        Ok(())
    }
}

/// Builder for configuring and connecting a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    sink: Arc<dyn EventSink>,
}

impl SessionBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(SessionConfig::default())
    }

    /// Create a builder from a loaded configuration.
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoopSink),
        }
    }

    /// Set the proposed msize.
    ///
    /// Default: 8192
    pub fn msize(mut self, msize: u32) -> Self {
        self.config.msize = msize;
        self
    }

    /// Set the proposed protocol version.
    ///
    /// Default: "9P2000"
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn uname(mut self, uname: impl Into<String>) -> Self {
        self.config.uname = uname.into();
        self
    }

    pub fn aname(mut self, aname: impl Into<String>) -> Self {
        self.config.aname = aname.into();
        self
    }

    /// Set the size of the fid space.
    ///
    /// Default: 1024
    pub fn max_fids(mut self, max_fids: u32) -> Self {
        self.config.max_fids = max_fids;
        self
    }

    /// Set the stream read size.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Receive lifecycle notifications.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connect, negotiate the version, attach, and start the worker.
    ///
    /// Any failure leaves the session `Failed` and is reported to the
    /// event sink before it is returned.
    pub async fn connect<C: Connector>(self, connector: C) -> Result<Session> {
        let SessionBuilder { config, sink } = self;
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let state = StateTracker { tx: state_tx, sink };

        state.set(ConnectionState::Connecting);
        let stream = match connector.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                let err = NineError::Connect(format!("connect failed: {}", e));
                state.fail(&err);
                return Err(err);
            }
        };

        let mut conn = Connection::new(stream, config.msize, config.read_buffer_size);
        let mut table = HandleTable::new(config.max_fids);

        let msize = match negotiate(&mut conn, &mut table, &config, &state).await {
            Ok(msize) => msize,
            Err(err) => {
                state.fail(&err);
                return Err(err);
            }
        };

        state.set(ConnectionState::Ready);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            conn,
            table,
            commands: commands_rx,
            state,
            open: open.clone(),
            msize,
            failure: None,
            shutdown_reply: None,
        };
        let task = tokio::spawn(worker.run());

        Ok(Session {
            commands: commands_tx,
            state: state_rx,
            open,
            msize,
            _worker: task,
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Version negotiation and attach. Returns the negotiated msize.
async fn negotiate<S>(
    conn: &mut Connection<S>,
    table: &mut HandleTable,
    config: &SessionConfig,
    state: &StateTracker,
) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.set(ConnectionState::VersionNegotiating);
    let request = Tmessage::Version {
        msize: config.msize,
        version: config.version.clone(),
    };
    let reply = conn
        .transact(VERSION_TAG, &request)
        .await
        .map_err(|e| rejected("version", e))?;

    let msize = match reply {
        Rmessage::Version { msize, version } => {
            if version != config.version {
                return Err(NineError::Connect(format!(
                    "server answered version {:?} to {:?}",
                    version, config.version
                )));
            }
            if msize <= IOHDRSZ {
                return Err(NineError::Connect(format!("server msize {} too small", msize)));
            }
            msize.min(config.msize)
        }
        other => return Err(unexpected("Rversion", &other)),
    };
    conn.set_msize(msize);
    tracing::info!("negotiated {} with msize {}", config.version, msize);

    state.set(ConnectionState::Attaching);
    table.reserve_root()?;
    let tag = table.alloc_tag()?;
    let request = Tmessage::Attach {
        fid: ROOT_FID,
        afid: NOFID,
        uname: config.uname.clone(),
        aname: config.aname.clone(),
    };
    let reply = conn.transact(tag, &request).await;
    table.release_tag(tag);

    match reply.map_err(|e| rejected("attach", e))? {
        Rmessage::Attach { qid } => {
            tracing::debug!("attached {:?} as {:?}, root {:?}", config.aname, config.uname, qid);
            Ok(msize)
        }
        other => Err(unexpected("Rattach", &other)),
    }
}

/// An Rerror during the handshake means there is no usable session.
fn rejected(step: &str, err: NineError) -> NineError {
    match err {
        NineError::Protocol(ename) => NineError::Connect(format!("{} rejected: {}", step, ename)),
        other => other,
    }
}

/// A connected 9P session.
///
/// Every operation is queued immediately when called and resolves through
/// the returned [`Pending`] future, so operations issued back to back are
/// pipelined in call order without awaiting each other.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    open: Arc<AtomicUsize>,
    msize: u32,
    _worker: JoinHandle<()>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Walk from the root to `path` and open it.
    ///
    /// Path elements are separated by `/`; empty elements are ignored. A
    /// walk that resolves fewer elements than requested fails with
    /// [`NineError::WalkIncomplete`] and the fid is clunked before the
    /// error is returned.
    pub fn open(&self, path: &str, mode: OpenMode) -> Pending<Handle> {
        let wnames = match split_path(path) {
            Ok(wnames) => wnames,
            Err(err) => return Pending::failed(err),
        };
        let name = wnames.join("/");
        self.submit(|reply| Command::Open {
            wnames,
            name,
            mode,
            reply,
        })
    }

    /// Create `name` inside directory `dir` and open it.
    ///
    /// `perm` takes the permission bits plus [`perm::DMDIR`] and friends.
    ///
    /// [`perm::DMDIR`]: crate::protocol::perm::DMDIR
    pub fn create(&self, dir: &str, name: &str, perm: u32, mode: OpenMode) -> Pending<Handle> {
        let wnames = match split_path(dir) {
            Ok(wnames) => wnames,
            Err(err) => return Pending::failed(err),
        };
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Pending::failed(NineError::InvalidArgument(format!(
                "cannot create {:?}",
                name
            )));
        }

        let full = if wnames.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", wnames.join("/"), name)
        };
        let file = name.to_string();
        self.submit(|reply| Command::Create {
            wnames,
            name: full,
            file,
            perm,
            mode,
            reply,
        })
    }

    /// Read up to `count` bytes at `offset`. `count` is clamped to the
    /// handle's iounit; an empty result means end of file.
    pub fn read(&self, handle: &Handle, offset: u64, count: u32) -> Pending<Bytes> {
        let count = count.min(handle.iounit());
        let (fid, tag) = (handle.fid(), handle.tag());
        self.submit(|reply| Command::Read {
            fid,
            tag,
            offset,
            count,
            reply,
        })
    }

    /// Write at `offset`. At most one iounit of `data` is sent; the
    /// returned count says how much the server accepted.
    pub fn write(&self, handle: &Handle, offset: u64, data: impl Into<Bytes>) -> Pending<u32> {
        let mut data = data.into();
        data.truncate(handle.iounit() as usize);
        let (fid, tag) = (handle.fid(), handle.tag());
        self.submit(|reply| Command::Write {
            fid,
            tag,
            offset,
            data,
            reply,
        })
    }

    pub fn stat(&self, handle: &Handle) -> Pending<Stat> {
        let (fid, tag) = (handle.fid(), handle.tag());
        self.submit(|reply| Command::Stat { fid, tag, reply })
    }

    /// Change file attributes. Start from [`Stat::dont_touch`] and set only
    /// the fields to change.
    pub fn wstat(&self, handle: &Handle, stat: Stat) -> Pending<()> {
        let (fid, tag) = (handle.fid(), handle.tag());
        self.submit(|reply| Command::Wstat {
            fid,
            tag,
            stat: stat.sized(),
            reply,
        })
    }

    /// Close a handle.
    ///
    /// The handle leaves the table and its fid becomes reusable as soon as
    /// the worker reaches this command; the Rclunk is consumed without
    /// anyone waiting on it.
    pub fn close(&self, handle: Handle) -> Result<()> {
        self.ensure_ready()?;
        self.commands
            .send(Command::Close {
                fid: handle.fid(),
                tag: handle.tag(),
            })
            .map_err(|_| session_closed())
    }

    /// Remove the file behind `handle`. The fid is released whether or
    /// not the server agrees.
    pub fn remove(&self, handle: Handle) -> Pending<()> {
        let (fid, tag) = (handle.fid(), handle.tag());
        self.submit(|reply| Command::Remove { fid, tag, reply })
    }

    /// Ask the server to abandon the request carrying `handle`'s tag.
    ///
    /// Requests go out one at a time, so by the time Tflush is written the
    /// earlier request has already resolved; the flush only tells the
    /// server to forget the tag.
    pub fn flush(&self, handle: &Handle) -> Pending<()> {
        let oldtag = handle.tag();
        self.submit(|reply| Command::Flush { oldtag, reply })
    }

    /// Stop the session after everything queued so far has resolved.
    pub fn shutdown(&self) -> Pending<()> {
        self.submit(|reply| Command::Shutdown { reply })
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(NineError::NotReady(state)),
        }
    }

    fn submit<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Pending<T> {
        if let Err(err) = self.ensure_ready() {
            return Pending::failed(err);
        }
        let (tx, rx) = oneshot::channel();
        match self.commands.send(build(tx)) {
            Ok(()) => Pending::waiting(rx),
            Err(_) => Pending::failed(session_closed()),
        }
    }
}

fn session_closed() -> NineError {
    NineError::Connect("session closed".into())
}

/// Split a slash-separated path into walk elements.
fn split_path(path: &str) -> Result<Vec<String>> {
    let wnames: Vec<String> = path
        .split('/')
        .filter(|elem| !elem.is_empty())
        .map(str::to_string)
        .collect();
    if wnames.len() > MAXWELEM {
        return Err(NineError::InvalidArgument(format!(
            "{} path elements, at most {} per walk",
            wnames.len(),
            MAXWELEM
        )));
    }
    Ok(wnames)
}

/// Outcome of one queued operation.
///
/// Resolves exactly once, to the operation's result or its error. If the
/// session goes away first it resolves to [`NineError::Connect`].
#[must_use = "the operation's outcome is only observed by awaiting it"]
pub struct Pending<T> {
    inner: PendingInner<T>,
}

enum PendingInner<T> {
    Waiting(oneshot::Receiver<Result<T>>),
    Failed(Option<NineError>),
}

impl<T> Pending<T> {
    fn waiting(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }

    fn failed(err: NineError) -> Self {
        Self {
            inner: PendingInner::Failed(Some(err)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or_else(|_| Err(session_closed()))),
            PendingInner::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or_else(session_closed)))
            }
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// One queued operation with the channel its outcome goes back on.
enum Command {
    Open {
        wnames: Vec<String>,
        name: String,
        mode: OpenMode,
        reply: Reply<Handle>,
    },
    Create {
        wnames: Vec<String>,
        name: String,
        file: String,
        perm: u32,
        mode: OpenMode,
        reply: Reply<Handle>,
    },
    Read {
        fid: u32,
        tag: u16,
        offset: u64,
        count: u32,
        reply: Reply<Bytes>,
    },
    Write {
        fid: u32,
        tag: u16,
        offset: u64,
        data: Bytes,
        reply: Reply<u32>,
    },
    Stat {
        fid: u32,
        tag: u16,
        reply: Reply<Stat>,
    },
    Wstat {
        fid: u32,
        tag: u16,
        stat: Stat,
        reply: Reply<()>,
    },
    Close {
        fid: u32,
        tag: u16,
    },
    Remove {
        fid: u32,
        tag: u16,
        reply: Reply<()>,
    },
    Flush {
        oldtag: u16,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Create { .. } => "create",
            Command::Read { .. } => "read",
            Command::Write { .. } => "write",
            Command::Stat { .. } => "stat",
            Command::Wstat { .. } => "wstat",
            Command::Close { .. } => "close",
            Command::Remove { .. } => "remove",
            Command::Flush { .. } => "flush",
            Command::Shutdown { .. } => "shutdown",
        }
    }

    /// Resolve without touching the wire.
    fn reject(self, err: NineError) {
        match self {
            Command::Open { reply, .. } | Command::Create { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Read { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Write { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Stat { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Wstat { reply, .. }
            | Command::Remove { reply, .. }
            | Command::Flush { reply, .. }
            | Command::Shutdown { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::Close { .. } => {}
        }
    }
}

/// Connection state plus the sink that hears about every change.
struct StateTracker {
    tx: watch::Sender<ConnectionState>,
    sink: Arc<dyn EventSink>,
}

impl StateTracker {
    fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply a transition. Illegal transitions are ignored.
    fn set(&self, next: ConnectionState) -> bool {
        let current = self.get();
        if !current.can_transition_to(next) {
            tracing::debug!("ignoring state change {:?} -> {:?}", current, next);
            return false;
        }

        self.tx.send_replace(next);
        tracing::info!("session state {:?} -> {:?}", current, next);
        self.sink.state_changed(next);
        if next == ConnectionState::Ready {
            self.sink.ready();
        }
        true
    }

    fn fail(&self, err: &NineError) {
        if self.set(ConnectionState::Failed) {
            tracing::error!("session failed: {}", err);
            self.sink.failed(err);
        }
    }
}

/// Sole owner of the connection and the handle table.
struct Worker<S> {
    conn: Connection<S>,
    table: HandleTable,
    commands: mpsc::UnboundedReceiver<Command>,
    state: StateTracker,
    open: Arc<AtomicUsize>,
    msize: u32,
    /// Set once a fatal error has ended the session.
    failure: Option<String>,
    shutdown_reply: Option<Reply<()>>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if self.execute(command).await.is_break() {
                break;
            }
        }
        self.teardown().await;
    }

    async fn execute(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Open {
                wnames,
                name,
                mode,
                reply,
            } => {
                let result = self
                    .establish(name, wnames, |fid| Tmessage::Open { fid, mode })
                    .await;
                self.resolve(reply, result)
            }
            Command::Create {
                wnames,
                name,
                file,
                perm,
                mode,
                reply,
            } => {
                let result = self
                    .establish(name, wnames, |fid| Tmessage::Create {
                        fid,
                        name: file,
                        perm,
                        mode,
                    })
                    .await;
                self.resolve(reply, result)
            }
            Command::Read {
                fid,
                tag,
                offset,
                count,
                reply,
            } => {
                let result = self.read(fid, tag, offset, count).await;
                self.resolve(reply, result)
            }
            Command::Write {
                fid,
                tag,
                offset,
                data,
                reply,
            } => {
                let result = self.write(fid, tag, offset, data).await;
                self.resolve(reply, result)
            }
            Command::Stat { fid, tag, reply } => {
                let result = self.stat(fid, tag).await;
                self.resolve(reply, result)
            }
            Command::Wstat {
                fid,
                tag,
                stat,
                reply,
            } => {
                let result = self.wstat(fid, tag, stat).await;
                self.resolve(reply, result)
            }
            Command::Close { fid, tag } => match self.close(fid, tag).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) if err.is_fatal() => {
                    self.fail(&err);
                    ControlFlow::Break(())
                }
                Err(err) => {
                    tracing::warn!("close of fid {} not sent: {}", fid, err);
                    ControlFlow::Continue(())
                }
            },
            Command::Remove { fid, tag, reply } => {
                let result = self.remove(fid, tag).await;
                self.resolve(reply, result)
            }
            Command::Flush { oldtag, reply } => {
                let result = self.flush(oldtag).await;
                self.resolve(reply, result)
            }
            Command::Shutdown { reply } => {
                self.shutdown_reply = Some(reply);
                ControlFlow::Break(())
            }
        }
    }

    /// Hand a result back to its caller; a fatal error also ends the loop.
    fn resolve<T>(&mut self, reply: Reply<T>, result: Result<T>) -> ControlFlow<()> {
        match result {
            Err(err) if err.is_fatal() => {
                self.fail(&err);
                let _ = reply.send(Err(err));
                ControlFlow::Break(())
            }
            result => {
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
        }
    }

    fn fail(&mut self, err: &NineError) {
        self.state.fail(err);
        self.failure = Some(err.to_string());
    }

    /// Fail whatever is still queued, drop all handles, close the stream.
    async fn teardown(&mut self) {
        self.commands.close();
        let reason = match &self.failure {
            Some(cause) => format!("session failed: {}", cause),
            None => "session shut down".to_string(),
        };
        while let Ok(command) = self.commands.try_recv() {
            tracing::warn!("dropping queued {}: {}", command.name(), reason);
            command.reject(NineError::Connect(reason.clone()));
        }

        self.table.clear();
        self.sync_open_count();

        if self.failure.is_none() {
            if let Err(e) = self.conn.shutdown().await {
                tracing::warn!("stream shutdown failed: {}", e);
            }
            self.state.set(ConnectionState::Disconnected);
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    fn sync_open_count(&self) {
        self.open.store(self.table.open_count(), Ordering::Release);
    }

    /// Allocate a fid and tag, walk from the root, then open or create.
    async fn establish(
        &mut self,
        name: String,
        wnames: Vec<String>,
        finish: impl FnOnce(u32) -> Tmessage,
    ) -> Result<Handle> {
        let fid = self.table.alloc_fid()?;
        let tag = match self.table.alloc_tag() {
            Ok(tag) => tag,
            Err(err) => {
                self.table.release_fid(fid);
                return Err(err);
            }
        };

        match self.walk_then(fid, tag, wnames, finish(fid)).await {
            Ok((qid, iounit)) => {
                let iounit = self.effective_iounit(iounit);
                self.table.insert(
                    fid,
                    OpenEntry {
                        name: name.clone(),
                        tag,
                        iounit,
                    },
                );
                self.sync_open_count();
                tracing::debug!("opened {:?} as fid {} (iounit {})", name, fid, iounit);
                Ok(Handle::new(name, fid, tag, iounit, qid))
            }
            Err(err) => {
                self.table.release_tag(tag);
                self.table.release_fid(fid);
                Err(err)
            }
        }
    }

    async fn walk_then(
        &mut self,
        fid: u32,
        tag: u16,
        wnames: Vec<String>,
        request: Tmessage,
    ) -> Result<(Qid, u32)> {
        let requested = wnames.len();
        let walk = Tmessage::Walk {
            fid: ROOT_FID,
            newfid: fid,
            wnames,
        };
        let walked = match self.conn.transact(tag, &walk).await? {
            Rmessage::Walk { wqids } => wqids.len(),
            other => return Err(unexpected("Rwalk", &other)),
        };
        if walked != requested {
            self.clunk(tag, fid).await?;
            return Err(NineError::WalkIncomplete { requested, walked });
        }

        let reply = match self.conn.transact(tag, &request).await {
            Ok(reply) => reply,
            Err(err) if !err.is_fatal() => {
                self.clunk(tag, fid).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        match (&request, reply) {
            (Tmessage::Open { .. }, Rmessage::Open { qid, iounit })
            | (Tmessage::Create { .. }, Rmessage::Create { qid, iounit }) => Ok((qid, iounit)),
            (_, other) => Err(unexpected("Ropen or Rcreate", &other)),
        }
    }

    /// Server iounit, or what fits in one message when it gives none.
    fn effective_iounit(&self, iounit: u32) -> u32 {
        let ceiling = self.msize - IOHDRSZ;
        if iounit == 0 || iounit > ceiling {
            ceiling
        } else {
            iounit
        }
    }

    /// Clunk a fid. An Rerror only means the server had already forgotten it.
    async fn clunk(&mut self, tag: u16, fid: u32) -> Result<()> {
        match self.conn.transact(tag, &Tmessage::Clunk { fid }).await {
            Ok(Rmessage::Clunk) => Ok(()),
            Ok(other) => Err(unexpected("Rclunk", &other)),
            Err(NineError::Protocol(ename)) => {
                tracing::warn!("Tclunk of fid {} rejected: {}", fid, ename);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reject handles that are not open on this session. Returns the iounit.
    fn check_open(&self, fid: u32, tag: u16) -> Result<u32> {
        match self.table.get(fid) {
            Some(entry) if entry.tag == tag => Ok(entry.iounit),
            _ => Err(NineError::InvalidArgument(format!(
                "fid {} is not open on this session",
                fid
            ))),
        }
    }

    async fn read(&mut self, fid: u32, tag: u16, offset: u64, count: u32) -> Result<Bytes> {
        let count = count.min(self.check_open(fid, tag)?);
        let request = Tmessage::Read { fid, offset, count };
        match self.conn.transact(tag, &request).await? {
            Rmessage::Read { data } if data.len() <= count as usize => Ok(data),
            Rmessage::Read { data } => Err(NineError::Decode(format!(
                "Rread returned {} bytes for a count of {}",
                data.len(),
                count
            ))),
            other => Err(unexpected("Rread", &other)),
        }
    }

    async fn write(&mut self, fid: u32, tag: u16, offset: u64, data: Bytes) -> Result<u32> {
        self.check_open(fid, tag)?;
        let request = Tmessage::Write { fid, offset, data };
        match self.conn.transact(tag, &request).await? {
            Rmessage::Write { count } => Ok(count),
            other => Err(unexpected("Rwrite", &other)),
        }
    }

    async fn stat(&mut self, fid: u32, tag: u16) -> Result<Stat> {
        self.check_open(fid, tag)?;
        match self.conn.transact(tag, &Tmessage::Stat { fid }).await? {
            Rmessage::Stat { stat } => Ok(stat),
            other => Err(unexpected("Rstat", &other)),
        }
    }

    async fn wstat(&mut self, fid: u32, tag: u16, stat: Stat) -> Result<()> {
        self.check_open(fid, tag)?;
        match self.conn.transact(tag, &Tmessage::Wstat { fid, stat }).await? {
            Rmessage::Wstat => Ok(()),
            other => Err(unexpected("Rwstat", &other)),
        }
    }

    /// The handle leaves the table before Tclunk is written.
    async fn close(&mut self, fid: u32, tag: u16) -> Result<()> {
        self.check_open(fid, tag)?;
        let entry = self.table.remove(fid).ok_or_else(|| {
            NineError::InvalidArgument(format!("fid {} is not open on this session", fid))
        })?;
        self.sync_open_count();
        tracing::debug!("closing {:?} (fid {})", entry.name, fid);

        let tag = self.table.alloc_tag()?;
        let result = self.clunk(tag, fid).await;
        self.table.release_tag(tag);
        result
    }

    async fn remove(&mut self, fid: u32, tag: u16) -> Result<()> {
        self.check_open(fid, tag)?;
        let result = self.conn.transact(tag, &Tmessage::Remove { fid }).await;

        // Tremove clunks the fid even when the remove itself fails
        self.table.remove(fid);
        self.sync_open_count();

        match result? {
            Rmessage::Remove => Ok(()),
            other => Err(unexpected("Rremove", &other)),
        }
    }

    async fn flush(&mut self, oldtag: u16) -> Result<()> {
        let tag = self.table.alloc_tag()?;
        let result = self.conn.transact(tag, &Tmessage::Flush { oldtag }).await;
        self.table.release_tag(tag);

        match result? {
            Rmessage::Flush => Ok(()),
            other => Err(unexpected("Rflush", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_request, encode_response, QidType};
    use crate::transport::StreamConnector;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct MockServer {
        stream: DuplexStream,
    }

    impl MockServer {
        async fn expect(&mut self) -> (u16, Tmessage) {
            let mut size = [0u8; 4];
            self.stream.read_exact(&mut size).await.unwrap();
            let mut raw = size.to_vec();
            raw.resize(u32::from_le_bytes(size) as usize, 0);
            self.stream.read_exact(&mut raw[4..]).await.unwrap();
            decode_request(&raw).unwrap()
        }

        async fn reply(&mut self, tag: u16, msg: Rmessage) {
            let bytes = encode_response(tag, &msg).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn handshake(&mut self, msize: u32) {
            let (tag, msg) = self.expect().await;
            assert_eq!(tag, 0);
            assert!(matches!(msg, Tmessage::Version { .. }));
            self.reply(
                tag,
                Rmessage::Version {
                    msize,
                    version: "9P2000".into(),
                },
            )
            .await;

            let (tag, msg) = self.expect().await;
            assert!(matches!(
                msg,
                Tmessage::Attach { fid: 0, afid: NOFID, .. }
            ));
            self.reply(tag, Rmessage::Attach { qid: dir_qid() }).await;
        }

        /// Answer a walk of `n` elements and the following Topen.
        async fn open(&mut self, iounit: u32) -> u32 {
            let (tag, msg) = self.expect().await;
            let (newfid, n) = match msg {
                Tmessage::Walk { newfid, wnames, .. } => (newfid, wnames.len()),
                other => panic!("expected Twalk, got {:?}", other),
            };
            self.reply(tag, Rmessage::Walk { wqids: vec![file_qid(); n] }).await;

            let (tag, msg) = self.expect().await;
            assert!(matches!(msg, Tmessage::Open { fid, .. } if fid == newfid));
            self.reply(tag, Rmessage::Open { qid: file_qid(), iounit }).await;
            newfid
        }
    }

    fn dir_qid() -> Qid {
        Qid::new(QidType::DIR, 0, 1)
    }

    fn file_qid() -> Qid {
        Qid::new(QidType::empty(), 0, 2)
    }

    #[derive(Default)]
    struct RecordingSink {
        states: Mutex<Vec<ConnectionState>>,
        ready: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn state_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }

        fn ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn failed(&self, error: &NineError) {
            self.failures.lock().unwrap().push(error.to_string());
        }
    }

    async fn connected(msize: u32) -> (Session, MockServer) {
        let (client, server) = duplex(64 * 1024);
        let mut server = MockServer { stream: server };
        let (session, ()) = tokio::join!(
            Session::builder().connect(StreamConnector::new(client)),
            server.handshake(msize)
        );
        (session.unwrap(), server)
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/usr//glenda/").unwrap(), vec!["usr", "glenda"]);
        assert!(split_path("").unwrap().is_empty());
        assert!(split_path("/").unwrap().is_empty());

        let deep = vec!["d"; MAXWELEM + 1].join("/");
        assert!(matches!(split_path(&deep), Err(NineError::InvalidArgument(_))));
        let limit = vec!["d"; MAXWELEM].join("/");
        assert_eq!(split_path(&limit).unwrap().len(), MAXWELEM);
    }

    #[test]
    fn test_config_defaults_and_json() {
        let config = SessionConfig::default();
        assert_eq!(config.msize, 8192);
        assert_eq!(config.version, "9P2000");
        assert_eq!(config.max_fids, DEFAULT_MAX_FIDS);

        let parsed = SessionConfig::from_json(r#"{"aname": "/srv", "max_fids": 8}"#).unwrap();
        assert_eq!(parsed.aname, "/srv");
        assert_eq!(parsed.max_fids, 8);
        assert_eq!(parsed.msize, 8192);

        assert!(matches!(
            SessionConfig::from_json("{ not json"),
            Err(NineError::Config(_))
        ));
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Session::builder()
            .msize(16384)
            .version("9P2000")
            .uname("glenda")
            .aname("main")
            .max_fids(64)
            .read_buffer_size(4096);

        let config = builder.config();
        assert_eq!(config.msize, 16384);
        assert_eq!(config.uname, "glenda");
        assert_eq!(config.aname, "main");
        assert_eq!(config.max_fids, 64);
        assert_eq!(config.read_buffer_size, 4096);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_connect() {
        let (client, _server) = duplex(64);
        let result = Session::builder()
            .msize(IOHDRSZ)
            .connect(StreamConnector::new(client))
            .await;
        assert!(matches!(result, Err(NineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_pending_failed_resolves_once() {
        let pending: Pending<()> = Pending::failed(NineError::Exhausted("tag"));
        assert!(matches!(pending.await, Err(NineError::Exhausted("tag"))));
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (client, server) = duplex(4096);
        let mut server = MockServer { stream: server };
        let sink = Arc::new(RecordingSink::default());

        let (session, ()) = tokio::join!(
            Session::builder()
                .msize(16384)
                .event_sink(sink.clone())
                .connect(StreamConnector::new(client)),
            server.handshake(8192)
        );
        let session = session.unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        // The server's smaller msize wins
        assert_eq!(session.msize(), 8192);
        assert_eq!(
            *sink.states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::VersionNegotiating,
                ConnectionState::Attaching,
                ConnectionState::Ready,
            ]
        );
        assert_eq!(sink.ready.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_session() {
        let (client, server) = duplex(4096);
        let mut server = MockServer { stream: server };
        let sink = Arc::new(RecordingSink::default());

        let script = async {
            let (tag, _) = server.expect().await;
            server
                .reply(
                    tag,
                    Rmessage::Version {
                        msize: 8192,
                        version: "unknown".into(),
                    },
                )
                .await;
        };
        let (result, ()) = tokio::join!(
            Session::builder()
                .event_sink(sink.clone())
                .connect(StreamConnector::new(client)),
            script
        );

        assert!(matches!(result, Err(NineError::Connect(_))));
        assert_eq!(sink.states.lock().unwrap().last(), Some(&ConnectionState::Failed));
        assert_eq!(sink.failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_rerror_fails_session() {
        let (client, server) = duplex(4096);
        let mut server = MockServer { stream: server };

        let script = async {
            let (tag, _) = server.expect().await;
            server
                .reply(
                    tag,
                    Rmessage::Version {
                        msize: 8192,
                        version: "9P2000".into(),
                    },
                )
                .await;
            let (tag, _) = server.expect().await;
            server
                .reply(
                    tag,
                    Rmessage::Error {
                        ename: "unknown user".into(),
                    },
                )
                .await;
        };
        let (result, ()) = tokio::join!(
            Session::builder().connect(StreamConnector::new(client)),
            script
        );

        match result {
            Err(NineError::Connect(msg)) => assert!(msg.contains("unknown user")),
            other => panic!("expected connect error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_iounit_zero_falls_back_to_msize() {
        let (session, mut server) = connected(8192).await;

        let pending = session.open("lib/motd", OpenMode::READ);
        server.open(0).await;
        let handle = pending.await.unwrap();

        assert_eq!(handle.iounit(), 8168);
        assert_eq!(handle.name(), "lib/motd");
        assert_eq!(session.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_read_count_clamped_to_iounit() {
        let (session, mut server) = connected(8192).await;

        let pending = session.open("big", OpenMode::READ);
        server.open(512).await;
        let handle = pending.await.unwrap();

        let read = session.read(&handle, 0, 100_000);
        let (tag, msg) = server.expect().await;
        assert_eq!(
            msg,
            Tmessage::Read {
                fid: handle.fid(),
                offset: 0,
                count: 512
            }
        );
        assert_eq!(tag, handle.tag());
        server
            .reply(tag, Rmessage::Read { data: Bytes::from_static(b"hello") })
            .await;
        assert_eq!(read.await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_rclunk() {
        let (session, mut server) = connected(8192).await;

        let pending = session.open("tmp/x", OpenMode::RDWR);
        let fid = server.open(0).await;
        let handle = pending.await.unwrap();

        session.close(handle).unwrap();
        let (tag, msg) = server.expect().await;
        assert_eq!(msg, Tmessage::Clunk { fid });
        // Already gone from the table while the Rclunk is outstanding
        assert_eq!(session.open_handles(), 0);
        server.reply(tag, Rmessage::Clunk).await;

        // The fid is reused by the next open
        let pending = session.open("tmp/y", OpenMode::READ);
        assert_eq!(server.open(0).await, fid);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_rejects_later_ops() {
        let (session, _server) = connected(8192).await;

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            session.open("a", OpenMode::READ).await,
            Err(NineError::NotReady(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_flush_uses_fresh_tag() {
        let (session, mut server) = connected(8192).await;

        let pending = session.open("slow", OpenMode::READ);
        server.open(0).await;
        let handle = pending.await.unwrap();

        let flush = session.flush(&handle);
        let (tag, msg) = server.expect().await;
        assert_eq!(msg, Tmessage::Flush { oldtag: handle.tag() });
        assert_ne!(tag, handle.tag());
        server.reply(tag, Rmessage::Flush).await;
        flush.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_handle_from_another_session() {
        let (session, mut server) = connected(8192).await;

        let pending = session.open("mine", OpenMode::READ);
        let fid = server.open(0).await;
        let handle = pending.await.unwrap();

        // Same fid, different tag: not this session's handle
        let stranger = Handle::new("theirs".into(), fid, handle.tag() + 1, 8168, Qid::default());
        session.close(stranger).unwrap();

        // Nothing was clunked: the next request on the wire is this stat
        let stat = session.stat(&handle);
        let (tag, msg) = server.expect().await;
        assert_eq!(msg, Tmessage::Stat { fid });
        assert_eq!(session.open_handles(), 1);
        server
            .reply(
                tag,
                Rmessage::Stat {
                    stat: Stat::default().sized(),
                },
            )
            .await;
        stat.await.unwrap();
    }
}
