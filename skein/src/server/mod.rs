//! Servers built on series.
//!
//! Every request becomes a [`ServerTask`] at the head of its own series. The
//! process callback fills the response, or pushes follow-up tasks onto
//! [`series_of`](crate::series_of) that finish it through
//! [`ServerTask::reply`]. The response is written once that series drained.
//!
//! [`HttpServer`] and [`RedisServer`] share the machinery; a
//! [`ServerProtocol`] supplies the wire format.

use crate::error::{Error, Result};
use crate::protocol::{Http, HttpResponse, Redis};
use crate::reactor::net::{TcpListener, TcpStream};
use crate::reactor::time::{Sleep, timeout};
use crate::runtime::Handle;
use crate::runtime::cancel::AbortSignal;
use crate::runtime::outstanding::Outstanding;
use crate::task::{Fault, Series, State, Task, TaskKind};
use crate::utils::ScopeGuard;
use anyhow::anyhow;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use futures::select_biased;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Pause after a failed `accept`, e.g. out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerParams {
    /// Connections over this limit are closed as soon as they are accepted.
    pub max_connections: usize,

    /// Requests larger than this are answered with 413 and the connection
    /// is closed.
    pub request_size_limit: usize,

    /// How long an idle connection waits for its next request.
    pub keep_alive_timeout: Duration,

    /// Bounds each read while a request is partially received.
    pub receive_timeout: Option<Duration>,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            max_connections: 2000,
            request_size_limit: usize::MAX,
            keep_alive_timeout: Duration::from_secs(60),
            receive_timeout: None,
        }
    }
}

mod protocols;
pub use protocols::HttpFraming;

/// Why a request is answered without, or despite, its process callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The request could not be parsed.
    Malformed,
    /// Over [`ServerParams::request_size_limit`].
    TooLarge,
    /// The rest of a partial request did not arrive in time.
    Timeout,
    /// The engine or the server is going away.
    Unavailable,
    /// The request's series failed, e.g. the process callback panicked.
    Failed,
}

/// Server side of a wire protocol.
pub trait ServerProtocol: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Default + fmt::Debug + Send + Sync + 'static;

    /// What answering a request needs to know about it once the request
    /// itself moved into its task.
    type Framing: Copy + Default + Send + 'static;

    /// Parses the next request off `buf`, with the bytes it used. `Ok(None)`
    /// asks for more.
    fn parse_request(buf: &[u8]) -> Result<Option<(Self::Request, usize)>, Rejection>;

    /// Full size of the request being received, as soon as its head says.
    fn announced_size(_buf: &[u8]) -> Option<usize> {
        None
    }

    fn framing(req: &Self::Request) -> Self::Framing;

    /// Whether the connection stays open after the answer.
    fn keep_alive(_framing: Self::Framing) -> bool {
        true
    }

    /// What the process callback starts from.
    fn initial_response() -> Self::Response {
        Self::Response::default()
    }

    fn rejection(reason: Rejection) -> Self::Response;

    fn encode_response(resp: &Self::Response, framing: Self::Framing, keep_alive: bool, out: &mut Vec<u8>);
}

type Process<P> = Arc<dyn Fn(&mut ServerTask<P>) + Send + Sync>;

#[derive(Debug, Default)]
struct ReplyState<R> {
    resp: R,
    noreply: bool,
}

/// The response of a request being served, shared with the tasks that
/// complete it after the process callback returned.
#[derive(Debug, Default)]
pub struct Reply<R = HttpResponse>(Arc<Mutex<ReplyState<R>>>);

impl<R> Clone for Reply<R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<R: Default> Reply<R> {
    pub fn with<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.0.lock().resp)
    }

    /// Closes the connection without answering.
    pub fn set_noreply(&self) {
        self.0.lock().noreply = true;
    }

    pub fn is_noreply(&self) -> bool {
        self.0.lock().noreply
    }

    fn take(&self) -> ReplyState<R> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Runs the server's process callback on one request.
pub struct Serve<P: ServerProtocol = Http> {
    process: Process<P>,
    reply: Reply<P::Response>,
    seq: u64,
    peer: SocketAddr,
}

impl<P: ServerProtocol> fmt::Debug for Serve<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serve")
            .field("seq", &self.seq)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl<P: ServerProtocol> TaskKind for Serve<P> {
    type Request = P::Request;
    type Response = P::Response;

    fn execute<'a>(task: &'a mut Task<Self>, _handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        let process = Arc::clone(&task.kind.process);

        Box::pin(async move {
            task.resp = P::initial_response();
            process(task);
            Ok(())
        })
    }

    fn on_complete(task: &mut Task<Self>) {
        let resp = match task.state() {
            State::Success => task.take_resp(),
            State::Aborted => P::rejection(Rejection::Unavailable),
            _ => P::rejection(Rejection::Failed),
        };

        task.kind.reply.with(|reply| *reply = resp);
    }
}

pub type ServerTask<P = Http> = Task<Serve<P>>;

impl<P: ServerProtocol> Task<Serve<P>> {
    /// Index of this request on its connection, starting at 0.
    pub fn task_seq(&self) -> u64 {
        self.kind.seq
    }

    pub fn reply(&self) -> Reply<P::Response> {
        self.kind.reply.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.kind.peer
    }
}

struct Shared<P: ServerProtocol> {
    params: ServerParams,
    process: Process<P>,
    stop: Arc<AbortSignal>,

    /// The accept loop plus one per open connection.
    active: Outstanding,
}

impl<P: ServerProtocol> Shared<P> {
    fn is_stopping(&self) -> bool {
        self.stop.is_fired()
    }
}

struct Running<P: ServerProtocol> {
    local_addr: SocketAddr,
    shared: Arc<Shared<P>>,
}

/// A server speaking `P`, running on an engine.
pub struct Server<P: ServerProtocol> {
    handle: Handle,
    params: ServerParams,
    process: Process<P>,
    running: Mutex<Option<Running<P>>>,
}

/// HTTP/1.1 server.
pub type HttpServer = Server<Http>;

/// Server speaking RESP, answering each command with a
/// [`RedisValue`](crate::protocol::RedisValue).
pub type RedisServer = Server<Redis>;

impl<P: ServerProtocol> Server<P> {
    /// A server on the current engine. Nothing is bound until
    /// [`Server::start`].
    pub fn new<F>(params: ServerParams, process: F) -> Self
    where
        F: Fn(&mut ServerTask<P>) + Send + Sync + 'static,
    {
        Self::with_handle(&Handle::current(), params, process)
    }

    pub fn with_handle<F>(handle: &Handle, params: ServerParams, process: F) -> Self
    where
        F: Fn(&mut ServerTask<P>) + Send + Sync + 'static,
    {
        Self {
            handle: handle.clone(),
            params,
            process: Arc::new(process),
            running: Mutex::new(None),
        }
    }

    /// Listens on every interface at `port`.
    pub fn start(&self, port: u16) -> Result<()> {
        self.start_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn start_on(&self, addr: SocketAddr) -> Result<()> {
        if self.handle.is_closed() {
            return Err(Error::EngineClosed);
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::Other(anyhow!("server already started")));
        }

        let listener = TcpListener::bind(self.handle.reactor(), addr)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            params: self.params,
            process: Arc::clone(&self.process),
            stop: Arc::new(AbortSignal::new()),
            active: Outstanding::new(),
        });

        shared.active.acquire();
        self.handle
            .spawn(accept_loop(listener, Arc::clone(&shared), self.handle.clone()));

        debug!(%local_addr, "server listening");
        *running = Some(Running { local_addr, shared });
        Ok(())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Stops accepting. Idle connections close; requests in flight are
    /// still answered.
    pub fn shutdown(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.shared.stop.fire();
        }
    }

    /// Blocks until the accept loop and every connection are gone.
    ///
    /// # Panics
    ///
    /// On one of the engine's worker threads.
    pub fn wait_finish(&self) {
        let shared = self.running.lock().as_ref().map(|r| Arc::clone(&r.shared));
        let Some(shared) = shared else {
            return;
        };

        self.handle.assert_not_worker("Server::wait_finish");
        shared.active.wait();
        *self.running.lock() = None;
    }

    pub fn stop(&self) {
        self.shutdown();
        self.wait_finish();
    }
}

impl<P: ServerProtocol> Drop for Server<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: ServerProtocol> fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &std::any::type_name::<P>())
            .field("params", &self.params)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

async fn accept_loop<P: ServerProtocol>(listener: TcpListener, shared: Arc<Shared<P>>, handle: Handle) {
    let _done = ScopeGuard::new(|| shared.active.release());
    let mut stop = shared.stop.listen().fuse();
    let mut abort = handle.abort_listener().fuse();

    loop {
        let accepted = {
            let mut accept = pin!(listener.accept().fuse());
            select_biased! {
                _ = stop => break,
                _ = abort => break,
                res = accept => res,
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                // `active` counts this loop too.
                if shared.active.get() > shared.params.max_connections {
                    warn!(%peer, max = shared.params.max_connections, "too many connections, closing");
                    let _ = stream.shutdown();
                    continue;
                }

                trace!(%peer, "connection accepted");
                shared.active.acquire();
                handle.spawn(serve_connection(stream, peer, Arc::clone(&shared), handle.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                Sleep::new(handle.reactor(), ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("server stopped accepting");
}

enum Incoming<R> {
    Request(R),
    Reject(Rejection),
    Closed,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    chunk: Vec<u8>,
}

impl Connection {
    /// Waits for the next complete request.
    async fn next_request<P: ServerProtocol>(&mut self, shared: &Shared<P>, handle: &Handle) -> Incoming<P::Request> {
        let limit = shared.params.request_size_limit;
        let mut stop = shared.stop.listen().fuse();

        loop {
            match P::parse_request(&self.buf) {
                Ok(Some((req, used))) if used <= limit => {
                    self.buf.drain(..used);
                    return Incoming::Request(req);
                }
                Ok(Some(_)) => return Incoming::Reject(Rejection::TooLarge),
                Ok(None) => {}
                Err(reason) => {
                    debug!(peer = %self.peer, ?reason, "bad request");
                    return Incoming::Reject(reason);
                }
            }

            if self.buf.len() > limit || P::announced_size(&self.buf).is_some_and(|n| n > limit) {
                return Incoming::Reject(Rejection::TooLarge);
            }

            let idle = self.buf.is_empty();
            let wait = if idle {
                Some(shared.params.keep_alive_timeout)
            } else {
                shared.params.receive_timeout
            };

            let read = timeout(handle.reactor(), wait, self.stream.read(&mut self.chunk));

            // A request already on its way is still served after a stop.
            let read = if idle {
                let mut read = pin!(read.fuse());
                select_biased! {
                    _ = stop => return Incoming::Closed,
                    res = read => res,
                }
            } else {
                read.await
            };

            match read {
                Err(_) if idle => return Incoming::Closed,
                Err(_) => return Incoming::Reject(Rejection::Timeout),
                Ok(Err(e)) => {
                    trace!(peer = %self.peer, error = %e, "read failed");
                    return Incoming::Closed;
                }
                Ok(Ok(0)) => return Incoming::Closed,
                Ok(Ok(n)) => self.buf.extend_from_slice(&self.chunk[..n]),
            }
        }
    }

    async fn write<P: ServerProtocol>(&self, resp: &P::Response, framing: P::Framing, keep_alive: bool) -> io::Result<()> {
        let mut out = Vec::new();
        P::encode_response(resp, framing, keep_alive, &mut out);
        self.stream.write_all(&out).await
    }

    /// Answers without running the process callback. The connection closes
    /// afterwards.
    async fn reject<P: ServerProtocol>(&self, reason: Rejection) {
        let resp = P::rejection(reason);
        let _ = self.write::<P>(&resp, P::Framing::default(), false).await;
    }
}

/// Serves requests on one connection until it closes or the server stops.
async fn serve_connection<P: ServerProtocol>(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared<P>>, handle: Handle) {
    let _done = ScopeGuard::new(|| shared.active.release());

    let mut conn = Connection {
        stream,
        peer,
        buf: Vec::new(),
        chunk: vec![0u8; READ_CHUNK],
    };

    let mut seq = 0;

    loop {
        let req = match conn.next_request::<P>(&shared, &handle).await {
            Incoming::Request(req) => req,
            Incoming::Reject(reason) => {
                conn.reject::<P>(reason).await;
                break;
            }
            Incoming::Closed => break,
        };

        let framing = P::framing(&req);

        let reply = Reply::default();
        let task = Task::new(
            Serve {
                process: Arc::clone(&shared.process),
                reply: reply.clone(),
                seq,
                peer,
            },
            req,
        );

        let (tx, rx) = oneshot::channel();
        let series = Series::new(task);
        series.set_callback(move |_| {
            let _ = tx.send(());
        });

        if !handle.launch(series) {
            conn.reject::<P>(Rejection::Unavailable).await;
            break;
        }

        if rx.await.is_err() {
            break;
        }

        let ReplyState { resp, noreply } = reply.take();
        if noreply {
            trace!(%peer, seq, "no reply, closing");
            break;
        }

        let keep_alive = P::keep_alive(framing) && !shared.is_stopping();
        if let Err(e) = conn.write::<P>(&resp, framing, keep_alive).await {
            trace!(%peer, error = %e, "write failed");
            break;
        }

        if !keep_alive {
            break;
        }
        seq += 1;
    }

    let _ = conn.stream.shutdown();
    trace!(%peer, requests = seq, "connection closed");
}
