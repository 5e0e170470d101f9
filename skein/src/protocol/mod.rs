//! Network task kinds.
//!
//! A [`Protocol`] turns a request into bytes and bytes back into a response.
//! [`Client`] runs one exchange per attempt on a fresh connection: resolve,
//! connect, send, read until the protocol says the response is complete.

use crate::reactor::net::TcpStream;
use crate::reactor::time::timeout;
use crate::runtime::Handle;
use crate::task::kinds::blocking_io;
use crate::task::{Fault, Task, TaskKind, TimeoutReason, errors};
use futures::future::BoxFuture;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

pub mod http;
pub use http::{Http, HttpRequest, HttpResponse};

pub mod redis;
pub use redis::{Redis, RedisRequest, RedisValue};

mod uri;
pub use uri::Uri;

const READ_CHUNK: usize = 16 * 1024;

/// A request/response protocol spoken over a single TCP connection.
pub trait Protocol: Send + Sync + 'static {
    const SCHEME: &'static str;

    type Request: Send + Sync + 'static;
    type Response: Default + Send + 'static;

    /// Aligns a new request with its target before the first attempt.
    fn prepare(_req: &mut Self::Request, _uri: &Uri) {}

    fn encode(req: &Self::Request, uri: &Uri, out: &mut Vec<u8>);

    /// Decodes the response from everything read so far. `Ok(None)` asks for
    /// more bytes; `eof` is set once the peer closed its side.
    fn decode(req: &Self::Request, uri: &Uri, buf: &[u8], eof: bool) -> Result<Option<Self::Response>, Fault>;

    /// Length `buf` must reach before `decode` can complete, asked after it
    /// came back incomplete. Reads below that mark skip decoding.
    fn needed(_req: &Self::Request, buf: &[u8]) -> usize {
        buf.len().saturating_add(1)
    }

    /// Where the response redirects to, if anywhere.
    fn location(_resp: &Self::Response) -> Option<&str> {
        None
    }

    /// Rewrites `req` to follow a redirect to `to`.
    fn follow(_req: &mut Self::Request, _resp: &Self::Response, _to: &Uri) {}
}

/// Client side of `P`. Build one with
/// [`create_http_task`](crate::create_http_task) or
/// [`create_redis_task`](crate::create_redis_task).
pub struct Client<P> {
    uri: Uri,
    redirect_max: u32,
    redirect_count: u32,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: Protocol> Client<P> {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            redirect_max: 0,
            redirect_count: 0,
            connect_timeout: None,
            send_timeout: None,
            receive_timeout: None,
            _protocol: PhantomData,
        }
    }
}

impl<P> fmt::Debug for Client<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.uri.to_string())
            .field("redirect_count", &self.redirect_count)
            .field("redirect_max", &self.redirect_max)
            .finish_non_exhaustive()
    }
}

impl<P: Protocol> TaskKind for Client<P> {
    type Request = P::Request;
    type Response = P::Response;

    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        Box::pin(async move {
            loop {
                task.resp = exchange(&task.kind, &task.req, handle).await?;

                if task.kind.redirect_count >= task.kind.redirect_max {
                    return Ok(());
                }

                let Some(location) = P::location(&task.resp).map(str::to_owned) else {
                    return Ok(());
                };

                let next = task.kind.uri.join(&location);
                let Some(next) = next.filter(|uri| uri.scheme() == P::SCHEME) else {
                    debug!(task = task.id().as_u64(), %location, "unusable redirect");
                    return Err(Fault::Task(errors::BAD_REDIRECT));
                };

                P::follow(&mut task.req, &task.resp, &next);
                task.kind.redirect_count += 1;

                debug!(
                    task = task.id().as_u64(),
                    from = %task.kind.uri,
                    to = %next,
                    "following redirect"
                );
                task.kind.uri = next;
            }
        })
    }
}

async fn resolve(handle: &Handle, uri: &Uri) -> Result<SocketAddr, Fault> {
    if let Ok(ip) = uri.host().parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, uri.port()));
    }

    let target = (uri.host().to_owned(), uri.port());
    let addrs = blocking_io(handle, move || {
        Ok(target.to_socket_addrs().map(|addrs| addrs.collect::<Vec<_>>()))
    })
    .await?;

    match addrs {
        Ok(addrs) => addrs.into_iter().next().ok_or(Fault::Dns(libc::EAI_NONAME)),
        Err(e) => {
            trace!(host = uri.host(), "resolve failed: {}", e);
            Err(Fault::Dns(libc::EAI_NONAME))
        }
    }
}

/// One attempt: connect, send the request, read the response.
async fn exchange<P: Protocol>(client: &Client<P>, req: &P::Request, handle: &Handle) -> Result<P::Response, Fault> {
    let params = handle.cfg().endpoint_params;
    let reactor = handle.reactor();

    let connect_timeout = client.connect_timeout.or(params.connect_timeout);
    let receive_timeout = client.receive_timeout.or(params.response_timeout);

    let stream = timeout(reactor, connect_timeout, async {
        let addr = resolve(handle, &client.uri).await?;
        trace!(%addr, uri = %client.uri, "connecting");
        TcpStream::connect(reactor, addr).await.map_err(Fault::from)
    })
    .await
    .map_err(|_| Fault::Timeout(TimeoutReason::Connect))??;

    let mut out = Vec::new();
    P::encode(req, &client.uri, &mut out);

    timeout(reactor, client.send_timeout, stream.write_all(&out))
        .await
        .map_err(|_| Fault::Timeout(TimeoutReason::Transmit))??;

    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut needed = 0;

    loop {
        let n = timeout(reactor, receive_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| Fault::Timeout(TimeoutReason::Transmit))??;

        let eof = n == 0;
        buf.extend_from_slice(&chunk[..n]);

        if buf.len() > params.max_response_size {
            return Err(Fault::Task(errors::RESPONSE_TOO_LARGE));
        }

        if !eof && buf.len() < needed {
            continue;
        }

        if let Some(resp) = P::decode(req, &client.uri, &buf, eof)? {
            let _ = stream.shutdown();
            return Ok(resp);
        }

        if eof {
            return Err(Fault::Sys(libc::ECONNRESET));
        }
        needed = P::needed(req, &buf);
    }
}

impl<P: Protocol> Task<Client<P>> {
    pub fn uri(&self) -> &Uri {
        &self.kind.uri
    }

    pub fn redirect_count(&self) -> u32 {
        self.kind.redirect_count
    }

    pub fn set_redirect_max(&mut self, redirect_max: u32) {
        self.kind.redirect_max = redirect_max;
    }

    /// Bounds name resolution plus connect. Overrides
    /// [`EndpointParams::connect_timeout`](crate::EndpointParams).
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.kind.connect_timeout = Some(timeout);
    }

    /// Bounds sending the whole request.
    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.kind.send_timeout = Some(timeout);
    }

    /// Bounds each read while waiting for the response. Overrides
    /// [`EndpointParams::response_timeout`](crate::EndpointParams).
    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.kind.receive_timeout = Some(timeout);
    }
}

pub type HttpTask = Task<Client<Http>>;
pub type RedisTask = Task<Client<Redis>>;
