//! Minimal HTTP/1.1 framing for the client task and the server.
//!
//! Bodies are framed by `Content-Length`, `Transfer-Encoding: chunked`, or
//! (responses only) connection close. No other transfer coding is decoded.

use crate::protocol::{Protocol, Uri};
use crate::task::{Fault, errors};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum ParseError {
    #[error("malformed message")]
    Malformed,

    #[error("unsupported transfer encoding")]
    UnsupportedEncoding,
}

impl From<ParseError> for Fault {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Malformed => Fault::Task(errors::MALFORMED_RESPONSE),
            ParseError::UnsupportedEncoding => Fault::Task(errors::UNSUPPORTED_ENCODING),
        }
    }
}

type Headers = Vec<(String, String)>;

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Headers, name: &str, value: String) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    headers.push((name.to_owned(), value));
}

fn remove_header(headers: &mut Headers, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target. Client tasks keep it in sync with their uri.
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_owned(),
            target: "/".to_owned(),
            version: "HTTP/1.1".to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl HttpRequest {
    /// Case-insensitive; the first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replaces every header called `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    /// Whether the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection");
        let has = |token: &str| {
            connection.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        };

        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            has("keep-alive")
        } else {
            !has("close")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    /// 0 until a response was received.
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            version: "HTTP/1.1".to_owned(),
            status,
            reason: status_text(status).to_owned(),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = status_text(status).to_owned();
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn find_subslice(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}

struct Head {
    start_line: [String; 3],
    headers: Headers,
    /// Bytes up to and including the blank line.
    len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, ParseError> {
    let Some(end) = find_subslice(buf, b"\r\n\r\n") else {
        return Ok(None);
    };

    let text = std::str::from_utf8(&buf[..end]).map_err(|_| ParseError::Malformed)?;
    let mut lines = text.split("\r\n");

    let start = lines.next().ok_or(ParseError::Malformed)?;
    let mut parts = start.splitn(3, ' ');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().ok_or(ParseError::Malformed)?;
    let third = parts.next().unwrap_or_default();

    if first.is_empty() || second.is_empty() {
        return Err(ParseError::Malformed);
    }

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(ParseError::Malformed)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::Malformed);
        }
        headers.push((name.to_owned(), value.trim().to_owned()));
    }

    Ok(Some(Head {
        start_line: [first.to_owned(), second.to_owned(), third.to_owned()],
        headers,
        len: end + 4,
    }))
}

enum Framing {
    None,
    Length(usize),
    Chunked,
    Close,
}

fn framing(headers: &Headers, close_delimited: bool) -> Result<Framing, ParseError> {
    if let Some(te) = find_header(headers, "Transfer-Encoding") {
        return if te.trim().eq_ignore_ascii_case("chunked") {
            Ok(Framing::Chunked)
        } else {
            Err(ParseError::UnsupportedEncoding)
        };
    }

    match find_header(headers, "Content-Length") {
        Some(len) => len
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| ParseError::Malformed),
        None if close_delimited => Ok(Framing::Close),
        None => Ok(Framing::None),
    }
}

enum Scan {
    /// Bytes consumed by the whole body, trailers included.
    Complete(usize),
    /// Length `buf` must reach before the scan can get further.
    Need(usize),
}

/// Walks the chunk framing of `buf`, appending chunk data to `body` if given.
fn scan_chunked(buf: &[u8], mut body: Option<&mut Vec<u8>>) -> Result<Scan, ParseError> {
    let more = buf.len().saturating_add(1);
    let mut pos = 0;

    loop {
        let Some(line_len) = find_subslice(&buf[pos..], b"\r\n") else {
            return Ok(Scan::Need(more));
        };

        let line = std::str::from_utf8(&buf[pos..pos + line_len]).map_err(|_| ParseError::Malformed)?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| ParseError::Malformed)?;
        pos += line_len + 2;

        if size == 0 {
            // Trailers end with an empty line.
            loop {
                let Some(line_len) = find_subslice(&buf[pos..], b"\r\n") else {
                    return Ok(Scan::Need(more));
                };
                pos += line_len + 2;
                if line_len == 0 {
                    return Ok(Scan::Complete(pos));
                }
            }
        }

        let end = pos.checked_add(size).ok_or(ParseError::Malformed)?;
        let next = end.checked_add(2).ok_or(ParseError::Malformed)?;
        if buf.len() < next {
            return Ok(Scan::Need(next));
        }
        if &buf[end..next] != b"\r\n" {
            return Err(ParseError::Malformed);
        }

        if let Some(body) = body.as_deref_mut() {
            body.extend_from_slice(&buf[pos..end]);
        }
        pos = next;
    }
}

/// Decodes a chunked body. Returns the body and the bytes consumed, trailers
/// included. Nothing is copied until the last chunk arrived.
fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    if let Scan::Need(_) = scan_chunked(buf, None)? {
        return Ok(None);
    }

    let mut body = Vec::new();
    match scan_chunked(buf, Some(&mut body))? {
        Scan::Complete(used) => Ok(Some((body, used))),
        Scan::Need(_) => Ok(None),
    }
}

/// Extracts a body framed as `framing` from `buf`, `None` while incomplete.
fn decode_body(framing: Framing, buf: &[u8], eof: bool) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    match framing {
        Framing::None => Ok(Some((Vec::new(), 0))),
        Framing::Length(len) if buf.len() >= len => Ok(Some((buf[..len].to_vec(), len))),
        Framing::Length(_) => Ok(None),
        Framing::Chunked => decode_chunked(buf),
        Framing::Close if eof => Ok(Some((buf.to_vec(), buf.len()))),
        Framing::Close => Ok(None),
    }
}

/// Head of the final response in `buf`, interim ones skipped. Yields the
/// offset of the head, the head, its status and the body framing.
fn final_head(req: &HttpRequest, buf: &[u8]) -> Result<Option<(usize, Head, u16, Framing)>, ParseError> {
    let mut offset = 0;

    loop {
        let Some(head) = parse_head(&buf[offset..])? else {
            return Ok(None);
        };

        if !head.start_line[0].starts_with("HTTP/") {
            return Err(ParseError::Malformed);
        }
        let status: u16 = head.start_line[1].parse().map_err(|_| ParseError::Malformed)?;

        // Interim responses precede the real one.
        if (100..200).contains(&status) && status != 101 {
            offset += head.len;
            continue;
        }

        let no_body = req.method.eq_ignore_ascii_case("HEAD")
            || status == 101
            || status == 204
            || status == 304;

        let framing = if no_body {
            Framing::None
        } else {
            framing(&head.headers, true)?
        };

        return Ok(Some((offset, head, status, framing)));
    }
}

/// Decodes the response to `req` from everything received so far.
pub(crate) fn decode_response(
    req: &HttpRequest,
    buf: &[u8],
    eof: bool,
) -> Result<Option<HttpResponse>, ParseError> {
    let Some((offset, head, status, framing)) = final_head(req, buf)? else {
        return Ok(None);
    };

    let Some((body, _)) = decode_body(framing, &buf[offset + head.len..], eof)? else {
        return Ok(None);
    };

    let [version, _, reason] = head.start_line;
    Ok(Some(HttpResponse {
        version,
        status,
        reason,
        headers: head.headers,
        body,
    }))
}

/// Length `buf` must reach before [`decode_response`] can complete, given
/// it just came back incomplete. Close-delimited bodies only complete at
/// end of stream.
pub(crate) fn response_needed(req: &HttpRequest, buf: &[u8]) -> usize {
    let more = buf.len().saturating_add(1);
    let Ok(Some((offset, head, _, framing))) = final_head(req, buf) else {
        return more;
    };

    let body_at = offset + head.len;
    match framing {
        Framing::Length(len) => body_at.saturating_add(len),
        Framing::Chunked => match scan_chunked(&buf[body_at..], None) {
            Ok(Scan::Need(n)) => body_at.saturating_add(n),
            _ => more,
        },
        Framing::Close => usize::MAX,
        Framing::None => more,
    }
}

/// Parses one request off the front of `buf`. Returns the request and the
/// bytes it used, `None` while incomplete.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, ParseError> {
    let Some(head) = parse_head(buf)? else {
        return Ok(None);
    };

    let [method, target, version] = head.start_line;
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::Malformed);
    }

    let framing = framing(&head.headers, false)?;
    let Some((body, used)) = decode_body(framing, &buf[head.len..], false)? else {
        return Ok(None);
    };

    Ok(Some((
        HttpRequest {
            method,
            target,
            version,
            headers: head.headers,
            body,
        },
        head.len + used,
    )))
}

/// Size the head of `buf` claims for the whole request, when it can be told
/// from `Content-Length`.
pub(crate) fn announced_request_size(buf: &[u8]) -> Option<usize> {
    let head = parse_head(buf).ok()??;
    match framing(&head.headers, false).ok()? {
        Framing::Length(len) => head.len.checked_add(len),
        _ => None,
    }
}

pub(crate) fn encode_request(req: &HttpRequest, uri: &Uri, out: &mut Vec<u8>) {
    let mut head = String::with_capacity(256);
    let _ = write!(head, "{} {} HTTP/1.1\r\n", req.method, req.target);

    if req.header("Host").is_none() {
        let _ = write!(head, "Host: {}\r\n", uri.host_header());
    }

    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("Connection") || name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }

    let chunked = req
        .header("Transfer-Encoding")
        .is_some_and(|te| te.eq_ignore_ascii_case("chunked"));
    if !chunked && (!req.body.is_empty() || matches!(req.method.as_str(), "POST" | "PUT" | "PATCH")) {
        let _ = write!(head, "Content-Length: {}\r\n", req.body.len());
    }

    // Every task owns its connection.
    head.push_str("Connection: close\r\n\r\n");

    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&req.body);
}

/// Serializes `resp` for the server. `Content-Length` and `Connection` are
/// always computed here, whatever the handler set.
pub(crate) fn encode_response(resp: &HttpResponse, keep_alive: bool, head_only: bool, out: &mut Vec<u8>) {
    let status = if resp.status == 0 { 200 } else { resp.status };
    let reason = if resp.reason.is_empty() {
        status_text(status)
    } else {
        resp.reason.as_str()
    };

    let mut head = String::with_capacity(256);
    let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");

    for (name, value) in &resp.headers {
        if ["Content-Length", "Connection", "Transfer-Encoding"]
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }

    let bodyless = status == 204 || status == 304 || (100..200).contains(&status);
    if !bodyless {
        let _ = write!(head, "Content-Length: {}\r\n", resp.body.len());
    }

    let connection = if keep_alive { "keep-alive" } else { "close" };
    let _ = write!(head, "Connection: {connection}\r\n\r\n");

    out.extend_from_slice(head.as_bytes());
    if !bodyless && !head_only {
        out.extend_from_slice(&resp.body);
    }
}

/// HTTP/1.1 over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http;

impl Protocol for Http {
    const SCHEME: &'static str = "http";

    type Request = HttpRequest;
    type Response = HttpResponse;

    fn prepare(req: &mut HttpRequest, uri: &Uri) {
        req.target = uri.path().to_owned();
    }

    fn encode(req: &HttpRequest, uri: &Uri, out: &mut Vec<u8>) {
        encode_request(req, uri, out);
    }

    fn decode(req: &HttpRequest, _uri: &Uri, buf: &[u8], eof: bool) -> Result<Option<HttpResponse>, Fault> {
        decode_response(req, buf, eof).map_err(Fault::from)
    }

    fn needed(req: &HttpRequest, buf: &[u8]) -> usize {
        response_needed(req, buf)
    }

    fn location(resp: &HttpResponse) -> Option<&str> {
        match resp.status {
            301 | 302 | 303 | 307 | 308 => resp.header("Location"),
            _ => None,
        }
    }

    fn follow(req: &mut HttpRequest, resp: &HttpResponse, to: &Uri) {
        let rewrite_to_get = resp.status == 303
            || (matches!(resp.status, 301 | 302) && req.method.eq_ignore_ascii_case("POST"));

        if rewrite_to_get && !req.method.eq_ignore_ascii_case("HEAD") {
            req.method = "GET".to_owned();
            req.body.clear();
            req.remove_header("Content-Type");
            req.remove_header("Transfer-Encoding");
        }

        if req.header("Host").is_some() {
            req.set_header("Host", to.host_header());
        }
        req.target = to.path().to_owned();
    }
}
