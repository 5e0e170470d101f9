//! RESP2 client codec.
//!
//! A password in the uri becomes an `AUTH`, a non-zero database path
//! (`redis://host/3`) a `SELECT`, both pipelined ahead of the command.

use crate::protocol::{Protocol, Uri};
use crate::task::{Fault, errors};
use std::fmt::Write as _;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RedisValue {
    #[default]
    Nil,
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<RedisValue>),
}

impl RedisValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, RedisValue::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RedisValue::Error(_))
    }

    /// Bytes of a bulk, status or error reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RedisValue::Bulk(b) => Some(b),
            RedisValue::Status(s) | RedisValue::Error(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RedisValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RedisValue]> {
        match self {
            RedisValue::Array(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisRequest {
    command: String,
    params: Vec<Vec<u8>>,
}

impl Default for RedisRequest {
    fn default() -> Self {
        Self::new("PING", Vec::<Vec<u8>>::new())
    }
}

impl RedisRequest {
    pub fn new<I, P>(command: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn set_request<I, P>(&mut self, command: impl Into<String>, params: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        *self = Self::new(command, params);
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &[Vec<u8>] {
        &self.params
    }
}

fn encode_command<'a>(args: impl ExactSizeIterator<Item = &'a [u8]>, out: &mut Vec<u8>) {
    let mut head = String::new();
    let _ = write!(head, "*{}\r\n", args.len());
    out.extend_from_slice(head.as_bytes());

    for arg in args {
        head.clear();
        let _ = write!(head, "${}\r\n", arg.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Database selected by the uri path, 0 when absent or unparsable.
fn database(uri: &Uri) -> u32 {
    uri.path().trim_start_matches('/').parse().unwrap_or(0)
}

/// Commands sent ahead of the request: `[AUTH?, SELECT?]`.
fn preamble(uri: &Uri) -> Vec<Vec<Vec<u8>>> {
    let mut cmds = Vec::new();

    if let Some(password) = uri.password() {
        let mut auth = vec![b"AUTH".to_vec()];
        if let Some(user) = uri.user() {
            auth.push(user.as_bytes().to_vec());
        }
        auth.push(password.as_bytes().to_vec());
        cmds.push(auth);
    }

    let db = database(uri);
    if db != 0 {
        cmds.push(vec![b"SELECT".to_vec(), db.to_string().into_bytes()]);
    }

    cmds
}

fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, Fault> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Fault::Task(errors::MALFORMED_RESPONSE))
}

/// Parses one value at `pos`. `None` while incomplete.
pub(crate) fn parse_value(buf: &[u8], pos: usize) -> Result<Option<(RedisValue, usize)>, Fault> {
    let Some((line, next)) = read_line(buf, pos) else {
        return Ok(None);
    };
    let Some((&kind, body)) = line.split_first() else {
        return Err(Fault::Task(errors::MALFORMED_RESPONSE));
    };

    let text = || String::from_utf8_lossy(body).into_owned();

    let value = match kind {
        b'+' => (RedisValue::Status(text()), next),
        b'-' => (RedisValue::Error(text()), next),
        b':' => (RedisValue::Integer(parse_int(body)?), next),
        b'$' => {
            let len = parse_int(body)?;
            if len < 0 {
                (RedisValue::Nil, next)
            } else {
                let end = next
                    .checked_add(len as usize)
                    .ok_or(Fault::Task(errors::MALFORMED_RESPONSE))?;
                if buf.len() < end.saturating_add(2) {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(Fault::Task(errors::MALFORMED_RESPONSE));
                }
                (RedisValue::Bulk(buf[next..end].to_vec()), end + 2)
            }
        }
        b'*' => {
            let len = parse_int(body)?;
            if len < 0 {
                (RedisValue::Nil, next)
            } else {
                let mut items = Vec::with_capacity((len as usize).min(1024));
                let mut pos = next;
                for _ in 0..len {
                    let Some((item, after)) = parse_value(buf, pos)? else {
                        return Ok(None);
                    };
                    items.push(item);
                    pos = after;
                }
                (RedisValue::Array(items), pos)
            }
        }
        _ => return Err(Fault::Task(errors::MALFORMED_RESPONSE)),
    };

    Ok(Some(value))
}

/// Parses the next command a client sent, either a multibulk array or an
/// inline line. `None` while incomplete.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(RedisRequest, usize)>, Fault> {
    let malformed = Fault::Task(errors::MALFORMED_RESPONSE);

    if buf.first() != Some(&b'*') {
        let Some((line, next)) = read_line(buf, 0) else {
            return Ok(None);
        };
        let mut words = line
            .split(u8::is_ascii_whitespace)
            .filter(|w| !w.is_empty());

        let command = words.next().ok_or(malformed)?;
        let command = std::str::from_utf8(command).map_err(|_| malformed)?;
        return Ok(Some((RedisRequest::new(command, words.map(<[u8]>::to_vec)), next)));
    }

    let Some((value, used)) = parse_value(buf, 0)? else {
        return Ok(None);
    };
    let RedisValue::Array(items) = value else {
        return Err(malformed);
    };

    let mut args = items.into_iter().map(|item| match item {
        RedisValue::Bulk(arg) => Ok(arg),
        _ => Err(malformed),
    });
    let command = args.next().ok_or(malformed)??;
    let command = String::from_utf8(command).map_err(|_| malformed)?;
    let params = args.collect::<Result<Vec<_>, _>>()?;

    Ok(Some((RedisRequest::new(command, params), used)))
}

/// Serializes a value as a server would send it.
pub fn encode_value(value: &RedisValue, out: &mut Vec<u8>) {
    match value {
        RedisValue::Nil => out.extend_from_slice(b"$-1\r\n"),
        RedisValue::Status(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RedisValue::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RedisValue::Integer(i) => out.extend_from_slice(format!(":{i}\r\n").as_bytes()),
        RedisValue::Bulk(b) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
        RedisValue::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Redis;

impl Protocol for Redis {
    const SCHEME: &'static str = "redis";

    type Request = RedisRequest;
    type Response = RedisValue;

    fn encode(req: &RedisRequest, uri: &Uri, out: &mut Vec<u8>) {
        for cmd in preamble(uri) {
            encode_command(cmd.iter().map(Vec::as_slice), out);
        }

        let args = std::iter::once(req.command.as_bytes()).chain(req.params.iter().map(Vec::as_slice));
        let args: Vec<&[u8]> = args.collect();
        encode_command(args.into_iter(), out);
    }

    fn decode(_req: &RedisRequest, uri: &Uri, buf: &[u8], _eof: bool) -> Result<Option<RedisValue>, Fault> {
        let skip = preamble(uri).len();
        let mut pos = 0;

        for _ in 0..skip {
            let Some((reply, next)) = parse_value(buf, pos)? else {
                return Ok(None);
            };
            if reply.is_error() {
                return Err(Fault::Task(errors::REDIS_ACCESS_DENIED));
            }
            pos = next;
        }

        Ok(parse_value(buf, pos)?.map(|(value, _)| value))
    }
}
