use super::{Rejection, ServerProtocol};
use crate::protocol::http::{self, Http, HttpRequest, HttpResponse};
use crate::protocol::redis::{self, Redis, RedisRequest, RedisValue};

/// How an HTTP request wants to be answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpFraming {
    keep_alive: bool,
    head_only: bool,
}

impl ServerProtocol for Http {
    type Request = HttpRequest;
    type Response = HttpResponse;
    type Framing = HttpFraming;

    fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, Rejection> {
        http::parse_request(buf).map_err(|_| Rejection::Malformed)
    }

    fn announced_size(buf: &[u8]) -> Option<usize> {
        http::announced_request_size(buf)
    }

    fn framing(req: &HttpRequest) -> HttpFraming {
        HttpFraming {
            keep_alive: req.keep_alive(),
            head_only: req.method.eq_ignore_ascii_case("HEAD"),
        }
    }

    fn keep_alive(framing: HttpFraming) -> bool {
        framing.keep_alive
    }

    fn initial_response() -> HttpResponse {
        HttpResponse::new(200)
    }

    fn rejection(reason: Rejection) -> HttpResponse {
        HttpResponse::new(match reason {
            Rejection::Malformed => 400,
            Rejection::TooLarge => 413,
            Rejection::Timeout => 408,
            Rejection::Unavailable => 503,
            Rejection::Failed => 500,
        })
    }

    fn encode_response(resp: &HttpResponse, framing: HttpFraming, keep_alive: bool, out: &mut Vec<u8>) {
        http::encode_response(resp, keep_alive, framing.head_only, out);
    }
}

impl ServerProtocol for Redis {
    type Request = RedisRequest;
    type Response = RedisValue;
    type Framing = ();

    fn parse_request(buf: &[u8]) -> Result<Option<(RedisRequest, usize)>, Rejection> {
        redis::parse_request(buf).map_err(|_| Rejection::Malformed)
    }

    fn framing(_req: &RedisRequest) {}

    fn rejection(reason: Rejection) -> RedisValue {
        let message = match reason {
            Rejection::Malformed => "ERR Protocol error",
            Rejection::TooLarge => "ERR request too large",
            Rejection::Timeout => "ERR timeout",
            Rejection::Unavailable => "ERR server shutting down",
            Rejection::Failed => "ERR internal error",
        };
        RedisValue::Error(message.to_owned())
    }

    fn encode_response(resp: &RedisValue, _framing: (), _keep_alive: bool, out: &mut Vec<u8>) {
        redis::encode_value(resp, out);
    }
}
