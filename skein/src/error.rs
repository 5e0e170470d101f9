use std::io;
use thiserror::Error;

/// Synchronous failures: raised while building an engine or constructing a
/// task, before any I/O has been scheduled. Failures of a running task are
/// never reported through this type; see [`State`](crate::State).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("engine is shutting down")]
    EngineClosed,

    #[error("global engine already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: &'static str) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            reason,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, std::error::Error);

    #[test]
    fn test_display() {
        let err = Error::invalid_url("htp:/x", "missing `://`");
        assert_eq!(err.to_string(), "invalid url `htp:/x`: missing `://`");

        let err = Error::UnsupportedScheme("https".into());
        assert_eq!(err.to_string(), "unsupported scheme `https`");
    }
}
