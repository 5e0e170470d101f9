use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;

/// Lifecycle and outcome of a task.
///
/// A task is `Pending` until its series reaches it, `Running` while its I/O
/// step is in flight, and in one of the terminal states when its callback
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Pending,
    Running,
    Success,

    /// OS-level failure, `error` holds an errno. Timeouts land here with
    /// `ETIMEDOUT` and a [`TimeoutReason`].
    SysError,

    /// Name resolution failure, `error` holds a `getaddrinfo` code.
    DnsError,

    /// Reserved for TLS failures. TLS targets are refused at construction so
    /// no built-in task ends up here.
    SslError,

    /// Protocol-level failure, `error` holds one of the [`errors`] codes.
    TaskError,

    /// The engine shut down while the task was running.
    Aborted,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::Pending | State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Running => "running",
            State::Success => "success",
            State::SysError => "system error",
            State::DnsError => "dns error",
            State::SslError => "ssl error",
            State::TaskError => "task error",
            State::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Which timer fired when a task failed with `ETIMEDOUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeoutReason {
    #[default]
    NotTimeout,

    /// The overall deadline set with `set_deadline`.
    Wait,

    /// Name resolution plus connect.
    Connect,

    /// A single send or receive.
    Transmit,
}

/// Codes carried by [`State::TaskError`].
pub mod errors {
    /// The peer's reply could not be parsed.
    pub const MALFORMED_RESPONSE: i32 = 1;

    /// The reply grew past `max_response_size`.
    pub const RESPONSE_TOO_LARGE: i32 = 2;

    /// The reply uses a transfer or content encoding we cannot decode.
    pub const UNSUPPORTED_ENCODING: i32 = 3;

    /// The redis server rejected `AUTH`.
    pub const REDIS_ACCESS_DENIED: i32 = 4;

    /// The closure of a go task panicked.
    pub const GO_PANICKED: i32 = 5;

    /// A task's I/O step panicked.
    pub const TASK_PANICKED: i32 = 6;

    /// A redirect pointed to a location that is not a valid url.
    pub const BAD_REDIRECT: i32 = 7;
}

/// Human readable description of a `(state, error)` pair.
///
/// The error domain depends on the state: errno for [`State::SysError`],
/// `getaddrinfo` codes for [`State::DnsError`], [`errors`] for
/// [`State::TaskError`].
pub fn error_string(state: State, error: i32) -> Cow<'static, str> {
    match state {
        State::Success => Cow::Borrowed("success"),
        State::Pending | State::Running => Cow::Borrowed("not finished"),
        State::Aborted => Cow::Borrowed("aborted"),
        State::SysError => Cow::Owned(std::io::Error::from_raw_os_error(error).to_string()),
        State::DnsError => dns_error_string(error),
        State::SslError => Cow::Borrowed("ssl error"),
        State::TaskError => Cow::Borrowed(task_error_string(error)),
    }
}

fn dns_error_string(error: i32) -> Cow<'static, str> {
    // Safety: gai_strerror returns a pointer to a static string.
    let ptr = unsafe { libc::gai_strerror(error) };
    if ptr.is_null() {
        return Cow::Borrowed("unknown dns error");
    }

    let msg = unsafe { CStr::from_ptr(ptr) };
    Cow::Owned(msg.to_string_lossy().into_owned())
}

fn task_error_string(error: i32) -> &'static str {
    match error {
        errors::MALFORMED_RESPONSE => "malformed response",
        errors::RESPONSE_TOO_LARGE => "response too large",
        errors::UNSUPPORTED_ENCODING => "unsupported encoding",
        errors::REDIS_ACCESS_DENIED => "redis access denied",
        errors::GO_PANICKED => "go task panicked",
        errors::TASK_PANICKED => "task panicked",
        errors::BAD_REDIRECT => "bad redirect location",
        _ => "unknown task error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::success(State::Success, 0, "success")]
    #[case::aborted(State::Aborted, libc::ECANCELED, "aborted")]
    #[case::malformed(State::TaskError, errors::MALFORMED_RESPONSE, "malformed response")]
    #[case::too_large(State::TaskError, errors::RESPONSE_TOO_LARGE, "response too large")]
    #[case::unknown_task(State::TaskError, 9999, "unknown task error")]
    fn test_static_strings(#[case] state: State, #[case] error: i32, #[case] expected: &str) {
        assert_eq!(error_string(state, error), expected);
    }

    #[test]
    fn test_sys_error_uses_errno_text() {
        let s = error_string(State::SysError, libc::ECONNREFUSED);
        assert!(s.to_lowercase().contains("refused"), "{}", s);
    }

    #[test]
    fn test_dns_error_is_not_empty() {
        assert!(!error_string(State::DnsError, libc::EAI_NONAME).is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!State::Pending.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(State::Success.is_terminal());
        assert!(State::Aborted.is_terminal());
    }
}
