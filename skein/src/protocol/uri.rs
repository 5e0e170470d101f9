use crate::error::{Error, Result};
use std::fmt;

/// Target of a network task: `scheme://[userinfo@]host[:port][/path][?query]`.
///
/// Only plaintext schemes are accepted. TLS schemes fail with
/// [`Error::UnsupportedScheme`] so the failure shows up at construction
/// rather than on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: u16,
    /// Path plus query, never empty.
    path: String,
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "redis" => Some(6379),
        _ => None,
    }
}

impl Uri {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::invalid_url(url, "missing `://`"))?;

        let scheme = scheme.to_ascii_lowercase();
        let Some(port) = default_port(&scheme) else {
            return Err(Error::UnsupportedScheme(scheme));
        };

        // Fragments never leave the client.
        let rest = rest.split('#').next().unwrap_or_default();

        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };

        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(userinfo.to_owned()), host_port),
            None => (None, authority),
        };

        let (host, explicit_port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::invalid_url(url, "unterminated `[`"))?;

            let port = match after {
                "" => None,
                after => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| Error::invalid_url(url, "unexpected characters after host"))?,
                ),
            };
            (host, port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(Error::invalid_url(url, "empty host"));
        }

        let port = match explicit_port {
            None | Some("") => port,
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::invalid_url(url, "invalid port"))?,
        };

        let path = match path {
            "" => "/".to_owned(),
            p if p.starts_with('?') => format!("/{p}"),
            p => p.to_owned(),
        };

        Ok(Self {
            scheme,
            userinfo,
            host: host.to_owned(),
            port,
            path,
        })
    }

    /// Resolves a redirect `Location` against this uri. `None` when the
    /// location is unusable, including a jump to an unsupported scheme.
    pub fn join(&self, location: &str) -> Option<Uri> {
        let location = location.trim();

        if location.is_empty() {
            return None;
        }

        if location.contains("://") {
            return Uri::parse(location).ok();
        }

        if let Some(rest) = location.strip_prefix("//") {
            return Uri::parse(&format!("{}://{}", self.scheme, rest)).ok();
        }

        let path = if location.starts_with('/') {
            location.to_owned()
        } else if location.starts_with('?') {
            let base = self.path.split('?').next().unwrap_or("/");
            format!("{base}{location}")
        } else {
            let base = self.path.split('?').next().unwrap_or("/");
            let dir = match base.rfind('/') {
                Some(i) => &base[..=i],
                None => "/",
            };
            format!("{dir}{location}")
        };

        Some(Uri {
            path: path.split('#').next().unwrap_or("/").to_owned(),
            ..self.clone()
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        let userinfo = self.userinfo.as_deref()?;
        let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
        (!user.is_empty()).then_some(user)
    }

    pub fn password(&self) -> Option<&str> {
        self.userinfo
            .as_deref()?
            .split_once(':')
            .map(|(_, password)| password)
            .filter(|password| !password.is_empty())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path and query, as sent on a request line.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The `Host` header value: the port is left out when it is the default.
    pub(crate) fn host_header(&self) -> String {
        if default_port(&self.scheme) == Some(self.port) {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(userinfo) = &self.userinfo {
            write!(f, "{userinfo}@")?;
        }
        write!(f, "{}{}", self.authority(), self.path)
    }
}

impl std::str::FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uri::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare("http://example.com", "example.com", 80, "/")]
    #[case::port_and_path("http://example.com:8080/a/b", "example.com", 8080, "/a/b")]
    #[case::query_only("http://h?x=1", "h", 80, "/?x=1")]
    #[case::fragment("http://h/p#frag", "h", 80, "/p")]
    #[case::upper_scheme("HTTP://h/", "h", 80, "/")]
    #[case::ipv6("http://[::1]:9000/x", "::1", 9000, "/x")]
    #[case::redis_default("redis://127.0.0.1", "127.0.0.1", 6379, "/")]
    #[case::redis_db("redis://:secret@127.0.0.1:7000/2", "127.0.0.1", 7000, "/2")]
    fn test_parse(
        #[case] url: &str,
        #[case] host: &str,
        #[case] port: u16,
        #[case] path: &str,
    ) -> anyhow::Result<()> {
        let uri = Uri::parse(url)?;
        assert_eq!(uri.host(), host);
        assert_eq!(uri.port(), port);
        assert_eq!(uri.path(), path);
        Ok(())
    }

    #[rstest]
    #[case::no_scheme("example.com/path")]
    #[case::empty_host("http:///path")]
    #[case::bad_port("http://h:99999/")]
    #[case::unterminated_ipv6("http://[::1/")]
    fn test_parse_invalid(#[case] url: &str) {
        assert!(matches!(Uri::parse(url), Err(Error::InvalidUrl { .. })));
    }

    #[rstest]
    #[case::https("https://example.com/")]
    #[case::rediss("rediss://example.com/")]
    #[case::ftp("ftp://example.com/")]
    fn test_parse_unsupported_scheme(#[case] url: &str) {
        assert!(matches!(Uri::parse(url), Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn test_credentials() -> anyhow::Result<()> {
        let uri = Uri::parse("redis://user:pw@h/")?;
        assert_eq!(uri.user(), Some("user"));
        assert_eq!(uri.password(), Some("pw"));

        let uri = Uri::parse("redis://:pw@h/")?;
        assert_eq!(uri.user(), None);
        assert_eq!(uri.password(), Some("pw"));

        let uri = Uri::parse("redis://h/")?;
        assert_eq!(uri.userinfo(), None);
        assert_eq!(uri.password(), None);
        Ok(())
    }

    #[rstest]
    #[case::absolute("http://other:81/z", "http://other:81/z")]
    #[case::scheme_relative("//other/z", "http://other:80/z")]
    #[case::root_relative("/z?q=1", "http://h:80/z?q=1")]
    #[case::relative("c", "http://h:80/a/c")]
    #[case::query("?n=2", "http://h:80/a/b?n=2")]
    fn test_join(#[case] location: &str, #[case] expected: &str) -> anyhow::Result<()> {
        let base = Uri::parse("http://h/a/b?x=1")?;
        let joined = base.join(location).map(|u| u.to_string());
        assert_eq!(joined.as_deref(), Some(expected));
        Ok(())
    }

    #[test]
    fn test_join_rejects_tls_and_empty() -> anyhow::Result<()> {
        let base = Uri::parse("http://h/")?;
        assert!(base.join("https://h/").is_none());
        assert!(base.join("  ").is_none());
        Ok(())
    }

    #[test]
    fn test_host_header() -> anyhow::Result<()> {
        assert_eq!(Uri::parse("http://h/")?.host_header(), "h");
        assert_eq!(Uri::parse("http://h:8080/")?.host_header(), "h:8080");
        assert_eq!(Uri::parse("http://[::1]/")?.host_header(), "[::1]");
        Ok(())
    }
}
