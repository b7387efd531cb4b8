//! Endpoint address grammar.
//!
//! ```text
//! ws://   host (":" port)? path        plain TCP
//! wss://  host (":" port)? path        TLS over TCP
//! ws+unix://  path                     UNIX-domain socket
//! wss+unix:// path                     TLS over a UNIX-domain socket
//! host = ipv4 | "[" ipv6 "]" | dns-name
//! ```
//!
//! Default ports are 80 (`ws`) and 443 (`wss`); a missing path defaults to
//! `/`. Anything from `?` or `#` on is dropped from the path. UNIX socket
//! paths must fit the 108-byte `sun_path` limit.

use std::path::PathBuf;

/// Address parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    /// The address did not match the grammar.
    #[error("invalid address")]
    Invalid,
    /// The port component was not a number in range.
    #[error("invalid port")]
    InvalidPort,
    /// The UNIX socket path exceeds the `sun_path` limit.
    #[error("unix socket path too long")]
    PathTooLong,
}

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP endpoint (`ws://` / `wss://`).
    Tcp {
        /// Host name or IP literal (brackets stripped).
        host: String,
        /// Port, defaulted by scheme when absent.
        port: u16,
        /// Request path (the WebSocket resource).
        path: String,
        /// True for `wss://`.
        tls: bool,
    },
    /// UNIX-domain endpoint (`ws+unix://` / `wss+unix://`).
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
        /// True for `wss+unix://`.
        tls: bool,
    },
}

impl Endpoint {
    /// Parses one of the four address forms.
    pub fn parse(address: &str) -> Result<Self, AddrError> {
        if let Some(rest) = address.strip_prefix("ws+unix://") {
            Self::parse_unix(rest, false)
        } else if let Some(rest) = address.strip_prefix("wss+unix://") {
            Self::parse_unix(rest, true)
        } else if let Some(rest) = address.strip_prefix("ws://") {
            Self::parse_tcp(rest, false)
        } else if let Some(rest) = address.strip_prefix("wss://") {
            Self::parse_tcp(rest, true)
        } else {
            Err(AddrError::Invalid)
        }
    }

    fn parse_tcp(rest: &str, tls: bool) -> Result<Self, AddrError> {
        let (host, after) = if let Some(bracketed) = rest.strip_prefix('[') {
            let end = bracketed.find(']').ok_or(AddrError::Invalid)?;
            (&bracketed[..end], &bracketed[end + 1..])
        } else {
            let end = rest.find([':', '/']).unwrap_or(rest.len());
            (&rest[..end], &rest[end..])
        };
        if host.is_empty() {
            return Err(AddrError::Invalid);
        }

        let (port, after) = if let Some(after_colon) = after.strip_prefix(':') {
            let end = after_colon.find('/').unwrap_or(after_colon.len());
            let port = after_colon[..end].parse().map_err(|_| AddrError::InvalidPort)?;
            (port, &after_colon[end..])
        } else {
            (if tls { 443 } else { 80 }, after)
        };

        let path = if after.is_empty() {
            "/".to_owned()
        } else {
            let end = after.find(['?', '#']).unwrap_or(after.len());
            after[..end].to_owned()
        };

        Ok(Self::Tcp {
            host: host.to_owned(),
            port,
            path,
            tls,
        })
    }

    fn parse_unix(rest: &str, tls: bool) -> Result<Self, AddrError> {
        if rest.is_empty() {
            return Err(AddrError::Invalid);
        }
        if rest.len() >= 108 {
            return Err(AddrError::PathTooLong);
        }
        Ok(Self::Unix {
            path: PathBuf::from(rest),
            tls,
        })
    }

    /// The WebSocket resource this endpoint serves or requests.
    ///
    /// UNIX endpoints always use `/`.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Tcp { path, .. } => path,
            Self::Unix { .. } => "/",
        }
    }

    /// Returns true for the TLS schemes.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        match self {
            Self::Tcp { tls, .. } | Self::Unix { tls, .. } => *tls,
        }
    }

    /// Value for the handshake `Host` header.
    #[must_use]
    pub fn host_header(&self) -> String {
        match self {
            Self::Tcp { host, .. } => host.clone(),
            Self::Unix { path, .. } => path.display().to_string(),
        }
    }
}
