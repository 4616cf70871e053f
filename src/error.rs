use std::fmt::{self, Display};

/// Error type shared by the submitter and receiver binaries and by every
/// library module. Mirrors the manual enum-plus-`From`-impls style the
/// original protocol proxy used rather than pulling in a derive macro.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    AddrParse(std::net::AddrParseError),
    Ssl(openssl::error::ErrorStack),
    SslHandshake(openssl::ssl::Error),
    Toml(toml::de::Error),
    Regex(regex::Error),
    Utf8(std::str::Utf8Error),
    ParseInt(std::num::ParseIntError),
    /// A line or payload violated the wire grammar; carries a short
    /// human-readable reason suitable for a `FAIL`/`BAIL` response.
    Protocol(String),
    /// A configuration file or CLI flag combination could not be resolved
    /// into a usable `Config`.
    Config(String),
    /// `is_authorized` rejected a command for the authenticated identity.
    Unauthorized,
    /// A `read_line` accumulated more than 2048 bytes without a terminator.
    LineTooLong,
    /// The connection's idle timer expired without activity.
    Timeout,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::AddrParse(e) => write!(f, "invalid address: {}", e),
            Error::Ssl(e) => write!(f, "tls error: {}", e),
            Error::SslHandshake(e) => write!(f, "tls handshake error: {}", e),
            Error::Toml(e) => write!(f, "invalid configuration: {}", e),
            Error::Regex(e) => write!(f, "invalid authorization pattern: {}", e),
            Error::Utf8(e) => write!(f, "invalid utf-8: {}", e),
            Error::ParseInt(e) => write!(f, "invalid integer: {}", e),
            Error::Protocol(reason) => write!(f, "protocol violation: {}", reason),
            Error::Config(reason) => write!(f, "configuration error: {}", reason),
            Error::Unauthorized => write!(f, "not authorized"),
            Error::LineTooLong => write!(f, "line too long"),
            Error::Timeout => write!(f, "idle timeout"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::AddrParse(e) => Some(e),
            Error::Ssl(e) => Some(e),
            Error::SslHandshake(e) => Some(e),
            Error::Toml(e) => Some(e),
            Error::Regex(e) => Some(e),
            Error::Utf8(e) => Some(e),
            Error::ParseInt(e) => Some(e),
            Error::Protocol(_)
            | Error::Config(_)
            | Error::Unauthorized
            | Error::LineTooLong
            | Error::Timeout => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(error: std::net::AddrParseError) -> Self {
        Error::AddrParse(error)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Self {
        Error::Ssl(error)
    }
}

impl From<openssl::ssl::Error> for Error {
    fn from(error: openssl::ssl::Error) -> Self {
        Error::SslHandshake(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml(error)
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Regex(error)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error::Utf8(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}
