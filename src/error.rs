use std::fmt;
use std::time::Duration;

/// All error types produced by the Orpc runtime.
///
/// Mirrors the error taxonomy in the original Go implementation
/// (transport / codec / protocol / invoke / timeout / shutdown / discovery),
/// collapsed into one enum the way a Rust crate would rather than relying
/// on sentinel error values and `errors.Is`.
#[derive(Debug)]
pub enum OrpcError {
    /// I/O failure on the underlying byte stream. Fatal to the connection.
    Transport(std::io::Error),

    /// Malformed frame or unknown codec type.
    Codec(String),

    /// Ill-formed `service.method` string, unknown service, or unknown method.
    /// The connection survives; the reply carries this as its `Error` field.
    Protocol(String),

    /// The handler returned an error for this call.
    Invoke(String),

    /// Dialing or handshake exceeded `connect_timeout`.
    ConnectTimeout,

    /// The handler did not finish within `handle_timeout`.
    HandleTimeout(Duration),

    /// A caller-supplied cancellation token fired before the call completed.
    Cancelled,

    /// The `Client` is closing or has already shut down.
    Shutdown,

    /// `ServiceRegistrar::register` was called twice for the same service name.
    AlreadyRegistered(String),

    /// Discovery/selection failure.
    Discovery(DiscoveryError),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Failure modes specific to endpoint discovery and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The endpoint list is empty.
    NoServers,
    /// `SelectMode` did not match a known selection strategy.
    InvalidMode,
    /// No registry URL was configured for a discovery implementation that needs one.
    NoRegistry,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::NoServers => write!(f, "no servers"),
            DiscoveryError::InvalidMode => write!(f, "invalid select mode"),
            DiscoveryError::NoRegistry => write!(f, "no registry configured"),
        }
    }
}

impl fmt::Display for OrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrpcError::Transport(err) => write!(f, "transport error: {err}"),
            OrpcError::Codec(msg) => write!(f, "codec error: {msg}"),
            OrpcError::Protocol(msg) => write!(f, "{msg}"),
            OrpcError::Invoke(msg) => write!(f, "{msg}"),
            OrpcError::ConnectTimeout => write!(f, "connect timeout"),
            OrpcError::HandleTimeout(d) => {
                write!(f, "request handle timeout: expect within {d:?}")
            }
            OrpcError::Cancelled => write!(f, "call cancelled"),
            OrpcError::Shutdown => write!(f, "connection is shut down"),
            OrpcError::AlreadyRegistered(name) => {
                write!(f, "Orpc service already defined: {name}")
            }
            OrpcError::Discovery(err) => write!(f, "discovery error: {err}"),
            OrpcError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for OrpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrpcError::Transport(err) => Some(err),
            OrpcError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OrpcError {
    fn from(err: std::io::Error) -> Self {
        OrpcError::Transport(err)
    }
}

impl From<serde_json::Error> for OrpcError {
    fn from(err: serde_json::Error) -> Self {
        OrpcError::Codec(err.to_string())
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Whether an error is fatal to the connection (transport/codec), as
    /// opposed to a per-call error that leaves the connection usable.
    fn is_connection_fatal(err: &OrpcError) -> bool {
        matches!(err, OrpcError::Transport(_) | OrpcError::Codec(_))
    }

    #[test]
    fn transport_errors_are_connection_fatal() {
        let err = OrpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(is_connection_fatal(&err));
    }

    #[test]
    fn protocol_errors_are_not_connection_fatal() {
        let err = OrpcError::Protocol("method not found: Missing".into());
        assert!(!is_connection_fatal(&err));
    }

    #[test]
    fn display_formatting_matches_go_substrings() {
        let err = OrpcError::Protocol("method not found: Missing".into());
        assert!(err.to_string().contains("method not found: Missing"));

        let err = OrpcError::HandleTimeout(Duration::from_secs(1));
        assert!(err.to_string().contains("request handle timeout: expect within"));
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: OrpcError = io_err.into();
        assert!(matches!(err, OrpcError::Transport(_)));
    }

    #[test]
    fn already_registered_message() {
        let err = OrpcError::AlreadyRegistered("Foo".into());
        assert_eq!(err.to_string(), "Orpc service already defined: Foo");
    }

    #[test]
    fn discovery_error_display() {
        assert_eq!(DiscoveryError::NoServers.to_string(), "no servers");
        assert_eq!(DiscoveryError::InvalidMode.to_string(), "invalid select mode");
    }
}
