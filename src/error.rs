use std::io::{self, ErrorKind};

use thiserror::Error;

/// Everything that can end a single proxied connection.
///
/// None of these ever leave the task that owns the connection; the
/// dispatcher only logs them.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("failed to resolve {0}")]
    ResolveFailed(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("connection to {0} refused")]
    ConnectRefused(String),

    #[error("DoH transport error: {0}")]
    DohTransport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Peer went away mid-stream. Normal for browsers, not worth counting.
    pub fn is_expected(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_disconnects() {
        let reset = ProxyError::from(io::Error::from(ErrorKind::ConnectionReset));
        assert!(reset.is_expected());

        let pipe = ProxyError::from(io::Error::from(ErrorKind::BrokenPipe));
        assert!(pipe.is_expected());

        let timed_out = ProxyError::from(io::Error::from(ErrorKind::TimedOut));
        assert!(!timed_out.is_expected());

        assert!(!ProxyError::ConnectRefused("example.com:443".into()).is_expected());
    }

    #[test]
    fn test_error_messages() {
        let err = ProxyError::UnsupportedMethod("TRACE".into());
        assert_eq!(err.to_string(), "unsupported method: TRACE");

        let err = ProxyError::ConnectTimeout("example.com:443".into());
        assert_eq!(err.to_string(), "connect to example.com:443 timed out");
    }
}
