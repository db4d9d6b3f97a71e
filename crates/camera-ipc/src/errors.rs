use crate::message::MessageId;
use crate::protocol::SessionState;
use nix::errno::Errno;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] Errno),

    #[error("Connection failed during {stage}: {source}")]
    Connection {
        stage: &'static str,
        #[source]
        source: Errno,
    },

    #[error("Short write: sent {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Camera server unavailable: {0}")]
    PeerUnavailable(Errno),

    #[error("Shared memory mapping failed: {0}")]
    Map(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message queue full, dropped {0:?}")]
    QueueFull(MessageId),

    #[error("Payload of {0} bytes does not fit in a message")]
    PayloadTooLarge(usize),

    #[error("Request not valid in state {0:?}")]
    InvalidState(SessionState),

    #[error("GPIO error: {0}")]
    Gpio(#[source] io::Error),

    #[error("Session has been destroyed")]
    Destroyed,
}

impl IpcError {
    /// Transport errors that mean the server went away rather than that
    /// this socket is broken.
    pub fn is_peer_loss(&self) -> bool {
        matches!(self, IpcError::PeerUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "socket missing");
        let err = IpcError::Io(io_err);
        assert_eq!(err.to_string(), "IO error: socket missing");

        let err = IpcError::ShortWrite {
            written: 10,
            expected: 144,
        };
        assert_eq!(err.to_string(), "Short write: sent 10 of 144 bytes");

        let err = IpcError::Connection {
            stage: "bind",
            source: Errno::EADDRINUSE,
        };
        assert!(
            err.to_string().starts_with("Connection failed during bind"),
            "Connection error should name the failing stage"
        );

        let err = IpcError::QueueFull(MessageId::Heartbeat);
        assert_eq!(err.to_string(), "Message queue full, dropped Heartbeat");

        let err = IpcError::InvalidState(SessionState::Running);
        assert_eq!(err.to_string(), "Request not valid in state Running");
    }

    #[test]
    fn test_error_conversion_from_errno() {
        fn fails() -> Result<(), Errno> {
            Err(Errno::EBADF)
        }

        fn uses_question_mark() -> Result<(), IpcError> {
            fails()?;
            Ok(())
        }

        match uses_question_mark() {
            Err(IpcError::Nix(e)) => assert_eq!(e, Errno::EBADF),
            other => panic!("Expected Nix variant, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_loss_classification() {
        assert!(IpcError::PeerUnavailable(Errno::ECONNREFUSED).is_peer_loss());
        assert!(
            !IpcError::ShortWrite {
                written: 0,
                expected: 144
            }
            .is_peer_loss()
        );
        assert!(!IpcError::Map("bad".into()).is_peer_loss());
    }
}
