//! Error plumbing of the runtime. Transport and protocol failures either
//! ask the caller to wait for more data or are fatal for the affected
//! channel; fatal errors are folded into disconnects at the engine boundary
//! and never propagate further.

use std::io;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// Not enough data or buffer space right now, try again later.
    Wait,
    /// The channel or operation is beyond recovery.
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    ChannelClosed,
    PayloadTooLarge,
    ProtocolMismatch,
    Serialization,
    Broker,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::UnexpectedEof => NetError::Fatal(ErrorType::ChannelClosed),
            io::ErrorKind::WriteZero => NetError::Fatal(ErrorType::ChannelClosed),
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_eof_is_closed() {
        let err: NetError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err, NetError::Fatal(ErrorType::ChannelClosed));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetError>(()).has_failed());
        assert!(!Err::<(), _>(NetError::Wait).has_failed());
        assert!(Err::<(), _>(NetError::Fatal(ErrorType::ChannelClosed)).has_failed());
    }
}
