//! Channels are the end points of the connections DSI messages flow over.
//! They do not own the event loop registration; the engine decides when a
//! channel is read. All operations are blocking, bounded by the configured
//! send and receive timeouts.

use crate::config::Config;
use crate::error::{ErrorType, NetError, NetResult};
use dsibase::logging::{self, Logger};
use std::cell::Cell;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::Duration;

pub type ChannelRef = Rc<dyn Channel>;
pub type ChannelWeak = Weak<dyn Channel>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    Null,
    Local,
    Tcp,
}

/// A logical connection between a DSI client and a DSI server.
pub trait Channel {
    fn is_open(&self) -> bool;

    fn transport(&self) -> Transport;

    /// File descriptor of the underlying socket, used as the multiplexer
    /// token. Negative for the null channel.
    fn fd(&self) -> RawFd;

    /// Blocking send of the whole buffer.
    fn send_all(&self, data: &[u8]) -> NetResult<()>;

    /// Blocking vectored send of all chunks in order. The chunks must
    /// outlive the call.
    fn send_vectored(&self, parts: &[&[u8]]) -> NetResult<()>;

    /// Blocking receive filling the whole buffer.
    fn recv_all(&self, buf: &mut [u8]) -> NetResult<()>;

    /// Shut the connection down. Closing is idempotent; the socket itself
    /// is released when the last channel reference is dropped.
    fn close(&self);

    /// Local address, TCP channels only.
    fn local_tcp_addr(&self) -> Option<SocketAddrV4> {
        None
    }

    /// Peer address, TCP channels only.
    fn peer_tcp_addr(&self) -> Option<SocketAddrV4> {
        None
    }
}

/// Stream flavors a channel can be built on.
pub trait ChannelStream: AsRawFd {
    const TRANSPORT: Transport;

    fn shutdown_both(&self);

    fn set_timeouts(&self, recv: Option<Duration>, send: Option<Duration>) -> io::Result<()>;

    fn local_tcp_addr(&self) -> Option<SocketAddrV4> {
        None
    }

    fn peer_tcp_addr(&self) -> Option<SocketAddrV4> {
        None
    }
}

impl ChannelStream for UnixStream {
    const TRANSPORT: Transport = Transport::Local;

    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn set_timeouts(&self, recv: Option<Duration>, send: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(recv)?;
        self.set_write_timeout(send)
    }
}

impl ChannelStream for TcpStream {
    const TRANSPORT: Transport = Transport::Tcp;

    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn set_timeouts(&self, recv: Option<Duration>, send: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(recv)?;
        self.set_write_timeout(send)
    }

    fn local_tcp_addr(&self) -> Option<SocketAddrV4> {
        match self.local_addr() {
            Ok(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }

    fn peer_tcp_addr(&self) -> Option<SocketAddrV4> {
        match self.peer_addr() {
            Ok(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }
}

/// Channel implementation shared by the local and TCP transports.
pub struct StreamChannel<S: ChannelStream> {
    stream: S,
    open: Cell<bool>,
    log: Logger,
}

pub type LocalChannel = StreamChannel<UnixStream>;
pub type TcpChannel = StreamChannel<TcpStream>;

impl<S> StreamChannel<S>
where
    S: ChannelStream,
    for<'s> &'s S: Read + Write,
{
    /// Wrap a connected stream, applying the configured timeouts.
    pub fn new(stream: S, cfg: &Config, log: &Logger) -> io::Result<StreamChannel<S>> {
        stream.set_timeouts(cfg.recv_timeout, cfg.send_timeout)?;

        let fd = stream.as_raw_fd();

        Ok(StreamChannel {
            stream,
            open: Cell::new(true),
            log: log.new(logging::o!("fd" => fd)),
        })
    }

    /// Treat every I/O failure on an established channel as fatal; timeouts
    /// surface as disconnects further up.
    fn fold_io(&self, err: io::Error) -> NetError {
        logging::debug!(self.log, "channel i/o failed"; "error" => %err);

        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => {
                NetError::Fatal(ErrorType::ChannelClosed)
            }
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl<S> Channel for StreamChannel<S>
where
    S: ChannelStream,
    for<'s> &'s S: Read + Write,
{
    #[inline]
    fn is_open(&self) -> bool {
        self.open.get()
    }

    #[inline]
    fn transport(&self) -> Transport {
        S::TRANSPORT
    }

    #[inline]
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn send_all(&self, data: &[u8]) -> NetResult<()> {
        if !self.is_open() {
            return Err(NetError::Fatal(ErrorType::ChannelClosed));
        }

        (&self.stream).write_all(data).map_err(|err| self.fold_io(err))
    }

    fn send_vectored(&self, parts: &[&[u8]]) -> NetResult<()> {
        if !self.is_open() {
            return Err(NetError::Fatal(ErrorType::ChannelClosed));
        }

        let total: usize = parts.iter().map(|part| part.len()).sum();
        let mut sent = 0;

        while sent < total {
            // rebuild the slice list past the bytes already transmitted
            let mut slices = Vec::with_capacity(parts.len());
            let mut skip = sent;

            for part in parts {
                if skip >= part.len() {
                    skip -= part.len();
                    continue;
                }

                slices.push(IoSlice::new(&part[skip..]));
                skip = 0;
            }

            match (&self.stream).write_vectored(&slices) {
                Ok(0) => return Err(NetError::Fatal(ErrorType::ChannelClosed)),
                Ok(count) => sent += count,
                Err(err) => return Err(self.fold_io(err)),
            }
        }

        Ok(())
    }

    fn recv_all(&self, buf: &mut [u8]) -> NetResult<()> {
        if !self.is_open() {
            return Err(NetError::Fatal(ErrorType::ChannelClosed));
        }

        (&self.stream).read_exact(buf).map_err(|err| self.fold_io(err))
    }

    fn close(&self) {
        if self.open.replace(false) {
            logging::debug!(self.log, "closing channel");
            self.stream.shutdown_both();
        }
    }

    fn local_tcp_addr(&self) -> Option<SocketAddrV4> {
        self.stream.local_tcp_addr()
    }

    fn peer_tcp_addr(&self) -> Option<SocketAddrV4> {
        self.stream.peer_tcp_addr()
    }
}

/// Sentinel channel used as the default pointee of weak channel
/// references. Every operation fails.
pub struct NullChannel;

impl Channel for NullChannel {
    fn is_open(&self) -> bool {
        false
    }

    fn transport(&self) -> Transport {
        Transport::Null
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn send_all(&self, _data: &[u8]) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::ChannelClosed))
    }

    fn send_vectored(&self, _parts: &[&[u8]]) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::ChannelClosed))
    }

    fn recv_all(&self, _buf: &mut [u8]) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::ChannelClosed))
    }

    fn close(&self) {}
}

thread_local! {
    static NULL_CHANNEL: Rc<NullChannel> = Rc::new(NullChannel);
}

/// The shared null channel instance of this thread.
pub fn null_channel() -> ChannelRef {
    NULL_CHANNEL.with(|chnl| -> ChannelRef { chnl.clone() })
}

/// Weak reference to the shared null channel, the default value of channel
/// members before a connection exists.
pub fn null_channel_weak() -> ChannelWeak {
    NULL_CHANNEL.with(|chnl| -> ChannelWeak {
        let chnl: Rc<dyn Channel> = chnl.clone();
        Rc::downgrade(&chnl)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsibase::logging;

    fn pair() -> (LocalChannel, LocalChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        let cfg = Config::default();
        let log = logging::discard();

        (
            LocalChannel::new(a, &cfg, &log).unwrap(),
            LocalChannel::new(b, &cfg, &log).unwrap(),
        )
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (tx, rx) = pair();

        tx.send_all(&[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        rx.recv_all(&mut buf).unwrap();

        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_vectored_send() {
        let (tx, rx) = pair();

        tx.send_vectored(&[&[1, 2], &[], &[3], &[4, 5, 6]]).unwrap();

        let mut buf = [0u8; 6];
        rx.recv_all(&mut buf).unwrap();

        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_recv_after_peer_close() {
        let (tx, rx) = pair();
        tx.close();

        let mut buf = [0u8; 1];
        assert!(rx.recv_all(&mut buf).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, _rx) = pair();

        tx.close();
        tx.close();

        assert!(!tx.is_open());
        assert!(tx.send_all(&[0]).is_err());
    }

    #[test]
    fn test_null_channel() {
        let chnl = null_channel();

        assert!(!chnl.is_open());
        assert_eq!(chnl.transport(), Transport::Null);
        assert!(chnl.send_all(&[1]).is_err());
        assert!(chnl.recv_all(&mut [0]).is_err());

        let weak = null_channel_weak();
        assert!(weak.upgrade().is_some());
    }
}
