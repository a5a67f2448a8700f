//! Connection to a remote peer
//!
//! Wraps a byte stream with buffered, independently locked read and write
//! halves plus a control handle used to shut the socket down. Shutting down
//! is how a session blocked in a read gets cancelled.

use super::protocol::{ConsensusMessage, ProtocolMessage};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A duplex byte stream that can be cloned and shut down
pub trait Transport: Read + Write + Send + 'static {
    /// Another handle to the same stream
    fn try_clone_boxed(&self) -> io::Result<Box<dyn Transport>>;

    /// Close both directions, unblocking pending reads
    fn shutdown(&self) -> io::Result<()>;

    /// Peer description for logs
    fn describe(&self) -> String;

    /// Bound blocking reads; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone_boxed(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn describe(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Buffered read half
pub type ConnectionReader = BufReader<Box<dyn Transport>>;

/// Buffered write half
pub type ConnectionWriter = BufWriter<Box<dyn Transport>>;

/// Message connection to a peer
pub struct RemoteConnection {
    source: String,
    reader: Mutex<ConnectionReader>,
    writer: Mutex<ConnectionWriter>,
    control: Mutex<Box<dyn Transport>>,
    disposed: AtomicBool,
}

impl RemoteConnection {
    /// Wrap a connected stream
    pub fn new<T: Transport>(stream: T) -> Result<Self> {
        let source = stream.describe();
        let reader = stream.try_clone_boxed()?;
        let control = stream.try_clone_boxed()?;
        let writer: Box<dyn Transport> = Box::new(stream);
        Ok(Self {
            source,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(BufWriter::new(writer)),
            control: Mutex::new(control),
            disposed: AtomicBool::new(false),
        })
    }

    /// Peer address
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Send a typed message
    pub fn send<M: ProtocolMessage>(&self, message: M) -> Result<()> {
        self.send_message(&message.into_message())
    }

    /// Send a message and flush
    pub fn send_message(&self, message: &ConsensusMessage) -> Result<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        message
            .write_to(&mut *writer)
            .map_err(|e| self.translate(e))
    }

    /// Read the next message
    pub fn read_message(&self) -> Result<ConsensusMessage> {
        self.ensure_open()?;
        let mut reader = self.reader.lock();
        ConsensusMessage::read_from(&mut *reader).map_err(|e| self.translate(e))
    }

    /// Read the next message, which must be an `M`
    pub fn read<M: ProtocolMessage>(&self) -> Result<M> {
        M::from_message(self.read_message()?)
    }

    /// Exclusive access to the raw read half (snapshot streams)
    pub fn reader(&self) -> Result<MutexGuard<'_, ConnectionReader>> {
        self.ensure_open()?;
        Ok(self.reader.lock())
    }

    /// Exclusive access to the raw write half (snapshot streams)
    pub fn writer(&self) -> Result<MutexGuard<'_, ConnectionWriter>> {
        self.ensure_open()?;
        Ok(self.writer.lock())
    }

    /// Bound blocking reads on the underlying stream. A read that runs
    /// out of time fails with [`Error::Io`].
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        self.control.lock().set_read_timeout(timeout)?;
        Ok(())
    }

    /// Shut the stream down. Pending and later operations fail with
    /// [`Error::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.lock().shutdown() {
            // Already closed by the peer
            tracing::debug!("Shutdown of connection to {} failed: {}", self.source, e);
        }
    }

    /// Whether [`dispose`](Self::dispose) was called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed(format!("connection to {}", self.source)));
        }
        Ok(())
    }

    /// Failures caused by our own shutdown are reported as disposal
    fn translate(&self, error: Error) -> Error {
        if self.is_disposed() {
            Error::Disposed(format!("connection to {}", self.source))
        } else {
            error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::protocol::{AppendEntriesResponse, LogLengthNegotiation};
    use std::net::TcpListener;

    fn pair() -> (RemoteConnection, RemoteConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            RemoteConnection::new(client).unwrap(),
            RemoteConnection::new(server).unwrap(),
        )
    }

    #[test]
    fn test_typed_exchange() {
        let (leader, follower) = pair();
        leader
            .send(LogLengthNegotiation {
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .unwrap();
        let received: LogLengthNegotiation = follower.read().unwrap();
        assert_eq!(received.term, 1);

        // Wrong type is a protocol error
        leader
            .send(LogLengthNegotiation {
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
            })
            .unwrap();
        assert!(matches!(
            follower.read::<AppendEntriesResponse>(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_dispose_unblocks_reader() {
        let (_leader, follower) = pair();
        let follower = std::sync::Arc::new(follower);

        let reader = std::sync::Arc::clone(&follower);
        let handle = std::thread::spawn(move || reader.read_message());

        std::thread::sleep(std::time::Duration::from_millis(50));
        follower.dispose();

        let result = handle.join().unwrap();
        assert!(result.unwrap_err().is_benign_termination());
        assert!(matches!(follower.read_message(), Err(Error::Disposed(_))));
    }

    #[test]
    fn test_peer_close_is_benign() {
        let (leader, follower) = pair();
        drop(leader);
        let err = follower.read_message().unwrap_err();
        assert!(err.is_benign_termination());
    }
}
