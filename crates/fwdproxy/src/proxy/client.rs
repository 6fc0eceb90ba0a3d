use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use mio::Token;

/// Read buffer size per connection, also the request-line cap.
pub(crate) const BUF_SIZE: usize = 8 * 1024;

/// One accepted client connection.
///
/// Reading goes through a buffer; bytes pulled from the OS but not yet
/// consumed by parsing must travel with the socket on a tunnel handoff, which
/// is what [`Client::take_buffered`] is for.
pub struct Client {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
    token: Token,
}

impl Client {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, token: Token) -> Self {
        Self {
            reader: BufReader::with_capacity(BUF_SIZE, stream),
            peer,
            token,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    pub(crate) fn reader(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.reader
    }

    /// Writes go straight to the socket; wrap in a `BufWriter` per response.
    pub(crate) fn stream(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    /// Whether parsing left bytes behind in the read buffer. A pipelined
    /// follow-up request hides from the poller, which only sees the OS
    /// socket; such a client must be handled again, not re-armed.
    pub(crate) fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Drain bytes already read from the socket but not yet consumed.
    pub(crate) fn take_buffered(&mut self) -> Vec<u8> {
        let bytes = self.reader.buffer().to_vec();
        self.reader.consume(bytes.len());
        bytes
    }

    /// Relinquish the raw socket. On a tunnel handoff, call
    /// [`Client::take_buffered`] first; buffered bytes do not survive this.
    pub(crate) fn detach(self) -> TcpStream {
        self.reader.into_inner()
    }
}
