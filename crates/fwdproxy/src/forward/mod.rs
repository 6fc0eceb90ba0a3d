use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

const WAKE: Token = Token(0);
const BUF_SIZE: usize = 8 * 1024;

/// How long buffered tunnel bytes may sit before they are pushed to the OS.
/// Batching back-to-back reads saves write syscalls; the deadline caps the
/// added latency.
pub const FLUSH_DELAY: Duration = Duration::from_millis(10);

struct PendingPair {
    a: TcpStream,
    b: TcpStream,
    duplex: bool,
}

struct Shared {
    pending: Mutex<Vec<PendingPair>>,
    running: AtomicBool,
    waker: Waker,
}

/// Forwards data across many socket pairs on one event loop thread.
///
/// Each direction of a pair is a half: reads from its src socket are buffered
/// towards its dst socket and flushed once the stream goes quiet for
/// [`FLUSH_DELAY`]. Closing one half performs a TCP half-close; the sockets
/// are released once both directions are gone.
#[derive(Clone)]
pub struct MultiForwarder {
    shared: Arc<Shared>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MultiForwarder {
    pub fn start(flushdelay: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            waker,
        });
        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("forwarder".to_string())
                .spawn(move || Loop::new(poll, shared, flushdelay).run())?
        };
        Ok(Self {
            shared,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Queue a pair for forwarding `a -> b` and, when `duplex`, `b -> a` too.
    /// Registration happens on the loop thread only. Taking the sockets by
    /// value keeps any socket from ever backing two halves in the same role.
    pub fn add(&self, a: TcpStream, b: TcpStream, duplex: bool) {
        self.shared
            .pending
            .lock()
            .unwrap()
            .push(PendingPair { a, b, duplex });
        let _ = self.shared.waker.wake();
    }

    /// Stop the loop and release every tunnel. Safe to call more than once.
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

struct Half {
    dst: Token,
    /// Absolute time by which buffered dst bytes must be flushed.
    /// Present exactly while this half is in `write_pending`.
    deadline: Option<Instant>,
}

struct Sock {
    stream: TcpStream,
    /// Bytes waiting to be written into this socket.
    wbuf: Vec<u8>,
}

struct Loop {
    poll: Poll,
    shared: Arc<Shared>,
    flushdelay: Duration,
    socks: HashMap<Token, Sock>,
    /// Halves keyed by the token of their src socket.
    halves: HashMap<Token, Half>,
    /// dst token -> src token of the half writing into it.
    writer_of: HashMap<Token, Token>,
    /// src tokens whose dst has buffered bytes.
    write_pending: HashSet<Token>,
    next_token: usize,
    buf: Vec<u8>,
}

impl Loop {
    fn new(poll: Poll, shared: Arc<Shared>, flushdelay: Duration) -> Self {
        Self {
            poll,
            shared,
            flushdelay,
            socks: HashMap::new(),
            halves: HashMap::new(),
            writer_of: HashMap::new(),
            write_pending: HashSet::new(),
            next_token: 0,
            buf: vec![0u8; BUF_SIZE],
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut ptime: Option<Duration> = None;
        loop {
            if let Err(err) = self.poll.poll(&mut events, ptime) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("forwarder poll failed: {err}");
                break;
            }
            let now = Instant::now();
            let mut woke = false;
            let mut ready: Vec<Token> = Vec::new();
            for event in events.iter() {
                if event.token() == WAKE {
                    woke = true;
                } else {
                    ready.push(event.token());
                }
            }
            if woke {
                if !self.shared.running.load(Ordering::SeqCst) {
                    break;
                }
                self.drain_pending();
            }

            let flush_deadline = (!ready.is_empty()).then(|| now + self.flushdelay);
            for &src in &ready {
                self.forward_chunk(src, flush_deadline);
            }

            // Flush halves untouched this tick whose quiet interval elapsed,
            // and find the nearest outstanding deadline for the next poll.
            let mut next = flush_deadline;
            for src in self.write_pending.iter().copied().collect::<Vec<_>>() {
                if ready.contains(&src) {
                    continue;
                }
                let Some(deadline) = self.halves.get(&src).and_then(|h| h.deadline) else {
                    continue;
                };
                let candidate = if deadline <= now {
                    self.flush_half(src)
                } else {
                    Some(deadline)
                };
                if let Some(candidate) = candidate {
                    if next.is_none_or(|n| candidate < n) {
                        next = Some(candidate);
                    }
                }
            }
            ptime = next.map(|deadline| deadline.saturating_duration_since(now));
        }
        self.finalize();
    }

    fn drain_pending(&mut self) {
        let pending: Vec<PendingPair> = self.shared.pending.lock().unwrap().drain(..).collect();
        for pair in pending {
            if let Err(err) = self.register_pair(pair) {
                log::warn!("failed to register tunnel pair: {err}");
            }
        }
    }

    fn register_pair(&mut self, pair: PendingPair) -> io::Result<()> {
        pair.a.set_nonblocking(true)?;
        pair.b.set_nonblocking(true)?;
        let ta = self.alloc_token();
        let tb = self.alloc_token();
        self.poll
            .registry()
            .register(&mut SourceFd(&pair.a.as_raw_fd()), ta, Interest::READABLE)?;
        if pair.duplex {
            self.poll
                .registry()
                .register(&mut SourceFd(&pair.b.as_raw_fd()), tb, Interest::READABLE)?;
        }
        self.socks.insert(
            ta,
            Sock {
                stream: pair.a,
                wbuf: Vec::new(),
            },
        );
        self.socks.insert(
            tb,
            Sock {
                stream: pair.b,
                wbuf: Vec::new(),
            },
        );
        self.halves.insert(ta, Half { dst: tb, deadline: None });
        self.writer_of.insert(tb, ta);
        if pair.duplex {
            self.halves.insert(tb, Half { dst: ta, deadline: None });
            self.writer_of.insert(ta, tb);
        }
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    /// Move readable bytes from a src towards its dst buffer. The poller is
    /// edge-triggered, so reads must continue until the socket blocks.
    fn forward_chunk(&mut self, src: Token, flush_deadline: Option<Instant>) {
        let Some(half) = self.halves.get(&src) else {
            // Stale readiness for a half closed earlier this tick.
            return;
        };
        let dst = half.dst;
        loop {
            let read = match self.socks.get_mut(&src) {
                Some(sock) => sock.stream.read(&mut self.buf),
                None => return,
            };
            let n = match read {
                Ok(0) => {
                    self.close_half(src);
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("tunnel read failed: {err}");
                    self.close_half(src);
                    return;
                }
            };
            match self.socks.get_mut(&dst) {
                Some(sock) => sock.wbuf.extend_from_slice(&self.buf[..n]),
                None => {
                    self.close_half(src);
                    return;
                }
            }
            // Past a buffer's worth, push to the OS right away instead of
            // waiting out the flush delay.
            let over = self
                .socks
                .get(&dst)
                .is_some_and(|sock| sock.wbuf.len() >= BUF_SIZE);
            if over {
                if let Err(err) = self.drain_wbuf(dst) {
                    log::debug!("tunnel write failed: {err}");
                    self.close_half(src);
                    return;
                }
            }
        }
        if self.socks.get(&dst).is_none_or(|sock| sock.wbuf.is_empty()) {
            self.write_pending.remove(&src);
            if let Some(half) = self.halves.get_mut(&src) {
                half.deadline = None;
            }
        } else {
            self.write_pending.insert(src);
            if let Some(half) = self.halves.get_mut(&src) {
                half.deadline = flush_deadline;
            }
        }
    }

    /// Flush the dst buffer of one half. Returns the new deadline when bytes
    /// remain (the write would have blocked).
    fn flush_half(&mut self, src: Token) -> Option<Instant> {
        let dst = self.halves.get(&src)?.dst;
        match self.drain_wbuf(dst) {
            Ok(true) => {
                self.write_pending.remove(&src);
                if let Some(half) = self.halves.get_mut(&src) {
                    half.deadline = None;
                }
                None
            }
            Ok(false) => {
                let deadline = Instant::now() + self.flushdelay;
                if let Some(half) = self.halves.get_mut(&src) {
                    half.deadline = Some(deadline);
                }
                Some(deadline)
            }
            Err(err) => {
                log::debug!("tunnel flush failed: {err}");
                self.close_half(src);
                None
            }
        }
    }

    /// Write buffered bytes into `dst` until empty or the socket blocks.
    /// `Ok(true)` means the buffer was emptied.
    fn drain_wbuf(&mut self, dst: Token) -> io::Result<bool> {
        let Some(sock) = self.socks.get_mut(&dst) else {
            return Ok(true);
        };
        while !sock.wbuf.is_empty() {
            match sock.stream.write(&sock.wbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    sock.wbuf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Tear down one half: final flush, then close or half-close each
    /// endpoint depending on whether the paired half still uses it.
    fn close_half(&mut self, src: Token) {
        let Some(Half { dst, .. }) = self.halves.remove(&src) else {
            return;
        };
        self.write_pending.remove(&src);
        self.writer_of.remove(&dst);
        if let Err(err) = self.drain_wbuf(dst) {
            log::debug!("final tunnel flush failed: {err}");
        }
        if let Some(sock) = self.socks.get(&src) {
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&sock.stream.as_raw_fd()));
        }
        // src: the paired half may still be writing into this socket.
        if self.writer_of.contains_key(&src) {
            if let Some(sock) = self.socks.get(&src) {
                let _ = sock.stream.shutdown(Shutdown::Read);
            }
        } else {
            self.socks.remove(&src);
        }
        // dst: the paired half may still be reading from this socket.
        if self.halves.contains_key(&dst) {
            if let Some(sock) = self.socks.get(&dst) {
                let _ = sock.stream.shutdown(Shutdown::Write);
            }
        } else {
            self.socks.remove(&dst);
        }
    }

    fn finalize(&mut self) {
        for src in self.halves.keys().copied().collect::<Vec<_>>() {
            self.close_half(src);
        }
    }
}
