use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Interest, Poll, Waker};

use crate::acl::Acl;
use crate::forward::{FLUSH_DELAY, MultiForwarder};

mod client;
mod dispatch;
mod worker;

pub use client::Client;

// Canned wire responses.
pub(crate) const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
pub(crate) const UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nUser-Agent: Proxy\r\n\r\n";
pub(crate) const NOT_IMPLEMENTED: &[u8] = b"HTTP/1.1 501 Not Implemented\r\n\r\n";
pub(crate) const URI_TOO_LONG: &[u8] = b"HTTP/1.1 414 Request-URI Too Long\r\n\r\n";
pub(crate) const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Runtime settings for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    pub acl: Acl,
    /// Queue depth at which new requests get a 503. `None` means unbounded.
    pub maxsize: Option<usize>,
    pub numthreads: usize,
    /// Per-connection socket timeout, also the upstream timeout. Zero
    /// disables it.
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3128)),
            acl: Acl::default(),
            maxsize: None,
            numthreads: 1,
            timeout: Duration::from_secs(60),
        }
    }
}

/// A running proxy: dispatcher thread, worker pool, forwarder thread.
pub struct Proxy {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Mutex<Option<JoinHandle<()>>>,
    forwarder: MultiForwarder,
}

impl Proxy {
    pub fn start(config: ProxyConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .with_context(|| format!("failed to bind {}", config.bind))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            dispatch::LISTENER,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), dispatch::WAKE)?);
        let forwarder = MultiForwarder::start(FLUSH_DELAY)?;
        let stopping = Arc::new(AtomicBool::new(false));

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let agent = worker::build_agent(config.timeout);

        let mut workers = Vec::with_capacity(config.numthreads.max(1));
        for i in 0..config.numthreads.max(1) {
            let ctx = worker::WorkerCtx {
                jobs: jobs_rx.clone(),
                done: done_tx.clone(),
                waker: waker.clone(),
                forwarder: forwarder.clone(),
                agent: agent.clone(),
                timeout: config.timeout,
            };
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker::run(ctx))?,
            );
        }

        let dispatcher = dispatch::Dispatcher {
            poll,
            listener,
            acl: config.acl,
            maxsize: config.maxsize,
            timeout: config.timeout,
            stopping: stopping.clone(),
            jobs: jobs_tx,
            done: done_rx,
            workers,
            clients: HashMap::new(),
            next_token: dispatch::FIRST_CLIENT,
        };
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            local_addr,
            stopping,
            waker,
            handle: Mutex::new(Some(handle)),
            forwarder,
        })
    }

    /// The bound listen address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop dispatcher, workers, and forwarder. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.forwarder.close();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{Shutdown, TcpListener, TcpStream};

    use super::*;
    use crate::http::{self, Headers};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        }
    }

    fn connect(proxy: &Proxy) -> TcpStream {
        let stream = TcpStream::connect(proxy.local_addr()).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    /// Serve `HTTP/1.1 200 OK` with body `hello` for every request on every
    /// connection. The thread leaks blocked in accept; tests end anyway.
    fn spawn_fixed_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut reader = BufReader::new(&stream);
                    loop {
                        if http::read_request_line(&mut reader).is_err() {
                            return;
                        }
                        if http::read_headers(&mut reader).is_err() {
                            return;
                        }
                        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
                        if (&stream).write_all(response).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Read one response head plus, when a length is declared, its body.
    fn read_response(reader: &mut impl BufRead) -> (String, Headers, Vec<u8>) {
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        let headers = http::read_headers(reader).unwrap();
        let body = match headers.content_length() {
            Some(n) => {
                let mut buf = vec![0u8; n as usize];
                reader.read_exact(&mut buf).unwrap();
                buf
            }
            None => Vec::new(),
        };
        (status.trim_end().to_string(), headers, body)
    }

    #[test]
    fn test_get_passthrough_and_rearm() {
        let upstream = spawn_fixed_upstream();
        let proxy = Proxy::start(test_config()).unwrap();
        let mut conn = connect(&proxy);
        let mut reader = BufReader::new(conn.try_clone().unwrap());

        // Two rounds on one connection proves the re-arm path.
        for _ in 0..2 {
            write!(
                conn,
                "GET http://{upstream}/ HTTP/1.1\r\nContent-Length: 0\r\n\r\n"
            )
            .unwrap();
            let (status, headers, body) = read_response(&mut reader);
            assert!(status.starts_with("HTTP/1.1 200"), "got {status:?}");
            assert_eq!(headers.get("content-length"), Some("5"));
            assert_eq!(body, b"hello");
        }
        proxy.stop();
    }

    #[test]
    fn test_unsupported_method_gets_501() {
        let proxy = Proxy::start(test_config()).unwrap();
        let mut conn = connect(&proxy);
        let mut reader = BufReader::new(conn.try_clone().unwrap());

        conn.write_all(b"DELETE http://example.com/ HTTP/1.1\r\n\r\n")
            .unwrap();
        let (status, _, _) = read_response(&mut reader);
        assert!(status.starts_with("HTTP/1.1 501"), "got {status:?}");
        // Still usable afterwards.
        conn.write_all(b"BREW coffee HTTP/1.1\r\n\r\n").unwrap();
        let (status, _, _) = read_response(&mut reader);
        assert!(status.starts_with("HTTP/1.1 501"), "got {status:?}");
        proxy.stop();
    }

    #[test]
    fn test_connect_tunnel() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let proxy = Proxy::start(test_config()).unwrap();
        let mut conn = connect(&proxy);
        let mut reader = BufReader::new(conn.try_clone().unwrap());

        // Payload pipelined right behind the CONNECT head.
        write!(conn, "CONNECT {upstream_addr} HTTP/1.1\r\n\r\nhello world!").unwrap();
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        assert!(status.starts_with("HTTP/1.1 200"), "got {status:?}");
        let mut empty = String::new();
        reader.read_line(&mut empty).unwrap();
        assert_eq!(empty, "\r\n");

        let (mut server, _) = upstream.accept().unwrap();
        server.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut got = [0u8; 12];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello world!");

        server.write_all(b"goodbye world").unwrap();
        let mut back = [0u8; 13];
        reader.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"goodbye world");
        proxy.stop();
    }

    #[test]
    fn test_connect_half_close_propagates() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let proxy = Proxy::start(test_config()).unwrap();
        let mut conn = connect(&proxy);
        let mut reader = BufReader::new(conn.try_clone().unwrap());

        write!(conn, "CONNECT {upstream_addr} HTTP/1.1\r\n\r\n").unwrap();
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        assert!(status.starts_with("HTTP/1.1 200"), "got {status:?}");
        let mut empty = String::new();
        reader.read_line(&mut empty).unwrap();

        let (mut server, _) = upstream.accept().unwrap();
        server.set_read_timeout(Some(TIMEOUT)).unwrap();

        // Client stops sending; the upstream sees EOF but its own writes
        // still reach the client.
        conn.shutdown(Shutdown::Write).unwrap();
        let mut probe = [0u8; 8];
        assert_eq!(server.read(&mut probe).unwrap(), 0);
        server.write_all(b"late data").unwrap();
        let mut got = [0u8; 9];
        reader.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"late data");

        // Upstream closing its side releases the connection fully.
        server.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        proxy.stop();
    }

    #[test]
    fn test_acl_rejects_loopback() {
        let config = ProxyConfig {
            acl: Acl::compile(&["10.0.0.0/8".to_string()], &[]).unwrap(),
            ..test_config()
        };
        let proxy = Proxy::start(config).unwrap();
        let mut conn = connect(&proxy);
        let mut got = Vec::new();
        conn.read_to_end(&mut got).unwrap();
        assert_eq!(got, FORBIDDEN);
        proxy.stop();
    }

    #[test]
    fn test_overload_gets_503() {
        let config = ProxyConfig {
            maxsize: Some(0),
            ..test_config()
        };
        let proxy = Proxy::start(config).unwrap();
        let mut conn = connect(&proxy);
        conn.write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .unwrap();
        let mut got = Vec::new();
        conn.read_to_end(&mut got).unwrap();
        assert_eq!(got, UNAVAILABLE);
        proxy.stop();
    }

    #[test]
    fn test_oversized_request_line_gets_414() {
        let proxy = Proxy::start(test_config()).unwrap();
        let mut conn = connect(&proxy);
        let mut reader = BufReader::new(conn.try_clone().unwrap());

        // 16 KiB without a newline: consumed in two buffer-sized slices,
        // each answered with a 414, and the connection stays usable.
        conn.write_all(&[b'a'; 16 * 1024]).unwrap();
        for _ in 0..2 {
            let (status, _, _) = read_response(&mut reader);
            assert!(status.starts_with("HTTP/1.1 414"), "got {status:?}");
        }
        conn.write_all(b"BREW coffee HTTP/1.1\r\n\r\n").unwrap();
        let (status, _, _) = read_response(&mut reader);
        assert!(status.starts_with("HTTP/1.1 501"), "got {status:?}");
        proxy.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let proxy = Proxy::start(test_config()).unwrap();
        proxy.stop();
        proxy.stop();
    }
}
