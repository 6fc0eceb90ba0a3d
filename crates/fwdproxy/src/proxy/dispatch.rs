use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::client::Client;
use super::{FORBIDDEN, UNAVAILABLE};
use crate::acl::{Acl, Verdict};

pub(crate) const WAKE: Token = Token(0);
pub(crate) const LISTENER: Token = Token(1);
pub(crate) const FIRST_CLIENT: usize = 2;

/// Single-threaded readiness loop owning the listener and all idle clients.
///
/// A readable client leaves the poll set before it enters the worker queue,
/// so one connection is never handled twice at once; it only returns on a
/// re-arm through the done channel and the waker.
pub(crate) struct Dispatcher {
    pub poll: Poll,
    pub listener: TcpListener,
    pub acl: Acl,
    pub maxsize: Option<usize>,
    pub timeout: Duration,
    pub stopping: Arc<AtomicBool>,
    pub jobs: Sender<Client>,
    pub done: Receiver<Client>,
    pub workers: Vec<JoinHandle<()>>,
    pub clients: HashMap<Token, Client>,
    pub next_token: usize,
}

impl Dispatcher {
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("dispatcher poll failed: {err}");
                break;
            }
            let mut stop = false;
            for event in events.iter() {
                match event.token() {
                    WAKE => {
                        if self.stopping.load(Ordering::SeqCst) {
                            stop = true;
                        }
                        self.drain_done();
                    }
                    LISTENER => self.accept_clients(),
                    token => self.queue_client(token),
                }
            }
            if stop {
                break;
            }
        }
        self.teardown();
    }

    fn accept_clients(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return;
                }
            };
            if self.acl.classify(peer.ip()) == Verdict::Reject {
                log::info!("peer={peer} rejected by access rules");
                let mut stream = &stream;
                let _ = stream.write_all(FORBIDDEN);
                continue;
            }
            if let Err(err) = self.admit(stream, peer) {
                log::warn!("peer={peer} not admitted: {err}");
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let timeout = (!self.timeout.is_zero()).then_some(self.timeout);
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        let token = self.alloc_token();
        self.poll.registry().register(
            &mut SourceFd(&stream.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;
        log::debug!("peer={peer} connected");
        self.clients.insert(token, Client::new(stream, peer, token));
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token.max(FIRST_CLIENT));
        self.next_token = token.0 + 1;
        token
    }

    /// Move a readable client from the poll set onto the worker queue, or
    /// turn it away when the queue is at its bound.
    fn queue_client(&mut self, token: Token) {
        let Some(client) = self.clients.remove(&token) else {
            return;
        };
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&client.raw_fd()));
        if self.maxsize.is_some_and(|max| self.jobs.len() >= max) {
            log::info!("peer={} turned away, queue full", client.peer());
            let _ = client.stream().write_all(UNAVAILABLE);
            return;
        }
        // A failed send means the workers are gone; dropping closes.
        let _ = self.jobs.send(client);
    }

    fn drain_done(&mut self) {
        while let Ok(client) = self.done.try_recv() {
            self.rearm(client);
        }
    }

    fn rearm(&mut self, client: Client) {
        let token = client.token();
        match self.poll.registry().register(
            &mut SourceFd(&client.raw_fd()),
            token,
            Interest::READABLE,
        ) {
            Ok(()) => {
                self.clients.insert(token, client);
            }
            Err(err) => {
                log::warn!("peer={} re-register failed, closing: {err}", client.peer());
            }
        }
    }

    fn teardown(self) {
        // Workers see the queue disconnect on their next recv and exit.
        drop(self.jobs);
        for worker in self.workers {
            let _ = worker.join();
        }
        // Remaining clients and the listener close on drop.
    }
}
