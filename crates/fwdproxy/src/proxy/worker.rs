use std::io::{self, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use ureq::{Agent, SendBody};

use super::client::{BUF_SIZE, Client};
use super::{CONNECT_OK, NOT_IMPLEMENTED, URI_TOO_LONG};
use crate::forward::MultiForwarder;
use crate::http::{self, Headers, ParseError, RequestLine};

/// What to do with the connection once a request round is over.
enum Disposition {
    /// Hand the client back to the dispatcher for the next request.
    Rearm(Client),
    /// Drop the connection.
    Close,
    /// The forwarder owns the sockets now.
    Forwarded,
}

pub(crate) struct WorkerCtx {
    pub jobs: Receiver<Client>,
    pub done: Sender<Client>,
    pub waker: Arc<Waker>,
    pub forwarder: MultiForwarder,
    pub agent: Agent,
    pub timeout: Duration,
}

pub(crate) fn build_agent(timeout: Duration) -> Agent {
    let timeout = (!timeout.is_zero()).then_some(timeout);
    ureq::config::Config::builder()
        .proxy(None)
        .max_redirects(0)
        .http_status_as_error(false)
        .timeout_global(timeout)
        .build()
        .into()
}

/// Worker main: drain the queue until the dispatcher drops its sender.
pub(crate) fn run(ctx: WorkerCtx) {
    while let Ok(mut client) = ctx.jobs.recv() {
        let peer = client.peer();
        loop {
            match handle_request(client, &ctx) {
                Disposition::Rearm(rearmed) => {
                    // Requests pipelined into the read buffer never show up
                    // in the poller; serve them before handing back.
                    if rearmed.has_buffered() {
                        client = rearmed;
                        continue;
                    }
                    if ctx.done.send(rearmed).is_ok() {
                        let _ = ctx.waker.wake();
                    }
                }
                Disposition::Close => log::debug!("peer={peer} closed"),
                Disposition::Forwarded => log::debug!("peer={peer} handed to forwarder"),
            }
            break;
        }
    }
}

fn handle_request(mut client: Client, ctx: &WorkerCtx) -> Disposition {
    let peer = client.peer();
    let line = match http::read_request_line(client.reader()) {
        Ok(line) => line,
        Err(ParseError::UriTooLong) => {
            // The tail of an unbounded line is unrecoverable; drop what was
            // buffered and answer.
            let _ = client.take_buffered();
            log::warn!("peer={peer} request line too long");
            return respond_canned(client, URI_TOO_LONG);
        }
        Err(ParseError::ConnectionClosed) => {
            log::debug!("peer={peer} closed before request");
            return Disposition::Close;
        }
        Err(err) => {
            log::warn!("peer={peer} bad request: {err}");
            return Disposition::Close;
        }
    };
    let headers = match http::read_headers(client.reader()) {
        Ok(headers) => headers,
        Err(err) => {
            log::warn!("peer={peer} bad headers: {err}");
            return Disposition::Close;
        }
    };
    log::info!("peer={peer} {} {}", line.method, line.target);
    match line.method.as_str() {
        "CONNECT" => do_connect(client, &line.target, ctx),
        "GET" | "POST" | "PUT" => do_basic(client, &line, &headers, ctx),
        _ => respond_canned(client, NOT_IMPLEMENTED),
    }
}

/// Open a tunnel to `host:port` and hand both sockets to the forwarder.
fn do_connect(mut client: Client, target: &str, ctx: &WorkerCtx) -> Disposition {
    let peer = client.peer();
    let upstream = match connect_upstream(target, ctx.timeout) {
        Ok(upstream) => upstream,
        Err(err) => {
            log::warn!("peer={peer} CONNECT {target} failed: {err}");
            let _ = write_error(&client, 404, "Not Found", &err.to_string());
            return Disposition::Close;
        }
    };
    // Clients often pipeline the first TLS record right behind the CONNECT
    // head; whatever is already buffered must reach the upstream before
    // opaque forwarding starts.
    let early = client.take_buffered();
    if !early.is_empty() {
        if let Err(err) = (&upstream).write_all(&early) {
            log::warn!("peer={peer} early tunnel bytes failed: {err}");
            return Disposition::Close;
        }
    }
    if write_all_flush(&client, CONNECT_OK).is_err() {
        return Disposition::Close;
    }
    log::info!("peer={peer} tunnel to {target}");
    ctx.forwarder.add(client.detach(), upstream, true);
    Disposition::Forwarded
}

fn connect_upstream(target: &str, timeout: Duration) -> io::Result<TcpStream> {
    let authority = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:443")
    };
    let mut last_err = None;
    for addr in authority.to_socket_addrs()? {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {authority}"))
    }))
}

/// Re-issue a GET/POST/PUT upstream and stream the response back.
fn do_basic(mut client: Client, line: &RequestLine, headers: &Headers, ctx: &WorkerCtx) -> Disposition {
    let peer = client.peer();
    let body_method = matches!(line.method.as_str(), "POST" | "PUT");
    let content_length = headers.content_length();

    let mut request = ureq::http::Request::builder()
        .method(line.method.as_str())
        .uri(line.target.as_str());
    for (name, value) in headers.iter() {
        if skip_request_header(name) {
            continue;
        }
        request = request.header(name, value);
    }
    // Identity keeps bodies byte-for-byte; lengths stay truthful downstream.
    request = request.header("accept-encoding", "identity");
    if let Some(n) = content_length {
        request = request.header("content-length", n.to_string());
    }

    // Without a length the request body runs to EOF and the connection
    // cannot be reused afterwards.
    let mut body_to_eof = false;
    let result = match content_length {
        Some(n) => {
            let mut body = client.reader().take(n);
            let result = run_upstream(ctx, request, SendBody::from_reader(&mut body));
            if result.is_err() {
                // Clear any unsent body bytes so the next round parses clean.
                let _ = io::copy(&mut body, &mut io::sink());
            }
            result
        }
        None if body_method => {
            body_to_eof = true;
            run_upstream(ctx, request, SendBody::from_reader(client.reader()))
        }
        None => run_upstream(ctx, request, SendBody::none()),
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            log::warn!("peer={peer} upstream error: {err}");
            let _ = write_error(&client, 500, "Server Error", &err.to_string());
            return if body_to_eof {
                Disposition::Close
            } else {
                Disposition::Rearm(client)
            };
        }
    };

    let has_length = response
        .headers()
        .contains_key(ureq::http::header::CONTENT_LENGTH);
    let (parts, body) = response.into_parts();
    if let Err(err) = stream_response(&client, &parts, body.into_reader()) {
        // Mid-stream failures never get an error status spliced in.
        log::debug!("peer={peer} response relay failed: {err}");
        return Disposition::Close;
    }
    if body_to_eof || !has_length {
        Disposition::Close
    } else {
        Disposition::Rearm(client)
    }
}

fn run_upstream(
    ctx: &WorkerCtx,
    builder: ureq::http::request::Builder,
    body: SendBody,
) -> anyhow::Result<ureq::http::Response<ureq::Body>> {
    let request = builder.body(body)?;
    Ok(ctx.agent.run(request)?)
}

/// Write status line, surviving headers, and the streamed body.
fn stream_response(
    client: &Client,
    parts: &ureq::http::response::Parts,
    mut body: impl Read,
) -> io::Result<()> {
    let mut writer = BufWriter::with_capacity(BUF_SIZE, client.stream());
    let status = parts.status;
    write!(
        writer,
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )?;
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        writer.write_all(name.as_str().as_bytes())?;
        writer.write_all(b": ")?;
        writer.write_all(value.as_bytes())?;
        writer.write_all(b"\r\n")?;
    }
    writer.write_all(b"\r\n")?;
    io::copy(&mut body, &mut writer)?;
    writer.flush()
}

fn respond_canned(client: Client, bytes: &[u8]) -> Disposition {
    match write_all_flush(&client, bytes) {
        Ok(()) => Disposition::Rearm(client),
        Err(_) => Disposition::Close,
    }
}

fn write_all_flush(client: &Client, bytes: &[u8]) -> io::Result<()> {
    let mut stream = client.stream();
    stream.write_all(bytes)?;
    stream.flush()
}

fn write_error(client: &Client, status: u16, reason: &str, body: &str) -> io::Result<()> {
    let mut stream = client.stream();
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}

/// Headers scoped to a single connection; forwarding them to the next hop
/// would misdescribe that link (keep-alive, framing, upgrades).
const CONNECTION_SCOPED: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    CONNECTION_SCOPED
        .iter()
        .any(|scoped| name.eq_ignore_ascii_case(scoped))
}

fn skip_request_header(name: &str) -> bool {
    // Host tracks the target URI, lengths and codings are regenerated.
    is_hop_by_hop(name)
        || matches!(name, "accept-encoding" | "content-length" | "host")
}
