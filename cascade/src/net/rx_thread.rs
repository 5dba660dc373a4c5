//! Transport RX thread.
//!
//! Responsibilities:
//! - Accept peer connections on the node's listener.
//! - Require a `Hello` as the first frame of every connection.
//! - Split the byte streams into frames and hand decoded messages to the
//!   transport's dispatcher.
//! - Hold a chain the node cannot take yet and stop reading that connection
//!   until it is accepted. Other connections, control replies included, keep
//!   flowing; the sender sees TCP backpressure.
//!
//! Malformed frames close the offending connection; they never stop the
//! thread.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::chain::Chain;
use crate::trace::{debug, error, info, trace, warn};
use crate::types::PartitionId;

use super::frame::FrameBuffer;
use super::protocol::{ChannelKind, Message};
use super::transport::Transport;

const LISTENER: Token = Token(0);

/// Upper bound on how long a shutdown request goes unnoticed.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Retry interval for held chains.
const STALL_RETRY: Duration = Duration::from_millis(5);

const READ_CHUNK: usize = 64 * 1024;

struct Connection {
    stream: TcpStream,
    /// Set by the `Hello` frame.
    peer: Option<(PartitionId, ChannelKind)>,
    frames: FrameBuffer,
    /// Chain refused by the node; nothing else is read until it is taken.
    stalled: Option<Chain>,
    /// The peer closed its side; close once the buffered frames are handled.
    eof: bool,
}

enum Drain {
    /// Every buffered frame was handled.
    Idle,
    Stalled,
    Broken,
}

pub(crate) struct RxThread {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    transport: Arc<Transport>,
    shutdown: Arc<AtomicBool>,
    read_buf: Vec<u8>,
}

impl RxThread {
    pub(crate) fn new(
        listener: std::net::TcpListener,
        transport: Arc<Transport>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: 1,
            transport,
            shutdown,
            read_buf: vec![0; READ_CHUNK],
        })
    }

    /// Runs the event loop until the shutdown flag is set.
    pub(crate) fn run(&mut self) {
        let mut events = Events::with_capacity(256);
        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = if self.connections.values().any(|c| c.stalled.is_some()) {
                STALL_RETRY
            } else {
                POLL_TIMEOUT
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "RX: poll failed");
                return;
            }
            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    token => self.service(token),
                }
            }
            self.resume_stalled();
        }
        info!(connections = self.connections.len(), "RX: shutdown requested");
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(addr = %addr, error = %e, "RX: failed to register connection");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %addr, token = token.0, "RX: connection accepted");
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            peer: None,
                            frames: FrameBuffer::new(),
                            stalled: None,
                            eof: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "RX: accept failed");
                    return;
                }
            }
        }
    }

    /// Handles buffered frames, then reads more while the connection is not
    /// stalled.
    fn service(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let open = loop {
            match drain(&self.transport, conn) {
                Drain::Idle => {}
                Drain::Stalled => break true,
                Drain::Broken => break false,
            }
            if conn.eof {
                break false;
            }
            if fill(conn, &mut self.read_buf, token) == 0 && !conn.eof {
                break true;
            }
        };

        if !open {
            self.close(token);
        }
    }

    fn resume_stalled(&mut self) {
        let stalled: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.stalled.is_some())
            .map(|(token, _)| *token)
            .collect();
        for token in stalled {
            self.service(token);
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(token = token.0, peer = ?conn.peer, "RX: connection closed");
        }
    }
}

/// Reads until the socket would block. Returns the number of bytes read.
fn fill(conn: &mut Connection, buf: &mut [u8], token: Token) -> usize {
    let mut total = 0;
    loop {
        match conn.stream.read(buf) {
            Ok(0) => {
                conn.eof = true;
                return total;
            }
            Ok(n) => {
                conn.frames.extend(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return total,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(token = token.0, error = %e, "RX: read failed");
                conn.eof = true;
                return total;
            }
        }
    }
}

/// Dispatches buffered frames until they run out or a chain is refused.
fn drain(transport: &Transport, conn: &mut Connection) -> Drain {
    if let Some(chain) = conn.stalled.take() {
        if let Err(chain) = transport.inbound().offer_chain(chain) {
            conn.stalled = Some(chain);
            return Drain::Stalled;
        }
        trace!(peer = ?conn.peer, "RX: held chain accepted");
    }

    loop {
        let msg = match conn.frames.next_frame() {
            Ok(Some(frame)) => {
                transport.metrics().record_received(frame.len());
                Message::decode(frame)
            }
            Ok(None) => return Drain::Idle,
            Err(e) => {
                warn!(peer = ?conn.peer, error = %e, "RX: corrupt frame stream");
                return Drain::Broken;
            }
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = ?conn.peer, error = %e, "RX: dropping malformed frame");
                continue;
            }
        };
        match (conn.peer, msg) {
            (None, Message::Hello(hello)) => {
                trace!(
                    partition = %hello.partition,
                    channel = ?hello.channel,
                    "RX: hello"
                );
                conn.peer = Some((hello.partition, hello.channel));
            }
            (None, other) => {
                warn!(tag = other.tag(), "RX: first frame is not a hello, closing");
                return Drain::Broken;
            }
            (Some((from, _)), msg) => {
                if let Some(chain) = transport.dispatch(from, msg) {
                    debug!(from = %from, chain = %chain.id(), "RX: node busy, holding chain");
                    conn.stalled = Some(chain);
                    return Drain::Stalled;
                }
            }
        }
    }
}
