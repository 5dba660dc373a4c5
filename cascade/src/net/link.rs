//! Outgoing connections, one per (peer, channel kind).
//!
//! Connections are opened on first use and announced with a `Hello` frame. A
//! connection whose write fails is evicted; the next send opens a new one.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::trace::{debug, warn};
use crate::types::PartitionId;

use super::metrics::TransportMetrics;
use super::protocol::{ChannelKind, Hello, Message};
use super::{Membership, TransportError};

type Connection = Arc<Mutex<TcpStream>>;

pub(crate) struct Links {
    membership: Arc<Membership>,
    metrics: Arc<TransportMetrics>,
    connections: Mutex<HashMap<(PartitionId, ChannelKind), Connection>>,
}

impl Links {
    pub(crate) fn new(membership: Arc<Membership>, metrics: Arc<TransportMetrics>) -> Self {
        Self {
            membership,
            metrics,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Writes one message to `dest` over the `kind` connection.
    pub(crate) fn send(
        &self,
        dest: PartitionId,
        kind: ChannelKind,
        msg: &Message,
    ) -> Result<(), TransportError> {
        let mut frame = Vec::new();
        msg.encode(&mut frame)?;

        let connection = self.connection(dest, kind)?;
        let written = connection.lock().write_all(&frame);
        if let Err(e) = written {
            warn!(
                dest = %dest,
                channel = ?kind,
                tag = msg.tag(),
                error = %e,
                "write failed, evicting connection"
            );
            self.evict(dest, kind, &connection);
            return Err(TransportError::Send { dest, source: e });
        }
        self.metrics.record_sent(frame.len());
        Ok(())
    }

    fn connection(&self, dest: PartitionId, kind: ChannelKind) -> Result<Connection, TransportError> {
        if let Some(c) = self.connections.lock().get(&(dest, kind)) {
            return Ok(Arc::clone(c));
        }

        let endpoint = self
            .membership
            .endpoint(dest)
            .ok_or(TransportError::UnknownPartition(dest))?;
        let connect_err = |source| TransportError::Connect {
            dest,
            endpoint,
            source,
        };
        let mut stream = TcpStream::connect(endpoint.as_socket_addr()).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;

        let mut hello = Vec::new();
        Message::Hello(Hello {
            partition: self.membership.partition(),
            channel: kind,
        })
        .encode(&mut hello)?;
        stream.write_all(&hello).map_err(connect_err)?;
        debug!(dest = %dest, endpoint = %endpoint, channel = ?kind, "connection opened");

        // Another thread may have connected meanwhile; keep the first one.
        let mut connections = self.connections.lock();
        let c = connections
            .entry((dest, kind))
            .or_insert_with(|| Arc::new(Mutex::new(stream)));
        Ok(Arc::clone(c))
    }

    fn evict(&self, dest: PartitionId, kind: ChannelKind, failed: &Connection) {
        let mut connections = self.connections.lock();
        if let Some(current) = connections.get(&(dest, kind))
            && Arc::ptr_eq(current, failed)
        {
            connections.remove(&(dest, kind));
        }
    }

    /// Drops every cached connection.
    pub(crate) fn close_all(&self) {
        let mut connections = self.connections.lock();
        for ((dest, kind), c) in connections.drain() {
            let _ = c.lock().shutdown(std::net::Shutdown::Both);
            debug!(dest = %dest, channel = ?kind, "connection closed");
        }
    }
}
