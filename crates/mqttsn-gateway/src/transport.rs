// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// UDP transport for MQTT-SN clients.
//
// One socket serves all clients. Reads feed the dispatcher; writes go
// through an unbounded channel drained by a single writer task, so handlers
// never touch the socket directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::protocol::{self, Message};

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Encoded frame waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Sending side of the outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Encode `msg` and queue it for `addr`. Returns false if it was dropped.
    pub fn send(&self, addr: SocketAddr, msg: &Message) -> bool {
        let bytes = match protocol::encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot encode {:?} for {}: {}", msg.msg_type(), addr, e);
                return false;
            }
        };
        tracing::trace!("-> {} {:?} ({} bytes)", addr, msg.msg_type(), bytes.len());
        if self.tx.send(Datagram { addr, bytes }).is_err() {
            tracing::debug!("Outbound queue closed, dropping frame for {}", addr);
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// UDP socket
// ---------------------------------------------------------------------------

/// Consecutive receive errors tolerated before the reader backs off.
const RECV_ERROR_BURST: u32 = 8;
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `consecutive` receive errors in a row, if any.
fn recv_error_backoff(consecutive: u32) -> Option<Duration> {
    if consecutive < RECV_ERROR_BURST {
        return None;
    }
    let doublings = (consecutive - RECV_ERROR_BURST).min(10);
    Some(Duration::from_millis(10u64 << doublings).min(RECV_ERROR_BACKOFF_MAX))
}

/// Gateway UDP endpoint built with `socket2`.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
}

impl UdpTransport {
    /// Bind to `addr` with address reuse enabled.
    pub fn bind(addr: SocketAddr, max_datagram_size: usize) -> std::io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        // tokio requires a non-blocking socket
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket: Arc::new(socket),
            max_datagram_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drain the outbound queue onto the socket until every sender is gone.
    pub async fn run_writer(self, mut rx: mpsc::UnboundedReceiver<Datagram>) {
        while let Some(datagram) = rx.recv().await {
            if let Err(e) = self.socket.send_to(&datagram.bytes, datagram.addr).await {
                tracing::warn!("UDP send to {} failed: {}", datagram.addr, e);
            }
        }
        tracing::debug!("Outbound queue closed, writer stopped");
    }

    /// Receive datagrams forever, handing each to `on_datagram`.
    pub async fn run_reader<F>(&self, mut on_datagram: F)
    where
        F: FnMut(SocketAddr, &[u8]),
    {
        let mut buf = vec![0u8; self.max_datagram_size];
        let mut errors = 0u32;
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    errors = 0;
                    on_datagram(from, &buf[..len]);
                }
                // ICMP errors from earlier sends surface here; keep serving.
                Err(e) => {
                    errors = errors.saturating_add(1);
                    match recv_error_backoff(errors) {
                        None => tracing::debug!("UDP receive error: {}", e),
                        Some(pause) => {
                            tracing::warn!(
                                "UDP receive failing repeatedly ({} in a row), pausing {:?}: {}",
                                errors,
                                pause,
                                e
                            );
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
            }
        }
    }
}
