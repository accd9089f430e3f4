//! Non-blocking reliable (TCP) and unreliable (UDP) socket wrappers.
//!
//! Both transports are polled from the session's update tick; nothing here
//! blocks or spawns threads. Outgoing stream data is buffered per connection
//! and written as far as the kernel accepts; the remainder is retried on the
//! next flush.

use crate::conditioner::LossConditioner;
use crate::framing::{decode_datagram, encode_frame, FrameDecoder};
use crate::identity::NetIdentity;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 4096;

/// A received frame payload and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sender identity.
    pub source: NetIdentity,
    /// Frame payload without its length prefix.
    pub payload: Vec<u8>,
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Frames handed to the kernel (or queued for it).
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Outgoing datagrams dropped by the loss conditioner.
    pub datagrams_dropped: u64,
    /// Incoming datagrams with a bad length prefix or from unknown peers.
    pub datagrams_rejected: u64,
}

/// One reliable stream with its reassembly and outbound buffers.
#[derive(Debug)]
pub struct StreamConnection {
    stream: TcpStream,
    peer: NetIdentity,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    closing: bool,
    closed: bool,
}

impl StreamConnection {
    /// Connect to `addr`, blocking at most `timeout`, then switch to
    /// non-blocking mode.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .with_context(|| format!("failed to connect to {addr}"))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = NetIdentity::from(stream.peer_addr()?);
        Ok(Self {
            stream,
            peer,
            decoder: FrameDecoder::new(),
            outbox: Vec::new(),
            closing: false,
            closed: false,
        })
    }

    /// Remote identity.
    pub fn peer(&self) -> NetIdentity {
        self.peer
    }

    /// Local address of the stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Whether the peer closed the stream or an I/O error ended it.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes waiting to be written.
    pub fn backlog(&self) -> usize {
        self.outbox.len()
    }

    /// Queue one frame.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        self.outbox.extend_from_slice(&frame);
        Ok(())
    }

    /// Close once every queued byte has been written.
    pub fn close_after_flush(&mut self) {
        self.closing = true;
    }

    /// Whether the connection is waiting to close.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Read everything the kernel holds and return complete frames.
    pub fn receive(&mut self) -> Vec<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(peer = %self.peer, %err, "Stream read failed");
                    self.closed = true;
                    break;
                }
            }
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Write as much of the outbox as the kernel accepts. Returns `true` once
    /// the outbox is empty.
    pub fn flush(&mut self) -> bool {
        while !self.outbox.is_empty() && !self.closed {
            match self.stream.write(&self.outbox) {
                Ok(0) => {
                    self.closed = true;
                }
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(peer = %self.peer, %err, "Stream write failed");
                    self.closed = true;
                }
            }
        }
        if self.outbox.is_empty() && self.closing && !self.closed {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
        self.outbox.is_empty()
    }

    /// Shut the stream down immediately, discarding queued data.
    pub fn shutdown(&mut self) {
        self.outbox.clear();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.closed = true;
    }
}

/// Result of one [`ReliableListener::poll`].
#[derive(Debug, Default)]
pub struct ReliablePoll {
    /// Connection accepted during this poll.
    pub accepted: Option<NetIdentity>,
    /// Frames received, in stream order per peer.
    pub packets: Vec<Packet>,
    /// Peers whose stream ended; they have been removed.
    pub closed: Vec<NetIdentity>,
}

/// Host-side stream listener with its accepted connections.
#[derive(Debug)]
pub struct ReliableListener {
    listener: TcpListener,
    connections: BTreeMap<NetIdentity, StreamConnection>,
    stats: SocketStats,
}

impl ReliableListener {
    /// Bind a non-blocking listener.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind stream listener on {addr}"))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: BTreeMap::new(),
            stats: SocketStats::default(),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept at most one connection, then drain every stream.
    pub fn poll(&mut self) -> ReliablePoll {
        let mut poll = ReliablePoll::default();
        match self.listener.accept() {
            Ok((stream, addr)) => match StreamConnection::from_stream(stream) {
                Ok(connection) => {
                    let identity = NetIdentity::from(addr);
                    debug!(%identity, "Stream accepted");
                    self.connections.insert(identity, connection);
                    poll.accepted = Some(identity);
                }
                Err(err) => warn!(%addr, %err, "Failed to configure accepted stream"),
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(%err, "Accept failed"),
        }

        for (identity, connection) in self.connections.iter_mut() {
            for payload in connection.receive() {
                self.stats.frames_received += 1;
                poll.packets.push(Packet {
                    source: *identity,
                    payload,
                });
            }
            if connection.is_closed() {
                poll.closed.push(*identity);
            }
        }
        for identity in &poll.closed {
            self.connections.remove(identity);
        }
        poll
    }

    /// Whether `identity` has a live stream.
    pub fn is_connected(&self, identity: &NetIdentity) -> bool {
        self.connections.contains_key(identity)
    }

    /// Queue a frame for `identity`.
    pub fn send(&mut self, identity: &NetIdentity, payload: &[u8]) -> Result<()> {
        let connection = self
            .connections
            .get_mut(identity)
            .with_context(|| format!("no stream to {identity}"))?;
        connection.send(payload)?;
        self.stats.frames_sent += 1;
        trace!(%identity, bytes = payload.len(), "Reliable frame queued");
        Ok(())
    }

    /// Close the stream to `identity` once its queued frames are written.
    pub fn close_after_flush(&mut self, identity: &NetIdentity) {
        if let Some(connection) = self.connections.get_mut(identity) {
            connection.close_after_flush();
        }
    }

    /// Drop the stream to `identity` immediately.
    pub fn disconnect(&mut self, identity: &NetIdentity) {
        if let Some(mut connection) = self.connections.remove(identity) {
            connection.shutdown();
        }
    }

    /// Bytes waiting for `identity`.
    pub fn backlog(&self, identity: &NetIdentity) -> usize {
        self.connections.get(identity).map_or(0, StreamConnection::backlog)
    }

    /// Write queued data on every stream. Streams that finished closing are
    /// removed and returned.
    pub fn flush(&mut self) -> Vec<NetIdentity> {
        let mut finished = Vec::new();
        for (identity, connection) in self.connections.iter_mut() {
            connection.flush();
            if connection.is_closed() {
                finished.push(*identity);
            }
        }
        for identity in &finished {
            self.connections.remove(identity);
        }
        finished
    }

    /// Number of live streams.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Traffic counters.
    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    /// Close every stream.
    pub fn shutdown(&mut self) {
        for connection in self.connections.values_mut() {
            connection.shutdown();
        }
        self.connections.clear();
    }
}

/// Non-blocking datagram socket carrying one frame per datagram.
#[derive(Debug)]
pub struct UnreliableSocket {
    socket: UdpSocket,
    max_datagram_size: usize,
    conditioner: LossConditioner,
    stats: SocketStats,
}

impl UnreliableSocket {
    /// Bind a non-blocking datagram socket.
    pub fn bind(addr: SocketAddr, max_datagram_size: usize) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("failed to bind datagram socket on {addr}"))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            max_datagram_size,
            conditioner: LossConditioner::Off,
            stats: SocketStats::default(),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Largest datagram sent or accepted, header included.
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// Install a loss conditioner for outgoing datagrams.
    pub fn set_conditioner(&mut self, conditioner: LossConditioner) {
        self.conditioner = conditioner;
    }

    /// Send one frame. Returns `Ok(false)` when the datagram was dropped by
    /// the conditioner or the kernel buffer was full.
    pub fn send_to(&mut self, target: &NetIdentity, payload: &[u8]) -> Result<bool> {
        let frame = encode_frame(payload)?;
        if frame.len() > self.max_datagram_size {
            warn!(%target, bytes = frame.len(), "Datagram exceeds the size limit; not sent");
            return Ok(false);
        }
        if self.conditioner.should_drop() {
            self.stats.datagrams_dropped += 1;
            trace!(%target, "Datagram dropped by conditioner");
            return Ok(false);
        }
        match self.socket.send_to(&frame, target.socket_addr()) {
            Ok(_) => {
                self.stats.frames_sent += 1;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err).with_context(|| format!("datagram send to {target} failed")),
        }
    }

    /// Drain every datagram the kernel holds.
    pub fn poll(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut buffer = vec![0u8; self.max_datagram_size.max(crate::framing::FRAME_HEADER_LEN)];
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, addr)) => match decode_datagram(&buffer[..len]) {
                    Ok(payload) => {
                        self.stats.frames_received += 1;
                        packets.push(Packet {
                            source: NetIdentity::from(addr),
                            payload: payload.to_vec(),
                        });
                    }
                    Err(err) => {
                        self.stats.datagrams_rejected += 1;
                        debug!(%addr, %err, "Malformed datagram dropped");
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    debug!(%err, "Datagram receive failed");
                    break;
                }
            }
        }
        packets
    }

    /// Count a datagram rejected by the session (unknown sender).
    pub fn note_rejected(&mut self) {
        self.stats.datagrams_rejected += 1;
    }

    /// Traffic counters.
    pub fn stats(&self) -> SocketStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = poll() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn stream_frames_arrive_in_order() {
        let mut listener = ReliableListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = StreamConnection::connect(addr, Duration::from_secs(1)).unwrap();

        let identity = wait_for(|| listener.poll().accepted);
        assert!(listener.is_connected(&identity));

        client.send(b"one").unwrap();
        client.send(b"two").unwrap();
        assert!(client.flush());

        let mut received = Vec::new();
        wait_for(|| {
            received.extend(listener.poll().packets.into_iter().map(|p| p.payload));
            (received.len() >= 2).then_some(())
        });
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn close_after_flush_delivers_then_closes() {
        let mut listener = ReliableListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = StreamConnection::connect(addr, Duration::from_secs(1)).unwrap();
        let identity = wait_for(|| listener.poll().accepted);

        listener.send(&identity, b"bye").unwrap();
        listener.close_after_flush(&identity);
        let finished = listener.flush();
        assert_eq!(finished, vec![identity]);

        let mut frames = Vec::new();
        wait_for(|| {
            frames.extend(client.receive());
            client.is_closed().then_some(())
        });
        assert_eq!(frames, vec![b"bye".to_vec()]);
    }

    #[test]
    fn datagrams_carry_one_frame() {
        let mut a = UnreliableSocket::bind(loopback(), 1200).unwrap();
        let mut b = UnreliableSocket::bind(loopback(), 1200).unwrap();
        let b_identity = NetIdentity::from(b.local_addr().unwrap());
        assert!(a.send_to(&b_identity, b"ping").unwrap());
        let packets = wait_for(|| {
            let packets = b.poll();
            (!packets.is_empty()).then_some(packets)
        });
        assert_eq!(packets[0].payload, b"ping".to_vec());
        assert_eq!(packets[0].source, NetIdentity::from(a.local_addr().unwrap()));
    }

    #[test]
    fn conditioner_drops_outgoing_datagrams() {
        let mut a = UnreliableSocket::bind(loopback(), 1200).unwrap();
        let b = UnreliableSocket::bind(loopback(), 1200).unwrap();
        let target = NetIdentity::from(b.local_addr().unwrap());
        a.set_conditioner(LossConditioner::pattern(vec![true, false]));
        assert!(!a.send_to(&target, b"x").unwrap());
        assert!(a.send_to(&target, b"y").unwrap());
        assert_eq!(a.stats().datagrams_dropped, 1);
    }

    #[test]
    fn oversized_datagrams_are_not_sent() {
        let mut a = UnreliableSocket::bind(loopback(), 16).unwrap();
        let b = UnreliableSocket::bind(loopback(), 16).unwrap();
        let target = NetIdentity::from(b.local_addr().unwrap());
        assert!(!a.send_to(&target, &[0u8; 32]).unwrap());
    }
}
