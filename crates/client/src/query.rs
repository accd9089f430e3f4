//! One-shot ping and server-info requests.
//!
//! A query opens its own stream, sends a handshake header without a net
//! layer payload and waits for the host's single response. It never joins
//! the session.

use crate::error::ClientError;
use anyhow::Result;
use bomberboy_core::{ByteBuffer, Decode, DecodeContext, Encode, Version, ENGINE_VERSION};
use bomberboy_net::{HandshakeHeader, RequestType, ResponseCode, ServerInfo, StreamConnection};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Answer to a [`ServerQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// The host answered a ping.
    Pong {
        /// Time from sending the request to reading the answer.
        round_trip: Duration,
    },
    /// The host described itself.
    Info(ServerInfo),
}

/// An outstanding ping or query, polled without blocking.
#[derive(Debug)]
pub struct ServerQuery {
    stream: StreamConnection,
    request: RequestType,
    sent_at: Instant,
    timeout: Duration,
}

impl ServerQuery {
    /// Send a ping to `addr`.
    pub fn ping(addr: SocketAddr, game_version: Version, timeout: Duration) -> Result<Self> {
        Self::send(addr, game_version, RequestType::Ping, timeout)
    }

    /// Ask `addr` for its [`ServerInfo`].
    pub fn query(addr: SocketAddr, game_version: Version, timeout: Duration) -> Result<Self> {
        Self::send(addr, game_version, RequestType::Query, timeout)
    }

    fn send(addr: SocketAddr, game_version: Version, request: RequestType, timeout: Duration) -> Result<Self> {
        let mut stream = StreamConnection::connect(addr, timeout)?;
        let mut buffer = ByteBuffer::new();
        HandshakeHeader {
            engine_version: ENGINE_VERSION,
            game_version,
            request,
        }
        .encode(&mut buffer);
        stream.send(buffer.data())?;
        stream.flush();
        debug!(%addr, ?request, "Query sent");
        Ok(Self {
            stream,
            request,
            sent_at: Instant::now(),
            timeout,
        })
    }

    /// Check for the answer. Returns `None` while it is still outstanding.
    pub fn poll(&mut self) -> Option<Result<QueryReply, ClientError>> {
        self.stream.flush();
        if let Some(frame) = self.stream.receive().into_iter().next() {
            return Some(self.parse(&frame));
        }
        if self.stream.is_closed() {
            return Some(Err(ClientError::Closed));
        }
        if self.sent_at.elapsed() > self.timeout {
            return Some(Err(ClientError::Timeout));
        }
        None
    }

    /// Block until the answer arrives or the timeout passes.
    pub fn wait(mut self) -> Result<QueryReply, ClientError> {
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn parse(&self, frame: &[u8]) -> Result<QueryReply, ClientError> {
        let mut buffer = ByteBuffer::from_wire(frame);
        let cx = DecodeContext::detached();
        let code = ResponseCode::decode(&mut buffer, &cx)?;
        if code != ResponseCode::Responded {
            return Err(ClientError::Rejected(code));
        }
        match self.request {
            RequestType::Query => Ok(QueryReply::Info(ServerInfo::decode(&mut buffer, &cx)?)),
            _ => Ok(QueryReply::Pong {
                round_trip: self.sent_at.elapsed(),
            }),
        }
    }
}
