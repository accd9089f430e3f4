//! Loopback host with any number of clients, each over its own [`Game`].

use crate::classes::test_game;
use anyhow::{anyhow, bail, Result};
use bomberboy_client::{ClientSession, ConnectionState};
use bomberboy_core::Game;
use bomberboy_server::HostSession;
use bomberboy_net::SessionConfig;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default wait used by [`LoopbackSession::join`] and the settle helpers.
pub const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

const PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// One client and the game it replicates into.
pub struct LoopbackClient {
    /// Client connection.
    pub session: ClientSession,
    /// Client-side world.
    pub game: Game,
}

impl LoopbackClient {
    /// Player id assigned by the host, once admitted.
    pub fn player_id(&self) -> Option<u16> {
        self.session.player_id()
    }
}

/// Host and clients sharing one process, pumped in lockstep.
pub struct LoopbackSession {
    /// Host session.
    pub host: HostSession,
    /// Authoritative world.
    pub host_game: Game,
    /// Joined (or joining) clients, in join order.
    pub clients: Vec<LoopbackClient>,
    addr: SocketAddr,
}

impl LoopbackSession {
    /// Start a host on an ephemeral loopback port over [`test_game`].
    pub fn start() -> Result<Self> {
        Self::start_with(SessionConfig::loopback(), test_game())
    }

    /// Start a host with explicit settings and world.
    pub fn start_with(config: SessionConfig, mut host_game: Game) -> Result<Self> {
        let mut host = HostSession::new(config);
        host.start(&mut host_game)?;
        let addr = host
            .local_addr()
            .ok_or_else(|| anyhow!("host started without a local address"))?;
        Ok(Self {
            host,
            host_game,
            clients: Vec::new(),
            addr,
        })
    }

    /// Address clients connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect a client named `name` with the host's password and wait
    /// for admission. Returns the client's index.
    pub fn join(&mut self, name: &str) -> Result<usize> {
        let config = SessionConfig {
            player_name: name.to_string(),
            password: self.host.config().password.clone(),
            ..SessionConfig::loopback()
        };
        self.join_with(config, test_game())
    }

    /// Connect a client with explicit settings and world, waiting until
    /// the handshake resolves either way.
    pub fn join_with(&mut self, config: SessionConfig, game: Game) -> Result<usize> {
        let index = self.connect_with(config, game)?;
        self.pump_until(PUMP_TIMEOUT, |session| {
            session.clients[index].session.state() != ConnectionState::Handshaking
        });
        let client = &self.clients[index].session;
        if client.is_connected() {
            debug!(index, player_id = ?client.player_id(), "Loopback client joined");
            return Ok(index);
        }
        match client.last_disconnect().and_then(|reason| reason.as_error()) {
            Some(err) => Err(err.into()),
            None => bail!("client {index} never finished its handshake"),
        }
    }

    /// Start connecting a client without waiting. Returns its index.
    pub fn connect_with(&mut self, config: SessionConfig, game: Game) -> Result<usize> {
        let mut client = LoopbackClient {
            session: ClientSession::new(config),
            game,
        };
        client.session.connect(self.addr, &client.game)?;
        self.clients.push(client);
        Ok(self.clients.len() - 1)
    }

    /// Client at `index`.
    pub fn client(&self, index: usize) -> &LoopbackClient {
        &self.clients[index]
    }

    /// Mutable client at `index`.
    pub fn client_mut(&mut self, index: usize) -> &mut LoopbackClient {
        &mut self.clients[index]
    }

    /// Run one host update followed by one update per client.
    pub fn pump(&mut self) {
        self.host.update(&mut self.host_game);
        for client in &mut self.clients {
            client.session.update(&mut client.game);
        }
    }

    /// Run one host update followed by updates for the listed clients only.
    /// The others stop reading, as a hung peer would.
    pub fn pump_clients(&mut self, indices: &[usize]) {
        self.host.update(&mut self.host_game);
        for index in indices {
            if let Some(client) = self.clients.get_mut(*index) {
                client.session.update(&mut client.game);
            }
        }
    }

    /// Pump until `done` holds or `timeout` passes. Returns whether
    /// `done` held.
    pub fn pump_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(PUMP_INTERVAL);
        }
    }

    /// Pump for `rounds` iterations regardless of progress, so in-flight
    /// traffic lands and nothing further arrives.
    pub fn settle(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.pump();
            std::thread::sleep(PUMP_INTERVAL);
        }
    }

    /// Disconnect every client, then stop the host.
    pub fn shutdown(&mut self) {
        for client in &mut self.clients {
            client.session.disconnect(&mut client.game);
        }
        self.host.stop(&mut self.host_game);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bomberboy_client::ClientError;
    use bomberboy_net::ResponseCode;

    #[test]
    fn clients_join_with_sequential_ids() {
        let mut session = LoopbackSession::start().unwrap();
        let a = session.join("alice").unwrap();
        let b = session.join("bob").unwrap();
        assert_eq!(session.client(a).player_id(), Some(1));
        assert_eq!(session.client(b).player_id(), Some(2));
        assert_eq!(session.host.client_count(), 2);
        session.shutdown();
        assert!(!session.host.is_running());
    }

    #[test]
    fn wrong_password_surfaces_the_rejection() {
        let config = SessionConfig {
            password: "secret".to_string(),
            ..SessionConfig::loopback()
        };
        let mut session = LoopbackSession::start_with(config, test_game()).unwrap();
        let err = session
            .join_with(
                SessionConfig {
                    password: "guess".to_string(),
                    ..SessionConfig::loopback()
                },
                test_game(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::Rejected(ResponseCode::BadAuthentication))
        ));
        assert!(session.join("insider").is_ok());
    }
}
