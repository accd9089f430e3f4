//! Client session: handshake, inbound replication and outbound RPCs.

use crate::error::ClientError;
use anyhow::{Context, Result};
use bomberboy_core::{
    ByteBuffer, CallingMode, Decode, DecodeContext, Encode, Game, NetObject, NetObjectExt,
    NetRole, RpcTarget, SocketClass, ENGINE_VERSION, GAME_RPC_SWITCH_LEVEL,
};
use bomberboy_net::{
    decode_messages, DefaultNetLayer, FrameBuilder, HandshakeHeader, LossConditioner,
    MessageBody, NetIdentity, NetLayer, NetMessage, RequestType, ResponseCode, SessionConfig,
    SocketStats, StreamConnection, SyncEntry, UnreliableSocket, MAX_FRAME_PAYLOAD,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Connect request sent, waiting for the host's answer.
    Handshaking,
    /// Admitted and replicating.
    Connected {
        /// Player id assigned by the host.
        player_id: u16,
    },
}

/// Why the session last returned to [`ConnectionState::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`ClientSession::disconnect`] was called.
    Requested,
    /// The host did not answer the handshake in time.
    Timeout,
    /// The host refused the connect request.
    Rejected(ResponseCode),
    /// The handshake answer could not be understood.
    BadResponse,
    /// The host closed the stream.
    Closed,
}

impl DisconnectReason {
    /// The reason as a client error, if it was a failure.
    pub fn as_error(&self) -> Option<ClientError> {
        match self {
            Self::Requested => None,
            Self::Timeout => Some(ClientError::Timeout),
            Self::Rejected(code) => Some(ClientError::Rejected(*code)),
            Self::BadResponse | Self::Closed => Some(ClientError::Closed),
        }
    }
}

/// A remote player's connection to a host.
pub struct ClientSession<L: NetLayer = DefaultNetLayer> {
    /// Player name, password and limits.
    config: SessionConfig,

    /// Encodes the connect payload.
    layer: L,

    state: ConnectionState,

    /// Stream to the host.
    stream: Option<StreamConnection>,

    /// Datagram socket bound to the stream's local address.
    datagrams: Option<UnreliableSocket>,

    /// Host address; datagrams from anywhere else are dropped.
    host: Option<NetIdentity>,

    handshake_started: Option<Instant>,
    last_disconnect: Option<DisconnectReason>,
    malformed_frames: u32,
}

impl ClientSession<DefaultNetLayer> {
    /// Session sending the name and password from `config`.
    pub fn new(config: SessionConfig) -> Self {
        let layer = config.net_layer();
        Self::with_layer(config, layer)
    }
}

impl<L: NetLayer> ClientSession<L> {
    /// Session using a custom net layer.
    pub fn with_layer(config: SessionConfig, layer: L) -> Self {
        Self {
            config: config.sanitized(),
            layer,
            state: ConnectionState::Disconnected,
            stream: None,
            datagrams: None,
            host: None,
            handshake_started: None,
            last_disconnect: None,
            malformed_frames: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the host admitted this client.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    /// Player id assigned by the host.
    pub fn player_id(&self) -> Option<u16> {
        match self.state {
            ConnectionState::Connected { player_id } => Some(player_id),
            _ => None,
        }
    }

    /// Why the previous connection ended.
    pub fn last_disconnect(&self) -> Option<&DisconnectReason> {
        self.last_disconnect.as_ref()
    }

    /// Host address while connecting or connected.
    pub fn host(&self) -> Option<NetIdentity> {
        self.host
    }

    /// Local address shared by both sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.local_addr().ok()
    }

    /// Malformed frames received during this connection.
    pub fn malformed_frames(&self) -> u32 {
        self.malformed_frames
    }

    /// Install a loss conditioner on outgoing datagrams.
    pub fn set_conditioner(&mut self, conditioner: LossConditioner) {
        match self.datagrams.as_mut() {
            Some(socket) => socket.set_conditioner(conditioner),
            None => warn!("Conditioner ignored; not connected"),
        }
    }

    /// Datagram counters.
    pub fn unreliable_stats(&self) -> SocketStats {
        self.datagrams.as_ref().map(UnreliableSocket::stats).unwrap_or_default()
    }

    /// Open both sockets and send a versioned connect request.
    #[instrument(skip(self, game), fields(player = %self.config.player_name))]
    pub fn connect(&mut self, addr: SocketAddr, game: &Game) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Handshaking => return Err(ClientError::Busy("handshaking").into()),
            ConnectionState::Connected { .. } => return Err(ClientError::Busy("connected").into()),
        }
        let mut stream = StreamConnection::connect(addr, self.config.handshake_timeout())?;
        let local = stream.local_addr()?;
        let datagrams = UnreliableSocket::bind(local, self.config.max_datagram_size)
            .context("failed to bind the datagram socket on the stream's address")?;

        let mut buffer = ByteBuffer::new();
        HandshakeHeader {
            engine_version: ENGINE_VERSION,
            game_version: game.version(),
            request: RequestType::Connect,
        }
        .encode(&mut buffer);
        self.layer
            .encode_handshake(&mut buffer, &self.config.player_name, &self.config.password);
        stream.send(buffer.data())?;
        stream.flush();

        self.host = Some(stream.peer());
        self.stream = Some(stream);
        self.datagrams = Some(datagrams);
        self.state = ConnectionState::Handshaking;
        self.handshake_started = Some(Instant::now());
        self.last_disconnect = None;
        self.malformed_frames = 0;
        info!(%addr, %local, "Connecting");
        Ok(())
    }

    /// Leave the session and clear the replicated world.
    pub fn disconnect(&mut self, game: &mut Game) {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush();
        }
        self.close(game, DisconnectReason::Requested);
    }

    fn close(&mut self, game: &mut Game, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
        }
        self.datagrams = None;
        self.host = None;
        self.handshake_started = None;
        if self.is_connected() {
            game.end_session();
        }
        self.state = ConnectionState::Disconnected;
        info!(?reason, "Disconnected");
        self.last_disconnect = Some(reason);
    }

    /// Run one network tick: read the host's frames, apply them to `game`
    /// and send the RPCs queued since the last update.
    #[instrument(level = "trace", skip_all, fields(state = ?self.state))]
    pub fn update(&mut self, game: &mut Game) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let (frames, closed) = match self.stream.as_mut() {
            Some(stream) => {
                stream.flush();
                (stream.receive(), stream.is_closed())
            }
            None => (Vec::new(), true),
        };

        let mut frames = frames.into_iter();
        if self.state == ConnectionState::Handshaking {
            match frames.next() {
                Some(frame) => {
                    if !self.finish_handshake(game, &frame) {
                        return;
                    }
                }
                None if closed => {
                    self.close(game, DisconnectReason::Closed);
                    return;
                }
                None => {
                    let timed_out = self
                        .handshake_started
                        .is_some_and(|since| since.elapsed() > self.config.handshake_timeout());
                    if timed_out {
                        warn!("Handshake timed out");
                        self.close(game, DisconnectReason::Timeout);
                    }
                    return;
                }
            }
        }

        for frame in frames {
            self.apply_frame(game, &frame, SocketClass::Reliable);
        }
        self.receive_datagrams(game);
        if closed {
            self.close(game, DisconnectReason::Closed);
            return;
        }
        self.send_rpcs(game);
        if let Some(stream) = self.stream.as_mut() {
            stream.flush();
        }
    }

    fn finish_handshake(&mut self, game: &mut Game, frame: &[u8]) -> bool {
        let mut buffer = ByteBuffer::from_wire(frame);
        let cx = DecodeContext::detached();
        let code = match ResponseCode::decode(&mut buffer, &cx) {
            Ok(code) => code,
            Err(err) => {
                warn!(%err, "Malformed handshake response");
                self.close(game, DisconnectReason::BadResponse);
                return false;
            }
        };
        if code != ResponseCode::Accepted {
            warn!(?code, "Connect refused");
            let reason = if code.is_rejection() {
                DisconnectReason::Rejected(code)
            } else {
                DisconnectReason::BadResponse
            };
            self.close(game, reason);
            return false;
        }
        let player_id = match u16::decode(&mut buffer, &cx) {
            Ok(player_id) => player_id,
            Err(err) => {
                warn!(%err, "Accepted response without a player id");
                self.close(game, DisconnectReason::BadResponse);
                return false;
            }
        };
        game.begin_remote(player_id);
        self.state = ConnectionState::Connected { player_id };
        self.handshake_started = None;
        info!(player_id, "Connected");
        true
    }

    fn receive_datagrams(&mut self, game: &mut Game) {
        let packets = match self.datagrams.as_mut() {
            Some(socket) => socket.poll(),
            None => return,
        };
        for packet in packets {
            if Some(packet.source) != self.host {
                trace!(source = %packet.source, "Datagram from a stranger dropped");
                if let Some(socket) = self.datagrams.as_mut() {
                    socket.note_rejected();
                }
                continue;
            }
            self.apply_frame(game, &packet.payload, SocketClass::Unreliable);
        }
    }

    fn apply_frame(&mut self, game: &mut Game, payload: &[u8], socket: SocketClass) {
        match decode_messages(payload) {
            Ok(messages) => {
                for message in messages {
                    apply_message(game, message);
                }
            }
            Err(err) => {
                self.malformed_frames = self.malformed_frames.saturating_add(1);
                warn!(%err, ?socket, "Malformed frame dropped");
            }
        }
    }

    fn send_rpcs(&mut self, game: &mut Game) {
        let Some(player_id) = self.player_id() else {
            return;
        };
        let mut reliable = FrameBuilder::new(MAX_FRAME_PAYLOAD);
        let mut unreliable = Vec::new();
        for net_id in game.net_ids() {
            let Some((object, _)) = game.net_object_mut(net_id) else {
                continue;
            };
            for socket in [SocketClass::Reliable, SocketClass::Unreliable] {
                for queued in object.net_mut().take_rpcs(socket) {
                    if queued.target != RpcTarget::Host {
                        warn!(net_id, target = ?queued.target, "Clients only send RPCs to the host");
                        continue;
                    }
                    let message = NetMessage {
                        source: player_id,
                        target: net_id,
                        body: MessageBody::Rpc(queued.request),
                    };
                    match socket {
                        SocketClass::Reliable => reliable.push(&message),
                        SocketClass::Unreliable => unreliable.push(message),
                    }
                }
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            for payload in reliable.finish() {
                if let Err(err) = stream.send(&payload) {
                    warn!(%err, "Reliable frame not queued");
                }
            }
        }
        if let (Some(socket), Some(host)) = (self.datagrams.as_mut(), self.host) {
            for message in unreliable {
                let payload = bomberboy_core::encode_to_vec(&message);
                if let Err(err) = socket.send_to(&host, &payload) {
                    debug!(%err, "Datagram not sent");
                }
            }
        }
    }
}

fn apply_message(game: &mut Game, message: NetMessage) {
    let target = message.target;
    match message.body {
        MessageBody::Spawn {
            class_id,
            net_id,
            owner_id,
            initial,
        } => apply_spawn(game, class_id, net_id, owner_id, initial),
        MessageBody::Destroy => {
            if !game.destroy_net(target) {
                trace!(net_id = target, "Destroy for an unknown object");
            }
        }
        MessageBody::Sync(entry) => {
            let Some((object, cx)) = game.net_object_mut(target) else {
                trace!(net_id = target, "Sync-var for an unknown object dropped");
                return;
            };
            let mut value = ByteBuffer::from_wire(&entry.value);
            if let Err(err) = object.execute_sync_var(entry.index, &mut value, false, &cx) {
                warn!(net_id = target, index = entry.index, %err, "Sync-var update dropped");
            }
        }
        MessageBody::Rpc(request) if target == 0 => {
            if request.index != GAME_RPC_SWITCH_LEVEL {
                warn!(index = request.index, "Unknown game RPC");
                return;
            }
            match bomberboy_core::decode_from_slice::<u16>(&request.params) {
                Ok(level_class) => {
                    game.apply_level_switch(level_class);
                }
                Err(err) => warn!(%err, "Malformed SwitchLevel dropped"),
            }
        }
        MessageBody::Rpc(request) => {
            let Some((object, cx)) = game.net_object_mut(target) else {
                trace!(net_id = target, "RPC for an unknown object dropped");
                return;
            };
            let Some(info) = object.net_table().rpc_info_at(request.index) else {
                warn!(net_id = target, index = request.index, "Unknown RPC index");
                return;
            };
            let allowed = match info.mode {
                CallingMode::Broadcast => true,
                CallingMode::Owner => object.net().role() == NetRole::RemoteOwner,
                CallingMode::Host => false,
            };
            if !allowed {
                error!(net_id = target, index = request.index, role = ?object.net().role(), "RPC not executable here");
                return;
            }
            let mut params = ByteBuffer::from_wire(&request.params);
            if let Err(err) = object.execute_rpc(request.index, &mut params, &cx) {
                warn!(net_id = target, index = request.index, %err, "RPC dropped");
            }
        }
    }
}

fn apply_spawn(game: &mut Game, class_id: u16, net_id: u16, owner_id: u16, initial: Vec<SyncEntry>) {
    if game.spawn_replica(class_id, net_id, owner_id).is_none() {
        return;
    }
    let Some((object, cx)) = game.net_object_mut(net_id) else {
        return;
    };
    for entry in initial {
        let mut value = ByteBuffer::from_wire(&entry.value);
        if let Err(err) = object.execute_sync_var(entry.index, &mut value, false, &cx) {
            warn!(net_id, index = entry.index, %err, "Initial sync-var dropped");
        }
    }
    object.net_mut().finish_net_update();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bomberboy_core::{ClassRegistry, PlayerController, Version};
    use bomberboy_server::HostSession;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller() -> Box<dyn NetObject> {
        Box::new(PlayerController::default())
    }

    fn game(version: Version) -> Game {
        let mut registry = ClassRegistry::new();
        registry
            .register_object(PlayerController::CLASS_NAME, None, controller)
            .unwrap();
        Game::new("test", version, Arc::new(registry))
    }

    fn pump(
        host: &mut HostSession,
        host_game: &mut Game,
        client: &mut ClientSession,
        client_game: &mut Game,
        mut done: impl FnMut(&ClientSession, &Game) -> bool,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            host.update(host_game);
            client.update(client_game);
            if done(client, client_game) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn connect_replicates_the_own_controller() {
        let mut host_game = game(Version::new(1, 0, 0));
        let mut host = HostSession::new(SessionConfig::loopback());
        host.start(&mut host_game).unwrap();

        let mut client_game = game(Version::new(1, 0, 0));
        let mut client = ClientSession::new(SessionConfig {
            player_name: "bob".into(),
            ..SessionConfig::loopback()
        });
        client.connect(host.local_addr().unwrap(), &client_game).unwrap();
        assert_eq!(client.state(), ConnectionState::Handshaking);

        assert!(pump(&mut host, &mut host_game, &mut client, &mut client_game, |_, g| {
            g.player_controller_of(1).is_some()
        }));
        assert_eq!(client.player_id(), Some(1));
        let (_, pc) = client_game.player_controller_of(1).unwrap();
        assert_eq!(pc.player_name(), "bob");
        assert_eq!(pc.net().role(), NetRole::RemoteOwner);
        assert!(!pc.net().is_first_net_update());
    }

    #[test]
    fn silent_host_times_out_the_handshake() {
        // Accepted by the kernel backlog, never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client_game = game(Version::new(1, 0, 0));
        let mut client = ClientSession::new(SessionConfig {
            handshake_timeout_ms: 100,
            ..SessionConfig::loopback()
        });
        client.connect(listener.local_addr().unwrap(), &client_game).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.state() == ConnectionState::Handshaking && Instant::now() < deadline {
            client.update(&mut client_game);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.last_disconnect(), Some(&DisconnectReason::Timeout));
        assert!(matches!(
            client.last_disconnect().and_then(DisconnectReason::as_error),
            Some(ClientError::Timeout)
        ));
        assert_eq!(client_game.object_count(), 0);
    }

    #[test]
    fn connecting_twice_is_refused() {
        let mut host_game = game(Version::new(1, 0, 0));
        let mut host = HostSession::new(SessionConfig::loopback());
        host.start(&mut host_game).unwrap();
        let client_game = game(Version::new(1, 0, 0));
        let mut client = ClientSession::new(SessionConfig::loopback());
        let addr = host.local_addr().unwrap();
        client.connect(addr, &client_game).unwrap();
        assert!(client.connect(addr, &client_game).is_err());
    }

    #[test]
    fn host_shutdown_disconnects_and_clears_replicas() {
        let mut host_game = game(Version::new(1, 0, 0));
        let mut host = HostSession::new(SessionConfig::loopback());
        host.start(&mut host_game).unwrap();
        let mut client_game = game(Version::new(1, 0, 0));
        let mut client = ClientSession::new(SessionConfig::loopback());
        client.connect(host.local_addr().unwrap(), &client_game).unwrap();
        assert!(pump(&mut host, &mut host_game, &mut client, &mut client_game, |c, _| c.is_connected()));
        assert!(pump(&mut host, &mut host_game, &mut client, &mut client_game, |_, g| g.object_count() > 0));

        host.stop(&mut host_game);
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_connected() && Instant::now() < deadline {
            client.update(&mut client_game);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.last_disconnect(), Some(&DisconnectReason::Closed));
        assert_eq!(client_game.object_count(), 0);
        assert_eq!(client_game.net_mode(), bomberboy_core::NetMode::Offline);
    }
}
