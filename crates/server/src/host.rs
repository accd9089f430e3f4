//! Host session: admission, inbound RPC routing and outbound replication.

use crate::client::NetClient;
use crate::outbox::Outbox;
use anyhow::{bail, Context, Result};
use bomberboy_core::{
    encode_to_vec, ByteBuffer, CallingMode, ClassInfo, Decode, DecodeContext, Game, NetObject,
    NetObjectExt, PlayerController, RpcRequest, RpcTarget, SocketClass, SyncVarUpdate,
    ENGINE_VERSION,
};
use bomberboy_net::{
    decode_messages, encode_response, DefaultNetLayer, FrameBuilder, HandshakeHeader,
    HandshakeVerdict, LossConditioner, MessageBody, NetIdentity, NetLayer, NetMessage, Packet,
    ReliableListener, RequestType, ResponseCode, ServerInfo, SessionConfig, SocketStats, SyncEntry,
    UnreliableSocket, MAX_FRAME_PAYLOAD,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Ephemeral-port binds retried when the datagram port is already taken.
const BIND_ATTEMPTS: usize = 8;

/// Colour slots handed out to joining players.
const PLAYER_COLOURS: u16 = 8;

/// Authoritative session serving remote players.
pub struct HostSession<L: NetLayer = DefaultNetLayer> {
    /// Bind address, limits and admission settings.
    config: SessionConfig,

    /// Admission policy.
    layer: L,

    /// Stream listener; `None` until started.
    reliable: Option<ReliableListener>,

    /// Datagram socket on the listener's port.
    unreliable: Option<UnreliableSocket>,

    /// Admitted players by address.
    clients: BTreeMap<NetIdentity, NetClient>,

    /// Accepted streams that have not sent their handshake yet.
    pending: BTreeMap<NetIdentity, Instant>,

    /// Next player id to try.
    next_player_id: u16,
}

impl HostSession<DefaultNetLayer> {
    /// Session using the password, ban list and whitelist from `config`.
    pub fn new(config: SessionConfig) -> Self {
        let layer = config.net_layer();
        Self::with_layer(config, layer)
    }
}

impl<L: NetLayer> HostSession<L> {
    /// Session using a custom admission policy.
    pub fn with_layer(config: SessionConfig, layer: L) -> Self {
        Self {
            config: config.sanitized(),
            layer,
            reliable: None,
            unreliable: None,
            clients: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_player_id: 1,
        }
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Admission policy.
    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// Mutable admission policy, e.g. to ban an address at runtime.
    pub fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }

    /// Whether the sockets are bound.
    pub fn is_running(&self) -> bool {
        self.reliable.is_some()
    }

    /// Address shared by both sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.reliable.as_ref()?.local_addr().ok()
    }

    /// Admitted players.
    pub fn clients(&self) -> impl Iterator<Item = &NetClient> {
        self.clients.values()
    }

    /// Number of admitted players.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Admitted player with id `player_id`.
    pub fn client_by_player(&self, player_id: u16) -> Option<&NetClient> {
        self.clients.values().find(|client| client.player_id() == player_id)
    }

    /// Install a loss conditioner on outgoing datagrams.
    pub fn set_conditioner(&mut self, conditioner: LossConditioner) {
        match self.unreliable.as_mut() {
            Some(socket) => socket.set_conditioner(conditioner),
            None => warn!("Conditioner ignored; host session not started"),
        }
    }

    /// Stream counters.
    pub fn reliable_stats(&self) -> SocketStats {
        self.reliable.as_ref().map(ReliableListener::stats).unwrap_or_default()
    }

    /// Datagram counters.
    pub fn unreliable_stats(&self) -> SocketStats {
        self.unreliable.as_ref().map(UnreliableSocket::stats).unwrap_or_default()
    }

    /// Answer to a server query.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            players: u16::try_from(self.clients.len()).unwrap_or(u16::MAX),
            max_players: self.config.max_players,
            server_name: self.config.server_name.clone(),
            flags: self.layer.flags(),
        }
    }

    /// Bind both sockets and switch `game` to hosting.
    ///
    /// When the game has no player controller class configured, the engine
    /// [`PlayerController`] class is used if registered.
    #[instrument(skip_all, fields(addr = %self.config.socket_addr()))]
    pub fn start(&mut self, game: &mut Game) -> Result<()> {
        if self.is_running() {
            bail!("host session already running");
        }
        if game.player_class().is_none() {
            let class_id = game
                .registry()
                .by_name(PlayerController::CLASS_NAME)
                .map(ClassInfo::id)
                .context("no player controller class registered")?;
            game.set_player_class(class_id);
        }

        let (reliable, unreliable) = match self.bind() {
            Ok(sockets) => sockets,
            Err(err) => {
                error!(%err, "Failed to start host session");
                return Err(err);
            }
        };
        let local = reliable.local_addr()?;
        self.reliable = Some(reliable);
        self.unreliable = Some(unreliable);
        game.begin_hosting();
        info!(%local, max_players = self.config.max_players, "Host session started");
        Ok(())
    }

    fn bind(&self) -> Result<(ReliableListener, UnreliableSocket)> {
        let addr = self.config.socket_addr();
        let attempts = if addr.port() == 0 { BIND_ATTEMPTS } else { 1 };
        let mut last_error = None;
        for _ in 0..attempts {
            let reliable = ReliableListener::bind(addr)?;
            let local = reliable.local_addr()?;
            match UnreliableSocket::bind(local, self.config.max_datagram_size) {
                Ok(unreliable) => return Ok((reliable, unreliable)),
                Err(err) => {
                    debug!(%local, %err, "Datagram port taken");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err.context("failed to bind the datagram socket on the stream port")),
            None => bail!("no bind attempted"),
        }
    }

    /// Close every connection, destroy the players' objects and return
    /// `game` to offline mode.
    pub fn stop(&mut self, game: &mut Game) {
        if let Some(mut reliable) = self.reliable.take() {
            reliable.shutdown();
        }
        self.unreliable = None;
        self.pending.clear();
        let players: Vec<u16> = self.clients.values().map(NetClient::player_id).collect();
        self.clients.clear();
        for player_id in players {
            for id in game.objects_owned_by(player_id) {
                game.destroy(id);
            }
        }
        game.end_session();
        info!("Host session stopped");
    }

    /// Disconnect the player with id `player_id`. Returns `false` when no
    /// such player is connected.
    pub fn kick(&mut self, game: &mut Game, player_id: u16) -> bool {
        match self.client_by_player(player_id).map(NetClient::identity) {
            Some(identity) => {
                self.drop_client(game, &identity, "kicked");
                true
            }
            None => false,
        }
    }

    /// Run one network tick: receive, admit, execute, replicate, flush.
    #[instrument(level = "trace", skip_all, fields(clients = self.clients.len()))]
    pub fn update(&mut self, game: &mut Game) {
        if !self.is_running() {
            warn!("Update on a host session that is not running");
            return;
        }
        self.receive_reliable(game);
        self.receive_unreliable(game);
        self.expire_pending();
        self.replicate(game);
        self.flush(game);
    }

    fn receive_reliable(&mut self, game: &mut Game) {
        let Some(reliable) = self.reliable.as_mut() else {
            return;
        };
        let poll = reliable.poll();
        if let Some(identity) = poll.accepted {
            self.pending.insert(identity, Instant::now());
        }
        for packet in poll.packets {
            if self.clients.contains_key(&packet.source) {
                self.handle_client_frame(game, packet, SocketClass::Reliable);
            } else if self.pending.remove(&packet.source).is_some() {
                self.handle_handshake(game, packet);
            } else {
                trace!(source = %packet.source, "Frame after handshake reply ignored");
            }
        }
        for identity in poll.closed {
            self.pending.remove(&identity);
            self.drop_client(game, &identity, "stream closed");
        }
    }

    fn receive_unreliable(&mut self, game: &mut Game) {
        let packets = match self.unreliable.as_mut() {
            Some(socket) => socket.poll(),
            None => return,
        };
        for packet in packets {
            if self.clients.contains_key(&packet.source) {
                self.handle_client_frame(game, packet, SocketClass::Unreliable);
            } else {
                trace!(source = %packet.source, "Datagram from an unknown peer dropped");
                if let Some(socket) = self.unreliable.as_mut() {
                    socket.note_rejected();
                }
            }
        }
    }

    fn expire_pending(&mut self) {
        let timeout = self.config.handshake_timeout();
        let expired: Vec<NetIdentity> = self
            .pending
            .iter()
            .filter(|(_, since)| since.elapsed() > timeout)
            .map(|(identity, _)| *identity)
            .collect();
        for identity in expired {
            self.pending.remove(&identity);
            if let Some(reliable) = self.reliable.as_mut() {
                reliable.disconnect(&identity);
            }
            debug!(%identity, "Handshake timed out");
        }
    }

    // --- admission -----------------------------------------------------------

    fn handle_handshake(&mut self, game: &mut Game, packet: Packet) {
        let identity = packet.source;
        let (code, body) = self.admit(game, identity, &packet.payload);
        let Some(reliable) = self.reliable.as_mut() else {
            return;
        };
        if let Err(err) = reliable.send(&identity, &encode_response(code, &body)) {
            warn!(%identity, %err, "Failed to queue handshake response");
            return;
        }
        if code == ResponseCode::Accepted {
            self.send_world_state(game, &identity);
        } else {
            reliable.close_after_flush(&identity);
        }
    }

    fn admit(&mut self, game: &mut Game, identity: NetIdentity, payload: &[u8]) -> (ResponseCode, Vec<u8>) {
        let mut buffer = ByteBuffer::from_wire(payload);
        let cx = DecodeContext::detached();
        let header = match HandshakeHeader::decode(&mut buffer, &cx) {
            Ok(header) => header,
            Err(err) => {
                warn!(%identity, %err, "Malformed handshake");
                return (ResponseCode::BadRequest, Vec::new());
            }
        };
        if header.engine_version != ENGINE_VERSION || header.game_version != game.version() {
            info!(
                %identity,
                engine = %header.engine_version,
                game = %header.game_version,
                "Handshake with mismatched versions"
            );
            return (ResponseCode::BadVersions, Vec::new());
        }
        if let Err(code) = self.layer.check_admission(&identity) {
            info!(%identity, ?code, "Address refused");
            return (code, Vec::new());
        }

        match header.request {
            RequestType::Ping => {
                debug!(%identity, "Ping");
                (ResponseCode::Responded, Vec::new())
            }
            RequestType::Query => {
                debug!(%identity, "Query");
                (ResponseCode::Responded, encode_to_vec(&self.server_info()))
            }
            RequestType::Connect => self.connect(game, identity, &mut buffer, &cx),
        }
    }

    fn connect(
        &mut self,
        game: &mut Game,
        identity: NetIdentity,
        buffer: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
    ) -> (ResponseCode, Vec<u8>) {
        if self.clients.len() >= usize::from(self.config.max_players) {
            info!(%identity, "Server full");
            return (ResponseCode::ServerFull, Vec::new());
        }
        let Some(player_id) = self.free_player_id() else {
            return (ResponseCode::ServerFull, Vec::new());
        };
        let Some(mut controller) = game.create_player_controller() else {
            error!("Player controller class cannot be instantiated");
            return (ResponseCode::BadRequest, Vec::new());
        };
        let Some(pc) = controller.player_controller_mut() else {
            return (ResponseCode::BadRequest, Vec::new());
        };

        let verdict = self.layer.decode_handshake(buffer, cx, pc);
        if verdict != HandshakeVerdict::Accepted {
            info!(%identity, ?verdict, "Connect refused");
            return (verdict.into(), Vec::new());
        }
        pc.set_colour_index((player_id.wrapping_sub(1) % PLAYER_COLOURS) as u8);
        let name = pc.display_name();

        game.insert(controller, player_id);
        self.next_player_id = player_id.checked_add(1).unwrap_or(1);
        self.clients.insert(identity, NetClient::new(identity, player_id));
        info!(%identity, player_id, player = %name, "Player joined");
        (ResponseCode::Accepted, encode_to_vec(&player_id))
    }

    fn free_player_id(&self) -> Option<u16> {
        let mut candidate = self.next_player_id;
        for _ in 0..u16::MAX {
            let taken = self.clients.values().any(|client| client.player_id() == candidate);
            if candidate != 0 && !taken {
                return Some(candidate);
            }
            candidate = candidate.checked_add(1).unwrap_or(1);
        }
        None
    }

    /// Spawn notices for everything already replicated, sent to a player who
    /// just joined. Objects still waiting in the journal reach every client
    /// through the next replication pass instead.
    fn send_world_state(&mut self, game: &Game, identity: &NetIdentity) {
        let journal = game.pending_journal();
        let mut frames = FrameBuilder::new(MAX_FRAME_PAYLOAD);
        let mut spawned = 0usize;
        for net_id in game.net_ids() {
            if journal.spawned.contains(&net_id) {
                continue;
            }
            let Some(object) = game.by_net_id(net_id).and_then(|id| game.get(id)) else {
                continue;
            };
            let initial = object.sync_var_snapshot().into_iter().map(sync_entry).collect();
            let net = object.net();
            frames.push(&NetMessage::spawn(net.class_id(), net_id, net.network_owner_id(), initial));
            spawned += 1;
        }
        if journal.level_switches.is_empty() {
            if let Some(level_class) = game.level_class() {
                frames.push(&NetMessage::switch_level(level_class));
            }
        }

        let Some(reliable) = self.reliable.as_mut() else {
            return;
        };
        for payload in frames.finish() {
            if let Err(err) = reliable.send(identity, &payload) {
                warn!(%identity, %err, "Failed to queue world state");
                return;
            }
        }
        debug!(%identity, objects = spawned, "World state sent");
    }

    // --- inbound replication -------------------------------------------------

    fn handle_client_frame(&mut self, game: &mut Game, packet: Packet, socket: SocketClass) {
        let messages = match decode_messages(&packet.payload) {
            Ok(messages) => messages,
            Err(err) => {
                let reliable = socket == SocketClass::Reliable;
                warn!(source = %packet.source, %err, reliable, "Malformed frame dropped");
                if reliable {
                    self.note_malformed(game, &packet.source);
                }
                return;
            }
        };
        let Some(player_id) = self.clients.get(&packet.source).map(NetClient::player_id) else {
            return;
        };
        for message in messages {
            match message.body {
                MessageBody::Rpc(request) => execute_client_rpc(game, player_id, message.target, request),
                other => warn!(player_id, kind = ?other.kind(), "Clients may only send RPCs"),
            }
        }
    }

    fn note_malformed(&mut self, game: &mut Game, identity: &NetIdentity) {
        let Some(client) = self.clients.get_mut(identity) else {
            return;
        };
        if client.note_malformed() > self.config.max_malformed_frames {
            warn!(%identity, "Too many malformed frames");
            self.drop_client(game, identity, "malformed frames");
        }
    }

    fn drop_client(&mut self, game: &mut Game, identity: &NetIdentity, reason: &str) {
        let Some(client) = self.clients.remove(identity) else {
            return;
        };
        if let Some(reliable) = self.reliable.as_mut() {
            reliable.disconnect(identity);
        }
        let owned = game.objects_owned_by(client.player_id());
        for id in &owned {
            game.destroy(*id);
        }
        info!(
            %identity,
            player_id = client.player_id(),
            reason,
            destroyed = owned.len(),
            "Player left"
        );
    }

    // --- outbound replication ------------------------------------------------

    /// Encode this tick's destroys, spawns, level switches, RPCs and
    /// sync-var changes, in that order, into per-client frames.
    fn replicate(&mut self, game: &mut Game) {
        let journal = game.take_journal();
        let mut outbox = Outbox::new(
            self.clients
                .values()
                .map(|client| (client.identity(), client.player_id())),
        );

        for net_id in &journal.destroyed {
            outbox.broadcast(SocketClass::Reliable, &NetMessage::destroy(*net_id));
        }
        for net_id in &journal.spawned {
            let Some((object, _)) = game.net_object_mut(*net_id) else {
                continue;
            };
            let initial = object
                .collect_sync_vars(None, true)
                .into_iter()
                .map(sync_entry)
                .collect();
            let net = object.net();
            let message = NetMessage::spawn(net.class_id(), *net_id, net.network_owner_id(), initial);
            outbox.broadcast(SocketClass::Reliable, &message);
        }
        for level_class in &journal.level_switches {
            outbox.broadcast(SocketClass::Reliable, &NetMessage::switch_level(*level_class));
        }

        for net_id in game.net_ids() {
            let Some((object, _)) = game.net_object_mut(net_id) else {
                continue;
            };
            let net = object.net_mut();
            let mut rpcs: Vec<_> = net
                .take_rpcs(SocketClass::Reliable)
                .into_iter()
                .map(|queued| (SocketClass::Reliable, queued))
                .collect();
            rpcs.extend(
                net.take_rpcs(SocketClass::Unreliable)
                    .into_iter()
                    .map(|queued| (SocketClass::Unreliable, queued)),
            );
            for (socket, queued) in rpcs {
                let message = NetMessage {
                    source: 0,
                    target: net_id,
                    body: MessageBody::Rpc(queued.request),
                };
                match queued.target {
                    RpcTarget::AllRemotes => outbox.broadcast(socket, &message),
                    RpcTarget::Client(player_id) => {
                        if !outbox.send_to_player(player_id, socket, &message) {
                            debug!(net_id, player_id, "RPC for a disconnected player dropped");
                        }
                    }
                    RpcTarget::Host => warn!(net_id, "Host-bound RPC queued on the host dropped"),
                }
            }

            for update in object.collect_sync_vars(None, false) {
                let socket = update.socket;
                let message = NetMessage {
                    source: 0,
                    target: net_id,
                    body: MessageBody::Sync(sync_entry(update)),
                };
                outbox.broadcast(socket, &message);
            }
        }

        for client in outbox.into_frames() {
            if let Some(reliable) = self.reliable.as_mut() {
                for payload in &client.reliable {
                    if let Err(err) = reliable.send(&client.identity, payload) {
                        warn!(identity = %client.identity, %err, "Reliable frame not queued");
                    }
                }
            }
            if let Some(unreliable) = self.unreliable.as_mut() {
                for payload in &client.unreliable {
                    if let Err(err) = unreliable.send_to(&client.identity, payload) {
                        debug!(identity = %client.identity, %err, "Datagram not sent");
                    }
                }
            }
        }
    }

    /// Write queued stream data. A client whose stream stays over the
    /// backlog limit without draining for the stall timeout is dropped;
    /// every other client keeps receiving.
    fn flush(&mut self, game: &mut Game) {
        let Some(reliable) = self.reliable.as_mut() else {
            return;
        };
        let queued: Vec<(NetIdentity, usize)> = self
            .clients
            .keys()
            .map(|identity| (*identity, reliable.backlog(identity)))
            .collect();
        let finished = reliable.flush();

        let limit = self.config.reliable_backlog_limit;
        let timeout = self.config.backlog_stall_timeout();
        let now = Instant::now();
        let mut stalled = Vec::new();
        for (identity, before) in queued {
            let after = reliable.backlog(&identity);
            let Some(client) = self.clients.get_mut(&identity) else {
                continue;
            };
            if after > limit && after >= before {
                if client.note_stalled(now) > timeout {
                    warn!(%identity, backlog = after, "Reliable stream stalled");
                    stalled.push(identity);
                }
            } else {
                client.clear_stall();
            }
        }

        for identity in finished {
            self.pending.remove(&identity);
            self.drop_client(game, &identity, "stream closed");
        }
        for identity in stalled {
            self.drop_client(game, &identity, "reliable backlog stalled");
        }
    }
}

fn sync_entry(update: SyncVarUpdate) -> SyncEntry {
    SyncEntry {
        index: update.index,
        value: update.value,
    }
}

/// Execute an RPC received from `player_id`. Only host-mode RPCs may be
/// called by clients.
fn execute_client_rpc(game: &mut Game, player_id: u16, target: u16, request: RpcRequest) {
    if target == 0 {
        warn!(player_id, "Clients cannot call game-level RPCs");
        return;
    }
    let Some((object, cx)) = game.net_object_mut(target) else {
        trace!(player_id, net_id = target, "RPC for an unknown object dropped");
        return;
    };
    let table = object.net_table();
    let Some(info) = table.rpc_info_at(request.index) else {
        warn!(player_id, net_id = target, index = request.index, "Unknown RPC index");
        return;
    };
    let rpc = table.rpc_name(request.index).unwrap_or_default();
    if info.mode != CallingMode::Host {
        error!(player_id, net_id = target, rpc, "Client has no rights to call RPC");
        return;
    }
    let mut params = ByteBuffer::from_wire(&request.params);
    match object.execute_rpc(request.index, &mut params, &cx) {
        Ok(()) => trace!(player_id, net_id = target, rpc, "Client RPC executed"),
        Err(err) => warn!(player_id, net_id = target, rpc, %err, "Client RPC dropped"),
    }
}
