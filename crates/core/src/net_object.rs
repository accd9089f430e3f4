//! Per-object replication state, roles and RPC call routing.
//!
//! Every replicated type embeds a [`NetState`] and implements [`NetObject`].
//! Calls go through [`NetObjectExt::call_rpc`], which consults the object's
//! role and the RPC's calling mode to decide whether the call runs here, is
//! queued for the session, or is refused.

use crate::buffer::ByteBuffer;
use crate::codec::{DecodeContext, Encode};
use crate::player::PlayerController;
use crate::rpc::{
    CallOutcome, CallingMode, QueuedRpc, RpcError, RpcInfo, RpcRequest, RpcTarget, SocketClass,
    MAX_PARAMS_LEN,
};
use crate::table::{ReplicationTable, SyncVarUpdate};
use std::any::Any;
use std::collections::BTreeMap;
use tracing::{error, warn};

/// Which side of a session this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetMode {
    /// No session.
    #[default]
    Offline,
    /// Authoritative host.
    Host,
    /// Connected client with its assigned player id.
    Remote {
        /// Player id the host assigned to this client.
        local_id: u16,
    },
}

impl NetMode {
    /// Whether a session is running.
    pub fn in_session(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// An object's relation to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetRole {
    /// Not part of a session.
    #[default]
    None,
    /// Client copy of an object owned elsewhere.
    RemotePuppet,
    /// Host copy of an object a client owns.
    HostPuppet,
    /// Client copy of an object this client owns.
    RemoteOwner,
    /// Host copy of a host-owned object.
    HostOwner,
}

impl NetRole {
    /// Role of an object owned by `owner_id` under `mode`.
    pub fn resolve(mode: NetMode, owner_id: u16) -> Self {
        match mode {
            NetMode::Offline => Self::None,
            NetMode::Host if owner_id == 0 => Self::HostOwner,
            NetMode::Host => Self::HostPuppet,
            NetMode::Remote { local_id } if local_id != 0 && owner_id == local_id => {
                Self::RemoteOwner
            }
            NetMode::Remote { .. } => Self::RemotePuppet,
        }
    }
}

/// Where a call with a given role and calling mode goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Local,
    Remote(RpcTarget),
    LocalAndRemote(RpcTarget),
    Denied,
}

impl Dispatch {
    fn resolve(role: NetRole, mode: CallingMode, owner_id: u16) -> Self {
        match (role, mode) {
            (NetRole::None, _) => Self::Local,
            (NetRole::HostOwner, CallingMode::Host | CallingMode::Owner) => Self::Local,
            (NetRole::HostPuppet, CallingMode::Host) => Self::Local,
            (NetRole::HostPuppet, CallingMode::Owner) => Self::Remote(RpcTarget::Client(owner_id)),
            (NetRole::HostOwner | NetRole::HostPuppet, CallingMode::Broadcast) => {
                Self::LocalAndRemote(RpcTarget::AllRemotes)
            }
            (NetRole::RemoteOwner | NetRole::RemotePuppet, CallingMode::Host) => {
                Self::Remote(RpcTarget::Host)
            }
            (NetRole::RemoteOwner, CallingMode::Owner) => Self::Local,
            (NetRole::RemoteOwner, CallingMode::Broadcast) => Self::Denied,
            (NetRole::RemotePuppet, CallingMode::Owner | CallingMode::Broadcast) => Self::Denied,
        }
    }
}

/// Replication bookkeeping embedded in every replicated object.
#[derive(Debug, Clone, Default)]
pub struct NetState {
    class_id: u16,
    network_id: u16,
    owner_id: u16,
    role: NetRole,
    net_synced: bool,
    first_net_update: bool,
    reliable_rpcs: Vec<QueuedRpc>,
    unreliable_rpcs: Vec<QueuedRpc>,
    snapshots: BTreeMap<u16, Vec<u8>>,
}

impl NetState {
    /// State for an object that stays local to its endpoint.
    pub fn local() -> Self {
        Self {
            first_net_update: true,
            ..Self::default()
        }
    }

    /// State for an object that is replicated once a session runs.
    pub fn synced() -> Self {
        Self {
            net_synced: true,
            first_net_update: true,
            ..Self::default()
        }
    }

    /// Registered class id.
    pub fn class_id(&self) -> u16 {
        self.class_id
    }

    pub(crate) fn set_class_id(&mut self, class_id: u16) {
        self.class_id = class_id;
    }

    /// Session-wide id; 0 while unregistered.
    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    /// Assign the session-wide id. Normally managed by the game.
    pub fn set_network_id(&mut self, network_id: u16) {
        self.network_id = network_id;
    }

    /// Player id of the owner; 0 for host-owned objects.
    pub fn network_owner_id(&self) -> u16 {
        self.owner_id
    }

    /// Change the owner. Call [`NetState::update_role`] afterwards.
    pub fn set_network_owner_id(&mut self, owner_id: u16) {
        self.owner_id = owner_id;
    }

    /// Current role.
    pub fn role(&self) -> NetRole {
        self.role
    }

    /// Recompute the role from the session mode and current owner.
    pub fn update_role(&mut self, mode: NetMode) {
        self.role = NetRole::resolve(mode, self.owner_id);
    }

    /// Whether the object takes part in replication.
    pub fn is_net_synced(&self) -> bool {
        self.net_synced
    }

    /// Enable or disable replication for this object.
    pub fn set_net_synced(&mut self, synced: bool) {
        self.net_synced = synced;
    }

    /// Whether no replication update has been applied yet.
    pub fn is_first_net_update(&self) -> bool {
        self.first_net_update
    }

    /// Record that a replication update has been applied.
    pub fn finish_net_update(&mut self) {
        self.first_net_update = false;
    }

    /// Whether this endpoint owns the object.
    pub fn is_net_owner(&self) -> bool {
        matches!(self.role, NetRole::HostOwner | NetRole::RemoteOwner)
    }

    /// Whether this endpoint is the object's host.
    pub fn is_net_host(&self) -> bool {
        matches!(self.role, NetRole::HostOwner | NetRole::HostPuppet)
    }

    /// Whether local input should drive the object.
    pub fn has_net_control(&self) -> bool {
        matches!(
            self.role,
            NetRole::None | NetRole::HostOwner | NetRole::RemoteOwner
        )
    }

    /// Append a request to the queue of its socket class.
    pub fn enqueue_rpc(&mut self, socket: SocketClass, rpc: QueuedRpc) {
        match socket {
            SocketClass::Reliable => self.reliable_rpcs.push(rpc),
            SocketClass::Unreliable => self.unreliable_rpcs.push(rpc),
        }
    }

    /// Requests waiting on `socket`, oldest first.
    pub fn queued_rpcs(&self, socket: SocketClass) -> &[QueuedRpc] {
        match socket {
            SocketClass::Reliable => &self.reliable_rpcs,
            SocketClass::Unreliable => &self.unreliable_rpcs,
        }
    }

    /// Drain the queue of `socket`.
    pub fn take_rpcs(&mut self, socket: SocketClass) -> Vec<QueuedRpc> {
        match socket {
            SocketClass::Reliable => std::mem::take(&mut self.reliable_rpcs),
            SocketClass::Unreliable => std::mem::take(&mut self.unreliable_rpcs),
        }
    }

    /// Whether anything waits on `socket`.
    pub fn has_queued_net_data(&self, socket: SocketClass) -> bool {
        !self.queued_rpcs(socket).is_empty()
    }

    /// Drop every queued request.
    pub fn clear_queued_net_data(&mut self) {
        self.reliable_rpcs.clear();
        self.unreliable_rpcs.clear();
    }

    pub(crate) fn snapshot(&self, index: u16) -> Option<&[u8]> {
        self.snapshots.get(&index).map(Vec::as_slice)
    }

    pub(crate) fn store_snapshot(&mut self, index: u16, value: Vec<u8>) {
        self.snapshots.insert(index, value);
    }
}

/// A replicated game object.
///
/// Implementors embed a [`NetState`], expose a static replication table and
/// can override lifecycle hooks. Use [`net_object_any!`](crate::net_object_any)
/// for the `Any` accessors.
pub trait NetObject: Any {
    /// Replication bookkeeping.
    fn net(&self) -> &NetState;

    /// Mutable replication bookkeeping.
    fn net_mut(&mut self) -> &mut NetState;

    /// RPC and sync-var table for the concrete type.
    fn net_table(&self) -> &'static dyn ReplicationTable;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Called once the object has been inserted into the game.
    fn on_begin(&mut self) {}

    /// Called right before the object is removed from the game.
    fn on_destroy(&mut self) {}

    /// Called every game tick.
    fn on_tick(&mut self, _delta: f32) {}

    /// The engine player controller, for objects that are or embed one.
    fn player_controller(&self) -> Option<&PlayerController> {
        None
    }

    /// Mutable access to the embedded player controller.
    fn player_controller_mut(&mut self) -> Option<&mut PlayerController> {
        None
    }
}

/// Implements the `Any` accessors of [`NetObject`] inside an impl block.
#[macro_export]
macro_rules! net_object_any {
    () => {
        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }
    };
}

/// Replication entry points available on every [`NetObject`].
pub trait NetObjectExt: NetObject {
    /// Descriptor of the RPC registered as `name`.
    fn rpc_info(&self, name: &str) -> Option<RpcInfo> {
        self.net_table().rpc_info(name)
    }

    /// Call the RPC registered as `name` with encoded `args`.
    fn call_rpc<A: Encode>(&mut self, name: &str, args: A) -> CallOutcome {
        let table = self.net_table();
        let Some(info) = table.rpc_info(name) else {
            error!(rpc = name, "Not a registered RPC");
            return CallOutcome::Failed;
        };
        let net = self.net();
        let dispatch = Dispatch::resolve(net.role(), info.mode, net.network_owner_id());
        if net.role() != NetRole::None && net.network_id() == 0 {
            warn!(rpc = name, "RPC on an unregistered object discarded");
            return CallOutcome::Discarded;
        }

        let mut params = ByteBuffer::new();
        args.encode(&mut params);
        let params = params.into_inner();

        let target = match dispatch {
            Dispatch::Denied => {
                error!(rpc = name, role = ?net.role(), "Invalid rights to call RPC");
                return CallOutcome::Denied;
            }
            Dispatch::Local => None,
            Dispatch::Remote(target) | Dispatch::LocalAndRemote(target) => Some(target),
        };

        if params.len() > MAX_PARAMS_LEN {
            error!(rpc = name, len = params.len(), "RPC arguments too large to send");
            return CallOutcome::TooLarge;
        }

        let local = matches!(dispatch, Dispatch::Local | Dispatch::LocalAndRemote(_));
        if local {
            let mut readable = ByteBuffer::from_wire(&params);
            let cx = DecodeContext::detached();
            if let Err(err) = table.execute_rpc(self.as_any_mut(), info.index, &mut readable, &cx)
            {
                error!(rpc = name, %err, "Local RPC execution failed");
                return CallOutcome::Failed;
            }
        }

        match target {
            Some(target) => {
                self.net_mut().enqueue_rpc(
                    info.socket,
                    QueuedRpc {
                        request: RpcRequest {
                            index: info.index,
                            mode: info.mode,
                            params,
                        },
                        target,
                    },
                );
                if local {
                    CallOutcome::ExecutedAndQueued(target)
                } else {
                    CallOutcome::Queued(target)
                }
            }
            None => CallOutcome::Executed,
        }
    }

    /// Execute the RPC at `index` with arguments read from `params`.
    fn execute_rpc(
        &mut self,
        index: u16,
        params: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError> {
        let table = self.net_table();
        table.execute_rpc(self.as_any_mut(), index, params, cx)
    }

    /// Decode and assign the sync-var at `index`, firing its change callback
    /// unless `skip_callbacks` is set.
    fn execute_sync_var(
        &mut self,
        index: u16,
        value: &mut ByteBuffer,
        skip_callbacks: bool,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError> {
        let table = self.net_table();
        table.execute_sync_var(self.as_any_mut(), index, value, skip_callbacks, cx)
    }

    /// Sync-vars due for sending on `socket` (all sockets when `None`).
    ///
    /// `force` emits every variable regardless of mode or change.
    fn collect_sync_vars(&mut self, socket: Option<SocketClass>, force: bool) -> Vec<SyncVarUpdate> {
        let table = self.net_table();
        let mut out = Vec::new();
        table.collect_sync_vars(self.as_any_mut(), socket, force, &mut out);
        out
    }

    /// Current value of every sync-var, leaving change tracking untouched.
    fn sync_var_snapshot(&self) -> Vec<SyncVarUpdate> {
        let mut out = Vec::new();
        self.net_table().snapshot_sync_vars(self.as_any(), &mut out);
        out
    }
}

impl<T: NetObject + ?Sized> NetObjectExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_vec;
    use crate::table::{NetTable, SyncMode};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Turret {
        net: NetState,
        hits: Vec<(i32, i32)>,
        pings: u32,
        score: i32,
        health: u8,
        score_changes: u32,
        uploaded: usize,
    }

    impl Turret {
        fn table() -> &'static NetTable<Self> {
            static TABLE: OnceLock<NetTable<Turret>> = OnceLock::new();
            TABLE.get_or_init(|| {
                NetTable::builder()
                    .rpc("Hit", SocketClass::Reliable, CallingMode::Host, |p: &mut Turret, (x, y): (i32, i32)| {
                        p.hits.push((x, y))
                    })
                    .rpc("Notify", SocketClass::Reliable, CallingMode::Owner, |p: &mut Turret, (): ()| {
                        p.pings += 1
                    })
                    .rpc("Shout", SocketClass::Unreliable, CallingMode::Broadcast, |p: &mut Turret, (): ()| {
                        p.pings += 10
                    })
                    .rpc("Upload", SocketClass::Reliable, CallingMode::Broadcast, |p: &mut Turret, (data,): (Vec<u8>,)| {
                        p.uploaded += data.len()
                    })
                    .sync_var("Score", SocketClass::Reliable, SyncMode::OnChange, |p: &Turret| &p.score, |p: &mut Turret| &mut p.score)
                    .on_change(|p: &mut Turret| p.score_changes += 1)
                    .sync_var("Health", SocketClass::Unreliable, SyncMode::Always, |p: &Turret| &p.health, |p: &mut Turret| &mut p.health)
                    .build()
            })
        }

        fn with_role(mode: NetMode, network_id: u16, owner_id: u16) -> Self {
            let mut net = NetState::synced();
            net.set_network_id(network_id);
            net.set_network_owner_id(owner_id);
            net.update_role(mode);
            Self {
                net,
                ..Self::default()
            }
        }
    }

    impl NetObject for Turret {
        fn net(&self) -> &NetState {
            &self.net
        }

        fn net_mut(&mut self) -> &mut NetState {
            &mut self.net
        }

        fn net_table(&self) -> &'static dyn ReplicationTable {
            Self::table()
        }

        net_object_any!();
    }

    #[test]
    fn roles_follow_mode_and_owner() {
        assert_eq!(NetRole::resolve(NetMode::Offline, 3), NetRole::None);
        assert_eq!(NetRole::resolve(NetMode::Host, 0), NetRole::HostOwner);
        assert_eq!(NetRole::resolve(NetMode::Host, 2), NetRole::HostPuppet);
        assert_eq!(NetRole::resolve(NetMode::Remote { local_id: 2 }, 2), NetRole::RemoteOwner);
        assert_eq!(NetRole::resolve(NetMode::Remote { local_id: 2 }, 3), NetRole::RemotePuppet);
        assert_eq!(NetRole::resolve(NetMode::Remote { local_id: 2 }, 0), NetRole::RemotePuppet);
    }

    #[test]
    fn offline_calls_execute_locally() {
        let mut turret = Turret::default();
        assert_eq!(turret.call_rpc("Hit", (1, 2)), CallOutcome::Executed);
        assert_eq!(turret.hits, vec![(1, 2)]);
        assert!(!turret.net.has_queued_net_data(SocketClass::Reliable));
    }

    #[test]
    fn host_puppet_owner_call_targets_the_owner() {
        let mut turret = Turret::with_role(NetMode::Host, 5, 3);
        let outcome = turret.call_rpc("Notify", ());
        assert_eq!(outcome, CallOutcome::Queued(RpcTarget::Client(3)));
        assert_eq!(turret.pings, 0);
        let queued = turret.net.queued_rpcs(SocketClass::Reliable);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].target, RpcTarget::Client(3));
        assert!(!turret.net.has_queued_net_data(SocketClass::Unreliable));
    }

    #[test]
    fn host_broadcast_runs_locally_and_queues() {
        let mut turret = Turret::with_role(NetMode::Host, 5, 0);
        let outcome = turret.call_rpc("Shout", ());
        assert_eq!(outcome, CallOutcome::ExecutedAndQueued(RpcTarget::AllRemotes));
        assert_eq!(turret.pings, 10);
        assert_eq!(turret.net.queued_rpcs(SocketClass::Unreliable).len(), 1);
    }

    #[test]
    fn remote_puppet_broadcast_is_denied_without_traffic() {
        let mut turret = Turret::with_role(NetMode::Remote { local_id: 2 }, 5, 3);
        assert_eq!(turret.call_rpc("Shout", ()), CallOutcome::Denied);
        assert_eq!(turret.call_rpc("Notify", ()), CallOutcome::Denied);
        assert_eq!(turret.pings, 0);
        assert!(!turret.net.has_queued_net_data(SocketClass::Reliable));
        assert!(!turret.net.has_queued_net_data(SocketClass::Unreliable));
    }

    #[test]
    fn remote_host_call_is_sent_not_executed() {
        let mut turret = Turret::with_role(NetMode::Remote { local_id: 3 }, 5, 3);
        assert_eq!(turret.call_rpc("Hit", (4, 4)), CallOutcome::Queued(RpcTarget::Host));
        assert!(turret.hits.is_empty());
        let queued = turret.net.take_rpcs(SocketClass::Reliable);
        assert_eq!(queued[0].request.params, encode_to_vec(&(4i32, 4i32)));
    }

    #[test]
    fn unregistered_object_in_session_discards_calls() {
        let mut turret = Turret::with_role(NetMode::Host, 0, 0);
        assert_eq!(turret.call_rpc("Hit", (1, 1)), CallOutcome::Discarded);
        assert!(turret.hits.is_empty());
    }

    #[test]
    fn unknown_rpc_name_fails() {
        let mut turret = Turret::default();
        assert_eq!(turret.call_rpc("Nope", ()), CallOutcome::Failed);
    }

    #[test]
    fn dispatch_invokes_exactly_once() {
        let mut turret = Turret::default();
        let mut params = ByteBuffer::from_wire(&encode_to_vec(&(7i32, 8i32)));
        turret.execute_rpc(0, &mut params, &DecodeContext::detached()).unwrap();
        assert_eq!(turret.hits, vec![(7, 8)]);
    }

    #[test]
    fn dispatch_one_byte_short_is_not_invoked() {
        let mut turret = Turret::default();
        let mut bytes = encode_to_vec(&(7i32, 8i32));
        bytes.pop();
        let mut params = ByteBuffer::from_wire(&bytes);
        let result = turret.execute_rpc(0, &mut params, &DecodeContext::detached());
        assert!(matches!(result, Err(RpcError::Decode(_))));
        assert!(turret.hits.is_empty());
    }

    #[test]
    fn unknown_index_is_reported() {
        let mut turret = Turret::default();
        let result = turret.execute_rpc(42, &mut ByteBuffer::new(), &DecodeContext::detached());
        assert_eq!(result, Err(RpcError::UnknownIndex(42)));
    }

    #[test]
    fn on_change_vars_are_sent_only_when_changed() {
        let mut turret = Turret::default();
        let first = turret.collect_sync_vars(Some(SocketClass::Reliable), false);
        assert_eq!(first.len(), 1);
        assert!(turret.collect_sync_vars(Some(SocketClass::Reliable), false).is_empty());

        turret.score = 5;
        let changed = turret.collect_sync_vars(Some(SocketClass::Reliable), false);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].index, 0);
        assert_eq!(changed[0].value, encode_to_vec(&5i32));
    }

    #[test]
    fn always_vars_are_sent_every_time() {
        let mut turret = Turret::default();
        for _ in 0..3 {
            let updates = turret.collect_sync_vars(Some(SocketClass::Unreliable), false);
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].index, 1);
        }
    }

    #[test]
    fn forced_collection_includes_unchanged_vars() {
        let mut turret = Turret::default();
        turret.collect_sync_vars(None, false);
        assert_eq!(turret.collect_sync_vars(None, true).len(), 2);
    }

    #[test]
    fn sync_var_assignment_fires_callback_unless_skipped() {
        let mut turret = Turret::default();
        let cx = DecodeContext::detached();
        let mut value = ByteBuffer::from_wire(&encode_to_vec(&9i32));
        turret.execute_sync_var(0, &mut value, false, &cx).unwrap();
        assert_eq!((turret.score, turret.score_changes), (9, 1));

        let mut value = ByteBuffer::from_wire(&encode_to_vec(&11i32));
        turret.execute_sync_var(0, &mut value, true, &cx).unwrap();
        assert_eq!((turret.score, turret.score_changes), (11, 1));
    }

    #[test]
    fn oversized_arguments_are_refused_before_running() {
        let mut turret = Turret::with_role(NetMode::Host, 5, 0);
        let outcome = turret.call_rpc("Upload", (vec![0u8; MAX_PARAMS_LEN],));
        assert_eq!(outcome, CallOutcome::TooLarge);
        assert_eq!(turret.uploaded, 0);
        assert!(!turret.net.has_queued_net_data(SocketClass::Reliable));

        let outcome = turret.call_rpc("Upload", (vec![0u8; 512],));
        assert_eq!(outcome, CallOutcome::ExecutedAndQueued(RpcTarget::AllRemotes));
        assert_eq!(turret.uploaded, 512);
    }
}
