//! The game: owner of every object, the current level and the net lookup.
//!
//! Objects live in an arena keyed by [`ObjectId`]. Replicated objects are
//! additionally registered in the [`NetLookup`] under their network id. On
//! the host every registration, removal and level change is recorded in a
//! [`NetJournal`] that the session drains each update to build spawn,
//! destroy and `SwitchLevel` messages.

use crate::class::{ClassInfo, ClassKind, ClassRegistry};
use crate::codec::DecodeContext;
use crate::level::Level;
use crate::lookup::{NetLookup, NetRef, ObjectId};
use crate::net_object::{NetMode, NetObject};
use crate::player::PlayerController;
use crate::version::Version;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordinal of the game-level `SwitchLevel(u16 level_class_id)` call.
pub const GAME_RPC_SWITCH_LEVEL: u16 = 0;

/// Replication events recorded on the host since the last drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetJournal {
    /// Network ids registered, in registration order.
    pub spawned: Vec<u16>,
    /// Network ids unregistered.
    pub destroyed: Vec<u16>,
    /// Level class ids switched to.
    pub level_switches: Vec<u16>,
}

impl NetJournal {
    /// Whether nothing happened.
    pub fn is_empty(&self) -> bool {
        self.spawned.is_empty() && self.destroyed.is_empty() && self.level_switches.is_empty()
    }
}

struct LoadedLevel {
    class_id: u16,
    level: Box<dyn Level>,
}

/// Object graph replicated by a session.
pub struct Game {
    name: String,
    version: Version,
    registry: Arc<ClassRegistry>,
    objects: BTreeMap<ObjectId, Box<dyn NetObject>>,
    next_object: u32,
    active: Vec<ObjectId>,
    actors: Vec<ObjectId>,
    level: Option<LoadedLevel>,
    lookup: NetLookup,
    mode: NetMode,
    next_net_id: u16,
    journal: NetJournal,
    player_class: Option<u16>,
}

impl Game {
    /// Create an offline game over `registry`.
    pub fn new(name: impl Into<String>, version: Version, registry: Arc<ClassRegistry>) -> Self {
        Self {
            name: name.into(),
            version,
            registry,
            objects: BTreeMap::new(),
            next_object: 0,
            active: Vec::new(),
            actors: Vec::new(),
            level: None,
            lookup: NetLookup::new(),
            mode: NetMode::Offline,
            next_net_id: 1,
            journal: NetJournal::default(),
            player_class: None,
        }
    }

    /// Game name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Game build version, checked during the handshake.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Shared class registry.
    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Current session mode.
    pub fn net_mode(&self) -> NetMode {
        self.mode
    }

    /// Network id lookup.
    pub fn lookup(&self) -> &NetLookup {
        &self.lookup
    }

    /// Decode context resolving references through this game's lookup.
    pub fn decode_context(&self) -> DecodeContext<'_> {
        DecodeContext::with_lookup(&self.lookup)
    }

    /// Class used for player controllers created during admission.
    pub fn set_player_class(&mut self, class_id: u16) {
        self.player_class = Some(class_id);
    }

    /// Configured player controller class.
    pub fn player_class(&self) -> Option<u16> {
        self.player_class
    }

    // --- session transitions -------------------------------------------------

    /// Become the authoritative host and register every synced object.
    pub fn begin_hosting(&mut self) {
        self.mode = NetMode::Host;
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in ids {
            if let Some(object) = self.objects.get_mut(&id) {
                object.net_mut().update_role(NetMode::Host);
            }
            self.register(id);
        }
        info!(objects = self.lookup.len(), "Hosting started");
    }

    /// Become a client mirroring the host. Local synced objects are removed;
    /// the host will send its own.
    pub fn begin_remote(&mut self, local_id: u16) {
        let synced: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, object)| object.net().is_net_synced())
            .map(|(id, _)| *id)
            .collect();
        for id in synced {
            self.remove(id);
        }
        self.mode = NetMode::Remote { local_id };
        for object in self.objects.values_mut() {
            object.net_mut().update_role(self.mode);
        }
        info!(local_id, "Joined session");
    }

    /// Leave the session. Replicas received from a host are destroyed.
    pub fn end_session(&mut self) {
        if let NetMode::Remote { .. } = self.mode {
            let replicas: Vec<ObjectId> = self
                .lookup
                .net_ids()
                .filter_map(|net_id| self.lookup.get(net_id))
                .collect();
            for id in replicas {
                self.remove(id);
            }
            if let Some(mut old) = self.level.take() {
                old.level.on_destroy();
            }
        }
        self.mode = NetMode::Offline;
        self.lookup.clear();
        self.journal = NetJournal::default();
        for object in self.objects.values_mut() {
            let net = object.net_mut();
            net.set_network_id(0);
            net.clear_queued_net_data();
            net.update_role(NetMode::Offline);
        }
        info!("Session ended");
    }

    // --- object lifecycle ----------------------------------------------------

    /// Construct and insert an object or actor of `class_id`.
    pub fn spawn(&mut self, class_id: u16, owner_id: u16) -> Option<ObjectId> {
        let registry = Arc::clone(&self.registry);
        let Some(class) = registry.class(class_id) else {
            warn!(class_id, "Spawn of unknown class");
            return None;
        };
        let object = class.instantiate()?;
        Some(self.insert_as(object, class.kind(), owner_id))
    }

    /// Construct and insert an object or actor registered as `name`.
    pub fn spawn_by_name(&mut self, name: &str, owner_id: u16) -> Option<ObjectId> {
        let class_id = self.registry.by_name(name).map(ClassInfo::id)?;
        self.spawn(class_id, owner_id)
    }

    /// Construct a player controller of the configured class without
    /// inserting it.
    pub fn create_player_controller(&self) -> Option<Box<dyn NetObject>> {
        let class = self.registry.class(self.player_class?)?;
        let object = class.instantiate()?;
        if object.player_controller().is_none() {
            warn!(class = class.name(), "Player class does not embed a PlayerController");
            return None;
        }
        Some(object)
    }

    /// Insert an already constructed object owned by `owner_id`.
    ///
    /// The arena list is chosen from the object's registered class kind.
    pub fn insert(&mut self, object: Box<dyn NetObject>, owner_id: u16) -> ObjectId {
        let kind = self
            .registry
            .class(object.net().class_id())
            .map_or(ClassKind::Object, ClassInfo::kind);
        self.insert_as(object, kind, owner_id)
    }

    fn insert_as(&mut self, mut object: Box<dyn NetObject>, kind: ClassKind, owner_id: u16) -> ObjectId {
        let id = ObjectId(self.next_object);
        self.next_object += 1;

        object.net_mut().set_network_owner_id(owner_id);
        object.net_mut().update_role(self.mode);
        match kind {
            ClassKind::Actor => self.actors.push(id),
            ClassKind::Object | ClassKind::Level => self.active.push(id),
        }
        self.objects.insert(id, object);

        if self.mode == NetMode::Host {
            self.register(id);
        }
        if let Some(object) = self.objects.get_mut(&id) {
            object.on_begin();
        }
        id
    }

    fn register(&mut self, id: ObjectId) {
        let type_id = match self.objects.get(&id) {
            Some(object) if object.net().is_net_synced() && object.net().network_id() == 0 => {
                object.as_any().type_id()
            }
            _ => return,
        };
        let Some(net_id) = self.allocate_net_id() else {
            warn!("Network id space exhausted; object stays local");
            return;
        };
        if let Some(object) = self.objects.get_mut(&id) {
            object.net_mut().set_network_id(net_id);
        }
        self.lookup.insert(net_id, id, type_id);
        self.journal.spawned.push(net_id);
        debug!(net_id, "Registered net object");
    }

    fn allocate_net_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_net_id;
            self.next_net_id = self.next_net_id.checked_add(1).unwrap_or(1);
            if candidate != 0 && !self.lookup.contains(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Destroy an object. On the host the removal is journaled.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        if !self.objects.contains_key(&id) {
            return false;
        }
        self.remove(id);
        true
    }

    /// Destroy the object registered under `net_id`.
    pub fn destroy_net(&mut self, net_id: u16) -> bool {
        match self.lookup.get(net_id) {
            Some(id) => self.destroy(id),
            None => false,
        }
    }

    fn remove(&mut self, id: ObjectId) {
        let Some(mut object) = self.objects.remove(&id) else {
            return;
        };
        self.active.retain(|other| *other != id);
        self.actors.retain(|other| *other != id);
        object.on_destroy();

        let net_id = object.net().network_id();
        if net_id != 0 && self.lookup.get(net_id) == Some(id) {
            self.lookup.remove(net_id);
            if self.mode == NetMode::Host {
                let before = self.journal.spawned.len();
                self.journal.spawned.retain(|spawned| *spawned != net_id);
                if self.journal.spawned.len() == before {
                    self.journal.destroyed.push(net_id);
                }
            }
            debug!(net_id, "Unregistered net object");
        }
    }

    /// Drain the replication journal.
    pub fn take_journal(&mut self) -> NetJournal {
        std::mem::take(&mut self.journal)
    }

    /// Events recorded since the last drain.
    pub fn pending_journal(&self) -> &NetJournal {
        &self.journal
    }

    // --- replicas (client side) ----------------------------------------------

    /// Construct the replica announced by a spawn notice.
    pub fn spawn_replica(&mut self, class_id: u16, net_id: u16, owner_id: u16) -> Option<ObjectId> {
        if net_id == 0 || self.lookup.contains(net_id) {
            warn!(net_id, "Spawn notice for an id already in use");
            return None;
        }
        let registry = Arc::clone(&self.registry);
        let Some(class) = registry.class(class_id) else {
            warn!(class_id, "Spawn notice for an unknown class");
            return None;
        };
        let mut object = class.instantiate()?;
        object.net_mut().set_net_synced(true);
        object.net_mut().set_network_id(net_id);
        object.net_mut().set_network_owner_id(owner_id);
        object.net_mut().update_role(self.mode);
        let type_id = object.as_any().type_id();

        let id = ObjectId(self.next_object);
        self.next_object += 1;
        match class.kind() {
            ClassKind::Actor => self.actors.push(id),
            ClassKind::Object | ClassKind::Level => self.active.push(id),
        }
        self.objects.insert(id, object);
        self.lookup.insert(net_id, id, type_id);
        if let Some(object) = self.objects.get_mut(&id) {
            object.on_begin();
        }
        debug!(net_id, class = class.name(), "Replica spawned");
        Some(id)
    }

    // --- levels --------------------------------------------------------------

    /// Replace the current level, destroying its actors and spawning the new
    /// level's default actors. Refused on clients.
    pub fn switch_level(&mut self, class_id: u16) -> bool {
        if let NetMode::Remote { .. } = self.mode {
            warn!(class_id, "Clients cannot switch levels");
            return false;
        }
        let registry = Arc::clone(&self.registry);
        let Some(level) = registry.level_class(class_id).and_then(ClassInfo::instantiate_level) else {
            warn!(class_id, "Unknown level class");
            return false;
        };

        for id in std::mem::take(&mut self.actors) {
            self.remove(id);
        }
        let defaults = level.default_actors();
        self.install_level(class_id, level);
        if self.mode == NetMode::Host {
            self.journal.level_switches.push(class_id);
        }
        for name in defaults {
            if self.spawn_by_name(name, 0).is_none() {
                warn!(actor = name, "Default actor could not be spawned");
            }
        }
        info!(class_id, "Level switched");
        true
    }

    /// Apply a `SwitchLevel` received from the host. Actors are left alone;
    /// the host's destroy and spawn notices manage them.
    pub fn apply_level_switch(&mut self, class_id: u16) -> bool {
        let registry = Arc::clone(&self.registry);
        let Some(level) = registry.level_class(class_id).and_then(ClassInfo::instantiate_level) else {
            warn!(class_id, "SwitchLevel to an unknown level class");
            return false;
        };
        self.install_level(class_id, level);
        true
    }

    fn install_level(&mut self, class_id: u16, mut level: Box<dyn Level>) {
        if let Some(mut old) = self.level.take() {
            old.level.on_destroy();
        }
        level.on_begin();
        self.level = Some(LoadedLevel { class_id, level });
    }

    /// Class id of the current level.
    pub fn level_class(&self) -> Option<u16> {
        self.level.as_ref().map(|loaded| loaded.class_id)
    }

    /// The current level.
    pub fn level(&self) -> Option<&dyn Level> {
        self.level.as_ref().map(|loaded| loaded.level.as_ref())
    }

    // --- access --------------------------------------------------------------

    /// Actors of the current level in spawn order.
    pub fn actors(&self) -> &[ObjectId] {
        &self.actors
    }

    /// Plain objects in spawn order.
    pub fn active_objects(&self) -> &[ObjectId] {
        &self.active
    }

    /// Every live object id.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Object by arena id.
    pub fn get(&self, id: ObjectId) -> Option<&dyn NetObject> {
        self.objects.get(&id).map(|object| object.as_ref())
    }

    /// Mutable object by arena id.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut dyn NetObject> {
        let object: &mut dyn NetObject = self.objects.get_mut(&id)?.as_mut();
        Some(object)
    }

    /// Object by arena id, downcast to `T`.
    pub fn object<T: NetObject>(&self, id: ObjectId) -> Option<&T> {
        self.get(id)?.as_any().downcast_ref()
    }

    /// Mutable object by arena id, downcast to `T`.
    pub fn object_mut<T: NetObject>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.get_mut(id)?.as_any_mut().downcast_mut()
    }

    /// Ids of every object of concrete type `T`, in arena order.
    pub fn objects_of<T: NetObject>(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, object)| object.as_any().is::<T>())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Ids of every object owned by player `owner_id`.
    pub fn objects_owned_by(&self, owner_id: u16) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, object)| object.net().network_owner_id() == owner_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Arena id of the object registered under `net_id`.
    pub fn by_net_id(&self, net_id: u16) -> Option<ObjectId> {
        self.lookup.get(net_id)
    }

    /// Resolve a reference; `None` when the target is gone.
    pub fn resolve<T: NetObject>(&self, reference: NetRef<T>) -> Option<&T> {
        self.object(self.lookup.get(reference.net_id())?)
    }

    /// Mutably resolve a reference.
    pub fn resolve_mut<T: NetObject>(&mut self, reference: NetRef<T>) -> Option<&mut T> {
        let id = self.lookup.get(reference.net_id())?;
        self.object_mut(id)
    }

    /// Object registered under `net_id` together with a decode context over
    /// the rest of the lookup.
    pub fn net_object_mut(&mut self, net_id: u16) -> Option<(&mut dyn NetObject, DecodeContext<'_>)> {
        let id = self.lookup.get(net_id)?;
        let Self { objects, lookup, .. } = self;
        let object: &mut dyn NetObject = objects.get_mut(&id)?.as_mut();
        Some((object, DecodeContext::with_lookup(lookup)))
    }

    /// Replicated network ids in ascending order.
    pub fn net_ids(&self) -> Vec<u16> {
        self.lookup.net_ids().collect()
    }

    /// Player controller owned by `owner_id`.
    pub fn player_controller_of(&self, owner_id: u16) -> Option<(ObjectId, &PlayerController)> {
        self.objects.iter().find_map(|(id, object)| {
            let pc = object.player_controller()?;
            (object.net().network_owner_id() == owner_id).then_some((*id, pc))
        })
    }

    /// Every player controller with its owner id.
    pub fn player_controllers(&self) -> Vec<(u16, &PlayerController)> {
        self.objects
            .values()
            .filter_map(|object| {
                let pc = object.player_controller()?;
                Some((object.net().network_owner_id(), pc))
            })
            .collect()
    }

    /// Advance the level and every object by `delta` seconds.
    pub fn tick(&mut self, delta: f32) {
        if let Some(loaded) = self.level.as_mut() {
            loaded.level.on_tick(delta);
        }
        for object in self.objects.values_mut() {
            object.on_tick(delta);
        }
    }
}

impl Drop for Game {
    fn drop(&mut self) {
        for object in self.objects.values_mut() {
            object.on_destroy();
        }
        if let Some(loaded) = self.level.as_mut() {
            loaded.level.on_destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::EmptyLevel;
    use crate::net_object::{NetObjectExt, NetRole, NetState};
    use crate::table::{NetTable, ReplicationTable};
    use crate::version::ENGINE_VERSION;
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Crate {
        net: NetState,
    }

    impl NetObject for Crate {
        fn net(&self) -> &NetState {
            &self.net
        }

        fn net_mut(&mut self) -> &mut NetState {
            &mut self.net
        }

        fn net_table(&self) -> &'static dyn ReplicationTable {
            static TABLE: OnceLock<NetTable<Crate>> = OnceLock::new();
            TABLE.get_or_init(|| NetTable::builder().build())
        }

        crate::net_object_any!();
    }

    struct Arena;

    impl Level for Arena {
        fn default_actors(&self) -> Vec<&'static str> {
            vec!["Crate", "Crate"]
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn synced_crate() -> Box<dyn NetObject> {
        Box::new(Crate {
            net: NetState::synced(),
        })
    }

    fn registry() -> Arc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        registry.register_actor("Crate", None, synced_crate).unwrap();
        registry
            .register_object("PlayerController", None, || Box::new(PlayerController::default()))
            .unwrap();
        registry.register_level("Arena", || Box::new(Arena)).unwrap();
        registry.register_level("Empty", || Box::new(EmptyLevel)).unwrap();
        Arc::new(registry)
    }

    fn game() -> Game {
        Game::new("test", ENGINE_VERSION, registry())
    }

    #[test]
    fn host_spawns_get_increasing_net_ids() {
        let mut game = game();
        game.begin_hosting();
        let a = game.spawn_by_name("Crate", 0).unwrap();
        let b = game.spawn_by_name("Crate", 0).unwrap();
        let net_a = game.get(a).unwrap().net().network_id();
        let net_b = game.get(b).unwrap().net().network_id();
        assert_eq!((net_a, net_b), (1, 2));
        assert_eq!(game.get(a).unwrap().net().role(), NetRole::HostOwner);
        assert_eq!(game.take_journal().spawned, vec![1, 2]);
    }

    #[test]
    fn registration_records_the_concrete_type() {
        let mut game = game();
        game.begin_hosting();
        let id = game.spawn_by_name("Crate", 0).unwrap();
        assert_eq!(game.by_net_id(1), Some(id));
        assert!(game.lookup().is_type::<Crate>(1));
        assert!(!game.lookup().is_type::<PlayerController>(1));
    }

    #[test]
    fn offline_spawns_are_not_registered() {
        let mut game = game();
        let id = game.spawn_by_name("Crate", 0).unwrap();
        assert_eq!(game.get(id).unwrap().net().network_id(), 0);
        assert!(game.lookup().is_empty());
    }

    #[test]
    fn destroy_unregisters_and_journals() {
        let mut game = game();
        game.begin_hosting();
        let id = game.spawn_by_name("Crate", 0).unwrap();
        game.take_journal();
        assert!(game.destroy(id));
        assert!(game.by_net_id(1).is_none());
        assert_eq!(game.take_journal().destroyed, vec![1]);
        assert!(!game.destroy(id));
    }

    #[test]
    fn spawn_then_destroy_in_one_tick_leaves_no_trace() {
        let mut game = game();
        game.begin_hosting();
        let id = game.spawn_by_name("Crate", 0).unwrap();
        game.destroy(id);
        assert!(game.take_journal().is_empty());
    }

    #[test]
    fn client_owned_spawn_is_host_puppet() {
        let mut game = game();
        game.begin_hosting();
        let id = game.spawn_by_name("Crate", 3).unwrap();
        assert_eq!(game.get(id).unwrap().net().role(), NetRole::HostPuppet);
    }

    #[test]
    fn switch_level_replaces_actors() {
        let mut game = game();
        game.begin_hosting();
        let arena = game.registry().by_name("Arena").unwrap().id();
        let empty = game.registry().by_name("Empty").unwrap().id();

        assert!(game.switch_level(arena));
        assert_eq!(game.actors().len(), 2);
        game.take_journal();

        assert!(game.switch_level(empty));
        assert!(game.actors().is_empty());
        let journal = game.take_journal();
        assert_eq!(journal.destroyed, vec![1, 2]);
        assert_eq!(journal.level_switches, vec![empty]);
        assert_eq!(game.level_class(), Some(empty));
    }

    #[test]
    fn replicas_take_roles_from_the_local_id() {
        let mut game = game();
        game.begin_remote(2);
        let crate_class = game.registry().by_name("Crate").unwrap().id();
        let mine = game.spawn_replica(crate_class, 10, 2).unwrap();
        let theirs = game.spawn_replica(crate_class, 11, 3).unwrap();
        assert_eq!(game.get(mine).unwrap().net().role(), NetRole::RemoteOwner);
        assert_eq!(game.get(theirs).unwrap().net().role(), NetRole::RemotePuppet);
        assert!(game.spawn_replica(crate_class, 10, 0).is_none());
        assert!(game.take_journal().is_empty());

        game.end_session();
        assert_eq!(game.object_count(), 0);
    }

    #[test]
    fn clients_cannot_switch_levels() {
        let mut game = game();
        game.begin_remote(1);
        let arena = game.registry().by_name("Arena").unwrap().id();
        assert!(!game.switch_level(arena));
        assert!(game.apply_level_switch(arena));
        assert!(game.actors().is_empty());
    }

    #[test]
    fn references_resolve_through_the_lookup() {
        let mut game = game();
        game.begin_hosting();
        let id = game.spawn_by_name("Crate", 0).unwrap();
        let net_id = game.get(id).unwrap().net().network_id();
        assert!(game.resolve(NetRef::<Crate>::new(net_id)).is_some());
        assert!(game.resolve(NetRef::<PlayerController>::new(net_id)).is_none());
        game.destroy(id);
        assert!(game.resolve(NetRef::<Crate>::new(net_id)).is_none());
    }

    #[test]
    fn player_controller_class_is_validated() {
        let mut game = game();
        let pc_class = game.registry().by_name("PlayerController").unwrap().id();
        let crate_class = game.registry().by_name("Crate").unwrap().id();
        game.set_player_class(crate_class);
        assert!(game.create_player_controller().is_none());
        game.set_player_class(pc_class);
        let pc = game.create_player_controller().unwrap();
        game.begin_hosting();
        let id = game.insert(pc, 4);
        assert_eq!(game.player_controller_of(4).map(|(found, _)| found), Some(id));
        assert!(game.get_mut(id).unwrap().call_rpc("SendMessage", ("hi",)).executed_locally());
    }
}
