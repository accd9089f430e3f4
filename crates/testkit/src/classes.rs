//! Replicated classes used by session tests.

use bomberboy_core::{
    net_object_any, CallingMode, ClassRegistry, Game, Level, NetObject, NetObjectExt, NetState,
    NetTable, PlayerController, RegistryError, ReplicationTable, SocketClass, SyncMode, Version,
};
use glam::{IVec2, Vec2};
use std::any::Any;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Game version the test games report.
pub const TEST_GAME_VERSION: Version = Version::new(1, 0, 0);

/// Positioned base actor.
#[derive(Debug, Clone)]
pub struct TestActor {
    net: NetState,
    location: Vec2,
}

impl Default for TestActor {
    fn default() -> Self {
        Self {
            net: NetState::synced(),
            location: Vec2::ZERO,
        }
    }
}

impl TestActor {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "TestActor";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<TestActor>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .sync_var(
                    "Location",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |a: &TestActor| &a.location,
                    |a: &mut TestActor| &mut a.location,
                )
                .build()
        })
    }

    /// Current location.
    pub fn location(&self) -> Vec2 {
        self.location
    }

    /// Move the actor; replicated on the next update.
    pub fn set_location(&mut self, location: Vec2) {
        self.location = location;
    }
}

impl NetObject for TestActor {
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

/// Actor exercising every RPC mode and an `OnChange` sync-var.
///
/// Handlers only record what they received so tests can count invocations.
#[derive(Debug, Clone, Default)]
pub struct TestEntity {
    actor: TestActor,
    start: Vec2,
    timer: f32,
    score: i32,
    score_changes: u32,
    explosions: Vec<IVec2>,
    print_times: Vec<(f32, f32)>,
    resets: u32,
}

impl TestEntity {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "TestEntity";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<TestEntity>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .inherit(TestActor::table(), |e: &TestEntity| &e.actor, |e: &mut TestEntity| &mut e.actor)
                .rpc("ResetPosition", SocketClass::Reliable, CallingMode::Host, |e: &mut TestEntity, (): ()| {
                    e.resets += 1;
                    e.actor.location = e.start;
                })
                .rpc(
                    "MoveTo",
                    SocketClass::Reliable,
                    CallingMode::Host,
                    |e: &mut TestEntity, (x, y): (f32, f32)| e.actor.location = Vec2::new(x, y),
                )
                .rpc(
                    "PrintTime",
                    SocketClass::Unreliable,
                    CallingMode::Broadcast,
                    |e: &mut TestEntity, (time, remaining): (f32, f32)| {
                        e.print_times.push((time, remaining));
                        e.actor.location = e.start + Vec2::new(time, -time) * 20.0;
                    },
                )
                .rpc(
                    "Explode",
                    SocketClass::Reliable,
                    CallingMode::Broadcast,
                    |e: &mut TestEntity, (tile,): (IVec2,)| e.explosions.push(tile),
                )
                .sync_var(
                    "Score",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |e: &TestEntity| &e.score,
                    |e: &mut TestEntity| &mut e.score,
                )
                .on_change(|e: &mut TestEntity| e.score_changes += 1)
                .build()
        })
    }

    /// Embedded base actor.
    pub fn actor(&self) -> &TestActor {
        &self.actor
    }

    /// Mutable base actor.
    pub fn actor_mut(&mut self) -> &mut TestActor {
        &mut self.actor
    }

    /// Replicated score.
    pub fn score(&self) -> i32 {
        self.score
    }

    /// Set the score; replicated on the next update when it changed.
    pub fn set_score(&mut self, score: i32) {
        self.score = score;
    }

    /// Times the score change callback fired.
    pub fn score_changes(&self) -> u32 {
        self.score_changes
    }

    /// Tiles received through `Explode`, in call order.
    pub fn explosions(&self) -> &[IVec2] {
        &self.explosions
    }

    /// Arguments received through `PrintTime`, in arrival order.
    pub fn print_times(&self) -> &[(f32, f32)] {
        &self.print_times
    }

    /// `ResetPosition` invocations.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Seconds accumulated by [`NetObject::on_tick`].
    pub fn timer(&self) -> f32 {
        self.timer
    }
}

impl NetObject for TestEntity {
    fn net(&self) -> &NetState {
        self.actor.net()
    }

    fn net_mut(&mut self) -> &mut NetState {
        self.actor.net_mut()
    }

    fn net_table(&self) -> &'static dyn ReplicationTable {
        Self::table()
    }

    fn on_begin(&mut self) {
        self.start = self.actor.location;
        self.timer = 0.0;
    }

    fn on_destroy(&mut self) {
        debug!(net_id = self.net().network_id(), "TestEntity destroyed");
    }

    fn on_tick(&mut self, delta: f32) {
        self.timer += delta;
    }

    net_object_any!();
}

/// Level spawning one [`TestEntity`].
#[derive(Debug, Default)]
pub struct TestLevel;

impl TestLevel {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "TestLevel";
}

impl Level for TestLevel {
    fn default_actors(&self) -> Vec<&'static str> {
        vec![TestEntity::CLASS_NAME]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn new_player_controller() -> Box<dyn NetObject> {
    Box::new(PlayerController::default())
}

fn new_test_actor() -> Box<dyn NetObject> {
    Box::new(TestActor::default())
}

fn new_test_entity() -> Box<dyn NetObject> {
    Box::new(TestEntity::default())
}

fn new_test_level() -> Box<dyn Level> {
    Box::new(TestLevel)
}

fn register_test_classes(registry: &mut ClassRegistry) -> Result<(), RegistryError> {
    registry.register_object(PlayerController::CLASS_NAME, None, new_player_controller)?;
    registry.register_actor(TestActor::CLASS_NAME, None, new_test_actor)?;
    registry.register_actor(TestEntity::CLASS_NAME, Some(TestActor::CLASS_NAME), new_test_entity)?;
    registry.register_level(TestLevel::CLASS_NAME, new_test_level)?;
    Ok(())
}

/// Registry holding the engine player controller and the test classes.
///
/// Registration order is fixed, so every call yields the same class ids.
pub fn test_registry() -> Arc<ClassRegistry> {
    let mut registry = ClassRegistry::new();
    if let Err(err) = register_test_classes(&mut registry) {
        panic!("test classes failed to register: {err}");
    }
    Arc::new(registry)
}

/// Offline game over [`test_registry`] reporting `version`.
pub fn test_game_with_version(version: Version) -> Game {
    let registry = test_registry();
    let mut game = Game::new("BomberBoy Test", version, Arc::clone(&registry));
    if let Some(class) = registry.by_name(PlayerController::CLASS_NAME) {
        game.set_player_class(class.id());
    }
    game
}

/// Offline game over [`test_registry`].
pub fn test_game() -> Game {
    test_game_with_version(TEST_GAME_VERSION)
}

/// Call `name` on the [`TestEntity`] registered under `net_id`.
pub fn call_on_entity<A: bomberboy_core::Encode>(
    game: &mut Game,
    net_id: u16,
    name: &str,
    args: A,
) -> Option<bomberboy_core::CallOutcome> {
    let id = game.by_net_id(net_id)?;
    let entity = game.object_mut::<TestEntity>(id)?;
    Some(entity.call_rpc(name, args))
}
