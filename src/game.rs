//! BomberBoy game classes and the host-side round logic.

use anyhow::{Context, Result};
use bomberboy_core::{
    net_object_any, CallingMode, ClassRegistry, Game, Level, NetObject, NetObjectExt, NetState,
    NetTable, ObjectId, PlayerController, ReplicationTable, SocketClass, SyncMode, Version,
};
use glam::IVec2;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Version the sample game reports during the handshake.
pub const GAME_VERSION: Version = Version::new(0, 1, 0);

/// Arena size in tiles.
pub const ARENA_SIZE: IVec2 = IVec2::new(13, 11);

/// Seconds between placing a bomb and its explosion.
pub const BOMB_FUSE_SECONDS: f32 = 2.5;

/// Tiles covered by a blast in each direction.
pub const BLAST_RADIUS: i32 = 2;

const SPAWN_CORNERS: [IVec2; 4] = [
    IVec2::new(1, 1),
    IVec2::new(ARENA_SIZE.x - 2, ARENA_SIZE.y - 2),
    IVec2::new(ARENA_SIZE.x - 2, 1),
    IVec2::new(1, ARENA_SIZE.y - 2),
];

const CRATE_TILES: [IVec2; 4] = [
    IVec2::new(3, 1),
    IVec2::new(6, 5),
    IVec2::new(9, 9),
    IVec2::new(1, 7),
];

fn in_arena(tile: IVec2) -> bool {
    tile.cmpge(IVec2::ZERO).all() && tile.cmplt(ARENA_SIZE).all()
}

/// Manhattan distance between two tiles.
fn tile_distance(a: IVec2, b: IVec2) -> i32 {
    let d = a - b;
    d.x.abs() + d.y.abs()
}

/// Player controller with a replicated score and ready flag.
#[derive(Debug, Clone, Default)]
pub struct BPlayerController {
    controller: PlayerController,
    score: i32,
    ready: bool,
}

impl BPlayerController {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "BPlayerController";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<BPlayerController>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .inherit(
                    PlayerController::table(),
                    |pc: &BPlayerController| &pc.controller,
                    |pc: &mut BPlayerController| &mut pc.controller,
                )
                .rpc(
                    "SetReady",
                    SocketClass::Reliable,
                    CallingMode::Host,
                    |pc: &mut BPlayerController, (ready,): (bool,)| pc.ready = ready,
                )
                .sync_var(
                    "Score",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |pc: &BPlayerController| &pc.score,
                    |pc: &mut BPlayerController| &mut pc.score,
                )
                .sync_var(
                    "Ready",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |pc: &BPlayerController| &pc.ready,
                    |pc: &mut BPlayerController| &mut pc.ready,
                )
                .build()
        })
    }

    /// Points earned this session.
    pub fn score(&self) -> i32 {
        self.score
    }

    /// Whether the player asked to start the round.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Ask the host to mark this player ready.
    pub fn set_ready(&mut self, ready: bool) {
        self.call_rpc("SetReady", (ready,));
    }

    fn award(&mut self, points: i32) {
        self.score += points;
    }
}

impl NetObject for BPlayerController {
    fn net(&self) -> &NetState {
        self.controller.net()
    }

    fn net_mut(&mut self) -> &mut NetState {
        self.controller.net_mut()
    }

    fn net_table(&self) -> &'static dyn ReplicationTable {
        Self::table()
    }

    net_object_any!();

    fn player_controller(&self) -> Option<&PlayerController> {
        Some(&self.controller)
    }

    fn player_controller_mut(&mut self) -> Option<&mut PlayerController> {
        Some(&mut self.controller)
    }
}

/// A player's avatar on the arena grid.
#[derive(Debug, Clone)]
pub struct BCharacter {
    net: NetState,
    tile: IVec2,
    requested_bombs: Vec<IVec2>,
}

impl Default for BCharacter {
    fn default() -> Self {
        Self {
            net: NetState::synced(),
            tile: IVec2::ZERO,
            requested_bombs: Vec::new(),
        }
    }
}

impl BCharacter {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "BCharacter";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<BCharacter>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .rpc(
                    "Step",
                    SocketClass::Reliable,
                    CallingMode::Host,
                    |c: &mut BCharacter, (direction,): (IVec2,)| c.step(direction),
                )
                .rpc(
                    "PlaceBomb",
                    SocketClass::Reliable,
                    CallingMode::Host,
                    |c: &mut BCharacter, (tile,): (IVec2,)| c.request_bomb(tile),
                )
                .sync_var(
                    "Tile",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |c: &BCharacter| &c.tile,
                    |c: &mut BCharacter| &mut c.tile,
                )
                .build()
        })
    }

    /// Current tile.
    pub fn tile(&self) -> IVec2 {
        self.tile
    }

    fn step(&mut self, direction: IVec2) {
        if tile_distance(direction, IVec2::ZERO) != 1 {
            debug!(?direction, "Ignoring non-unit step");
            return;
        }
        let next = self.tile + direction;
        if in_arena(next) {
            self.tile = next;
        }
    }

    fn request_bomb(&mut self, tile: IVec2) {
        // Bombs go on the character's tile or a neighbour.
        if tile_distance(tile, self.tile) <= 1 && in_arena(tile) {
            self.requested_bombs.push(tile);
        } else {
            debug!(?tile, at = ?self.tile, "Bomb request out of reach");
        }
    }

    fn take_requested_bombs(&mut self) -> Vec<IVec2> {
        std::mem::take(&mut self.requested_bombs)
    }
}

impl NetObject for BCharacter {
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

/// A placed bomb counting down to its explosion.
#[derive(Debug, Clone)]
pub struct BBomb {
    net: NetState,
    tile: IVec2,
    placed_by: u16,
    fuse: f32,
    detonated: bool,
}

impl Default for BBomb {
    fn default() -> Self {
        Self {
            net: NetState::synced(),
            tile: IVec2::ZERO,
            placed_by: 0,
            fuse: BOMB_FUSE_SECONDS,
            detonated: false,
        }
    }
}

impl BBomb {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "BBomb";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<BBomb>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .rpc(
                    "Explode",
                    SocketClass::Reliable,
                    CallingMode::Broadcast,
                    |b: &mut BBomb, (tile,): (IVec2,)| {
                        info!(?tile, "Boom");
                        b.detonated = true;
                    },
                )
                .sync_var(
                    "Tile",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |b: &BBomb| &b.tile,
                    |b: &mut BBomb| &mut b.tile,
                )
                .build()
        })
    }

    /// Tile the bomb sits on.
    pub fn tile(&self) -> IVec2 {
        self.tile
    }

    /// Whether the explosion already happened.
    pub fn is_detonated(&self) -> bool {
        self.detonated
    }

    /// Tiles hit by this bomb's blast, centre first.
    pub fn blast_tiles(&self) -> Vec<IVec2> {
        let mut tiles = vec![self.tile];
        for direction in [IVec2::X, IVec2::NEG_X, IVec2::Y, IVec2::NEG_Y] {
            for distance in 1..=BLAST_RADIUS {
                let tile = self.tile + direction * distance;
                if in_arena(tile) {
                    tiles.push(tile);
                }
            }
        }
        tiles
    }
}

impl NetObject for BBomb {
    fn net(&self) -> &NetState {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetState {
        &mut self.net
    }

    fn net_table(&self) -> &'static dyn ReplicationTable {
        Self::table()
    }

    fn on_tick(&mut self, delta: f32) {
        self.fuse -= delta;
    }

    net_object_any!();
}

/// Destructible block.
#[derive(Debug, Clone)]
pub struct BCrate {
    net: NetState,
    tile: IVec2,
}

impl Default for BCrate {
    fn default() -> Self {
        Self {
            net: NetState::synced(),
            tile: IVec2::ZERO,
        }
    }
}

impl BCrate {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "BCrate";

    fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<BCrate>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .sync_var(
                    "Tile",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |c: &BCrate| &c.tile,
                    |c: &mut BCrate| &mut c.tile,
                )
                .build()
        })
    }

    /// Tile the crate blocks.
    pub fn tile(&self) -> IVec2 {
        self.tile
    }
}

impl NetObject for BCrate {
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

/// The single playing field.
#[derive(Debug, Default)]
pub struct BArena;

impl BArena {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "BArena";
}

impl Level for BArena {
    fn default_actors(&self) -> Vec<&'static str> {
        vec![BCrate::CLASS_NAME; CRATE_TILES.len()]
    }

    fn on_begin(&mut self) {
        info!(size = ?ARENA_SIZE, "Arena loaded");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn new_player_controller() -> Box<dyn NetObject> {
    Box::new(BPlayerController::default())
}

fn new_character() -> Box<dyn NetObject> {
    Box::new(BCharacter::default())
}

fn new_bomb() -> Box<dyn NetObject> {
    Box::new(BBomb::default())
}

fn new_crate() -> Box<dyn NetObject> {
    Box::new(BCrate::default())
}

fn new_arena() -> Box<dyn Level> {
    Box::new(BArena)
}

/// Registry of every BomberBoy class in a fixed order.
pub fn registry() -> Result<Arc<ClassRegistry>> {
    let mut registry = ClassRegistry::new();
    registry.register_object(BPlayerController::CLASS_NAME, None, new_player_controller)?;
    registry.register_actor(BCharacter::CLASS_NAME, None, new_character)?;
    registry.register_actor(BBomb::CLASS_NAME, None, new_bomb)?;
    registry.register_actor(BCrate::CLASS_NAME, None, new_crate)?;
    registry.register_level(BArena::CLASS_NAME, new_arena)?;
    Ok(Arc::new(registry))
}

/// Offline BomberBoy game with its player class set.
pub fn new_game() -> Result<Game> {
    let registry = registry()?;
    let player_class = registry
        .by_name(BPlayerController::CLASS_NAME)
        .map(|class| class.id())
        .context("player controller class missing from registry")?;
    let mut game = Game::new("BomberBoy", GAME_VERSION, registry);
    game.set_player_class(player_class);
    Ok(game)
}

/// Load the arena and lay out its crates. Host or offline only.
pub fn start_round(game: &mut Game) -> Result<()> {
    let arena = game
        .registry()
        .by_name(BArena::CLASS_NAME)
        .map(|class| class.id())
        .context("arena level missing from registry")?;
    anyhow::ensure!(game.switch_level(arena), "arena could not be loaded");
    for (id, tile) in game.objects_of::<BCrate>().into_iter().zip(CRATE_TILES) {
        if let Some(crate_actor) = game.object_mut::<BCrate>(id) {
            crate_actor.tile = tile;
        }
    }
    Ok(())
}

/// Advance the round on the host: give every player a character, place
/// requested bombs, and resolve explosions.
pub fn host_tick(game: &mut Game, delta: f32) {
    spawn_missing_characters(game);
    game.tick(delta);
    place_requested_bombs(game);
    clear_spent_bombs(game);
    detonate_bombs(game);
}

fn spawn_missing_characters(game: &mut Game) {
    let owners: Vec<u16> = game
        .player_controllers()
        .into_iter()
        .map(|(owner, _)| owner)
        .filter(|owner| *owner != 0)
        .collect();
    for owner in owners {
        let has_character = game
            .objects_of::<BCharacter>()
            .into_iter()
            .any(|id| game.get(id).is_some_and(|c| c.net().network_owner_id() == owner));
        if has_character {
            continue;
        }
        let Some(id) = game.spawn_by_name(BCharacter::CLASS_NAME, owner) else {
            continue;
        };
        if let Some(character) = game.object_mut::<BCharacter>(id) {
            character.tile = SPAWN_CORNERS[usize::from(owner - 1) % SPAWN_CORNERS.len()];
            info!(owner, tile = ?character.tile, "Character spawned");
        }
    }
}

fn place_requested_bombs(game: &mut Game) {
    let mut requests = Vec::new();
    for id in game.objects_of::<BCharacter>() {
        if let Some(character) = game.object_mut::<BCharacter>(id) {
            let owner = character.net().network_owner_id();
            requests.extend(character.take_requested_bombs().into_iter().map(|tile| (owner, tile)));
        }
    }
    for (owner, tile) in requests {
        let occupied = game
            .objects_of::<BBomb>()
            .into_iter()
            .any(|id| game.object::<BBomb>(id).is_some_and(|bomb| bomb.tile == tile));
        if occupied {
            continue;
        }
        let Some(id) = game.spawn_by_name(BBomb::CLASS_NAME, 0) else {
            continue;
        };
        if let Some(bomb) = game.object_mut::<BBomb>(id) {
            bomb.tile = tile;
            bomb.placed_by = owner;
        }
        debug!(owner, ?tile, "Bomb placed");
    }
}

fn clear_spent_bombs(game: &mut Game) {
    let spent: Vec<ObjectId> = game
        .objects_of::<BBomb>()
        .into_iter()
        .filter(|id| game.object::<BBomb>(*id).is_some_and(BBomb::is_detonated))
        .collect();
    for id in spent {
        game.destroy(id);
    }
}

fn detonate_bombs(game: &mut Game) {
    let mut blasts = Vec::new();
    for id in game.objects_of::<BBomb>() {
        if let Some(bomb) = game.object_mut::<BBomb>(id) {
            if bomb.fuse <= 0.0 && !bomb.detonated {
                bomb.call_rpc("Explode", (bomb.tile,));
                blasts.push((bomb.placed_by, bomb.blast_tiles()));
            }
        }
    }
    for (owner, tiles) in blasts {
        let hit: Vec<ObjectId> = game
            .objects_of::<BCrate>()
            .into_iter()
            .filter(|id| game.object::<BCrate>(*id).is_some_and(|c| tiles.contains(&c.tile)))
            .collect();
        let points = hit.len() as i32;
        for id in hit {
            game.destroy(id);
        }
        if points == 0 {
            continue;
        }
        let controller = game
            .objects_of::<BPlayerController>()
            .into_iter()
            .find(|id| game.get(*id).is_some_and(|pc| pc.net().network_owner_id() == owner));
        if let Some(pc) = controller.and_then(|id| game.object_mut::<BPlayerController>(id)) {
            pc.award(points);
            info!(owner, points, score = pc.score, "Crates destroyed");
        }
    }
}
