//! Levels: the container the game's actors live in.

use std::any::Any;

/// A playable level.
///
/// Levels are not replicated themselves; clients learn about level changes
/// through the game's `SwitchLevel` call and rebuild the level locally.
pub trait Level: Any {
    /// Class names of the actors the host spawns when the level starts.
    fn default_actors(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Called after the level becomes current.
    fn on_begin(&mut self) {}

    /// Called before the level is replaced or the game shuts down.
    fn on_destroy(&mut self) {}

    /// Called every game tick before actors tick.
    fn on_tick(&mut self, _delta: f32) {}

    /// Upcast for downcasting to the concrete level.
    fn as_any(&self) -> &dyn Any;
}

/// Level with no default actors.
#[derive(Debug, Default)]
pub struct EmptyLevel;

impl Level for EmptyLevel {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
