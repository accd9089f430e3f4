//! Class registry: stable numeric ids mapped to factories.
//!
//! The registry is filled once at startup, identically on host and clients,
//! and then shared read-only. Ids are handed out from a single counter so a
//! class id on the wire names exactly one class across the object, actor and
//! level maps.

use crate::level::Level;
use crate::net_object::NetObject;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Constructor for objects and actors.
pub type ObjectFactory = fn() -> Box<dyn NetObject>;

/// Constructor for levels.
pub type LevelFactory = fn() -> Box<dyn Level>;

/// Which map a class lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Plain replicated object kept in the game's active list.
    Object,
    /// Object placed in the current level.
    Actor,
    /// Level.
    Level,
}

#[derive(Clone, Copy)]
enum Factory {
    Object(ObjectFactory),
    Level(LevelFactory),
}

/// Immutable class descriptor.
#[derive(Clone)]
pub struct ClassInfo {
    id: u16,
    name: &'static str,
    kind: ClassKind,
    parent: Option<Arc<ClassInfo>>,
    factory: Factory,
}

impl ClassInfo {
    /// Stable id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Registered name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Map the class is registered in.
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Parent class, if any.
    pub fn parent(&self) -> Option<&ClassInfo> {
        self.parent.as_deref()
    }

    /// Whether `other` appears in this class's parent chain.
    pub fn is_child_of(&self, other: &ClassInfo, true_if_identical: bool) -> bool {
        if self.id == other.id {
            return true_if_identical;
        }
        let mut current = self.parent();
        while let Some(class) = current {
            if class.id == other.id {
                return true;
            }
            current = class.parent();
        }
        false
    }

    /// Construct a fresh object or actor of this class.
    pub fn instantiate(&self) -> Option<Box<dyn NetObject>> {
        match self.factory {
            Factory::Object(factory) => {
                let mut object = factory();
                object.net_mut().set_class_id(self.id);
                Some(object)
            }
            Factory::Level(_) => None,
        }
    }

    /// Construct a fresh level of this class.
    pub fn instantiate_level(&self) -> Option<Box<dyn Level>> {
        match self.factory {
            Factory::Level(factory) => Some(factory()),
            Factory::Object(_) => None,
        }
    }
}

impl std::fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parent", &self.parent.as_ref().map(|parent| parent.name))
            .finish()
    }
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A class with this name already exists.
    #[error("class '{0}' is already registered")]
    Duplicate(&'static str),
    /// The named parent was never registered.
    #[error("parent class '{0}' is not registered")]
    UnknownParent(&'static str),
    /// All ids are in use.
    #[error("class id space exhausted")]
    Exhausted,
}

/// Catalog of every class a game can put on the wire.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    next_id: u16,
    objects: BTreeMap<u16, Arc<ClassInfo>>,
    actors: BTreeMap<u16, Arc<ClassInfo>>,
    levels: BTreeMap<u16, Arc<ClassInfo>>,
    by_name: HashMap<&'static str, Arc<ClassInfo>>,
}

impl ClassRegistry {
    /// Empty registry; the first id handed out is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain replicated object class.
    pub fn register_object(
        &mut self,
        name: &'static str,
        parent: Option<&'static str>,
        factory: ObjectFactory,
    ) -> Result<u16, RegistryError> {
        self.register(name, parent, ClassKind::Object, Factory::Object(factory))
    }

    /// Register an actor class.
    pub fn register_actor(
        &mut self,
        name: &'static str,
        parent: Option<&'static str>,
        factory: ObjectFactory,
    ) -> Result<u16, RegistryError> {
        self.register(name, parent, ClassKind::Actor, Factory::Object(factory))
    }

    /// Register a level class.
    pub fn register_level(
        &mut self,
        name: &'static str,
        factory: LevelFactory,
    ) -> Result<u16, RegistryError> {
        self.register(name, None, ClassKind::Level, Factory::Level(factory))
    }

    fn register(
        &mut self,
        name: &'static str,
        parent: Option<&'static str>,
        kind: ClassKind,
        factory: Factory,
    ) -> Result<u16, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::Duplicate(name));
        }
        let parent = match parent {
            Some(parent) => Some(
                self.by_name
                    .get(parent)
                    .cloned()
                    .ok_or(RegistryError::UnknownParent(parent))?,
            ),
            None => None,
        };
        let id = self.next_id.checked_add(1).ok_or(RegistryError::Exhausted)?;
        self.next_id = id;

        let info = Arc::new(ClassInfo {
            id,
            name,
            kind,
            parent,
            factory,
        });
        let map = match kind {
            ClassKind::Object => &mut self.objects,
            ClassKind::Actor => &mut self.actors,
            ClassKind::Level => &mut self.levels,
        };
        map.insert(id, info.clone());
        self.by_name.insert(name, info);
        Ok(id)
    }

    /// Object class with `id`.
    pub fn object_class(&self, id: u16) -> Option<&ClassInfo> {
        self.objects.get(&id).map(Arc::as_ref)
    }

    /// Actor class with `id`.
    pub fn actor_class(&self, id: u16) -> Option<&ClassInfo> {
        self.actors.get(&id).map(Arc::as_ref)
    }

    /// Level class with `id`.
    pub fn level_class(&self, id: u16) -> Option<&ClassInfo> {
        self.levels.get(&id).map(Arc::as_ref)
    }

    /// Class with `id` in any map.
    pub fn class(&self, id: u16) -> Option<&ClassInfo> {
        self.object_class(id)
            .or_else(|| self.actor_class(id))
            .or_else(|| self.level_class(id))
    }

    /// Class registered as `name`.
    pub fn by_name(&self, name: &str) -> Option<&ClassInfo> {
        self.by_name.get(name).map(Arc::as_ref)
    }

    /// Number of registered classes across all maps.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerController;

    fn controller() -> Box<dyn NetObject> {
        Box::new(PlayerController::default())
    }

    #[test]
    fn ids_are_unique_across_maps() {
        let mut registry = ClassRegistry::new();
        let a = registry.register_object("A", None, controller).unwrap();
        let b = registry.register_actor("B", None, controller).unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(registry.object_class(b).is_none());
        assert_eq!(registry.class(b).map(ClassInfo::name), Some("B"));
    }

    #[test]
    fn lookups_miss_quietly() {
        let registry = ClassRegistry::new();
        assert!(registry.class(9).is_none());
        assert!(registry.by_name("Nope").is_none());
    }

    #[test]
    fn parent_chain_is_walked() {
        let mut registry = ClassRegistry::new();
        registry.register_object("Base", None, controller).unwrap();
        registry.register_object("Mid", Some("Base"), controller).unwrap();
        registry.register_object("Leaf", Some("Mid"), controller).unwrap();

        let base = registry.by_name("Base").unwrap();
        let leaf = registry.by_name("Leaf").unwrap();
        assert!(leaf.is_child_of(base, false));
        assert!(!base.is_child_of(leaf, true));
        assert!(leaf.is_child_of(leaf, true));
        assert!(!leaf.is_child_of(leaf, false));
    }

    #[test]
    fn registration_errors() {
        let mut registry = ClassRegistry::new();
        registry.register_object("A", None, controller).unwrap();
        assert_eq!(
            registry.register_object("A", None, controller),
            Err(RegistryError::Duplicate("A"))
        );
        assert_eq!(
            registry.register_actor("B", Some("Missing"), controller),
            Err(RegistryError::UnknownParent("Missing"))
        );
    }

    #[test]
    fn instantiation_stamps_the_class_id() {
        let mut registry = ClassRegistry::new();
        let id = registry.register_object("PC", None, controller).unwrap();
        let object = registry.class(id).and_then(ClassInfo::instantiate).unwrap();
        assert_eq!(object.net().class_id(), id);
        assert!(registry.class(id).and_then(ClassInfo::instantiate_level).is_none());
    }
}
