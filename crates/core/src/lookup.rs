//! Network id lookup and id-based object references.
//!
//! Replicated objects never hold pointers to each other. They hold a
//! [`NetRef`] (the target's network id) which is resolved through the game's
//! lookup when needed; a reference to a destroyed object resolves to nothing.

use crate::buffer::ByteBuffer;
use crate::codec::{CodecError, Decode, DecodeContext, Encode};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Arena handle for an object owned by the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    /// Raw slot index.
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct LookupEntry {
    object: ObjectId,
    type_id: TypeId,
}

/// Map from session-wide network id to the local object.
#[derive(Debug, Default)]
pub struct NetLookup {
    entries: BTreeMap<u16, LookupEntry>,
}

impl NetLookup {
    /// Empty lookup.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, net_id: u16, object: ObjectId, type_id: TypeId) {
        self.entries.insert(net_id, LookupEntry { object, type_id });
    }

    pub(crate) fn remove(&mut self, net_id: u16) -> Option<ObjectId> {
        self.entries.remove(&net_id).map(|entry| entry.object)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Object registered under `net_id`.
    pub fn get(&self, net_id: u16) -> Option<ObjectId> {
        self.entries.get(&net_id).map(|entry| entry.object)
    }

    /// Whether `net_id` names a live object.
    pub fn contains(&self, net_id: u16) -> bool {
        self.entries.contains_key(&net_id)
    }

    /// Whether `net_id` names a live object of concrete type `T`.
    pub fn is_type<T: 'static>(&self, net_id: u16) -> bool {
        self.entries
            .get(&net_id)
            .is_some_and(|entry| entry.type_id == TypeId::of::<T>())
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered network ids in ascending order.
    pub fn net_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }
}

/// Typed reference to a replicated object, carried as its network id.
pub struct NetRef<T: 'static> {
    net_id: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> NetRef<T> {
    /// Reference to the object with `net_id`.
    pub const fn new(net_id: u16) -> Self {
        Self {
            net_id,
            _marker: PhantomData,
        }
    }

    /// The null reference.
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Referenced network id (0 when null).
    pub fn net_id(&self) -> u16 {
        self.net_id
    }

    /// Whether this is the null reference.
    pub fn is_null(&self) -> bool {
        self.net_id == 0
    }
}

impl<T: 'static> Clone for NetRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for NetRef<T> {}

impl<T: 'static> PartialEq for NetRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.net_id == other.net_id
    }
}

impl<T: 'static> Eq for NetRef<T> {}

impl<T: 'static> Default for NetRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: 'static> fmt::Debug for NetRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetRef({})", self.net_id)
    }
}

impl<T: 'static> Encode for NetRef<T> {
    fn encode(&self, buffer: &mut ByteBuffer) {
        self.net_id.encode(buffer);
    }
}

impl<T: 'static> Decode for NetRef<T> {
    /// Fails when the id names no live object; an object of another type
    /// decodes as the null reference. Without a lookup (local execution) the
    /// id is taken as-is.
    fn decode(buffer: &mut ByteBuffer, cx: &DecodeContext<'_>) -> Result<Self, CodecError> {
        let net_id = u16::decode(buffer, cx)?;
        if net_id == 0 {
            return Ok(Self::null());
        }
        let Some(lookup) = cx.lookup() else {
            return Ok(Self::new(net_id));
        };
        if !lookup.contains(net_id) {
            return Err(CodecError::UnknownObject(net_id));
        }
        if lookup.is_type::<T>(net_id) {
            Ok(Self::new(net_id))
        } else {
            Ok(Self::null())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_vec;

    struct Bomb;
    struct Crate;

    fn lookup_with_bomb() -> NetLookup {
        let mut lookup = NetLookup::new();
        lookup.insert(42, ObjectId(0), TypeId::of::<Bomb>());
        lookup
    }

    fn decode_ref<T: 'static>(lookup: &NetLookup, net_id: u16) -> Result<NetRef<T>, CodecError> {
        let mut buffer = ByteBuffer::from_wire(&encode_to_vec(&net_id));
        NetRef::<T>::decode(&mut buffer, &DecodeContext::with_lookup(lookup))
    }

    #[test]
    fn reference_to_live_object_resolves() {
        let lookup = lookup_with_bomb();
        assert_eq!(decode_ref::<Bomb>(&lookup, 42).unwrap().net_id(), 42);
    }

    #[test]
    fn reference_to_missing_object_fails() {
        let lookup = lookup_with_bomb();
        assert_eq!(
            decode_ref::<Bomb>(&lookup, 7),
            Err(CodecError::UnknownObject(7))
        );
    }

    #[test]
    fn reference_to_other_type_is_null() {
        let lookup = lookup_with_bomb();
        assert!(decode_ref::<Crate>(&lookup, 42).unwrap().is_null());
    }

    #[test]
    fn detached_context_trusts_the_id() {
        let mut buffer = ByteBuffer::from_wire(&encode_to_vec(&9u16));
        let decoded = NetRef::<Bomb>::decode(&mut buffer, &DecodeContext::detached()).unwrap();
        assert_eq!(decoded.net_id(), 9);
    }

    #[test]
    fn null_reference_needs_no_lookup() {
        let mut buffer = ByteBuffer::from_wire(&[0, 0]);
        let decoded = NetRef::<Bomb>::decode(&mut buffer, &DecodeContext::detached()).unwrap();
        assert!(decoded.is_null());
    }
}
