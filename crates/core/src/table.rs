//! Per-class RPC and sync-var tables.
//!
//! A table is built once per concrete type (usually inside a `OnceLock`) and
//! maps dense ordinals to type-erased thunks. Inherited tables contribute
//! their entries first, so a parent's ordinals stay valid in every subclass.

use crate::buffer::ByteBuffer;
use crate::codec::{CodecError, Decode, DecodeContext, Encode};
use crate::net_object::NetObject;
use crate::rpc::{CallingMode, RpcError, RpcInfo, SocketClass, MAX_PARAMS_LEN};
use std::any::{type_name, Any};
use tracing::{error, warn};

/// When a sync-var is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only when the value differs from the last snapshot.
    OnChange,
    /// Every update tick.
    Always,
}

/// Static description of a registered sync-var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncVarInfo {
    /// Dense declaration ordinal, parents first.
    pub index: u16,
    /// Registered name.
    pub name: &'static str,
    /// Transport.
    pub socket: SocketClass,
    /// Send policy.
    pub mode: SyncMode,
    /// Rust type of the value.
    pub value_type: &'static str,
}

/// A sync-var value due for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncVarUpdate {
    /// Variable ordinal.
    pub index: u16,
    /// Transport.
    pub socket: SocketClass,
    /// Send policy.
    pub mode: SyncMode,
    /// Encoded value in wire order.
    pub value: Vec<u8>,
}

type RpcThunk<T> =
    Box<dyn Fn(&mut T, &mut ByteBuffer, &DecodeContext<'_>) -> Result<(), CodecError> + Send + Sync>;
type EncodeThunk<T> = Box<dyn Fn(&T, &mut ByteBuffer) + Send + Sync>;
type CallbackThunk<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct RpcEntry<T> {
    name: &'static str,
    socket: SocketClass,
    mode: CallingMode,
    invoke: RpcThunk<T>,
}

struct SyncVarEntry<T> {
    name: &'static str,
    socket: SocketClass,
    mode: SyncMode,
    value_type: &'static str,
    encode: EncodeThunk<T>,
    assign: RpcThunk<T>,
    on_change: Option<CallbackThunk<T>>,
}

/// RPC and sync-var registrations of one concrete type.
pub struct NetTable<T> {
    rpcs: Vec<RpcEntry<T>>,
    vars: Vec<SyncVarEntry<T>>,
}

impl<T: NetObject> NetTable<T> {
    /// Start building a table.
    pub fn builder() -> NetTableBuilder<T> {
        NetTableBuilder {
            table: NetTable {
                rpcs: Vec::new(),
                vars: Vec::new(),
            },
        }
    }

    /// Registered RPC names in ordinal order.
    pub fn rpc_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rpcs.iter().map(|entry| entry.name)
    }

    fn downcast<'a>(&self, object: &'a mut dyn Any) -> Result<&'a mut T, RpcError> {
        object.downcast_mut::<T>().ok_or(RpcError::TypeMismatch {
            expected: type_name::<T>(),
        })
    }
}

/// Builder for [`NetTable`].
pub struct NetTableBuilder<T> {
    table: NetTable<T>,
}

impl<T: NetObject> NetTableBuilder<T> {
    /// Copy a parent's registrations; must come before any own entry.
    pub fn inherit<P: NetObject>(
        mut self,
        parent: &'static NetTable<P>,
        project: fn(&T) -> &P,
        project_mut: fn(&mut T) -> &mut P,
    ) -> Self {
        debug_assert!(
            self.table.rpcs.is_empty() && self.table.vars.is_empty(),
            "inherit must precede own registrations"
        );
        for entry in &parent.rpcs {
            self.table.rpcs.push(RpcEntry {
                name: entry.name,
                socket: entry.socket,
                mode: entry.mode,
                invoke: Box::new(
                    move |object: &mut T, params: &mut ByteBuffer, cx: &DecodeContext<'_>| {
                        (entry.invoke)(project_mut(object), params, cx)
                    },
                ),
            });
        }
        for entry in &parent.vars {
            self.table.vars.push(SyncVarEntry {
                name: entry.name,
                socket: entry.socket,
                mode: entry.mode,
                value_type: entry.value_type,
                encode: Box::new(move |object: &T, buffer: &mut ByteBuffer| {
                    (entry.encode)(project(object), buffer)
                }),
                assign: Box::new(
                    move |object: &mut T, value: &mut ByteBuffer, cx: &DecodeContext<'_>| {
                        (entry.assign)(project_mut(object), value, cx)
                    },
                ),
                on_change: entry.on_change.as_ref().map(|callback| {
                    Box::new(move |object: &mut T| callback(project_mut(object)))
                        as CallbackThunk<T>
                }),
            });
        }
        self
    }

    /// Register an RPC taking the argument tuple `A`.
    pub fn rpc<A, F>(
        mut self,
        name: &'static str,
        socket: SocketClass,
        mode: CallingMode,
        handler: F,
    ) -> Self
    where
        A: Decode + 'static,
        F: Fn(&mut T, A) + Send + Sync + 'static,
    {
        if self.table.rpcs.iter().any(|entry| entry.name == name) {
            warn!(rpc = name, "RPC registered twice; the first entry wins");
        }
        self.table.rpcs.push(RpcEntry {
            name,
            socket,
            mode,
            invoke: Box::new(
                move |object: &mut T, params: &mut ByteBuffer, cx: &DecodeContext<'_>| {
                    let args = A::decode(params, cx)?;
                    handler(object, args);
                    Ok(())
                },
            ),
        });
        self
    }

    /// Register a sync-var read and written through `get`/`get_mut`.
    pub fn sync_var<V>(
        mut self,
        name: &'static str,
        socket: SocketClass,
        mode: SyncMode,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self
    where
        V: Encode + Decode + 'static,
    {
        self.table.vars.push(SyncVarEntry {
            name,
            socket,
            mode,
            value_type: type_name::<V>(),
            encode: Box::new(move |object: &T, buffer: &mut ByteBuffer| {
                get(object).encode(buffer)
            }),
            assign: Box::new(
                move |object: &mut T, value: &mut ByteBuffer, cx: &DecodeContext<'_>| {
                    *get_mut(object) = V::decode(value, cx)?;
                    Ok(())
                },
            ),
            on_change: None,
        });
        self
    }

    /// Attach a change callback to the most recently registered sync-var.
    pub fn on_change(mut self, callback: fn(&mut T)) -> Self {
        match self.table.vars.last_mut() {
            Some(entry) => entry.on_change = Some(Box::new(callback)),
            None => warn!("on_change called before any sync_var"),
        }
        self
    }

    /// Finish the table.
    pub fn build(self) -> NetTable<T> {
        self.table
    }
}

/// Type-erased view of a [`NetTable`] used by sessions and the game.
pub trait ReplicationTable: Send + Sync {
    /// Descriptor of the RPC registered as `name`.
    fn rpc_info(&self, name: &str) -> Option<RpcInfo>;

    /// Descriptor of the RPC at `index`.
    fn rpc_info_at(&self, index: u16) -> Option<RpcInfo>;

    /// Name of the RPC at `index`.
    fn rpc_name(&self, index: u16) -> Option<&'static str>;

    /// Number of registered sync-vars.
    fn sync_var_count(&self) -> usize;

    /// Description of the sync-var at `index`.
    fn sync_var_info(&self, index: u16) -> Option<SyncVarInfo>;

    /// Decode the arguments of RPC `index` from `params` and invoke it.
    /// Nothing is invoked when decoding fails.
    fn execute_rpc(
        &self,
        object: &mut dyn Any,
        index: u16,
        params: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError>;

    /// Decode and assign sync-var `index`.
    fn execute_sync_var(
        &self,
        object: &mut dyn Any,
        index: u16,
        value: &mut ByteBuffer,
        skip_callbacks: bool,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError>;

    /// Append every sync-var's current value without touching snapshots.
    fn snapshot_sync_vars(&self, object: &dyn Any, out: &mut Vec<SyncVarUpdate>);

    /// Append sync-vars due for sending and refresh their snapshots.
    fn collect_sync_vars(
        &self,
        object: &mut dyn Any,
        socket: Option<SocketClass>,
        force: bool,
        out: &mut Vec<SyncVarUpdate>,
    );
}

impl<T: NetObject> ReplicationTable for NetTable<T> {
    fn rpc_info(&self, name: &str) -> Option<RpcInfo> {
        let index = self.rpcs.iter().position(|entry| entry.name == name)?;
        self.rpc_info_at(index as u16)
    }

    fn rpc_info_at(&self, index: u16) -> Option<RpcInfo> {
        self.rpcs.get(index as usize).map(|entry| RpcInfo {
            index,
            mode: entry.mode,
            socket: entry.socket,
        })
    }

    fn rpc_name(&self, index: u16) -> Option<&'static str> {
        self.rpcs.get(index as usize).map(|entry| entry.name)
    }

    fn sync_var_count(&self) -> usize {
        self.vars.len()
    }

    fn sync_var_info(&self, index: u16) -> Option<SyncVarInfo> {
        self.vars.get(index as usize).map(|entry| SyncVarInfo {
            index,
            name: entry.name,
            socket: entry.socket,
            mode: entry.mode,
            value_type: entry.value_type,
        })
    }

    fn execute_rpc(
        &self,
        object: &mut dyn Any,
        index: u16,
        params: &mut ByteBuffer,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError> {
        let entry = self
            .rpcs
            .get(index as usize)
            .ok_or(RpcError::UnknownIndex(index))?;
        let object = self.downcast(object)?;
        (entry.invoke)(object, params, cx)?;
        Ok(())
    }

    fn execute_sync_var(
        &self,
        object: &mut dyn Any,
        index: u16,
        value: &mut ByteBuffer,
        skip_callbacks: bool,
        cx: &DecodeContext<'_>,
    ) -> Result<(), RpcError> {
        let entry = self
            .vars
            .get(index as usize)
            .ok_or(RpcError::UnknownIndex(index))?;
        let object = self.downcast(object)?;
        (entry.assign)(object, value, cx)?;

        let mut snapshot = ByteBuffer::new();
        (entry.encode)(object, &mut snapshot);
        object.net_mut().store_snapshot(index, snapshot.into_inner());

        if !skip_callbacks {
            if let Some(callback) = &entry.on_change {
                callback(object);
            }
        }
        Ok(())
    }

    fn snapshot_sync_vars(&self, object: &dyn Any, out: &mut Vec<SyncVarUpdate>) {
        let Some(object) = object.downcast_ref::<T>() else {
            return;
        };
        for (index, entry) in self.vars.iter().enumerate() {
            let mut buffer = ByteBuffer::new();
            (entry.encode)(object, &mut buffer);
            if buffer.len() > MAX_PARAMS_LEN {
                continue;
            }
            out.push(SyncVarUpdate {
                index: index as u16,
                socket: entry.socket,
                mode: entry.mode,
                value: buffer.into_inner(),
            });
        }
    }

    fn collect_sync_vars(
        &self,
        object: &mut dyn Any,
        socket: Option<SocketClass>,
        force: bool,
        out: &mut Vec<SyncVarUpdate>,
    ) {
        let Ok(object) = self.downcast(object) else {
            return;
        };
        for (index, entry) in self.vars.iter().enumerate() {
            if socket.is_some_and(|socket| socket != entry.socket) {
                continue;
            }
            let index = index as u16;
            let mut buffer = ByteBuffer::new();
            (entry.encode)(object, &mut buffer);
            let value = buffer.into_inner();

            let changed = object.net().snapshot(index) != Some(value.as_slice());
            if value.len() > MAX_PARAMS_LEN {
                if changed {
                    error!(var = entry.name, len = value.len(), "Sync-var value too large to send");
                    object.net_mut().store_snapshot(index, value);
                }
                continue;
            }
            if force || entry.mode == SyncMode::Always || changed {
                out.push(SyncVarUpdate {
                    index,
                    socket: entry.socket,
                    mode: entry.mode,
                    value: value.clone(),
                });
            }
            if changed {
                object.net_mut().store_snapshot(index, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_vec;
    use crate::net_object::{NetObjectExt, NetState};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Base {
        net: NetState,
        name: String,
        greeted: u32,
    }

    impl Base {
        fn table() -> &'static NetTable<Self> {
            static TABLE: OnceLock<NetTable<Base>> = OnceLock::new();
            TABLE.get_or_init(|| {
                NetTable::builder()
                    .rpc("Greet", SocketClass::Reliable, CallingMode::Host, |b: &mut Base, (): ()| {
                        b.greeted += 1
                    })
                    .sync_var("Name", SocketClass::Reliable, SyncMode::OnChange, |b: &Base| &b.name, |b: &mut Base| &mut b.name)
                    .build()
            })
        }
    }

    impl NetObject for Base {
        fn net(&self) -> &NetState {
            &self.net
        }

        fn net_mut(&mut self) -> &mut NetState {
            &mut self.net
        }

        fn net_table(&self) -> &'static dyn ReplicationTable {
            Self::table()
        }

        crate::net_object_any!();
    }

    #[derive(Default)]
    struct Derived {
        base: Base,
        jumps: Vec<u8>,
        level: u8,
    }

    impl Derived {
        fn table() -> &'static NetTable<Self> {
            static TABLE: OnceLock<NetTable<Derived>> = OnceLock::new();
            TABLE.get_or_init(|| {
                NetTable::builder()
                    .inherit(Base::table(), |d: &Derived| &d.base, |d: &mut Derived| &mut d.base)
                    .rpc("Jump", SocketClass::Unreliable, CallingMode::Broadcast, |d: &mut Derived, (h,): (u8,)| {
                        d.jumps.push(h)
                    })
                    .sync_var("Level", SocketClass::Reliable, SyncMode::OnChange, |d: &Derived| &d.level, |d: &mut Derived| &mut d.level)
                    .build()
            })
        }
    }

    impl NetObject for Derived {
        fn net(&self) -> &NetState {
            self.base.net()
        }

        fn net_mut(&mut self) -> &mut NetState {
            self.base.net_mut()
        }

        fn net_table(&self) -> &'static dyn ReplicationTable {
            Self::table()
        }

        crate::net_object_any!();
    }

    #[test]
    fn parent_entries_come_first() {
        let table = Derived::table();
        assert_eq!(table.rpc_names().collect::<Vec<_>>(), vec!["Greet", "Jump"]);
        assert_eq!(table.rpc_info("Jump").map(|info| info.index), Some(1));
        assert_eq!(table.sync_var_info(0).map(|info| info.name), Some("Name"));
        assert_eq!(table.sync_var_info(1).map(|info| info.value_type), Some("u8"));
    }

    #[test]
    fn inherited_rpc_reaches_the_parent() {
        let mut derived = Derived::default();
        derived.execute_rpc(0, &mut ByteBuffer::new(), &DecodeContext::detached()).unwrap();
        assert_eq!(derived.base.greeted, 1);

        let mut params = ByteBuffer::from_wire(&[7]);
        derived.execute_rpc(1, &mut params, &DecodeContext::detached()).unwrap();
        assert_eq!(derived.jumps, vec![7]);
    }

    #[test]
    fn inherited_sync_var_is_collected_with_parent_index() {
        let mut derived = Derived::default();
        derived.collect_sync_vars(None, false);
        derived.base.name = "bob".into();
        let updates = derived.collect_sync_vars(None, false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].index, 0);
        assert_eq!(updates[0].value, encode_to_vec("bob"));
    }

    #[test]
    fn table_rejects_foreign_objects() {
        let mut base = Base::default();
        let result = Derived::table().execute_rpc(
            base.as_any_mut(),
            0,
            &mut ByteBuffer::new(),
            &DecodeContext::detached(),
        );
        assert!(matches!(result, Err(RpcError::TypeMismatch { .. })));
    }

    #[test]
    fn snapshot_leaves_change_tracking_alone() {
        let mut derived = Derived::default();
        derived.collect_sync_vars(None, false);
        derived.level = 4;
        let snapshot = derived.sync_var_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].value, vec![4]);

        let updates = derived.collect_sync_vars(None, false);
        assert_eq!(updates.iter().map(|u| u.index).collect::<Vec<_>>(), vec![1]);
    }

    #[derive(Default)]
    struct Recorder {
        net: NetState,
        samples: Vec<u8>,
    }

    impl NetObject for Recorder {
        fn net(&self) -> &NetState {
            &self.net
        }

        fn net_mut(&mut self) -> &mut NetState {
            &mut self.net
        }

        fn net_table(&self) -> &'static dyn ReplicationTable {
            static TABLE: OnceLock<NetTable<Recorder>> = OnceLock::new();
            TABLE.get_or_init(|| {
                NetTable::builder()
                    .sync_var("Samples", SocketClass::Reliable, SyncMode::OnChange, |r: &Recorder| &r.samples, |r: &mut Recorder| &mut r.samples)
                    .build()
            })
        }

        crate::net_object_any!();
    }

    #[test]
    fn oversized_sync_values_are_never_sent() {
        let mut recorder = Recorder::default();
        recorder.collect_sync_vars(None, false);

        recorder.samples = vec![1; MAX_PARAMS_LEN];
        assert!(recorder.collect_sync_vars(None, false).is_empty());
        assert!(recorder.collect_sync_vars(None, true).is_empty());
        assert!(recorder.sync_var_snapshot().is_empty());

        recorder.samples = vec![1; 16];
        let updates = recorder.collect_sync_vars(None, false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value.len(), 18);
    }
}
