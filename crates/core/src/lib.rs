#![warn(missing_docs)]
//! Replication core shared by the host, the client and game code.
//!
//! The crate holds the serialization fabric (byte buffer and codecs), the
//! class registry, the per-object replication model (roles, RPC and sync-var
//! tables) and the game/level object graph that sessions replicate.

pub mod buffer;
pub mod class;
pub mod codec;
pub mod game;
pub mod level;
pub mod lookup;
pub mod net_object;
pub mod player;
pub mod rpc;
pub mod table;
pub mod version;

pub use buffer::ByteBuffer;
pub use class::{ClassInfo, ClassKind, ClassRegistry, LevelFactory, ObjectFactory, RegistryError};
pub use codec::{
    decode_from_slice, encode_to_vec, CodecError, Decode, DecodeContext, Encode, STR_MAX_ENCODE_LEN,
};
pub use game::{Game, NetJournal, GAME_RPC_SWITCH_LEVEL};
pub use level::{EmptyLevel, Level};
pub use lookup::{NetLookup, NetRef, ObjectId};
pub use net_object::{NetMode, NetObject, NetObjectExt, NetRole, NetState};
pub use player::{ChatLine, PlayerController, MAX_DISPLAY_NAME_LEN};
pub use rpc::{
    CallOutcome, CallingMode, QueuedRpc, RpcError, RpcInfo, RpcRequest, RpcTarget, SocketClass,
    MAX_PARAMS_LEN,
};
pub use table::{NetTable, NetTableBuilder, ReplicationTable, SyncMode, SyncVarInfo, SyncVarUpdate};
pub use version::{Version, ENGINE_VERSION};
