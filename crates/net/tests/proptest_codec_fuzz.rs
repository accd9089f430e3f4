//! Fuzz-style property tests for the wire protocol
//!
//! These tests validate that frame and message decoders handle arbitrary
//! network input gracefully without crashing.

use bomberboy_core::{decode_from_slice, encode_to_vec, CallingMode, RpcRequest, Version};
use bomberboy_net::{
    decode_datagram, decode_messages, encode_frame, encode_messages, FrameDecoder,
    HandshakeHeader, LayerFlags, MessageBody, NetMessage, RequestType, ServerInfo, SyncEntry,
};
use proptest::prelude::*;

fn sync_entry() -> impl Strategy<Value = SyncEntry> {
    (any::<u16>(), prop::collection::vec(any::<u8>(), 0..32))
        .prop_map(|(index, value)| SyncEntry { index, value })
}

fn message() -> impl Strategy<Value = NetMessage> {
    let rpc = (any::<u16>(), any::<u16>(), any::<u16>(), prop::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(source, target, index, params)| NetMessage {
            source,
            target,
            body: MessageBody::Rpc(RpcRequest {
                index,
                mode: CallingMode::Broadcast,
                params,
            }),
        });
    let sync = (any::<u16>(), sync_entry()).prop_map(|(target, entry)| NetMessage {
        source: 0,
        target,
        body: MessageBody::Sync(entry),
    });
    let spawn = (any::<u16>(), any::<u16>(), any::<u16>(), prop::collection::vec(sync_entry(), 0..4))
        .prop_map(|(class_id, net_id, owner_id, initial)| {
            NetMessage::spawn(class_id, net_id, owner_id, initial)
        });
    let destroy = any::<u16>().prop_map(NetMessage::destroy);
    prop_oneof![rpc, sync, spawn, destroy]
}

proptest! {
    /// Property: Arbitrary bytes don't crash the message decoder
    #[test]
    fn arbitrary_bytes_dont_crash_messages(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = decode_messages(&random_bytes);
        // No panic = success
    }

    /// Property: Arbitrary bytes don't crash the handshake decoders
    #[test]
    fn arbitrary_bytes_dont_crash_handshake(
        random_bytes in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let _header = decode_from_slice::<HandshakeHeader>(&random_bytes);
        let _info = decode_from_slice::<ServerInfo>(&random_bytes);
        let _datagram = decode_datagram(&random_bytes);
    }

    /// Property: Message sequences roundtrip through one payload
    #[test]
    fn message_sequences_roundtrip(messages in prop::collection::vec(message(), 0..16)) {
        let payload = encode_messages(&messages);
        prop_assert_eq!(decode_messages(&payload).unwrap(), messages);
    }

    /// Property: Stream reassembly is independent of chunking
    #[test]
    fn stream_reassembly_ignores_chunking(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8),
        chunk in 1usize..64,
    ) {
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend(encode_frame(payload).unwrap());
        }
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.extend(piece);
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame);
            }
        }
        prop_assert_eq!(frames, payloads);
    }

    /// Property: Handshake headers roundtrip
    #[test]
    fn handshake_roundtrips(
        engine in (any::<u16>(), any::<u16>(), any::<u16>()),
        game in (any::<u16>(), any::<u16>(), any::<u16>()),
        request in prop_oneof![Just(RequestType::Ping), Just(RequestType::Connect), Just(RequestType::Query)],
    ) {
        let header = HandshakeHeader {
            engine_version: Version::new(engine.0, engine.1, engine.2),
            game_version: Version::new(game.0, game.1, game.2),
            request,
        };
        prop_assert_eq!(decode_from_slice::<HandshakeHeader>(&encode_to_vec(&header)).unwrap(), header);
    }

    /// Property: Server info roundtrips
    #[test]
    fn server_info_roundtrips(
        players in any::<u16>(),
        max_players in any::<u16>(),
        name in "[a-zA-Z0-9 ]{0,40}",
        password in any::<bool>(),
    ) {
        let info = ServerInfo {
            players,
            max_players,
            server_name: name,
            flags: if password { LayerFlags::PASSWORD } else { LayerFlags::empty() },
        };
        prop_assert_eq!(decode_from_slice::<ServerInfo>(&encode_to_vec(&info)).unwrap(), info);
    }
}
