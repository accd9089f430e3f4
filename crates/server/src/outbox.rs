//! Per-client message batching for one replication pass.

use bomberboy_core::{encode_to_vec, SocketClass};
use bomberboy_net::{FrameBuilder, NetIdentity, NetMessage, MAX_FRAME_PAYLOAD};

struct Recipient {
    identity: NetIdentity,
    player_id: u16,
    reliable: FrameBuilder,
    unreliable: Vec<Vec<u8>>,
}

/// Frames ready for one client.
pub(crate) struct ClientFrames {
    pub identity: NetIdentity,
    pub reliable: Vec<Vec<u8>>,
    pub unreliable: Vec<Vec<u8>>,
}

/// Collects messages per recipient. Reliable messages are packed into
/// stream frames; every unreliable message becomes its own datagram.
pub(crate) struct Outbox {
    recipients: Vec<Recipient>,
}

impl Outbox {
    pub fn new(recipients: impl IntoIterator<Item = (NetIdentity, u16)>) -> Self {
        Self {
            recipients: recipients
                .into_iter()
                .map(|(identity, player_id)| Recipient {
                    identity,
                    player_id,
                    reliable: FrameBuilder::new(MAX_FRAME_PAYLOAD),
                    unreliable: Vec::new(),
                })
                .collect(),
        }
    }

    /// Queue `message` for every recipient.
    pub fn broadcast(&mut self, socket: SocketClass, message: &NetMessage) {
        if self.recipients.is_empty() {
            return;
        }
        let datagram = (socket == SocketClass::Unreliable).then(|| encode_to_vec(message));
        for recipient in &mut self.recipients {
            match &datagram {
                Some(bytes) => recipient.unreliable.push(bytes.clone()),
                None => recipient.reliable.push(message),
            }
        }
    }

    /// Queue `message` for the client playing as `player_id`. Returns
    /// `false` when no such client is connected.
    pub fn send_to_player(&mut self, player_id: u16, socket: SocketClass, message: &NetMessage) -> bool {
        let Some(recipient) = self
            .recipients
            .iter_mut()
            .find(|recipient| recipient.player_id == player_id)
        else {
            return false;
        };
        match socket {
            SocketClass::Reliable => recipient.reliable.push(message),
            SocketClass::Unreliable => recipient.unreliable.push(encode_to_vec(message)),
        }
        true
    }

    pub fn into_frames(self) -> Vec<ClientFrames> {
        self.recipients
            .into_iter()
            .map(|recipient| ClientFrames {
                identity: recipient.identity,
                reliable: recipient.reliable.finish(),
                unreliable: recipient.unreliable,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bomberboy_net::decode_messages;
    use std::net::{IpAddr, Ipv4Addr};

    fn identity(port: u16) -> NetIdentity {
        NetIdentity::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn broadcast_reaches_every_recipient_once() {
        let mut outbox = Outbox::new([(identity(1), 1), (identity(2), 2), (identity(3), 3)]);
        outbox.broadcast(SocketClass::Reliable, &NetMessage::destroy(5));
        outbox.broadcast(SocketClass::Reliable, &NetMessage::destroy(6));

        let frames = outbox.into_frames();
        assert_eq!(frames.len(), 3);
        for client in frames {
            assert_eq!(client.reliable.len(), 1);
            let messages = decode_messages(&client.reliable[0]).unwrap();
            assert_eq!(messages, vec![NetMessage::destroy(5), NetMessage::destroy(6)]);
        }
    }

    #[test]
    fn targeted_message_skips_other_players() {
        let mut outbox = Outbox::new([(identity(1), 1), (identity(2), 2)]);
        assert!(outbox.send_to_player(2, SocketClass::Unreliable, &NetMessage::destroy(9)));
        assert!(!outbox.send_to_player(7, SocketClass::Reliable, &NetMessage::destroy(9)));

        let frames = outbox.into_frames();
        assert!(frames[0].unreliable.is_empty());
        assert_eq!(frames[1].unreliable.len(), 1);
        assert!(frames[1].reliable.is_empty());
    }

    #[test]
    fn unreliable_messages_are_one_per_datagram() {
        let mut outbox = Outbox::new([(identity(1), 1)]);
        outbox.broadcast(SocketClass::Unreliable, &NetMessage::destroy(1));
        outbox.broadcast(SocketClass::Unreliable, &NetMessage::destroy(2));
        let frames = outbox.into_frames();
        assert_eq!(frames[0].unreliable.len(), 2);
        assert_eq!(decode_messages(&frames[0].unreliable[1]).unwrap(), vec![NetMessage::destroy(2)]);
    }
}
