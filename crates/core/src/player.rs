//! Engine player controller: one per connected player.

use crate::net_object::{NetObject, NetObjectExt, NetState};
use crate::rpc::{CallingMode, SocketClass};
use crate::table::{NetTable, ReplicationTable, SyncMode};
use std::sync::OnceLock;
use tracing::info;

/// Longest display name shown in UI and chat.
pub const MAX_DISPLAY_NAME_LEN: usize = 16;

/// One received chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Display name of the sender.
    pub sender: String,
    /// Message text.
    pub text: String,
}

/// Replicated per-player object created by the host during admission.
///
/// Game-specific controllers embed this type and inherit its table.
#[derive(Debug, Clone)]
pub struct PlayerController {
    net: NetState,
    player_name: String,
    colour_index: u8,
    chat: Vec<ChatLine>,
}

impl Default for PlayerController {
    fn default() -> Self {
        Self {
            net: NetState::synced(),
            player_name: String::new(),
            colour_index: 0,
            chat: Vec::new(),
        }
    }
}

impl PlayerController {
    /// Registered class name.
    pub const CLASS_NAME: &'static str = "PlayerController";

    /// RPC and sync-var table shared by every controller subclass.
    pub fn table() -> &'static NetTable<Self> {
        static TABLE: OnceLock<NetTable<PlayerController>> = OnceLock::new();
        TABLE.get_or_init(|| {
            NetTable::builder()
                .rpc(
                    "SendMessage",
                    SocketClass::Reliable,
                    CallingMode::Host,
                    |pc: &mut PlayerController, (text,): (String,)| pc.relay_message(text),
                )
                .rpc(
                    "BroadcastMessage",
                    SocketClass::Reliable,
                    CallingMode::Broadcast,
                    |pc: &mut PlayerController, (sender, text): (String, String)| {
                        pc.receive_message(sender, text)
                    },
                )
                .sync_var(
                    "PlayerName",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |pc: &PlayerController| &pc.player_name,
                    |pc: &mut PlayerController| &mut pc.player_name,
                )
                .sync_var(
                    "ColourIndex",
                    SocketClass::Reliable,
                    SyncMode::OnChange,
                    |pc: &PlayerController| &pc.colour_index,
                    |pc: &mut PlayerController| &mut pc.colour_index,
                )
                .build()
        })
    }

    /// Full name as sent in the handshake.
    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    /// Set the name; replicated on the next update.
    pub fn set_player_name(&mut self, name: impl Into<String>) {
        self.player_name = name.into();
    }

    /// Name clamped to [`MAX_DISPLAY_NAME_LEN`] characters.
    pub fn display_name(&self) -> String {
        self.player_name.chars().take(MAX_DISPLAY_NAME_LEN).collect()
    }

    /// Colour slot assigned by the game.
    pub fn colour_index(&self) -> u8 {
        self.colour_index
    }

    /// Assign a colour slot; replicated on the next update.
    pub fn set_colour_index(&mut self, index: u8) {
        self.colour_index = index;
    }

    /// Chat lines received so far, oldest first.
    pub fn chat(&self) -> &[ChatLine] {
        &self.chat
    }

    /// Send a chat message through the host to everyone.
    pub fn send_message(&mut self, text: &str) {
        self.call_rpc("SendMessage", (text,));
    }

    fn relay_message(&mut self, text: String) {
        let sender = self.display_name();
        self.call_rpc("BroadcastMessage", (sender, text));
    }

    fn receive_message(&mut self, sender: String, text: String) {
        info!(%sender, %text, "chat");
        self.chat.push(ChatLine { sender, text });
    }
}

impl NetObject for PlayerController {
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

    fn player_controller(&self) -> Option<&PlayerController> {
        Some(self)
    }

    fn player_controller_mut(&mut self) -> Option<&mut PlayerController> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net_object::NetMode;
    use crate::rpc::{CallOutcome, RpcTarget};

    #[test]
    fn display_name_is_clamped() {
        let mut pc = PlayerController::default();
        pc.set_player_name("a-very-long-player-name");
        assert_eq!(pc.display_name(), "a-very-long-play");
        assert_eq!(pc.player_name(), "a-very-long-player-name");
    }

    #[test]
    fn offline_chat_loops_back() {
        let mut pc = PlayerController::default();
        pc.set_player_name("bob");
        pc.send_message("hello");
        assert_eq!(
            pc.chat(),
            &[ChatLine {
                sender: "bob".into(),
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn client_chat_goes_to_the_host() {
        let mut pc = PlayerController::default();
        pc.net_mut().set_network_id(4);
        pc.net_mut().set_network_owner_id(2);
        pc.net_mut().update_role(NetMode::Remote { local_id: 2 });
        assert_eq!(
            pc.call_rpc("SendMessage", ("hi",)),
            CallOutcome::Queued(RpcTarget::Host)
        );
        assert!(pc.chat().is_empty());
    }

    #[test]
    fn host_relay_broadcasts() {
        let mut pc = PlayerController::default();
        pc.set_player_name("carol");
        pc.net_mut().set_network_id(4);
        pc.net_mut().set_network_owner_id(2);
        pc.net_mut().update_role(NetMode::Host);
        pc.send_message("gg");
        assert_eq!(pc.chat().len(), 1);
        let queued = pc.net().queued_rpcs(SocketClass::Reliable);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].target, RpcTarget::AllRemotes);
    }
}
