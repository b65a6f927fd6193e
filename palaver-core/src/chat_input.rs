//! Keyboard capture for the player's chat line.
//!
//! Active only while the player is talking. While active every key is
//! consumed so movement and other shortcuts cannot fire during text entry.

use serde::{Deserialize, Serialize};

use crate::types::NpcId;

/// A key press as delivered by the input layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    /// A character key.
    Char(char),
    /// Submit.
    Enter,
    /// Delete the last character.
    Backspace,
    /// Cancel the conversation.
    Escape,
    /// Tab.
    Tab,
    /// Arrow up.
    Up,
    /// Arrow down.
    Down,
    /// Arrow left.
    Left,
    /// Arrow right.
    Right,
    /// Any other key (modifiers, function keys).
    Other,
}

/// What the controller did with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Not captured; global handlers may see it.
    PassThrough,
    /// Captured with no further effect.
    Consumed,
    /// A complete line to send as the player's turn.
    Submit {
        /// Conversation partner.
        npc: NpcId,
        /// The line.
        text: String,
    },
    /// Escape: cancel the conversation.
    Cancel,
}

/// Message buffer bound to the NPC being talked to.
#[derive(Debug, Clone, Default)]
pub struct ChatInputController {
    target: Option<NpcId>,
    buffer: String,
}

impl ChatInputController {
    /// Inactive controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start capturing for `npc` with an empty buffer.
    pub fn activate(&mut self, npc: NpcId) {
        self.target = Some(npc);
        self.buffer.clear();
    }

    /// Stop capturing and drop the buffer.
    pub fn deactivate(&mut self) {
        self.target = None;
        self.buffer.clear();
    }

    /// Whether keys are being captured.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.target.is_some()
    }

    /// NPC the buffer belongs to.
    #[must_use]
    pub fn target(&self) -> Option<&NpcId> {
        self.target.as_ref()
    }

    /// Current buffer contents.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Printable ASCII, space included.
    #[must_use]
    pub fn is_printable(c: char) -> bool {
        matches!(c, '\x20'..='\x7e')
    }

    /// Handle one key press.
    pub fn handle_key(&mut self, key: Key) -> KeyOutcome {
        let Some(npc) = self.target.clone() else {
            return KeyOutcome::PassThrough;
        };
        match key {
            Key::Char(c) if Self::is_printable(c) => {
                self.buffer.push(c);
                KeyOutcome::Consumed
            }
            Key::Enter => {
                let text = std::mem::take(&mut self.buffer);
                if text.trim().is_empty() {
                    KeyOutcome::Consumed
                } else {
                    KeyOutcome::Submit { npc, text }
                }
            }
            Key::Backspace => {
                self.buffer.pop();
                KeyOutcome::Consumed
            }
            Key::Escape => KeyOutcome::Cancel,
            _ => KeyOutcome::Consumed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(ctrl: &mut ChatInputController, s: &str) {
        for c in s.chars() {
            assert_eq!(ctrl.handle_key(Key::Char(c)), KeyOutcome::Consumed);
        }
    }

    #[test]
    fn inactive_passes_everything_through() {
        let mut ctrl = ChatInputController::new();
        assert_eq!(ctrl.handle_key(Key::Char('w')), KeyOutcome::PassThrough);
        assert_eq!(ctrl.handle_key(Key::Escape), KeyOutcome::PassThrough);
    }

    #[test]
    fn enter_submits_and_clears() {
        let mut ctrl = ChatInputController::new();
        ctrl.activate(NpcId::from("n"));
        typed(&mut ctrl, "Hello");
        assert_eq!(
            ctrl.handle_key(Key::Enter),
            KeyOutcome::Submit {
                npc: NpcId::from("n"),
                text: "Hello".into()
            }
        );
        assert_eq!(ctrl.buffer(), "");
    }

    #[test]
    fn blank_buffer_is_not_submitted() {
        let mut ctrl = ChatInputController::new();
        ctrl.activate(NpcId::from("n"));
        typed(&mut ctrl, "   ");
        assert_eq!(ctrl.handle_key(Key::Enter), KeyOutcome::Consumed);
        assert_eq!(ctrl.buffer(), "");
    }

    #[test]
    fn backspace_and_filtering() {
        let mut ctrl = ChatInputController::new();
        ctrl.activate(NpcId::from("n"));
        typed(&mut ctrl, "hi!");
        ctrl.handle_key(Key::Backspace);
        assert_eq!(ctrl.handle_key(Key::Char('é')), KeyOutcome::Consumed);
        assert_eq!(ctrl.handle_key(Key::Char('\t')), KeyOutcome::Consumed);
        assert_eq!(ctrl.handle_key(Key::Up), KeyOutcome::Consumed);
        assert_eq!(ctrl.buffer(), "hi");
        ctrl.handle_key(Key::Backspace);
        ctrl.handle_key(Key::Backspace);
        ctrl.handle_key(Key::Backspace);
        assert_eq!(ctrl.buffer(), "");
    }

    #[test]
    fn escape_requests_cancel() {
        let mut ctrl = ChatInputController::new();
        ctrl.activate(NpcId::from("n"));
        typed(&mut ctrl, "bye");
        assert_eq!(ctrl.handle_key(Key::Escape), KeyOutcome::Cancel);
    }
}
