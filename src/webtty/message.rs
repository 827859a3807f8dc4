//! Browser terminal frames

use serde::{Deserialize, Serialize};

/// JSON text frame sent by the browser terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalMessage {
    /// Keystrokes, written to stdin as-is
    Input { input: String },
    /// Terminal window size changed
    Resize { rows: u16, cols: u16 },
}

/// Terminal dimensions as the remote-command protocol encodes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

impl TerminalSize {
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            width: cols,
            height: rows,
        }
    }
}

/// Carries partial UTF-8 sequences across output chunks so every text
/// frame is valid UTF-8
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Append `bytes`, returning the longest complete text available.
    /// Invalid sequences are replaced rather than carried.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let tail = self.pending.split_off(e.valid_up_to());
                let head = std::mem::replace(&mut self.pending, tail);
                // valid_up_to guarantees the head is UTF-8
                String::from_utf8(head).unwrap_or_default()
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };
        (!text.is_empty()).then_some(text)
    }

    /// Whatever is left when the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
