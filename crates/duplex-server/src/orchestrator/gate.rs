//! Two-stage chat sink: a bounded buffer until the toolcall gate opens, a
//! pass-through afterwards.

use std::collections::VecDeque;

/// Holds chat tokens back until the toolcall frame has been emitted.
#[derive(Debug)]
pub struct ChatGate {
    open: bool,
    buffer: VecDeque<String>,
    buffered_chars: usize,
    max_chars: usize,
    prebuffered: u32,
}

impl ChatGate {
    /// A closed gate buffering up to `max_chars` characters.
    pub fn closed(max_chars: usize) -> Self {
        Self {
            open: false,
            buffer: VecDeque::new(),
            buffered_chars: 0,
            max_chars,
            prebuffered: 0,
        }
    }

    /// A gate that is already open (sequential mode).
    pub fn opened() -> Self {
        Self {
            open: true,
            ..Self::closed(0)
        }
    }

    /// Whether tokens pass straight through.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether the buffer is full; the caller stops pulling chat tokens
    /// until the gate opens.
    pub fn is_saturated(&self) -> bool {
        !self.open && self.buffered_chars >= self.max_chars
    }

    /// Offer a token. Returns it back when the gate is open, otherwise keeps it.
    pub fn push(&mut self, text: String) -> Option<String> {
        if self.open {
            return Some(text);
        }
        self.buffered_chars += text.chars().count();
        self.prebuffered += 1;
        self.buffer.push_back(text);
        None
    }

    /// Open the gate and hand back everything buffered, oldest first.
    pub fn open(&mut self) -> Vec<String> {
        self.open = true;
        self.buffered_chars = 0;
        self.buffer.drain(..).collect()
    }

    /// Tokens that were held back before the gate opened.
    pub fn prebuffered_tokens(&self) -> u32 {
        self.prebuffered
    }
}
