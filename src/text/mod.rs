//! The reference "text" note plugin.
//!
//! Session content is a sequence of utf-8 codepoints tagged per-position
//! with the author's account id. The stored form and the synchronization
//! chunks are both the segment-run representation of the buffer.

pub mod chunk;
pub mod ops;

use std::any::Any;

use serde_json::Value;

use crate::ot::{ApplyError, Operation};
use crate::plugin::{NotePlugin, NoteSession, PluginError};

pub use chunk::{Segment, TextChunk};
pub use ops::TextOperation;

/// Session type tag of text notes.
pub const TEXT_TYPE: &str = "text";

// ─── Buffer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    chunk: TextChunk,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunk(chunk: TextChunk) -> Self {
        TextBuffer { chunk }
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    pub fn chunk(&self) -> &TextChunk {
        &self.chunk
    }

    pub fn text(&self) -> String {
        self.chunk.text()
    }

    pub fn insert(&mut self, position: usize, chunk: &TextChunk) -> Result<(), ApplyError> {
        if position > self.len() {
            return Err(ApplyError::InvalidInsert);
        }
        self.chunk.insert(position, chunk);
        Ok(())
    }

    /// Remove `expected` at `position`. The buffer content there must match
    /// the expected chunk exactly, author tags included.
    pub fn erase(&mut self, position: usize, expected: &TextChunk) -> Result<(), ApplyError> {
        let len = expected.len();
        if position + len > self.len() {
            return Err(ApplyError::InconsistentDelete);
        }
        if self.chunk.substr(position, len) != *expected {
            return Err(ApplyError::InconsistentDelete);
        }
        self.chunk.erase(position, len);
        Ok(())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TextNoteSession {
    buffer: TextBuffer,
}

impl TextNoteSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buffer(buffer: TextBuffer) -> Self {
        TextNoteSession { buffer }
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }
}

impl NoteSession for TextNoteSession {
    fn apply_op(&mut self, _author: &str, op: &Value) -> Result<(), PluginError> {
        let op: TextOperation = serde_json::from_value(op.clone())
            .map_err(|e| PluginError::Malformed(e.to_string()))?;
        op.apply(&mut self.buffer)?;
        Ok(())
    }

    fn sync_chunks(&self) -> Vec<Value> {
        self.buffer
            .chunk()
            .segments()
            .iter()
            .map(|seg| serde_json::to_value(seg).expect("segment serializes"))
            .collect()
    }

    fn absorb_chunk(&mut self, chunk: &Value) -> Result<(), PluginError> {
        let seg: Segment = serde_json::from_value(chunk.clone())
            .map_err(|e| PluginError::Malformed(e.to_string()))?;
        let len = self.buffer.len();
        self.buffer
            .insert(len, &TextChunk::from_text(&seg.text, &seg.author))
            .map_err(PluginError::Apply)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─── Plugin ──────────────────────────────────────────────────────────────────

pub struct TextPlugin;

impl NotePlugin for TextPlugin {
    fn session_type(&self) -> &'static str {
        TEXT_TYPE
    }

    fn create_empty(&self) -> Box<dyn NoteSession> {
        Box::new(TextNoteSession::new())
    }

    fn read(&self, bytes: &[u8]) -> Result<Box<dyn NoteSession>, PluginError> {
        let chunk: TextChunk =
            serde_json::from_slice(bytes).map_err(|e| PluginError::Malformed(e.to_string()))?;
        Ok(Box::new(TextNoteSession::from_buffer(TextBuffer::from_chunk(
            chunk,
        ))))
    }

    fn write(&self, session: &dyn NoteSession) -> Result<Vec<u8>, PluginError> {
        let session = session
            .as_any()
            .downcast_ref::<TextNoteSession>()
            .ok_or_else(|| PluginError::Malformed("not a text session".into()))?;
        serde_json::to_vec(session.buffer().chunk())
            .map_err(|e| PluginError::Malformed(e.to_string()))
    }
}
