//! Note plugin capability interface.
//!
//! A plugin supplies everything the directory does not want to know about a
//! note type: how to create an empty session, how to apply operations, and
//! how to (de)serialize session content for storage and synchronization.
//! The registry is explicit and passed to the directory at construction —
//! there is no process-global plugin table.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::ot::ApplyError;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("malformed session content: {0}")]
    Malformed(String),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Live session content. One of these sits behind every resident session
/// proxy; the directory treats it as opaque apart from this interface.
pub trait NoteSession: Send + Sync {
    /// Apply one wire operation authored by `author`'s account.
    fn apply_op(&mut self, author: &str, op: &Value) -> Result<(), PluginError>;

    /// Serialize the full content as synchronization chunks. A subscriber
    /// joining the session receives exactly these, in order.
    fn sync_chunks(&self) -> Vec<Value>;

    /// Absorb one chunk while this session is being synchronized from a
    /// client (sync-in).
    fn absorb_chunk(&mut self, chunk: &Value) -> Result<(), PluginError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait NotePlugin: Send + Sync {
    /// The type tag notes of this plugin carry in the tree and on the wire.
    fn session_type(&self) -> &'static str;

    fn create_empty(&self) -> Box<dyn NoteSession>;

    /// Deserialize session content from its stored form.
    fn read(&self, bytes: &[u8]) -> Result<Box<dyn NoteSession>, PluginError>;

    /// Serialize session content to its stored form.
    fn write(&self, session: &dyn NoteSession) -> Result<Vec<u8>, PluginError>;
}

/// Plugin table keyed by session type tag.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn NotePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn NotePlugin>) {
        self.plugins.insert(plugin.session_type(), plugin);
    }

    pub fn get(&self, session_type: &str) -> Option<Arc<dyn NotePlugin>> {
        self.plugins.get(session_type).cloned()
    }

    pub fn contains(&self, session_type: &str) -> bool {
        self.plugins.contains_key(session_type)
    }
}
