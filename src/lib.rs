//! Scribe Host — a client/server framework for real-time collaborative
//! editing of a hierarchical directory of notes.
//!
//! The server side keeps the directory tree, the per-node ACLs, the account
//! registry, and the resident sessions; clients hold a read-only mirror and
//! subscribe to sessions through a three-way handshake. See the `directory`
//! module for the server core and `client` for the mirror.

pub mod account;
pub mod acl;
pub mod client;
pub mod config;
pub mod directory;
pub mod ot;
pub mod plugin;
pub mod proto;
pub mod server;
pub mod session;
pub mod storage;
pub mod text;
pub mod tree;
