//! The mirrored directory tree.
//!
//! Strictly follower state: every mutation comes from a server message.
//! The mirror covers the explored part of the tree, the connection's own
//! account, and the account list once queried.

use std::collections::HashMap;

use crate::acl::{SheetSet, DEFAULT_ACCOUNT};
use crate::proto::{NodeId, NodeSheet, WireAccount};
use crate::tree::{casefold, SUBDIRECTORY_TYPE};

#[derive(Debug, Clone)]
pub struct MirrorNode {
    pub id: NodeId,
    pub parent: NodeId,
    pub name: String,
    pub node_type: String,
    pub acl: SheetSet,
    pub explored: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Mirror {
    nodes: HashMap<NodeId, MirrorNode>,
    pub accounts: Vec<WireAccount>,
    pub account: Option<WireAccount>,
}

impl Mirror {
    pub fn new() -> Self {
        let mut mirror = Mirror::default();
        mirror.nodes.insert(
            0,
            MirrorNode {
                id: 0,
                parent: 0,
                name: String::new(),
                node_type: SUBDIRECTORY_TYPE.to_string(),
                acl: SheetSet::new(),
                explored: false,
            },
        );
        mirror
    }

    pub fn clear(&mut self) {
        *self = Mirror::new();
    }

    pub fn node(&self, id: NodeId) -> Option<&MirrorNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, parent: NodeId) -> Vec<&MirrorNode> {
        self.nodes
            .values()
            .filter(|n| n.parent == parent && n.id != 0)
            .collect()
    }

    /// Case-insensitive child lookup, matching the server's semantics.
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<&MirrorNode> {
        let folded = casefold(name);
        self.children(parent)
            .into_iter()
            .find(|n| casefold(&n.name) == folded)
    }

    pub fn add_node(
        &mut self,
        id: NodeId,
        parent: NodeId,
        node_type: &str,
        name: &str,
        acl: SheetSet,
    ) {
        self.nodes.insert(
            id,
            MirrorNode {
                id,
                parent,
                name: name.to_string(),
                node_type: node_type.to_string(),
                acl,
                explored: false,
            },
        );
    }

    /// Remove a node and everything below it; returns the removed ids.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.nodes.remove(&current).is_none() {
                continue;
            }
            removed.push(current);
            stack.extend(
                self.nodes
                    .values()
                    .filter(|n| n.parent == current)
                    .map(|n| n.id),
            );
        }
        removed
    }

    pub fn mark_explored(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.explored = true;
        }
    }

    pub fn set_root_acl(&mut self, acl: SheetSet) {
        if let Some(root) = self.nodes.get_mut(&0) {
            root.acl = acl;
        }
    }

    /// Apply an ACL delta from a `set-acl`. A sheet with an empty mask
    /// signals erasure.
    pub fn apply_acl(&mut self, id: NodeId, delta: &SheetSet) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        for (account, sheet) in delta.iter() {
            if sheet.is_empty() {
                node.acl.remove(account);
            } else {
                let merged = match node.acl.get(account) {
                    Some(old) => old.overridden_by(*sheet),
                    None => *sheet,
                };
                node.acl.insert(account, merged);
            }
        }
    }

    pub fn account_added(&mut self, account: WireAccount) {
        if !self.accounts.iter().any(|a| a.id == account.id) {
            self.accounts.push(account);
        }
    }

    pub fn account_removed(&mut self, id: &str) {
        self.accounts.retain(|a| a.id != id);
    }

    pub fn set_account_list(&mut self, accounts: Vec<WireAccount>) {
        self.accounts = accounts;
    }

    /// The server changed this connection's effective account, with the
    /// account's own sheets for every visible node piggy-backed.
    pub fn change_account(&mut self, account: WireAccount, nodes: &[NodeSheet]) {
        for entry in nodes {
            if let Some(node) = self.nodes.get_mut(&entry.node_id) {
                node.acl.insert(
                    &account.id,
                    crate::acl::SheetRecord {
                        account: account.id.clone(),
                        mask: entry.mask,
                        perms: entry.perms,
                    }
                    .sheet(),
                );
            }
        }
        self.account = if account.id == DEFAULT_ACCOUNT {
            None
        } else {
            Some(account)
        };
    }
}
