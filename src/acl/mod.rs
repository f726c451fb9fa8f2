//! ACL sheets, sheet sets, and the permission mask algebra.
//!
//! A sheet is a `(mask, perms)` pair for one account on one node: a bit set
//! in `mask` means the sheet decides that permission, and the corresponding
//! bit in `perms` is the decision. Undecided bits fall through to the parent
//! node's sheets; the root's `default` sheet covers every bit, so a lookup
//! always terminates with a full decision.

use std::collections::BTreeMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Account id the fallback sheet of every sheet set is keyed under.
pub const DEFAULT_ACCOUNT: &str = "default";

bitflags! {
    /// The fixed permission enumeration, one bit per capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct PermMask: u64 {
        const EXPLORE_NODE       = 1 << 0;
        const SUBSCRIBE_SESSION  = 1 << 1;
        const JOIN_USER          = 1 << 2;
        const QUERY_USER_LIST    = 1 << 3;
        const SET_ACL            = 1 << 4;
        const QUERY_ACL          = 1 << 5;
        const ADD_SUBDIRECTORY   = 1 << 6;
        const ADD_DOCUMENT       = 1 << 7;
        const SYNC_IN            = 1 << 8;
        const REMOVE_NODE        = 1 << 9;
        const SUBSCRIBE_CHAT     = 1 << 10;
        const QUERY_ACCOUNT_LIST = 1 << 11;
        const CREATE_ACCOUNT     = 1 << 12;
        const OVERRIDE_ACCOUNT   = 1 << 13;
        const REMOVE_ACCOUNT     = 1 << 14;
    }
}

impl PermMask {
    /// Bits that only make sense on the root node.
    pub const ROOT_ONLY: PermMask = PermMask::SUBSCRIBE_CHAT
        .union(PermMask::QUERY_ACCOUNT_LIST)
        .union(PermMask::CREATE_ACCOUNT)
        .union(PermMask::OVERRIDE_ACCOUNT)
        .union(PermMask::REMOVE_ACCOUNT);

    /// Bits that only make sense on subdirectories.
    pub const SUBDIRECTORY: PermMask = PermMask::EXPLORE_NODE
        .union(PermMask::ADD_SUBDIRECTORY)
        .union(PermMask::ADD_DOCUMENT)
        .union(PermMask::SYNC_IN);

    /// Permissions granted to the `default` account on the root when no
    /// stored ACL exists. Account administration and ACL editing stay off.
    pub const DEFAULT_ON: PermMask = PermMask::EXPLORE_NODE
        .union(PermMask::SUBSCRIBE_SESSION)
        .union(PermMask::JOIN_USER)
        .union(PermMask::QUERY_USER_LIST)
        .union(PermMask::ADD_SUBDIRECTORY)
        .union(PermMask::ADD_DOCUMENT)
        .union(PermMask::SYNC_IN)
        .union(PermMask::REMOVE_NODE)
        .union(PermMask::SUBSCRIBE_CHAT);

    /// Wire name of a single-bit mask, e.g. `"can-explore-node"`.
    pub fn name(self) -> Option<&'static str> {
        PERM_NAMES
            .iter()
            .find(|(bit, _)| *bit == self)
            .map(|(_, name)| *name)
    }

    /// Inverse of [`PermMask::name`].
    pub fn from_wire_name(name: &str) -> Option<PermMask> {
        PERM_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(bit, _)| *bit)
    }
}

static PERM_NAMES: Lazy<Vec<(PermMask, &'static str)>> = Lazy::new(|| {
    vec![
        (PermMask::EXPLORE_NODE, "can-explore-node"),
        (PermMask::SUBSCRIBE_SESSION, "can-subscribe-session"),
        (PermMask::JOIN_USER, "can-join-user"),
        (PermMask::QUERY_USER_LIST, "can-query-user-list"),
        (PermMask::SET_ACL, "can-set-acl"),
        (PermMask::QUERY_ACL, "can-query-acl"),
        (PermMask::ADD_SUBDIRECTORY, "can-add-subdirectory"),
        (PermMask::ADD_DOCUMENT, "can-add-document"),
        (PermMask::SYNC_IN, "can-sync-in"),
        (PermMask::REMOVE_NODE, "can-remove-node"),
        (PermMask::SUBSCRIBE_CHAT, "can-subscribe-chat"),
        (PermMask::QUERY_ACCOUNT_LIST, "can-query-account-list"),
        (PermMask::CREATE_ACCOUNT, "can-create-account"),
        (PermMask::OVERRIDE_ACCOUNT, "can-override-account"),
        (PermMask::REMOVE_ACCOUNT, "can-remove-account"),
    ]
});

// ─── Sheet ───────────────────────────────────────────────────────────────────

/// A partial ACL decision for one account on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sheet {
    /// Which permission bits this sheet decides.
    pub mask: PermMask,
    /// The decision for each bit in `mask`; bits outside `mask` are ignored.
    pub perms: PermMask,
}

impl Sheet {
    pub fn new(mask: PermMask, perms: PermMask) -> Self {
        Sheet {
            mask,
            perms: perms & mask,
        }
    }

    /// A sheet deciding every bit with the given grants.
    pub fn full(perms: PermMask) -> Self {
        Sheet {
            mask: PermMask::all(),
            perms,
        }
    }

    /// Overlay `other` on top of `self`: `other` wins for bits it decides.
    pub fn overridden_by(self, other: Sheet) -> Sheet {
        Sheet {
            mask: self.mask | other.mask,
            perms: (self.perms & !other.mask) | (other.perms & other.mask),
        }
    }

    /// A sheet deciding nothing. Announcing one of these signals that the
    /// account's sheet was erased from the node.
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }
}

/// Serialized form of one sheet, shared by the wire protocol and the ACL
/// sidecar files. Masks travel as plain 64-bit integers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SheetRecord {
    pub account: String,
    pub mask: u64,
    pub perms: u64,
}

impl SheetRecord {
    pub fn new(account: &str, sheet: Sheet) -> Self {
        SheetRecord {
            account: account.to_string(),
            mask: sheet.mask.bits(),
            perms: sheet.perms.bits(),
        }
    }

    pub fn sheet(&self) -> Sheet {
        let mask = PermMask::from_bits_truncate(self.mask);
        Sheet {
            mask,
            perms: PermMask::from_bits_truncate(self.perms) & mask,
        }
    }
}

// ─── Sheet set ───────────────────────────────────────────────────────────────

/// All sheets of one node, keyed by account id; at most one per account.
/// A `BTreeMap` keeps announcement and storage order deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SheetRecord>", into = "Vec<SheetRecord>")]
pub struct SheetSet {
    sheets: BTreeMap<String, Sheet>,
}

impl SheetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str) -> Option<Sheet> {
        self.sheets.get(account).copied()
    }

    pub fn insert(&mut self, account: &str, sheet: Sheet) {
        self.sheets.insert(account.to_string(), sheet);
    }

    pub fn remove(&mut self, account: &str) -> Option<Sheet> {
        self.sheets.remove(account)
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Sheet)> {
        self.sheets.iter()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &String> {
        self.sheets.keys()
    }

    /// Merge `other` into `self`. Per account, `other` overrides for the
    /// bits it decides; sheets left with an empty mask are dropped.
    pub fn merge(&mut self, other: &SheetSet) {
        for (account, new_sheet) in other.iter() {
            let merged = match self.sheets.get(account) {
                Some(old) => old.overridden_by(*new_sheet),
                None => *new_sheet,
            };
            if merged.is_empty() {
                self.sheets.remove(account);
            } else {
                self.sheets.insert(account.clone(), merged);
            }
        }
    }

    /// Drop sheets referencing accounts unknown to the registry. Returns the
    /// removed account ids so callers can announce the erasure.
    pub fn verify<F>(&mut self, known: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let removed: Vec<String> = self
            .sheets
            .keys()
            .filter(|account| !known(account))
            .cloned()
            .collect();
        for account in &removed {
            self.sheets.remove(account);
        }
        removed
    }

    /// The subset a connection is allowed to see without having queried the
    /// full ACL: the `default` sheet plus the connection's own.
    pub fn visible_subset(&self, account: &str) -> SheetSet {
        let mut out = SheetSet::new();
        if let Some(sheet) = self.get(DEFAULT_ACCOUNT) {
            out.insert(DEFAULT_ACCOUNT, sheet);
        }
        if account != DEFAULT_ACCOUNT {
            if let Some(sheet) = self.get(account) {
                out.insert(account, sheet);
            }
        }
        out
    }

    pub fn records(&self) -> Vec<SheetRecord> {
        self.sheets
            .iter()
            .map(|(account, sheet)| SheetRecord::new(account, *sheet))
            .collect()
    }
}

impl From<Vec<SheetRecord>> for SheetSet {
    fn from(records: Vec<SheetRecord>) -> Self {
        let mut set = SheetSet::new();
        for record in &records {
            set.insert(&record.account, record.sheet());
        }
        set
    }
}

impl From<SheetSet> for Vec<SheetRecord> {
    fn from(set: SheetSet) -> Self {
        set.records()
    }
}

impl FromIterator<(String, Sheet)> for SheetSet {
    fn from_iter<T: IntoIterator<Item = (String, Sheet)>>(iter: T) -> Self {
        SheetSet {
            sheets: iter.into_iter().collect(),
        }
    }
}

// ─── Effective permission lookup ─────────────────────────────────────────────

/// Resolve the effective permissions for an account over a node-to-root
/// chain of (optional) sheet sets. At each node the account's own sheet is
/// consulted, falling back to the node's `default` sheet; bits already
/// decided closer to the node are not overridden by ancestors.
pub fn effective_perms<'a, I>(chain: I, account: &str) -> PermMask
where
    I: IntoIterator<Item = Option<&'a SheetSet>>,
{
    let mut decided = PermMask::empty();
    let mut granted = PermMask::empty();

    for set in chain {
        let Some(set) = set else { continue };
        let sheet = set.get(account).or_else(|| set.get(DEFAULT_ACCOUNT));
        let Some(sheet) = sheet else { continue };

        let fresh = sheet.mask & !decided;
        granted |= sheet.perms & fresh;
        decided |= fresh;

        if decided == PermMask::all() {
            break;
        }
    }

    granted
}

/// `true` iff every bit of `required` is granted to `account` on the chain.
pub fn check<'a, I>(chain: I, account: &str, required: PermMask) -> bool
where
    I: IntoIterator<Item = Option<&'a SheetSet>>,
{
    effective_perms(chain, account).contains(required)
}
