//! Sortable materialized-path tokens.
//!
//! A path is an item's full ancestor chain (self included), each id rendered
//! as its 32-character lowercase-hex form and terminated by `/`. Fixed-width
//! segments plus the terminating separator make ancestorship a plain string
//! prefix test, and keep one subtree contiguous under lexicographic ordering
//! so a single BTree range scan visits exactly that subtree.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

/// Length of one encoded segment, excluding the separator.
pub const SEGMENT_LEN: usize = 32;

const SEPARATOR: char = '/';

/// Encoded tree position of an item. Doubles as the item's unique key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemPath(String);

impl ItemPath {
    /// Encode an id sequence (root first, self last) into a path token.
    pub fn encode(ids: &[Uuid]) -> Self {
        let mut token = String::with_capacity(ids.len() * (SEGMENT_LEN + 1));
        for id in ids {
            token.push_str(&id.simple().to_string());
            token.push(SEPARATOR);
        }
        ItemPath(token)
    }

    /// Path of a root item.
    pub fn root(id: Uuid) -> Self {
        Self::encode(std::slice::from_ref(&id))
    }

    /// Path of a direct child of `self`.
    pub fn child(&self, id: Uuid) -> Self {
        let mut token = String::with_capacity(self.0.len() + SEGMENT_LEN + 1);
        token.push_str(&self.0);
        token.push_str(&id.simple().to_string());
        token.push(SEPARATOR);
        ItemPath(token)
    }

    /// Decode back into the id sequence. Fails only on corrupt tokens,
    /// which never originate from `encode`.
    pub fn decode(&self) -> Result<Vec<Uuid>, HubError> {
        if self.0.is_empty() || self.0.len() % (SEGMENT_LEN + 1) != 0 {
            return Err(HubError::MalformedPath(self.0.clone()));
        }
        let mut ids = Vec::with_capacity(self.depth());
        for segment in self.0.split_terminator(SEPARATOR) {
            if segment.len() != SEGMENT_LEN {
                return Err(HubError::MalformedPath(self.0.clone()));
            }
            let id = Uuid::try_parse(segment)
                .map_err(|_| HubError::MalformedPath(self.0.clone()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Number of segments; a root item has depth 1.
    pub fn depth(&self) -> usize {
        self.0.len() / (SEGMENT_LEN + 1)
    }

    /// Path of the parent, or `None` for a root.
    pub fn parent(&self) -> Option<ItemPath> {
        if self.depth() <= 1 {
            return None;
        }
        let cut = self.0.len() - (SEGMENT_LEN + 1);
        Some(ItemPath(self.0[..cut].to_string()))
    }

    /// The id of the item itself (the final segment).
    pub fn item_id(&self) -> Result<Uuid, HubError> {
        if self.0.len() < SEGMENT_LEN + 1 {
            return Err(HubError::MalformedPath(self.0.clone()));
        }
        let start = self.0.len() - (SEGMENT_LEN + 1);
        Uuid::try_parse(&self.0[start..self.0.len() - 1])
            .map_err(|_| HubError::MalformedPath(self.0.clone()))
    }

    /// True when `self` is an ancestor of `descendant` or the same path.
    pub fn is_ancestor_or_self(&self, descendant: &ItemPath) -> bool {
        descendant.0.starts_with(&self.0)
    }

    /// True when `self` is a descendant of `ancestor` or the same path.
    pub fn is_descendant_or_self(&self, ancestor: &ItemPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Replace `old_prefix` with `new_prefix`. Pure token surgery; this is
    /// the per-row half of a subtree move.
    pub fn rebase(&self, old_prefix: &ItemPath, new_prefix: &ItemPath) -> Result<ItemPath, HubError> {
        let suffix = self
            .0
            .strip_prefix(&old_prefix.0)
            .ok_or_else(|| HubError::MalformedPath(self.0.clone()))?;
        Ok(ItemPath(format!("{}{}", new_prefix.0, suffix)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
