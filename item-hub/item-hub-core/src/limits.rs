//! Tree-shape policy limits, checked before any structural mutation commits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::path::ItemPath;
use crate::storage::ItemStore;

/// Which limit a structural check tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    TreeDepth,
    ChildCount,
    MoveSubtree,
    CopySubtree,
    DeleteSubtree,
    BatchSize,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitKind::TreeDepth => "tree depth",
            LimitKind::ChildCount => "child count",
            LimitKind::MoveSubtree => "move subtree size",
            LimitKind::CopySubtree => "copy subtree size",
            LimitKind::DeleteSubtree => "delete subtree size",
            LimitKind::BatchSize => "batch size",
        };
        f.write_str(name)
    }
}

/// Structural policy constants. Values are configuration, not law, but every
/// mutation path enforces them consistently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeLimits {
    pub max_tree_levels: usize,
    pub max_children: usize,
    pub max_descendants_move: usize,
    pub max_descendants_copy: usize,
    pub max_descendants_delete: usize,
    pub max_targets_per_request: usize,
    /// Batches whose every root subtree is at or below this size apply
    /// synchronously; anything larger is dispatched to the worker pool.
    pub sync_apply_threshold: usize,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_tree_levels: 10,
            max_children: 500,
            max_descendants_move: 2_000,
            max_descendants_copy: 1_000,
            max_descendants_delete: 5_000,
            max_targets_per_request: 50,
            sync_apply_threshold: 20,
        }
    }
}

impl TreeLimits {
    pub fn assert_batch_size(&self, n: usize) -> Result<(), HubError> {
        if n > self.max_targets_per_request {
            return Err(HubError::LimitExceeded {
                limit: LimitKind::BatchSize,
                actual: n,
                max: self.max_targets_per_request,
            });
        }
        Ok(())
    }

    /// The destination must have room for one more direct child.
    pub fn assert_can_add_child(
        &self,
        store: &ItemStore,
        parent: &ItemPath,
    ) -> Result<(), HubError> {
        let children = store.child_count(parent);
        if children >= self.max_children {
            return Err(HubError::LimitExceeded {
                limit: LimitKind::ChildCount,
                actual: children + 1,
                max: self.max_children,
            });
        }
        Ok(())
    }

    /// Depth check for placing a subtree of `subtree_height` levels under a
    /// parent at `parent_depth`. The deepest descendant governs, not the
    /// subtree root: relocating a tall subtree can push its leaves past the
    /// limit even when the root lands comfortably.
    pub fn assert_depth_within_limit(
        &self,
        parent_depth: usize,
        subtree_height: usize,
    ) -> Result<(), HubError> {
        let deepest = parent_depth + subtree_height;
        if deepest > self.max_tree_levels {
            return Err(HubError::LimitExceeded {
                limit: LimitKind::TreeDepth,
                actual: deepest,
                max: self.max_tree_levels,
            });
        }
        Ok(())
    }

    pub fn assert_descendants_within_limit(
        &self,
        count: usize,
        kind: LimitKind,
    ) -> Result<(), HubError> {
        let max = match kind {
            LimitKind::MoveSubtree => self.max_descendants_move,
            LimitKind::CopySubtree => self.max_descendants_copy,
            LimitKind::DeleteSubtree => self.max_descendants_delete,
            _ => return Ok(()),
        };
        if count > max {
            return Err(HubError::LimitExceeded {
                limit: kind,
                actual: count,
                max,
            });
        }
        Ok(())
    }
}
