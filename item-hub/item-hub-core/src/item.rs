use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;
use crate::path::ItemPath;

/// Different kinds of items in the tree, each carrying its own payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    Folder {
        /// Explicit display order for children. Ids absent from the list
        /// sort after it in creation order.
        #[serde(default)]
        child_order: Vec<Uuid>,
    },
    Document {
        body: String,
    },
    App {
        manifest: serde_json::Value,
    },
    Link {
        target: String,
    },
}

impl ItemKind {
    pub fn folder() -> Self {
        ItemKind::Folder {
            child_order: Vec::new(),
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, ItemKind::Folder { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::Folder { .. } => "folder",
            ItemKind::Document { .. } => "document",
            ItemKind::App { .. } => "app",
            ItemKind::Link { .. } => "link",
        }
    }

    /// Boundary validation before a payload enters the store.
    pub fn validate(&self) -> Result<(), HubError> {
        match self {
            ItemKind::Folder { .. } | ItemKind::Document { .. } => Ok(()),
            ItemKind::App { manifest } => {
                if manifest.is_object() {
                    Ok(())
                } else {
                    Err(HubError::Unsupported(
                        "app manifest must be a JSON object".into(),
                    ))
                }
            }
            ItemKind::Link { target } => {
                if target.trim().is_empty() {
                    Err(HubError::Unsupported("link target must not be empty".into()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Orthogonal read-visibility overlay on top of grant resolution. A public
/// item is readable by any actor; it never grants more than Read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// A node in the hierarchical content tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub path: ItemPath,
    pub name: String,
    pub owner: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(id: Uuid, path: ItemPath, name: String, owner: String, kind: ItemKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            path,
            name,
            owner,
            kind,
            visibility: Visibility::Private,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Parent id, derived from the path. `None` for roots.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.path.parent().and_then(|p| p.item_id().ok())
    }

    pub fn depth(&self) -> usize {
        self.path.depth()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
