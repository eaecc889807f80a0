//! Filesystem-backed item store with a range-scannable path index.
//!
//! Every item is persisted as one JSON record under the data directory and
//! loaded at startup. Tree queries never walk parent pointers: the in-memory
//! `BTreeMap` keyed by path token turns ancestor/descendant lookups into
//! range scans, and `rewrite_path_prefix` relocates a whole subtree as one
//! pass over that range.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::HubError;
use crate::item::{Item, ItemKind, Visibility};
use crate::path::ItemPath;

mod tests;

pub struct ItemStore {
    dir: PathBuf,
    items: HashMap<Uuid, Item>,
    by_path: BTreeMap<String, Uuid>,
    roots: HashMap<String, Uuid>,
}

impl ItemStore {
    /// Open a store rooted at `dir`, loading every persisted item record.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut items = HashMap::new();
        let mut by_path = BTreeMap::new();
        let mut roots = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(stem) else {
                continue;
            };
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("reading item record {}", path.display()))?;
            let item: Item = serde_json::from_str(&data)
                .with_context(|| format!("parsing item record {}", path.display()))?;
            if item.id != id {
                bail!("item record {} carries mismatched id {}", path.display(), item.id);
            }
            if let Some(other) = by_path.insert(item.path.as_str().to_string(), id) {
                bail!("items {} and {} share path {}", other, id, item.path);
            }
            if item.depth() == 1 && item.kind.is_folder() && !item.is_deleted() {
                roots.insert(item.owner.clone(), id);
            }
            items.insert(id, item);
        }
        Ok(Self {
            dir,
            items,
            by_path,
            roots,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id.simple()))
    }

    fn persist(&self, item: &Item) -> Result<(), HubError> {
        let data = serde_json::to_string(item)?;
        std::fs::write(self.record_path(item.id), data)?;
        Ok(())
    }

    /// Ids of every row under `root` (root included), in path order.
    pub(crate) fn subtree_ids(&self, root: &ItemPath) -> Vec<Uuid> {
        self.by_path
            .range(root.as_str().to_string()..)
            .take_while(|(token, _)| token.starts_with(root.as_str()))
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&Item> {
        self.items.get(&id)
    }

    /// The item, or `NotFound` when it is missing or soft-deleted.
    pub fn get_active(&self, id: Uuid) -> Result<&Item, HubError> {
        match self.items.get(&id) {
            Some(item) if !item.is_deleted() => Ok(item),
            _ => Err(HubError::NotFound(id)),
        }
    }

    pub fn get_by_path(&self, path: &ItemPath) -> Option<&Item> {
        self.by_path
            .get(path.as_str())
            .and_then(|id| self.items.get(id))
    }

    /// The root folder owned by `owner`, creating it on first use.
    pub fn ensure_root(&mut self, owner: &str) -> Result<Uuid, HubError> {
        if let Some(id) = self.roots.get(owner) {
            if self.items.contains_key(id) {
                return Ok(*id);
            }
        }
        if let Some(item) = self.items.values().find(|item| {
            item.owner == owner && item.depth() == 1 && item.kind.is_folder() && !item.is_deleted()
        }) {
            let id = item.id;
            self.roots.insert(owner.to_string(), id);
            return Ok(id);
        }
        let id = Uuid::new_v4();
        let item = Item::new(
            id,
            ItemPath::root(id),
            "root".to_string(),
            owner.to_string(),
            ItemKind::folder(),
        );
        self.create(item)?;
        Ok(id)
    }

    pub fn root_of(&self, owner: &str) -> Option<Uuid> {
        self.roots.get(owner).copied()
    }

    /// Insert a fully-formed item. The parent row must already exist for
    /// non-root paths; path collisions are rejected defensively even though
    /// globally unique ids should make them impossible.
    pub fn create(&mut self, item: Item) -> Result<(), HubError> {
        if self.by_path.contains_key(item.path.as_str()) {
            return Err(HubError::DuplicatePath(item.path.to_string()));
        }
        if self.items.contains_key(&item.id) {
            return Err(HubError::Integrity(format!("id {} already exists", item.id)));
        }
        if let Some(parent) = item.path.parent() {
            if !self.by_path.contains_key(parent.as_str()) {
                return Err(HubError::Integrity(format!(
                    "parent path {} missing for item {}",
                    parent, item.id
                )));
            }
        }
        self.persist(&item)?;
        self.by_path.insert(item.path.as_str().to_string(), item.id);
        if item.depth() == 1 && item.kind.is_folder() {
            self.roots.insert(item.owner.clone(), item.id);
        }
        self.items.insert(item.id, item);
        Ok(())
    }

    /// Active direct children of `parent`. With `ordered`, the parent
    /// folder's explicit order list governs; unlisted children follow in
    /// creation order.
    pub fn get_children(&self, parent: &ItemPath, ordered: bool) -> Vec<&Item> {
        let mut children: Vec<&Item> = self
            .subtree_ids(parent)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .filter(|item| item.depth() == parent.depth() + 1 && !item.is_deleted())
            .collect();
        if ordered {
            let order: HashMap<Uuid, usize> = match self.get_by_path(parent).map(|p| &p.kind) {
                Some(ItemKind::Folder { child_order }) => child_order
                    .iter()
                    .enumerate()
                    .map(|(pos, id)| (*id, pos))
                    .collect(),
                _ => HashMap::new(),
            };
            children.sort_by_key(|item| {
                (
                    order.get(&item.id).copied().unwrap_or(usize::MAX),
                    item.created_at,
                    item.id,
                )
            });
        } else {
            children.sort_by_key(|item| (item.created_at, item.id));
        }
        children
    }

    pub fn child_count(&self, parent: &ItemPath) -> usize {
        self.subtree_ids(parent)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .filter(|item| item.depth() == parent.depth() + 1 && !item.is_deleted())
            .count()
    }

    /// Active strict descendants of `root`. Unordered listings come straight
    /// off the path index (depth-first by construction); ordered listings
    /// apply each folder's explicit child order recursively.
    pub fn get_descendants(&self, root: &ItemPath, ordered: bool) -> Vec<&Item> {
        if ordered {
            let mut out = Vec::new();
            self.walk_ordered(root, &mut out);
            return out;
        }
        self.subtree_ids(root)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .filter(|item| item.path != *root && !item.is_deleted())
            .collect()
    }

    fn walk_ordered<'a>(&'a self, parent: &ItemPath, out: &mut Vec<&'a Item>) {
        for child in self.get_children(parent, true) {
            out.push(child);
            if child.kind.is_folder() {
                self.walk_ordered(&child.path, out);
            }
        }
    }

    /// Every strict descendant including soft-deleted rows, in path order.
    /// Restore previews and trash listings read through this.
    pub fn get_descendants_with_deleted(&self, root: &ItemPath) -> Vec<&Item> {
        self.subtree_ids(root)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .filter(|item| item.path != *root)
            .collect()
    }

    /// Cheap count of active strict descendants; no rows are materialized.
    pub fn descendant_count(&self, root: &ItemPath) -> usize {
        self.by_path
            .range(root.as_str().to_string()..)
            .take_while(|(token, _)| token.starts_with(root.as_str()))
            .filter(|(token, _)| token.as_str() != root.as_str())
            .filter(|(_, id)| self.items.get(*id).is_some_and(|item| !item.is_deleted()))
            .count()
    }

    /// Strict-descendant count including soft-deleted rows; restore and
    /// purge size their work against this.
    pub fn descendant_count_with_deleted(&self, root: &ItemPath) -> usize {
        self.subtree_ids(root).len().saturating_sub(1)
    }

    /// Number of levels the subtree occupies, counting the root level.
    pub fn subtree_height(&self, root: &ItemPath) -> usize {
        self.subtree_ids(root)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .map(|item| item.depth())
            .max()
            .map(|deepest| deepest - root.depth() + 1)
            .unwrap_or(1)
    }

    /// Relocate every row whose path starts with `old` so it starts with
    /// `new` instead. This single primitive implements move: the encoding is
    /// prefix-comparable, so no descendant's logical position is touched
    /// individually. Soft-deleted rows travel with their subtree.
    pub fn rewrite_path_prefix(
        &mut self,
        old: &ItemPath,
        new: &ItemPath,
    ) -> Result<usize, HubError> {
        let ids = self.subtree_ids(old);
        if ids.is_empty() {
            return Err(HubError::NotFound(old.item_id()?));
        }
        for id in &ids {
            let rebased = self.items[id].path.rebase(old, new)?;
            if let Some(existing) = self.by_path.get(rebased.as_str()) {
                if existing != id {
                    return Err(HubError::DuplicatePath(rebased.to_string()));
                }
            }
        }
        for id in &ids {
            let item = self.items.get_mut(id).expect("indexed id");
            self.by_path.remove(item.path.as_str());
            item.path = item.path.rebase(old, new)?;
            self.by_path.insert(item.path.as_str().to_string(), *id);
        }
        for id in &ids {
            self.persist(&self.items[id])?;
        }
        Ok(ids.len())
    }

    /// Mark the whole subtree deleted in a single pass. Rows that were
    /// already soft-deleted keep their original marker.
    pub fn soft_delete(&mut self, root: &ItemPath) -> Result<usize, HubError> {
        let ids = self.subtree_ids(root);
        if ids.is_empty() {
            return Err(HubError::NotFound(root.item_id()?));
        }
        let now = Utc::now();
        let mut marked = 0;
        for id in &ids {
            let item = self.items.get_mut(id).expect("indexed id");
            if item.deleted_at.is_none() {
                item.deleted_at = Some(now);
                marked += 1;
            }
        }
        for id in &ids {
            self.persist(&self.items[id])?;
        }
        Ok(marked)
    }

    /// Clear the delete marker for the whole subtree, including rows that
    /// were independently soft-deleted before the root was.
    pub fn restore(&mut self, root: &ItemPath) -> Result<usize, HubError> {
        let ids = self.subtree_ids(root);
        if ids.is_empty() {
            return Err(HubError::NotFound(root.item_id()?));
        }
        let mut cleared = 0;
        for id in &ids {
            let item = self.items.get_mut(id).expect("indexed id");
            if item.deleted_at.take().is_some() {
                cleared += 1;
            }
        }
        for id in &ids {
            self.persist(&self.items[id])?;
        }
        Ok(cleared)
    }

    /// Remove the subtree permanently, returning the removed ids so the
    /// permission ledger can drop their grants.
    pub fn hard_delete_subtree(&mut self, root: &ItemPath) -> Result<Vec<Uuid>, HubError> {
        let ids = self.subtree_ids(root);
        if ids.is_empty() {
            return Err(HubError::NotFound(root.item_id()?));
        }
        for id in &ids {
            if let Some(item) = self.items.remove(id) {
                self.by_path.remove(item.path.as_str());
                if let Err(err) = std::fs::remove_file(self.record_path(*id)) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(item = %id, error = %err, "failed to remove item record");
                    }
                }
            }
        }
        self.roots.retain(|_, id| !ids.contains(id));
        Ok(ids)
    }

    pub fn rename(&mut self, id: Uuid, name: String) -> Result<(), HubError> {
        let item = self.items.get_mut(&id).ok_or(HubError::NotFound(id))?;
        item.name = name;
        item.touch();
        let item = &self.items[&id];
        self.persist(item)
    }

    pub fn set_visibility(&mut self, id: Uuid, visibility: Visibility) -> Result<(), HubError> {
        let item = self.items.get_mut(&id).ok_or(HubError::NotFound(id))?;
        item.visibility = visibility;
        item.touch();
        let item = &self.items[&id];
        self.persist(item)
    }

    pub fn update_document_body(&mut self, id: Uuid, body: String) -> Result<(), HubError> {
        let item = self.items.get_mut(&id).ok_or(HubError::NotFound(id))?;
        match &mut item.kind {
            ItemKind::Document { body: current } => {
                *current = body;
                item.touch();
            }
            _ => {
                return Err(HubError::Unsupported(
                    "content updates apply to documents only".into(),
                ))
            }
        }
        let item = &self.items[&id];
        self.persist(item)
    }

    /// Replace a folder's explicit child ordering. Every referenced id must
    /// be an active direct child.
    pub fn set_child_order(&mut self, id: Uuid, order: Vec<Uuid>) -> Result<(), HubError> {
        let parent_path = self.get_active(id)?.path.clone();
        let children: Vec<Uuid> = self
            .get_children(&parent_path, false)
            .iter()
            .map(|child| child.id)
            .collect();
        for child in &order {
            if !children.contains(child) {
                return Err(HubError::Unsupported(format!(
                    "{} is not an active child of {}",
                    child, id
                )));
            }
        }
        let item = self.items.get_mut(&id).ok_or(HubError::NotFound(id))?;
        match &mut item.kind {
            ItemKind::Folder { child_order } => {
                *child_order = order;
                item.touch();
            }
            _ => {
                return Err(HubError::Unsupported(
                    "child ordering applies to folders only".into(),
                ))
            }
        }
        let item = &self.items[&id];
        self.persist(item)
    }

    /// Drop a child id from a folder's order list after the child leaves.
    pub fn remove_from_child_order(&mut self, parent: Uuid, child: Uuid) -> Result<(), HubError> {
        let Some(item) = self.items.get_mut(&parent) else {
            return Ok(());
        };
        if let ItemKind::Folder { child_order } = &mut item.kind {
            let before = child_order.len();
            child_order.retain(|id| *id != child);
            if child_order.len() != before {
                let item = &self.items[&parent];
                return self.persist(item);
            }
        }
        Ok(())
    }

    /// A copy landing next to a same-named sibling gets a uniqueness suffix.
    pub fn disambiguate_name(&self, parent: &ItemPath, desired: &str) -> String {
        let siblings: Vec<&str> = self
            .get_children(parent, false)
            .iter()
            .map(|child| child.name.as_str())
            .collect();
        if !siblings.contains(&desired) {
            return desired.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{} ({})", desired, n);
            if !siblings.contains(&candidate.as_str()) {
                return candidate;
            }
            n += 1;
        }
    }
}
