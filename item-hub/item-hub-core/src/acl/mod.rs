//! Membership grants and inherited-permission resolution.
//!
//! A grant anchors to an item id, which is the final segment of the item's
//! path, so a subtree move changes the paths grants resolve through without
//! rewriting a single grant row. Resolution walks the target's decoded
//! ancestor chain deepest-first; the closest grant wins, so sharing deeper
//! in the tree narrows or widens access below that point.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;
use crate::item::{Item, Visibility};
use crate::path::ItemPath;
use crate::storage::ItemStore;


const GRANTS_FILE: &str = "grants.json";

/// Permission levels form a total order; a higher level implies the lower.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// A stored authorization record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub actor: String,
    pub item_id: Uuid,
    pub level: PermissionLevel,
    pub granted_at: DateTime<Utc>,
}

pub struct PermissionLedger {
    file: PathBuf,
    by_actor: HashMap<String, HashMap<Uuid, Grant>>,
}

impl PermissionLedger {
    /// Open the ledger persisted next to the item records. Duplicate rows
    /// for one (actor, item) pair mean the file was corrupted outside this
    /// process and refuse to load.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(GRANTS_FILE);
        let mut by_actor: HashMap<String, HashMap<Uuid, Grant>> = HashMap::new();
        if file.exists() {
            let data = std::fs::read_to_string(&file)?;
            let grants: Vec<Grant> = serde_json::from_str(&data)?;
            for grant in grants {
                let previous = by_actor
                    .entry(grant.actor.clone())
                    .or_default()
                    .insert(grant.item_id, grant);
                if let Some(previous) = previous {
                    bail!(
                        "duplicate grant for actor {} on item {}",
                        previous.actor,
                        previous.item_id
                    );
                }
            }
        }
        Ok(Self { file, by_actor })
    }

    fn save(&self) -> Result<(), HubError> {
        let mut grants: Vec<&Grant> = self
            .by_actor
            .values()
            .flat_map(|grants| grants.values())
            .collect();
        grants.sort_by(|a, b| (&a.actor, a.item_id).cmp(&(&b.actor, b.item_id)));
        let data = serde_json::to_string(&grants)?;
        std::fs::write(&self.file, data)?;
        Ok(())
    }

    /// Create or replace the single grant for `(actor, item)`.
    pub fn grant(
        &mut self,
        actor: &str,
        item_id: Uuid,
        level: PermissionLevel,
    ) -> Result<(), HubError> {
        self.by_actor.entry(actor.to_string()).or_default().insert(
            item_id,
            Grant {
                actor: actor.to_string(),
                item_id,
                level,
                granted_at: Utc::now(),
            },
        );
        self.save()
    }

    /// Remove the grant for `(actor, item)`. Returns whether one existed.
    pub fn revoke(&mut self, actor: &str, item_id: Uuid) -> Result<bool, HubError> {
        let removed = self
            .by_actor
            .get_mut(actor)
            .map(|grants| grants.remove(&item_id).is_some())
            .unwrap_or(false);
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Effective permission for `actor` at `target`: the grant on the
    /// closest ancestor-or-self wins. `None` means no access.
    pub fn effective_permission(
        &self,
        actor: &str,
        target: &ItemPath,
    ) -> Result<Option<PermissionLevel>, HubError> {
        let Some(grants) = self.by_actor.get(actor) else {
            return Ok(None);
        };
        let chain = target.decode()?;
        for id in chain.iter().rev() {
            if let Some(grant) = grants.get(id) {
                return Ok(Some(grant.level));
            }
        }
        Ok(None)
    }

    /// Grant resolution plus the visibility overlay: a public item is
    /// readable by anyone, and the overlay never grants more than Read.
    pub fn effective_permission_with(
        &self,
        actor: &str,
        item: &Item,
    ) -> Result<Option<PermissionLevel>, HubError> {
        let granted = self.effective_permission(actor, &item.path)?;
        if granted.is_none() && item.visibility == Visibility::Public {
            return Ok(Some(PermissionLevel::Read));
        }
        Ok(granted)
    }

    pub fn grants_for_item(&self, item_id: Uuid) -> Vec<&Grant> {
        let mut grants: Vec<&Grant> = self
            .by_actor
            .values()
            .filter_map(|grants| grants.get(&item_id))
            .collect();
        grants.sort_by(|a, b| a.actor.cmp(&b.actor));
        grants
    }

    pub fn grants_for_actor(&self, actor: &str) -> Vec<&Grant> {
        self.by_actor
            .get(actor)
            .map(|grants| grants.values().collect())
            .unwrap_or_default()
    }

    /// Grants that resolve into the subtree at `root`: those inherited from
    /// strict ancestors, then those anchored at or below the root in path
    /// order. Bulk delete uses this to know what a purge will take down.
    pub fn list_inherited_and_below(
        &self,
        root: &ItemPath,
        store: &ItemStore,
    ) -> Result<Vec<Grant>, HubError> {
        let mut out = Vec::new();
        let chain = root.decode()?;
        for ancestor in &chain[..chain.len().saturating_sub(1)] {
            out.extend(self.grants_for_item(*ancestor).into_iter().cloned());
        }
        for id in store.subtree_ids(root) {
            out.extend(self.grants_for_item(id).into_iter().cloned());
        }
        Ok(out)
    }

    /// Topmost active items shared with `actor`: one entry per granted
    /// subtree, descendants deduplicated when an ancestor is already
    /// surfaced, owned items skipped.
    pub fn shared_with_me(
        &self,
        actor: &str,
        store: &ItemStore,
        min_level: Option<PermissionLevel>,
    ) -> Vec<Item> {
        let mut items: Vec<&Item> = self
            .grants_for_actor(actor)
            .into_iter()
            .filter(|grant| min_level.is_none_or(|min| grant.level >= min))
            .filter_map(|grant| store.get_active(grant.item_id).ok())
            .filter(|item| item.owner != actor)
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        let mut topmost: Vec<Item> = Vec::new();
        for item in items {
            let covered = topmost
                .iter()
                .any(|kept| kept.path.is_ancestor_or_self(&item.path));
            if !covered {
                topmost.push(item.clone());
            }
        }
        topmost
    }

    /// Drop every grant anchored to the given items. Called when a subtree
    /// is hard-deleted.
    pub fn purge_items(&mut self, ids: &[Uuid]) -> Result<usize, HubError> {
        let mut removed = 0;
        for grants in self.by_actor.values_mut() {
            let before = grants.len();
            grants.retain(|item_id, _| !ids.contains(item_id));
            removed += before - grants.len();
        }
        self.by_actor.retain(|_, grants| !grants.is_empty());
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }
}
