//! Bulk mutation coordinator.
//!
//! A batch request names up to `max_targets_per_request` root items; each
//! root expands to one subtree task. Validation runs per root before
//! anything mutates, so one oversized or forbidden root never sinks its
//! siblings. Small batches apply inline and return final outcomes; larger
//! ones are dispatched to a bounded worker pool and report through the
//! notification sink, exactly once per root.
//!
//! Each task performs its whole subtree mutation under the store's write
//! guard: validation re-runs there, the change set is computed in full, and
//! a concurrent loser observes a typed failure rather than a half-moved
//! tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::acl::{PermissionLedger, PermissionLevel};
use crate::error::HubError;
use crate::events::{Event, EventBus, ItemOutcome, NotificationSink, OpKind, OperationFeedback};
use crate::item::{Item, ItemKind};
use crate::limits::{LimitKind, TreeLimits};
use crate::path::ItemPath;
use crate::storage::ItemStore;

mod tests;

/// One unit of background work: a single root item of a batch.
#[derive(Debug)]
struct BulkTask {
    op: OpKind,
    root: Uuid,
    actor: String,
    dest: Option<Uuid>,
}

/// A root item rejected before acceptance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedItem {
    pub id: Uuid,
    pub reason: HubError,
}

/// Synchronous answer to a bulk request. Rejections are known immediately;
/// accepted roots either completed inline (`completed` is populated and
/// `asynchronous` is false) or will report through the notification sink.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDisposition {
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<RejectedItem>,
    pub completed: Vec<OperationFeedback>,
    pub asynchronous: bool,
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Shared {
    store: Arc<RwLock<ItemStore>>,
    ledger: Arc<RwLock<PermissionLedger>>,
    limits: TreeLimits,
    events: EventBus,
    sink: Arc<dyn NotificationSink>,
    in_flight: InFlight,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    tx: mpsc::Sender<BulkTask>,
    workers: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<RwLock<ItemStore>>,
        ledger: Arc<RwLock<PermissionLedger>>,
        limits: TreeLimits,
        events: EventBus,
        sink: Arc<dyn NotificationSink>,
        workers: usize,
        queue_depth: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            ledger,
            limits,
            events,
            sink,
            in_flight: InFlight::default(),
        });
        let (tx, rx) = mpsc::channel::<BulkTask>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::new();
        for worker in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };
                    debug!(worker, op = ?task.op, root = %task.root, "running bulk task");
                    let feedback = run_task(&shared, &task).await;
                    shared.sink.notify(feedback).await;
                    shared.in_flight.done();
                }
            }));
        }
        Self {
            shared,
            tx,
            workers: handles,
        }
    }

    pub fn limits(&self) -> &TreeLimits {
        &self.shared.limits
    }

    pub async fn move_items(
        &self,
        actor: &str,
        ids: &[Uuid],
        dest: Option<Uuid>,
    ) -> Result<BatchDisposition, HubError> {
        self.submit(OpKind::Move, actor, ids, dest).await
    }

    pub async fn copy_items(
        &self,
        actor: &str,
        ids: &[Uuid],
        dest: Option<Uuid>,
    ) -> Result<BatchDisposition, HubError> {
        self.submit(OpKind::Copy, actor, ids, dest).await
    }

    pub async fn delete_items(&self, actor: &str, ids: &[Uuid]) -> Result<BatchDisposition, HubError> {
        self.submit(OpKind::Delete, actor, ids, None).await
    }

    pub async fn restore_items(&self, actor: &str, ids: &[Uuid]) -> Result<BatchDisposition, HubError> {
        self.submit(OpKind::Restore, actor, ids, None).await
    }

    pub async fn purge_items(&self, actor: &str, ids: &[Uuid]) -> Result<BatchDisposition, HubError> {
        self.submit(OpKind::Purge, actor, ids, None).await
    }

    /// Wait until every dispatched task has reported. Lets tests and
    /// embedders drain the queue deterministically instead of sleeping.
    pub async fn drain(&self) {
        self.shared.in_flight.wait_idle().await;
    }

    /// Close the queue and wait for the workers to finish what remains.
    pub async fn shutdown(self) {
        let Coordinator {
            shared: _,
            tx,
            workers,
        } = self;
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn submit(
        &self,
        op: OpKind,
        actor: &str,
        ids: &[Uuid],
        dest: Option<Uuid>,
    ) -> Result<BatchDisposition, HubError> {
        self.shared.limits.assert_batch_size(ids.len())?;
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut small = true;
        {
            let store = self.shared.store.read().await;
            let ledger = self.shared.ledger.read().await;
            for id in ids {
                match validate_root(&self.shared.limits, &store, &ledger, op, *id, actor, dest) {
                    Ok(rows) => {
                        if rows > self.shared.limits.sync_apply_threshold {
                            small = false;
                        }
                        accepted.push(*id);
                    }
                    Err(reason) => rejected.push(RejectedItem { id: *id, reason }),
                }
            }
        }
        if small {
            let mut completed = Vec::new();
            for id in &accepted {
                let task = BulkTask {
                    op,
                    root: *id,
                    actor: actor.to_string(),
                    dest,
                };
                let feedback = run_task(&self.shared, &task).await;
                self.shared.sink.notify(feedback.clone()).await;
                completed.push(feedback);
            }
            return Ok(BatchDisposition {
                accepted,
                rejected,
                completed,
                asynchronous: false,
            });
        }
        for id in &accepted {
            self.shared.in_flight.add();
            let task = BulkTask {
                op,
                root: *id,
                actor: actor.to_string(),
                dest,
            };
            if self.tx.send(task).await.is_err() {
                self.shared.in_flight.done();
                self.shared
                    .sink
                    .notify(OperationFeedback {
                        op,
                        item_id: *id,
                        outcome: ItemOutcome::Failed {
                            reason: HubError::Unavailable("worker pool stopped".into()),
                        },
                    })
                    .await;
            }
        }
        Ok(BatchDisposition {
            accepted,
            rejected,
            completed: Vec::new(),
            asynchronous: true,
        })
    }
}

async fn run_task(shared: &Shared, task: &BulkTask) -> OperationFeedback {
    let mut outcome = apply(shared, task).await;
    if let ItemOutcome::Failed { reason } = &outcome {
        if reason.is_retryable() {
            warn!(op = ?task.op, root = %task.root, error = %reason, "retrying after transient failure");
            outcome = apply(shared, task).await;
        }
    }
    OperationFeedback {
        op: task.op,
        item_id: task.root,
        outcome,
    }
}

async fn apply(shared: &Shared, task: &BulkTask) -> ItemOutcome {
    let result = match task.op {
        OpKind::Move => apply_move(shared, task).await,
        OpKind::Copy => apply_copy(shared, task).await,
        OpKind::Delete => apply_delete(shared, task).await,
        OpKind::Restore => apply_restore(shared, task).await,
        OpKind::Purge => apply_purge(shared, task).await,
    };
    match result {
        Ok(outcome) => outcome,
        Err(reason) => ItemOutcome::Failed { reason },
    }
}

fn require(
    ledger: &PermissionLedger,
    actor: &str,
    item: &Item,
    required: PermissionLevel,
) -> Result<(), HubError> {
    match ledger.effective_permission_with(actor, item)? {
        Some(level) if level >= required => Ok(()),
        _ => Err(HubError::Forbidden { required }),
    }
}

fn resolve_destination<'a>(
    store: &'a ItemStore,
    actor: &str,
    dest: Option<Uuid>,
) -> Result<&'a Item, HubError> {
    let id = match dest {
        Some(id) => id,
        None => store
            .root_of(actor)
            .ok_or_else(|| HubError::Unsupported("actor has no root folder".into()))?,
    };
    store.get_active(id)
}

/// Per-root validation, run once under a read guard before acceptance and
/// again under the write guard before mutating. Returns the number of rows
/// the task will touch, which decides the synchronous fast path.
fn validate_root(
    limits: &TreeLimits,
    store: &ItemStore,
    ledger: &PermissionLedger,
    op: OpKind,
    root: Uuid,
    actor: &str,
    dest: Option<Uuid>,
) -> Result<usize, HubError> {
    match op {
        OpKind::Move | OpKind::Copy => {
            let source = store.get_active(root)?;
            let required = if op == OpKind::Move {
                PermissionLevel::Admin
            } else {
                PermissionLevel::Read
            };
            require(ledger, actor, source, required)?;
            if op == OpKind::Move && source.depth() == 1 {
                return Err(HubError::Unsupported("a root folder cannot be moved".into()));
            }
            let source_path = source.path.clone();
            let dest_item = resolve_destination(store, actor, dest)?;
            if !dest_item.kind.is_folder() {
                return Err(HubError::Unsupported("destination must be a folder".into()));
            }
            require(ledger, actor, dest_item, PermissionLevel::Write)?;
            if op == OpKind::Move && dest_item.path.is_descendant_or_self(&source_path) {
                return Err(HubError::Cycle);
            }
            let count = store.descendant_count(&source_path);
            let kind = if op == OpKind::Move {
                LimitKind::MoveSubtree
            } else {
                LimitKind::CopySubtree
            };
            limits.assert_descendants_within_limit(count, kind)?;
            limits.assert_can_add_child(store, &dest_item.path)?;
            let height = store.subtree_height(&source_path);
            limits.assert_depth_within_limit(dest_item.path.depth(), height)?;
            Ok(count + 1)
        }
        OpKind::Delete => {
            let item = store.get_active(root)?;
            require(ledger, actor, item, PermissionLevel::Admin)?;
            let count = store.descendant_count(&item.path);
            limits.assert_descendants_within_limit(count, LimitKind::DeleteSubtree)?;
            Ok(count + 1)
        }
        OpKind::Restore | OpKind::Purge => {
            let item = store.get(root).ok_or(HubError::NotFound(root))?;
            require(ledger, actor, item, PermissionLevel::Admin)?;
            let count = store.descendant_count_with_deleted(&item.path);
            limits.assert_descendants_within_limit(count, LimitKind::DeleteSubtree)?;
            Ok(count + 1)
        }
    }
}

async fn apply_move(shared: &Shared, task: &BulkTask) -> Result<ItemOutcome, HubError> {
    let mut store = shared.store.write().await;
    {
        let ledger = shared.ledger.read().await;
        validate_root(
            &shared.limits,
            &store,
            &ledger,
            OpKind::Move,
            task.root,
            &task.actor,
            task.dest,
        )?;
    }
    let (source_path, old_parent) = {
        let item = store.get_active(task.root)?;
        (item.path.clone(), item.parent_id())
    };
    let dest_path = resolve_destination(&store, &task.actor, task.dest)?.path.clone();
    let new_root_path = dest_path.child(task.root);
    store.rewrite_path_prefix(&source_path, &new_root_path)?;
    if let Some(parent) = old_parent {
        store.remove_from_child_order(parent, task.root)?;
    }
    shared.events.send(Event::Moved {
        id: task.root,
        new_parent: dest_path.item_id()?,
    });
    Ok(ItemOutcome::Succeeded {
        new_path: Some(new_root_path),
        new_id: None,
    })
}

async fn apply_copy(shared: &Shared, task: &BulkTask) -> Result<ItemOutcome, HubError> {
    let mut store = shared.store.write().await;
    {
        let ledger = shared.ledger.read().await;
        validate_root(
            &shared.limits,
            &store,
            &ledger,
            OpKind::Copy,
            task.root,
            &task.actor,
            task.dest,
        )?;
    }
    let source_path = store.get_active(task.root)?.path.clone();
    let dest_path = resolve_destination(&store, &task.actor, task.dest)?.path.clone();

    // Snapshot the active subtree in path order, so every parent is copied
    // before its children.
    let mut originals: Vec<Item> = vec![store.get_active(task.root)?.clone()];
    originals.extend(store.get_descendants(&source_path, false).into_iter().cloned());

    let id_map: HashMap<Uuid, Uuid> = originals
        .iter()
        .map(|item| (item.id, Uuid::new_v4()))
        .collect();
    let root_name = store.disambiguate_name(&dest_path, &originals[0].name);
    let mut path_map: HashMap<Uuid, ItemPath> = HashMap::new();
    for original in &originals {
        let new_id = id_map[&original.id];
        let new_path = if original.id == task.root {
            dest_path.child(new_id)
        } else {
            let parent = original
                .parent_id()
                .ok_or_else(|| HubError::Integrity("descendant without a parent".into()))?;
            path_map
                .get(&parent)
                .ok_or_else(|| HubError::Integrity("child visited before its parent".into()))?
                .child(new_id)
        };
        path_map.insert(original.id, new_path.clone());
        let mut kind = original.kind.clone();
        if let ItemKind::Folder { child_order } = &mut kind {
            // Remap the explicit ordering onto the copied ids; references
            // to rows that were not copied drop out.
            *child_order = child_order
                .iter()
                .filter_map(|old| id_map.get(old).copied())
                .collect();
        }
        let name = if original.id == task.root {
            root_name.clone()
        } else {
            original.name.clone()
        };
        let mut copy = Item::new(new_id, new_path, name, task.actor.clone(), kind);
        copy.visibility = original.visibility;
        store.create(copy)?;
    }

    let new_root_id = id_map[&task.root];
    let new_root_path = path_map[&task.root].clone();
    {
        let mut ledger = shared.ledger.write().await;
        let inherited = ledger.effective_permission(&task.actor, &new_root_path)?;
        if inherited != Some(PermissionLevel::Admin) {
            ledger.grant(&task.actor, new_root_id, PermissionLevel::Admin)?;
        }
    }
    shared.events.send(Event::Copied {
        id: task.root,
        new_id: new_root_id,
    });
    Ok(ItemOutcome::Succeeded {
        new_path: Some(new_root_path),
        new_id: Some(new_root_id),
    })
}

async fn apply_delete(shared: &Shared, task: &BulkTask) -> Result<ItemOutcome, HubError> {
    let mut store = shared.store.write().await;
    {
        let ledger = shared.ledger.read().await;
        validate_root(
            &shared.limits,
            &store,
            &ledger,
            OpKind::Delete,
            task.root,
            &task.actor,
            task.dest,
        )?;
    }
    let path = store.get_active(task.root)?.path.clone();
    store.soft_delete(&path)?;
    shared.events.send(Event::Deleted { id: task.root });
    Ok(ItemOutcome::Succeeded {
        new_path: None,
        new_id: None,
    })
}

async fn apply_restore(shared: &Shared, task: &BulkTask) -> Result<ItemOutcome, HubError> {
    let mut store = shared.store.write().await;
    {
        let ledger = shared.ledger.read().await;
        validate_root(
            &shared.limits,
            &store,
            &ledger,
            OpKind::Restore,
            task.root,
            &task.actor,
            task.dest,
        )?;
    }
    let path = store
        .get(task.root)
        .ok_or(HubError::NotFound(task.root))?
        .path
        .clone();
    store.restore(&path)?;
    shared.events.send(Event::Restored { id: task.root });
    Ok(ItemOutcome::Succeeded {
        new_path: None,
        new_id: None,
    })
}

async fn apply_purge(shared: &Shared, task: &BulkTask) -> Result<ItemOutcome, HubError> {
    let mut store = shared.store.write().await;
    let mut ledger = shared.ledger.write().await;
    validate_root(
        &shared.limits,
        &store,
        &ledger,
        OpKind::Purge,
        task.root,
        &task.actor,
        task.dest,
    )?;
    let (path, parent) = {
        let item = store.get(task.root).ok_or(HubError::NotFound(task.root))?;
        (item.path.clone(), item.parent_id())
    };
    let removed = store.hard_delete_subtree(&path)?;
    ledger.purge_items(&removed)?;
    if let Some(parent) = parent {
        store.remove_from_child_order(parent, task.root)?;
    }
    shared.events.send(Event::Purged { id: task.root });
    Ok(ItemOutcome::Succeeded {
        new_path: None,
        new_id: None,
    })
}
