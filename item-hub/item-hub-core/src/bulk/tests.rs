#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::events::RecordingSink;
    use crate::item::Visibility;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RwLock<ItemStore>>,
        ledger: Arc<RwLock<PermissionLedger>>,
        sink: Arc<RecordingSink>,
        events: EventBus,
        coordinator: Coordinator,
    }

    async fn fixture(limits: TreeLimits) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RwLock::new(ItemStore::open(dir.path()).unwrap()));
        let ledger = Arc::new(RwLock::new(PermissionLedger::open(dir.path()).unwrap()));
        let sink = Arc::new(RecordingSink::new());
        let events = EventBus::new();
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            limits,
            events.clone(),
            sink.clone() as Arc<dyn NotificationSink>,
            2,
            16,
        );
        Fixture {
            _dir: dir,
            store,
            ledger,
            sink,
            events,
            coordinator,
        }
    }

    /// Root folder for `owner`, with the implicit Admin grant a create
    /// through the API would have written.
    async fn bootstrap(fx: &Fixture, owner: &str) -> (Uuid, ItemPath) {
        let root = fx.store.write().await.ensure_root(owner).unwrap();
        fx.ledger
            .write()
            .await
            .grant(owner, root, PermissionLevel::Admin)
            .unwrap();
        let path = fx.store.read().await.get(root).unwrap().path.clone();
        (root, path)
    }

    async fn folder(fx: &Fixture, parent: &ItemPath, name: &str, owner: &str) -> (Uuid, ItemPath) {
        let id = Uuid::new_v4();
        let path = parent.child(id);
        fx.store
            .write()
            .await
            .create(Item::new(
                id,
                path.clone(),
                name.to_string(),
                owner.to_string(),
                ItemKind::folder(),
            ))
            .unwrap();
        (id, path)
    }

    async fn document(fx: &Fixture, parent: &ItemPath, name: &str, owner: &str) -> (Uuid, ItemPath) {
        let id = Uuid::new_v4();
        let path = parent.child(id);
        fx.store
            .write()
            .await
            .create(Item::new(
                id,
                path.clone(),
                name.to_string(),
                owner.to_string(),
                ItemKind::Document {
                    body: String::new(),
                },
            ))
            .unwrap();
        (id, path)
    }

    async fn path_of(fx: &Fixture, id: Uuid) -> ItemPath {
        fx.store.read().await.get(id).unwrap().path.clone()
    }

    #[tokio::test]
    async fn move_relocates_subtree_and_preserves_shape() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (inner, inner_path) = folder(&fx, &x_path, "inner", "alice").await;
        let (leaf, _) = document(&fx, &inner_path, "leaf", "alice").await;
        let (y, _y_path) = folder(&fx, &root_path, "y", "alice").await;

        let mut rx = fx.events.subscribe();
        let disposition = fx.coordinator.move_items("alice", &[x], Some(y)).await.unwrap();
        assert!(!disposition.asynchronous);
        assert_eq!(disposition.accepted, vec![x]);
        assert!(disposition.rejected.is_empty());
        assert!(disposition.completed[0].outcome.is_success());

        let y_path = path_of(&fx, y).await;
        let new_x_path = path_of(&fx, x).await;
        assert_eq!(new_x_path, y_path.child(x));
        let new_leaf_path = path_of(&fx, leaf).await;
        assert!(new_leaf_path.is_descendant_or_self(&new_x_path));
        assert_eq!(new_leaf_path.depth(), new_x_path.depth() + 2);
        let store = fx.store.read().await;
        assert_eq!(store.get(inner).unwrap().parent_id(), Some(x));
        assert_eq!(store.get(leaf).unwrap().parent_id(), Some(inner));
        drop(store);

        let moved = loop {
            match rx.try_recv().unwrap() {
                Event::Moved { id, new_parent } => break (id, new_parent),
                _ => continue,
            }
        };
        assert_eq!(moved, (x, y));
    }

    #[tokio::test]
    async fn move_into_own_descendant_is_rejected_with_cycle() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (child, _) = folder(&fx, &x_path, "child", "alice").await;

        let disposition = fx
            .coordinator
            .move_items("alice", &[x], Some(child))
            .await
            .unwrap();
        assert!(disposition.accepted.is_empty());
        assert_eq!(disposition.rejected[0].reason, HubError::Cycle);
        // tree unchanged
        assert_eq!(path_of(&fx, x).await, x_path);
    }

    #[tokio::test]
    async fn move_requires_admin_on_the_source() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, _) = folder(&fx, &root_path, "x", "alice").await;
        let (y, _) = folder(&fx, &root_path, "y", "alice").await;
        fx.ledger
            .write()
            .await
            .grant("bob", x, PermissionLevel::Write)
            .unwrap();
        fx.ledger
            .write()
            .await
            .grant("bob", y, PermissionLevel::Write)
            .unwrap();

        let disposition = fx.coordinator.move_items("bob", &[x], Some(y)).await.unwrap();
        assert_eq!(
            disposition.rejected[0].reason,
            HubError::Forbidden {
                required: PermissionLevel::Admin
            }
        );
    }

    #[tokio::test]
    async fn copy_isolates_the_duplicate_from_the_original() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (inner, inner_path) = folder(&fx, &x_path, "inner", "alice").await;
        let (leaf, _) = document(&fx, &inner_path, "leaf", "alice").await;
        let (y, _) = folder(&fx, &root_path, "y", "alice").await;

        let disposition = fx.coordinator.copy_items("alice", &[x], Some(y)).await.unwrap();
        let ItemOutcome::Succeeded {
            new_id: Some(new_root),
            new_path: Some(new_root_path),
        } = disposition.completed[0].outcome.clone()
        else {
            panic!("copy did not succeed");
        };

        let store = fx.store.read().await;
        let copied: Vec<Uuid> = store
            .subtree_ids(&new_root_path)
            .into_iter()
            .collect();
        assert_eq!(copied.len(), 3);
        for id in &copied {
            assert!(![x, inner, leaf].contains(id));
        }
        drop(store);

        // the copying actor holds Admin at the copy root only
        let ledger = fx.ledger.read().await;
        assert_eq!(
            ledger.effective_permission("alice", &new_root_path).unwrap(),
            Some(PermissionLevel::Admin)
        );
        assert_eq!(ledger.grants_for_item(new_root).len(), 1);
        drop(ledger);

        // deleting the original leaves the copy untouched
        fx.coordinator.delete_items("alice", &[x]).await.unwrap();
        let store = fx.store.read().await;
        assert!(store.get_active(x).is_err());
        assert!(store.get_active(new_root).is_ok());
        assert_eq!(store.descendant_count(&new_root_path), 2);
    }

    #[tokio::test]
    async fn copy_disambiguates_a_same_named_sibling() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, _) = folder(&fx, &root_path, "x", "alice").await;

        // copy next to the original: same parent, same name
        let disposition = fx.coordinator.copy_items("alice", &[x], None).await.unwrap();
        let ItemOutcome::Succeeded {
            new_id: Some(new_root),
            ..
        } = disposition.completed[0].outcome.clone()
        else {
            panic!("copy did not succeed");
        };
        assert_eq!(fx.store.read().await.get(new_root).unwrap().name, "x (2)");
    }

    #[tokio::test]
    async fn copy_remaps_the_explicit_child_order() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (a, _) = document(&fx, &x_path, "a", "alice").await;
        let (b, _) = document(&fx, &x_path, "b", "alice").await;
        fx.store.write().await.set_child_order(x, vec![b, a]).unwrap();
        let (y, _) = folder(&fx, &root_path, "y", "alice").await;

        let disposition = fx.coordinator.copy_items("alice", &[x], Some(y)).await.unwrap();
        let ItemOutcome::Succeeded {
            new_path: Some(new_root_path),
            ..
        } = disposition.completed[0].outcome.clone()
        else {
            panic!("copy did not succeed");
        };

        let store = fx.store.read().await;
        let ordered: Vec<String> = store
            .get_children(&new_root_path, true)
            .iter()
            .map(|item| item.name.clone())
            .collect();
        assert_eq!(ordered, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn delete_then_restore_revives_the_whole_subtree() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (early, early_path) = document(&fx, &x_path, "early", "alice").await;
        let (late, _) = document(&fx, &x_path, "late", "alice").await;

        // one child independently deleted first
        fx.store.write().await.soft_delete(&early_path).unwrap();
        let disposition = fx.coordinator.delete_items("alice", &[x]).await.unwrap();
        assert!(disposition.completed[0].outcome.is_success());
        {
            let store = fx.store.read().await;
            assert!(store.get_active(x).is_err());
            assert!(store.get_active(late).is_err());
        }

        let disposition = fx.coordinator.restore_items("alice", &[x]).await.unwrap();
        assert!(disposition.completed[0].outcome.is_success());
        let store = fx.store.read().await;
        for id in [x, early, late] {
            assert!(store.get_active(id).is_ok());
        }
    }

    #[tokio::test]
    async fn delete_limit_uses_the_descendant_count() {
        let mut limits = TreeLimits::default();
        limits.max_descendants_delete = 5;
        let fx = fixture(limits).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (top, top_path) = folder(&fx, &root_path, "top", "alice").await;
        let (sub, sub_path) = folder(&fx, &top_path, "sub", "alice").await;
        for n in 0..5 {
            document(&fx, &sub_path, &format!("doc{n}"), "alice").await;
        }
        assert_eq!(fx.store.read().await.descendant_count(&top_path), 6);

        let disposition = fx.coordinator.delete_items("alice", &[top]).await.unwrap();
        assert!(matches!(
            disposition.rejected[0].reason,
            HubError::LimitExceeded {
                limit: LimitKind::DeleteSubtree,
                actual: 6,
                max: 5,
            }
        ));
        assert!(fx.store.read().await.get_active(top).is_ok());
        // the small subtree alone still deletes fine
        let disposition = fx.coordinator.delete_items("alice", &[sub]).await.unwrap();
        assert!(disposition.completed[0].outcome.is_success());
    }

    #[tokio::test]
    async fn depth_limit_considers_the_deepest_descendant() {
        let mut limits = TreeLimits::default();
        limits.max_tree_levels = 4;
        let fx = fixture(limits).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        // tall: a subtree occupying two levels
        let (tall, tall_path) = folder(&fx, &root_path, "tall", "alice").await;
        folder(&fx, &tall_path, "tall-child", "alice").await;
        // deep: a parent already at depth 3
        let (mid, mid_path) = folder(&fx, &root_path, "mid", "alice").await;
        let (deep, _) = folder(&fx, &mid_path, "deep", "alice").await;

        // tall root itself would land at depth 4, but its child would be at 5
        let disposition = fx
            .coordinator
            .move_items("alice", &[tall], Some(deep))
            .await
            .unwrap();
        assert!(matches!(
            disposition.rejected[0].reason,
            HubError::LimitExceeded {
                limit: LimitKind::TreeDepth,
                ..
            }
        ));
        assert_eq!(path_of(&fx, tall).await, tall_path);
    }

    #[tokio::test]
    async fn batch_isolation_rejects_one_root_and_completes_the_rest() {
        let mut limits = TreeLimits::default();
        limits.max_descendants_move = 1;
        limits.sync_apply_threshold = 0; // force the worker pool
        let fx = fixture(limits).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (a, _) = folder(&fx, &root_path, "a", "alice").await;
        let (b, b_path) = folder(&fx, &root_path, "b", "alice").await;
        folder(&fx, &b_path, "b1", "alice").await;
        folder(&fx, &b_path, "b2", "alice").await;
        let (c, _) = folder(&fx, &root_path, "c", "alice").await;
        let (dest, dest_path) = folder(&fx, &root_path, "dest", "alice").await;

        let disposition = fx
            .coordinator
            .move_items("alice", &[a, b, c], Some(dest))
            .await
            .unwrap();
        assert!(disposition.asynchronous);
        assert_eq!(disposition.accepted, vec![a, c]);
        assert_eq!(disposition.rejected.len(), 1);
        assert_eq!(disposition.rejected[0].id, b);
        assert!(matches!(
            disposition.rejected[0].reason,
            HubError::LimitExceeded {
                limit: LimitKind::MoveSubtree,
                ..
            }
        ));

        fx.coordinator.drain().await;
        let feedback = fx.sink.snapshot();
        assert_eq!(feedback.len(), 2);
        assert!(feedback.iter().all(|entry| entry.outcome.is_success()));

        let store = fx.store.read().await;
        assert!(store.get(a).unwrap().path.is_descendant_or_self(&dest_path));
        assert!(store.get(c).unwrap().path.is_descendant_or_self(&dest_path));
        assert_eq!(store.get(b).unwrap().path, b_path);
    }

    #[tokio::test]
    async fn async_batches_report_exactly_once_per_root() {
        let mut limits = TreeLimits::default();
        limits.sync_apply_threshold = 0;
        let fx = fixture(limits).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let mut roots = Vec::new();
        for n in 0..5 {
            let (id, _) = folder(&fx, &root_path, &format!("f{n}"), "alice").await;
            roots.push(id);
        }

        let disposition = fx.coordinator.delete_items("alice", &roots).await.unwrap();
        assert!(disposition.asynchronous);
        assert!(disposition.completed.is_empty());
        assert_eq!(disposition.accepted.len(), 5);

        fx.coordinator.drain().await;
        let feedback = fx.sink.take();
        assert_eq!(feedback.len(), 5);
        let mut reported: Vec<Uuid> = feedback.iter().map(|entry| entry.item_id).collect();
        reported.sort();
        let mut expected = roots.clone();
        expected.sort();
        assert_eq!(reported, expected);
        assert!(feedback
            .iter()
            .all(|entry| entry.op == OpKind::Delete && entry.outcome.is_success()));
    }

    #[tokio::test]
    async fn batch_size_cap_rejects_the_whole_request() {
        let mut limits = TreeLimits::default();
        limits.max_targets_per_request = 2;
        let fx = fixture(limits).await;
        bootstrap(&fx, "alice").await;
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let result = fx.coordinator.delete_items("alice", &ids).await;
        assert!(matches!(
            result,
            Err(HubError::LimitExceeded {
                limit: LimitKind::BatchSize,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn child_count_limit_blocks_the_destination() {
        let mut limits = TreeLimits::default();
        limits.max_children = 2;
        let fx = fixture(limits).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (full, full_path) = folder(&fx, &root_path, "full", "alice").await;
        document(&fx, &full_path, "a", "alice").await;
        document(&fx, &full_path, "b", "alice").await;
        let (loose, _) = document(&fx, &root_path, "loose", "alice").await;

        let disposition = fx
            .coordinator
            .move_items("alice", &[loose], Some(full))
            .await
            .unwrap();
        assert!(matches!(
            disposition.rejected[0].reason,
            HubError::LimitExceeded {
                limit: LimitKind::ChildCount,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn purge_removes_rows_and_their_grants() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, x_path) = folder(&fx, &root_path, "x", "alice").await;
        let (doc, _) = document(&fx, &x_path, "doc", "alice").await;
        fx.ledger
            .write()
            .await
            .grant("bob", doc, PermissionLevel::Read)
            .unwrap();

        let disposition = fx.coordinator.purge_items("alice", &[x]).await.unwrap();
        assert!(disposition.completed[0].outcome.is_success());
        let store = fx.store.read().await;
        assert!(store.get(x).is_none());
        assert!(store.get(doc).is_none());
        drop(store);
        assert!(fx.ledger.read().await.grants_for_actor("bob").is_empty());
    }

    #[tokio::test]
    async fn visibility_allows_copy_but_not_delete() {
        let fx = fixture(TreeLimits::default()).await;
        let (_root, root_path) = bootstrap(&fx, "alice").await;
        let (x, _) = folder(&fx, &root_path, "x", "alice").await;
        fx.store
            .write()
            .await
            .set_visibility(x, Visibility::Public)
            .unwrap();
        let (_bob_root, _) = bootstrap(&fx, "bob").await;

        // public read is enough for a copy source, with bob's root as dest
        let disposition = fx.coordinator.copy_items("bob", &[x], None).await.unwrap();
        assert!(disposition.completed[0].outcome.is_success());

        // but never enough to delete
        let disposition = fx.coordinator.delete_items("bob", &[x]).await.unwrap();
        assert_eq!(
            disposition.rejected[0].reason,
            HubError::Forbidden {
                required: PermissionLevel::Admin
            }
        );
    }
}
