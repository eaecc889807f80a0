#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::item::{Item, ItemKind};
    use crate::path::ItemPath;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn folder(store: &mut ItemStore, parent: &ItemPath, name: &str, owner: &str) -> Uuid {
        let id = Uuid::new_v4();
        let item = Item::new(
            id,
            parent.child(id),
            name.to_string(),
            owner.to_string(),
            ItemKind::folder(),
        );
        store.create(item).unwrap();
        id
    }

    fn document(store: &mut ItemStore, parent: &ItemPath, name: &str, owner: &str) -> Uuid {
        let id = Uuid::new_v4();
        let item = Item::new(
            id,
            parent.child(id),
            name.to_string(),
            owner.to_string(),
            ItemKind::Document {
                body: String::new(),
            },
        );
        store.create(item).unwrap();
        id
    }

    fn path_of(store: &ItemStore, id: Uuid) -> ItemPath {
        store.get(id).unwrap().path.clone()
    }

    #[test]
    fn create_rejects_duplicate_paths() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let child = folder(&mut store, &root_path, "a", "alice");
        let dup = Item::new(
            Uuid::new_v4(),
            path_of(&store, child),
            "clone".to_string(),
            "alice".to_string(),
            ItemKind::folder(),
        );
        assert!(matches!(
            store.create(dup),
            Err(HubError::DuplicatePath(_))
        ));
    }

    #[test]
    fn create_requires_existing_parent_row() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let orphan_parent = ItemPath::root(Uuid::new_v4());
        let id = Uuid::new_v4();
        let item = Item::new(
            id,
            orphan_parent.child(id),
            "orphan".to_string(),
            "alice".to_string(),
            ItemKind::folder(),
        );
        assert!(matches!(store.create(item), Err(HubError::Integrity(_))));
    }

    #[test]
    fn children_follow_explicit_order_then_creation_order() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let a = document(&mut store, &root_path, "a", "alice");
        let b = document(&mut store, &root_path, "b", "alice");
        let c = document(&mut store, &root_path, "c", "alice");

        store.set_child_order(root, vec![c, a]).unwrap();
        let ordered: Vec<Uuid> = store
            .get_children(&root_path, true)
            .iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ordered, vec![c, a, b]);

        let unordered: Vec<Uuid> = store
            .get_children(&root_path, false)
            .iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(unordered, vec![a, b, c]);
    }

    #[test]
    fn set_child_order_rejects_non_children() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        folder(&mut store, &root_path, "a", "alice");
        assert!(matches!(
            store.set_child_order(root, vec![Uuid::new_v4()]),
            Err(HubError::Unsupported(_))
        ));
    }

    #[test]
    fn descendant_count_skips_soft_deleted() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let sub = folder(&mut store, &root_path, "sub", "alice");
        let sub_path = path_of(&store, sub);
        for n in 0..5 {
            document(&mut store, &sub_path, &format!("doc{n}"), "alice");
        }
        assert_eq!(store.descendant_count(&root_path), 6);

        let doc = store.get_children(&sub_path, false)[0].id;
        let doc_path = path_of(&store, doc);
        store.soft_delete(&doc_path).unwrap();
        assert_eq!(store.descendant_count(&root_path), 5);
        assert_eq!(store.descendant_count_with_deleted(&root_path), 6);
    }

    #[test]
    fn rewrite_path_prefix_relocates_whole_subtree() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let src = folder(&mut store, &root_path, "src", "alice");
        let src_path = path_of(&store, src);
        let inner = folder(&mut store, &src_path, "inner", "alice");
        let inner_path = path_of(&store, inner);
        let leaf = document(&mut store, &inner_path, "leaf", "alice");
        let dest = folder(&mut store, &root_path, "dest", "alice");
        let dest_path = path_of(&store, dest);

        let new_src_path = dest_path.child(src);
        let touched = store.rewrite_path_prefix(&src_path, &new_src_path).unwrap();
        assert_eq!(touched, 3);

        let moved_leaf = store.get(leaf).unwrap();
        assert!(moved_leaf.path.is_descendant_or_self(&new_src_path));
        assert_eq!(moved_leaf.depth(), 4);
        assert_eq!(store.get(inner).unwrap().parent_id(), Some(src));
        assert!(store.get_by_path(&src_path).is_none());
    }

    #[test]
    fn soft_delete_then_restore_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let sub = folder(&mut store, &root_path, "sub", "alice");
        let sub_path = path_of(&store, sub);
        let early = document(&mut store, &sub_path, "early", "alice");
        let late = document(&mut store, &sub_path, "late", "alice");

        // one child independently deleted before the subtree goes
        let early_path = path_of(&store, early);
        store.soft_delete(&early_path).unwrap();
        let marked = store.soft_delete(&sub_path).unwrap();
        assert_eq!(marked, 2);
        assert!(store.get_active(sub).is_err());
        assert!(store.get_active(late).is_err());
        assert!(store.get_descendants(&root_path, false).is_empty());

        let cleared = store.restore(&sub_path).unwrap();
        assert_eq!(cleared, 3);
        assert!(store.get_active(sub).is_ok());
        assert!(store.get_active(early).is_ok());
        assert!(store.get_active(late).is_ok());
    }

    #[test]
    fn hard_delete_removes_rows_and_records() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        let sub = folder(&mut store, &root_path, "sub", "alice");
        let sub_path = path_of(&store, sub);
        let doc = document(&mut store, &sub_path, "doc", "alice");

        let removed = store.hard_delete_subtree(&sub_path).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&sub) && removed.contains(&doc));
        assert!(store.get(sub).is_none());
        assert!(store.get(doc).is_none());
        assert_eq!(store.descendant_count(&root_path), 0);
    }

    #[test]
    fn store_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let (root, sub, doc);
        {
            let mut store = ItemStore::open(dir.path()).unwrap();
            root = store.ensure_root("alice").unwrap();
            let root_path = path_of(&store, root);
            sub = folder(&mut store, &root_path, "sub", "alice");
            let sub_path = path_of(&store, sub);
            doc = document(&mut store, &sub_path, "doc", "alice");
        }
        let store = ItemStore::open(dir.path()).unwrap();
        assert_eq!(store.root_of("alice"), Some(root));
        assert_eq!(store.get(doc).unwrap().parent_id(), Some(sub));
        let root_path = path_of(&store, root);
        assert_eq!(store.descendant_count(&root_path), 2);
    }

    #[test]
    fn disambiguate_name_appends_suffix() {
        let dir = TempDir::new().unwrap();
        let mut store = ItemStore::open(dir.path()).unwrap();
        let root = store.ensure_root("alice").unwrap();
        let root_path = path_of(&store, root);
        document(&mut store, &root_path, "notes", "alice");
        assert_eq!(store.disambiguate_name(&root_path, "other"), "other");
        assert_eq!(store.disambiguate_name(&root_path, "notes"), "notes (2)");
        document(&mut store, &root_path, "notes (2)", "alice");
        assert_eq!(store.disambiguate_name(&root_path, "notes"), "notes (3)");
    }
}
