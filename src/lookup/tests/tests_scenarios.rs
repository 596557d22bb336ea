//! End-to-end point-lookup scenarios across all four tiers.
//!
//! ## Layer coverage
//! - `lookup__txw_*`: write-set tier interactions
//! - `lookup__mem_*`: mem tier semantics (deletes, folding)
//! - `lookup__disk_*`: run tier semantics and read-view clipping

#[allow(non_snake_case)]
mod tests {
    use std::sync::atomic::Ordering;

    use tempfile::TempDir;

    use crate::cache::CachedValue;
    use crate::lookup::tests::*;
    use crate::stmt::StmtKind;
    use crate::tx::{ReadView, TxManager};
    use crate::upsert::{field_int, int_field};

    // ================================================================
    // Scenario: TXW shadows everything
    // ================================================================

    #[test]
    fn lookup__txw_shadows_all_other_tiers() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"5", b"mem", 10)).unwrap();

        let mgr = TxManager::new();
        let tx = mgr.begin().unwrap();
        tx.put(&index, row(b"5", b"txw")).unwrap();

        let result = index
            .get(Some(&*tx), tx.read_view(), &key(b"5"))
            .unwrap()
            .expect("txw value visible");
        assert_eq!(value_of(&result), b"txw");

        // The fold contained uncommitted data; it must not have been
        // published for other readers.
        assert!(index.cache().get(&key_parts(b"5")).unwrap().is_none());
    }

    #[test]
    fn lookup__txw_delete_hides_committed_value() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"5", b"mem", 10)).unwrap();

        let mgr = TxManager::new();
        let tx = mgr.begin().unwrap();
        tx.delete(&index, key(b"5")).unwrap();

        assert!(index.get(Some(&*tx), tx.read_view(), &key(b"5")).unwrap().is_none());
    }

    #[test]
    fn lookup__txw_raw_upsert_folds_over_older_tiers() {
        // The write path normally pre-folds upserts, but a
        // first-write upsert reaches the lookup raw and must fold
        // over whatever the older tiers hold.
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(int_replace(b"5", 100, 10)).unwrap();

        let mgr = TxManager::new();
        let tx = mgr.begin().unwrap();
        tx.upsert(
            &index,
            int_row(b"5", 0),
            vec![crate::stmt::UpsertOp::Add { field: 1, delta: 11 }],
        )
        .unwrap();

        let result = index
            .get(Some(&*tx), tx.read_view(), &key(b"5"))
            .unwrap()
            .expect("folded value");
        assert_eq!(field_int(&value_of(&result)), Some(111));
    }

    // ================================================================
    // Scenario: delete is terminal and returns absent
    // ================================================================

    #[test]
    fn lookup__mem_delete_returns_absent_and_memoizes() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"5", b"old", 10)).unwrap();
        index.insert(delete(b"5", 20)).unwrap();

        let rv = ReadView::latest();
        assert!(index.get(None, &rv, &key(b"5")).unwrap().is_none());

        // The second lookup terminates at the cache tier: the mem
        // tier's scan counter must not move again.
        let mem_scans = index.stat().memory.lookup.load(Ordering::Relaxed);
        assert!(index.get(None, &rv, &key(b"5")).unwrap().is_none());
        assert_eq!(index.stat().memory.lookup.load(Ordering::Relaxed), mem_scans);

        // The memoized absence carries the delete's LSN.
        match index.cache().get(&key_parts(b"5")).unwrap() {
            Some(CachedValue::Statement(stmt)) => {
                assert_eq!(stmt.kind(), StmtKind::Delete);
                assert_eq!(stmt.lsn(), 20);
            }
            other => panic!("expected memoized delete, got {other:?}"),
        }
    }

    #[test]
    fn lookup__mem_cached_delete_invisible_to_older_view() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"5", b"old", 10)).unwrap();
        index.insert(delete(b"5", 20)).unwrap();

        // Populate the cache at the latest view.
        assert!(index.get(None, &ReadView::latest(), &key(b"5")).unwrap().is_none());

        // A reader before the delete still sees the old value.
        let result = index
            .get(None, &ReadView::fixed(15), &key(b"5"))
            .unwrap()
            .expect("old value visible at vlsn 15");
        assert_eq!(value_of(&result), b"old");
    }

    // ================================================================
    // Scenario: upsert fold across tiers
    // ================================================================

    #[test]
    fn lookup__disk_upsert_fold_across_three_tiers() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        // Run: REPLACE(v=0, lsn 5).
        index.insert(int_replace(b"5", 0, 5)).unwrap();
        index.dump_all().unwrap();

        // Sealed mem: UPSERT(+1, lsn 7).
        index.insert(add_upsert(b"5", 1, 7)).unwrap();
        index.rotate_mem().unwrap();

        // Active mem: UPSERT(+10, lsn 9).
        index.insert(add_upsert(b"5", 10, 9)).unwrap();

        let result = index
            .get(None, &ReadView::latest(), &key(b"5"))
            .unwrap()
            .expect("folded value");
        assert_eq!(field_int(&value_of(&result)), Some(11));
        assert_eq!(result.lsn(), 9, "fold result carries the newest delta's lsn");
        assert_eq!(index.stat().upsert_applied.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn lookup__disk_upsert_without_base_uses_insert_tuple() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index
            .insert(crate::stmt::Statement::upsert(
                int_row(b"5", 42),
                vec![crate::stmt::UpsertOp::Add { field: 1, delta: 1 }],
                3,
            ))
            .unwrap();

        let result = index
            .get(None, &ReadView::latest(), &key(b"5"))
            .unwrap()
            .expect("insert-tuple value");
        assert_eq!(field_int(&value_of(&result)), Some(42));
    }

    // ================================================================
    // Scenario: read-view clipping
    // ================================================================

    #[test]
    fn lookup__disk_read_view_clips_upserts() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        index.insert(int_replace(b"5", 0, 5)).unwrap();
        index.dump_all().unwrap();
        index.insert(add_upsert(b"5", 1, 7)).unwrap();
        index.rotate_mem().unwrap();
        index.insert(add_upsert(b"5", 10, 9)).unwrap();

        // At vlsn 6 both upserts are invisible.
        let result = index
            .get(None, &ReadView::fixed(6), &key(b"5"))
            .unwrap()
            .expect("base visible at vlsn 6");
        assert_eq!(field_int(&value_of(&result)), Some(0));

        // At vlsn 7 only the first upsert applies.
        let result = index
            .get(None, &ReadView::fixed(7), &key(b"5"))
            .unwrap()
            .expect("value at vlsn 7");
        assert_eq!(field_int(&value_of(&result)), Some(1));

        // Before the base nothing is visible.
        assert!(index.get(None, &ReadView::fixed(4), &key(b"5")).unwrap().is_none());
    }

    #[test]
    fn lookup__disk_delete_in_run_shadows_older_value() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"5", b"v", 3)).unwrap();
        index.insert(delete(b"5", 8)).unwrap();
        index.dump_all().unwrap();

        assert!(index.get(None, &ReadView::latest(), &key(b"5")).unwrap().is_none());

        let result = index
            .get(None, &ReadView::fixed(5), &key(b"5"))
            .unwrap()
            .expect("pre-delete value");
        assert_eq!(value_of(&result), b"v");
    }

    // ================================================================
    // Multi-key sanity around the EQ scan
    // ================================================================

    #[test]
    fn lookup__disk_neighbour_keys_do_not_leak() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        for i in 0..50i64 {
            index
                .insert(int_replace(format!("key_{i:03}").as_bytes(), i, i + 1))
                .unwrap();
        }
        index.dump_all().unwrap();

        for i in 0..50i64 {
            let result = index
                .get(None, &ReadView::latest(), &key(format!("key_{i:03}").as_bytes()))
                .unwrap()
                .expect("present key");
            assert_eq!(field_int(&value_of(&result)), Some(i));
        }
        assert!(
            index
                .get(None, &ReadView::latest(), &key(b"key_050"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn lookup__short_key_rejected() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        let empty_key = crate::stmt::Tuple::new(vec![]);
        let err = index.get(None, &ReadView::latest(), &empty_key).unwrap_err();
        assert!(matches!(
            err,
            crate::lookup::LookupError::KeyTooShort { required: 1, actual: 0 }
        ));
    }

    #[test]
    fn lookup__absent_key_memoized_as_negative_entry() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index.insert(replace(b"present", b"v", 1)).unwrap();

        assert!(index.get(None, &ReadView::latest(), &key(b"ghost")).unwrap().is_none());
        assert!(matches!(
            index.cache().get(&key_parts(b"ghost")).unwrap(),
            Some(CachedValue::Absent)
        ));
    }

    #[test]
    fn lookup__result_value_matches_after_dump_roundtrip() {
        // The same key resolved from mem before the dump and from
        // disk after it must agree byte for byte.
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        index
            .insert(replace(b"k", &int_field(777), 4))
            .unwrap();

        let rv = ReadView::fixed(100);
        let before = index.get(None, &rv, &key(b"k")).unwrap().expect("from mem");
        index.dump_all().unwrap();
        let after = index.get(None, &rv, &key(b"k")).unwrap().expect("from disk");
        assert_eq!(*before, *after);
    }
}
