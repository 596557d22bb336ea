//! Unit tests for mem ordering and lower-bound positioning.

#[allow(non_snake_case)]
mod tests {
    use crate::mem::{Mem, MemError};
    use crate::stmt::{CmpDef, Statement, StatementRef, Tuple};

    fn mem() -> Mem {
        Mem::new(1, CmpDef::new(1))
    }

    fn replace(key: &[u8], value: &[u8], lsn: i64) -> StatementRef {
        Statement::replace(Tuple::new(vec![key.to_vec(), value.to_vec()]), lsn)
    }

    fn key(key: &[u8]) -> Vec<Vec<u8>> {
        vec![key.to_vec()]
    }

    // ================================================================
    // Insert / bookkeeping
    // ================================================================

    #[test]
    fn mem__insert_tracks_lsn_bounds() {
        let mem = mem();
        assert!(mem.is_empty());
        assert_eq!(mem.min_lsn(), None);

        mem.insert(replace(b"a", b"v", 5)).unwrap();
        mem.insert(replace(b"b", b"v", 9)).unwrap();
        mem.insert(replace(b"a", b"v2", 7)).unwrap();

        assert_eq!(mem.len(), 3);
        assert_eq!(mem.min_lsn(), Some(5));
        assert_eq!(mem.max_lsn(), Some(9));
    }

    #[test]
    fn mem__insert_rejects_short_key() {
        let mem = Mem::new(1, CmpDef::new(2));
        let stmt = Statement::replace(Tuple::new(vec![b"only".to_vec()]), 1);
        let err = mem.insert(stmt).unwrap_err();
        assert!(matches!(err, MemError::KeyTooShort { required: 2, actual: 1 }));
    }

    // ================================================================
    // Ordering: key ASC, LSN DESC
    // ================================================================

    #[test]
    fn mem__stmts_in_order_is_key_asc_lsn_desc() {
        let mem = mem();
        mem.insert(replace(b"b", b"v", 1)).unwrap();
        mem.insert(replace(b"a", b"old", 2)).unwrap();
        mem.insert(replace(b"a", b"new", 8)).unwrap();
        mem.insert(replace(b"b", b"v", 4)).unwrap();

        let stmts = mem.stmts_in_order().unwrap();
        let seen: Vec<(Vec<u8>, i64)> = stmts
            .iter()
            .map(|s| (s.tuple().field(0).unwrap().to_vec(), s.lsn()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 8),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 4),
                (b"b".to_vec(), 1),
            ]
        );
    }

    // ================================================================
    // Lower bound
    // ================================================================

    #[test]
    fn mem__lower_bound_hits_newest_visible() {
        let mem = mem();
        mem.insert(replace(b"k", b"v10", 10)).unwrap();
        mem.insert(replace(b"k", b"v20", 20)).unwrap();
        mem.insert(replace(b"k", b"v30", 30)).unwrap();

        let reader = mem.read().unwrap();

        // At vlsn 25 the newest visible version is lsn 20.
        let cursor = reader.lower_bound(&key(b"k"), 25);
        assert_eq!(cursor.stmt().unwrap().lsn(), 20);

        // At the latest view, the newest version wins.
        let cursor = reader.lower_bound(&key(b"k"), i64::MAX);
        assert_eq!(cursor.stmt().unwrap().lsn(), 30);

        // An exact vlsn match is visible (lsn ≤ vlsn).
        let cursor = reader.lower_bound(&key(b"k"), 20);
        assert_eq!(cursor.stmt().unwrap().lsn(), 20);
    }

    #[test]
    fn mem__lower_bound_skips_to_next_key_when_all_invisible() {
        let mem = mem();
        mem.insert(replace(b"a", b"v", 50)).unwrap();
        mem.insert(replace(b"b", b"v", 3)).unwrap();

        // Every version of "a" is newer than vlsn 10; the cursor lands
        // on "b". Callers detect this with a key comparison.
        let reader = mem.read().unwrap();
        let cursor = reader.lower_bound(&key(b"a"), 10);
        let stmt = cursor.stmt().unwrap();
        assert_eq!(stmt.tuple().field(0).unwrap(), b"b");
    }

    #[test]
    fn mem__lower_bound_walks_descending_lsn_run() {
        let mem = mem();
        mem.insert(replace(b"k", b"v1", 1)).unwrap();
        mem.insert(replace(b"k", b"v2", 2)).unwrap();
        mem.insert(replace(b"k", b"v3", 3)).unwrap();
        mem.insert(replace(b"z", b"v", 9)).unwrap();

        let reader = mem.read().unwrap();
        let mut cursor = reader.lower_bound(&key(b"k"), i64::MAX);
        let mut lsns = Vec::new();
        while let Some(stmt) = cursor.stmt() {
            if stmt.tuple().field(0).unwrap() != b"k" {
                break;
            }
            lsns.push(stmt.lsn());
            cursor.next();
        }
        assert_eq!(lsns, vec![3, 2, 1]);
    }

    #[test]
    fn mem__lower_bound_on_empty_mem_is_invalid() {
        let mem = mem();
        let reader = mem.read().unwrap();
        let cursor = reader.lower_bound(&key(b"k"), i64::MAX);
        assert!(!cursor.valid());
        assert!(cursor.stmt().is_none());
    }
}
