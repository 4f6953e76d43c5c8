//! End-to-end scenarios from `spec.md` §8 ("Concrete end-to-end scenarios")
//! and a few of the quantified testable properties that are easiest
//! verified as whole-database round trips rather than unit tests.

use pstore::database::OpenOptions;
use pstore::hamt::HamtIndex;
use pstore::Error;

/// S1: a single scalar allocated, written, and committed is visible to a
/// fresh read of the same address.
#[test]
fn s1_single_insert_commit_round_trips_scalar() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let addr = {
        let mut txn = db.begin().unwrap();
        let (value, addr) = txn.alloc_rw::<i32>().unwrap();
        *value = 32749;
        let addr = addr.to_address();
        txn.commit().unwrap();
        addr
    };
    assert_eq!(db.current_revision(), 1);
    let bytes = db.getro(addr, 4).unwrap();
    assert_eq!(i32::from_ne_bytes(bytes.try_into().unwrap()), 32749);
}

/// S2: rolling back an open transaction leaves the database exactly as it
/// was: same revision, same footer.
#[test]
fn s2_rollback_leaves_database_unchanged() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let footer_before = db.footer_pos();
    let revision_before = db.current_revision();
    {
        let mut txn = db.begin().unwrap();
        let (value, _addr) = txn.alloc_rw::<i32>().unwrap();
        *value = 42;
        txn.rollback().unwrap();
    }
    assert_eq!(db.footer_pos(), footer_before);
    assert_eq!(db.current_revision(), revision_before);
}

/// Dropping an open transaction without an explicit commit or rollback
/// behaves the same as an explicit rollback (`spec.md` §4.3's "Rolled-back"
/// state is entered on unwinding, not just on an explicit call).
#[test]
fn dropping_open_transaction_rolls_back() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let revision_before = db.current_revision();
    {
        let mut txn = db.begin().unwrap();
        let (value, _addr) = txn.alloc_rw::<i32>().unwrap();
        *value = 7;
        // txn dropped here without commit/rollback
    }
    assert_eq!(db.current_revision(), revision_before);
    // The write lock must have been released, or this would block forever.
    let _txn = db.begin().unwrap();
}

/// S3: across two committed revisions, `sync` restores exactly the entries
/// reachable as of the requested generation.
#[test]
fn s3_two_revisions_sync_restores_point_in_time_view() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let mut index = HamtIndex::new_empty(db.current_revision());

    let header_r1 = {
        let mut txn = db.begin().unwrap();
        index.insert(&mut txn, b"key0", b"doesn't change").unwrap();
        index.insert(&mut txn, b"key1", b"first").unwrap();
        let header = index.flush(&mut txn).unwrap();
        txn.commit().unwrap();
        header
    };
    assert_eq!(db.current_revision(), 1);

    let header_r2 = {
        let mut txn = db.begin().unwrap();
        index.insert_or_assign(&mut txn, b"key1", b"second").unwrap();
        let header = index.flush(&mut txn).unwrap();
        txn.commit().unwrap();
        header
    };
    assert_eq!(db.current_revision(), 2);

    // Still-live index handle sees the latest state directly.
    assert_eq!(index.find(&db, b"key1").unwrap().as_deref(), Some(&b"second"[..]));

    db.sync(2).unwrap();
    let at_r2 = HamtIndex::load(&db, header_r2).unwrap();
    assert_eq!(at_r2.find(&db, b"key1").unwrap().as_deref(), Some(&b"second"[..]));

    db.sync(1).unwrap();
    let at_r1 = HamtIndex::load(&db, header_r1).unwrap();
    assert_eq!(at_r1.find(&db, b"key1").unwrap().as_deref(), Some(&b"first"[..]));
    assert_eq!(at_r1.find(&db, b"key0").unwrap().as_deref(), Some(&b"doesn't change"[..]));

    db.sync(0).unwrap();
    assert!(db.primary_index_header().is_null());
}

/// Property 2: `current_revision` after N successful commits equals the
/// pre-existing value plus N.
#[test]
fn revision_advances_by_exactly_one_per_commit() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let mut index = HamtIndex::new_empty(db.current_revision());
    let start = db.current_revision();
    for i in 0..5u32 {
        let mut txn = db.begin().unwrap();
        let k = format!("k{i}");
        index.insert(&mut txn, k.as_bytes(), b"v").unwrap();
        index.flush(&mut txn).unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(db.current_revision(), start + 5);
}

/// Property 4 / 5 / 6: insert-then-find, and the differing semantics of
/// `insert` (keeps the first value) versus `insert_or_assign` (overwrites).
#[test]
fn insert_and_upsert_semantics_differ() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let mut index = HamtIndex::new_empty(db.current_revision());
    let mut txn = db.begin().unwrap();

    assert!(index.insert(&mut txn, b"k", b"v0").unwrap());
    assert!(index.contains(&txn, b"k").unwrap());

    assert!(!index.insert(&mut txn, b"k", b"v1").unwrap());
    assert_eq!(index.find(&txn, b"k").unwrap().as_deref(), Some(&b"v0"[..]));

    assert!(!index.insert_or_assign(&mut txn, b"k", b"v2").unwrap());
    assert_eq!(index.find(&txn, b"k").unwrap().as_deref(), Some(&b"v2"[..]));
}

/// Opening an existing file-backed store recovers the header, uuid, and
/// current revision written by a prior process.
#[test]
fn reopening_an_existing_file_recovers_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.pstore");

    let (uuid, header) = {
        let mut db = OpenOptions::new().open(&path).unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        index.insert(&mut txn, b"durable", b"yes").unwrap();
        let header = index.flush(&mut txn).unwrap();
        txn.commit().unwrap();
        (db.uuid(), header)
    };

    let db2 = OpenOptions::new().open(&path).unwrap();
    assert_eq!(db2.uuid(), uuid);
    assert_eq!(db2.current_revision(), 1);
    let index = HamtIndex::load(&db2, header).unwrap();
    assert_eq!(index.find(&db2, b"durable").unwrap().as_deref(), Some(&b"yes"[..]));
}

/// `sync` to a generation that was never committed fails distinctly from
/// corruption.
#[test]
fn sync_to_never_committed_generation_fails() {
    let mut db = OpenOptions::new().open_anon().unwrap();
    let err = db.sync(42).unwrap_err();
    assert!(matches!(err, Error::UnknownRevision(42)));
}
