use std::sync::mpsc;
use std::thread;

use mapkv::{
    Database, DatabaseOptions, Environment, Error, LockWait, PutMode, Transaction, WriteFlags,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().set_max_dbs(2).open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

fn all_pairs<T: Transaction>(txn: &T, db: Database) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.cursor(txn).unwrap();
    cursor
        .iter_start()
        .map(|item| {
            let (k, v) = item.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect()
}

#[test]
fn test_named_database_scenario() {
    let (_dir, env) = setup_test_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, Some("a"), DatabaseOptions::create()).unwrap();
    db.put(&mut txn, b"x", b"1", PutMode::Upsert).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"x").unwrap(), Some(&b"1"[..]));
    drop(txn);

    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"x", b"2", PutMode::Update).unwrap();
    db.put(&mut txn, b"y", b"3", PutMode::Insert).unwrap();
    assert!(matches!(
        db.put(&mut txn, b"y", b"4", PutMode::Insert),
        Err(Error::KeyExists)
    ));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"x").unwrap(), Some(&b"2"[..]));
    assert_eq!(db.get(&txn, b"y").unwrap(), Some(&b"3"[..]));
    assert_eq!(db.stat(&txn).unwrap().entries, 2);
}

#[test]
fn test_abort_restores_state() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, DatabaseOptions::default()).unwrap();
    for i in 0..200u32 {
        db.put(&mut txn, format!("k{:03}", i).as_bytes(), b"v", WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let before_stat = env.stat().unwrap();
    let before_info = env.info().unwrap();
    let before = all_pairs(&env.begin_ro_txn().unwrap(), db);

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..100u32 {
        db.del(&mut txn, format!("k{:03}", i * 2).as_bytes(), None)
            .unwrap();
    }
    for i in 0..300u32 {
        db.put(&mut txn, format!("new{:03}", i).as_bytes(), &[7u8; 100], WriteFlags::empty())
            .unwrap();
    }
    assert_ne!(db.stat(&txn).unwrap().entries, before.len());
    txn.abort();

    assert_eq!(env.stat().unwrap(), before_stat);
    assert_eq!(env.info().unwrap().last_txnid, before_info.last_txnid);
    assert_eq!(all_pairs(&env.begin_ro_txn().unwrap(), db), before);

    // dropping an unfinished transaction aborts it as well
    {
        let mut txn = env.begin_rw_txn().unwrap();
        db.put(&mut txn, b"ghost", b"boo", WriteFlags::empty()).unwrap();
    }
    assert_eq!(all_pairs(&env.begin_ro_txn().unwrap(), db), before);
}

#[test]
fn test_abort_releases_created_database() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    Database::open(&txn, Some("temp"), DatabaseOptions::create()).unwrap();
    txn.abort();

    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("temp"), DatabaseOptions::default()),
        Err(Error::NotFound)
    ));
    drop(txn);

    // both slots are free again
    let txn = env.begin_rw_txn().unwrap();
    Database::open(&txn, Some("one"), DatabaseOptions::create()).unwrap();
    Database::open(&txn, Some("two"), DatabaseOptions::create()).unwrap();
    assert!(matches!(
        Database::open(&txn, Some("three"), DatabaseOptions::create()),
        Err(Error::DbsFull)
    ));
    txn.commit().unwrap();
}

#[test]
fn test_snapshot_isolation() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| db.put(txn, b"key", b"old", WriteFlags::empty()))
        .unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        s.spawn(|| {
            let mut txn = env.begin_rw_txn().unwrap();
            db.put(&mut txn, b"key", b"new", WriteFlags::empty()).unwrap();
            db.put(&mut txn, b"more", b"data", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
        assert_eq!(db.get(&reader, b"key").unwrap(), Some(&b"old"[..]));
        assert_eq!(db.get(&reader, b"more").unwrap(), None);
    });

    let fresh = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&fresh, b"key").unwrap(), Some(&b"new"[..]));
    assert!(fresh.id() > reader.id());
}

#[test]
fn test_reader_keeps_pages_alive() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| {
        for i in 0..500u32 {
            db.put(txn, format!("{:04}", i).as_bytes(), &[1u8; 64], WriteFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let snapshot = all_pairs(&reader, db);

    // rewrite everything several times; freed pages must not be reused
    // while the reader still sees them
    for round in 2..6u8 {
        env.write(|txn| {
            for i in 0..500u32 {
                db.put(txn, format!("{:04}", i).as_bytes(), &[round; 64], WriteFlags::empty())?;
            }
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(all_pairs(&reader, db), snapshot);
    drop(reader);

    let last = env.read(|txn| Ok(db.get(txn, b"0000")?.map(<[u8]>::to_vec))).unwrap();
    assert_eq!(last, Some(vec![5u8; 64]));
}

#[test]
fn test_free_pages_are_reused() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    let rewrite = |byte: u8| {
        env.write(|txn| {
            for i in 0..300u32 {
                db.put(txn, format!("{:04}", i).as_bytes(), &[byte; 100], WriteFlags::empty())?;
            }
            Ok(())
        })
        .unwrap();
    };
    for round in 0..5 {
        rewrite(round);
    }
    let settled = env.info().unwrap().last_pgno;
    for round in 5..25 {
        rewrite(round);
    }
    // without reuse every round would add a full tree worth of pages
    assert!(env.info().unwrap().last_pgno < settled * 2);
}

#[test]
fn test_reset_and_renew() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| db.put(txn, b"k", b"1", WriteFlags::empty()))
        .unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let first_id = txn.id();
    let inactive = txn.reset();
    assert!(env.reader_list().unwrap().iter().all(|r| r.txnid.is_none()));

    env.write(|txn| db.put(txn, b"k", b"2", WriteFlags::empty()))
        .unwrap();

    let txn = inactive.renew().unwrap();
    assert!(txn.id() > first_id);
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"2"[..]));
}

#[test]
fn test_nested_transactions() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, DatabaseOptions::default()).unwrap();
    db.put(&mut txn, b"parent", b"1", WriteFlags::empty()).unwrap();

    {
        let mut child = txn.begin_nested_txn().unwrap();
        assert_eq!(db.get(&child, b"parent").unwrap(), Some(&b"1"[..]));
        db.put(&mut child, b"aborted", b"x", WriteFlags::empty()).unwrap();
        db.del(&mut child, b"parent", None).unwrap();
        child.abort();
    }
    assert_eq!(db.get(&txn, b"aborted").unwrap(), None);
    assert_eq!(db.get(&txn, b"parent").unwrap(), Some(&b"1"[..]));

    {
        let mut child = txn.begin_nested_txn().unwrap();
        db.put(&mut child, b"kept", b"y", WriteFlags::empty()).unwrap();
        {
            let mut grandchild = child.begin_nested_txn().unwrap();
            db.put(&mut grandchild, b"deep", b"z", WriteFlags::empty()).unwrap();
            grandchild.commit().unwrap();
        }
        child.commit().unwrap();
    }
    assert_eq!(db.get(&txn, b"kept").unwrap(), Some(&b"y"[..]));
    assert_eq!(db.get(&txn, b"deep").unwrap(), Some(&b"z"[..]));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let keys: Vec<Vec<u8>> = all_pairs(&txn, db).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"deep".to_vec(), b"kept".to_vec(), b"parent".to_vec()]);
}

#[test]
fn test_nested_abort_after_splits() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, DatabaseOptions::default()).unwrap();
    for i in 0..300u32 {
        db.put(&mut txn, format!("p{:04}", i).as_bytes(), &[3u8; 50], WriteFlags::empty())
            .unwrap();
    }
    let before = all_pairs(&txn, db);

    {
        let mut child = txn.begin_nested_txn().unwrap();
        for i in 0..300u32 {
            db.put(&mut child, format!("c{:04}", i).as_bytes(), &[9u8; 50], WriteFlags::empty())
                .unwrap();
            db.del(&mut child, format!("p{:04}", i).as_bytes(), None).unwrap();
        }
        assert_eq!(db.stat(&child).unwrap().entries, 300);
    }
    assert_eq!(all_pairs(&txn, db), before);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(all_pairs(&txn, db), before);
}

#[test]
fn test_nested_database_creation() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    {
        let mut child = txn.begin_nested_txn().unwrap();
        let db = Database::open(&*child, Some("inner"), DatabaseOptions::create()).unwrap();
        db.put(&mut child, b"k", b"v", WriteFlags::empty()).unwrap();
    }
    assert!(matches!(
        Database::open(&txn, Some("inner"), DatabaseOptions::default()),
        Err(Error::NotFound)
    ));

    let db = {
        let mut child = txn.begin_nested_txn().unwrap();
        let db = Database::open(&*child, Some("inner"), DatabaseOptions::create()).unwrap();
        db.put(&mut child, b"k", b"v", WriteFlags::empty()).unwrap();
        child.commit().unwrap();
        db
    };
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn test_failed_transaction_is_poisoned() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_map_size(64 * 1024)
        .open(temp_dir.path())
        .unwrap();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let mut result = Ok(());
    for i in 0..100u32 {
        let key = format!("{:03}", i);
        result = db.put(&mut txn, key.as_bytes(), &[0u8; 3000], WriteFlags::empty());
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(Error::MapFull)));
    assert!(matches!(
        db.put(&mut txn, b"later", b"x", WriteFlags::empty()),
        Err(Error::BadTxn)
    ));
    assert!(matches!(txn.commit(), Err(Error::BadTxn)));

    // the environment itself is fine
    env.write(|txn| db.put(txn, b"small", b"ok", WriteFlags::empty()))
        .unwrap();
}

#[test]
fn test_busy_writer() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_lock_wait(LockWait::NoWait)
        .open(temp_dir.path())
        .unwrap();

    let txn = env.begin_rw_txn().unwrap();
    assert!(matches!(env.begin_rw_txn(), Err(Error::Busy)));
    assert!(matches!(env.set_map_size(1 << 24), Err(Error::Busy)));
    // readers are never blocked
    env.begin_ro_txn().unwrap();
    txn.abort();

    env.begin_rw_txn().unwrap().abort();
    env.set_map_size(1 << 24).unwrap();
    assert_eq!(env.get_map_size(), 1 << 24);
}

#[test]
fn test_blocking_writers_take_turns() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();

    thread::scope(|s| {
        for t in 0..4u32 {
            let env = &env;
            s.spawn(move || {
                for i in 0..25u32 {
                    let key = format!("t{}-{:02}", t, i);
                    env.write(|txn| db.put(txn, key.as_bytes(), b"v", WriteFlags::empty()))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(env.stat().unwrap().entries, 100);
}

#[test]
fn test_write_closure_aborts_on_error() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();

    let result: mapkv::Result<()> = env.write(|txn| {
        db.put(txn, b"a", b"1", WriteFlags::empty())?;
        db.put(txn, b"a", b"2", WriteFlags::NOOVERWRITE)
    });
    assert!(matches!(result, Err(Error::KeyExists)));
    assert_eq!(env.stat().unwrap().entries, 0);
}

#[test]
fn test_read_only_transaction_cannot_create() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("nope"), DatabaseOptions::create()),
        Err(Error::ReadOnly)
    ));
}
