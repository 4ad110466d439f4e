use std::fs;

use mapkv::{
    CopyFlags, Database, DatabaseOptions, EnvFlags, EnvOptions, Environment, Error, Store,
    WriteFlags, DATA_FILE_NAME, LOCK_FILE_NAME,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new().set_max_dbs(2).open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

#[test]
fn test_environment_files() {
    let (dir, env) = setup_test_env();
    assert!(dir.path().join(DATA_FILE_NAME).exists());
    assert!(dir.path().join(LOCK_FILE_NAME).exists());
    assert_eq!(env.get_path(), dir.path());
    assert!(env.get_fd() >= 0);
    assert_eq!(env.get_max_dbs(), 2);
    assert_eq!(env.get_max_readers(), mapkv::DEFAULT_MAX_READERS);
}

#[test]
fn test_no_subdir() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("single.db");
    let env = Environment::new()
        .set_flags(EnvFlags::NOSUBDIR)
        .open(&path)
        .unwrap();
    env.write(|txn| {
        let db = Database::open(&*txn, None, DatabaseOptions::default())?;
        db.put(txn, b"k", b"v", WriteFlags::empty())
    })
    .unwrap();
    assert!(path.is_file());
    assert!(temp_dir.path().join("single.db-lock").exists());
}

#[test]
fn test_read_only_environment() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::new().open(temp_dir.path()).unwrap();
        let db = env.open_db(None, DatabaseOptions::default()).unwrap();
        env.write(|txn| db.put(txn, b"k", b"v", WriteFlags::empty()))
            .unwrap();
    }

    let env = Environment::new()
        .set_options(EnvOptions {
            read_only: true,
            ..Default::default()
        })
        .open(temp_dir.path())
        .unwrap();
    assert!(env.get_flags().contains(EnvFlags::RDONLY));
    assert!(matches!(env.begin_rw_txn(), Err(Error::ReadOnly)));
    assert!(matches!(env.write(|_txn| Ok(())), Err(Error::ReadOnly)));
    assert!(matches!(env.sync(true), Err(Error::ReadOnly)));
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    let value = env
        .read(|txn| Ok(db.get(txn, b"k")?.map(<[u8]>::to_vec)))
        .unwrap();
    assert_eq!(value, Some(b"v".to_vec()));

    // readers keep working after the refused writer
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(&b"v"[..]));
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_page_size_is_kept() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::new()
            .set_page_size(8192)
            .open(temp_dir.path())
            .unwrap();
        assert_eq!(env.stat().unwrap().psize, 8192);
    }
    let env = Environment::new().open(temp_dir.path()).unwrap();
    assert_eq!(env.stat().unwrap().psize, 8192);
}

#[test]
fn test_stat_and_info() {
    let (_dir, env) = setup_test_env();
    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 0);
    assert_eq!(info.last_pgno, 1);
    assert_eq!(info.mapsize, mapkv::DEFAULT_MAP_SIZE);

    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| {
        for i in 0..1000u32 {
            db.put(txn, format!("{:05}", i).as_bytes(), b"value", WriteFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();

    let stat = env.stat().unwrap();
    assert_eq!(stat.entries, 1000);
    assert!(stat.depth >= 2);
    assert!(stat.leaf_pages > 1);
    assert!(stat.branch_pages >= 1);
    assert_eq!(env.info().unwrap().last_txnid, 1);
}

#[test]
fn test_reader_table() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_max_readers(2)
        .open(temp_dir.path())
        .unwrap();

    let a = env.begin_ro_txn().unwrap();
    let b = env.begin_ro_txn().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));

    let readers = env.reader_list().unwrap();
    assert_eq!(readers.len(), 2);
    assert!(readers.iter().all(|r| r.pid == std::process::id()));
    assert!(readers.iter().all(|r| r.txnid == Some(0)));
    assert_eq!(env.info().unwrap().num_readers, 2);
    // our own slots are never stale
    assert_eq!(env.reader_check().unwrap(), 0);

    drop(a);
    drop(b);
    assert!(env.reader_list().unwrap().is_empty());
    env.begin_ro_txn().unwrap();
}

#[test]
fn test_runtime_flags() {
    let (_dir, env) = setup_test_env();
    env.set_flags(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC, true)
        .unwrap();
    assert!(env.get_flags().contains(EnvFlags::NOSYNC));

    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| db.put(txn, b"k", b"v", WriteFlags::empty()))
        .unwrap();
    env.sync(true).unwrap();

    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.get_flags().contains(EnvFlags::NOSYNC));
    assert!(env.get_flags().contains(EnvFlags::NOMETASYNC));
    assert!(matches!(
        env.set_flags(EnvFlags::NOSUBDIR, true),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_map_size() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_map_size(64 * 1024)
        .open(temp_dir.path())
        .unwrap();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();

    let fill = |count: u32| {
        env.write(|txn| {
            for i in 0..count {
                db.put(txn, format!("{:04}", i).as_bytes(), &[1u8; 2000], WriteFlags::empty())?;
            }
            Ok(())
        })
    };
    assert!(matches!(fill(100), Err(Error::MapFull)));

    env.set_map_size(4 << 20).unwrap();
    assert_eq!(env.get_map_size(), 4 << 20);
    fill(100).unwrap();
    assert_eq!(env.stat().unwrap().entries, 100);

    // the map never shrinks below the data
    env.set_map_size(4096).unwrap();
    let used = (env.info().unwrap().last_pgno + 1) * 4096;
    assert_eq!(env.get_map_size(), used);
    drop(env);

    // a later open maps at least the size of the last commit
    let env = Environment::new()
        .set_map_size(64 * 1024)
        .open(temp_dir.path())
        .unwrap();
    assert!(env.get_map_size() >= used);
    assert_eq!(env.stat().unwrap().entries, 100);
}

fn populate(env: &Environment) -> (Database, Database) {
    let main = env.open_db(None, DatabaseOptions::default()).unwrap();
    let dups = env
        .open_db(
            Some("dups"),
            DatabaseOptions {
                duplicate_keys: true,
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
    env.write(|txn| {
        for i in 0..2000u32 {
            main.put(txn, format!("key{:05}", i).as_bytes(), &[i as u8; 40], WriteFlags::empty())?;
        }
        for i in 0..50u32 {
            dups.put(txn, b"d", format!("{:03}", i).as_bytes(), WriteFlags::empty())?;
        }
        Ok(())
    })
    .unwrap();
    env.write(|txn| {
        for i in 0..1500u32 {
            main.del(txn, format!("key{:05}", i).as_bytes(), None)?;
        }
        Ok(())
    })
    .unwrap();
    (main, dups)
}

fn check_copy(path: &std::path::Path) {
    let env = Environment::new().set_max_dbs(2).open(path).unwrap();
    let main = env.open_db(None, DatabaseOptions::default()).unwrap();
    let dups = env.open_db(Some("dups"), DatabaseOptions::default()).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    // 500 plain keys plus the record of "dups"
    assert_eq!(main.stat(&txn).unwrap().entries, 501);
    assert_eq!(
        main.get(&txn, b"key01999").unwrap(),
        Some(&[1999u32 as u8; 40][..])
    );
    assert_eq!(main.get(&txn, b"key00000").unwrap(), None);
    assert_eq!(dups.stat(&txn).unwrap().entries, 50);
    assert!(dups.flags(&txn).unwrap().contains(mapkv::DbFlags::DUPSORT));
}

#[test]
fn test_copy() {
    let (_dir, env) = setup_test_env();
    populate(&env);

    let plain = TempDir::new().unwrap();
    env.copy(plain.path(), CopyFlags::empty()).unwrap();
    check_copy(plain.path());

    let compact = TempDir::new().unwrap();
    env.copy(compact.path(), CopyFlags::COMPACT).unwrap();
    check_copy(compact.path());

    let plain_len = fs::metadata(plain.path().join(DATA_FILE_NAME)).unwrap().len();
    let compact_len = fs::metadata(compact.path().join(DATA_FILE_NAME))
        .unwrap()
        .len();
    assert!(compact_len < plain_len);

    // never overwrite an existing environment
    assert!(matches!(
        env.copy(plain.path(), CopyFlags::empty()),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_copy_while_writing() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DatabaseOptions::default()).unwrap();
    env.write(|txn| db.put(txn, b"before", b"1", WriteFlags::empty()))
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"during", b"2", WriteFlags::empty()).unwrap();
    let target = TempDir::new().unwrap();
    env.copy(target.path(), CopyFlags::COMPACT).unwrap();
    txn.commit().unwrap();

    let copy = Environment::new().open(target.path()).unwrap();
    let txn = copy.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"before").unwrap(), Some(&b"1"[..]));
    assert_eq!(db.get(&txn, b"during").unwrap(), None);
}

#[test]
fn test_store() {
    let (_dir, env) = setup_test_env();
    let store = Store::open(&env, Some("kv"), DatabaseOptions::create()).unwrap();
    assert!(store.is_empty().unwrap());

    store.put(b"b", b"2").unwrap();
    store.put(b"a", b"1").unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(
        store.iter().unwrap(),
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec())
        ]
    );

    store.del(b"a").unwrap();
    assert!(matches!(store.del(b"a"), Err(Error::NotFound)));
    assert_eq!(store.get(b"a").unwrap(), None);

    let moved = store
        .transaction(|txn, db| {
            let value = db.get(&*txn, b"b")?.map(<[u8]>::to_vec);
            db.del(txn, b"b", None)?;
            db.put(txn, b"c", b"3", WriteFlags::empty())?;
            Ok(value)
        })
        .unwrap();
    assert_eq!(moved, Some(b"2".to_vec()));
    assert_eq!(store.iter().unwrap(), vec![(b"c".to_vec(), b"3".to_vec())]);
    assert_eq!(store.stat().unwrap().entries, 1);
}

#[test]
fn test_raw_host_values() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        Environment::new().set_map_size_raw(-1),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        Environment::new().open_with_raw_mode(temp_dir.path(), 1 << 40),
        Err(Error::OutOfRange { .. })
    ));

    let env = Environment::new()
        .set_map_size_raw(1 << 21)
        .unwrap()
        .open_with_raw_mode(temp_dir.path(), 0o600)
        .unwrap();
    assert_eq!(env.get_map_size(), 1 << 21);
    assert!(matches!(Database::from_raw(-3), Err(Error::OutOfRange { .. })));
}

#[test]
fn test_error_codes() {
    assert!(matches!(
        Error::from_code(Error::NotFound.code()),
        Error::NotFound
    ));
    assert!(!mapkv::strerror(Error::MapFull.code()).is_empty());
    assert!(Error::Panic.is_fatal());
    assert!(!Error::KeyExists.is_fatal());
}

#[test]
fn test_version() {
    let (major, minor, patch) = Environment::version();
    assert_eq!(
        Environment::version_string(),
        format!("mapkv {}.{}.{}", major, minor, patch)
    );
}
