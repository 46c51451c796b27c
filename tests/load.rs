use snapdb::{get_latest_version, ChangeSet, Db, DbError, KvPair, Options};
use tempfile::TempDir;

fn options() -> Options {
    Options {
        create_if_missing: true,
        initial_stores: vec!["bank".to_string(), "acc".to_string()],
        async_commit_buffer: -1,
        ..Default::default()
    }
}

fn set(db: &Db, store: &str, key: &str, value: &str) -> anyhow::Result<()> {
    db.apply_change_set(
        store,
        ChangeSet {
            pairs: vec![KvPair::set(key.to_string(), value.to_string())],
        },
    )?;
    Ok(())
}

#[test]
fn fresh_db_layout() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options())?;

    assert_eq!(db.version(), 0);
    assert!(!db.read_only());
    assert!(db.tree_by_name("bank").is_some());
    assert!(db.tree_by_name("acc").is_some());
    assert!(db.tree_by_name("missing").is_none());

    let current = std::fs::read_link(dir.path().join("current"))?;
    assert_eq!(
        current.to_str().unwrap(),
        "snapshot-00000000000000000000"
    );

    let snapshots: Vec<String> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("snapshot-"))
        .collect();
    assert_eq!(snapshots, vec!["snapshot-00000000000000000000".to_string()]);

    db.close()?;
    Ok(())
}

#[test]
fn invalid_option_combinations_are_rejected() {
    let dir = TempDir::new().expect("tempdir");

    let result = Db::load(
        dir.path(),
        Options {
            read_only: true,
            create_if_missing: true,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(DbError::InvalidOptions(_))));

    let result = Db::load(
        dir.path(),
        Options {
            read_only: true,
            load_for_overwriting: true,
            target_version: 3,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(DbError::InvalidOptions(_))));
}

#[test]
fn second_writer_is_locked_out_but_readers_are_not() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options())?;
    set(&db, "bank", "k", "v")?;
    db.commit()?;

    // another writer on the same directory fails on the lock
    assert!(Db::load(dir.path(), options()).is_err());

    // a read-only open never takes the lock
    let reader = Db::load(
        dir.path(),
        Options {
            read_only: true,
            ..Default::default()
        },
    )?;
    assert_eq!(reader.version(), 1);
    assert!(reader.read_only());

    db.close()?;

    // lock is released with the writer
    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 1);
    db.close()?;
    Ok(())
}

#[test]
fn reopen_recovers_committed_state_from_wal() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::load(dir.path(), options())?;
        set(&db, "bank", "alice", "100")?;
        db.commit()?;
        set(&db, "bank", "bob", "50")?;
        set(&db, "acc", "nonce", "7")?;
        db.commit()?;
        db.close()?;
    }

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 2);
    let bank = db.tree_by_name("bank").expect("bank");
    assert_eq!(bank.get(b"alice"), Some(bytes::Bytes::from_static(b"100")));
    assert_eq!(bank.get(b"bob"), Some(bytes::Bytes::from_static(b"50")));
    let acc = db.tree_by_name("acc").expect("acc");
    assert_eq!(acc.get(b"nonce"), Some(bytes::Bytes::from_static(b"7")));
    db.close()?;
    Ok(())
}

#[test]
fn latest_version_inspection_without_lock() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    assert_eq!(get_latest_version(dir.path())?, 0);

    let db = Db::load(dir.path(), options())?;
    assert_eq!(get_latest_version(dir.path())?, 0);

    set(&db, "bank", "k1", "v1")?;
    db.commit()?;
    set(&db, "bank", "k2", "v2")?;
    db.commit()?;

    // the writer still holds the directory; inspection works regardless
    assert_eq!(get_latest_version(dir.path())?, 2);
    db.close()?;
    assert_eq!(get_latest_version(dir.path())?, 2);
    Ok(())
}

#[test]
fn initial_version_applies_to_first_commit() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(
        dir.path(),
        Options {
            initial_version: 100,
            ..options()
        },
    )?;
    assert_eq!(db.version(), 0);

    set(&db, "bank", "k", "v")?;
    assert_eq!(db.commit()?, 100);
    assert_eq!(db.commit()?, 101);

    // rejected once a version exists
    assert!(matches!(
        db.set_initial_version(5),
        Err(DbError::AlreadyCommitted)
    ));
    db.close()?;

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 101);
    db.close()?;
    Ok(())
}

#[test]
fn set_initial_version_before_commit() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options())?;
    db.set_initial_version(42)?;
    set(&db, "bank", "k", "v")?;
    assert_eq!(db.commit()?, 42);
    db.close()?;

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 42);
    assert_eq!(get_latest_version(dir.path())?, 42);
    db.close()?;
    Ok(())
}

#[test]
fn missing_db_without_create_fails() {
    let dir = TempDir::new().expect("tempdir");
    let result = Db::load(
        dir.path(),
        Options {
            async_commit_buffer: -1,
            ..Default::default()
        },
    );
    assert!(result.is_err());
}
