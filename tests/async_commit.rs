use snapdb::{ChangeSet, Db, KvPair, Options};
use tempfile::TempDir;

fn options(buffer: isize) -> Options {
    Options {
        create_if_missing: true,
        initial_stores: vec!["bank".to_string()],
        async_commit_buffer: buffer,
        ..Default::default()
    }
}

fn set(db: &Db, key: &str, value: &str) -> anyhow::Result<()> {
    db.apply_change_set(
        "bank",
        ChangeSet {
            pairs: vec![KvPair::set(key.to_string(), value.to_string())],
        },
    )?;
    Ok(())
}

/// A tiny buffer forces the committing thread to block on the writer; all
/// 100 commits still land durably and in order.
#[test]
fn backpressured_commits_all_land() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::load(dir.path(), options(2))?;
        for i in 1..=100u64 {
            set(&db, &format!("k{i}"), &format!("v{i}"))?;
            assert_eq!(db.commit()?, i);
        }
        db.wait_async_commit()?;
        assert_eq!(db.committed_version()?, 100);
        db.close()?;
    }

    let db = Db::load(dir.path(), options(2))?;
    assert_eq!(db.version(), 100);
    let bank = db.tree_by_name("bank").expect("bank");
    assert_eq!(bank.get(b"k1"), Some(bytes::Bytes::from_static(b"v1")));
    assert_eq!(bank.get(b"k100"), Some(bytes::Bytes::from_static(b"v100")));
    db.close()?;
    Ok(())
}

/// Rendezvous mode (capacity 0) hands every entry to the writer before the
/// commit returns.
#[test]
fn unbuffered_async_commit() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::load(dir.path(), options(0))?;
        for i in 1..=10u64 {
            set(&db, &format!("k{i}"), "v")?;
            db.commit()?;
        }
        db.close()?;
    }

    let db = Db::load(dir.path(), options(0))?;
    assert_eq!(db.version(), 10);
    db.close()?;
    Ok(())
}

/// Close without an explicit `wait_async_commit` still drains the queue.
#[test]
fn close_drains_the_writer() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::load(dir.path(), options(16))?;
        for i in 1..=50u64 {
            set(&db, &format!("k{i}"), "v")?;
            db.commit()?;
        }
        db.close()?;
    }

    let db = Db::load(dir.path(), options(16))?;
    assert_eq!(db.version(), 50);
    db.close()?;
    Ok(())
}

/// The writer restarts lazily after `wait_async_commit`.
#[test]
fn writer_restarts_after_wait() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options(4))?;

    set(&db, "a", "1")?;
    db.commit()?;
    db.wait_async_commit()?;
    assert_eq!(db.committed_version()?, 1);

    set(&db, "b", "2")?;
    db.commit()?;
    db.wait_async_commit()?;
    assert_eq!(db.committed_version()?, 2);

    db.close()?;

    let db = Db::load(dir.path(), options(4))?;
    assert_eq!(db.version(), 2);
    db.close()?;
    Ok(())
}
