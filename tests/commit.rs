use std::time::{Duration, Instant};

use snapdb::{ChangeSet, Db, KvPair, Options, Wal, WalOptions};
use tempfile::TempDir;

fn options() -> Options {
    Options {
        create_if_missing: true,
        initial_stores: vec!["bank".to_string()],
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

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn snapshot_dirs(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("snapshot-") && !name.ends_with("-tmp"))
        .collect();
    names.sort();
    names
}

#[test]
fn versions_advance_by_one() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options())?;

    for expected in 1..=7u64 {
        set(&db, "bank", &format!("k{expected}"), "v")?;
        assert_eq!(db.commit()?, expected);
        assert_eq!(db.version(), expected);
        assert_eq!(db.committed_version()?, expected);
    }
    db.close()?;
    Ok(())
}

#[test]
fn empty_commit_still_advances() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.commit()?, 1);
    assert_eq!(db.commit()?, 2);
    db.close()?;

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 2);
    db.close()?;
    Ok(())
}

#[test]
fn commit_info_tracks_stores() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(
        dir.path(),
        Options {
            initial_stores: vec!["acc".to_string(), "bank".to_string()],
            ..options()
        },
    )?;
    set(&db, "bank", "k", "v")?;

    let working = db.working_commit_info();
    assert_eq!(working.version, 1);

    db.commit()?;
    let info = db.last_commit_info();
    assert_eq!(info.version, 1);
    let names: Vec<&str> = info.store_infos.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["acc", "bank"]);
    assert_eq!(working.hash(), info.hash());
    db.close()?;
    Ok(())
}

/// Ten commits at interval 5 with one retained snapshot: the db ends up with
/// exactly the two rewritten snapshots and a WAL that starts right after the
/// earliest one.
#[test]
fn snapshot_cadence_and_retention() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(
        dir.path(),
        Options {
            snapshot_interval: 5,
            snapshot_keep_recent: 1,
            ..options()
        },
    )?;

    for i in 1..=10u64 {
        set(&db, "bank", &format!("k{i}"), &format!("v{i}"))?;
        assert_eq!(db.commit()?, i);

        if i % 5 == 0 {
            // wait for the background rewrite to publish its snapshot, plus a
            // beat for the result to land on the channel, so the next commit
            // (or close) reaps it deterministically
            let expected = format!("snapshot-{i:020}");
            wait_until("current to swap", || {
                std::fs::read_link(dir.path().join("current"))
                    .map(|target| target.to_string_lossy() == expected)
                    .unwrap_or(false)
            });
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    db.close()?;

    assert_eq!(
        snapshot_dirs(dir.path()),
        vec![
            format!("snapshot-{:020}", 5),
            format!("snapshot-{:020}", 10),
        ]
    );

    // WAL keeps exactly the entries after the earliest surviving snapshot:
    // versions 6..=10 map to indices 7..=11 with initial version 0
    let wal = Wal::open(dir.path().join("wal"), WalOptions::default())?;
    assert_eq!(wal.first_index(), 7);
    assert_eq!(wal.last_index(), 11);
    drop(wal);

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 10);
    let bank = db.tree_by_name("bank").expect("bank");
    for i in 1..=10u64 {
        assert_eq!(
            bank.get(format!("k{i}").as_bytes()),
            Some(bytes::Bytes::from(format!("v{i}"))),
            "k{i} after reopen"
        );
    }
    db.close()?;
    Ok(())
}

/// Pruning with `snapshot_keep_recent == 0` still preserves the current
/// snapshot.
#[test]
fn keep_recent_zero_spares_current() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::load(
        dir.path(),
        Options {
            snapshot_interval: 3,
            snapshot_keep_recent: 0,
            ..options()
        },
    )?;

    for i in 1..=3u64 {
        set(&db, "bank", &format!("k{i}"), "v")?;
        db.commit()?;
        if i == 3 {
            wait_until("current to swap", || {
                std::fs::read_link(dir.path().join("current"))
                    .map(|target| target.to_string_lossy() == format!("snapshot-{i:020}"))
                    .unwrap_or(false)
            });
            std::thread::sleep(Duration::from_millis(300));
        }
    }
    db.close()?;

    assert_eq!(
        snapshot_dirs(dir.path()),
        vec![format!("snapshot-{:020}", 3)]
    );

    let db = Db::load(dir.path(), options())?;
    assert_eq!(db.version(), 3);
    db.close()?;
    Ok(())
}
