use std::collections::BTreeMap;

use proptest::prelude::*;
use snapdb::{ChangeSet, Db, KvPair, Options};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum MiniOp {
    Put { store: u8, key: u8, value: u8 },
    Del { store: u8, key: u8 },
}

const STORES: [&str; 2] = ["acc", "bank"];
const KEY_SPACE: u8 = 6;

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + (key % KEY_SPACE)]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

fn options() -> Options {
    Options {
        create_if_missing: true,
        initial_stores: STORES.iter().map(|s| s.to_string()).collect(),
        snapshot_interval: 4,
        snapshot_keep_recent: 1,
        async_commit_buffer: -1,
        ..Default::default()
    }
}

fn mini_op() -> impl Strategy<Value = MiniOp> {
    prop_oneof![
        (0..2u8, any::<u8>(), any::<u8>())
            .prop_map(|(store, key, value)| MiniOp::Put { store, key, value }),
        (0..2u8, any::<u8>()).prop_map(|(store, key)| MiniOp::Del { store, key }),
    ]
}

fn apply_block(
    db: &Db,
    model: &mut [BTreeMap<Vec<u8>, Vec<u8>>; 2],
    block: &[MiniOp],
) -> anyhow::Result<()> {
    for op in block {
        match op {
            MiniOp::Put { store, key, value } => {
                let (k, v) = (key_bytes(*key), value_bytes(*value));
                db.apply_change_set(
                    STORES[*store as usize],
                    ChangeSet {
                        pairs: vec![KvPair::set(k.clone(), v.clone())],
                    },
                )?;
                model[*store as usize].insert(k, v);
            }
            MiniOp::Del { store, key } => {
                let k = key_bytes(*key);
                db.apply_change_set(
                    STORES[*store as usize],
                    ChangeSet {
                        pairs: vec![KvPair::delete(k.clone())],
                    },
                )?;
                model[*store as usize].remove(&k);
            }
        }
    }
    Ok(())
}

fn check_model(db: &Db, model: &[BTreeMap<Vec<u8>, Vec<u8>>; 2]) {
    for (i, store) in STORES.iter().enumerate() {
        let tree = db.tree_by_name(store).expect("store");
        for key in 0..KEY_SPACE {
            let k = key_bytes(key);
            let expected = model[i].get(&k).cloned().map(bytes::Bytes::from);
            assert_eq!(tree.get(&k), expected, "store {store} key {k:?}");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Random commit histories stay consistent with a map model, survive a
    /// reopen, and produce the same root hash afterwards.
    #[test]
    fn random_history_matches_model(
        blocks in prop::collection::vec(prop::collection::vec(mini_op(), 1..6), 1..12)
    ) {
        let dir = TempDir::new().expect("tempdir");
        let mut model: [BTreeMap<Vec<u8>, Vec<u8>>; 2] = [BTreeMap::new(), BTreeMap::new()];

        let before_close;
        {
            let db = Db::load(dir.path(), options()).expect("load");
            for (i, block) in blocks.iter().enumerate() {
                apply_block(&db, &mut model, block).expect("apply");
                prop_assert_eq!(db.commit().expect("commit"), i as u64 + 1);
            }
            check_model(&db, &model);
            before_close = db.root_hash();
            db.close().expect("close");
        }

        let db = Db::load(dir.path(), options()).expect("reopen");
        prop_assert_eq!(db.version(), blocks.len() as u64);
        check_model(&db, &model);
        prop_assert_eq!(db.root_hash(), before_close);
        db.close().expect("close");
    }
}
