use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One key mutation inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub delete: bool,
    pub key: Bytes,
    /// Empty when `delete` is set.
    pub value: Bytes,
}

impl KvPair {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            delete: false,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            delete: true,
            key: key.into(),
            value: Bytes::new(),
        }
    }
}

/// Ordered mutations for a single store within one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub pairs: Vec<KvPair>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A changeset tagged with its store name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedChangeSet {
    pub name: String,
    pub changeset: ChangeSet,
}

/// Store-level schema change: add a tree, rename one, or delete one.
///
/// `rename_from` and `delete` both unset means "add".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNameUpgrade {
    pub name: String,
    pub rename_from: Option<String>,
    pub delete: bool,
}

impl TreeNameUpgrade {
    pub fn add(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn rename(name: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rename_from: Some(from.into()),
            delete: false,
        }
    }

    pub fn delete_tree(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rename_from: None,
            delete: true,
        }
    }
}

/// Payload of one WAL entry: everything that happened in one block.
///
/// Doubles as the in-memory pending log accumulated between commits.
/// `changesets` stays sorted by store name with at most one entry per store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalData {
    pub upgrades: Vec<TreeNameUpgrade>,
    pub changesets: Vec<NamedChangeSet>,
}

impl WalData {
    pub fn is_empty(&self) -> bool {
        self.upgrades.is_empty() && self.changesets.is_empty()
    }

    /// Fold a changeset for `name` into the sorted changeset list.
    ///
    /// Pairs for a store that already has an entry are appended to it.
    pub fn merge_changeset(&mut self, name: &str, changeset: ChangeSet) {
        match self
            .changesets
            .binary_search_by(|cs| cs.name.as_str().cmp(name))
        {
            Ok(pos) => self.changesets[pos]
                .changeset
                .pairs
                .extend(changeset.pairs),
            Err(pos) => self.changesets.insert(
                pos,
                NamedChangeSet {
                    name: name.to_string(),
                    changeset,
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_changeset_keeps_sorted_order() {
        let mut data = WalData::default();
        data.merge_changeset("bank", ChangeSet {
            pairs: vec![KvPair::set(&b"a"[..], &b"1"[..])],
        });
        data.merge_changeset("acc", ChangeSet {
            pairs: vec![KvPair::set(&b"b"[..], &b"2"[..])],
        });
        data.merge_changeset("bank", ChangeSet {
            pairs: vec![KvPair::delete(&b"a"[..])],
        });

        let names: Vec<_> = data.changesets.iter().map(|cs| cs.name.as_str()).collect();
        assert_eq!(names, vec!["acc", "bank"]);
        assert_eq!(data.changesets[1].changeset.pairs.len(), 2);
    }
}
