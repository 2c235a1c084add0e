use super::Deletion;
use crate::task::TaskKey;
use crate::value::{Changes, Value};
use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Records {
    changes: Vec<(TaskKey, Vec<String>)>,
    deletions: Vec<String>,
    assets: BTreeSet<String>,
}

/// Collects what a run would change and which downloads it needs.
#[derive(Debug, Default)]
pub struct InventoryTarget {
    records: Mutex<Records>,
}

impl InventoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut records)
    }

    pub fn record(&self, key: &TaskKey, changes: &Changes) {
        let mut sources = BTreeSet::new();
        for change in changes.iter() {
            collect_sources(&change.after, &mut sources);
        }
        self.with_records(|r| {
            r.changes.push((key.clone(), changes.names()));
            r.assets.extend(sources);
        });
    }

    pub fn record_deletion(&self, deletion: &dyn Deletion) {
        self.with_records(|r| r.deletions.push(deletion.item()));
    }

    pub fn has_changes(&self) -> bool {
        self.with_records(|r| !r.changes.is_empty() || !r.deletions.is_empty())
    }

    /// Changed tasks with the names of their changed fields, sorted by key.
    pub fn changes(&self) -> Vec<(TaskKey, Vec<String>)> {
        let mut changes = self.with_records(|r| r.changes.clone());
        changes.sort();
        changes
    }

    pub fn deletions(&self) -> Vec<String> {
        self.with_records(|r| r.deletions.clone())
    }

    /// Download origins of every changed resource.
    pub fn assets(&self) -> Vec<String> {
        self.with_records(|r| r.assets.iter().cloned().collect())
    }
}

fn collect_sources(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Resource(r) => {
            if let Some(source) = r.source() {
                out.insert(source.to_string());
            }
        }
        Value::List(items) => items.iter().for_each(|v| collect_sources(v, out)),
        Value::Map(items) => items.values().for_each(|v| collect_sources(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldChange;
    use assets::{AssetResource, Hash, HashAlgorithm, Source};
    use std::sync::Arc;

    #[test]
    fn test_records_changes_and_assets() {
        let inventory = InventoryTarget::new();
        assert!(!inventory.has_changes());

        let source = Source::Url {
            url: "https://example.com/kubelet".into(),
            hash: Hash::of_bytes(HashAlgorithm::Sha256, b"kubelet"),
        };
        let mut changes = Changes::default();
        changes.push(FieldChange {
            name: "Contents",
            before: None,
            after: Value::Resource(Arc::new(AssetResource::new("/cache/kubelet", source))),
        });
        inventory.record(&TaskKey::new("File", "/usr/local/bin/kubelet"), &changes);

        assert!(inventory.has_changes());
        assert_eq!(inventory.changes()[0].1, vec!["Contents"]);
        assert!(inventory.assets()[0].starts_with("https://example.com/kubelet"));
    }
}
