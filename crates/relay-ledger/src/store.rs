use std::sync::Arc;

use relay_core::{BlobStore, CoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Whole-document JSON persistence on top of a [`BlobStore`].
///
/// There are no partial updates: callers load a record set, mutate it and
/// save it back as one logical unit. Exclusive access to a given name is the
/// caller's responsibility.
#[derive(Clone)]
pub struct LedgerStore {
    blob: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("LedgerStore").finish_non_exhaustive()
    }
}

impl LedgerStore {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }

    /// Loads a record set, yielding the empty set when the blob is absent.
    pub async fn load<R>(&self, name: &str) -> Result<R, CoreError>
    where
        R: DeserializeOwned + Default,
    {
        Ok(self.load_existing(name).await?.unwrap_or_default())
    }

    pub async fn load_existing<R>(&self, name: &str) -> Result<Option<R>, CoreError>
    where
        R: DeserializeOwned,
    {
        let Some(raw) = self.blob.read(name).await? else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&raw).map(Some).map_err(|err| {
            CoreError::Persistence(format!("ledger '{name}' is not valid JSON: {err}"))
        })
    }

    pub async fn save<R>(&self, name: &str, records: &R) -> Result<(), CoreError>
    where
        R: Serialize,
    {
        let rendered = serde_json::to_string_pretty(records).map_err(|err| {
            CoreError::Persistence(format!("failed to serialize ledger '{name}': {err}"))
        })?;
        self.blob.write(name, &rendered).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        self.blob.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::blob::InMemoryBlobStore;

    #[tokio::test]
    async fn load_of_missing_or_blank_blob_is_empty() {
        let blob = InMemoryBlobStore::new();
        blob.write("blank", "   ").await.expect("write blank");
        let store = LedgerStore::new(Arc::new(blob));

        let missing: BTreeMap<String, String> = store.load("missing").await.expect("load");
        let blank: BTreeMap<String, String> = store.load("blank").await.expect("load blank");

        assert!(missing.is_empty());
        assert!(blank.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_record_set() {
        let store = LedgerStore::new(Arc::new(InMemoryBlobStore::new()));
        let mut records = BTreeMap::new();
        records.insert("k".to_owned(), 7_u32);

        store.save("set", &records).await.expect("save");
        let loaded: BTreeMap<String, u32> = store.load("set").await.expect("load");

        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn corrupt_blob_is_a_persistence_error() {
        let blob = InMemoryBlobStore::new();
        blob.write("bad", "{not json").await.expect("write");
        let store = LedgerStore::new(Arc::new(blob));

        let error = store
            .load::<BTreeMap<String, String>>("bad")
            .await
            .expect_err("corrupt ledger should fail");
        assert!(matches!(error, CoreError::Persistence(_)));
    }
}
