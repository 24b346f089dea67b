use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_core::{BlobStore, CoreError};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;

/// Process-local blob store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn names(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(&self, name: &str) -> Result<Option<String>, CoreError> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn write(&self, name: &str, text: &str) -> Result<(), CoreError> {
        self.blobs
            .write()
            .await
            .insert(name.to_owned(), text.to_owned());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Blob store backed by a single SQLite table. Each write replaces the whole
/// blob, matching the remote store's rewrite-whole-file semantics. Queries run
/// on the blocking pool so they never stall the async workers.
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteBlobStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("SqliteBlobStore").finish_non_exhaustive()
    }
}

impl SqliteBlobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    CoreError::BackendUnreachable(format!(
                        "failed to create blob store directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|err| CoreError::BackendUnreachable(err.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| CoreError::BackendUnreachable(err.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), CoreError> {
        lock(&self.conn)
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS blobs (
                    name TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    written_at TEXT NOT NULL
                );
                ",
            )
            .map_err(|err| CoreError::BackendUnreachable(err.to_string()))
    }

    async fn with_conn<T, F>(&self, query: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || query(&lock(&conn)))
            .await
            .map_err(|err| CoreError::Persistence(format!("blob store task failed: {err}")))?
            .map_err(|err| CoreError::Persistence(err.to_string()))
    }
}

fn lock(conn: &Mutex<Connection>) -> std::sync::MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn read(&self, name: &str) -> Result<Option<String>, CoreError> {
        let name = name.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT body FROM blobs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn write(&self, name: &str, text: &str) -> Result<(), CoreError> {
        let name = name.to_owned();
        let text = text.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "
                INSERT INTO blobs (name, body, written_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET body = excluded.body, written_at = excluded.written_at
                ",
                params![name, text, relay_core::now_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let prefix = prefix.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT name FROM blobs ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut names = Vec::new();
            for row in rows {
                let name = row?;
                if name.starts_with(&prefix) {
                    names.push(name);
                }
            }
            Ok(names)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_reads_back_and_lists_by_prefix() {
        let store = InMemoryBlobStore::new();
        store.write("history/a.json", "{}").await.expect("write a");
        store.write("dedup/x.json", "{}").await.expect("write x");

        assert_eq!(
            store.read("history/a.json").await.expect("read"),
            Some("{}".to_owned())
        );
        assert_eq!(store.read("missing").await.expect("read missing"), None);
        assert_eq!(
            store.list("history/").await.expect("list"),
            vec!["history/a.json".to_owned()]
        );
    }

    #[tokio::test]
    async fn in_memory_clones_share_contents() {
        let store = InMemoryBlobStore::new();
        let clone = store.clone();
        clone.write("k", "v").await.expect("write");

        assert_eq!(store.names().await, vec!["k".to_owned()]);
    }

    #[tokio::test]
    async fn sqlite_store_overwrites_whole_blob() {
        let store = SqliteBlobStore::in_memory().expect("open sqlite");
        store.write("ledger", "first").await.expect("first write");
        store.write("ledger", "second").await.expect("second write");
        store.write("other", "x").await.expect("other write");

        assert_eq!(
            store.read("ledger").await.expect("read"),
            Some("second".to_owned())
        );
        assert_eq!(
            store.list("led").await.expect("list"),
            vec!["ledger".to_owned()]
        );
        assert_eq!(store.read("missing").await.expect("read missing"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_store_serves_concurrent_tasks() {
        let store = Arc::new(SqliteBlobStore::in_memory().expect("open sqlite"));
        let mut writers = tokio::task::JoinSet::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            writers.spawn(async move {
                store
                    .write(&format!("history/ticket_{n}.json"), "{}")
                    .await
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.expect("writer task").expect("write");
        }

        assert_eq!(store.list("history/").await.expect("list").len(), 8);
    }
}
