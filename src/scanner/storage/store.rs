//! 持久化键值存储
//!
//! 结果缓存、自适应批次设置和会话问题列表都通过 [`KeyValueStore`] 读写 JSON 值。
//! 写入失败只记录日志，内存状态始终是权威数据。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::scanner::error::{ScanError, ScanResult};

/// 异步键值存储接口
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> ScanResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> ScanResult<()>;

    async fn remove(&self, key: &str) -> ScanResult<()>;

    /// 宿主上下文是否仍然可用
    fn is_available(&self) -> bool {
        true
    }
}

/// 尽力写入：上下文失效时静默跳过，其他失败记录警告
pub async fn write_quietly(store: &dyn KeyValueStore, key: &str, value: Value) {
    if !store.is_available() {
        debug!("存储上下文已失效，跳过写入: {}", key);
        return;
    }

    match store.set(key, value).await {
        Ok(()) => {}
        Err(ScanError::ContextInvalidated) => debug!("存储上下文已失效，跳过写入: {}", key),
        Err(e) => warn!("持久化失败 ({}): {}", key, e),
    }
}

/// 尽力删除
pub async fn remove_quietly(store: &dyn KeyValueStore, key: &str) {
    if !store.is_available() {
        return;
    }

    if let Err(e) = store.remove(key).await {
        match e {
            ScanError::ContextInvalidated => debug!("存储上下文已失效，跳过删除: {}", key),
            other => warn!("删除持久化数据失败 ({}): {}", key, other),
        }
    }
}

// ============================================================================
// 内存存储
// ============================================================================

/// 内存存储，可模拟宿主上下文失效
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    invalidated: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟上下文失效，之后的读写都返回 `ContextInvalidated`
    pub fn invalidate_context(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_context(&self) -> ScanResult<()> {
        if self.invalidated.load(Ordering::SeqCst) {
            return Err(ScanError::ContextInvalidated);
        }
        Ok(())
    }

    fn lock(&self) -> ScanResult<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.entries
            .lock()
            .map_err(|e| ScanError::InternalError(format!("内存存储锁已损坏: {}", e)))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> ScanResult<Option<Value>> {
        self.check_context()?;
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> ScanResult<()> {
        self.check_context()?;
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> ScanResult<()> {
        self.check_context()?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.invalidated.load(Ordering::SeqCst)
    }
}

// ============================================================================
// redb 存储
// ============================================================================

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

/// 基于 redb 的磁盘存储
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn open(path: &Path) -> ScanResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(redb_error)?;
        debug!("已打开结果数据库: {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    fn read(db: &Database, key: &str) -> ScanResult<Option<Value>> {
        let txn = db.begin_read().map_err(redb_error)?;
        let table = match txn.open_table(KV_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(redb_error(e)),
        };

        match table.get(key).map_err(redb_error)? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    fn write(db: &Database, key: &str, value: Option<&str>) -> ScanResult<()> {
        let txn = db.begin_write().map_err(redb_error)?;
        {
            let mut table = txn.open_table(KV_TABLE).map_err(redb_error)?;
            match value {
                Some(value) => {
                    table.insert(key, value).map_err(redb_error)?;
                }
                None => {
                    table.remove(key).map_err(redb_error)?;
                }
            }
        }
        txn.commit().map_err(redb_error)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, task: F) -> ScanResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> ScanResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || task(&db))
            .await
            .map_err(|e| ScanError::InternalError(format!("存储任务失败: {}", e)))?
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    async fn get(&self, key: &str) -> ScanResult<Option<Value>> {
        let key = key.to_string();
        self.blocking(move |db| Self::read(db, &key)).await
    }

    async fn set(&self, key: &str, value: Value) -> ScanResult<()> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        self.blocking(move |db| Self::write(db, &key, Some(&raw))).await
    }

    async fn remove(&self, key: &str) -> ScanResult<()> {
        let key = key.to_string();
        self.blocking(move |db| Self::write(db, &key, None)).await
    }
}

fn redb_error<E: Into<redb::Error>>(error: E) -> ScanError {
    ScanError::StorageError(error.into().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));

        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidated_context_is_skipped_quietly() {
        let store = MemoryStore::new();
        store.invalidate_context();

        assert!(matches!(
            store.set("k", json!(1)).await,
            Err(ScanError::ContextInvalidated)
        ));
        write_quietly(&store, "k", json!(1)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_redb_store_persists_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            assert!(store.get("missing").await.unwrap().is_none());
            store.set("autoScanCache", json!({"version": "1.0"})).await.unwrap();
        }

        let reopened = RedbStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("autoScanCache").await.unwrap(),
            Some(json!({"version": "1.0"}))
        );
        reopened.remove("autoScanCache").await.unwrap();
        assert!(reopened.get("autoScanCache").await.unwrap().is_none());
    }
}
