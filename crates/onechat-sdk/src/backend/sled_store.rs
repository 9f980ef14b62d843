//! 基于 sled 的持久化有序存储
//!
//! 每个消息路径对应一个 Tree，key 为 push id（字典序即插入顺序），value 为 JSON 记录。
//! 订阅通知在进程内分发。

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};

use super::push_id::PushIdGenerator;
use crate::error::{OneChatError, Result};
use crate::message::{MessageId, MessageRecord, RecordPatch};
use crate::store::{OrderedStore, StoreSubscription, SubscriberSet};

/// sled 有序存储
pub struct SledOrderedStore {
    db: Db,
    tree: Tree,
    ids: PushIdGenerator,
    /// 写入与订阅注册串行化，保证通知顺序与写入顺序一致
    subscribers: Mutex<SubscriberSet>,
}

impl SledOrderedStore {
    /// 打开（或创建）`dir` 下的存储，`messages_path` 作为 Tree 名
    pub fn open(dir: &Path, messages_path: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| OneChatError::IO(format!("创建存储目录失败: {}", e)))?;
        let db = sled::open(dir)
            .map_err(|e| OneChatError::KvStore(format!("打开 sled 数据库失败: {}", e)))?;
        Self::with_db(db, messages_path)
    }

    pub fn with_db(db: Db, messages_path: &str) -> Result<Self> {
        let tree = db
            .open_tree(messages_path)
            .map_err(|e| OneChatError::KvStore(format!("打开消息 Tree 失败: {}", e)))?;
        info!("✅ sled 消息存储已打开: path={}, records={}", messages_path, tree.len());

        // 新 id 必须排在已有记录之后，即使本机时钟落后于写入它们的时钟
        let ids = PushIdGenerator::new();
        if let Some((last, _)) = tree.last()? {
            let last = String::from_utf8_lossy(&last);
            if !ids.advance_past(&last) {
                warn!("⚠️ 最后一条记录的 key 不是 push id，忽略: {}", last);
            }
        }

        Ok(Self {
            db,
            tree,
            ids,
            subscribers: Mutex::new(SubscriberSet::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn record(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        self.tree
            .get(id.as_str())?
            .map(|value| Self::decode(&value))
            .transpose()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.lock().active_count()
    }

    /// 落盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn encode(record: &MessageRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record)
            .map_err(|e| OneChatError::Serialization(format!("序列化记录失败: {}", e)))
    }

    fn decode(value: &[u8]) -> Result<MessageRecord> {
        serde_json::from_slice(value)
            .map_err(|e| OneChatError::Serialization(format!("反序列化记录失败: {}", e)))
    }
}

#[async_trait]
impl OrderedStore for SledOrderedStore {
    async fn push(&self, record: MessageRecord) -> Result<MessageId> {
        let value = Self::encode(&record)?;

        let mut subscribers = self.subscribers.lock();
        let id = self.ids.next_id();
        self.tree
            .insert(id.as_str(), value)
            .map_err(|e| OneChatError::Store(format!("写入记录失败: {}", e)))?;
        subscribers.notify_added(&id, &record);

        debug!("sled store push: id={}", id);
        Ok(id)
    }

    async fn update(&self, id: &MessageId, patch: RecordPatch) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        let mut record = match self.tree.get(id.as_str())? {
            Some(value) => Self::decode(&value)?,
            None => return Err(OneChatError::NotFound(format!("message {}", id))),
        };
        record.apply(&patch);
        self.tree
            .insert(id.as_str(), Self::encode(&record)?)
            .map_err(|e| OneChatError::Store(format!("更新记录失败: {}", e)))?;

        let rank = self.tree.range(id.as_str()..).count();
        subscribers.notify_changed(id, &record, rank);

        debug!("sled store update: id={}", id);
        Ok(())
    }

    async fn subscribe_last_n(&self, n: usize) -> Result<StoreSubscription> {
        let mut subscribers = self.subscribers.lock();
        let mut initial = Vec::with_capacity(n.min(self.tree.len()));
        for entry in self.tree.iter().rev().take(n) {
            let (key, value) = entry?;
            let id = MessageId::new(String::from_utf8_lossy(&key).into_owned());
            initial.push((id, Self::decode(&value)?));
        }
        initial.reverse();
        Ok(subscribers.register(n, initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreEvent;
    use tempfile::TempDir;

    fn record(text: &str) -> MessageRecord {
        MessageRecord {
            name: Some("Ann".into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_update_and_subscribe() {
        let dir = TempDir::new().unwrap();
        let store = SledOrderedStore::open(dir.path(), "messages").unwrap();

        let a = store.push(record("a")).await.unwrap();
        let b = store.push(record("b")).await.unwrap();
        assert!(a < b);

        let mut sub = store.subscribe_last_n(10).await.unwrap();
        assert_eq!(sub.next().await.unwrap().id(), &a);
        assert_eq!(sub.next().await.unwrap().id(), &b);

        store
            .update(&b, RecordPatch { image_url: Some("gs://bucket/x.png".into()) })
            .await
            .unwrap();
        match sub.next().await.unwrap() {
            StoreEvent::Changed { id, record } => {
                assert_eq!(id, b);
                assert_eq!(record.image_url.as_deref(), Some("gs://bucket/x.png"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(store.active_subscriptions(), 1);
        drop(sub);
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let first = {
            let store = SledOrderedStore::open(dir.path(), "messages").unwrap();
            let id = store.push(record("persisted")).await.unwrap();
            store.flush().await.unwrap();
            id
        };

        let store = SledOrderedStore::open(dir.path(), "messages").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.record(&first).unwrap().unwrap().text.as_deref(), Some("persisted"));

        let second = store.push(record("next")).await.unwrap();
        assert!(first < second);

        let mut sub = store.subscribe_last_n(1).await.unwrap();
        assert_eq!(sub.next().await.unwrap().id(), &second);
    }

    #[tokio::test]
    async fn test_push_after_future_dated_record() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();

        // 另一台时钟快一小时的设备写入的记录
        let ahead = PushIdGenerator::new().next_id_at(crate::utils::now_millis() + 3_600_000);
        db.open_tree("messages")
            .unwrap()
            .insert(ahead.as_str(), serde_json::to_vec(&record("from the future")).unwrap())
            .unwrap();

        let store = SledOrderedStore::with_db(db, "messages").unwrap();
        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), store.push(record("now")))
            .await
            .expect("push should not stall")
            .unwrap();
        assert!(pushed > ahead, "{} !> {}", pushed, ahead);

        let mut sub = store.subscribe_last_n(1).await.unwrap();
        assert_eq!(sub.next().await.unwrap().id(), &pushed);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = SledOrderedStore::open(dir.path(), "messages").unwrap();
        let err = store.update(&"missing".into(), RecordPatch::default()).await.unwrap_err();
        assert!(matches!(err, OneChatError::NotFound(_)));
    }
}
