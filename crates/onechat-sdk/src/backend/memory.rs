//! 内存实现：OrderedStore / BlobStore / IdentityProvider
//!
//! 用于测试、演示以及不需要持久化的场景；都带有故障注入开关。

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::push_id::PushIdGenerator;
use crate::blob::{BlobRef, BlobStore};
use crate::error::{OneChatError, Result};
use crate::identity::{AuthState, AuthUser, IdentityProvider};
use crate::message::{MessageId, MessageRecord, RecordPatch};
use crate::store::{OrderedStore, StoreSubscription, SubscriberSet};

#[derive(Default)]
struct StoreState {
    records: BTreeMap<MessageId, MessageRecord>,
    subscribers: SubscriberSet,
}

/// 内存有序存储
#[derive(Default)]
pub struct MemoryOrderedStore {
    state: Mutex<StoreState>,
    ids: PushIdGenerator,
    fail_writes: AtomicBool,
    pushes: AtomicUsize,
    updates: AtomicUsize,
}

impl MemoryOrderedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后 push / update 都返回 Store 错误
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, id: &MessageId) -> Option<MessageRecord> {
        self.state.lock().records.get(id).cloned()
    }

    /// 按插入顺序返回全部记录
    pub fn records(&self) -> Vec<(MessageId, MessageRecord)> {
        self.state
            .lock()
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 成功的 push 次数
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// 成功的 update 次数
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscribers.active_count()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OneChatError::Store("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderedStore for MemoryOrderedStore {
    async fn push(&self, record: MessageRecord) -> Result<MessageId> {
        self.check_writable()?;

        let mut state = self.state.lock();
        let id = self.ids.next_id();
        state.records.insert(id.clone(), record.clone());
        state.subscribers.notify_added(&id, &record);
        self.pushes.fetch_add(1, Ordering::SeqCst);

        debug!("memory store push: id={}", id);
        Ok(id)
    }

    async fn update(&self, id: &MessageId, patch: RecordPatch) -> Result<()> {
        self.check_writable()?;

        let mut state = self.state.lock();
        let StoreState { records, subscribers } = &mut *state;
        let record = records
            .get_mut(id)
            .ok_or_else(|| OneChatError::NotFound(format!("message {}", id)))?;
        record.apply(&patch);
        let record = record.clone();

        let rank = records.range(id.clone()..).count();
        subscribers.notify_changed(id, &record, rank);
        self.updates.fetch_add(1, Ordering::SeqCst);

        debug!("memory store update: id={}", id);
        Ok(())
    }

    async fn subscribe_last_n(&self, n: usize) -> Result<StoreSubscription> {
        let mut state = self.state.lock();
        let skip = state.records.len().saturating_sub(n);
        let initial: Vec<_> = state
            .records
            .iter()
            .skip(skip)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        Ok(state.subscribers.register(n, initial))
    }
}

struct StoredBlob {
    bytes: Bytes,
    content_type: String,
}

/// 内存 blob 存储
pub struct MemoryBlobStore {
    bucket: String,
    blobs: RwLock<HashMap<String, StoredBlob>>,
    fail_uploads: AtomicBool,
    upload_delay: RwLock<Option<Duration>>,
    resolve_delay: RwLock<Option<Duration>>,
    uploads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: RwLock::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
            upload_delay: RwLock::new(None),
            resolve_delay: RwLock::new(None),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.write() = Some(delay);
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.write() = Some(delay);
    }

    /// 直接放入一个对象（不计入上传次数）
    pub fn insert(&self, path: &str, bytes: impl Into<Bytes>, content_type: &str) -> BlobRef {
        self.blobs.write().insert(
            path.to_string(),
            StoredBlob {
                bytes: bytes.into(),
                content_type: content_type.to_string(),
            },
        );
        BlobRef::new(self.bucket.clone(), path)
    }

    pub fn get(&self, path: &str) -> Option<(Bytes, String)> {
        self.blobs
            .read()
            .get(path)
            .map(|blob| (blob.bytes.clone(), blob.content_type.clone()))
    }

    /// 成功的上传次数
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_url(&self, reference: &BlobRef) -> String {
        format!("memory://{}/{}", reference.bucket(), reference.path())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<BlobRef> {
        let delay = *self.upload_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(OneChatError::Store(format!("upload rejected: {}", path)));
        }

        let size = bytes.len();
        let reference = self.insert(path, bytes, content_type);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        debug!("memory blob upload: {} ({} bytes)", reference, size);
        Ok(reference)
    }

    async fn resolve(&self, reference: &BlobRef) -> Result<String> {
        let delay = *self.resolve_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if reference.bucket() != self.bucket || !self.blobs.read().contains_key(reference.path()) {
            return Err(OneChatError::NotFound(reference.to_string()));
        }
        Ok(self.download_url(reference))
    }
}

/// 内存身份提供方
///
/// `sign_in` 使用预先配置的账号；没有配置时登录失败。
pub struct MemoryIdentityProvider {
    state: RwLock<AuthState>,
    account: RwLock<Option<AuthUser>>,
    sender: broadcast::Sender<AuthState>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(AuthState::SignedOut),
            account: RwLock::new(None),
            sender,
        }
    }

    /// 配置 `sign_in` 时登录的账号
    pub fn with_account(self, user: AuthUser) -> Self {
        *self.account.write() = Some(user);
        self
    }

    /// 仍在监听登录状态的订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 直接切换状态并通知订阅者（模拟外部登录/会话过期）
    pub fn set_state(&self, state: AuthState) {
        *self.state.write() = state.clone();
        let _ = self.sender.send(state);
    }
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    fn current_user(&self) -> AuthState {
        self.state.read().clone()
    }

    async fn sign_in(&self) -> Result<()> {
        let account = self
            .account
            .read()
            .clone()
            .ok_or_else(|| OneChatError::Auth("no account configured".to_string()))?;
        info!("🔐 登录: uid={}", account.uid);
        self.set_state(AuthState::SignedIn(account));
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        info!("🔓 退出登录");
        self.set_state(AuthState::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthState> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreEvent;

    fn record(text: &str) -> MessageRecord {
        MessageRecord {
            name: Some("Ann".into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_last_n_in_order() {
        let store = MemoryOrderedStore::new();
        for text in ["a", "b", "c", "d"] {
            store.push(record(text)).await.unwrap();
        }

        let mut sub = store.subscribe_last_n(2).await.unwrap();
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first.record().text.as_deref(), Some("c"));
        assert_eq!(second.record().text.as_deref(), Some("d"));
        assert!(matches!(first, StoreEvent::Added { .. }));
    }

    #[tokio::test]
    async fn test_update_notifies_changed_inside_window_only() {
        let store = MemoryOrderedStore::new();
        let old = store.push(record("old")).await.unwrap();
        let recent = store.push(MessageRecord {
            name: Some("Ann".into()),
            image_url: Some(crate::message::LOADING_IMAGE_URL.into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut sub = store.subscribe_last_n(1).await.unwrap();
        assert_eq!(sub.next().await.unwrap().id(), &recent);

        store
            .update(&old, RecordPatch { image_url: Some("https://x/y.png".into()) })
            .await
            .unwrap();
        store
            .update(&recent, RecordPatch { image_url: Some("gs://bucket/a.png".into()) })
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            StoreEvent::Changed { id, record } => {
                assert_eq!(id, recent);
                assert_eq!(record.image_url.as_deref(), Some("gs://bucket/a.png"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(store.update_count(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let store = MemoryOrderedStore::new();
        let err = store.update(&"nope".into(), RecordPatch::default()).await.unwrap_err();
        assert!(matches!(err, OneChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryOrderedStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.push(record("a")).await, Err(OneChatError::Store(_))));
        assert!(store.is_empty());
        assert_eq!(store.push_count(), 0);
    }

    #[tokio::test]
    async fn test_blob_upload_and_resolve() {
        let blob = MemoryBlobStore::new("bucket");
        let reference = blob
            .upload("u1/1/cat.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(reference.to_string(), "gs://bucket/u1/1/cat.png");
        assert_eq!(blob.resolve(&reference).await.unwrap(), "memory://bucket/u1/1/cat.png");
        assert_eq!(blob.get("u1/1/cat.png").unwrap().1, "image/png");
        assert_eq!(blob.upload_count(), 1);

        let other = BlobRef::new("other", "u1/1/cat.png");
        assert!(blob.resolve(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_identity_sign_in_and_out() {
        let identity = MemoryIdentityProvider::new().with_account(AuthUser::new("u1", "Ann"));
        let mut rx = identity.subscribe();

        identity.sign_in().await.unwrap();
        assert!(identity.current_user().is_signed_in());
        assert!(rx.recv().await.unwrap().is_signed_in());

        identity.sign_out().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), AuthState::SignedOut);

        let anonymous = MemoryIdentityProvider::new();
        assert!(matches!(anonymous.sign_in().await, Err(OneChatError::Auth(_))));
    }
}
