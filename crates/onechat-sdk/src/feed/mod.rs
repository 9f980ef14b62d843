//! 消息流同步（FeedSync）
//!
//! 职责：
//! - 维持唯一的一个“最近 N 条消息”订阅，重新 start 时取消旧订阅
//! - 把 Added / Changed 通知统一投影为按 id 的 upsert 交给渲染器
//! - 发送文本消息、图片消息（先写占位记录，上传完成后原位更新）
//!
//! 本地视图只是存储的读缓存：发送路径不做任何乐观插入，显示只来自存储通知。

pub mod view;

use bytes::Bytes;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::{blob_path, BlobStore};
use crate::error::{OneChatError, Result};
use crate::events::{event_builders, EventManager};
use crate::identity::{AuthState, AuthUser};
use crate::message::{Message, MessageId, MessageRecord, RecordPatch};
use crate::store::{OrderedStore, StoreEvent};
use crate::utils::now_millis;

pub use view::{FeedRenderer, FeedView, RenderedContent, RenderedMessage};

/// 默认订阅窗口：最近 100 条
pub const DEFAULT_FEED_WINDOW: usize = 100;

/// 未登录发送时的默认提示
pub const DEFAULT_SIGN_IN_NOTICE: &str = "Você deve primeiro efetuar o login!";

/// FeedSync 配置
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// 订阅最近多少条消息
    pub window: usize,
    /// 用户无头像时写入记录的占位头像
    pub profile_placeholder_url: String,
    /// 未登录时的提示文案
    pub sign_in_notice: String,
    /// 提示展示时长（毫秒）
    pub notice_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_FEED_WINDOW,
            profile_placeholder_url: crate::message::PROFILE_PLACEHOLDER_URL.to_string(),
            sign_in_notice: DEFAULT_SIGN_IN_NOTICE.to_string(),
            notice_timeout_ms: 2000,
        }
    }
}

struct ActiveSubscription {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    fn shutdown(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// 消息流同步器
pub struct FeedSync {
    store: Arc<dyn OrderedStore>,
    blob_store: Arc<dyn BlobStore>,
    renderer: Arc<dyn FeedRenderer>,
    events: Arc<EventManager>,
    config: FeedConfig,
    generation: AtomicU64,
    /// 可重入：渲染期间事件监听器可以在同一线程里调用 start / stop / is_running
    active: ReentrantMutex<RefCell<Option<ActiveSubscription>>>,
}

impl FeedSync {
    pub fn new(
        store: Arc<dyn OrderedStore>,
        blob_store: Arc<dyn BlobStore>,
        renderer: Arc<dyn FeedRenderer>,
        events: Arc<EventManager>,
        config: FeedConfig,
    ) -> Self {
        Self {
            store,
            blob_store,
            renderer,
            events,
            config,
            generation: AtomicU64::new(0),
            active: ReentrantMutex::new(RefCell::new(None)),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// 当前订阅代数（每次 start 加一）
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().borrow().is_some()
    }

    /// 取消旧订阅（没有时无操作），再订阅最近 N 条消息
    ///
    /// 返回后旧订阅的通知不会再被渲染。
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let previous = self.active.lock().borrow_mut().take();
        if let Some(previous) = previous {
            debug!("取消旧订阅: generation={}", previous.generation);
            previous.shutdown();
        }

        let mut subscription = self.store.subscribe_last_n(self.config.window).await?;
        let cancel = subscription.cancellation_token();

        let active = self.active.lock();
        if self.generation() != generation {
            // 期间有更新的 start，本次订阅作废
            debug!("订阅已过期，放弃: generation={}", generation);
            subscription.cancel();
            return Ok(());
        }

        // 泵任务只持有弱引用，FeedSync 被 drop 后订阅随之关闭
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.dispatch(generation, event);
            }
            debug!("订阅泵退出: generation={}", generation);
        });

        let previous = active.borrow_mut().replace(ActiveSubscription {
            generation,
            cancel,
            task,
        });
        drop(active);
        if let Some(previous) = previous {
            previous.shutdown();
        }

        info!("✅ 消息订阅已建立: generation={}, window={}", generation, self.config.window);
        self.events
            .emit(event_builders::feed_started(generation, self.config.window));
        Ok(())
    }

    /// 取消当前订阅
    pub fn stop(&self) {
        let active = self.active.lock().borrow_mut().take();
        if let Some(active) = active {
            let generation = active.generation;
            active.shutdown();
            info!("🛑 消息订阅已取消: generation={}", generation);
            self.events.emit(event_builders::feed_stopped(generation));
        }
    }

    /// 在活跃订阅锁内投递，保证被替换的订阅不会再渲染
    ///
    /// 渲染时不持有 RefCell 借用，监听器重入 stop / start 不会死锁。
    fn dispatch(&self, generation: u64, event: StoreEvent) {
        let active = self.active.lock();
        let current = active.borrow().as_ref().map(|a| a.generation);
        if current != Some(generation) {
            debug!("丢弃过期订阅的通知: generation={}, id={}", generation, event.id());
            return;
        }

        let result = match event {
            StoreEvent::Added { id, record } => self.on_record_added(id, &record),
            StoreEvent::Changed { id, record } => self.on_record_changed(id, &record),
        };
        drop(active);

        if let Err(e) = result {
            warn!("⚠️ 忽略无法解码的消息: {}", e);
        }
    }

    /// 新记录通知
    pub fn on_record_added(&self, id: MessageId, fields: &MessageRecord) -> Result<()> {
        self.project(id, fields)
    }

    /// 记录变更通知；与新增相同，未显示过的 id 直接新增
    pub fn on_record_changed(&self, id: MessageId, fields: &MessageRecord) -> Result<()> {
        self.project(id, fields)
    }

    fn project(&self, id: MessageId, fields: &MessageRecord) -> Result<()> {
        let message = Message::from_record(id, fields, &self.config.profile_placeholder_url)?;
        self.renderer.upsert(&message);
        Ok(())
    }

    /// 未登录时发出提示并返回 NotSignedIn
    fn require_author<'a>(&self, author: &'a AuthState) -> Result<&'a AuthUser> {
        match author {
            AuthState::SignedIn(user) => Ok(user),
            AuthState::SignedOut => {
                self.events.emit(event_builders::notice(
                    self.config.sign_in_notice.clone(),
                    self.config.notice_timeout_ms,
                ));
                Err(OneChatError::NotSignedIn)
            }
        }
    }

    /// 发送文本消息
    ///
    /// 空文本不做任何事并返回 `Ok(None)`；写入失败只记录日志，不改本地状态。
    pub async fn post_text(&self, text: &str, author: &AuthState) -> Result<Option<MessageId>> {
        if text.is_empty() {
            return Ok(None);
        }
        let user = self.require_author(author)?;

        let record = MessageRecord::text(user, text, &self.config.profile_placeholder_url);
        match self.store.push(record).await {
            Ok(id) => {
                info!("📤 文本消息已写入: id={}", id);
                Ok(Some(id))
            }
            Err(e) => {
                error!("❌ 写入消息失败: {}", e);
                self.events.emit(event_builders::send_failed(None, &e));
                Err(e)
            }
        }
    }

    /// 发送图片消息
    ///
    /// 先写入 loading 占位记录，再上传图片，成功后把记录的 imageUrl 更新为 blob 引用。
    /// 上传失败时占位记录保持不变（一直显示 loading），返回 `OneChatError::Upload`；
    /// 上传成功但更新记录失败时返回 `OneChatError::PlaceholderUpdate`。
    /// 上传在独立任务中执行，调用方放弃等待也不会中断上传。
    pub async fn post_image(
        &self,
        bytes: Bytes,
        file_name: &str,
        content_type: &str,
        author: &AuthState,
    ) -> Result<MessageId> {
        let user = self.require_author(author)?;
        let path = blob_path(&user.uid, now_millis(), file_name)?;

        let placeholder = MessageRecord::pending_image(user, &self.config.profile_placeholder_url);
        let id = match self.store.push(placeholder).await {
            Ok(id) => id,
            Err(e) => {
                error!("❌ 写入图片占位消息失败: {}", e);
                self.events.emit(event_builders::send_failed(None, &e));
                return Err(e);
            }
        };
        info!("📤 图片占位消息已写入: id={}, path={}", id, path);

        let store = self.store.clone();
        let blob_store = self.blob_store.clone();
        let content_type = content_type.to_string();
        let message_id = id.clone();
        let upload = tokio::spawn(async move {
            let blob = blob_store
                .upload(&path, bytes, &content_type)
                .await
                .map_err(|e| OneChatError::Upload {
                    message_id: message_id.clone(),
                    reason: e.to_string(),
                })?;
            store
                .update(&message_id, RecordPatch::resolved_image(&blob))
                .await
                .map_err(|e| OneChatError::PlaceholderUpdate {
                    message_id: message_id.clone(),
                    reason: e.to_string(),
                })?;
            Ok::<_, OneChatError>(blob)
        });

        let result = match upload.await {
            Ok(result) => result,
            Err(join_error) => Err(OneChatError::Runtime(format!("upload task failed: {}", join_error))),
        };

        match result {
            Ok(blob) => {
                info!("✅ 图片上传完成: id={}, ref={}", id, blob);
                Ok(id)
            }
            Err(e) => {
                error!("❌ 图片消息发送失败，占位消息保留: id={}, error={}", id, e);
                self.events.emit(event_builders::send_failed(Some(id), &e));
                Err(e)
            }
        }
    }
}

impl Drop for FeedSync {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().get_mut().take() {
            active.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBlobStore, MemoryOrderedStore};
    use crate::events::ChatEvent;
    use crate::message::{ImageRef, MessageBody, LOADING_IMAGE_URL, PROFILE_PLACEHOLDER_URL};
    use crate::test_support::wait_for;

    struct Harness {
        feed: Arc<FeedSync>,
        store: Arc<MemoryOrderedStore>,
        blob: Arc<MemoryBlobStore>,
        view: Arc<FeedView>,
        events: Arc<EventManager>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryOrderedStore::new());
        let blob = Arc::new(MemoryBlobStore::new("bucket"));
        let events = Arc::new(EventManager::new(256));
        let view = Arc::new(FeedView::new(blob.clone(), events.clone()));
        let feed = Arc::new(FeedSync::new(
            store.clone(),
            blob.clone(),
            view.clone(),
            events.clone(),
            FeedConfig::default(),
        ));
        Harness {
            feed,
            store,
            blob,
            view,
            events,
        }
    }

    fn ann() -> AuthState {
        AuthState::SignedIn(AuthUser::new("u1", "Ann"))
    }

    fn text_record(text: &str) -> MessageRecord {
        MessageRecord {
            name: Some("Ann".into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_post_text_pushes_record_and_renders_from_notification() {
        let h = harness();
        h.feed.start().await.unwrap();

        let id = h.feed.post_text("hello", &ann()).await.unwrap().unwrap();
        assert_eq!(
            h.store.record(&id).unwrap(),
            MessageRecord {
                name: Some("Ann".into()),
                text: Some("hello".into()),
                photo_url: Some(PROFILE_PLACEHOLDER_URL.into()),
                image_url: None,
            }
        );

        wait_for(|| h.view.len() == 1).await;
        let rendered = h.view.get(&id).unwrap();
        assert_eq!(rendered.author_name, "Ann");
        assert_eq!(rendered.content, RenderedContent::Text { lines: vec!["hello".into()] });
    }

    #[tokio::test]
    async fn test_post_empty_text_is_noop() {
        let h = harness();
        assert_eq!(h.feed.post_text("", &ann()).await.unwrap(), None);
        assert_eq!(h.feed.post_text("", &AuthState::SignedOut).await.unwrap(), None);
        assert_eq!(h.store.push_count(), 0);
        assert_eq!(h.events.get_stats().total_events, 0);
    }

    #[tokio::test]
    async fn test_post_while_signed_out_signals_and_skips_store() {
        let h = harness();
        let mut rx = h.events.subscribe();

        let err = h.feed.post_text("hello", &AuthState::SignedOut).await.unwrap_err();
        assert!(err.is_not_signed_in());
        let err = h
            .feed
            .post_image(Bytes::from_static(b"png"), "cat.png", "image/png", &AuthState::SignedOut)
            .await
            .unwrap_err();
        assert!(err.is_not_signed_in());

        assert_eq!(h.store.push_count(), 0);
        assert_eq!(h.blob.upload_count(), 0);
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ChatEvent::Notice { message, timeout_ms, .. } => {
                    assert_eq!(message, DEFAULT_SIGN_IN_NOTICE);
                    assert_eq!(timeout_ms, 2000);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_write_failure_leaves_view_untouched() {
        let h = harness();
        h.feed.start().await.unwrap();
        h.store.set_fail_writes(true);

        let err = h.feed.post_text("hello", &ann()).await.unwrap_err();
        assert!(matches!(err, OneChatError::Store(_)));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.view.is_empty());
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn test_post_image_resolves_placeholder_in_place() {
        let h = harness();
        h.feed.start().await.unwrap();
        h.feed.post_text("before", &ann()).await.unwrap();
        wait_for(|| h.view.len() == 1).await;

        // 上传期间能观察到占位消息
        h.blob.set_upload_delay(std::time::Duration::from_millis(50));
        let feed = h.feed.clone();
        let post = tokio::spawn(async move {
            feed.post_image(Bytes::from_static(b"png"), "cat.png", "image/png", &ann())
                .await
        });

        wait_for(|| h.view.len() == 2).await;
        let placeholder = h.view.snapshot()[1].clone();
        assert_eq!(
            placeholder.content,
            RenderedContent::Image { src: LOADING_IMAGE_URL.into(), loading: true }
        );

        let id = post.await.unwrap().unwrap();
        assert_eq!(placeholder.id, id);

        let stored = h.store.record(&id).unwrap();
        let reference = match ImageRef::from_stored(stored.image_url.as_deref().unwrap()) {
            ImageRef::Blob(reference) => reference,
            other => panic!("unexpected image ref: {:?}", other),
        };
        assert!(reference.path().starts_with("u1/"));
        assert!(reference.path().ends_with("/cat.png"));

        wait_for(|| !h.view.get(&id).unwrap().content.is_loading()).await;
        assert_eq!(h.view.len(), 2);
        assert_eq!(h.view.position(&id), Some(1));
        assert_eq!(
            h.view.get(&id).unwrap().content,
            RenderedContent::Image { src: h.blob.download_url(&reference), loading: false }
        );
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_pending_placeholder() {
        let h = harness();
        h.feed.start().await.unwrap();
        h.blob.set_fail_uploads(true);
        let mut rx = h.events.subscribe();

        let err = h
            .feed
            .post_image(Bytes::from_static(b"png"), "cat.png", "image/png", &ann())
            .await
            .unwrap_err();
        let id = err.pending_message_id().cloned().unwrap();

        assert_eq!(h.store.record(&id).unwrap().image_url.as_deref(), Some(LOADING_IMAGE_URL));
        assert_eq!(h.store.update_count(), 0);

        wait_for(|| h.view.get(&id).is_some()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.view.get(&id).unwrap().content.is_loading());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::SendFailed { message_id, .. } = event {
                assert_eq!(message_id, Some(id.clone()));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_restart_keeps_single_subscription_without_duplicates() {
        let h = harness();
        h.store.push(text_record("one")).await.unwrap();

        h.feed.start().await.unwrap();
        h.feed.start().await.unwrap();
        assert_eq!(h.store.active_subscriptions(), 1);
        assert_eq!(h.feed.generation(), 2);
        wait_for(|| h.view.len() == 1).await;

        let mut rx = h.events.subscribe();
        let id = h.store.push(text_record("two")).await.unwrap();
        wait_for(|| h.view.len() == 2).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut appends = 0;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::TimelineDiff { diff_kind: crate::events::TimelineDiffKind::Append { item, .. }, .. } = event {
                assert_eq!(item.id, id);
                appends += 1;
            }
        }
        assert_eq!(appends, 1);
        assert_eq!(h.view.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_subscription() {
        let h = harness();
        h.feed.start().await.unwrap();
        assert!(h.feed.is_running());

        h.feed.stop();
        assert!(!h.feed.is_running());
        assert_eq!(h.store.active_subscriptions(), 0);

        h.store.push(text_record("late")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.view.is_empty());

        // 无订阅时 stop 是幂等的
        h.feed.stop();
    }

    #[tokio::test]
    async fn test_upsert_keeps_last_delivered_fields() {
        let h = harness();

        // changed 先于 added 到达也按 upsert 处理
        h.feed.on_record_changed("m1".into(), &text_record("first")).unwrap();
        h.feed.on_record_added("m1".into(), &text_record("second")).unwrap();
        h.feed.on_record_changed("m1".into(), &text_record("third")).unwrap();

        assert_eq!(h.view.len(), 1);
        assert_eq!(
            h.view.get(&"m1".into()).unwrap().content,
            RenderedContent::Text { lines: vec!["third".into()] }
        );
    }

    #[tokio::test]
    async fn test_window_limits_initial_load() {
        let h = harness();
        for i in 0..(DEFAULT_FEED_WINDOW + 5) {
            h.store.push(text_record(&format!("m{}", i))).await.unwrap();
        }

        h.feed.start().await.unwrap();
        wait_for(|| h.view.len() == DEFAULT_FEED_WINDOW).await;

        let first = h.view.snapshot().into_iter().next().unwrap();
        assert_eq!(first.content, RenderedContent::Text { lines: vec!["m5".into()] });
    }

    #[tokio::test]
    async fn test_undecodable_record_does_not_stop_feed() {
        let h = harness();
        h.feed.start().await.unwrap();

        h.store.push(MessageRecord::default()).await.unwrap();
        let id = h.store.push(text_record("fine")).await.unwrap();

        wait_for(|| h.view.get(&id).is_some()).await;
        assert_eq!(h.view.len(), 1);
        assert!(matches!(
            h.feed.on_record_added("bad".into(), &MessageRecord::default()),
            Err(OneChatError::Decode(_))
        ));
    }

    #[test]
    fn test_projection_decodes_image_body() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness();
            let record = MessageRecord {
                name: Some("Ann".into()),
                image_url: Some("https://example.com/cat.png".into()),
                ..Default::default()
            };
            h.feed.on_record_added("m1".into(), &record).unwrap();
            let message = Message::from_record("m1".into(), &record, PROFILE_PLACEHOLDER_URL).unwrap();
            assert_eq!(message.body, MessageBody::Image(ImageRef::Url("https://example.com/cat.png".into())));
            assert_eq!(
                h.view.get(&"m1".into()).unwrap().content,
                RenderedContent::Image { src: "https://example.com/cat.png".into(), loading: false }
            );
        });
    }

    #[tokio::test]
    async fn test_dropping_feed_closes_subscription() {
        let Harness { feed, store, .. } = harness();
        feed.start().await.unwrap();
        assert_eq!(store.active_subscriptions(), 1);

        drop(feed);
        assert_eq!(store.active_subscriptions(), 0);

        // 泵任务退出后不会再持有订阅
        store.push(text_record("after drop")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_listener_can_stop_feed_while_rendering() {
        let h = harness();
        let weak = Arc::downgrade(&h.feed);
        let observed_running = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observed = observed_running.clone();
        h.events.add_listener("timeline_diff", move |_| {
            let Some(feed) = weak.upgrade() else {
                return;
            };
            let mut observed = observed.lock();
            if observed.is_empty() {
                observed.push(feed.is_running());
                feed.stop();
            }
        });

        h.feed.start().await.unwrap();
        h.store.push(text_record("one")).await.unwrap();

        wait_for(|| !h.feed.is_running()).await;
        assert_eq!(h.view.len(), 1);
        assert_eq!(observed_running.lock().first().copied(), Some(true));
        assert_eq!(h.store.active_subscriptions(), 0);

        // 重新订阅后仍可正常工作
        h.feed.start().await.unwrap();
        h.store.push(text_record("two")).await.unwrap();
        wait_for(|| h.view.len() == 2).await;
        assert!(h.feed.is_running());
        assert_eq!(observed_running.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_update_failure_reports_message_id() {
        let h = harness();
        h.blob.set_upload_delay(std::time::Duration::from_millis(50));

        let feed = h.feed.clone();
        let post = tokio::spawn(async move {
            feed.post_image(Bytes::from_static(b"png"), "cat.png", "image/png", &ann())
                .await
        });

        // 占位记录写入后、上传完成前让存储拒绝写入
        wait_for(|| h.store.len() == 1).await;
        h.store.set_fail_writes(true);

        let err = post.await.unwrap().unwrap_err();
        assert!(matches!(err, OneChatError::PlaceholderUpdate { .. }));
        let id = err.pending_message_id().cloned().unwrap();
        assert_eq!(h.store.record(&id).unwrap().image_url.as_deref(), Some(LOADING_IMAGE_URL));
        assert_eq!(h.blob.upload_count(), 1);
    }
}
