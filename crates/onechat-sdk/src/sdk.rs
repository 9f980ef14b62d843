//! 统一 SDK 接口 - OneChatSDK 主入口
//!
//! 组件关系：
//! ```text
//! OneChatSDK
//!   ├── ChatSession (登录状态 / 发送入口)
//!   │     └── FeedSync (订阅最近 N 条消息、发送文本与图片)
//!   │           └── FeedView (按 id upsert 的消息列表)
//!   └── EventManager (事件广播)
//! ```
//!
//! 三个能力接口（IdentityProvider / OrderedStore / BlobStore）由调用方注入，
//! 或用 `open_local` 在 `data_dir` 下打开内置的 sled 存储与本地 blob 存储。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{LocalBlobStore, SledOrderedStore};
use crate::blob::BlobStore;
use crate::composer::Composer;
use crate::error::{OneChatError, Result};
use crate::events::{ChatEvent, EventManager};
use crate::feed::{FeedConfig, FeedSync, FeedView, DEFAULT_FEED_WINDOW};
use crate::identity::{AuthState, IdentityProvider};
use crate::message::{MessageId, PROFILE_PLACEHOLDER_URL};
use crate::session::{ChatSession, HeaderView};
use crate::store::OrderedStore;
use crate::version;

/// OneChat SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OneChatConfig {
    /// 数据存储目录（open_local 使用）
    pub data_dir: PathBuf,
    /// blob 存储桶，必须配置
    pub storage_bucket: String,
    /// 消息在有序存储中的路径
    pub messages_path: String,
    /// 订阅最近多少条消息
    pub feed_window: usize,
    /// 用户无头像时使用的占位头像
    pub profile_placeholder_url: String,
    /// 未登录发送时的提示文案
    pub sign_in_notice: String,
    /// 提示展示时长（毫秒）
    pub notice_timeout_ms: u64,
    /// 事件广播容量
    pub event_capacity: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for OneChatConfig {
    fn default() -> Self {
        let feed = FeedConfig::default();
        Self {
            data_dir: get_default_data_dir(),
            storage_bucket: String::new(),
            messages_path: "messages".to_string(),
            feed_window: DEFAULT_FEED_WINDOW,
            profile_placeholder_url: PROFILE_PLACEHOLDER_URL.to_string(),
            sign_in_notice: feed.sign_in_notice,
            notice_timeout_ms: feed.notice_timeout_ms,
            event_capacity: 1000,
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.onechat/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".onechat")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".onechat")
    } else {
        PathBuf::from("./onechat_data")
    }
}

impl OneChatConfig {
    pub fn builder() -> OneChatConfigBuilder {
        OneChatConfigBuilder::new()
    }

    /// 从 JSON 文件加载，缺省字段取默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| OneChatError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| OneChatError::Config(format!("解析配置文件 {} 失败: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 启动前的配置检查
    pub fn validate(&self) -> Result<()> {
        if self.storage_bucket.trim().is_empty() {
            return Err(OneChatError::Config(
                "storage bucket is not configured; set storage_bucket before starting".to_string(),
            ));
        }
        if self.messages_path.trim().is_empty() {
            return Err(OneChatError::Config("messages_path must not be empty".to_string()));
        }
        if self.feed_window == 0 {
            return Err(OneChatError::Config("feed_window must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn to_feed_config(&self) -> FeedConfig {
        FeedConfig {
            window: self.feed_window,
            profile_placeholder_url: self.profile_placeholder_url.clone(),
            sign_in_notice: self.sign_in_notice.clone(),
            notice_timeout_ms: self.notice_timeout_ms,
        }
    }
}

pub struct OneChatConfigBuilder {
    config: OneChatConfig,
}

impl OneChatConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OneChatConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn storage_bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.config.storage_bucket = bucket.into();
        self
    }

    pub fn messages_path<S: Into<String>>(mut self, path: S) -> Self {
        self.config.messages_path = path.into();
        self
    }

    pub fn feed_window(mut self, window: usize) -> Self {
        self.config.feed_window = window;
        self
    }

    pub fn profile_placeholder_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.profile_placeholder_url = url.into();
        self
    }

    pub fn sign_in_notice<S: Into<String>>(mut self, notice: S, timeout_ms: u64) -> Self {
        self.config.sign_in_notice = notice.into();
        self.config.notice_timeout_ms = timeout_ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> OneChatConfig {
        self.config
    }
}

impl Default for OneChatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// OneChat SDK 主入口
pub struct OneChatSDK {
    config: OneChatConfig,
    events: Arc<EventManager>,
    view: Arc<FeedView>,
    feed: Arc<FeedSync>,
    session: Arc<ChatSession>,
    initialized: AtomicBool,
}

impl OneChatSDK {
    /// 用注入的能力接口组装 SDK
    pub fn new(
        config: OneChatConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn OrderedStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;
        if config.debug_mode {
            debug!("OneChat 配置: {:?}", config);
        }

        let events = Arc::new(EventManager::new(config.event_capacity));
        let view = Arc::new(FeedView::new(blob_store.clone(), events.clone()));
        let feed = Arc::new(FeedSync::new(
            store,
            blob_store,
            view.clone(),
            events.clone(),
            config.to_feed_config(),
        ));
        let session = Arc::new(ChatSession::new(identity, feed.clone(), events.clone()));

        Ok(Self {
            config,
            events,
            view,
            feed,
            session,
            initialized: AtomicBool::new(false),
        })
    }

    /// 在 `data_dir` 下打开 sled 消息存储（`db/`）与本地 blob 存储（`blobs/`）
    pub fn open_local(config: OneChatConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        config.validate()?;
        let store = SledOrderedStore::open(&config.data_dir.join("db"), &config.messages_path)?;
        let blob_store = LocalBlobStore::new(config.data_dir.join("blobs"), config.storage_bucket.clone())?;
        info!("📁 本地数据目录: {}", config.data_dir.display());
        Self::new(config, identity, Arc::new(store), Arc::new(blob_store))
    }

    /// 挂载会话：处理当前登录状态并开始监听变化
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("OneChatSDK 已初始化，忽略重复调用");
            return Ok(());
        }
        info!("🚀 初始化 {}", version::user_agent());
        if let Err(e) = self.session.attach().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("✅ OneChatSDK 初始化完成");
        Ok(())
    }

    /// 停止监听登录状态并取消消息订阅
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 OneChatSDK...");
        self.session.detach();
        self.feed.stop();
        self.initialized.store(false, Ordering::SeqCst);
        info!("OneChatSDK 关闭完成");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &OneChatConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> &Arc<FeedView> {
        &self.view
    }

    pub fn feed(&self) -> &Arc<FeedSync> {
        &self.feed
    }

    pub fn session(&self) -> &Arc<ChatSession> {
        &self.session
    }

    pub fn header(&self) -> HeaderView {
        self.session.header()
    }

    pub fn current_user(&self) -> AuthState {
        self.session.current_user()
    }

    pub async fn sign_in(&self) -> Result<()> {
        self.session.sign_in().await
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.session.sign_out().await
    }

    pub async fn send_text(&self, text: &str) -> Result<Option<MessageId>> {
        self.session.send_text(text).await
    }

    pub async fn send_image(&self, bytes: Bytes, file_name: &str, content_type: &str) -> Result<MessageId> {
        self.session.send_image(bytes, file_name, content_type).await
    }

    pub async fn submit(&self, composer: &mut Composer) -> Result<Option<MessageId>> {
        self.session.submit(composer).await
    }
}

impl Drop for OneChatSDK {
    fn drop(&mut self) {
        self.session.detach();
        self.feed.stop();
    }
}
