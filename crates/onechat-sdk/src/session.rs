//! 会话：登录状态驱动的头部显示、消息流启动与发送入口

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::composer::Composer;
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::feed::FeedSync;
use crate::identity::{AuthState, IdentityProvider};
use crate::message::MessageId;

/// 头部区域的显示模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderView {
    /// 登录后显示的用户名
    pub user_name: Option<String>,
    /// 登录后显示的头像
    pub user_pic: Option<String>,
    pub sign_in_visible: bool,
    pub sign_out_visible: bool,
}

impl HeaderView {
    pub fn from_state(state: &AuthState, profile_placeholder: &str) -> Self {
        match state {
            AuthState::SignedIn(user) => Self {
                user_name: Some(user.display_name.clone()),
                user_pic: Some(user.photo_url_or(profile_placeholder)),
                sign_in_visible: false,
                sign_out_visible: true,
            },
            AuthState::SignedOut => Self::signed_out(),
        }
    }

    fn signed_out() -> Self {
        Self {
            user_name: None,
            user_pic: None,
            sign_in_visible: true,
            sign_out_visible: false,
        }
    }
}

struct AuthListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 聊天会话
pub struct ChatSession {
    identity: Arc<dyn IdentityProvider>,
    feed: Arc<FeedSync>,
    events: Arc<EventManager>,
    header: RwLock<HeaderView>,
    listener: Mutex<Option<AuthListener>>,
}

impl ChatSession {
    pub fn new(identity: Arc<dyn IdentityProvider>, feed: Arc<FeedSync>, events: Arc<EventManager>) -> Self {
        Self {
            identity,
            feed,
            events,
            header: RwLock::new(HeaderView::signed_out()),
            listener: Mutex::new(None),
        }
    }

    pub fn header(&self) -> HeaderView {
        self.header.read().clone()
    }

    pub fn current_user(&self) -> AuthState {
        self.identity.current_user()
    }

    pub fn feed(&self) -> &Arc<FeedSync> {
        &self.feed
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// 立即处理当前登录状态，之后在后台处理每一次状态变化
    pub async fn attach(self: &Arc<Self>) -> Result<()> {
        self.detach();

        // 先订阅再读取当前状态，避免漏掉两者之间的变化
        let mut receiver = self.identity.subscribe();
        self.apply_auth_state(self.identity.current_user()).await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        // 只持有弱引用，会话被 drop 后监听随之退出
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(state) => Some(state),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("⚠️ 登录状态通知滞后 {} 条，按当前状态处理", skipped);
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                let state = received.unwrap_or_else(|| this.identity.current_user());
                if let Err(e) = this.apply_auth_state(state).await {
                    error!("❌ 处理登录状态变化失败: {}", e);
                }
            }
            debug!("登录状态监听退出");
        });

        *self.listener.lock() = Some(AuthListener { cancel, task });
        info!("✅ 会话已挂载");
        Ok(())
    }

    /// 停止监听登录状态
    pub fn detach(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.cancel.cancel();
            listener.task.abort();
            info!("会话已卸载");
        }
    }

    /// 登录后显示用户信息并（重新）启动消息流；退出后只切换头部显示
    pub async fn apply_auth_state(&self, state: AuthState) -> Result<()> {
        let header = HeaderView::from_state(&state, &self.feed.config().profile_placeholder_url);
        *self.header.write() = header;
        self.events.emit(event_builders::auth_state_changed(state.clone()));

        match state {
            AuthState::SignedIn(user) => {
                info!("🔐 已登录: uid={}", user.uid);
                self.feed.start().await
            }
            AuthState::SignedOut => {
                info!("🔓 已退出登录");
                Ok(())
            }
        }
    }

    /// 结果只通过登录状态回调生效
    pub async fn sign_in(&self) -> Result<()> {
        self.identity.sign_in().await
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.identity.sign_out().await
    }

    pub async fn send_text(&self, text: &str) -> Result<Option<MessageId>> {
        let author = self.identity.current_user();
        self.feed.post_text(text, &author).await
    }

    pub async fn send_image(&self, bytes: Bytes, file_name: &str, content_type: &str) -> Result<MessageId> {
        let author = self.identity.current_user();
        self.feed.post_image(bytes, file_name, content_type, &author).await
    }

    /// 发送输入框内容，写入成功后清空输入框
    pub async fn submit(&self, composer: &mut Composer) -> Result<Option<MessageId>> {
        if !composer.can_submit() {
            return Ok(None);
        }
        let sent = self.send_text(composer.input()).await?;
        if sent.is_some() {
            composer.clear();
        }
        Ok(sent)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.cancel.cancel();
            listener.task.abort();
        }
    }
}
