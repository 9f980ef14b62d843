//! 身份提供方接口
//!
//! 登录流程完全由外部身份提供方负责，SDK 只关心当前用户以及登录状态变化回调。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// 已登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    /// 用户 ID（用于 blob 上传路径）
    pub uid: String,
    /// 显示名称
    pub display_name: String,
    /// 头像 URL
    pub photo_url: Option<String>,
}

impl AuthUser {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            photo_url: None,
        }
    }

    pub fn with_photo_url(mut self, photo_url: impl Into<String>) -> Self {
        self.photo_url = Some(photo_url.into());
        self
    }

    /// 头像 URL，没有时返回占位头像
    pub fn photo_url_or(&self, placeholder: &str) -> String {
        self.photo_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| placeholder.to_string())
    }
}

/// 登录状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    SignedOut,
    SignedIn(AuthUser),
}

impl AuthState {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, AuthState::SignedIn(_))
    }

    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthState::SignedIn(user) => Some(user),
            AuthState::SignedOut => None,
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState::SignedOut
    }
}

impl From<Option<AuthUser>> for AuthState {
    fn from(user: Option<AuthUser>) -> Self {
        match user {
            Some(user) => AuthState::SignedIn(user),
            None => AuthState::SignedOut,
        }
    }
}

/// 身份提供方（由平台层实现，如 OAuth 弹窗登录）
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// 当前登录状态
    fn current_user(&self) -> AuthState;

    /// 发起登录；结果通过 `subscribe` 的状态变化回调送达
    async fn sign_in(&self) -> Result<()>;

    /// 退出登录
    async fn sign_out(&self) -> Result<()>;

    /// 订阅登录状态变化（onAuthStateChanged）
    fn subscribe(&self) -> broadcast::Receiver<AuthState>;
}
