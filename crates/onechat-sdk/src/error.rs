use crate::message::MessageId;

/// SDK 错误类型
///
/// 所有错误都只影响触发它的那一次用户操作，SDK 内部不做任何自动重试。
#[derive(Debug, thiserror::Error)]
pub enum OneChatError {
    /// 发送前未登录（前置条件失败，向用户展示提示）
    #[error("Not signed in")]
    NotSignedIn,

    /// OrderedStore 拒绝写入（push / update）
    #[error("Store error: {0}")]
    Store(String),

    /// BlobStore 上传失败；占位消息保留为 loading 状态
    #[error("Upload error for message {message_id}: {reason}")]
    Upload {
        message_id: MessageId,
        reason: String,
    },

    /// 上传成功但把占位记录更新为 blob 引用失败；占位消息保留为 loading 状态
    #[error("Placeholder update error for message {message_id}: {reason}")]
    PlaceholderUpdate {
        message_id: MessageId,
        reason: String,
    },

    /// blob 引用解析为可访问 URL 失败
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// 存储记录无法解码为 Message
    #[error("Decode error: {0}")]
    Decode(String),

    /// 身份提供方错误
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    /// 订阅已被取消或后端已关闭
    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<serde_json::Error> for OneChatError {
    fn from(error: serde_json::Error) -> Self {
        OneChatError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for OneChatError {
    fn from(error: std::io::Error) -> Self {
        OneChatError::IO(error.to_string())
    }
}

impl From<sled::Error> for OneChatError {
    fn from(error: sled::Error) -> Self {
        OneChatError::KvStore(error.to_string())
    }
}

impl OneChatError {
    /// 是否为“未登录”前置条件失败
    pub fn is_not_signed_in(&self) -> bool {
        matches!(self, OneChatError::NotSignedIn)
    }

    /// 图片消息发送失败时返回仍处于 loading 的占位消息 id
    pub fn pending_message_id(&self) -> Option<&MessageId> {
        match self {
            OneChatError::Upload { message_id, .. }
            | OneChatError::PlaceholderUpdate { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OneChatError>;
