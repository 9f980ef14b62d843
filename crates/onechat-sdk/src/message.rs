//! 消息实体
//!
//! - `MessageRecord`：写入/读出 OrderedStore 的记录形状（字段名 `name`/`text`/`photoUrl`/`imageUrl`）
//! - `Message`：解码后的领域实体，`MessageBody` 保证文本与图片互斥
//! - `ImageRef`：图片消息的两阶段状态 Pending → Resolved

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::blob::BlobRef;
use crate::error::{OneChatError, Result};
use crate::identity::AuthUser;

/// 图片上传完成前占位的 loading 图片
pub const LOADING_IMAGE_URL: &str = "https://www.google.com/images/spin-32.gif";

/// 用户没有头像时使用的占位头像
pub const PROFILE_PLACEHOLDER_URL: &str = "/images/profile_placeholder.png";

/// 存储分配的消息 ID（与插入顺序单调一致）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// 图片引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageRef {
    /// 上传中，记录里保存的是 loading 占位 URL
    Pending,
    /// BlobStore 中的对象（`gs://` 引用），显示前需要解析为可访问 URL
    Blob(BlobRef),
    /// 可直接访问的 URL
    Url(String),
}

impl ImageRef {
    /// 按记录中保存的字符串分类
    pub fn from_stored(value: &str) -> Self {
        if value == LOADING_IMAGE_URL {
            ImageRef::Pending
        } else if let Some(blob) = BlobRef::parse(value) {
            ImageRef::Blob(blob)
        } else {
            ImageRef::Url(value.to_string())
        }
    }

    /// 写回记录时使用的字符串
    pub fn to_stored(&self) -> String {
        match self {
            ImageRef::Pending => LOADING_IMAGE_URL.to_string(),
            ImageRef::Blob(blob) => blob.to_string(),
            ImageRef::Url(url) => url.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ImageRef::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_pending()
    }
}

/// 消息内容：文本与图片二选一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    Image(ImageRef),
}

impl MessageBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageRef> {
        match self {
            MessageBody::Image(image) => Some(image),
            MessageBody::Text(_) => None,
        }
    }
}

/// 解码后的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author_name: String,
    pub author_photo_url: String,
    pub body: MessageBody,
}

impl Message {
    /// 从存储记录解码
    ///
    /// `photoUrl` 缺失时使用 `profile_placeholder`；空文本视为缺失。
    pub fn from_record(id: MessageId, record: &MessageRecord, profile_placeholder: &str) -> Result<Self> {
        let author_name = record
            .name
            .clone()
            .ok_or_else(|| OneChatError::Decode(format!("message {} has no author name", id)))?;

        let text = record.text.as_deref().filter(|t| !t.is_empty());
        let image = record.image_url.as_deref().filter(|u| !u.is_empty());

        let body = match (text, image) {
            (Some(text), None) => MessageBody::Text(text.to_string()),
            (None, Some(image)) => MessageBody::Image(ImageRef::from_stored(image)),
            (Some(_), Some(_)) => {
                return Err(OneChatError::Decode(format!(
                    "message {} carries both text and imageUrl",
                    id
                )))
            }
            (None, None) => {
                return Err(OneChatError::Decode(format!(
                    "message {} carries neither text nor imageUrl",
                    id
                )))
            }
        };

        let author_photo_url = record
            .photo_url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| profile_placeholder.to_string());

        Ok(Self {
            id,
            author_name,
            author_photo_url,
            body,
        })
    }

    pub fn is_pending_image(&self) -> bool {
        matches!(&self.body, MessageBody::Image(ImageRef::Pending))
    }
}

/// OrderedStore 中的记录形状
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl MessageRecord {
    /// 文本消息记录 `{name, text, photoUrl}`
    pub fn text(author: &AuthUser, text: impl Into<String>, profile_placeholder: &str) -> Self {
        Self {
            name: Some(author.display_name.clone()),
            text: Some(text.into()),
            photo_url: Some(author.photo_url_or(profile_placeholder)),
            image_url: None,
        }
    }

    /// 图片占位记录 `{name, imageUrl: LOADING, photoUrl}`
    pub fn pending_image(author: &AuthUser, profile_placeholder: &str) -> Self {
        Self {
            name: Some(author.display_name.clone()),
            text: None,
            photo_url: Some(author.photo_url_or(profile_placeholder)),
            image_url: Some(LOADING_IMAGE_URL.to_string()),
        }
    }

    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(image_url) = &patch.image_url {
            self.image_url = Some(image_url.clone());
        }
    }
}

/// 记录的部分更新（目前只会更新 imageUrl）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl RecordPatch {
    /// 上传完成后把占位图替换为 blob 引用
    pub fn resolved_image(blob: &BlobRef) -> Self {
        Self {
            image_url: Some(blob.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image_url.is_none()
    }
}
