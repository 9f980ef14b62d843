//! Blob 存储接口
//!
//! 图片消息的二进制内容上传到 BlobStore，消息记录里只保存 `gs://bucket/path` 形式的不透明引用，
//! 显示前再通过 `resolve` 换成可访问的 URL。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OneChatError, Result};

/// blob 引用的 scheme
pub const BLOB_REF_SCHEME: &str = "gs://";

/// BlobStore 中对象的不透明引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    bucket: String,
    path: String,
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// 解析 `gs://bucket/path`，不是 blob 引用时返回 None
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(BLOB_REF_SCHEME)?;
        let (bucket, path) = rest.split_once('/')?;
        if bucket.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self::new(bucket, path))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", BLOB_REF_SCHEME, self.bucket, self.path)
    }
}

/// 图片上传路径：`{uid}/{timestamp_ms}/{file_name}`
pub fn blob_path(uid: &str, timestamp_ms: i64, file_name: &str) -> Result<String> {
    if uid.is_empty() || uid.contains('/') {
        return Err(OneChatError::InvalidArgument(format!("invalid uid for blob path: {:?}", uid)));
    }
    // 只保留文件名部分
    let file_name = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(OneChatError::InvalidArgument("file name is empty".to_string()));
    }
    Ok(format!("{}/{}/{}", uid, timestamp_ms, file_name))
}

/// Blob 存储（由平台层或 backend 模块实现）
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 上传内容到 `path`，返回对象引用
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<BlobRef>;

    /// 把对象引用解析为可访问的 URL
    async fn resolve(&self, reference: &BlobRef) -> Result<String>;
}
