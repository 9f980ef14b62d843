//! 本地文件系统 blob 存储
//!
//! 对象存放在 `{root}/{bucket}/{path}`，旁边写一个 `{path}.meta.json` 记录内容类型与大小。
//! `resolve` 返回 `file://` URL。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::blob::{BlobRef, BlobStore};
use crate::error::{OneChatError, Result};
use crate::utils::now_millis;

const META_SUFFIX: &str = ".meta.json";

/// 对象元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub content_type: String,
    pub size: u64,
    pub uploaded_at: i64,
}

/// 本地 blob 存储
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    bucket: String,
    bucket_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl AsRef<Path>, bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(OneChatError::Config(format!("invalid storage bucket: {:?}", bucket)));
        }
        let bucket_dir = root.as_ref().join(&bucket);
        std::fs::create_dir_all(&bucket_dir)
            .map_err(|e| OneChatError::IO(format!("创建 blob 目录失败: {}", e)))?;
        info!("✅ 本地 blob 存储: {}", bucket_dir.display());
        Ok(Self { bucket, bucket_dir })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// 读取对象内容
    pub async fn read(&self, reference: &BlobRef) -> Result<Bytes> {
        let file = self.object_path(reference)?;
        match fs::read(&file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OneChatError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn metadata(&self, reference: &BlobRef) -> Result<BlobMetadata> {
        let file = self.object_path(reference)?;
        let data = match fs::read(Self::meta_path(&file)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OneChatError::NotFound(reference.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn object_path(&self, reference: &BlobRef) -> Result<PathBuf> {
        if reference.bucket() != self.bucket {
            return Err(OneChatError::NotFound(reference.to_string()));
        }
        self.resolve_path(reference.path())
    }

    /// 只接受普通的相对路径，拒绝 `..` 与绝对路径
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && !path.ends_with(META_SUFFIX)
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(OneChatError::InvalidArgument(format!("invalid blob path: {:?}", path)));
        }
        Ok(self.bucket_dir.join(relative))
    }

    fn meta_path(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<BlobRef> {
        let file = self.resolve_path(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&file, &bytes).await?;
        let metadata = BlobMetadata {
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            uploaded_at: now_millis(),
        };
        fs::write(Self::meta_path(&file), serde_json::to_vec(&metadata)?).await?;

        let reference = BlobRef::new(self.bucket.clone(), path);
        debug!("📤 本地 blob 已写入: {} ({} bytes)", reference, metadata.size);
        Ok(reference)
    }

    async fn resolve(&self, reference: &BlobRef) -> Result<String> {
        let file = self.object_path(reference)?;
        if !fs::try_exists(&file).await? {
            return Err(OneChatError::NotFound(reference.to_string()));
        }
        let absolute = fs::canonicalize(&file).await?;
        Ok(format!("file://{}", absolute.display()))
    }
}
