//! OneChat SDK - 群聊客户端核心
//!
//! 本 SDK 提供：
//! - 📡 消息流同步：订阅最近 N 条消息，按 id 原位 upsert
//! - 💬 发送文本消息与图片消息（先占位，上传完成后原位更新）
//! - 🔐 登录状态驱动的会话与头部显示
//! - ⚙️ 事件系统：统一的事件广播与监听
//! - 💾 内置后端：内存实现、sled 持久化存储、本地文件 blob 存储
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use onechat_sdk::{AuthUser, Composer, MemoryIdentityProvider, OneChatConfig, OneChatSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OneChatConfig::builder()
//!         .data_dir("/path/to/data")
//!         .storage_bucket("onechat.appspot.com")
//!         .build();
//!
//!     let identity = Arc::new(MemoryIdentityProvider::new().with_account(AuthUser::new("u1", "Ann")));
//!     let sdk = OneChatSDK::open_local(config, identity)?;
//!     sdk.initialize().await?;
//!     sdk.sign_in().await?;
//!
//!     let mut composer = Composer::new();
//!     composer.set_input("Hello, World!");
//!     sdk.submit(&mut composer).await?;
//!
//!     for message in sdk.view().snapshot() {
//!         println!("{}: {:?}", message.author_name, message.content);
//!     }
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod utils;
pub mod message;
pub mod identity;
pub mod blob;
pub mod store;
pub mod events;
pub mod feed;
pub mod session;
pub mod composer;
pub mod sdk;
pub mod backend;

// 重新导出核心类型，方便使用
pub use error::{OneChatError, Result};
pub use sdk::{OneChatConfig, OneChatConfigBuilder, OneChatSDK};
pub use message::{
    ImageRef, Message, MessageBody, MessageId, MessageRecord, RecordPatch, LOADING_IMAGE_URL,
    PROFILE_PLACEHOLDER_URL,
};
pub use identity::{AuthState, AuthUser, IdentityProvider};
pub use blob::{BlobRef, BlobStore};
pub use store::{OrderedStore, StoreEvent, StoreSubscription};
pub use events::{ChatEvent, EventManager, TimelineDiffKind};
pub use feed::{FeedConfig, FeedRenderer, FeedSync, FeedView, RenderedContent, RenderedMessage};
pub use session::{ChatSession, HeaderView};
pub use composer::Composer;
pub use backend::{
    LocalBlobStore, MemoryBlobStore, MemoryIdentityProvider, MemoryOrderedStore, PushIdGenerator,
    SledOrderedStore,
};
