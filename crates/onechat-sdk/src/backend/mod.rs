//! 能力接口的内置实现
//!
//! - memory：内存实现，用于测试与演示
//! - sled_store：基于 sled 的持久化有序存储
//! - local_blob：本地文件系统 blob 存储

pub mod local_blob;
pub mod memory;
pub mod push_id;
pub mod sled_store;

pub use local_blob::{BlobMetadata, LocalBlobStore};
pub use memory::{MemoryBlobStore, MemoryIdentityProvider, MemoryOrderedStore};
pub use push_id::PushIdGenerator;
pub use sled_store::SledOrderedStore;
