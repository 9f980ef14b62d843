//! 消息列表视图
//!
//! 每个消息 id 对应且只对应一个显示单元：未见过的 id 追加到末尾，见过的 id 原位更新。
//! blob 图片先显示 loading 图，异步解析出 URL 后再替换。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::blob::{BlobRef, BlobStore};
use crate::events::{event_builders, EventManager, TimelineDiffKind};
use crate::message::{ImageRef, Message, MessageBody, MessageId, LOADING_IMAGE_URL};

/// 显示内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderedContent {
    /// 文本按换行拆分为多行
    Text { lines: Vec<String> },
    /// 图片；loading 为 true 时 src 是 loading 占位图
    Image { src: String, loading: bool },
}

impl RenderedContent {
    pub fn is_loading(&self) -> bool {
        matches!(self, RenderedContent::Image { loading: true, .. })
    }
}

/// 一个显示单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub id: MessageId,
    pub author_name: String,
    pub author_pic_url: String,
    pub content: RenderedContent,
}

/// 渲染器：按 id 生成或更新显示单元
pub trait FeedRenderer: Send + Sync {
    fn upsert(&self, message: &Message);
}

struct Slot {
    rendered: RenderedMessage,
    revision: u64,
}

#[derive(Default)]
struct ViewState {
    order: Vec<MessageId>,
    slots: HashMap<MessageId, Slot>,
    next_revision: u64,
}

impl ViewState {
    fn upsert(&mut self, rendered: RenderedMessage) -> (TimelineDiffKind, u64) {
        self.next_revision += 1;
        let revision = self.next_revision;
        let id = rendered.id.clone();

        let diff = if self.slots.contains_key(&id) {
            let index = self.position(&id).unwrap_or_default();
            TimelineDiffKind::UpdateByItemId {
                item_id: id.clone(),
                index,
                item: rendered.clone(),
            }
        } else {
            self.order.push(id.clone());
            TimelineDiffKind::Append {
                index: self.order.len() - 1,
                item: rendered.clone(),
            }
        };

        self.slots.insert(id, Slot { rendered, revision });
        (diff, revision)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.order.iter().position(|item| item == id)
    }
}

/// 内存中的消息列表视图
pub struct FeedView {
    state: Arc<RwLock<ViewState>>,
    blob_store: Arc<dyn BlobStore>,
    events: Arc<EventManager>,
}

impl FeedView {
    pub fn new(blob_store: Arc<dyn BlobStore>, events: Arc<EventManager>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ViewState::default())),
            blob_store,
            events,
        }
    }

    /// 按显示顺序返回所有单元
    pub fn snapshot(&self) -> Vec<RenderedMessage> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.slots.get(id).map(|slot| slot.rendered.clone()))
            .collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<RenderedMessage> {
        self.state.read().slots.get(id).map(|slot| slot.rendered.clone())
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.state.read().position(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn render(message: &Message) -> (RenderedMessage, Option<BlobRef>) {
        let (content, blob) = match &message.body {
            MessageBody::Text(text) => (
                RenderedContent::Text {
                    lines: text.split('\n').map(str::to_string).collect(),
                },
                None,
            ),
            MessageBody::Image(ImageRef::Pending) => (
                RenderedContent::Image {
                    src: LOADING_IMAGE_URL.to_string(),
                    loading: true,
                },
                None,
            ),
            MessageBody::Image(ImageRef::Url(url)) => (
                RenderedContent::Image {
                    src: url.clone(),
                    loading: false,
                },
                None,
            ),
            MessageBody::Image(ImageRef::Blob(blob)) => (
                RenderedContent::Image {
                    src: LOADING_IMAGE_URL.to_string(),
                    loading: true,
                },
                Some(blob.clone()),
            ),
        };

        let rendered = RenderedMessage {
            id: message.id.clone(),
            author_name: message.author_name.clone(),
            author_pic_url: message.author_photo_url.clone(),
            content,
        };
        (rendered, blob)
    }

    fn spawn_resolve(&self, id: MessageId, blob: BlobRef, revision: u64) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("⚠️ 没有 tokio 运行时，图片保持 loading: id={}, ref={}", id, blob);
                return;
            }
        };

        let state = self.state.clone();
        let blob_store = self.blob_store.clone();
        let events = self.events.clone();

        handle.spawn(async move {
            let url = match blob_store.resolve(&blob).await {
                Ok(url) => url,
                Err(e) => {
                    warn!("⚠️ 解析图片引用失败，保持 loading: id={}, ref={}, error={}", id, blob, e);
                    return;
                }
            };

            let diff = {
                let mut state = state.write();
                let index = state.position(&id);
                match (state.slots.get_mut(&id), index) {
                    // 期间有更新的 upsert，丢弃过期的解析结果
                    (Some(slot), Some(index)) if slot.revision == revision => {
                        slot.rendered.content = RenderedContent::Image {
                            src: url,
                            loading: false,
                        };
                        Some(TimelineDiffKind::UpdateByItemId {
                            item_id: id.clone(),
                            index,
                            item: slot.rendered.clone(),
                        })
                    }
                    _ => None,
                }
            };

            match diff {
                Some(diff) => {
                    debug!("🖼️ 图片已解析: id={}", id);
                    events.emit(event_builders::timeline(diff));
                }
                None => debug!("图片解析结果已过期: id={}", id),
            }
        });
    }
}

impl FeedRenderer for FeedView {
    fn upsert(&self, message: &Message) {
        let (rendered, blob) = Self::render(message);
        let (diff, revision) = self.state.write().upsert(rendered);

        debug!("渲染消息: id={}", message.id);
        self.events.emit(event_builders::timeline(diff));

        if let Some(blob) = blob {
            self.spawn_resolve(message.id.clone(), blob, revision);
        }
    }
}
