//! 有序实时记录存储接口
//!
//! OrderedStore 是消息的唯一权威来源：追加写入、按 id 部分更新、订阅最近 N 条记录。
//! 订阅建立时先按插入顺序升序投递已有记录的 Added 事件，之后实时投递 Added / Changed。

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::message::{MessageId, MessageRecord, RecordPatch};

/// 存储通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added { id: MessageId, record: MessageRecord },
    Changed { id: MessageId, record: MessageRecord },
}

impl StoreEvent {
    pub fn id(&self) -> &MessageId {
        match self {
            StoreEvent::Added { id, .. } | StoreEvent::Changed { id, .. } => id,
        }
    }

    pub fn record(&self) -> &MessageRecord {
        match self {
            StoreEvent::Added { record, .. } | StoreEvent::Changed { record, .. } => record,
        }
    }
}

/// 可取消的订阅；drop 时自动取消
#[derive(Debug)]
pub struct StoreSubscription {
    events: mpsc::UnboundedReceiver<StoreEvent>,
    cancel: CancellationToken,
}

impl StoreSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<StoreEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// 下一条通知；订阅取消或后端关闭后返回 None
    pub async fn next(&mut self) -> Option<StoreEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 有序记录存储（由平台层或 backend 模块实现）
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// 追加一条记录，返回存储分配的 id
    async fn push(&self, record: MessageRecord) -> Result<MessageId>;

    /// 按 id 部分更新记录
    async fn update(&self, id: &MessageId, patch: RecordPatch) -> Result<()>;

    /// 订阅最近 `n` 条记录
    async fn subscribe_last_n(&self, n: usize) -> Result<StoreSubscription>;
}

struct Subscriber {
    id: u64,
    window: usize,
    sender: mpsc::UnboundedSender<StoreEvent>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }
}

/// 存储后端共用的订阅者集合
///
/// 调用方需要在持有自身写锁时调用，保证“快照 + 注册”与后续写入的通知顺序一致。
#[derive(Default)]
pub struct SubscriberSet {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新订阅：先投递 `initial`（已按插入顺序升序），再接收实时通知
    pub fn register(&mut self, window: usize, initial: Vec<(MessageId, MessageRecord)>) -> StoreSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        for (id, record) in initial {
            let _ = sender.send(StoreEvent::Added { id, record });
        }

        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id: self.next_id,
            window,
            sender,
            cancel: cancel.clone(),
        });
        debug!("📡 新订阅 #{} (window={})", self.next_id, window);

        StoreSubscription::new(receiver, cancel)
    }

    /// 新记录总是位于窗口内
    pub fn notify_added(&mut self, id: &MessageId, record: &MessageRecord) {
        self.prune();
        for subscriber in &self.subscribers {
            if subscriber.window == 0 {
                continue;
            }
            let _ = subscriber.sender.send(StoreEvent::Added {
                id: id.clone(),
                record: record.clone(),
            });
        }
    }

    /// `rank` 为记录距最新一条的位置（最新 = 1），只通知窗口覆盖到它的订阅者
    pub fn notify_changed(&mut self, id: &MessageId, record: &MessageRecord, rank: usize) {
        self.prune();
        for subscriber in &self.subscribers {
            if rank == 0 || rank > subscriber.window {
                debug!("订阅 #{} 窗口外的变更被忽略: {}", subscriber.id, id);
                continue;
            }
            let _ = subscriber.sender.send(StoreEvent::Changed {
                id: id.clone(),
                record: record.clone(),
            });
        }
    }

    /// 当前仍然有效的订阅数
    pub fn active_count(&mut self) -> usize {
        self.prune();
        self.subscribers.len()
    }

    fn prune(&mut self) {
        self.subscribers.retain(|s| !s.is_closed());
    }
}
