//! 事件系统模块 - 把 SDK 内部状态变化通知给 UI 层
//!
//! 功能包括：
//! - 登录状态变化事件
//! - 时间线差异事件（新增 / 原位更新）
//! - 提示事件（如“请先登录”）
//! - 发送失败事件
//! - 事件广播和订阅机制

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::feed::view::RenderedMessage;
use crate::identity::AuthState;
use crate::message::MessageId;
use crate::utils::now_secs;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatEvent {
    /// 登录状态变更
    AuthStateChanged {
        state: AuthState,
        timestamp: u64,
    },
    /// 时间线差异
    TimelineDiff {
        diff_kind: TimelineDiffKind,
        timestamp: u64,
    },
    /// 需要展示给用户的短暂提示
    Notice {
        message: String,
        timeout_ms: u64,
        timestamp: u64,
    },
    /// 发送失败（写入被拒绝或上传失败）；message_id 为已创建的占位消息
    SendFailed {
        message_id: Option<MessageId>,
        error: String,
        timestamp: u64,
    },
    /// 消息订阅已（重新）建立
    FeedStarted {
        generation: u64,
        window: usize,
        timestamp: u64,
    },
    /// 消息订阅已取消
    FeedStopped {
        generation: u64,
        timestamp: u64,
    },
}

/// 时间线差异类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TimelineDiffKind {
    /// 追加新消息到列表末尾
    Append {
        index: usize,
        item: RenderedMessage,
    },
    /// 原位更新已有消息
    UpdateByItemId {
        item_id: MessageId,
        index: usize,
        item: RenderedMessage,
    },
}

impl ChatEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::AuthStateChanged { .. } => "auth_state_changed",
            ChatEvent::TimelineDiff { .. } => "timeline_diff",
            ChatEvent::Notice { .. } => "notice",
            ChatEvent::SendFailed { .. } => "send_failed",
            ChatEvent::FeedStarted { .. } => "feed_started",
            ChatEvent::FeedStopped { .. } => "feed_stopped",
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            ChatEvent::AuthStateChanged { timestamp, .. }
            | ChatEvent::TimelineDiff { timestamp, .. }
            | ChatEvent::Notice { timestamp, .. }
            | ChatEvent::SendFailed { timestamp, .. }
            | ChatEvent::FeedStarted { timestamp, .. }
            | ChatEvent::FeedStopped { timestamp, .. } => *timestamp,
        }
    }

    /// 关联的消息 ID（如果有）
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            ChatEvent::TimelineDiff { diff_kind, .. } => match diff_kind {
                TimelineDiffKind::Append { item, .. } => Some(&item.id),
                TimelineDiffKind::UpdateByItemId { item_id, .. } => Some(item_id),
            },
            ChatEvent::SendFailed { message_id, .. } => message_id.as_ref(),
            _ => None,
        }
    }
}

/// 事件构建工具
pub mod event_builders {
    use super::*;

    pub fn auth_state_changed(state: AuthState) -> ChatEvent {
        ChatEvent::AuthStateChanged {
            state,
            timestamp: now_secs(),
        }
    }

    pub fn timeline(diff_kind: TimelineDiffKind) -> ChatEvent {
        ChatEvent::TimelineDiff {
            diff_kind,
            timestamp: now_secs(),
        }
    }

    pub fn notice(message: impl Into<String>, timeout_ms: u64) -> ChatEvent {
        ChatEvent::Notice {
            message: message.into(),
            timeout_ms,
            timestamp: now_secs(),
        }
    }

    pub fn send_failed(message_id: Option<MessageId>, error: impl ToString) -> ChatEvent {
        ChatEvent::SendFailed {
            message_id,
            error: error.to_string(),
            timestamp: now_secs(),
        }
    }

    pub fn feed_started(generation: u64, window: usize) -> ChatEvent {
        ChatEvent::FeedStarted {
            generation,
            window,
            timestamp: now_secs(),
        }
    }

    pub fn feed_stopped(generation: u64) -> ChatEvent {
        ChatEvent::FeedStopped {
            generation,
            timestamp: now_secs(),
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
///
/// `emit` 是同步的，渲染器等非 async 上下文可以直接发事件。
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<ChatEvent>,
    /// 事件监听器映射
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: ChatEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 先取出监听器再调用，监听器里可以再次 emit 或注册监听
        let matched: Vec<EventListener> = {
            let listeners = self.listeners.read();
            [event.event_type(), "*"]
                .iter()
                .filter_map(|key| listeners.get(*key))
                .flatten()
                .cloned()
                .collect()
        };
        for listener in matched {
            listener(&event);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器（`"*"` 监听所有事件）
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Arc::new(listener));

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
