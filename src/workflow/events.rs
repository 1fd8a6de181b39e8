//! 阶段事件与按类别订阅
//!
//! 每个订阅者持有独立的无界通道，发送方从不阻塞；同一实例的事件按发出顺序到达。
//! 接收端已关闭的订阅在下一次发送时被清理。

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Starting,
    Completed,
    Failed,
    WaitingApproval,
}

/// 一次阶段状态变化
#[derive(Debug, Clone, Serialize)]
pub struct PhaseEvent {
    pub instance_id: String,
    pub phase_id: String,
    pub phase_name: String,
    pub status: EventCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub type SubscriptionId = u64;

/// 订阅句柄；丢弃即等同于取消订阅
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<PhaseEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<PhaseEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PhaseEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventCategory>,
    tx: mpsc::UnboundedSender<PhaseEvent>,
}

#[derive(Default)]
struct BusState {
    next_id: SubscriptionId,
    subscribers: Vec<Subscriber>,
}

/// 事件总线（由执行器持有，不是全局单例）
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, filter: Option<EventCategory>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    /// 只接收某一类别的事件
    pub fn subscribe(&self, category: EventCategory) -> Subscription {
        self.add(Some(category))
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.add(None)
    }

    /// 显式取消订阅；id 不存在时返回 false
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn emit(&self, event: PhaseEvent) {
        let mut state = self.lock();
        state.subscribers.retain(|s| {
            if s.filter.map_or(true, |f| f == event.status) {
                s.tx.send(event.clone()).is_ok()
            } else {
                !s.tx.is_closed()
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(phase: &str, status: EventCategory) -> PhaseEvent {
        PhaseEvent {
            instance_id: "i".into(),
            phase_id: phase.into(),
            phase_name: phase.to_uppercase(),
            status,
            output: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_category_filter() {
        let bus = EventBus::new();
        let mut completed = bus.subscribe(EventCategory::Completed);
        let mut all = bus.subscribe_all();

        bus.emit(event("a", EventCategory::Starting));
        bus.emit(event("a", EventCategory::Completed));

        assert_eq!(completed.try_recv().map(|e| e.status), Some(EventCategory::Completed));
        assert!(completed.try_recv().is_none());
        assert_eq!(all.try_recv().map(|e| e.status), Some(EventCategory::Starting));
        assert_eq!(all.try_recv().map(|e| e.status), Some(EventCategory::Completed));
    }

    #[test]
    fn test_unsubscribe_and_prune() {
        let bus = EventBus::new();
        let a = bus.subscribe_all();
        let b = bus.subscribe(EventCategory::Failed);
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(a.id()));
        assert!(!bus.unsubscribe(a.id()));
        assert_eq!(bus.subscriber_count(), 1);

        drop(b);
        bus.emit(event("x", EventCategory::Starting));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_order_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventCategory::Completed);
        for p in ["p1", "p2", "p3"] {
            bus.emit(event(p, EventCategory::Completed));
        }
        let order: Vec<String> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.phase_id).collect();
        assert_eq!(order, vec!["p1", "p2", "p3"]);
    }
}
