//! ライフサイクルイベントの通知
//!
//! 通知は投げっぱなしで、失敗してもオーケストレーションを止めません。

use crate::runner::RestartReason;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// 通知されるイベント
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        name: String,
        container: String,
    },
    Stopped {
        name: String,
    },
    Crashed {
        name: String,
        exit_code: Option<i64>,
    },
    RestartScheduled {
        name: String,
        reason: RestartReason,
    },
    BackoffEntered {
        name: String,
        attempt: u32,
        #[serde(with = "fleetvisor_core::duration_secs")]
        delay: Duration,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &str {
        match self {
            LifecycleEvent::Started { name, .. }
            | LifecycleEvent::Stopped { name }
            | LifecycleEvent::Crashed { name, .. }
            | LifecycleEvent::RestartScheduled { name, .. }
            | LifecycleEvent::BackoffEntered { name, .. } => name,
        }
    }
}

/// 通知先
///
/// `notify` はロック区間内から呼ばれるため、ブロックしてはいけません。
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// tracing に出力するだけの通知先
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Started { name, container } => {
                tracing::info!(process = %name, container = %container, "process started");
            }
            LifecycleEvent::Stopped { name } => {
                tracing::info!(process = %name, "process stopped");
            }
            LifecycleEvent::Crashed { name, exit_code } => {
                tracing::warn!(process = %name, exit_code = ?exit_code, "process crashed");
            }
            LifecycleEvent::RestartScheduled { name, reason } => {
                tracing::info!(process = %name, reason = %reason, "restart scheduled");
            }
            LifecycleEvent::BackoffEntered {
                name,
                attempt,
                delay,
            } => {
                tracing::warn!(
                    process = %name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "crash loop detected; entering backoff"
                );
            }
        }
    }
}

/// イベントをチャネルへ流す通知先（外部への配信やテスト用）
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: &LifecycleEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(process = %event.name(), "notification receiver dropped");
        }
    }
}

/// 複数の通知先へ配る
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(&LifecycleEvent::Stopped {
            name: "mybot".to_string(),
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "mybot");
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // 受信側が無くても失敗しない
        sink.notify(&LifecycleEvent::Crashed {
            name: "mybot".to_string(),
            exit_code: Some(1),
        });
    }

    #[test]
    fn test_fanout() {
        let (first, mut first_rx) = ChannelSink::new();
        let (second, mut second_rx) = ChannelSink::new();
        let fanout = FanoutSink::new().with(first).with(TracingSink).with(second);

        fanout.notify(&LifecycleEvent::BackoffEntered {
            name: "mybot".to_string(),
            attempt: 1,
            delay: Duration::from_secs(10),
        });

        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
    }

    #[test]
    fn test_event_json() {
        let event = LifecycleEvent::Crashed {
            name: "mybot".to_string(),
            exit_code: Some(137),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "crashed");
        assert_eq!(json["exit_code"], 137);
    }
}
