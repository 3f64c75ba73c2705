use dashmap::DashMap;
use serde_json::Value;
use shared_types::{EventStatus, ProgressEvent, RequestId, Stage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;

/// Process-wide publish/subscribe facility keyed by request id. Publishing
/// never blocks: live fan-out rides a broadcast channel whose drop-oldest
/// behavior surfaces to slow subscribers as a `lagged` marker, and late
/// subscribers replay the buffered prefix of the stream.
pub struct ProgressBus {
    channels: DashMap<RequestId, RequestChannel>,
    max_replay: usize,
}

struct RequestChannel {
    tx: broadcast::Sender<ProgressEvent>,
    replay: Mutex<VecDeque<ProgressEvent>>,
}

impl ProgressBus {
    pub fn new(max_replay: usize) -> Self {
        ProgressBus {
            channels: DashMap::new(),
            max_replay: max_replay.max(1),
        }
    }

    /// Register a request's channel ahead of its first event so subscribers
    /// arriving between submission and the RECEIVED event miss nothing.
    pub fn ensure_channel(&self, request_id: RequestId) {
        self.channels.entry(request_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.max_replay.max(16));
            RequestChannel {
                tx,
                replay: Mutex::new(VecDeque::new()),
            }
        });
    }

    /// Publish one event. Events for different requests never share a queue.
    pub fn publish(&self, event: ProgressEvent) {
        self.ensure_channel(event.request_id);
        let Some(channel) = self.channels.get(&event.request_id) else {
            return;
        };

        let mut replay = channel.replay.lock().expect("replay lock poisoned");
        if replay.len() == self.max_replay {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        // A send error only means no live subscriber; the replay buffer
        // still serves late ones.
        let _ = channel.tx.send(event);
    }

    /// Subscribe to a request's stream: buffered events first, then live
    /// ones, closing after a terminal event. Returns `None` for unknown ids.
    pub fn subscribe(&self, request_id: RequestId) -> Option<ProgressSubscription> {
        let channel = self.channels.get(&request_id)?;
        let replay_guard = channel.replay.lock().expect("replay lock poisoned");
        let rx = channel.tx.subscribe();
        let replay = replay_guard.clone();
        drop(replay_guard);

        Some(ProgressSubscription {
            request_id,
            replay,
            rx,
            done: false,
        })
    }

    /// Drop a request's channel once its record is reclaimed.
    pub fn remove(&self, request_id: RequestId) {
        self.channels.remove(&request_id);
    }
}

/// Publishing handle bound to one request: stamps every event with the
/// request id and monotonic milliseconds since submission.
#[derive(Clone)]
pub struct RequestEmitter {
    bus: Arc<ProgressBus>,
    request_id: RequestId,
    submitted_at: Instant,
}

impl RequestEmitter {
    pub fn new(bus: Arc<ProgressBus>, request_id: RequestId, submitted_at: Instant) -> Self {
        bus.ensure_channel(request_id);
        RequestEmitter {
            bus,
            request_id,
            submitted_at,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.submitted_at.elapsed().as_millis() as u64
    }

    pub fn emit(
        &self,
        stage: Stage,
        status: EventStatus,
        progress_pct: u8,
        message: &str,
        payload: Option<Value>,
    ) {
        self.bus.publish(ProgressEvent {
            request_id: self.request_id,
            stage,
            status,
            progress_pct,
            message: message.to_string(),
            payload,
            timestamp_ms: self.elapsed_ms(),
        });
    }
}

/// One subscriber's view of a request's event stream.
pub struct ProgressSubscription {
    request_id: RequestId,
    replay: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
    done: bool,
}

impl ProgressSubscription {
    /// Next event, or `None` once a terminal event has been delivered (or
    /// the request's channel was torn down).
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }

        if let Some(event) = self.replay.pop_front() {
            if event.is_terminal() {
                self.done = true;
            }
            return Some(event);
        }

        match self.rx.recv().await {
            Ok(event) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(ProgressEvent::lagged(self.request_id, skipped, 0))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{EventStatus, Stage};
    use uuid::Uuid;

    fn event(request_id: RequestId, stage: Stage, status: EventStatus, n: u64) -> ProgressEvent {
        ProgressEvent {
            request_id,
            stage,
            status,
            progress_pct: 0,
            message: format!("event-{n}"),
            payload: None,
            timestamp_ms: n,
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_publish_order() {
        let bus = ProgressBus::new(64);
        let id = Uuid::new_v4();
        bus.ensure_channel(id);
        let mut sub = bus.subscribe(id).unwrap();

        bus.publish(event(id, Stage::Received, EventStatus::Started, 1));
        bus.publish(event(id, Stage::Detection, EventStatus::Started, 2));
        bus.publish(event(id, Stage::Detection, EventStatus::Completed, 3));

        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 1);
        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 2);
        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 3);
    }

    #[tokio::test]
    async fn replay_is_bounded_by_max_replay() {
        let bus = ProgressBus::new(3);
        let id = Uuid::new_v4();

        for n in 1..=6 {
            bus.publish(event(id, Stage::Dispatch, EventStatus::Progress, n));
        }

        let mut sub = bus.subscribe(id).unwrap();
        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 4);
        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 5);
        assert_eq!(sub.recv().await.unwrap().timestamp_ms, 6);
    }

    #[tokio::test]
    async fn terminal_event_closes_the_stream() {
        let bus = ProgressBus::new(64);
        let id = Uuid::new_v4();
        let mut sub = {
            bus.ensure_channel(id);
            bus.subscribe(id).unwrap()
        };

        bus.publish(event(id, Stage::Complete, EventStatus::Completed, 1));

        assert!(sub.recv().await.unwrap().is_terminal());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn distinct_requests_do_not_share_queues() {
        let bus = ProgressBus::new(64);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        bus.ensure_channel(a);
        bus.ensure_channel(b);
        let mut sub_a = bus.subscribe(a).unwrap();

        bus.publish(event(b, Stage::Received, EventStatus::Started, 1));
        bus.publish(event(a, Stage::Received, EventStatus::Started, 2));

        let got = sub_a.recv().await.unwrap();
        assert_eq!(got.request_id, a);
        assert_eq!(got.timestamp_ms, 2);
    }

    #[test]
    fn unknown_request_has_no_stream() {
        let bus = ProgressBus::new(64);
        assert!(bus.subscribe(Uuid::new_v4()).is_none());
    }
}
