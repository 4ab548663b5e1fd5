//! Outbound delivery worker: drains the outbound queue into `POST /send`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BridgeConfig,
    domain::{DeadLetter, InboundPayload, OutboundTask},
    ports::Backend,
    queue::{BoundedLog, InFlight, WorkQueue},
};

/// What happened to a task after one attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { retry_count: u32, attempts: u32 },
    /// The task goes back to the tail of the queue after `delay`.
    Retry { task: OutboundTask, delay: Duration },
    DeadLettered { attempts: u32 },
}

pub struct DeliveryWorker {
    cfg: Arc<BridgeConfig>,
    backend: Arc<dyn Backend>,
    outbound: Arc<WorkQueue<OutboundTask>>,
    inbound: Arc<WorkQueue<InboundPayload>>,
    dead_letters: Arc<BoundedLog<DeadLetter>>,
    in_flight: Arc<InFlight>,
}

impl DeliveryWorker {
    pub fn new(
        cfg: Arc<BridgeConfig>,
        backend: Arc<dyn Backend>,
        outbound: Arc<WorkQueue<OutboundTask>>,
        inbound: Arc<WorkQueue<InboundPayload>>,
        dead_letters: Arc<BoundedLog<DeadLetter>>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            cfg,
            backend,
            outbound,
            inbound,
            dead_letters,
            in_flight,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(url = %self.cfg.send_url(), "delivery worker started");
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.outbound.pop() => task,
            };

            match self.process_at(task, Instant::now()).await {
                DeliveryOutcome::Retry { task, delay } => self.requeue_after(task, delay, &cancel),
                DeliveryOutcome::Delivered { .. } | DeliveryOutcome::DeadLettered { .. } => {
                    self.in_flight.finish()
                }
            }
        }
        info!("delivery worker stopped");
    }

    /// Attempt one delivery of `task`, treating `now` as the attempt time.
    pub async fn process_at(&self, mut task: OutboundTask, now: Instant) -> DeliveryOutcome {
        task.begin_attempt_at(now, self.cfg.retry_delay);
        debug!(
            source = %task.envelope.source,
            app = %task.envelope.app,
            attempts = task.attempts,
            retry_count = task.retry_count,
            "delivering envelope"
        );

        let err = match self.backend.send(&task.envelope).await {
            Ok(reply) => {
                if let Some(notice) = reply.notice() {
                    info!(source = %task.envelope.source, notice = %notice, "backend notice");
                }
                if let Some(data) = reply.data {
                    self.inbound.push(InboundPayload::from_response(data));
                }
                return DeliveryOutcome::Delivered {
                    retry_count: task.retry_count,
                    attempts: task.attempts,
                };
            }
            Err(e) => e,
        };

        let retryable = err.is_retryable();
        if !retryable || task.attempts > self.cfg.max_retry {
            let attempts = task.attempts;
            error!(
                source = %task.envelope.source,
                app = %task.envelope.app,
                attempts,
                retry_count = task.retry_count,
                retryable,
                error = %err,
                "delivery failed permanently, dead-lettering envelope"
            );
            if let Some(evicted) = self.dead_letters.push(DeadLetter::new(task, err.to_string())) {
                warn!(
                    source = %evicted.envelope.source,
                    failed_at = %evicted.failed_at,
                    "dead-letter log full, dropped oldest entry"
                );
            }
            return DeliveryOutcome::DeadLettered { attempts };
        }

        let delay = self.cfg.retry_backoff.delay(task.attempts);
        warn!(
            source = %task.envelope.source,
            attempts = task.attempts,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "delivery failed, retrying"
        );
        DeliveryOutcome::Retry { task, delay }
    }

    /// Put `task` back at the tail once `delay` elapsed, without holding up
    /// the rest of the queue.
    fn requeue_after(&self, task: OutboundTask, delay: Duration, cancel: &CancellationToken) {
        if delay.is_zero() {
            self.outbound.push(task);
            return;
        }
        let outbound = self.outbound.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            outbound.push(task);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Envelope, PayloadOrigin, SendResponse},
        errors::Error,
        ports::ByteStream,
        retry::Backoff,
        Result,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays scripted replies and records every send.
    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<SendResponse>>>,
        sent: Mutex<Vec<Envelope>>,
    }

    impl ScriptedBackend {
        fn with(replies: Vec<Result<SendResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn send(&self, envelope: &Envelope) -> Result<SendResponse> {
            self.sent.lock().unwrap().push(envelope.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SendResponse::default()))
        }

        async fn open_events(&self, _last_event_id: Option<&str>) -> Result<ByteStream> {
            Err(Error::Transport("not used".to_string()))
        }
    }

    fn test_config(max_retry: u32) -> Arc<BridgeConfig> {
        Arc::new(BridgeConfig {
            max_retry,
            retry_delay: Duration::from_secs(300),
            retry_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..BridgeConfig::default()
        })
    }

    struct Harness {
        worker: DeliveryWorker,
        outbound: Arc<WorkQueue<OutboundTask>>,
        inbound: Arc<WorkQueue<InboundPayload>>,
        dead_letters: Arc<BoundedLog<DeadLetter>>,
        in_flight: Arc<InFlight>,
    }

    fn harness(cfg: Arc<BridgeConfig>, backend: Arc<ScriptedBackend>) -> Harness {
        let outbound = Arc::new(WorkQueue::new());
        let inbound = Arc::new(WorkQueue::new());
        let dead_letters = Arc::new(BoundedLog::new(10));
        let in_flight = Arc::new(InFlight::new());
        let worker = DeliveryWorker::new(
            cfg,
            backend,
            outbound.clone(),
            inbound.clone(),
            dead_letters.clone(),
            in_flight.clone(),
        );
        Harness {
            worker,
            outbound,
            inbound,
            dead_letters,
            in_flight,
        }
    }

    fn hi() -> Envelope {
        Envelope::new(json!({"Content": "hi"}), "itchat", "wechat")
    }

    fn reply(data: serde_json::Value) -> Result<SendResponse> {
        Ok(SendResponse {
            data: Some(data),
            message: None,
        })
    }

    #[tokio::test]
    async fn reply_data_reaches_inbound_queue_without_retry() {
        let backend = ScriptedBackend::with(vec![reply(json!({"reply": "ok"}))]);
        let h = harness(test_config(5), backend.clone());
        let t0 = Instant::now();

        let outcome = h.worker.process_at(OutboundTask::new_at(hi(), t0), t0).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered { retry_count: 0, attempts: 1 }
        ));
        let payload = h.inbound.try_pop().unwrap();
        assert_eq!(payload.origin, PayloadOrigin::Response);
        assert_eq!(payload.data, json!({"reply": "ok"}));
        assert_eq!(backend.sent(), vec![hi()]);
    }

    #[tokio::test]
    async fn failure_then_late_success_counts_one_retry() {
        let backend = ScriptedBackend::with(vec![
            Err(Error::status(500, "boom")),
            reply(json!({"reply": "ok"})),
        ]);
        let h = harness(test_config(5), backend.clone());
        let t0 = Instant::now();

        let task = match h.worker.process_at(OutboundTask::new_at(hi(), t0), t0).await {
            DeliveryOutcome::Retry { task, .. } => task,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(task.retry_count, 0);
        assert!(h.inbound.is_empty());

        let later = t0 + Duration::from_secs(301);
        let outcome = h.worker.process_at(task, later).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered { retry_count: 1, attempts: 2 }
        ));
        assert_eq!(backend.sent().len(), 2);
        assert_eq!(h.inbound.try_pop().unwrap().data, json!({"reply": "ok"}));
    }

    #[tokio::test]
    async fn quick_retries_leave_retry_count_alone() {
        let backend = ScriptedBackend::with(vec![
            Err(Error::Transport("refused".into())),
            Err(Error::Transport("refused".into())),
        ]);
        let h = harness(test_config(5), backend);
        let t0 = Instant::now();

        let mut task = OutboundTask::new_at(hi(), t0);
        for step in 1..=2u64 {
            task = match h.worker.process_at(task, t0 + Duration::from_secs(step)).await {
                DeliveryOutcome::Retry { task, .. } => task,
                other => panic!("expected retry, got {other:?}"),
            };
        }
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_dead_lettered() {
        let backend = ScriptedBackend::with(
            (0..3).map(|_| Err(Error::status(503, "unavailable"))).collect(),
        );
        let h = harness(test_config(2), backend.clone());
        let t0 = Instant::now();

        let mut task = OutboundTask::new_at(hi(), t0);
        for _ in 0..2 {
            task = match h.worker.process_at(task, t0).await {
                DeliveryOutcome::Retry { task, .. } => task,
                other => panic!("expected retry, got {other:?}"),
            };
        }
        let outcome = h.worker.process_at(task, t0).await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 3 }));
        assert_eq!(backend.sent().len(), 3);
        let dead = h.dead_letters.snapshot();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope, hi());
        assert!(dead[0].reason.contains("503"), "{}", dead[0].reason);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_dead_lettered_at_once() {
        let backend = ScriptedBackend::with(vec![Err(Error::Config("bad envelope".into()))]);
        let h = harness(test_config(5), backend.clone());
        let t0 = Instant::now();

        let outcome = h.worker.process_at(OutboundTask::new_at(hi(), t0), t0).await;

        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 1 }));
        assert_eq!(backend.sent().len(), 1);
        assert!(h.dead_letters.snapshot()[0].reason.contains("bad envelope"));
    }

    #[tokio::test]
    async fn run_delivers_in_fifo_order() {
        let backend = ScriptedBackend::with(vec![]);
        let h = harness(test_config(5), backend.clone());
        let envelopes: Vec<_> = (0..5)
            .map(|i| Envelope::new(json!({"n": i}), "itchat", "wechat"))
            .collect();
        for e in &envelopes {
            h.outbound.push(OutboundTask::new(e.clone()));
        }

        let cancel = CancellationToken::new();
        let running = tokio::spawn(h.worker.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.sent().len() < envelopes.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(backend.sent(), envelopes);
        assert!(h.outbound.is_empty());
    }

    #[tokio::test]
    async fn run_requeues_failed_task_behind_later_ones() {
        let backend = ScriptedBackend::with(vec![
            Err(Error::Transport("refused".into())),
            Ok(SendResponse::default()),
            Ok(SendResponse::default()),
        ]);
        let h = harness(test_config(5), backend.clone());
        let first = Envelope::new(json!({"n": 1}), "itchat", "wechat");
        let second = Envelope::new(json!({"n": 2}), "itchat", "wechat");
        for e in [&first, &second] {
            h.in_flight.begin();
            h.outbound.push(OutboundTask::new(e.clone()));
        }

        let cancel = CancellationToken::new();
        let running = tokio::spawn(h.worker.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.sent().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(backend.sent(), vec![first.clone(), second, first]);
        // Settled only once delivered, not when the first attempt failed.
        assert_eq!(h.in_flight.get(), 0);
    }
}
