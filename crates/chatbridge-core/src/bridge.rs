//! Bridge lifecycle: owns the queues and spawns the three workers.
//!
//! A [`Bridge`] is an explicit context object. Processes that want a single
//! shared instance can [`install`] one; the first install wins.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::BridgeConfig,
    delivery::DeliveryWorker,
    dispatch::Dispatcher,
    domain::{DeadLetter, Envelope, InboundPayload, OutboundTask},
    errors::Error,
    http::HttpBackend,
    listener::StreamListener,
    ports::{Backend, PayloadHandler},
    queue::{BoundedLog, InFlight, WorkQueue},
    Result,
};

pub struct Bridge {
    cfg: Arc<BridgeConfig>,
    backend: Arc<dyn Backend>,
    handler: Arc<dyn PayloadHandler>,
    outbound: Arc<WorkQueue<OutboundTask>>,
    inbound: Arc<WorkQueue<InboundPayload>>,
    dead_letters: Arc<BoundedLog<DeadLetter>>,
    in_flight: Arc<InFlight>,
    started: AtomicBool,
}

impl Bridge {
    pub fn new(
        cfg: BridgeConfig,
        backend: Arc<dyn Backend>,
        handler: Arc<dyn PayloadHandler>,
    ) -> Arc<Self> {
        let dead_letters = Arc::new(BoundedLog::new(cfg.dead_letter_capacity));
        Arc::new(Self {
            cfg: Arc::new(cfg),
            backend,
            handler,
            outbound: Arc::new(WorkQueue::new()),
            inbound: Arc::new(WorkQueue::new()),
            dead_letters,
            in_flight: Arc::new(InFlight::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Bridge talking to the configured backend over HTTP.
    pub fn with_http(cfg: BridgeConfig, handler: Arc<dyn PayloadHandler>) -> Result<Arc<Self>> {
        let backend = Arc::new(HttpBackend::new(&cfg)?);
        Ok(Self::new(cfg, backend, handler))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    /// Queue an envelope for delivery. Never blocks.
    pub fn enqueue(&self, envelope: Envelope) {
        self.in_flight.begin();
        self.outbound.push(OutboundTask::new(envelope));
    }

    /// Envelopes enqueued but not yet delivered or dead-lettered, including
    /// the one being sent and those waiting to be retried.
    pub fn pending(&self) -> usize {
        self.in_flight.get()
    }

    /// Wait until every enqueued envelope is delivered or dead-lettered.
    /// Reply data is in the inbound queue by then.
    pub async fn drained(&self) {
        self.in_flight.wait_idle().await;
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Envelopes that exhausted their delivery attempts, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot()
    }

    /// Spawn the delivery, listener and dispatch loops. Must be called from
    /// within a tokio runtime, and only once per bridge.
    pub fn start(self: &Arc<Self>) -> Result<BridgeHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("bridge already started".to_string()));
        }

        let cancel = CancellationToken::new();
        let delivery = DeliveryWorker::new(
            self.cfg.clone(),
            self.backend.clone(),
            self.outbound.clone(),
            self.inbound.clone(),
            self.dead_letters.clone(),
            self.in_flight.clone(),
        );
        let listener = StreamListener::new(self.cfg.clone(), self.backend.clone(), self.inbound.clone());
        let dispatcher = Dispatcher::new(self.inbound.clone(), self.handler.clone());

        let tasks = vec![
            ("delivery", tokio::spawn(delivery.run(cancel.clone()))),
            ("listener", tokio::spawn(listener.run(cancel.clone()))),
            ("dispatch", tokio::spawn(dispatcher.run(cancel.clone()))),
        ];
        info!(base_url = %self.cfg.base_url, "bridge started");
        Ok(BridgeHandle { cancel, tasks })
    }
}

/// Running workers of a started [`Bridge`].
pub struct BridgeHandle {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BridgeHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all workers and wait for them to exit. Inbound payloads already
    /// queued are still dispatched.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!(worker = name, error = %e, "worker ended abnormally");
            }
        }
        info!("bridge stopped");
    }
}

static GLOBAL: OnceLock<Arc<Bridge>> = OnceLock::new();

/// Make `bridge` the process-wide instance unless one is already installed.
/// Returns whichever instance ends up installed.
pub fn install(bridge: Arc<Bridge>) -> Arc<Bridge> {
    GLOBAL.get_or_init(|| bridge).clone()
}

pub fn global() -> Option<Arc<Bridge>> {
    GLOBAL.get().cloned()
}
