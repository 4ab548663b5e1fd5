//! Dispatch worker: hands inbound payloads to the platform adapter, one at a time.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{domain::InboundPayload, ports::PayloadHandler, queue::WorkQueue};

pub struct Dispatcher {
    inbound: Arc<WorkQueue<InboundPayload>>,
    handler: Arc<dyn PayloadHandler>,
}

impl Dispatcher {
    pub fn new(inbound: Arc<WorkQueue<InboundPayload>>, handler: Arc<dyn PayloadHandler>) -> Self {
        Self { inbound, handler }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = self.inbound.pop() => payload,
            };
            self.dispatch(payload).await;
        }

        // Payloads already handed back by the backend are not dropped.
        let mut drained = 0usize;
        while let Some(payload) = self.inbound.try_pop() {
            self.dispatch(payload).await;
            drained += 1;
        }
        info!(drained, "dispatcher stopped");
    }

    /// Run the handler on one payload. A failing or panicking handler is
    /// logged and the payload dropped; returns whether it succeeded.
    pub async fn dispatch(&self, payload: InboundPayload) -> bool {
        let origin = payload.origin;
        match AssertUnwindSafe(self.handler.process(payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                debug!(?origin, "payload dispatched");
                true
            }
            Ok(Err(e)) => {
                error!(?origin, error = %e, "payload handler failed");
                false
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(?origin, panic = %msg, "payload handler panicked");
                false
            }
        }
    }
}
