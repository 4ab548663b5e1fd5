//! Events stream listener: keeps `GET /events` open and feeds the inbound queue.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    domain::InboundPayload,
    errors::Error,
    ports::Backend,
    queue::WorkQueue,
    sse::{EventRecord, EventStreamDecoder},
};

/// Where to resume after a reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub last_event_id: Option<String>,
    pub retry_hint: Option<Duration>,
}

/// How one connection ended.
#[derive(Debug)]
pub struct SessionEnd {
    /// Records decoded on this connection.
    pub records: usize,
    /// `None` when the backend closed the stream cleanly.
    pub error: Option<Error>,
}

pub struct StreamListener {
    cfg: Arc<BridgeConfig>,
    backend: Arc<dyn Backend>,
    inbound: Arc<WorkQueue<InboundPayload>>,
}

impl StreamListener {
    pub fn new(
        cfg: Arc<BridgeConfig>,
        backend: Arc<dyn Backend>,
        inbound: Arc<WorkQueue<InboundPayload>>,
    ) -> Self {
        Self {
            cfg,
            backend,
            inbound,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(url = %self.cfg.events_url(), "stream listener started");
        let mut cursor = StreamCursor::default();
        let mut failures: u32 = 0;

        loop {
            let end = tokio::select! {
                _ = cancel.cancelled() => break,
                end = self.listen_once(&mut cursor) => end,
            };

            if end.records > 0 {
                failures = 0;
            }
            failures = failures.saturating_add(1);
            let delay = self.reconnect_delay(failures, &cursor);

            match &end.error {
                Some(e) => warn!(
                    error = %e,
                    records = end.records,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "event stream failed, reconnecting"
                ),
                None => info!(
                    records = end.records,
                    delay_ms = delay.as_millis() as u64,
                    "event stream closed by backend, reconnecting"
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("stream listener stopped");
    }

    /// Backoff for the `failures`-th consecutive failure, raised to the
    /// server's `retry:` hint but never past the backoff ceiling.
    fn reconnect_delay(&self, failures: u32, cursor: &StreamCursor) -> Duration {
        let backoff = &self.cfg.reconnect_backoff;
        let delay = backoff.delay(failures);
        match cursor.retry_hint {
            Some(hint) => delay.max(hint.min(backoff.max)),
            None => delay,
        }
    }

    /// Hold one connection until it fails, times out or is closed.
    pub async fn listen_once(&self, cursor: &mut StreamCursor) -> SessionEnd {
        let mut records = 0;
        let error = self.pump(cursor, &mut records).await.err();
        SessionEnd { records, error }
    }

    async fn pump(&self, cursor: &mut StreamCursor, records: &mut usize) -> crate::Result<()> {
        let mut stream = self
            .backend
            .open_events(cursor.last_event_id.as_deref())
            .await?;
        debug!(last_event_id = ?cursor.last_event_id, "event stream connected");

        let mut decoder =
            EventStreamDecoder::resume(cursor.last_event_id.clone(), cursor.retry_hint);
        let read_timeout = self.cfg.stream_read_timeout;

        let outcome = loop {
            let chunk = match tokio::time::timeout(read_timeout, stream.next()).await {
                Err(_) => {
                    break Err(Error::Transport(format!(
                        "no data on event stream for {}s",
                        read_timeout.as_secs()
                    )))
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let decoded = decoder.feed(&chunk);
            cursor.last_event_id = decoder.last_event_id().map(str::to_string);
            cursor.retry_hint = decoder.retry_hint();
            match decoded {
                Ok(decoded) => {
                    for record in decoded {
                        *records += 1;
                        self.accept(&record);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        // Whatever arrived before the stream ended or stalled is still delivered.
        match decoder.finish() {
            Ok(Some(record)) => {
                *records += 1;
                self.accept(&record);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping trailing event record"),
        }
        cursor.last_event_id = decoder.last_event_id().map(str::to_string);
        outcome
    }

    fn accept(&self, record: &EventRecord) {
        match record.frame() {
            Ok(frame) => match frame.data {
                Some(data) => {
                    debug!(event = ?record.event, id = ?record.id, "stream payload received");
                    self.inbound.push(InboundPayload::from_stream(data));
                }
                None => debug!(event = ?record.event, "stream record without data"),
            },
            Err(e) => warn!(error = %e, event = ?record.event, "skipping event record"),
        }
    }
}
