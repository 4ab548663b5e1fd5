use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw platform message plus the identifiers of where it came from.
///
/// Serialized as-is for `POST /send`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub raw_message: Value,
    pub source: String,
    pub app: String,
}

impl Envelope {
    pub fn new(raw_message: Value, source: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            raw_message,
            source: source.into(),
            app: app.into(),
        }
    }
}

/// An envelope waiting in the outbound queue, with its retry bookkeeping.
#[derive(Clone, Debug)]
pub struct OutboundTask {
    pub envelope: Envelope,
    pub last_attempt_time: Instant,
    /// Bumped only when two attempts are more than `retry_delay` apart.
    pub retry_count: u32,
    /// Every delivery attempt, successful or not.
    pub attempts: u32,
}

impl OutboundTask {
    pub fn new(envelope: Envelope) -> Self {
        Self::new_at(envelope, Instant::now())
    }

    pub fn new_at(envelope: Envelope, now: Instant) -> Self {
        Self {
            envelope,
            last_attempt_time: now,
            retry_count: 0,
            attempts: 0,
        }
    }

    /// Record the start of a delivery attempt at `now`.
    ///
    /// The elapsed time is measured from the last recorded attempt, not from
    /// creation and not from the last failure.
    pub fn begin_attempt_at(&mut self, now: Instant, retry_delay: Duration) {
        if now.saturating_duration_since(self.last_attempt_time) > retry_delay {
            self.retry_count += 1;
            self.last_attempt_time = now;
        }
        self.attempts += 1;
    }
}

/// Which producer pushed an inbound payload.
///
/// Synchronous POST replies and stream events both land in the inbound queue,
/// but nothing guarantees they carry the same kind of document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadOrigin {
    Response,
    Stream,
}

/// A processed result handed back to the platform adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundPayload {
    pub origin: PayloadOrigin,
    pub data: Value,
}

impl InboundPayload {
    pub fn from_response(data: Value) -> Self {
        Self {
            origin: PayloadOrigin::Response,
            data,
        }
    }

    pub fn from_stream(data: Value) -> Self {
        Self {
            origin: PayloadOrigin::Stream,
            data,
        }
    }
}

/// Body of a `200` reply to `POST /send`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
}

impl SendResponse {
    /// The informational notice, if any, rendered for logging.
    pub fn notice(&self) -> Option<String> {
        match self.message.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// One decoded record of the events stream.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct StreamFrame {
    #[serde(default)]
    pub data: Option<Value>,
}

/// A task that ran out of attempts.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub attempts: u32,
    pub retry_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: OutboundTask, reason: impl Into<String>) -> Self {
        Self {
            envelope: task.envelope,
            attempts: task.attempts,
            retry_count: task.retry_count,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(json!({"Content": "hi"}), "itchat", "wechat")
    }

    #[test]
    fn envelope_serializes_with_wire_field_names() {
        let v = serde_json::to_value(envelope()).unwrap();
        assert_eq!(
            v,
            json!({"raw_message": {"Content": "hi"}, "source": "itchat", "app": "wechat"})
        );
    }

    #[test]
    fn retry_count_only_moves_when_attempts_are_spaced_past_retry_delay() {
        let delay = Duration::from_secs(300);
        let t0 = Instant::now();
        let mut task = OutboundTask::new_at(envelope(), t0);

        task.begin_attempt_at(t0, delay);
        assert_eq!((task.retry_count, task.attempts), (0, 1));

        // Exactly retry_delay later is not "more than".
        task.begin_attempt_at(t0 + delay, delay);
        assert_eq!((task.retry_count, task.attempts), (0, 2));
        assert_eq!(task.last_attempt_time, t0);

        let t1 = t0 + delay + Duration::from_secs(1);
        task.begin_attempt_at(t1, delay);
        assert_eq!((task.retry_count, task.attempts), (1, 3));
        assert_eq!(task.last_attempt_time, t1);

        // Close follow-up attempts leave the bookkeeping alone.
        task.begin_attempt_at(t1 + Duration::from_secs(10), delay);
        assert_eq!((task.retry_count, task.attempts), (1, 4));
        assert_eq!(task.last_attempt_time, t1);
    }

    #[test]
    fn send_response_tolerates_missing_and_null_fields() {
        let r: SendResponse = serde_json::from_str(r#"{"data": null}"#).unwrap();
        assert_eq!(r, SendResponse::default());

        let r: SendResponse =
            serde_json::from_str(r#"{"data": {"reply": "ok"}, "message": "queued"}"#).unwrap();
        assert_eq!(r.data, Some(json!({"reply": "ok"})));
        assert_eq!(r.notice().as_deref(), Some("queued"));

        let r: SendResponse = serde_json::from_str(r#"{"message": {"code": 1}}"#).unwrap();
        assert_eq!(r.notice().as_deref(), Some(r#"{"code":1}"#));
    }
}
