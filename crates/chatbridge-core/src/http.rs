//! reqwest implementation of the [`Backend`] port.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE},
    StatusCode,
};
use tracing::debug;

use crate::{
    config::BridgeConfig,
    domain::{Envelope, SendResponse},
    errors::Error,
    ports::{Backend, ByteStream},
    Result,
};

const LAST_EVENT_ID: &str = "Last-Event-ID";

#[derive(Clone, Debug)]
pub struct HttpBackend {
    send_url: String,
    events_url: String,
    request_timeout: std::time::Duration,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(cfg: &BridgeConfig) -> Result<Self> {
        // No client-wide timeout: it would cut the events stream. POSTs get a
        // per-request timeout instead, the stream a per-read one.
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            send_url: cfg.send_url(),
            events_url: cfg.events_url(),
            request_timeout: cfg.request_timeout,
            http,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, envelope: &Envelope) -> Result<SendResponse> {
        let body = serde_json::to_vec(envelope)?;
        debug!(url = %self.send_url, bytes = body.len(), "posting envelope");

        let resp = self
            .http
            .post(&self.send_url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if status != StatusCode::OK {
            return Err(Error::status(status.as_u16(), preview(&text, 200)));
        }
        decode_send_response(&text)
    }

    async fn open_events(&self, last_event_id: Option<&str>) -> Result<ByteStream> {
        let mut req = self
            .http
            .get(&self.events_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            req = req.header(LAST_EVENT_ID, id);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::status(status.as_u16(), preview(&body, 200)));
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
            .boxed())
    }
}

/// An empty `200` body counts as an acknowledgement with nothing to relay.
pub(crate) fn decode_send_response(text: &str) -> Result<SendResponse> {
    if text.trim().is_empty() {
        return Ok(SendResponse::default());
    }
    serde_json::from_str(text).map_err(|e| {
        Error::protocol(format!(
            "undecodable /send reply: {e}: {}",
            preview(text, 200)
        ))
    })
}

fn preview(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max_len).collect::<String>())
}
