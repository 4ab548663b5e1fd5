use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::Mutex,
};
use tracing::{info, warn};

use chatbridge_core::{
    bridge::{self, Bridge},
    config::BridgeConfig,
    domain::{Envelope, InboundPayload, PayloadOrigin},
    ports::PayloadHandler,
};

/// Writes every dispatched payload to stdout as one JSON line.
struct StdioAdapter {
    out: Mutex<Stdout>,
}

#[async_trait]
impl PayloadHandler for StdioAdapter {
    async fn process(&self, payload: InboundPayload) -> chatbridge_core::Result<()> {
        if let Some(reply) = payload.data.get("reply") {
            info!(reply = %reply, context = ?payload.data.get("context"), "reply received");
        }
        let origin = match payload.origin {
            PayloadOrigin::Response => "response",
            PayloadOrigin::Stream => "stream",
        };
        let mut line = serde_json::to_vec(&json!({"origin": origin, "data": payload.data}))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

/// A stdin line is either a full envelope or a bare message for the defaults.
fn parse_line(line: &str) -> anyhow::Result<Envelope> {
    let value: Value = serde_json::from_str(line).context("stdin line is not JSON")?;
    if let Ok(envelope) = serde_json::from_value::<Envelope>(value.clone()) {
        return Ok(envelope);
    }
    Ok(Envelope::new(value, "stdin", "chatbridge"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatbridge_core::logging::init("chatbridge")?;

    let cfg = BridgeConfig::load()?;
    let adapter = Arc::new(StdioAdapter {
        out: Mutex::new(tokio::io::stdout()),
    });
    let bridge = bridge::install(Bridge::with_http(cfg, adapter)?);
    let handle = bridge.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let stdin_done = async {
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(envelope) => bridge.enqueue(envelope),
                Err(e) => warn!(error = %e, "skipping stdin line"),
            }
        }
        info!(pending = bridge.pending(), "stdin closed, waiting for deliveries");
        bridge.drained().await;
        anyhow::Ok(())
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("interrupted");
        }
        res = stdin_done => res?,
    }

    handle.shutdown().await;
    let dead = bridge.dead_letters();
    if !dead.is_empty() {
        warn!(count = dead.len(), "envelopes were not delivered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_lines_accept_envelopes_and_bare_messages() {
        let full = parse_line(r#"{"raw_message": {"Content": "hi"}, "source": "itchat", "app": "wechat"}"#)
            .unwrap();
        assert_eq!(full.source, "itchat");
        assert_eq!(full.raw_message, json!({"Content": "hi"}));

        let bare = parse_line(r#"{"Content": "hi"}"#).unwrap();
        assert_eq!(bare.source, "stdin");
        assert_eq!(bare.raw_message, json!({"Content": "hi"}));

        assert!(parse_line("not json").is_err());
    }
}
