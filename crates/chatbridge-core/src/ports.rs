use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    domain::{Envelope, InboundPayload, SendResponse},
    Result,
};

/// Raw body of the events stream, one item per network read.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Hexagonal port for the processing backend.
///
/// `HttpBackend` is the production implementation; tests plug in fakes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver one envelope (`POST /send`). Anything but a decodable `200`
    /// reply is an error.
    async fn send(&self, envelope: &Envelope) -> Result<SendResponse>;

    /// Open the long-lived events stream (`GET /events`).
    async fn open_events(&self, last_event_id: Option<&str>) -> Result<ByteStream>;
}

/// Hexagonal port for the platform adapter receiving processed results.
///
/// Called once per inbound payload, sequentially, in dispatch order. Errors
/// and panics are contained by the dispatcher.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn process(&self, payload: InboundPayload) -> Result<()>;
}

/// Adapts a plain synchronous callback into a [`PayloadHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> PayloadHandler for FnHandler<F>
where
    F: Fn(InboundPayload) -> Result<()> + Send + Sync,
{
    async fn process(&self, payload: InboundPayload) -> Result<()> {
        (self.0)(payload)
    }
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(InboundPayload) -> Result<()> + Send + Sync,
{
    FnHandler(f)
}
