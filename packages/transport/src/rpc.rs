// ABOUTME: Connect RPC channel bound to one sandbox endpoint
// ABOUTME: JSON unary calls and enveloped server streams decoded into JSON messages

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, trace};

use crate::connect::{
    self, EnvelopeDecoder, Frame, CONTENT_TYPE_STREAM_JSON, PROTOCOL_VERSION,
    PROTOCOL_VERSION_HEADER,
};
use crate::error::{Result, TransportError};
use crate::request::{ApiRequest, Method};
use crate::Transport;

/// Decoded messages of one server stream, ending after the trailer frame
pub type MessageStream = BoxStream<'static, Result<Value>>;

#[derive(Clone)]
pub struct RpcChannel {
    transport: Arc<dyn Transport>,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl RpcChannel {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
        }
    }

    /// Attach a header sent with every call on this channel
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// A plain HTTP request against this endpoint, channel headers included
    pub fn request(&self, method: Method, path: &str) -> ApiRequest {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        ApiRequest::new(method, url).headers(self.headers.iter().cloned())
    }

    pub async fn unary(&self, service: &str, method: &str, message: Value) -> Result<Value> {
        debug!(service, method, "Connect unary call");
        let request = self
            .request(Method::Post, &format!("{}/{}", service, method))
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .json(message);
        self.transport.send(request).await?.json_value()
    }

    /// Open a server stream; the returned stream fails if the body ends without a trailer
    pub async fn server_stream(
        &self,
        service: &str,
        method: &str,
        message: Value,
    ) -> Result<MessageStream> {
        debug!(service, method, "Connect server stream");
        let payload = serde_json::to_vec(&message)?;
        let request = self
            .request(Method::Post, &format!("{}/{}", service, method))
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .bytes(CONTENT_TYPE_STREAM_JSON, connect::encode_envelope(&payload));

        let mut body = self.transport.open_stream(request).await?;

        let stream = async_stream::stream! {
            let mut decoder = EnvelopeDecoder::new();
            loop {
                match decoder.next_frame() {
                    Ok(Some(Frame::Message(bytes))) => {
                        trace!(bytes = bytes.len(), "Stream message");
                        yield serde_json::from_slice::<Value>(&bytes).map_err(TransportError::from);
                        continue;
                    }
                    Ok(Some(Frame::End(bytes))) => {
                        if let Err(err) = connect::end_stream_status(&bytes) {
                            yield Err(err);
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }

                match body.next().await {
                    Some(Ok(chunk)) => decoder.extend(&chunk),
                    Some(Err(err)) => {
                        yield Err(err);
                        break;
                    }
                    None => {
                        yield Err(TransportError::Network(
                            "stream closed before end-of-stream frame".to_string(),
                        ));
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
