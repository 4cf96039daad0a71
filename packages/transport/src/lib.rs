// ABOUTME: Transport channel for the Skiff sandbox client
// ABOUTME: Unary request/response and server-streaming operations behind one trait

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub mod connect;
pub mod error;
pub mod http;
pub mod request;
pub mod rpc;

pub use error::{Result, TransportError};
pub use http::HttpTransport;
pub use request::{ApiRequest, ApiResponse, FilePart, Method, RequestBody};
pub use rpc::{MessageStream, RpcChannel};

/// Raw response body chunks of an open stream
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Moves requests to the platform and back.
///
/// Implementations own retrying of transient failures. A non-success status
/// must surface as [`TransportError::Status`] with the remote message intact.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and read the complete response
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Send a request and hand back the response body as it arrives
    async fn open_stream(&self, request: ApiRequest) -> Result<ByteStream>;
}
