//! The interceptor contract.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Request, Response};

use crate::error::InterceptorFault;

/// A fully buffered request.
pub type HttpRequest = Request<Bytes>;

/// A fully buffered response.
pub type HttpResponse = Response<Bytes>;

/// Identity of one intercepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Chain-unique connection id.
    pub id: u64,
    /// Address of the local client, when known.
    pub client_addr: Option<SocketAddr>,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

impl Direction {
    /// Returns the direction as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a stage sees alongside the message.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    /// The connection the message belongs to.
    pub connection: &'a ConnectionInfo,
    /// Zero-based index of this message within its direction.
    pub index: usize,
    /// Position of the stage in the chain.
    pub stage: usize,
    /// Direction of the message.
    pub direction: Direction,
}

/// How a request stage wants processing to continue.
#[derive(Debug)]
pub enum Flow {
    /// Hand the (possibly rewritten) request to the next stage.
    Continue,
    /// Answer locally; the request is never forwarded.
    Respond(HttpResponse),
}

/// A per-connection traffic transformer.
///
/// One instance serves exactly one connection, so implementations may keep
/// per-connection state in `self`. Default methods pass messages through.
#[async_trait]
pub trait Interceptor: Send {
    /// Inspects or rewrites a request.
    async fn intercept_request(
        &mut self,
        _request: &mut HttpRequest,
        _ctx: &MessageContext<'_>,
    ) -> Result<Flow, InterceptorFault> {
        Ok(Flow::Continue)
    }

    /// Inspects or rewrites a response.
    async fn intercept_response(
        &mut self,
        _response: &mut HttpResponse,
        _ctx: &MessageContext<'_>,
    ) -> Result<(), InterceptorFault> {
        Ok(())
    }

    /// Called once when no more requests will pass on this connection.
    fn on_request_finished(&mut self, _connection: &ConnectionInfo) {}

    /// Called once when no more responses will pass on this connection.
    fn on_response_finished(&mut self, _connection: &ConnectionInfo) {}
}

/// Produces a fresh [`Interceptor`] for each connection.
pub trait InterceptorFactory: Send + Sync {
    /// Name used in logs and fault reports.
    fn name(&self) -> &str;

    /// Creates the interceptor for one connection.
    fn create(&self, connection: &ConnectionInfo) -> Box<dyn Interceptor>;
}

/// Factory backed by a closure.
pub struct FnFactory<F> {
    name: String,
    create: F,
}

impl<F> std::fmt::Debug for FnFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFactory").field("name", &self.name).finish()
    }
}

impl<F> InterceptorFactory for FnFactory<F>
where
    F: Fn(&ConnectionInfo) -> Box<dyn Interceptor> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, connection: &ConnectionInfo) -> Box<dyn Interceptor> {
        (self.create)(connection)
    }
}

/// Wraps a closure as a shareable factory.
pub fn from_fn<F>(name: impl Into<String>, create: F) -> Arc<dyn InterceptorFactory>
where
    F: Fn(&ConnectionInfo) -> Box<dyn Interceptor> + Send + Sync + 'static,
{
    Arc::new(FnFactory {
        name: name.into(),
        create,
    })
}

/// Builds a local response with a plain text body.
pub fn text_response(status: hyper::StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
