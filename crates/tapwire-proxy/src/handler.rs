//! HTTP handler running every exchange through the interceptor chain.

use std::net::SocketAddr;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use tapwire_chain::{text_response, Connection, RequestOutcome, ResponseOutcome};
use tapwire_session::CaptureContext;

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Proxy handler for one capture session.
///
/// hudsucker clones the handler for every exchange; the chain connection
/// opened for a request lives in that clone until its response is done.
pub struct ChainHandler {
    context: CaptureContext,
    connection: Option<Mutex<Connection>>,
}

impl Clone for ChainHandler {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            connection: None,
        }
    }
}

impl std::fmt::Debug for ChainHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandler")
            .field("context", &self.context)
            .field("in_flight", &self.connection.is_some())
            .finish()
    }
}

impl ChainHandler {
    /// Creates a handler for the given session.
    pub fn new(context: CaptureContext) -> Self {
        Self {
            context,
            connection: None,
        }
    }

    /// Runs a client request through a fresh chain connection.
    pub async fn process_request(
        &mut self,
        client_addr: SocketAddr,
        req: Request<Body>,
    ) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some((host, port)) = Self::extract_target(&req) else {
            return RequestOrResponse::Request(req);
        };

        let mut connection = self.context.connect(&host, port, Some(client_addr));
        if connection.is_bypassed() {
            return RequestOrResponse::Request(req);
        }

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body for {}: {}", host, e);
                return RequestOrResponse::Response(bad_gateway("request body unreadable"));
            }
        };

        match connection
            .process_request(Request::from_parts(parts, body_bytes))
            .await
        {
            RequestOutcome::Forward(mut req) => {
                let body_len = req.body().len();
                sync_content_length(req.headers_mut(), body_len);
                self.connection = Some(Mutex::new(connection));
                RequestOrResponse::Request(req.map(bytes_to_body))
            }
            RequestOutcome::Respond(mut res) => {
                let body_len = res.body().len();
                sync_content_length(res.headers_mut(), body_len);
                RequestOrResponse::Response(res.map(bytes_to_body))
            }
            RequestOutcome::Abort(fault) => {
                RequestOrResponse::Response(bad_gateway(&fault.to_string()))
            }
        }
    }

    /// Runs the upstream response back through the request's connection.
    pub async fn process_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(mut slot) = self.connection.take() else {
            return res;
        };
        let connection = slot.get_mut();

        let (parts, body) = res.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(
                    "Failed to read response body from {}: {}",
                    connection.info().host,
                    e
                );
                return bad_gateway("response body unreadable");
            }
        };

        match connection
            .process_response(Response::from_parts(parts, body_bytes))
            .await
        {
            ResponseOutcome::Deliver(mut res) => {
                let body_len = res.body().len();
                sync_content_length(res.headers_mut(), body_len);
                res.map(bytes_to_body)
            }
            ResponseOutcome::Abort(fault) => bad_gateway(&fault.to_string()),
        }
    }

    /// Extracts host and port from the request URI or Host header.
    fn extract_target(req: &Request<Body>) -> Option<(String, u16)> {
        let default_port = match req.uri().scheme_str() {
            Some("http") => 80,
            _ => 443,
        };

        if let Some(host) = req.uri().host() {
            let port = req.uri().port_u16().unwrap_or(default_port);
            return Some((host.to_string(), port));
        }

        let header = req.headers().get(HOST)?.to_str().ok()?;
        let authority: hyper::http::uri::Authority = header.parse().ok()?;
        Some((
            authority.host().to_string(),
            authority.port_u16().unwrap_or(default_port),
        ))
    }
}

impl HttpHandler for ChainHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.process_request(ctx.client_addr, req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.process_response(res).await
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        match req.uri().host() {
            Some(host) => !self.context.chain().is_bypassed(host),
            None => true,
        }
    }
}

fn bad_gateway(reason: &str) -> Response<Body> {
    let mut res = text_response(StatusCode::BAD_GATEWAY, format!("tapwire: {}\n", reason));
    res.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    let body_len = res.body().len();
    sync_content_length(res.headers_mut(), body_len);
    res.map(bytes_to_body)
}

fn sync_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tapwire_ca::{CaConfig, CertificateAuthority};
    use tapwire_chain::{
        from_fn, BlockingInjector, HttpResponse, Interceptor, InterceptorChain,
        InterceptorFactory, InterceptorFault, MessageContext,
    };
    use tapwire_session::ConnectionWorkers;

    struct Tagger;

    #[async_trait]
    impl Interceptor for Tagger {
        async fn intercept_response(
            &mut self,
            response: &mut HttpResponse,
            _ctx: &MessageContext<'_>,
        ) -> Result<(), InterceptorFault> {
            let mut body = response.body().to_vec();
            body.extend_from_slice(b" [seen]");
            *response.body_mut() = Bytes::from(body);
            Ok(())
        }
    }

    struct Breaker;

    #[async_trait]
    impl Interceptor for Breaker {
        async fn intercept_response(
            &mut self,
            _response: &mut HttpResponse,
            _ctx: &MessageContext<'_>,
        ) -> Result<(), InterceptorFault> {
            Err(InterceptorFault::Aborted("drop it".into()))
        }
    }

    fn handler(factories: Vec<Arc<dyn InterceptorFactory>>) -> ChainHandler {
        let ca = CertificateAuthority::initialize(&CaConfig::default()).unwrap();
        let chain = InterceptorChain::new(factories)
            .with_bypass(["*.bank.example"].into_iter().collect());
        let (context, _rx) = CaptureContext::new(Arc::new(ca), chain, ConnectionWorkers::new());
        ChainHandler::new(context)
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(bytes_to_body(Bytes::new()))
            .unwrap()
    }

    fn upstream(body: &'static str) -> Response<Body> {
        Response::builder()
            .header(CONTENT_LENGTH, body.len())
            .body(bytes_to_body(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_string(res: Response<Body>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn exchange_passes_through_chain() {
        let mut handler = handler(vec![from_fn("tagger", |_| Box::new(Tagger))]);

        let req = match handler
            .process_request(client(), get("https://example.com/a"))
            .await
        {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("request was answered locally"),
        };
        assert_eq!(req.uri(), "https://example.com/a");
        assert_eq!(handler.context.chain().open_connections(), 1);

        let res = handler.process_response(upstream("hello")).await;
        assert_eq!(res.headers()[CONTENT_LENGTH], "12");
        assert_eq!(body_string(res).await, "hello [seen]");
        assert_eq!(handler.context.chain().open_connections(), 0);
    }

    #[tokio::test]
    async fn blocked_hosts_are_answered_locally() {
        let injector: Arc<dyn InterceptorFactory> =
            Arc::new(BlockingInjector::new(["ads.example"].into_iter().collect()));
        let mut handler = handler(vec![injector]);

        match handler
            .process_request(client(), get("https://ads.example/pixel"))
            .await
        {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::FORBIDDEN);
            }
            RequestOrResponse::Request(_) => panic!("blocked request was forwarded"),
        }
        assert!(handler.connection.is_none());
    }

    #[tokio::test]
    async fn faulting_response_becomes_bad_gateway() {
        let mut handler = handler(vec![from_fn("breaker", |_| Box::new(Breaker))]);
        let _ = handler
            .process_request(client(), get("https://example.com/"))
            .await;

        let res = handler.process_response(upstream("secret")).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(res.headers()[CONNECTION], "close");
        assert!(!body_string(res).await.contains("secret"));
    }

    #[tokio::test]
    async fn bypassed_hosts_skip_the_chain() {
        let mut handler = handler(vec![from_fn("breaker", |_| Box::new(Breaker))]);
        let _ = handler
            .process_request(client(), get("https://login.bank.example/"))
            .await;
        assert!(handler.connection.is_none());

        let res = handler.process_response(upstream("ok")).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn target_from_uri_or_host_header() {
        let req = get("http://example.com:8080/x");
        assert_eq!(
            ChainHandler::extract_target(&req),
            Some(("example.com".to_string(), 8080))
        );

        let req = Request::builder()
            .uri("/relative")
            .header(HOST, "api.example.com")
            .body(bytes_to_body(Bytes::new()))
            .unwrap();
        assert_eq!(
            ChainHandler::extract_target(&req),
            Some(("api.example.com".to_string(), 443))
        );

        assert_eq!(ChainHandler::extract_target(&get("/nohost")), None);
    }

    #[test]
    fn clones_do_not_share_in_flight_state() {
        let mut original = handler(Vec::new());
        let connection = original.context.connect("example.com", 443, None);
        original.connection = Some(Mutex::new(connection));

        let copy = original.clone();
        assert!(copy.connection.is_none());
    }
}
