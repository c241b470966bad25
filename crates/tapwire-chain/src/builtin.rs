//! Generic interceptors shipped with Tapwire.

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

use crate::error::InterceptorFault;
use crate::hosts::HostPatterns;
use crate::interceptor::{
    ConnectionInfo, Flow, HttpRequest, HttpResponse, Interceptor, InterceptorFactory,
    MessageContext,
};

/// Block page HTML template.
const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Blocked by Tapwire</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 500px;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Request Blocked</h1>
        <p>Requests to <strong>{{HOST}}</strong> are blocked on this device.</p>
    </div>
</body>
</html>"#;

/// Logs every request and response on a connection.
#[derive(Debug, Clone, Default)]
pub struct RequestLogger;

impl RequestLogger {
    /// Creates the logger factory.
    pub fn new() -> Self {
        Self
    }
}

impl InterceptorFactory for RequestLogger {
    fn name(&self) -> &str {
        "request-logger"
    }

    fn create(&self, _connection: &ConnectionInfo) -> Box<dyn Interceptor> {
        Box::new(LoggingInterceptor { last_uri: None })
    }
}

struct LoggingInterceptor {
    last_uri: Option<String>,
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept_request(
        &mut self,
        request: &mut HttpRequest,
        ctx: &MessageContext<'_>,
    ) -> Result<Flow, InterceptorFault> {
        let uri = request.uri().to_string();
        tracing::info!(
            "[{}#{}] {} {} ({} bytes)",
            ctx.connection.id,
            ctx.index,
            request.method(),
            uri,
            request.body().len()
        );
        self.last_uri = Some(uri);
        Ok(Flow::Continue)
    }

    async fn intercept_response(
        &mut self,
        response: &mut HttpResponse,
        ctx: &MessageContext<'_>,
    ) -> Result<(), InterceptorFault> {
        tracing::info!(
            "[{}#{}] {} {} ({} bytes)",
            ctx.connection.id,
            ctx.index,
            response.status(),
            self.last_uri.as_deref().unwrap_or("-"),
            response.body().len()
        );
        Ok(())
    }

    fn on_request_finished(&mut self, connection: &ConnectionInfo) {
        tracing::debug!("[{}] {} requests done", connection.id, connection.host);
    }
}

/// Answers requests to listed hosts with a local block page.
#[derive(Debug, Clone, Default)]
pub struct BlockingInjector {
    hosts: HostPatterns,
}

impl BlockingInjector {
    /// Creates an injector blocking the given host patterns.
    pub fn new(hosts: HostPatterns) -> Self {
        Self { hosts }
    }

    /// Returns the blocked host patterns.
    pub fn hosts(&self) -> &HostPatterns {
        &self.hosts
    }
}

impl InterceptorFactory for BlockingInjector {
    fn name(&self) -> &str {
        "blocking-injector"
    }

    fn create(&self, connection: &ConnectionInfo) -> Box<dyn Interceptor> {
        Box::new(BlockingInterceptor {
            blocked: self.hosts.matches(&connection.host),
        })
    }
}

struct BlockingInterceptor {
    blocked: bool,
}

#[async_trait]
impl Interceptor for BlockingInterceptor {
    async fn intercept_request(
        &mut self,
        _request: &mut HttpRequest,
        ctx: &MessageContext<'_>,
    ) -> Result<Flow, InterceptorFault> {
        if !self.blocked {
            return Ok(Flow::Continue);
        }

        tracing::info!("Blocked request to {}", ctx.connection.host);
        Ok(Flow::Respond(block_page(&ctx.connection.host)))
    }
}

fn block_page(host: &str) -> HttpResponse {
    let html = BLOCK_PAGE_HTML.replace("{{HOST}}", &html_escape(host));
    let mut response = Response::new(Bytes::from(html));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert("x-tapwire-blocked", HeaderValue::from_static("true"));
    response
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
