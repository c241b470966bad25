//! Ordered interceptor pipelines.
//!
//! A chain is built once per session from an ordered list of factories.
//! Every accepted connection gets its own [`Connection`] holding one fresh
//! interceptor per factory. Requests run through the stages in registration
//! order and responses in reverse order.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;

use crate::error::InterceptorFault;
use crate::hosts::HostPatterns;
use crate::interceptor::{
    ConnectionInfo, Direction, Flow, HttpRequest, HttpResponse, Interceptor, InterceptorFactory,
    MessageContext,
};

/// Details of a stage fault, reported once per faulting connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    /// The connection that was closed.
    pub connection: ConnectionInfo,
    /// Direction of the message being processed.
    pub direction: Direction,
    /// Position of the faulting stage.
    pub stage: usize,
    /// Name of the faulting interceptor.
    pub interceptor: String,
    /// The fault.
    pub fault: InterceptorFault,
}

/// Callback invoked when a stage faults.
pub type FaultCallback = Arc<dyn Fn(&FaultReport) + Send + Sync>;

/// Result of running a request through a connection.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Forward the request upstream.
    Forward(HttpRequest),
    /// Answer the client with this response; nothing goes upstream.
    Respond(HttpResponse),
    /// Close the connection.
    Abort(InterceptorFault),
}

/// Result of running a response through a connection.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Deliver the response to the client.
    Deliver(HttpResponse),
    /// Close the connection.
    Abort(InterceptorFault),
}

/// Ordered list of interceptor factories plus the TLS bypass list.
#[derive(Clone)]
pub struct InterceptorChain {
    factories: Arc<[Arc<dyn InterceptorFactory>]>,
    bypass: HostPatterns,
    on_fault: Option<FaultCallback>,
    next_id: Arc<AtomicU64>,
    open: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("stages", &self.names())
            .field("bypass", &self.bypass)
            .field("on_fault", &self.on_fault.is_some())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

impl InterceptorChain {
    /// Creates a chain; factory order is stage order.
    pub fn new(factories: Vec<Arc<dyn InterceptorFactory>>) -> Self {
        Self {
            factories: factories.into(),
            bypass: HostPatterns::new(),
            on_fault: None,
            next_id: Arc::new(AtomicU64::new(1)),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets hosts whose traffic is never decrypted.
    pub fn with_bypass(mut self, bypass: HostPatterns) -> Self {
        self.bypass = bypass;
        self
    }

    /// Sets a callback for stage faults.
    pub fn on_fault<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FaultReport) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(callback));
        self
    }

    /// Returns the stage names in order.
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }

    /// Returns the number of stages.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Returns the bypass list.
    pub fn bypass(&self) -> &HostPatterns {
        &self.bypass
    }

    /// Checks if traffic to `host` should pass through undecrypted.
    pub fn is_bypassed(&self, host: &str) -> bool {
        self.bypass.matches(host)
    }

    /// Returns the number of connections not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Opens a connection, creating one interceptor per factory in order.
    ///
    /// Bypassed hosts get a connection with no stages. A factory that panics
    /// yields a closed connection holding the stages created before it.
    pub fn connect(&self, host: &str, port: u16, client_addr: Option<SocketAddr>) -> Connection {
        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client_addr,
            host: host.to_string(),
            port,
        };

        let bypassed = self.is_bypassed(host);
        let mut stages = Vec::new();
        let mut failed = None;
        if !bypassed {
            for (index, factory) in self.factories.iter().enumerate() {
                match std::panic::catch_unwind(AssertUnwindSafe(|| factory.create(&info))) {
                    Ok(interceptor) => stages.push(Stage {
                        name: factory.name().to_string(),
                        interceptor,
                    }),
                    Err(panic) => {
                        failed = Some(FaultReport {
                            connection: info.clone(),
                            direction: Direction::Request,
                            stage: index,
                            interceptor: factory.name().to_string(),
                            fault: InterceptorFault::Panicked(panic_message(panic.as_ref())),
                        });
                        break;
                    }
                }
            }
        }

        tracing::debug!(
            "Connection {} to {}:{} opened with {} stages{}",
            info.id,
            info.host,
            info.port,
            stages.len(),
            if bypassed { " (bypassed)" } else { "" }
        );

        self.open.fetch_add(1, Ordering::SeqCst);
        let mut connection = Connection {
            info,
            stages,
            bypassed,
            requests: 0,
            responses: 0,
            closed: false,
            finished: false,
            on_fault: self.on_fault.clone(),
            open: Arc::clone(&self.open),
        };
        if let Some(report) = failed {
            connection.close(report);
        }
        connection
    }
}

struct Stage {
    name: String,
    interceptor: Box<dyn Interceptor>,
}

/// Per-connection pipeline.
///
/// Dropping the connection runs the finish hooks if [`Connection::finish`]
/// was not called.
pub struct Connection {
    info: ConnectionInfo,
    stages: Vec<Stage>,
    bypassed: bool,
    requests: usize,
    responses: usize,
    closed: bool,
    finished: bool,
    on_fault: Option<FaultCallback>,
    open: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("stages", &self.stage_names())
            .field("bypassed", &self.bypassed)
            .field("closed", &self.closed)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Connection {
    /// Returns the connection identity.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Returns the stage names in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns true if traffic on this connection is not decrypted.
    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Returns true once a stage has faulted.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Runs a request through every stage in order.
    ///
    /// A stage answering locally short-circuits the rest; its response then
    /// passes back through the response side of the stages before it only.
    pub async fn process_request(&mut self, mut request: HttpRequest) -> RequestOutcome {
        if self.closed || self.finished {
            return RequestOutcome::Abort(InterceptorFault::Closed);
        }

        let index = self.requests;
        self.requests += 1;

        for stage in 0..self.stages.len() {
            let ctx = MessageContext {
                connection: &self.info,
                index,
                stage,
                direction: Direction::Request,
            };
            let result = guard(
                self.stages[stage]
                    .interceptor
                    .intercept_request(&mut request, &ctx),
            )
            .await;

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Respond(response)) => {
                    tracing::debug!(
                        "Connection {}: {} answered request {} locally",
                        self.info.id,
                        self.stages[stage].name,
                        index
                    );
                    return match self.run_response(response, stage).await {
                        ResponseOutcome::Deliver(response) => RequestOutcome::Respond(response),
                        ResponseOutcome::Abort(fault) => RequestOutcome::Abort(fault),
                    };
                }
                Err(fault) => {
                    return RequestOutcome::Abort(self.fail(Direction::Request, stage, fault))
                }
            }
        }

        RequestOutcome::Forward(request)
    }

    /// Runs a response through every stage in reverse order.
    pub async fn process_response(&mut self, response: HttpResponse) -> ResponseOutcome {
        let len = self.stages.len();
        self.run_response(response, len).await
    }

    /// Runs the finish hooks once: request hooks in stage order, response
    /// hooks in reverse. Later calls on the connection abort.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let info = &self.info;
        for stage in self.stages.iter_mut() {
            let interceptor = &mut stage.interceptor;
            if std::panic::catch_unwind(AssertUnwindSafe(|| interceptor.on_request_finished(info)))
                .is_err()
            {
                tracing::warn!("Interceptor {} panicked in request finish hook", stage.name);
            }
        }
        for stage in self.stages.iter_mut().rev() {
            let interceptor = &mut stage.interceptor;
            if std::panic::catch_unwind(AssertUnwindSafe(|| interceptor.on_response_finished(info)))
                .is_err()
            {
                tracing::warn!("Interceptor {} panicked in response finish hook", stage.name);
            }
        }

        tracing::debug!(
            "Connection {} finished after {} requests, {} responses",
            self.info.id,
            self.requests,
            self.responses
        );
    }

    async fn run_response(&mut self, mut response: HttpResponse, upto: usize) -> ResponseOutcome {
        if self.closed || self.finished {
            return ResponseOutcome::Abort(InterceptorFault::Closed);
        }

        let index = self.responses;
        self.responses += 1;

        for stage in (0..upto).rev() {
            let ctx = MessageContext {
                connection: &self.info,
                index,
                stage,
                direction: Direction::Response,
            };
            let result = guard(
                self.stages[stage]
                    .interceptor
                    .intercept_response(&mut response, &ctx),
            )
            .await;

            if let Err(fault) = result {
                return ResponseOutcome::Abort(self.fail(Direction::Response, stage, fault));
            }
        }

        ResponseOutcome::Deliver(response)
    }

    fn fail(&mut self, direction: Direction, stage: usize, fault: InterceptorFault) -> InterceptorFault {
        self.close(FaultReport {
            connection: self.info.clone(),
            direction,
            stage,
            interceptor: self.stages[stage].name.clone(),
            fault: fault.clone(),
        });
        fault
    }

    fn close(&mut self, report: FaultReport) {
        self.closed = true;

        tracing::warn!(
            "Interceptor {} faulted on {} for {}:{} (connection {}): {}",
            report.interceptor,
            report.direction,
            self.info.host,
            self.info.port,
            self.info.id,
            report.fault
        );

        if let Some(callback) = &self.on_fault {
            callback(&report);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.finish();
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Awaits a stage, turning a panic into a fault.
async fn guard<T>(
    stage: impl Future<Output = Result<T, InterceptorFault>>,
) -> Result<T, InterceptorFault> {
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(InterceptorFault::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{from_fn, text_response};
    use async_trait::async_trait;
    use hyper::body::Bytes;
    use hyper::{Request, Response, StatusCode};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Behavior {
        Pass,
        FailRequest,
        FailResponse,
        Panic,
        Respond,
    }

    struct Recorder {
        name: &'static str,
        log: Log,
        behavior: Behavior,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept_request(
            &mut self,
            request: &mut HttpRequest,
            ctx: &MessageContext<'_>,
        ) -> Result<Flow, InterceptorFault> {
            self.log
                .lock()
                .push(format!("{}:req{}", self.name, ctx.index));
            request
                .headers_mut()
                .append("x-trace", self.name.parse().unwrap());
            match self.behavior {
                Behavior::FailRequest => Err(InterceptorFault::Failed("boom".into())),
                Behavior::Panic => panic!("stage {} exploded", self.name),
                Behavior::Respond => Ok(Flow::Respond(text_response(
                    StatusCode::FORBIDDEN,
                    "blocked",
                ))),
                _ => Ok(Flow::Continue),
            }
        }

        async fn intercept_response(
            &mut self,
            response: &mut HttpResponse,
            ctx: &MessageContext<'_>,
        ) -> Result<(), InterceptorFault> {
            self.log
                .lock()
                .push(format!("{}:res{}", self.name, ctx.index));
            response
                .headers_mut()
                .append("x-trace", self.name.parse().unwrap());
            match self.behavior {
                Behavior::FailResponse => Err(InterceptorFault::Aborted("stop".into())),
                _ => Ok(()),
            }
        }

        fn on_request_finished(&mut self, _connection: &ConnectionInfo) {
            self.log.lock().push(format!("{}:req-done", self.name));
        }

        fn on_response_finished(&mut self, _connection: &ConnectionInfo) {
            self.log.lock().push(format!("{}:res-done", self.name));
        }
    }

    fn stage(name: &'static str, log: &Log, behavior: Behavior) -> Arc<dyn InterceptorFactory> {
        let log = Arc::clone(log);
        from_fn(name, move |_| {
            Box::new(Recorder {
                name,
                log: Arc::clone(&log),
                behavior,
            }) as Box<dyn Interceptor>
        })
    }

    fn request() -> HttpRequest {
        Request::builder()
            .uri("https://example.com/")
            .body(Bytes::new())
            .unwrap()
    }

    fn response() -> HttpResponse {
        Response::new(Bytes::from_static(b"ok"))
    }

    fn abc(log: &Log, b: Behavior) -> InterceptorChain {
        InterceptorChain::new(vec![
            stage("A", log, Behavior::Pass),
            stage("B", log, b),
            stage("C", log, Behavior::Pass),
        ])
    }

    fn traces(headers: &hyper::HeaderMap) -> Vec<String> {
        headers
            .get_all("x-trace")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn request_runs_in_order_and_response_in_reverse() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Pass);
        let mut conn = chain.connect("example.com", 443, None);

        let forwarded = match conn.process_request(request()).await {
            RequestOutcome::Forward(req) => req,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(traces(forwarded.headers()), vec!["A", "B", "C"]);

        let delivered = match conn.process_response(response()).await {
            ResponseOutcome::Deliver(res) => res,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(traces(delivered.headers()), vec!["C", "B", "A"]);

        assert_eq!(
            *log.lock(),
            vec!["A:req0", "B:req0", "C:req0", "C:res0", "B:res0", "A:res0"]
        );
    }

    #[tokio::test]
    async fn request_fault_closes_connection() {
        let log = Log::default();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let chain = abc(&log, Behavior::FailRequest)
            .on_fault(move |report: &FaultReport| sink.lock().push(report.clone()));
        let mut conn = chain.connect("example.com", 443, None);

        let outcome = conn.process_request(request()).await;
        assert!(matches!(outcome, RequestOutcome::Abort(InterceptorFault::Failed(_))));
        assert!(conn.is_closed());
        assert_eq!(*log.lock(), vec!["A:req0", "B:req0"]);

        let outcome = conn.process_response(response()).await;
        assert!(matches!(outcome, ResponseOutcome::Abort(InterceptorFault::Closed)));
        let outcome = conn.process_request(request()).await;
        assert!(matches!(outcome, RequestOutcome::Abort(InterceptorFault::Closed)));

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].interceptor, "B");
        assert_eq!(reports[0].stage, 1);
        assert_eq!(reports[0].direction, Direction::Request);
    }

    #[tokio::test]
    async fn response_fault_stops_delivery() {
        let log = Log::default();
        let chain = abc(&log, Behavior::FailResponse);
        let mut conn = chain.connect("example.com", 443, None);

        assert!(matches!(
            conn.process_request(request()).await,
            RequestOutcome::Forward(_)
        ));
        let outcome = conn.process_response(response()).await;
        assert!(matches!(outcome, ResponseOutcome::Abort(InterceptorFault::Aborted(_))));
        assert_eq!(log.lock().last().unwrap(), "B:res0");
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Panic);
        let mut conn = chain.connect("example.com", 443, None);

        let outcome = conn.process_request(request()).await;
        match outcome {
            RequestOutcome::Abort(InterceptorFault::Panicked(message)) => {
                assert!(message.contains("stage B exploded"))
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut other = chain.connect("example.com", 443, None);
        assert!(matches!(
            other.process_request(request()).await,
            RequestOutcome::Forward(_)
        ));
    }

    #[tokio::test]
    async fn panicking_factory_yields_closed_connection() {
        let log = Log::default();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let chain = InterceptorChain::new(vec![
            stage("A", &log, Behavior::Pass),
            from_fn("broken", |_| -> Box<dyn Interceptor> { panic!("factory exploded") }),
            stage("C", &log, Behavior::Pass),
        ])
        .on_fault(move |report: &FaultReport| sink.lock().push(report.clone()));

        let mut conn = chain.connect("example.com", 443, None);
        assert!(conn.is_closed());
        assert_eq!(conn.stage_names(), vec!["A"]);
        assert!(matches!(
            conn.process_request(request()).await,
            RequestOutcome::Abort(InterceptorFault::Closed)
        ));

        {
            let reports = reports.lock();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].interceptor, "broken");
            assert_eq!(reports[0].stage, 1);
            assert!(matches!(
                &reports[0].fault,
                InterceptorFault::Panicked(message) if message.contains("factory exploded")
            ));
        }

        drop(conn);
        assert_eq!(*log.lock(), vec!["A:req-done", "A:res-done"]);
        assert_eq!(chain.open_connections(), 0);
    }

    #[tokio::test]
    async fn short_circuit_runs_outer_response_stages_only() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Respond);
        let mut conn = chain.connect("example.com", 443, None);

        let response = match conn.process_request(request()).await {
            RequestOutcome::Respond(res) => res,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(traces(response.headers()), vec!["A"]);
        assert_eq!(*log.lock(), vec!["A:req0", "B:req0", "A:res0"]);
    }

    #[tokio::test]
    async fn indices_count_per_direction() {
        let log = Log::default();
        let chain = InterceptorChain::new(vec![stage("A", &log, Behavior::Pass)]);
        let mut conn = chain.connect("example.com", 443, None);

        conn.process_request(request()).await;
        conn.process_request(request()).await;
        conn.process_response(response()).await;

        assert_eq!(*log.lock(), vec!["A:req0", "A:req1", "A:res0"]);
    }

    #[test]
    fn each_connection_gets_fresh_interceptors() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let log = Log::default();
        let chain = InterceptorChain::new(vec![from_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Recorder {
                name: "count",
                log: Arc::clone(&log),
                behavior: Behavior::Pass,
            }) as Box<dyn Interceptor>
        })]);

        let first = chain.connect("a.example", 443, None);
        let second = chain.connect("b.example", 443, None);

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_ne!(first.info().id, second.info().id);
        assert_eq!(chain.open_connections(), 2);
        drop(first);
        drop(second);
        assert_eq!(chain.open_connections(), 0);
    }

    #[tokio::test]
    async fn bypassed_host_has_no_stages() {
        let log = Log::default();
        let chain = abc(&log, Behavior::FailRequest)
            .with_bypass(["*.bank.example"].into_iter().collect());
        let mut conn = chain.connect("www.bank.example", 443, None);

        assert!(conn.is_bypassed());
        assert!(conn.stage_names().is_empty());
        assert!(matches!(
            conn.process_request(request()).await,
            RequestOutcome::Forward(_)
        ));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn finish_hooks_run_once_in_order() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Pass);
        let mut conn = chain.connect("example.com", 443, None);

        conn.finish();
        conn.finish();
        drop(conn);

        assert_eq!(
            *log.lock(),
            vec![
                "A:req-done",
                "B:req-done",
                "C:req-done",
                "C:res-done",
                "B:res-done",
                "A:res-done"
            ]
        );
    }

    #[test]
    fn drop_runs_finish_hooks() {
        let log = Log::default();
        let chain = InterceptorChain::new(vec![stage("A", &log, Behavior::Pass)]);
        drop(chain.connect("example.com", 443, None));
        assert_eq!(*log.lock(), vec!["A:req-done", "A:res-done"]);
    }

    #[test]
    fn chain_reports_names() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Pass);
        assert_eq!(chain.names(), vec!["A", "B", "C"]);
        assert_eq!(chain.len(), 3);
        assert!(!chain.is_empty());
    }

    #[test]
    fn connection_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let chain = InterceptorChain::new(Vec::new());
        let mut conn = chain.connect("example.com", 443, None);
        assert_send(&conn.process_request(request()));
    }

    #[test]
    fn block_on_process_request() {
        let log = Log::default();
        let chain = abc(&log, Behavior::Pass);
        let mut conn = chain.connect("example.com", 443, None);
        let outcome = tokio_test::block_on(conn.process_request(request()));
        assert!(matches!(outcome, RequestOutcome::Forward(_)));
    }
}
