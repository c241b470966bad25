//! Tapwire interceptor chain.
//!
//! Composes independent traffic transformers into one per-connection
//! pipeline. A faulting stage closes only its own connection.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapwire_chain::{InterceptorChain, InterceptorFactory, RequestLogger};
//!
//! let logger: Arc<dyn InterceptorFactory> = Arc::new(RequestLogger::new());
//! let chain = InterceptorChain::new(vec![logger]);
//! let connection = chain.connect("example.com", 443, None);
//! assert_eq!(connection.stage_names(), vec!["request-logger"]);
//! ```

pub mod builtin;
pub mod chain;
pub mod error;
pub mod hosts;
pub mod interceptor;

pub use builtin::{BlockingInjector, RequestLogger};
pub use chain::{
    Connection, FaultCallback, FaultReport, InterceptorChain, RequestOutcome, ResponseOutcome,
};
pub use error::InterceptorFault;
pub use hosts::{HostPattern, HostPatterns};
pub use interceptor::{
    from_fn, text_response, ConnectionInfo, Direction, Flow, FnFactory, HttpRequest, HttpResponse,
    Interceptor, InterceptorFactory, MessageContext,
};
