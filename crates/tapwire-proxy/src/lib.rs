//! Tapwire loopback capture.
//!
//! A hudsucker MITM proxy bound to 127.0.0.1 that plays the capture role for
//! a Tapwire session:
//!
//! - TLS handshakes are answered with leaves from the session CA
//! - Every HTTP exchange runs through a fresh interceptor chain connection
//! - Hosts on the bypass list are tunnelled without decryption
//!
//! ```text
//! Client → CONNECT → bypassed? ── yes ──→ raw tunnel
//!                       │ no
//!                       ▼
//!              TLS with session leaf → chain request stages → upstream
//!                                                                │
//!              client ← chain response stages (reverse) ←────────┘
//! ```

mod authority;
mod handler;
mod proxy;

pub use authority::LeafAuthority;
pub use handler::ChainHandler;
pub use proxy::ProxyCapture;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8877;
