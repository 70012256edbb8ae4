//! splitgate edge
//!
//! Traffic-splitting HTTP edge. Public listening sockets come from the
//! process supervisor and are tunneled onto local ports, where every
//! request is either proxied to one of two backend hosts or redirected.

pub mod admin;
pub mod app;
pub mod config;
pub mod dispatch;
pub mod rules;
pub mod serve;
pub mod stats;
pub mod tunnel;

pub use app::{router, AppState};
pub use config::{RunMode, Settings, TlsFiles};
pub use dispatch::{
    DispatchEngine, DispatchReason, Disposition, HttpsUpstream, Upstream, UpstreamError,
};
pub use rules::{Backend, RuleError, RuleResolver, RuleStore, StoreError, StoreResolver};
pub use stats::ConnectionCounter;
pub use tunnel::{InheritedListeners, SocketTunnel, TunnelStats};
