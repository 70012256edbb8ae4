//! Request dispatch.
//!
//! Decides, per inbound HTTP request, whether to proxy it to backend A,
//! proxy it to the host named by a proxy rule, or answer with a redirect.
//!
//! Precedence (first match wins):
//!
//! ```text
//! Host ends with :4443 -> backend A on :4443
//! proxy rule(hostname) -> rule target
//! redirect rule(hostname + path) -> 307 Location
//! otherwise            -> backend A
//! ```
//!
//! Proxied requests always leave over TLS.

mod engine;
mod forwarded;
mod upstream;

pub use engine::{DispatchEngine, DispatchReason, Disposition, SPECIAL_PORT_SUFFIX};
pub use forwarded::{
    prepare_forward, split_host_port, strip_hop_by_hop, ClientAddr, InboundScheme,
    X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO,
};
pub use upstream::{HttpsUpstream, Upstream, UpstreamError};
