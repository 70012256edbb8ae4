//! Socket tunnel.
//!
//! Relays raw byte streams from supervisor-inherited listening sockets to
//! the locally bound HTTP(S) ports.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor fd -> SocketTunnel (accept loop) -> relay task pair -> 127.0.0.1:<port>
//!                        |
//!                 ConnectionCounter
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut inherited = InheritedListeners::from_supervisor(2);
//! let tunnel = SocketTunnel::from_inherited(&mut inherited, 0, 8080, counter)?;
//! tokio::spawn(Arc::new(tunnel).run());
//! ```

mod activation;
mod listener;
mod relay;

pub use activation::{ActivationError, InheritedListeners, LISTEN_FDS_START};
pub use listener::{SocketTunnel, TunnelStats, ACCEPT_ERROR_BACKOFF};
pub use relay::{relay, RelayOutcome, Side};
