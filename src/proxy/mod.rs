// Proxy module - HTTP server that forwards requests to configured upstreams
//
// Requests arrive as `/<upstream>/<path>`. The routing identifier selects an
// upstream, the request is forwarded with its headers adjusted, and the
// response streams back to the client unchanged while a tee hands a copy of
// the body to the capture pipeline.

pub mod auth;
pub mod capture;
pub mod error;
pub mod handlers;
mod helpers;
pub mod server;
pub mod sse;
pub mod state;
pub mod tee;

pub use server::start_proxy;
pub use state::ProxyState;
