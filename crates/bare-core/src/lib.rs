//! Core tunneling-proxy logic (spec.md overview): protocol codec, header
//! splitting, outbound fetch, meta store, the v1/v2/v3 version handlers,
//! and the prefix-routed server core. Deliberately has no socket-owning
//! entry point of its own — see `server::BareServer` and spec.md §1 for
//! why the TCP/TLS listener is left to an external binary crate.

pub mod codec;
pub mod cors;
pub mod error;
pub mod fetch;
pub mod header_split;
pub mod headers;
pub mod manifest;
pub mod meta;
pub mod ratelimit;
pub mod relay;
pub mod remote;
pub mod request;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod versions;
pub mod ws;

pub use error::{BareError, BareResult};
pub use manifest::{Maintainer, Manifest, Project};
pub use request::{BodyReader, HttpVersion, Method, Request, UpgradedStream};
pub use response::{Header, Response};
pub use server::{BareServer, BareServerConfig, RateLimitGate};
pub use shutdown::GracefulShutdown;
