//! Inbound side: sniffing, plaintext HTTP handling and TLS hand-off

pub mod bounded;
pub mod handler;
pub mod listener;
pub mod redirect;
pub mod request;
pub mod response;
pub mod sniff;
pub mod tls;

pub use bounded::BoundedReader;
pub use handler::{HttpHandler, RequestBody, RequestHandler};
pub use listener::{Listener, ListenerStats, Session, ShutdownSignal, StatsSnapshot};
pub use request::Request;
pub use response::ResponseBuilder;
pub use sniff::{Classification, SniffedStream};
