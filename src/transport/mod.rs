// Authenticated request transport.
// Attaches the access credential, refreshes it once on expiry, and decodes responses.

pub mod client;
pub mod connector;
pub mod payload;

pub use client::{RequestOptions, Transport};
pub use connector::{Connector, HttpRequest, HttpResponse, Method, RequestBody, ReqwestConnector};
pub use payload::{ContentKind, Payload};
