//! C7 (per-request middleware) and C8 (assembler): the collection side of
//! apptrace. Subscribes to the event bus for the lifetime of one tagged
//! HTTP request, sanitizes and reorders what it collected, and ships it to
//! the ingestion API.

pub mod assembler;
pub mod config;
pub mod error;
pub mod middleware;
pub mod sanitize;
pub mod transport;

pub use assembler::{assemble, balance, batch, reorder, Batch};
pub use config::{Config, ConfigBuilder, Mode};
pub use error::CollectorError;
pub use middleware::{RequestSnapshot, RequestTrace, RouteParams, TraceLayer, TraceService, TappedBody};
pub use sanitize::{sanitize, Caps, RawValue};
pub use transport::{FlushPayload, Transport};
