//! FastCGI upstream support: record framing, a connection pool to one
//! upstream app, and the completion stage that lets a client connection
//! wait on an upstream reply without blocking a worker thread. Supplements
//! the distilled core with a real exerciser for the continuation protocol
//! (see `crate::continuation`) rather than a synthetic stub.

pub mod completion_stage;
pub mod connection_pool;
pub mod proto;

pub use completion_stage::{FcgiCompletionStage, FcgiRequestHandler};
pub use connection_pool::ConnectionPool;
