//! A staged, event-driven connection-processing core for network servers.
//!
//! Connections move through a small pipeline of independently-threaded
//! stages — `PollInStage` reads, `ParserStage` turns bytes into a reply,
//! and either `BlockOutStage` or `PollOutStage` writes it back — each
//! stage pulling its next connection off a [`scheduler::QueueScheduler`]
//! rather than being driven directly by the one before it. A handler can
//! suspend a connection mid-request (see [`continuation`]) while it waits
//! on some other I/O and resume it later without blocking a worker
//! thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tube::config::Config;
//! use tube::pipeline::Pipeline;
//! use tube::server::Server;
//! use tube::stages::parser::EchoHandler;
//!
//! let config = Config::default();
//! let addr = config.listen_addr.clone();
//! let pipeline = Pipeline::build(config, Arc::new(EchoHandler)).unwrap();
//! Server::new(pipeline).run(&addr).unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod continuation;
pub mod controller;
pub mod error;
pub mod fcgi;
pub mod pipeline;
pub mod poller;
pub mod scheduler;
pub mod server;
pub mod stage;
pub mod stages;
pub mod stream;
pub mod sys;
pub mod timer;
pub mod util;

pub use error::{Error, Result};
