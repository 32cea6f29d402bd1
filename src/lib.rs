//! Streaming rpc client core for a cloud document database SDK.
//!
//! This crate is the remote layer underneath the object model, local cache
//! and query engine: it keeps two long-lived bidirectional streams alive
//! against the backend: a *watch* stream pushing document-change
//! notifications for subscribed queries, and a *write* stream carrying
//! mutation batches and their commit acknowledgements. It also dispatches the
//! one-shot commit and batch-get rpcs.
//!
//! The moving parts:
//!
//! - [`WorkerQueue`] - the serial executor every state transition and every
//!   delegate callback runs on. Transport and credentials callbacks arrive
//!   on foreign threads and marshal themselves here.
//! - [`WatchStream`] / [`WriteStream`] - six-state lifecycles (initial,
//!   authenticating, open, error, backing-off, stopped) over an abstract
//!   [`Transport`], with exponential backoff between restarts and a 60 s
//!   idle timer that releases quiet streams.
//! - [`Datastore`] - builds the streams and runs the unary rpcs, attaching
//!   auth and normalizing errors into the gRPC code taxonomy.
//!
//! Cancellation is strict: once `stop()` has run on the worker queue, the
//! delegate observes nothing further, even if the transport later delivers
//! buffered events.
//!
//! # Basic usage
//! ```rust,ignore
//! use firestore_remote::{Datastore, DatabaseInfo, StreamConfig, WorkerQueue};
//!
//! let queue = WorkerQueue::new();
//! let database = DatabaseInfo::new("my-project", "(default)", "main",
//!     "firestore.googleapis.com", true);
//! let datastore = Datastore::new(database, queue.clone(), transport,
//!     credentials, serializer, StreamConfig::default());
//!
//! let watch = datastore.create_watch_stream();
//! queue.dispatch_async(move || watch.start(delegate));
//! ```
//!
//! The transport (HTTP/2 streaming rpc), wire serialization and the token
//! source are collaborator traits implemented by the embedding SDK:
//! [`Transport`], [`Serializer`], [`CredentialsProvider`].

mod backoff;
mod config;
mod credentials;
mod database_info;
mod datastore;
mod errors;
mod model;
mod request_writer;
mod serializer;
mod stream;
mod transport;
mod watch_stream;
mod worker_queue;
mod write_stream;

pub use backoff::*;
pub use config::*;
pub use credentials::*;
pub use database_info::*;
pub use datastore::*;
pub use errors::*;
pub use model::*;
pub use request_writer::*;
pub use serializer::*;
pub use transport::*;
pub use watch_stream::WatchStream;
pub use watch_stream::WatchStreamDelegate;
pub use worker_queue::*;
pub use write_stream::WriteStream;
pub use write_stream::WriteStreamDelegate;

pub use stream::StreamState;

#[cfg(test)]
mod test_utils;
