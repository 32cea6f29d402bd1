//! Client-push channel submitting mutation batches; the server acknowledges
//! each batch with a commit version.
//!
//! The stream opens with a handshake exchange: a request naming only the
//! database, answered by the first response frame. Mutations may flow only
//! after that. Each response carries an opaque stream token which is echoed
//! on subsequent requests; the token survives re-opens within the process
//! but is deliberately never persisted.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::StreamConfig;
use crate::credentials::CredentialsProvider;
use crate::database_info::DatabaseInfo;
use crate::errors::Error;
use crate::model::Mutation;
use crate::model::MutationResult;
use crate::model::SnapshotVersion;
use crate::serializer::Serializer;
use crate::stream::StreamCore;
use crate::stream::StreamProtocol;
use crate::transport::Transport;
use crate::transport::WRITE_RPC_PATH;
use crate::worker_queue::WorkerQueue;

/// Observer for write stream lifecycle and acknowledgements. All methods
/// are invoked on the worker queue.
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The stream is open; the handshake may be sent.
    fn on_open(&self);

    /// The handshake acknowledgement arrived; mutations may flow.
    fn on_handshake_complete(&self);

    /// One batch of mutations was committed.
    fn on_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    );

    /// The stream closed. Never invoked after `stop()`.
    fn on_close(
        &self,
        error: Option<Error>,
    );
}

pub(crate) enum WriteStreamEvent {
    HandshakeComplete,
    Response {
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
}

pub(crate) struct WriteProtocol {
    serializer: Arc<dyn Serializer>,
    database: String,
    handshake_complete: bool,
    last_stream_token: Bytes,
}

impl StreamProtocol for WriteProtocol {
    type Delegate = Arc<dyn WriteStreamDelegate>;
    type Event = WriteStreamEvent;

    fn rpc_path(&self) -> &'static str {
        WRITE_RPC_PATH
    }

    fn label(&self) -> &'static str {
        "write"
    }

    fn on_stream_start(&mut self) {
        // Every rpc negotiates its own session; the token alone carries
        // over.
        self.handshake_complete = false;
    }

    fn handle_message(
        &mut self,
        frame: Bytes,
    ) -> crate::errors::Result<WriteStreamEvent> {
        let response = self.serializer.decode_write_response(&frame)?;
        // Always advance the token so the next request resumes the session
        // where the server left it.
        self.last_stream_token = response.stream_token;

        if !self.handshake_complete {
            self.handshake_complete = true;
            Ok(WriteStreamEvent::HandshakeComplete)
        } else {
            Ok(WriteStreamEvent::Response {
                commit_version: response.commit_version.unwrap_or(SnapshotVersion::NONE),
                results: response.results,
            })
        }
    }

    fn notify_open(delegate: &Self::Delegate) {
        delegate.on_open();
    }

    fn notify_event(
        delegate: &Self::Delegate,
        event: WriteStreamEvent,
    ) {
        match event {
            WriteStreamEvent::HandshakeComplete => delegate.on_handshake_complete(),
            WriteStreamEvent::Response {
                commit_version,
                results,
            } => delegate.on_response(commit_version, results),
        }
    }

    fn notify_close(
        delegate: &Self::Delegate,
        error: Option<Error>,
    ) {
        delegate.on_close(error);
    }
}

/// Client handle for the write rpc.
///
/// Created by [`Datastore::create_write_stream`](crate::Datastore) and
/// owned by the caller; every method must be invoked on the worker queue.
#[derive(Clone)]
pub struct WriteStream {
    core: Arc<StreamCore<WriteProtocol>>,
}

impl WriteStream {
    pub(crate) fn new(
        queue: WorkerQueue,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: Arc<dyn Serializer>,
        database: DatabaseInfo,
        config: &StreamConfig,
    ) -> Self {
        let protocol = WriteProtocol {
            serializer,
            database: database.resource_prefix(),
            handshake_complete: false,
            last_stream_token: Bytes::new(),
        };
        Self {
            core: StreamCore::new(queue, transport, credentials, database, config, protocol),
        }
    }

    pub fn start(
        &self,
        delegate: Arc<dyn WriteStreamDelegate>,
    ) {
        self.core.start(delegate);
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_started(&self) -> bool {
        self.core.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn mark_idle(&self) {
        self.core.mark_idle();
    }

    /// Whether the opening exchange has completed on the current rpc.
    pub fn is_handshake_complete(&self) -> bool {
        self.core.with_protocol(|protocol| protocol.handshake_complete)
    }

    /// The stream token from the most recent response.
    pub fn last_stream_token(&self) -> Bytes {
        self.core
            .with_protocol(|protocol| protocol.last_stream_token.clone())
    }

    /// Sends the session-opening request.
    ///
    /// # Panics
    /// Panics unless the stream is open and the handshake has not already
    /// completed.
    pub fn write_handshake(&self) {
        self.core.send_request(|protocol| {
            assert!(
                !protocol.handshake_complete,
                "write handshake already completed"
            );
            protocol.serializer.encode_write_handshake(&protocol.database)
        });
    }

    /// Sends one batch of mutations together with the current stream token.
    ///
    /// # Panics
    /// Panics unless the stream is open and the handshake has completed.
    pub fn write_mutations(
        &self,
        mutations: &[Mutation],
    ) {
        self.core.send_request(|protocol| {
            assert!(
                protocol.handshake_complete,
                "write stream handshake is not complete"
            );
            protocol
                .serializer
                .encode_write_request(&protocol.last_stream_token, mutations)
        });
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<StreamCore<WriteProtocol>> {
        &self.core
    }
}
