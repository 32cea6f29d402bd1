//! Server-push channel delivering document-change notifications for
//! subscribed queries.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::StreamConfig;
use crate::credentials::CredentialsProvider;
use crate::database_info::DatabaseInfo;
use crate::errors::Error;
use crate::model::SnapshotVersion;
use crate::model::TargetData;
use crate::model::TargetId;
use crate::model::WatchChange;
use crate::serializer::ListenSnapshot;
use crate::serializer::Serializer;
use crate::stream::StreamCore;
use crate::stream::StreamProtocol;
use crate::transport::Transport;
use crate::transport::WATCH_RPC_PATH;
use crate::worker_queue::WorkerQueue;

/// Observer for watch stream lifecycle and change events. All methods are
/// invoked on the worker queue.
pub trait WatchStreamDelegate: Send + Sync + 'static {
    /// The stream is open and targets may be watched.
    fn on_open(&self);

    /// One decoded change, with the snapshot version it was consistent at.
    fn on_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    );

    /// The stream closed. `None` after a clean idle close; otherwise the
    /// normalized transport error. Never invoked after `stop()`.
    fn on_close(
        &self,
        error: Option<Error>,
    );
}

pub(crate) struct WatchProtocol {
    serializer: Arc<dyn Serializer>,
    database: String,
}

impl StreamProtocol for WatchProtocol {
    type Delegate = Arc<dyn WatchStreamDelegate>;
    type Event = ListenSnapshot;

    fn rpc_path(&self) -> &'static str {
        WATCH_RPC_PATH
    }

    fn label(&self) -> &'static str {
        "watch"
    }

    fn handle_message(
        &mut self,
        frame: Bytes,
    ) -> crate::errors::Result<ListenSnapshot> {
        self.serializer.decode_listen_response(&frame)
    }

    fn notify_open(delegate: &Self::Delegate) {
        delegate.on_open();
    }

    fn notify_event(
        delegate: &Self::Delegate,
        event: ListenSnapshot,
    ) {
        delegate.on_change(event.change, event.snapshot_version);
    }

    fn notify_close(
        delegate: &Self::Delegate,
        error: Option<Error>,
    ) {
        delegate.on_close(error);
    }
}

/// Client handle for the listen rpc.
///
/// Created by [`Datastore::create_watch_stream`](crate::Datastore) and
/// owned by the caller; every method must be invoked on the worker queue.
#[derive(Clone)]
pub struct WatchStream {
    core: Arc<StreamCore<WatchProtocol>>,
}

impl WatchStream {
    pub(crate) fn new(
        queue: WorkerQueue,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: Arc<dyn Serializer>,
        database: DatabaseInfo,
        config: &StreamConfig,
    ) -> Self {
        let protocol = WatchProtocol {
            serializer,
            database: database.resource_prefix(),
        };
        Self {
            core: StreamCore::new(queue, transport, credentials, database, config, protocol),
        }
    }

    pub fn start(
        &self,
        delegate: Arc<dyn WatchStreamDelegate>,
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

    /// Subscribes a target server-side.
    ///
    /// # Panics
    /// Panics unless the stream is open.
    pub fn watch(
        &self,
        target: &TargetData,
    ) {
        self.core.send_request(|protocol| {
            protocol
                .serializer
                .encode_watch_request(&protocol.database, target)
        });
    }

    /// Unsubscribes a target.
    ///
    /// # Panics
    /// Panics unless the stream is open.
    pub fn unwatch(
        &self,
        target_id: TargetId,
    ) {
        self.core.send_request(|protocol| {
            protocol
                .serializer
                .encode_unwatch_request(&protocol.database, target_id)
        });
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<StreamCore<WatchProtocol>> {
        &self.core
    }
}
