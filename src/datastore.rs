//! Entry point of the remote layer: creates the long-lived streams and
//! executes the one-shot commit and batch-get rpcs.
//!
//! Unaries ride the same service as the streams: a fresh rpc per call, the
//! single request frame written and half-closed immediately, responses
//! accumulated until the transport reports the call done. Results and
//! normalized errors are delivered to the caller's completion on the worker
//! queue.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Code;
use tonic::Status;
use tracing::debug;
use tracing::error;

use crate::config::StreamConfig;
use crate::credentials::CredentialsProvider;
use crate::database_info::DatabaseInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::DocumentKey;
use crate::model::MaybeDocument;
use crate::model::Mutation;
use crate::model::MutationResult;
use crate::request_writer::RequestWriter;
use crate::serializer::Serializer;
use crate::transport::request_headers;
use crate::transport::StreamCallback;
use crate::transport::StreamingCall;
use crate::transport::Transport;
use crate::transport::BATCH_GET_RPC_PATH;
use crate::transport::COMMIT_RPC_PATH;
use crate::watch_stream::WatchStream;
use crate::worker_queue::WorkerQueue;
use crate::write_stream::WriteStream;

/// Factory for streams and dispatcher for unary rpcs.
///
/// Streams handed out by the factory methods are transferred to the caller;
/// the datastore keeps no record of them.
#[derive(Clone)]
pub struct Datastore {
    database: DatabaseInfo,
    queue: WorkerQueue,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialsProvider>,
    serializer: Arc<dyn Serializer>,
    config: StreamConfig,
}

impl Datastore {
    pub fn new(
        database: DatabaseInfo,
        queue: WorkerQueue,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: Arc<dyn Serializer>,
        config: StreamConfig,
    ) -> Self {
        Self {
            database,
            queue,
            transport,
            credentials,
            serializer,
            config,
        }
    }

    pub fn database_info(&self) -> &DatabaseInfo {
        &self.database
    }

    /// Builds a watch stream. Ownership transfers to the caller.
    pub fn create_watch_stream(&self) -> WatchStream {
        WatchStream::new(
            self.queue.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            Arc::clone(&self.serializer),
            self.database.clone(),
            &self.config,
        )
    }

    /// Builds a write stream. Ownership transfers to the caller.
    pub fn create_write_stream(&self) -> WriteStream {
        WriteStream::new(
            self.queue.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            Arc::clone(&self.serializer),
            self.database.clone(),
            &self.config,
        )
    }

    /// Commits `mutations` atomically; `completion` runs on the worker
    /// queue with the per-mutation results.
    pub fn commit(
        &self,
        mutations: Vec<Mutation>,
        completion: impl FnOnce(Result<Vec<MutationResult>>) + Send + 'static,
    ) {
        let payload = self
            .serializer
            .encode_commit_request(&self.database.resource_prefix(), &mutations);
        let serializer = Arc::clone(&self.serializer);
        self.invoke_rpc(COMMIT_RPC_PATH, payload, move |frames| {
            completion(frames.and_then(|frames| {
                let frame = frames
                    .first()
                    .ok_or_else(|| Error::internal("commit rpc returned no response"))?;
                serializer.decode_commit_response(frame)
            }));
        });
    }

    /// Fetches `keys` in one batch; `completion` runs on the worker queue
    /// with one entry per returned document.
    pub fn lookup(
        &self,
        keys: Vec<DocumentKey>,
        completion: impl FnOnce(Result<Vec<MaybeDocument>>) + Send + 'static,
    ) {
        let payload = self
            .serializer
            .encode_lookup_request(&self.database.resource_prefix(), &keys);
        let serializer = Arc::clone(&self.serializer);
        self.invoke_rpc(BATCH_GET_RPC_PATH, payload, move |frames| {
            completion(frames.and_then(|frames| {
                frames
                    .iter()
                    .map(|frame| serializer.decode_lookup_response(frame))
                    .collect()
            }));
        });
    }

    /// Shared unary machinery: authenticate, dial, send the one request,
    /// collect response frames until the transport closes the call.
    fn invoke_rpc(
        &self,
        path: &'static str,
        payload: Bytes,
        completion: impl FnOnce(Result<Vec<Bytes>>) + Send + 'static,
    ) {
        let queue = self.queue.clone();
        let transport = Arc::clone(&self.transport);
        let credentials = Arc::clone(&self.credentials);
        let database = self.database.clone();

        tokio::spawn(async move {
            let token = credentials.get_token().await;
            queue.clone().dispatch_async_allowing_same_queue(move || {
                let token = match token {
                    Ok(token) => token,
                    Err(auth_error) => {
                        error!(path, error = %auth_error, "unary rpc auth failed");
                        completion(Err(auth_error));
                        return;
                    }
                };

                debug!(path, "invoking unary rpc");
                let requests = RequestWriter::new();
                let mut call = transport.create_stream(path, requests.clone());
                call.set_request_headers(request_headers(&database));
                call.set_access_token(if token.is_empty() {
                    None
                } else {
                    Some(token.token().to_string())
                });

                let pending = Arc::new(PendingUnary {
                    path,
                    queue,
                    frames: Mutex::new(Vec::new()),
                    completion: Mutex::new(Some(Box::new(completion))),
                    call: Mutex::new(None),
                });
                call.start(Arc::clone(&pending) as Arc<dyn StreamCallback>);

                requests.write_value(payload);
                requests.finish(None);

                // The pending rpc keeps its own handle alive until the
                // close event releases it.
                *pending.call.lock() = Some(call);
            });
        });
    }
}

type UnaryCompletion = Box<dyn FnOnce(Result<Vec<Bytes>>) + Send>;

/// Accumulator for one in-flight unary rpc.
struct PendingUnary {
    path: &'static str,
    queue: WorkerQueue,
    frames: Mutex<Vec<Bytes>>,
    completion: Mutex<Option<UnaryCompletion>>,
    call: Mutex<Option<Box<dyn StreamingCall>>>,
}

impl StreamCallback for PendingUnary {
    fn on_message(
        &self,
        frame: Bytes,
    ) {
        self.frames.lock().push(frame);
    }

    fn on_close(
        &self,
        status: Option<Status>,
    ) {
        let frames = std::mem::take(&mut *self.frames.lock());
        let completion = self.completion.lock().take();
        // Drop the rpc handle; this breaks the handle/callback cycle.
        let _call = self.call.lock().take();

        let Some(completion) = completion else {
            return;
        };
        let result = match status.filter(|status| status.code() != Code::Ok) {
            Some(status) => Err(Error::from(status)),
            None => Ok(frames),
        };
        if let Err(ref rpc_error) = result {
            debug!(path = self.path, error = %rpc_error, "unary rpc failed");
        }
        self.queue
            .dispatch_async_allowing_same_queue(move || completion(result));
    }
}
