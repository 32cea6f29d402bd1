//! Hand-rolled mocks for exercising the streams without a network.
//!
//! The mock transport records every rpc it is asked to create and lets
//! tests drive the callback surface (frames, close events) the way a real
//! transport would, including the synchronous completion that follows
//! `finish_with_error`. The test serializer speaks a trivial line-oriented
//! format so frames stay readable in assertions.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tonic::Code;
use tonic::Status;

use crate::credentials::CredentialsProvider;
use crate::credentials::GetTokenResult;
use crate::database_info::DatabaseInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::model::DocumentKey;
use crate::model::MaybeDocument;
use crate::model::Mutation;
use crate::model::MutationResult;
use crate::model::SnapshotVersion;
use crate::model::TargetChangeKind;
use crate::model::TargetData;
use crate::model::TargetId;
use crate::model::WatchChange;
use crate::request_writer::RequestWriter;
use crate::serializer::ListenSnapshot;
use crate::serializer::Serializer;
use crate::serializer::WriteStreamResponse;
use crate::transport::StreamCallback;
use crate::transport::StreamingCall;
use crate::transport::Transport;
use crate::watch_stream::WatchStreamDelegate;
use crate::worker_queue::WorkerQueue;
use crate::write_stream::WriteStreamDelegate;

// ==================== Queue helpers ====================

/// Runs `f` on the worker queue and awaits its result.
pub(crate) async fn run_on_queue<T: Send + 'static>(
    queue: &WorkerQueue,
    f: impl FnOnce() -> T + Send + 'static,
) -> T {
    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.dispatch_async(move || {
        let _ = tx.send(f());
    });
    rx.await.expect("worker queue task dropped")
}

/// Lets spawned futures and queue backlogs drain: token fetches, filter
/// bounces and delegate notifications all complete within a few rounds.
pub(crate) async fn settle(queue: &WorkerQueue) {
    for _ in 0..5 {
        tokio::task::yield_now().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.dispatch_async(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

pub(crate) fn test_database() -> DatabaseInfo {
    DatabaseInfo::new(
        "test-project",
        "(default)",
        "persistence",
        "example.invalid",
        false,
    )
}

// ==================== Mock transport ====================

/// One rpc created through the [`MockTransport`].
pub(crate) struct MockCall {
    pub path: String,
    pub requests: RequestWriter,
    headers: Mutex<Option<MetadataMap>>,
    token: Mutex<Option<Option<String>>>,
    callback: Mutex<Option<Arc<dyn StreamCallback>>>,
    started: AtomicBool,
    finish_status: Mutex<Option<Status>>,
    pub response_headers: Mutex<MetadataMap>,
}

impl MockCall {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn headers(&self) -> Option<MetadataMap> {
        self.headers.lock().clone()
    }

    /// The token installed on the call: `None` if `set_access_token` was
    /// never invoked, `Some(None)` for an explicit unauthenticated call.
    pub fn token(&self) -> Option<Option<String>> {
        self.token.lock().clone()
    }

    pub fn finish_status(&self) -> Option<Status> {
        self.finish_status.lock().clone()
    }

    /// Frames the client wrote so far, drained.
    pub fn written(&self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = self.requests.try_next() {
            frames.push(frame);
        }
        frames
    }

    /// Delivers one inbound frame through the registered callback, the way
    /// the transport would from its own thread.
    pub fn deliver(
        &self,
        frame: Bytes,
    ) {
        let callback = self.callback.lock().clone().expect("rpc not started");
        callback.on_message(frame);
    }

    /// Reports the rpc closed.
    pub fn close(
        &self,
        status: Option<Status>,
    ) {
        let callback = self.callback.lock().clone().expect("rpc not started");
        callback.on_close(status);
    }
}

struct MockCallHandle {
    call: Arc<MockCall>,
}

impl StreamingCall for MockCallHandle {
    fn set_request_headers(
        &mut self,
        headers: MetadataMap,
    ) {
        *self.call.headers.lock() = Some(headers);
    }

    fn set_access_token(
        &mut self,
        token: Option<String>,
    ) {
        *self.call.token.lock() = Some(token);
    }

    fn start(
        &mut self,
        callback: Arc<dyn StreamCallback>,
    ) {
        *self.call.callback.lock() = Some(callback);
        self.call.started.store(true, Ordering::Release);
    }

    fn finish_with_error(
        &mut self,
        status: Status,
    ) {
        *self.call.finish_status.lock() = Some(status.clone());
        // A real transport acknowledges the teardown with a close event.
        if let Some(callback) = self.call.callback.lock().clone() {
            callback.on_close(Some(status));
        }
    }

    fn response_headers(&self) -> MetadataMap {
        self.call.response_headers.lock().clone()
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<Arc<MockCall>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call(
        &self,
        index: usize,
    ) -> Arc<MockCall> {
        Arc::clone(&self.calls.lock()[index])
    }

    pub fn last_call(&self) -> Arc<MockCall> {
        Arc::clone(self.calls.lock().last().expect("no rpc was created"))
    }
}

impl Transport for MockTransport {
    fn create_stream(
        &self,
        path: &str,
        requests: RequestWriter,
    ) -> Box<dyn StreamingCall> {
        let call = Arc::new(MockCall {
            path: path.to_string(),
            requests,
            headers: Mutex::new(None),
            token: Mutex::new(None),
            callback: Mutex::new(None),
            started: AtomicBool::new(false),
            finish_status: Mutex::new(None),
            response_headers: Mutex::new(MetadataMap::new()),
        });
        self.calls.lock().push(Arc::clone(&call));
        Box::new(MockCallHandle { call })
    }
}

// ==================== Mock credentials ====================

pub(crate) struct MockCredentials {
    result: Mutex<Result<GetTokenResult>>,
    pub fetches: Mutex<usize>,
}

impl MockCredentials {
    pub fn with_token(token: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Ok(GetTokenResult::new(token))),
            fetches: Mutex::new(0),
        })
    }

    pub fn anonymous() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Ok(GetTokenResult::empty())),
            fetches: Mutex::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Err(Error::unauthenticated("token fetch refused"))),
            fetches: Mutex::new(0),
        })
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for MockCredentials {
    async fn get_token(&self) -> Result<GetTokenResult> {
        *self.fetches.lock() += 1;
        self.result.lock().clone()
    }
}

// ==================== Test serializer ====================

/// Line-oriented stand-in for the protobuf serializer. Frames are UTF-8
/// strings like `snapshot:7:1,2`; anything unparseable decodes to an
/// internal error, which lets tests exercise the malformed-frame path with
/// arbitrary garbage.
pub(crate) struct TestSerializer;

impl TestSerializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    pub fn listen_frame(
        seconds: i64,
        target_ids: &[TargetId],
    ) -> Bytes {
        Bytes::from(format!("snapshot:{}:{}", seconds, join_ids(target_ids)))
    }

    pub fn handshake_ack_frame(token: &str) -> Bytes {
        Bytes::from(format!("ack:{token}"))
    }

    pub fn write_response_frame(
        token: &str,
        seconds: i64,
        results: usize,
    ) -> Bytes {
        Bytes::from(format!("response:{token}:{seconds}:{results}"))
    }

    pub fn commit_response_frame(
        seconds: i64,
        results: usize,
    ) -> Bytes {
        Bytes::from(format!("committed:{seconds}:{results}"))
    }

    pub fn found_frame(
        path: &str,
        seconds: i64,
    ) -> Bytes {
        Bytes::from(format!("found:{path}:{seconds}"))
    }

    pub fn missing_frame(
        path: &str,
        seconds: i64,
    ) -> Bytes {
        Bytes::from(format!("missing:{path}:{seconds}"))
    }
}

fn join_ids(target_ids: &[TargetId]) -> String {
    target_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_frame<'a>(
    frame: &'a [u8],
    expected_tag: &str,
) -> Result<Vec<&'a str>> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| Error::internal("frame is not valid utf-8"))?;
    let mut parts = text.split(':');
    let tag = parts.next().unwrap_or_default();
    if tag != expected_tag {
        return Err(Error::internal(format!(
            "expected {expected_tag} frame, got {tag:?}"
        )));
    }
    Ok(parts.collect())
}

fn parse_i64(field: &str) -> Result<i64> {
    field
        .parse()
        .map_err(|_| Error::internal(format!("bad integer field {field:?}")))
}

impl Serializer for TestSerializer {
    fn encode_watch_request(
        &self,
        database: &str,
        target: &TargetData,
    ) -> Bytes {
        Bytes::from(format!("watch:{database}:{}", target.target_id))
    }

    fn encode_unwatch_request(
        &self,
        database: &str,
        target_id: TargetId,
    ) -> Bytes {
        Bytes::from(format!("unwatch:{database}:{target_id}"))
    }

    fn decode_listen_response(
        &self,
        frame: &[u8],
    ) -> Result<ListenSnapshot> {
        let fields = parse_frame(frame, "snapshot")?;
        let &[seconds, ids] = fields.as_slice() else {
            return Err(Error::internal("snapshot frame needs 2 fields"));
        };
        let target_ids = ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(|id| parse_i64(id).map(|id| id as TargetId))
            .collect::<Result<Vec<_>>>()?;
        Ok(ListenSnapshot {
            change: WatchChange::TargetChange {
                kind: TargetChangeKind::NoChange,
                target_ids,
                resume_token: Bytes::new(),
                cause: None,
            },
            snapshot_version: SnapshotVersion::new(parse_i64(seconds)?, 0),
        })
    }

    fn encode_write_handshake(
        &self,
        database: &str,
    ) -> Bytes {
        Bytes::from(format!("handshake:{database}"))
    }

    fn encode_write_request(
        &self,
        stream_token: &Bytes,
        mutations: &[Mutation],
    ) -> Bytes {
        Bytes::from(format!(
            "write:{}:{}",
            String::from_utf8_lossy(stream_token),
            mutations.len()
        ))
    }

    fn decode_write_response(
        &self,
        frame: &[u8],
    ) -> Result<WriteStreamResponse> {
        if let Ok(fields) = parse_frame(frame, "ack") {
            let &[token] = fields.as_slice() else {
                return Err(Error::internal("ack frame needs 1 field"));
            };
            return Ok(WriteStreamResponse {
                stream_token: Bytes::from(token.to_string()),
                commit_version: None,
                results: Vec::new(),
            });
        }

        let fields = parse_frame(frame, "response")?;
        let &[token, seconds, results] = fields.as_slice() else {
            return Err(Error::internal("response frame needs 3 fields"));
        };
        let version = SnapshotVersion::new(parse_i64(seconds)?, 0);
        Ok(WriteStreamResponse {
            stream_token: Bytes::from(token.to_string()),
            commit_version: Some(version),
            results: vec![
                MutationResult {
                    version: Some(version),
                    transform_results: Vec::new(),
                };
                parse_i64(results)? as usize
            ],
        })
    }

    fn encode_commit_request(
        &self,
        database: &str,
        mutations: &[Mutation],
    ) -> Bytes {
        Bytes::from(format!("commit:{database}:{}", mutations.len()))
    }

    fn decode_commit_response(
        &self,
        frame: &[u8],
    ) -> Result<Vec<MutationResult>> {
        let fields = parse_frame(frame, "committed")?;
        let &[seconds, results] = fields.as_slice() else {
            return Err(Error::internal("committed frame needs 2 fields"));
        };
        let version = SnapshotVersion::new(parse_i64(seconds)?, 0);
        Ok(vec![
            MutationResult {
                version: Some(version),
                transform_results: Vec::new(),
            };
            parse_i64(results)? as usize
        ])
    }

    fn encode_lookup_request(
        &self,
        database: &str,
        keys: &[DocumentKey],
    ) -> Bytes {
        let paths = keys
            .iter()
            .map(|key| key.path.as_str())
            .collect::<Vec<_>>()
            .join("+");
        Bytes::from(format!("lookup:{database}:{paths}"))
    }

    fn decode_lookup_response(
        &self,
        frame: &[u8],
    ) -> Result<MaybeDocument> {
        if let Ok(fields) = parse_frame(frame, "found") {
            let &[path, seconds] = fields.as_slice() else {
                return Err(Error::internal("found frame needs 2 fields"));
            };
            return Ok(MaybeDocument::Found {
                key: DocumentKey::new(path),
                version: SnapshotVersion::new(parse_i64(seconds)?, 0),
                document: Bytes::new(),
            });
        }
        let fields = parse_frame(frame, "missing")?;
        let &[path, seconds] = fields.as_slice() else {
            return Err(Error::internal("missing frame needs 2 fields"));
        };
        Ok(MaybeDocument::Missing {
            key: DocumentKey::new(path),
            read_time: SnapshotVersion::new(parse_i64(seconds)?, 0),
        })
    }
}

// ==================== Recording delegates ====================

/// Flattened view of the callbacks a delegate observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TraceEvent {
    Open,
    Change { seconds: i64 },
    HandshakeComplete,
    Response { seconds: i64, results: usize },
    Close { code: Option<Code> },
}

/// Records every callback; implements both delegate traits so one type
/// serves both streams.
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    fn push(
        &self,
        event: TraceEvent,
    ) {
        self.events.lock().push(event);
    }
}

impl WatchStreamDelegate for RecordingDelegate {
    fn on_open(&self) {
        self.push(TraceEvent::Open);
    }

    fn on_change(
        &self,
        _change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) {
        self.push(TraceEvent::Change {
            seconds: snapshot_version.seconds,
        });
    }

    fn on_close(
        &self,
        error: Option<Error>,
    ) {
        self.push(TraceEvent::Close {
            code: error.map(|error| error.code),
        });
    }
}

impl WriteStreamDelegate for RecordingDelegate {
    fn on_open(&self) {
        self.push(TraceEvent::Open);
    }

    fn on_handshake_complete(&self) {
        self.push(TraceEvent::HandshakeComplete);
    }

    fn on_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) {
        self.push(TraceEvent::Response {
            seconds: commit_version.seconds,
            results: results.len(),
        });
    }

    fn on_close(
        &self,
        error: Option<Error>,
    ) {
        self.push(TraceEvent::Close {
            code: error.map(|error| error.code),
        });
    }
}
