//! Generic lifecycle shared by the watch and write streams.
//!
//! A stream owns one rpc at a time and translates between the caller-facing
//! state machine and the transport's callback surface. All state lives
//! behind one mutex and is only touched from the worker queue; transport
//! and credentials callbacks re-dispatch themselves before going anywhere
//! near it. Queued closures capture [`Weak`] references and quietly become
//! no-ops once the owning handle is gone.
//!
//! The one deliberate exception to queue-exclusivity is the callback
//! filter's `passthrough` flag: it is flipped off (cross-thread, atomic)
//! the moment the stream lets go of an rpc, so a transport that delivers a
//! final event from a foreign thread after `stop()` talks into the void.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tonic::metadata::MetadataMap;
use tonic::Code;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::backoff::ExponentialBackoff;
use crate::config::StreamConfig;
use crate::credentials::CredentialsProvider;
use crate::credentials::GetTokenResult;
use crate::database_info::DatabaseInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::request_writer::RequestWriter;
use crate::transport::request_headers;
use crate::transport::StreamCallback;
use crate::transport::StreamingCall;
use crate::transport::Transport;
use crate::transport::RESPONSE_HEADER_WHITELIST;
use crate::worker_queue::DelayedTask;
use crate::worker_queue::WorkerQueue;

/// Lifecycle states of a stream.
///
/// `Initial` at construction and after a clean idle close; `Stopped` is
/// terminal until the owner builds a fresh stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Auth,
    Open,
    Error,
    Backoff,
    Stopped,
}

impl StreamState {
    fn is_started(self) -> bool {
        matches!(
            self,
            StreamState::Backoff | StreamState::Auth | StreamState::Open
        )
    }
}

/// Behavior a concrete stream plugs into the shared lifecycle: the rpc path
/// to dial, per-frame decoding, and how delegate notifications are routed.
pub(crate) trait StreamProtocol: Send + 'static {
    /// Caller-facing observer; cloned out of the state mutex before any
    /// notification so delegates can call back into the stream.
    type Delegate: Clone + Send + Sync + 'static;

    /// Decoded inbound frame, handed to the delegate.
    type Event: Send + 'static;

    fn rpc_path(&self) -> &'static str;

    /// Short name used in log lines and assertion messages.
    fn label(&self) -> &'static str;

    /// Invoked each time the underlying rpc (re)opens, before `on_open`.
    fn on_stream_start(&mut self) {}

    fn handle_message(
        &mut self,
        frame: Bytes,
    ) -> Result<Self::Event>;

    fn notify_open(delegate: &Self::Delegate);

    fn notify_event(
        delegate: &Self::Delegate,
        event: Self::Event,
    );

    fn notify_close(
        delegate: &Self::Delegate,
        error: Option<Error>,
    );
}

struct Guts<P: StreamProtocol> {
    state: StreamState,
    protocol: P,
    delegate: Option<P::Delegate>,
    call: Option<Box<dyn StreamingCall>>,
    requests: Option<RequestWriter>,
    filter: Option<Arc<CallbackFilter>>,
    backoff: ExponentialBackoff,
    idle: bool,
    idle_task: Option<DelayedTask>,
    headers_logged: bool,
}

/// Shared implementation behind [`WatchStream`](crate::WatchStream) and
/// [`WriteStream`](crate::WriteStream).
pub(crate) struct StreamCore<P: StreamProtocol> {
    queue: WorkerQueue,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialsProvider>,
    database: DatabaseInfo,
    idle_timeout: Duration,
    guts: Mutex<Guts<P>>,
}

impl<P: StreamProtocol> StreamCore<P> {
    pub(crate) fn new(
        queue: WorkerQueue,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialsProvider>,
        database: DatabaseInfo,
        config: &StreamConfig,
        protocol: P,
    ) -> Arc<Self> {
        let backoff = ExponentialBackoff::new(queue.clone(), config.backoff);
        Arc::new(Self {
            queue,
            transport,
            credentials,
            database,
            idle_timeout: config.idle_timeout(),
            guts: Mutex::new(Guts {
                state: StreamState::Initial,
                protocol,
                delegate: None,
                call: None,
                requests: None,
                filter: None,
                backoff,
                idle: false,
                idle_task: None,
                headers_logged: false,
            }),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.queue.verify_is_current_queue();
        self.guts.lock().state.is_started()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.queue.verify_is_current_queue();
        self.guts.lock().state == StreamState::Open
    }

    /// Starts the stream and binds `delegate`.
    ///
    /// From `Initial` this authenticates and dials immediately; from
    /// `Error` the dial is deferred through the backoff controller. Calls
    /// on a stopped stream are ignored.
    pub(crate) fn start(
        self: &Arc<Self>,
        delegate: P::Delegate,
    ) {
        self.queue.verify_is_current_queue();
        let mut guts = self.guts.lock();
        match guts.state {
            StreamState::Error => {
                debug!(
                    stream = guts.protocol.label(),
                    "restarting after error, applying backoff"
                );
                guts.state = StreamState::Backoff;
                guts.delegate = Some(delegate);
                let weak = Arc::downgrade(self);
                guts.backoff.run_after_delay(move || {
                    if let Some(stream) = weak.upgrade() {
                        stream.resume_after_backoff();
                    }
                });
            }
            StreamState::Stopped => {
                debug!(
                    stream = guts.protocol.label(),
                    "ignoring start on a stopped stream"
                );
            }
            StreamState::Initial => {
                debug!(stream = guts.protocol.label(), "starting stream");
                guts.state = StreamState::Auth;
                guts.delegate = Some(delegate);
                drop(guts);
                self.request_credentials();
            }
            other => panic!("start called while stream is {other:?}"),
        }
    }

    /// Stops the stream. After this returns (to the worker queue), the
    /// delegate observes nothing further, whatever the transport still has
    /// in flight.
    pub(crate) fn stop(self: &Arc<Self>) {
        self.queue.verify_is_current_queue();
        let guts = self.guts.lock();
        debug!(stream = guts.protocol.label(), state = ?guts.state, "stopping stream");
        if guts.state.is_started() {
            self.close(guts, StreamState::Stopped, None);
        }
    }

    /// Arms the idle timer. When it fires with no intervening sends the
    /// stream closes cleanly back to `Initial`. Idleness is normal and
    /// incurs no backoff.
    pub(crate) fn mark_idle(self: &Arc<Self>) {
        self.queue.verify_is_current_queue();
        let mut guts = self.guts.lock();
        if guts.state != StreamState::Open {
            return;
        }
        guts.idle = true;
        let weak = Arc::downgrade(self);
        let task = self.queue.dispatch_after(self.idle_timeout, move || {
            if let Some(stream) = weak.upgrade() {
                stream.handle_idle_timeout();
            }
        });
        if let Some(previous) = guts.idle_task.replace(task) {
            previous.cancel();
        }
    }

    /// Encodes a request via `build` and hands it to the transport.
    /// Requires the stream to be open; any pending idle close is called
    /// off.
    pub(crate) fn send_request(
        &self,
        build: impl FnOnce(&mut P) -> Bytes,
    ) {
        self.queue.verify_is_current_queue();
        let mut guts = self.guts.lock();
        assert!(
            guts.state == StreamState::Open,
            "{} stream is not open",
            guts.protocol.label()
        );
        self.cancel_idle_check(&mut guts);
        let frame = build(&mut guts.protocol);
        if let Some(requests) = &guts.requests {
            requests.write_value(frame);
        }
    }

    /// Read-only access to protocol state (handshake flag, stream token).
    pub(crate) fn with_protocol<R>(
        &self,
        f: impl FnOnce(&P) -> R,
    ) -> R {
        self.queue.verify_is_current_queue();
        f(&self.guts.lock().protocol)
    }

    #[cfg(test)]
    pub(crate) fn current_backoff_delay(&self) -> Duration {
        self.guts.lock().backoff.current_delay()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.guts.lock().state
    }

    // ---- start path ----

    fn request_credentials(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let queue = self.queue.clone();
        let credentials = Arc::clone(&self.credentials);
        // Token acquisition completes on an arbitrary thread; bounce the
        // result back before touching state.
        tokio::spawn(async move {
            let token = credentials.get_token().await;
            queue.dispatch_async_allowing_same_queue(move || {
                if let Some(stream) = weak.upgrade() {
                    stream.resume_start_with_token(token);
                }
            });
        });
    }

    fn resume_after_backoff(self: Arc<Self>) {
        let mut guts = self.guts.lock();
        match guts.state {
            StreamState::Backoff => {
                trace!(
                    stream = guts.protocol.label(),
                    "backoff elapsed, retrying"
                );
                guts.state = StreamState::Auth;
                drop(guts);
                self.request_credentials();
            }
            // stop() cancels the pending backoff task, but a task that was
            // already sitting in the queue backlog still gets here.
            StreamState::Stopped => {}
            other => panic!("backoff elapsed while stream is {other:?}"),
        }
    }

    fn resume_start_with_token(
        self: &Arc<Self>,
        token: Result<GetTokenResult>,
    ) {
        let mut guts = self.guts.lock();
        if guts.state == StreamState::Stopped {
            // Stopped while the token fetch was in flight.
            return;
        }
        debug_assert!(
            guts.state == StreamState::Auth,
            "token arrived while stream is {:?}",
            guts.state
        );

        let token = match token {
            Ok(token) => token,
            Err(error) => {
                warn!(
                    stream = guts.protocol.label(),
                    %error,
                    "failed to fetch auth token"
                );
                self.close(guts, StreamState::Error, Some(error));
                return;
            }
        };

        let requests = RequestWriter::new();
        let mut call = self
            .transport
            .create_stream(guts.protocol.rpc_path(), requests.clone());
        call.set_request_headers(request_headers(&self.database));
        call.set_access_token(if token.is_empty() {
            None
        } else {
            Some(token.token().to_string())
        });

        let filter = Arc::new(CallbackFilter::new(Box::new(QueueTarget {
            stream: Arc::downgrade(self),
            queue: self.queue.clone(),
        })));
        call.start(Arc::clone(&filter) as Arc<dyn StreamCallback>);

        guts.call = Some(call);
        guts.requests = Some(requests);
        guts.filter = Some(filter);
        guts.state = StreamState::Open;
        guts.protocol.on_stream_start();
        debug!(stream = guts.protocol.label(), "stream open");

        let delegate = guts.delegate.clone();
        drop(guts);
        if let Some(delegate) = delegate {
            P::notify_open(&delegate);
        }
    }

    // ---- inbound path ----

    fn handle_message(
        self: &Arc<Self>,
        frame: Bytes,
    ) {
        let mut guts = self.guts.lock();
        if guts.state == StreamState::Stopped {
            trace!(
                stream = guts.protocol.label(),
                "dropping frame received after stop"
            );
            return;
        }

        if !guts.headers_logged {
            guts.headers_logged = true;
            if let Some(call) = &guts.call {
                log_response_headers(guts.protocol.label(), &call.response_headers());
            }
        }

        // Any inbound traffic proves the connection healthy again.
        guts.backoff.reset();

        match guts.protocol.handle_message(frame) {
            Ok(event) => {
                let delegate = guts.delegate.clone();
                drop(guts);
                if let Some(delegate) = delegate {
                    P::notify_event(&delegate, event);
                }
            }
            Err(parse_error) => {
                error!(
                    stream = guts.protocol.label(),
                    error = %parse_error,
                    "malformed inbound frame, tearing down rpc"
                );
                if let Some(call) = guts.call.as_mut() {
                    call.finish_with_error(Status::new(
                        Code::Internal,
                        parse_error.message.clone(),
                    ));
                }
            }
        }
    }

    fn handle_stream_close(
        self: &Arc<Self>,
        status: Option<Status>,
    ) {
        let guts = self.guts.lock();
        if guts.state == StreamState::Stopped {
            trace!(
                stream = guts.protocol.label(),
                "dropping close event received after stop"
            );
            return;
        }
        let error = status
            .filter(|status| status.code() != Code::Ok)
            .map(Error::from);
        debug!(stream = guts.protocol.label(), error = ?error, "rpc closed by transport");
        // The stream never recovers on its own: the delegate decides
        // whether to start again (with backoff) or stop.
        self.close(guts, StreamState::Error, error);
    }

    fn handle_idle_timeout(self: Arc<Self>) {
        let guts = self.guts.lock();
        if guts.state == StreamState::Open && guts.idle {
            debug!(stream = guts.protocol.label(), "closing idle stream");
            self.close(guts, StreamState::Initial, None);
        }
    }

    fn cancel_idle_check(
        &self,
        guts: &mut Guts<P>,
    ) {
        guts.idle = false;
        if let Some(task) = guts.idle_task.take() {
            task.cancel();
        }
    }

    // ---- close protocol ----

    fn close(
        &self,
        mut guts: MutexGuard<'_, Guts<P>>,
        final_state: StreamState,
        error: Option<Error>,
    ) {
        debug_assert!(
            error.is_none() || final_state == StreamState::Error,
            "only error closes may carry an error"
        );

        self.cancel_idle_check(&mut guts);

        if final_state != StreamState::Error {
            guts.backoff.reset();
        } else if error
            .as_ref()
            .is_some_and(|error| error.code == Code::ResourceExhausted)
        {
            // The server asked us to back off hard.
            guts.backoff.reset_to_max();
        }
        if final_state == StreamState::Stopped {
            guts.backoff.cancel();
        }

        guts.state = final_state;

        // Half-close the request side, except on errors where the rpc is
        // already broken and a late half-close only provokes secondary
        // failures.
        if let Some(requests) = guts.requests.take() {
            if final_state != StreamState::Error {
                requests.finish(None);
            }
        }

        // Flip the filter off before letting go of the rpc so in-flight
        // transport callbacks land nowhere.
        if let Some(filter) = guts.filter.take() {
            filter.disable();
        }
        guts.call = None;
        guts.headers_logged = false;

        let delegate = guts.delegate.take();
        drop(guts);
        if final_state != StreamState::Stopped {
            if let Some(delegate) = delegate {
                P::notify_close(&delegate, error);
            }
        }
    }
}

/// Shim between the transport and the stream.
///
/// The transport holds this until the rpc fully terminates, which can be
/// well after the stream has moved on; once `passthrough` drops to false
/// every event is discarded without touching the queue.
pub(crate) struct CallbackFilter {
    passthrough: AtomicBool,
    target: Box<dyn StreamCallback>,
}

impl CallbackFilter {
    fn new(target: Box<dyn StreamCallback>) -> Self {
        Self {
            passthrough: AtomicBool::new(true),
            target,
        }
    }

    fn disable(&self) {
        self.passthrough.store(false, Ordering::Release);
    }
}

impl StreamCallback for CallbackFilter {
    fn on_message(
        &self,
        frame: Bytes,
    ) {
        if self.passthrough.load(Ordering::Acquire) {
            self.target.on_message(frame);
        } else {
            trace!("filter dropping frame for released stream");
        }
    }

    fn on_close(
        &self,
        status: Option<Status>,
    ) {
        if self.passthrough.load(Ordering::Acquire) {
            self.target.on_close(status);
        } else {
            trace!("filter dropping close event for released stream");
        }
    }
}

/// Filter target that bounces transport events onto the worker queue and
/// re-resolves the stream there.
struct QueueTarget<P: StreamProtocol> {
    stream: Weak<StreamCore<P>>,
    queue: WorkerQueue,
}

impl<P: StreamProtocol> StreamCallback for QueueTarget<P> {
    fn on_message(
        &self,
        frame: Bytes,
    ) {
        let weak = self.stream.clone();
        // `allowing_same_queue`: a transport driven synchronously (tests,
        // in-process fakes) delivers from the queue itself.
        self.queue.dispatch_async_allowing_same_queue(move || {
            if let Some(stream) = weak.upgrade() {
                stream.handle_message(frame);
            }
        });
    }

    fn on_close(
        &self,
        status: Option<Status>,
    ) {
        let weak = self.stream.clone();
        self.queue.dispatch_async_allowing_same_queue(move || {
            if let Some(stream) = weak.upgrade() {
                stream.handle_stream_close(status);
            }
        });
    }
}

fn log_response_headers(
    label: &str,
    headers: &MetadataMap,
) {
    for name in RESPONSE_HEADER_WHITELIST {
        if let Some(value) = headers.get(*name) {
            debug!(stream = label, header = *name, value = ?value, "response header");
        }
    }
}
