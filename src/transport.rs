//! Contract with the HTTP/2 streaming rpc library.
//!
//! The transport itself lives outside this crate; what is fixed here is the
//! shape the stream core programs against: a factory producing rpc handles
//! from a path and a request writer, handles with settable headers and
//! bearer token, and a callback target receiving inbound frames and the
//! terminal close event. Transport callbacks arrive on unspecified threads.

use std::sync::Arc;

use bytes::Bytes;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::warn;

use crate::database_info::DatabaseInfo;
use crate::request_writer::RequestWriter;

pub const WATCH_RPC_PATH: &str = "/google.firestore.v1beta1.Firestore/Listen";
pub const WRITE_RPC_PATH: &str = "/google.firestore.v1beta1.Firestore/Write";
pub const COMMIT_RPC_PATH: &str = "/google.firestore.v1beta1.Firestore/Commit";
pub const BATCH_GET_RPC_PATH: &str = "/google.firestore.v1beta1.Firestore/BatchGetDocuments";

pub const API_CLIENT_HEADER: &str = "x-goog-api-client";
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

/// Response headers worth logging on the first inbound frame; everything
/// else the server sends is noise.
pub(crate) const RESPONSE_HEADER_WHITELIST: &[&str] = &[
    "date",
    "x-google-backends",
    "x-google-netmon-label",
    "x-google-service",
    "x-google-gfe-request-trace",
];

/// Receiver for transport events on a single rpc.
///
/// Implementations must tolerate being invoked from foreign threads; the
/// stream core bounces everything back onto its worker queue.
pub trait StreamCallback: Send + Sync + 'static {
    /// One inbound frame.
    fn on_message(
        &self,
        frame: Bytes,
    );

    /// The rpc finished. `None` is a clean close; `Some` carries the
    /// transport's status. Nothing is delivered after this.
    fn on_close(
        &self,
        status: Option<Status>,
    );
}

/// A single rpc produced by the transport.
///
/// Headers and token must be installed before the call is started; the
/// request writer handed to the factory is drained by the transport as
/// flow control allows.
pub trait StreamingCall: Send + 'static {
    fn set_request_headers(
        &mut self,
        headers: MetadataMap,
    );

    /// Installs the OAuth bearer token; `None` omits the `Authorization`
    /// header entirely.
    fn set_access_token(
        &mut self,
        token: Option<String>,
    );

    fn start(
        &mut self,
        callback: Arc<dyn StreamCallback>,
    );

    /// Tears the rpc down with `status`. The transport reports the outcome
    /// through [`StreamCallback::on_close`].
    fn finish_with_error(
        &mut self,
        status: Status,
    );

    /// Headers the server attached to the response, available once the
    /// first frame has arrived.
    fn response_headers(&self) -> MetadataMap;
}

/// Factory for rpc handles against a fixed host.
pub trait Transport: Send + Sync + 'static {
    fn create_stream(
        &self,
        path: &str,
        requests: RequestWriter,
    ) -> Box<dyn StreamingCall>;
}

/// `x-goog-api-client` value; the empty token positions are filled in by
/// the client platform.
pub(crate) fn api_client_value() -> String {
    format!("gl-objc/ fire/{} grpc/", env!("CARGO_PKG_VERSION"))
}

/// Headers installed on every rpc, streaming and unary alike.
pub(crate) fn request_headers(database: &DatabaseInfo) -> MetadataMap {
    let mut headers = MetadataMap::new();
    insert_ascii(&mut headers, API_CLIENT_HEADER, &api_client_value());
    insert_ascii(
        &mut headers,
        RESOURCE_PREFIX_HEADER,
        &database.resource_prefix(),
    );
    headers
}

fn insert_ascii(
    headers: &mut MetadataMap,
    name: &'static str,
    value: &str,
) {
    match value.parse() {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = name, "dropping header with non-ascii value"),
    }
}
