//! Wire-format boundary.
//!
//! The streaming core frames [`bytes::Bytes`] payloads in and out of the
//! transport; turning model types into protobuf bytes and back is delegated
//! to an implementation supplied by the embedding SDK. Encoding model types
//! it produced itself cannot fail; decode failures are reported as
//! [`Code::Internal`](tonic::Code::Internal) by the stream machinery and
//! tear the rpc down.

use bytes::Bytes;

use crate::errors::Result;
use crate::model::DocumentKey;
use crate::model::MaybeDocument;
use crate::model::Mutation;
use crate::model::MutationResult;
use crate::model::SnapshotVersion;
use crate::model::TargetData;
use crate::model::TargetId;
use crate::model::WatchChange;

/// One decoded listen-response frame.
#[derive(Debug, Clone)]
pub struct ListenSnapshot {
    pub change: WatchChange,
    pub snapshot_version: SnapshotVersion,
}

/// One decoded write-response frame.
///
/// The first response on a write stream is the handshake acknowledgement:
/// it carries a stream token but no commit version and no results.
#[derive(Debug, Clone)]
pub struct WriteStreamResponse {
    pub stream_token: Bytes,
    pub commit_version: Option<SnapshotVersion>,
    pub results: Vec<MutationResult>,
}

/// Encoder/decoder between model types and wire frames.
///
/// `database` arguments receive the resource prefix
/// (`projects/<p>/databases/<d>`) so implementations never reach back into
/// client state.
pub trait Serializer: Send + Sync + 'static {
    // ---- watch stream ----

    /// Add-target request carrying the encoded target and its request
    /// labels.
    fn encode_watch_request(
        &self,
        database: &str,
        target: &TargetData,
    ) -> Bytes;

    fn encode_unwatch_request(
        &self,
        database: &str,
        target_id: TargetId,
    ) -> Bytes;

    fn decode_listen_response(
        &self,
        frame: &[u8],
    ) -> Result<ListenSnapshot>;

    // ---- write stream ----

    /// Handshake request: database identity only. Stream resumption via a
    /// previously persisted token is deliberately not used.
    fn encode_write_handshake(
        &self,
        database: &str,
    ) -> Bytes;

    fn encode_write_request(
        &self,
        stream_token: &Bytes,
        mutations: &[Mutation],
    ) -> Bytes;

    fn decode_write_response(
        &self,
        frame: &[u8],
    ) -> Result<WriteStreamResponse>;

    // ---- unary rpcs ----

    fn encode_commit_request(
        &self,
        database: &str,
        mutations: &[Mutation],
    ) -> Bytes;

    fn decode_commit_response(
        &self,
        frame: &[u8],
    ) -> Result<Vec<MutationResult>>;

    fn encode_lookup_request(
        &self,
        database: &str,
        keys: &[DocumentKey],
    ) -> Bytes;

    /// Batch-get responses arrive one document per frame.
    fn decode_lookup_response(
        &self,
        frame: &[u8],
    ) -> Result<MaybeDocument>;
}
