//! Minimal model types crossing the remote boundary.
//!
//! The full document model, query engine and local store live above this
//! crate; what appears here is exactly what the streams and the unary
//! dispatcher need to frame requests and hand results upward. Document
//! contents and mutation payloads stay opaque ([`bytes::Bytes`]); decoding
//! them is the serializer's business, not the stream core's.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::errors::Error;

/// Client-assigned identifier of a listen target.
pub type TargetId = i32;

/// A server-assigned version, ordered by commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SnapshotVersion {
    pub seconds: i64,
    pub nanos: i32,
}

impl SnapshotVersion {
    pub const NONE: SnapshotVersion = SnapshotVersion {
        seconds: 0,
        nanos: 0,
    };

    pub fn new(
        seconds: i64,
        nanos: i32,
    ) -> Self {
        Self { seconds, nanos }
    }
}

/// Slash-separated resource path of a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    pub path: String,
}

impl DocumentKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Everything the watch stream needs to subscribe a query server-side.
///
/// The query itself is carried pre-encoded; `labels` become request labels
/// on the add-target message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetData {
    pub target_id: TargetId,
    /// Wire encoding of the query, produced by the embedding SDK.
    pub query: Bytes,
    /// Resume point from a previous listen, empty for a fresh target.
    pub resume_token: Bytes,
    pub labels: BTreeMap<String, String>,
}

impl TargetData {
    pub fn new(
        target_id: TargetId,
        query: Bytes,
    ) -> Self {
        Self {
            target_id,
            query,
            resume_token: Bytes::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// Kinds of target-state transitions the server reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeKind {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// One change delivered on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    /// A document entered, changed within, or left the given targets.
    Document {
        updated_target_ids: Vec<TargetId>,
        removed_target_ids: Vec<TargetId>,
        key: DocumentKey,
        /// Encoded document, `None` for a delete.
        document: Option<Bytes>,
    },
    /// Target membership or liveness changed.
    TargetChange {
        kind: TargetChangeKind,
        target_ids: Vec<TargetId>,
        resume_token: Bytes,
        /// Present when the server removed targets with an error.
        cause: Option<Error>,
    },
    /// Server-side count for a target, used to detect missed deletes.
    ExistenceFilter {
        target_id: TargetId,
        count: i32,
    },
}

/// A single write, pre-encoded by the embedding SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub encoded: Bytes,
}

impl Mutation {
    pub fn new(encoded: Bytes) -> Self {
        Self { encoded }
    }
}

/// Server-reported outcome of one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    /// Version the write committed at; `None` when the write was a no-op.
    pub version: Option<SnapshotVersion>,
    /// Encoded results of field transforms, in request order.
    pub transform_results: Vec<Bytes>,
}

/// Result of looking a key up through the batch-get rpc.
#[derive(Debug, Clone)]
pub enum MaybeDocument {
    Found {
        key: DocumentKey,
        version: SnapshotVersion,
        /// Encoded document contents.
        document: Bytes,
    },
    Missing {
        key: DocumentKey,
        read_time: SnapshotVersion,
    },
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Found { key, .. } => key,
            MaybeDocument::Missing { key, .. } => key,
        }
    }
}
