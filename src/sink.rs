//! The write side of a sync task: a collection-scoped bulk write operation
//! and the trait a MongoDB-backed sink implements for it.

use bson::{Bson, Document};

/// One pending write against a collection, batched up by the flush buffer
/// and applied together by the bulk writer.
#[derive(Debug, Clone)]
pub enum BulkOp {
    /// Upsert keyed on `_id`. Used for base documents when PK-as-id is on.
    ReplaceUpsert { id: Bson, doc: Document },
    /// Unconditional insert. Used for base documents without PK-as-id and
    /// for append-only version documents.
    Insert { doc: Document },
    /// Field update, keyed on an arbitrary filter (not necessarily `_id`),
    /// with upsert behavior controlled per-op. Used for soft-delete marks.
    Update {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    /// Updates every document matching the filter, not just the first.
    /// Used for the delete-mark-base-false fan-out across version docs.
    UpdateMany { filter: Document, update: Document },
}

/// One write error reported by an unordered bulk write, carrying enough of
/// the driver's write-error shape for the bulk writer to classify it.
#[derive(Debug, Clone)]
pub struct WriteErrorDetail {
    pub index: usize,
    pub code: i32,
    pub message: String,
}

/// The raw result of one bulk write attempt, before the bulk writer's
/// retry/dup-tolerance policy is applied.
#[derive(Debug)]
pub enum BulkWriteAttempt {
    /// Every op applied cleanly.
    Ok,
    /// The driver reported per-op write errors (a `BulkWriteError` in
    /// driver terms). Code 11000 is duplicate key; 215 marks an error the
    /// source policy wants to reclassify as transient.
    PartialFailure(Vec<WriteErrorDetail>),
    /// A connection-level error (auto-reconnect in progress, primary
    /// stepdown, socket timeout) unrelated to any individual op.
    TransientError(String),
}

/// Abstraction over "a MongoDB collection I can bulk-write into", so the
/// bulk writer and worker can be tested against an in-memory fake. A single
/// call is exactly one unordered `bulk_write`; retry policy lives in
/// `bulk_writer`, not here.
pub trait Sink: Send + Sync {
    fn bulk_write(&self, collection: &str, ops: &[BulkOp]) -> crate::error::Result<BulkWriteAttempt>;
}

/// MongoDB-backed sink using the driver's synchronous API.
///
/// The driver's collection API is typed per-operation rather than exposing
/// a single mixed-operation `bulkWrite` the way pymongo does, so each op is
/// applied individually here and any per-op failures are collected into the
/// same `PartialFailure` shape pymongo's `BulkWriteError.details` would
/// produce — duplicate-key tolerance and retry policy stay identical either
/// way, only the transport differs.
pub struct MongoSink {
    database: mongodb::sync::Database,
    write_concern: mongodb::options::WriteConcern,
}

impl MongoSink {
    /// `w` follows the driver's acknowledgment levels (0 = unacknowledged,
    /// 1+ = number of nodes); `j` requests the write be committed to the
    /// on-disk journal before acknowledging.
    pub fn new(database: mongodb::sync::Database, w: i32, j: bool) -> Self {
        let write_concern = mongodb::options::WriteConcern::builder()
            .w(mongodb::options::Acknowledgment::from(w.max(0) as u32))
            .journal(j)
            .build();
        Self { database, write_concern }
    }

    fn collection(&self, name: &str) -> mongodb::sync::Collection<Document> {
        self.database.collection_with_options(
            name,
            mongodb::options::CollectionOptions::builder()
                .write_concern(self.write_concern.clone())
                .build(),
        )
    }

    fn classify_error(index: usize, err: &mongodb::error::Error) -> WriteErrorDetail {
        let code = err
            .kind
            .as_ref()
            .to_string()
            .contains("E11000")
            .then_some(11000)
            .unwrap_or(1);
        WriteErrorDetail {
            index,
            code,
            message: err.to_string(),
        }
    }
}

impl Sink for MongoSink {
    fn bulk_write(&self, collection: &str, ops: &[BulkOp]) -> crate::error::Result<BulkWriteAttempt> {
        let coll = self.collection(collection);
        let mut errors = Vec::new();

        for (index, op) in ops.iter().enumerate() {
            let result = match op {
                BulkOp::ReplaceUpsert { id, doc } => {
                    let filter = bson::doc! { "_id": id.clone() };
                    coll.replace_one(
                        filter,
                        doc.clone(),
                        mongodb::options::ReplaceOptions::builder().upsert(true).build(),
                    )
                    .map(|_| ())
                }
                BulkOp::Insert { doc } => coll.insert_one(doc.clone(), None).map(|_| ()),
                BulkOp::Update { filter, update, upsert } => coll
                    .update_one(
                        filter.clone(),
                        update.clone(),
                        mongodb::options::UpdateOptions::builder().upsert(*upsert).build(),
                    )
                    .map(|_| ()),
                BulkOp::UpdateMany { filter, update } => {
                    coll.update_many(filter.clone(), update.clone(), None).map(|_| ())
                }
            };

            if let Err(e) = result {
                if matches!(
                    *e.kind,
                    mongodb::error::ErrorKind::Io(_) | mongodb::error::ErrorKind::ServerSelection { .. }
                ) {
                    return Ok(BulkWriteAttempt::TransientError(e.to_string()));
                }
                errors.push(Self::classify_error(index, &e));
            }
        }

        if errors.is_empty() {
            Ok(BulkWriteAttempt::Ok)
        } else {
            Ok(BulkWriteAttempt::PartialFailure(errors))
        }
    }
}
