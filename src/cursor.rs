//! Lazily-fetched, batch-buffered iteration over multi-document results.
//!
//! A cursor is single-pass: buffered documents are handed out in order, and
//! when the buffer drains with a non-zero server-side cursor id, `getMore`
//! requests are issued transparently against the host that created the
//! cursor. A transport failure surfaces once and exhausts the cursor; what
//! was buffered before the failure stays consumable.

use std::collections::VecDeque;

use crate::bson::{Bson, Document};
use crate::config::HostAddr;
use crate::doc;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::pool::Pool;

pub struct Cursor {
    pool: Pool,
    ns: Namespace,
    /// The host that created the cursor; follow-ups are pinned to it.
    host: HostAddr,
    cursor_id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<i32>,
    /// Fetch strategy: how many batches each refill requests ahead of
    /// consumption. Throughput/memory trade-off, not a correctness knob.
    prefetch_batches: u32,
}

impl Cursor {
    /// Build a cursor from a command reply carrying a `cursor` sub-document
    /// (`find`, `aggregate`, `listCollections`).
    pub(crate) fn from_reply(
        pool: Pool,
        host: HostAddr,
        default_ns: Namespace,
        reply: &Document,
        batch_size: Option<i32>,
    ) -> Result<Cursor> {
        let prefetch_batches = pool.options().prefetch_batches;
        let cursor_doc = reply
            .get_document("cursor")
            .map_err(|_| Error::Protocol("reply carried no cursor document".to_string()))?;
        let cursor_id = cursor_doc
            .get_i64("id")
            .map_err(|_| Error::Protocol("cursor document missing id".to_string()))?;
        let ns = cursor_doc
            .get_str("ns")
            .ok()
            .and_then(|ns| Namespace::parse(ns).ok())
            .unwrap_or(default_ns);
        let batch = first_or_next_batch(cursor_doc)?;

        Ok(Cursor {
            pool,
            ns,
            host,
            cursor_id,
            buffer: batch,
            batch_size,
            prefetch_batches,
        })
    }

    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// True once every document has been handed out and the server reports
    /// no more (cursor id 0).
    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && self.cursor_id == 0
    }

    /// The next document, fetching from the server when the local buffer is
    /// exhausted and the server-side cursor is still open. `Ok(None)` is end
    /// of sequence.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        if self.buffer.is_empty() && self.cursor_id != 0 {
            self.fetch_more().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the remaining documents.
    pub async fn collect(mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn fetch_more(&mut self) -> Result<()> {
        for _ in 0..self.prefetch_batches.max(1) {
            if self.cursor_id == 0 {
                break;
            }
            let mut cmd = doc! {"getMore": self.cursor_id, "collection": &self.ns.coll};
            if let Some(batch_size) = self.batch_size {
                cmd.insert("batchSize", batch_size);
            }
            let outcome = self
                .pool
                .run_command_on(&self.host, &self.ns.db, cmd)
                .await
                .and_then(|reply| self.apply_batch(&reply));
            if let Err(e) = outcome {
                // No silent retry: the cursor is exhausted, the caller sees
                // the error once, and anything already buffered stays.
                self.cursor_id = 0;
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply_batch(&mut self, reply: &Document) -> Result<()> {
        let cursor_doc = reply
            .get_document("cursor")
            .map_err(|_| Error::Protocol("getMore reply carried no cursor document".to_string()))?;
        self.cursor_id = cursor_doc
            .get_i64("id")
            .map_err(|_| Error::Protocol("getMore reply missing cursor id".to_string()))?;
        self.buffer.extend(first_or_next_batch(cursor_doc)?);
        Ok(())
    }
}

fn first_or_next_batch(cursor_doc: &Document) -> Result<VecDeque<Document>> {
    let batch = cursor_doc
        .get_array("firstBatch")
        .or_else(|_| cursor_doc.get_array("nextBatch"))
        .map_err(|_| Error::Protocol("cursor document carried no batch".to_string()))?;
    batch
        .iter()
        .map(|value| match value {
            Bson::Document(doc) => Ok(doc.clone()),
            other => Err(Error::Protocol(format!(
                "cursor batch entry is not a document: {:?}",
                other
            ))),
        })
        .collect()
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        // Best effort: free the server-side cursor without blocking drop.
        let pool = self.pool.clone();
        let ns = self.ns.clone();
        let host = self.host.clone();
        let cursor_id = self.cursor_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let cmd = doc! {"killCursors": &ns.coll, "cursors": [cursor_id]};
                if let Err(e) = pool.run_command_on(&host, &ns.db, cmd).await {
                    tracing::debug!(cursor = cursor_id, error = %e, "failed to kill cursor");
                }
            });
        }
    }
}
