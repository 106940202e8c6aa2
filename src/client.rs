//! Consumer-facing surface: `Client` → `Database` → `Collection`.
//!
//! Database and collection handles are stateless views over the shared pool,
//! rebuilt cheaply on each accessor call. Every operation funnels through the
//! pool/topology manager; multi-document results come back as a `Cursor`.

use crate::bson::{Bson, Document, ObjectId};
use crate::config::{ClientOptions, HostAddr};
use crate::cursor::Cursor;
use crate::doc;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::pool::Pool;
use crate::topology::{Host, ServerInfo};

#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    /// Connect to a single host, given either `"host:port"` or a
    /// `mongodb://` connection string.
    pub async fn connect(address: &str) -> Result<Client> {
        let options = if address.starts_with("mongodb://") {
            ClientOptions::parse(address)?
        } else {
            ClientOptions::single(HostAddr::parse(address)?)
        };
        Client::with_options(options).await
    }

    /// Connect to N hosts forming the named replica set.
    pub async fn connect_replica_set(addresses: &[&str], name: &str) -> Result<Client> {
        let hosts = addresses
            .iter()
            .map(|a| HostAddr::parse(a))
            .collect::<Result<Vec<HostAddr>>>()?;
        Client::with_options(ClientOptions::replica_set(hosts, name)).await
    }

    pub async fn with_options(options: ClientOptions) -> Result<Client> {
        Ok(Client {
            pool: Pool::connect(options).await?,
        })
    }

    pub fn database(&self, name: &str) -> Database {
        Database {
            pool: self.pool.clone(),
            name: name.to_string(),
        }
    }

    /// Capabilities reported by the first host that answered the handshake.
    pub fn server_info(&self) -> ServerInfo {
        self.pool.server_info()
    }

    /// Current host table snapshot.
    pub async fn hosts(&self) -> Vec<Host> {
        self.pool.hosts().await
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close every connection and stop background maintenance.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool,
    name: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            pool: self.pool.clone(),
            ns: Namespace::new(&self.name, name),
        }
    }

    /// Run an arbitrary command against this database. The command name must
    /// be the document's first key; field order is preserved on the wire.
    pub async fn run_command(&self, cmd: Document) -> Result<Document> {
        self.pool.run_command(&self.name, cmd, true).await
    }

    pub async fn list_collections(&self) -> Result<Cursor> {
        let cmd = doc! {"listCollections": 1i32};
        let (reply, host) = self
            .pool
            .run_command_with_source(&self.name, cmd, false)
            .await?;
        Cursor::from_reply(
            self.pool.clone(),
            host,
            Namespace::new(&self.name, "$cmd.listCollections"),
            &reply,
            None,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub batch_size: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone)]
pub struct InsertManyResult {
    pub inserted_count: i64,
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub matched_count: i64,
    pub modified_count: i64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub deleted_count: i64,
}

#[derive(Clone)]
pub struct Collection {
    pool: Pool,
    ns: Namespace,
}

impl Collection {
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub async fn find(&self, filter: Document, options: FindOptions) -> Result<Cursor> {
        let mut cmd = doc! {"find": &self.ns.coll, "filter": filter};
        if let Some(sort) = options.sort {
            cmd.insert("sort", sort);
        }
        if let Some(projection) = options.projection {
            cmd.insert("projection", projection);
        }
        if let Some(skip) = options.skip {
            cmd.insert("skip", skip);
        }
        if let Some(limit) = options.limit {
            cmd.insert("limit", limit);
        }
        if let Some(batch_size) = options.batch_size {
            cmd.insert("batchSize", batch_size);
        }
        let (reply, host) = self
            .pool
            .run_command_with_source(&self.ns.db, cmd, false)
            .await?;
        Cursor::from_reply(
            self.pool.clone(),
            host,
            self.ns.clone(),
            &reply,
            options.batch_size,
        )
    }

    pub async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        batch_size: Option<i32>,
    ) -> Result<Cursor> {
        let mut cursor_options = doc! {};
        if let Some(batch_size) = batch_size {
            cursor_options.insert("batchSize", batch_size);
        }
        let cmd = doc! {
            "aggregate": &self.ns.coll,
            "pipeline": pipeline,
            "cursor": cursor_options,
        };
        let (reply, host) = self
            .pool
            .run_command_with_source(&self.ns.db, cmd, false)
            .await?;
        Cursor::from_reply(self.pool.clone(), host, self.ns.clone(), &reply, batch_size)
    }

    pub async fn insert_one(&self, doc: Document) -> Result<InsertOneResult> {
        let result = self.insert_many(vec![doc]).await?;
        let inserted_id = result.inserted_ids.into_iter().next().unwrap_or(Bson::Null);
        Ok(InsertOneResult { inserted_id })
    }

    pub async fn insert_many(&self, docs: Vec<Document>) -> Result<InsertManyResult> {
        let mut inserted_ids = Vec::with_capacity(docs.len());
        let documents: Vec<Bson> = docs
            .into_iter()
            .map(|mut doc| {
                if doc.get("_id").is_none() {
                    doc.insert("_id", ObjectId::new());
                }
                inserted_ids.push(doc.get("_id").cloned().unwrap_or(Bson::Null));
                Bson::Document(doc)
            })
            .collect();

        let cmd = doc! {"insert": &self.ns.coll, "documents": documents, "ordered": true};
        let reply = self.pool.run_command(&self.ns.db, cmd, true).await?;
        check_write_errors(&reply)?;
        Ok(InsertManyResult {
            inserted_count: numeric(&reply, "n"),
            inserted_ids,
        })
    }

    pub async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update(filter, update, false, false).await
    }

    pub async fn update_many(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update(filter, update, true, false).await
    }

    pub async fn upsert_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update(filter, update, false, true).await
    }

    async fn update(
        &self,
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let cmd = doc! {
            "update": &self.ns.coll,
            "updates": [{"q": filter, "u": update, "multi": multi, "upsert": upsert}],
        };
        let reply = self.pool.run_command(&self.ns.db, cmd, true).await?;
        check_write_errors(&reply)?;
        let upserted_id = reply
            .get_array("upserted")
            .ok()
            .and_then(|entries| entries.first())
            .and_then(Bson::as_document)
            .and_then(|entry| entry.get("_id"))
            .cloned();
        Ok(UpdateResult {
            matched_count: numeric(&reply, "n"),
            modified_count: numeric(&reply, "nModified"),
            upserted_id,
        })
    }

    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        self.delete(filter, 1).await
    }

    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        self.delete(filter, 0).await
    }

    async fn delete(&self, filter: Document, limit: i32) -> Result<DeleteResult> {
        let cmd = doc! {
            "delete": &self.ns.coll,
            "deletes": [{"q": filter, "limit": limit}],
        };
        let reply = self.pool.run_command(&self.ns.db, cmd, true).await?;
        check_write_errors(&reply)?;
        Ok(DeleteResult {
            deleted_count: numeric(&reply, "n"),
        })
    }

    pub async fn count(&self, filter: Document) -> Result<i64> {
        let cmd = doc! {"count": &self.ns.coll, "query": filter};
        let reply = self.pool.run_command(&self.ns.db, cmd, false).await?;
        Ok(numeric(&reply, "n"))
    }

    pub async fn create_index(&self, keys: Document, options: IndexOptions) -> Result<String> {
        let name = options.name.unwrap_or_else(|| default_index_name(&keys));
        let mut index = doc! {"key": keys, "name": &name};
        if options.unique {
            index.insert("unique", true);
        }
        let cmd = doc! {"createIndexes": &self.ns.coll, "indexes": [index]};
        self.pool.run_command(&self.ns.db, cmd, true).await?;
        Ok(name)
    }
}

fn numeric(doc: &Document, key: &str) -> i64 {
    doc.get(key).and_then(Bson::as_numeric_i64).unwrap_or(0)
}

/// The conventional `field_direction` index name, e.g. `"a_1_b_-1"`.
fn default_index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| {
            let direction = match direction {
                Bson::Int32(v) => v.to_string(),
                Bson::Int64(v) => v.to_string(),
                Bson::Double(v) => (*v as i64).to_string(),
                Bson::String(s) => s.clone(),
                _ => "1".to_string(),
            };
            format!("{}_{}", field, direction)
        })
        .collect::<Vec<String>>()
        .join("_")
}

/// Per-document write failures arrive with `ok: 1`; surface the first as a
/// command failure carrying the full reply.
fn check_write_errors(reply: &Document) -> Result<()> {
    if let Ok(errors) = reply.get_array("writeErrors")
        && let Some(Bson::Document(first)) = errors.first()
    {
        let code = first.get_i32("code").unwrap_or(0);
        let message = first.get_str("errmsg").unwrap_or("write error").to_string();
        return Err(Error::CommandFailure {
            code,
            message,
            response: reply.clone(),
        });
    }
    Ok(())
}
