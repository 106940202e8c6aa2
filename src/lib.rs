//! An asynchronous MongoDB client driver: binary document model, wire
//! protocol codec, authenticated connection pooling with replica-set
//! topology management, and batch-buffered cursors.
//!
//! ```no_run
//! use rmongo::{Client, doc};
//!
//! # async fn run() -> rmongo::Result<()> {
//! let client = Client::connect("127.0.0.1:27017").await?;
//! let users = client.database("app").collection("users");
//! users.insert_one(doc! {"name": "ada", "logins": 1i32}).await?;
//! let mut cursor = users.find(doc! {}, Default::default()).await?;
//! while let Some(user) = cursor.try_next().await? {
//!     println!("{:?}", user);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bson;
pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod namespace;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod tls;
pub mod topology;

pub use client::{Client, Collection, Database, FindOptions, IndexOptions};
pub use config::{ClientOptions, Credential, HostAddr, TlsOptions};
pub use cursor::Cursor;
pub use error::{Error, Result};
