//! Server side of the MySQL client/server wire protocol.
//!
//! This crate accepts client sockets, performs the HandshakeV10
//! exchange (with optional mid-connection TLS upgrade and pluggable
//! authentication), decodes command packets, and streams query
//! results back in the exact framing a MySQL server produces. Query
//! execution itself is delegated to a [`Handler`]; credentials live
//! behind an [`AuthServer`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use mysql_wire::{Listener, ListenerOpts, StaticAuthServer};
//! # use mysql_wire::{Handler, Result, BindVars, ResultWriter, PrepareWriter};
//! # use async_trait::async_trait;
//! # struct MyHandler;
//! # #[async_trait]
//! # impl Handler for MyHandler {
//! #     async fn com_query(&self, _: &str, _: &BindVars, _: &mut ResultWriter<'_>) -> Result<()> { Ok(()) }
//! #     async fn com_prepare(&self, _: &str, _: &BindVars, _: &mut PrepareWriter<'_>) -> Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> Result<()> {
//! let mut auth = StaticAuthServer::new();
//! auth.add_user("app", "secret");
//!
//! let listener = Listener::bind_tcp(
//!     "127.0.0.1:3306",
//!     Arc::new(auth),
//!     Arc::new(MyHandler),
//!     ListenerOpts::default(),
//! )
//! .await?;
//! listener.serve().await
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod metrics;
pub mod packet;
pub mod protocol;
pub mod resultset;
pub mod tls;
pub mod value;

pub use auth::{AuthServer, PacketChannel, StaticAuthServer, StaticUserData, UserData};
pub use config::ListenerOpts;
pub use connection::{Conn, PrepareData, PrepareWriter, ResultWriter};
pub use error::{Result, WireError};
pub use handler::Handler;
pub use listener::{Listener, ListenerHandle};
pub use protocol::{ColumnType, DEFAULT_SERVER_VERSION, MAX_PACKET_SIZE};
pub use resultset::{Field, QueryResult};
pub use tls::TlsConfig;
pub use value::{BindVars, Value};
