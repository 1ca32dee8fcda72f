//! The query-execution contract the listener drives.

use async_trait::async_trait;

use crate::connection::{Conn, PrepareWriter, ResultWriter};
use crate::error::Result;
use crate::value::BindVars;

/// Executes queries on behalf of the protocol layer.
///
/// For a given connection all of these methods are serialized: only
/// one is ever in flight at a time, so the handler may store per-
/// connection scratch state in [`Conn::client_data`] without locking.
/// Distinct connections invoke the handler concurrently; the handler
/// itself must be `Send + Sync`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called when a connection is accepted, before the handshake.
    /// The handler may adjust [`Conn::status_flags`] here (e.g. the
    /// autocommit bit); they are echoed by every OK/EOF packet.
    fn new_connection(&self, _conn: &mut Conn) {}

    /// Called exactly once for every connection that saw
    /// `new_connection`, after its worker finishes.
    fn connection_closed(&self, _conn: &mut Conn) {}

    /// Execute `query` and stream its results through `results`,
    /// calling [`ResultWriter::send`] one or more times. `bind_vars`
    /// is empty for plain queries and carries `v1`, `v2`, ... for
    /// prepared-statement executes.
    async fn com_query(
        &self,
        query: &str,
        bind_vars: &BindVars,
        results: &mut ResultWriter<'_>,
    ) -> Result<()>;

    /// Report the parameter/result schema for a statement being
    /// prepared by calling [`PrepareWriter::send`] exactly once.
    /// `bind_vars` maps each placeholder to a `"?"` marker value.
    async fn com_prepare(
        &self,
        query: &str,
        bind_vars: &BindVars,
        reply: &mut PrepareWriter<'_>,
    ) -> Result<()>;
}
