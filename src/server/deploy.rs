//! Deploy path: import a raw payload and store it.
//!
//! Unlike the command path there is no catch-all: an import or storage
//! failure propagates to the connection, which closes without writing an
//! `ERR` line. Clients detect a failed deploy by the dropped connection.

use tracing::{debug, info};

use crate::protocol::codec::Response;
use crate::protocol::wire::{COMMAND_DEPLOY_PREFIX, RESPONSE_OK_PREFIX};
use crate::server::ServerContext;
use crate::Result;

/// Import `payload`, store it under its derived ID, and build the OK line.
///
/// An existing deployment with the same ID is replaced.
///
/// # Errors
///
/// Returns `AppError::Deploy` if the payload cannot be imported.
pub fn ingest(context: &ServerContext, payload: &[u8]) -> Result<Response> {
    let archive = context.importer.import(payload)?;
    let id = archive.id().to_owned();

    if context.store.insert(id.clone(), archive).is_some() {
        debug!(deployment_id = %id, "replaced existing deployment");
    }
    info!(deployment_id = %id, bytes = payload.len(), "deployed archive");

    Ok(Response::Line(format!(
        "{RESPONSE_OK_PREFIX}{COMMAND_DEPLOY_PREFIX}{id}"
    )))
}
