//! Resolve connection specs to driver handles.
//!
//! Only the reference drivers shipped in this crate resolve here; real
//! database and object-store drivers plug in externally and are
//! reported as not implemented.

use std::collections::BTreeMap;

use anyhow::Result;
use sluice_core::config::ConnSpec;
use sluice_core::drivers::{DbConn, FsClient};
use sluice_core::error::TaskError;

use crate::db_mem::MemoryConnection;
use crate::fs_local::LocalFsClient;

pub fn database_client(spec: &ConnSpec) -> Result<DbConn> {
    match spec.scheme() {
        Some("mem") => {
            let name = spec.url.trim_start_matches("mem://");
            Ok(MemoryConnection::shared(name) as DbConn)
        }
        Some(scheme) => Err(TaskError::NotImplemented(format!(
            "database driver '{scheme}' is external to this build"
        ))
        .into()),
        None => {
            Err(TaskError::ConfigInvalid(format!("not a database url: {}", spec.url)).into())
        }
    }
}

pub fn filesystem_client(url: &str, props: &BTreeMap<String, String>) -> Result<FsClient> {
    match url.split_once("://").map(|(scheme, _)| scheme) {
        None | Some("file") => Ok(std::sync::Arc::new(LocalFsClient::from_props(props))),
        Some(scheme) => Err(TaskError::NotImplemented(format!(
            "filesystem driver '{scheme}' is external to this build"
        ))
        .into()),
    }
}
