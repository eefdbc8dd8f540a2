// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function code store.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of function code packages.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Base64-encoded zip archive of `function` in `namespace`.
    async fn get(&self, namespace: &str, function: &str) -> Result<String>;
}

/// Code store backed by a directory tree: `<root>/<namespace>/<function>.zip`
/// holds a raw archive, `<function>.b64` an already encoded one.
#[derive(Debug, Clone)]
pub struct FsCodeStore {
    root: PathBuf,
}

impl FsCodeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CodeStore for FsCodeStore {
    async fn get(&self, namespace: &str, function: &str) -> Result<String> {
        if [namespace, function]
            .iter()
            .any(|part| part.is_empty() || part.contains(['/', '\\']) || *part == "..")
        {
            return Err(Error::CodeStore(format!(
                "invalid code path {namespace}/{function}"
            )));
        }

        let dir = self.root.join(namespace);
        let zip = dir.join(format!("{function}.zip"));
        if tokio::fs::try_exists(&zip).await? {
            debug!(path = %zip.display(), "Reading code archive");
            let bytes = tokio::fs::read(&zip).await?;
            return Ok(STANDARD.encode(bytes));
        }

        let encoded = dir.join(format!("{function}.b64"));
        if tokio::fs::try_exists(&encoded).await? {
            debug!(path = %encoded.display(), "Reading encoded code archive");
            let text = tokio::fs::read_to_string(&encoded).await?;
            return Ok(text.trim().to_string());
        }

        Err(Error::CodeStore(format!(
            "no code for {namespace}/{function} under {}",
            self.root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_raw_and_encoded_archives() {
        let dir = tempfile::tempdir().unwrap();
        let ns = dir.path().join("default");
        std::fs::create_dir_all(&ns).unwrap();
        std::fs::write(ns.join("A.zip"), b"PK\x03\x04raw").unwrap();
        std::fs::write(ns.join("B.b64"), "UEsDBA==\n").unwrap();

        let store = FsCodeStore::new(dir.path());
        let a = store.get("default", "A").await.unwrap();
        assert_eq!(STANDARD.decode(a).unwrap(), b"PK\x03\x04raw");
        assert_eq!(store.get("default", "B").await.unwrap(), "UEsDBA==");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCodeStore::new(dir.path());
        assert!(matches!(
            store.get("default", "missing").await,
            Err(Error::CodeStore(_))
        ));
        assert!(matches!(
            store.get("default", "../etc").await,
            Err(Error::CodeStore(_))
        ));
        assert!(matches!(store.get("..", "A").await, Err(Error::CodeStore(_))));
    }
}
