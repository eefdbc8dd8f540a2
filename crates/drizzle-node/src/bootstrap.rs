// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker bootstrap (`drizzle-node init -n <function>`).
//!
//! Runs inside a freshly launched worker: fetches the function's code
//! archive, unpacks it under `/tmp/<prefix>/<pid>/code/` and replaces the
//! process with the configured runtime. The request and response pipes on
//! fds 3 and 4 are inherited by the runtime.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use crate::code_store::CodeStore;
use crate::config::InitArgs;
use crate::error::{Error, Result};

/// Placeholder in the runtime command replaced with the code directory.
pub const CODE_DIR_PLACEHOLDER: &str = "{code_dir}";

/// Directory the code of process `pid` is unpacked into.
pub fn code_dir(prefix: &str, pid: u32) -> PathBuf {
    Path::new("/tmp")
        .join(prefix)
        .join(pid.to_string())
        .join("code")
}

fn store_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::CodeStore(format!("{context}: {e}"))
}

/// Decode a base64 zip archive and unpack it into `dest`.
///
/// Entries whose path would land outside `dest` are rejected. Returns the
/// number of files written.
pub fn extract(archive: &str, dest: &Path) -> Result<usize> {
    let bytes = STANDARD
        .decode(archive.trim())
        .map_err(|e| store_error("invalid base64 archive", e))?;
    let mut zip =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| store_error("invalid zip archive", e))?;

    std::fs::create_dir_all(dest)?;
    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| store_error("unreadable zip entry", e))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::CodeStore(format!(
                "zip entry escapes the code directory: {}",
                entry.name()
            )));
        };
        let path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&path)?;
        std::io::copy(&mut entry, &mut out)?;

        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
        written += 1;
    }
    Ok(written)
}

/// Build the runtime command, substituting the code directory.
pub fn runtime_command(runtime: &str, code_dir: &Path) -> Result<Command> {
    let line = runtime.replace(CODE_DIR_PLACEHOLDER, &code_dir.to_string_lossy());
    let mut parts = line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Launch("empty runtime command".to_string()))?;
    let mut command = Command::new(program);
    command.args(parts).current_dir(code_dir);
    Ok(command)
}

/// Fetch and unpack the code, returning the command to exec.
pub async fn prepare(args: &InitArgs, store: &dyn CodeStore) -> Result<Command> {
    let dir = code_dir(&args.tmp_prefix, std::process::id());
    info!(
        function = %args.function_name,
        namespace = %args.namespace,
        code_dir = %dir.display(),
        "Bootstrapping worker"
    );

    let archive = store.get(&args.namespace, &args.function_name).await?;
    let dest = dir.clone();
    let files = tokio::task::spawn_blocking(move || extract(&archive, &dest))
        .await
        .map_err(|e| Error::CodeStore(format!("unpack task failed: {e}")))??;
    debug!(files, "Code unpacked");

    runtime_command(&args.runtime, &dir)
}

/// Replace the current process with `command`. Only returns on failure.
pub fn exec(mut command: Command) -> Error {
    use std::os::unix::process::CommandExt;
    info!(command = ?command, "Executing worker runtime");
    Error::Launch(format!("exec failed: {}", command.exec()))
}
