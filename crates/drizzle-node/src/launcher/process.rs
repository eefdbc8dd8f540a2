// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process launcher.
//!
//! Spawns each worker as a child process with the request pipe on fd 3 and
//! the response pipe on fd 4. With isolation enabled the child unshares its
//! UTS, IPC and PID namespaces and forks once more, so the worker runs as
//! PID 1 of its own namespace. This requires `CAP_SYS_ADMIN`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use drizzle_protocol::worker::{REQUEST_FD, RESPONSE_FD};
use futures::FutureExt;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::errno::Errno;
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, pipe2};
use tokio::net::unix::pipe;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::error::{Error, Result};

/// Placeholder replaced with the function name in worker arguments.
pub const FUNCTION_PLACEHOLDER: &str = "{function}";

/// Lowest descriptor used when moving pipe ends out of the way in the child.
const SCRATCH_FD_BASE: RawFd = 10;

/// Configuration for the process launcher.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Program started for every worker.
    pub program: PathBuf,
    /// Arguments; [`FUNCTION_PLACEHOLDER`] is substituted.
    pub args: Vec<String>,
    /// Unshare UTS/IPC/PID namespaces in the child.
    pub isolation: bool,
    /// Extra environment for the child.
    pub env: HashMap<String, String>,
}

impl ProcessLauncherConfig {
    /// Re-invoke the current executable as `init -n <function>`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["init".into(), "-n".into(), FUNCTION_PLACEHOLDER.into()],
            isolation: true,
            env: HashMap::new(),
        })
    }

    /// Run a standalone worker program as `<program> -n <function>`.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-n".into(), FUNCTION_PLACEHOLDER.into()],
            isolation: false,
            env: HashMap::new(),
        }
    }

    pub fn with_isolation(mut self, isolation: bool) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Launches workers as OS processes.
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self { config }
    }

    fn args_for(&self, function_name: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|a| a.replace(FUNCTION_PLACEHOLDER, function_name))
            .collect()
    }
}

/// Put the pipe ends on fds 3 and 4 without the close-on-exec flag.
///
/// Both ends are first copied above [`SCRATCH_FD_BASE`] so installing one
/// cannot clobber the other. Runs between fork and exec, so it only uses
/// async-signal-safe calls.
fn install_fds(requests: RawFd, responses: RawFd) -> nix::Result<()> {
    let requests = fcntl(requests, FcntlArg::F_DUPFD_CLOEXEC(SCRATCH_FD_BASE))?;
    let responses = fcntl(responses, FcntlArg::F_DUPFD_CLOEXEC(SCRATCH_FD_BASE))?;
    dup2(requests, REQUEST_FD)?;
    dup2(responses, RESPONSE_FD)?;
    Ok(())
}

/// Close every descriptor above stderr.
fn close_inherited_fds() {
    // SAFETY: plain close calls on descriptors this process no longer uses.
    unsafe {
        if nix::libc::syscall(nix::libc::SYS_close_range, 3u32, u32::MAX, 0u32) != 0 {
            for fd in 3..1024 {
                nix::libc::close(fd);
            }
        }
    }
}

/// Make the worker PID 1 of the namespace created by `unshare(CLONE_NEWPID)`.
///
/// `unshare` only moves future children into the new PID namespace, so this
/// forks once more. The forked child returns and goes on to exec the worker.
/// The intermediate process stays the node's direct child: it reaps the
/// worker and exits with its status. The worker gets SIGKILL when the
/// intermediate dies, so killing the pid the node knows stops both.
///
/// Runs between fork and exec, so it only uses async-signal-safe calls.
fn enter_pid_namespace() -> nix::Result<()> {
    // SAFETY: the pre-exec child is single-threaded.
    match unsafe { fork() }? {
        ForkResult::Child => prctl::set_pdeathsig(Signal::SIGKILL),
        ForkResult::Parent { child } => {
            // Drops the pipe ends and the spawn error pipe, so the node sees
            // exec success from the worker alone.
            close_inherited_fds();
            let code = loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(_) => break 1,
                }
            };
            // SAFETY: terminates the intermediate without running destructors.
            unsafe { nix::libc::_exit(code) }
        }
    }
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Launch(format!("pipe2 failed: {e}")))
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle> {
        let (request_read, request_write) = pipe_pair()?;
        let (response_read, response_write) = pipe_pair()?;

        let child_requests = request_read.as_raw_fd();
        let child_responses = response_write.as_raw_fd();
        let isolation = self.config.isolation;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.args_for(&spec.function_name))
            .envs(&self.config.env)
            .env("DRIZZLE_FUNCTION", &spec.function_name)
            .env("DRIZZLE_INSTANCE_ID", &spec.instance_id)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // SAFETY: the closure only makes async-signal-safe calls and captures
        // plain integers.
        unsafe {
            cmd.pre_exec(move || {
                if isolation {
                    unshare(
                        CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWPID,
                    )
                    .map_err(io::Error::from)?;
                    enter_pid_namespace().map_err(io::Error::from)?;
                }
                install_fds(child_requests, child_responses).map_err(io::Error::from)
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Launch(format!(
                "failed to spawn {}: {e}",
                self.config.program.display()
            ))
        })?;

        // The child owns its ends now.
        drop(request_read);
        drop(response_write);

        // With isolation this is the intermediate process, not the worker.
        let pid = child.id();
        info!(
            instance_id = %spec.instance_id,
            function = %spec.function_name,
            pid = ?pid,
            isolation,
            "Worker process spawned"
        );

        let requests = pipe::Sender::from_file(std::fs::File::from(request_write))?;
        let responses = pipe::Receiver::from_file(std::fs::File::from(response_read))?;

        let exited_flag = Arc::new(AtomicBool::new(false));
        let reaped = exited_flag.clone();
        let instance_id = spec.instance_id.clone();
        let exited = async move {
            match child.wait().await {
                Ok(status) => debug!(instance_id = %instance_id, %status, "Worker process exited"),
                Err(e) => warn!(instance_id = %instance_id, error = %e, "Failed to wait for worker"),
            }
            reaped.store(true, Ordering::SeqCst);
        }
        .boxed();

        let kill: Killer = Box::new(move || {
            let Some(pid) = pid else {
                return;
            };
            if exited_flag.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "SIGKILL failed");
            }
        });

        Ok(WorkerHandle {
            pid,
            requests: Box::new(requests),
            responses: Box::new(responses),
            exited,
            kill,
        })
    }
}
