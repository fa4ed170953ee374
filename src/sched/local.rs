//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::trace;

use crate::sched::LaunchRequest;
use crate::sched::ProcessHandle;
use crate::sched::Scheduler;

/// The local fork/exec adapter
///
/// Spawns this same binary in `wrapper` or `tier` mode. Resource requests
/// are recorded but not enforced; a cluster adapter would translate them
/// into a queue submission instead.
#[derive(Debug)]
pub struct LocalScheduler {
    binary: PathBuf,
}

impl LocalScheduler {
    pub fn new() -> Result<Self> {
        let binary = std::env::current_exe().context("Locating own executable")?;
        Ok(LocalScheduler { binary })
    }
}

#[async_trait::async_trait]
impl Scheduler for LocalScheduler {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>> {
        debug!(
            "Launching '{}' as {} against {}",
            request.ident(),
            request.mode(),
            request.parent_url()
        );
        trace!(
            "Requested resources for '{}': {} cores, {}, licenses {:?}",
            request.ident(),
            request.resources().cores(),
            request.resources().human_bytes(),
            request.resources().licenses()
        );

        let child = tokio::process::Command::new(&self.binary)
            .arg(request.mode().to_string())
            .arg("--ident")
            .arg(request.ident())
            .arg("--parent")
            .arg(request.parent_url())
            .env("GATOR_PARENT", request.parent_url())
            .env("GATOR_IDENT", request.ident())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Spawning supervisor for '{}'", request.ident()))?;

        Ok(Box::new(LocalHandle { child }))
    }
}

struct LocalHandle {
    child: tokio::process::Child,
}

#[async_trait::async_trait]
impl ProcessHandle for LocalHandle {
    async fn wait_for_exit(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .context("Waiting for child process")?;
        Ok(exit_code(status))
    }

    async fn terminate(&mut self) -> Result<()> {
        debug!("Terminating child process {:?}", self.child.id());
        self.child.kill().await.context("Killing child process")
    }
}

/// Map an exit status to the conventional shell code, 128+n for signals
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    status.code().unwrap_or(-1)
}
