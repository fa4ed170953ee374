//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The scheduler seam
//!
//! A tier only ever asks for "launch a process that will phone home to URL
//! X with identifier Y". The local fork adapter below is the default;
//! cluster or container adapters implement the same trait.

use anyhow::Result;
use getset::Getters;
use parse_display::Display;
use typed_builder::TypedBuilder;

use crate::spec::ResourceSummary;

mod local;

pub use local::exit_code;
pub use local::LocalScheduler;

/// Which mode the launched process re-enters this codebase in
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[display(style = "lowercase")]
pub enum LaunchMode {
    Wrapper,
    Tier,
}

/// Everything a scheduler needs to start one child
#[derive(Clone, Debug, Getters, TypedBuilder)]
pub struct LaunchRequest {
    #[getset(get = "pub")]
    ident: String,

    /// Websocket URL the child must register against
    #[getset(get = "pub")]
    parent_url: String,

    #[getset(get = "pub")]
    resources: ResourceSummary,

    #[getset(get = "pub")]
    mode: LaunchMode,
}

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Start a child process
    ///
    /// The launched process must connect back to `parent_url` and send
    /// `register` within the configured grace period, or the tier marks it
    /// failed-to-start.
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>>;
}

/// Handle on a launched child, owned by the tier until the child is
/// terminal
#[async_trait::async_trait]
pub trait ProcessHandle: Send + 'static {
    async fn wait_for_exit(&mut self) -> Result<i32>;

    /// Forcibly end the process; the graceful path goes through the
    /// protocol's `stop` action instead
    async fn terminate(&mut self) -> Result<()>;
}
