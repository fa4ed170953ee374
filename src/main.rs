//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Gator: a hierarchical shell-job supervisor
//!
//! One binary, three runtime modes. `run` bootstraps a root tier from a
//! spec file; the local scheduler re-enters the same binary in `tier` and
//! `wrapper` mode for interior and leaf nodes of the tree. All modes talk
//! the same bidirectional JSON websocket protocol.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::ArgMatches;
use log::error;

mod cli;
mod config;
mod protocol;
mod sched;
mod spec;
mod store;
mod tier;
mod ui;
mod util;
mod wrapper;

use crate::config::Configuration;
use crate::protocol::message::ACTION_CHILDREN;
use crate::protocol::message::ACTION_GET_TREE;
use crate::protocol::message::ACTION_STOP;
use crate::protocol::ws_url;
use crate::protocol::Client;
use crate::protocol::ConnectError;
use crate::protocol::NullHandler;
use crate::sched::LocalScheduler;
use crate::spec::SpecError;
use crate::store::Severity;
use crate::tier::Tier;
use crate::ui::LogRenderer;
use crate::wrapper::Wrapper;

#[tokio::main]
async fn main() {
    human_panic::setup_panic!();

    let code = match run().await {
        Ok(code) => code,
        Err(error) => {
            error!("{error:#}");
            eprintln!("Error: {error:#}");
            classify_error(&error)
        }
    };
    std::process::exit(code);
}

/// Map the error taxonomy to the reserved exit codes
fn classify_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConnectError>().is_some() {
        2
    } else if error.downcast_ref::<SpecError>().is_some() {
        3
    } else {
        1
    }
}

async fn run() -> Result<i32> {
    let matches = cli::cli().get_matches();

    let filter = tracing_subscriber::EnvFilter::try_from_env("GATOR_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = crate::config::load(matches.get_one::<String>("config").map(Path::new))?;

    match matches.subcommand() {
        Some(("run", matches)) => run_root(matches, config).await,
        Some(("wrapper", matches)) => run_wrapper(matches, config).await,
        Some(("tier", matches)) => run_tier(matches, config).await,
        Some(("stop", matches)) => stop(matches).await.map(|_| 0),
        Some(("tree", matches)) => tree(matches).await.map(|_| 0),
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {other}")),
        None => Err(anyhow!("No subcommand")),
    }
}

async fn run_root(matches: &ArgMatches, config: Configuration) -> Result<i32> {
    let spec_path = matches.get_one::<String>("spec").unwrap(); // safe by clap
    let text = tokio::fs::read_to_string(spec_path)
        .await
        .with_context(|| format!("Reading spec file {spec_path}"))?;
    let node = tier::rootify(spec::parse_str(&text)?);

    let severity = match matches.get_one::<String>("severity") {
        Some(name) => Severity::from_name(name)
            .ok_or_else(|| anyhow!("Unknown severity: {name}"))?,
        None => config.console_severity(),
    };
    let renderer = LogRenderer::auto(severity, matches.get_flag("no_color"));
    let scheduler = Arc::new(LocalScheduler::new()?);

    Tier::root(node, renderer, scheduler, config).run().await
}

async fn run_wrapper(matches: &ArgMatches, config: Configuration) -> Result<i32> {
    let ident = arg_or_env(matches, "ident", "GATOR_IDENT")?;
    let parent = arg_or_env(matches, "parent", "GATOR_PARENT")?;
    Wrapper::new(ident, parent, config).run().await
}

async fn run_tier(matches: &ArgMatches, config: Configuration) -> Result<i32> {
    let ident = arg_or_env(matches, "ident", "GATOR_IDENT")?;
    let parent = arg_or_env(matches, "parent", "GATOR_PARENT")?;
    let scheduler = Arc::new(LocalScheduler::new()?);
    Tier::child(ident, parent, scheduler, config).run().await
}

fn arg_or_env(matches: &ArgMatches, key: &str, env: &str) -> Result<String> {
    matches
        .get_one::<String>(key)
        .cloned()
        .or_else(|| std::env::var(env).ok())
        .ok_or_else(|| anyhow!("Missing --{key} (or {env} in the environment)"))
}

async fn stop(matches: &ArgMatches) -> Result<()> {
    let url = matches.get_one::<String>("url").unwrap(); // safe by clap
    let timeout = matches
        .get_one::<String>("timeout")
        .map(|s| humantime::parse_duration(s))
        .transpose()
        .context("Parsing --timeout")?
        .unwrap_or_else(|| std::time::Duration::from_secs(30));

    let target = url::Url::parse(&ws_url(url)).context("Parsing supervisor URL")?;
    let client = Client::connect(target.as_str(), Arc::new(NullHandler)).await?;
    client
        .request_timeout(ACTION_STOP, serde_json::json!({}), timeout)
        .await?;
    println!("stop acknowledged, children are shutting down");
    Ok(())
}

async fn tree(matches: &ArgMatches) -> Result<()> {
    let url = matches.get_one::<String>("url").unwrap(); // safe by clap
    let target = url::Url::parse(&ws_url(url)).context("Parsing supervisor URL")?;
    let client = Client::connect(target.as_str(), Arc::new(NullHandler)).await?;
    let renderer = LogRenderer::auto(Severity::Debug, false);
    let mut stdout = std::io::stdout();

    if matches.get_flag("children") {
        let reply = client
            .request(ACTION_CHILDREN, serde_json::json!({}))
            .await?;
        let children = serde_json::from_value(reply).context("Decoding children reply")?;
        renderer.render_children(&mut stdout, &children)
    } else {
        let reply = client
            .request(ACTION_GET_TREE, serde_json::json!({}))
            .await?;
        renderer.render_tree(&mut stdout, &reply)
    }
}
