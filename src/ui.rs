//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Console rendering at the root of the overlay tree
//!
//! The renderer is injected into the root tier as a sink; nothing below
//! the root writes to the terminal.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Error;
use anyhow::Result;
use colored::Colorize;
use itertools::Itertools;

use crate::protocol::message::ChildSnapshot;
use crate::protocol::message::LogPayload;
use crate::store::Severity;

#[derive(Clone, Debug)]
pub struct LogRenderer {
    filter: Severity,
    color: bool,
}

impl LogRenderer {
    pub fn new(filter: Severity, color: bool) -> Self {
        LogRenderer { filter, color }
    }

    /// Color iff stdout is a tty and the caller did not opt out
    pub fn auto(filter: Severity, no_color: bool) -> Self {
        LogRenderer {
            filter,
            color: !no_color && atty::is(atty::Stream::Stdout),
        }
    }

    pub fn render(&self, log: &LogPayload) {
        if log.severity < self.filter {
            return;
        }

        let time = chrono::DateTime::from_timestamp(log.timestamp, 0)
            .map(|dt| dt.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| String::from("--:--:--"));

        println!(
            "{time} {level:>8} {origin}: {message}",
            level = self.level_label(log.severity),
            origin = log.origin,
            message = log.message,
        );
    }

    fn level_label(&self, severity: Severity) -> String {
        let name = severity.to_string();
        if !self.color {
            return name;
        }

        match severity {
            Severity::Debug => name.dimmed().to_string(),
            Severity::Info => name.green().to_string(),
            Severity::Warning => name.yellow().to_string(),
            Severity::Error => name.red().to_string(),
            Severity::Critical => name.red().bold().to_string(),
        }
    }

    /// Pretty-print a `get_tree` reply
    pub fn render_tree(&self, out: &mut dyn Write, tree: &serde_json::Value) -> Result<()> {
        render_tree_inner(out, tree, 0)
    }

    /// Pretty-print a `children` reply
    pub fn render_children(
        &self,
        out: &mut dyn Write,
        children: &BTreeMap<String, ChildSnapshot>,
    ) -> Result<()> {
        for (ident, snapshot) in children {
            let metrics = snapshot
                .metrics
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .join(" ");

            writeln!(
                out,
                "{ident}: {state}/{result} exit={exit} server={server} {metrics}",
                state = snapshot.state,
                result = snapshot.result,
                exit = snapshot
                    .exitcode
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| String::from("-")),
                server = snapshot.server.as_deref().unwrap_or("-"),
            )
            .map_err(Error::from)?;
        }
        Ok(())
    }
}

fn render_tree_inner(out: &mut dyn Write, tree: &serde_json::Value, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    match tree {
        serde_json::Value::Object(map) => {
            for (ident, sub) in map {
                match sub {
                    serde_json::Value::Object(_) => {
                        writeln!(out, "{indent}{ident}/").map_err(Error::from)?;
                        render_tree_inner(out, sub, depth + 1)?;
                    }
                    other => {
                        let state = other.as_str().map(String::from).unwrap_or_else(|| other.to_string());
                        writeln!(out, "{indent}{ident}: {state}").map_err(Error::from)?;
                    }
                }
            }
            Ok(())
        }
        other => {
            writeln!(out, "{indent}{other}").map_err(Error::from)?;
            Ok(())
        }
    }
}
