//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::anyhow;
use parse_display::Display;
use serde::Deserialize;
use serde::Serialize;

/// Log severity
///
/// The numeric values deliberately match the widely used 10/20/30/40/50
/// scheme so existing log viewers interoperate. The numeric value is
/// canonical on the wire and in the store; names are accepted
/// case-insensitively on input.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[display(style = "UPPERCASE")]
#[serde(into = "i64", try_from = "i64")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn value(self) -> i64 {
        match self {
            Severity::Debug => 10,
            Severity::Info => 20,
            Severity::Warning => 30,
            Severity::Error => 40,
            Severity::Critical => 50,
        }
    }

    /// Case-insensitive name lookup
    pub fn from_name(name: &str) -> Option<Severity> {
        match name.to_uppercase().as_str() {
            "DEBUG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "ERROR" => Some(Severity::Error),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Counter name under which a wrapper aggregates messages of this
    /// severity (`msg_debug`, `msg_info`, ...)
    pub fn counter_name(self) -> &'static str {
        match self {
            Severity::Debug => "msg_debug",
            Severity::Info => "msg_info",
            Severity::Warning => "msg_warning",
            Severity::Error => "msg_error",
            Severity::Critical => "msg_critical",
        }
    }
}

impl From<Severity> for i64 {
    fn from(s: Severity) -> i64 {
        s.value()
    }
}

impl TryFrom<i64> for Severity {
    type Error = anyhow::Error;

    fn try_from(v: i64) -> Result<Severity, anyhow::Error> {
        match v {
            10 => Ok(Severity::Debug),
            20 => Ok(Severity::Info),
            30 => Ok(Severity::Warning),
            40 => Ok(Severity::Error),
            50 => Ok(Severity::Critical),
            other => Err(anyhow!("not a severity value: {other}")),
        }
    }
}

/// One captured log line
///
/// The `uid` is assigned by the store the entry lands in; identity is not
/// preserved when an entry crosses a process boundary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub uid: i64,
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

/// A named integer metric, last-write-wins per name
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: i64,
    pub timestamp: i64,
}

/// One resource usage observation of the supervised process (tree)
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSample {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}
