//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Line-oriented capture of the job's stdout and stderr
//!
//! Each stream is drained line by line and stamped with a default
//! severity (INFO for stdout, ERROR for stderr) unless a classification
//! rule re-tags it first. A partial final line without a trailing newline
//! is still emitted.

use anyhow::Context;
use anyhow::Result;
use log::trace;
use regex::Regex;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::ClassifyRule;
use crate::store::Severity;
use crate::util::now_ts;

/// One captured output line, ready for the log pipeline
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CapturedLine {
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

/// The optional line-classification hook
///
/// Rules are checked in configuration order; the first match wins. With no
/// rules installed every line keeps its stream default.
#[derive(Debug, Default)]
pub struct LineClassifier {
    rules: Vec<(Regex, Severity)>,
}

impl LineClassifier {
    pub fn from_rules(rules: &[ClassifyRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = Regex::new(rule.pattern())
                    .with_context(|| format!("Compiling classify pattern: {}", rule.pattern()))?;
                let severity = Severity::from_name(rule.severity()).ok_or_else(|| {
                    anyhow::anyhow!("Unknown severity in classify rule: {}", rule.severity())
                })?;
                Ok((regex, severity))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LineClassifier { rules })
    }

    pub fn classify(&self, line: &str, default: Severity) -> Severity {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(line))
            .map(|(_, severity)| *severity)
            .unwrap_or(default)
    }
}

/// Drain one stream to the line sink until EOF
pub async fn drain<R>(
    reader: R,
    default: Severity,
    classifier: std::sync::Arc<LineClassifier>,
    sink: UnboundedSender<CapturedLine>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("Reading output line")? {
        trace!("Captured line ({default}): {line}");
        let severity = classifier.classify(&line, default);
        if sink
            .send(CapturedLine {
                timestamp: now_ts(),
                severity,
                message: line,
            })
            .is_err()
        {
            // Receiver gone, the wrapper is shutting down.
            break;
        }
    }

    Ok(())
}
