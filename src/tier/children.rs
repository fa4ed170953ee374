//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The per-tier table of direct children and their aggregate view

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Result;
use parse_display::Display;
use parse_display::FromStr;
use serde::Deserialize;
use serde::Serialize;

use crate::protocol::message::ChildSnapshot;
use crate::spec::SpecNode;
use crate::util::now_ts;

/// Lifecycle state of a direct child
///
/// States progress monotonically PENDING → LAUNCHED → STARTED → COMPLETE;
/// a discarded child jumps to COMPLETE without passing through STARTED.
#[derive(
    Clone, Copy, Debug, Display, FromStr, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[display(style = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChildState {
    Pending,
    Launched,
    Started,
    Complete,
}

/// Terminal outcome of a child, assigned exactly once
#[derive(
    Clone, Copy, Debug, Display, FromStr, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[display(style = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChildResult {
    Unknown,
    Success,
    Failure,
    Aborted,
}

/// Everything a tier tracks about one direct child
#[derive(Clone, Debug)]
pub struct ChildRecord {
    ident: String,
    spec: SpecNode,
    state: ChildState,
    result: ChildResult,
    server_url: Option<String>,
    exit_code: Option<i32>,
    metrics: BTreeMap<String, i64>,
    started_ts: Option<i64>,
    updated_ts: Option<i64>,
    completed_ts: Option<i64>,
    launched_at: Option<Instant>,
}

impl ChildRecord {
    pub fn new(spec: SpecNode) -> Self {
        ChildRecord {
            ident: spec.ident().to_string(),
            spec,
            state: ChildState::Pending,
            result: ChildResult::Unknown,
            server_url: None,
            exit_code: None,
            metrics: BTreeMap::new(),
            started_ts: None,
            updated_ts: None,
            completed_ts: None,
            launched_at: None,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn spec(&self) -> &SpecNode {
        &self.spec
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn result(&self) -> ChildResult {
        self.result
    }

    pub fn server_url(&self) -> Option<&str> {
        self.server_url.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ChildState::Complete
    }

    /// Seconds the child has been LAUNCHED without registering, if it is
    /// in that window
    pub fn launched_for(&self) -> Option<std::time::Duration> {
        match self.state {
            ChildState::Launched => self.launched_at.map(|at| at.elapsed()),
            _ => None,
        }
    }

    pub fn mark_launched(&mut self) -> Result<()> {
        match self.state {
            ChildState::Pending => {
                self.state = ChildState::Launched;
                self.launched_at = Some(Instant::now());
                Ok(())
            }
            other => Err(anyhow!(
                "cannot launch '{}' from state {other}",
                self.ident
            )),
        }
    }

    pub fn register(&mut self, server: &str) -> Result<()> {
        match self.state {
            ChildState::Launched => {
                self.state = ChildState::Started;
                self.server_url = Some(server.to_string());
                self.started_ts = Some(now_ts());
                Ok(())
            }
            other => Err(anyhow!(
                "protocol error: register for '{}' in state {other}",
                self.ident
            )),
        }
    }

    pub fn update(&mut self, metrics: BTreeMap<String, i64>) -> Result<()> {
        match self.state {
            ChildState::Started => {
                self.metrics = metrics;
                self.updated_ts = Some(now_ts());
                Ok(())
            }
            other => Err(anyhow!(
                "protocol error: update for '{}' in state {other}",
                self.ident
            )),
        }
    }

    pub fn complete(
        &mut self,
        result: ChildResult,
        code: i32,
        metrics: BTreeMap<String, i64>,
    ) -> Result<()> {
        match self.state {
            ChildState::Started => {
                self.state = ChildState::Complete;
                self.result = result;
                self.exit_code = Some(code);
                self.metrics = metrics;
                self.completed_ts = Some(now_ts());
                Ok(())
            }
            other => Err(anyhow!(
                "protocol error: complete for '{}' in state {other}",
                self.ident
            )),
        }
    }

    /// Discard this child: unmet dependencies, connect-back timeout or an
    /// upstream stop. Valid from any non-terminal state.
    pub fn abort(&mut self, code: i32) -> Result<()> {
        match self.state {
            ChildState::Complete => Err(anyhow!(
                "protocol error: abort for already terminal '{}'",
                self.ident
            )),
            _ => {
                self.state = ChildState::Complete;
                self.result = ChildResult::Aborted;
                self.exit_code = Some(code);
                self.completed_ts = Some(now_ts());
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> ChildSnapshot {
        ChildSnapshot {
            state: self.state,
            result: self.result,
            server: self.server_url.clone(),
            metrics: self.metrics.clone(),
            exitcode: self.exit_code,
            started: self.started_ts,
            updated: self.updated_ts,
            completed: self.completed_ts,
        }
    }
}

/// Tier-computed aggregate counters plus the summed user metrics
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Aggregate {
    pub sub_total: i64,
    pub sub_active: i64,
    pub sub_passed: i64,
    pub sub_failed: i64,
    pub user: BTreeMap<String, i64>,
}

impl Aggregate {
    /// Flatten into the metrics map an `update`/`complete` payload carries
    pub fn into_metrics(self) -> BTreeMap<String, i64> {
        let mut metrics = self.user;
        metrics.insert(String::from("sub_total"), self.sub_total);
        metrics.insert(String::from("sub_active"), self.sub_active);
        metrics.insert(String::from("sub_passed"), self.sub_passed);
        metrics.insert(String::from("sub_failed"), self.sub_failed);
        metrics
    }
}

/// The child-record table a tier exclusively owns
///
/// A BTreeMap keyed by ident, which also gives the resolver its
/// deterministic ident-order iteration.
#[derive(Debug, Default)]
pub struct ChildTable {
    records: BTreeMap<String, ChildRecord>,
}

impl ChildTable {
    pub fn from_children(children: Vec<SpecNode>) -> Result<ChildTable> {
        let mut records = BTreeMap::new();
        for child in children {
            let ident = child.ident().to_string();
            if records.insert(ident.clone(), ChildRecord::new(child)).is_some() {
                return crate::spec::spec_error(format!("duplicate child ident: {ident}"));
            }
        }
        Ok(ChildTable { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, ident: &str) -> Result<&ChildRecord> {
        self.records
            .get(ident)
            .ok_or_else(|| anyhow!("protocol error: unknown child ident: {ident}"))
    }

    pub fn get_mut(&mut self, ident: &str) -> Result<&mut ChildRecord> {
        self.records
            .get_mut(ident)
            .ok_or_else(|| anyhow!("protocol error: unknown child ident: {ident}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.values()
    }

    pub fn all_terminal(&self) -> bool {
        self.records.values().all(ChildRecord::is_terminal)
    }

    /// SUCCESS iff every child ended in SUCCESS
    pub fn overall_result(&self) -> ChildResult {
        if self
            .records
            .values()
            .all(|r| r.result() == ChildResult::Success)
        {
            ChildResult::Success
        } else {
            ChildResult::Failure
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ChildSnapshot> {
        self.records
            .iter()
            .map(|(ident, record)| (ident.clone(), record.snapshot()))
            .collect()
    }

    /// Compute the tier's aggregate counters from the current records
    ///
    /// Leaf children contribute directly from their state. Tier children
    /// contribute what they last reported; once terminal, the unreported
    /// remainder of their subtree counts as failed, which keeps
    /// `sub_passed + sub_failed == sub_total` at exit even for tiers that
    /// were discarded before reporting anything.
    pub fn aggregate(&self) -> Aggregate {
        let mut agg = Aggregate::default();

        for record in self.records.values() {
            let leaves = record.spec().leaf_count() as i64;
            agg.sub_total += leaves;

            if record.spec().is_job() {
                match record.state() {
                    ChildState::Launched | ChildState::Started => agg.sub_active += 1,
                    ChildState::Complete => match record.result() {
                        ChildResult::Success => agg.sub_passed += 1,
                        _ => agg.sub_failed += 1,
                    },
                    ChildState::Pending => (),
                }
            } else {
                let reported = |name: &str| record.metrics.get(name).copied().unwrap_or(0);
                if record.is_terminal() {
                    let passed = reported("sub_passed").min(leaves);
                    agg.sub_passed += passed;
                    agg.sub_failed += leaves - passed;
                } else {
                    agg.sub_active += reported("sub_active");
                    agg.sub_passed += reported("sub_passed");
                    agg.sub_failed += reported("sub_failed");
                }
            }

            for (name, value) in &record.metrics {
                if !name.starts_with("sub_") {
                    *agg.user.entry(name.clone()).or_insert(0) += value;
                }
            }
        }

        agg
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use crate::spec::Job;
    use crate::spec::JobGroup;

    pub(crate) fn job_node(ident: &str) -> SpecNode {
        job_node_deps(ident, &[], &[], &[])
    }

    pub(crate) fn job_node_deps(
        ident: &str,
        on_done: &[&str],
        on_pass: &[&str],
        on_fail: &[&str],
    ) -> SpecNode {
        let to_vec = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        SpecNode::Job(Job::new(
            ident.to_string(),
            String::from("true"),
            vec![],
            None,
            BTreeMap::new(),
            vec![],
            to_vec(on_done),
            to_vec(on_pass),
            to_vec(on_fail),
        ))
    }

    fn group_node(ident: &str, children: Vec<SpecNode>) -> SpecNode {
        SpecNode::Group(JobGroup::new(
            ident.to_string(),
            None,
            BTreeMap::new(),
            children,
            vec![],
            vec![],
            vec![],
        ))
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut record = ChildRecord::new(job_node("a"));
        assert_eq!(record.state(), ChildState::Pending);
        assert_eq!(record.result(), ChildResult::Unknown);

        record.mark_launched().unwrap();
        record.register("127.0.0.1:1234").unwrap();
        assert_eq!(record.state(), ChildState::Started);
        assert_eq!(record.server_url(), Some("127.0.0.1:1234"));

        record
            .update(BTreeMap::from([(String::from("msg_info"), 3)]))
            .unwrap();
        record
            .complete(ChildResult::Success, 0, BTreeMap::new())
            .unwrap();
        assert!(record.is_terminal());
        assert_eq!(record.result(), ChildResult::Success);
    }

    #[test]
    fn test_update_from_pending_is_a_protocol_error() {
        let mut record = ChildRecord::new(job_node("a"));
        assert!(record.update(BTreeMap::new()).is_err());
        assert!(record
            .complete(ChildResult::Success, 0, BTreeMap::new())
            .is_err());
    }

    #[test]
    fn test_register_must_follow_launch() {
        let mut record = ChildRecord::new(job_node("a"));
        assert!(record.register("127.0.0.1:1").is_err());

        record.mark_launched().unwrap();
        record.register("127.0.0.1:1").unwrap();
        assert!(record.register("127.0.0.1:2").is_err());
    }

    #[test]
    fn test_second_complete_is_a_protocol_error() {
        let mut record = ChildRecord::new(job_node("a"));
        record.mark_launched().unwrap();
        record.register("127.0.0.1:1").unwrap();
        record
            .complete(ChildResult::Failure, 1, BTreeMap::new())
            .unwrap();

        assert!(record
            .complete(ChildResult::Failure, 1, BTreeMap::new())
            .is_err());
        assert!(record.abort(-1).is_err());
    }

    #[test]
    fn test_abort_from_pending_skips_started() {
        let mut record = ChildRecord::new(job_node("a"));
        record.abort(-9).unwrap();
        assert!(record.is_terminal());
        assert_eq!(record.result(), ChildResult::Aborted);
        assert_eq!(record.snapshot().exitcode, Some(-9));
    }

    #[test]
    fn test_duplicate_idents_rejected() {
        let err =
            ChildTable::from_children(vec![job_node("a"), job_node("a")]).unwrap_err();
        assert!(err.downcast_ref::<crate::spec::SpecError>().is_some());
    }

    #[test]
    fn test_aggregate_counts_leaves() {
        let mut table = ChildTable::from_children(vec![
            job_node("a"),
            job_node("b"),
            group_node("g", vec![job_node("x"), job_node("y")]),
        ])
        .unwrap();

        // a passed, b running, g reported one pass so far
        table.get_mut("a").unwrap().mark_launched().unwrap();
        table.get_mut("a").unwrap().register("h:1").unwrap();
        table
            .get_mut("a")
            .unwrap()
            .complete(ChildResult::Success, 0, BTreeMap::new())
            .unwrap();

        table.get_mut("b").unwrap().mark_launched().unwrap();
        table.get_mut("b").unwrap().register("h:2").unwrap();

        table.get_mut("g").unwrap().mark_launched().unwrap();
        table.get_mut("g").unwrap().register("h:3").unwrap();
        table
            .get_mut("g")
            .unwrap()
            .update(BTreeMap::from([
                (String::from("sub_total"), 2),
                (String::from("sub_active"), 1),
                (String::from("sub_passed"), 1),
                (String::from("sub_failed"), 0),
                (String::from("lines"), 10),
            ]))
            .unwrap();

        let agg = table.aggregate();
        assert_eq!(agg.sub_total, 4);
        assert_eq!(agg.sub_active, 2); // b plus g's one active leaf
        assert_eq!(agg.sub_passed, 2); // a plus g's one passed leaf
        assert_eq!(agg.sub_failed, 0);
        assert_eq!(agg.user.get("lines"), Some(&10));
        assert!(agg.sub_passed + agg.sub_failed <= agg.sub_total);
    }

    #[test]
    fn test_aggregate_accounts_aborted_subtree_as_failed() {
        let mut table = ChildTable::from_children(vec![group_node(
            "g",
            vec![job_node("x"), job_node("y"), job_node("z")],
        )])
        .unwrap();

        table.get_mut("g").unwrap().abort(-1).unwrap();

        let agg = table.aggregate();
        assert_eq!(agg.sub_total, 3);
        assert_eq!(agg.sub_passed, 0);
        assert_eq!(agg.sub_failed, 3);
        assert_eq!(agg.sub_passed + agg.sub_failed, agg.sub_total);
        assert_eq!(table.overall_result(), ChildResult::Failure);
    }

    #[test]
    fn test_overall_result_success_requires_all_success() {
        let mut table =
            ChildTable::from_children(vec![job_node("a"), job_node("b")]).unwrap();
        for ident in ["a", "b"] {
            let record = table.get_mut(ident).unwrap();
            record.mark_launched().unwrap();
            record.register("h:1").unwrap();
            record
                .complete(ChildResult::Success, 0, BTreeMap::new())
                .unwrap();
        }
        assert_eq!(table.overall_result(), ChildResult::Success);
    }
}
