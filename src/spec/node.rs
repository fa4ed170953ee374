//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use getset::CopyGetters;
use getset::Getters;
use parse_display::Display;
use parse_display::FromStr;

use crate::spec::spec_error;

/// A single shell task, the leaf of the spec tree
#[derive(Clone, Debug, Eq, PartialEq, Getters)]
pub struct Job {
    #[getset(get = "pub")]
    ident: String,

    #[getset(get = "pub")]
    command: String,

    #[getset(get = "pub")]
    args: Vec<String>,

    #[getset(get = "pub")]
    cwd: Option<PathBuf>,

    #[getset(get = "pub")]
    env: BTreeMap<String, String>,

    #[getset(get = "pub")]
    resources: Vec<Resource>,

    #[getset(get = "pub")]
    on_done: Vec<String>,

    #[getset(get = "pub")]
    on_pass: Vec<String>,

    #[getset(get = "pub")]
    on_fail: Vec<String>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ident: String,
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
        resources: Vec<Resource>,
        on_done: Vec<String>,
        on_pass: Vec<String>,
        on_fail: Vec<String>,
    ) -> Self {
        Job {
            ident,
            command,
            args,
            cwd,
            env,
            resources,
            on_done,
            on_pass,
            on_fail,
        }
    }
}

/// A static collection of children, supervised by one tier
#[derive(Clone, Debug, Eq, PartialEq, Getters)]
pub struct JobGroup {
    #[getset(get = "pub")]
    ident: String,

    #[getset(get = "pub")]
    cwd: Option<PathBuf>,

    #[getset(get = "pub")]
    env: BTreeMap<String, String>,

    #[getset(get = "pub")]
    jobs: Vec<SpecNode>,

    #[getset(get = "pub")]
    on_done: Vec<String>,

    #[getset(get = "pub")]
    on_pass: Vec<String>,

    #[getset(get = "pub")]
    on_fail: Vec<String>,
}

impl JobGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ident: String,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
        jobs: Vec<SpecNode>,
        on_done: Vec<String>,
        on_pass: Vec<String>,
        on_fail: Vec<String>,
    ) -> Self {
        JobGroup {
            ident,
            cwd,
            env,
            jobs,
            on_done,
            on_pass,
            on_fail,
        }
    }
}

/// A JobGroup template that is expanded `repeats` times at interpretation
/// time
#[derive(Clone, Debug, Eq, PartialEq, Getters, CopyGetters)]
pub struct JobArray {
    #[getset(get = "pub")]
    ident: String,

    #[getset(get = "pub")]
    cwd: Option<PathBuf>,

    #[getset(get = "pub")]
    env: BTreeMap<String, String>,

    #[getset(get = "pub")]
    jobs: Vec<SpecNode>,

    #[getset(get_copy = "pub")]
    repeats: usize,

    #[getset(get = "pub")]
    on_done: Vec<String>,

    #[getset(get = "pub")]
    on_pass: Vec<String>,

    #[getset(get = "pub")]
    on_fail: Vec<String>,
}

impl JobArray {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ident: String,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
        jobs: Vec<SpecNode>,
        repeats: usize,
        on_done: Vec<String>,
        on_pass: Vec<String>,
        on_fail: Vec<String>,
    ) -> Self {
        JobArray {
            ident,
            cwd,
            env,
            jobs,
            repeats,
            on_done,
            on_pass,
            on_fail,
        }
    }
}

/// Environment variable name a wrapper injects so an array expansion knows
/// its own index
pub const ENV_ARRAY_INDEX: &str = "GATOR_ARRAY_INDEX";

/// A node of the spec tree
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpecNode {
    Job(Job),
    Group(JobGroup),
    Array(JobArray),
}

impl SpecNode {
    pub fn ident(&self) -> &str {
        match self {
            SpecNode::Job(j) => j.ident(),
            SpecNode::Group(g) => g.ident(),
            SpecNode::Array(a) => a.ident(),
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, SpecNode::Job(_))
    }

    pub fn on_done(&self) -> &[String] {
        match self {
            SpecNode::Job(j) => j.on_done(),
            SpecNode::Group(g) => g.on_done(),
            SpecNode::Array(a) => a.on_done(),
        }
    }

    pub fn on_pass(&self) -> &[String] {
        match self {
            SpecNode::Job(j) => j.on_pass(),
            SpecNode::Group(g) => g.on_pass(),
            SpecNode::Array(a) => a.on_pass(),
        }
    }

    pub fn on_fail(&self) -> &[String] {
        match self {
            SpecNode::Job(j) => j.on_fail(),
            SpecNode::Group(g) => g.on_fail(),
            SpecNode::Array(a) => a.on_fail(),
        }
    }

    /// Number of leaves under this node after array expansion
    ///
    /// This is what a tier reports as `sub_total` for the subtree.
    pub fn leaf_count(&self) -> usize {
        match self {
            SpecNode::Job(_) => 1,
            SpecNode::Group(g) => g.jobs().iter().map(SpecNode::leaf_count).sum(),
            SpecNode::Array(a) => {
                a.repeats() * a.jobs().iter().map(SpecNode::leaf_count).sum::<usize>()
            }
        }
    }

    /// Expand this interior node into the list of direct children a tier
    /// supervises
    ///
    /// For a group this is the verbatim child list. For an array, each
    /// template child is synthesized `repeats` times with the zero-based
    /// index suffixed to its ident and `GATOR_ARRAY_INDEX` injected into
    /// its environment. Dependency names that point at template siblings
    /// are rewritten to the suffixed form of the same index, so sequencing
    /// within one expansion keeps working.
    pub fn expand_children(&self) -> Result<Vec<SpecNode>> {
        match self {
            SpecNode::Job(j) => spec_error(format!(
                "node '{}' is a job and cannot be expanded into children",
                j.ident()
            )),
            SpecNode::Group(g) => Ok(g.jobs().clone()),
            SpecNode::Array(a) => {
                if a.repeats() == 0 {
                    return spec_error(format!("array '{}' has repeats: 0", a.ident()));
                }

                let template_idents = a
                    .jobs()
                    .iter()
                    .map(|j| j.ident().to_string())
                    .collect::<Vec<_>>();

                let mut children = Vec::with_capacity(a.repeats() * a.jobs().len());
                for index in 0..a.repeats() {
                    for template in a.jobs() {
                        children.push(template.clone().into_expansion(index, &template_idents));
                    }
                }
                Ok(children)
            }
        }
    }

    fn into_expansion(self, index: usize, template_idents: &[String]) -> SpecNode {
        let suffix = |ident: &str| format!("{ident}_{index}");
        let fix_deps = |deps: Vec<String>| {
            deps.into_iter()
                .map(|d| {
                    if template_idents.contains(&d) {
                        suffix(&d)
                    } else {
                        d
                    }
                })
                .collect::<Vec<_>>()
        };

        match self {
            SpecNode::Job(mut j) => {
                j.ident = suffix(&j.ident);
                j.env
                    .insert(ENV_ARRAY_INDEX.to_string(), index.to_string());
                j.on_done = fix_deps(j.on_done);
                j.on_pass = fix_deps(j.on_pass);
                j.on_fail = fix_deps(j.on_fail);
                SpecNode::Job(j)
            }
            SpecNode::Group(mut g) => {
                g.ident = suffix(&g.ident);
                g.env
                    .insert(ENV_ARRAY_INDEX.to_string(), index.to_string());
                g.on_done = fix_deps(g.on_done);
                g.on_pass = fix_deps(g.on_pass);
                g.on_fail = fix_deps(g.on_fail);
                SpecNode::Group(g)
            }
            SpecNode::Array(mut a) => {
                a.ident = suffix(&a.ident);
                a.env
                    .insert(ENV_ARRAY_INDEX.to_string(), index.to_string());
                a.on_done = fix_deps(a.on_done);
                a.on_pass = fix_deps(a.on_pass);
                a.on_fail = fix_deps(a.on_fail);
                SpecNode::Array(a)
            }
        }
    }
}

/// A resource request attached to a job
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    Cores { count: u32 },
    Memory { size: u64, unit: MemoryUnit },
    License { name: String, count: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Display, FromStr)]
pub enum MemoryUnit {
    KB,
    MB,
    GB,
    TB,
}

impl MemoryUnit {
    pub fn multiplier(self) -> u64 {
        match self {
            MemoryUnit::KB => 1024,
            MemoryUnit::MB => 1024 * 1024,
            MemoryUnit::GB => 1024 * 1024 * 1024,
            MemoryUnit::TB => 1024 * 1024 * 1024 * 1024,
        }
    }
}

/// The normalized (cores, bytes, licenses) triple the scheduler consumes
#[derive(Clone, Debug, Default, Eq, PartialEq, Getters, CopyGetters)]
pub struct ResourceSummary {
    #[getset(get_copy = "pub")]
    cores: u32,

    #[getset(get_copy = "pub")]
    bytes: u64,

    #[getset(get = "pub")]
    licenses: BTreeMap<String, u32>,
}

impl ResourceSummary {
    pub fn from_requests(requests: &[Resource]) -> Self {
        let mut summary = ResourceSummary::default();
        for req in requests {
            match req {
                Resource::Cores { count } => summary.cores += count,
                Resource::Memory { size, unit } => summary.bytes += size * unit.multiplier(),
                Resource::License { name, count } => {
                    *summary.licenses.entry(name.clone()).or_insert(0) += count
                }
            }
        }
        summary
    }

    pub fn human_bytes(&self) -> String {
        bytesize::ByteSize::b(self.bytes).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(ident: &str) -> SpecNode {
        SpecNode::Job(Job::new(
            ident.to_string(),
            String::from("true"),
            vec![],
            None,
            BTreeMap::new(),
            vec![],
            vec![],
            vec![],
            vec![],
        ))
    }

    fn job_on_pass(ident: &str, dep: &str) -> SpecNode {
        SpecNode::Job(Job::new(
            ident.to_string(),
            String::from("true"),
            vec![],
            None,
            BTreeMap::new(),
            vec![],
            vec![],
            vec![dep.to_string()],
            vec![],
        ))
    }

    #[test]
    fn test_array_expansion_suffixes_and_env() {
        let arr = SpecNode::Array(JobArray::new(
            String::from("arr"),
            None,
            BTreeMap::new(),
            vec![job("c")],
            3,
            vec![],
            vec![],
            vec![],
        ));

        let children = arr.expand_children().unwrap();
        let idents = children.iter().map(SpecNode::ident).collect::<Vec<_>>();
        assert_eq!(idents, vec!["c_0", "c_1", "c_2"]);

        for (i, child) in children.iter().enumerate() {
            match child {
                SpecNode::Job(j) => {
                    assert_eq!(j.env().get(ENV_ARRAY_INDEX).unwrap(), &i.to_string())
                }
                other => panic!("Expected job, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_array_expansion_rewrites_template_deps() {
        let arr = SpecNode::Array(JobArray::new(
            String::from("arr"),
            None,
            BTreeMap::new(),
            vec![job("a"), job_on_pass("b", "a")],
            2,
            vec![],
            vec![],
            vec![],
        ));

        let children = arr.expand_children().unwrap();
        assert_eq!(children.len(), 4);
        assert_eq!(children[1].on_pass(), &[String::from("a_0")]);
        assert_eq!(children[3].on_pass(), &[String::from("a_1")]);
    }

    #[test]
    fn test_zero_repeats_is_a_spec_error() {
        let arr = SpecNode::Array(JobArray::new(
            String::from("arr"),
            None,
            BTreeMap::new(),
            vec![job("c")],
            0,
            vec![],
            vec![],
            vec![],
        ));

        let err = arr.expand_children().unwrap_err();
        assert!(err.downcast_ref::<crate::spec::SpecError>().is_some());
    }

    #[test]
    fn test_leaf_count_multiplies_repeats() {
        let group = SpecNode::Group(JobGroup::new(
            String::from("g"),
            None,
            BTreeMap::new(),
            vec![
                job("a"),
                SpecNode::Array(JobArray::new(
                    String::from("arr"),
                    None,
                    BTreeMap::new(),
                    vec![job("c")],
                    3,
                    vec![],
                    vec![],
                    vec![],
                )),
            ],
            vec![],
            vec![],
            vec![],
        ));

        assert_eq!(group.leaf_count(), 4);
    }

    #[test]
    fn test_resource_normalization() {
        let summary = ResourceSummary::from_requests(&[
            Resource::Cores { count: 2 },
            Resource::Cores { count: 2 },
            Resource::Memory {
                size: 2,
                unit: MemoryUnit::GB,
            },
            Resource::License {
                name: String::from("synth"),
                count: 1,
            },
        ]);

        assert_eq!(summary.cores(), 4);
        assert_eq!(summary.bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(summary.licenses().get("synth"), Some(&1));
    }
}
