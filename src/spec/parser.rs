//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The YAML-with-custom-tags spec format
//!
//! Node tags `!Job`, `!JobGroup` and `!JobArray` select the spec node
//! variant; the resource tags `!Cores`, `!Memory` and `!License` are
//! accepted in sequence form (`!Cores [4]`) and mapping form
//! (`!Cores { count: 4 }`). Environment variable references inside string
//! fields are left verbatim here, they get expanded against the effective
//! environment at job-launch time.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use serde_yaml::value::Tag;
use serde_yaml::value::TaggedValue;
use serde_yaml::Mapping;
use serde_yaml::Value;

use crate::spec::node::Job;
use crate::spec::node::JobArray;
use crate::spec::node::JobGroup;
use crate::spec::node::MemoryUnit;
use crate::spec::node::Resource;
use crate::spec::node::SpecNode;
use crate::spec::spec_error;

pub fn parse_str(input: &str) -> Result<SpecNode> {
    let value: Value = serde_yaml::from_str(input).context("Parsing spec document as YAML")?;
    node_from_value(&value)
}

pub fn to_yaml_string(node: &SpecNode) -> Result<String> {
    serde_yaml::to_string(&node_to_value(node)).context("Serializing spec node as YAML")
}

pub fn node_from_value(value: &Value) -> Result<SpecNode> {
    let tagged = match value {
        Value::Tagged(tagged) => tagged,
        other => return spec_error(format!("expected a tagged spec node, found: {other:?}")),
    };

    if tagged.tag == "Job" {
        job_from_value(&tagged.value).map(SpecNode::Job)
    } else if tagged.tag == "JobGroup" {
        group_from_value(&tagged.value).map(SpecNode::Group)
    } else if tagged.tag == "JobArray" {
        array_from_value(&tagged.value).map(SpecNode::Array)
    } else {
        spec_error(format!("unknown spec node tag: {}", tagged.tag))
    }
}

fn job_from_value(value: &Value) -> Result<Job> {
    let map = expect_mapping(value, "!Job")?;
    let ident = required_string(map, "ident")?;

    Ok(Job::new(
        ident.clone(),
        required_string(map, "command").with_context(|| format!("In job '{ident}'"))?,
        optional_string_seq(map, "args")?,
        optional_string(map, "cwd")?.map(PathBuf::from),
        optional_env(map)?,
        optional_resources(map).with_context(|| format!("In job '{ident}'"))?,
        optional_string_seq(map, "on_done")?,
        optional_string_seq(map, "on_pass")?,
        optional_string_seq(map, "on_fail")?,
    ))
}

fn group_from_value(value: &Value) -> Result<JobGroup> {
    let map = expect_mapping(value, "!JobGroup")?;
    let ident = required_string(map, "ident")?;

    Ok(JobGroup::new(
        ident.clone(),
        optional_string(map, "cwd")?.map(PathBuf::from),
        optional_env(map)?,
        child_nodes(map).with_context(|| format!("In group '{ident}'"))?,
        optional_string_seq(map, "on_done")?,
        optional_string_seq(map, "on_pass")?,
        optional_string_seq(map, "on_fail")?,
    ))
}

fn array_from_value(value: &Value) -> Result<JobArray> {
    let map = expect_mapping(value, "!JobArray")?;
    let ident = required_string(map, "ident")?;

    let repeats = match field(map, "repeats") {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("array '{ident}' has a non-integral repeats value"))?
            as usize,
        Some(other) => {
            return spec_error(format!(
                "array '{ident}' has a non-numeric repeats value: {other:?}"
            ))
        }
        None => return spec_error(format!("array '{ident}' is missing the repeats field")),
    };

    Ok(JobArray::new(
        ident.clone(),
        optional_string(map, "cwd")?.map(PathBuf::from),
        optional_env(map)?,
        child_nodes(map).with_context(|| format!("In array '{ident}'"))?,
        repeats,
        optional_string_seq(map, "on_done")?,
        optional_string_seq(map, "on_pass")?,
        optional_string_seq(map, "on_fail")?,
    ))
}

fn child_nodes(map: &Mapping) -> Result<Vec<SpecNode>> {
    match field(map, "jobs") {
        None => Ok(vec![]),
        Some(Value::Sequence(seq)) => seq.iter().map(node_from_value).collect(),
        Some(other) => spec_error(format!("jobs must be a sequence of spec nodes: {other:?}")),
    }
}

fn optional_resources(map: &Mapping) -> Result<Vec<Resource>> {
    match field(map, "resources") {
        None => Ok(vec![]),
        Some(Value::Sequence(seq)) => seq.iter().map(resource_from_value).collect(),
        Some(other) => spec_error(format!("resources must be a sequence: {other:?}")),
    }
}

fn resource_from_value(value: &Value) -> Result<Resource> {
    let tagged = match value {
        Value::Tagged(tagged) => tagged,
        other => return spec_error(format!("expected a tagged resource, found: {other:?}")),
    };

    if tagged.tag == "Cores" {
        cores_from_value(tagged)
    } else if tagged.tag == "Memory" {
        memory_from_value(tagged)
    } else if tagged.tag == "License" {
        license_from_value(tagged)
    } else {
        spec_error(format!("unknown resource tag: {}", tagged.tag))
    }
}

fn cores_from_value(tagged: &TaggedValue) -> Result<Resource> {
    let count = match &tagged.value {
        Value::Sequence(seq) => match seq.as_slice() {
            [Value::Number(n)] => n.as_u64(),
            _ => None,
        },
        Value::Mapping(map) => match field(map, "count") {
            Some(Value::Number(n)) => n.as_u64(),
            _ => None,
        },
        _ => None,
    };

    match count {
        Some(count) => Ok(Resource::Cores {
            count: count as u32,
        }),
        None => spec_error(format!("malformed !Cores resource: {:?}", tagged.value)),
    }
}

fn memory_from_value(tagged: &TaggedValue) -> Result<Resource> {
    let pair = match &tagged.value {
        Value::Sequence(seq) => match seq.as_slice() {
            [Value::Number(n), unit] => n.as_u64().zip(value_as_string(unit)),
            _ => None,
        },
        Value::Mapping(map) => {
            let size = match field(map, "size") {
                Some(Value::Number(n)) => n.as_u64(),
                _ => None,
            };
            size.zip(field(map, "unit").and_then(value_as_string))
        }
        _ => None,
    };

    match pair {
        Some((size, unit)) => {
            let unit = MemoryUnit::from_str(&unit)
                .map_err(|_| anyhow::anyhow!("unknown memory unit: {unit}"))?;
            Ok(Resource::Memory { size, unit })
        }
        None => spec_error(format!("malformed !Memory resource: {:?}", tagged.value)),
    }
}

fn license_from_value(tagged: &TaggedValue) -> Result<Resource> {
    let pair = match &tagged.value {
        Value::Sequence(seq) => match seq.as_slice() {
            [name] => value_as_string(name).map(|n| (n, 1)),
            [name, Value::Number(c)] => value_as_string(name).zip(c.as_u64()),
            _ => None,
        },
        Value::Mapping(map) => {
            let name = field(map, "name").and_then(value_as_string);
            let count = match field(map, "count") {
                Some(Value::Number(n)) => n.as_u64(),
                None => Some(1),
                _ => None,
            };
            name.zip(count)
        }
        _ => None,
    };

    match pair {
        Some((name, count)) => Ok(Resource::License {
            name,
            count: count as u32,
        }),
        None => spec_error(format!("malformed !License resource: {:?}", tagged.value)),
    }
}

pub fn node_to_value(node: &SpecNode) -> Value {
    let (tag, map) = match node {
        SpecNode::Job(j) => {
            let mut map = Mapping::new();
            insert_str(&mut map, "ident", j.ident());
            insert_str(&mut map, "command", j.command());
            insert_string_seq(&mut map, "args", j.args());
            if let Some(cwd) = j.cwd() {
                insert_str(&mut map, "cwd", &cwd.display().to_string());
            }
            insert_env(&mut map, j.env());
            if !j.resources().is_empty() {
                map.insert(
                    Value::String(String::from("resources")),
                    Value::Sequence(j.resources().iter().map(resource_to_value).collect()),
                );
            }
            insert_string_seq(&mut map, "on_done", j.on_done());
            insert_string_seq(&mut map, "on_pass", j.on_pass());
            insert_string_seq(&mut map, "on_fail", j.on_fail());
            ("Job", map)
        }
        SpecNode::Group(g) => {
            let mut map = Mapping::new();
            insert_str(&mut map, "ident", g.ident());
            if let Some(cwd) = g.cwd() {
                insert_str(&mut map, "cwd", &cwd.display().to_string());
            }
            insert_env(&mut map, g.env());
            map.insert(
                Value::String(String::from("jobs")),
                Value::Sequence(g.jobs().iter().map(node_to_value).collect()),
            );
            insert_string_seq(&mut map, "on_done", g.on_done());
            insert_string_seq(&mut map, "on_pass", g.on_pass());
            insert_string_seq(&mut map, "on_fail", g.on_fail());
            ("JobGroup", map)
        }
        SpecNode::Array(a) => {
            let mut map = Mapping::new();
            insert_str(&mut map, "ident", a.ident());
            map.insert(
                Value::String(String::from("repeats")),
                Value::Number(serde_yaml::Number::from(a.repeats() as u64)),
            );
            if let Some(cwd) = a.cwd() {
                insert_str(&mut map, "cwd", &cwd.display().to_string());
            }
            insert_env(&mut map, a.env());
            map.insert(
                Value::String(String::from("jobs")),
                Value::Sequence(a.jobs().iter().map(node_to_value).collect()),
            );
            insert_string_seq(&mut map, "on_done", a.on_done());
            insert_string_seq(&mut map, "on_pass", a.on_pass());
            insert_string_seq(&mut map, "on_fail", a.on_fail());
            ("JobArray", map)
        }
    };

    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(tag),
        value: Value::Mapping(map),
    }))
}

fn resource_to_value(resource: &Resource) -> Value {
    let (tag, mut map) = (
        match resource {
            Resource::Cores { .. } => "Cores",
            Resource::Memory { .. } => "Memory",
            Resource::License { .. } => "License",
        },
        Mapping::new(),
    );

    match resource {
        Resource::Cores { count } => {
            map.insert(
                Value::String(String::from("count")),
                Value::Number(serde_yaml::Number::from(*count as u64)),
            );
        }
        Resource::Memory { size, unit } => {
            map.insert(
                Value::String(String::from("size")),
                Value::Number(serde_yaml::Number::from(*size)),
            );
            map.insert(
                Value::String(String::from("unit")),
                Value::String(unit.to_string()),
            );
        }
        Resource::License { name, count } => {
            map.insert(
                Value::String(String::from("name")),
                Value::String(name.clone()),
            );
            map.insert(
                Value::String(String::from("count")),
                Value::Number(serde_yaml::Number::from(*count as u64)),
            );
        }
    }

    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(tag),
        value: Value::Mapping(map),
    }))
}

fn expect_mapping<'a>(value: &'a Value, what: &str) -> Result<&'a Mapping> {
    match value {
        Value::Mapping(map) => Ok(map),
        other => spec_error(format!("{what} body must be a mapping, found: {other:?}")),
    }
}

fn field<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

fn required_string(map: &Mapping, key: &str) -> Result<String> {
    match field(map, key).and_then(value_as_string) {
        Some(s) => Ok(s),
        None => spec_error(format!("missing or non-string field: {key}")),
    }
}

fn optional_string(map: &Mapping, key: &str) -> Result<Option<String>> {
    match field(map, key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match value_as_string(v) {
            Some(s) => Ok(Some(s)),
            None => spec_error(format!("field {key} is not a string: {v:?}")),
        },
    }
}

fn optional_string_seq(map: &Mapping, key: &str) -> Result<Vec<String>> {
    match field(map, key) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                value_as_string(v)
                    .ok_or_else(|| anyhow::anyhow!("non-string entry in {key}: {v:?}"))
            })
            .collect(),
        Some(other) => spec_error(format!("field {key} must be a sequence: {other:?}")),
    }
}

fn optional_env(map: &Mapping) -> Result<BTreeMap<String, String>> {
    match field(map, "env") {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Mapping(env)) => env
            .iter()
            .map(|(k, v)| {
                let key = value_as_string(k)
                    .ok_or_else(|| anyhow::anyhow!("non-string env key: {k:?}"))?;
                let value = value_as_string(v)
                    .ok_or_else(|| anyhow::anyhow!("non-scalar env value for {key}: {v:?}"))?;
                Ok((key, value))
            })
            .collect(),
        Some(other) => spec_error(format!("env must be a mapping: {other:?}")),
    }
}

/// Scalar-to-string coercion so `env: { RETRIES: 3 }` works as expected
fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn insert_str(map: &mut Mapping, key: &str, value: &str) {
    map.insert(
        Value::String(key.to_string()),
        Value::String(value.to_string()),
    );
}

fn insert_string_seq(map: &mut Mapping, key: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    map.insert(
        Value::String(key.to_string()),
        Value::Sequence(values.iter().cloned().map(Value::String).collect()),
    );
}

fn insert_env(map: &mut Mapping, env: &BTreeMap<String, String>) {
    if env.is_empty() {
        return;
    }
    let mut m = Mapping::new();
    for (k, v) in env {
        m.insert(Value::String(k.clone()), Value::String(v.clone()));
    }
    map.insert(Value::String(String::from("env")), Value::Mapping(m));
}
