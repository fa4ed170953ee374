//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The declarative description of the work to run
//!
//! A spec is a tree of tagged nodes (`!Job`, `!JobGroup`, `!JobArray`).
//! Interior nodes are supervised by a tier, leaves by a wrapper.

use std::fmt;

mod node;
mod parser;

pub use node::Job;
pub use node::JobArray;
pub use node::JobGroup;
pub use node::MemoryUnit;
pub use node::Resource;
pub use node::ResourceSummary;
pub use node::SpecNode;
pub use parser::node_from_value;
pub use parser::node_to_value;
pub use parser::parse_str;
pub use parser::to_yaml_string;

/// Marker error for everything that makes a spec unusable (malformed tag,
/// duplicate ident, unknown dependency name, cycle, zero repeats).
///
/// The binary maps this to exit code 3.
#[derive(Debug)]
pub struct SpecError(pub String);

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spec error: {}", self.0)
    }
}

impl std::error::Error for SpecError {}

pub fn spec_error<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(anyhow::Error::new(SpecError(msg.into())))
}
