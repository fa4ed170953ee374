//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Periodic CPU and RSS sampling of the supervised process tree

use std::collections::HashMap;

use log::trace;
use sysinfo::Pid;
use sysinfo::PidExt;
use sysinfo::ProcessExt;
use sysinfo::System;
use sysinfo::SystemExt;

use crate::store::ResourceSample;
use crate::util::now_ts;

pub struct ResourceSampler {
    sys: System,
    root: Pid,
    descendants: bool,
}

impl ResourceSampler {
    pub fn new(pid: u32, descendants: bool) -> Self {
        ResourceSampler {
            sys: System::new(),
            root: Pid::from_u32(pid),
            descendants,
        }
    }

    /// Take one sample, or None once the root process is gone
    ///
    /// CPU usage is the percentage since the previous call, so the first
    /// sample of a run reads as zero.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        self.sys.refresh_processes();
        self.sys.process(self.root)?;

        let members = if self.descendants {
            self.process_tree()
        } else {
            vec![self.root]
        };

        let mut cpu_percent = 0.0_f64;
        let mut rss_bytes = 0_u64;
        for pid in members {
            if let Some(process) = self.sys.process(pid) {
                cpu_percent += process.cpu_usage() as f64;
                rss_bytes += process.memory();
            }
        }

        let sample = ResourceSample {
            timestamp: now_ts(),
            cpu_percent,
            rss_bytes,
        };
        trace!("Resource sample: {sample:?}");
        Some(sample)
    }

    /// The root process plus everything transitively parented by it
    fn process_tree(&self) -> Vec<Pid> {
        let parents: HashMap<Pid, Pid> = self
            .sys
            .processes()
            .iter()
            .filter_map(|(pid, process)| process.parent().map(|parent| (*pid, parent)))
            .collect();

        self.sys
            .processes()
            .keys()
            .copied()
            .filter(|pid| self.descends_from_root(*pid, &parents))
            .collect()
    }

    fn descends_from_root(&self, mut pid: Pid, parents: &HashMap<Pid, Pid>) -> bool {
        // Bounded walk in case the snapshot contains a parent loop.
        for _ in 0..128 {
            if pid == self.root {
                return true;
            }
            match parents.get(&pid) {
                Some(parent) => pid = *parent,
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_own_process() {
        let mut sampler = ResourceSampler::new(std::process::id(), false);
        let sample = sampler.sample().expect("own process must be samplable");
        assert!(sample.rss_bytes > 0);
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn test_sampling_dead_pid_yields_none() {
        // Pid max on Linux is bounded well below u32::MAX; this one cannot
        // exist.
        let mut sampler = ResourceSampler::new(u32::MAX - 1, true);
        assert!(sampler.sample().is_none());
    }
}
