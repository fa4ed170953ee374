//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use lazy_static::lazy_static;
use regex::Captures;
use regex::Regex;

/// Unix seconds, the timestamp granularity of the whole protocol
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

lazy_static! {
    static ref ENV_REF: Regex =
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .unwrap();
}

/// Expand `$NAME` / `${NAME}` references against the effective environment
///
/// Expansion happens at job-launch time, not at parse time, so injected
/// variables like the array index resolve per expansion. References that
/// do not resolve are left verbatim.
pub fn expand_env_refs<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_REF
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("");
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_both_reference_forms_expand() {
        let env = env(&[("GATOR_ARRAY_INDEX", "2"), ("HOME", "/home/u")]);
        let lookup = |name: &str| env.get(name).cloned();

        assert_eq!(expand_env_refs("idx=$GATOR_ARRAY_INDEX", lookup), "idx=2");
        assert_eq!(expand_env_refs("${HOME}/data", lookup), "/home/u/data");
    }

    #[test]
    fn test_unresolved_references_stay_verbatim() {
        let lookup = |_: &str| None;
        assert_eq!(expand_env_refs("$MISSING stays", lookup), "$MISSING stays");
        assert_eq!(expand_env_refs("${ALSO_GONE}", lookup), "${ALSO_GONE}");
    }

    #[test]
    fn test_literal_dollar_without_name_untouched() {
        let lookup = |_: &str| Some(String::from("x"));
        assert_eq!(expand_env_refs("cost: 5$", lookup), "cost: 5$");
    }
}
