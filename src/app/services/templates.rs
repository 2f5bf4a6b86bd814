// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, BTreeSet};

use crate::app::errors::{invalid_argument, LaunchResult};

/// Collects every `${TOKEN}` placeholder in a template. A token is an
/// uppercase identifier: `[A-Z][A-Z0-9_]*` directly between `${` and `}`.
/// Anything else after `${` (shell parameter expansions like `${var:-x}`)
/// is left alone, so templates can still contain ordinary shell.
pub fn collect_tokens(template: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] != b'$' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }
        let start = i + 2;
        let mut end = start;
        while end < bytes.len()
            && (bytes[end].is_ascii_uppercase()
                || bytes[end] == b'_'
                || (end > start && bytes[end].is_ascii_digit()))
        {
            end += 1;
        }
        if end > start && end < bytes.len() && bytes[end] == b'}' && bytes[start].is_ascii_uppercase()
        {
            tokens.insert(template[start..end].to_string());
            i = end + 1;
        } else {
            i += 2;
        }
    }
    tokens
}

/// Substitutes every `${TOKEN}` in the template with its value. The key set
/// of `values` must equal the token set of the template exactly; a missing
/// or surplus key fails before anything is rendered, so a drifted template
/// can never reach the remote side half-filled.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> LaunchResult<String> {
    let tokens = collect_tokens(template);
    let keys: BTreeSet<String> = values.keys().cloned().collect();
    let missing: Vec<&String> = tokens.difference(&keys).collect();
    if !missing.is_empty() {
        return Err(invalid_argument(format!(
            "template tokens without a value: {missing:?}"
        )));
    }
    let surplus: Vec<&String> = keys.difference(&tokens).collect();
    if !surplus.is_empty() {
        return Err(invalid_argument(format!(
            "values without a template token: {surplus:?}"
        )));
    }

    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    Ok(out)
}
