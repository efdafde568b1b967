//! Deterministic resource naming.
//!
//! Provider outputs are looked up by keys built from logical ids, so the ids
//! must be reproducible from the blueprint alone: same names in, same ids out,
//! regardless of input order.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use openlabs_core::DomainError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    /// The exact same name appears twice in one sibling set.
    #[error("duplicate resource name '{0}'")]
    Duplicate(String),

    /// The name has no characters left after normalization.
    #[error("resource name '{0}' normalizes to an empty identifier")]
    Empty(String),
}

impl From<NamingError> for DomainError {
    fn from(err: NamingError) -> Self {
        DomainError::validation(err.to_string())
    }
}

/// Lower-case `name`, collapse each run of characters outside `[a-z0-9-]`
/// into one hyphen, and trim hyphens from both ends.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;

    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            if in_run {
                out.push('-');
                in_run = false;
            }
            out.push(ch);
        } else {
            in_run = true;
        }
    }

    out.trim_matches('-').to_string()
}

/// Map every name of one sibling set to a unique logical id.
///
/// Names are processed in sorted order. The first name to produce a given
/// normalized id keeps it; later collisions get `-1`, `-2`, ... appended.
/// Exact duplicates are rejected: they mean upstream validation was skipped.
pub fn derive_logical_ids<'a, I>(names: I) -> Result<BTreeMap<String, String>, NamingError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = names.into_iter().collect();
    sorted.sort_unstable();

    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(NamingError::Duplicate(pair[0].to_string()));
    }

    let mut taken: HashSet<String> = HashSet::with_capacity(sorted.len());
    let mut ids = BTreeMap::new();

    for name in sorted {
        let base = normalize_name(name);
        if base.is_empty() {
            return Err(NamingError::Empty(name.to_string()));
        }

        let mut candidate = base.clone();
        let mut suffix = 0u32;
        while taken.contains(&candidate) {
            suffix += 1;
            candidate = format!("{base}-{suffix}");
        }

        taken.insert(candidate.clone());
        ids.insert(name.to_string(), candidate);
    }

    Ok(ids)
}

/// Stack identity for one deployment: `<normalized range name>-<deployment id>`.
pub fn stack_name(range_name: &str, deployment_id: &str) -> Result<String, NamingError> {
    let base = normalize_name(range_name);
    if base.is_empty() {
        return Err(NamingError::Empty(range_name.to_string()));
    }
    Ok(format!("{base}-{deployment_id}"))
}
