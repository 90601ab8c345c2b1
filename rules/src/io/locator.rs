//! Discovery of rule source files.

use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::types::RuleSource;
use crate::error::{Result, RulesError};

/// Read every file under `dir` whose name matches `pattern`.
///
/// Identifiers are paths relative to `dir` with `/` separators, and the
/// result is sorted by identifier so later rules deterministically observe
/// the mutations of earlier ones.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn locate_rules(dir: &Path, pattern: &Regex) -> Result<Vec<RuleSource>> {
    if !dir.exists() {
        return Err(RulesError::NotFound {
            path: dir.to_path_buf(),
        });
    }
    if !dir.is_dir() {
        return Err(RulesError::configuration(format!(
            "expected directory {}",
            dir.display()
        )));
    }

    let mut sources = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|err| {
            RulesError::configuration(format!("cannot list {}: {err}", dir.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !pattern.is_match(&file_name) {
            debug!(file = %entry.path().display(), "skipping non-rule file");
            continue;
        }
        let identifier = identifier_for(dir, entry.path());
        let source_text =
            fs::read_to_string(entry.path()).map_err(|source| RulesError::UnreadableSource {
                identifier: identifier.clone(),
                source,
            })?;
        sources.push(RuleSource {
            identifier,
            source_text,
        });
    }

    sources.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    debug!(count = sources.len(), "located rule sources");
    Ok(sources)
}

fn identifier_for(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
