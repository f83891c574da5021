//! Generated configuration
//!
//! Every file gpuhost touches is rendered from a typed template and written
//! in one of two ways:
//! - a managed block, delimited by `# BEGIN gpuhost:<id>` / `# END gpuhost:<id>`
//!   and replaced in place on re-runs, for files shared with the operator
//! - a whole-file write that only happens when the content differs
//!
//! Either way a diff of the change is logged.

pub mod docker;
pub mod files;

use anyhow::{Context, Result};
use similar::{ChangeTag, TextDiff};
use std::path::Path;
use syscmd::Executor;

/// Where a new managed block goes when the file has none yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Before everything else (first-match configs such as sshd)
    Top,
    /// After everything else
    Bottom,
}

fn begin_marker(id: &str) -> String {
    format!("# BEGIN gpuhost:{id}")
}

fn end_marker(id: &str) -> String {
    format!("# END gpuhost:{id}")
}

/// Line range `[begin, end]` of the block, if both markers are present.
fn find_block(lines: &[&str], id: &str) -> Option<(usize, usize)> {
    let begin = begin_marker(id);
    let end = end_marker(id);
    let start = lines.iter().position(|l| l.trim_end() == begin)?;
    let stop = lines[start..].iter().position(|l| l.trim_end() == end)? + start;
    Some((start, stop))
}

/// Insert or replace the managed block `id` in `existing`.
///
/// The result always ends with a newline. Applying the same block twice is a
/// no-op.
pub fn upsert_block(existing: &str, id: &str, body: &str, placement: Placement) -> String {
    let mut block = vec![begin_marker(id)];
    block.extend(body.lines().map(str::to_string));
    block.push(end_marker(id));

    let lines: Vec<&str> = existing.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + block.len() + 1);
    match find_block(&lines, id) {
        Some((start, stop)) => {
            out.extend(lines[..start].iter().map(|l| (*l).to_string()));
            out.extend(block);
            out.extend(lines[stop + 1..].iter().map(|l| (*l).to_string()));
        }
        None => match placement {
            Placement::Top => {
                out.extend(block);
                if !lines.is_empty() {
                    out.push(String::new());
                }
                out.extend(lines.iter().map(|l| (*l).to_string()));
            }
            Placement::Bottom => {
                out.extend(lines.iter().map(|l| (*l).to_string()));
                if out.last().is_some_and(|l| !l.trim().is_empty()) {
                    out.push(String::new());
                }
                out.extend(block);
            }
        },
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Body of the managed block `id`, without markers.
pub fn block_body(existing: &str, id: &str) -> Option<String> {
    let lines: Vec<&str> = existing.lines().collect();
    let (start, stop) = find_block(&lines, id)?;
    Some(lines[start + 1..stop].join("\n"))
}

/// Line-level diff of `old` against `new`, one `-`/`+` prefixed line per change.
pub fn diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .iter_all_changes()
        .filter_map(|change| match change.tag() {
            ChangeTag::Delete => Some(format!("- {}", change.value().trim_end())),
            ChangeTag::Insert => Some(format!("+ {}", change.value().trim_end())),
            ChangeTag::Equal => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn log_diff(exec: &Executor, path: &Path, old: &str, new: &str) {
    let changes = diff(old, new);
    if exec.is_dry_run() {
        log::info!("Changes to {}:\n{changes}", path.display());
    } else {
        log::debug!("Changes to {}:\n{changes}", path.display());
    }
}

/// Write `content` to `path` unless it already has exactly that content.
///
/// Returns whether a write was issued (or planned, in dry-run).
pub fn write_if_changed(exec: &Executor, path: &Path, content: &str, mode: Option<u32>) -> Result<bool> {
    let existing = exec.read_to_string(path)?;
    if existing.as_deref() == Some(content) {
        log::debug!("{} is up to date", path.display());
        return Ok(false);
    }
    log_diff(exec, path, existing.as_deref().unwrap_or(""), content);
    exec.write_file(path, content, mode)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// Content of `path` after upserting block `id`, and whether it differs.
pub fn render_block(exec: &Executor, path: &Path, id: &str, body: &str, placement: Placement) -> Result<(String, bool)> {
    let existing = exec.read_to_string(path)?.unwrap_or_default();
    let updated = upsert_block(&existing, id, body, placement);
    let changed = updated != existing;
    Ok((updated, changed))
}

/// Upsert block `id` into `path`, writing only when it changes.
pub fn apply_block(exec: &Executor, path: &Path, id: &str, body: &str, placement: Placement, mode: Option<u32>) -> Result<bool> {
    let (updated, changed) = render_block(exec, path, id, body, placement)?;
    if !changed {
        return Ok(false);
    }
    write_if_changed(exec, path, &updated, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syscmd::backend::scripted::ScriptedBackend;

    const SYSCTL: &str = "# /etc/sysctl.conf\n#kernel.printk = 3 4 1 3\n";

    #[test]
    fn test_upsert_appends_then_replaces_in_place() {
        let first = upsert_block(SYSCTL, "sysctl", "vm.swappiness = 10", Placement::Bottom);
        assert_eq!(
            first,
            "# /etc/sysctl.conf\n#kernel.printk = 3 4 1 3\n\n# BEGIN gpuhost:sysctl\nvm.swappiness = 10\n# END gpuhost:sysctl\n"
        );

        let second = upsert_block(&first, "sysctl", "vm.swappiness = 10", Placement::Bottom);
        assert_eq!(second, first);

        let operator_edit = format!("{first}net.core.somaxconn = 4096\n");
        let replaced = upsert_block(&operator_edit, "sysctl", "vm.swappiness = 1", Placement::Bottom);
        assert!(replaced.contains("vm.swappiness = 1\n# END"));
        assert!(replaced.ends_with("net.core.somaxconn = 4096\n"));
        assert_eq!(replaced.matches("# BEGIN gpuhost:sysctl").count(), 1);
    }

    #[test]
    fn test_top_placement_precedes_include() {
        let sshd = "Include /etc/ssh/sshd_config.d/*.conf\nPermitRootLogin yes\n";
        let updated = upsert_block(sshd, "ssh", "PermitRootLogin no", Placement::Top);
        let begin = updated.find("# BEGIN gpuhost:ssh").unwrap();
        let include = updated.find("Include").unwrap();
        assert!(begin < include);
        assert_eq!(block_body(&updated, "ssh").as_deref(), Some("PermitRootLogin no"));
    }

    #[test]
    fn test_blocks_with_different_ids_coexist() {
        let a = upsert_block("", "one", "a = 1", Placement::Bottom);
        let ab = upsert_block(&a, "two", "b = 2", Placement::Bottom);
        assert_eq!(block_body(&ab, "one").as_deref(), Some("a = 1"));
        assert_eq!(block_body(&ab, "two").as_deref(), Some("b = 2"));
    }

    #[test]
    fn test_diff_lists_changed_lines_only() {
        let d = diff("a\nb\nc\n", "a\nB\nc\n");
        assert_eq!(d, "- b\n+ B");
    }

    #[test]
    fn test_write_if_changed_skips_identical_content() {
        let backend = ScriptedBackend::new();
        backend.with_file("/etc/apt/apt.conf.d/20auto-upgrades", "x\n");
        let exec = Executor::new(Box::new(backend.clone()));
        let path = Path::new("/etc/apt/apt.conf.d/20auto-upgrades");

        assert!(!write_if_changed(&exec, path, "x\n", None).unwrap());
        assert!(backend.mutations().is_empty());

        assert!(write_if_changed(&exec, path, "y\n", None).unwrap());
        assert_eq!(backend.file(path).as_deref(), Some("y\n"));
    }

    #[test]
    fn test_apply_block_is_idempotent() {
        let backend = ScriptedBackend::new();
        let exec = Executor::new(Box::new(backend.clone()));
        let path = Path::new("/etc/security/limits.conf");

        assert!(apply_block(&exec, path, "limits", "* soft nofile 1048576", Placement::Bottom, None).unwrap());
        backend.clear_calls();
        assert!(!apply_block(&exec, path, "limits", "* soft nofile 1048576", Placement::Bottom, None).unwrap());
        assert!(backend.mutations().is_empty());
    }
}
