//! Git operations for tpub.
//!
//! Collects the file-level change list between a base revision and the
//! working tree, in the `ChangeRecord` shape the affected-package calculator
//! consumes.
//!
//! # Example
//!
//! ```
//! use tpub_git::parse_name_status;
//! use tpub_types::ChangeStatus;
//!
//! let text = "M\ttypes/jquery/index.d.ts\nR100\ttypes/a/x.ts\ttypes/b/x.ts\n";
//! let records = parse_name_status(text).expect("parse");
//! assert_eq!(records.len(), 3);
//! assert_eq!(records[1].status, ChangeStatus::Deleted);
//! ```

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tpub_types::{ChangeRecord, ChangeStatus};

/// Check if we're inside a git repository
pub fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Changes between `base` and the working tree of the repository at `repo`.
pub fn diff_name_status(repo: &Path, base: &str) -> Result<Vec<ChangeRecord>> {
    let output = Command::new("git")
        .args(["-c", "core.quotePath=false", "diff", "--name-status", "--no-color", base, "--"])
        .current_dir(repo)
        .output()
        .with_context(|| format!("failed to run git diff in {}", repo.display()))?;

    if !output.status.success() {
        bail!(
            "git diff --name-status {base} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8(output.stdout).context("git diff output is not UTF-8")?;
    parse_name_status(&stdout)
}

/// Parse `git diff --name-status` output.
///
/// Renames become a delete of the old path plus an add of the new one; copies
/// only add the new path; type changes count as modifications. Blank lines are
/// ignored. Paths are normalised to `/` separators and must be relative
/// without `..` components.
pub fn parse_name_status(output: &str) -> Result<Vec<ChangeRecord>> {
    let mut records = Vec::new();

    for (index, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let mut fields = line.split('\t');
        let status = fields.next().unwrap_or_default();
        let paths: Vec<&str> = fields.collect();

        let kind = status.chars().next().unwrap_or(' ');
        match (kind, paths.as_slice()) {
            ('A', [file]) => records.push(record(ChangeStatus::Added, file, line_no)?),
            ('D', [file]) => records.push(record(ChangeStatus::Deleted, file, line_no)?),
            ('M' | 'T', [file]) => records.push(record(ChangeStatus::Modified, file, line_no)?),
            ('R', [from, to]) => {
                records.push(record(ChangeStatus::Deleted, from, line_no)?);
                records.push(record(ChangeStatus::Added, to, line_no)?);
            }
            ('C', [_, to]) => records.push(record(ChangeStatus::Added, to, line_no)?),
            _ => bail!("line {line_no}: unsupported name-status entry: {line:?}"),
        }
    }

    Ok(records)
}

fn record(status: ChangeStatus, file: &str, line_no: usize) -> Result<ChangeRecord> {
    let normalized = file.replace('\\', "/");
    if normalized.is_empty()
        || normalized.starts_with('/')
        || normalized.split('/').any(|part| part == "..")
    {
        bail!("line {line_no}: path must be relative without '..': {file:?}");
    }
    Ok(ChangeRecord::new(status, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
    }

    fn init_git_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test User"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
    }

    fn have_git() -> bool {
        which::which("git").is_ok()
    }

    #[test]
    fn parses_basic_statuses() {
        let text = concat!(
            "A\ttypes/a/index.d.ts\n",
            "D\ttypes/b/index.d.ts\n",
            "M\ttypes/c/v2/index.d.ts\n",
            "T\ttypes/d/link\n",
        );
        let records = parse_name_status(text).expect("parse");
        assert_eq!(
            records,
            vec![
                ChangeRecord::new(ChangeStatus::Added, "types/a/index.d.ts"),
                ChangeRecord::new(ChangeStatus::Deleted, "types/b/index.d.ts"),
                ChangeRecord::new(ChangeStatus::Modified, "types/c/v2/index.d.ts"),
                ChangeRecord::new(ChangeStatus::Modified, "types/d/link"),
            ]
        );
    }

    #[test]
    fn rename_and_copy() {
        let text = "R087\ttypes/old/a.ts\ttypes/new/a.ts\nC100\ttypes/x/a.ts\ttypes/y/a.ts\n";
        let records = parse_name_status(text).expect("parse");
        assert_eq!(
            records,
            vec![
                ChangeRecord::new(ChangeStatus::Deleted, "types/old/a.ts"),
                ChangeRecord::new(ChangeStatus::Added, "types/new/a.ts"),
                ChangeRecord::new(ChangeStatus::Added, "types/y/a.ts"),
            ]
        );
    }

    #[test]
    fn normalises_backslashes_and_skips_blank_lines() {
        let records = parse_name_status("\nM\ttypes\\a\\index.d.ts\n\n").expect("parse");
        assert_eq!(records, vec![ChangeRecord::new(ChangeStatus::Modified, "types/a/index.d.ts")]);
    }

    #[test]
    fn rejects_unknown_status_and_bad_paths() {
        let err = parse_name_status("M\ta\nU\tconflicted\n").unwrap_err();
        assert!(err.to_string().starts_with("line 2"));

        assert!(parse_name_status("M\t../outside\n").is_err());
        assert!(parse_name_status("M\t/abs/path\n").is_err());
        assert!(parse_name_status("R100\tonly-one-path\n").is_err());
        assert!(parse_name_status("M\n").is_err());
    }

    #[test]
    fn is_git_repo_returns_false_for_non_repo() {
        let td = tempdir().expect("tempdir");
        assert!(!is_git_repo(td.path()));
    }

    #[test]
    fn diff_against_head_reports_working_tree_changes() {
        if !have_git() {
            return;
        }
        let td = tempdir().expect("tempdir");
        let root = td.path();
        init_git_repo(root);
        assert!(is_git_repo(root));

        fs::create_dir_all(root.join("types/a")).expect("mkdir");
        fs::create_dir_all(root.join("types/b")).expect("mkdir");
        fs::write(root.join("types/a/index.d.ts"), "a").expect("write");
        fs::write(root.join("types/b/index.d.ts"), "b").expect("write");
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "base"]);

        fs::write(root.join("types/a/index.d.ts"), "a2").expect("write");
        fs::remove_file(root.join("types/b/index.d.ts")).expect("remove");

        let records = diff_name_status(root, "HEAD").expect("diff");
        assert_eq!(
            records,
            vec![
                ChangeRecord::new(ChangeStatus::Modified, "types/a/index.d.ts"),
                ChangeRecord::new(ChangeStatus::Deleted, "types/b/index.d.ts"),
            ]
        );
    }

    #[test]
    fn diff_with_unknown_revision_fails() {
        if !have_git() {
            return;
        }
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let err = diff_name_status(td.path(), "no-such-rev").unwrap_err();
        assert!(err.to_string().contains("no-such-rev"));
    }

    proptest! {
        #[test]
        fn every_valid_line_yields_a_record(
            names in proptest::collection::vec("[a-z]{1,8}/[a-z]{1,8}\\.ts", 1..10),
        ) {
            let text: String = names.iter().map(|n| format!("M\t{n}\n")).collect();
            let records = parse_name_status(&text).unwrap();
            prop_assert_eq!(records.len(), names.len());
            for (record, name) in records.iter().zip(&names) {
                prop_assert_eq!(&record.file, name);
            }
        }
    }
}
