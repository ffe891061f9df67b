//! Git facts about the application directory.
//!
//! Both lookups are best-effort: a directory that is not a work tree, or a
//! host without `git`, simply yields `None`.

use std::path::Path;
use std::process::Command;

/// Number of hex characters kept from the HEAD commit id.
pub const SHORT_REF_LEN: usize = 12;

/// Short reference of the HEAD commit.
pub fn head_reference(dir: &Path) -> Option<String> {
    let head = git_stdout(dir, &["rev-parse", "HEAD"])?;
    let short: String = head.chars().take(SHORT_REF_LEN).collect();
    (short.len() == SHORT_REF_LEN).then_some(short)
}

/// URL of the `origin` remote.
pub fn origin_url(dir: &Path) -> Option<String> {
    git_stdout(dir, &["remote", "get-url", "origin"])
}

fn git_stdout(dir: &Path, args: &[&str]) -> Option<String> {
    let output = match Command::new("git").args(args).current_dir(dir).output() {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(error = %e, "git is not available");
            return None;
        }
    };

    if !output.status.success() {
        tracing::debug!(
            dir = %dir.display(),
            status = %output.status,
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!stdout.is_empty()).then_some(stdout)
}
