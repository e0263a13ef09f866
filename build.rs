use std::path::Path;
use std::process::Command;

/// Exposes the short commit hash as `GIT_HASH` for `kernelmesh --version`
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    watch_git_head();

    let hash = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", hash);
}

fn watch_git_head() {
    let head = Path::new(".git/HEAD");
    if !head.exists() {
        return;
    }
    println!("cargo:rerun-if-changed=.git/HEAD");

    // a branch checkout moves the ref file, not HEAD
    if let Some(reference) = std::fs::read_to_string(head)
        .ok()
        .and_then(|content| content.strip_prefix("ref: ").map(|r| r.trim().to_string()))
    {
        let ref_path = Path::new(".git").join(reference);
        if ref_path.exists() {
            println!("cargo:rerun-if-changed={}", ref_path.display());
        }
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
