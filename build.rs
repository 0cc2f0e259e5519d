use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    watch_git_head();
    println!("cargo:rustc-env=GIT_HASH={}", short_git_hash().unwrap_or_else(|| "unknown".into()));
}

/// Rebuild when HEAD moves, including commits on the checked-out branch
fn watch_git_head() {
    if !Path::new(".git").exists() {
        return;
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    let Ok(head) = std::fs::read_to_string(".git/HEAD") else {
        return;
    };
    if let Some(reference) = head.strip_prefix("ref: ") {
        let path = format!(".git/{}", reference.trim());
        if Path::new(&path).exists() {
            println!("cargo:rerun-if-changed={}", path);
        }
    }
}

fn short_git_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    Some(hash.trim().to_string())
}
