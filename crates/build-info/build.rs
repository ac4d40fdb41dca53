use std::env;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=SHIM_BUILD_COMMIT_OVERRIDE");
    for watched in [".git/HEAD", ".git/index"] {
        if Path::new(watched).exists() {
            println!("cargo:rerun-if-changed={watched}");
        }
    }

    let commit = env::var("SHIM_BUILD_COMMIT_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(short_commit)
        .unwrap_or_else(|| "unknown".to_string());
    let commit = if worktree_dirty() {
        format!("{commit}-dirty")
    } else {
        commit
    };
    let date = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=SHIM_BUILD_COMMIT={commit}");
    println!("cargo:rustc-env=SHIM_BUILD_DATE={date}");
    println!("cargo:rustc-env=SHIM_BUILD_PROFILE={profile}");
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn short_commit() -> Option<String> {
    git(&["rev-parse", "--short=10", "HEAD"]).filter(|sha| !sha.is_empty())
}

fn worktree_dirty() -> bool {
    git(&["status", "--porcelain", "--untracked-files=no"]).is_some_and(|status| !status.is_empty())
}
