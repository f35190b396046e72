//! Build script for edge-node
//!
//! Embeds the git revision, build time, target and compiler version so
//! `edge-node version` can report exactly what is running.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match run("git", &["status", "--porcelain"]).as_str() {
        "unknown" => "unknown",
        "" => "false",
        _ => "true",
    };
    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = run("rustc", &["--version"]);

    println!("cargo:rustc-env=EDGE_NODE_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=EDGE_NODE_GIT_BRANCH={}", git_branch);
    println!("cargo:rustc-env=EDGE_NODE_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=EDGE_NODE_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=EDGE_NODE_TARGET={}", target);
    println!("cargo:rustc-env=EDGE_NODE_PROFILE={}", profile);
    println!("cargo:rustc-env=EDGE_NODE_RUSTC_VERSION={}", rustc_version);

    eprintln!("Building edge-node {} ({}, {})", git_hash, target, profile);
}

/// Trimmed stdout of a command, or "unknown" if it could not run.
/// A successful command with no output yields an empty string.
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
