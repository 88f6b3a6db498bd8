//! Embeds git commit and build time for `chatrelay --version`.
//!
//! Missing git tooling degrades to `unknown` rather than failing the build.

use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Some(reference) = head_ref() {
        println!("cargo:rerun-if-changed=.git/{reference}");
    }
    println!("cargo:rerun-if-env-changed=CHATRELAY_BUILD_GIT_HASH");
    println!("cargo:rerun-if-env-changed=CHATRELAY_BUILD_TIMESTAMP");

    let git_hash = env::var("CHATRELAY_BUILD_GIT_HASH").unwrap_or_else(|_| {
        git_output(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "unknown".into())
    });
    let timestamp = env::var("CHATRELAY_BUILD_TIMESTAMP").unwrap_or_else(|_| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|delta| delta.as_secs())
            .unwrap_or(0);
        format!("unix:{secs}")
    });

    println!("cargo:rustc-env=CHATRELAY_BUILD_GIT_HASH={git_hash}");
    println!("cargo:rustc-env=CHATRELAY_BUILD_TIMESTAMP={timestamp}");
}

fn head_ref() -> Option<String> {
    let head = std::fs::read_to_string(".git/HEAD").ok()?;
    head.trim().strip_prefix("ref: ").map(str::to_string)
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
