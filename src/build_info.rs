//! Compile-time build metadata for `--version` and the chat banner.

/// Semver package version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VCS commit hash captured at build time.
pub const GIT_COMMIT: &str = env!("CHATRELAY_BUILD_GIT_HASH");

/// Build timestamp captured at compile time.
pub const BUILD_TIMESTAMP: &str = env!("CHATRELAY_BUILD_TIMESTAMP");

/// Version string handed to clap (`chatrelay --version`).
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("CHATRELAY_BUILD_GIT_HASH"),
    "\nbuilt: ",
    env!("CHATRELAY_BUILD_TIMESTAMP")
);

/// One-line banner shown when the chat loop starts.
pub fn banner_line() -> String {
    format!("chatrelay v{VERSION} ({GIT_COMMIT}, built {BUILD_TIMESTAMP})")
}
