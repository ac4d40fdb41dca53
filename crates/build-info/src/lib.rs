//! Build provenance for the chaincode runner, captured by `build.rs`.

use once_cell::sync::Lazy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub commit: &'static str,
    pub date: &'static str,
    pub profile: &'static str,
}

static INFO: Lazy<BuildInfo> = Lazy::new(|| BuildInfo {
    commit: option_env!("SHIM_BUILD_COMMIT").unwrap_or("unknown"),
    date: option_env!("SHIM_BUILD_DATE").unwrap_or("unknown"),
    profile: option_env!("SHIM_BUILD_PROFILE").unwrap_or("unknown"),
});

static LONG_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{} (commit {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        INFO.commit,
        INFO.date,
        INFO.profile
    )
});

pub fn info() -> &'static BuildInfo {
    &INFO
}

/// Multi-part version string suitable for `--version` output.
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}

/// One-line banner logged when a binary starts.
pub fn banner(package: &str, version: &str) -> String {
    format!("{package} {version} [{} {}]", INFO.commit, INFO.profile)
}
