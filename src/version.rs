//! Build information embedded by build.rs

use std::fmt;

/// Compile-time facts about this binary
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short git revision, "unknown" outside a checkout
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("EDGE_NODE_GIT_HASH"),
            git_branch: env!("EDGE_NODE_GIT_BRANCH"),
            git_dirty: env!("EDGE_NODE_GIT_DIRTY"),
            build_timestamp: env!("EDGE_NODE_BUILD_TIMESTAMP"),
            target: env!("EDGE_NODE_TARGET"),
            profile: env!("EDGE_NODE_PROFILE"),
            rustc_version: env!("EDGE_NODE_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version plus revision, e.g. "0.1.0-1a2b3c4d" or "0.1.0-1a2b3c4d-dirty"
    pub fn full_version(&self) -> String {
        if self.git_dirty() {
            format!("{}-{}-dirty", self.version, self.git_hash)
        } else {
            format!("{}-{}", self.version, self.git_hash)
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Version:  {}", self.version)?;
        writeln!(
            f,
            "  Git Hash: {}{}",
            self.git_hash,
            if self.git_dirty() { " (dirty)" } else { "" }
        )?;
        writeln!(f, "  Branch:   {}", self.git_branch)?;
        writeln!(f, "  Built:    {}", self.build_timestamp)?;
        writeln!(f, "  Profile:  {}", self.profile)?;
        writeln!(f, "  Target:   {}", self.target)?;
        writeln!(f, "  Compiler: {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

pub fn print_version() {
    print!("{}", build_info());
}
