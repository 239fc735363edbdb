use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::exec::ExecKind;

/// What to do with tests that declare `needs-internet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Run them and report failures normally.
    #[default]
    Run,
    /// Run them, but turn failures into skips.
    Try,
    /// Never run them.
    Skip,
}

/// Per-kind command timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub short: u64,
    pub copy: u64,
    pub install: u64,
    pub test: u64,
    pub build: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            short: 100,
            copy: 300,
            install: 3_000,
            test: 10_000,
            build: 100_000,
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: ExecKind) -> Duration {
        let secs = match kind {
            ExecKind::Short => self.short,
            ExecKind::Copy => self.copy,
            ExecKind::Install => self.install,
            ExecKind::Test => self.test,
            ExecKind::Build => self.build,
        };
        Duration::from_secs(secs)
    }

    pub fn set(&mut self, kind: ExecKind, secs: u64) {
        match kind {
            ExecKind::Short => self.short = secs,
            ExecKind::Copy => self.copy = secs,
            ExecKind::Install => self.install = secs,
            ExecKind::Test => self.test = secs,
            ExecKind::Build => self.build = secs,
        }
    }
}

/// A host file or directory copied into every freshly opened testbed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyFile {
    pub host: PathBuf,
    pub testbed: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    /// argv of the virt-server child.
    pub virt_server: Vec<String>,
    pub output_dir: Option<PathBuf>,
    /// Unprivileged user for tests; created on the testbed when missing.
    pub user: Option<String>,
    pub setup_commands: Vec<String>,
    pub setup_commands_boot: Vec<String>,
    /// Pockets such as `proposed`, optionally `pocket=pkg1,pkg2`.
    pub add_apt_pockets: Vec<String>,
    pub add_apt_sources: Vec<String>,
    pub add_apt_releases: Vec<String>,
    pub apt_default_release: Option<String>,
    /// `release=pkg1,pkg2` entries, `src:name` expands to the source's binaries.
    pub pin_packages: Vec<String>,
    pub copy_files: Vec<CopyFile>,
    /// Retry dependency installation without release pins.
    pub enable_apt_fallback: bool,
    pub shell_fail: bool,
    pub needs_internet: NetworkPolicy,
    pub timeouts: Timeouts,
    pub apt_retry_delay_secs: u64,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            virt_server: Vec::new(),
            output_dir: None,
            user: None,
            setup_commands: Vec::new(),
            setup_commands_boot: Vec::new(),
            add_apt_pockets: Vec::new(),
            add_apt_sources: Vec::new(),
            add_apt_releases: Vec::new(),
            apt_default_release: None,
            pin_packages: Vec::new(),
            copy_files: Vec::new(),
            enable_apt_fallback: true,
            shell_fail: false,
            needs_internet: NetworkPolicy::Run,
            timeouts: Timeouts::default(),
            apt_retry_delay_secs: 10,
        }
    }
}

impl TestbedConfig {
    pub fn apt_retry_delay(&self) -> Duration {
        Duration::from_secs(self.apt_retry_delay_secs)
    }
}
