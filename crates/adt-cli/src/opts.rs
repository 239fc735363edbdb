//! Command-line options and how they fold into the testbed configuration.

use std::fs;
use std::path::{Path, PathBuf};

use adt_testbed::{CopyFile, ExecKind, NetworkPolicy, RunOptions, RunTestOptions, TestbedConfig};
use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetPolicy {
    /// Run needs-internet tests and report failures normally
    Run,
    /// Run them, turning failures into skips
    Try,
    /// Skip them
    Skip,
}

impl From<InternetPolicy> for NetworkPolicy {
    fn from(policy: InternetPolicy) -> Self {
        match policy {
            InternetPolicy::Run => NetworkPolicy::Run,
            InternetPolicy::Try => NetworkPolicy::Try,
            InternetPolicy::Skip => NetworkPolicy::Skip,
        }
    }
}

/// Testbed setup options. Values given here override the `--config` file.
#[derive(Args, Debug, Clone, Default)]
pub struct TestbedOpts {
    /// JSON file with a testbed configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for logs, test outputs and the run summary
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Run tests as this user (created on the testbed when needed)
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Shell command, or a file containing one, run once after opening
    #[arg(long = "setup-commands", value_name = "CMD")]
    pub setup_commands: Vec<String>,

    /// Shell command, or a file containing one, run after every boot
    #[arg(long = "setup-commands-boot", value_name = "CMD")]
    pub setup_commands_boot: Vec<String>,

    /// Enable a pocket such as `proposed`, optionally `pocket=pkg1,pkg2`
    #[arg(long = "apt-pocket", value_name = "POCKET")]
    pub apt_pockets: Vec<String>,

    /// Extra apt source line
    #[arg(long = "add-apt-source", value_name = "LINE")]
    pub add_apt_sources: Vec<String>,

    /// Extra release, added with the mirror of the default release
    #[arg(long = "add-apt-release", value_name = "RELEASE")]
    pub add_apt_releases: Vec<String>,

    /// Release used for apt's default release and for pinning
    #[arg(long)]
    pub apt_default_release: Option<String>,

    /// Pin `release=pkg1,src:pkg2` to the given release
    #[arg(long = "pin-packages", value_name = "RELEASE=PKGS")]
    pub pin_packages: Vec<String>,

    /// Copy a host file or directory into the testbed after opening
    #[arg(long = "copy", value_name = "HOST:TESTBED")]
    pub copy: Vec<String>,

    /// Do not retry failed installs without release pins
    #[arg(long)]
    pub no_apt_fallback: bool,

    /// Open a shell on the testbed when setup or a test fails
    #[arg(long)]
    pub shell_fail: bool,

    /// Policy for tests that need internet access
    #[arg(long, value_enum)]
    pub needs_internet: Option<InternetPolicy>,

    /// Timeout for short commands, in seconds (env: ADT_TIMEOUT_SHORT)
    #[arg(long, value_name = "SECS", env = "ADT_TIMEOUT_SHORT")]
    pub timeout_short: Option<u64>,

    /// Timeout for copies, in seconds (env: ADT_TIMEOUT_COPY)
    #[arg(long, value_name = "SECS", env = "ADT_TIMEOUT_COPY")]
    pub timeout_copy: Option<u64>,

    /// Timeout for installs, in seconds (env: ADT_TIMEOUT_INSTALL)
    #[arg(long, value_name = "SECS", env = "ADT_TIMEOUT_INSTALL")]
    pub timeout_install: Option<u64>,

    /// Timeout for a test, in seconds (env: ADT_TIMEOUT_TEST)
    #[arg(long, value_name = "SECS", env = "ADT_TIMEOUT_TEST")]
    pub timeout_test: Option<u64>,

    /// Timeout for builds, in seconds (env: ADT_TIMEOUT_BUILD)
    #[arg(long, value_name = "SECS", env = "ADT_TIMEOUT_BUILD")]
    pub timeout_build: Option<u64>,
}

impl TestbedOpts {
    /// Config file first, then these options on top.
    pub fn load_config(&self, virt_server: &[String]) -> Result<TestbedConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                serde_json::from_str::<TestbedConfig>(&text)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => TestbedConfig::default(),
        };

        if !virt_server.is_empty() {
            config.virt_server = virt_server.to_vec();
        }
        if config.virt_server.is_empty() {
            bail!("no virt-server given; append it after `--`");
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        for command in &self.setup_commands {
            config.setup_commands.push(command_or_file(command)?);
        }
        for command in &self.setup_commands_boot {
            config.setup_commands_boot.push(command_or_file(command)?);
        }
        config.add_apt_pockets.extend(self.apt_pockets.iter().cloned());
        config.add_apt_sources.extend(self.add_apt_sources.iter().cloned());
        config.add_apt_releases.extend(self.add_apt_releases.iter().cloned());
        if let Some(release) = &self.apt_default_release {
            config.apt_default_release = Some(release.clone());
        }
        config.pin_packages.extend(self.pin_packages.iter().cloned());
        for spec in &self.copy {
            config.copy_files.push(parse_copy(spec)?);
        }
        if self.no_apt_fallback {
            config.enable_apt_fallback = false;
        }
        if self.shell_fail {
            config.shell_fail = true;
        }
        if let Some(policy) = self.needs_internet {
            config.needs_internet = policy.into();
        }

        let timeouts = [
            (ExecKind::Short, self.timeout_short),
            (ExecKind::Copy, self.timeout_copy),
            (ExecKind::Install, self.timeout_install),
            (ExecKind::Test, self.timeout_test),
            (ExecKind::Build, self.timeout_build),
        ];
        for (kind, secs) in timeouts {
            if let Some(secs) = secs {
                config.timeouts.set(kind, secs);
            }
        }
        Ok(config)
    }
}

/// Options for running the tests themselves.
#[derive(Args, Debug, Clone, Default)]
pub struct TestOpts {
    /// Treat these restrictions as satisfied (comma separated)
    #[arg(long, value_delimiter = ',', value_name = "RESTRICTION")]
    pub ignore_restrictions: Vec<String>,

    /// Extra `VAR=value` for the test environment
    #[arg(long = "env", value_name = "VAR=VALUE")]
    pub env: Vec<String>,

    /// Open a shell on the testbed after every test
    #[arg(long)]
    pub shell: bool,

    /// Value of DEB_BUILD_OPTIONS parallel=, default the testbed's CPU count
    #[arg(long, value_name = "N")]
    pub build_parallel: Option<String>,
}

impl TestOpts {
    pub fn run_options(&self, shell_fail: bool) -> Result<RunOptions> {
        for assignment in &self.env {
            if !assignment.contains('=') {
                bail!("--env expects VAR=value, got {assignment:?}");
            }
        }
        Ok(RunOptions {
            ignore_restrictions: self.ignore_restrictions.clone(),
            test: RunTestOptions {
                extra_env: self.env.clone(),
                shell_on_failure: shell_fail,
                shell: self.shell,
                build_parallel: self.build_parallel.clone(),
            },
        })
    }
}

/// An existing file stands for its contents.
fn command_or_file(value: &str) -> Result<String> {
    let path = Path::new(value);
    if path.is_file() {
        return fs::read_to_string(path)
            .map(|text| text.trim().to_string())
            .with_context(|| format!("read setup commands {}", path.display()));
    }
    Ok(value.to_string())
}

fn parse_copy(spec: &str) -> Result<CopyFile> {
    match spec.split_once(':') {
        Some((host, testbed)) if !host.is_empty() && testbed.starts_with('/') => Ok(CopyFile {
            host: PathBuf::from(host),
            testbed: testbed.to_string(),
        }),
        _ => bail!("--copy expects HOST:TESTBED with an absolute testbed path, got {spec:?}"),
    }
}
