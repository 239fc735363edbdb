//! Testbed lifecycle: the virt-server child, capability negotiation and the
//! open / reset / reboot / close state machine.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use adt_protocol::{Capabilities, Capability, Transport, Verb};
use regex::Regex;
use serde::Serialize;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::{NetworkPolicy, TestbedConfig};
use crate::deps::grammar::{DebianDepResolver, DepResolver};
use crate::exec::{CommandRunner, ExecKind, ExecOptions, ExecOutput, ProcessRunner, RunOutcome, RunSpec, Stream};
use crate::resource::{DirKind, ResourcePath, TempResource};
use crate::{packages, scripts};
use crate::testdesc::Restriction;
use crate::{Result, TestbedError};

const INSTALL_ENV: [&str; 3] = [
    "DEBIAN_FRONTEND=noninteractive",
    "APT_LISTBUGS_FRONTEND=none",
    "APT_LISTCHANGES_FRONTEND=none",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestbedState {
    Unstarted,
    Started,
    Open,
    Closed,
    Stopped,
}

/// Kernel seen after a reboot that differs from the one at first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelVersionChange {
    pub test: String,
    pub reboot_marker: String,
    pub kernel_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub nproc: String,
    pub model: Option<String>,
    pub flags: Option<String>,
}

impl CpuInfo {
    pub fn parse(output: &str) -> Self {
        static MODEL: OnceLock<Option<Regex>> = OnceLock::new();
        static FLAGS: OnceLock<Option<Regex>> = OnceLock::new();
        let model = MODEL.get_or_init(|| Regex::new(r"(?mi)^(model.*name|cpu)\s*:\s*(.*)$").ok());
        let flags = FLAGS.get_or_init(|| Regex::new(r"(?mi)^(flags|features)\s*:\s*(.*)$").ok());
        let capture = |re: &Option<Regex>| {
            re.as_ref()
                .and_then(|re| re.captures(output))
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().trim_end().to_string())
        };
        Self {
            nproc: output.lines().next().unwrap_or("").trim().to_string(),
            model: capture(model),
            flags: capture(flags),
        }
    }
}

pub struct Testbed {
    pub(crate) config: TestbedConfig,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) resolver: Arc<dyn DepResolver>,
    transport: Option<Transport>,
    child: Option<Child>,
    state: TestbedState,
    scratch: Option<String>,
    caps: Capabilities,
    exec_cmd: Vec<String>,
    user: Option<String>,
    created_user: bool,
    pub(crate) modified: bool,
    pub(crate) deps_installed: Vec<String>,
    pub(crate) dpkg_arch: String,
    pub(crate) eatmydata_prefix: Option<String>,
    /// Releases pinned during setup, most recent last.
    pub(crate) apt_pin_for_releases: Vec<String>,
    pub(crate) default_release: Option<String>,
    shared_downtmp: Option<PathBuf>,
    initial_kernel_version: Option<String>,
    kernel_versions: Vec<KernelVersionChange>,
    pub(crate) last_test_name: String,
    pub(crate) last_reboot_marker: String,
    cpu: Option<CpuInfo>,
    provided_sudo: Option<std::result::Result<(), String>>,
    stop_sent: bool,
    temp_counter: u64,
    host_tmp: TempDir,
}

impl Testbed {
    pub fn new(config: TestbedConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(ProcessRunner), Arc::new(DebianDepResolver::default()))
    }

    pub fn with_parts(
        config: TestbedConfig,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn DepResolver>,
    ) -> Result<Self> {
        let host_tmp = tempfile::Builder::new()
            .prefix("adt-run.")
            .tempdir()
            .map_err(|e| TestbedError::io(std::env::temp_dir(), e))?;
        let helpers = host_tmp.path().join("helpers");
        scripts::write_all(&helpers).map_err(|e| TestbedError::io(&helpers, e))?;
        debug!("testbed init");
        Ok(Self {
            default_release: config.apt_default_release.clone(),
            user: config.user.clone(),
            config,
            runner,
            resolver,
            transport: None,
            child: None,
            state: TestbedState::Unstarted,
            scratch: None,
            caps: Capabilities::default(),
            exec_cmd: Vec::new(),
            created_user: false,
            modified: false,
            deps_installed: Vec::new(),
            dpkg_arch: String::new(),
            eatmydata_prefix: None,
            apt_pin_for_releases: Vec::new(),
            shared_downtmp: None,
            initial_kernel_version: None,
            kernel_versions: Vec::new(),
            last_test_name: String::new(),
            last_reboot_marker: String::new(),
            cpu: None,
            provided_sudo: None,
            stop_sent: false,
            temp_counter: 0,
            host_tmp,
        })
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    pub fn state(&self) -> TestbedState {
        self.state
    }

    pub fn scratch(&self) -> Option<&str> {
        self.scratch.as_deref()
    }

    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub fn has_cap(&self, cap: Capability) -> bool {
        self.caps.has(cap)
    }

    pub fn exec_command(&self) -> &[String] {
        &self.exec_cmd
    }

    /// Non-root user tests run as, when there is one.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref().filter(|u| !u.is_empty())
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn installed_deps(&self) -> &[String] {
        &self.deps_installed
    }

    pub fn dpkg_arch(&self) -> &str {
        &self.dpkg_arch
    }

    pub fn initial_kernel_version(&self) -> Option<&str> {
        self.initial_kernel_version.as_deref()
    }

    pub fn kernel_versions(&self) -> &[KernelVersionChange] {
        &self.kernel_versions
    }

    pub fn cpu(&self) -> Option<&CpuInfo> {
        self.cpu.as_ref()
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.config.output_dir.as_deref()
    }

    pub(crate) fn next_temp_id(&mut self) -> u64 {
        self.temp_counter += 1;
        self.temp_counter
    }

    /// Host directory backing a temporary resource.
    ///
    /// A shared download dir avoids copies, unless the file has to be kept in
    /// the output directory.
    pub(crate) fn temp_host_base(&self, auto_clean: bool) -> PathBuf {
        match (&self.shared_downtmp, &self.config.output_dir) {
            (Some(shared), None) => shared.clone(),
            (Some(shared), Some(_)) if auto_clean => shared.clone(),
            (_, Some(output_dir)) => output_dir.clone(),
            (None, None) => self.host_tmp.path().to_path_buf(),
        }
    }

    fn helper_host_path(&self, helper: &scripts::Helper) -> PathBuf {
        self.host_tmp.path().join("helpers").join(helper.name)
    }

    /// Spawn the configured virt-server and wait for its banner.
    pub async fn start(&mut self) -> Result<()> {
        let Some((program, args)) = self.config.virt_server.split_first() else {
            return Err(TestbedError::Testbed("no virt-server command configured".into()));
        };
        info!("starting virt-server: {}", self.config.virt_server.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TestbedError::Spawn {
                program: program.clone(),
                source,
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TestbedError::Testbed("virt-server stdio is not piped".into()));
        };
        self.child = Some(child);
        self.start_with_transport(Transport::new(stdout, stdin)).await
    }

    /// Adopt an already connected transport and wait for its banner.
    pub async fn start_with_transport(&mut self, transport: Transport) -> Result<()> {
        let transport = self.transport.insert(transport);
        transport.expect("ok", Some(0)).await?;
        self.state = TestbedState::Started;
        Ok(())
    }

    pub async fn command(
        &mut self,
        verb: Verb,
        args: &[&str],
        nresults: Option<usize>,
    ) -> Result<Vec<String>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| TestbedError::Testbed(format!("cannot send {verb}: testbed is not started")))?;
        Ok(transport.command(verb, args, nresults).await?)
    }

    pub async fn debug_fail(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.debug_fail().await;
        }
    }

    /// Open the testbed. Does nothing when it is already open.
    pub async fn open(&mut self) -> Result<()> {
        debug!(scratch = ?self.scratch, "testbed open");
        if self.scratch.is_some() {
            return Ok(());
        }
        let results = self.command(Verb::Open, &[], Some(1)).await?;
        self.opened(results).await
    }

    /// Everything that has to happen after `open` or `revert` handed us a
    /// fresh scratch dir.
    async fn opened(&mut self, results: Vec<String>) -> Result<()> {
        let Some(scratch) = results.into_iter().next() else {
            return Err(TestbedError::Testbed("open returned no scratch dir".into()));
        };
        self.provided_sudo = None;
        self.scratch = Some(scratch);
        self.state = TestbedState::Open;
        self.deps_installed.clear();
        self.apt_pin_for_releases.clear();

        let exec = self.command(Verb::PrintExecuteCommand, &[], Some(1)).await?;
        self.exec_cmd = exec
            .first()
            .map(|e| e.split(',').map(adt_protocol::unquote).collect())
            .unwrap_or_default();
        let tokens = self.command(Verb::Capabilities, &[], None).await?;
        self.caps = Capabilities::parse(&tokens);
        if matches!(self.config.needs_internet, NetworkPolicy::Run | NetworkPolicy::Try) {
            self.caps.insert(Capability::HasInternet);
        }
        debug!("testbed capabilities: {}", self.caps);
        self.shared_downtmp = self.caps.downtmp_host().map(PathBuf::from);

        let scratch = self.scratch_dir()?;
        let wrapper = ResourcePath::new(
            self.helper_host_path(&scripts::WRAPPER),
            format!("{scratch}/{}", scripts::WRAPPER.name),
            DirKind::File,
        );
        wrapper.copydown(self, false, Some("0755")).await?;

        self.provision_user().await?;
        self.run_setup_commands().await?;

        self.dpkg_arch = self
            .check_exec(&["dpkg", "--print-architecture"], true)
            .await?
            .trim()
            .to_string();
        info!("testbed dpkg architecture: {}", self.dpkg_arch);

        let eatmydata = self
            .execute(&["sh", "-ec", "command -v eatmydata"], ExecOptions::capture())
            .await?;
        self.eatmydata_prefix = None;
        if eatmydata.code == 0 && !eatmydata.stdout_str().trim().is_empty() {
            debug!("testbed has eatmydata");
            self.eatmydata_prefix = Some(eatmydata.stdout_str().trim().to_string());
        }

        if self.config.output_dir.is_some() && self.has_dpkg_query().await? {
            let pkglist =
                TempResource::new(self, packages::BASELINE_FILE, DirKind::File, false)?;
            let script = format!("{} > {}", packages::LIST_SCRIPT, pkglist.testbed());
            self.check_exec(&["sh", "-ec", &script], false).await?;
            pkglist.copyup(self, false).await?;
        }

        self.post_boot_setup().await
    }

    /// Pick or create the unprivileged test user. A user created before a
    /// revert is re-created under the same name.
    async fn provision_user(&mut self) -> Result<()> {
        if self.user.is_none() && self.caps.has(Capability::RootOnTestbed) {
            let suggested = self.caps.suggested_normal_user().unwrap_or("").to_string();
            self.user = Some(suggested);
            if self.caps.has(Capability::RevertFullSystem) && self.user().is_none() {
                self.check_exec(&["sh", "-euc", scripts::CREATE_NORMAL_USER], false)
                    .await?;
                self.created_user = true;
                let user = self
                    .check_exec(&["cat", scripts::NORMAL_USER_FILE], true)
                    .await?
                    .trim()
                    .to_string();
                info!("created normal user {user} on testbed");
                self.user = Some(user);
            }
        } else if self.created_user {
            if !self.caps.has(Capability::RevertFullSystem)
                || !self.caps.has(Capability::RootOnTestbed)
            {
                return Err(TestbedError::Testbed(format!(
                    "cannot re-create test user, capabilities changed to: {}",
                    self.caps
                )));
            }
            let user = self.user.clone().unwrap_or_default();
            self.check_exec(&["sh", "-euc", scripts::CREATE_NORMAL_USER, "sh", &user], false)
                .await?;
        }
        Ok(())
    }

    /// Setup after every (re)boot.
    pub async fn post_boot_setup(&mut self) -> Result<()> {
        if self.caps.has(Capability::Reboot) && self.caps.has(Capability::RootOnTestbed) {
            debug!("testbed supports reboot, creating /tmp/autopkgtest-reboot");
            let scratch = self.scratch_dir()?;
            let reboot = ResourcePath::new(
                self.helper_host_path(&scripts::REBOOT),
                format!("{scratch}/{}", scripts::REBOOT.name),
                DirKind::File,
            );
            reboot.copydown(self, false, Some("0755")).await?;
            self.check_exec(&["ln", "-fns", &reboot.testbed, "/tmp/autopkgtest-reboot"], false)
                .await?;
            // /sbin may be read-only
            self.execute(
                &["ln", "-fns", &reboot.testbed, "/sbin/autopkgtest-reboot"],
                ExecOptions::default().capture_stderr(),
            )
            .await?;

            let prepare = ResourcePath::new(
                self.helper_host_path(&scripts::REBOOT_PREPARE),
                format!("{scratch}/{}", scripts::REBOOT_PREPARE.name),
                DirKind::File,
            );
            prepare.copydown(self, false, Some("0755")).await?;
            self.check_exec(
                &["ln", "-fns", &prepare.testbed, "/tmp/autopkgtest-reboot-prepare"],
                false,
            )
            .await?;
        }

        let kver = self.check_exec(&["uname", "-srv"], true).await?.trim().to_string();
        match self.initial_kernel_version.clone() {
            None => {
                info!("testbed running kernel: {kver}");
                self.initial_kernel_version = Some(kver);
            }
            Some(initial) if initial != kver => {
                if self.last_reboot_marker.is_empty() {
                    info!(
                        "testbed running kernel changed: {kver} (current test: {})",
                        self.last_test_name
                    );
                } else {
                    info!(
                        "testbed running kernel changed: {kver} (current test: {}, last reboot marker: {})",
                        self.last_test_name, self.last_reboot_marker
                    );
                }
                self.kernel_versions.push(KernelVersionChange {
                    test: self.last_test_name.clone(),
                    reboot_marker: self.last_reboot_marker.clone(),
                    kernel_version: kver,
                });
            }
            Some(_) => {}
        }

        if self.cpu.is_none() {
            let output = self
                .check_exec(&["sh", "-c", "nproc; cat /proc/cpuinfo 2>/dev/null || true"], true)
                .await?;
            self.cpu = Some(CpuInfo::parse(output.trim()));
        }

        let env = self.setup_env("AUTOPKGTEST_IS_SETUP_BOOT_COMMAND=1");
        for command in self.config.setup_commands_boot.clone() {
            let rc = self
                .execute(
                    &["sh", "-ec", &command],
                    ExecOptions::kind(ExecKind::Install).with_env(env.clone()),
                )
                .await?
                .code;
            if rc != 0 {
                if self.config.shell_fail {
                    self.run_shell(None, &[]).await?;
                }
                return Err(setup_failure("testbed boot setup commands", rc));
            }
        }
        Ok(())
    }

    /// Environment for setup commands: `flag` plus the normal user, if any.
    pub(crate) fn setup_env(&self, flag: &str) -> Vec<String> {
        let mut env = vec![flag.to_string()];
        if let Some(user) = self.user() {
            env.push(format!("AUTOPKGTEST_NORMAL_USER={user}"));
            env.push(format!("ADT_NORMAL_USER={user}"));
        }
        env
    }

    pub async fn close(&mut self) -> Result<()> {
        debug!(scratch = ?self.scratch, "testbed close");
        if self.scratch.is_none() {
            return Ok(());
        }
        self.scratch = None;
        self.state = TestbedState::Closed;
        if self.transport.is_none() {
            return Ok(());
        }
        self.command(Verb::Close, &[], Some(0)).await?;
        self.shared_downtmp = None;
        Ok(())
    }

    /// Close, send `quit` and reap the virt-server. Runs at most once.
    pub async fn stop(&mut self) -> Result<()> {
        debug!("testbed stop");
        if self.stop_sent {
            return Ok(());
        }
        self.stop_sent = true;

        let closed = self.close().await;
        let quit = self.quit().await;
        self.state = TestbedState::Stopped;
        closed.and(quit)
    }

    async fn quit(&mut self) -> Result<()> {
        let mut transport = self.transport.take();
        let Some(mut child) = self.child.take() else {
            if let Some(t) = transport.as_mut() {
                let _ = t.send(Verb::Quit.as_str()).await;
            }
            return Ok(());
        };
        let code = match child.try_wait() {
            Ok(Some(status)) => crate::exec::exit_code(status),
            _ => {
                if let Some(t) = transport.as_mut() {
                    let _ = t.send(Verb::Quit.as_str()).await;
                }
                // closes both pipes
                drop(transport);
                let status = child
                    .wait()
                    .await
                    .map_err(|e| TestbedError::Testbed(format!("cannot wait for virt-server: {e}")))?;
                crate::exec::exit_code(status)
            }
        };
        if code != 0 {
            error!("testbed gave exit status {code} after quit");
            return Err(TestbedError::Testbed(format!(
                "testbed gave exit status {code} after quit"
            )));
        }
        Ok(())
    }

    /// Issue `reboot` and repeat the per-boot setup.
    pub async fn reboot(&mut self, prepare_only: bool) -> Result<()> {
        let args: &[&str] = if prepare_only { &["prepare-only"] } else { &[] };
        self.command(Verb::Reboot, args, Some(0)).await?;
        self.post_boot_setup().await
    }

    /// Revert when the testbed may have diverged, or when installed
    /// dependencies are not all wanted by the next test.
    pub async fn reset(&mut self, deps_new: &[String]) -> Result<()> {
        debug!(
            modified = self.modified,
            deps_installed = ?self.deps_installed,
            ?deps_new,
            "testbed reset"
        );
        let stale_deps = self.deps_installed.iter().any(|d| !deps_new.contains(d));
        if self.caps.has(Capability::Revert) && (self.modified || stale_deps) {
            debug!("reverting testbed");
            let results = self.command(Verb::Revert, &[], Some(1)).await?;
            self.opened(results).await?;
            self.modified = false;
        }
        Ok(())
    }

    pub fn needs_reset(&mut self) {
        debug!(previously = self.modified, "testbed needs reset");
        self.modified = true;
    }

    /// Set up restrictions that can be provided on demand.
    pub async fn satisfy_restrictions(
        &mut self,
        name: &str,
        restrictions: &BTreeSet<Restriction>,
    ) -> Result<()> {
        if !restrictions.contains(&Restriction::NeedsSudo) {
            return Ok(());
        }
        if self.provided_sudo.is_none() {
            let outcome = self.provide_sudo().await?;
            self.provided_sudo = Some(outcome);
        }
        match &self.provided_sudo {
            Some(Err(reason)) => Err(TestbedError::Unsupported {
                test: name.to_string(),
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Argv prefix running a shell snippet as the test user.
    pub(crate) fn run_as_user(&self) -> Vec<String> {
        match self.user() {
            Some(user) if self.caps.has(Capability::RootOnTestbed) => {
                ["su", "-s", "/bin/bash", user, "-c"].map(str::to_string).to_vec()
            }
            _ => vec!["bash".to_string(), "-c".to_string()],
        }
    }

    async fn provide_sudo(&mut self) -> Result<std::result::Result<(), String>> {
        let root = self.caps.has(Capability::RootOnTestbed);
        if root && self.user().is_none() {
            return Ok(Err(
                "Cannot enable needs-sudo restriction: no ordinary user available".into(),
            ));
        }
        let prefix = self.run_as_user();
        let mut argv: Vec<&str> = prefix.iter().map(String::as_str).collect();
        argv.push("id -Gn");
        let groups = self.execute(&argv, ExecOptions::capture()).await?;
        let mut already = false;
        if groups.code == 0 && groups.stdout_str().split_whitespace().any(|g| g == "sudo") {
            argv.pop();
            argv.push("sudo -n -v");
            let check = self.execute(&argv, ExecOptions::capture()).await?;
            debug!(
                status = check.code,
                stderr = check.stderr_str().trim(),
                "sudo -n -v"
            );
            already = check.code == 0;
        } else {
            debug!(status = groups.code, stdout = groups.stdout_str().trim(), "id -Gn");
        }
        if already {
            debug!("user {:?} can already sudo without password", self.user());
            return Ok(Ok(()));
        }
        if !root {
            return Ok(Err("Cannot enable needs-sudo restriction: not root".into()));
        }
        if !self.caps.has(Capability::RevertFullSystem) {
            return Ok(Err("Cannot enable needs-sudo restriction: cannot revert".into()));
        }

        self.needs_reset();
        let user = self.user().unwrap_or_default().to_string();
        info!("setting up user {user:?} to sudo without password");
        let rc = self
            .execute(
                &["sh", "-euc", scripts::ENABLE_SUDO, "enable-sudo", &user],
                ExecOptions::default(),
            )
            .await?
            .code;
        if rc != 0 {
            return Ok(Err(format!(
                "Failed to enable needs-sudo restriction: exit status {rc}"
            )));
        }
        Ok(Ok(()))
    }

    /// Interactive debug shell in the testbed.
    pub async fn run_shell(&mut self, cwd: Option<&str>, extra_env: &[String]) -> Result<()> {
        info!(" - - - - - - - - - - running shell - - - - - - - - - -");
        let mut args = vec![cwd.unwrap_or("/")];
        args.extend(extra_env.iter().map(String::as_str));
        self.command(Verb::Shell, &args, Some(0)).await?;
        Ok(())
    }

    /// Run `argv` inside the testbed.
    ///
    /// Exit codes 254 and 255 mean the execute prefix itself failed and are
    /// fatal. A timeout is fatal too, except for [`ExecKind::Test`] where the
    /// caller gets a test-scoped [`TestbedError::Timeout`].
    pub async fn execute(&mut self, argv: &[&str], opts: ExecOptions) -> Result<ExecOutput> {
        let kind = opts.kind.unwrap_or(ExecKind::Short);
        let mut env = opts.env;
        if kind == ExecKind::Install {
            env.extend(INSTALL_ENV.iter().map(|e| e.to_string()));
        }
        debug!(
            ?argv,
            %kind,
            stdout = ?opts.stdout,
            stderr = ?opts.stderr,
            ?env,
            "testbed command"
        );

        let mut command: Vec<String> = Vec::new();
        if !env.is_empty() {
            command.push("env".to_string());
            command.extend(env);
        }
        command.extend(argv.iter().map(|a| a.to_string()));
        let mut full = self.exec_cmd.clone();
        full.extend(command.iter().cloned());

        let spec = RunSpec {
            argv: full,
            stdout: opts.stdout,
            stderr: opts.stderr,
            timeout: self.config.timeouts.for_kind(kind),
            wait_after_kill: !self.exec_cmd.iter().any(|a| a == "sudo"),
        };
        let outcome = self.runner.run(&spec).await.map_err(|source| TestbedError::Spawn {
            program: spec.argv.first().cloned().unwrap_or_default(),
            source,
        })?;

        match outcome {
            RunOutcome::TimedOut => {
                let err = TestbedError::Timeout {
                    command: command.join(" "),
                    kind,
                };
                error!("{err}");
                if kind != ExecKind::Test {
                    self.debug_fail().await;
                }
                Err(err)
            }
            RunOutcome::Exited(output) => {
                debug!("testbed command exited with code {}", output.code);
                if output.code == 254 || output.code == 255 {
                    self.debug_fail().await;
                    return Err(TestbedError::Auxverb(output.code));
                }
                Ok(output)
            }
        }
    }

    /// Run `argv`, requiring exit status 0 and no stderr. Returns stdout when
    /// `capture_stdout` is set, an empty string otherwise.
    pub async fn check_exec(&mut self, argv: &[&str], capture_stdout: bool) -> Result<String> {
        self.check_exec_kind(argv, capture_stdout, ExecKind::Short).await
    }

    pub async fn check_exec_kind(
        &mut self,
        argv: &[&str],
        capture_stdout: bool,
        kind: ExecKind,
    ) -> Result<String> {
        let mut opts = ExecOptions::kind(kind).capture_stderr();
        if capture_stdout {
            opts.stdout = Stream::Capture;
        }
        let output = self.execute(argv, opts).await?;
        if !output.stderr_str().is_empty() {
            return Err(TestbedError::Command(format!(
                "\"{}\" failed with stderr \"{}\"",
                argv.join(" "),
                output.stderr_str()
            )));
        }
        if output.code != 0 {
            return Err(TestbedError::Command(format!(
                "\"{}\" failed with status {}",
                argv.join(" "),
                output.code
            )));
        }
        Ok(output.stdout.unwrap_or_default())
    }

    /// Run a host-side helper (not through the execute prefix).
    pub(crate) async fn run_host(&self, argv: &[&str]) -> Result<ExecOutput> {
        let spec = RunSpec {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            stdout: Stream::Capture,
            stderr: Stream::Capture,
            timeout: self.config.timeouts.for_kind(ExecKind::Short),
            wait_after_kill: true,
        };
        match self.runner.run(&spec).await {
            Ok(RunOutcome::Exited(output)) => Ok(output),
            Ok(RunOutcome::TimedOut) => Err(TestbedError::Timeout {
                command: argv.join(" "),
                kind: ExecKind::Short,
            }),
            Err(source) => Err(TestbedError::Spawn {
                program: argv.first().map(|a| a.to_string()).unwrap_or_default(),
                source,
            }),
        }
    }

    pub(crate) fn scratch_dir(&self) -> Result<String> {
        self.scratch
            .clone()
            .ok_or_else(|| TestbedError::Testbed("testbed is not open".into()))
    }
}

impl Drop for Testbed {
    fn drop(&mut self) {
        if self.child.is_some() && !self.stop_sent {
            warn!("testbed dropped without stop; killing virt-server");
        }
    }
}

/// Setup commands report package faults with exit status 100.
pub(crate) fn setup_failure(what: &str, rc: i32) -> TestbedError {
    if rc == 100 {
        TestbedError::BadPackage(format!("{what} failed with status 100"))
    } else {
        TestbedError::Testbed(format!("{what} failed with status {rc}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeVirtConfig, FakeVirtServer, ScriptedRunner, exited};
    use crate::Severity;

    async fn open_testbed(
        caps: &[&str],
        config: TestbedConfig,
        runner: Arc<ScriptedRunner>,
    ) -> (Testbed, FakeVirtServer) {
        let (server, transport) = FakeVirtServer::spawn(FakeVirtConfig::with_caps(caps));
        let mut tb =
            Testbed::with_parts(config, runner, Arc::new(DebianDepResolver::default())).unwrap();
        tb.start_with_transport(transport).await.unwrap();
        tb.open().await.unwrap();
        (tb, server)
    }

    #[test]
    fn cpu_info_is_parsed() {
        let info = CpuInfo::parse(
            "8\nprocessor\t: 0\nmodel name\t: Fancy CPU @ 3GHz\nflags\t\t: fpu vme sse\n",
        );
        assert_eq!(info.nproc, "8");
        assert_eq!(info.model.as_deref(), Some("Fancy CPU @ 3GHz"));
        assert_eq!(info.flags.as_deref(), Some("fpu vme sse"));
    }

    #[test]
    fn setup_status_100_blames_the_package() {
        assert_eq!(setup_failure("x", 100).severity(), Severity::PackageScoped);
        assert_eq!(setup_failure("x", 1).severity(), Severity::Fatal);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn open_negotiates_and_second_open_is_noop() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("dpkg --print-architecture", exited(0, "amd64\n", ""));
        runner.on("uname -srv", exited(0, "Linux 6.1 #1\n", ""));
        let (mut tb, server) = open_testbed(&["revert"], TestbedConfig::default(), runner).await;

        assert_eq!(tb.state(), TestbedState::Open);
        assert_eq!(tb.scratch(), Some("/scratch"));
        assert_eq!(tb.exec_command(), ["env".to_string()]);
        assert_eq!(tb.dpkg_arch(), "amd64");
        assert!(tb.has_cap(Capability::HasInternet));
        assert_eq!(tb.initial_kernel_version(), Some("Linux 6.1 #1"));
        assert_eq!(server.count("open"), 1);
        assert_eq!(server.count("copydown"), 1);

        let before = server.requests().len();
        tb.open().await.unwrap();
        assert_eq!(server.requests().len(), before);

        tb.stop().await.unwrap();
        assert_eq!(tb.state(), TestbedState::Stopped);
        assert!(tb.scratch().is_none());
        assert_eq!(server.count("close"), 1);
        assert_eq!(server.count("quit"), 1);

        tb.stop().await.unwrap();
        assert_eq!(server.count("quit"), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_reverts_only_when_needed() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut tb, server) = open_testbed(&["revert"], TestbedConfig::default(), runner).await;

        tb.deps_installed = vec!["foo".into()];
        tb.reset(&["foo".into(), "bar".into()]).await.unwrap();
        assert_eq!(server.count("revert"), 0);

        tb.reset(&["bar".into()]).await.unwrap();
        assert_eq!(server.count("revert"), 1);
        assert!(tb.installed_deps().is_empty());
        assert_eq!(tb.scratch(), Some("/scratch-1"));

        tb.needs_reset();
        tb.reset(&[]).await.unwrap();
        assert_eq!(server.count("revert"), 2);
        assert!(!tb.is_modified());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_without_revert_capability_keeps_modified() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut tb, server) = open_testbed(&[], TestbedConfig::default(), runner).await;
        tb.needs_reset();
        let before = server.requests().len();
        tb.reset(&[]).await.unwrap();
        assert_eq!(server.requests().len(), before);
        assert!(tb.is_modified());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn boot_setup_exit_100_is_package_scoped() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("false-setup", exited(100, "", ""));
        let config = TestbedConfig {
            setup_commands_boot: vec!["false-setup".into()],
            ..TestbedConfig::default()
        };
        let (server, transport) = FakeVirtServer::spawn(FakeVirtConfig::with_caps(&[]));
        let mut tb =
            Testbed::with_parts(config, runner.clone(), Arc::new(DebianDepResolver::default()))
                .unwrap();
        tb.start_with_transport(transport).await.unwrap();
        let err = tb.open().await.unwrap_err();
        assert_eq!(err.severity(), Severity::PackageScoped);
        let call = runner
            .calls()
            .into_iter()
            .find(|c| c.iter().any(|a| a == "false-setup"))
            .unwrap();
        assert!(call.contains(&"AUTOPKGTEST_IS_SETUP_BOOT_COMMAND=1".to_string()));
        assert!(call.contains(&"DEBIAN_FRONTEND=noninteractive".to_string()));
        drop(server);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn auxverb_failure_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut tb, server) = open_testbed(&[], TestbedConfig::default(), runner.clone()).await;
        runner.on("broken", exited(255, "", ""));
        let err = tb.execute(&["broken"], ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, TestbedError::Auxverb(255)));
        assert_eq!(server.count("auxverb_debug_fail"), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn check_exec_rejects_stderr() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut tb, _server) = open_testbed(&[], TestbedConfig::default(), runner.clone()).await;
        runner.on("noisy", exited(0, "", "warning\n"));
        let err = tb.check_exec(&["noisy"], false).await.unwrap_err();
        assert!(err.to_string().contains("failed with stderr"), "{err}");
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeouts_are_fatal_except_for_tests() {
        let runner = Arc::new(ScriptedRunner::new());
        let (mut tb, _server) = open_testbed(&[], TestbedConfig::default(), runner.clone()).await;
        runner.on("slow", RunOutcome::TimedOut);
        let err = tb
            .execute(&["slow"], ExecOptions::kind(ExecKind::Test))
            .await
            .unwrap_err();
        assert_eq!(err.severity(), Severity::TestScoped);
        let err = tb
            .execute(&["slow"], ExecOptions::kind(ExecKind::Install))
            .await
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn normal_user_is_created_and_recreated_after_revert() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("cat /run/autopkgtest-normal-user", exited(0, "adt-user\n", ""));
        let (mut tb, _server) = open_testbed(
            &["revert", "revert-full-system", "root-on-testbed"],
            TestbedConfig::default(),
            runner.clone(),
        )
        .await;
        assert_eq!(tb.user(), Some("adt-user"));

        tb.needs_reset();
        tb.reset(&[]).await.unwrap();
        let recreate = runner
            .calls()
            .into_iter()
            .filter(|c| c.last().map(String::as_str) == Some("adt-user"))
            .count();
        assert_eq!(recreate, 1);
        assert_eq!(tb.user(), Some("adt-user"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn suggested_user_is_adopted() {
        let runner = Arc::new(ScriptedRunner::new());
        let (tb, _server) = open_testbed(
            &["root-on-testbed", "suggested-normal-user=ubuntu"],
            TestbedConfig::default(),
            runner,
        )
        .await;
        assert_eq!(tb.user(), Some("ubuntu"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn needs_sudo_failure_is_cached() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("id -Gn", exited(0, "tester\n", ""));
        let config = TestbedConfig {
            user: Some("tester".into()),
            ..TestbedConfig::default()
        };
        let (mut tb, _server) = open_testbed(&[], config, runner.clone()).await;
        let restrictions = BTreeSet::from([Restriction::NeedsSudo]);
        let err = tb.satisfy_restrictions("t1", &restrictions).await.unwrap_err();
        assert!(err.to_string().contains("not root"), "{err}");
        let err = tb.satisfy_restrictions("t2", &restrictions).await.unwrap_err();
        assert!(matches!(err, TestbedError::Unsupported { ref test, .. } if test == "t2"));
        assert_eq!(runner.count_matching("id -Gn"), 1);
    }
}
