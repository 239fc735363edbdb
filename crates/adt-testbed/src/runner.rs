//! Running one test inside an open testbed.

use std::fs;
use std::io::ErrorKind;

use adt_protocol::Capability;
use tracing::{debug, info, warn};

use crate::config::NetworkPolicy;
use crate::exec::{ExecKind, ExecOptions};
use crate::resource::{DirKind, ResourcePath, TempResource};
use crate::scripts;
use crate::session::Testbed;
use crate::testdesc::{Restriction, Test};
use crate::{Result, TestbedError};

const SIGKILL_STATUSES: [i32; 2] = [-9, 128 + 9];

#[derive(Debug, Clone, Default)]
pub struct RunTestOptions {
    /// `NAME=value` assignments exported before the test starts.
    pub extra_env: Vec<String>,
    pub shell_on_failure: bool,
    pub shell: bool,
    /// Overrides the testbed's CPU count in `DEB_BUILD_OPTIONS`.
    pub build_parallel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Passed,
    Skipped(String),
    Failed(String),
}

/// Classify a finished test. `status` is `None` after a timeout;
/// `stderr_head` is the first line of a non-empty stderr.
pub(crate) fn classify(
    test: &Test,
    status: Option<i32>,
    stderr_head: Option<&str>,
    network: NetworkPolicy,
) -> Verdict {
    let Some(rc) = status else {
        return Verdict::Failed("timed out".into());
    };
    if rc == 77 && test.has(Restriction::Skippable) {
        return Verdict::Skipped("exit status 77 and marked as skippable".into());
    }
    if rc != 0 {
        if test.has(Restriction::NeedsInternet) && network == NetworkPolicy::Try {
            return Verdict::Skipped(
                "Failed, but test has needs-internet and that's not guaranteed".into(),
            );
        }
        return Verdict::Failed(format!("non-zero exit status {rc}"));
    }
    match stderr_head {
        Some(head) if !test.has(Restriction::AllowStderr) => Verdict::Failed(head.to_string()),
        _ => Verdict::Passed,
    }
}

fn shell_quote(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", input.replace('\'', "'\"'\"'"))
}

impl Testbed {
    /// Run `test` from the source tree `tree` and record its result.
    ///
    /// Test failures end up in `test`; only testbed and package problems are
    /// returned as errors.
    pub async fn run_test(
        &mut self,
        tree: &ResourcePath,
        test: &mut Test,
        opts: &RunTestOptions,
    ) -> Result<()> {
        self.last_test_name = test.name.clone();

        if let Some(path) = &test.path {
            if !tree.host.join(path).exists() {
                return Err(TestbedError::BadPackage(format!("{path} does not exist")));
            }
        }

        self.record_test_packages(&test.name).await?;
        tree.copydown(self, true, None).await?;

        let mut stdout = TempResource::new(self, &format!("{}-stdout", test.name), DirKind::File, false)?;
        let mut stderr = TempResource::new(self, &format!("{}-stderr", test.name), DirKind::File, false)?;

        let scratch = self.scratch_dir()?;
        let artifacts = format!("{scratch}/{}-artifacts", test.name);
        let tmp = format!("{scratch}/autopkgtest_tmp");
        let parallel = opts
            .build_parallel
            .clone()
            .or_else(|| self.cpu().map(|c| c.nproc.clone()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "1".to_string());

        let mut script = format!(
            "set -e; export USER=`id -nu`; \
             . /etc/profile >/dev/null 2>&1 || true; \
             . ~/.profile >/dev/null 2>&1 || true; \
             buildtree=\"{tree}\"; \
             mkdir -p -m 1777 -- \"{artifacts}\"; \
             export AUTOPKGTEST_ARTIFACTS=\"{artifacts}\"; \
             export ADT_ARTIFACTS=\"$AUTOPKGTEST_ARTIFACTS\"; \
             mkdir -p -m 755 \"{tmp}\"; export AUTOPKGTEST_TMP=\"{tmp}\"; \
             export ADTTMP=\"$AUTOPKGTEST_TMP\"; \
             export DEBIAN_FRONTEND=noninteractive; \
             export LANG=C.UTF-8; \
             export DEB_BUILD_OPTIONS=parallel={parallel}; \
             unset LANGUAGE LC_CTYPE LC_NUMERIC LC_TIME LC_COLLATE \
             LC_MONETARY LC_MESSAGES LC_PAPER LC_NAME LC_ADDRESS \
             LC_TELEPHONE LC_MEASUREMENT LC_IDENTIFICATION LC_ALL; \
             cd \"$buildtree\"; ",
            tree = tree.testbed,
        );

        let user = self.user().map(str::to_string);
        if test.has(Restriction::NeedsRoot) {
            if let Some(user) = &user {
                script.push_str(&format!(
                    "export AUTOPKGTEST_NORMAL_USER={user}; export ADT_NORMAL_USER={user}; "
                ));
            }
        }
        for assignment in &opts.extra_env {
            script.push_str(&format!("export {}; ", shell_quote(assignment)));
        }

        let test_cmd = match (&test.path, &test.command) {
            (Some(path), _) => {
                let cmd = format!("{}/{path}", tree.testbed.trim_end_matches('/'));
                script.push_str(&format!("chmod +x {cmd}; "));
                cmd
            }
            (None, Some(command)) => format!("bash -ec {}", shell_quote(command)),
            (None, None) => {
                return Err(TestbedError::InvalidTest {
                    test: test.name.clone(),
                    reason: "Test must have either path or command".into(),
                });
            }
        };
        script.push_str(&format!(
            "exec {}/{} --script-pid-file={} --stderr={} --stdout={} -- {test_cmd};",
            shell_quote(&scratch),
            scripts::WRAPPER.name,
            scripts::SCRIPT_PID_FILE,
            shell_quote(stderr.testbed()),
            shell_quote(stdout.testbed()),
        ));

        let root = self.has_cap(Capability::RootOnTestbed);
        let run_as: Vec<String> = match user {
            Some(user) if !test.has(Restriction::NeedsRoot) => {
                if !root {
                    return Err(TestbedError::Testbed(format!(
                        "cannot change to user {user} without root-on-testbed"
                    )));
                }
                if test.has(Restriction::RwBuildTree) {
                    self.check_exec(&["chown", "-R", &user, &tree.testbed], false)
                        .await?;
                }
                ["su", "-s", "/bin/bash", user.as_str(), "-c"]
                    .map(str::to_string)
                    .to_vec()
            }
            _ if root => ["su", "-s", "/bin/bash", "root", "-c"].map(str::to_string).to_vec(),
            _ => vec!["bash".to_string(), "-c".to_string()],
        };

        if let Some(command) = &test.command {
            info!("test {}: {command}", test.name);
        }
        info!("test {}: [-----------------------", test.name);

        self.last_reboot_marker.clear();
        let status = self.run_with_reboots(&run_as, &script).await?;
        info!("test {}: -----------------------]", test.name);
        debug!(?status, "testbed executing test finished");

        let copied = match stdout.copyup(self, false).await {
            Ok(()) => stderr.copyup(self, false).await,
            Err(err) => Err(err),
        };
        let outputs_ok = match copied {
            Ok(()) => true,
            // a test that timed out may well have broken the testbed
            Err(err) if status.is_none() => {
                warn!("copying up test output failed after timeout, ignoring: {err}");
                false
            }
            Err(err) => return Err(err),
        };

        let stderr_text = if outputs_ok {
            read_lossy(stderr.host())?
        } else {
            String::new()
        };
        let stderr_head = (!stderr_text.is_empty())
            .then(|| stderr_text.lines().next().unwrap_or("").trim_end_matches([' ', '\t', '\r']));

        info!("test {}:  - - - - - - - - - - results - - - - - - - - - -", test.name);
        match classify(test, status, stderr_head, self.config.needs_internet) {
            Verdict::Passed => test.passed(),
            Verdict::Skipped(reason) => test.set_skipped(&reason),
            Verdict::Failed(reason) => test.failed(&reason),
        }

        if !outputs_ok {
            debug!("skipping remaining log processing after timeout");
            stdout.set_auto_clean(true);
            stderr.set_auto_clean(true);
            return Ok(());
        }

        if read_lossy(stdout.host())?.is_empty() {
            stdout.set_auto_clean(true);
        }
        if stderr_text.is_empty() {
            stderr.set_auto_clean(true);
        } else if !test.has(Restriction::AllowStderr) {
            info!("test {}:  - - - - - - - - - - stderr - - - - - - - - - -", test.name);
            for line in stderr_text.lines() {
                info!("{line}");
            }
        }

        if let Some(output_dir) = self.output_dir().map(|d| d.to_path_buf()) {
            let host = output_dir.join("artifacts").join(&test.name);
            let saved = ResourcePath::new(&host, artifacts.clone(), DirKind::Dir);
            saved.copyup(self, false).await?;
            remove_if_empty(&host)?;
        }

        if opts.shell || (opts.shell_on_failure && test.result != crate::TestResult::Passed) {
            self.run_shell(
                Some(&tree.testbed),
                &[
                    format!("AUTOPKGTEST_ARTIFACTS=\"{artifacts}\""),
                    format!("AUTOPKGTEST_TMP=\"{tmp}\""),
                ],
            )
            .await?;
        }

        self.check_exec(&["rm", "-rf", &artifacts, &tmp], false).await?;
        Ok(())
    }

    /// Run the test script, rebooting and resuming while the test asks for
    /// it. Returns `None` when the test timed out.
    async fn run_with_reboots(&mut self, run_as: &[String], script: &str) -> Result<Option<i32>> {
        loop {
            let prefix = if self.last_reboot_marker.is_empty() {
                String::new()
            } else {
                format!(
                    "export AUTOPKGTEST_REBOOT_MARK=\"{}\"; export ADT_REBOOT_MARK=\"$AUTOPKGTEST_REBOOT_MARK\"; ",
                    self.last_reboot_marker
                )
            };
            let full = format!("{prefix}{script}");
            let mut argv: Vec<&str> = run_as.iter().map(String::as_str).collect();
            argv.push(&full);

            let rc = match self.execute(&argv, ExecOptions::kind(ExecKind::Test)).await {
                Ok(output) => output.code,
                Err(TestbedError::Timeout {
                    kind: ExecKind::Test,
                    ..
                }) => return Ok(None),
                Err(err) => return Err(err),
            };

            if !SIGKILL_STATUSES.contains(&rc) || !self.has_cap(Capability::Reboot) {
                return Ok(Some(rc));
            }
            debug!("test process SIGKILLed, checking for reboot marker");
            if let Some(marker) = self.read_marker(scripts::REBOOT_MARK).await? {
                info!("test process requested reboot with marker {marker}");
                self.last_reboot_marker = marker;
                self.reboot(false).await?;
                continue;
            }
            debug!("test process SIGKILLed, checking for prepare-reboot marker");
            if let Some(marker) = self.read_marker(scripts::REBOOT_PREPARE_MARK).await? {
                info!("test process requested preparation for reboot with marker {marker}");
                self.last_reboot_marker = marker;
                self.reboot(true).await?;
                continue;
            }
            debug!("no reboot marker, considering a failure");
            return Ok(Some(rc));
        }
    }

    async fn read_marker(&mut self, path: &str) -> Result<Option<String>> {
        let out = self.execute(&["cat", path], ExecOptions::capture()).await?;
        Ok((out.code == 0).then(|| out.stdout_str().trim().to_string()))
    }
}

fn read_lossy(path: &std::path::Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(TestbedError::io(path, err)),
    }
}

fn remove_if_empty(dir: &std::path::Path) -> Result<()> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(TestbedError::io(dir, err)),
    };
    if entries.next().is_none() {
        fs::remove_dir(dir).map_err(|e| TestbedError::io(dir, e))?;
    }
    Ok(())
}
