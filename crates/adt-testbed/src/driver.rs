//! Runs packages of tests against one testbed and summarises the outcome.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::Severity;
use crate::resource::{DirKind, ResourcePath};
use crate::runner::RunTestOptions;
use crate::session::{KernelVersionChange, Testbed, TestbedState};
use crate::testdesc::{Restriction, Test, TestResult, TestSpec};
use crate::{Result, TestbedError};

/// A source tree and the tests declared for it.
#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub name: String,
    pub tree: PathBuf,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrictions treated as satisfied whatever the testbed offers.
    pub ignore_restrictions: Vec<String>,
    pub test: RunTestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Flaky,
    Skip,
    Badpkg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub package: String,
    pub test: String,
    pub outcome: Outcome,
    /// `PASS`, `FAIL non-zero exit status 1`, ...
    pub verdict: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub records: Vec<TestRecord>,
    /// Set when the run was aborted by a testbed failure.
    pub fatal: Option<String>,
    pub kernel_versions: Vec<KernelVersionChange>,
}

impl RunSummary {
    /// 0 all passed, 2 something skipped, 4 something failed, 8 no test
    /// ran, 12 erroneous package, 16 testbed failure. Bits combine, except
    /// that a testbed failure always yields 16.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            return 16;
        }
        let mut code = 0;
        for record in &self.records {
            code |= match record.outcome {
                Outcome::Pass => 0,
                Outcome::Skip | Outcome::Flaky => 2,
                Outcome::Fail => 4,
                Outcome::Badpkg => 12,
            };
        }
        let ran = self
            .records
            .iter()
            .any(|r| matches!(r.outcome, Outcome::Pass | Outcome::Fail | Outcome::Flaky));
        if !ran {
            code |= 8;
        }
        code
    }

    /// One `name verdict` line per record.
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            let _ = writeln!(out, "{:<20} {}", record.test, record.verdict);
        }
        out
    }
}

pub struct Driver {
    testbed: Testbed,
    opts: RunOptions,
    summary: RunSummary,
}

impl Driver {
    pub fn new(testbed: Testbed, opts: RunOptions) -> Self {
        Self {
            testbed,
            opts,
            summary: RunSummary::default(),
        }
    }

    pub fn testbed(&self) -> &Testbed {
        &self.testbed
    }

    /// Run every package, stop the testbed and write the summary files.
    pub async fn run(mut self, packages: &[Package]) -> RunSummary {
        let outcome = self.run_packages(packages).await;
        if let Err(err) = outcome {
            error!("{err}");
            self.testbed.debug_fail().await;
            self.summary.fatal = Some(err.to_string());
        }
        if let Err(err) = self.testbed.stop().await {
            error!("{err}");
            self.summary.fatal.get_or_insert_with(|| err.to_string());
        }
        self.summary.kernel_versions = self.testbed.kernel_versions().to_vec();
        if let Some(dir) = self.testbed.output_dir().map(Path::to_path_buf) {
            if let Err(err) = write_products(&dir, &self.summary) {
                warn!("cannot write run summary: {err}");
            }
        }
        self.summary
    }

    async fn run_packages(&mut self, packages: &[Package]) -> Result<()> {
        if self.testbed.state() == TestbedState::Unstarted {
            self.testbed.start().await?;
        }
        for package in packages {
            // Setup runs on open. After a package-scoped setup failure the
            // testbed is closed, so the next package reopens it.
            if let Err(err) = self.testbed.open().await {
                if err.severity() == Severity::Fatal {
                    return Err(err);
                }
                error!("package {}: testbed setup: {err}", package.name);
                self.record_badpkg(&package.name, "*", &err);
                self.testbed.close().await?;
                continue;
            }
            match self.run_package(package).await {
                Ok(()) => {}
                Err(err) if err.severity() == Severity::Fatal => return Err(err),
                Err(err) => {
                    error!("package {}: {err}", package.name);
                    self.record_badpkg(&package.name, "*", &err);
                }
            }
        }
        Ok(())
    }

    async fn run_package(&mut self, package: &Package) -> Result<()> {
        info!("package {}: {} tests", package.name, package.tests.len());
        if package.tests.is_empty() {
            self.record(&package.name, "*", Outcome::Skip, "SKIP no tests in this package".into());
            return Ok(());
        }
        let tests = package
            .tests
            .iter()
            .cloned()
            .map(Test::new)
            .collect::<Vec<_>>();
        for test in tests {
            let mut test = match test {
                Ok(test) => test,
                Err(TestbedError::Unsupported { test, reason }) => {
                    self.record(&package.name, &test, Outcome::Skip, format!("SKIP {reason}"));
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.run_one(package, &mut test).await {
                Ok(()) => self.record_result(&package.name, &test),
                Err(TestbedError::Unsupported { reason, .. }) => {
                    self.record(&package.name, &test.name, Outcome::Skip, format!("SKIP {reason}"));
                }
                Err(err) if err.severity() == Severity::Fatal => return Err(err),
                Err(err) => {
                    self.record_badpkg(&package.name, &test.name, &err);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn run_one(&mut self, package: &Package, test: &mut Test) -> Result<()> {
        test.check_testbed_compat(self.testbed.caps(), &self.opts.ignore_restrictions)?;
        self.testbed.reset(&test.depends).await?;
        self.testbed
            .satisfy_restrictions(&test.name, &test.restrictions)
            .await?;

        let shell_on_failure = self.opts.test.shell_on_failure;
        if let Err(err) = self
            .testbed
            .install_deps(&test.depends, &test.synth_depends, shell_on_failure)
            .await
        {
            if matches!(err, TestbedError::BadPackage(_))
                && test.has(Restriction::SkipNotInstallable)
            {
                test.set_skipped("installation fails and skip-not-installable set");
                return Ok(());
            }
            return Err(err);
        }

        let scratch = self.testbed.scratch_dir()?;
        let tree = ResourcePath::new(
            &package.tree,
            format!("{scratch}/tree-{}", package.name.replace('/', "_")),
            DirKind::Dir,
        );
        let result = self.testbed.run_test(&tree, test, &self.opts.test).await;
        if test.has(Restriction::BreaksTestbed) {
            self.testbed.needs_reset();
        }
        result
    }

    fn record_result(&mut self, package: &str, test: &Test) {
        let outcome = match (test.result, test.skipped) {
            (_, true) => Outcome::Skip,
            (TestResult::Passed, false) => Outcome::Pass,
            (TestResult::Failed, false) if test.has(Restriction::Flaky) => Outcome::Flaky,
            (TestResult::Failed | TestResult::Unrun, false) => Outcome::Fail,
        };
        self.record(package, &test.name, outcome, test.verdict());
    }

    fn record_badpkg(&mut self, package: &str, test: &str, err: &TestbedError) {
        self.record(package, test, Outcome::Badpkg, format!("FAIL badpkg: {err}"));
    }

    fn record(&mut self, package: &str, test: &str, outcome: Outcome, verdict: String) {
        if !matches!(outcome, Outcome::Pass | Outcome::Fail | Outcome::Flaky) {
            info!("{test:<20} {verdict}");
        }
        self.summary.records.push(TestRecord {
            package: package.to_string(),
            test: test.to_string(),
            outcome,
            verdict,
        });
    }
}

fn write_products(dir: &Path, summary: &RunSummary) -> Result<()> {
    let write = |name: &str, text: String| {
        let path = dir.join(name);
        fs::write(&path, text).map_err(|e| TestbedError::io(path, e))
    };
    write("summary", summary.summary_text())?;
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| TestbedError::Testbed(format!("cannot serialise summary: {e}")))?;
    write("summary.json", json)?;
    if !summary.kernel_versions.is_empty() {
        let mut text = String::new();
        for change in &summary.kernel_versions {
            let _ = writeln!(
                text,
                "{}\t{}\t{}",
                change.test, change.reboot_marker, change.kernel_version
            );
        }
        write("testbed-kernel-versions", text)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::TestbedConfig;
    use crate::deps::grammar::DebianDepResolver;
    use crate::exec::RunOutcome;
    use crate::testkit::{FakeVirtConfig, FakeVirtServer, ScriptedRunner, exited};

    fn record(outcome: Outcome) -> TestRecord {
        TestRecord {
            package: "p".into(),
            test: "t".into(),
            outcome,
            verdict: String::new(),
        }
    }

    fn spec(name: &str, command: &str, restrictions: &[&str]) -> TestSpec {
        TestSpec {
            name: name.into(),
            command: Some(command.into()),
            restrictions: restrictions.iter().map(|r| r.to_string()).collect(),
            ..TestSpec::default()
        }
    }

    async fn driver(
        caps: &[&str],
        config: TestbedConfig,
        runner: Arc<ScriptedRunner>,
    ) -> (Driver, FakeVirtServer) {
        let (server, transport) = FakeVirtServer::spawn(FakeVirtConfig::with_caps(caps));
        let mut tb =
            Testbed::with_parts(config, runner, Arc::new(DebianDepResolver::default())).unwrap();
        tb.start_with_transport(transport).await.unwrap();
        (Driver::new(tb, RunOptions::default()), server)
    }

    #[test]
    fn exit_codes_combine() {
        let summary = |outcomes: &[Outcome]| RunSummary {
            records: outcomes.iter().copied().map(record).collect(),
            ..RunSummary::default()
        };
        assert_eq!(summary(&[Outcome::Pass]).exit_code(), 0);
        assert_eq!(summary(&[Outcome::Pass, Outcome::Skip]).exit_code(), 2);
        assert_eq!(summary(&[Outcome::Fail, Outcome::Flaky]).exit_code(), 6);
        assert_eq!(summary(&[]).exit_code(), 8);
        assert_eq!(summary(&[Outcome::Skip]).exit_code(), 10);
        assert_eq!(summary(&[Outcome::Pass, Outcome::Badpkg]).exit_code(), 12);
        let fatal = RunSummary {
            fatal: Some("boom".into()),
            ..summary(&[Outcome::Pass])
        };
        assert_eq!(fatal.exit_code(), 16);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mixed_package_results_and_summary_files() {
        let out = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("run-fail", exited(1, "", ""));
        let config = TestbedConfig {
            output_dir: Some(out.path().to_path_buf()),
            ..TestbedConfig::default()
        };
        let (driver, server) = driver(&[], config, runner).await;
        let packages = vec![Package {
            name: "hello".into(),
            tree: src.path().to_path_buf(),
            tests: vec![
                spec("ok", "run-ok", &[]),
                spec("bad", "run-fail", &[]),
                spec("reboots", "run-ok", &["needs-reboot"]),
            ],
        }];
        let summary = driver.run(&packages).await;

        let outcomes: Vec<Outcome> = summary.records.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, [Outcome::Pass, Outcome::Fail, Outcome::Skip]);
        assert_eq!(summary.exit_code(), 6);
        assert_eq!(server.count("quit"), 1);

        let text = fs::read_to_string(out.path().join("summary")).unwrap();
        let failed = format!("{:<20} FAIL non-zero exit status 1\n", "bad");
        assert!(text.contains(&failed), "{text}");
        assert!(text.contains(&format!("{:<20} SKIP Test restriction", "reboots")), "{text}");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.path().join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(json["records"][0]["outcome"], "pass");
        assert!(!out.path().join("testbed-kernel-versions").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn setup_failure_stops_the_run() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("dpkg --print-architecture", exited(1, "", ""));
        let (driver, _server) = driver(&[], TestbedConfig::default(), runner).await;
        let packages = vec![Package {
            name: "p".into(),
            tree: PathBuf::from("/nonexistent"),
            tests: vec![spec("t", "true", &[])],
        }];
        let summary = driver.run(&packages).await;
        assert!(summary.fatal.is_some());
        assert_eq!(summary.exit_code(), 16);
        assert!(summary.records.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn setup_exit_100_fails_only_that_package() {
        let src = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("flaky-setup", exited(100, "", ""));
        runner.on("flaky-setup", exited(0, "", ""));
        let config = TestbedConfig {
            setup_commands: vec!["flaky-setup".into()],
            ..TestbedConfig::default()
        };
        let (driver, server) = driver(&[], config, runner.clone()).await;
        let packages = vec![
            Package {
                name: "first".into(),
                tree: src.path().to_path_buf(),
                tests: vec![spec("never", "true", &[])],
            },
            Package {
                name: "second".into(),
                tree: src.path().to_path_buf(),
                tests: vec![spec("t", "true", &[])],
            },
        ];
        let summary = driver.run(&packages).await;

        assert!(summary.fatal.is_none(), "{:?}", summary.fatal);
        let outcomes: Vec<(&str, &str, Outcome)> = summary
            .records
            .iter()
            .map(|r| (r.package.as_str(), r.test.as_str(), r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            [("first", "*", Outcome::Badpkg), ("second", "t", Outcome::Pass)]
        );
        assert!(summary.records[0].verdict.contains("status 100"), "{:?}", summary.records[0]);
        assert_eq!(summary.exit_code(), 12);
        assert_eq!(server.count("open"), 2);
        assert_eq!(server.count("close"), 2);
        assert_eq!(runner.count_matching("flaky-setup"), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_timeout_fails_the_test_and_the_run_continues() {
        let src = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("run-hang", RunOutcome::TimedOut);
        let (driver, _server) = driver(&[], TestbedConfig::default(), runner).await;
        let packages = vec![
            Package {
                name: "slow".into(),
                tree: src.path().to_path_buf(),
                tests: vec![spec("hangs", "run-hang", &[]), spec("after", "run-ok", &[])],
            },
            Package {
                name: "other".into(),
                tree: src.path().to_path_buf(),
                tests: vec![spec("fine", "run-ok", &[])],
            },
        ];
        let summary = driver.run(&packages).await;

        assert!(summary.fatal.is_none(), "{:?}", summary.fatal);
        let verdicts: Vec<(&str, &str)> = summary
            .records
            .iter()
            .map(|r| (r.test.as_str(), r.verdict.as_str()))
            .collect();
        assert_eq!(
            verdicts,
            [("hangs", "FAIL timed out"), ("after", "PASS"), ("fine", "PASS")]
        );
        assert_eq!(summary.exit_code(), 4);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn uninstallable_dependencies() {
        let src = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (driver, _server) = driver(&[], TestbedConfig::default(), runner).await;
        let mut skipping = spec("skipper", "true", &["skip-not-installable"]);
        skipping.depends = vec!["Bad Name".into()];
        let mut failing = spec("failer", "true", &[]);
        failing.depends = vec!["Bad Name".into()];
        let never_run = spec("later", "true", &[]);
        let packages = vec![
            Package {
                name: "a".into(),
                tree: src.path().to_path_buf(),
                tests: vec![skipping, failing, never_run],
            },
            Package {
                name: "b".into(),
                tree: src.path().to_path_buf(),
                tests: vec![],
            },
        ];
        let summary = driver.run(&packages).await;
        let outcomes: Vec<(&str, Outcome)> = summary
            .records
            .iter()
            .map(|r| (r.test.as_str(), r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            [
                ("skipper", Outcome::Skip),
                ("failer", Outcome::Badpkg),
                ("*", Outcome::Skip),
            ]
        );
        assert_eq!(summary.exit_code(), 14);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn breaks_testbed_forces_a_revert() {
        let src = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (driver, server) =
            driver(&["revert", "revert-full-system"], TestbedConfig::default(), runner).await;
        let packages = vec![Package {
            name: "p".into(),
            tree: src.path().to_path_buf(),
            tests: vec![
                spec("breaker", "true", &["breaks-testbed"]),
                spec("next", "true", &[]),
            ],
        }];
        let summary = driver.run(&packages).await;
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(server.count("revert"), 1);
    }
}
