//! Test descriptions and their results.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use adt_protocol::{Capabilities, Capability};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{Result, TestbedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Restriction {
    AllowStderr,
    BreaksTestbed,
    BuildNeeded,
    Flaky,
    IsolationContainer,
    IsolationMachine,
    NeedsInternet,
    NeedsReboot,
    NeedsRecommends,
    NeedsRoot,
    NeedsSudo,
    RwBuildTree,
    SkipNotInstallable,
    Skippable,
    Superficial,
}

impl Restriction {
    pub const ALL: [Restriction; 15] = [
        Restriction::AllowStderr,
        Restriction::BreaksTestbed,
        Restriction::BuildNeeded,
        Restriction::Flaky,
        Restriction::IsolationContainer,
        Restriction::IsolationMachine,
        Restriction::NeedsInternet,
        Restriction::NeedsReboot,
        Restriction::NeedsRecommends,
        Restriction::NeedsRoot,
        Restriction::NeedsSudo,
        Restriction::RwBuildTree,
        Restriction::SkipNotInstallable,
        Restriction::Skippable,
        Restriction::Superficial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Restriction::AllowStderr => "allow-stderr",
            Restriction::BreaksTestbed => "breaks-testbed",
            Restriction::BuildNeeded => "build-needed",
            Restriction::Flaky => "flaky",
            Restriction::IsolationContainer => "isolation-container",
            Restriction::IsolationMachine => "isolation-machine",
            Restriction::NeedsInternet => "needs-internet",
            Restriction::NeedsReboot => "needs-reboot",
            Restriction::NeedsRecommends => "needs-recommends",
            Restriction::NeedsRoot => "needs-root",
            Restriction::NeedsSudo => "needs-sudo",
            Restriction::RwBuildTree => "rw-build-tree",
            Restriction::SkipNotInstallable => "skip-not-installable",
            Restriction::Skippable => "skippable",
            Restriction::Superficial => "superficial",
        }
    }

    /// Testbed capabilities the restriction needs; each inner slice must
    /// have at least one member present.
    fn required_caps(self) -> &'static [&'static [Capability]] {
        match self {
            Restriction::BreaksTestbed => &[&[Capability::RevertFullSystem]],
            Restriction::NeedsInternet => &[&[Capability::HasInternet]],
            Restriction::NeedsReboot => &[&[Capability::Reboot]],
            Restriction::NeedsRoot => &[&[Capability::RootOnTestbed]],
            Restriction::IsolationContainer => {
                &[&[Capability::IsolationContainer, Capability::IsolationMachine]]
            }
            Restriction::IsolationMachine => &[&[Capability::IsolationMachine]],
            _ => &[],
        }
    }

    fn implied_deps(self) -> &'static [&'static str] {
        match self {
            Restriction::NeedsSudo => &["sudo"],
            _ => &[],
        }
    }
}

impl FromStr for Restriction {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        Restriction::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dependency already expanded to concrete package names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SynthDep {
    Package(String),
    Alternatives(Vec<String>),
}

/// Test description as written in a test plan.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestSpec {
    pub name: String,
    pub path: Option<String>,
    pub command: Option<String>,
    pub restrictions: Vec<String>,
    pub features: Vec<String>,
    pub depends: Vec<String>,
    pub synth_depends: Vec<SynthDep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Unrun,
    Passed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Test {
    pub name: String,
    pub path: Option<String>,
    pub command: Option<String>,
    pub restrictions: BTreeSet<Restriction>,
    /// Restriction tokens we do not know; fatal for the test unless ignored.
    pub unknown_restrictions: BTreeSet<String>,
    pub features: BTreeSet<String>,
    pub depends: Vec<String>,
    pub synth_depends: Vec<SynthDep>,
    pub result: TestResult,
    pub skipped: bool,
    pub reason: Option<String>,
}

impl Test {
    pub fn new(spec: TestSpec) -> Result<Self> {
        if spec.name.contains('/') {
            return Err(TestbedError::Unsupported {
                test: spec.name,
                reason: "test name may not contain / character".into(),
            });
        }
        if spec.path.is_some() == spec.command.is_some() {
            return Err(TestbedError::InvalidTest {
                test: spec.name,
                reason: "Test must have either path or command".into(),
            });
        }

        let mut restrictions = BTreeSet::new();
        let mut unknown_restrictions = BTreeSet::new();
        for r in spec.restrictions {
            match r.parse::<Restriction>() {
                Ok(known) => {
                    restrictions.insert(known);
                }
                Err(()) => {
                    unknown_restrictions.insert(r);
                }
            }
        }
        let mut depends = spec.depends;
        for r in &restrictions {
            for dep in r.implied_deps() {
                if !depends.iter().any(|d| d == dep) {
                    depends.push(dep.to_string());
                }
            }
        }

        debug!(
            name = %spec.name,
            path = ?spec.path,
            command = ?spec.command,
            ?restrictions,
            ?depends,
            "test defined"
        );
        Ok(Self {
            name: spec.name,
            path: spec.path,
            command: spec.command,
            restrictions,
            unknown_restrictions,
            features: spec.features.into_iter().collect(),
            depends,
            synth_depends: spec.synth_depends,
            result: TestResult::Unrun,
            skipped: false,
            reason: None,
        })
    }

    pub fn has(&self, restriction: Restriction) -> bool {
        self.restrictions.contains(&restriction)
    }

    pub fn passed(&mut self) {
        self.result = TestResult::Passed;
        self.reason = None;
        self.report();
    }

    pub fn set_skipped(&mut self, reason: &str) {
        self.result = TestResult::Passed;
        self.skipped = true;
        self.reason = Some(reason.to_string());
        self.report();
    }

    pub fn failed(&mut self, reason: &str) {
        self.result = TestResult::Failed;
        self.reason = Some(reason.to_string());
        self.report();
    }

    /// The summary line verdict, e.g. `FAIL non-zero exit status 1`.
    pub fn verdict(&self) -> String {
        let reason = self.reason.as_deref().unwrap_or("");
        let verdict = match (self.result, self.skipped) {
            (_, true) => format!("SKIP {reason}"),
            (TestResult::Passed, false) if self.has(Restriction::Superficial) => {
                "PASS (superficial)".to_string()
            }
            (TestResult::Passed, false) => "PASS".to_string(),
            (TestResult::Failed, false) if self.has(Restriction::Flaky) => format!("FLAKY {reason}"),
            (TestResult::Failed, false) => format!("FAIL {reason}"),
            (TestResult::Unrun, false) => "UNRUN".to_string(),
        };
        verdict.trim_end().to_string()
    }

    fn report(&self) {
        info!("{:<20} {}", self.name, self.verdict());
    }

    /// Reject restrictions this testbed cannot provide.
    pub fn check_testbed_compat(&self, caps: &Capabilities, ignore: &[String]) -> Result<()> {
        let ignored = |name: &str| ignore.iter().any(|i| i == name);
        if let Some(unknown) = self.unknown_restrictions.iter().find(|r| !ignored(r)) {
            return Err(self.unsupported(format!("unknown restriction {unknown}")));
        }
        for r in self.restrictions.iter().filter(|r| !ignored(r.as_str())) {
            for any_of in r.required_caps() {
                if any_of.iter().any(|c| caps.has(*c)) {
                    continue;
                }
                let needed = match any_of {
                    [single] => format!("\"{single}\""),
                    _ => {
                        let mut names: Vec<String> = any_of.iter().map(|c| format!("\"{c}\"")).collect();
                        names.sort();
                        let last = names.pop().unwrap_or_default();
                        format!("{} and/or {last}", names.join(", "))
                    }
                };
                return Err(self.unsupported(format!(
                    "Test restriction \"{r}\" requires testbed capability {needed}"
                )));
            }
        }
        Ok(())
    }

    fn unsupported(&self, reason: String) -> TestbedError {
        TestbedError::Unsupported {
            test: self.name.clone(),
            reason,
        }
    }
}
