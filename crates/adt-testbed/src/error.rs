use std::path::PathBuf;

use adt_protocol::TransportError;
use thiserror::Error;

use crate::exec::ExecKind;

/// How far a failure propagates through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the whole run; the testbed is unusable.
    Fatal,
    /// Skip the remaining tests of the current package.
    PackageScoped,
    /// Fail the current test only.
    TestScoped,
}

#[derive(Debug, Error)]
pub enum TestbedError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("testbed failure: {0}")]
    Testbed(String),
    #[error("{0}")]
    Command(String),
    #[error("testbed auxverb failed with exit code {0}")]
    Auxverb(i32),
    #[error("timed out on command \"{command}\" (kind: {kind})")]
    Timeout { command: String, kind: ExecKind },
    #[error("erroneous package: {0}")]
    BadPackage(String),
    #[error("test {test} is not supported: {reason}")]
    Unsupported { test: String, reason: String },
    #[error("invalid test description for {test}: {reason}")]
    InvalidTest { test: String, reason: String },
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TestbedError {
    pub fn severity(&self) -> Severity {
        match self {
            TestbedError::Timeout {
                kind: ExecKind::Test,
                ..
            } => Severity::TestScoped,
            TestbedError::BadPackage(_)
            | TestbedError::Unsupported { .. }
            | TestbedError::InvalidTest { .. } => Severity::PackageScoped,
            _ => Severity::Fatal,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TestbedError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_test_timeouts_are_test_scoped() {
        let test_timeout = TestbedError::Timeout {
            command: "x".into(),
            kind: ExecKind::Test,
        };
        let install_timeout = TestbedError::Timeout {
            command: "x".into(),
            kind: ExecKind::Install,
        };
        assert_eq!(test_timeout.severity(), Severity::TestScoped);
        assert_eq!(install_timeout.severity(), Severity::Fatal);
    }

    #[test]
    fn package_errors_are_package_scoped() {
        assert_eq!(
            TestbedError::BadPackage("boom".into()).severity(),
            Severity::PackageScoped
        );
        assert_eq!(
            TestbedError::Unsupported {
                test: "t".into(),
                reason: "needs reboot".into()
            }
            .severity(),
            Severity::PackageScoped
        );
        assert_eq!(TestbedError::Auxverb(255).severity(), Severity::Fatal);
        assert_eq!(TestbedError::Testbed("x".into()).severity(), Severity::Fatal);
    }
}
