//! Testbed protocol engine: drives a virt-server child, manages the
//! environment's lifecycle, installs test dependencies and runs tests.

pub mod config;
pub mod deps;
pub mod driver;
pub mod error;
pub mod exec;
pub mod packages;
pub mod resource;
pub mod runner;
pub mod scripts;
pub mod session;
mod setup;
pub mod testdesc;

#[cfg(any(feature = "test-support", test))]
pub mod testkit;

pub use config::{CopyFile, NetworkPolicy, TestbedConfig, Timeouts};
pub use deps::grammar::{DebianDepResolver, DepResolver};
pub use driver::{Driver, Outcome, Package, RunOptions, RunSummary, TestRecord};
pub use error::{Severity, TestbedError};
pub use exec::{CommandRunner, ExecKind, ExecOptions, ExecOutput, ProcessRunner, RunOutcome};
pub use resource::{DirKind, ResourcePath, TempResource};
pub use runner::RunTestOptions;
pub use session::{KernelVersionChange, Testbed, TestbedState};
pub use testdesc::{Restriction, SynthDep, Test, TestResult, TestSpec};

pub type Result<T, E = TestbedError> = std::result::Result<T, E>;
