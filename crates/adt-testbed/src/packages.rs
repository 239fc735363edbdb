//! Installed-package lists kept in the output directory.

use std::collections::HashSet;
use std::fs;

use tracing::debug;

use crate::exec::ExecOptions;
use crate::resource::{DirKind, TempResource};
use crate::session::Testbed;
use crate::{Result, TestbedError};

pub const BASELINE_FILE: &str = "testbed-packages";

pub(crate) const LIST_SCRIPT: &str = "dpkg-query --show -f '${Package}\\t${Version}\\n'";

/// Lines of `all` (`name<TAB>version`) whose package name does not occur in
/// `baseline`.
pub fn filter_new_packages(baseline: &str, all: &str) -> String {
    let known: HashSet<&str> = baseline.lines().map(package_name).collect();
    all.lines()
        .filter(|line| !line.is_empty() && !known.contains(package_name(line)))
        .fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
}

fn package_name(line: &str) -> &str {
    line.split('\t').next().unwrap_or(line)
}

impl Testbed {
    pub(crate) async fn has_dpkg_query(&mut self) -> Result<bool> {
        let out = self
            .execute(&["sh", "-ec", "command -v dpkg-query"], ExecOptions::capture())
            .await?;
        Ok(out.code == 0)
    }

    /// Write `<test>-packages` with what the test run added on top of the
    /// baseline list.
    pub(crate) async fn record_test_packages(&mut self, test_name: &str) -> Result<()> {
        let Some(output_dir) = self.output_dir().map(|d| d.to_path_buf()) else {
            return Ok(());
        };
        if !self.has_dpkg_query().await? {
            return Ok(());
        }
        let all = TempResource::new(self, &format!("{test_name}-packages.all"), DirKind::File, true)?;
        let script = format!("{LIST_SCRIPT} > {}", all.testbed());
        self.check_exec(&["sh", "-ec", &script], false).await?;
        all.copyup(self, false).await?;

        let baseline_path = output_dir.join(BASELINE_FILE);
        let baseline = match fs::read_to_string(&baseline_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(TestbedError::io(baseline_path, err)),
        };
        let listed = fs::read_to_string(all.host()).map_err(|e| TestbedError::io(all.host(), e))?;
        let delta = filter_new_packages(&baseline, &listed);
        let out = output_dir.join(format!("{test_name}-packages"));
        debug!("recording {} test specific packages in {}", delta.lines().count(), out.display());
        fs::write(&out, delta).map_err(|e| TestbedError::io(&out, e))
    }
}
