//! Test dependency installation.
//!
//! Dependencies are declared by a throwaway package which is unpacked and
//! then completed with `apt-get --fix-broken install`. Download failures are
//! retried, unsatisfiable resolutions relax apt pins one at a time.

pub mod grammar;

use std::fs;

use adt_protocol::Capability;
use tracing::{debug, info, warn};

use crate::exec::{ExecKind, ExecOptions, Stream};
use crate::resource::{DirKind, TempResource};
use crate::session::Testbed;
use crate::setup::{default_release_pin_file, pin_file};
use crate::testdesc::SynthDep;
use crate::{Result, TestbedError};

pub const SATDEP_PACKAGE: &str = "adt-satdep";
const DOWNLOAD_ATTEMPTS: u32 = 3;
const APT_MARK_BATCH: usize = 20;

/// Why an `apt-get install` run failed.
#[derive(Debug)]
pub(crate) enum AptFailure {
    /// Only download progress was reported; probably a flaky mirror.
    Download,
    /// Resolution or installation itself failed.
    Permanent,
    Testbed(TestbedError),
}

impl From<TestbedError> for AptFailure {
    fn from(err: TestbedError) -> Self {
        AptFailure::Testbed(err)
    }
}

/// Classify apt's status-fd output of a failed install.
pub(crate) fn classify_apt_failure(status: &str) -> AptFailure {
    if status.contains("dlstatus:") && !status.contains("pmstatus:") {
        AptFailure::Download
    } else {
        AptFailure::Permanent
    }
}

/// Names of the packages an `apt-get --simulate purge` would remove.
pub(crate) fn simulated_purges(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.strip_prefix("Purg "))
        .filter_map(|l| l.split_whitespace().next())
        .filter(|p| *p != SATDEP_PACKAGE)
        .map(str::to_string)
        .collect()
}

/// Control file of the throwaway package.
pub(crate) fn satdep_control(arch: &str, deps: &str) -> String {
    format!(
        "Package: {SATDEP_PACKAGE}\n\
         Section: oldlibs\n\
         Priority: extra\n\
         Maintainer: autogenerated\n\
         Version: 0\n\
         Architecture: {arch}\n\
         Depends: {deps}\n\
         Description: satisfy test dependencies\n"
    )
}

/// Whether `provides` (a dpkg `${Provides}` value) names `package`.
fn provides_package(provides: &str, package: &str) -> bool {
    provides
        .split(',')
        .filter_map(|p| p.split_whitespace().next())
        .any(|p| p == package)
}

impl Testbed {
    /// Install `deps` for the next test. Nothing happens for an empty list.
    pub async fn install_deps(
        &mut self,
        deps: &[String],
        synth_deps: &[SynthDep],
        shell_on_failure: bool,
    ) -> Result<()> {
        debug!(?deps, "install_deps");
        self.deps_installed = deps.to_vec();
        if deps.is_empty() {
            return Ok(());
        }
        self.satisfy_dependencies_string(&deps.join(", "), "install-deps", false, shell_on_failure, synth_deps)
            .await
    }

    pub async fn satisfy_dependencies_string(
        &mut self,
        deps: &str,
        what: &str,
        build_dep: bool,
        shell_on_failure: bool,
        synth_deps: &[SynthDep],
    ) -> Result<()> {
        debug!("{what}: satisfying {deps}");
        let deps = self
            .resolver
            .resolve(&deps.replace(":native", ""), &self.dpkg_arch, build_dep)
            .map_err(|e| TestbedError::BadPackage(format!("{what}: {e}")))?;
        debug!("{what}: architecture resolved: {deps}");

        let can_apt_get = self.has_cap(Capability::RootOnTestbed)
            && self
                .execute(&["test", "-w", "/var/lib/dpkg/status"], ExecOptions::default())
                .await?
                .code
                == 0;
        debug!("can use apt-get on testbed: {can_apt_get}");

        if can_apt_get {
            return self.install_apt(&deps, shell_on_failure, synth_deps).await;
        }

        let quiet = ExecOptions {
            stdout: Stream::Null,
            stderr: Stream::Null,
            ..ExecOptions::default()
        };
        let has_checkbuilddeps = self
            .execute(&["sh", "-ec", "command -v dpkg-checkbuilddeps"], quiet)
            .await?
            .code
            == 0;
        if has_checkbuilddeps {
            let check = self
                .execute(&["dpkg-checkbuilddeps", "-d", &deps, "/dev/null"], ExecOptions::capture())
                .await?;
            if check.code != 0 {
                let missing = check
                    .stderr_str()
                    .replace("dpkg-checkbuilddeps: error: Unmet build dependencies: ", "");
                return Err(TestbedError::BadPackage(format!(
                    "test dependencies missing: {}",
                    missing.trim()
                )));
            }
        } else {
            warn!(
                "test dependencies ({deps}) are not fully satisfied, but continuing anyway since \
                 dpkg-checkbuilddeps is not available to determine which ones are missing"
            );
        }
        Ok(())
    }

    /// Install through apt; requires root and a writable package database.
    async fn install_apt(
        &mut self,
        deps: &str,
        shell_on_failure: bool,
        synth_deps: &[SynthDep],
    ) -> Result<()> {
        let deb = self.build_satdep(deps).await?;
        deb.copydown(self, false, None).await?;

        let mut download_attempts = DOWNLOAD_ATTEMPTS;
        loop {
            self.check_exec(&["dpkg", "--unpack", deb.testbed()], true)
                .await?;

            let rc = match self.apt_fix_broken(synth_deps).await {
                Ok(()) => {
                    // apt may "fix" things by removing the satdep package
                    self.execute(&["dpkg", "--status", SATDEP_PACKAGE], ExecOptions::capture())
                        .await?
                        .code
                }
                Err(AptFailure::Download) => {
                    download_attempts -= 1;
                    if download_attempts > 0 {
                        warn!(
                            "apt failed to download packages, retrying in {}s...",
                            self.config.apt_retry_delay_secs
                        );
                        tokio::time::sleep(self.config.apt_retry_delay()).await;
                        continue;
                    }
                    return Err(TestbedError::Testbed(
                        "apt repeatedly failed to download packages".into(),
                    ));
                }
                Err(AptFailure::Permanent) => {
                    if shell_on_failure {
                        self.run_shell(None, &[]).await?;
                    }
                    -1
                }
                Err(AptFailure::Testbed(err)) => return Err(err),
            };

            if rc != 0 {
                if self.config.enable_apt_fallback {
                    if let Some(release) = self.apt_pin_for_releases.pop() {
                        warn!(
                            "Test dependencies are unsatisfiable with using apt pinning. \
                             Retrying with using all packages from {release}"
                        );
                        let rm = format!("rm -f {}", pin_file(&release));
                        self.check_exec(&["/bin/sh", "-ec", &rm], false).await?;
                        if self.apt_pin_for_releases.is_empty() {
                            let rm = format!("rm -f {}", default_release_pin_file());
                            self.check_exec(&["/bin/sh", "-ec", &rm], false).await?;
                        }
                        continue;
                    }
                }

                warn!(
                    "Test dependencies are unsatisfiable - calling apt install on test deps \
                     directly for further data about failing dependencies in test logs"
                );
                let simulate = format!("--simulate {}", deps.replace(',', ""));
                // only run for the log
                if let Err(AptFailure::Testbed(err)) = self.run_apt_install(&simulate, true).await {
                    return Err(err);
                }
                if shell_on_failure {
                    self.run_shell(None, &[]).await?;
                }
                let reason = if self.config.enable_apt_fallback {
                    "Test dependencies are unsatisfiable. A common reason is that your testbed is \
                     out of date with respect to the archive, and you need to use a current \
                     testbed or run apt-get update or use -U."
                } else {
                    "Test dependencies are unsatisfiable. A common reason is that the requested \
                     apt pinning prevented dependencies from the non-default suite to be \
                     installed. In that case you need to add those dependencies to the pinning \
                     list."
                };
                return Err(TestbedError::BadPackage(reason.into()));
            }
            break;
        }

        self.keep_installed_deps().await
    }

    /// Build the throwaway package on the host.
    async fn build_satdep(&mut self, deps: &str) -> Result<TempResource> {
        let pkgdir = tempfile::Builder::new()
            .prefix("adt-satdep.")
            .tempdir()
            .map_err(|e| TestbedError::io(std::env::temp_dir(), e))?;
        let debian = pkgdir.path().join("DEBIAN");
        fs::create_dir(&debian).map_err(|e| TestbedError::io(&debian, e))?;
        let control = debian.join("control");
        fs::write(&control, satdep_control(&self.dpkg_arch, deps))
            .map_err(|e| TestbedError::io(&control, e))?;
        set_mode(pkgdir.path(), 0o755)?;
        set_mode(&debian, 0o755)?;

        let deb = TempResource::new(self, &format!("{SATDEP_PACKAGE}.deb"), DirKind::File, true)?;
        let pkgdir_arg = pkgdir.path().to_string_lossy();
        let deb_arg = deb.host().to_string_lossy();
        let built = self
            .run_host(&["dpkg-deb", "-Zxz", "-b", &pkgdir_arg, &deb_arg])
            .await?;
        if built.code != 0 {
            return Err(TestbedError::Testbed(format!(
                "dpkg-deb failed to build the dependency package: {}",
                built.stderr_str().trim()
            )));
        }
        Ok(deb)
    }

    /// `apt-get --fix-broken install`, then make sure dependencies met only
    /// through Provides get a real package.
    async fn apt_fix_broken(&mut self, synth_deps: &[SynthDep]) -> Result<(), AptFailure> {
        self.run_apt_install("--fix-broken", false).await?;

        let mut need_explicit = Vec::new();
        for dep in synth_deps {
            match dep {
                SynthDep::Package(pkg) => {
                    if self.is_real_package_installed(pkg).await? {
                        continue;
                    }
                    if self.is_virtual_package_installed(pkg).await? {
                        need_explicit.push(pkg.clone());
                        continue;
                    }
                    warn!("package {pkg} is not installed though it should be");
                }
                SynthDep::Alternatives(alternatives) => {
                    let mut virtual_hits = Vec::new();
                    let mut found_real = false;
                    for pkg in alternatives {
                        if self.is_real_package_installed(pkg).await? {
                            found_real = true;
                            break;
                        }
                        if self.is_virtual_package_installed(pkg).await? {
                            virtual_hits.push(pkg.clone());
                        }
                    }
                    if found_real {
                        continue;
                    }
                    let Some(first) = virtual_hits.first() else {
                        warn!("no alternative in {alternatives:?} is installed though one should be");
                        continue;
                    };
                    if virtual_hits.len() > 1 {
                        warn!(
                            "more than one test dependency alternative in {alternatives:?} installed \
                             as a virtual package, installing the first one ({first}) as the real package"
                        );
                    }
                    need_explicit.push(first.clone());
                }
            }
        }

        if !need_explicit.is_empty() {
            debug!("installing real packages of test dependencies: {need_explicit:?}");
            self.run_apt_install(&need_explicit.join(" "), false).await?;
        }
        Ok(())
    }

    pub(crate) async fn run_apt_install(&mut self, what: &str, ignore_rc: bool) -> Result<(), AptFailure> {
        let prefix = self.eatmydata_prefix.clone().unwrap_or_default();
        // status-fd goes to stderr so we can classify failures
        let script = format!(
            "{prefix} apt-get install --assume-yes {what} \
             -o APT::Status-Fd=3 \
             -o APT::Install-Recommends=false \
             -o Dpkg::Options::=--force-confnew \
             -o Debug::pkgProblemResolver=true 3>&2 2>&1"
        );
        let output = self
            .execute(
                &["/bin/sh", "-ec", &script],
                ExecOptions::kind(ExecKind::Install).capture_stderr(),
            )
            .await?;
        if !ignore_rc && output.code != 0 {
            debug!("apt-get install {what} failed; status-fd:\n{}", output.stderr_str());
            return Err(classify_apt_failure(output.stderr_str()));
        }
        Ok(())
    }

    pub async fn is_real_package_installed(&mut self, package: &str) -> Result<bool> {
        let output = self
            .execute(
                &["dpkg-query", "--show", "-f", "${Status}", package],
                ExecOptions::capture(),
            )
            .await?;
        if output.code != 0 {
            if output.stderr_str().contains("no packages found") {
                return Ok(false);
            }
            return Err(TestbedError::BadPackage(format!(
                "Failed to run dpkg-query: {} (exit code {})",
                output.stderr_str().trim(),
                output.code
            )));
        }
        Ok(output.stdout_str() == "install ok installed")
    }

    pub async fn is_virtual_package_installed(&mut self, package: &str) -> Result<bool> {
        let output = self
            .execute(
                &["dpkg-query", "--show", "-f", "${Status} ${Provides}\n", "*"],
                ExecOptions::capture(),
            )
            .await?;
        if output.code != 0 {
            return Err(TestbedError::BadPackage(format!(
                "Failed to run dpkg-query: {} (exit code {})",
                output.stderr_str().trim(),
                output.code
            )));
        }
        Ok(output
            .stdout_str()
            .lines()
            .filter_map(|l| l.strip_prefix("install ok installed "))
            .any(|provides| provides_package(provides, package)))
    }

    /// Purge the satdep package, keeping what it pulled in.
    async fn keep_installed_deps(&mut self) -> Result<()> {
        let out = self
            .check_exec(
                &[
                    "apt-get",
                    "--simulate",
                    "--quiet",
                    "-o",
                    "APT::Get::Show-User-Simulation-Note=False",
                    "--auto-remove",
                    "purge",
                    SATDEP_PACKAGE,
                ],
                true,
            )
            .await?;
        let test_deps = simulated_purges(&out);
        if !test_deps.is_empty() {
            debug!("marking test dependencies as manually installed: {}", test_deps.join(" "));
            for batch in test_deps.chunks(APT_MARK_BATCH) {
                let mut argv = vec!["apt-mark", "manual", "-qq"];
                argv.extend(batch.iter().map(String::as_str));
                self.check_exec(&argv, false).await?;
            }
        }
        info!("test dependencies installed");
        self.execute(&["dpkg", "--purge", SATDEP_PACKAGE], ExecOptions::default())
            .await?;
        Ok(())
    }
}

fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| TestbedError::io(path, e))
}
