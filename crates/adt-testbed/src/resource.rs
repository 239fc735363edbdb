//! Host/testbed path pairs and the temporary files built on them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use adt_protocol::Verb;
use tracing::{debug, warn};

use crate::exec::ExecOptions;
use crate::session::Testbed;
use crate::{Result, TestbedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// Only valid for copydown, which looks at the host path.
    Unknown,
    File,
    Dir,
}

/// A file or directory known under one path on the host and another inside
/// the testbed. Neither needs to exist until it is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub host: PathBuf,
    pub testbed: String,
    pub kind: DirKind,
}

impl ResourcePath {
    pub fn new(host: impl Into<PathBuf>, testbed: impl Into<String>, kind: DirKind) -> Self {
        Self {
            host: host.into(),
            testbed: testbed.into(),
            kind,
        }
    }

    /// Copy host to testbed. With `check_existing`, an existing testbed path
    /// is left alone.
    pub async fn copydown(
        &self,
        tb: &mut Testbed,
        check_existing: bool,
        mode: Option<&str>,
    ) -> Result<()> {
        if check_existing
            && tb
                .execute(&["test", "-e", &self.testbed], ExecOptions::default())
                .await?
                .code
                == 0
        {
            debug!("copydown: testbed path {} already exists", self.testbed);
            return Ok(());
        }

        let parent = testbed_parent(&self.testbed);
        tb.check_exec(&["mkdir", "-p", parent], false).await?;

        let host = self.host.to_string_lossy();
        if self.host.is_dir() {
            let src = format!("{host}/");
            let dst = format!("{}/", self.testbed);
            tb.command(Verb::Copydown, &[&src, &dst], Some(0)).await?;
        } else {
            tb.command(Verb::Copydown, &[&host, &self.testbed], Some(0))
                .await?;
        }

        if let Some(mode) = mode {
            tb.check_exec(&["chmod", "-R", mode, "--", &self.testbed], false)
                .await?;
        } else if let Some(user) = tb.user().map(str::to_string) {
            let rc = tb
                .execute(
                    &["chown", "-R", &user, "--", &self.testbed],
                    ExecOptions::default().capture_stderr(),
                )
                .await?
                .code;
            if rc != 0 {
                // Shared download dirs often refuse chown.
                tb.check_exec(&["chmod", "-R", "go+rwX", "--", &self.testbed], false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Copy testbed to host. With `check_existing`, an existing host path is
    /// left alone.
    pub async fn copyup(&self, tb: &mut Testbed, check_existing: bool) -> Result<()> {
        if check_existing && self.host.exists() {
            debug!("copyup: host path {} already exists", self.host.display());
            return Ok(());
        }
        if let Some(parent) = self.host.parent() {
            fs::create_dir_all(parent).map_err(|e| TestbedError::io(parent, e))?;
        }
        let host = self.host.to_string_lossy();
        match self.kind {
            DirKind::Dir => {
                let src = format!("{}/", self.testbed);
                let dst = format!("{host}/");
                tb.command(Verb::Copyup, &[&src, &dst], Some(0)).await?;
            }
            DirKind::File => {
                tb.command(Verb::Copyup, &[&self.testbed, &host], Some(0))
                    .await?;
            }
            DirKind::Unknown => {
                return Err(TestbedError::Testbed(format!(
                    "copyup of {} with unknown file type",
                    self.testbed
                )));
            }
        }
        Ok(())
    }
}

fn testbed_parent(path: &str) -> &str {
    match Path::new(path).parent().and_then(Path::to_str) {
        Some("") | None => "/",
        Some(parent) => parent,
    }
}

/// A path in the testbed's scratch dir mirrored in a host temp dir.
///
/// Auto-cleaned handles get a session-unique numeric prefix and remove their
/// host copy when dropped. Kept handles use the bare name, so their host
/// path is predictable (the output directory when one is configured).
#[derive(Debug)]
pub struct TempResource {
    path: ResourcePath,
    auto_clean: bool,
}

impl TempResource {
    pub fn new(tb: &mut Testbed, name: &str, kind: DirKind, auto_clean: bool) -> Result<Self> {
        let scratch = tb
            .scratch()
            .ok_or_else(|| TestbedError::Testbed("testbed is not open".into()))?
            .to_string();
        let host_base = tb.temp_host_base(auto_clean);
        let name = if auto_clean {
            format!("{}-{name}", tb.next_temp_id())
        } else {
            name.to_string()
        };
        Ok(Self {
            path: ResourcePath::new(host_base.join(&name), format!("{scratch}/{name}"), kind),
            auto_clean,
        })
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn host(&self) -> &Path {
        &self.path.host
    }

    pub fn testbed(&self) -> &str {
        &self.path.testbed
    }

    pub fn auto_clean(&self) -> bool {
        self.auto_clean
    }

    /// Drop the host copy together with this handle.
    pub fn set_auto_clean(&mut self, auto_clean: bool) {
        self.auto_clean = auto_clean;
    }

    pub async fn copydown(
        &self,
        tb: &mut Testbed,
        check_existing: bool,
        mode: Option<&str>,
    ) -> Result<()> {
        self.path.copydown(tb, check_existing, mode).await
    }

    pub async fn copyup(&self, tb: &mut Testbed, check_existing: bool) -> Result<()> {
        self.path.copyup(tb, check_existing).await
    }
}

impl Drop for TempResource {
    fn drop(&mut self) {
        if !self.auto_clean {
            return;
        }
        let host = &self.path.host;
        let result = match fs::symlink_metadata(host) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(host),
            Ok(_) => fs::remove_file(host),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("cannot remove temporary file {}: {err}", host.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::TestbedConfig;
    use crate::DebianDepResolver;
    use crate::testkit::{FakeVirtConfig, FakeVirtServer, ScriptedRunner};

    async fn open_testbed(caps: &[&str], output_dir: Option<&Path>) -> (Testbed, FakeVirtServer) {
        let (server, transport) = FakeVirtServer::spawn(FakeVirtConfig::with_caps(caps));
        let config = TestbedConfig {
            output_dir: output_dir.map(Path::to_path_buf),
            ..TestbedConfig::default()
        };
        let mut tb = Testbed::with_parts(
            config,
            Arc::new(ScriptedRunner::new()),
            Arc::new(DebianDepResolver::default()),
        )
        .unwrap();
        tb.start_with_transport(transport).await.unwrap();
        tb.open().await.unwrap();
        (tb, server)
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test(flavor = "current_thread")]
    async fn auto_clean_removes_the_host_copy_and_kept_files_stay_put() {
        let out = tempfile::tempdir().unwrap();
        let (mut tb, _server) = open_testbed(&[], Some(out.path())).await;

        let cleaned = TempResource::new(&mut tb, "stdout", DirKind::File, true).unwrap();
        let other = TempResource::new(&mut tb, "stdout", DirKind::File, true).unwrap();
        let kept = TempResource::new(&mut tb, "log", DirKind::File, false).unwrap();
        assert_ne!(cleaned.host(), other.host());
        assert_eq!(kept.host(), out.path().join("log"));
        assert_eq!(kept.testbed(), "/scratch/log");
        assert!(cleaned.testbed().starts_with("/scratch/"));
        assert!(cleaned.testbed().ends_with("-stdout"));

        cleaned.copyup(&mut tb, false).await.unwrap();
        kept.copyup(&mut tb, false).await.unwrap();
        let cleaned_host = cleaned.host().to_path_buf();
        assert!(cleaned_host.is_file());
        assert!(kept.host().is_file());

        drop(cleaned);
        drop(other);
        drop(kept);
        assert!(!cleaned_host.exists());
        let names = names_in(out.path());
        assert!(!names.iter().any(|n| n.ends_with("-stdout")), "{names:?}");
        assert_eq!(names.iter().filter(|n| n.as_str() == "log").count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shared_download_dir_holds_temporary_files() {
        let shared = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let cap = format!("downtmp-host={}", shared.path().display());

        let (mut tb, _server) = open_testbed(&[&cap], Some(out.path())).await;
        let cleaned = TempResource::new(&mut tb, "stderr", DirKind::File, true).unwrap();
        let kept = TempResource::new(&mut tb, "log", DirKind::File, false).unwrap();
        assert_eq!(cleaned.host().parent(), Some(shared.path()));
        assert_eq!(kept.host(), out.path().join("log"));
        cleaned.copyup(&mut tb, false).await.unwrap();
        let cleaned_host = cleaned.host().to_path_buf();
        assert!(cleaned_host.is_file());
        drop(cleaned);
        assert!(!cleaned_host.exists());
        drop(kept);

        let (mut tb, _server) = open_testbed(&[&cap], None).await;
        let kept = TempResource::new(&mut tb, "log", DirKind::File, false).unwrap();
        assert_eq!(kept.host(), shared.path().join("log"));
        kept.copyup(&mut tb, false).await.unwrap();
        drop(kept);
        assert!(shared.path().join("log").is_file());
    }

    #[test]
    fn parent_of_testbed_paths() {
        assert_eq!(testbed_parent("/tmp/x/y"), "/tmp/x");
        assert_eq!(testbed_parent("/y"), "/");
        assert_eq!(testbed_parent("y"), "/");
    }
}
