//! The `null` backend: the testbed is the local host.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use adt_protocol::{Reply, Request, Verb, read_request, write_reply};
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::VirtError;

/// Scratch dirs are removed on `close`, `quit`, or when the server is
/// dropped.
#[derive(Debug, Default)]
pub struct NullServer {
    scratch: Option<TempDir>,
}

impl NullServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scratch(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Send the banner and answer requests until `quit` or end of input.
    pub async fn serve<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<(), VirtError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_reply(&mut writer, &Reply::ok())
            .await
            .map_err(VirtError::Channel)?;
        while let Some(request) = read_request(&mut reader).await.map_err(VirtError::Channel)? {
            debug!(verb = %request.verb, args = ?request.args, "request");
            if request.verb == Verb::Quit.as_str() {
                break;
            }
            let reply = match self.handle(&request).await {
                Ok(results) => Reply::ok_with(results),
                Err(err) => {
                    warn!("{}: {err}", request.verb);
                    Reply::error(err.to_string())
                }
            };
            write_reply(&mut writer, &reply)
                .await
                .map_err(VirtError::Channel)?;
        }
        self.scratch = None;
        info!("null testbed finished");
        Ok(())
    }

    async fn handle(&mut self, request: &Request) -> Result<Vec<String>, VirtError> {
        let verb =
            Verb::parse(&request.verb).ok_or_else(|| VirtError::UnknownVerb(request.verb.clone()))?;
        let args = &request.args;
        check_arity(verb, args.len())?;
        match verb {
            Verb::Open => {
                if self.scratch.is_some() {
                    return Err(VirtError::AlreadyOpen);
                }
                let dir = tempfile::Builder::new()
                    .prefix("adt-virt-null.")
                    .tempdir()
                    .map_err(VirtError::io("create", env::temp_dir()))?;
                let path = dir.path().to_string_lossy().into_owned();
                info!("opened null testbed in {path}");
                self.scratch = Some(dir);
                Ok(vec![path])
            }
            Verb::PrintExecuteCommand => Ok(vec!["env".into()]),
            Verb::Capabilities => Ok(self
                .scratch()
                .map(|s| format!("downtmp-host={}", s.display()))
                .into_iter()
                .collect()),
            Verb::Copydown | Verb::Copyup => {
                self.require_open()?;
                copy(&args[0], &args[1])?;
                Ok(Vec::new())
            }
            Verb::Close => {
                self.require_open()?;
                self.scratch = None;
                Ok(Vec::new())
            }
            Verb::Revert => Err(VirtError::Unsupported("revert")),
            Verb::Reboot => Err(VirtError::Unsupported("reboot")),
            Verb::Shell => {
                self.require_open()?;
                run_shell(&args[0], &args[1..]).await?;
                Ok(Vec::new())
            }
            Verb::AuxverbDebugFail | Verb::Quit => Ok(Vec::new()),
        }
    }

    fn require_open(&self) -> Result<(), VirtError> {
        match self.scratch {
            Some(_) => Ok(()),
            None => Err(VirtError::NotOpen),
        }
    }
}

fn check_arity(verb: Verb, got: usize) -> Result<(), VirtError> {
    let (ok, expected) = match verb {
        Verb::Copydown | Verb::Copyup => (got == 2, "2"),
        Verb::Reboot => (got <= 1, "at most 1"),
        Verb::Shell => (got >= 1, "at least 1"),
        _ => (got == 0, "no"),
    };
    if ok {
        Ok(())
    } else {
        Err(VirtError::Arity {
            verb: verb.as_str(),
            expected,
            got,
        })
    }
}

/// Copy a file, or a directory tree when `src` ends in `/`.
fn copy(src: &str, dst: &str) -> Result<(), VirtError> {
    debug!("copy {src} -> {dst}");
    if !src.ends_with('/') {
        let dst = Path::new(dst);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(VirtError::io("create", parent))?;
        }
        fs::copy(src, dst).map_err(VirtError::io("copy", src))?;
        return Ok(());
    }

    let root = Path::new(src);
    let target = Path::new(dst);
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| VirtError::Io {
            op: "walk",
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let out: PathBuf = target.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(VirtError::io("create", &out))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(VirtError::io("readlink", entry.path()))?;
            let _ = fs::remove_file(&out);
            std::os::unix::fs::symlink(&link, &out).map_err(VirtError::io("symlink", &out))?;
        } else {
            fs::copy(entry.path(), &out).map_err(VirtError::io("copy", entry.path()))?;
        }
    }
    Ok(())
}

/// Interactive shell on our terminal. Stdout stays reserved for replies.
async fn run_shell(cwd: &str, env: &[String]) -> Result<(), VirtError> {
    let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
    let stdin = fs::File::open("/dev/tty").map(Stdio::from).unwrap_or_else(|_| Stdio::null());
    let mut command = Command::new(&shell);
    command
        .current_dir(cwd)
        .stdin(stdin)
        .stdout(std::io::stderr())
        .stderr(std::io::stderr());
    for assignment in env {
        if let Some((name, value)) = assignment.split_once('=') {
            command.env(name, value.trim_matches('"'));
        }
    }
    let status = command
        .status()
        .await
        .map_err(VirtError::io("spawn", &shell))?;
    debug!("shell exited with {status}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adt_protocol::{Transport, TransportError};
    use tokio::io::{BufReader, duplex};

    fn spawn_server() -> (Transport, tokio::task::JoinHandle<Result<(), VirtError>>) {
        let (client_w, server_r) = duplex(4096);
        let (server_w, client_r) = duplex(4096);
        let task = tokio::spawn(async move {
            NullServer::new().serve(BufReader::new(server_r), server_w).await
        });
        (Transport::new(client_r, client_w), task)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn open_copy_close_lifecycle() {
        let host = tempfile::tempdir().unwrap();
        fs::create_dir_all(host.path().join("tree/sub")).unwrap();
        fs::write(host.path().join("tree/sub/file"), "data").unwrap();

        let (mut t, task) = spawn_server();
        t.expect("ok", Some(0)).await.unwrap();
        let scratch = t.command(Verb::Open, &[], Some(1)).await.unwrap().remove(0);
        assert!(Path::new(&scratch).is_dir());

        let caps = t.command(Verb::Capabilities, &[], None).await.unwrap();
        assert_eq!(caps, vec![format!("downtmp-host={scratch}")]);
        let exec = t.command(Verb::PrintExecuteCommand, &[], Some(1)).await.unwrap();
        assert_eq!(exec, vec!["env".to_string()]);

        let src = format!("{}/tree/", host.path().display());
        let dst = format!("{scratch}/tree/");
        t.command(Verb::Copydown, &[&src, &dst], Some(0)).await.unwrap();
        assert_eq!(fs::read_to_string(format!("{scratch}/tree/sub/file")).unwrap(), "data");

        let up = host.path().join("back/file");
        let up = up.to_string_lossy();
        t.command(Verb::Copyup, &[&format!("{scratch}/tree/sub/file"), &up], Some(0))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(host.path().join("back/file")).unwrap(), "data");

        t.command(Verb::Close, &[], Some(0)).await.unwrap();
        assert!(!Path::new(&scratch).exists());
        t.send("quit").await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unsupported_and_malformed_requests_get_error_replies() {
        let (mut t, _task) = spawn_server();
        t.expect("ok", Some(0)).await.unwrap();
        let err = t.command(Verb::Revert, &[], Some(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedReply { .. }), "{err}");
        // server keeps answering after an error
        t.send("copydown onlyone").await.unwrap();
        let err = t.expect("ok", None).await.unwrap_err();
        assert!(err.to_string().contains("copydown takes 2 arguments"), "{err}");
        t.send("frobnicate").await.unwrap();
        assert!(t.expect("ok", None).await.is_err());
        t.send("close").await.unwrap();
        assert!(t.expect("ok", None).await.is_err());
    }

    #[test]
    fn arity_rules() {
        assert!(check_arity(Verb::Reboot, 1).is_ok());
        assert!(check_arity(Verb::Reboot, 2).is_err());
        assert!(check_arity(Verb::Shell, 0).is_err());
        assert!(check_arity(Verb::Open, 1).is_err());
    }
}
