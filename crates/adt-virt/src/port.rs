//! Claiming a free local TCP port for a backend's forwarded services.
//!
//! Backends starting concurrently must not pick the same port, so a
//! candidate is first claimed through an exclusively created, locked marker
//! file, and only then tried with a connect.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

const RANGE: u16 = 50;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// First free port in `[start, start + 50)`, or `None` when all are taken.
pub fn find_free_port(start: u16) -> Option<u16> {
    find_free_port_in(Path::new("/tmp"), start)
}

/// Like [`find_free_port`], with marker files created under `marker_dir`.
pub fn find_free_port_in(marker_dir: &Path, start: u16) -> Option<u16> {
    let end = start.saturating_add(RANGE);
    for port in start..end {
        debug!("find_free_port: trying {port}");
        if !claim(marker_dir, port) {
            debug!("find_free_port: {port} is locked");
            continue;
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
            // something is listening
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                debug!("find_free_port: {port} is free");
                return Some(port);
            }
            Err(_) => continue,
        }
    }
    debug!("find_free_port: all ports are taken");
    None
}

/// Exclusively create the marker, unlink it, and lock the open file.
fn claim(marker_dir: &Path, port: u16) -> bool {
    let marker = marker_dir.join(format!("adt-virt.port.{port}"));
    let Ok(file) = OpenOptions::new().write(true).create_new(true).open(&marker) else {
        return false;
    };
    if std::fs::remove_file(&marker).is_err() {
        return false;
    }
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn listening_port_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let found = find_free_port_in(dir.path(), taken);
        assert_ne!(found, Some(taken));
        if let Some(port) = found {
            assert!(port > taken && port < taken.saturating_add(RANGE));
        }
    }

    #[test]
    fn existing_marker_blocks_the_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("adt-virt.port.40001"), "").unwrap();
        assert!(!claim(dir.path(), 40001));
        assert!(claim(dir.path(), 40002));
        assert!(!dir.path().join("adt-virt.port.40002").exists());
    }
}
