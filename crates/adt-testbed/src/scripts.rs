//! Helper scripts shipped into the testbed.

use std::fs;
use std::io;
use std::path::Path;

/// Script copied into the testbed's scratch dir.
#[derive(Debug, Clone, Copy)]
pub struct Helper {
    pub name: &'static str,
    pub body: &'static str,
}

pub const WRAPPER: Helper = Helper {
    name: "wrapper.sh",
    body: include_str!("../scripts/wrapper.sh"),
};

pub const REBOOT: Helper = Helper {
    name: "autopkgtest-reboot",
    body: include_str!("../scripts/reboot.sh"),
};

pub const REBOOT_PREPARE: Helper = Helper {
    name: "autopkgtest-reboot-prepare",
    body: include_str!("../scripts/reboot-prepare.sh"),
};

pub const ALL: [Helper; 3] = [WRAPPER, REBOOT, REBOOT_PREPARE];

/// Passed inline to `sh -euc`; `$1` optionally names the user.
pub const CREATE_NORMAL_USER: &str = include_str!("../scripts/create-normal-user.sh");

/// Passed inline to `sh -euc`; `$1` names the user.
pub const ENABLE_SUDO: &str = include_str!("../scripts/enable-sudo.sh");

/// Testbed file the reboot helper writes its marker to.
pub const REBOOT_MARK: &str = "/run/autopkgtest-reboot-mark";
pub const REBOOT_PREPARE_MARK: &str = "/run/autopkgtest-reboot-prepare-mark";
pub const SCRIPT_PID_FILE: &str = "/tmp/autopkgtest_script_pid";
pub const NORMAL_USER_FILE: &str = "/run/autopkgtest-normal-user";

/// Materialise every copied helper under `dir` on the host.
pub fn write_all(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for helper in ALL {
        fs::write(dir.join(helper.name), helper.body)?;
    }
    Ok(())
}
