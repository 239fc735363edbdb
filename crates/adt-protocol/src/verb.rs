use std::fmt;

/// Requests understood by a virt-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Open,
    PrintExecuteCommand,
    Capabilities,
    Copydown,
    Copyup,
    Revert,
    Reboot,
    Close,
    Shell,
    AuxverbDebugFail,
    Quit,
}

impl Verb {
    pub const ALL: [Verb; 11] = [
        Verb::Open,
        Verb::PrintExecuteCommand,
        Verb::Capabilities,
        Verb::Copydown,
        Verb::Copyup,
        Verb::Revert,
        Verb::Reboot,
        Verb::Close,
        Verb::Shell,
        Verb::AuxverbDebugFail,
        Verb::Quit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Open => "open",
            Verb::PrintExecuteCommand => "print-execute-command",
            Verb::Capabilities => "capabilities",
            Verb::Copydown => "copydown",
            Verb::Copyup => "copyup",
            Verb::Revert => "revert",
            Verb::Reboot => "reboot",
            Verb::Close => "close",
            Verb::Shell => "shell",
            Verb::AuxverbDebugFail => "auxverb_debug_fail",
            Verb::Quit => "quit",
        }
    }

    pub fn parse(s: &str) -> Option<Verb> {
        Verb::ALL.into_iter().find(|v| v.as_str() == s)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
