//! Capability tokens advertised by a virt-server.
//!
//! Most capabilities form a closed vocabulary and are kept as an enum. Two are
//! parameterised (`downtmp-host=<path>`, `suggested-normal-user=<name>`) and
//! anything unrecognised is preserved verbatim so it can still be matched by
//! name.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const DOWNTMP_HOST_PREFIX: &str = "downtmp-host=";
const SUGGESTED_NORMAL_USER_PREFIX: &str = "suggested-normal-user=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Revert,
    RevertFullSystem,
    Reboot,
    RootOnTestbed,
    IsolationContainer,
    IsolationMachine,
    /// Synthesised locally when the run is configured to expect network access.
    HasInternet,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Revert => "revert",
            Capability::RevertFullSystem => "revert-full-system",
            Capability::Reboot => "reboot",
            Capability::RootOnTestbed => "root-on-testbed",
            Capability::IsolationContainer => "isolation-container",
            Capability::IsolationMachine => "isolation-machine",
            Capability::HasInternet => "has_internet",
        }
    }
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "revert" => Capability::Revert,
            "revert-full-system" => Capability::RevertFullSystem,
            "reboot" => Capability::Reboot,
            "root-on-testbed" => Capability::RootOnTestbed,
            "isolation-container" => Capability::IsolationContainer,
            "isolation-machine" => Capability::IsolationMachine,
            "has_internet" => Capability::HasInternet,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability set of one open testbed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    known: BTreeSet<Capability>,
    downtmp_host: Option<String>,
    suggested_normal_user: Option<String>,
    other: BTreeSet<String>,
}

impl Capabilities {
    pub fn parse<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = Capabilities::default();
        for token in tokens {
            caps.insert_token(token.as_ref());
        }
        caps
    }

    fn insert_token(&mut self, token: &str) {
        if let Ok(cap) = token.parse::<Capability>() {
            self.known.insert(cap);
        } else if let Some(path) = token.strip_prefix(DOWNTMP_HOST_PREFIX) {
            self.downtmp_host = Some(path.to_string());
        } else if let Some(user) = token.strip_prefix(SUGGESTED_NORMAL_USER_PREFIX) {
            self.suggested_normal_user = Some(user.to_string());
        } else if !token.is_empty() {
            self.other.insert(token.to_string());
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.known.contains(&cap)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.known.insert(cap);
    }

    /// Host-side path of the testbed's download temp dir, when shared.
    pub fn downtmp_host(&self) -> Option<&str> {
        self.downtmp_host.as_deref()
    }

    pub fn suggested_normal_user(&self) -> Option<&str> {
        self.suggested_normal_user.as_deref()
    }

    /// Match by raw token name, covering both known and unrecognised tokens.
    pub fn has_token(&self, token: &str) -> bool {
        match token.parse::<Capability>() {
            Ok(cap) => self.has(cap),
            Err(()) => self.other.contains(token),
        }
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut out: Vec<String> = self.known.iter().map(|c| c.as_str().to_string()).collect();
        if let Some(path) = &self.downtmp_host {
            out.push(format!("{DOWNTMP_HOST_PREFIX}{path}"));
        }
        if let Some(user) = &self.suggested_normal_user {
            out.push(format!("{SUGGESTED_NORMAL_USER_PREFIX}{user}"));
        }
        out.extend(self.other.iter().cloned());
        out
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens().join(" "))
    }
}
