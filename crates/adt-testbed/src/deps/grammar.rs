//! Debian dependency field grammar, reduced for one host architecture.
//!
//! `foo:any (>= 1.0) [amd64 arm64] <!nocheck> | bar, baz` is parsed into
//! clauses of alternatives. Alternatives restricted to other architectures
//! are dropped, and for build dependencies so are alternatives restricted to
//! build profiles that are not active. Clauses left without alternatives
//! disappear.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepError {
    #[error("empty alternative in dependency clause {0:?}")]
    EmptyAlternative(String),
    #[error("invalid package name in {0:?}")]
    InvalidName(String),
    #[error("invalid version restriction in {0:?}")]
    InvalidVersion(String),
    #[error("invalid architecture restriction in {0:?}")]
    InvalidArch(String),
    #[error("invalid build profile restriction in {0:?}")]
    InvalidProfile(String),
    #[error("unexpected trailing text in {0:?}")]
    Trailing(String),
}

/// Reduces a dependency string to what apt understands on one host.
pub trait DepResolver: Send + Sync {
    fn resolve(&self, deps: &str, host_arch: &str, build_dep: bool) -> Result<String, DepError>;
}

/// Native implementation of the Debian dependency grammar.
#[derive(Debug, Default, Clone)]
pub struct DebianDepResolver {
    /// Build profiles considered active. Empty for test dependencies.
    pub profiles: Vec<String>,
}

impl DepResolver for DebianDepResolver {
    fn resolve(&self, deps: &str, host_arch: &str, build_dep: bool) -> Result<String, DepError> {
        let deps = deps.replace(":native", "");
        let mut clauses = Vec::new();
        for clause in deps.split(',') {
            if clause.trim().is_empty() {
                continue;
            }
            let mut kept = Vec::new();
            for alt in clause.split('|') {
                let dep = Dep::parse(alt)?;
                let profiles_ok = !build_dep || dep.matches_profiles(&self.profiles);
                if dep.matches_arch(host_arch) && profiles_ok {
                    kept.push(dep.to_string());
                }
            }
            if !kept.is_empty() {
                clauses.push(kept.join(" | "));
            }
        }
        Ok(clauses.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dep {
    name: String,
    version: Option<(String, String)>,
    arches: Vec<String>,
    /// Disjunction of conjunctions of (negated, profile) terms.
    profiles: Vec<Vec<(bool, String)>>,
}

/// `name[:archqual]` with Debian's package name alphabet.
fn valid_name(name: &str) -> bool {
    let (pkg, qual) = match name.split_once(':') {
        Some((pkg, qual)) => (pkg, Some(qual)),
        None => (name, None),
    };
    let pkg_ok = pkg.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && pkg
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'));
    let qual_ok = qual.is_none_or(|q| {
        !q.is_empty() && q.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });
    pkg_ok && qual_ok
}

impl Dep {
    fn parse(text: &str) -> Result<Dep, DepError> {
        let original = text.trim();
        if original.is_empty() {
            return Err(DepError::EmptyAlternative(text.to_string()));
        }
        let name_end = original
            .find(|c: char| c.is_whitespace() || matches!(c, '(' | '[' | '<'))
            .unwrap_or(original.len());
        let name = &original[..name_end];
        if !valid_name(name) {
            return Err(DepError::InvalidName(original.to_string()));
        }
        let mut rest = original[name_end..].trim_start();

        let mut version = None;
        if let Some(inner) = rest.strip_prefix('(') {
            let close = inner
                .find(')')
                .ok_or_else(|| DepError::InvalidVersion(original.to_string()))?;
            version = Some(parse_version(&inner[..close], original)?);
            rest = inner[close + 1..].trim_start();
        }

        let mut arches = Vec::new();
        if let Some(inner) = rest.strip_prefix('[') {
            let close = inner
                .find(']')
                .ok_or_else(|| DepError::InvalidArch(original.to_string()))?;
            arches = inner[..close].split_whitespace().map(str::to_string).collect();
            let negated = arches.iter().filter(|a| a.starts_with('!')).count();
            if arches.is_empty() || (negated != 0 && negated != arches.len()) {
                return Err(DepError::InvalidArch(original.to_string()));
            }
            rest = inner[close + 1..].trim_start();
        }

        let mut profiles = Vec::new();
        while let Some(inner) = rest.strip_prefix('<') {
            let close = inner
                .find('>')
                .ok_or_else(|| DepError::InvalidProfile(original.to_string()))?;
            let terms: Vec<(bool, String)> = inner[..close]
                .split_whitespace()
                .map(|t| match t.strip_prefix('!') {
                    Some(p) => (true, p.to_string()),
                    None => (false, t.to_string()),
                })
                .collect();
            if terms.is_empty() || terms.iter().any(|(_, p)| p.is_empty()) {
                return Err(DepError::InvalidProfile(original.to_string()));
            }
            profiles.push(terms);
            rest = inner[close + 1..].trim_start();
        }

        if !rest.is_empty() {
            return Err(DepError::Trailing(original.to_string()));
        }
        Ok(Dep {
            name: name.to_string(),
            version,
            arches,
            profiles,
        })
    }

    fn matches_arch(&self, host: &str) -> bool {
        if self.arches.is_empty() {
            return true;
        }
        let negated = self.arches[0].starts_with('!');
        let hit = self
            .arches
            .iter()
            .any(|a| arch_matches(a.trim_start_matches('!'), host));
        hit != negated
    }

    fn matches_profiles(&self, active: &[String]) -> bool {
        if self.profiles.is_empty() {
            return true;
        }
        self.profiles.iter().any(|group| {
            group
                .iter()
                .all(|(negated, p)| active.iter().any(|a| a == p) != *negated)
        })
    }
}

fn parse_version(inner: &str, original: &str) -> Result<(String, String), DepError> {
    let inner = inner.trim();
    let op_len = inner
        .find(|c: char| !matches!(c, '<' | '>' | '='))
        .unwrap_or(inner.len());
    let op = &inner[..op_len];
    let ver = inner[op_len..].trim();
    let valid_op = matches!(op, "<<" | "<=" | "=" | ">=" | ">>" | "<" | ">");
    if !valid_op || ver.is_empty() || ver.contains(char::is_whitespace) {
        return Err(DepError::InvalidVersion(original.to_string()));
    }
    Ok((op.to_string(), ver.to_string()))
}

/// Split a Debian architecture into (os, cpu); bare names are Linux.
fn arch_tuple(arch: &str) -> (&str, &str) {
    arch.split_once('-').unwrap_or(("linux", arch))
}

/// Match one architecture or wildcard (`any`, `<os>-any`, `any-<cpu>`).
fn arch_matches(pattern: &str, host: &str) -> bool {
    if pattern == "any" || pattern == host {
        return true;
    }
    let (os, cpu) = arch_tuple(host);
    match arch_tuple(pattern) {
        (p_os, "any") => p_os == os,
        ("any", p_cpu) => p_cpu == cpu,
        (p_os, p_cpu) => p_os == os && p_cpu == cpu,
    }
}

impl fmt::Display for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some((op, ver)) = &self.version {
            write!(f, " ({op} {ver})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(deps: &str, arch: &str) -> Result<String, DepError> {
        DebianDepResolver::default().resolve(deps, arch, false)
    }

    #[test]
    fn plain_dependencies_are_normalised() {
        assert_eq!(
            resolve("foo,bar|baz ,  qux (>=1.0)", "amd64").unwrap(),
            "foo, bar | baz, qux (>= 1.0)"
        );
        assert_eq!(resolve("", "amd64").unwrap(), "");
        assert_eq!(resolve("foo,", "amd64").unwrap(), "foo");
    }

    #[test]
    fn architecture_restrictions_reduce() {
        assert_eq!(resolve("foo [amd64], bar [!amd64]", "amd64").unwrap(), "foo");
        assert_eq!(resolve("foo [linux-any] | bar", "arm64").unwrap(), "foo | bar");
        assert_eq!(resolve("foo [any-i386]", "hurd-i386").unwrap(), "foo");
        assert_eq!(resolve("foo [kfreebsd-any]", "amd64").unwrap(), "");
        assert_eq!(
            resolve("foo [!armhf !i386] (>= 2)", "amd64"),
            Err(DepError::Trailing("foo [!armhf !i386] (>= 2)".into()))
        );
    }

    #[test]
    fn build_profiles_evaluate_with_none_active() {
        let resolver = DebianDepResolver::default();
        assert_eq!(
            resolver
                .resolve("foo <!nocheck>, bar <stage1>, baz <stage1> <!cross>", "amd64", true)
                .unwrap(),
            "foo, baz"
        );
        let with_nocheck = DebianDepResolver {
            profiles: vec!["nocheck".into()],
        };
        assert_eq!(with_nocheck.resolve("foo <!nocheck>", "amd64", true).unwrap(), "");
    }

    #[test]
    fn profiles_are_ignored_outside_build_dependencies() {
        assert_eq!(
            resolve("foo <!nocheck>, bar <stage1> | qux [i386], baz [amd64] <stage1>", "amd64")
                .unwrap(),
            "foo, bar, baz"
        );
        let with_nocheck = DebianDepResolver {
            profiles: vec!["nocheck".into()],
        };
        assert_eq!(with_nocheck.resolve("foo <!nocheck>", "amd64", false).unwrap(), "foo");
    }

    #[test]
    fn native_qualifier_is_stripped_and_others_kept() {
        assert_eq!(
            resolve("python3:native, gcc:any (>= 4)", "amd64").unwrap(),
            "python3, gcc:any (>= 4)"
        );
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(resolve("foo | ", "amd64"), Err(DepError::EmptyAlternative(_))));
        assert!(matches!(resolve("Foo", "amd64"), Err(DepError::InvalidName(_))));
        assert!(matches!(resolve("foo (>= )", "amd64"), Err(DepError::InvalidVersion(_))));
        assert!(matches!(resolve("foo (~ 1)", "amd64"), Err(DepError::InvalidVersion(_))));
        assert!(matches!(resolve("foo [amd64 !i386]", "amd64"), Err(DepError::InvalidArch(_))));
        assert!(matches!(resolve("foo <>", "amd64"), Err(DepError::InvalidProfile(_))));
    }
}
