//! Once-per-open setup: copied files, apt sources and pinning, user setup
//! commands.

use adt_protocol::Capability;
use tracing::{debug, info};

use crate::exec::{ExecKind, ExecOptions};
use crate::resource::{DirKind, ResourcePath};
use crate::session::{Testbed, setup_failure};
use crate::{Result, TestbedError};

const BOOT_DIRS: &str = "/boot /etc/init /etc/init.d /etc/systemd/system /lib/systemd/system";
const PREFERENCES_DIR: &str = "/etc/apt/preferences.d";

/// Re-fetch the indexes of one sources file, three tries 15s apart.
/// `$1` is the file name under sources.list.d.
const UPDATE_SOURCE_LIST: &str = r#"
for retry in 1 2 3; do
    apt-get --no-list-cleanup \
            -o Dir::Etc::sourcelist=/etc/apt/sources.list.d/$1 \
            -o Dir::Etc::sourceparts=/dev/null \
            update 2>&1 && break || \
            if [ $retry = 3 ] ; then
                exit 1
            else
                sleep 15
            fi
done
"#;

const SOURCE_FILES: &str =
    "/etc/apt/sources.list `ls /etc/apt/sources.list.d/*.list 2>/dev/null || true`";

/// Pin file name for a release; apt rejects slashes and unknown extensions.
pub(crate) fn release_file_name(release: &str) -> String {
    release.replace('/', "-").replace('.', "_")
}

pub(crate) fn pin_file(release: &str) -> String {
    format!("{PREFERENCES_DIR}/adt-{}", release_file_name(release))
}

pub(crate) fn default_release_pin_file() -> String {
    format!("{PREFERENCES_DIR}/adt-default-release")
}

/// Split a `name=pkg1,pkg2` option value.
fn split_package_set(value: &str) -> (&str, &str) {
    value.split_once('=').unwrap_or((value, ""))
}

/// Sort a comma separated package list into binaries and `src:` sources.
fn split_package_list(pkglist: &str) -> (Vec<&str>, Vec<&str>) {
    let mut binaries = Vec::new();
    let mut sources = Vec::new();
    for item in pkglist.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        match item.strip_prefix("src:") {
            Some(source) => sources.push(source),
            None => binaries.push(item),
        }
    }
    (binaries, sources)
}

/// Shell script writing the package pin file for `release`.
fn package_pin_script(release: &str, pkglist: &str, default_releases: &[String]) -> String {
    let (binaries, sources) = split_package_list(pkglist);
    let file = pin_file(release);
    let mut script = format!("mkdir -p {PREFERENCES_DIR}; PKGS=\"{}\"; ", binaries.join(" "));
    if !sources.is_empty() {
        script.push_str(&format!(
            "PKGS=\"$PKGS $(apt-cache showsrc {} | \
             awk '/^Package-List:/ {{ show=1; next }} (/^ / && show==1) {{ print $1; next }} {{ show=0 }}' | \
             sort -u | tr '\\n' ' ')\"; ",
            sources.join(" ")
        ));
    }
    script.push_str(&format!(
        "printf \"Package: $PKGS\\nPin: release a={release}\\nPin-Priority: 995\\n\" > {file}; "
    ));
    for default in default_releases {
        script.push_str(&format!(
            "printf \"\\nPackage: *\\nPin: release a={default}\\nPin-Priority: 990\\n\" >> {file}; "
        ));
    }
    script
}

impl Testbed {
    pub(crate) async fn run_setup_commands(&mut self) -> Result<()> {
        let cfg = &self.config;
        let nothing_to_do = cfg.setup_commands.is_empty()
            && cfg.add_apt_pockets.is_empty()
            && cfg.copy_files.is_empty()
            && cfg.add_apt_sources.is_empty()
            && cfg.add_apt_releases.is_empty()
            && cfg.pin_packages.is_empty()
            && self.default_release.is_none();
        if nothing_to_do {
            return Ok(());
        }

        info!("@@@@@@@@@@@@@@@@@@@@ test bed setup");
        for copy in self.config.copy_files.clone() {
            debug!("copying {} to testbed {}", copy.host.display(), copy.testbed);
            let kind = if copy.host.is_dir() { DirKind::Dir } else { DirKind::File };
            ResourcePath::new(copy.host, copy.testbed, kind)
                .copydown(self, false, None)
                .await?;
        }

        if self.default_release.is_some() {
            self.set_default_release().await?;
        }

        for source in self.config.add_apt_sources.clone() {
            self.add_apt_source(&source, "adt-add-apt-sources.list").await?;
        }

        let pockets = self.config.add_apt_pockets.clone();
        for pocket in &pockets {
            let (pocket, _) = split_package_set(pocket);
            let script = format!(
                "sed -rn 's/^(deb|deb-src) +(\\[.*\\] *)?((http|https|file):[^ ]*) +([^ -]+) +(.*)$/\\1 \\2\\3 \\5-{pocket} \\6/p' \
                 {SOURCE_FILES} > /etc/apt/sources.list.d/{pocket}.list\n{UPDATE_SOURCE_LIST}"
            );
            let list = format!("{pocket}.list");
            self.check_exec(&["sh", "-ec", &script, "sh", &list], false)
                .await?;
        }
        for pocket in &pockets {
            let (pocket, pkglist) = split_package_set(pocket);
            let default = self.get_default_release().await?;
            let release = format!("{default}-{pocket}");
            self.create_apt_pinning_for_pocket(&release).await?;
            if !pkglist.is_empty() {
                self.create_apt_pinning_for_packages(&release, pkglist, &[format!("{default}-updates")])
                    .await?;
            }
        }

        if !self.config.add_apt_releases.is_empty() {
            let script = format!(
                "sed -rn 's/^(deb|deb-src) +(\\[.*\\] *)?((http|https|file):[^ ]*) +([^ ]+) +(.*)$/\\2\\3 \\6/p' \
                 {SOURCE_FILES} | head -1"
            );
            let found = self.check_exec(&["sh", "-ec", &script], true).await?;
            let mut words = found.split_whitespace();
            let Some(mirror) = words.next() else {
                return Err(TestbedError::Testbed(
                    "cannot determine apt mirror for extra releases".into(),
                ));
            };
            let mirror = mirror.to_string();
            let components = words.collect::<Vec<_>>().join(" ");
            for release in self.config.add_apt_releases.clone() {
                let sources = ["deb", "deb-src"]
                    .map(|t| format!("{t} {mirror} {release} {components}"))
                    .join("\n");
                self.add_apt_source(&sources, &format!("adt-add-apt-release-{release}.list"))
                    .await?;
            }
        }

        for package_set in self.config.pin_packages.clone() {
            let Some((release, pkglist)) = package_set.split_once('=') else {
                return Err(TestbedError::Testbed(format!(
                    "invalid package pin {package_set:?}, expected RELEASE=PACKAGES"
                )));
            };
            self.create_apt_pinning_for_packages(release, pkglist, &[]).await?;
        }

        let scratch = self.scratch_dir()?;
        let stamp = format!(
            r"for d in {BOOT_DIRS}; do [ ! -d $d ] || touch -r $d {scratch}/${{d//\//_}}.stamp; done"
        );
        self.check_exec(&["bash", "-ec", &stamp], false).await?;

        let env = self.setup_env("AUTOPKGTEST_IS_SETUP_COMMAND=1");
        for command in self.config.setup_commands.clone() {
            let rc = self
                .execute(
                    &["sh", "-ec", &command],
                    ExecOptions::kind(ExecKind::Install).with_env(env.clone()),
                )
                .await?
                .code;
            if rc != 0 {
                if self.config.shell_fail {
                    self.run_shell(None, &[]).await?;
                }
                return Err(setup_failure("testbed setup commands", rc));
            }
        }

        if !self.config.setup_commands.is_empty() && self.has_cap(Capability::Reboot) {
            let compare = format!(
                r"[ ! -e /run/autopkgtest_no_reboot.stamp ] || exit 0; for d in {BOOT_DIRS}; do s={scratch}/${{d//\//_}}.stamp; [ ! -d $d ] || [ `stat -c %Y $d` = `stat -c %Y $s` ]; done"
            );
            let boot_affected = self
                .execute(&["bash", "-ec", &compare], ExecOptions::default())
                .await?
                .code;
            if boot_affected != 0 {
                info!("rebooting testbed after setup commands that affected boot");
                self.reboot(false).await?;
            }
        }
        Ok(())
    }

    /// Pin `release` at 500 so that NotAutomatic suites are still used.
    async fn create_apt_pinning_for_pocket(&mut self, release: &str) -> Result<()> {
        let script = format!(
            "mkdir -p {PREFERENCES_DIR}; printf \"Package: *\\nPin: release a={release}\\nPin-Priority: 500\\n\" > {}-baseline; ",
            pin_file(release)
        );
        self.check_exec(&["sh", "-ec", &script], false).await?;
        Ok(())
    }

    /// Prefer `pkglist` from `release`; everything else keeps coming from
    /// the default release.
    async fn create_apt_pinning_for_packages(
        &mut self,
        release: &str,
        pkglist: &str,
        default_releases: &[String],
    ) -> Result<()> {
        let script = package_pin_script(release, pkglist, default_releases);
        self.check_exec(&["sh", "-ec", &script], false).await?;
        self.set_default_release().await?;
        self.apt_pin_for_releases.push(release.to_string());
        Ok(())
    }

    /// The first release named in the apt sources, unless configured.
    async fn get_default_release(&mut self) -> Result<String> {
        if let Some(release) = &self.default_release {
            return Ok(release.clone());
        }
        let script = concat!(
            "SRCS=$(ls /etc/apt/sources.list /etc/apt/sources.list.d/*.list 2>/dev/null|| true); ",
            r"sed -rn '/^(deb|deb-src) +(\[.*\] *)?(http|https|file):/ { s/\[.*\] +//; s/^[^ ]+ +[^ ]* +([^ ]+) +.*$/\1/p }' $SRCS | head -n1"
        );
        let release = self.check_exec(&["sh", "-ec", script], true).await?.trim().to_string();
        self.default_release = Some(release.clone());
        Ok(release)
    }

    async fn set_default_release(&mut self) -> Result<()> {
        let default = self.get_default_release().await?;
        // With pockets the codename is shared with the pocket suite, so the
        // archive name has to be used.
        let selector = if self.config.add_apt_pockets.is_empty() {
            default
        } else {
            format!("a={default}")
        };
        let script = format!(
            "mkdir -p {PREFERENCES_DIR}; printf \"Package: *\\nPin: release {selector}\\nPin-Priority: 990\\n\" > {}",
            default_release_pin_file()
        );
        self.check_exec(&["sh", "-ec", &script], false).await?;
        Ok(())
    }

    async fn add_apt_source(&mut self, source: &str, filename: &str) -> Result<()> {
        debug!("adding apt source: {source}");
        let script = format!("echo \"$2\" >> /etc/apt/sources.list.d/$1\n{UPDATE_SOURCE_LIST}");
        self.check_exec(&["sh", "-ec", &script, "sh", filename, source], false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_names_become_file_names() {
        assert_eq!(release_file_name("stable/updates"), "stable-updates");
        assert_eq!(release_file_name("bookworm.1"), "bookworm_1");
        assert_eq!(pin_file("a/b"), "/etc/apt/preferences.d/adt-a-b");
    }

    #[test]
    fn package_lists_split_sources_from_binaries() {
        let (bin, src) = split_package_list("foo, src:bar ,baz,");
        assert_eq!(bin, vec!["foo", "baz"]);
        assert_eq!(src, vec!["bar"]);
        assert_eq!(split_package_set("proposed=a,b"), ("proposed", "a,b"));
        assert_eq!(split_package_set("proposed"), ("proposed", ""));
    }

    #[test]
    fn package_pin_script_names_priorities() {
        let script = package_pin_script("sid", "foo,src:bar", &["sid-updates".to_string()]);
        assert!(script.contains("PKGS=\"foo\""));
        assert!(script.contains("apt-cache showsrc bar"));
        assert!(script.contains("Pin: release a=sid\\nPin-Priority: 995"));
        assert!(script.contains("Pin: release a=sid-updates\\nPin-Priority: 990"));
        assert!(script.contains("> /etc/apt/preferences.d/adt-sid;"));
    }
}
