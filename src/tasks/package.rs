use super::{Distro, args, distro, keys_of};
use crate::files::{DEFAULT_DIR_MODE, mkdir_all};
use crate::runner;
use crate::tasks::{AptSource, UpdatePackages};
use anyhow::{Context as _, Result, bail};
use assets::Hash;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};

const CONTAINER_SELINUX: &str = "container-selinux";
const CONTAINERD: &str = "containerd.io";
const DOCKER: &str = "docker-ce";

/// Where cloud-init downloads package files.
const CLOUD_INIT_PACKAGE_DIR: &str = "/var/cache/nodeup/packages";

/// An OS package, either from the configured repositories or downloaded
/// from `source`.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub version: Option<String>,
    pub source: Option<String>,
    pub hash: Option<String>,
    pub healthy: Option<bool>,
}

impl Package {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: Some(true),
            ..Default::default()
        }
    }

    /// Installed from the distribution's repositories.
    pub fn is_os_package(&self) -> bool {
        self.source.as_deref().unwrap_or_default().is_empty()
    }

    fn install_command(distro: Distro, targets: &[String]) -> Vec<String> {
        let mut cmd = match distro {
            Distro::Debian => args(&["apt-get", "install", "--yes", "--no-install-recommends"]),
            Distro::RedHat => args(&["/usr/bin/yum", "install", "-y"]),
        };
        cmd.extend(targets.iter().cloned());
        cmd
    }

    fn install(&self, target: &LocalTarget, ctx: &Context<'_>, distro: Distro) -> Result<()> {
        let install_target = match &self.source {
            Some(source) if !source.is_empty() => {
                let dir = target.cache_dir().join("packages");
                mkdir_all(&dir, DEFAULT_DIR_MODE)?;
                let ext = match distro {
                    Distro::Debian => "deb",
                    Distro::RedHat => "rpm",
                };
                let local = dir.join(format!("{}.{ext}", self.name));
                let hash = self
                    .hash
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .map(Hash::parse)
                    .transpose()
                    .with_context(|| format!("invalid hash for package {}", self.name))?;
                ctx.services
                    .fetcher()
                    .fetch(std::slice::from_ref(source), &local, hash.as_ref())?;
                local.to_string_lossy().into_owned()
            }
            _ => self.name.clone(),
        };

        log::info!("installing package {}", self.name);
        let cmd = Self::install_command(distro, &[install_target]);
        match distro {
            Distro::Debian => runner::run_with_env(&cmd, &[("DEBIAN_FRONTEND", "noninteractive")]),
            Distro::RedHat => runner::run(&cmd),
        }
        .with_context(|| format!("error installing package {}", self.name))?;
        Ok(())
    }
}

/// Parse `dpkg-query -f '${db:Status-Abbrev}${Version}\n'` output into
/// `(version, healthy)`, or `None` when the package is not installed.
pub fn parse_dpkg_query(name: &str, output: &str) -> Result<Option<(String, bool)>> {
    let mut found = None;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some((state, version)) = line.split_once(' ') else {
            bail!("error parsing dpkg-query line {line:?}");
        };
        match state {
            "ii" => found = Some((version.trim().to_string(), true)),
            "iF" | "iU" => found = Some((version.trim().to_string(), false)),
            "rc" | "un" | "n" => found = None,
            _ => bail!("unknown package state {state:?} for {name:?} in line {line:?}"),
        }
    }
    Ok(found)
}

/// Parse `rpm -q --queryformat '%{NAME} %{VERSION}'` output.
pub fn parse_rpm_query(name: &str, output: &str) -> Result<Option<String>> {
    let mut found = None;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match line.split_once(' ') {
            Some((pkg, version)) if pkg == name => found = Some(version.trim().to_string()),
            _ => bail!("error parsing rpm line {line:?}"),
        }
    }
    Ok(found)
}

impl Delta for Package {
    const KIND: &'static str = "Package";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::opt("Version", self.version.clone()),
            Field::opt("Healthy", self.healthy),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = keys_of::<UpdatePackages>(tasks);
        deps.extend(keys_of::<AptSource>(tasks));

        let packages = || tasks.of_kind::<Self>().filter(|p| p.name != self.name);
        let key = |p: &Self| TaskKey::new(Self::KIND, p.name.as_str());
        if !self.is_os_package() {
            deps.extend(packages().filter(|p| p.is_os_package()).map(key));
        }
        match self.name.as_str() {
            CONTAINERD => deps.extend(packages().filter(|p| p.name == CONTAINER_SELINUX).map(key)),
            DOCKER => deps.extend(
                packages()
                    .filter(|p| p.name == CONTAINER_SELINUX || p.name == CONTAINERD)
                    .map(key),
            ),
            _ => {}
        }
        Some(deps)
    }

    fn find(&self, ctx: &Context<'_>) -> Result<Option<Self>> {
        let found = match distro(ctx)? {
            Distro::Debian => {
                let cmd = args(&["dpkg-query", "-f", "${db:Status-Abbrev}${Version}\\n", "-W", &self.name]);
                log::debug!("listing installed packages: {}", runner::human(&cmd));
                let (ok, output) = runner::run_capture(&cmd)?;
                if !ok {
                    if output.contains("no packages found") {
                        return Ok(None);
                    }
                    bail!("error listing installed packages: {}", output.trim());
                }
                parse_dpkg_query(&self.name, &output)?
            }
            Distro::RedHat => {
                let cmd = args(&["/usr/bin/rpm", "-q", &self.name, "--queryformat", "%{NAME} %{VERSION}"]);
                log::debug!("listing installed packages: {}", runner::human(&cmd));
                let (ok, output) = runner::run_capture(&cmd)?;
                if !ok {
                    if output.contains("is not installed") {
                        return Ok(None);
                    }
                    bail!("error listing installed packages: {}", output.trim());
                }
                parse_rpm_query(&self.name, &output)?.map(|v| (v, true))
            }
        };

        Ok(found.map(|(version, healthy)| Self {
            name: self.name.clone(),
            version: Some(version),
            healthy: Some(healthy),
            ..Default::default()
        }))
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        let _lock = target.lock_packages();
        let distro = distro(ctx)?;

        if actual.is_none() || changes.has("Version") {
            return self.install(target, ctx, distro);
        }

        if changes.has("Healthy") {
            match distro {
                Distro::Debian => {
                    log::info!("package {} is not healthy; running dpkg --configure -a", self.name);
                    runner::run(&["dpkg", "--configure", "-a"])?;
                }
                Distro::RedHat => bail!("package repair not supported on RHEL family"),
            }
        }
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        match self.source.as_deref().filter(|s| !s.is_empty()) {
            Some(url) => {
                let local = format!("{CLOUD_INIT_PACKAGE_DIR}/{}", self.name);
                target.add_mkdir(Mode::Once, CLOUD_INIT_PACKAGE_DIR, DEFAULT_DIR_MODE);
                target.add_download_command(Mode::Always, url, &local);
                target.add_command(Mode::Always, args(&["dpkg", "-i", &local]));
            }
            None => {
                let spec = match &self.version {
                    Some(v) => format!("{} {v}", self.name),
                    None => self.name.clone(),
                };
                target.add_package(&spec);
            }
        }
        Ok(())
    }
}
