use super::args;
use crate::files::{self, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::runner;
use crate::tasks::{
    AptSource, Archive, BindMount, Chattr, File, Group, IssueCert, KubeConfig, MountDisk, Package,
    UpdateEtcHosts, UpdatePackages, User, keys_of,
};
use anyhow::{Context as _, Result, bail};
use assets::StringResource;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use converge::{
    Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TAG_DEBIAN_FAMILY,
    TAG_REDHAT_FAMILY, TAG_SYSTEMD, TaskKey, TaskMap,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DEBIAN_SYSTEMD_PATH: &str = "/lib/systemd/system";
const REDHAT_SYSTEMD_PATH: &str = "/usr/lib/systemd/system";
const GENERIC_SYSTEMD_PATH: &str = "/etc/systemd/system";

/// A systemd unit and the state it should be in.
#[derive(Debug, Clone, Default)]
pub struct Service {
    /// Unit name including its suffix, e.g. `kubelet.service`.
    pub name: String,
    pub definition: Option<String>,
    pub running: Option<bool>,
    pub enabled: Option<bool>,
    pub manage_state: Option<bool>,
    /// Restart when a file the unit uses is newer than its last start.
    pub smart_restart: Option<bool>,
}

impl Service {
    /// A managed, running, enabled unit.
    pub fn new(name: &str, definition: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            definition: Some(definition.into()),
            ..Default::default()
        }
        .with_defaults()
    }

    /// Fill unset state flags: running, smart restart and state
    /// management default on, enabled follows running.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.running.get_or_insert(true);
        self.smart_restart.get_or_insert(true);
        self.manage_state.get_or_insert(true);
        if self.enabled.is_none() {
            self.enabled = self.running;
        }
        self
    }

    fn manages_state(&self) -> bool {
        self.manage_state.unwrap_or(false)
    }

    fn unit_path(&self, ctx: &Context<'_>) -> Result<PathBuf> {
        Ok(Path::new(systemd_system_path(ctx)?).join(&self.name))
    }

    fn smart_restart_needed(&self, unit_path: &Path, actual: Option<&Self>) -> Result<bool> {
        let definition = self
            .definition
            .as_deref()
            .filter(|d| !d.is_empty())
            .or_else(|| actual.and_then(|a| a.definition.as_deref()))
            .unwrap_or_default();
        if definition.is_empty() {
            return Ok(false);
        }

        let mut dependencies = systemd_dependencies(definition);
        dependencies.push(unit_path.to_string_lossy().into_owned());

        let mut newest: Option<DateTime<Utc>> = None;
        for dependency in &dependencies {
            match fs::metadata(dependency).and_then(|m| m.modified()) {
                Ok(modified) => {
                    let modified = DateTime::<Utc>::from(modified);
                    if newest.is_none_or(|n| n < modified) {
                        newest = Some(modified);
                    }
                }
                Err(e) => log::info!("ignoring error checking service dependency {dependency}: {e}"),
            }
        }
        let Some(newest) = newest else {
            return Ok(false);
        };

        let properties = systemd_status(&self.name)?;
        let Some(started) = properties.get("ExecMainStartTimestamp").filter(|s| !s.is_empty()) else {
            log::warn!("service {} was running but has no ExecMainStartTimestamp", self.name);
            return Ok(false);
        };
        let started = parse_systemd_timestamp(started)?;
        if started < newest {
            log::debug!("will restart {}: a dependency changed after it started", self.name);
            Ok(true)
        } else {
            log::debug!("will not restart {}: started after its dependencies", self.name);
            Ok(false)
        }
    }
}

/// Directory unit files are written to on this host.
pub fn systemd_system_path(ctx: &Context<'_>) -> Result<&'static str> {
    if ctx.has_tag(TAG_DEBIAN_FAMILY) {
        Ok(DEBIAN_SYSTEMD_PATH)
    } else if ctx.has_tag(TAG_REDHAT_FAMILY) {
        Ok(REDHAT_SYSTEMD_PATH)
    } else if ctx.has_tag(TAG_SYSTEMD) {
        Ok(GENERIC_SYSTEMD_PATH)
    } else {
        bail!("unsupported systemd system")
    }
}

/// Parse `systemctl show` output into properties.
pub fn parse_systemd_properties(output: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for line in output.lines().filter(|l| !l.is_empty()) {
        match line.split_once('=') {
            Some((k, v)) => {
                properties.insert(k.to_string(), v.to_string());
            }
            None => log::warn!("ignoring line in systemd show output: {line:?}"),
        }
    }
    properties
}

fn systemd_status(name: &str) -> Result<BTreeMap<String, String>> {
    log::debug!("querying state of service {name}");
    let output = runner::run(&["systemctl", "show", "--all", name])
        .with_context(|| format!("error doing systemd show {name}"))?;
    Ok(parse_systemd_properties(&output))
}

/// Files a unit reads: every `EnvironmentFile` and the `ExecStart` binary.
pub fn systemd_dependencies(definition: &str) -> Vec<String> {
    let mut dependencies = Vec::new();
    for line in definition.lines() {
        let Some((k, v)) = line.trim().split_once('=') else {
            continue;
        };
        let v = v.trim();
        match k.trim() {
            "EnvironmentFile" => dependencies.push(v.trim_start_matches('-').to_string()),
            "ExecStart" => {
                if let Some(binary) = v.split(' ').next().filter(|b| !b.is_empty()) {
                    dependencies.push(binary.to_string());
                }
            }
            _ => {}
        }
    }
    dependencies
}

/// Parse `Mon 2006-01-02 15:04:05 UTC`. Zones other than UTC/GMT are
/// taken as the host's local zone.
pub fn parse_systemd_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    let (stamp, zone) = s.rsplit_once(' ').unwrap_or((s, ""));
    let naive = NaiveDateTime::parse_from_str(stamp, "%a %Y-%m-%d %H:%M:%S")
        .with_context(|| format!("unable to parse service timestamp {s:?}"))?;
    if matches!(zone, "UTC" | "GMT") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("timestamp {s:?} does not exist in the local zone"))
}

/// The `systemctl` verb a change set calls for, before smart restarts.
fn state_action(expected: &Service, changes: &Changes) -> Option<&'static str> {
    if !(changes.has("Running") && expected.manages_state()) {
        return None;
    }
    if expected.running.unwrap_or(false) {
        Some("restart")
    } else {
        Some("stop")
    }
}

impl Delta for Service {
    const KIND: &'static str = "Service";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::opt("Definition", self.definition.clone()),
            Field::opt("Running", self.running),
            Field::opt("Enabled", self.enabled),
            Field::opt("ManageState", self.manage_state),
            Field::opt("SmartRestart", self.smart_restart),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = Vec::new();
        deps.extend(keys_of::<File>(tasks));
        deps.extend(keys_of::<Package>(tasks));
        deps.extend(keys_of::<UpdatePackages>(tasks));
        deps.extend(keys_of::<User>(tasks));
        deps.extend(keys_of::<Group>(tasks));
        deps.extend(keys_of::<MountDisk>(tasks));
        deps.extend(keys_of::<Chattr>(tasks));
        deps.extend(keys_of::<BindMount>(tasks));
        deps.extend(keys_of::<Archive>(tasks));
        deps.extend(keys_of::<AptSource>(tasks));
        deps.extend(keys_of::<UpdateEtcHosts>(tasks));
        deps.extend(keys_of::<IssueCert>(tasks));
        deps.extend(keys_of::<KubeConfig>(tasks));
        Some(deps)
    }

    fn find(&self, ctx: &Context<'_>) -> Result<Option<Self>> {
        let unit_path = self.unit_path(ctx)?;
        let definition = match fs::read_to_string(&unit_path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Some(Self {
                    name: self.name.clone(),
                    running: Some(false),
                    ..Default::default()
                }));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("error reading systemd file {}", unit_path.display()));
            }
        };

        let properties = systemd_status(&self.name)?;
        let running = match properties.get("ActiveState").map(String::as_str) {
            Some("active") => true,
            Some("failed" | "inactive") => false,
            other => {
                log::warn!("unknown ActiveState={other:?} for {}; treating as not running", self.name);
                false
            }
        };
        let enabled = match properties.get("WantedBy").map(String::as_str).unwrap_or_default() {
            "" => false,
            "multi-user.target" | "graphical.target multi-user.target" => true,
            other => {
                log::warn!("unknown WantedBy={other:?} for {}; treating as not enabled", self.name);
                false
            }
        };

        Ok(Some(Self {
            name: self.name.clone(),
            definition: Some(definition),
            running: Some(running),
            enabled: Some(enabled),
            manage_state: self.manage_state,
            smart_restart: self.smart_restart,
        }))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        let unit_path = self.unit_path(ctx)?;
        let mut action = state_action(self, changes);

        if changes.has("Definition") {
            let definition = self.definition.clone().unwrap_or_default();
            files::write_file(
                &unit_path,
                &StringResource::new(definition),
                DEFAULT_FILE_MODE,
                DEFAULT_DIR_MODE,
            )
            .context("error writing systemd service file")?;
            log::info!("reloading systemd configuration");
            runner::run(&["systemctl", "daemon-reload"])?;
        }

        if action.is_none()
            && self.manages_state()
            && self.smart_restart.unwrap_or(false)
            && self.running.unwrap_or(false)
            && self.smart_restart_needed(&unit_path, actual)?
        {
            action = Some("restart");
        }

        if let Some(action) = action {
            log::info!("running systemctl {action} {}", self.name);
            runner::run(&["systemctl", action, &self.name])?;
        }

        if changes.has("Enabled") && self.manages_state() {
            let verb = if self.enabled.unwrap_or(false) { "enable" } else { "disable" };
            log::info!("running systemctl {verb} {}", self.name);
            runner::run(&["systemctl", verb, &self.name])?;
        }
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let unit_path = self.unit_path(ctx)?;
        let definition = self.definition.clone().unwrap_or_default();
        target.write_file(
            &unit_path.to_string_lossy(),
            &StringResource::shared(definition),
            DEFAULT_FILE_MODE,
            DEFAULT_DIR_MODE,
            None,
            None,
        )?;
        if self.manages_state() {
            target.add_command(Mode::Once, args(&["systemctl", "daemon-reload"]));
            target.add_command(Mode::Once, args(&["systemctl", "start", "--no-block", &self.name]));
        }
        Ok(())
    }
}
