use super::{args, creates_dir_parents, keys_of};
use crate::files::{DEFAULT_DIR_MODE, mkdir_all};
use crate::runner;
use crate::tasks::{File, MountDisk};
use anyhow::{Context as _, Result, bail};
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};
use std::fs;
use std::path::{Path, PathBuf};

pub const MOUNTINFO: &str = "/proc/self/mountinfo";

const KNOWN_OPTIONS: &[&str] = &["ro", "rshared", "exec", "noexec", "nosuid", "nodev"];

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Files `/etc/resolv.conf` is redirected to on hosts running systemd-resolved.
const RESOLV_CONF_REDIRECTS: &[&str] = &[
    "/run/systemd/resolve/resolv.conf",
    "/run/systemd/resolve/stub-resolv.conf",
];

/// A bind mount of `source` at `mountpoint`.
#[derive(Debug, Clone, Default)]
pub struct BindMount {
    pub source: String,
    pub mountpoint: String,
    pub options: Vec<String>,
    pub recursive: bool,
}

impl BindMount {
    pub fn new(source: &str, mountpoint: &str, options: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            mountpoint: mountpoint.to_string(),
            options: options.iter().map(|s| (*s).to_string()).collect(),
            recursive: false,
        }
    }

    fn sorted_options(&self) -> Vec<String> {
        let mut options = self.options.clone();
        options.sort();
        options.dedup();
        options
    }

    fn has(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// `major:minor` of the mounted filesystem.
    pub device: String,
    /// Path inside the mounted filesystem that is visible at the mountpoint.
    pub root: String,
    pub mountpoint: String,
    pub options: Vec<String>,
    /// Propagation tags such as `shared:12`.
    pub optional: Vec<String>,
    pub fstype: String,
    pub source: String,
}

impl MountInfo {
    /// Where the mounted tree comes from in the host's namespace.
    ///
    /// Kernel filesystems map to their usual mountpoints. Anything else is
    /// resolved through the mount of the same device with the shortest root
    /// containing this one, earlier mounts first, so a bind from a separate partition comes back as
    /// a path under that partition's mountpoint.
    pub fn effective_source(&self, mounts: &[MountInfo]) -> PathBuf {
        let base = match self.fstype.as_str() {
            "devtmpfs" => return Path::new("/dev").join(self.root.trim_start_matches('/')),
            "proc" => return Path::new("/proc").join(self.root.trim_start_matches('/')),
            _ => Path::new("/"),
        };
        let root = Path::new(&self.root);
        let position = mounts.iter().position(|m| std::ptr::eq(m, self));
        let origin = mounts
            .iter()
            .enumerate()
            .filter(|(i, m)| position.is_none_or(|p| *i < p) || m.root.len() < self.root.len())
            .filter(|(i, m)| position != Some(*i) && m.device == self.device)
            .filter(|(_, m)| root.starts_with(&m.root))
            .min_by_key(|(i, m)| (m.root.len(), *i))
            .map(|(_, m)| m);
        match origin {
            Some(origin) => {
                let rest = root.strip_prefix(&origin.root).unwrap_or(root);
                Path::new(&origin.mountpoint).join(rest)
            }
            None => base.join(self.root.trim_start_matches('/')),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.optional.iter().any(|o| o.starts_with("shared:"))
    }
}

fn unescape_mount_path(s: &str) -> String {
    s.replace("\\040", " ").replace("\\011", "\t").replace("\\134", "\\")
}

pub fn parse_mountinfo(content: &str) -> Result<Vec<MountInfo>> {
    let mut mounts = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(sep) = fields.iter().position(|f| *f == "-") else {
            bail!("malformed mountinfo line {line:?}");
        };
        if sep < 6 || fields.len() < sep + 3 {
            bail!("malformed mountinfo line {line:?}");
        }
        mounts.push(MountInfo {
            device: fields[2].to_string(),
            root: unescape_mount_path(fields[3]),
            mountpoint: unescape_mount_path(fields[4]),
            options: fields[5].split(',').map(String::from).collect(),
            optional: fields[6..sep].iter().map(|s| (*s).to_string()).collect(),
            fstype: fields[sep + 1].to_string(),
            source: fields[sep + 2].to_string(),
        });
    }
    Ok(mounts)
}

/// Options observed on `mount`, expressed in the vocabulary of `expected`.
fn observed_options(mount: &MountInfo, expected: &BindMount) -> Vec<String> {
    let has = |o: &str| mount.options.iter().any(|m| m == o);
    let mut options = Vec::new();
    for option in ["ro", "noexec", "nosuid", "nodev"] {
        if has(option) {
            options.push(option.to_string());
        }
    }
    if expected.has("exec") && !has("noexec") {
        options.push("exec".to_string());
    }
    if expected.has("rshared") && mount.is_shared() {
        options.push("rshared".to_string());
    }
    options.sort();
    options
}

/// The staged commands that establish a bind mount.
pub fn mount_commands(mount: &BindMount) -> Result<Vec<Vec<String>>> {
    let mut remount = Vec::new();
    let mut simple = Vec::new();
    let mut make_shared = false;
    for option in mount.sorted_options() {
        match option.as_str() {
            "ro" => simple.push(option),
            "exec" | "noexec" | "nosuid" | "nodev" => remount.push(option),
            "rshared" => make_shared = true,
            other => bail!("unknown bind mount option {other:?} (expected one of {KNOWN_OPTIONS:?})"),
        }
    }

    let mut commands = Vec::new();
    let mut first = args(&["mount", if mount.recursive { "--rbind" } else { "--bind" }]);
    if !simple.is_empty() {
        first.push("-o".to_string());
        first.push(simple.join(","));
    }
    first.push(mount.source.clone());
    first.push(mount.mountpoint.clone());
    commands.push(first);

    if !remount.is_empty() {
        commands.push(args(&[
            "mount",
            "-o",
            &format!("remount,{}", remount.join(",")),
            &mount.mountpoint,
        ]));
    }
    if make_shared {
        commands.push(args(&["mount", "--make-rshared", &mount.mountpoint]));
    }
    Ok(commands)
}

impl Delta for BindMount {
    const KIND: &'static str = "BindMount";

    fn name(&self) -> String {
        self.mountpoint.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("Source", self.source.as_str()),
            Field::new("Options", self.sorted_options()),
            Field::new("Recursive", self.recursive),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = keys_of::<MountDisk>(tasks);
        deps.extend(creates_dir_parents(&self.mountpoint, tasks));
        for path in [&self.source, &self.mountpoint] {
            if tasks.get_as::<File>(path).is_some_and(File::creates_dir) {
                deps.push(TaskKey::new(File::KIND, path.as_str()));
            }
        }
        Some(deps)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let content = fs::read_to_string(MOUNTINFO).with_context(|| format!("error reading {MOUNTINFO}"))?;
        Ok(find_in_mountinfo(self, &parse_mountinfo(&content)?))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let commands = mount_commands(self)?;
        let mountpoint = Path::new(&self.mountpoint);
        if !mountpoint.exists() {
            mkdir_all(mountpoint, DEFAULT_DIR_MODE)?;
        }
        for command in &commands {
            log::info!("running {}", runner::human(command));
            runner::run(command)?;
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
        let commands = mount_commands(self)?;
        target.add_mkdir(Mode::Once, &self.mountpoint, DEFAULT_DIR_MODE);
        for command in commands {
            target.add_command(Mode::Once, command);
        }
        Ok(())
    }
}

/// The current state of `expected`'s mountpoint, if something matching its
/// source is mounted there.
pub fn find_in_mountinfo(expected: &BindMount, mounts: &[MountInfo]) -> Option<BindMount> {
    let wanted = Path::new(&expected.source);
    let canonical = fs::canonicalize(wanted).ok();
    let redirects: &[&str] = if expected.source == RESOLV_CONF {
        RESOLV_CONF_REDIRECTS
    } else {
        &[]
    };
    let mount = mounts.iter().rev().find(|m| {
        if m.mountpoint != expected.mountpoint {
            return false;
        }
        let source = m.effective_source(mounts);
        source == wanted
            || canonical.as_deref() == Some(source.as_path())
            || redirects.iter().any(|r| source == Path::new(r))
    })?;
    Some(BindMount {
        source: expected.source.clone(),
        mountpoint: expected.mountpoint.clone(),
        options: observed_options(mount, expected),
        recursive: expected.recursive,
    })
}
