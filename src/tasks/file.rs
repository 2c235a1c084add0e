use super::{creates_dir_parents, keys_of, push_if_present, resource_dependency};
use crate::files::{
    self, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, ensure_file_mode, ensure_file_owner,
    file_mode_string, mkdir_all, parse_file_mode,
};
use crate::runner;
use crate::tasks::MountDisk;
use anyhow::{Context as _, Result, bail};
use assets::{FileResource, ResourceRef};
use converge::{
    Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        })
    }
}

/// A file, directory or symlink at `path`.
#[derive(Debug, Clone, Default)]
pub struct File {
    pub path: String,
    pub file_type: Option<FileType>,
    pub contents: Option<ResourceRef>,
    /// Octal permission bits, e.g. `0600`.
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub symlink: Option<String>,
    /// Leave an existing file alone whatever its contents.
    pub if_not_exists: bool,
    /// Commands run after the file changed.
    pub on_change_execute: Vec<Vec<String>>,
    /// Paths of files that must be written first.
    pub after_files: Vec<String>,
}

impl File {
    pub fn new(path: &str, contents: ResourceRef, mode: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            file_type: Some(FileType::File),
            contents: Some(contents),
            mode: mode.map(String::from),
            ..Default::default()
        }
    }

    pub fn directory(path: &str, mode: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            file_type: Some(FileType::Directory),
            mode: mode.map(String::from),
            ..Default::default()
        }
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            file_type: Some(FileType::Symlink),
            symlink: Some(target.to_string()),
            ..Default::default()
        }
    }

    pub fn creates_dir(&self) -> bool {
        self.file_type == Some(FileType::Directory)
    }

    fn kind(&self) -> FileType {
        self.file_type.unwrap_or(FileType::File)
    }

    fn file_mode(&self) -> Result<u32> {
        let default = if self.creates_dir() {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        };
        parse_file_mode(self.mode.as_deref(), default)
            .with_context(|| format!("invalid file mode for {}", self.path))
    }
}

/// What is at `path` right now.
pub fn find_file(path: &str) -> Result<Option<File>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("error reading {path}")),
    };

    let mut actual = File {
        path: path.to_string(),
        mode: Some(file_mode_string(meta.mode())),
        owner: Some(files::user_name(meta.uid())?),
        group: Some(files::group_name(meta.gid())?),
        ..Default::default()
    };

    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path)
            .with_context(|| format!("error reading symlink target of {path}"))?;
        actual.file_type = Some(FileType::Symlink);
        actual.symlink = Some(target.to_string_lossy().into_owned());
    } else if file_type.is_dir() {
        actual.file_type = Some(FileType::Directory);
    } else {
        actual.file_type = Some(FileType::File);
        actual.contents = Some(Arc::new(FileResource::new(path)));
    }
    Ok(Some(actual))
}

impl Delta for File {
    const KIND: &'static str = "File";

    fn name(&self) -> String {
        self.path.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::opt("Type", self.file_type.map(|t| t.to_string())),
            Field::opt("Contents", self.contents.clone()),
            Field::opt("Mode", self.mode.clone()),
            Field::opt("Owner", self.owner.clone()),
            Field::opt("Group", self.group.clone()),
            Field::opt("Symlink", self.symlink.clone()),
            Field::new("IfNotExists", self.if_not_exists),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = Vec::new();
        if let Some(owner) = &self.owner {
            push_if_present(&mut deps, TaskKey::new("User", owner.as_str()), tasks);
        }
        deps.extend(keys_of::<MountDisk>(tasks));
        deps.extend(creates_dir_parents(&self.path, tasks));
        for after in &self.after_files {
            push_if_present(&mut deps, TaskKey::new(Self::KIND, after.as_str()), tasks);
        }
        deps.extend(resource_dependency(self.contents.as_ref(), tasks));
        Some(deps)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let Some(mut actual) = find_file(&self.path)? else {
            return Ok(None);
        };
        actual.if_not_exists = self.if_not_exists;
        if self.if_not_exists {
            actual.contents.clone_from(&self.contents);
        }
        actual.on_change_execute.clone_from(&self.on_change_execute);
        actual.after_files.clone_from(&self.after_files);
        Ok(Some(actual))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        let file_mode = self.file_mode()?;
        if actual.is_some() && self.if_not_exists {
            log::debug!("file exists and if_not_exists is set; skipping {}", self.path);
            return Ok(());
        }

        let path = Path::new(&self.path);
        let mut changed = false;
        match self.kind() {
            FileType::Symlink => {
                if changes.has("Symlink") {
                    let Some(target) = &self.symlink else {
                        bail!("symlink {} has no target", self.path);
                    };
                    if actual.is_some() {
                        fs::remove_file(path)
                            .with_context(|| format!("error replacing {}", self.path))?;
                    }
                    log::info!("creating symlink {} -> {target}", self.path);
                    std::os::unix::fs::symlink(target, path).with_context(|| {
                        format!("error creating symlink {} -> {target}", self.path)
                    })?;
                    changed = true;
                }
            }
            FileType::Directory => {
                if actual.is_none() {
                    if let Some(parent) = Path::new(self.path.trim_end_matches('/')).parent() {
                        mkdir_all(parent, DEFAULT_DIR_MODE)?;
                    }
                    DirBuilder::new()
                        .recursive(true)
                        .mode(file_mode)
                        .create(path)
                        .with_context(|| format!("error creating directory {}", self.path))?;
                    changed = true;
                }
            }
            FileType::File => {
                if changes.has("Contents") {
                    let Some(contents) = &self.contents else {
                        bail!("file {} has no contents", self.path);
                    };
                    files::write_file(path, contents.as_ref(), file_mode, DEFAULT_DIR_MODE)
                        .with_context(|| format!("error copying file {}", self.path))?;
                    changed = true;
                }
            }
        }

        if changes.has("Mode") {
            changed |= ensure_file_mode(path, file_mode)?;
        }
        if changes.has("Owner") || changes.has("Group") {
            changed |= ensure_file_owner(path, self.owner.as_deref(), self.group.as_deref())
                .with_context(|| format!("error changing owner/group on {}", self.path))?;
        }

        if changed {
            for command in &self.on_change_execute {
                log::info!("changed; executing {}", runner::human(command));
                runner::run(command)?;
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
        if !self.on_change_execute.is_empty() {
            bail!("on_change_execute is not supported with cloud-init ({})", self.path);
        }
        let file_mode = self.file_mode()?;
        match self.kind() {
            FileType::Symlink => {
                let Some(link) = &self.symlink else {
                    bail!("symlink {} has no target", self.path);
                };
                target.add_command(Mode::Always, super::args(&["ln", "-sfn", link, &self.path]));
            }
            FileType::Directory => {
                if let Some(parent) = Path::new(self.path.trim_end_matches('/')).parent()
                    && let Some(parent) = parent.to_str()
                {
                    target.add_mkdir(Mode::Once, parent, DEFAULT_DIR_MODE);
                }
                target.add_mkdir(Mode::Once, &self.path, file_mode);
            }
            FileType::File => {
                let Some(contents) = &self.contents else {
                    bail!("file {} has no contents", self.path);
                };
                return target.write_file(
                    &self.path,
                    contents,
                    file_mode,
                    DEFAULT_DIR_MODE,
                    self.owner.as_deref(),
                    self.group.as_deref(),
                );
            }
        }
        if self.owner.is_some() || self.group.is_some() {
            target.chown(&self.path, self.owner.as_deref(), self.group.as_deref());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::context;
    use assets::StringResource;
    use converge::{
        CloudInitTarget, DryRunTarget, ExecuteOptions, NoProgress, Services, Target, run_tasks,
    };
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn local(dir: &TempDir) -> Target {
        Target::Local(LocalTarget::new(dir.path().join("cache"), dir.path().join("state")))
    }

    #[test]
    fn test_find_missing_and_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kubelet.conf");
        assert!(find_file(path.to_str().unwrap()).unwrap().is_none());

        fs::write(&path, "hello").unwrap();
        let found = find_file(path.to_str().unwrap()).unwrap().unwrap();
        assert_eq!(found.file_type, Some(FileType::File));
        assert!(found.contents.is_some());
        assert_eq!(found.mode.as_deref().map(str::len), Some(4));
    }

    #[test]
    fn test_local_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/node.conf");
        let path_str = path.to_str().unwrap();

        let mut tasks = TaskMap::default();
        tasks
            .insert(File::new(path_str, StringResource::shared("a=1\n"), Some("0600")))
            .unwrap();
        let target = local(&dir);
        let services = Services::default();
        let opts = ExecuteOptions::default();

        let first = run_tasks(&tasks, &target, &services, &opts, &mut NoProgress).unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "a=1\n");
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o7777, 0o600);

        let second = run_tasks(&tasks, &target, &services, &opts, &mut NoProgress).unwrap();
        assert_eq!(second.total_changes(), 0);
    }

    #[test]
    fn test_dry_run_reports_without_writing() {
        let dir = TempDir::new().unwrap();
        let absent = dir.path().join("etc/new.conf");
        let changed = dir.path().join("changed.conf");
        fs::write(&changed, "old").unwrap();
        fs::set_permissions(&changed, Permissions::from_mode(0o644)).unwrap();

        let mut tasks = TaskMap::default();
        tasks
            .insert(File::new(absent.to_str().unwrap(), StringResource::shared("fresh"), None))
            .unwrap();
        tasks
            .insert(File::new(changed.to_str().unwrap(), StringResource::shared("new"), Some("0600")))
            .unwrap();

        let target = Target::DryRun(DryRunTarget::with_output(Box::new(std::io::sink())));
        run_tasks(&tasks, &target, &Services::default(), &ExecuteOptions::default(), &mut NoProgress)
            .unwrap();
        let Target::DryRun(dry_run) = &target else {
            unreachable!()
        };
        assert!(dry_run.has_changes());
        let report = dry_run.report();

        let created_at = report.find("Created resources:").unwrap();
        let changed_at = report.find("Changed resources:").unwrap();
        assert!(created_at < changed_at);
        let created = &report[created_at..changed_at];
        let changes = &report[changed_at..];
        assert!(created.contains(&format!("File\tFile/{}", absent.display())));
        assert!(changes.contains(&format!("File\tFile/{}", changed.display())));
        assert!(changes.contains("Mode 0644 -> 0600"));
        assert!(changes.contains("Contents <resource> -> <resource>"));

        assert!(!absent.exists());
        assert!(!absent.parent().unwrap().exists());
        assert_eq!(fs::read_to_string(&changed).unwrap(), "old");
        assert_eq!(fs::metadata(&changed).unwrap().mode() & 0o7777, 0o644);
    }

    #[test]
    fn test_if_not_exists_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "original").unwrap();

        let mut task = File::new(path.to_str().unwrap(), StringResource::shared("new"), None);
        task.if_not_exists = true;
        let target = local(&dir);
        let tasks = TaskMap::default();
        let services = Services::default();
        let ctx = context(&target, &tasks, &services);
        let actual = task.find(&ctx).unwrap().unwrap();
        let changes = converge::build_changes(Some(&actual), &task).unwrap();
        assert!(!changes.has("Contents"));
        task.render_local(&LocalTarget::new("/tmp", "/tmp"), &ctx, Some(&actual), &changes)
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn test_symlink_and_directory() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("bin/kubectl");
        let sub = dir.path().join("bin");

        let mut tasks = TaskMap::default();
        tasks.insert(File::directory(sub.to_str().unwrap(), None)).unwrap();
        tasks
            .insert(File::symlink(link.to_str().unwrap(), "/usr/local/bin/kubectl"))
            .unwrap();
        let target = local(&dir);
        run_tasks(&tasks, &target, &Services::default(), &ExecuteOptions::default(), &mut NoProgress)
            .unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap().to_str().unwrap(),
            "/usr/local/bin/kubectl"
        );
        assert!(sub.is_dir());
    }

    #[test]
    fn test_dependencies() {
        let mut tasks = TaskMap::default();
        tasks.insert(File::directory("/etc/kubernetes", None)).unwrap();
        tasks.insert(crate::tasks::User::new("kube")).unwrap();
        tasks
            .insert(File::new("/etc/kubernetes/first", StringResource::shared("1"), None))
            .unwrap();
        let mut task = File::new("/etc/kubernetes/second", StringResource::shared("2"), None);
        task.owner = Some("kube".into());
        task.after_files = vec!["/etc/kubernetes/first".into()];

        let deps = task.dependencies(&tasks).unwrap();
        assert!(deps.contains(&TaskKey::new("User", "kube")));
        assert!(deps.contains(&TaskKey::new("File", "/etc/kubernetes")));
        assert!(deps.contains(&TaskKey::new("File", "/etc/kubernetes/first")));
    }

    #[test]
    fn test_cloud_init_rejects_on_change_execute() {
        let target = CloudInitTarget::new();
        let tasks = TaskMap::default();
        let services = Services::default();
        let wrapped = Target::DryRun(DryRunTarget::new());
        let ctx = context(&wrapped, &tasks, &services);

        let mut task = File::new("/etc/sysctl.d/99-k8s.conf", StringResource::shared("x"), None);
        task.on_change_execute = vec![vec!["sysctl".into(), "--system".into()]];
        assert!(task.render_cloud_init(&target, &ctx, None, &Changes::default()).is_err());

        task.on_change_execute.clear();
        task.render_cloud_init(&target, &ctx, None, &Changes::default()).unwrap();
        let config = target.config();
        assert_eq!(config.write_files.len(), 1);
        assert_eq!(config.write_files[0].permissions, "0644");
    }
}
