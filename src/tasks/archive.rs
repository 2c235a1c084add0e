use super::{args, creates_dir_parents};
use crate::files::{DEFAULT_DIR_MODE, mkdir_all};
use crate::tasks::File;
use anyhow::{Context as _, Result, bail};
use assets::Hash;
use converge::{
    Changes, CloudInitTarget, Context, Deletion, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap,
};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// What the marker file records about an installed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMarker {
    pub hash: String,
    pub target_dir: String,
}

/// A tarball unpacked under `target_dir`.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    pub name: String,
    /// URL or local path of the tarball.
    pub source: String,
    pub hash: Option<String>,
    pub target_dir: Option<String>,
    pub strip_components: Option<u32>,
    /// Directory holding install markers.
    pub marker_dir: PathBuf,
}

impl Archive {
    pub fn new(name: &str, source: &str, target_dir: &str, marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            target_dir: Some(target_dir.to_string()),
            marker_dir: marker_dir.into(),
            ..Default::default()
        }
    }

    fn marker_path(&self) -> PathBuf {
        self.marker_dir.join(format!("{}.json", self.name))
    }

    fn read_marker(&self) -> Result<Option<ArchiveMarker>> {
        let path = self.marker_path();
        match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .with_context(|| format!("error parsing archive marker {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("error reading {}", path.display())),
        }
    }

    fn write_marker(&self, marker: &ArchiveMarker) -> Result<()> {
        mkdir_all(&self.marker_dir, DEFAULT_DIR_MODE)?;
        let data = serde_json::to_string(marker)?;
        fs::write(self.marker_path(), data)
            .with_context(|| format!("error writing archive marker for {}", self.name))
    }

    fn target_dir(&self) -> Result<&str> {
        match self.target_dir.as_deref() {
            Some(dir) if !dir.is_empty() => Ok(dir),
            _ => bail!("archive {} has no target directory", self.name),
        }
    }
}

/// Unpack a gzipped tarball, dropping the first `strip` path components.
pub fn extract_tarball(archive: &Path, dest: &Path, strip: usize) -> Result<()> {
    let file = fs::File::open(archive).with_context(|| format!("error opening {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    mkdir_all(dest, DEFAULT_DIR_MODE)?;

    for entry in tar.entries().context("error reading archive")? {
        let mut entry = entry.context("error reading archive entry")?;
        let path = entry.path()?.into_owned();
        let mut relative = PathBuf::new();
        for component in path.components().skip(strip) {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                _ => bail!("refusing to extract {} from {}", path.display(), archive.display()),
            }
        }
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            mkdir_all(parent, DEFAULT_DIR_MODE)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("error extracting {}", target.display()))?;
    }
    Ok(())
}

/// Directory an archive was previously unpacked into.
#[derive(Debug)]
pub struct ArchiveDirDeletion {
    pub dir: String,
}

impl Deletion for ArchiveDirDeletion {
    fn task_kind(&self) -> &str {
        Archive::KIND
    }

    fn item(&self) -> String {
        self.dir.clone()
    }

    fn delete(&self, _target: &LocalTarget) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("error removing {}", self.dir)),
        }
    }
}

impl Delta for Archive {
    const KIND: &'static str = "Archive";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::opt("Hash", self.hash.clone()),
            Field::opt("TargetDir", self.target_dir.clone()),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let dir = self.target_dir.as_deref().unwrap_or_default();
        let mut deps = creates_dir_parents(dir, tasks);
        let own = TaskKey::new(File::KIND, dir);
        if tasks.get_as::<File>(dir).is_some_and(File::creates_dir) {
            deps.push(own);
        }
        Some(deps)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let Some(marker) = self.read_marker()? else {
            return Ok(None);
        };
        Ok(Some(Self {
            name: self.name.clone(),
            source: self.source.clone(),
            hash: Some(marker.hash),
            target_dir: Some(marker.target_dir),
            strip_components: self.strip_components,
            marker_dir: self.marker_dir.clone(),
        }))
    }

    fn find_deletions(&self, _ctx: &Context<'_>) -> Result<Vec<Box<dyn Deletion>>> {
        let Some(marker) = self.read_marker()? else {
            return Ok(Vec::new());
        };
        if Some(marker.target_dir.as_str()) == self.target_dir.as_deref() {
            return Ok(Vec::new());
        }
        Ok(vec![Box::new(ArchiveDirDeletion {
            dir: marker.target_dir,
        })])
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let target_dir = self.target_dir()?;
        let expected = self
            .hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(Hash::parse)
            .transpose()
            .with_context(|| format!("invalid hash for archive {}", self.name))?;

        let download = target.cache_dir().join("archives").join(format!("{}.tar.gz", self.name));
        let hash = ctx
            .services
            .fetcher()
            .fetch(std::slice::from_ref(&self.source), &download, expected.as_ref())?;

        log::info!("extracting archive {} to {target_dir}", self.name);
        let strip = self.strip_components.unwrap_or(0) as usize;
        extract_tarball(&download, Path::new(target_dir), strip)?;

        self.write_marker(&ArchiveMarker {
            hash: self.hash.clone().unwrap_or_else(|| hash.to_string()),
            target_dir: target_dir.to_string(),
        })
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let target_dir = self.target_dir()?;
        let download = format!("/tmp/nodeup-archive-{}.tar.gz", self.name);
        target.add_download_command(Mode::Once, &self.source, &download);
        target.add_mkdir(Mode::Once, target_dir, DEFAULT_DIR_MODE);
        let strip = format!("--strip-components={}", self.strip_components.unwrap_or(0));
        target.add_command(
            Mode::Once,
            args(&["tar", "zxf", &download, &strip, "-C", target_dir]),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::{
        DryRunTarget, ExecuteOptions, InventoryTarget, NoProgress, Services, Target, run_tasks,
    };
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn write_tarball(path: &Path, members: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn run(tasks: &TaskMap, target: &Target) -> converge::ExecuteSummary {
        run_tasks(tasks, target, &Services::default(), &ExecuteOptions::default(), &mut NoProgress)
            .unwrap()
    }

    #[test]
    fn test_install_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("cni.tgz");
        write_tarball(&tarball, &[("cni/bin/bridge", "bridge"), ("cni/bin/loopback", "lo")]);
        let dest = dir.path().join("opt/cni/bin");
        let markers = dir.path().join("state/archives");

        let mut task = Archive::new("cni", tarball.to_str().unwrap(), dest.to_str().unwrap(), &markers);
        task.strip_components = Some(2);
        let mut tasks = TaskMap::default();
        tasks.insert(task).unwrap();

        let local = Target::Local(LocalTarget::new(dir.path().join("cache"), dir.path().join("state")));
        assert_eq!(run(&tasks, &local).created, 1);
        assert_eq!(fs::read_to_string(dest.join("bridge")).unwrap(), "bridge");
        assert_eq!(fs::read_to_string(dest.join("loopback")).unwrap(), "lo");
        assert!(markers.join("cni.json").exists());

        assert_eq!(run(&tasks, &local).total_changes(), 0);
    }

    #[test]
    fn test_hash_change_reextracts() {
        let dir = TempDir::new().unwrap();
        let markers = dir.path().join("markers");
        let dest = dir.path().join("opt/x");
        let local = Target::Local(LocalTarget::new(dir.path().join("cache"), dir.path().join("state")));

        let v1 = dir.path().join("x-1.tgz");
        write_tarball(&v1, &[("x/version", "one")]);
        let h1 = Hash::of_file(assets::HashAlgorithm::Sha256, &v1).unwrap().hex().to_string();
        let mut first = Archive::new("x", v1.to_str().unwrap(), dest.to_str().unwrap(), &markers);
        first.hash = Some(h1.clone());
        first.strip_components = Some(1);
        let mut tasks = TaskMap::default();
        tasks.insert(first).unwrap();
        assert_eq!(run(&tasks, &local).created, 1);
        assert_eq!(run(&tasks, &local).total_changes(), 0);

        let v2 = dir.path().join("x-2.tgz");
        write_tarball(&v2, &[("x/version", "two")]);
        let h2 = Hash::of_file(assets::HashAlgorithm::Sha256, &v2).unwrap().hex().to_string();
        assert_ne!(h1, h2);
        let mut second = Archive::new("x", v2.to_str().unwrap(), dest.to_str().unwrap(), &markers);
        second.hash = Some(h2.clone());
        second.strip_components = Some(1);
        let mut tasks = TaskMap::default();
        tasks.insert(second).unwrap();

        assert_eq!(run(&tasks, &local).modified, 1);
        assert_eq!(fs::read_to_string(dest.join("version")).unwrap(), "two");
        let marker: ArchiveMarker =
            serde_json::from_str(&fs::read_to_string(markers.join("x.json")).unwrap()).unwrap();
        assert_eq!(marker.hash, h2);
        assert_eq!(run(&tasks, &local).total_changes(), 0);
    }

    #[test]
    fn test_moved_target_dir_deletes_old() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("tools.tgz");
        write_tarball(&tarball, &[("bin/tool", "x")]);
        let markers = dir.path().join("markers");
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let local = Target::Local(LocalTarget::new(dir.path().join("cache"), dir.path().join("state")));

        let mut first = TaskMap::default();
        first
            .insert(Archive::new("tools", tarball.to_str().unwrap(), old.to_str().unwrap(), &markers))
            .unwrap();
        run(&first, &local);
        assert!(old.join("bin/tool").exists());

        let mut second = TaskMap::default();
        second
            .insert(Archive::new("tools", tarball.to_str().unwrap(), new.to_str().unwrap(), &markers))
            .unwrap();

        let inventory = Target::Inventory(InventoryTarget::new());
        run(&second, &inventory);
        if let Target::Inventory(inv) = &inventory {
            assert_eq!(inv.deletions().len(), 1);
        }

        let summary = run(&second, &local);
        assert_eq!(summary.modified, 1);
        assert!(new.join("bin/tool").exists());
        assert!(!old.exists());

        let dry_run = Target::DryRun(DryRunTarget::with_output(Box::new(std::io::sink())));
        assert_eq!(run(&second, &dry_run).total_changes(), 0);
    }

    #[test]
    fn test_extract_rejects_parent_components() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("evil.tgz");
        {
            let file = fs::File::create(&tarball).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            let mut header = tar::Header::new_gnu();
            header.set_size(1);
            header.set_mode(0o644);
            // Header::set_path refuses "..", so write the name bytes directly.
            let name = b"x/../../escape";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, &b"x"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        assert!(extract_tarball(&tarball, &dir.path().join("out"), 0).is_err());
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn test_cloud_init_commands() {
        let target = CloudInitTarget::new();
        let tasks = TaskMap::default();
        let services = Services::default();
        let wrapped = Target::DryRun(DryRunTarget::new());
        let ctx = crate::tasks::testing::context(&wrapped, &tasks, &services);
        let mut task = Archive::new("cni", "https://example.com/cni.tgz", "/opt/cni/bin", "/var/lib/nodeup");
        task.strip_components = Some(1);
        task.render_cloud_init(&target, &ctx, None, &Changes::default()).unwrap();
        let runcmd = target.config().runcmd;
        assert!(runcmd.iter().any(|c| c.contains(&"--strip-components=1".to_string())));
    }
}
