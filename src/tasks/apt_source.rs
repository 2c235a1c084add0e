use super::args;
use crate::files::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, write_file};
use crate::runner;
use anyhow::{Context as _, Result};
use assets::{ResourceRef, StringResource};
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

const SOURCES_DIR: &str = "etc/apt/sources.list.d";
const KEYRINGS_DIR: &str = "etc/apt/keyrings";

/// An apt repository with an optional signing keyring.
#[derive(Debug, Clone, Default)]
pub struct AptSource {
    pub name: String,
    /// The `deb ...` line.
    pub line: String,
    /// URL or local path of the repository keyring.
    pub keyring: Option<String>,
    /// Filesystem root, `/` when empty.
    pub root: PathBuf,
}

impl AptSource {
    pub fn new(name: &str, line: &str) -> Self {
        Self {
            name: name.to_string(),
            line: line.to_string(),
            ..Default::default()
        }
    }

    fn root(&self) -> PathBuf {
        if self.root.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            self.root.clone()
        }
    }

    pub fn list_path(&self) -> PathBuf {
        self.root().join(SOURCES_DIR).join(format!("{}.list", self.name))
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.root().join(KEYRINGS_DIR).join(format!("{}.gpg", self.name))
    }

    fn list_contents(&self) -> String {
        format!("{}\n", self.line.trim())
    }
}

impl Delta for AptSource {
    const KIND: &'static str = "AptSource";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("Line", self.line.trim()),
            Field::opt("Keyring", self.keyring.clone()),
        ]
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let path = self.list_path();
        let line = match fs::read_to_string(&path) {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("error reading {}", path.display())),
        };
        let keyring = self.keyring.clone().filter(|_| self.keyring_path().exists());
        Ok(Some(Self {
            line,
            keyring,
            ..self.clone()
        }))
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        if let Some(keyring) = &self.keyring
            && changes.has("Keyring")
        {
            ctx.services
                .fetcher()
                .fetch(std::slice::from_ref(keyring), &self.keyring_path(), None)?;
        }
        let contents = StringResource::new(self.list_contents());
        write_file(&self.list_path(), &contents, DEFAULT_FILE_MODE, DEFAULT_DIR_MODE)?;

        let _lock = target.lock_packages();
        log::info!("refreshing package index for apt source {}", self.name);
        runner::run_with_env(&args(&["apt-get", "update"]), &[("DEBIAN_FRONTEND", "noninteractive")])?;
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        if let Some(keyring) = &self.keyring {
            let path = self.keyring_path();
            target.add_mkdir(Mode::Once, &self.root().join(KEYRINGS_DIR).to_string_lossy(), DEFAULT_DIR_MODE);
            target.add_download_command(Mode::Once, keyring, &path.to_string_lossy());
        }
        let contents: ResourceRef = Arc::new(StringResource::new(self.list_contents()));
        target.write_file(
            &self.list_path().to_string_lossy(),
            &contents,
            DEFAULT_FILE_MODE,
            DEFAULT_DIR_MODE,
            None,
            None,
        )?;
        target.set_package_update();
        Ok(())
    }
}
