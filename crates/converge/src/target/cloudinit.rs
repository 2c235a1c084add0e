//! Emit a `#cloud-config` document instead of touching the machine.

use anyhow::bail;
use assets::{ResourceRef, Source, as_bytes};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Whether a command may appear more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Always,
    Once,
}

/// A `write_files` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudConfigFile {
    pub encoding: String,
    pub owner: String,
    pub path: String,
    pub permissions: String,
    pub content: String,
}

/// The document being built.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub package_update: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<CloudConfigFile>,
}

#[derive(Default)]
struct State {
    config: CloudConfig,
    once: BTreeSet<Vec<String>>,
}

pub struct CloudInitTarget {
    state: Mutex<State>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl fmt::Debug for CloudInitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudInitTarget").finish_non_exhaustive()
    }
}

impl Default for CloudInitTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudInitTarget {
    /// Writes the document to stdout on finish.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            output: Mutex::new(output),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn add_command(&self, mode: Mode, args: Vec<String>) {
        self.with_state(|state| {
            if mode == Mode::Once && !state.once.insert(args.clone()) {
                return;
            }
            state.config.runcmd.push(args);
        });
    }

    pub fn add_package(&self, name: &str) {
        self.with_state(|state| {
            if !state.config.packages.iter().any(|p| p == name) {
                state.config.packages.push(name.to_string());
            }
        });
    }

    pub fn set_package_update(&self) {
        self.with_state(|state| state.config.package_update = true);
    }

    pub fn add_mkdir(&self, mode: Mode, path: &str, dir_mode: u32) {
        self.add_command(
            mode,
            args(&["mkdir", "-p", "-m", &format!("{dir_mode:o}"), path]),
        );
    }

    pub fn add_download_command(&self, mode: Mode, url: &str, dest: &str) {
        self.add_command(
            mode,
            args(&[
                "curl",
                "-f",
                "--ipv4",
                "-Lo",
                dest,
                "--connect-timeout",
                "20",
                "--retry",
                "6",
                "--retry-delay",
                "10",
                url,
            ]),
        );
    }

    pub fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) {
        let spec = match (owner, group) {
            (Some(o), Some(g)) => format!("{o}:{g}"),
            (Some(o), None) => o.to_string(),
            (None, Some(g)) => format!(":{g}"),
            (None, None) => return,
        };
        self.add_command(Mode::Always, args(&["chown", &spec, path]));
    }

    /// Place `contents` at `path`: downloaded or extracted on the machine
    /// when it came from a URL, inline otherwise.
    pub fn write_file(
        &self,
        path: &str,
        contents: &ResourceRef,
        file_mode: u32,
        dir_mode: u32,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(dir) = Path::new(path).parent().and_then(Path::to_str) {
            if !dir.is_empty() && dir != "/" {
                self.add_mkdir(Mode::Once, dir, dir_mode);
            }
        }

        match contents.source() {
            Some(Source::Url { url, .. }) => {
                self.add_download_command(Mode::Always, &url, path);
                self.chmod(path, file_mode);
            }
            Some(Source::Extract { parent, member }) => {
                let Source::Url { url, .. } = *parent else {
                    bail!("cannot render nested archive member {member} for {path}");
                };
                let name = url.rsplit('/').next().unwrap_or("archive");
                let archive = format!("/tmp/nodeup-{name}");
                let extract_dir = format!("/tmp/nodeup-extract-{name}");
                self.add_download_command(Mode::Once, &url, &archive);
                self.add_command(Mode::Once, args(&["mkdir", "-p", &extract_dir]));
                self.add_command(
                    Mode::Once,
                    args(&["tar", "zxf", &archive, "-C", &extract_dir]),
                );
                self.add_command(
                    Mode::Always,
                    args(&["cp", &format!("{extract_dir}/{member}"), path]),
                );
                self.chmod(path, file_mode);
            }
            None => {
                let data = as_bytes(contents.as_ref())?;
                let owner = format!(
                    "{}:{}",
                    owner.unwrap_or("root"),
                    group.unwrap_or("root")
                );
                self.with_state(|state| {
                    state.config.write_files.push(CloudConfigFile {
                        encoding: "b64".to_string(),
                        owner,
                        path: path.to_string(),
                        permissions: format!("0{file_mode:o}"),
                        content: STANDARD.encode(data),
                    });
                });
                return Ok(());
            }
        }
        self.chown(path, owner, group);
        Ok(())
    }

    fn chmod(&self, path: &str, file_mode: u32) {
        self.add_command(
            Mode::Always,
            args(&["chmod", &format!("{file_mode:o}"), path]),
        );
    }

    pub fn config(&self) -> CloudConfig {
        self.with_state(|state| state.config.clone())
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let body = serde_yaml::to_string(&self.config())?;
        Ok(format!("#cloud-config\n{body}"))
    }

    pub(crate) fn finish(&self) -> anyhow::Result<()> {
        let document = self.render()?;
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        output.write_all(document.as_bytes())?;
        output.flush()?;
        Ok(())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assets::{AssetResource, Hash, StringResource};

    #[test]
    fn test_once_commands_are_deduplicated() {
        let target = CloudInitTarget::with_output(Box::new(io::sink()));
        target.add_command(Mode::Once, args(&["systemctl", "daemon-reload"]));
        target.add_command(Mode::Once, args(&["systemctl", "daemon-reload"]));
        target.add_command(Mode::Always, args(&["echo", "hi"]));
        target.add_command(Mode::Always, args(&["echo", "hi"]));
        assert_eq!(target.config().runcmd.len(), 3);
    }

    #[test]
    fn test_inline_file() {
        let target = CloudInitTarget::with_output(Box::new(io::sink()));
        let contents = StringResource::shared("hello");
        target
            .write_file("/etc/motd", &contents, 0o644, 0o755, None, None)
            .unwrap();
        let config = target.config();
        let file = &config.write_files[0];
        assert_eq!(file.encoding, "b64");
        assert_eq!(file.owner, "root:root");
        assert_eq!(file.permissions, "0644");
        assert_eq!(file.content, "aGVsbG8=");

        let rendered = target.render().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("write_files:"));
        assert!(!rendered.contains("packages"));
    }

    #[test]
    fn test_downloaded_file_and_archive_member() {
        let target = CloudInitTarget::with_output(Box::new(io::sink()));
        let hash = Hash::of_bytes(assets::HashAlgorithm::Sha256, b"x");
        let url = Source::Url {
            url: "https://example.com/kubelet".into(),
            hash: hash.clone(),
        };
        let kubelet: ResourceRef = std::sync::Arc::new(AssetResource::new("/cache/kubelet", url));
        target
            .write_file("/usr/local/bin/kubelet", &kubelet, 0o755, 0o755, None, None)
            .unwrap();

        let member = Source::Extract {
            parent: Box::new(Source::Url {
                url: "https://example.com/cni.tgz".into(),
                hash,
            }),
            member: "bridge".into(),
        };
        let bridge: ResourceRef = std::sync::Arc::new(AssetResource::new("/cache/x/bridge", member));
        target
            .write_file("/opt/cni/bin/bridge", &bridge, 0o755, 0o755, None, None)
            .unwrap();

        let runcmd = target.config().runcmd;
        assert!(runcmd.contains(&args(&["mkdir", "-p", "-m", "755", "/usr/local/bin"])));
        assert!(runcmd.iter().any(|c| c[0] == "curl" && c.last().unwrap() == "https://example.com/kubelet"));
        assert!(runcmd.contains(&args(&["tar", "zxf", "/tmp/nodeup-cni.tgz", "-C", "/tmp/nodeup-extract-cni.tgz"])));
        assert!(runcmd.contains(&args(&["cp", "/tmp/nodeup-extract-cni.tgz/bridge", "/opt/cni/bin/bridge"])));
        assert!(target.config().write_files.is_empty());
    }

    #[test]
    fn test_packages() {
        let target = CloudInitTarget::with_output(Box::new(io::sink()));
        target.set_package_update();
        target.add_package("socat");
        target.add_package("socat");
        let rendered = target.render().unwrap();
        assert!(rendered.contains("package_update: true"));
        assert_eq!(target.config().packages, vec!["socat"]);
    }
}
