use crate::files::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, write_file};
use anyhow::{Context as _, Result};
use assets::StringResource;
use converge::{Changes, Context, Delta, Field, LocalTarget};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const ETC_HOSTS: &str = "/etc/hosts";

const BLOCK_START: &str = "# Begin host entries managed by nodeup - do not edit";
const BLOCK_END: &str = "# End host entries managed by nodeup";

/// One hostname and the addresses it resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub hostname: String,
    pub addresses: Vec<String>,
}

impl HostRecord {
    pub fn new(hostname: &str, addresses: &[&str]) -> Self {
        Self {
            hostname: hostname.to_string(),
            addresses: addresses.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

/// Collapse records into hostname -> sorted, deduplicated addresses.
fn normalize(records: &[HostRecord]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records {
        out.entry(record.hostname.clone())
            .or_default()
            .extend(record.addresses.iter().cloned());
    }
    for addresses in out.values_mut() {
        addresses.sort();
        addresses.dedup();
    }
    out.retain(|_, addresses| !addresses.is_empty());
    out
}

/// Records found in the managed block of a hosts file.
pub fn parse_managed(content: &str) -> Vec<HostRecord> {
    let mut records: Vec<HostRecord> = Vec::new();
    let mut inside = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == BLOCK_START {
            inside = true;
            continue;
        }
        if trimmed == BLOCK_END {
            inside = false;
            continue;
        }
        if !inside || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let Some(address) = parts.next() else { continue };
        for hostname in parts {
            records.push(HostRecord::new(hostname, &[address]));
        }
    }
    normalize(&records)
        .into_iter()
        .map(|(hostname, addresses)| HostRecord { hostname, addresses })
        .collect()
}

/// Replace the managed block of `existing` with `records`.
///
/// Lines outside the block are kept as they are. An empty record set
/// removes the block entirely.
pub fn rewrite_hosts(existing: &str, records: &[HostRecord]) -> String {
    let mut out = Vec::new();
    let mut inside = false;
    for line in existing.lines() {
        match line.trim() {
            BLOCK_START => inside = true,
            BLOCK_END => inside = false,
            _ if !inside => out.push(line.to_string()),
            _ => {}
        }
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }

    let normalized = normalize(records);
    if !normalized.is_empty() {
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push(BLOCK_START.to_string());
        for (hostname, addresses) in &normalized {
            for address in addresses {
                out.push(format!("{address}\t{hostname}"));
            }
        }
        out.push(BLOCK_END.to_string());
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Keeps a managed set of entries in `/etc/hosts`.
#[derive(Debug, Clone, Default)]
pub struct UpdateEtcHosts {
    pub name: String,
    /// Hosts file to edit, `/etc/hosts` when unset.
    pub path: Option<String>,
    pub records: Vec<HostRecord>,
}

impl UpdateEtcHosts {
    pub fn new(name: &str, records: Vec<HostRecord>) -> Self {
        Self {
            name: name.to_string(),
            records,
            ..Default::default()
        }
    }

    fn path(&self) -> &Path {
        Path::new(self.path.as_deref().unwrap_or(ETC_HOSTS))
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(self.path()) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("error reading {}", self.path().display())),
        }
    }
}

impl Delta for UpdateEtcHosts {
    const KIND: &'static str = "UpdateEtcHosts";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        let records: Vec<String> = normalize(&self.records)
            .into_iter()
            .map(|(hostname, addresses)| format!("{hostname}={}", addresses.join(",")))
            .collect();
        vec![Field::new("Records", records)]
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let content = self.read()?;
        Ok(Some(Self {
            records: parse_managed(&content),
            ..self.clone()
        }))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let updated = rewrite_hosts(&self.read()?, &self.records);
        log::info!("updating host entries in {}", self.path().display());
        write_file(
            self.path(),
            &StringResource::new(updated),
            DEFAULT_FILE_MODE,
            DEFAULT_DIR_MODE,
        )
    }
}
