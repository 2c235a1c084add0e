//! Record renders and report them instead of applying.

use super::Deletion;
use crate::task::TaskKey;
use crate::value::{Changes, Value};
use assets::as_string;
use similar::TextDiff;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::Mutex;

#[derive(Debug)]
struct Render {
    key: TaskKey,
    created: bool,
    changes: Changes,
}

#[derive(Debug, Default)]
struct Records {
    renders: Vec<Render>,
    deletions: Vec<(String, String)>,
    find_failures: Vec<(TaskKey, String)>,
}

pub struct DryRunTarget {
    records: Mutex<Records>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl fmt::Debug for DryRunTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DryRunTarget")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl Default for DryRunTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunTarget {
    /// Prints the report to stdout on finish.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            output: Mutex::new(output),
        }
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut records)
    }

    pub fn record(&self, key: &TaskKey, created: bool, changes: &Changes) {
        self.with_records(|r| {
            r.renders.push(Render {
                key: key.clone(),
                created,
                changes: changes.clone(),
            });
        });
    }

    pub fn record_deletion(&self, deletion: &dyn Deletion) {
        self.with_records(|r| {
            r.deletions
                .push((deletion.task_kind().to_string(), deletion.item()));
        });
    }

    pub fn record_find_failure(&self, key: &TaskKey, err: &anyhow::Error) {
        self.with_records(|r| r.find_failures.push((key.clone(), format!("{err:#}"))));
    }

    pub fn has_changes(&self) -> bool {
        self.with_records(|r| !r.renders.is_empty() || !r.deletions.is_empty())
    }

    /// The human readable report.
    pub fn report(&self) -> String {
        self.with_records(|r| {
            let mut renders: Vec<&Render> = r.renders.iter().collect();
            renders.sort_by(|a, b| a.key.cmp(&b.key));
            let (created, changed): (Vec<&Render>, Vec<&Render>) =
                renders.into_iter().partition(|r| r.created);

            let mut out = String::new();
            if created.is_empty() && changed.is_empty() && r.deletions.is_empty() {
                out.push_str("No changes need to be applied\n");
            }
            if !created.is_empty() {
                out.push_str("Created resources:\n");
                for render in created {
                    let _ = writeln!(out, "  {}\t{}", render.key.kind, render.key);
                    for change in render.changes.iter() {
                        let _ = writeln!(out, "    {} {}", change.name, change.after);
                    }
                }
                out.push('\n');
            }
            if !changed.is_empty() {
                out.push_str("Changed resources:\n");
                for render in changed {
                    let _ = writeln!(out, "  {}\t{}", render.key.kind, render.key);
                    for change in render.changes.iter() {
                        let before = change
                            .before
                            .as_ref()
                            .map_or_else(|| "<nil>".to_string(), ToString::to_string);
                        let _ = writeln!(out, "    {} {before} -> {}", change.name, change.after);
                        if let (Some(before), after) = (&change.before, &change.after) {
                            push_resource_diff(&mut out, before, after);
                        }
                    }
                }
                out.push('\n');
            }
            if !r.deletions.is_empty() {
                out.push_str("Will delete items:\n");
                for (kind, item) in &r.deletions {
                    let _ = writeln!(out, "  {kind}\t{item}");
                }
                out.push('\n');
            }
            if !r.find_failures.is_empty() {
                out.push_str("Find failures:\n");
                for (key, message) in &r.find_failures {
                    let _ = writeln!(out, "  {}\t{key}: {message}", key.kind);
                }
                out.push('\n');
            }
            out
        })
    }

    pub(crate) fn finish(&self) -> anyhow::Result<()> {
        let report = self.report();
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        output.write_all(report.as_bytes())?;
        output.flush()?;
        Ok(())
    }
}

/// Unified diff of two text resources, indented under their field line.
fn push_resource_diff(out: &mut String, before: &Value, after: &Value) {
    let (Some(before), Some(after)) = (before.as_resource(), after.as_resource()) else {
        return;
    };
    let (Ok(before), Ok(after)) = (as_string(before.as_ref()), as_string(after.as_ref())) else {
        return;
    };
    let diff = TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header("actual", "expected")
        .to_string();
    for line in diff.lines() {
        let _ = writeln!(out, "      {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldChange;
    use assets::StringResource;

    #[test]
    fn test_report_sections() {
        let target = DryRunTarget::with_output(Box::new(io::sink()));

        let mut created = Changes::default();
        created.push(FieldChange {
            name: "Mode",
            before: None,
            after: "0644".into(),
        });
        target.record(&TaskKey::new("File", "/etc/new"), true, &created);

        let mut changed = Changes::default();
        changed.push(FieldChange {
            name: "Mode",
            before: Some("0600".into()),
            after: "0644".into(),
        });
        changed.push(FieldChange {
            name: "Contents",
            before: Some(Value::Resource(StringResource::shared("a\nb\n"))),
            after: Value::Resource(StringResource::shared("a\nc\n")),
        });
        target.record(&TaskKey::new("File", "/etc/old"), false, &changed);

        let report = target.report();
        let created_at = report.find("Created resources:").unwrap();
        let changed_at = report.find("Changed resources:").unwrap();
        assert!(created_at < changed_at);
        assert!(report.contains("  File\tFile//etc/new\n"));
        assert!(report.contains("    Mode 0644\n"));
        assert!(report.contains("  File\tFile//etc/old\n"));
        assert!(report.contains("    Mode 0600 -> 0644\n"));
        assert!(report.contains("    Contents <resource> -> <resource>\n"));
        assert!(report.contains("      -b"));
        assert!(report.contains("      +c"));
        assert!(target.has_changes());
    }

    #[test]
    fn test_empty_report() {
        let target = DryRunTarget::with_output(Box::new(io::sink()));
        assert!(!target.has_changes());
        assert_eq!(target.report(), "No changes need to be applied\n");
    }

    #[test]
    fn test_find_failures_are_listed() {
        let target = DryRunTarget::with_output(Box::new(io::sink()));
        let err = anyhow::anyhow!("dpkg-query not found");
        target.record_find_failure(&TaskKey::new("Package", "socat"), &err);
        let report = target.report();
        assert!(report.contains("Find failures:\n  Package\tPackage/socat: dpkg-query not found"));
    }
}
