//! Find, diff, render: the run of a single task.

use crate::context::Context;
use crate::error::{EngineError, ErrorKind, classify};
use crate::target::Target;
use crate::task::{Delta, Lifecycle, TaskKey};
use crate::types::ApplyResult;
use crate::value::{Changes, FieldChange, field_unchanged};
use anyhow::Context as _;
use std::any::type_name;
use std::collections::BTreeMap;

/// Fields of `expected` that differ from `actual`, or from the zero
/// instance when nothing exists.
pub fn build_changes<D: Delta>(actual: Option<&D>, expected: &D) -> anyhow::Result<Changes> {
    let actual_fields: BTreeMap<&'static str, _> = match actual {
        Some(a) => a.fields(),
        None => D::default().fields(),
    }
    .into_iter()
    .map(|f| (f.name, f.value))
    .collect();

    let mut changes = Changes::default();
    for field in expected.fields() {
        let Some(after) = field.value else {
            continue;
        };
        let before = actual_fields.get(field.name).cloned().flatten();
        let unchanged = field_unchanged(before.as_ref(), &after)
            .with_context(|| format!("comparing field {}", field.name))?;
        if !unchanged {
            changes.push(FieldChange {
                name: field.name,
                before,
                after,
            });
        }
    }
    Ok(changes)
}

fn effective_lifecycle<D: Delta>(expected: &D, ctx: &Context<'_>) -> Lifecycle {
    let short = type_name::<D>().rsplit("::").next().unwrap_or(D::KIND);
    ctx.lifecycle_overrides
        .get(D::KIND)
        .or_else(|| ctx.lifecycle_overrides.get(short))
        .copied()
        .unwrap_or_else(|| expected.lifecycle())
}

/// Reconcile one task against the context's target.
pub fn run_delta<D: Delta>(expected: &D, ctx: &Context<'_>) -> anyhow::Result<ApplyResult> {
    let key = TaskKey::new(D::KIND, expected.name());
    let lifecycle = effective_lifecycle(expected, ctx);
    if lifecycle == Lifecycle::Ignore {
        log::debug!("skipping {key}: lifecycle Ignore");
        return Ok(ApplyResult::skipped("lifecycle Ignore"));
    }

    let check_existing = expected.check_existing().unwrap_or(ctx.check_existing);
    let actual = if check_existing {
        match expected.find(ctx) {
            Ok(found) => found,
            Err(err) => {
                if let Target::DryRun(dry_run) = ctx.target {
                    log::warn!("error finding {key}: {err:#}");
                    dry_run.record_find_failure(&key, &err);
                    return Ok(ApplyResult::skipped("find failed"));
                }
                return Err(err.context(format!("error finding {key}")));
            }
        }
    } else {
        None
    };

    let validating = matches!(
        lifecycle,
        Lifecycle::ExistsAndValidates | Lifecycle::ExistsAndWarnIfChanges
    );
    if validating && actual.is_none() {
        return Err(EngineError::Missing { task: key }.into());
    }

    let changes = build_changes(actual.as_ref(), expected)?;
    let deletions = if validating {
        Vec::new()
    } else {
        expected.find_deletions(ctx)?
    };
    let result = if changes.is_empty() {
        log::debug!("{key} is up to date");
        ApplyResult::NoChange
    } else {
        match lifecycle {
            Lifecycle::ExistsAndValidates => {
                return Err(EngineError::ValidationFailed {
                    task: key,
                    fields: changes.names(),
                }
                .into());
            }
            Lifecycle::ExistsAndWarnIfChanges => {
                log::warn!(
                    "{key} differs from expected state ({}), leaving it alone",
                    changes.names().join(", ")
                );
                return Ok(ApplyResult::skipped("exists with changes"));
            }
            _ => {}
        }

        D::check_changes(actual.as_ref(), expected, &changes)?;
        log::debug!("{key} changes: {}", changes.names().join(", "));

        match render(expected, ctx, actual.as_ref(), &changes, &key) {
            Ok(()) if actual.is_none() => ApplyResult::Created,
            Ok(()) => ApplyResult::Modified,
            Err(err)
                if lifecycle == Lifecycle::WarnIfInsufficientAccess
                    && classify(&err) == ErrorKind::Permission =>
            {
                log::warn!("insufficient access to render {key}: {err:#}");
                return Ok(ApplyResult::skipped("insufficient access"));
            }
            Err(err) => return Err(err.context(format!("error rendering {key}"))),
        }
    };

    for deletion in deletions {
        ctx.target.delete(deletion)?;
    }
    Ok(result)
}

fn render<D: Delta>(
    expected: &D,
    ctx: &Context<'_>,
    actual: Option<&D>,
    changes: &Changes,
    key: &TaskKey,
) -> anyhow::Result<()> {
    match ctx.target {
        Target::Local(target) => expected.render_local(target, ctx, actual, changes),
        Target::CloudInit(target) => expected.render_cloud_init(target, ctx, actual, changes),
        Target::DryRun(target) => {
            target.record(key, actual.is_none(), changes);
            Ok(())
        }
        Target::Inventory(target) => {
            target.record(key, changes);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::target::{DryRunTarget, InventoryTarget};
    use crate::task::TaskMap;
    use crate::task::tests::Note;

    fn run(note: &Note, target: &Target, overrides: &BTreeMap<String, Lifecycle>) -> anyhow::Result<ApplyResult> {
        let tasks = TaskMap::default();
        let services = Services::default();
        let ctx = Context {
            target,
            tasks: &tasks,
            services: &services,
            check_existing: true,
            lifecycle_overrides: overrides,
        };
        run_delta(note, &ctx)
    }

    #[test]
    fn test_build_changes_against_zero_instance() {
        let note = Note::new("a", "hello");
        let changes = build_changes(None, &note).unwrap();
        assert_eq!(changes.names(), vec!["Text"]);
        assert!(changes.get("Text").unwrap().before.is_none());
    }

    #[test]
    fn test_equal_state_is_no_change() {
        let mut note = Note::new("a", "hello");
        note.existing = Some("hello".into());
        let target = Target::Inventory(InventoryTarget::new());
        let result = run(&note, &target, &BTreeMap::new()).unwrap();
        assert_eq!(result, ApplyResult::NoChange);
        let Target::Inventory(inventory) = &target else { unreachable!() };
        assert!(!inventory.has_changes());
    }

    #[test]
    fn test_changed_state_is_recorded() {
        let mut note = Note::new("a", "hello");
        note.existing = Some("goodbye".into());
        let target = Target::DryRun(DryRunTarget::new());
        assert_eq!(run(&note, &target, &BTreeMap::new()).unwrap(), ApplyResult::Modified);
        let Target::DryRun(dry_run) = &target else { unreachable!() };
        assert!(dry_run.report().contains("Text goodbye -> hello"));
    }

    #[test]
    fn test_lifecycle_overrides() {
        let note = Note::new("a", "hello");
        let target = Target::Inventory(InventoryTarget::new());

        let mut overrides = BTreeMap::new();
        overrides.insert("Note".to_string(), Lifecycle::Ignore);
        let result = run(&note, &target, &overrides).unwrap();
        assert!(matches!(result, ApplyResult::Skipped { .. }));

        overrides.insert("Note".to_string(), Lifecycle::ExistsAndValidates);
        let err = run(&note, &target, &overrides).unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Missing { .. })));

        let mut present = note.clone();
        present.existing = Some("other".into());
        let err = run(&present, &target, &overrides).unwrap_err();
        assert!(err.to_string().contains("Text"));

        overrides.insert("Note".to_string(), Lifecycle::ExistsAndWarnIfChanges);
        let result = run(&present, &target, &overrides).unwrap();
        assert!(matches!(result, ApplyResult::Skipped { .. }));
        let Target::Inventory(inventory) = &target else { unreachable!() };
        assert!(!inventory.has_changes());
    }
}
