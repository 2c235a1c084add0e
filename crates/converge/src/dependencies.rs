//! Dependency discovery and wave ordering.

use crate::error::EngineError;
use crate::task::{TaskKey, TaskMap};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Dependencies of every task: declared ones when the task has them,
/// otherwise every task referenced from its fields.
pub fn find_task_dependencies(
    tasks: &TaskMap,
) -> Result<BTreeMap<TaskKey, Vec<TaskKey>>, EngineError> {
    let mut all = BTreeMap::new();
    for (key, task) in tasks.iter() {
        let mut deps = match task.declared_dependencies(tasks) {
            Some(declared) => declared,
            None => {
                let mut found = Vec::new();
                for field in task.field_values() {
                    if let Some(value) = &field.value {
                        collect_references(value, &mut found)?;
                    }
                }
                found
            }
        };
        deps.sort();
        deps.dedup();
        deps.retain(|d| d != key);
        if let Some(missing) = deps.iter().find(|d| !tasks.contains(d)) {
            return Err(EngineError::UnknownDependency {
                task: key.clone(),
                dependency: missing.clone(),
            });
        }
        log::trace!("{key} depends on {deps:?}");
        all.insert(key.clone(), deps);
    }
    Ok(all)
}

fn collect_references(value: &Value, out: &mut Vec<TaskKey>) -> Result<(), EngineError> {
    match value {
        Value::Ref(r) => out.push(r.key.clone()),
        Value::Resource(r) => {
            if let Some(task) = r.task_dependency() {
                out.push(TaskKey::parse(&task)?);
            }
        }
        Value::List(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Value::Map(items) => {
            for item in items.values() {
                collect_references(item, out)?;
            }
        }
        Value::Str(_) | Value::Bool(_) | Value::Int(_) => {}
    }
    Ok(())
}

/// Group tasks into waves; every task's dependencies sit in earlier waves.
/// Each wave is sorted by key.
pub fn topological_sort(
    deps: &BTreeMap<TaskKey, Vec<TaskKey>>,
) -> Result<Vec<Vec<TaskKey>>, EngineError> {
    let mut remaining: BTreeMap<&TaskKey, BTreeSet<&TaskKey>> = deps
        .iter()
        .map(|(key, d)| (key, d.iter().collect()))
        .collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let wave: Vec<TaskKey> = remaining
            .iter()
            .filter(|(_, d)| d.is_empty())
            .map(|(key, _)| (*key).clone())
            .collect();
        if wave.is_empty() {
            return Err(EngineError::CircularDependency {
                tasks: remaining.keys().map(ToString::to_string).collect(),
            });
        }
        for key in &wave {
            remaining.remove(key);
        }
        for d in remaining.values_mut() {
            for key in &wave {
                d.remove(key);
            }
        }
        waves.push(wave);
    }
    Ok(waves)
}

/// The waves a run over `tasks` would execute, in order.
pub fn plan(tasks: &TaskMap) -> Result<Vec<Vec<TaskKey>>, EngineError> {
    topological_sort(&find_task_dependencies(tasks)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::Note;
    use crate::task::Delta;
    use assets::TaskDependentResource;

    fn key(name: &str) -> TaskKey {
        TaskKey::new("Note", name)
    }

    #[test]
    fn test_waves() {
        let mut deps = BTreeMap::new();
        deps.insert(key("a"), vec![]);
        deps.insert(key("b"), vec![key("a")]);
        deps.insert(key("c"), vec![key("a")]);
        deps.insert(key("d"), vec![key("b"), key("c")]);
        let waves = topological_sort(&deps).unwrap();
        assert_eq!(
            waves,
            vec![vec![key("a")], vec![key("b"), key("c")], vec![key("d")]]
        );
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut deps = BTreeMap::new();
        deps.insert(key("a"), vec![key("b")]);
        deps.insert(key("b"), vec![key("a")]);
        deps.insert(key("c"), vec![]);
        let err = topological_sort(&deps).unwrap_err();
        let EngineError::CircularDependency { tasks } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(tasks, vec!["Note/a", "Note/b"]);
    }

    #[test]
    fn test_references_become_dependencies() {
        let mut tasks = TaskMap::default();
        let a = Note::new("a", "one");
        let mut b = Note::new("b", "two");
        b.after = Some(Value::List(vec![a.task_ref()]));
        let mut c = Note::new("c", "three");
        let produced = TaskDependentResource::new("Note/b");
        c.after = Some(Value::Resource(produced.shared()));
        tasks.insert(a).unwrap();
        tasks.insert(b).unwrap();
        tasks.insert(c).unwrap();

        let deps = find_task_dependencies(&tasks).unwrap();
        assert_eq!(deps[&key("a")], Vec::<TaskKey>::new());
        assert_eq!(deps[&key("b")], vec![key("a")]);
        assert_eq!(deps[&key("c")], vec![key("b")]);
    }

    #[test]
    fn test_plan_over_task_map() {
        let mut tasks = TaskMap::default();
        let a = Note::new("a", "one");
        let mut b = Note::new("b", "two");
        b.after = Some(a.task_ref());
        tasks.insert(b).unwrap();
        tasks.insert(a).unwrap();
        assert_eq!(plan(&tasks).unwrap(), vec![vec![key("a")], vec![key("b")]]);
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let mut tasks = TaskMap::default();
        let mut b = Note::new("b", "two");
        b.after = Some(Note::new("ghost", "").task_ref());
        tasks.insert(b).unwrap();
        let err = find_task_dependencies(&tasks).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDependency { .. }));
    }
}
