//! Task identity, the [`Delta`] contract and the task map.

use crate::context::Context;
use crate::error::EngineError;
use crate::reconcile::run_delta;
use crate::target::{CloudInitTarget, Deletion, LocalTarget};
use crate::types::ApplyResult;
use crate::value::{Changes, Field, TaskRef, Value};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

/// `kind/name` identity of a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub kind: String,
    pub name: String,
}

impl TaskKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parse `kind/name`; the name may itself contain slashes.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.split_once('/') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => Ok(Self::new(kind, name)),
            _ => Err(EngineError::MalformedKey(s.to_string())),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// How a task treats differences between actual and expected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Render whatever differs.
    #[default]
    Sync,
    /// Skip the task entirely.
    Ignore,
    /// Like `Sync`, but permission errors while rendering become warnings.
    WarnIfInsufficientAccess,
    /// Never render; fail if missing or different.
    ExistsAndValidates,
    /// Never render; fail if missing, warn if different.
    ExistsAndWarnIfChanges,
}

/// A task type the engine can reconcile.
///
/// `Default` is the zero instance: the comparison baseline when nothing
/// exists yet.
pub trait Delta: Default + Clone + fmt::Debug + Send + Sync + 'static {
    /// Task type name, the first half of every key.
    const KIND: &'static str;

    fn name(&self) -> String;

    /// Comparable fields, always in the same order.
    fn fields(&self) -> Vec<Field>;

    /// Observe the current state, or `None` when nothing exists.
    fn find(&self, ctx: &Context<'_>) -> anyhow::Result<Option<Self>>;

    /// Explicit dependencies. `None` derives them from field references.
    fn dependencies(&self, _tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        None
    }

    /// Per-task override of whether to call [`Delta::find`].
    fn check_existing(&self) -> Option<bool> {
        None
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Sync
    }

    /// Identity used when another task references this one.
    fn compare_id(&self) -> Option<String> {
        None
    }

    /// Reject changes the task cannot make.
    fn check_changes(_actual: Option<&Self>, _expected: &Self, _changes: &Changes) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stale state left behind by earlier runs.
    fn find_deletions(&self, _ctx: &Context<'_>) -> anyhow::Result<Vec<Box<dyn Deletion>>> {
        Ok(Vec::new())
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> anyhow::Result<()>;

    fn render_cloud_init(
        &self,
        _target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> anyhow::Result<()> {
        Err(EngineError::Unmapped {
            task: TaskKey::new(Self::KIND, self.name()),
            target: "cloud-init",
        }
        .into())
    }

    /// A [`Value`] pointing at this task.
    fn task_ref(&self) -> Value {
        Value::Ref(TaskRef {
            key: TaskKey::new(Self::KIND, self.name()),
            id: self.compare_id(),
        })
    }
}

/// Object-safe view of any [`Delta`].
pub trait Task: Send + Sync + fmt::Debug {
    fn key(&self) -> TaskKey;
    fn field_values(&self) -> Vec<Field>;
    fn declared_dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>>;
    fn run(&self, ctx: &Context<'_>) -> anyhow::Result<ApplyResult>;
    fn as_any(&self) -> &dyn Any;
}

impl<D: Delta> Task for D {
    fn key(&self) -> TaskKey {
        TaskKey::new(D::KIND, self.name())
    }

    fn field_values(&self) -> Vec<Field> {
        self.fields()
    }

    fn declared_dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        self.dependencies(tasks)
    }

    fn run(&self, ctx: &Context<'_>) -> anyhow::Result<ApplyResult> {
        run_delta(self, ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Every task of a run, keyed by [`TaskKey`].
#[derive(Debug, Default)]
pub struct TaskMap {
    tasks: BTreeMap<TaskKey, Box<dyn Task>>,
}

impl TaskMap {
    pub fn insert<T: Task + 'static>(&mut self, task: T) -> Result<(), EngineError> {
        self.insert_boxed(Box::new(task))
    }

    pub fn insert_boxed(&mut self, task: Box<dyn Task>) -> Result<(), EngineError> {
        let key = task.key();
        if key.name.is_empty() {
            return Err(EngineError::EmptyName { kind: key.kind });
        }
        if self.tasks.contains_key(&key) {
            return Err(EngineError::DuplicateTask(key));
        }
        self.tasks.insert(key, task);
        Ok(())
    }

    pub fn get(&self, key: &TaskKey) -> Option<&dyn Task> {
        self.tasks.get(key).map(AsRef::as_ref)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &dyn Task)> {
        self.tasks.iter().map(|(k, t)| (k, t.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every task of one concrete type.
    pub fn of_kind<D: Delta>(&self) -> impl Iterator<Item = &D> {
        self.tasks
            .range(TaskKey::new(D::KIND, "")..)
            .take_while(|(k, _)| k.kind == D::KIND)
            .filter_map(|(_, t)| t.as_any().downcast_ref::<D>())
    }

    pub fn get_as<D: Delta>(&self, name: &str) -> Option<&D> {
        self.tasks
            .get(&TaskKey::new(D::KIND, name))
            .and_then(|t| t.as_any().downcast_ref::<D>())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::value::Field;

    /// Minimal task used across the crate's tests.
    #[derive(Debug, Clone, Default)]
    pub struct Note {
        pub name: String,
        pub text: Option<String>,
        pub after: Option<Value>,
        pub existing: Option<String>,
    }

    impl Note {
        pub fn new(name: &str, text: &str) -> Self {
            Self {
                name: name.into(),
                text: Some(text.into()),
                ..Default::default()
            }
        }
    }

    impl Delta for Note {
        const KIND: &'static str = "Note";

        fn name(&self) -> String {
            self.name.clone()
        }

        fn fields(&self) -> Vec<Field> {
            vec![
                Field::opt("Text", self.text.clone()),
                Field::opt("After", self.after.clone()),
            ]
        }

        fn find(&self, _ctx: &Context<'_>) -> anyhow::Result<Option<Self>> {
            Ok(self.existing.as_ref().map(|text| Self {
                name: self.name.clone(),
                text: Some(text.clone()),
                after: self.after.clone(),
                existing: None,
            }))
        }

        fn render_local(
            &self,
            _target: &LocalTarget,
            _ctx: &Context<'_>,
            _actual: Option<&Self>,
            _changes: &Changes,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_key_parse_and_display() {
        let key = TaskKey::parse("File//etc/hosts").unwrap();
        assert_eq!(key.kind, "File");
        assert_eq!(key.name, "/etc/hosts");
        assert_eq!(key.to_string(), "File//etc/hosts");
        assert!(TaskKey::parse("File").is_err());
        assert!(TaskKey::parse("/x").is_err());
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let mut tasks = TaskMap::default();
        tasks.insert(Note::new("a", "one")).unwrap();
        let err = tasks.insert(Note::new("a", "two")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask(_)));
        let err = tasks.insert(Note::new("", "x")).unwrap_err();
        assert!(matches!(err, EngineError::EmptyName { .. }));
    }

    #[test]
    fn test_of_kind_downcasts() {
        let mut tasks = TaskMap::default();
        tasks.insert(Note::new("b", "two")).unwrap();
        tasks.insert(Note::new("a", "one")).unwrap();
        let names: Vec<_> = tasks.of_kind::<Note>().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(tasks.get_as::<Note>("b").unwrap().text.as_deref(), Some("two"));
    }
}
