//! Execution engine - runs tasks in dependency order with retries

use crate::context::{Context, Services};
use crate::dependencies::{find_task_dependencies, topological_sort};
use crate::error::{EngineError, classify};
use crate::target::Target;
use crate::task::{TaskKey, TaskMap};
use crate::types::{ApplyResult, ExecuteOptions, ExecuteSummary};
use anyhow::Result;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Progress reporting hooks.
pub trait ProgressCallback: Send {
    fn on_wave_start(&mut self, count: usize);
    fn on_task_complete(&mut self, key: &TaskKey, result: &Result<ApplyResult>);
}

/// Progress callback that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_wave_start(&mut self, _count: usize) {}
    fn on_task_complete(&mut self, _key: &TaskKey, _result: &Result<ApplyResult>) {}
}

/// Run every task once its dependencies have succeeded.
///
/// A failed task is retried on the next pass as long as some other task
/// made progress; a pass in which nothing succeeds fails the run with the
/// first error. Cancellation is checked between passes.
pub fn run_tasks<P: ProgressCallback>(
    tasks: &TaskMap,
    target: &Target,
    services: &Services,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<ExecuteSummary> {
    let deps = find_task_dependencies(tasks)?;
    let waves = topological_sort(&deps)?;
    log::debug!("{} tasks in {} waves", tasks.len(), waves.len());

    let ctx = Context {
        target,
        tasks,
        services,
        check_existing: opts.check_existing,
        lifecycle_overrides: &opts.lifecycle_overrides,
    };
    let pool = if opts.jobs > 1 {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(opts.jobs)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create thread pool: {}", e))?,
        )
    } else {
        None
    };

    let mut done: BTreeSet<TaskKey> = BTreeSet::new();
    let mut failed_before: BTreeSet<TaskKey> = BTreeSet::new();
    let mut summary = ExecuteSummary::default();

    loop {
        services.cancel.check()?;

        let ready = ready_tasks(&deps, &done);
        if ready.is_empty() {
            break;
        }
        log::info!("running {} tasks", ready.len());
        progress.on_wave_start(ready.len());

        let results = match &pool {
            Some(pool) if ready.len() > 1 => execute_parallel(pool, &ready, &ctx),
            _ => ready.iter().map(|key| (key.clone(), run_one(key, &ctx))).collect(),
        };

        let mut errors = Vec::new();
        let mut progressed = false;
        for (key, result) in results {
            progress.on_task_complete(&key, &result);
            match result {
                Ok(applied) => {
                    summary.add_result(&applied);
                    if failed_before.remove(&key) {
                        summary.retried += 1;
                    }
                    done.insert(key);
                    progressed = true;
                }
                Err(err) => {
                    log::warn!("error running task {key} ({}): {err:#}", classify(&err));
                    failed_before.insert(key.clone());
                    errors.push((key, err));
                }
            }
        }

        if !progressed {
            if let Some((key, err)) = errors.into_iter().next() {
                return Err(err.context(format!("task {key} did not succeed")));
            }
            return Err(EngineError::NoProgress.into());
        }
        if !errors.is_empty() {
            log::info!("{} tasks failed, retrying after other tasks made progress", errors.len());
        }
    }

    let stuck: Vec<String> = deps
        .keys()
        .filter(|key| !done.contains(*key))
        .map(ToString::to_string)
        .collect();
    if !stuck.is_empty() {
        return Err(EngineError::CircularDependency { tasks: stuck }.into());
    }
    Ok(summary)
}

/// Tasks not yet done whose dependencies all are.
fn ready_tasks(deps: &BTreeMap<TaskKey, Vec<TaskKey>>, done: &BTreeSet<TaskKey>) -> Vec<TaskKey> {
    deps.iter()
        .filter(|(key, d)| !done.contains(*key) && d.iter().all(|dep| done.contains(dep)))
        .map(|(key, _)| key.clone())
        .collect()
}

fn run_one(key: &TaskKey, ctx: &Context<'_>) -> Result<ApplyResult> {
    let task = ctx
        .tasks
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("task {key} vanished from the task map"))?;
    log::debug!("executing task {key}");
    task.run(ctx)
}

/// Run one wave in parallel using rayon
fn execute_parallel(
    pool: &rayon::ThreadPool,
    ready: &[TaskKey],
    ctx: &Context<'_>,
) -> Vec<(TaskKey, Result<ApplyResult>)> {
    let results: Arc<Mutex<Vec<(TaskKey, Result<ApplyResult>)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(ready.len())));

    pool.install(|| {
        ready.par_iter().for_each(|key| {
            let result = run_one(key, ctx);
            results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((key.clone(), result));
        });
    });

    let mut results = match Arc::try_unwrap(results) {
        Ok(results) => results.into_inner().unwrap_or_else(|e| e.into_inner()),
        Err(shared) => std::mem::take(&mut *shared.lock().unwrap_or_else(|e| e.into_inner())),
    };
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context as TaskContext;
    use crate::target::{InventoryTarget, LocalTarget};
    use crate::task::tests::Note;
    use crate::task::Delta;
    use crate::value::{Changes, Field};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails its first `failures` finds.
    #[derive(Debug, Clone, Default)]
    struct Flaky {
        name: String,
        failures: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl Delta for Flaky {
        const KIND: &'static str = "Flaky";

        fn name(&self) -> String {
            self.name.clone()
        }

        fn fields(&self) -> Vec<Field> {
            vec![Field::new("Name", self.name.clone())]
        }

        fn find(&self, _ctx: &TaskContext<'_>) -> anyhow::Result<Option<Self>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("not yet");
            }
            Ok(None)
        }

        fn render_local(
            &self,
            _target: &LocalTarget,
            _ctx: &TaskContext<'_>,
            _actual: Option<&Self>,
            _changes: &Changes,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn flaky(name: &str, failures: usize) -> Flaky {
        Flaky {
            name: name.into(),
            failures,
            attempts: Arc::default(),
        }
    }

    fn run(tasks: &TaskMap, jobs: usize) -> Result<ExecuteSummary> {
        let target = Target::Inventory(InventoryTarget::new());
        let opts = ExecuteOptions {
            jobs,
            ..Default::default()
        };
        run_tasks(tasks, &target, &Services::default(), &opts, &mut NoProgress)
    }

    #[test]
    fn test_runs_all_tasks() {
        let mut tasks = TaskMap::default();
        let a = Note::new("a", "one");
        let mut b = Note::new("b", "two");
        b.after = Some(a.task_ref());
        tasks.insert(a).unwrap();
        tasks.insert(b).unwrap();
        let summary = run(&tasks, 1).unwrap();
        assert_eq!(summary.created, 2);
    }

    #[test]
    fn test_failure_retried_while_others_progress() {
        let mut tasks = TaskMap::default();
        tasks.insert(flaky("x", 1)).unwrap();
        tasks.insert(Note::new("a", "one")).unwrap();
        let summary = run(&tasks, 2).unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.retried, 1);
    }

    #[test]
    fn test_no_progress_fails_with_task_error() {
        let mut tasks = TaskMap::default();
        tasks.insert(flaky("x", usize::MAX)).unwrap();
        let err = run(&tasks, 1).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Flaky/x"));
        assert!(message.contains("not yet"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut tasks = TaskMap::default();
        tasks.insert(Note::new("a", "one")).unwrap();
        let services = Services::default();
        services.cancel.cancel();
        let target = Target::Inventory(InventoryTarget::new());
        let err = run_tasks(&tasks, &target, &services, &ExecuteOptions::default(), &mut NoProgress)
            .unwrap_err();
        assert_eq!(classify(&err), crate::error::ErrorKind::Cancelled);
    }
}
