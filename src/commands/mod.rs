pub mod apply;
pub mod cloud_init;
pub mod flags;
pub mod plan;

use crate::Context;
use crate::config::NodeConfig;
use crate::model;
use crate::ui;
use anyhow::{Context as _, Result};
use assets::Cancellation;
use converge::{ApplyResult, ExecuteOptions, ProgressCallback, Services, TaskKey, TaskMap};

/// Everything a command needs for one run.
pub struct Run {
    pub config: NodeConfig,
    pub services: Services,
    pub tasks: TaskMap,
}

/// Load the config, build services, fetch assets and build the task graph.
pub fn prepare(ctx: &Context) -> Result<Run> {
    let config = NodeConfig::load(&ctx.config_path)?;
    log::info!("loaded node config from {}", ctx.config_path.display());
    let services = model::build_services(&config, interrupt_token()?)?;
    model::add_assets(&config, &services)?;
    let tasks = model::build_tasks(&config, &services).context("Failed to build tasks")?;
    Ok(Run {
        config,
        services,
        tasks,
    })
}

/// A token that SIGINT or SIGTERM trips, stopping the run between waves and
/// waking long waits.
fn interrupt_token() -> Result<Cancellation> {
    let cancel = Cancellation::new();
    ctrlc::set_handler(on_interrupt(cancel.clone())).context("Failed to install signal handler")?;
    Ok(cancel)
}

fn on_interrupt(cancel: Cancellation) -> impl FnMut() + Send + 'static {
    move || {
        if !cancel.is_cancelled() {
            log::warn!("interrupted, stopping after the running tasks finish");
        }
        cancel.cancel();
    }
}

/// Executor options from the config, with `--jobs` taking precedence.
pub fn execute_options(ctx: &Context, config: &NodeConfig) -> ExecuteOptions {
    ExecuteOptions {
        jobs: ctx.jobs.or(config.jobs).unwrap_or(1).max(1),
        check_existing: config.check_existing(),
        lifecycle_overrides: config.lifecycle_overrides.clone(),
    }
}

/// Prints each wave and task outcome unless quiet. Unchanged tasks are only
/// listed with `-v`.
pub struct UiProgress {
    quiet: bool,
    verbose: bool,
    wave: usize,
    waves: usize,
}

impl UiProgress {
    pub fn new(ctx: &Context, tasks: &TaskMap) -> Self {
        let waves = converge::plan(tasks).map(|w| w.len()).unwrap_or(0);
        Self {
            quiet: ctx.quiet,
            verbose: ctx.verbose > 0,
            wave: 0,
            waves,
        }
    }
}

impl ProgressCallback for UiProgress {
    fn on_wave_start(&mut self, count: usize) {
        self.wave += 1;
        if !self.quiet {
            ui::step(self.wave, self.waves.max(self.wave), &format!("{count} task(s)"));
        }
    }

    fn on_task_complete(&mut self, key: &TaskKey, result: &Result<ApplyResult>) {
        if self.quiet {
            return;
        }
        match result {
            Ok(ApplyResult::NoChange) if !self.verbose => {}
            Ok(outcome) => println!("  {key} {}", ui::result_label(outcome)),
            Err(e) => ui::warn(&format!("{key}: {e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_cancels_every_clone() {
        let cancel = Cancellation::new();
        let observer = cancel.clone();
        let mut handler = on_interrupt(cancel);
        assert!(observer.check().is_ok());
        handler();
        assert!(observer.is_cancelled());
        assert!(observer.check().is_err());
        handler();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_jobs_flag_wins_over_config() {
        let config = NodeConfig::parse("jobs = 4\n").unwrap();
        let mut ctx = Context {
            verbose: 0,
            quiet: true,
            config_path: std::path::PathBuf::from("/nonexistent"),
            jobs: None,
        };
        assert_eq!(execute_options(&ctx, &config).jobs, 4);
        ctx.jobs = Some(0);
        assert_eq!(execute_options(&ctx, &config).jobs, 1);
        ctx.jobs = Some(2);
        assert_eq!(execute_options(&ctx, &config).jobs, 2);
    }
}
