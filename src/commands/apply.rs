use anyhow::{Context as _, Result};
use converge::{LocalTarget, Target, run_tasks};

use super::{UiProgress, execute_options, prepare};
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let run = prepare(ctx)?;
    let target = Target::Local(LocalTarget::new(run.config.cache_dir(), run.config.state_dir()));
    let opts = execute_options(ctx, &run.config);

    if !ctx.quiet {
        ui::header("Applying node configuration");
        ui::kv("Config", &ctx.config_path.display().to_string());
        ui::kv("Tasks", &run.tasks.len().to_string());
        println!();
    }

    let mut progress = UiProgress::new(ctx, &run.tasks);
    let summary = run_tasks(&run.tasks, &target, &run.services, &opts, &mut progress)
        .context("Failed to apply node configuration")?;
    target.finish(&run.tasks)?;

    if !ctx.quiet {
        ui::summary(&summary);
    }
    Ok(())
}
