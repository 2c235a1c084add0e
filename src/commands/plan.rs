use anyhow::Result;
use converge::{DryRunTarget, NoProgress, Target, run_tasks};
use std::io;

use super::{execute_options, prepare};
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<()> {
    let run = prepare(ctx)?;
    let target = Target::DryRun(DryRunTarget::with_output(Box::new(io::sink())));
    let opts = execute_options(ctx, &run.config);

    run_tasks(&run.tasks, &target, &run.services, &opts, &mut NoProgress)?;

    let waves = converge::plan(&run.tasks)?;
    for (i, wave) in waves.iter().enumerate() {
        log::debug!("wave {}: {}", i + 1, wave.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "));
    }
    if args.waves {
        ui::header("Execution waves");
        for (i, wave) in waves.iter().enumerate() {
            ui::step(i + 1, waves.len(), &format!("{} task(s)", wave.len()));
            for key in wave {
                ui::dim(&key.to_string());
            }
        }
    }

    if let Target::DryRun(dry_run) = &target {
        if !ctx.quiet {
            ui::header("Planned changes");
        }
        print!("{}", dry_run.report());
    }
    Ok(())
}
