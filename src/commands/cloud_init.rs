use anyhow::{Context as _, Result};
use converge::{CloudInitTarget, NoProgress, Target, run_tasks};
use std::fs::File;
use std::io::{self, Write};

use super::{execute_options, prepare};
use crate::Context;
use crate::cli::CloudInitArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &CloudInitArgs) -> Result<()> {
    let run = prepare(ctx)?;
    let output: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Could not create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let target = Target::CloudInit(CloudInitTarget::with_output(output));

    // A fresh machine has nothing to compare against.
    let mut opts = execute_options(ctx, &run.config);
    opts.check_existing = false;

    run_tasks(&run.tasks, &target, &run.services, &opts, &mut NoProgress)?;
    target.finish(&run.tasks)?;

    if let Some(path) = &args.output {
        if !ctx.quiet {
            ui::success(&format!("Wrote cloud-config to {}", path.display()));
        }
    }
    Ok(())
}
