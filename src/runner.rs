use anyhow::{Context, Result};
use converge::CommandError;
use std::process::{Command, Output, Stdio};

/// Command line as a human would type it.
pub fn human<S: AsRef<str>>(args: &[S]) -> String {
    args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
}

fn spawn<S: AsRef<str>>(args: &[S], env: &[(&str, &str)]) -> Result<Output> {
    let (program, rest) = args.split_first().context("Empty command")?;
    log::debug!("running command {}", human(args));
    Command::new(program.as_ref())
        .args(rest.iter().map(AsRef::as_ref))
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to execute: {}", human(args)))
}

fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Run a command and capture combined stdout and stderr.
///
/// A non-zero exit becomes a [`CommandError`] carrying that output.
pub fn run<S: AsRef<str>>(args: &[S]) -> Result<String> {
    run_with_env(args, &[])
}

pub fn run_with_env<S: AsRef<str>>(args: &[S], env: &[(&str, &str)]) -> Result<String> {
    let output = spawn(args, env)?;
    let text = combined(&output);
    if output.status.success() {
        Ok(text)
    } else {
        Err(CommandError {
            command: human(args),
            status: output.status.to_string(),
            output: text,
        }
        .into())
    }
}

/// Run a command and return whether it succeeded along with its output.
pub fn run_capture<S: AsRef<str>>(args: &[S]) -> Result<(bool, String)> {
    let output = spawn(args, &[])?;
    Ok((output.status.success(), combined(&output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human() {
        assert_eq!(human(&["systemctl", "daemon-reload"]), "systemctl daemon-reload");
    }

    #[test]
    fn test_run_captures_output() {
        let out = run(&["sh", "-c", "echo out; echo err >&2"]).unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[test]
    fn test_failure_is_command_error() {
        let err = run(&["sh", "-c", "echo broken; exit 3"]).unwrap_err();
        let command = err.downcast_ref::<CommandError>().unwrap();
        assert!(command.output.contains("broken"));
        assert!(command.command.starts_with("sh -c"));

        let (ok, _) = run_capture(&["sh", "-c", "exit 1"]).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_empty_command() {
        assert!(run::<&str>(&[]).is_err());
    }
}
