use colored::Colorize;
use converge::{ApplyResult, ExecuteSummary};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a wave indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{num}/{total}]").blue().bold(), msg);
}

/// One-word label for a task outcome.
pub fn result_label(result: &ApplyResult) -> String {
    match result {
        ApplyResult::NoChange => "ok".dimmed().to_string(),
        ApplyResult::Created => "created".green().to_string(),
        ApplyResult::Modified => "modified".yellow().to_string(),
        ApplyResult::Skipped { reason } => format!("skipped ({reason})").dimmed().to_string(),
    }
}

/// Print the counts from a finished run.
pub fn summary(summary: &ExecuteSummary) {
    header("Summary");
    kv("Created", &summary.created.to_string());
    kv("Modified", &summary.modified.to_string());
    kv("Unchanged", &summary.no_change.to_string());
    if summary.skipped > 0 {
        kv("Skipped", &summary.skipped.to_string());
    }
    if summary.retried > 0 {
        kv("Retried", &summary.retried.to_string());
    }
    println!();
    if summary.total_changes() == 0 {
        success("Node is up to date");
    } else {
        success(&format!("Applied {} change(s)", summary.total_changes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_labels() {
        colored::control::set_override(false);
        assert_eq!(result_label(&ApplyResult::Created), "created");
        assert_eq!(result_label(&ApplyResult::NoChange), "ok");
        assert_eq!(result_label(&ApplyResult::skipped("ignored")), "skipped (ignored)");
    }
}
