//! Systemd unit files.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    section: String,
    key: String,
    value: String,
}

/// An ordered unit file. Keys may repeat and keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    lines: Vec<Line>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) -> &mut Self {
        self.lines.push(Line {
            section: section.to_string(),
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render as `[Section]` blocks. A header is written whenever the
    /// section differs from the previous line's.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut current: Option<&str> = None;
        for line in &self.lines {
            if current != Some(line.section.as_str()) {
                if current.is_some() {
                    out.push('\n');
                }
                let _ = writeln!(out, "[{}]", line.section);
                current = Some(&line.section);
            }
            let _ = writeln!(out, "{}={}", line.key, line.value);
        }
        out
    }
}

/// Quote a command line for `ExecStart=` and friends.
pub fn escape_command(args: &[impl AsRef<str>]) -> String {
    args.iter()
        .map(|arg| escape_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_arg(arg: &str) -> String {
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    if arg.is_empty() || arg.contains(' ') {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_command() {
        assert_eq!(
            escape_command(&["/bin/echo", "hello world", "a\"b"]),
            r#"/bin/echo "hello world" a\"b"#
        );
        assert_eq!(escape_command(&["printf", r"a\b"]), r"printf a\\b");
        assert_eq!(escape_command(&["x", ""]), r#"x """#);
    }

    #[test]
    fn test_render_groups_sections() {
        let mut m = Manifest::new();
        m.set("Unit", "Description", "Kubelet")
            .set("Unit", "After", "network.target")
            .set("Service", "ExecStart", "/usr/local/bin/kubelet")
            .set("Service", "Restart", "always")
            .set("Install", "WantedBy", "multi-user.target");
        assert_eq!(
            m.render(),
            "[Unit]\nDescription=Kubelet\nAfter=network.target\n\n\
             [Service]\nExecStart=/usr/local/bin/kubelet\nRestart=always\n\n\
             [Install]\nWantedBy=multi-user.target\n"
        );
    }

    #[test]
    fn test_repeated_keys_keep_order() {
        let mut m = Manifest::new();
        m.set("Service", "Environment", "A=1").set("Service", "Environment", "B=2");
        assert_eq!(m.render(), "[Service]\nEnvironment=A=1\nEnvironment=B=2\n");
        assert!(Manifest::new().render().is_empty());
    }
}
