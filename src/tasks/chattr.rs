use super::args;
use crate::runner;
use crate::tasks::File;
use anyhow::Result;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};

/// Set file attributes with `chattr`.
///
/// There is no observation step; the command runs on every apply.
#[derive(Debug, Clone, Default)]
pub struct Chattr {
    pub file: String,
    /// Attribute change such as `+i`.
    pub flags: String,
}

impl Chattr {
    pub fn new(file: &str, flags: &str) -> Self {
        Self {
            file: file.to_string(),
            flags: flags.to_string(),
        }
    }

    fn command(&self) -> Vec<String> {
        args(&["chattr", &self.flags, &self.file])
    }
}

impl Delta for Chattr {
    const KIND: &'static str = "Chattr";

    fn name(&self) -> String {
        self.file.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![Field::new("Flags", self.flags.as_str())]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let key = TaskKey::new(File::KIND, self.file.as_str());
        Some(tasks.contains(&key).then_some(key).into_iter().collect())
    }

    fn check_existing(&self) -> Option<bool> {
        Some(false)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(None)
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        runner::run(&self.command())?;
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        target.add_command(Mode::Always, self.command());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_and_dependency() {
        let task = Chattr::new("/etc/resolv.conf", "+i");
        assert_eq!(task.command(), vec!["chattr", "+i", "/etc/resolv.conf"]);
        assert_eq!(task.check_existing(), Some(false));

        let mut tasks = TaskMap::default();
        assert!(task.dependencies(&tasks).unwrap().is_empty());
        tasks
            .insert(File::new("/etc/resolv.conf", assets::StringResource::shared(""), None))
            .unwrap();
        assert_eq!(task.dependencies(&tasks).unwrap(), vec![TaskKey::new("File", "/etc/resolv.conf")]);
    }
}
