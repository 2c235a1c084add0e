use anyhow::Result;
use converge::{Changes, Context, Delta, Field, LocalTarget, TaskKey, TaskMap};

/// Barrier that completes once every task whose name starts with the
/// prefix has run.
#[derive(Debug, Clone, Default)]
pub struct Prefix {
    pub prefix: String,
}

impl Prefix {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl Delta for Prefix {
    const KIND: &'static str = "Prefix";

    fn name(&self) -> String {
        self.prefix.clone()
    }

    fn fields(&self) -> Vec<Field> {
        Vec::new()
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        Some(
            tasks
                .keys()
                .filter(|k| k.kind != Self::KIND && k.name.starts_with(&self.prefix))
                .cloned()
                .collect(),
        )
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(Some(self.clone()))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        Ok(())
    }

    fn render_cloud_init(
        &self,
        _target: &converge::CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        Ok(())
    }
}
