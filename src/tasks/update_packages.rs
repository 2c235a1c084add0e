use super::{Distro, args, distro, keys_of};
use crate::runner;
use crate::tasks::AptSource;
use anyhow::Result;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, TaskKey, TaskMap};

/// Set to skip refreshing the package index.
pub const SKIP_ENV: &str = "NODEUP_SKIP_PACKAGE_UPDATE";

/// Refresh the package index once per run.
#[derive(Debug, Clone, Default)]
pub struct UpdatePackages {
    /// Always `Some(true)` on the expected side, so the task always runs.
    pub updated: Option<bool>,
}

impl UpdatePackages {
    pub fn new() -> Self {
        Self { updated: Some(true) }
    }

    fn command(distro: Distro) -> Vec<String> {
        match distro {
            Distro::Debian => args(&["apt-get", "update"]),
            Distro::RedHat => args(&["/usr/bin/yum", "clean", "expire-cache"]),
        }
    }
}

impl Delta for UpdatePackages {
    const KIND: &'static str = "UpdatePackages";

    fn name(&self) -> String {
        "update-packages".to_string()
    }

    fn fields(&self) -> Vec<Field> {
        vec![Field::opt("Updated", self.updated)]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        Some(keys_of::<AptSource>(tasks))
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(None)
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        if std::env::var_os(SKIP_ENV).is_some() {
            log::info!("{SKIP_ENV} is set; skipping package update");
            return Ok(());
        }
        let _lock = target.lock_packages();
        let distro = distro(ctx)?;
        let cmd = Self::command(distro);
        log::info!("updating package index: {}", runner::human(&cmd));
        match distro {
            Distro::Debian => runner::run_with_env(&cmd, &[("DEBIAN_FRONTEND", "noninteractive")])?,
            Distro::RedHat => runner::run(&cmd)?,
        };
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        target.set_package_update();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands() {
        assert_eq!(UpdatePackages::command(Distro::Debian), args(&["apt-get", "update"]));
        assert_eq!(
            UpdatePackages::command(Distro::RedHat),
            args(&["/usr/bin/yum", "clean", "expire-cache"])
        );
    }

    #[test]
    fn test_always_changes() {
        let changes = converge::build_changes(None, &UpdatePackages::new()).unwrap();
        assert!(changes.has("Updated"));
    }

    #[test]
    fn test_cloud_init_sets_package_update() {
        let target = CloudInitTarget::new();
        let tasks = TaskMap::default();
        let services = converge::Services::default();
        let wrapped = converge::Target::DryRun(converge::DryRunTarget::new());
        let ctx = crate::tasks::testing::context(&wrapped, &tasks, &services);
        UpdatePackages::new()
            .render_cloud_init(&target, &ctx, None, &Changes::default())
            .unwrap();
        assert!(target.config().package_update);
    }
}
