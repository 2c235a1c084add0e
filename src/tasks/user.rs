use super::{args, push_if_present};
use crate::files::{find_group, find_group_by_gid, find_user};
use crate::runner;
use anyhow::Result;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};

/// A local user account.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub name: String,
    pub uid: Option<u32>,
    /// Primary group name.
    pub group: Option<String>,
    pub shell: Option<String>,
    pub home: Option<String>,
    pub system: bool,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_command(&self) -> Vec<String> {
        let mut cmd = args(&["useradd"]);
        if self.system {
            cmd.push("--system".into());
        }
        if let Some(uid) = self.uid {
            cmd.extend(["--uid".into(), uid.to_string()]);
        }
        if let Some(group) = &self.group {
            cmd.extend(["--gid".into(), group.clone()]);
        }
        if let Some(shell) = &self.shell {
            cmd.extend(["--shell".into(), shell.clone()]);
        }
        match &self.home {
            Some(home) => cmd.extend(["--home-dir".into(), home.clone(), "--create-home".into()]),
            None => cmd.push("--no-create-home".into()),
        }
        cmd.push(self.name.clone());
        cmd
    }

    /// `usermod` for the changed fields, or nothing when none apply.
    pub fn modify_command(&self, changes: &Changes) -> Option<Vec<String>> {
        let mut cmd = args(&["usermod"]);
        if changes.has("Uid")
            && let Some(uid) = self.uid
        {
            cmd.extend(["--uid".into(), uid.to_string()]);
        }
        if changes.has("Group")
            && let Some(group) = &self.group
        {
            cmd.extend(["--gid".into(), group.clone()]);
        }
        if changes.has("Shell")
            && let Some(shell) = &self.shell
        {
            cmd.extend(["--shell".into(), shell.clone()]);
        }
        if changes.has("Home")
            && let Some(home) = &self.home
        {
            cmd.extend(["--home".into(), home.clone()]);
        }
        (cmd.len() > 1).then(|| {
            cmd.push(self.name.clone());
            cmd
        })
    }
}

impl Delta for User {
    const KIND: &'static str = "User";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::opt("Uid", self.uid),
            Field::opt("Group", self.group.clone()),
            Field::opt("Shell", self.shell.clone()),
            Field::opt("Home", self.home.clone()),
        ]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        let mut deps = Vec::new();
        if let Some(group) = &self.group {
            push_if_present(&mut deps, TaskKey::new(Group::KIND, group.as_str()), tasks);
        }
        Some(deps)
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let Some(entry) = find_user(&self.name)? else {
            return Ok(None);
        };
        let group = match &self.group {
            Some(_) => find_group_by_gid(entry.gid.as_raw())?.map(|g| g.name),
            None => None,
        };
        Ok(Some(Self {
            name: entry.name,
            uid: self.uid.map(|_| entry.uid.as_raw()),
            group,
            shell: self.shell.as_ref().map(|_| entry.shell.display().to_string()),
            home: self.home.as_ref().map(|_| entry.dir.display().to_string()),
            system: self.system,
        }))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        if actual.is_none() {
            log::info!("creating user {}", self.name);
            runner::run(&self.add_command())?;
        } else if let Some(cmd) = self.modify_command(changes) {
            log::info!("updating user {}", self.name);
            runner::run(&cmd)?;
        }
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        target.add_command(Mode::Once, self.add_command());
        Ok(())
    }
}

/// A local group.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub gid: Option<u32>,
    pub system: bool,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_command(&self) -> Vec<String> {
        let mut cmd = args(&["groupadd"]);
        if self.system {
            cmd.push("--system".into());
        }
        if let Some(gid) = self.gid {
            cmd.extend(["--gid".into(), gid.to_string()]);
        }
        cmd.push(self.name.clone());
        cmd
    }
}

impl Delta for Group {
    const KIND: &'static str = "Group";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![Field::opt("Gid", self.gid)]
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        Ok(find_group(&self.name)?.map(|g| Self {
            name: g.name,
            gid: self.gid.map(|_| g.gid.as_raw()),
            system: self.system,
        }))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        actual: Option<&Self>,
        changes: &Changes,
    ) -> Result<()> {
        if actual.is_none() {
            log::info!("creating group {}", self.name);
            runner::run(&self.add_command())?;
        } else if changes.has("Gid")
            && let Some(gid) = self.gid
        {
            log::info!("changing gid of group {} to {gid}", self.name);
            runner::run(&args(&["groupmod", "--gid", &gid.to_string(), &self.name]))?;
        }
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        target.add_command(Mode::Once, self.add_command());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::{FieldChange, Value};

    #[test]
    fn test_add_commands() {
        let mut user = User::new("etcd");
        user.system = true;
        user.uid = Some(998);
        user.shell = Some("/sbin/nologin".into());
        assert_eq!(
            user.add_command(),
            vec!["useradd", "--system", "--uid", "998", "--shell", "/sbin/nologin", "--no-create-home", "etcd"]
        );

        let mut group = Group::new("etcd");
        group.gid = Some(998);
        assert_eq!(group.add_command(), vec!["groupadd", "--gid", "998", "etcd"]);
    }

    #[test]
    fn test_modify_only_changed_fields() {
        let mut user = User::new("kube");
        user.uid = Some(1001);
        user.shell = Some("/bin/bash".into());

        let mut changes = Changes::default();
        assert!(user.modify_command(&changes).is_none());

        changes.push(FieldChange {
            name: "Shell",
            before: Some(Value::from("/bin/sh")),
            after: Value::from("/bin/bash"),
        });
        assert_eq!(user.modify_command(&changes).unwrap(), vec!["usermod", "--shell", "/bin/bash", "kube"]);
    }

    #[test]
    fn test_user_depends_on_group() {
        let mut tasks = TaskMap::default();
        tasks.insert(Group::new("kube")).unwrap();
        let mut user = User::new("kube");
        user.group = Some("kube".into());
        assert_eq!(user.dependencies(&tasks).unwrap(), vec![TaskKey::new("Group", "kube")]);
    }

    #[test]
    fn test_find_reads_account_database() {
        let target = converge::Target::DryRun(converge::DryRunTarget::new());
        let tasks = TaskMap::default();
        let services = converge::Services::default();
        let ctx = crate::tasks::testing::context(&target, &tasks, &services);

        let mut root = User::new("root");
        root.uid = Some(0);
        let found = root.find(&ctx).unwrap().unwrap();
        assert_eq!(found.uid, Some(0));
        assert_eq!(found.shell, None);
        assert!(converge::build_changes(Some(&found), &root).unwrap().is_empty());

        assert!(User::new("no-such-user-nodeup").find(&ctx).unwrap().is_none());

        let mut group = Group::new("root");
        group.gid = Some(0);
        assert_eq!(group.find(&ctx).unwrap().unwrap().gid, Some(0));
    }
}
