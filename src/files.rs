//! Host filesystem helpers shared by tasks.

use anyhow::{Context, Result};
use assets::Resource;
use nix::unistd::{Gid, Group, Uid, User};
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;

pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// `0644` style rendering of permission bits.
pub fn file_mode_string(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

/// Parse an octal mode, falling back to `default` when unset.
pub fn parse_file_mode(mode: Option<&str>, default: u32) -> Result<u32> {
    match mode {
        None | Some("") => Ok(default),
        Some(s) => u32::from_str_radix(s, 8).with_context(|| format!("invalid file mode {s:?}")),
    }
}

pub fn mkdir_all(dir: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .with_context(|| format!("error creating directories {}", dir.display()))
}

/// Atomically replace `path` with the bytes of `contents`.
pub fn write_file(path: &Path, contents: &dyn Resource, file_mode: u32, dir_mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    mkdir_all(dir, dir_mode)?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("error creating temp file in {}", dir.display()))?;
    let mut reader = contents.open()?;
    io::copy(&mut reader, &mut tmp)
        .with_context(|| format!("error writing contents for {}", path.display()))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(file_mode))
        .with_context(|| format!("error setting mode on {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("error replacing {}", path.display()))?;
    Ok(())
}

/// Set permission bits, returning whether they changed.
pub fn ensure_file_mode(path: &Path, mode: u32) -> Result<bool> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("error reading {}", path.display()))?;
    if meta.mode() & 0o7777 == mode {
        return Ok(false);
    }
    log::info!("changing file mode for {} to {}", path.display(), file_mode_string(mode));
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("error changing mode on {}", path.display()))?;
    Ok(true)
}

/// Set owner and group by name, returning whether they changed.
pub fn ensure_file_owner(path: &Path, owner: Option<&str>, group: Option<&str>) -> Result<bool> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("error reading {}", path.display()))?;

    let uid = match owner {
        Some(name) => Some(lookup_uid(name)?),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(lookup_gid(name)?),
        None => None,
    };
    let uid = uid.filter(|uid| *uid != meta.uid());
    let gid = gid.filter(|gid| *gid != meta.gid());
    if uid.is_none() && gid.is_none() {
        return Ok(false);
    }
    log::info!("changing owner of {} to {owner:?}:{group:?}", path.display());
    std::os::unix::fs::lchown(path, uid, gid)
        .with_context(|| format!("error changing owner of {}", path.display()))?;
    Ok(true)
}

/// A local account by name.
pub fn find_user(name: &str) -> Result<Option<User>> {
    User::from_name(name).with_context(|| format!("error looking up user {name:?}"))
}

/// A local group by name.
pub fn find_group(name: &str) -> Result<Option<Group>> {
    Group::from_name(name).with_context(|| format!("error looking up group {name:?}"))
}

/// A local group by gid.
pub fn find_group_by_gid(gid: u32) -> Result<Option<Group>> {
    Group::from_gid(Gid::from_raw(gid)).with_context(|| format!("error looking up gid {gid}"))
}

fn lookup_uid(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse() {
        return Ok(uid);
    }
    find_user(name)?
        .map(|u| u.uid.as_raw())
        .with_context(|| format!("unknown user {name:?}"))
}

fn lookup_gid(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse() {
        return Ok(gid);
    }
    find_group(name)?
        .map(|g| g.gid.as_raw())
        .with_context(|| format!("unknown group {name:?}"))
}

/// User name for a uid, or the number itself when unknown.
pub fn user_name(uid: u32) -> Result<String> {
    let user = User::from_uid(Uid::from_raw(uid)).with_context(|| format!("error looking up uid {uid}"))?;
    Ok(user.map_or_else(|| uid.to_string(), |u| u.name))
}

/// Group name for a gid, or the number itself when unknown.
pub fn group_name(gid: u32) -> Result<String> {
    Ok(find_group_by_gid(gid)?.map_or_else(|| gid.to_string(), |g| g.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assets::StringResource;
    use tempfile::TempDir;

    #[test]
    fn test_modes() {
        assert_eq!(file_mode_string(0o644), "0644");
        assert_eq!(file_mode_string(0o100_755), "0755");
        assert_eq!(parse_file_mode(Some("0600"), 0o644).unwrap(), 0o600);
        assert_eq!(parse_file_mode(None, 0o644).unwrap(), 0o644);
        assert!(parse_file_mode(Some("rwx"), 0o644).is_err());
    }

    #[test]
    fn test_write_file_creates_parents_and_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/config");
        write_file(&path, &StringResource::new("hello"), 0o600, 0o755).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        let mode = fs::metadata(&path).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o600);

        assert!(!ensure_file_mode(&path, 0o600).unwrap());
        assert!(ensure_file_mode(&path, 0o644).unwrap());
    }

    #[test]
    fn test_account_lookups() {
        assert_eq!(lookup_uid("root").unwrap(), 0);
        assert_eq!(lookup_uid("1234").unwrap(), 1234);
        assert_eq!(lookup_gid("4321").unwrap(), 4321);
        assert!(lookup_uid("no-such-user-nodeup").is_err());
        assert!(find_group("no-such-group-nodeup").unwrap().is_none());

        assert_eq!(user_name(0).unwrap(), "root");
        assert_eq!(find_group_by_gid(0).unwrap().unwrap().gid.as_raw(), 0);
        assert_eq!(user_name(4_000_000_000).unwrap(), "4000000000");
    }
}
