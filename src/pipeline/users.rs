//! User management (§4.L.users): group/user creation, startup-command
//! passwd rewrite, password-expiry shadow editing.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::{chroot::SafeChroot, config::auth::User, exec::Executor};

/// Seconds in a day, used to convert a Unix timestamp into "days since the
/// epoch" the way `chage`/`/etc/shadow` expect.
const SECS_PER_DAY: i64 = 86_400;

pub fn create_and_configure(user: &User, chroot: &SafeChroot) -> Result<()> {
	for group in &user.groups {
		ensure_group(group, chroot)?;
	}

	create_user(user, chroot)?;

	if let Some(hash) = &user.password {
		let username = user.username.clone();
		let hash = hash.clone();
		chroot.run(move || Executor::new("usermod").arg("-p").arg(&hash).arg(&username).run())?;
	}

	if !user.groups.is_empty() {
		let username = user.username.clone();
		let groups = user.groups.join(",");
		chroot.run(move || Executor::new("usermod").arg("-a").arg("-G").arg(&groups).arg(&username).run())?;
	}

	if let Some(cmd) = &user.startup_command {
		set_startup_command(&user.username, cmd, &chroot.root_dir.join("etc/passwd"))?;
	}

	if let Some(days) = user.password_expires_days {
		set_password_expiry(&user.username, days, user.password_last_changed, &chroot.root_dir.join("etc/shadow"))?;
	}

	if !user.ssh_keys.is_empty() {
		install_ssh_keys(user, chroot)?;
	}

	Ok(())
}

fn ensure_group(group: &str, chroot: &SafeChroot) -> Result<()> {
	let passwd_path = chroot.root_dir.join("etc/group");
	let exists = std::fs::read_to_string(&passwd_path)
		.map(|s| s.lines().any(|l| l.split(':').next() == Some(group)))
		.unwrap_or(false);
	if exists {
		debug!(group, "group already exists");
		return Ok(());
	}
	chroot.run(|| Executor::new("groupadd").arg(group).run())
}

fn create_user(user: &User, chroot: &SafeChroot) -> Result<()> {
	let username = user.username.clone();
	let shell = user.shell.clone();
	let uid = user.uid;
	let gid = user.gid;
	let create_home = user.create_home;
	chroot.run(move || {
		let mut cmd = Executor::new("useradd").arg(&username);
		if let Some(shell) = &shell {
			cmd = cmd.arg("-s").arg(shell);
		}
		if let Some(uid) = uid {
			cmd = cmd.arg("-u").arg(uid.to_string());
		}
		if let Some(gid) = gid {
			cmd = cmd.arg("-g").arg(gid.to_string());
		}
		if create_home {
			cmd = cmd.arg("-m");
		}
		cmd.run()
	})
}

fn install_ssh_keys(user: &User, chroot: &SafeChroot) -> Result<()> {
	if !user.create_home {
		warn!(user = %user.username, "ssh_keys given but create_home is false; skipping authorized_keys install");
		return Ok(());
	}
	let home = chroot.root_dir.join("home").join(&user.username);
	let ssh_dir = home.join(".ssh");
	std::fs::create_dir_all(&ssh_dir)?;
	std::fs::write(ssh_dir.join("authorized_keys"), user.ssh_keys.join("\n") + "\n")?;
	Ok(())
}

/// Sed-rewrites the user's `/etc/passwd` line, matching
/// `^<user>.*):[^:]*$` and replacing the trailing field with `command`.
pub fn set_startup_command(username: &str, command: &str, passwd_path: &Path) -> Result<()> {
	let contents = std::fs::read_to_string(passwd_path)?;
	let mut found = false;
	let rewritten: Vec<String> = contents
		.lines()
		.map(|line| {
			let mut fields: Vec<&str> = line.split(':').collect();
			if fields.first() == Some(&username) && fields.len() == 7 {
				found = true;
				fields[6] = command;
				fields.join(":")
			} else {
				line.to_string()
			}
		})
		.collect();

	if !found {
		return Err(eyre!("no /etc/passwd entry found for user {username:?} to set a startup command on"));
	}

	std::fs::write(passwd_path, rewritten.join("\n") + "\n")?;
	Ok(())
}

/// Edits `/etc/shadow`'s 9-field line for `username`:
/// `name:hash:changed:min:max:warn:inactive:expire:reserved`.
/// `-1` blanks fields 4..8 (never expires). `N >= 0` sets field 7 to
/// `changed + N`, defaulting `changed` to "days since the Unix epoch" (as
/// of the given `now_days` reference, or today) when blank. Values less
/// than `-1` are rejected.
pub fn set_password_expiry(username: &str, expires_days: i64, last_changed: Option<i64>, shadow_path: &Path) -> Result<()> {
	if expires_days < -1 {
		return Err(eyre!("password_expires_days must be -1 (never) or >= 0, got {expires_days}"));
	}

	let contents = std::fs::read_to_string(shadow_path)?;
	let mut found = false;
	let rewritten: Vec<String> = contents
		.lines()
		.map(|line| {
			let mut fields: Vec<String> = line.split(':').map(str::to_string).collect();
			if fields.first().map(String::as_str) != Some(username) || fields.len() != 9 {
				return line.to_string();
			}
			found = true;

			if expires_days == -1 {
				for field in fields.iter_mut().take(8).skip(3) {
					field.clear();
				}
			} else {
				let changed = last_changed.unwrap_or_else(today_days_since_epoch);
				if fields[2].is_empty() {
					fields[2] = changed.to_string();
				}
				let changed: i64 = fields[2].parse().unwrap_or(changed);
				fields[7] = (changed + expires_days).to_string();
			}

			fields.join(":")
		})
		.collect();

	if !found {
		return Err(eyre!("no /etc/shadow entry found for user {username:?} to set password expiry on"));
	}

	std::fs::write(shadow_path, rewritten.join("\n") + "\n")?;
	info!(username, expires_days, "updated password expiry");
	Ok(())
}

fn today_days_since_epoch() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as i64 / SECS_PER_DAY)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sets_expire_field_from_explicit_last_changed() {
		let dir = tempfile::tempdir().unwrap();
		let shadow_path = dir.path().join("shadow");
		std::fs::write(&shadow_path, "x:hash::::::::\n").unwrap();

		set_password_expiry("x", 30, Some(20000), &shadow_path).unwrap();

		let contents = std::fs::read_to_string(&shadow_path).unwrap();
		let fields: Vec<&str> = contents.trim().split(':').collect();
		assert_eq!(fields[2], "20000");
		assert_eq!(fields[7], "20030");
	}

	#[test]
	fn never_expires_blanks_fields_four_through_eight() {
		let dir = tempfile::tempdir().unwrap();
		let shadow_path = dir.path().join("shadow");
		std::fs::write(&shadow_path, "x:hash:19000:1:2:3:4:5:\n").unwrap();

		set_password_expiry("x", -1, None, &shadow_path).unwrap();

		let contents = std::fs::read_to_string(&shadow_path).unwrap();
		let fields: Vec<&str> = contents.trim().split(':').collect();
		assert_eq!(fields[3], "");
		assert_eq!(fields[4], "");
		assert_eq!(fields[5], "");
		assert_eq!(fields[6], "");
		assert_eq!(fields[7], "");
	}

	#[test]
	fn rejects_values_below_negative_one() {
		let dir = tempfile::tempdir().unwrap();
		let shadow_path = dir.path().join("shadow");
		std::fs::write(&shadow_path, "x:hash::::::::\n").unwrap();
		assert!(set_password_expiry("x", -2, None, &shadow_path).is_err());
	}

	#[test]
	fn startup_command_rewrites_trailing_field() {
		let dir = tempfile::tempdir().unwrap();
		let passwd_path = dir.path().join("passwd");
		std::fs::write(&passwd_path, "x:x:1000:1000:X:/home/x:/bin/bash\n").unwrap();
		set_startup_command("x", "/usr/bin/firstboot", &passwd_path).unwrap();
		let contents = std::fs::read_to_string(&passwd_path).unwrap();
		assert!(contents.trim().ends_with(":/usr/bin/firstboot"));
	}
}
