//! User configuration data model. The shadow-editing and passwd-rewrite
//! operations themselves live in `pipeline::users`.

use serde::{Deserialize, Serialize};

const fn default_true() -> bool {
	true
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct User {
	pub username: String,
	/// Pre-hashed password (crypt(3)/mkpasswd(1) format).
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub groups: Vec<String>,
	#[serde(default = "default_true")]
	pub create_home: bool,
	#[serde(default)]
	pub shell: Option<String>,
	#[serde(default)]
	pub uid: Option<u32>,
	#[serde(default)]
	pub gid: Option<u32>,
	#[serde(default)]
	pub ssh_keys: Vec<String>,
	/// Rewrites the user's `/etc/passwd` GECOS-trailing shell/command
	/// field; see `pipeline::users::set_startup_command`.
	#[serde(default)]
	pub startup_command: Option<String>,
	/// `-1` means the password never expires; `N >= 0` is the number of
	/// days after `password_last_changed` (or "today", expressed as days
	/// since the Unix epoch, if unset) that the password expires.
	#[serde(default)]
	pub password_expires_days: Option<i64>,
	/// Days since the Unix epoch the password was last changed. When
	/// absent and `password_expires_days` is set, today's day-count is
	/// used, matching `chage`'s default.
	#[serde(default)]
	pub password_last_changed: Option<i64>,
}
