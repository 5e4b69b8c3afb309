//! Grub defaults / grub.cfg template substitution and kernel-version
//! parsing (component J's textual-substitution core).

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tera::{Context, Tera};
use uuid::Uuid;

/// The four literal SELinux kernel-cmdline fragments the config may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelinuxCmdline {
	Off,
	Enabled,
	Enforcing,
	Permissive,
}

impl SelinuxCmdline {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Off => "selinux=0",
			Self::Enabled | Self::Permissive => "security=selinux selinux=1",
			Self::Enforcing => "security=selinux selinux=1 enforcing=1",
		}
	}
}

/// Inputs to the grub-defaults template, one field per substitution
/// placeholder.
#[derive(Debug, Clone, Serialize)]
pub struct GrubDefaultsVars {
	pub boot_uuid: Uuid,
	/// `/boot` when `/boot` is a separate partition, empty otherwise.
	pub boot_prefix: String,
	pub root_partition: String,
	pub luks_uuid: Option<Uuid>,
	/// `rd.lvm.lv=<vol>` target, when encryption uses an LVM-backed root.
	pub lvm_root_vol: Option<String>,
	pub ima_policy: Vec<String>,
	pub selinux: SelinuxCmdline,
	pub fips: bool,
	/// `Some(true)` => unified cgroup hierarchy on; `Some(false)` => off;
	/// `None` => leave at distro default.
	pub cgroup_unified: Option<bool>,
	pub extra_command_line: String,
	pub distributor: String,
}

impl GrubDefaultsVars {
	pub fn prefix_path(&self) -> String {
		format!("{}/grub2", if self.boot_prefix.is_empty() { "" } else { &self.boot_prefix })
	}

	fn luks_uuid_token(&self) -> String {
		self.luks_uuid.map(|u| format!("luks.uuid={u} ")).unwrap_or_default()
	}

	fn lvm_token(&self) -> String {
		self.lvm_root_vol.as_ref().map(|v| format!("rd.lvm.lv={v} ")).unwrap_or_default()
	}

	fn ima_policy_token(&self) -> String {
		if self.ima_policy.is_empty() {
			String::new()
		} else {
			format!("{} ", self.ima_policy.iter().map(|p| format!("ima_policy={p}")).collect::<Vec<_>>().join(" "))
		}
	}

	fn selinux_token(&self) -> String {
		format!("{} ", self.selinux.as_str())
	}

	fn fips_token(&self) -> String {
		if self.fips {
			format!("fips=1 boot=UUID={} ", self.boot_uuid)
		} else {
			String::new()
		}
	}

	fn cgroup_token(&self) -> String {
		match self.cgroup_unified {
			Some(true) => "systemd.unified_cgroup_hierarchy=1 ".to_string(),
			Some(false) => "systemd.unified_cgroup_hierarchy=0 ".to_string(),
			None => String::new(),
		}
	}

	fn cryptomount_command(&self) -> String {
		if self.luks_uuid.is_some() {
			"cryptomount -a".to_string()
		} else {
			String::new()
		}
	}

	fn cryptodisk_lines(&self) -> String {
		if self.luks_uuid.is_some() {
			"GRUB_ENABLE_CRYPTODISK=y\nGRUB_PRELOAD_MODULES=\"lvm\"".to_string()
		} else {
			String::new()
		}
	}

	fn extra_command_line_token(&self) -> String {
		if self.extra_command_line.is_empty() {
			String::new()
		} else {
			format!("{} ", self.extra_command_line)
		}
	}
}

/// The placeholder names the grub-defaults template is required to
/// reference exactly once, expressed in tera's `snake_case` form.
const REQUIRED_PLACEHOLDERS: &[&str] = &[
	"root_partition",
	"luks_uuid",
	"lvm",
	"ima_policy",
	"selinux",
	"fips",
	"cgroup",
	"extra_command_line",
	"cryptodisk_lines",
];

/// Renders `/etc/default/grub` from `vars`. Asserts at render time that the
/// template references every required placeholder exactly once — a
/// template that fails this is an implementation bug, not a user error.
pub fn render_grub_defaults(template_src: &str, vars: &GrubDefaultsVars) -> Result<String> {
	for name in REQUIRED_PLACEHOLDERS {
		let token = format!("{{{{ {name} }}}}");
		let count = template_src.matches(&token).count();
		if count != 1 {
			return Err(eyre!(
				"grub-defaults template must reference `{{{{ {name} }}}}` exactly once, found {count}"
			));
		}
	}

	let mut ctx = Context::new();
	ctx.insert("distributor", &vars.distributor);
	ctx.insert("root_partition", &vars.root_partition);
	ctx.insert("luks_uuid", &vars.luks_uuid_token());
	ctx.insert("lvm", &vars.lvm_token());
	ctx.insert("ima_policy", &vars.ima_policy_token());
	ctx.insert("selinux", &vars.selinux_token());
	ctx.insert("fips", &vars.fips_token());
	ctx.insert("cgroup", &vars.cgroup_token());
	ctx.insert("extra_command_line", &vars.extra_command_line_token());
	ctx.insert("cryptodisk_lines", &vars.cryptodisk_lines());

	Tera::one_off(template_src, &ctx, false).map_err(|e| eyre!("failed to render grub defaults: {e}"))
}

/// Renders the EFI `grub.cfg` stub (the file that just chain-loads the real
/// config from the prefix partition).
pub fn render_grub_cfg(template_src: &str, vars: &GrubDefaultsVars) -> Result<String> {
	let mut ctx = Context::new();
	ctx.insert("boot_uuid", &format!("{}", vars.boot_uuid));
	ctx.insert("prefix_path", &vars.prefix_path());
	ctx.insert("crypto_mount_command", &vars.cryptomount_command());
	Tera::one_off(template_src, &ctx, false).map_err(|e| eyre!("failed to render grub.cfg: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

/// Parses `"a.b.c[-suffix]"` into `{major, minor, patch}`; any other shape
/// is an error (testable property 7).
pub fn parse_kernel_version(s: &str) -> Result<KernelVersion> {
	let core = s.split('-').next().unwrap_or(s);
	let mut parts = core.split('.');
	let (Some(a), Some(b), Some(c)) = (parts.next(), parts.next(), parts.next()) else {
		return Err(eyre!("kernel version {s:?} is not of the form a.b.c[-suffix]"));
	};
	if parts.next().is_some() {
		return Err(eyre!("kernel version {s:?} has more than three numeric components"));
	}
	let parse = |n: &str| n.parse::<u32>().map_err(|_| eyre!("kernel version {s:?} has a non-numeric component"));
	Ok(KernelVersion { major: parse(a)?, minor: parse(b)?, patch: parse(c)? })
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_vars() -> GrubDefaultsVars {
		GrubDefaultsVars {
			boot_uuid: Uuid::nil(),
			boot_prefix: String::new(),
			root_partition: "UUID=abc".into(),
			luks_uuid: None,
			lvm_root_vol: None,
			ima_policy: Vec::new(),
			selinux: SelinuxCmdline::Off,
			fips: false,
			cgroup_unified: None,
			extra_command_line: String::new(),
			distributor: "okonomi".into(),
		}
	}

	#[test]
	fn renders_selinux_enforcing_fragment() {
		let mut vars = sample_vars();
		vars.selinux = SelinuxCmdline::Enforcing;
		let template = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/grub-defaults.tera")).unwrap();
		let rendered = render_grub_defaults(&template, &vars).unwrap();
		assert!(rendered.contains("security=selinux selinux=1 enforcing=1"));
	}

	#[test]
	fn rejects_template_missing_a_placeholder() {
		let vars = sample_vars();
		let broken = "GRUB_CMDLINE_LINUX=\"root={{ root_partition }}\"";
		assert!(render_grub_defaults(broken, &vars).is_err());
	}

	#[test]
	fn parses_kernel_version_with_suffix() {
		assert_eq!(parse_kernel_version("6.6.1-200.fc39").unwrap(), KernelVersion { major: 6, minor: 6, patch: 1 });
	}

	#[test]
	fn rejects_malformed_kernel_version() {
		assert!(parse_kernel_version("6.6").is_err());
		assert!(parse_kernel_version("a.b.c").is_err());
	}
}
