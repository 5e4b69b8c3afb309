//! Partition/filesystem operations (component I): format a partition,
//! query UUID/PARTUUID/PARTLABEL via `blkid`, format fstab-style mount
//! identifiers, and compose `/etc/fstab` with the full pass-number rule
//! table (not just the `efi`/`vfat` special case).

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::{config::partition::Partition, exec::Executor};

/// `UUID`/`PARTUUID`/`PARTLABEL`, queried from the kernel after formatting.
#[derive(Debug, Clone, Default)]
pub struct PartitionIdentity {
	pub uuid: Option<String>,
	pub partuuid: Option<String>,
	pub partlabel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountIdentifier {
	Uuid,
	PartUuid,
	PartLabel,
	None,
}

/// Formats a partition with `filesystem` and, when supported by the
/// chosen tool, `label`.
pub fn format_partition(device: &Path, filesystem: &str, label: Option<&str>) -> Result<()> {
	let device_str = device.to_string_lossy().to_string();
	debug!(?device, filesystem, "formatting partition");
	match filesystem {
		"efi" | "vfat" => {
			let mut e = Executor::new("mkfs.fat").arg("-F32");
			if let Some(label) = label {
				e = e.arg("-n").arg(label);
			}
			e.arg(device_str).run()
		},
		"swap" => Executor::new("mkswap").arg(device_str).run(),
		fsname => {
			let mut e = Executor::new(format!("mkfs.{fsname}"));
			if let Some(label) = label {
				e = e.arg("-L").arg(label);
			}
			e.arg(device_str).run()
		},
	}
}

/// Queries `UUID`/`PARTUUID`/`PARTLABEL` for `device` via `blkid`.
pub fn query_identity(device: &Path) -> Result<PartitionIdentity> {
	let query = |tag: &str| -> Option<String> {
		Executor::new("blkid")
			.arg("-s")
			.arg(tag)
			.arg("-o")
			.arg("value")
			.arg(device.to_string_lossy().to_string())
			.run_stdout()
			.ok()
			.filter(|s| !s.is_empty())
	};
	Ok(PartitionIdentity { uuid: query("UUID"), partuuid: query("PARTUUID"), partlabel: query("PARTLABEL") })
}

/// Formats an fstab-style device identifier string. `kind == None` is
/// always an error, even for a real device.
pub fn format_mount_identifier(kind: MountIdentifier, identity: &PartitionIdentity) -> Result<String> {
	match kind {
		MountIdentifier::Uuid => identity
			.uuid
			.as_ref()
			.map(|u| format!("UUID={u}"))
			.ok_or_else(|| eyre!("partition has no UUID to format a mount identifier from")),
		MountIdentifier::PartUuid => identity
			.partuuid
			.as_ref()
			.map(|u| format!("PARTUUID={u}"))
			.ok_or_else(|| eyre!("partition has no PARTUUID to format a mount identifier from")),
		MountIdentifier::PartLabel => identity
			.partlabel
			.as_ref()
			.map(|l| format!("PARTLABEL={l}"))
			.ok_or_else(|| eyre!("partition has no PARTLABEL to format a mount identifier from")),
		MountIdentifier::None => Err(eyre!("MountIdentifier::None cannot be formatted; a real device always needs an identifier")),
	}
}

/// One resolved line of `/etc/fstab`.
pub struct FstabLine {
	pub device: String,
	pub mountpoint: String,
	pub fstype: String,
	pub options: String,
	pub dump: u8,
	pub pass: u8,
}

impl std::fmt::Display for FstabLine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {} {} {} {} {}", self.device, self.mountpoint, self.fstype, self.options, self.dump, self.pass)
	}
}

/// Computes the fstab pass number: `1` for root, `0` for pseudo-FS or
/// encrypted/overlay mounts, `2` otherwise. Swap always forces `pass=0`
/// regardless of the other rules.
fn pass_number(part: &Partition) -> u8 {
	if part.is_swap() {
		0
	} else if part.mountpoint == "/" {
		1
	} else if part.is_pseudo_or_overlay() || part.is_encrypted() {
		0
	} else {
		2
	}
}

/// Builds one fstab line per partition, in the order given (callers should
/// pass `PartitionLayout::sort_by_mountpoint`'s order). `identity_of` maps
/// a partition to its resolved identity (typically a `blkid` query against
/// its mounted device).
pub fn build_fstab_lines(
	partitions: &[(usize, Partition)], mount_kind: MountIdentifier,
	identity_of: impl Fn(usize, &Partition) -> Result<PartitionIdentity>,
) -> Result<Vec<FstabLine>> {
	let mut lines = Vec::with_capacity(partitions.len());
	for (index, part) in partitions {
		let identity = identity_of(*index, part)?;
		let device = format_mount_identifier(mount_kind, &identity)?;
		let fstype = if part.filesystem == "efi" { "vfat".to_string() } else { part.filesystem.clone() };

		let (options, pass) =
			if part.is_swap() { ("sw".to_string(), 0) } else { ("defaults".to_string(), pass_number(part)) };

		lines.push(FstabLine { device, mountpoint: part.mountpoint.clone(), fstype, options, dump: 0, pass });
	}
	Ok(lines)
}

pub fn render_fstab(lines: &[FstabLine]) -> String {
	let mut out = String::from("# /etc/fstab: static file system information.\n");
	for line in lines {
		out.push_str(&line.to_string());
		out.push('\n');
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::partition::PartitionType;

	fn part(mountpoint: &str, filesystem: &str) -> Partition {
		Partition {
			label: None,
			partition_type: PartitionType::LinuxGeneric,
			flags: None,
			size: None,
			filesystem: filesystem.into(),
			mountpoint: mountpoint.into(),
			subvolumes: Vec::new(),
			luks_mapper_name: None,
			verity: false,
		}
	}

	#[test]
	fn mount_identifier_none_is_always_an_error() {
		let identity = PartitionIdentity { uuid: Some("x".into()), ..Default::default() };
		assert!(format_mount_identifier(MountIdentifier::None, &identity).is_err());
	}

	#[test]
	fn mount_identifier_prefixes_match_kind() {
		let identity = PartitionIdentity {
			uuid: Some("u".into()),
			partuuid: Some("pu".into()),
			partlabel: Some("pl".into()),
		};
		assert_eq!(format_mount_identifier(MountIdentifier::Uuid, &identity).unwrap(), "UUID=u");
		assert_eq!(format_mount_identifier(MountIdentifier::PartUuid, &identity).unwrap(), "PARTUUID=pu");
		assert_eq!(format_mount_identifier(MountIdentifier::PartLabel, &identity).unwrap(), "PARTLABEL=pl");
	}

	#[test]
	fn pass_numbers_follow_the_rule_table() {
		assert_eq!(pass_number(&part("/", "ext4")), 1);
		assert_eq!(pass_number(&part("/boot", "ext4")), 2);
		assert_eq!(pass_number(&part("none", "tmpfs")), 0);
		assert_eq!(pass_number(&part("none", "swap")), 0);
	}

	#[test]
	fn swap_lines_use_sw_options_and_pass_zero() {
		let parts = vec![(1, part("none", "swap"))];
		let lines = build_fstab_lines(&parts, MountIdentifier::Uuid, |_, _| {
			Ok(PartitionIdentity { uuid: Some("s".into()), ..Default::default() })
		})
		.unwrap();
		assert_eq!(lines[0].options, "sw");
		assert_eq!(lines[0].pass, 0);
	}
}
