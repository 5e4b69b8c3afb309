//! Partition layout data model. Filesystem/device operations (formatting,
//! UUID query, fstab composition) live in `pipeline::partition`, which
//! operates on these types; this module is data-only plus the
//! mountpoint-ordering helper every one of those stages needs.

use std::collections::BTreeMap;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionFlag {
	NoAuto,
	ReadOnly,
	GrowFs,
	#[serde(untagged)]
	FlagPosition(u8),
}

impl PartitionFlag {
	pub fn flag_position(&self) -> u8 {
		match self {
			Self::NoAuto => 63,
			Self::ReadOnly => 60,
			Self::GrowFs => 59,
			Self::FlagPosition(position) => *position,
		}
	}
}

/// A subset of the UAPI discoverable-partitions-specification GUID table.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
	Root,
	RootArm64,
	RootX86_64,
	Esp,
	Xbootldr,
	Swap,
	LinuxGeneric,
	#[serde(untagged)]
	Guid(uuid::Uuid),
}

impl PartitionType {
	pub fn uuid(&self, target_arch: &str) -> String {
		match self {
			Self::Root => match target_arch {
				"aarch64" => Self::RootArm64.uuid(target_arch),
				_ => Self::RootX86_64.uuid(target_arch),
			},
			Self::RootArm64 => "b921b045-1df0-41c3-af44-4c6f280d3fae".to_string(),
			Self::RootX86_64 => "4f68bce3-e8cd-4db1-96e7-fbcaf984b709".to_string(),
			Self::Esp => "c12a7328-f81f-11d2-ba4b-00a0c93ec93b".to_string(),
			Self::Xbootldr => "bc13c2ff-59e6-4262-a352-b275fd6f7172".to_string(),
			Self::Swap => "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f".to_string(),
			Self::LinuxGeneric => "0fc63daf-8483-4772-8e79-3d69d8477de4".to_string(),
			Self::Guid(guid) => guid.to_string(),
		}
	}
}

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BtrfsSubvolume {
	pub name: String,
	pub mountpoint: String,
}

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Partition {
	pub label: Option<String>,
	#[serde(rename = "type")]
	pub partition_type: PartitionType,
	pub flags: Option<Vec<PartitionFlag>>,
	pub size: Option<ByteSize>,
	pub filesystem: String,
	pub mountpoint: String,
	#[serde(default)]
	pub subvolumes: Vec<BtrfsSubvolume>,
	/// Set when this partition is LUKS-encrypted; the mapper name under
	/// `/dev/mapper/<name>` used by the bootloader writer (4.J) to compute
	/// `RootPartition`/`RootDevice`.
	#[serde(default)]
	pub luks_mapper_name: Option<String>,
	#[serde(default)]
	pub verity: bool,
}

impl Partition {
	pub fn is_pseudo_or_overlay(&self) -> bool {
		matches!(self.filesystem.as_str(), "tmpfs" | "overlay" | "proc" | "sysfs" | "devtmpfs")
	}

	pub fn is_swap(&self) -> bool {
		self.filesystem == "swap"
	}

	pub fn is_encrypted(&self) -> bool {
		self.luks_mapper_name.is_some()
	}
}

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct PartitionLayout {
	pub size: Option<ByteSize>,
	pub partitions: Vec<Partition>,
}

impl PartitionLayout {
	/// Sorts partitions least-nested mountpoint first (root always first),
	/// pairing each with its 1-based partition index in declared order.
	pub fn sort_by_mountpoint(&self) -> Vec<(usize, Partition)> {
		let mut ordered: BTreeMap<usize, Partition> = BTreeMap::new();
		for (i, part) in self.partitions.iter().enumerate() {
			ordered.insert(i + 1, part.clone());
		}
		let mut ordered: Vec<_> = ordered.into_iter().collect();
		ordered.sort_by(|(_, a), (_, b)| {
			let am = a.mountpoint.trim_end_matches('/').matches('/').count();
			let bm = b.mountpoint.trim_end_matches('/').matches('/').count();
			if a.mountpoint == "/" {
				std::cmp::Ordering::Less
			} else if b.mountpoint == "/" {
				std::cmp::Ordering::Greater
			} else if am == bm {
				a.mountpoint.cmp(&b.mountpoint)
			} else {
				am.cmp(&bm)
			}
		});
		ordered
	}
}

/// One disk in `storage.disks`: its own partition table.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Disk {
	pub size: Option<ByteSize>,
	#[serde(flatten)]
	pub layout: PartitionLayout,
}

/// Utility for determining partition `/dev` node names, accounting for
/// `mmcblk`/`nvme`/`loop` devices needing a `p` infix.
#[must_use]
pub fn partition_name(disk: &str, partition: usize) -> String {
	let infix =
		if disk.starts_with("/dev/mmcblk") || disk.starts_with("/dev/nvme") || disk.starts_with("/dev/loop") {
			"p"
		} else {
			""
		};
	format!("{disk}{infix}{partition}")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn part(mountpoint: &str) -> Partition {
		Partition {
			label: None,
			partition_type: PartitionType::LinuxGeneric,
			flags: None,
			size: None,
			filesystem: "ext4".into(),
			mountpoint: mountpoint.into(),
			subvolumes: Vec::new(),
			luks_mapper_name: None,
			verity: false,
		}
	}

	#[test]
	fn root_always_sorts_first() {
		let layout = PartitionLayout { size: None, partitions: vec![part("/boot"), part("/"), part("/home")] };
		let sorted = layout.sort_by_mountpoint();
		assert_eq!(sorted[0].1.mountpoint, "/");
	}

	#[test]
	fn partition_name_handles_nvme_infix() {
		assert_eq!(partition_name("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
		assert_eq!(partition_name("/dev/sda", 1), "/dev/sda1");
	}
}
