#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
// followings are from clippy::restriction
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::pattern_type_mismatch)]

mod bootloader;
mod chroot;
mod config;
mod connection;
mod cpio;
mod error;
mod exec;
mod fileutil;
mod isostage;
mod loopback;
mod mount;
mod pipeline;
mod signalsafe;
mod tarcodec;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, trace, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use config::{Configuration, Mode, OutputImageFormat, ResolvedConfig};
use pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline Linux disk-image customization engine")]
struct Cli {
	#[command(subcommand)]
	command: Command,

	/// Write a completion timestamp to this file once the run succeeds
	#[arg(long, global = true)]
	timestamp_file: Option<PathBuf>,

	/// Opt out of anonymous usage telemetry (currently a no-op; no telemetry
	/// is collected)
	#[arg(long, global = true)]
	disable_telemetry: bool,

	#[arg(long, global = true)]
	log_color: bool,

	#[arg(long, global = true)]
	log_file: Option<PathBuf>,

	#[arg(long, global = true, default_value = "info", env = "OKONOMI_LOG")]
	log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Build a fresh disk image from scratch
	Create(CreateArgs),
	/// Customize an existing disk image or OCI rootfs
	Customize(CustomizeArgs),
	/// Inject files into an existing disk image without reinstalling packages
	InjectFiles(InjectFilesArgs),
}

#[derive(Args, Debug)]
struct CreateArgs {
	#[arg(long)]
	build_dir: PathBuf,
	#[arg(long)]
	config_file: PathBuf,
	#[arg(long = "rpm-source")]
	rpm_source: Vec<PathBuf>,
	#[arg(long)]
	tools_file: PathBuf,

	#[arg(long)]
	output_image_file: Option<PathBuf>,
	#[arg(long, value_enum)]
	output_image_format: Option<OutputImageFormat>,
	#[arg(long)]
	distro: Option<String>,
	#[arg(long)]
	distro_version: Option<String>,
	#[arg(long)]
	package_snapshot_time: Option<String>,
}

#[derive(Args, Debug)]
struct CustomizeArgs {
	#[arg(long)]
	build_dir: PathBuf,
	#[arg(long)]
	config_file: PathBuf,

	#[arg(long)]
	image_file: Option<PathBuf>,
	/// An `oci:<uri>` reference; mutually exclusive with `--image-file`
	#[arg(long)]
	image: Option<String>,

	#[arg(long)]
	output_image_file: Option<PathBuf>,
	#[arg(long, value_enum)]
	output_image_format: Option<OutputImageFormat>,
	#[arg(long = "rpm-source")]
	rpm_source: Vec<PathBuf>,
	#[arg(long)]
	disable_base_image_rpm_repos: bool,
	#[arg(long)]
	package_snapshot_time: Option<String>,
	#[arg(long)]
	image_cache_dir: Option<PathBuf>,
	#[arg(long, value_parser = clap::value_parser!(u8).range(1..=22))]
	cosi_compression_level: Option<u8>,
	#[arg(long)]
	output_selinux_policy_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InjectFilesArgs {
	#[arg(long)]
	build_dir: PathBuf,
	#[arg(long)]
	config_file: PathBuf,
	#[arg(long)]
	image_file: PathBuf,

	#[arg(long)]
	output_image_file: Option<PathBuf>,
	#[arg(long, value_enum)]
	output_image_format: Option<OutputImageFormat>,
	#[arg(long, value_parser = clap::value_parser!(u8).range(1..=22))]
	cosi_compression_level: Option<u8>,
}

fn init_logging(cli: &Cli) -> Result<()> {
	let filter = EnvFilter::try_from_env("OKONOMI_LOG").unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
	let fmtlyr = fmt::layer().with_ansi(cli.log_color).with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);

	if let Some(path) = &cli.log_file {
		let file = std::fs::File::create(path).map_err(|e| error::OkonomiError::io(path, e))?;
		let file_filter = EnvFilter::new(cli.log_level.clone());
		let file_layer = fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false).with_filter(file_filter);
		tracing::subscriber::set_global_default(subscriber.with(file_layer))
			.map_err(|e| eyre!("failed to install tracing subscriber: {e}"))?;
	} else {
		tracing::subscriber::set_global_default(subscriber).map_err(|e| eyre!("failed to install tracing subscriber: {e}"))?;
	}
	Ok(())
}

/// Parses `oci:<uri>` into the bare URI, rejecting anything else.
fn parse_oci_reference(image: &str) -> Result<String> {
	image
		.strip_prefix("oci:")
		.map(ToOwned::to_owned)
		.ok_or_else(|| eyre!("--image must be of the form oci:<uri>, got {image:?}"))
}

fn load_config(config_file: &std::path::Path) -> Result<(Configuration, PathBuf)> {
	let config_dir = config_file.parent().map(std::path::Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
	let raw = Configuration::load(config_file)?;
	Ok((raw, config_dir))
}

fn run_create(args: CreateArgs, timestamp_file: Option<&std::path::Path>) -> Result<()> {
	let (mut raw, config_dir) = load_config(&args.config_file)?;

	raw.os.rpm_sources.extend(args.rpm_source);
	if let Some(distro) = args.distro {
		raw.distro = Some(distro);
	}
	if let Some(v) = args.distro_version {
		raw.distro_version = Some(v);
	}
	if let Some(t) = args.package_snapshot_time {
		raw.os.package_snapshot_time = Some(t);
	}

	let resolved =
		ResolvedConfig::resolve(raw, Mode::Create, &config_dir, &args.build_dir, args.output_image_file, args.output_image_format)?;

	let arch = detected_arch();
	let pipeline = Pipeline::new(resolved, Some(args.tools_file), arch);
	pipeline.run()?;
	finish(timestamp_file)
}

fn run_customize(args: CustomizeArgs, timestamp_file: Option<&std::path::Path>) -> Result<()> {
	let (mut raw, config_dir) = load_config(&args.config_file)?;

	if let Some(image_file) = args.image_file {
		raw.input.image_file = Some(image_file);
	}
	if let Some(image) = args.image {
		raw.input.oci_uri = Some(parse_oci_reference(&image)?);
	}
	raw.os.rpm_sources.extend(args.rpm_source);
	if let Some(t) = args.package_snapshot_time {
		raw.os.package_snapshot_time = Some(t);
	}
	if let Some(level) = args.cosi_compression_level {
		raw.output.compression_level = Some(i32::from(level));
	}
	if args.disable_base_image_rpm_repos {
		warn!("--disable-base-image-rpm-repos requested; base image repo files under /etc/yum.repos.d are left untouched by this implementation");
	}
	if let Some(dir) = &args.image_cache_dir {
		info!(cache_dir = ?dir, "image cache directory configured; OCI pulls are not yet cached across runs");
	}
	if let Some(path) = &args.output_selinux_policy_path {
		warn!(path = ?path, "--output-selinux-policy-path requested; exporting the compiled policy is not yet implemented");
	}

	let resolved = ResolvedConfig::resolve(
		raw,
		Mode::Customize,
		&config_dir,
		&args.build_dir,
		args.output_image_file,
		args.output_image_format,
	)?;

	let arch = detected_arch();
	let pipeline = Pipeline::new(resolved, None, arch);
	pipeline.run()?;
	finish(timestamp_file)
}

fn run_inject_files(args: InjectFilesArgs, timestamp_file: Option<&std::path::Path>) -> Result<()> {
	let (mut raw, config_dir) = load_config(&args.config_file)?;
	raw.input.image_file = Some(args.image_file);
	if let Some(level) = args.cosi_compression_level {
		raw.output.compression_level = Some(i32::from(level));
	}

	let resolved = ResolvedConfig::resolve(
		raw,
		Mode::InjectFiles,
		&config_dir,
		&args.build_dir,
		args.output_image_file,
		args.output_image_format,
	)?;

	let arch = detected_arch();
	let pipeline = Pipeline::new(resolved, None, arch);
	pipeline.run()?;
	finish(timestamp_file)
}

fn finish(timestamp_file: Option<&std::path::Path>) -> Result<()> {
	if let Some(path) = timestamp_file {
		let now =
			std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
		std::fs::write(path, now.to_string()).map_err(|e| error::OkonomiError::io(path, e))?;
	}
	Ok(())
}

fn detected_arch() -> String {
	std::env::consts::ARCH.to_string()
}

fn main() -> color_eyre::Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}

	color_eyre::install()?;
	signalsafe::install_signal_handlers();

	let cli = Cli::parse();
	init_logging(&cli)?;
	trace!(?cli, "parsed CLI arguments");

	sudo::escalate_if_needed().map_err(|e| eyre!("failed to escalate privileges: {e}"))?;

	let Cli { command, timestamp_file, .. } = cli;
	let timestamp_file = timestamp_file.as_deref();

	match command {
		Command::Create(args) => run_create(args, timestamp_file),
		Command::Customize(args) => run_customize(args, timestamp_file),
		Command::InjectFiles(args) => run_inject_files(args, timestamp_file),
	}
}
