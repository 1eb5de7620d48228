//! diskexport CLI - Export VM disk images as shareable templates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use diskexport_core::disk::load_disk_specs;
use diskexport_core::paths::expand_env;
use diskexport_core::{
    export_disks, verify_export, ChecksumAlgorithm, CompressionFormat, DiskDescriptor,
    DiskExporter, DiskTools, DiskType, ExportOptions, ExportProgress, ExportedDisk,
    ProgressCallback, SystemTools, ToolConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Export VM disk images with checksum and metadata sidecars.
#[derive(Parser)]
#[command(name = "diskexport")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    tools: ToolArgs,

    /// Log progress of each step to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the external tools (defaults come from the environment).
#[derive(Args)]
struct ToolArgs {
    /// Path to qemu-img.
    #[arg(long, global = true, value_name = "PATH")]
    qemu_img: Option<PathBuf>,

    /// Path to virt-sparsify.
    #[arg(long, global = true, value_name = "PATH")]
    virt_sparsify: Option<PathBuf>,

    /// Path to xz.
    #[arg(long, global = true, value_name = "PATH")]
    xz: Option<PathBuf>,
}

/// Options shared by single and batch exports.
#[derive(Args)]
struct ExportArgs {
    /// Destination directory. May reference environment variables.
    #[arg(short, long)]
    output: String,

    /// Merge template layers into a self-contained image.
    #[arg(long)]
    standalone: bool,

    /// Compress the exported image.
    #[arg(short, long)]
    compress: bool,

    /// Compression format used with --compress.
    #[arg(long, value_enum, default_value = "xz")]
    compression: CompressionArg,

    /// Checksum algorithm for the .hash sidecar.
    #[arg(long, value_enum, default_value = "sha1")]
    checksum: ChecksumArg,

    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a disk image.
    Export {
        /// Path to the source image. May reference environment variables.
        source: String,

        /// Disk type (file, empty, template).
        #[arg(short = 't', long = "type", default_value = "file")]
        disk_type: String,

        /// Image format. Detected with qemu-img when omitted.
        #[arg(short, long)]
        format: Option<String>,

        /// JSON file with the disk's provenance metadata.
        #[arg(long, value_name = "FILE")]
        metadata_file: Option<PathBuf>,

        /// Extra metadata entry (KEY=VALUE, VALUE parsed as JSON when possible).
        #[arg(short, long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,

        #[command(flatten)]
        export: ExportArgs,
    },

    /// Export every disk listed in a JSON disk spec file.
    Batch {
        /// JSON array of {"path", "type", "format", "metadata"} objects.
        spec: PathBuf,

        #[command(flatten)]
        export: ExportArgs,
    },

    /// Display the backing chain of a disk image.
    Info {
        /// Path to the image.
        source: String,
    },

    /// Check an exported image against its .hash and .metadata sidecars.
    Verify {
        /// Path to the exported (uncompressed) image.
        artifact: PathBuf,
    },
}

/// Compression format argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    /// xz with 16 MiB blocks (requires the xz binary).
    Xz,
    /// Multi-member gzip, compressed in-process.
    Gzip,
}

impl From<CompressionArg> for CompressionFormat {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Xz => CompressionFormat::Xz,
            CompressionArg::Gzip => CompressionFormat::Gzip,
        }
    }
}

/// Checksum algorithm argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChecksumArg {
    Sha1,
    Sha256,
}

impl From<ChecksumArg> for ChecksumAlgorithm {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Sha1 => ChecksumAlgorithm::Sha1,
            ChecksumArg::Sha256 => ChecksumAlgorithm::Sha256,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let base_config = ToolConfig::from_env();
    let config = cli.tools.apply(base_config);

    match cli.command {
        Commands::Export {
            source,
            disk_type,
            format,
            metadata_file,
            metadata,
            export,
        } => {
            let tools = SystemTools::new(config.with_compression(export.compression.into()));
            let disk = build_descriptor(
                &tools,
                &source,
                &disk_type,
                format,
                metadata_file.as_deref(),
                &metadata,
            )?;
            run_export(&tools, &disk, &export)?;
        }
        Commands::Batch { spec, export } => {
            let tools = SystemTools::new(config.with_compression(export.compression.into()));
            run_batch(&tools, &spec, &export)?;
        }
        Commands::Info { source } => {
            show_info(&SystemTools::new(config), &source)?;
        }
        Commands::Verify { artifact } => {
            run_verify(&SystemTools::new(config), &artifact)?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
fn init_logging(verbose: bool) {
    let default = if verbose { "diskexport=info" } else { "diskexport=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

impl ToolArgs {
    fn apply(&self, mut config: ToolConfig) -> ToolConfig {
        if let Some(path) = &self.qemu_img {
            config.qemu_img = path.clone();
        }
        if let Some(path) = &self.virt_sparsify {
            config.virt_sparsify = path.clone();
        }
        if let Some(path) = &self.xz {
            config.xz = path.clone();
        }
        config
    }
}

impl ExportArgs {
    fn options(&self) -> ExportOptions {
        ExportOptions::new(self.compress, self.standalone).with_checksum(self.checksum.into())
    }

    fn dest_dir(&self) -> PathBuf {
        PathBuf::from(expand_env(&self.output))
    }
}

fn build_descriptor(
    tools: &SystemTools,
    source: &str,
    disk_type: &str,
    format: Option<String>,
    metadata_file: Option<&Path>,
    entries: &[String],
) -> Result<DiskDescriptor> {
    let path = PathBuf::from(expand_env(source));
    let disk_type: DiskType = disk_type.parse()?;

    let format = match format {
        Some(format) => format,
        None => {
            let detected = tools
                .backing_chain(&path)
                .with_context(|| format!("detecting format of {}", path.display()))?
                .top()
                .format
                .clone();
            tracing::info!(format = %detected, "detected image format");
            detected
        }
    };

    let mut metadata = match metadata_file {
        Some(file) => read_metadata_file(file)?,
        None => Map::new(),
    };
    for entry in entries {
        let (key, value) = parse_metadata_entry(entry)?;
        metadata.insert(key, value);
    }

    Ok(DiskDescriptor::new(path, disk_type, format).with_metadata(metadata))
}

fn read_metadata_file(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading metadata file {}", path.display()))?;
    match serde_json::from_str(&content)
        .with_context(|| format!("parsing metadata file {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("metadata file {} must contain a JSON object", path.display()),
    }
}

/// Parse `KEY=VALUE`; the value is JSON if it parses, otherwise a string.
fn parse_metadata_entry(entry: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = entry.split_once('=') else {
        bail!("metadata entry '{entry}' is not of the form KEY=VALUE");
    };
    if key.is_empty() {
        bail!("metadata entry '{entry}' has an empty key");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn spinner(quiet: bool) -> Result<Option<ProgressBar>> {
    if quiet {
        return Ok(None);
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(Some(pb))
}

fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |progress: ExportProgress| {
        if progress.total_disks > 1 {
            pb.set_message(format!(
                "[{}/{}] {}: {}",
                progress.current_disk, progress.total_disks, progress.disk, progress.step
            ));
        } else {
            pb.set_message(format!("{}: {}", progress.disk, progress.step));
        }
    })
}

fn run_export(tools: &SystemTools, disk: &DiskDescriptor, args: &ExportArgs) -> Result<()> {
    let dest_dir = args.dest_dir();
    let options = args.options();

    if !args.quiet {
        println!("Disk Export");
        println!("-----------");
        println!("Source:    {}", disk.path.display());
        println!("Type:      {}", disk.disk_type);
        println!("Format:    {}", disk.format);
        println!("Output:    {}", dest_dir.display());
        if disk.disk_type == DiskType::Template {
            println!("Mode:      {}", if options.standalone { "standalone" } else { "layered" });
        }
        println!();
    }

    let pb = spinner(args.quiet)?;
    let mut exporter = DiskExporter::for_disk(disk, &dest_dir, &options, tools)
        .with_context(|| format!("preparing export of {}", disk.path.display()))?;
    if let Some(pb) = &pb {
        exporter = exporter.with_progress(progress_callback(pb));
    }

    let result = exporter.export();
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let exported = result.with_context(|| format!("exporting {}", disk.path.display()))?;

    if !args.quiet {
        print_summary(&exported);
    }
    Ok(())
}

fn run_batch(tools: &SystemTools, spec: &Path, args: &ExportArgs) -> Result<()> {
    let disks = load_disk_specs(spec)?
        .into_iter()
        .map(|spec| spec.into_descriptor())
        .collect::<diskexport_core::Result<Vec<_>>>()?;
    let dest_dir = args.dest_dir();

    let pb = spinner(args.quiet)?;
    let result = export_disks(
        &disks,
        &dest_dir,
        &args.options(),
        tools,
        pb.as_ref().map(progress_callback),
    );
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let exported = result.with_context(|| format!("exporting disks from {}", spec.display()))?;

    if !args.quiet {
        for disk in &exported {
            print_summary(disk);
            println!();
        }
        println!("Exported {} disk(s) to {}", exported.len(), dest_dir.display());
    }
    Ok(())
}

fn print_summary(exported: &ExportedDisk) {
    println!("Exported:  {}", exported.artifact.display());
    println!("Size:      {}", format_bytes(exported.size));
    println!("{:<10} {}", format!("{}:", exported.algorithm), exported.checksum);
    if let Some(compressed) = &exported.compressed {
        let size = std::fs::metadata(compressed).map(|m| m.len()).unwrap_or(0);
        println!(
            "Compressed: {} ({})",
            compressed.display(),
            format_bytes(size)
        );
    }
}

fn show_info(tools: &SystemTools, source: &str) -> Result<()> {
    let path = PathBuf::from(expand_env(source));
    let chain = tools
        .backing_chain(&path)
        .with_context(|| format!("inspecting {}", path.display()))?;

    println!("Image Information");
    println!("=================");
    println!();
    println!("Image:     {}", chain.top().filename);
    println!("Format:    {}", chain.top().format);
    println!("Size:      {}", format_bytes(chain.virtual_size()));
    println!("Layers:    {}", chain.len());
    println!();

    for (i, image) in chain.images().iter().enumerate() {
        let allocated = image
            .actual_size
            .map(format_bytes)
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {}. {} ({}, {} allocated)",
            i + 1,
            image.filename,
            image.format,
            allocated
        );
        if let Some(backing) = &image.backing_filename {
            println!("     backing file: {}", backing);
        }
    }

    if !chain.is_base() {
        let mode = if chain.len() > 2 {
            "standalone only"
        } else {
            "layered or standalone"
        };
        println!();
        println!("Template export: {}", mode);
    }

    Ok(())
}

fn run_verify(tools: &SystemTools, artifact: &Path) -> Result<()> {
    let report = verify_export(artifact, tools)
        .with_context(|| format!("verifying {}", artifact.display()))?;

    println!("Algorithm: {}", report.algorithm);
    println!("Recorded:  {}", report.hash_file_digest);
    println!("Actual:    {}", report.actual_digest);

    if !report.is_valid() {
        bail!("{} does not match its sidecars", artifact.display());
    }
    println!("OK");
    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
