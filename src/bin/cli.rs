//! Binary entry point for the balfs command-line tool.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;
#[path = "cli/ui.rs"]
mod ui;

use std::error::Error;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use balfs::{
    admin::{
        dump_block, dump_tree, open_fs, stats, verify, BlockDetail, BlockDump, StatsReport,
        VerifyLevel, VerifyReport, VerifySeverity,
    },
    storage::StatData,
    Filesystem, FormatOptions, FsOptions, ObjectRef,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::CliConfig;
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "balfs",
    version,
    about = "Create, inspect and edit balanced-tree filesystem images",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "BALFS_IMAGE",
        value_name = "FILE",
        help = "Image file to operate on (defaults to [image] default in the config)"
    )]
    image: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "BALFS_CONFIG",
        value_name = "FILE",
        help = "CLI config file"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto, help = "Color theme")]
    theme: Theme,

    #[arg(long, global = true, help = "Plain output without icons or headings")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Override block cache size (blocks)")]
    cache_blocks: Option<usize>,

    #[arg(
        long,
        global = true,
        value_name = "BYTES",
        help = "Largest file kept in tail items"
    )]
    tail_limit: Option<usize>,

    #[arg(long, global = true, help = "Check every tree node when mounting")]
    verify_on_read: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create and format a new image")]
    Mkfs {
        #[arg(long, help = "Block size in bytes (512..=32768, power of two)")]
        block_size: Option<usize>,

        #[arg(long, help = "Number of blocks in the image")]
        blocks: Option<u32>,

        #[arg(long, help = "Journal blocks including the header")]
        journal_blocks: Option<u32>,

        #[arg(long, help = "Volume label (up to 16 bytes)")]
        label: Option<String>,

        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },

    #[command(about = "Verify on-disk structures")]
    Verify {
        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Full,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },

    #[command(about = "Print geometry, space and tree statistics")]
    Stats,

    #[command(about = "Decode one block, or every tree node")]
    Dump {
        #[arg(long, value_name = "N", help = "Block to decode; omit to dump the tree")]
        block: Option<u32>,
    },

    #[command(about = "List a directory")]
    Ls {
        #[arg(value_name = "PATH", default_value = "/")]
        path: String,
    },

    #[command(about = "Write a file's contents to stdout")]
    Cat {
        #[arg(value_name = "PATH")]
        path: String,
    },

    #[command(about = "Store a host file (or stdin) at PATH, replacing its contents")]
    Put {
        #[arg(value_name = "PATH")]
        path: String,

        #[arg(long, value_name = "FILE", help = "Read from FILE instead of stdin")]
        from: Option<PathBuf>,

        #[arg(long, help = "Append instead of replacing")]
        append: bool,
    },

    #[command(about = "Create a directory")]
    Mkdir {
        #[arg(value_name = "PATH")]
        path: String,
    },

    #[command(about = "Remove a file or an empty directory")]
    Rm {
        #[arg(value_name = "PATH")]
        path: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BALFS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    if let Some(path) = config.path() {
        debug!(config = %path.display(), "cli.config");
    }
    let ui = Ui::new(cli.theme, cli.quiet);
    let image = resolve_image(cli.image.clone(), &config)?;
    let mount = build_mount_options(&cli.open, &config);

    match cli.command {
        Command::Mkfs {
            block_size,
            blocks,
            journal_blocks,
            label,
            force,
        } => {
            let mut opts = config.format_options();
            if let Some(block_size) = block_size {
                opts.block_size = block_size;
            }
            if let Some(blocks) = blocks {
                opts.block_count = blocks;
            }
            if journal_blocks.is_some() {
                opts.journal_blocks = journal_blocks;
            }
            if let Some(label) = label {
                opts.label = label;
            }
            run_mkfs(&ui, &cli.format, &image, &opts, force)?;
        }
        Command::Verify { level } => {
            let report = verify(&image, level.into())?;
            emit(&cli.format, &report, |_| print_verify_text(&ui, &report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Stats => {
            let report = stats(&image)?;
            emit(&cli.format, &report, |_| print_stats_text(&ui, &report))?;
        }
        Command::Dump { block } => {
            let dumps = match block {
                Some(block) => vec![dump_block(&image, block)?],
                None => dump_tree(&image)?,
            };
            emit(&cli.format, &dumps, |_| print_dump_text(&ui, &dumps))?;
        }
        Command::Ls { path } => {
            let fs = open_fs(&image, &mount)?;
            let rows = list_dir(&fs, &path)?;
            fs.close()?;
            emit(&cli.format, &rows, |_| print_ls_text(&ui, &rows))?;
        }
        Command::Cat { path } => {
            let fs = open_fs(&image, &mount)?;
            let obj = fs.resolve(&path)?;
            let body = fs.read(obj)?;
            fs.close()?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
        }
        Command::Put { path, from, append } => {
            let data = match from {
                Some(file) => std::fs::read(&file)?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().lock().read_to_end(&mut buf)?;
                    buf
                }
            };
            let fs = open_fs(&image, &mount)?;
            let (parent, name) = split_parent(&fs, &path)?;
            let obj = match fs.lookup(parent, name.as_bytes()) {
                Ok(obj) => obj,
                Err(balfs::FsError::NotFound) => fs.create(parent, name.as_bytes())?,
                Err(err) => return Err(err.into()),
            };
            if append {
                fs.append(obj, &data)?;
            } else {
                fs.write_all(obj, &data)?;
            }
            let size = fs.stat(obj)?.size;
            fs.close()?;
            ui.success(&format!("{path}: {size} bytes"));
        }
        Command::Mkdir { path } => {
            let fs = open_fs(&image, &mount)?;
            let (parent, name) = split_parent(&fs, &path)?;
            fs.mkdir(parent, name.as_bytes())?;
            fs.close()?;
            ui.success(&format!("created directory {path}"));
        }
        Command::Rm { path } => {
            let fs = open_fs(&image, &mount)?;
            let (parent, name) = split_parent(&fs, &path)?;
            let target = fs.lookup(parent, name.as_bytes())?;
            if fs.stat(target)?.is_dir() {
                fs.rmdir(parent, name.as_bytes())?;
            } else {
                fs.unlink(parent, name.as_bytes())?;
            }
            fs.close()?;
            ui.success(&format!("removed {path}"));
        }
    }

    Ok(())
}

fn resolve_image(flag: Option<PathBuf>, config: &CliConfig) -> Result<PathBuf, Box<dyn Error>> {
    flag.or_else(|| config.default_image().cloned())
        .ok_or_else(|| "no image given; pass --image or set [image] default in the config".into())
}

fn build_mount_options(args: &OpenArgs, config: &CliConfig) -> FsOptions {
    let mut opts = config.mount_options();
    if let Some(cache_blocks) = args.cache_blocks {
        opts.cache_blocks = cache_blocks;
    }
    if args.tail_limit.is_some() {
        opts.tail_limit = args.tail_limit;
    }
    if args.verify_on_read {
        opts.verify_on_read = true;
    }
    opts
}

fn run_mkfs(
    ui: &Ui,
    format: &OutputFormat,
    image: &Path,
    opts: &FormatOptions,
    force: bool,
) -> Result<(), Box<dyn Error>> {
    if image.exists() && !force {
        return Err(format!("{} already exists; pass --force to overwrite", image.display()).into());
    }
    if force && image.exists() {
        std::fs::remove_file(image)?;
    }
    let sb = Filesystem::create_image(image, opts)?;
    emit(format, &sb, |_| {
        ui.success(&format!(
            "formatted {} ({} blocks of {} bytes)",
            image.display(),
            sb.block_count,
            sb.block_size
        ));
        ui.section(
            "Layout",
            [
                ("superblock", sb.location().0.to_string()),
                ("bitmaps", sb.bmap_nr.to_string()),
                ("journal", format!("{}+{}", sb.journal_start, sb.journal_blocks)),
                ("root", sb.root_block.to_string()),
                ("free", sb.free_blocks.to_string()),
                ("label", sb.label()),
            ],
        );
    })
}

/// Splits `path` into its resolved parent directory and final name.
fn split_parent<'p>(fs: &Filesystem, path: &'p str) -> Result<(ObjectRef, &'p str), Box<dyn Error>> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(format!("{path}: not a usable file name").into());
    }
    Ok((fs.resolve(parent)?, name))
}

#[derive(Serialize)]
struct LsRow {
    name: String,
    object: ObjectRef,
    kind: &'static str,
    size: u64,
    nlink: u32,
}

fn list_dir(fs: &Filesystem, path: &str) -> Result<Vec<LsRow>, Box<dyn Error>> {
    let dir = fs.resolve(path)?;
    let mut rows = Vec::new();
    for entry in fs.readdir(dir)? {
        let sd: StatData = fs.stat(entry.object)?;
        rows.push(LsRow {
            name: entry.name_lossy(),
            object: entry.object,
            kind: if sd.is_dir() { "dir" } else { "file" },
            size: sd.size,
            nlink: sd.nlink,
        });
    }
    Ok(rows)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_verify_text(ui: &Ui, report: &VerifyReport) {
    let counts = &report.counts;
    ui.section(
        &format!("Verify ({:?})", report.level),
        [
            ("nodes", counts.nodes.to_string()),
            ("leaves", counts.leaves.to_string()),
            ("items", counts.items.to_string()),
            ("files", counts.files.to_string()),
            ("directories", counts.directories.to_string()),
            ("entries", counts.entries.to_string()),
            ("data blocks", counts.data_blocks.to_string()),
            ("free blocks", counts.free_blocks.to_string()),
            ("unreachable", counts.unreachable_blocks.to_string()),
        ],
    );
    for finding in &report.findings {
        match finding.severity {
            VerifySeverity::Info => ui.info(&finding.message),
            VerifySeverity::Warning => ui.warn(&finding.message),
            VerifySeverity::Error => ui.fail(&finding.message),
        }
    }
    if report.success {
        ui.success("no structural errors");
    } else {
        ui.fail("verification failed");
    }
}

fn print_stats_text(ui: &Ui, report: &StatsReport) {
    let image = &report.image;
    ui.section(
        "Image",
        [
            ("path", image.path.clone()),
            ("size", image.size_bytes.to_string()),
            ("label", image.label.clone()),
            ("uuid", image.uuid.clone()),
            ("block size", image.block_size.to_string()),
            ("blocks", image.block_count.to_string()),
            ("clean", image.clean.to_string()),
        ],
    );
    ui.spacer();
    ui.section(
        "Space",
        [
            ("free", report.space.free_blocks.to_string()),
            ("used", report.space.used_blocks.to_string()),
            ("bitmap blocks", report.space.bitmap_blocks.to_string()),
            ("next object id", report.space.next_objectid.to_string()),
        ],
    );
    ui.spacer();
    ui.section(
        "Tree",
        [
            ("root", report.tree.root_block.to_string()),
            ("height", report.tree.height.to_string()),
            ("internal nodes", report.tree.internal_nodes.to_string()),
            ("leaves", report.tree.leaves.to_string()),
            ("items", report.tree.items.to_string()),
            ("leaf bytes", report.tree.leaf_bytes_used.to_string()),
        ],
    );
    ui.spacer();
    let journal = &report.journal;
    ui.section(
        "Journal",
        [
            ("start", journal.start.to_string()),
            ("blocks", journal.blocks.to_string()),
            ("max batch", journal.max_batch.to_string()),
            ("max age", format!("{}s", journal.max_age_secs)),
            (
                "last flushed",
                journal
                    .last_flushed
                    .map_or_else(|| "unreadable".to_string(), |id| id.to_string()),
            ),
        ],
    );
}

fn print_dump_text(ui: &Ui, dumps: &[BlockDump]) {
    for dump in dumps {
        let title = format!("block {} ({}, crc {:08x})", dump.block, dump.kind, dump.crc32);
        match &dump.detail {
            BlockDetail::Leaf {
                rdkey,
                free_space,
                items,
            } => ui.list(
                &format!("{title} free={free_space} rdkey={rdkey}"),
                items.iter().map(|item| {
                    format!("{} len={} {}", item.key, item.len, item.summary)
                }),
            ),
            BlockDetail::Internal {
                level,
                rdkey,
                keys,
                children,
            } => {
                let mut rows = Vec::with_capacity(children.len());
                for (i, (child, size)) in children.iter().enumerate() {
                    rows.push(format!("-> {child} ({size} bytes)"));
                    if let Some(key) = keys.get(i) {
                        rows.push(key.clone());
                    }
                }
                ui.list(&format!("{title} level={level} rdkey={rdkey}"), rows);
            }
            other => ui.list(
                &title,
                [serde_json::to_string(other).unwrap_or_else(|err| err.to_string())],
            ),
        }
    }
}

fn print_ls_text(ui: &Ui, rows: &[LsRow]) {
    if rows.is_empty() {
        ui.info("empty directory");
        return;
    }
    for row in rows {
        let suffix = if row.kind == "dir" { "/" } else { "" };
        println!(
            "{:>10} {:>3} {}{suffix}",
            row.size, row.nlink, row.name
        );
    }
}
