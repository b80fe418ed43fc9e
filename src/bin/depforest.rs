extern crate depforest;

use anyhow::{bail, Context};
use clap::Parser;
use depforest::common::{decanonicalize, path_to_string, LookupError};
use depforest::query::DEFAULT_MAX_DEPTH;
use depforest::system::WindowsSystem;
use depforest::{analyze_files, BatchSettings, OutputFormat};
use fs_err as fs;
use std::path::{Path, PathBuf};

/// Most executables taken from a single directory given as input
const MAX_FILES_PER_DIRECTORY: usize = 256;

#[derive(Parser, Debug)]
#[command(
    name = "depforest",
    version,
    about = "Recursive DLL dependency trees for Windows executables"
)]
struct Args {
    /// Target files (.exe or .dll), or directories containing them
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Maximum recursion depth
    #[arg(short = 'd', long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Do not look into the dependencies of DLLs found in the system directories
    #[arg(long)]
    skip_system: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write the output to this file instead of the standard output
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Windows partition to use for system DLLs lookup (default: the running system on Windows,
    /// otherwise the partition where each INPUT lies, if valid)
    #[arg(short = 'w', long)]
    windows_root: Option<PathBuf>,

    /// Additional directories to search after the PATH, separated by ';'
    #[arg(short = 'a', long)]
    userpath: Option<String>,

    /// Print the deduced lookup settings
    ///
    /// Per-module resolution details (such as why a DLL was not expanded) are emitted as
    /// `tracing` events, which only show up in applications that install a tracing subscriber.
    #[arg(short, long)]
    verbose: bool,
}

/// Executables directly inside the directory, sorted by path
fn executables_in_dir(dir: &Path) -> Result<Vec<PathBuf>, LookupError> {
    let options = glob::MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };
    let dir_pattern = glob::Pattern::escape(&path_to_string(dir));
    let mut found = Vec::new();
    for ext in ["exe", "dll"] {
        let pattern = format!("{}/*.{}", dir_pattern, ext);
        let paths = glob::glob_with(&pattern, options)
            .map_err(|e| LookupError::ScanError(format!("{}: {}", dir.display(), e)))?;
        found.extend(paths.filter_map(Result::ok).filter(|p| p.is_file()));
    }
    found.sort();
    if found.len() > MAX_FILES_PER_DIRECTORY {
        eprintln!(
            "{} contains more than {} executables, only the first ones will be analyzed",
            dir.display(),
            MAX_FILES_PER_DIRECTORY
        );
        found.truncate(MAX_FILES_PER_DIRECTORY);
    }
    Ok(found)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut inputs = Vec::new();
    for input in &args.inputs {
        if input.is_dir() {
            inputs.extend(executables_in_dir(input)?);
        } else {
            // missing files are reported along with the other analysis errors
            inputs.push(input.clone());
        }
    }
    if inputs.is_empty() {
        bail!("No executable files found in the given inputs");
    }

    let mut settings = BatchSettings::default();
    settings.parameters.max_depth = args.max_depth;
    settings.parameters.skip_system_modules = args.skip_system;

    if let Some(root) = &args.windows_root {
        settings.system = Some(WindowsSystem::from_root(root).with_context(|| {
            format!("{} does not contain a Windows installation", root.display())
        })?);
    }

    if let Some(userpath) = &args.userpath {
        for entry in userpath.split(';').filter(|s| !s.is_empty()) {
            let p = Path::new(entry);
            if p.exists() {
                settings.user_path.push(fs::canonicalize(p)?);
            } else {
                eprintln!("Skipping non-existing path entry {}", entry);
            }
        }
    }

    if args.verbose {
        match &settings.system {
            Some(system) => eprintln!(
                "System directory: {}",
                decanonicalize(&path_to_string(&system.sys_dir))
            ),
            None => eprintln!("Windows partition root not specified, deduced for each input"),
        }
        let user_path: Vec<String> = settings
            .user_path
            .iter()
            .map(|p| decanonicalize(&path_to_string(p)))
            .collect();
        eprintln!("User path: {}", user_path.join(", "));
        eprintln!("Analyzing {} file(s)\n", inputs.len());
    }

    let outcome = analyze_files(&inputs, &settings);

    for e in &outcome.errors {
        eprintln!("{}", e);
    }

    let rendered = match outcome.report.files.as_slice() {
        [] => return Ok(()),
        [single] if inputs.len() == 1 => args.format.render_tree(&single.tree)?,
        _ => args.format.render_report(&outcome.report)?,
    };

    match &args.output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("couldn't write to {}", path.display()))?;
            if args.verbose {
                eprintln!("successfully wrote to {}", path.display());
            }
        }
        None => print!("{}", rendered),
    }

    Ok(())
}
