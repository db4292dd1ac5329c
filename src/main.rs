use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use taskpaper::filter::filter_document;
use taskpaper::projectors::logbook_projector::archive_done_text;
use taskpaper::projectors::timeline_projector::produce_timeline;
use taskpaper::{format_document, parse_document};

#[derive(Debug, Parser)]
#[command(
    name = "taskpaper",
    about = "TaskPaper tooling built on the taskpaper crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a TaskPaper file and print its structure.
    Parse(ParseArgs),

    /// Group open due items into a date-bucketed timeline.
    Timeline(TimelineArgs),

    /// Move completed items into a logbook file.
    Archive(ArchiveArgs),

    /// List items matching a tag expression.
    Filter(FilterArgs),

    /// Reorder tags and write the normalized serialization.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// TaskPaper files or directories containing TaskPaper files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TimelineArgs {
    /// The todo file to build the timeline from.
    input: PathBuf,
    /// Reference date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Write the timeline to this path instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// The todo file to archive completed items from.
    input: PathBuf,
    /// The logbook file to file them into (created when missing).
    #[arg(long)]
    logbook: PathBuf,
    /// Completion date for `@done` tags without a value. Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// The file to search.
    input: PathBuf,
    /// Tag expression, e.g. "(@done and not @work) or @home o:-due".
    expression: String,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// TaskPaper files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, verbose),
        Commands::Timeline(args) => handle_timeline(args, verbose),
        Commands::Archive(args) => handle_archive(args, verbose),
        Commands::Filter(args) => handle_filter(args, verbose),
        Commands::Format(args) => handle_format(args, verbose),
    }
}

fn handle_parse(args: ParseArgs, verbose: bool) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no TaskPaper files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        if verbose {
            eprintln!("Parsing {:?}", path);
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        parsed.push((path, parse_document(&text)));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a taskpaper::core::Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, doc)| JsonOutput {
                path: path.display().to_string(),
                document: doc,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_timeline(args: TimelineArgs, verbose: bool) -> Result<()> {
    let TimelineArgs {
        input,
        date,
        output,
    } = args;

    let text = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    if verbose {
        eprintln!("Building timeline for {:?} as of {}", input, date);
    }

    let timeline =
        produce_timeline(&text, date).with_context(|| format!("building timeline for {:?}", input))?;

    match output {
        Some(path) => {
            fs::write(&path, timeline.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
            println!("Wrote timeline to {:?}", path);
        }
        None => print!("{timeline}"),
    }
    Ok(())
}

fn handle_archive(args: ArchiveArgs, verbose: bool) -> Result<()> {
    let ArchiveArgs {
        input,
        logbook,
        date,
    } = args;

    let active_text =
        fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    let logbook_text = if logbook.exists() {
        fs::read_to_string(&logbook).with_context(|| format!("reading {:?}", logbook))?
    } else {
        if verbose {
            eprintln!("Logbook {:?} does not exist yet; starting empty", logbook);
        }
        String::new()
    };
    let date = date.unwrap_or_else(|| Local::now().date_naive());

    let (new_active, new_logbook) = archive_done_text(&active_text, &logbook_text, date)
        .with_context(|| format!("archiving {:?}", input))?;

    fs::write(&input, new_active.as_bytes()).with_context(|| format!("writing {:?}", input))?;
    fs::write(&logbook, new_logbook.as_bytes())
        .with_context(|| format!("writing {:?}", logbook))?;
    println!(
        "Archived completed items from {:?} into {:?}",
        input, logbook
    );
    Ok(())
}

fn handle_filter(args: FilterArgs, verbose: bool) -> Result<()> {
    let FilterArgs { input, expression } = args;

    let text = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    if verbose {
        eprintln!("Filtering {:?} with {:?}", input, expression);
    }
    let doc = parse_document(&text);
    let matches = filter_document(&doc, &expression)
        .with_context(|| format!("evaluating filter {:?}", expression))?;

    let stem = input.with_extension("");
    for id in matches {
        let item = doc.item(id);
        println!(
            "{}|{:>4}|{}",
            stem.display(),
            item.line_number.unwrap_or(0),
            item.line_text()
        );
    }
    Ok(())
}

fn handle_format(args: FormatArgs, verbose: bool) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no TaskPaper files found in the provided inputs");
    }

    let mut first = true;
    for path in expanded {
        if verbose {
            eprintln!("Formatting {:?}", path);
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let mut doc = parse_document(&text);
        doc.reorder_tags();
        let formatted = format_document(&doc);

        if in_place {
            fs::write(&path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

fn expand_inputs(paths: &[PathBuf], verbose: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            if verbose {
                eprintln!("Scanning directory {:?}", canonical);
            }
            for file in collect_taskpaper_files(&canonical, verbose)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if is_taskpaper_file(&canonical) {
                if verbose {
                    eprintln!("Adding file {:?}", canonical);
                }
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not a .taskpaper file", canonical);
            }
        }
    }
    Ok(out)
}

fn collect_taskpaper_files(dir: &Path, verbose: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited, verbose)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        if verbose {
            eprintln!("Visiting directory {:?}", canonical);
        }
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited, verbose)?;
        }
    } else if metadata.is_file() && is_taskpaper_file(&canonical) {
        if verbose {
            eprintln!("Found TaskPaper file {:?}", canonical);
        }
        out.push(canonical);
    }
    Ok(())
}

fn is_taskpaper_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "taskpaper").unwrap_or(false)
}
