use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, Level};

use kwirk_atlas::compressed::FrameGroup;
use kwirk_atlas::config::Config;
use kwirk_atlas::disk::FileNames;
use kwirk_atlas::kwirk::Kwirk;
use kwirk_atlas::maze::{Maze, SAMPLE_LEVEL};
use kwirk_atlas::problem::Problem;
use kwirk_atlas::search::{Outcome, Session};
use kwirk_atlas::trace;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProblemKind {
    Maze,
    Kwirk,
}

#[derive(Debug, Parser)]
#[command(name = "kwirk-atlas")]
#[command(about = "External-memory breadth-first solver for Kwirk-like tile puzzles")]
struct Cli {
    #[arg(
        short = 'v',
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v = debug, -vv = trace)"
    )]
    verbose: u8,

    #[arg(long, global = true, default_value = ".", help = "Working directory for node files")]
    dir: PathBuf,

    #[arg(long, global = true, value_enum, default_value = "maze", help = "Puzzle rule set")]
    problem: ProblemKind,

    #[arg(long, global = true, help = "Level file (the maze has a built-in default)")]
    level: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = "1000",
        help = "Step bound used to size the frame space"
    )]
    max_steps: u32,

    #[arg(long, global = true, help = "Maintain a consolidated union of closed files")]
    use_all: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sort, filter and expand open nodes; start fresh when none exist.
    Search { max_group: Option<FrameGroup> },
    /// Print every state of a frame group, open or closed.
    Dump { group: FrameGroup },
    /// Print one random state of a frame group, open or closed.
    Sample { group: FrameGroup },
    /// Count duplicates between two sorted node files.
    Compare { file1: String, file2: String },
    /// Convert legacy per-frame files to frame-group files.
    Convert {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Split frame-group closed files back into per-frame files.
    Unpack {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Print per-frame node counts of closed frame-group files.
    Count {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Check one node file for sortedness and duplicates.
    Verify { file: String },
    /// Deduplicate open files chunk by chunk (single read/write pass).
    PackOpen {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Fully sort and deduplicate open files, newest first.
    SortOpen {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Filter all open files against closed files, in place.
    FilterOpen,
    /// Sort and filter open files one group at a time.
    SeqFilterOpen {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Re-expand closed files to regenerate missing open files.
    RegenerateOpen {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Build the consolidated all-file from closed files.
    CreateAll,
    /// Scan node files for finish states and trace the first hit.
    FindExit {
        #[arg(num_args = 0..=2)]
        range: Vec<FrameGroup>,
    },
    /// Render the partial exit trace checkpoint as a solution file.
    WritePartialSolution,
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn parse_range(range: &[FrameGroup], max_groups: FrameGroup) -> Result<(FrameGroup, FrameGroup)> {
    match range {
        [] => Ok((0, max_groups)),
        [only] => Ok((*only, only + 1)),
        [first, max] => Ok((*first, (*max).min(max_groups))),
        _ => bail!("too many range arguments"),
    }
}

fn load_level(cli: &Cli, default_name: &str) -> Result<(String, String)> {
    match &cli.level {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading level {}", path.display()))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| default_name.to_string());
            Ok((name, text))
        }
        None => Ok((default_name.to_string(), SAMPLE_LEVEL.to_string())),
    }
}

fn dispatch<P: Problem>(problem: P, cli: &Cli, cfg: Config) -> Result<Outcome> {
    let names = FileNames::new(cli.dir.clone(), problem.name().to_string());
    let session = Session::new(problem, cfg, names);

    let stop = session.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::Relaxed);
    })
    .context("installing ctrl-c handler")?;

    match &cli.command {
        Commands::Search { max_group } => session.search(*max_group),
        Commands::Dump { group } => session.dump(*group),
        Commands::Sample { group } => session.sample(*group),
        Commands::Compare { file1, file2 } => session.compare(file1, file2),
        Commands::Convert { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.convert(first, max)
        }
        Commands::Unpack { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.unpack(first, max)
        }
        Commands::Count { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.count(first, max)
        }
        Commands::Verify { file } => session.verify(file),
        Commands::PackOpen { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.pack_open(first, max)
        }
        Commands::SortOpen { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.sort_open(first, max)
        }
        Commands::FilterOpen => {
            session.filter_open()?;
            Ok(Outcome::Ok)
        }
        Commands::SeqFilterOpen { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.seq_filter_open(first, max)
        }
        Commands::RegenerateOpen { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.regenerate_open(first, max)
        }
        Commands::CreateAll => session.create_all(),
        Commands::FindExit { range } => {
            let (first, max) = parse_range(range, session.max_groups)?;
            session.find_exit(first, max)
        }
        Commands::WritePartialSolution => {
            trace::write_partial_solution(&session)?;
            Ok(Outcome::Ok)
        }
    }
}

fn run(cli: &Cli) -> Result<Outcome> {
    let mut cfg = Config::from_env();
    if cli.use_all {
        cfg.use_all = true;
    }

    match cli.problem {
        ProblemKind::Maze => {
            let (name, text) = load_level(cli, "maze")?;
            dispatch(Maze::parse(name, &text)?, cli, cfg)
        }
        ProblemKind::Kwirk => {
            if cli.level.is_none() {
                bail!("--problem kwirk needs --level");
            }
            let (name, text) = load_level(cli, "kwirk")?;
            dispatch(Kwirk::parse(name, &text, cli.max_steps)?, cli, cfg)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(&cli) {
        Ok(Outcome::Ok) => ExitCode::from(0),
        Ok(Outcome::Stop) => ExitCode::from(1),
        Ok(Outcome::NotFound) => ExitCode::from(2),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(3)
        }
    }
}
