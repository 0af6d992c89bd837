//! # tds - Tabular Data Stream Toolkit
//!
//! Command-line driver for the TDS engine. Each subcommand reads one or
//! more self-describing flat-text streams and writes a compatible stream,
//! so invocations compose into shell pipelines:
//!
//! ```bash
//! # Sort by a numeric column
//! tds sort -i grades.tds -n cid
//!
//! # Merge presorted files, bounded to four concurrent merges
//! tds merge --parallelism 4 -i 'runs/*.tds' cname
//!
//! # Join two presorted streams on cid
//! tds join -i enrolled.tds -i courses.tds -n cid
//!
//! # Count rows per event group
//! tds groupby -k event -C count
//! ```
//!
//! Errors print to stderr and exit non-zero; data only ever goes to the
//! selected output. `RUST_LOG` configures logging; repeated `-d` raises it.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tds_core::message::{pipe, PipeTx};
use tds_core::{
    set_default_pipe_capacity, KeySpec, Operator, Pipeline, Provenance, ReducerSpec, Source,
    TdsError,
};
use tds_io::{tmpfiles, FileSink, FileSource, StreamReader};
use tds_tx::{
    CatSource, Feed, GroupBy, Join, JoinType, MergeDriver, Removal, Sort, SpecFactory,
};

const MANUAL: &str = "\
tds - streaming relational toolkit for self-describing flat-text tables

Every stream starts with a header line such as

    #tds -F C cid cname

naming the field separator code (-F: D tab, S space, s spaces, t tab,
C comma, W whitespace; absent = whitespace in, tab out) and the columns.
Lines starting with '#' are comments and pass through every tool. The
empty-value token (default '-') renders null fields.

Key columns for sort, merge, and join are listed after the options and may
be interspersed with comparator flags: -n numeric, -N lexical (default),
-r descending, -R ascending (default). Flags apply to the columns that
follow them, so 'sort -n cid -N -r cname' sorts cid numerically ascending,
then cname lexically descending.

sort    buffers up to --max-rows rows per run, spills sorted runs under
        TMPDIR (or -T DIR), and merges them back with bounded parallelism.
merge   interleaves presorted, schema-compatible inputs; --xargs reads the
        file names from the input stream instead; --removeinputs deletes
        inputs as they are consumed.
join    sort-merge joins two presorted inputs (-S asserts sortedness;
        without it each side is sorted first). -t inner|outer, -a = outer,
        -e TOKEN sets the empty token for unmatched sides.
groupby runs a reducer (-C name[:column] or -f spec.yaml) over each group
        of equal values in -k KEY. -S asserts grouped input (twice: skip
        verification), -M hands the whole stream to one group-aware
        reducer, -K passes each group's key to the reducer factory.
cat     concatenates schema-compatible inputs.

Temp files are removed on exit, including on HUP, INT, and TERM.
";

#[derive(Parser, Debug)]
#[command(name = "tds")]
#[command(about = "Sort, merge, join, and group tabular data streams")]
#[command(version)]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short = 'd', action = ArgAction::Count, global = true)]
    debug: u8,

    /// Capacity of the pipes connecting pipeline stages
    #[arg(long, global = true)]
    pipe_capacity: Option<usize>,

    /// Suppress the provenance comment appended to the output
    #[arg(long, global = true)]
    nolog: bool,

    /// Start the pipeline as soon as it is built (default)
    #[arg(long, global = true, overrides_with = "noautorun")]
    autorun: bool,

    /// Build the pipeline first, then run it explicitly
    #[arg(long, global = true)]
    noautorun: bool,

    /// Print the extended manual and exit
    #[arg(long, global = true)]
    man: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sort a stream by a key (external sort; spills above --max-rows)
    Sort(SortArgs),
    /// Merge presorted, schema-compatible streams
    Merge(MergeArgs),
    /// Sort-merge join two streams on a key
    Join(JoinArgs),
    /// Run a reducer over each group of equal key values
    Groupby(GroupbyArgs),
    /// Concatenate schema-compatible streams
    Cat(CatArgs),
}

#[derive(Args, Debug)]
struct SortArgs {
    /// Input stream (- for stdin)
    #[arg(short, long, default_value = "-")]
    input: PathBuf,

    /// Output stream (- for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    /// Rows buffered in memory per sorted run
    #[arg(long, default_value_t = tds_tx::DEFAULT_RUN_ROWS)]
    max_rows: usize,

    /// Directory for spill files (overrides TMPDIR)
    #[arg(short = 'T', long)]
    tmpdir: Option<PathBuf>,

    /// Concurrent merges while combining spilled runs
    #[arg(long)]
    parallelism: Option<usize>,

    /// Stream the final merge levels through pipes (default)
    #[arg(long, overrides_with = "noendgame")]
    endgame: bool,

    /// Spill every merge level to disk
    #[arg(long)]
    noendgame: bool,

    /// Key columns, interspersable with -n/-N/-r/-R
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    keys: Vec<String>,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Input stream file or glob (repeatable)
    #[arg(short, long)]
    input: Vec<String>,

    /// Output stream (- for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    /// Read the file names to merge as rows of stdin
    #[arg(long)]
    xargs: bool,

    /// Delete each input file once fully merged
    #[arg(long)]
    removeinputs: bool,

    /// Directory for intermediate merge files (overrides TMPDIR)
    #[arg(short = 'T', long)]
    tmpdir: Option<PathBuf>,

    /// Concurrent two-way merges (default: CPU count)
    #[arg(long)]
    parallelism: Option<usize>,

    /// Stream the final merge levels through pipes (default)
    #[arg(long, overrides_with = "noendgame")]
    endgame: bool,

    /// Spill every merge level to disk
    #[arg(long)]
    noendgame: bool,

    /// Key columns, interspersable with -n/-N/-r/-R
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    keys: Vec<String>,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// The two input streams, left then right
    #[arg(short, long)]
    input: Vec<PathBuf>,

    /// Output stream (- for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    /// Full outer join (shorthand for -t outer)
    #[arg(short = 'a')]
    outer: bool,

    /// Join type: inner or outer
    #[arg(short = 't', long = "type", default_value = "inner")]
    join_type: String,

    /// Empty-value token for unmatched sides
    #[arg(short, long)]
    empty: Option<String>,

    /// Inputs are already sorted on the key
    #[arg(short = 'S', long)]
    presorted: bool,

    /// Key columns, interspersable with -n/-N/-r/-R
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    keys: Vec<String>,
}

#[derive(Args, Debug)]
struct GroupbyArgs {
    /// Input stream (- for stdin)
    #[arg(short, long, default_value = "-")]
    input: PathBuf,

    /// Output stream (- for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,

    /// Column whose equal values delimit the groups
    #[arg(short, long)]
    key: String,

    /// Input is already grouped; repeat to skip the contiguity check
    #[arg(short = 'S', action = ArgAction::Count)]
    presorted: u8,

    /// The reducer is group-aware: hand it the whole stream
    #[arg(short = 'M', long)]
    group_aware: bool,

    /// Pass each group's key value to the reducer factory
    #[arg(short = 'K', long)]
    pass_key: bool,

    /// Built-in reducer shorthand, e.g. count, sum:amount, mean:delay
    #[arg(short = 'C', long)]
    code: Option<String>,

    /// YAML reducer specification file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CatArgs {
    /// Input stream files, concatenated in order (two or more)
    #[arg(short, long)]
    input: Vec<PathBuf>,

    /// Output stream (- for stdout)
    #[arg(short, long, default_value = "-")]
    output: PathBuf,
}

fn init_tracing(debug: u8) {
    let filter = match debug {
        0 => EnvFilter::from_default_env(),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    // Data goes to stdout; logs must not.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The provenance comment text: the invocation as typed.
fn invocation() -> String {
    let args: Vec<String> = std::env::args().skip(1).collect();
    format!("tds {}", args.join(" "))
}

fn provenance(nolog: bool) -> Provenance {
    if nolog {
        Provenance::disabled(invocation())
    } else {
        Provenance::new(invocation())
    }
}

fn source_for(path: &PathBuf) -> Box<dyn Source> {
    if path.as_os_str() == "-" {
        Box::new(FileSource::stdin())
    } else {
        Box::new(FileSource::path(path))
    }
}

fn sink_for(path: &PathBuf) -> Box<FileSink> {
    if path.as_os_str() == "-" {
        Box::new(FileSink::stdout())
    } else {
        Box::new(FileSink::path(path))
    }
}

async fn run_pipeline(pipeline: Pipeline, autorun: bool) -> Result<(), TdsError> {
    if autorun {
        pipeline.spawn().join().await
    } else {
        pipeline.run().await
    }
}

/// Expand input patterns; every pattern must match something.
fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>, TdsError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let entries = glob::glob(pattern)
            .map_err(|e| TdsError::Config(format!("bad input pattern {pattern:?}: {e}")))?;
        let before = files.len();
        for entry in entries {
            let path = entry
                .map_err(|e| TdsError::Config(format!("cannot read {pattern:?}: {e}")))?;
            files.push(path);
        }
        if files.len() == before {
            return Err(TdsError::Config(format!("no files matched: {pattern}")));
        }
    }
    Ok(files)
}

/// Adapter running the merge driver as a pipeline source.
struct MergeSource {
    driver: Option<MergeDriver>,
    mode: Option<MergeMode>,
}

enum MergeMode {
    Files(Vec<PathBuf>, Removal),
    Xargs(PathBuf, Removal),
}

#[async_trait]
impl Operator for MergeSource {
    fn name(&self) -> &str {
        "merge"
    }
}

#[async_trait]
impl Source for MergeSource {
    async fn run(&mut self, tx: PipeTx, cancel: CancellationToken) -> Result<(), TdsError> {
        let driver = self
            .driver
            .take()
            .ok_or_else(|| TdsError::Config("merge source ran twice".into()))?;
        match self.mode.take() {
            Some(MergeMode::Files(files, removal)) => {
                driver.merge_files(files, removal, tx, cancel).await
            }
            Some(MergeMode::Xargs(names, removal)) => {
                let reader = if names.as_os_str() == "-" {
                    StreamReader::stdin()
                } else {
                    StreamReader::open(&names).await?
                };
                driver.merge_xargs(reader, removal, tx, cancel).await
            }
            None => Err(TdsError::Config("merge source ran twice".into())),
        }
    }
}

async fn cmd_sort(args: SortArgs, nolog: bool, autorun: bool) -> Result<(), TdsError> {
    if let Some(dir) = &args.tmpdir {
        tmpfiles::set_dir(dir);
    }
    let key = KeySpec::parse(&args.keys)?;
    let mut sort = Sort::new(key)
        .run_limit(args.max_rows)
        .endgame(args.endgame || !args.noendgame)
        .provenance(provenance(nolog));
    if let Some(parallelism) = args.parallelism {
        sort = sort.parallelism(parallelism);
    }
    let pipeline = Pipeline::new(source_for(&args.input), sink_for(&args.output))
        .filter(Box::new(sort));
    run_pipeline(pipeline, autorun).await
}

async fn cmd_merge(args: MergeArgs, nolog: bool, autorun: bool) -> Result<(), TdsError> {
    if let Some(dir) = &args.tmpdir {
        tmpfiles::set_dir(dir);
    }
    let key = KeySpec::parse(&args.keys)?;
    let mut driver = MergeDriver::new(key)
        .endgame(args.endgame || !args.noendgame)
        .provenance(provenance(nolog));
    if let Some(parallelism) = args.parallelism {
        driver = driver.parallelism(parallelism);
    }
    let removal = if args.removeinputs {
        Removal::Unlink
    } else {
        Removal::Keep
    };
    let mode = if args.xargs {
        let names = match args.input.len() {
            0 => PathBuf::from("-"),
            1 => PathBuf::from(&args.input[0]),
            n => {
                return Err(TdsError::Config(format!(
                    "--xargs takes one name stream, got {n}"
                )))
            }
        };
        MergeMode::Xargs(names, removal)
    } else {
        MergeMode::Files(expand_inputs(&args.input)?, removal)
    };
    let source = MergeSource {
        driver: Some(driver),
        mode: Some(mode),
    };
    let pipeline = Pipeline::new(Box::new(source), sink_for(&args.output));
    run_pipeline(pipeline, autorun).await
}

/// Open one join side: the file itself when presorted, otherwise the file
/// routed through a transparent sort on the join key.
async fn join_side(
    path: &PathBuf,
    key: &KeySpec,
    presorted: bool,
    cancel: &CancellationToken,
) -> Result<(Feed, Vec<tokio::task::JoinHandle<Result<(), TdsError>>>), TdsError> {
    if presorted {
        return Ok((Feed::open(path, Removal::Keep).await?, Vec::new()));
    }
    let (raw_tx, raw_rx) = pipe();
    let (sorted_tx, sorted_rx) = pipe();
    let mut source = source_for(path);
    let c1 = cancel.child_token();
    let read_task = tokio::spawn(async move { source.run(raw_tx, c1).await });
    let mut sort = Sort::new(key.clone()).provenance(Provenance::disabled("sort"));
    let c2 = cancel.child_token();
    let sort_task = tokio::spawn(async move {
        let mut raw_rx = raw_rx;
        use tds_core::Filter;
        sort.run(&mut raw_rx, sorted_tx, c2).await
    });
    Ok((Feed::pipe(sorted_rx), vec![read_task, sort_task]))
}

async fn cmd_join(args: JoinArgs, nolog: bool) -> Result<(), TdsError> {
    if args.input.len() != 2 {
        return Err(TdsError::Config(format!(
            "join takes exactly two inputs, got {}",
            args.input.len()
        )));
    }
    let key = KeySpec::parse(&args.keys)?;
    let join_type = if args.outer {
        JoinType::Outer
    } else {
        args.join_type.parse()?
    };
    let mut join = Join::new(key.clone(), join_type).provenance(provenance(nolog));
    if let Some(empty) = &args.empty {
        join = join.empty_token(empty.clone());
    }

    let cancel = CancellationToken::new();
    let (left, mut workers) = join_side(&args.input[0], &key, args.presorted, &cancel).await?;
    let (right, more) = join_side(&args.input[1], &key, args.presorted, &cancel).await?;
    workers.extend(more);

    let (out_tx, out_rx) = pipe();
    let mut sink = sink_for(&args.output);
    let c = cancel.child_token();
    let sink_task = tokio::spawn(async move {
        let mut out_rx = out_rx;
        use tds_core::Sink;
        sink.run(&mut out_rx, c).await
    });

    let join_result = join.run(left, right, out_tx, cancel.clone()).await;
    if join_result.is_err() {
        cancel.cancel();
    }

    // Downstream first, then the join itself, then the feeders: the most
    // causal error wins over broken-pipe fallout.
    let mut results = Vec::new();
    results.push(match sink_task.await {
        Ok(result) => result,
        Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
            "sink worker failed: {join_err}"
        ))),
    });
    results.push(join_result);
    for worker in workers {
        results.push(match worker.await {
            Ok(result) => result,
            Err(join_err) => Err(TdsError::Other(anyhow::anyhow!(
                "join feeder failed: {join_err}"
            ))),
        });
    }
    let mut fallback = None;
    for result in results {
        if let Err(err) = result {
            if !matches!(err, TdsError::PipeClosed(_)) {
                return Err(err);
            }
            if fallback.is_none() {
                fallback = Some(err);
            }
        }
    }
    match fallback {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn cmd_groupby(args: GroupbyArgs, nolog: bool, autorun: bool) -> Result<(), TdsError> {
    let spec = match (&args.code, &args.file) {
        (Some(code), None) => ReducerSpec::parse_code(code)?,
        (None, Some(file)) => {
            let text = std::fs::read_to_string(file)
                .map_err(|e| TdsError::resource(format!("read {}", file.display()), e))?;
            serde_yaml::from_str(&text)
                .map_err(|e| TdsError::Config(format!("bad reducer spec: {e}")))?
        }
        (None, None) => {
            return Err(TdsError::Config(
                "missing reducer: give -C CODE or -f FILE".into(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err(TdsError::Config("give either -C or -f, not both".into()))
        }
    };
    let mut groupby = GroupBy::new(args.key.clone(), Box::new(SpecFactory::new(spec)))
        .provenance(provenance(nolog));
    if args.group_aware {
        groupby = groupby.group_aware();
    }
    if args.pass_key {
        groupby = groupby.pass_key();
    }
    if args.presorted >= 2 {
        groupby = groupby.skip_verification();
    }

    let mut pipeline = Pipeline::new(source_for(&args.input), sink_for(&args.output));
    if args.presorted == 0 {
        // Unsorted input: transparently group it first.
        let sort = Sort::new(KeySpec::lexical(args.key.as_str()))
            .provenance(Provenance::disabled("sort"));
        pipeline = pipeline.filter(Box::new(sort));
    }
    let pipeline = pipeline.filter(Box::new(groupby));
    run_pipeline(pipeline, autorun).await
}

async fn cmd_cat(args: CatArgs, nolog: bool, autorun: bool) -> Result<(), TdsError> {
    let cat = CatSource::new(args.input.clone()).provenance(provenance(nolog));
    let pipeline = Pipeline::new(Box::new(cat), sink_for(&args.output));
    run_pipeline(pipeline, autorun).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.man {
        print!("{MANUAL}");
        return Ok(());
    }
    if let Some(capacity) = cli.pipe_capacity {
        set_default_pipe_capacity(capacity);
    }
    tmpfiles::install_signal_handlers();

    let autorun = cli.autorun || !cli.noautorun;
    let result = match cli.command {
        Some(Command::Sort(args)) => cmd_sort(args, cli.nolog, autorun).await,
        Some(Command::Merge(args)) => cmd_merge(args, cli.nolog, autorun).await,
        Some(Command::Join(args)) => cmd_join(args, cli.nolog).await,
        Some(Command::Groupby(args)) => cmd_groupby(args, cli.nolog, autorun).await,
        Some(Command::Cat(args)) => cmd_cat(args, cli.nolog, autorun).await,
        None => Err(TdsError::Config(
            "no subcommand given (try --help or --man)".into(),
        )),
    };

    tmpfiles::cleanup();
    result.map_err(Into::into)
}
