use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use sketch_lca::builder::{build_from_assignments, AccessionPolicy, BuildOptions, RootPolicy, DEFAULT_KSIZE, DEFAULT_SCALED};
use sketch_lca::classify::DEFAULT_THRESHOLD;
use sketch_lca::files::create_writer;
use sketch_lca::gather::write_match_lineages;
use sketch_lca::lca_db::{LcaDatabase, LcaManifest};
use sketch_lca::reconcile::{load_assignments, AmbiguousNames, DEFAULT_HEADER_TOLERANCE};
use sketch_lca::{
    build_database, classify_sketch_files, gather_to_lineage, load_databases, load_sketch_files, reconcile_spreadsheet,
    register_in_manifest, summarize_databases, write_rank_summary, Checkpoint, TaxonomySource,
};

#[derive(Parser, Debug)]
#[command(name = "sketch-lca", version, about = "LCA classification of k-mer sketches")]
struct Cli {
    /// Number of worker threads (0 = all cores).
    #[arg(short = 't', long, default_value_t = 0, global = true)]
    threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an LCA database from labeled genome sketches.
    Build(BuildArgs),
    /// Classify query sketches against one or more LCA databases.
    Classify(ClassifyArgs),
    /// Anchor a free-text lineage spreadsheet in the taxonomy.
    Reconcile(ReconcileArgs),
    /// Tabulate, per rank, how many hashes each database resolves there.
    Summarize(SummarizeArgs),
    /// Turn the matches of a gather CSV into a name,lineage CSV.
    Lineage(LineageArgs),
}

#[derive(Args, Debug)]
struct TaxonomyArgs {
    /// NCBI nodes.dmp (optionally .gz)
    #[arg(long, requires = "names", conflicts_with = "taxdb")]
    nodes: Option<PathBuf>,

    /// NCBI names.dmp (optionally .gz)
    #[arg(long, requires = "nodes")]
    names: Option<PathBuf>,

    /// Single-file taxDB (taxid, parent, name, rank)
    #[arg(long)]
    taxdb: Option<PathBuf>,
}

impl TaxonomyArgs {
    fn source(&self) -> Result<TaxonomySource, Box<dyn Error>> {
        match (&self.nodes, &self.names, &self.taxdb) {
            (Some(nodes), Some(names), None) => Ok(TaxonomySource::Dmp {
                nodes: nodes.clone(),
                names: names.clone(),
            }),
            (None, None, Some(taxdb)) => Ok(TaxonomySource::TaxDb(taxdb.clone())),
            _ => Err("give either --nodes and --names, or --taxdb".into()),
        }
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    taxonomy: TaxonomyArgs,

    /// accession,taxid,lineage CSV (optionally .gz)
    #[arg(long, required_unless_present = "assignments")]
    accessions: Option<PathBuf>,

    /// Reconciled lineage assignments; builds a multi-lineage database instead
    #[arg(long, conflicts_with = "accessions")]
    assignments: Option<PathBuf>,

    /// Signature files with the genome sketches
    #[arg(required_unless_present = "load_hashvals")]
    sketches: Vec<PathBuf>,

    #[arg(short = 'k', long, default_value_t = DEFAULT_KSIZE)]
    ksize: u32,

    #[arg(long, default_value_t = DEFAULT_SCALED)]
    scaled: u64,

    /// Keep hashes whose LCA is the root, with an empty lineage
    #[arg(long)]
    retain_root: bool,

    /// Fail on sketches whose accession is not in the table
    #[arg(long)]
    strict: bool,

    /// Save the hash -> taxa map to <output>.hashvals
    #[arg(short = 's', long, conflicts_with = "load_hashvals")]
    save_hashvals: bool,

    /// Start from <output>.hashvals instead of scanning sketches
    #[arg(short = 'l', long)]
    load_hashvals: bool,

    /// Register the database in this manifest (created if missing)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Output database (.json or .json.gz)
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Query signature files
    #[arg(required = true)]
    queries: Vec<PathBuf>,

    /// LCA database files
    #[arg(long = "db", required_unless_present = "manifest")]
    databases: Vec<PathBuf>,

    /// Manifest to take the ksize database from
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(short = 'k', long, default_value_t = DEFAULT_KSIZE)]
    ksize: u32,

    /// Minimum hashes for a lineage to count towards the consensus
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u32,

    /// Classification CSV (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Per-query abundance report
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    #[command(flatten)]
    taxonomy: TaxonomyArgs,

    /// identifier,superkingdom,...,species CSV
    spreadsheet: PathBuf,

    /// Resolve names shared by several taxa at one rank to the lowest taxid
    #[arg(long)]
    lowest_taxid: bool,

    #[arg(long, default_value_t = DEFAULT_HEADER_TOLERANCE)]
    header_tolerance: usize,

    /// Write clean assignments here
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    /// LCA database files
    databases: Vec<PathBuf>,

    /// Manifest to take databases from, one per entry of --ksize-list
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Comma-separated ksizes to summarize from the manifest
    #[arg(short = 'k', long, value_delimiter = ',', default_value = "31")]
    ksize_list: Vec<u32>,

    /// Summary CSV (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LineageArgs {
    #[command(flatten)]
    taxonomy: TaxonomyArgs,

    /// accession,taxid CSV (optionally .gz)
    #[arg(long)]
    accessions: PathBuf,

    /// Gather results with a `name` column
    gather_csv: PathBuf,

    /// name,lineage CSV (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn new_spinner(color: &str, msg: impl Into<String>) -> Result<ProgressBar, Box<dyn Error>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template(&format!("{{spinner:.{color}}} {{msg}}"))?,
    );
    spinner.set_message(msg.into());
    Ok(spinner)
}

fn output_writer(path: Option<&PathBuf>) -> Result<Box<dyn Write>, Box<dyn Error>> {
    Ok(match path {
        Some(path) => create_writer(path)?,
        None => Box::new(std::io::stdout()),
    })
}

fn run_build(args: BuildArgs) -> Result<(), Box<dyn Error>> {
    let (db, stats) = match &args.assignments {
        Some(path) => {
            let spinner = new_spinner("green", "Building multi-lineage database...")?;
            let assignments = load_assignments(path)?;
            let sketches = load_sketch_files(&args.sketches, args.ksize)?;
            let built = build_from_assignments(&sketches, &assignments, args.ksize, args.scaled)?;
            spinner.finish_with_message(format!("Indexed {} hashvals.", built.0.len()));
            built
        }
        None => {
            let spinner = new_spinner("blue", "Loading taxonomy...")?;
            let taxonomy = args.taxonomy.source()?.load()?;
            spinner.finish_with_message(format!("Loaded {} taxa.", taxonomy.len()));

            let spinner = new_spinner("green", "Building LCA database...")?;
            let options = BuildOptions {
                ksize: args.ksize,
                scaled: args.scaled,
                root_policy: if args.retain_root { RootPolicy::Retain } else { RootPolicy::Drop },
                accession_policy: if args.strict { AccessionPolicy::Strict } else { AccessionPolicy::Lenient },
            };
            let mut hashvals = args.output.clone().into_os_string();
            hashvals.push(".hashvals");
            let checkpoint = if args.load_hashvals {
                Checkpoint::Load(hashvals.into())
            } else if args.save_hashvals {
                Checkpoint::Save(hashvals.into())
            } else {
                Checkpoint::Off
            };
            let accessions = args.accessions.as_ref().ok_or("--accessions is required")?;
            let built = build_database(&taxonomy, accessions, &args.sketches, options, &checkpoint)?;
            spinner.finish_with_message(format!("Indexed {} hashvals.", built.0.len()));
            built
        }
    };
    log::info!(
        "{} sketches added, {} skipped, {} hashvals at root, {} root-equivalent, {} empty",
        stats.sketches_added,
        stats.sketches_skipped,
        stats.collapsed_to_root,
        stats.root_equivalent,
        stats.empty_sets
    );

    db.save(&args.output)?;
    if let Some(manifest) = &args.manifest {
        match &args.taxonomy.source()? {
            TaxonomySource::Dmp { nodes, names } => {
                register_in_manifest(manifest, &db, &args.output, nodes, names)?
            }
            TaxonomySource::TaxDb(_) => return Err("a manifest needs --nodes and --names".into()),
        }
    }
    Ok(())
}

fn run_classify(args: ClassifyArgs) -> Result<(), Box<dyn Error>> {
    let spinner = new_spinner("blue", "Loading LCA databases...")?;
    let databases = match &args.manifest {
        Some(manifest) => {
            let mut dbs = load_databases(&args.databases)?;
            dbs.push(LcaManifest::load(manifest)?.get_database(args.ksize)?.1);
            dbs
        }
        None => load_databases(&args.databases)?,
    };
    spinner.finish_with_message(format!("Loaded {} database(s).", databases.len()));

    let spinner = new_spinner("green", "Classifying sketches...")?;
    let results = classify_sketch_files(&databases, &args.queries, args.ksize, args.threshold, args.report.is_some())?;
    spinner.finish_with_message(format!(
        "Classified {} of {} queries.",
        results.summary.classified,
        results.summary.total()
    ));

    let mut out = output_writer(args.output.as_ref())?;
    out.write_all(results.get_classification_csv()?.as_bytes())?;
    out.flush()?;

    if let (Some(path), Some(report)) = (&args.report, results.get_report()) {
        fs::write(path, report)?;
    }
    Ok(())
}

fn run_reconcile(args: ReconcileArgs) -> Result<(), Box<dyn Error>> {
    let spinner = new_spinner("blue", "Loading taxonomy...")?;
    let taxonomy = args.taxonomy.source()?.load()?;
    spinner.finish_with_message(format!("Loaded {} taxa.", taxonomy.len()));

    let ambiguous = if args.lowest_taxid {
        AmbiguousNames::LowestTaxid
    } else {
        AmbiguousNames::Unresolved
    };
    let report = reconcile_spreadsheet(&taxonomy, &args.spreadsheet, ambiguous, args.header_tolerance)?;
    print!("{}", report.render());
    println!("{} weird lineages; ignoring for now.", report.n_weird());

    if let Some(output) = &args.output {
        report.save_assignments(output)?;
    }
    Ok(())
}

fn run_summarize(args: SummarizeArgs) -> Result<(), Box<dyn Error>> {
    let mut databases: Vec<LcaDatabase> = load_databases(&args.databases)?;
    if let Some(manifest) = &args.manifest {
        let manifest = LcaManifest::load(manifest)?;
        for &ksize in &args.ksize_list {
            databases.push(manifest.get_database(ksize)?.1);
        }
    }
    if databases.is_empty() {
        return Err("no databases given".into());
    }

    let summary = summarize_databases(&databases);
    let mut out = output_writer(args.output.as_ref())?;
    write_rank_summary(&mut out, &summary)?;
    Ok(())
}

fn run_lineage(args: LineageArgs) -> Result<(), Box<dyn Error>> {
    let spinner = new_spinner("blue", "Loading taxonomy...")?;
    let taxonomy = args.taxonomy.source()?.load()?;
    spinner.finish_with_message(format!("Loaded {} taxa.", taxonomy.len()));

    let matches = gather_to_lineage(&taxonomy, &args.accessions, &args.gather_csv)?;
    let out = output_writer(args.output.as_ref())?;
    let written = write_match_lineages(out, &matches)?;
    log::info!("{} of {} matches resolved to a lineage", written, matches.len());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new().num_threads(cli.threads).build_global()?;
    }

    match cli.command {
        Command::Build(args) => run_build(args),
        Command::Classify(args) => run_classify(args),
        Command::Reconcile(args) => run_reconcile(args),
        Command::Summarize(args) => run_summarize(args),
        Command::Lineage(args) => run_lineage(args),
    }
}
