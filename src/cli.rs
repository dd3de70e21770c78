use crate::snvmeth::{
    clustering::Linkage,
    distance::{DistanceMetric, NanStrategy},
};
use clap::{ArgAction, ArgGroup, Parser, Subcommand, ValueEnum};
use log::{Level, LevelFilter};
use owo_colors::{
    colors::{Blue, Green, Magenta, Red, Yellow},
    OwoColorize, Stream, Style,
};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

pub const FULL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name="snvmeth",
          version=FULL_VERSION,
          about="Read-level CpG methylation analysis around somatic SNVs",
          long_about = None,
          disable_help_subcommand = true,
          help_template = "{name} {version}\n{about-section}\n{usage-heading}\n    {usage}\n\n{all-args}{after-help}",
          )]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Enable or disable color output in logging
    #[arg(long, value_enum, default_value_t = Color::Auto, global = true, help_heading = "Advanced")]
    color: Color,

    /// Specify multiple times to increase verbosity level (e.g., -vv for more verbosity)
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true
    )]
    pub verbosity: u8,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Per-SNV methylation matrix, distance and clustering analysis")]
    Analyze(AnalyzeArgs),
    #[clap(about = "Cut an emitted Newick tree into flat clusters")]
    Cut(CutArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Analyze(_) => "analyze",
            Command::Cut(_) => "cut",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(group(ArgGroup::new("analyze")))]
#[command(arg_required_else_help(true))]
pub struct AnalyzeArgs {
    /// BAM file with aligned tumor reads (indexed, with MM/ML tags)
    #[arg(short = 't', long = "tumor-bam", value_name = "BAM", required = true)]
    pub tumor_bam: PathBuf,

    /// BAM file with aligned normal reads (optional)
    #[arg(short = 'n', long = "normal-bam", value_name = "BAM")]
    pub normal_bam: Option<PathBuf>,

    /// Path to reference genome FASTA
    #[arg(short = 'g', long = "reference", value_name = "FASTA", required = true)]
    pub genome_path: PathBuf,

    /// Somatic variants: VCF/BCF, or TSV with 'chr pos ref alt [qual]' columns
    #[arg(short = 's', long = "variants", value_name = "VARIANTS", required = true)]
    pub variants_path: PathBuf,

    /// Output directory for per-region results
    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "DIR",
        default_value = "output",
        value_parser = check_prefix_path
    )]
    pub output_dir: PathBuf,

    /// Window radius around each SNV in bp
    #[arg(
        short = 'w',
        long = "window-size",
        value_name = "BP",
        default_value = "1000"
    )]
    pub window_size: i64,

    /// Number of threads
    #[arg(
        long = "threads",
        value_name = "THREADS",
        default_value = "1",
        value_parser = threads_in_range
    )]
    pub num_threads: usize,

    /// Minimum mapping quality to keep a read
    #[arg(
        long = "min-mapq",
        value_name = "MAPQ",
        default_value = "20",
        help_heading = "Filtering"
    )]
    pub min_mapq: u8,

    /// Minimum aligned read length in bp
    #[arg(
        long = "min-read-length",
        value_name = "BP",
        default_value = "1000",
        help_heading = "Filtering"
    )]
    pub min_read_length: usize,

    /// Minimum base quality at the SNV position
    #[arg(
        long = "min-base-quality",
        value_name = "QUAL",
        default_value = "20",
        help_heading = "Filtering"
    )]
    pub min_base_quality: u8,

    /// Probability at or above which a CpG call is binarized as methylated
    #[arg(
        long = "methyl-high",
        value_name = "PROB",
        default_value = "0.8",
        value_parser = ensure_unit_float,
        help_heading = "Methylation"
    )]
    pub methyl_high: f64,

    /// Probability at or below which a CpG call is binarized as unmethylated
    #[arg(
        long = "methyl-low",
        value_name = "PROB",
        default_value = "0.2",
        value_parser = ensure_unit_float,
        help_heading = "Methylation"
    )]
    pub methyl_low: f64,

    /// Minimum number of CpG sites shared by a read pair for a valid distance
    #[arg(
        long = "min-common-coverage",
        value_name = "SITES",
        default_value = "3",
        help_heading = "Distance"
    )]
    pub min_common_coverage: usize,

    /// Distance metrics to compute (comma-separated); the first drives clustering
    #[arg(
        long = "metrics",
        value_name = "METRICS",
        value_enum,
        value_delimiter = ',',
        default_value = "nhd",
        help_heading = "Distance"
    )]
    pub metrics: Vec<DistanceMetric>,

    /// What to store for read pairs with insufficient common coverage
    #[arg(
        long = "nan-strategy",
        value_name = "STRATEGY",
        value_enum,
        default_value_t = NanStrategy::MaxDist,
        help_heading = "Distance"
    )]
    pub nan_strategy: NanStrategy,

    /// Distance substituted for invalid pairs under the max-dist strategy
    #[arg(
        long = "max-distance-value",
        value_name = "DIST",
        default_value = "1.0",
        help_heading = "Distance"
    )]
    pub max_distance_value: f64,

    /// Linkage method for hierarchical clustering
    #[arg(
        long = "linkage",
        value_name = "LINKAGE",
        value_enum,
        default_value_t = Linkage::Upgma,
        help_heading = "Clustering"
    )]
    pub linkage: Linkage,

    /// Minimum number of reads in a region to build a clustering tree
    #[arg(
        long = "clustering-min-reads",
        value_name = "READS",
        default_value = "10",
        help_heading = "Clustering"
    )]
    pub clustering_min_reads: usize,

    /// Minimum branch length used to keep merge heights strictly increasing
    #[arg(
        long = "min-branch-length",
        value_name = "LEN",
        default_value = "1e-6",
        help_heading = "Clustering",
        hide = true
    )]
    pub min_branch_length: f64,

    /// Directory for debug outputs [default: <output-dir>/debug]
    #[arg(long = "debug-output-dir", value_name = "DIR", help_heading = "Advanced")]
    pub debug_output_dir: Option<PathBuf>,

    /// Write filtered-out reads with their filter reasons per region
    #[arg(long = "output-filtered-reads", help_heading = "Advanced")]
    pub output_filtered_reads: bool,

    /// Output all reads without filtering (filter verification mode)
    #[arg(long = "no-filter-verification", help_heading = "Advanced")]
    pub no_filter_verification: bool,

    /// Skip strand-specific matrices and trees
    #[arg(long = "no-strand-matrices", help_heading = "Advanced")]
    pub no_strand_matrices: bool,

    /// Skip hierarchical clustering entirely
    #[arg(long = "no-clustering", help_heading = "Advanced")]
    pub no_clustering: bool,

    /// Compute the correlation distance without mean-centering
    #[arg(long = "pearson-uncentered", help_heading = "Advanced", hide = true)]
    pub pearson_uncentered: bool,

    /// Count concordant unmethylated sites in the Jaccard distance
    #[arg(long = "jaccard-include-unmeth", help_heading = "Advanced", hide = true)]
    pub jaccard_include_unmeth: bool,

    /// Process only the first N variants (0 = all)
    #[arg(
        long = "max-regions",
        value_name = "N",
        default_value = "0",
        help_heading = "Advanced",
        hide = true
    )]
    pub max_regions: usize,

    /// Number of threads for decompressing input BAM files
    #[arg(
        long = "decompression-threads",
        value_name = "THREADS",
        default_value = "1",
        value_parser = threads_in_range,
        help_heading = "Advanced",
        hide = true
    )]
    pub decompression_threads: usize,
}

impl AnalyzeArgs {
    pub fn preflight(&self) -> crate::utils::Result<()> {
        check_file_exists(&self.tumor_bam)?;
        if let Some(normal) = &self.normal_bam {
            check_file_exists(normal)?;
        }
        check_file_exists(&self.genome_path)?;
        check_file_exists(&self.variants_path)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(group(
    ArgGroup::new("cutpoint")
        .required(true)
        .args(["distance", "num_clusters"]),
))]
#[command(arg_required_else_help(true))]
pub struct CutArgs {
    /// Newick tree file produced by 'snvmeth analyze'
    #[arg(short = 'i', long = "tree", value_name = "NEWICK", required = true)]
    pub tree_path: PathBuf,

    /// Cut at this merge distance
    #[arg(short = 'd', long = "distance", value_name = "DIST")]
    pub distance: Option<f64>,

    /// Cut into this many clusters
    #[arg(short = 'k', long = "num-clusters", value_name = "K")]
    pub num_clusters: Option<usize>,

    /// Write cluster assignments to a file [standard output]
    #[arg(
        short = 'o',
        long = "output",
        value_name = "FILE",
        value_parser = check_prefix_path
    )]
    pub output: Option<PathBuf>,
}

impl CutArgs {
    pub fn preflight(&self) -> crate::utils::Result<()> {
        check_file_exists(&self.tree_path)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Color {
    Always,
    Auto,
    Never,
}

impl Color {
    fn apply(self) {
        match self {
            Color::Always => owo_colors::set_override(true),
            Color::Auto => {}
            Color::Never => owo_colors::set_override(false),
        }
    }
}

pub fn init_verbose(args: &Cli) {
    args.color.apply();

    let filter_level: LevelFilter = match args.verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .format(format_log)
        .filter_level(filter_level)
        .init();
}

#[inline(always)]
fn level_style(level: Level) -> (&'static str, Style) {
    match level {
        Level::Error => ("ERROR", Style::new().fg::<Red>().bold()),
        Level::Warn => ("WARN", Style::new().fg::<Yellow>()),
        Level::Info => ("INFO", Style::new().fg::<Green>()),
        Level::Debug => ("DEBUG", Style::new().fg::<Blue>()),
        Level::Trace => ("TRACE", Style::new().fg::<Magenta>()),
    }
}

fn format_log(buf: &mut env_logger::fmt::Formatter, record: &log::Record) -> std::io::Result<()> {
    let (label, style) = level_style(record.level());
    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let painted_label = label.if_supports_color(Stream::Stderr, |t| style.style(t));
    writeln!(buf, "{ts} [{}] - {}", painted_label, record.args())
}

fn check_prefix_path(s: &str) -> crate::utils::Result<PathBuf> {
    let path = Path::new(s);
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
            return Err(format!("Path does not exist: {}", parent_dir.display()));
        }
    }
    Ok(PathBuf::from(s))
}

fn threads_in_range(s: &str) -> crate::utils::Result<usize> {
    let thread: usize = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid thread number", s))?;
    if thread >= 1 {
        Ok(thread)
    } else {
        Err("Number of threads must be at least 1".into())
    }
}

fn check_file_exists(path: &Path) -> crate::utils::Result<()> {
    if !path.exists() {
        Err(format!("File does not exist: {}", path.display()))
    } else {
        Ok(())
    }
}

fn ensure_unit_float(s: &str) -> crate::utils::Result<f64> {
    let value = s
        .parse::<f64>()
        .map_err(|e| format!("Could not parse float: {}", e))?;
    if !(0.0..=1.0).contains(&value) {
        Err(format!(
            "The value must be between 0.0 and 1.0, got: {}",
            value
        ))
    } else {
        Ok(value)
    }
}
