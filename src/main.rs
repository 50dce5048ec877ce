mod cmd;
mod envconfig;
mod format;
mod progress;

use clap::{Parser, Subcommand, ValueEnum};
use cmd::{CorpusArgs, ModelArgs, SpecialArgs};
use envconfig::EnvConfig;
use nmt_convert::{CorpusLayout, StorageFormat};
use progress::Progress;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nmt-convert")]
#[command(version = "0.5.0")]
#[command(about = "Prepare models, vocabularies and corpora for the translation engine", long_about = None)]
struct Cli {
    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    Compact,
    WithSpecials,
}

impl From<LayoutArg> for CorpusLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Compact => CorpusLayout::Compact,
            LayoutArg::WithSpecials => CorpusLayout::WithSpecials,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a checkpoint into a model file
    Model {
        /// Checkpoint weights (.safetensors)
        weights: PathBuf,
        /// Training arguments (JSON)
        args: PathBuf,
        output: PathBuf,
        #[arg(short, long)]
        format: Option<StorageFormat>,
        /// Parameter order as a name list; defaults to the weights file's metadata
        #[arg(long)]
        order: Option<PathBuf>,
        /// Also write the checkpoint's tensor names and shapes here
        #[arg(long)]
        names: Option<PathBuf>,
        #[command(flatten)]
        specials: SpecialArgs,
    },
    /// Change the storage format of a model file
    Format {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        from: StorageFormat,
        #[arg(long)]
        to: StorageFormat,
    },
    /// Average several model files of identical shape
    Ensemble {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        format: Option<StorageFormat>,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Assign ids to a word list
    Vocab {
        input: PathBuf,
        output: PathBuf,
        /// Keep sizes that are already a multiple of 8
        #[arg(long)]
        round_up: bool,
        #[command(flatten)]
        specials: SpecialArgs,
    },
    /// Binarize a parallel corpus
    Corpus {
        #[arg(long)]
        src_vocab: PathBuf,
        #[arg(long)]
        tgt_vocab: PathBuf,
        src: PathBuf,
        tgt: PathBuf,
        output: PathBuf,
        #[arg(long)]
        max_src_len: Option<usize>,
        #[arg(long)]
        max_tgt_len: Option<usize>,
        #[arg(long, value_enum, default_value = "compact")]
        layout: LayoutArg,
        #[command(flatten)]
        specials: SpecialArgs,
    },
    /// Print the header of a model file
    Inspect {
        model: PathBuf,
        #[arg(short, long)]
        format: Option<StorageFormat>,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let env = EnvConfig::from_env();
    let mut progress = Progress::new(!cli.quiet && std::io::stderr().is_terminal());

    let result = match cli.command {
        Commands::Model {
            weights,
            args,
            output,
            format,
            order,
            names,
            specials,
        } => cmd::model(
            ModelArgs {
                weights: &weights,
                args: &args,
                output: &output,
                format,
                order: order.as_deref(),
                names: names.as_deref(),
                specials,
            },
            &env,
            &mut progress,
        ),
        Commands::Format { input, output, from, to } => cmd::format(&input, &output, from, to, &mut progress),
        Commands::Ensemble { output, format, inputs } => {
            cmd::ensemble_models(&inputs, &output, format, &env, &mut progress)
        }
        Commands::Vocab {
            input,
            output,
            round_up,
            specials,
        } => cmd::vocab(&input, &output, round_up, specials, &env),
        Commands::Corpus {
            src_vocab,
            tgt_vocab,
            src,
            tgt,
            output,
            max_src_len,
            max_tgt_len,
            layout,
            specials,
        } => cmd::corpus(
            CorpusArgs {
                src_vocab: &src_vocab,
                tgt_vocab: &tgt_vocab,
                src: &src,
                tgt: &tgt,
                output: &output,
                max_src_len,
                max_tgt_len,
                layout: layout.into(),
                specials,
            },
            &env,
            &mut progress,
        ),
        Commands::Inspect { model, format } => cmd::inspect(&model, format, &env),
    };

    if let Err(e) = result {
        progress.stop_and_clear();
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
