mod config;
mod prompt;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, ModelKind};
use prompt::PromptPolicy;
use signet_core::evaluate::evaluate;
use signet_core::onnx::{OnnxEmbedder, OnnxPairScorer};
use signet_core::pairs::{PairConfig, PairSynthesizer};
use signet_core::{
    dataset, AddOutcome, AlwaysReplace, AlwaysSkip, DuplicatePolicy, EmbeddingScorer, GalleryStore,
    IdentityId, ImageSource, Preprocessor, RetryingScorer, Scorer, Verifier,
};
use signet_store::SqliteGallery;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "signet", version, about = "Signet handwritten signature verification CLI")]
struct Cli {
    /// TOML configuration file (default: $SIGNET_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Gallery database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage enrolled identities
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
    /// Enroll reference signatures for an identity
    Enroll {
        /// Identity id
        identity: i64,
        /// Signature image files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// What to do when identical bytes are already enrolled
        #[arg(long, value_enum, default_value_t = OnDuplicate::Prompt)]
        on_duplicate: OnDuplicate,
    },
    /// List enrolled references of an identity
    References {
        /// Identity id
        identity: i64,
    },
    /// Remove one enrolled reference
    Unenroll {
        /// Identity id
        identity: i64,
        /// Reference id, as shown by `references`
        reference_id: i64,
    },
    /// Verify a probe signature against an identity's references
    Verify {
        /// Identity id
        identity: i64,
        /// Probe signature image
        probe: PathBuf,
        /// Accept when the best score is strictly above this
        #[arg(long)]
        threshold: Option<f32>,
        /// ONNX model file (default: configured model_path)
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, value_enum)]
        model_kind: Option<ModelKind>,
        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },
    /// Synthesize labeled training pairs from genuine/forged folders
    Pairs {
        /// Root with one folder of genuine signatures per identity
        #[arg(long)]
        genuine: PathBuf,
        /// Root with one `<identity><suffix>` folder of forgeries per identity
        #[arg(long)]
        forged: PathBuf,
        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,
        /// Seed for forged-partner selection
        #[arg(long)]
        sampling_seed: Option<u64>,
        /// Forged folder suffix (default: "_forged")
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long, default_value_t = 1)]
        negatives_per_genuine: usize,
        /// Write the pair set as JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Score synthesized pairs with a model and report precision, recall and F1
    Evaluate {
        /// Root with one folder of genuine signatures per identity
        #[arg(long)]
        genuine: PathBuf,
        /// Root with one `<identity><suffix>` folder of forgeries per identity
        #[arg(long)]
        forged: PathBuf,
        /// ONNX model file (default: configured model_path)
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, value_enum)]
        model_kind: Option<ModelKind>,
        /// Predict genuine when the score is strictly above this
        #[arg(long)]
        threshold: Option<f32>,
        /// Pair seed (default: configured pair_seed)
        #[arg(long)]
        seed: Option<u64>,
        /// Forged folder suffix (default: "_forged")
        #[arg(long)]
        suffix: Option<String>,
        /// Print the evaluation as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dataset housekeeping
    Dataset {
        #[command(subcommand)]
        action: DatasetCommand,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Add an identity
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// List identities
    List,
    /// Remove an identity and all of its references
    Remove {
        /// Identity id
        id: i64,
    },
}

#[derive(Subcommand)]
enum DatasetCommand {
    /// Count files per identity folder
    Count { root: PathBuf },
    /// Report file names that occur more than once (case-insensitive)
    Dupes { root: PathBuf },
    /// Report images that fail to decode
    Check { root: PathBuf },
    /// Convert TIFF images to PNG, mirroring the directory layout
    Convert { input: PathBuf, output: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnDuplicate {
    /// Ask on the terminal
    Prompt,
    Replace,
    Skip,
}

const EXIT_REJECTED: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Commands::User { action } => user(&config, action)?,
        Commands::Enroll {
            identity,
            files,
            on_duplicate,
        } => enroll(&config, IdentityId(identity), &files, on_duplicate)?,
        Commands::References { identity } => {
            let gallery = open_gallery(&config)?;
            let references = gallery.list_references(IdentityId(identity))?;
            if references.is_empty() {
                println!("No references enrolled for identity {identity}");
            }
            for r in references {
                println!("{}\t{} bytes\t{}", r.id, r.image.len(), r.enrolled_at.to_rfc3339());
            }
        }
        Commands::Unenroll {
            identity,
            reference_id,
        } => {
            let mut gallery = open_gallery(&config)?;
            gallery.remove_reference(IdentityId(identity), reference_id)?;
            println!("Removed reference {reference_id} from identity {identity}");
        }
        Commands::Verify {
            identity,
            probe,
            threshold,
            model,
            model_kind,
            json,
        } => {
            let model = model.or_else(|| config.model_path.clone());
            let kind = model_kind.unwrap_or(config.model_kind);
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            return verify(&config, IdentityId(identity), &probe, model, kind, threshold, json);
        }
        Commands::Pairs {
            genuine,
            forged,
            seed,
            sampling_seed,
            suffix,
            negatives_per_genuine,
            output,
        } => {
            let pair_config = PairConfig {
                forged_suffix: suffix.unwrap_or_else(|| config.forged_suffix.clone()),
                negatives_per_genuine,
                seed: seed.unwrap_or(config.pair_seed),
                sampling_seed: sampling_seed.unwrap_or(config.pair_seed),
            };
            pairs(pair_config, &genuine, &forged, output.as_deref())?;
        }
        Commands::Evaluate {
            genuine,
            forged,
            model,
            model_kind,
            threshold,
            seed,
            suffix,
            json,
        } => {
            let seed = seed.unwrap_or(config.pair_seed);
            let pair_config = PairConfig {
                forged_suffix: suffix.unwrap_or_else(|| config.forged_suffix.clone()),
                seed,
                sampling_seed: seed,
                ..PairConfig::default()
            };
            let model = model.or_else(|| config.model_path.clone());
            let kind = model_kind.unwrap_or(config.model_kind);
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            evaluate_pairs(&config, pair_config, &genuine, &forged, model, kind, threshold, json)?;
        }
        Commands::Dataset { action } => dataset_command(action)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn open_gallery(config: &Config) -> Result<SqliteGallery> {
    SqliteGallery::open(&config.db_path)
        .with_context(|| format!("failed to open gallery at {}", config.db_path.display()))
}

fn user(config: &Config, action: UserCommand) -> Result<()> {
    let mut gallery = open_gallery(config)?;
    match action {
        UserCommand::Add { name, email } => {
            let id = gallery.add_identity(&name, &email)?;
            println!("Added identity {id}: {name} <{email}>");
        }
        UserCommand::List => {
            let identities = gallery.list_identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!("{}\t{}\t{}", identity.id, identity.name, identity.email);
            }
        }
        UserCommand::Remove { id } => {
            gallery.remove_identity(IdentityId(id))?;
            println!("Removed identity {id}");
        }
    }
    Ok(())
}

fn enroll(config: &Config, identity: IdentityId, files: &[PathBuf], on_duplicate: OnDuplicate) -> Result<()> {
    let mut gallery = open_gallery(config)?;
    let preprocessor = Preprocessor::default();

    let mut policy: Box<dyn DuplicatePolicy> = match on_duplicate {
        OnDuplicate::Prompt => Box::new(PromptPolicy::new(std::io::stdin().lock(), std::io::stderr())),
        OnDuplicate::Replace => Box::new(AlwaysReplace),
        OnDuplicate::Skip => Box::new(AlwaysSkip),
    };

    for file in files {
        let bytes = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        preprocessor
            .preprocess_bytes(&bytes)
            .with_context(|| format!("{} is not a readable image", file.display()))?;

        match gallery.add_reference(identity, &bytes, policy.as_mut())? {
            AddOutcome::Inserted { id } => println!("{}: enrolled as reference {id}", file.display()),
            AddOutcome::Replaced { removed, inserted } => println!(
                "{}: replaced reference {removed} with reference {inserted}",
                file.display()
            ),
            AddOutcome::Skipped { existing } => {
                println!("{}: already enrolled as reference {existing}, skipped", file.display())
            }
        }
    }
    Ok(())
}

fn load_scorer(model: &Path, kind: ModelKind, retry_transient: bool) -> Result<Box<dyn Scorer>> {
    let path = model.to_string_lossy();
    let scorer: Box<dyn Scorer> = match kind {
        ModelKind::Pair => Box::new(OnnxPairScorer::load(&path)?),
        ModelKind::Embedding => Box::new(EmbeddingScorer::new(OnnxEmbedder::load(&path)?)),
    };
    Ok(if retry_transient {
        Box::new(RetryingScorer::new(scorer))
    } else {
        scorer
    })
}

fn verify(
    config: &Config,
    identity: IdentityId,
    probe: &Path,
    model: Option<PathBuf>,
    kind: ModelKind,
    threshold: f32,
    json: bool,
) -> Result<ExitCode> {
    let model = model.context("no signature model configured (use --model or SIGNET_MODEL_PATH)")?;
    let scorer = load_scorer(&model, kind, config.retry_transient)
        .with_context(|| format!("failed to load model {}", model.display()))?;

    let mut verifier = Verifier::new(scorer, open_gallery(config)?);
    if let Some(budget) = config.verify_timeout() {
        verifier = verifier.with_timeout(budget);
    }

    let decision = verifier.verify(&ImageSource::FromPath(probe.to_path_buf()), identity, threshold)?;
    tracing::info!(
        identity = %identity,
        score = decision.max_score,
        accepted = decision.accepted,
        "verification finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        println!(
            "{}: score {:.4} (threshold {:.4}, best reference {}, {} scored, {} skipped)",
            if decision.accepted { "ACCEPTED" } else { "REJECTED" },
            decision.max_score,
            decision.threshold,
            decision.best_reference,
            decision.scored,
            decision.skipped,
        );
    }

    Ok(if decision.accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REJECTED)
    })
}

fn pairs(pair_config: PairConfig, genuine: &Path, forged: &Path, output: Option<&Path>) -> Result<()> {
    let set = PairSynthesizer::new(pair_config)?.synthesize(genuine, forged)?;
    let counts = set.counts();
    let json = serde_json::to_string_pretty(&set)?;

    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "Wrote {} pairs ({} genuine, {} forged) to {}",
                set.len(),
                counts.positive,
                counts.negative,
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn evaluate_pairs(
    config: &Config,
    pair_config: PairConfig,
    genuine: &Path,
    forged: &Path,
    model: Option<PathBuf>,
    kind: ModelKind,
    threshold: f32,
    json: bool,
) -> Result<()> {
    let model = model.context("no signature model configured (use --model or SIGNET_MODEL_PATH)")?;
    let set = PairSynthesizer::new(pair_config)?.synthesize(genuine, forged)?;
    let mut scorer = load_scorer(&model, kind, config.retry_transient)
        .with_context(|| format!("failed to load model {}", model.display()))?;

    let evaluation = evaluate(&mut scorer, &Preprocessor::default(), &set, threshold)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
    } else {
        println!("{evaluation}");
    }
    Ok(())
}

fn dataset_command(action: DatasetCommand) -> Result<()> {
    match action {
        DatasetCommand::Count { root } => {
            for (folder, count) in dataset::count_images(&root)? {
                println!("{folder}\t{count}");
            }
        }
        DatasetCommand::Dupes { root } => {
            let dupes = dataset::find_duplicate_names(&root)?;
            if dupes.is_empty() {
                println!("No duplicate file names");
            }
            for dupe in dupes {
                println!("{}", dupe.name);
                for path in dupe.paths {
                    println!("  {}", path.display());
                }
            }
        }
        DatasetCommand::Check { root } => {
            let corrupt = dataset::check_images(&root)?;
            if corrupt.is_empty() {
                println!("All images decode");
            }
            for image in corrupt {
                println!("{}\t{}", image.path.display(), image.message);
            }
        }
        DatasetCommand::Convert { input, output } => {
            let report = dataset::convert_tiff_to_png(&input, &output)?;
            println!(
                "Converted {} images, {} failed",
                report.converted.len(),
                report.failed.len()
            );
            for failed in report.failed {
                println!("  {}\t{}", failed.path.display(), failed.message);
            }
        }
    }
    Ok(())
}
