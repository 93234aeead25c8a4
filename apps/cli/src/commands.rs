//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use neuramemory_core::gemini::{GeminiClient, load_classifier_prompt, parse_classification};
use neuramemory_core::resolver::build_project_pool;
use neuramemory_core::{
    FactPlan, FactStore, IngestOutcome, MemoryManager, SystemClock, forget_fact, load_profile,
    plan_fact,
};
use neuramemory_shared::{
    AppConfig, ClassificationResult, FactUpdate, MemoryFact, MemoryType, RecalledMemory,
    expand_home, init_config, load_config, validate_api_key,
};
use neuramemory_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// NeuraMemory: remember what users tell you, and file it under the right project.
#[derive(Parser)]
#[command(
    name = "neuramemory",
    version,
    about = "Classify conversation turns into long-term facts and recall them by meaning.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `storage.database_path`).
    #[arg(long, global = true, env = "NEURAMEMORY_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Classify a message with the LLM and store whatever is worth keeping.
    Remember {
        /// User the memory belongs to.
        #[arg(short, long)]
        user: String,

        /// The user's message.
        message: String,
    },

    /// Store a message using a classification produced elsewhere.
    Ingest {
        /// User the memory belongs to.
        #[arg(short, long)]
        user: String,

        /// The user's message.
        #[arg(short, long)]
        message: String,

        /// Classification JSON file, or `-` for stdin.
        #[arg(short, long)]
        classification: String,
    },

    /// Show how a classification would be keyed and filed, without writing.
    Resolve {
        /// User whose projects are matched against (none: match against nothing).
        #[arg(short, long)]
        user: Option<String>,

        /// Classification JSON file, or `-` for stdin.
        #[arg(short, long)]
        classification: String,
    },

    /// Print a user's profile.
    Profile {
        /// User to show.
        #[arg(short, long)]
        user: String,
    },

    /// Recall memories semantically related to a query.
    Recall {
        /// User to search.
        #[arg(short, long)]
        user: String,

        /// Free-text query.
        query: String,
    },

    /// List a user's stored facts, newest first.
    List {
        /// User to list.
        #[arg(short, long)]
        user: String,

        /// Only this category (personal, preference, project, project_milestone).
        #[arg(short, long)]
        category: Option<MemoryType>,

        /// Maximum number of facts.
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Delete a fact and the embeddings derived from it.
    Forget {
        /// User who owns the fact.
        #[arg(short, long)]
        user: String,

        /// Fact id, as printed by `list`.
        fact_id: String,
    },

    /// Change fields of a stored fact.
    Edit {
        /// User who owns the fact.
        #[arg(short, long)]
        user: String,

        /// Fact id, as printed by `list`.
        fact_id: String,

        /// New key.
        #[arg(long)]
        key: Option<String>,

        /// New value.
        #[arg(long)]
        value: Option<String>,

        /// New category.
        #[arg(long)]
        category: Option<MemoryType>,

        /// New importance, between 0 and 1.
        #[arg(long)]
        importance: Option<f64>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "neuramemory=info",
        1 => "neuramemory=debug",
        _ => "neuramemory=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db;
    match cli.command {
        Command::Remember { user, message } => cmd_remember(db, &user, &message).await,
        Command::Ingest {
            user,
            message,
            classification,
        } => cmd_ingest(db, &user, &message, &classification).await,
        Command::Resolve {
            user,
            classification,
        } => cmd_resolve(db, user.as_deref(), &classification).await,
        Command::Profile { user } => cmd_profile(db, &user).await,
        Command::Recall { user, query } => cmd_recall(db, &user, &query).await,
        Command::List {
            user,
            category,
            limit,
        } => cmd_list(db, &user, category, limit).await,
        Command::Forget { user, fact_id } => cmd_forget(db, &user, &fact_id).await,
        Command::Edit {
            user,
            fact_id,
            key,
            value,
            category,
            importance,
        } => {
            let update = FactUpdate {
                category,
                importance,
                key,
                value,
                context: None,
            };
            cmd_edit(db, &user, &fact_id, update).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn database_path(config: &AppConfig, db: Option<PathBuf>) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path),
        None => Ok(expand_home(&config.storage.database_path)?),
    }
}

async fn open_readonly(config: &AppConfig, db: Option<PathBuf>) -> Result<Storage> {
    let path = database_path(config, db)?;
    if !path.exists() {
        return Err(eyre!(
            "no memory database at '{}'. Store something first with `neuramemory remember`.",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

/// Build a manager backed by Gemini and the local database.
async fn build_manager(config: &AppConfig, db: Option<PathBuf>) -> Result<MemoryManager> {
    let api_key = validate_api_key(config)?;
    let prompt_path = config
        .llm
        .classifier_prompt_path
        .as_deref()
        .map(expand_home)
        .transpose()?;
    let prompt = load_classifier_prompt(prompt_path.as_deref())?;
    let gemini = Arc::new(GeminiClient::new(&config.llm, api_key, prompt)?);

    let path = database_path(config, db)?;
    let storage = Arc::new(Storage::open(&path).await?);
    info!(db = %path.display(), "opened memory database");

    Ok(MemoryManager::new(
        gemini.clone(),
        gemini,
        storage.clone(),
        storage,
        config.recall.clone(),
    ))
}

/// Read a classification from a file, or stdin when `source` is `-`.
fn read_classification(source: &str) -> Result<ClassificationResult> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(Path::new(source))
            .map_err(|e| eyre!("cannot read classification '{source}': {e}"))?
    };
    Ok(parse_classification(&text)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_remember(db: Option<PathBuf>, user: &str, message: &str) -> Result<()> {
    let config = load_config()?;
    let manager = build_manager(&config, db).await?;

    info!(user, "processing turn");
    let outcome = manager.process_turn(user, message).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_ingest(
    db: Option<PathBuf>,
    user: &str,
    message: &str,
    classification: &str,
) -> Result<()> {
    let config = load_config()?;
    let classification = read_classification(classification)?;
    let manager = build_manager(&config, db).await?;

    let outcome = manager
        .ingest_classified(user, message, &classification)
        .await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_resolve(
    db: Option<PathBuf>,
    user: Option<&str>,
    classification: &str,
) -> Result<()> {
    let config = load_config()?;
    let classification = read_classification(classification)?;
    let path = database_path(&config, db)?;

    // A missing database simply means there is nothing to match against yet.
    let profile = match user {
        Some(user) if path.exists() => {
            let storage = Storage::open_readonly(&path).await?;
            load_profile(&storage, user, config.recall.profile_limit).await?
        }
        _ => Default::default(),
    };

    let pool = build_project_pool::<RecalledMemory>(&profile, &[]);
    let plan = plan_fact(&classification, &pool, &SystemClock);
    print_plan(&plan);
    Ok(())
}

async fn cmd_profile(db: Option<PathBuf>, user: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_readonly(&config, db).await?;
    let profile = load_profile(&storage, user, config.recall.profile_limit).await?;

    if profile.is_empty() {
        println!("No profile facts stored for '{user}'.");
        return Ok(());
    }
    print!("{}", profile.render());
    Ok(())
}

async fn cmd_recall(db: Option<PathBuf>, user: &str, query: &str) -> Result<()> {
    let config = load_config()?;
    let manager = build_manager(&config, db).await?;

    let memories = manager.get_relevant_memories(user, query).await?;
    if memories.is_empty() {
        println!("Nothing relevant remembered.");
        return Ok(());
    }
    for memory in memories {
        println!("  [{}] {} = {}", memory.category, memory.key, memory.value);
    }
    Ok(())
}

async fn cmd_list(
    db: Option<PathBuf>,
    user: &str,
    category: Option<MemoryType>,
    limit: usize,
) -> Result<()> {
    let config = load_config()?;
    let storage = open_readonly(&config, db).await?;
    let facts = storage.get_facts(user, category, limit).await?;

    if facts.is_empty() {
        println!("No facts stored for '{user}'.");
        return Ok(());
    }
    for fact in &facts {
        print_fact_line(fact);
    }
    println!();
    println!("  {} fact(s)", facts.len());
    Ok(())
}

async fn cmd_forget(db: Option<PathBuf>, user: &str, fact_id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open(&database_path(&config, db)?).await?;

    let Some(fact) = storage.get_fact(fact_id, user).await? else {
        return Err(eyre!("no fact '{fact_id}' belongs to user '{user}'"));
    };
    info!(user, fact_id, key = %fact.key, "forgetting fact");

    if !forget_fact(&storage, &storage, user, fact_id).await? {
        return Err(eyre!("fact '{fact_id}' disappeared before it could be deleted"));
    }
    println!("Forgot {} = {}", fact.key, fact.value);
    Ok(())
}

async fn cmd_edit(db: Option<PathBuf>, user: &str, fact_id: &str, update: FactUpdate) -> Result<()> {
    if update == FactUpdate::default() {
        return Err(eyre!(
            "nothing to change: pass --key, --value, --category or --importance"
        ));
    }
    if let Some(importance) = update.importance.filter(|i| !(0.0..=1.0).contains(i)) {
        return Err(eyre!("importance must be between 0 and 1, got {importance}"));
    }

    let config = load_config()?;
    let storage = Storage::open(&database_path(&config, db)?).await?;

    let Some(fact) = storage.update_fact(fact_id, user, &update).await? else {
        return Err(eyre!("no fact '{fact_id}' belongs to user '{user}'"));
    };
    print_fact_line(&fact);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Skipped { reason } => {
            println!("Not stored: {reason}");
        }
        IngestOutcome::Ephemeral { fact } => {
            println!("Ephemeral, not stored: {} = {}", fact.key, fact.value);
        }
        IngestOutcome::Stored { fact, embedding_id } => {
            println!();
            println!("  Memory stored!");
            println!("  ID:        {}", fact.id.as_deref().unwrap_or("-"));
            println!("  Category:  {}", fact.category);
            println!("  Key:       {}", fact.key);
            println!("  Value:     {}", fact.value);
            println!("  Embedding: {embedding_id}");
            println!();
        }
    }
}

fn print_fact_line(fact: &MemoryFact) {
    println!(
        "  {}  [{}] {} = {}",
        fact.id.as_deref().unwrap_or("-"),
        fact.category,
        fact.key,
        fact.value
    );
}

fn print_plan(plan: &FactPlan) {
    println!();
    match &plan.resolution {
        Ok(Some(root)) => println!(
            "  Matched:   {} (rule: {}, candidate #{})",
            root.root_key, root.rule, root.position
        ),
        Ok(None) => println!("  Matched:   none"),
        Err(e) => println!("  Matched:   none ({e})"),
    }
    println!("  Category:  {}", plan.category);
    println!("  Key:       {}", plan.key);
    println!("  Value:     {}", plan.value);
    if plan.promoted {
        println!("  Promoted to milestone.");
    }
    println!();
}
