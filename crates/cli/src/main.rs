//! branchgate command-line tool.
//!
//! Opens hosted branches under the configured access policy, computes merge
//! previews and incremental diffs, and inspects patch statistics and merge
//! revnos.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use branchgate_core::config::AppConfig;
use branchgate_core::db::Database;
use branchgate_core::detection::{find_merged_revno, MergeProposal};
use branchgate_core::diff::diffstat::{generate_diffstat, totals};
use branchgate_core::diff::{FileDiffStore, MergePreviewEngine, PreviewDiff};
use branchgate_core::graph::merge_sort;
use branchgate_core::hosting::format::ProberRegistry;
use branchgate_core::hosting::{
    Branch, LocalTransport, OpenOptions, RecordingObserver, SafeBranchOpener,
};
use branchgate_core::policy::UrlListPolicy;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// branchgate command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "branchgate",
    version,
    about = "Open hosted branches safely and compute merge previews"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/branchgate/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./branchgate.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Open a branch under the access policy and describe it.
    Open {
        /// Branch URL (file:// for local branches).
        url: String,

        /// Do not open stacked-on branches.
        #[arg(long)]
        ignore_fallbacks: bool,
    },

    /// Show per-file statistics of a patch file.
    Diffstat {
        /// Path to a unified diff.
        patch: PathBuf,
    },

    /// Compute and store the preview diff of a merge proposal.
    Preview {
        #[command(flatten)]
        proposal: ProposalArgs,

        /// Print the diff text after the summary.
        #[arg(long)]
        show: bool,
    },

    /// Compute and store an incremental diff of a proposal's source branch.
    Incremental {
        #[command(flatten)]
        proposal: ProposalArgs,

        /// Older source revision.
        #[arg(long)]
        old: String,

        /// Newer source revision.
        #[arg(long)]
        new: String,
    },

    /// Show the stored preview and incremental diffs of a proposal.
    Show {
        /// Proposal identifier.
        proposal: String,
    },

    /// Print the mainline revno that merged a revision into a branch.
    Revno {
        /// Branch URL.
        url: String,

        /// Revision id to look up.
        revision: String,
    },
}

#[derive(clap::Args, Debug)]
struct ProposalArgs {
    /// Proposal identifier.
    #[arg(long = "id")]
    id: String,

    /// Source branch URL.
    #[arg(long)]
    source: String,

    /// Target branch URL.
    #[arg(long)]
    target: String,

    /// Prerequisite branch URL.
    #[arg(long)]
    prerequisite: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Fall back to the config's log level when RUST_LOG is unset.
    let level = AppConfig::load_from_file(&cli.config)
        .map(|config| config.general.log_level)
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Diffstat { patch } => cmd_diffstat(&patch),
        command => {
            let config = load_config(&cli.config)?;
            // Opening branches and diffing trees is blocking work.
            tokio::task::spawn_blocking(move || run_with_config(&config, command))
                .await
                .context("command task panicked")?
        }
    }
}

fn run_with_config(config: &AppConfig, command: Commands) -> Result<()> {
    tracing::debug!(?command, data_dir = %config.general.data_dir.display(), "running command");
    match command {
        Commands::Open {
            url,
            ignore_fallbacks,
        } => cmd_open(config, &url, ignore_fallbacks),
        Commands::Preview { proposal, show } => cmd_preview(config, &proposal, show),
        Commands::Incremental { proposal, old, new } => {
            cmd_incremental(config, &proposal, &old, &new)
        }
        Commands::Show { proposal } => cmd_show(config, &proposal),
        Commands::Revno { url, revision } => cmd_revno(config, &url, &revision),
        Commands::Init { .. } | Commands::Validate | Commands::Diffstat { .. } => {
            anyhow::bail!("command does not need a configuration")
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_validate(path).context("failed to load configuration file")
}

fn open_database(config: &AppConfig) -> Result<Database> {
    Database::open(&config.general).context("failed to open database")
}

fn preview_engine(config: &AppConfig) -> Result<MergePreviewEngine> {
    let store = FileDiffStore::new(config.general.diff_dir()).context("failed to open diff store")?;
    Ok(MergePreviewEngine::new(Arc::new(store), config.diff.clone()))
}

fn build_opener(config: &AppConfig, observer: Option<Arc<RecordingObserver>>) -> Result<SafeBranchOpener> {
    let probers = ProberRegistry::with_builtin()
        .select(&config.policy.probers)
        .map_err(|name| anyhow::anyhow!("unknown prober '{}'", name))?;
    let policy = UrlListPolicy::from_config(&config.policy);
    let mut opener = SafeBranchOpener::new(Arc::new(policy), probers, Arc::new(LocalTransport::new()))
        .with_max_hops(config.policy.max_hops);
    if let Some(observer) = observer {
        opener = opener.with_observer(observer);
    }
    Ok(opener)
}

fn open_branch(opener: &SafeBranchOpener, url: &str) -> Result<Branch> {
    opener
        .open(url)
        .with_context(|| format!("failed to open branch {}", url))
}

struct OpenedProposal {
    proposal: MergeProposal,
    source: Branch,
    target: Branch,
    prerequisite: Option<Branch>,
}

fn open_proposal(config: &AppConfig, args: &ProposalArgs) -> Result<OpenedProposal> {
    let opener = build_opener(config, None)?;
    let source = open_branch(&opener, &args.source)?;
    let target = open_branch(&opener, &args.target)?;
    let prerequisite = args
        .prerequisite
        .as_deref()
        .map(|url| open_branch(&opener, url))
        .transpose()?;
    let proposal = MergeProposal::new(
        &args.id,
        source.url(),
        target.url(),
        prerequisite.as_ref().map(Branch::url),
    );
    Ok(OpenedProposal {
        proposal,
        source,
        target,
        prerequisite,
    })
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# branchgate configuration

[general]
log_level = "info"
data_dir = "/var/lib/branchgate"

[policy]
# "blacklist" denies the listed URLs; "whitelist" allows only them.
mode = "blacklist"
urls = []
follow_references = true
# allowed_schemes = ["file", "https"]
probers = ["branch", "reference"]
max_hops = 32

[diff]
max_read_size = 1048576
context_lines = 3
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the policy section to list trusted or denied branch URLs");
    println!(
        "  2. Validate with: branchgate validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Policy mode      : {}", config.policy.mode);
    println!("  Listed URLs      : {}", config.policy.urls.len());
    println!("  Follow references: {}", config.policy.follow_references);
    println!(
        "  Allowed schemes  : {}",
        if config.policy.allowed_schemes.is_empty() {
            "any".to_string()
        } else {
            config.policy.allowed_schemes.join(", ")
        }
    );
    println!("  Probers          : {}", config.policy.probers.join(", "));
    println!("  Max hops         : {}", config.policy.max_hops);
    println!("  Max diff read    : {} bytes", config.diff.max_read_size);
    println!("  Data directory   : {}", config.general.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_open(config: &AppConfig, url: &str, ignore_fallbacks: bool) -> Result<()> {
    let observer = Arc::new(RecordingObserver::new());
    let opener = build_opener(config, Some(observer.clone()))?;
    let result = opener.open_with(url, OpenOptions { ignore_fallbacks });

    println!("Checked URLs:");
    for checked in observer.urls() {
        println!("  {}", checked);
    }
    println!();

    let branch = result.with_context(|| format!("failed to open branch {}", url))?;
    let tip = branch.tip_revision_id().context("failed to read branch tip")?;
    println!("  [OK] Opened {}", branch.url());
    println!("  Format     : {}", branch.format());
    println!("  Tip        : {}", tip.as_deref().unwrap_or("none"));
    println!(
        "  Stacked on : {}",
        branch.stacked_on_url().unwrap_or("-")
    );
    let chain = branch.stacking_chain();
    if chain.len() > 1 {
        println!("  Chain      : {}", chain.join(" -> "));
    }
    Ok(())
}

fn cmd_diffstat(patch: &Path) -> Result<()> {
    let content = std::fs::read(patch)
        .with_context(|| format!("failed to read {}", patch.display()))?;
    let stats = generate_diffstat(&content).context("failed to parse patch")?;

    if stats.is_empty() {
        println!("No file changes found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["File", "Added", "Removed"]);
    for (path, (added, removed)) in &stats {
        table.add_row(vec![
            Cell::new(path),
            Cell::new(format!("+{}", added)).fg(Color::Green),
            Cell::new(format!("-{}", removed)).fg(Color::Red),
        ]);
    }
    println!("{table}");

    let (added, removed) = totals(&stats);
    println!(
        "{} file(s) changed, {} insertion(s), {} deletion(s)",
        stats.len(),
        added,
        removed
    );
    Ok(())
}

fn cmd_preview(config: &AppConfig, args: &ProposalArgs, show: bool) -> Result<()> {
    let opened = open_proposal(config, args)?;
    let engine = preview_engine(config)?;
    let preview = PreviewDiff::from_proposal(
        &engine,
        &opened.proposal,
        &opened.source,
        &opened.target,
        opened.prerequisite.as_ref(),
    )
    .context("failed to compute preview diff")?;
    let db = open_database(config)?;
    let id = db
        .insert_preview_diff(&preview)
        .context("failed to store preview diff")?;

    println!("  [OK] Preview diff {} stored for proposal {}", id, args.id);
    println!("  Source revision : {}", preview.source_revision_id);
    println!("  Target revision : {}", preview.target_revision_id);
    if let Some(prerequisite) = &preview.prerequisite_revision_id {
        println!("  Prerequisite    : {}", prerequisite);
    }
    print_diff_summary(&preview.diff);
    if preview.has_conflicts() {
        println!();
        println!("Conflicts:");
        for line in preview.conflicts.lines() {
            println!("  {}", line);
        }
    }
    if show {
        print_diff_text(&engine, &preview.diff)?;
    }
    Ok(())
}

fn cmd_incremental(config: &AppConfig, args: &ProposalArgs, old: &str, new: &str) -> Result<()> {
    let opened = open_proposal(config, args)?;
    let engine = preview_engine(config)?;
    let incremental = engine
        .incremental_diff_for_proposal(
            &opened.proposal,
            &opened.source,
            &opened.target,
            opened.prerequisite.as_ref(),
            old,
            new,
        )
        .context("failed to compute incremental diff")?;
    let db = open_database(config)?;
    let id = db
        .insert_incremental_diff(&incremental)
        .context("failed to store incremental diff")?;

    println!("  [OK] Incremental diff {} stored ({} -> {})", id, old, new);
    print_diff_summary(&incremental.diff);
    print_diff_text(&engine, &incremental.diff)
}

fn cmd_show(config: &AppConfig, proposal: &str) -> Result<()> {
    let db = open_database(config)?;
    let engine = preview_engine(config)?;

    match db
        .current_preview_diff(proposal)
        .context("failed to read preview diff")?
    {
        Some(preview) => {
            println!("Preview diff (created {})", preview.created_at.to_rfc3339());
            println!("  Source revision : {}", preview.source_revision_id);
            println!("  Target revision : {}", preview.target_revision_id);
            print_diff_summary(&preview.diff);
            print_diff_text(&engine, &preview.diff)?;
        }
        None => println!("No preview diff stored for proposal {}.", proposal),
    }

    let incrementals = db
        .incremental_diffs_for(proposal)
        .context("failed to read incremental diffs")?;
    if incrementals.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Old", "New", "Lines", "Added", "Removed"]);
    for incremental in &incrementals {
        table.add_row(vec![
            Cell::new(&incremental.old_revision_id),
            Cell::new(&incremental.new_revision_id),
            Cell::new(incremental.diff.lines_count),
            Cell::new(count_or_dash(incremental.diff.added_lines_count)),
            Cell::new(count_or_dash(incremental.diff.removed_lines_count)),
        ]);
    }
    println!();
    println!("{table}");
    Ok(())
}

fn cmd_revno(config: &AppConfig, url: &str, revision: &str) -> Result<()> {
    let opener = build_opener(config, None)?;
    let branch = open_branch(&opener, url)?;
    let merge_sorted = {
        let locks = branch.lock_read().context("failed to lock branch")?;
        match locks.tip(&branch) {
            Some(tip) => merge_sort(&locks, tip),
            None => Vec::new(),
        }
    };
    match find_merged_revno(&merge_sorted, revision) {
        Some(revno) => println!("{} merged in revno {}", revision, revno),
        None => println!("{} is not in the history of {}", revision, branch.url()),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn print_diff_summary(diff: &branchgate_core::Diff) {
    println!("  Lines           : {}", diff.lines_count);
    println!(
        "  Added / removed : {} / {}",
        count_or_dash(diff.added_lines_count),
        count_or_dash(diff.removed_lines_count)
    );
    if let Some(stats) = &diff.diffstat {
        for (path, (added, removed)) in stats {
            println!("    {:<40} +{} -{}", path, added, removed);
        }
    }
}

fn print_diff_text(engine: &MergePreviewEngine, diff: &branchgate_core::Diff) -> Result<()> {
    match engine.diff_text(diff).context("failed to read diff text")? {
        Some(text) => {
            println!();
            print!("{}", text);
        }
        None if diff.is_oversized(engine.config().max_read_size) => {
            println!();
            println!("(diff text is larger than {} bytes, not shown)", engine.config().max_read_size);
        }
        None => {}
    }
    Ok(())
}

fn count_or_dash(count: Option<u32>) -> String {
    count
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string())
}
