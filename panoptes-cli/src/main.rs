use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use panoptes_core::RepoRef;
use panoptes_server::backends::{AnthropicBackend, GeminiBackend, OpenAiBackend};
use panoptes_server::db::SqliteDb;
use panoptes_server::dispatch::{BackendPool, Dispatcher, ModelClassifier};
use panoptes_server::duplicate::DuplicateDetector;
use panoptes_server::github::GithubClient;
use panoptes_server::orchestrator::{ReviewOptions, ReviewOrchestrator, WorkflowSettings};
use panoptes_server::poster::{CategoryTierFilter, Poster};
use panoptes_server::validation::ValidationPipeline;
use panoptes_server::{
    ApprovalOutcome, FeatureFlag, ModelBackend, Notifier, NullNotifier, SlackNotifier,
    StaticFlags,
};

/// Panoptes: multi-model AI code review for pull requests
#[derive(Parser, Debug)]
#[command(name = "panoptes")]
#[command(about = "Multi-model AI code review for pull requests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Review a pull request and print (or post) the resulting comments
    Review(ReviewArgs),
}

#[derive(Parser, Debug)]
struct ReviewArgs {
    /// Repository owner
    #[arg(long)]
    owner: String,

    /// Repository name
    #[arg(long)]
    repo: String,

    /// Pull request number
    #[arg(long)]
    pr: u64,

    /// Post the surviving comments (and possibly approve); without this the
    /// review is printed only
    #[arg(long)]
    post: bool,

    /// Skip the review when the PR already has an approving review
    #[arg(long)]
    skip_if_approved: bool,

    /// Skip fetching existing comments for deduplication
    #[arg(long)]
    no_dedupe: bool,

    /// Feature flags to enable for this run (snake_case keys, repeatable)
    #[arg(long = "enable", num_args = 1..)]
    enable: Vec<String>,

    /// SQLite state file; in-memory when omitted
    #[arg(long)]
    state_db: Option<std::path::PathBuf>,

    /// GitHub token (falls back to GITHUB_TOKEN)
    #[arg(long)]
    github_token: Option<String>,
}

fn env_or_arg(arg: Option<String>, var: &str) -> Result<String> {
    match arg {
        Some(value) => Ok(value),
        None => std::env::var(var).with_context(|| format!("{var} is required")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Review(args) => run_review(args).await,
    }
}

async fn run_review(args: ReviewArgs) -> Result<()> {
    let github_token = env_or_arg(args.github_token.clone(), "GITHUB_TOKEN")?;
    let anthropic_api_key =
        std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is required")?;

    let vcs = Arc::new(GithubClient::new(github_token));
    let notifier: Arc<dyn Notifier> = match std::env::var("SLACK_WEBHOOK_URL") {
        Ok(url) if !url.trim().is_empty() => Arc::new(SlackNotifier::new(url)),
        _ => Arc::new(NullNotifier),
    };

    let primary: Arc<dyn ModelBackend> = Arc::new(AnthropicBackend::new(
        anthropic_api_key,
        std::env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
    ));
    let mut secondaries: Vec<(FeatureFlag, Arc<dyn ModelBackend>)> = Vec::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            secondaries.push((
                FeatureFlag::AddOpenAiResults,
                Arc::new(OpenAiBackend::new(
                    key,
                    std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4.1".to_string()),
                )),
            ));
        }
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            secondaries.push((
                FeatureFlag::AddGeminiResults,
                Arc::new(GeminiBackend::new(
                    key,
                    std::env::var("GEMINI_MODEL")
                        .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                )),
            ));
        }
    }
    let secondary_backend = secondaries.first().map(|(_, backend)| backend.clone());

    let flags = Arc::new(StaticFlags::from_keys(
        args.enable.iter().map(String::as_str),
    ));

    let store = Arc::new(match &args.state_db {
        Some(path) => SqliteDb::new(path)?,
        None => SqliteDb::in_memory()?,
    });

    let dispatcher = Dispatcher::new(
        BackendPool {
            primary: primary.clone(),
            secondaries,
        },
        Arc::new(ModelClassifier::new(primary.clone())),
        notifier.clone(),
    );
    let validation = ValidationPipeline {
        primary: primary.clone(),
        secondary: secondary_backend,
        strict_model: std::env::var("STRICT_VALIDATION_MODEL")
            .unwrap_or_else(|_| "claude-opus-4-20250514".to_string()),
    };
    let duplicates = DuplicateDetector::new(primary.clone());

    let orchestrator = ReviewOrchestrator::new(
        vcs.clone(),
        dispatcher,
        validation,
        duplicates,
        flags,
        WorkflowSettings {
            company_id: 1,
            bot_login: "panoptes[bot]".to_string(),
            active_personas: Vec::new(),
            committable_suggestions: true,
        },
    );

    let repo = RepoRef::new(args.owner.clone(), args.repo.clone());
    let outcome = orchestrator
        .review_pull_request(
            &repo,
            args.pr,
            None,
            ReviewOptions {
                skip_if_approved: args.skip_if_approved,
                dedupe_existing: !args.no_dedupe,
            },
        )
        .await
        .map_err(|failure| failure.error)?;

    println!(
        "Reviewed {}/{}#{}: {} comment(s) across {} file(s)",
        args.owner,
        args.repo,
        args.pr,
        outcome.comments.len(),
        outcome.files.len()
    );

    if !args.post {
        for comment in &outcome.comments {
            let status = match &comment.rejection_reason {
                Some(reason) => format!("rejected ({reason})"),
                None => "kept".to_string(),
            };
            println!("\n--- {}:{} [{}]\n{}", comment.path, comment.line, status, comment.body);
        }
        return Ok(());
    }

    let poster = Poster::new(
        vcs,
        store,
        notifier,
        primary,
        Arc::new(CategoryTierFilter { max_comments: 10 }),
        false,
    );
    let posted = poster
        .post_review_comments(&repo, args.pr, 1, outcome.comments)
        .await;

    println!(
        "Posted {} comment(s), filtered {}",
        posted.posted.len(),
        posted.filtered.len()
    );
    for comment in &posted.filtered {
        println!(
            "  filtered {}:{} - {}",
            comment.path,
            comment.line,
            comment.rejection_reason.as_deref().unwrap_or("no reason recorded")
        );
    }
    match posted.approval {
        ApprovalOutcome::Approved { reason } => println!("Approved: {reason}"),
        ApprovalOutcome::Declined { reason } => println!("Not approved: {reason}"),
        ApprovalOutcome::Failed { error } => println!("Approval decision failed: {error}"),
        ApprovalOutcome::NotEvaluated => {}
    }

    Ok(())
}
