use std::sync::Arc;

use anyhow::{Context, Result};
use bidboard_core::{OpportunityFilters, UrgencyCounts};
use bidboard_rank::{RankedItem, RankedResultSet, RankingSession};
use bidboard_store::{
    open_backend, Backend, BidboardConfig, ChangeFeed, DismissalStore, FeedbackStore,
    OpportunitySource, ProfileStore, ProjectStore, RetryingSource,
};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidboard")]
#[command(about = "Rank federal contract opportunities against your feedback and scoring profile")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the ranked opportunity list once.
    Rank(RankArgs),
    /// Re-print the ranked list whenever the backend reports a change.
    Watch(RankArgs),
    /// Run the JSON API.
    Serve,
    /// List open tracked projects with deadline urgency counts.
    Projects,
}

#[derive(Debug, Args, Default)]
struct RankArgs {
    /// Comma-separated NAICS codes.
    #[arg(long)]
    naics: Option<String>,
    #[arg(long)]
    agency: Option<String>,
    #[arg(long)]
    set_aside: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long)]
    future_only: bool,
    /// Pages to load before ranking.
    #[arg(long, default_value_t = 1)]
    pages: usize,
    #[arg(long)]
    show_dismissed: bool,
}

impl RankArgs {
    fn filters(&self) -> OpportunityFilters {
        OpportunityFilters {
            naics_codes: self.naics.as_ref().map(|codes| {
                codes
                    .split(',')
                    .map(str::trim)
                    .filter(|code| !code.is_empty())
                    .map(ToString::to_string)
                    .collect()
            }),
            agency: self.agency.clone(),
            set_aside: self.set_aside.clone(),
            state: self.state.clone(),
            city: self.city.clone(),
            keyword: self.keyword.clone(),
            future_deadlines_only: self.future_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = BidboardConfig::from_env();

    match cli.command.unwrap_or(Commands::Rank(RankArgs::default())) {
        Commands::Rank(args) => {
            let backend = open_backend(&config).await.context("opening backend")?;
            let result = load_ranked(&backend, &config, &args).await?;
            print_ranked(&result);
        }
        Commands::Watch(args) => {
            let backend = open_backend(&config).await.context("opening backend")?;
            let mut changes = backend
                .subscribe()
                .await
                .context("subscribing to backend changes")?;
            print_ranked(&load_ranked(&backend, &config, &args).await?);
            loop {
                match changes.recv().await {
                    Ok(change) => info!(?change, "backend changed; re-ranking"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged; re-ranking")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                match load_ranked(&backend, &config, &args).await {
                    Ok(result) => print_ranked(&result),
                    Err(err) => warn!(error = %err, "re-ranking failed"),
                }
            }
        }
        Commands::Serve => {
            bidboard_web::serve_from_config(config).await?;
        }
        Commands::Projects => {
            let backend = open_backend(&config).await.context("opening backend")?;
            let projects = backend.open_projects().await.context("loading projects")?;
            let counts = UrgencyCounts::tally(&projects, chrono::Utc::now());
            println!(
                "{} active, {} overdue, {} due in 7 days, {} due in 14 days",
                counts.active, counts.overdue, counts.due_7, counts.due_14
            );
            for project in &projects {
                let deadline = project
                    .response_deadline
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "no deadline".to_string());
                println!(
                    "{:<10} {:<12} {:<24} {}",
                    project.status,
                    deadline,
                    project.notice_id.as_deref().unwrap_or("-"),
                    project.title
                );
            }
        }
    }

    Ok(())
}

async fn load_ranked(
    backend: &Arc<dyn Backend>,
    config: &BidboardConfig,
    args: &RankArgs,
) -> Result<RankedResultSet> {
    let user_id = config.user_id;
    let mut session = RankingSession::new();
    session.replace_feedback(backend.get_feedback(user_id).await.context("loading feedback")?);
    session.replace_dismissals(
        backend
            .get_dismissals(user_id)
            .await
            .context("loading dismissals")?,
    );
    session.set_profile(
        backend
            .get_default_profile(user_id)
            .await
            .context("loading scoring profile")?,
    );
    session.set_tracked_notice_ids(backend.tracked_notice_ids().await?);
    session.set_show_dismissed(args.show_dismissed);

    let source = RetryingSource::new(backend.clone(), config.backoff());
    let filters = args.filters();
    for page in 0..args.pages.max(1) {
        let fetched = source
            .fetch_opportunities(&filters, page, config.page_size)
            .await
            .with_context(|| format!("fetching opportunities page {page}"))?;
        let exhausted = fetched.items.is_empty();
        session.apply_fetched(fetched.items, fetched.total_count, page == 0);
        if exhausted || session.accumulated().len() >= fetched.total_count {
            break;
        }
    }
    Ok(session.render())
}

fn print_ranked(result: &RankedResultSet) {
    println!(
        "{} of {} opportunities loaded ({} dismissed)",
        result.loaded_count, result.total_count, result.dismissed_count
    );
    if let Some(prefs) = &result.preferences {
        println!(
            "preferred agencies: {:?} naics: {:?} set-asides: {:?}",
            prefs.agencies, prefs.naics_codes, prefs.set_asides
        );
    }
    for item in &result.items {
        println!("{}", format_item(item));
    }
}

fn format_item(item: &RankedItem) -> String {
    let opp = &item.opportunity;
    let mut flags = String::new();
    if item.matches_preferences {
        flags.push('*');
    }
    if item.tracked {
        flags.push('T');
    }
    if item.dismissed {
        flags.push('x');
    }
    let deadline = item
        .deadline
        .map(|d| format!("{}d {:?}", d.days_left, d.urgency).to_lowercase())
        .unwrap_or_else(|| "no deadline".to_string());
    format!(
        "{:>5.1} {:<6} {:<3} {:<24} {} [{}]",
        item.display_score(),
        format!("{:?}", item.score_tier).to_lowercase(),
        flags,
        opp.notice_id,
        opp.title.as_deref().unwrap_or("(untitled)"),
        deadline
    )
}
