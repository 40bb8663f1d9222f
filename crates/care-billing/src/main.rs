use anyhow::{Context, Result};
use care_billing::aggregator::{BillingRunRequest, BillingRunner, RunMode};
use care_billing::config::BillingConfig;
use care_billing::domain::{BillingPeriod, CustomerId, EventId};
use care_billing::storage::{
    FundingHistoryRepository, InMemoryFundingHistoryRepository, JsonDataSource,
    SqlFundingHistoryRepository,
};
use chrono::{Datelike, NaiveDate, NaiveTime, Utc};
use clap::Parser;
use clap_verbosity_flag::{OffLevel, Verbosity};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
#[command(name = "care-billing")]
#[command(about = "Care billing engine - draft bills with surcharges and funding ceilings")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config and dataset without billing)")]
    dry_run: bool,

    #[arg(short, long, help = "JSON dataset of customers, catalogue and funding histories")]
    input: Option<PathBuf>,

    #[arg(long, help = "First day of the billing period (inclusive)")]
    start: Option<NaiveDate>,

    #[arg(long, help = "Day after the billing period (exclusive)")]
    end: Option<NaiveDate>,

    #[arg(long, help = "Bill a single customer")]
    customer: Option<String>,

    #[arg(long, help = "draft or commit; overrides run.mode")]
    mode: Option<RunMode>,

    #[arg(long, num_args = 1.., value_name = "EVENT_ID", help = "Give back the funding consumed by these billed events instead of billing")]
    unbill: Vec<String>,

    #[command(flatten)]
    verbosity: Verbosity<OffLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    care_common::logging::init_cli_logging(&args.verbosity, "care_billing=info")?;

    if args.gen_config {
        println!("{}", BillingConfig::generate_example()?);
        return Ok(());
    }

    let config = BillingConfig::load(args.config.as_deref())?;
    info!("Environment: {}", config.service.environment);

    let input = args.input.context("--input is required")?;
    let source = JsonDataSource::from_path(&input).await?;

    // Runs extend the calendar back to the earliest event they bill.
    let reference_year = args.end.map_or_else(|| Utc::now().year(), |end| end.year());
    let calendar = config.holidays.calendar(reference_year)?;
    info!(
        holidays = calendar.snapshot().len(),
        country = %config.holidays.country,
        "Holiday calendar built"
    );

    if args.dry_run {
        info!("Configuration and dataset validated successfully (dry-run mode)");
        return Ok(());
    }

    let histories: Arc<dyn FundingHistoryRepository> = match &config.database {
        Some(database) => {
            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .acquire_timeout(database.acquire_timeout())
                .connect(&database.url)
                .await
                .context("Failed to connect to the funding history database")?;

            info!("Running database migrations");
            sqlx::migrate!("./migrations").run(&pool).await?;
            Arc::new(SqlFundingHistoryRepository::new(pool))
        }
        None => Arc::new(InMemoryFundingHistoryRepository::with_histories(
            source.funding_histories().to_vec(),
        )),
    };

    let runner = BillingRunner::new(Arc::new(source), histories, calendar)
        .with_max_concurrent_customers(config.run.max_concurrent_customers)
        .with_amount_decimal_places(config.run.amount_decimal_places);

    if !args.unbill.is_empty() {
        let event_ids: Vec<EventId> = args.unbill.into_iter().map(EventId::new).collect();
        let report = runner.unbill(&event_ids).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let start = args.start.context("--start is required")?;
    let end = args.end.context("--end is required")?;
    let period = BillingPeriod::new(start.and_time(NaiveTime::MIN), end.and_time(NaiveTime::MIN))?;

    let request = BillingRunRequest {
        period,
        customer_id: args.customer.map(CustomerId::new),
        mode: args.mode.unwrap_or(config.run.mode),
    };

    let report = runner.run(&request).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.failures.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
