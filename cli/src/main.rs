mod cloud;
mod commands;
mod config;
mod oauth;
mod openfoodfacts;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use crate::commands::{
    ActivityInput, SyncContext, TargetInput, cmd_activity_set, cmd_activity_show,
    cmd_auth_login, cmd_auth_logout, cmd_auth_status, cmd_backup_export, cmd_backup_import,
    cmd_barcode, cmd_copy, cmd_delete, cmd_history, cmd_log, cmd_portion_add, cmd_portions,
    cmd_product_add, cmd_product_list, cmd_quick, cmd_report_monthly, cmd_report_weekly,
    cmd_search, cmd_summary, cmd_sync_auto, cmd_sync_now, cmd_sync_passphrase, cmd_sync_pull,
    cmd_sync_push, cmd_sync_status, cmd_target_clear, cmd_target_set, cmd_target_show,
    cmd_template_apply, cmd_template_list, cmd_template_save, cmd_update, cmd_weight_delete,
    cmd_weight_history, cmd_weight_log, cmd_weight_show, sync_after_change,
};
use crate::config::Config;
use crate::openfoodfacts::OpenFoodFactsClient;
use nutrilog_core::config::ProviderConfig;
use nutrilog_core::db::Database;
use nutrilog_core::models::Nutrients;

const LOG_ENV: &str = "NUTRILOG_LOG";

#[derive(Parser)]
#[command(
    name = "nutrilog",
    version,
    about = "A local-first nutrition and activity journal",
    long_about = "A local-first nutrition and activity journal.\n\n\
        Everything is stored in a local SQLite database. Weekly and monthly \
        reports are computed on your machine, and the journal can be synced \
        between devices as an encrypted backup."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Per-100 g nutrient flags shared by `quick` and `product add`.
#[derive(clap::Args)]
struct NutrientArgs {
    /// Calories (kcal)
    #[arg(long)]
    calories: Option<f64>,
    /// Protein (g)
    #[arg(long)]
    protein: Option<f64>,
    /// Carbohydrates (g)
    #[arg(long)]
    carbs: Option<f64>,
    /// Sugar (g)
    #[arg(long)]
    sugar: Option<f64>,
    /// Fat (g)
    #[arg(long)]
    fat: Option<f64>,
    /// Saturated fat (g)
    #[arg(long)]
    saturated_fat: Option<f64>,
    /// Fiber (g)
    #[arg(long)]
    fiber: Option<f64>,
    /// Sodium (g)
    #[arg(long)]
    sodium: Option<f64>,
}

impl From<NutrientArgs> for Nutrients {
    fn from(a: NutrientArgs) -> Self {
        Nutrients {
            calories: a.calories,
            protein: a.protein,
            carbs: a.carbs,
            sugar: a.sugar,
            fat: a.fat,
            saturated_fat: a.saturated_fat,
            fiber: a.fiber,
            sodium: a.sodium,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Log a product by searching for it
    Log {
        /// Product name to search for
        query: String,
        /// Amount (e.g. "200g", "1.5 oz", "2 slices", "serving")
        amount: String,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Log directly by product ID (skip search)
        #[arg(long)]
        product_id: Option<String>,
        /// Date to log for (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log an entry with nutrients typed in directly
    Quick {
        /// What was eaten
        name: String,
        #[command(flatten)]
        nutrients: NutrientArgs,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Date to log for (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Look up a product by barcode and log it
    Barcode {
        /// Barcode number
        code: String,
        /// Amount (optional, uses the default serving if known)
        amount: Option<String>,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long, default_value = "snack")]
        meal: String,
        /// Date to log for (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search the local database and `OpenFoodFacts` for a product
    Search {
        /// Search query
        query: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage products and their named portions
    Product {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// Show daily summary (defaults to today)
    Summary {
        /// Date to show (YYYY-MM-DD, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show summaries for the last N days
    History {
        /// Number of days to show
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a meal entry by ID
    Delete {
        /// Entry ID (the short form from `summary` works too)
        entry_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update a meal entry (amount, meal type, or date)
    Update {
        /// Entry ID
        entry_id: String,
        /// New amount (e.g. "200g", "2 slices")
        #[arg(short, long)]
        amount: Option<String>,
        /// New meal type: breakfast, lunch, dinner, snack
        #[arg(long)]
        meal: Option<String>,
        /// New date (YYYY-MM-DD or today/yesterday/tomorrow)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Copy a meal from one date/meal to another
    Copy {
        /// Source in format "date:meal" (e.g. "today:lunch" or "2024-01-15:breakfast")
        from: String,
        /// Destination in format "date:meal"
        to: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save and reuse meals
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
    /// Record steps, sleep and other daily activity
    Activity {
        #[command(subcommand)]
        command: ActivityCommands,
    },
    /// Track body weight
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Manage calorie and macro targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Weekly and monthly reports
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Encrypted backup files
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Sync the journal through encrypted backups
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Connect cloud storage
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

impl Commands {
    /// Whether the command can change the journal, and so should be synced.
    fn mutates(&self) -> bool {
        match self {
            Commands::Log { .. }
            | Commands::Quick { .. }
            | Commands::Barcode { .. }
            | Commands::Search { .. }
            | Commands::Delete { .. }
            | Commands::Update { .. }
            | Commands::Copy { .. } => true,
            Commands::Product { command } => !matches!(
                command,
                ProductCommands::List { .. } | ProductCommands::Portions { .. }
            ),
            Commands::Template { command } => !matches!(command, TemplateCommands::List { .. }),
            Commands::Activity { command } => matches!(command, ActivityCommands::Set { .. }),
            Commands::Weight { command } => matches!(
                command,
                WeightCommands::Log { .. } | WeightCommands::Delete { .. }
            ),
            Commands::Target { command } => !matches!(command, TargetCommands::Show { .. }),
            Commands::Backup { command } => matches!(command, BackupCommands::Import { .. }),
            Commands::Summary { .. }
            | Commands::History { .. }
            | Commands::Report { .. }
            | Commands::Sync { .. }
            | Commands::Auth { .. }
            | Commands::Serve { .. } => false,
        }
    }
}

#[derive(Subcommand)]
enum ProductCommands {
    /// Add a product with per-100 g nutrients
    Add {
        /// Product name
        name: String,
        #[command(flatten)]
        nutrients: NutrientArgs,
        /// Default serving size in grams
        #[arg(long)]
        serving: Option<f64>,
        /// Brand name
        #[arg(long)]
        brand: Option<String>,
        /// Barcode
        #[arg(long)]
        barcode: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List/search the local product database
    List {
        /// Search query to filter products
        #[arg(short, long)]
        search: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a named portion ("slice" = 30 g) to a product
    PortionAdd {
        /// Product ID
        product_id: String,
        /// Portion label
        label: String,
        /// Grams in one portion
        grams: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a product's named portions
    Portions {
        /// Product ID
        product_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Save a logged meal as a template
    Save {
        /// Template name
        name: String,
        /// Meal to save in format "date:meal" (e.g. "today:breakfast")
        meal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List templates
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log every item of a template
    Apply {
        /// Template name
        name: String,
        /// Date (default: today)
        #[arg(long)]
        date: Option<String>,
        /// Meal type (default: the template's own)
        #[arg(short, long)]
        meal: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ActivityCommands {
    /// Record activity for a day; omitted values keep what was there
    Set {
        /// Date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Step count
        #[arg(long)]
        steps: Option<u32>,
        /// Active calories burned (kcal)
        #[arg(long)]
        active_calories: Option<f64>,
        /// Intensity minutes
        #[arg(long)]
        intensity_minutes: Option<u32>,
        /// Hours slept
        #[arg(long)]
        sleep: Option<f64>,
        /// Resting heart rate (bpm)
        #[arg(long)]
        heart_rate: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show activity for a day (default: today)
    Show {
        /// Date (YYYY-MM-DD or today/yesterday)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Log a weight entry
    Log {
        /// Weight value (number)
        value: f64,
        /// Unit: kg or lbs (default: kg)
        #[arg(short, long, default_value = "kg")]
        unit: String,
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Optional notes
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show weight for a specific date (default: today)
    Show {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show weight history
    History {
        /// Number of entries to show (default: all)
        #[arg(short, long)]
        days: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a weight entry by ID
    Delete {
        /// Weight entry ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Set calorie and macro targets; omitted values are left unchanged
    Set {
        /// Daily calorie target (kcal)
        #[arg(long)]
        calories: Option<f64>,
        /// Accepted deviation from the calorie target, in percent
        #[arg(long)]
        tolerance: Option<f64>,
        /// Protein target (g)
        #[arg(long)]
        protein: Option<f64>,
        /// Carbohydrate target (g)
        #[arg(long)]
        carbs: Option<f64>,
        /// Fat target (g)
        #[arg(long)]
        fat: Option<f64>,
        /// Goal weight (kg)
        #[arg(long)]
        goal_weight: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show targets
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear all targets
    Clear {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Per-week averages and target adherence
    Weekly {
        /// Number of weeks, ending with the current one
        #[arg(short, long, default_value = "4")]
        weeks: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Per-month averages with best and worst weeks
    Monthly {
        /// Number of months, ending with the current one
        #[arg(short, long, default_value = "3")]
        months: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Write an encrypted backup of the whole journal
    Export {
        /// Output file
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge an encrypted backup into the journal
    Import {
        /// Backup file
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Upload an encrypted backup
    Push {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download the backup and merge it
    Pull {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull, then push
    Now {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn automatic sync after changes on or off
    Auto {
        #[arg(value_parser = ["on", "off"])]
        state: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the passphrase backups are encrypted with (read from stdin)
    Passphrase {
        /// Remove the stored passphrase instead
        #[arg(long)]
        clear: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Connect a cloud storage account
    Login {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the stored session
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the connected account
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run_sync(db: Database, config: &Config, command: SyncCommands) -> Result<()> {
    match command {
        SyncCommands::Auto { state, json } => cmd_sync_auto(&db, config, state == "on", json),
        SyncCommands::Passphrase { clear, json } => cmd_sync_passphrase(config, clear, json),
        SyncCommands::Push { json } => cmd_sync_push(&mut SyncContext::new(db, config)?, json).await,
        SyncCommands::Pull { json } => cmd_sync_pull(&mut SyncContext::new(db, config)?, json).await,
        SyncCommands::Now { json } => cmd_sync_now(&mut SyncContext::new(db, config)?, json).await,
        SyncCommands::Status { json } => cmd_sync_status(&SyncContext::new(db, config)?, json),
    }
}

async fn serve(db: Database, config: &Config, port: u16, bind: &str, no_auth: bool) -> Result<()> {
    let api_key = if no_auth {
        None
    } else {
        Some(config.load_or_create_api_key()?.0)
    };
    let lookup = Arc::new(OpenFoodFactsClient::new()?);

    // A missing login should not keep the API from starting.
    let storage = ProviderConfig::from_env()
        .map_err(anyhow::Error::from)
        .and_then(|provider| cloud::build_storage(config, &provider));
    let (db, sync) = match storage {
        Ok(storage) => {
            let settings = config.sync_settings(&db)?;
            let (db, coordinator) = SyncContext::with_storage(db, storage, settings).into_parts();
            (db, Some(coordinator))
        }
        Err(e) => {
            eprintln!("Warning: {e:#}");
            (Arc::new(Mutex::new(db)), None)
        }
    };

    server::start_server(db, sync, lookup, port, bind, api_key).await
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::open(&config.db_path)?;
    let changed = cli.command.mutates();

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => return serve(db, &config, port, &bind, no_auth).await,
        Commands::Sync { command } => return run_sync(db, &config, command).await,
        Commands::Search { query, json } => {
            let off = OpenFoodFactsClient::new()?;
            cmd_search(&db, &off, &query, json).await?;
        }
        Commands::Log {
            query,
            amount,
            meal,
            product_id,
            date,
            json,
        } => {
            let off = OpenFoodFactsClient::new()?;
            cmd_log(&db, &off, &query, &amount, &meal, product_id, date, json).await?;
        }
        Commands::Quick {
            name,
            nutrients,
            meal,
            date,
            json,
        } => cmd_quick(&db, &name, nutrients.into(), &meal, date, json)?,
        Commands::Barcode {
            code,
            amount,
            meal,
            date,
            json,
        } => {
            let off = OpenFoodFactsClient::new()?;
            cmd_barcode(&db, &off, &code, amount, &meal, date, json).await?;
        }
        Commands::Product { command } => match command {
            ProductCommands::Add {
                name,
                nutrients,
                serving,
                brand,
                barcode,
                json,
            } => cmd_product_add(&db, &name, brand, barcode, nutrients.into(), serving, json)?,
            ProductCommands::List { search, json } => {
                cmd_product_list(&db, search.as_deref(), json)?;
            }
            ProductCommands::PortionAdd {
                product_id,
                label,
                grams,
                json,
            } => cmd_portion_add(&db, &product_id, &label, grams, json)?,
            ProductCommands::Portions { product_id, json } => {
                cmd_portions(&db, &product_id, json)?;
            }
        },
        Commands::Summary { date, json } => cmd_summary(&db, date, json)?,
        Commands::History { days, json } => cmd_history(&db, days, json)?,
        Commands::Delete { entry_id, json } => cmd_delete(&db, &entry_id, json)?,
        Commands::Update {
            entry_id,
            amount,
            meal,
            date,
            json,
        } => cmd_update(
            &db,
            &entry_id,
            amount.as_deref(),
            meal.as_deref(),
            date,
            json,
        )?,
        Commands::Copy { from, to, json } => cmd_copy(&db, &from, &to, json)?,
        Commands::Template { command } => match command {
            TemplateCommands::Save { name, meal, json } => {
                cmd_template_save(&db, &name, &meal, json)?;
            }
            TemplateCommands::List { json } => cmd_template_list(&db, json)?,
            TemplateCommands::Apply {
                name,
                date,
                meal,
                json,
            } => cmd_template_apply(&db, &name, date, meal.as_deref(), json)?,
        },
        Commands::Activity { command } => match command {
            ActivityCommands::Set {
                date,
                steps,
                active_calories,
                intensity_minutes,
                sleep,
                heart_rate,
                json,
            } => {
                let input = ActivityInput {
                    steps,
                    active_calories,
                    intensity_minutes,
                    sleep_hours: sleep,
                    heart_rate,
                };
                cmd_activity_set(&db, date, &input, json)?;
            }
            ActivityCommands::Show { date, json } => cmd_activity_show(&db, date, json)?,
        },
        Commands::Weight { command } => match command {
            WeightCommands::Log {
                value,
                unit,
                date,
                notes,
                json,
            } => cmd_weight_log(&db, value, &unit, date, notes, json)?,
            WeightCommands::Show { date, json } => cmd_weight_show(&db, date, json)?,
            WeightCommands::History { days, json } => cmd_weight_history(&db, days, json)?,
            WeightCommands::Delete { id, json } => cmd_weight_delete(&db, &id, json)?,
        },
        Commands::Target { command } => match command {
            TargetCommands::Set {
                calories,
                tolerance,
                protein,
                carbs,
                fat,
                goal_weight,
                json,
            } => {
                let input = TargetInput {
                    calories,
                    tolerance_pct: tolerance,
                    protein_g: protein,
                    carbs_g: carbs,
                    fat_g: fat,
                    goal_weight_kg: goal_weight,
                };
                cmd_target_set(&db, &input, json)?;
            }
            TargetCommands::Show { json } => cmd_target_show(&db, json)?,
            TargetCommands::Clear { json } => cmd_target_clear(&db, json)?,
        },
        Commands::Report { command } => match command {
            ReportCommands::Weekly { weeks, json } => cmd_report_weekly(&db, weeks, json)?,
            ReportCommands::Monthly { months, json } => cmd_report_monthly(&db, months, json)?,
        },
        Commands::Backup { command } => {
            let settings = config.sync_settings(&db)?;
            match command {
                BackupCommands::Export { file, json } => {
                    cmd_backup_export(&db, &settings, &file, json)?;
                }
                BackupCommands::Import { file, json } => {
                    cmd_backup_import(&db, &settings, &file, json)?;
                }
            }
        }
        Commands::Auth { command } => match command {
            AuthCommands::Login { json } => cmd_auth_login(&config, json).await?,
            AuthCommands::Logout { json } => cmd_auth_logout(&db, &config, json)?,
            AuthCommands::Status { json } => cmd_auth_status(&config, json)?,
        },
    }

    if changed {
        sync_after_change(db, &config).await;
    }
    Ok(())
}
