use clap::{Parser, Subcommand};
use regex::Regex;

use invoicedw::storage::repository;
use invoicedw::{
    Database, InvoiceDW, InvoiceKey, PortalClient, SyncFilter, SyncOptions, SyncReport,
};

const DEFAULT_BASE_URL: &str = "https://portal.einvoice.example/api";

#[derive(Parser)]
#[command(name = "invoicedw", about = "E-invoice warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.invoicedw/invoicedw.db)
    #[arg(long)]
    db: Option<String>,

    /// Portal base URL (overrides the stored config value)
    #[arg(long)]
    base_url: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listing page size (default: 50)
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl invoicedw::SyncProgress for StderrProgress {
    fn on_page(&self, processed: usize, total: i64, percent: u8) {
        eprint!("\r  Fetching invoices: {processed}/{total} ({percent}%)   ");
    }

    fn on_records_fetched(&self, count: usize) {
        eprintln!("\n  Fetched {count} invoices");
    }

    fn on_batch(&self, batch: usize, total_batches: usize, percent: u8) {
        if batch == total_batches {
            eprint!("\r  Saving batch {batch}/{total_batches} ({percent}%)   \n");
        } else {
            eprint!("\r  Saving batch {batch}/{total_batches} ({percent}%)   ");
        }
    }

    fn on_complete(&self, report: &SyncReport) {
        eprintln!("  Done: {}", report.message);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync invoices from the portal into the local warehouse
    Sync {
        /// Start date (dd/mm/yyyy)
        #[arg(long)]
        from: Option<String>,

        /// End date (dd/mm/yyyy)
        #[arg(long)]
        to: Option<String>,

        /// Whole month (mm/yyyy); takes precedence over --from/--to
        #[arg(long)]
        month: Option<String>,

        /// Free-text search across seller, buyer and document number
        #[arg(long)]
        search: Option<String>,

        /// Invoice status code filter
        #[arg(long)]
        status: Option<i64>,

        /// Minimum total amount filter
        #[arg(long)]
        min_total: Option<f64>,

        /// Re-save invoices that already exist locally
        #[arg(long)]
        include_existing: bool,

        /// Skip fetching line-item details
        #[arg(long)]
        no_details: bool,

        /// Bearer token (default: $INVOICEDW_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
    /// Re-sync one invoice by its identity
    Retry {
        /// Seller tax id (10 or 10-3 digits)
        seller_tax_id: String,
        /// Series code, e.g. C24T
        series_code: String,
        /// Document number
        document_number: String,
        /// Template code
        template_code: String,

        /// Bearer token (default: $INVOICEDW_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
    /// List stored invoices
    List {
        /// Filter by seller tax id
        #[arg(long)]
        seller: Option<String>,
        /// Filter by issue month (mm/yyyy)
        #[arg(long)]
        month: Option<String>,
        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show warehouse status
    Status,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    let base_url = match &cli.base_url {
        Some(url) => url.clone(),
        None => db
            .reader()
            .call(|conn| repository::get_config(conn, "base_url"))
            .await?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
    };

    let mut client = PortalClient::new(&base_url)?;
    if let Some(size) = cli.page_size {
        client = client.with_page_size(size);
    }
    let dw = InvoiceDW::new(db, client);

    match cli.command {
        Commands::Sync {
            from,
            to,
            month,
            search,
            status,
            min_total,
            include_existing,
            no_details,
            token,
        } => {
            let token = resolve_token(token)?;
            let filter = build_filter(from, to, month, search, status, min_total)?;
            let options = SyncOptions {
                skip_existing: !include_existing,
                include_details: !no_details,
                ..SyncOptions::default()
            };

            let report = dw.sync(&token, &filter, &options, &StderrProgress).await?;
            print_report(&report);
        }
        Commands::Retry {
            seller_tax_id,
            series_code,
            document_number,
            template_code,
            token,
        } => {
            let token = resolve_token(token)?;
            let key = validated_key(seller_tax_id, series_code, document_number, template_code)?;

            let report = dw
                .retry_invoice(&token, &key, &SyncOptions::default())
                .await?;
            print_report(&report);
        }
        Commands::List {
            seller,
            month,
            limit,
            json,
        } => {
            handle_list(&dw, seller.as_deref(), month.as_deref(), limit, json).await?;
        }
        Commands::Status => {
            print_status(&dw).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => match dw.config_get(&key).await? {
                Some(value) => println!("{value}"),
                None => println!("(not set)"),
            },
            ConfigAction::Set { key, value } => {
                dw.config_set(&key, &value).await?;
            }
            ConfigAction::List => {
                for (key, value) in dw.config_list().await? {
                    println!("{key} = {value}");
                }
            }
        },
    }

    Ok(())
}

fn resolve_token(flag: Option<String>) -> anyhow::Result<String> {
    if let Some(token) = flag {
        return Ok(token);
    }
    std::env::var("INVOICEDW_TOKEN")
        .map_err(|_| anyhow::anyhow!("no bearer token. Pass --token or set INVOICEDW_TOKEN"))
}

fn build_filter(
    from: Option<String>,
    to: Option<String>,
    month: Option<String>,
    search: Option<String>,
    status: Option<i64>,
    min_total: Option<f64>,
) -> anyhow::Result<SyncFilter> {
    let mut filter = SyncFilter::new();

    if let Some(month) = month {
        let (m, y) = parse_month(&month)?;
        filter = filter.month(y, m);
    } else {
        if let Some(from) = from {
            let date = invoicedw::date_util::parse_ddmmyyyy(&from)
                .ok_or_else(|| anyhow::anyhow!("invalid --from date (expected dd/mm/yyyy): {from}"))?;
            filter = filter.from_date(date);
        }
        if let Some(to) = to {
            let date = invoicedw::date_util::parse_ddmmyyyy(&to)
                .ok_or_else(|| anyhow::anyhow!("invalid --to date (expected dd/mm/yyyy): {to}"))?;
            filter = filter.to_date(date);
        }
    }

    if let Some(search) = search {
        filter = filter.search(search);
    }
    if let Some(status) = status {
        filter = filter.status(status);
    }
    if let Some(min_total) = min_total {
        filter = filter.min_total(min_total);
    }
    Ok(filter)
}

fn parse_month(s: &str) -> anyhow::Result<(u32, i32)> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        if let (Ok(m), Ok(y)) = (parts[0].parse::<u32>(), parts[1].parse::<i32>()) {
            if (1..=12).contains(&m) {
                return Ok((m, y));
            }
        }
    }
    anyhow::bail!("invalid --month (expected mm/yyyy): {s}")
}

fn validated_key(
    seller_tax_id: String,
    series_code: String,
    document_number: String,
    template_code: String,
) -> anyhow::Result<InvoiceKey> {
    let tax_id_re = Regex::new(r"^\d{10}(-\d{3})?$").unwrap();
    if !tax_id_re.is_match(&seller_tax_id) {
        anyhow::bail!("invalid seller tax id: {seller_tax_id}");
    }
    let doc_re = Regex::new(r"^\d{1,8}$").unwrap();
    if !doc_re.is_match(&document_number) {
        anyhow::bail!("invalid document number: {document_number}");
    }
    Ok(InvoiceKey::new(
        seller_tax_id,
        series_code,
        document_number,
        template_code,
    ))
}

fn print_report(report: &SyncReport) {
    println!("{}", report.message);
    if !report.errors.is_empty() {
        eprintln!("Errors ({}):", report.errors.len());
        for error in report.errors.iter().take(10) {
            eprintln!("  - {error}");
        }
        if report.errors.len() > 10 {
            eprintln!("  ... and {} more (see logs)", report.errors.len() - 10);
        }
    }
    if !report.success() {
        std::process::exit(1);
    }
}

async fn handle_list(
    dw: &InvoiceDW,
    seller: Option<&str>,
    month: Option<&str>,
    limit: u32,
    json: bool,
) -> anyhow::Result<()> {
    let seller = seller.map(str::to_string);
    let month = month.map(str::to_string);
    let rows = dw
        .db()
        .reader()
        .call(move |conn| {
            repository::list_invoices(conn, seller.as_deref(), month.as_deref(), limit)
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No invoices stored.");
        return Ok(());
    }
    for row in rows {
        println!(
            "{:>6}  {}  {}{}/{:<8}  {:<12}  {:>14}  {}",
            row.invoice_id,
            row.issue_date.as_deref().unwrap_or("          "),
            row.template_code,
            row.series_code,
            row.document_number,
            row.seller_tax_id,
            row.total_amount
                .map(|v| format!("{v:.0}"))
                .unwrap_or_default(),
            row.seller_name.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

async fn print_status(dw: &InvoiceDW) -> anyhow::Result<()> {
    let (invoices, details, jobs) = dw
        .db()
        .reader()
        .call(|conn| {
            let invoices = repository::count_invoices(conn)?;
            let details = repository::count_details(conn)?;
            let jobs = repository::list_recent_jobs(conn, 5)?;
            Ok::<_, rusqlite::Error>((invoices, details, jobs))
        })
        .await?;

    println!("Invoices stored: {invoices}");
    println!("Detail lines:    {details}");

    if jobs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }
    println!("Recent sync runs:");
    for job in jobs {
        println!(
            "  #{} [{}] saved {} invoices / {} details  ({})",
            job.job_id,
            job.status,
            job.invoices_saved,
            job.details_saved,
            job.finished_at.as_deref().unwrap_or("running"),
        );
    }
    Ok(())
}
