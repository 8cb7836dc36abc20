use clap::Parser;
use dotenv::dotenv;
use feedrecon::drift::FallbackPolicy;
use feedrecon::report::{print_account_table, print_run_report};
use feedrecon::{
    InterruptFlag, Pass, ReconcileConfig, ReconcileError, ReplayExtractor, RunReport, Session, SessionContext,
    Snapshot, Strategy,
};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "feedrecon")]
#[command(about = "Reconcile two extraction passes per account into one append-only store", long_about = None)]
struct Cli {
    /// Accounts to reconcile, in order
    #[arg(required_unless_present = "resume")]
    accounts: Vec<String>,

    /// Continue an interrupted run from its snapshot
    #[arg(long, conflicts_with = "accounts")]
    resume: Option<PathBuf>,

    /// Directory of recorded passes (<dir>/<account>/primary.json, secondary.json)
    #[arg(long, env = "FEEDRECON_REPLAY_DIR", default_value = "./recordings")]
    replay_dir: PathBuf,

    /// Cookie header or tab-separated cookie export for the main session
    #[arg(long, env = "FEEDRECON_COOKIES", hide_env_values = true)]
    cookies: Option<String>,

    /// Keep only cookies for this domain when parsing an export
    #[arg(long, env = "FEEDRECON_COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    /// JSON configuration; flags below override it
    #[arg(long, env = "FEEDRECON_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "FEEDRECON_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(long, env = "FEEDRECON_STORE_DIR")]
    store_dir: Option<PathBuf>,

    #[arg(long, env = "FEEDRECON_FALLBACK_DIR")]
    fallback_dir: Option<PathBuf>,

    /// Tolerances to try, e.g. 0.1,0.2
    #[arg(long = "tolerance", value_delimiter = ',')]
    tolerances: Vec<f64>,

    /// Strategies to try (default: all)
    #[arg(long = "strategy", value_enum, value_delimiter = ',')]
    strategies: Vec<Strategy>,

    #[arg(long)]
    driver_metric: Option<String>,

    #[arg(long)]
    align_metric: Option<String>,

    #[arg(long)]
    dispute_threshold: Option<f64>,

    #[arg(long, value_enum)]
    fallback_policy: Option<FallbackPolicy>,

    /// Pass whose records must all appear in the output
    #[arg(long, value_enum)]
    anchor_pass: Option<Pass>,

    /// Items each account should yield; short accounts are reported
    #[arg(long)]
    expected_items: Option<usize>,

    /// Print every reconciled account's merged table
    #[arg(long)]
    tables: bool,
}

impl Cli {
    fn reconcile_config(&self) -> Result<ReconcileConfig, ReconcileError> {
        let mut config = match &self.config {
            Some(path) => ReconcileConfig::load(path)?,
            None => match &self.state_dir {
                Some(dir) => ReconcileConfig::with_base_dir(dir),
                None => ReconcileConfig::default(),
            },
        };
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(dir) = &self.store_dir {
            config.store_dir = dir.clone();
        }
        if let Some(dir) = &self.fallback_dir {
            config.fallback_dir = dir.clone();
        }
        if !self.tolerances.is_empty() {
            config.tolerances = self.tolerances.clone();
        }
        if !self.strategies.is_empty() {
            config.strategies = self.strategies.clone();
        }
        if let Some(m) = &self.driver_metric {
            config.driver_metric = m.clone();
        }
        if let Some(m) = &self.align_metric {
            config.align_metric = m.clone();
        }
        if let Some(t) = self.dispute_threshold {
            config.dispute_threshold = t;
        }
        if let Some(p) = self.fallback_policy {
            config.fallback_policy = p;
        }
        if let Some(p) = self.anchor_pass {
            config.anchor_pass = p;
        }
        if self.expected_items.is_some() {
            config.expected_items = self.expected_items;
        }
        config.validate()?;
        Ok(config)
    }

    fn extractor(&self) -> Result<ReplayExtractor, ReconcileError> {
        let context = match &self.cookies {
            Some(text) => SessionContext::parse("main", text, self.cookie_domain.as_deref())?,
            None => SessionContext::anonymous(),
        };
        let extractor = ReplayExtractor::new(context, &self.replay_dir);
        Ok(match &self.cookie_domain {
            Some(domain) => extractor.with_domain_filter(domain.clone()),
            None => extractor,
        })
    }
}

fn run(cli: &Cli) -> Result<RunReport, ReconcileError> {
    let config = cli.reconcile_config()?;
    let extractor = cli.extractor()?;
    let interrupt = InterruptFlag::install_ctrlc()?;

    let mut session = match &cli.resume {
        Some(path) => Session::resume(&config, extractor, interrupt, Snapshot::load(path)?),
        None => Session::new(&config, extractor, interrupt, cli.accounts.clone()),
    };
    let report = session.run()?;

    if cli.tables {
        for result in &session.state().completed {
            print_account_table(result);
            println!();
        }
    }
    Ok(report)
}

fn main() {
    dotenv().ok();
    feedrecon::init_tracing("feedrecon");
    let cli = Cli::parse();

    match run(&cli) {
        Ok(report) => {
            print_run_report(&report);
            std::process::exit(report.exit_code());
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("[feedrecon] {}", e);
            std::process::exit(1);
        }
    }
}
