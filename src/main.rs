use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Result, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use inmo_sync::admission::{RateLimiter, RequestQueue};
use inmo_sync::backend::types::{ListingCategory, Property};
use inmo_sync::backend::{AuthClient, Backend, ObjectStorage, RestClient, Session};
use inmo_sync::db::LocalStore;
use inmo_sync::media::MediaUploader;
use inmo_sync::migrate::ImageMigrator;
use inmo_sync::query::{self, InfiniteQuery, QueryClient};
use inmo_sync::realtime::{PollingFeed, RealtimeSync, Subscription};
use inmo_sync::submissions::{NewSubmission, SubmissionStatus, SubmissionStore};
use inmo_sync::{logging, CacheStore, Config, PropertyApi};

/// Local store key for the signed-in session.
const SESSION_KEY: &str = "session";

#[derive(Parser, Debug)]
#[command(name = "inmo")]
#[command(about = "Browse and maintain real-estate listings from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./inmo.yaml, then $XDG_CONFIG_HOME/inmo/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List listings, newest first
  List {
    /// Only listings in this category (sale, rent, special, clearance, exclusive-private)
    #[arg(long)]
    category: Option<ListingCategory>,
  },
  /// Show one listing
  Show { id: i64 },
  /// Page through listings
  Browse {
    /// Pages to load
    #[arg(long, default_value_t = 2)]
    pages: usize,
  },
  /// Print listing changes as they happen
  Watch {
    /// Stop after this many changes
    #[arg(long)]
    events: Option<usize>,
  },
  /// Move inline images into object storage (admin only)
  MigrateImages {
    #[arg(long)]
    dry_run: bool,
  },
  /// Sign in; the password is read from INMO_PASSWORD
  Login {
    #[arg(long)]
    email: String,
  },
  /// Manage owner submissions
  Submissions {
    #[command(subcommand)]
    action: SubmissionAction,
  },
}

#[derive(Subcommand, Debug)]
enum SubmissionAction {
  List,
  /// Add a submission from a JSON file
  Add { file: PathBuf },
  /// Move a submission to a new status
  Status { id: String, status: SubmissionStatus },
  Delete { id: String },
}

/// Everything a command may need, wired from the config.
struct Context {
  config: Config,
  rest: RestClient,
  store: Arc<LocalStore>,
  api: PropertyApi,
  client: Arc<QueryClient>,
}

impl Context {
  fn new(config: Config) -> Result<Self> {
    let rest = RestClient::from_config(&config)?;
    let store = Arc::new(LocalStore::open()?);

    if let Some(session) = store.get::<Session>(SESSION_KEY)? {
      info!(email = %session.user.email, "Using stored session");
      rest.set_access_token(Some(session.access_token));
    }

    let limiter = Arc::new(RateLimiter::new(
      config.limits.max_requests,
      config.rate_window(),
    ));
    // Detached; runs for the life of the process
    let _sweeper = limiter.spawn_cleanup(Duration::from_secs(config.limits.cleanup_secs.max(1)));

    let backend: Arc<dyn Backend> = Arc::new(rest.clone());
    let api = PropertyApi::new(
      backend,
      &config.backend.table,
      limiter,
      RequestQueue::new(config.limits.max_concurrent),
      config.retry_config(),
    );
    let client = Arc::new(QueryClient::new(
      Arc::new(CacheStore::new(config.cache_ttl())),
      config.dedup_window(),
    ));

    Ok(Self {
      config,
      rest,
      store,
      api,
      client,
    })
  }

  fn submissions(&self) -> SubmissionStore {
    SubmissionStore::new(self.store.clone(), &self.config.backend.submissions_key)
  }
}

fn print_row(property: &Property) {
  println!(
    "{:>6}  {:<40}  {:>16}  {:<20}  {}",
    property.id,
    property.title,
    property.price_display,
    property.location,
    property.category
  );
}

fn print_detail(property: &Property) {
  println!("#{} {}", property.id, property.title);
  println!("  {} | {} | {}", property.location, property.price_display, property.area_display);
  println!(
    "  {} | {} bedrooms | {} bathrooms | {} | {}",
    property.property_type,
    property.bedrooms,
    property.bathrooms,
    property.status.as_str(),
    property.category
  );
  if !property.features.is_empty() {
    println!("  features: {}", property.features.join(", "));
  }
  if let Some(agent) = &property.agent {
    println!("  agent: {}", agent.name);
  }
  if !property.description.is_empty() {
    println!();
    println!("{}", property.description);
  }
}

async fn list(ctx: &Context, category: Option<ListingCategory>) -> Result<()> {
  let mut hook = match category {
    Some(category) => query::category_query(&ctx.client, &ctx.api, category),
    None => query::properties_query(&ctx.client, &ctx.api),
  };
  hook.start();
  let snapshot = hook.wait().await;
  if let Some(e) = snapshot.error {
    return Err(e).wrap_err("Failed to load listings");
  }
  for property in snapshot.data.unwrap_or_default() {
    print_row(&property);
  }
  Ok(())
}

async fn show(ctx: &Context, id: i64) -> Result<()> {
  let mut hook = query::property_query(&ctx.client, &ctx.api, id);
  hook.start();
  let snapshot = hook.wait().await;
  if let Some(e) = snapshot.error {
    return Err(e).wrap_err_with(|| format!("Failed to load listing {}", id));
  }
  match snapshot.data.flatten() {
    Some(property) => print_detail(&property),
    None => bail!("Listing {} not found", id),
  }
  Ok(())
}

async fn browse(ctx: &Context, pages: usize) -> Result<()> {
  let mut scroll = InfiniteQuery::new(
    ctx.client.clone(),
    ctx.api.clone(),
    ctx.config.pagination.page_size,
  );
  scroll.load_first().await?;
  while scroll.page_count() < pages && scroll.load_more().await? {}

  for property in scroll.items() {
    print_row(&property);
  }
  println!(
    "-- {} pages, {} of {} listings{}",
    scroll.page_count(),
    scroll.items().len(),
    scroll.total().unwrap_or(0),
    if scroll.has_more() { ", more available" } else { "" }
  );
  Ok(())
}

async fn watch(ctx: &Context, limit: Option<usize>) -> Result<()> {
  let sync = Arc::new(
    RealtimeSync::new(ctx.client.clone(), ctx.api.clone())
      .with_debounce(ctx.config.realtime_debounce()),
  );
  let mut changes = sync.subscribe();
  let feed = PollingFeed::new(
    Arc::new(ctx.rest.clone()),
    &ctx.config.backend.table,
    ctx.config.poll_interval(),
  );
  let subscription = Subscription::spawn(feed, sync.clone(), ctx.config.reconnect_config());

  println!("Watching '{}' for changes (ctrl-c to stop)", ctx.config.backend.table);
  let mut seen = 0;
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      change = changes.recv() => match change {
        Ok(event) => {
          seen += 1;
          println!("{:?} #{}", event.event_type, event.id().unwrap_or_default());
          if limit.is_some_and(|n| seen >= n) {
            break;
          }
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Watcher fell behind");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  let state = subscription.disconnect().await;
  info!(?state, seen, "Stopped watching");
  Ok(())
}

async fn migrate_images(ctx: &Context, dry_run: bool) -> Result<()> {
  match ctx.store.get::<Session>(SESSION_KEY)? {
    Some(session) if session.user.is_admin() => {}
    Some(_) => bail!("Image migration requires an admin account"),
    None => bail!("Not signed in. Run `inmo login --email <email>` first"),
  }

  let storage: Arc<dyn ObjectStorage> = Arc::new(ctx.rest.clone());
  let uploader = MediaUploader::new(
    storage,
    &ctx.config.storage.bucket,
    &ctx.config.storage.cache_control,
  );
  let report = ImageMigrator::new(ctx.api.clone(), uploader)
    .run(dry_run)
    .await?;

  if report.dry_run {
    println!("{} listings have inline images: {:?}", report.candidates.len(), report.candidates);
  } else {
    println!(
      "migrated {}, skipped {}, failed {}",
      report.migrated, report.skipped, report.failed
    );
  }
  Ok(())
}

async fn login(ctx: &Context, email: &str) -> Result<()> {
  let password = Config::get_password()?;
  let auth = AuthClient::new(ctx.rest.clone());
  let user = auth.login(email, &password).await?;

  if let Some(session) = auth.current_session() {
    ctx.store.set(SESSION_KEY, &session)?;
  }
  println!("Signed in as {} ({:?})", user.email, user.role);
  Ok(())
}

fn submissions(ctx: &Context, action: SubmissionAction) -> Result<()> {
  let store = ctx.submissions();
  match action {
    SubmissionAction::List => {
      for s in store.list()? {
        println!(
          "{}  {:<10}  {}  {} <{}>  {}",
          s.id,
          s.status,
          s.created_at.format("%Y-%m-%d"),
          s.owner.name,
          s.owner.email,
          s.property.location
        );
      }
    }
    SubmissionAction::Add { file } => {
      let raw = std::fs::read_to_string(&file)
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
      let input: NewSubmission = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("Invalid submission in {}", file.display()))?;
      let created = store.create(input)?;
      println!("Created submission {}", created.id);
    }
    SubmissionAction::Status { id, status } => {
      let updated = store.set_status(&id, status)?;
      println!("{} is now {}", updated.id, updated.status);
    }
    SubmissionAction::Delete { id } => {
      if !store.delete(&id)? {
        bail!("Submission {} not found", id);
      }
      println!("Deleted {}", id);
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let ctx = Context::new(config)?;

  match args.command {
    Command::List { category } => list(&ctx, category).await,
    Command::Show { id } => show(&ctx, id).await,
    Command::Browse { pages } => browse(&ctx, pages).await,
    Command::Watch { events } => watch(&ctx, events).await,
    Command::MigrateImages { dry_run } => migrate_images(&ctx, dry_run).await,
    Command::Login { email } => login(&ctx, &email).await,
    Command::Submissions { action } => submissions(&ctx, action),
  }
}
