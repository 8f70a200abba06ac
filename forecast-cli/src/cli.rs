use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use forecast_core::{
    City, CityDirectory, CityId, Config, FieldMask, ForecastProvider, ForecastResolver,
    OpenMeteoProvider, SqliteStore, SyncScheduler, SyncWorker, UserId,
};
use inquire::{CustomType, Text};
use tracing::info;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "forecast", version, about = "Hourly forecast sync for tracked cities")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Update the stored configuration. Prompts for values when no flag is given.
    Configure {
        /// Forecast endpoint, e.g. "https://api.open-meteo.com/v1/forecast".
        #[arg(long)]
        base_url: Option<String>,

        /// HTTP timeout per provider request, in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Pause between refresh cycles, in seconds.
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Upper bound for one city's fetch, in seconds.
        #[arg(long)]
        fetch_timeout_secs: Option<u64>,

        /// SQLite database file.
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Manage tracked cities.
    City {
        #[command(subcommand)]
        command: CityCommand,
    },

    /// Manage users who register cities.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Run a single refresh cycle and exit.
    Sync,

    /// Refresh forecasts on the configured interval until interrupted.
    Run,

    /// Show the stored forecast closest to a point in time.
    Resolve {
        /// City id or exact city name.
        city: String,

        /// Look the name up only among this user's cities.
        #[arg(long)]
        user: Option<i64>,

        /// Target time, RFC 3339 or "YYYY-MM-DDTHH:MM" (UTC). Defaults to now.
        #[arg(long)]
        at: Option<String>,

        /// Comma-separated fields: temperature, wind_speed, humidity, precipitation, all.
        #[arg(long, default_value = "temperature,wind_speed")]
        fields: FieldMask,
    },

    /// Show current conditions for a coordinate pair.
    Current {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
    },
}

#[derive(Debug, Subcommand)]
pub enum CityCommand {
    /// Start tracking a city.
    Add {
        name: String,

        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Id of the user registering the city.
        #[arg(long)]
        user: Option<i64>,
    },

    /// List tracked cities.
    List,

    /// Stop tracking a city and drop its stored forecasts.
    Remove { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    /// Register a user.
    Add { name: String },

    /// List registered users.
    List,

    /// List the cities a user registered.
    Cities { id: i64 },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure {
                base_url,
                timeout_secs,
                interval_secs,
                fetch_timeout_secs,
                database,
            } => {
                let mut cfg = Config::load()?;

                let interactive = base_url.is_none()
                    && timeout_secs.is_none()
                    && interval_secs.is_none()
                    && fetch_timeout_secs.is_none()
                    && database.is_none();

                if interactive {
                    prompt_config(&mut cfg)?;
                } else {
                    if let Some(url) = base_url {
                        cfg.provider.base_url = url;
                    }
                    if let Some(secs) = timeout_secs {
                        cfg.provider.timeout_secs = secs;
                    }
                    if let Some(secs) = interval_secs {
                        cfg.sync.interval_secs = secs;
                    }
                    if let Some(secs) = fetch_timeout_secs {
                        cfg.sync.fetch_timeout_secs = secs;
                    }
                    if let Some(path) = database {
                        cfg.storage.database_path = Some(path);
                    }
                }

                cfg.validate()?;
                cfg.save()?;
                println!("Saved configuration to {}", Config::config_file_path()?.display());
            }
            Command::City { command } => {
                let store = open_store(&Config::load()?).await?;
                run_city_command(&store, command).await?;
            }
            Command::User { command } => {
                let store = open_store(&Config::load()?).await?;
                run_user_command(&store, command).await?;
            }
            Command::Sync => {
                let cfg = Config::load()?;
                let store = open_store(&cfg).await?;
                let cities = store.list_cities().await?;

                let report = sync_worker(&cfg, &store)?.run_cycle().await;
                if let Some(err) = &report.directory_error {
                    return Err(anyhow!("Failed to read tracked cities: {err}"));
                }

                for outcome in &report.outcomes {
                    let name = cities
                        .iter()
                        .find(|c| c.id == outcome.city_id)
                        .map_or("?", |c| c.name.as_str());
                    match &outcome.result {
                        Ok(stored) => {
                            println!("{:>4}  {name}: stored {stored} hours", outcome.city_id)
                        }
                        Err(err) => println!("{:>4}  {name}: FAILED ({err})", outcome.city_id),
                    }
                }
                println!(
                    "{} succeeded, {} failed",
                    report.succeeded().count(),
                    report.failed().count()
                );
            }
            Command::Run => {
                let cfg = Config::load()?;
                let store = open_store(&cfg).await?;

                let mut scheduler =
                    SyncScheduler::new(sync_worker(&cfg, &store)?, cfg.sync.interval());
                scheduler.start()?;

                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
                info!("Received shutdown signal");
                scheduler.stop().await;
            }
            Command::Resolve { city, user, at, fields } => {
                let store = open_store(&Config::load()?).await?;
                let resolver = ForecastResolver::new(store.clone(), store);

                let target = match at {
                    Some(text) => parse_time(&text)?,
                    None => Utc::now(),
                };

                let forecast = match (city.parse::<i64>(), user) {
                    (Ok(id), _) => resolver.resolve(CityId(id), target, fields).await?,
                    (Err(_), Some(user)) => {
                        resolver.resolve_for_user(UserId(user), &city, target, fields).await?
                    }
                    (Err(_), None) => resolver.resolve_by_name(&city, target, fields).await?,
                };

                println!("{}", serde_json::to_string_pretty(&forecast)?);
            }
            Command::Current { lat, lon } => {
                let cfg = Config::load()?;
                let provider = OpenMeteoProvider::new(&cfg.provider)?;
                let current = provider.fetch_current(lat, lon).await?;

                println!("Temperature: {:.1} °C", current.temperature);
                println!("Wind speed:  {:.1} km/h", current.wind_speed);
                match current.pressure {
                    Some(p) => println!("Pressure:    {p:.1} hPa"),
                    None => println!("Pressure:    n/a"),
                }
            }
        }

        Ok(())
    }
}

async fn run_city_command(store: &SqliteStore, command: CityCommand) -> Result<()> {
    match command {
        CityCommand::Add { name, lat, lon, user } => {
            let city = match user {
                Some(user) => store.add_city_for(UserId(user), &name, lat, lon).await?,
                None => store.add_city(&name, lat, lon).await?,
            };
            println!(
                "Added city {} ({}, {}) with id {}",
                city.name, city.latitude, city.longitude, city.id
            );
        }
        CityCommand::List => {
            let cities = store.list_cities().await?;
            if cities.is_empty() {
                println!(
                    "No cities tracked yet.\n\
                     Hint: run `forecast city add <name> --lat <lat> --lon <lon>`."
                );
            }
            print_cities(&cities);
        }
        CityCommand::Remove { id } => {
            if store.remove_city(CityId(id)).await? {
                println!("Removed city {id}");
            } else {
                return Err(anyhow!("No city with id {id}"));
            }
        }
    }

    Ok(())
}

async fn run_user_command(store: &SqliteStore, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add { name } => {
            let user = store.add_user(&name).await?;
            println!("Added user {} with id {}", user.name, user.id);
        }
        UserCommand::List => {
            for user in store.list_users().await? {
                println!("{:>4}  {}", user.id, user.name);
            }
        }
        UserCommand::Cities { id } => {
            let cities = store.cities_for_user(UserId(id)).await?;
            if cities.is_empty() {
                println!("User {id} has not registered any cities.");
            }
            print_cities(&cities);
        }
    }

    Ok(())
}

fn print_cities(cities: &[City]) {
    for city in cities {
        let owner = city.user_id.map(|u| format!("user {u}")).unwrap_or_default();
        println!(
            "{:>4}  {:<20} {:>9.4} {:>9.4}  {owner}",
            city.id, city.name, city.latitude, city.longitude
        );
    }
}

fn prompt_config(cfg: &mut Config) -> Result<()> {
    cfg.provider.base_url = Text::new("Forecast endpoint:")
        .with_default(&cfg.provider.base_url)
        .prompt()?;

    cfg.sync.interval_secs = CustomType::<u64>::new("Refresh interval (seconds):")
        .with_default(cfg.sync.interval_secs)
        .with_error_message("Please type a whole number of seconds")
        .prompt()?;

    cfg.sync.fetch_timeout_secs = CustomType::<u64>::new("Per-city fetch timeout (seconds):")
        .with_default(cfg.sync.fetch_timeout_secs)
        .with_error_message("Please type a whole number of seconds")
        .prompt()?;

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let path = cfg.database_path()?;
    let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn sync_worker(cfg: &Config, store: &Arc<SqliteStore>) -> Result<SyncWorker> {
    let provider = OpenMeteoProvider::new(&cfg.provider).context("Failed to build HTTP client")?;

    Ok(SyncWorker::new(Arc::new(provider), store.clone(), store.clone())
        .with_fetch_timeout(cfg.sync.fetch_timeout()))
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DDTHH:MM[:SS]` taken as UTC.
fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("Could not parse time '{text}'. Use RFC 3339 or YYYY-MM-DDTHH:MM."))
}
