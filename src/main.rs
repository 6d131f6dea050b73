use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;
use veil::Redact;

use mpdhub::{
    client::Client,
    config::Config,
    hub::{Hub, Resource},
    images::{AlbumArt, ImageBackend, ImageBatch},
    signal,
    watcher::Watcher,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Bound on stopping background work at exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Default, PartialEq, Parser, Redact)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Options given on the command line take precedence over the file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        value_hint = ValueHint::FilePath,
        env = "MPDHUB_CONFIG"
    )]
    config: Option<String>,

    /// Server address
    ///
    /// Either `host:port` or the path of a local socket.
    ///
    /// [default: localhost:6600]
    #[arg(short, long, value_hint = ValueHint::Hostname, env = "MPD_HOST")]
    address: Option<String>,

    /// Server password
    #[redact]
    #[arg(long, env = "MPD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Bound on every request to the server, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 10.0)]
    timeout: f64,

    /// Do not fetch album art
    #[arg(long, default_value_t = false)]
    no_images: bool,

    /// Print a resource to standard output every time it changes
    ///
    /// One of: status, current, queue, stats, outputs, library, playlists.
    #[arg(long, value_name = "RESOURCE", value_parser = parse_resource)]
    follow: Option<Resource>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

fn parse_resource(name: &str) -> Result<Resource, String> {
    Resource::from_name(name).ok_or_else(|| format!("unknown resource {name:?}"))
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("mpdhub", level);
    }

    logger.init();
}

/// Merges the command line over the configuration file, if any.
fn load_config(args: &Args) -> mpdhub::error::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(address) = &args.address {
        config.address.clone_from(address);
    }
    if args.password.is_some() {
        config.password.clone_from(&args.password);
    }

    config.validate()?;
    Ok(config)
}

/// Waits for `resource` to change; never resolves without one.
async fn follow(hub: &Hub, resource: Option<Resource>) -> Resource {
    match resource {
        Some(resource) => {
            hub.cache(resource).changed().await;
            resource
        }
        None => std::future::pending().await,
    }
}

/// Main application loop.
///
/// Connects, keeps the caches fresh until a shutdown signal arrives, then
/// stops everything in reverse order.
///
/// # Errors
///
/// Returns an error when the server cannot be reached at startup, or when
/// shutting down fails.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    let timeout = Duration::try_from_secs_f64(args.timeout)?;
    debug!("{config:?}");

    let client = Arc::new(Client::connect(&config).await?);
    info!(
        "connected to {} (protocol {})",
        config.address,
        client.version()
    );
    let (watcher, events) = Watcher::connect(&config).await?;

    let images = (!args.no_images).then(|| {
        let album_art = AlbumArt::new(Arc::clone(&client), "/images", timeout);
        Arc::new(ImageBatch::new(vec![
            Arc::new(album_art) as Arc<dyn ImageBackend>
        ]))
    });

    let hub = Arc::new(Hub::new(Arc::clone(&client), images.clone(), timeout));
    let stop = CancellationToken::new();
    let updater = tokio::spawn({
        let hub = Arc::clone(&hub);
        let stop = stop.clone();
        async move { hub.run(events, stop).await }
    });

    let mut signals = signal::Handler::new()?;
    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            request = signals.recv() => {
                if request.is_shutdown() {
                    info!("{request} received, shutting down gracefully");
                    break;
                }
                info!("{request} received, refreshing everything");
                hub.refresh_all().await;
            }

            resource = follow(&hub, args.follow) => {
                println!("{}", String::from_utf8_lossy(&hub.cache(resource).get().body));
            }
        }
    }

    stop.cancel();
    updater.await?;

    if let Some(images) = images {
        if let Err(e) = images.shutdown(SHUTDOWN_TIMEOUT).await {
            warn!("{e}");
        }
    }
    watcher.close(SHUTDOWN_TIMEOUT).await?;
    client.close().await?;

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
