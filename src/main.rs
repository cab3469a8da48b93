use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use dm_sweeper::testing::{RowKind, ThreadSimulator};
use dm_sweeper::{Config, Controller, RunMode, RunReport, SharedDocument};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let mode = Arg::new("mode")
        .long("mode")
        .value_parser(["unsend", "delete"])
        .default_value("unsend")
        .help("Action performed on every own message");

    Command::new("dm-sweeper")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Unsends or deletes your own messages in a direct-message thread")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(clap::ArgAction::SetTrue)
                .help("Log at debug level unless RUST_LOG says otherwise"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("chrome")
                .about("Run against a conversation open in Chrome")
                .arg(
                    Arg::new("url")
                        .long("url")
                        .required(true)
                        .help("Address of the conversation thread"),
                )
                .arg(
                    Arg::new("connect")
                        .long("connect")
                        .value_name("WS_URL")
                        .help("Attach to a running browser through its debugger endpoint"),
                )
                .arg(
                    Arg::new("profile")
                        .long("profile")
                        .value_name("DIR")
                        .help("Browser profile directory holding the logged-in session"),
                )
                .arg(
                    Arg::new("headless")
                        .long("headless")
                        .action(clap::ArgAction::SetTrue)
                        .help("Run browser in headless mode"),
                )
                .arg(mode.clone()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run against a simulated conversation")
                .arg(
                    Arg::new("rows")
                        .long("rows")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("6")
                        .help("Messages per page"),
                )
                .arg(
                    Arg::new("pages")
                        .long("pages")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1")
                        .help("Older pages to load beyond the first"),
                )
                .arg(
                    Arg::new("stop-after-ms")
                        .long("stop-after-ms")
                        .value_parser(clap::value_parser!(u64))
                        .help("Request a stop after this many milliseconds"),
                )
                .arg(mode),
        )
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => Ok(Config::default()),
    }
}

fn run_mode(matches: &ArgMatches) -> anyhow::Result<RunMode> {
    let raw = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("unsend");
    raw.parse::<RunMode>().map_err(anyhow::Error::msg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"));
    let mut config = load_config(&matches)?;

    let report = match matches.subcommand() {
        Some(("chrome", sub)) => run_chrome(sub, &mut config).await?,
        Some(("simulate", sub)) => run_simulation(sub, config).await?,
        _ => bail!("no subcommand given"),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(feature = "chrome")]
async fn run_chrome(matches: &ArgMatches, config: &mut Config) -> anyhow::Result<RunReport> {
    use dm_sweeper::engine::{SubscriptionRegistry, Waiter};
    use dm_sweeper::{ChromeDocument, LayoutRegistry};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::warn;
    use tokio_util::sync::CancellationToken;

    let raw_url = matches
        .get_one::<String>("url")
        .context("--url is required")?;
    let url = url::Url::parse(raw_url).with_context(|| format!("invalid url {}", raw_url))?;
    if !url.path().starts_with("/direct/t/") {
        warn!(%url, "address does not look like a direct-message thread");
    }
    if matches.get_flag("headless") {
        config.browser.headless = true;
    }
    if let Some(ws_url) = matches.get_one::<String>("connect") {
        config.browser.debugger_ws_url = Some(ws_url.clone());
    }
    if let Some(dir) = matches.get_one::<String>("profile") {
        config.browser.user_data_dir = Some(PathBuf::from(dir));
    }
    let mode = run_mode(matches)?;

    let document = Arc::new(ChromeDocument::launch(&config.browser).await?);
    document.open(url.as_str()).await?;
    info!(url = %document.url(), "page loaded");

    // The thread renders some time after navigation settles.
    let layout = LayoutRegistry::default()
        .detect(document.as_ref(), &config.run.fallback_language)
        .await?;
    let waiter = Waiter::new(
        document.clone(),
        SubscriptionRegistry::new(),
        CancellationToken::new(),
    );
    waiter
        .appearance(
            None,
            layout.messages_root.clone(),
            Some(Duration::from_millis(config.browser.navigation_timeout_ms)),
        )
        .await
        .context("conversation did not render; is the session logged in?")?;

    let shared: SharedDocument = document;
    run_until_done(Controller::new(shared, config.clone()), mode, None).await
}

#[cfg(not(feature = "chrome"))]
async fn run_chrome(_matches: &ArgMatches, _config: &mut Config) -> anyhow::Result<RunReport> {
    bail!("built without the `chrome` feature")
}

async fn run_simulation(matches: &ArgMatches, config: Config) -> anyhow::Result<RunReport> {
    let per_page = matches.get_one::<usize>("rows").copied().unwrap_or(6);
    let pages = matches.get_one::<usize>("pages").copied().unwrap_or(1);
    let stop_after = matches
        .get_one::<u64>("stop-after-ms")
        .map(|ms| Duration::from_millis(*ms));
    let mode = run_mode(matches)?;

    let page: Vec<RowKind> = (0..per_page)
        .map(|i| if i % 3 == 1 { RowKind::Theirs } else { RowKind::Mine })
        .collect();
    let mut builder = ThreadSimulator::builder().rows(&page);
    for _ in 0..pages {
        builder = builder.older_page(&page);
    }
    let sim = builder.build()?;
    info!(rows = sim.rows().len(), pages, "simulated conversation ready");

    run_until_done(Controller::new(sim.shared(), config), mode, stop_after).await
}

/// Runs to the end, stopping early on Ctrl-C or after `stop_after`.
async fn run_until_done(
    controller: Controller,
    mode: RunMode,
    stop_after: Option<Duration>,
) -> anyhow::Result<RunReport> {
    let handle = controller.start(mode)?;

    let stopper = controller.clone();
    tokio::spawn(async move {
        let deadline = async {
            match stop_after {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = deadline => info!("stop deadline reached"),
        }
        stopper.stop();
    });

    let report = handle.await.context("run task panicked")?;
    info!(status = %controller.status_line(), "finished");
    Ok(report)
}
