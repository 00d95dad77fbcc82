use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_playground::config::Config;
use sandbox_playground::host::{HostController, RunStatus};
use sandbox_playground::sandbox::process::ProcessMount;
use sandbox_playground::sandbox::MessageBus;

const DEFAULT_CONFIG_PATH: &str = "config/playground.toml";

fn print_help() {
    println!(
        "\
sandbox-playground v{}

Runs untrusted JavaScript in an isolated renderer and prints what it logged.

USAGE:
    sandbox-playground [OPTIONS] <SCRIPT>

ARGUMENTS:
    SCRIPT    JavaScript file to run

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file
                           [default: {DEFAULT_CONFIG_PATH}]
        --html <PATH>      Markup to render before the script runs (preview mode)
        --css <PATH>       Style sheet for the markup (preview mode)
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, sandbox_playground=debug,warn)

EXAMPLES:
    sandbox-playground hello.js
    sandbox-playground --html page.html --css page.css app.js
    RUST_LOG=debug sandbox-playground -c /etc/playground.toml hello.js",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, PartialEq)]
struct Cli {
    config: String,
    html: Option<String>,
    css: Option<String>,
    script: String,
}

impl Cli {
    fn is_preview(&self) -> bool {
        self.html.is_some() || self.css.is_some()
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut config = DEFAULT_CONFIG_PATH.to_string();
    let mut html = None;
    let mut css = None;
    let mut script = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow!("Missing value for {flag}"))
        };
        match arg.as_str() {
            "-c" | "--config" => config = value(&arg)?,
            "--html" => html = Some(value(&arg)?),
            "--css" => css = Some(value(&arg)?),
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(anyhow!("Unknown option: {flag}"));
            }
            _ if script.is_some() => {
                return Err(anyhow!("Unexpected argument: {arg}"));
            }
            _ => script = Some(arg),
        }
    }

    let script = script.ok_or_else(|| anyhow!("Missing SCRIPT argument (see --help)"))?;
    Ok(Cli {
        config,
        html,
        css,
        script,
    })
}

fn read_source(path: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| anyhow!("Cannot read {path}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandbox-playground v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr, the run's output to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_playground=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;

    info!("Loading configuration from {}", cli.config);
    let config = Config::load(&cli.config)?;
    info!("Renderer: {}", config.renderer.command_line());

    let script = read_source(&cli.script)?;
    let bus = MessageBus::new();
    let mount = ProcessMount::new(config.renderer.clone(), bus.clone());
    let mut host = HostController::new(mount, bus);

    if cli.is_preview() {
        let markup = cli.html.as_deref().map(read_source).transpose()?;
        let style = cli.css.as_deref().map(read_source).transpose()?;
        info!("Running {} in preview mode", cli.script);
        host.run_preview(
            markup.as_deref().unwrap_or_default(),
            style.as_deref().unwrap_or_default(),
            &script,
        );
    } else {
        info!("Running {}", cli.script);
        host.run_code(&script);
    }

    let mut status = host.watch_status();
    let settled = tokio::select! {
        result = status.wait_for(|s| s.is_settled()) => result.map(|s| *s).ok(),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, discarding the run");
            None
        }
    };

    host.dispose();
    println!("{}", host.log().render(config.output.timestamps));

    match settled {
        Some(RunStatus::Error) => {
            error!("Run finished with status: {}", RunStatus::Error.label());
            Err(anyhow!("Run failed"))
        }
        Some(status) => {
            info!("Run finished with status: {}", status.label());
            Ok(())
        }
        None => Ok(()),
    }
}
