use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use widget_sandbox::config::Config;
use widget_sandbox::host::SessionToken;
use widget_sandbox::sandbox::{self, DocumentOptions, WidgetTemplate};

fn print_help() {
    println!(
        "\
widget-sandbox v{}

Builds and checks sandboxed widget documents.

USAGE:
    widget-sandbox [OPTIONS] <COMMAND>

COMMANDS:
    build TEMPLATE.json    Print the guest document for a template
    check TEMPLATE.json    Validate a template and print a summary

OPTIONS:
    -c, --config PATH    TOML configuration file [default: built-in defaults]
    -t, --token HEX      Session token for `build` [default: random]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG    Log level filter for tracing
                (e.g. debug, widget_sandbox=debug,warn)

EXAMPLES:
    widget-sandbox check widgets/keys.json
    widget-sandbox --config sandbox.toml build widgets/keys.json > keys.html
    RUST_LOG=debug widget-sandbox build widgets/keys.json",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Build { template: String, token: Option<String> },
    Check { template: String },
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<String>,
    command: Command,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut config = None;
    let mut token = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            "--token" | "-t" => {
                token = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a value"))?);
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match (positional.next().as_deref(), positional.next()) {
        (Some("build"), Some(template)) => Command::Build { template, token },
        (Some("check"), Some(template)) => {
            if token.is_some() {
                bail!("--token only applies to `build`");
            }
            Command::Check { template }
        }
        (Some(cmd @ ("build" | "check")), None) => bail!("`{cmd}` needs a TEMPLATE.json path"),
        (Some(other), _) => bail!("unknown command: {other}"),
        (None, _) => bail!("missing command (try --help)"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {extra}");
    }

    Ok(Args { config, command })
}

fn load_template(path: &str, config: &Config) -> Result<WidgetTemplate> {
    let expanded = shellexpand::tilde(path);
    let raw = std::fs::read_to_string(Path::new(expanded.as_ref()))
        .with_context(|| format!("Failed to read template: {path}"))?;
    let template: WidgetTemplate = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse template: {path}"))?;
    template
        .normalized(&config.limits)
        .map_err(|e| anyhow!("Invalid template {path}: {e}"))
}

fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("widget-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so `build` output can be redirected
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("widget_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };
    debug!("Retry ladder: {:?}", config.delivery.retry_ladder_ms);

    match args.command {
        Command::Build { template, token } => {
            let template = load_template(&template, &config)?;
            let token = match token {
                Some(raw) => SessionToken::parse(&raw)?,
                None => SessionToken::generate(),
            };
            let doc = sandbox::build(&template, &token, None, &DocumentOptions::from(&config))?;
            info!(
                "Built {} ({} bytes, sandbox=\"{}\")",
                template.id,
                doc.source.len(),
                doc.sandbox
            );
            println!("{}", doc.source);
        }
        Command::Check { template } => {
            let template = load_template(&template, &config)?;
            let height = template
                .height_px
                .map(|h| format!("{h}px fixed"))
                .unwrap_or_else(|| "auto".to_string());
            println!("id:      {}", template.id);
            println!("name:    {}", template.name);
            println!("height:  {height}");
            println!(
                "sizes:   html {} / css {} / js {} chars",
                template.html.chars().count(),
                template.css.chars().count(),
                template.js.chars().count()
            );
            println!("status:  ok");
        }
    }

    Ok(())
}
