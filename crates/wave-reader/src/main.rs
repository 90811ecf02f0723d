//! wave-reader: drive the background dispatcher and the message router from
//! the command line.
//!
//! Both `dispatch` and `route` read one JSON document per line and print one
//! JSON result per line on stdout. Logs go to stderr.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use wave_reader_core::collaborators::Collaborators;
use wave_reader_core::config::{Config, resolve_config_path};
use wave_reader_core::logging::{LogConfig, init_logging};
use wave_reader_core::router::{MAIN_APP, ROUTES, handler_fn};
use wave_reader_core::transport::memory::MemoryTransport;
use wave_reader_core::transport::{TabId, TabTransport};
use wave_reader_core::{Dispatcher, MessageRouter, MessageSender, RouterMessage, TabInfo};

#[derive(Parser)]
#[command(name = "wave-reader")]
#[command(about = "Wave Reader message routing core", version)]
struct Cli {
    /// Config file (defaults to WAVE_READER_CONFIG, then the platform config dir)
    #[arg(long, global = true, env = "WAVE_READER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed messages through the background dispatcher
    Dispatch {
        /// JSON-lines input; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Open a simulated tab, `ID=URL`; the first one is focused
        #[arg(long = "tab", value_parser = parse_tab)]
        tabs: Vec<(TabId, String)>,

        /// Mark simulated tabs as already running the content script
        #[arg(long)]
        loaded: bool,

        /// Send every message as the content script of this tab
        #[arg(long)]
        from_tab: Option<TabId>,
    },

    /// Feed router messages through the priority router
    Route {
        /// JSON-lines input; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,

        /// Queue everything first and drain by priority instead of sending directly
        #[arg(long)]
        queued: bool,

        /// Print router statistics after the input is exhausted
        #[arg(long)]
        stats: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print only the resolved config file path
        #[arg(long)]
        path: bool,
    },
}

fn parse_tab(raw: &str) -> Result<(TabId, String), String> {
    let (id, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got '{raw}'"))?;
    let id = id
        .trim()
        .parse::<TabId>()
        .map_err(|e| format!("invalid tab id '{id}': {e}"))?;
    if url.trim().is_empty() {
        return Err("tab URL must not be empty".to_string());
    }
    Ok((id, url.trim().to_string()))
}

fn read_lines(input: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

fn emit(out: &mut impl Write, value: &Value) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn run_dispatch(
    config: &Config,
    input: Option<&Path>,
    tabs: &[(TabId, String)],
    loaded: bool,
    from_tab: Option<TabId>,
) -> anyhow::Result<()> {
    let browser = Arc::new(MemoryTransport::with_receiver_script(
        config.transport.receiver_script.clone(),
    ));
    for (id, url) in tabs {
        browser.add_tab(TabInfo::new(*id, url.clone(), format!("Tab {id}")), loaded);
    }
    let transport: Arc<dyn TabTransport> = browser.clone();
    let dispatcher = Dispatcher::new(transport, config, Collaborators::default());

    let sender = match from_tab {
        Some(id) => {
            let Some((_, url)) = tabs.iter().find(|(tab_id, _)| *tab_id == id) else {
                bail!("--from-tab {id} does not name a --tab");
            };
            MessageSender::content(id, url.clone())
        }
        None => MessageSender::popup(),
    };

    let mut out = std::io::stdout().lock();
    for line in read_lines(input)? {
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(raw) => dispatcher.dispatch(raw, &sender).await.to_value(),
            Err(e) => json!({"success": false, "error": format!("Invalid JSON: {e}")}),
        };
        emit(&mut out, &response)?;
    }
    Ok(())
}

/// Every routed component echoes what it received.
fn register_echo_components(router: &MessageRouter) {
    let components = ROUTES
        .iter()
        .map(|(_, component)| *component)
        .chain(std::iter::once(MAIN_APP));
    for component in components {
        router.register_component(
            component,
            handler_fn(move |message| {
                Ok(json!({
                    "component": component,
                    "type": message.message_type,
                    "data": message.data,
                }))
            }),
        );
    }
}

async fn run_route(config: &Config, input: Option<&Path>, queued: bool, stats: bool) -> anyhow::Result<()> {
    let router = MessageRouter::new(config.router.clone());
    register_echo_components(&router);

    let mut out = std::io::stdout().lock();
    for line in read_lines(input)? {
        let message: RouterMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                emit(&mut out, &json!({"success": false, "error": format!("Invalid router message: {e}")}))?;
                continue;
            }
        };
        if queued {
            router.enqueue(message);
        } else {
            let result = router.send(message).await;
            emit(&mut out, &serde_json::to_value(&result)?)?;
        }
    }

    if queued {
        loop {
            let drained = router.drain_queues().await;
            if drained.is_empty() {
                break;
            }
            for result in drained {
                emit(&mut out, &serde_json::to_value(&result)?)?;
            }
        }
    }

    if stats {
        emit(&mut out, &json!({"stats": router.get_stats()}))?;
    }
    Ok(())
}

fn run_config(config: &Config, explicit: Option<&Path>, path_only: bool) -> anyhow::Result<()> {
    if path_only {
        match resolve_config_path(explicit) {
            Some(path) => println!("{}", path.display()),
            None => bail!("No config directory available on this platform"),
        }
        return Ok(());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let mut log_config = LogConfig::from(&config.general);
    if let Some(level) = cli.log_level.clone() {
        log_config.level = level;
    }
    init_logging(&log_config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Dispatch {
            input,
            tabs,
            loaded,
            from_tab,
        } => run_dispatch(&config, input.as_deref(), &tabs, loaded, from_tab).await,
        Commands::Route {
            input,
            queued,
            stats,
        } => run_route(&config, input.as_deref(), queued, stats).await,
        Commands::Config { path } => run_config(&config, cli.config.as_deref(), path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_argument() {
        assert_eq!(parse_tab("7=https://a.test").unwrap(), (7, "https://a.test".to_string()));
        assert!(parse_tab("https://a.test").is_err());
        assert!(parse_tab("x=https://a.test").is_err());
        assert!(parse_tab("3=").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
