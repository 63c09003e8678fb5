mod budget;
mod complexity;
mod config;
mod core;
mod cron_utils;
mod daemon;
mod dag;
mod escalation;
mod events;
mod execution;
mod goal_tokens;
mod lanes;
mod reconcile;
mod registry;
mod retry;
mod router;
mod runners;
mod schedule;
mod scheduler;
mod state;
mod traits;
mod types;
pub mod utils;

use std::future::Future;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("ponybunny {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: ponybunny [COMMAND]\n");
    println!("Runs the daemon when no command is given.\n");
    println!("Commands:");
    println!("  check-config                 Validate config.toml and print a summary");
    println!("  reconcile                    Sync cron jobs with the configured agents");
    println!("  dispatch-once                Run one dispatch tick, leaving goals queued");
    println!("  submit <title> <description> Queue an ad-hoc goal for a running daemon");
    println!("  cancel <goal-id>             Cancel a goal (its schedule is untouched)");
    println!("\nOptions:");
    println!("  -h, --help       Print help");
    println!("  -V, --version    Print version");
    println!("\nEnvironment:");
    println!("  PONYBUNNY_CONFIG  Config file path (default: ./config.toml)");
    println!("  RUST_LOG          Log filter (default: info)");
}

fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future))
}

fn usage_error(message: &str) -> ! {
    eprintln!("{}", message);
    eprintln!("Run 'ponybunny --help' for usage.");
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str());
    match command {
        Some("--version") | Some("-V") => {
            println!("ponybunny {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let config_path = std::env::var("PONYBUNNY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    let config = config::AppConfig::load(&config_path)?;

    match command {
        None => block_on(crate::core::run(config))?,
        Some("check-config") => {
            println!("{}: ok", config_path.display());
            for line in crate::core::describe_config(&config) {
                println!("{}", line);
            }
            for warning in config.validate()? {
                println!("warning: {}", warning);
            }
            Ok(())
        }
        Some("reconcile") => {
            let report = block_on(crate::core::reconcile_once(&config))??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("dispatch-once") => {
            let report = block_on(crate::core::dispatch_once(&config))??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("submit") => {
            let (Some(title), Some(description)) = (args.get(2), args.get(3)) else {
                usage_error("Usage: ponybunny submit <title> <description>");
            };
            let goal = block_on(crate::core::submit(&config, title, description))??;
            println!("{}", goal.id);
            Ok(())
        }
        Some("cancel") => {
            let Some(goal_id) = args.get(2) else {
                usage_error("Usage: ponybunny cancel <goal-id>");
            };
            block_on(crate::core::cancel(&config, goal_id))??;
            println!("cancelled {}", goal_id);
            Ok(())
        }
        Some(other) => usage_error(&format!("Unknown command '{}'", other)),
    }
}
