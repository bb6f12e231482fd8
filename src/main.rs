mod canvas;
mod channels;
mod config;
mod core;
mod daemon;
mod heartbeat;
mod jobs;
mod state;
mod subscription;
mod traits;
mod types;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

enum Command {
    Run,
    SyncOnce,
    RemindOnce,
    SweepOnce,
    Link {
        chat_id: String,
        token: String,
        base_url: Option<String>,
    },
    Activate {
        chat_id: String,
    },
    AddTask {
        chat_id: String,
        title: String,
        due: String,
    },
}

fn required_arg(args: &[String], index: usize, usage: &str) -> String {
    match args.get(index) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Usage: {}", usage);
            std::process::exit(2);
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = PathBuf::from(
        std::env::var("DUEBOT_CONFIG").unwrap_or_else(|_| "duebot.toml".to_string()),
    );

    let args: Vec<String> = std::env::args().collect();
    let command = match args.get(1).map(String::as_str) {
        Some("--version") | Some("-V") => {
            println!("duebot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        Some("install-service") => {
            return daemon::install_service();
        }
        Some("sync") => Command::SyncOnce,
        Some("remind") => Command::RemindOnce,
        Some("sweep") => Command::SweepOnce,
        Some("link") => Command::Link {
            chat_id: required_arg(&args, 2, "duebot link <chat_id> <token> [base_url]"),
            token: required_arg(&args, 3, "duebot link <chat_id> <token> [base_url]"),
            base_url: args.get(4).cloned(),
        },
        Some("activate") => Command::Activate {
            chat_id: required_arg(&args, 2, "duebot activate <chat_id>"),
        },
        Some("add-task") => Command::AddTask {
            chat_id: required_arg(&args, 2, "duebot add-task <chat_id> <title> <due_rfc3339>"),
            title: required_arg(&args, 3, "duebot add-task <chat_id> <title> <due_rfc3339>"),
            due: required_arg(&args, 4, "duebot add-task <chat_id> <title> <due_rfc3339>"),
        },
        Some("run") | None => Command::Run,
        Some(other) => {
            eprintln!("Unknown command: '{}'. See duebot --help.", other);
            std::process::exit(2);
        }
    };

    // A bad or missing config aborts here, before any store is touched.
    let config = config::AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match command {
                Command::Run => crate::core::run(config).await,
                Command::SyncOnce => crate::core::run_sync_once(config).await,
                Command::RemindOnce => crate::core::run_remind_once(config).await,
                Command::SweepOnce => crate::core::run_sweep_once(config).await,
                Command::Link {
                    chat_id,
                    token,
                    base_url,
                } => crate::core::run_link(config, &chat_id, &token, base_url.as_deref()).await,
                Command::Activate { chat_id } => {
                    crate::core::run_activate(config, &chat_id).await
                }
                Command::AddTask {
                    chat_id,
                    title,
                    due,
                } => crate::core::run_add_task(config, &chat_id, &title, &due).await,
            }
        })
}

fn print_help() {
    println!("duebot {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: duebot [COMMAND]\n");
    println!("Commands:");
    println!("  run                                Start the daemon (default)");
    println!("  sync                               Run one mirror sync cycle and exit");
    println!("  remind                             Run one reminder pass and exit");
    println!("  sweep                              Run one subscription expiry sweep and exit");
    println!("  link <chat_id> <token> [base_url]  Validate a Canvas token and link the account");
    println!("  activate <chat_id>                 Grant a full premium period");
    println!("  add-task <chat_id> <title> <due>   Create a manual task (due in RFC 3339)");
    println!("  install-service                    Install as a system service (launchd/systemd)");
    println!("\nOptions:");
    println!("  -h, --help        Print help");
    println!("  -V, --version     Print version");
    println!("\nConfig is read from duebot.toml (override with DUEBOT_CONFIG).");
}
