pub mod cli;
pub mod commands;
pub mod error;

use std::sync::Arc;

use deckpilot_core::notify::{Notice, NoticeLevel, Notifier};

use crate::cli::Cli;

/// Initialize tracing/logging with the given directives
pub fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {:?}: {}", directive, e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Prints user notices to stderr, keeping stdout for command output.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        let tag = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "ok",
            NoticeLevel::Error => "error",
        };
        eprintln!("[{}] {}", tag, notice.message);
    }
}

/// Run the CLI. Returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    init_logging(&["deckpilot=info", "deckpilot_lib=info", "deckpilot_core=info"]);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {}", e);
            return 1;
        }
    };

    rt.block_on(async {
        let state = match cli::client_state(&cli, Arc::new(ConsoleNotifier)) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Startup failed: {:#}", e);
                return 1;
            }
        };

        let result = cli::dispatch(&state, cli.command).await;
        state.reset().await;

        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::debug!(error = %e, "Command failed");
                match serde_json::to_string(&e) {
                    Ok(json) => println!("{}", json),
                    Err(_) => eprintln!("{}", e),
                }
                1
            }
        }
    })
}
