use clap::Parser;

use deckpilot_lib::cli::Cli;

fn main() {
    let cli = Cli::parse();
    std::process::exit(deckpilot_lib::run(cli));
}
