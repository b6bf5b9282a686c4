use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = toolshare_cli::Cli::parse();
    if let Err(err) = toolshare_cli::run_cli(cli) {
        toolshare_cli::print_error_envelope(&err);
        std::process::exit(1);
    }
}
