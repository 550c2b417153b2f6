use colored::Colorize;
use tracing_subscriber::EnvFilter;

/// Stdout carries exactly one JSON document, so diagnostics go to stderr.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}
