use std::process::ExitCode;

use tracing_subscriber::{fmt, EnvFilter};

fn main() -> ExitCode {
    // Logs go to stderr so stdout stays a clean wire channel.
    fmt()
        .with_env_filter(EnvFilter::from_env("CORDON_LOG"))
        .with_writer(std::io::stderr)
        .init();

    cordon_env::worker_main()
}
