use clap::Parser;
use kiln_core::{Server, logging};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Static file server on a single epoll reactor and a bounded worker pool")]
#[command(version)]
struct Cli {
    /// TCP port to listen on (0.0.0.0)
    port: u16,

    /// Document root (default: ./resources or KILN_DOC_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Worker threads (default: number of CPUs or KILN_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Task queue capacity (default: 10000 or KILN_QUEUE_CAPACITY)
    #[arg(long)]
    queue: Option<usize>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.json_logs {
        logging::init_logging_json(&cli.log_level);
    } else {
        logging::init_logging(&cli.log_level);
    }

    let mut server = match Server::from_env(cli.port) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = cli.root {
        server = server.doc_root(root);
    }
    if let Some(workers) = cli.workers {
        server = server.workers(workers);
    }
    if let Some(queue) = cli.queue {
        server = server.queue_capacity(queue);
    }

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "kiln stopped with an error");
            ExitCode::FAILURE
        }
    }
}
