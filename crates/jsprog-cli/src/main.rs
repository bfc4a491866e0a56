//! jsprogd — turn joystick input into scripted keyboard and mouse
//! activity.

use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "jsprogd", about = "Joystick scripting daemon", version)]
struct Opts {
    /// Raise the default log verbosity; repeat for trace output.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Also log to standard output.
    #[arg(short = 's')]
    stdout: bool,

    /// Log file path.
    #[arg(short = 'l', value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn init_logging(opts: &Opts) -> anyhow::Result<()> {
    let default_level = match opts.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match &opts.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };
    let stdout_layer = opts.stdout.then(|| fmt::layer().with_writer(std::io::stdout));
    let stderr_layer = opts
        .log_file
        .is_none()
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    init_logging(&opts)?;
    tracing::info!("starting jsprogd");

    let config = jsprog_daemon::config::load(None)?;

    // The whole core runs on one thread; blocking probes go through the
    // runtime's blocking pool.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, jsprog_daemon::run(config))?;
    Ok(())
}
