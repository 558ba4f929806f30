mod report;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use shm_counters::{Config, CounterView};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let command = DumpCommand::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(?err, file = ?command.file, "dump failed");
            let _ = writeln!(std::io::stderr(), "shm-counters-dump: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Print the header, statics and live counters of a counters file.
#[derive(Parser)]
#[command(version)]
struct DumpCommand {
    /// Resolve the file name in the counters directory, `SHM_COUNTERS_DIR` or the default.
    #[arg(long)]
    named: bool,

    #[arg(help = "The counters file")]
    file: PathBuf,
}

fn run(command: &DumpCommand) -> Result<(), shm_counters::Error> {
    let path = if command.named {
        Config::from_env()?.path_for(&command.file)
    } else {
        command.file.clone()
    };

    let path = path.canonicalize()?;
    let view = CounterView::open(&path)?;

    let stdout = std::io::stdout();
    report::write_report(&mut stdout.lock(), &path, &view)?;
    view.close();

    Ok(())
}
