mod bench;
mod cli;
mod clock;
mod config;
mod error;
mod logging;
mod output;
mod recorder;
mod stats;
mod sync;
mod task;

use std::process;

use clap::Parser;

use bench::{BenchmarkRun, Mode};
use cli::Cli;
use config::Settings;
use error::Error;

/// Build the run settings by layering: defaults → TOML file → CLI overrides.
fn build_settings(cli: &Cli) -> Result<Settings, Error> {
    let mut settings = config::load_config(cli.config_file.as_deref())?.resolve();

    // Apply CLI overrides (only if explicitly set)
    if let Some(v) = cli.duration {
        settings.bench.duration = v;
    }
    if let Some(v) = cli.board {
        settings.bench.board = v;
    }
    if let Some(ref v) = cli.results_dir {
        settings.bench.results_dir = v.clone();
    }
    if cli.oscilloscope {
        settings.bench.oscilloscope = true;
    }
    if cli.no_realtime {
        settings.bench.realtime = false;
    }

    settings.validate();
    Ok(settings)
}

fn run(cli: &Cli) -> Result<(), Error> {
    let mode = Mode::select(cli.periodic, cli.mechanism)?;
    let settings = build_settings(cli)?;
    let bench = BenchmarkRun::new(mode, &settings)?;

    log::info!(
        "oscilloscope-like data acquisition is {}",
        if bench.oscilloscope { "enabled" } else { "disabled" },
    );

    let reports = bench::run(&bench)?;
    output::write_results(&bench, &reports)?;
    output::print_summary(&bench, &reports)?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log);

    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        process::exit(e.exit_code());
    }
}
