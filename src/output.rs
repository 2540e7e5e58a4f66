use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bench::{BenchmarkRun, TaskReport};
use crate::clock::{Nanos, NSEC_PER_MSEC, NSEC_PER_USEC};
use crate::config::Board;
use crate::error::Error;
use crate::recorder::{EdgeSample, TickSample};
use crate::stats::{self, Summary};

/// Files written for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFiles {
    pub samples: PathBuf,
    pub oscilloscope: Option<PathBuf>,
}

/// `ms.nnnnnn`
fn fmt_ms(ns: Nanos) -> String {
    format!("{}.{:06}", ns / NSEC_PER_MSEC, ns % NSEC_PER_MSEC)
}

/// `us.nnn`
fn fmt_us(ns: Nanos) -> String {
    format!("{}.{:03}", ns / NSEC_PER_USEC, ns % NSEC_PER_USEC)
}

fn format_samples(samples: &[TickSample], out: &mut dyn Write) -> io::Result<()> {
    for s in samples {
        write!(
            out,
            "{},{},{}",
            fmt_ms(s.period),
            fmt_us(s.completion),
            fmt_us(s.jitter)
        )?;
        if let Some(latency) = s.latency {
            write!(out, ",{}", fmt_us(latency))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn format_edges(edges: &[EdgeSample], out: &mut dyn Write) -> io::Result<()> {
    for e in edges {
        writeln!(out, "{} 1", e.start)?;
        writeln!(out, "{} 0", e.end)?;
    }
    Ok(())
}

/// Creates `<dir>/<stem>_<k>.dat` for the first `k >= 1` not already taken.
fn create_unique(dir: &Path, stem: &str) -> io::Result<(PathBuf, File)> {
    for k in 1u32.. {
        let path = dir.join(format!("{}_{}.dat", stem, k));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => return Ok((path, f)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free result file name for {}", stem),
    ))
}

fn write_file<F>(dir: &Path, stem: &str, body: F) -> Result<PathBuf, Error>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let (path, f) = create_unique(dir, stem).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("cannot create result file in {}: {}", dir.display(), e),
        ))
    })?;
    let mut out = BufWriter::new(f);
    body(&mut out)?;
    out.flush()?;
    Ok(path)
}

/// Writes the sample file of one task, plus its oscilloscope file when
/// `oscilloscope` is set.
pub fn write_task(
    dir: &Path,
    board: Board,
    duration: u64,
    report: &TaskReport,
    oscilloscope: bool,
) -> Result<WrittenFiles, Error> {
    fs::create_dir_all(dir)?;
    let stem = format!("{}{}_{}sec", board.prefix(), report.name, duration);

    let samples = write_file(dir, &stem, |out| format_samples(report.samples.samples(), out))?;
    log::info!("performance data file written to {}", samples.display());

    let oscilloscope = if oscilloscope {
        let path = write_file(dir, &format!("{}_osc", stem), |out| {
            format_edges(report.edges.edges(), out)
        })?;
        log::info!("oscilloscope data file written to {}", path.display());
        Some(path)
    } else {
        None
    };

    Ok(WrittenFiles {
        samples,
        oscilloscope,
    })
}

pub fn write_results(bench: &BenchmarkRun, reports: &[TaskReport]) -> Result<Vec<WrittenFiles>, Error> {
    reports
        .iter()
        .map(|r| {
            write_task(
                &bench.results_dir,
                bench.board,
                bench.duration,
                r,
                bench.oscilloscope,
            )
        })
        .collect()
}

fn summary_line(label: &str, summary: Option<Summary>, out: &mut dyn Write) -> io::Result<()> {
    match summary {
        Some(s) => writeln!(
            out,
            "  {:<10} min {:>12} us  max {:>12} us  mean {:>12.3} us  stddev {:>10.3} us",
            label,
            fmt_us(s.min),
            fmt_us(s.max),
            s.mean / NSEC_PER_USEC as f64,
            s.stddev / NSEC_PER_USEC as f64,
        ),
        None => Ok(()),
    }
}

/// Human-readable run report: one block of column statistics per task.
pub fn write_summary(bench: &BenchmarkRun, reports: &[TaskReport], out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "{} ({} s)", bench.mode.label(), bench.duration)?;
    for r in reports {
        let summary = stats::summarize(r.samples.samples());
        writeln!(
            out,
            "{}: {} samples, nominal period {} ms, {} overruns",
            r.name,
            r.samples.len(),
            fmt_ms(r.nominal),
            r.overruns,
        )?;
        summary_line("period", summary.period, out)?;
        summary_line("completion", summary.completion, out)?;
        summary_line("jitter", summary.jitter, out)?;
        summary_line("latency", summary.latency, out)?;
    }
    Ok(())
}

pub fn print_summary(bench: &BenchmarkRun, reports: &[TaskReport]) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_summary(bench, reports, &mut out)?;
    out.flush()
}
