//! Replay a notification trace through the attribution engine.
//!
//! Without `--out-file` the event stream goes to stderr in the
//! human-readable form; with it, the stream is written to the file as a
//! JSON document. A run summary with the fixture digest and diagnostic
//! counts goes to stdout either way.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use heapscope_core::sink::{JsonSink, TextSink};
use heapscope_core::EventSink;
use heapscope_harness::{fixtures, run_fixture, TraceFixture};

#[derive(Debug, Parser)]
#[command(
    name = "heapscope",
    about = "Replay a memory-access notification trace through the attribution engine"
)]
struct Args {
    /// Trace fixture (JSON) to replay.
    trace: PathBuf,

    /// Write the event stream as a JSON document to this file instead of
    /// the human-readable form on stderr.
    #[arg(long)]
    out_file: Option<PathBuf>,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(&args.trace)?;
    let digest = fixtures::fixture_digest(&bytes);
    let fixture = TraceFixture::from_json(&String::from_utf8(bytes)?)?;

    let sink: Box<dyn EventSink> = match &args.out_file {
        Some(path) => Box::new(JsonSink::new(BufWriter::new(File::create(path)?))?),
        None => Box::new(TextSink::new(io::stderr())),
    };

    let report = run_fixture(&fixture, sink)?;

    println!(
        "{}: {} ops replayed, {} diagnostics ({} warnings), sha256={}",
        fixture.name,
        report.ops_applied,
        report.diagnostics.len(),
        report.warnings(),
        digest
    );
    for diag in &report.diagnostics {
        println!(
            "  [{:?}] {} {}",
            diag.level,
            diag.event,
            diag.addr
                .map(|a| format!("{a:#x}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("heapscope: {err}");
            ExitCode::FAILURE
        }
    }
}
