use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use loupe::debugger::Debugger;
use loupe::errors::DebuggerError;
use loupe::feedback::Feedback;
use loupe::ui::cli::CliUi;

/// Launch the loupe debugger
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The program to debug
    program: PathBuf,
}

fn main() -> Result<(), DebuggerError> {
    setup_logger();

    let args = Args::parse();

    let ui = CliUi::build()?;
    let mut dbg = Debugger::launch(&args.program, ui)?;

    // stop the tracee at the operator's first point of interest
    let feedback = match dbg.set_breakpoint_at_function("main") {
        Ok(_) => dbg.cont()?,
        Err(e) => {
            warn!("could not break at main: {e}");
            Feedback::Ok
        }
    };

    dbg.run_loop(feedback)?;
    dbg.cleanup()?;

    Ok(())
}

fn setup_logger() {
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}
