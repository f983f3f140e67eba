use std::process::ExitCode;

use clap::Parser;
use maskfe::cli::CliArgs;

fn main() -> ExitCode {
    // Session log first so argument and backend problems are recorded too.
    maskfe::logger::init();
    let args = CliArgs::parse();
    maskfe::cli::run(args)
}
