pub mod args;
pub mod rcv;

use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::error;

use crate::args::Args;
use crate::rcv::run_contest;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    println!("This is rcvcount version {}", VERSION.unwrap_or("unknown"));

    let args = Args::parse();
    let env = Env::new().default_filter_or({
        if args.verbose {
            "debug"
        } else {
            "info"
        }
    });
    let _ = env_logger::try_init_from_env(env);

    match run_contest(args.config, args.reference, args.out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
