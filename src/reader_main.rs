//! `camogm_reader`: the raw-device indexer and TCP file server (spec
//! section 4.7). Builds an index over a raw device or backing file and
//! serves files and index entries out over a line-oriented socket command
//! surface, independent of the recording daemon.

#[macro_use] extern crate log;

mod cli;
mod reader;

use structopt::StructOpt;

fn init_logging(verbosity: u8) {
    let default_spec = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let spec = std::env::var("CAMOGM_LOG").unwrap_or_else(|_| default_spec.to_string());
    mylog::Builder::new().set_spec(&spec).build().install().unwrap();
}

fn main() {
    let opt = cli::ReaderOpt::from_args();
    init_logging(opt.verbose);

    let cancel = reader::CancelToken::new();
    if let Err(e) = reader::run(opt, cancel) {
        error!("reader exited: {}", e);
        std::process::exit(1);
    }
}
