//! `camogmd`: the frame-drain recording daemon (spec section 2, "core").
//! Opens the per-port capture devices, then blocks in the command-pipe
//! dispatch loop until an `exit` command arrives.

#[macro_use] extern crate log;

mod cli;
mod daemon;
mod templates;

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
    let opt = cli::DaemonOpt::from_args();
    init_logging(opt.verbose);

    let devices = match daemon::DaemonDevices::open(&opt) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open capture devices: {}", e);
            std::process::exit(1);
        }
    };
    let mut d = daemon::Daemon::new(&devices, opt.state_file.clone());
    if let Err(e) = d.run_command_loop(&opt.pipe) {
        error!("command loop exited: {}", e);
        std::process::exit(1);
    }
}
