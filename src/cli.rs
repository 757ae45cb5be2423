//! Command-line flags for both binaries (spec section 6's startup flags;
//! runtime configuration arrives over the command pipe/socket, not here).

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "camogmd", about = "Elphel frame-drain recording daemon")]
pub struct DaemonOpt {
    /// Named pipe the daemon reads `key=value` commands from.
    #[structopt(long, default_value = "/var/tmp/camogm_cmd")]
    pub pipe: String,

    /// Per-port capture-ring device paths (`/dev/circbufN` by default).
    #[structopt(long, use_delimiter = true, default_value = "/dev/circbuf0,/dev/circbuf1,/dev/circbuf2,/dev/circbuf3")]
    pub circbuf: Vec<String>,

    /// Per-port JPEG-header device paths.
    #[structopt(long, use_delimiter = true, default_value = "/dev/jpeghead0,/dev/jpeghead1,/dev/jpeghead2,/dev/jpeghead3")]
    pub jpeghead: Vec<String>,

    /// Per-port Exif device paths.
    #[structopt(long, use_delimiter = true, default_value = "/dev/exif_exif0,/dev/exif_exif1,/dev/exif_exif2,/dev/exif_exif3")]
    pub exif: Vec<String>,

    /// Default raw-device state file, read on start and written on stop
    /// (spec section 4.8).
    #[structopt(long, default_value = "/var/tmp/camogm_state")]
    pub state_file: String,

    /// Increase log verbosity; repeatable.
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "camogm_reader", about = "Raw-device index builder and file server")]
pub struct ReaderOpt {
    /// Address the reader's TCP listener binds to (spec section 5, "Reader" thread).
    #[structopt(long, default_value = "127.0.0.1:8082")]
    pub listen: String,

    /// Raw device or backing file the index is built over.
    #[structopt(long)]
    pub device: String,

    /// First LBA the recording ring may use.
    #[structopt(long, default_value = "0")]
    pub lba_start: u64,

    /// One past the last LBA the recording ring may use.
    #[structopt(long)]
    pub lba_end: u64,

    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}
