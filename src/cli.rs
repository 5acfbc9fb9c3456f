use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Download files over many parallel SSH channels", long_about = None)]
pub struct Cli {
    #[clap(
        num_args = 1..,
        required = true,
        value_name = "SOURCE",
        help = "Remote sources as [user@]host:path (wildcards expand remotely)"
    )]
    pub sources: Vec<String>,

    #[clap(required = true, value_name = "DEST", help = "Local destination file or directory")]
    pub dest: String,

    #[clap(
        short = 'n',
        long = "tunnels",
        default_value_t = 8,
        help = "Number of parallel SSH channels",
        display_order = 1
    )]
    pub tunnels: usize,

    #[clap(short = 'p', long, default_value_t = 22, help = "Remote SSH port", display_order = 2)]
    pub port: u16,

    #[clap(
        short = 'i',
        long = "identity",
        help = "Identity (private key) file passed through to ssh -i",
        display_order = 3
    )]
    pub identity: Option<PathBuf>,

    #[clap(
        short = 'P',
        long = "password",
        help = "Prompt for a password and drive ssh through sshpass",
        display_order = 4
    )]
    pub password: bool,

    #[clap(short = 'C', long = "compress", help = "Enable SSH compression", display_order = 5)]
    pub compress: bool,

    #[clap(short, long, help = "Verbose (debug) logging to stderr", display_order = 6)]
    pub verbose: bool,

    #[clap(long = "no-progress", help = "Disable progress bars", display_order = 7)]
    pub no_progress: bool,

    #[clap(long, help = "Emit lifecycle events as JSON lines on stdout", display_order = 8)]
    pub json: bool,

    #[clap(short, long, help = "Suppress progress and the summary line", display_order = 9)]
    pub quiet: bool,
}
