use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Inspect and edit index-fs disk images")]
pub struct Cli {
    /// Disk image file
    #[arg(long, short)]
    pub image: PathBuf,

    /// Buffer cache slots
    #[arg(long, default_value_t = 64)]
    pub cache_slots: usize,

    /// Upper bound of a slot's access counter
    #[arg(long, default_value_t = 3)]
    pub access_cap: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a fresh image, overwriting any existing file
    Format {
        /// Image size in MiB
        #[arg(long, default_value_t = 8)]
        size_mib: u64,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Append a host file to a file in the image
    Put { host: PathBuf, path: String },
    /// Copy a file out of the image
    Get { path: String, host: PathBuf },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file or an empty directory
    Rm { path: String },
    /// Show inode details
    Stat { path: String },
}
