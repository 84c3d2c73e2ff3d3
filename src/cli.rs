use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Image dataset acquisition pipeline
#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Crawl image galleries, download, sanitize and split into a dataset", long_about = None)]
pub struct Cli {
    /// Config file (TOML). Defaults to the per-user config if present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover image URLs for every configured search term
    Crawl {
        /// Where to write the URL map (defaults to `urls_file`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download a previously saved URL map and write the manifest
    Download {
        /// URL map to read (defaults to `urls_file`)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Delete undecodable or undersized images, convert the rest to RGB
    Sanitize,
    /// Copy manifest entries into the train/test split directories
    Partition,
    /// List the files of a split by class
    Inventory {
        #[arg(short, long, value_enum, default_value_t = SplitArg::Train)]
        split: SplitArg,
    },
    /// Run the whole pipeline
    Run,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SplitArg {
    Train,
    Test,
}
