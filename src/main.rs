mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, SplitArg};
use harvest::config::HarvestConfig;
use harvest::crawl::CrawlReport;
use harvest::manifest::Manifest;
use harvest::partition::{inventory, Split};
use harvest::Harvester;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::load(cli.config.as_deref())?;
    let harvester = Harvester::new(config)?;
    let cfg = harvester.config().clone();

    match cli.command {
        Commands::Crawl { output } => {
            let report = harvester.crawl().await;
            report.save(output.as_deref().unwrap_or(&cfg.urls_file)).await?;
            for f in &report.failures {
                eprintln!("{}/{}: {}", f.category, f.term, f.reason);
            }
            println!("{} urls across {} categories", report.total_urls(), report.urls.len());
        }
        Commands::Download { input } => {
            let crawl = CrawlReport::load(input.as_deref().unwrap_or(&cfg.urls_file)).await?;
            let report = harvester.download(&crawl.urls).await;
            report.manifest.write(&cfg.manifest_file).await?;
            println!(
                "downloaded {}, invalid {}, failed {}",
                report.downloaded(), report.invalid(), report.failed()
            );
        }
        Commands::Sanitize => {
            let report = harvester.sanitize().await?;
            for (path, reason) in &report.removed {
                println!("removed {} ({:?})", path.display(), reason);
            }
            println!("scanned {}, kept {}, converted {}", report.scanned, report.kept, report.converted);
        }
        Commands::Partition => {
            let manifest = Manifest::read(&cfg.manifest_file).await?;
            let report = harvester.partition(&manifest).await?;
            println!(
                "test {}, train {}, unassigned {}, skipped {}",
                report.count(Split::Test), report.count(Split::Train),
                report.count(Split::Unassigned), report.skipped.len()
            );
        }
        Commands::Inventory { split } => {
            let root = match split {
                SplitArg::Train => &cfg.train_dir,
                SplitArg::Test => &cfg.test_dir,
            };
            for (class, path) in inventory(root)? {
                println!("{class}\t{}", path.display());
            }
        }
        Commands::Run => {
            let report = harvester.run().await?;
            println!(
                "{} urls, {} downloaded, {} removed, {} test / {} train",
                report.crawl.total_urls(),
                report.download.downloaded(),
                report.sanitize.removed.len(),
                report.partition.count(Split::Test),
                report.partition.count(Split::Train),
            );
        }
    }

    harvester.shutdown().await;
    Ok(())
}
