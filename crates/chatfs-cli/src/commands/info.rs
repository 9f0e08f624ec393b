//! Info command - report index statistics without mounting anything.

use anyhow::Result;
use chatfs_core::VirtualPath;
use chatfs_index::MetadataIndex;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use crate::config::AppConfig;
use crate::output::create_table;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Default, Serialize)]
struct IndexStats {
    files: u64,
    directories: u64,
    chunks: u64,
    total_logical_bytes: u64,
}

#[instrument(level = "info", name = "cmd::info", skip_all)]
pub fn execute(config: &AppConfig, args: &Args) -> Result<()> {
    let db_path = config.database_path();
    let index = MetadataIndex::open(&db_path)?;

    let mut stats = IndexStats::default();
    walk(&index, &VirtualPath::root(), &mut stats)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        let mut table = create_table();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Index path".to_string(), db_path.display().to_string()]);
        table.add_row(vec!["Files".to_string(), stats.files.to_string()]);
        table.add_row(vec!["Directories".to_string(), stats.directories.to_string()]);
        table.add_row(vec!["Chunks".to_string(), stats.chunks.to_string()]);
        table.add_row(vec!["Total logical bytes".to_string(), stats.total_logical_bytes.to_string()]);
        println!("{table}");
    }

    Ok(())
}

fn walk(index: &MetadataIndex, dir: &VirtualPath, stats: &mut IndexStats) -> Result<()> {
    for record in index.list(dir)? {
        if record.is_directory {
            stats.directories += 1;
            walk(index, &record.virtual_path, stats)?;
        } else {
            stats.files += 1;
            stats.chunks += record.chunks.len() as u64;
            stats.total_logical_bytes += record.size_bytes;
        }
    }
    Ok(())
}
