//! Replay exported visit records through the aggregator and print a summary
//!
//! Run with: cargo run --bin replay_history -- --sort popular --top 20 <file or glob>...

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use history_heatmap_lib::history::{
    AppConfig, JsonlHistorySource, MemoryKvStore, SortMode, SortRequest, Sources,
};
use history_heatmap_lib::{init_logging, AppState};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Recent,
    Popular,
    Alphabetical,
}

impl From<SortArg> for SortMode {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Recent => SortMode::Recent,
            SortArg::Popular => SortMode::Popular,
            SortArg::Alphabetical => SortMode::Alphabetical,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "replay_history", version)]
struct Args {
    /// Row ordering for the printed table.
    #[arg(long, value_enum, default_value_t = SortArg::Popular)]
    sort: SortArg,

    /// Number of domains to print.
    #[arg(long, default_value_t = 20)]
    top: usize,

    /// Exported visit files (JSONL) or glob patterns.
    #[arg(required = true)]
    inputs: Vec<String>,
}

fn main() -> ExitCode {
    init_logging("info");
    let args = Args::parse();

    let source = match JsonlHistorySource::from_patterns(&args.inputs) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let files = source.paths().len();

    let config = AppConfig::default();
    let metric = config.popularity_metric;
    let state = AppState::new(
        config,
        Box::new(MemoryKvStore::new()),
        Sources::with_history(Arc::new(source)),
    );
    let delta = state.load_history();

    let mut grid = state.grid.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let total_visits: u64 = grid.matrix().values().map(|data| data.total_visits()).sum();
    let active_cells: usize = grid.matrix().values().map(|data| data.days.len()).sum();

    println!("=== History Replay ===");
    println!("Files: {}", files);
    println!("Domains: {}", grid.matrix().len());
    println!("Visits: {}", total_visits);
    println!("Active cells: {}", active_cells);
    if let Some(range) = grid.date_range() {
        println!("Date range: {} .. {} ({} days)", range.start, range.end, range.num_days());
    }
    println!("Generation: {}", delta.generation);
    println!();

    let request = SortRequest::new(args.sort.into(), grid.view_mode(), metric, None);
    let domains: Vec<String> = grid.ordered_domains(&request).iter().take(args.top).cloned().collect();
    println!("{:<40} {:>8} {:>8}  {}", "Domain", "Visits", "Days", "Color");
    for domain in &domains {
        let Some(data) = grid.matrix().get(domain) else {
            continue;
        };
        println!(
            "{:<40} {:>8} {:>8}  {}",
            domain,
            data.total_visits(),
            data.active_days(),
            grid.colors().color_of(domain)
        );
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_and_sort() {
        let args = Args::try_parse_from(["replay_history", "a.jsonl", "exports/*.jsonl"]).unwrap();
        assert!(matches!(args.sort, SortArg::Popular));
        assert_eq!(args.top, 20);
        assert_eq!(args.inputs.len(), 2);

        let args = Args::try_parse_from(["replay_history", "--sort", "recent", "--top", "5", "a.jsonl"]).unwrap();
        assert_eq!(SortMode::from(args.sort), SortMode::Recent);
        assert_eq!(args.top, 5);
    }

    #[test]
    fn test_args_reject_bad_input() {
        assert!(Args::try_parse_from(["replay_history"]).is_err());
        assert!(Args::try_parse_from(["replay_history", "--sort", "loudest", "a.jsonl"]).is_err());
        assert!(Args::try_parse_from(["replay_history", "--top", "many", "a.jsonl"]).is_err());
    }
}
