//! ringmond-dump - inspect ringmon series files.
//!
//! Prints the level table of a series file and optionally every stored
//! bucket, as text or JSON.

use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;

use ringmon_core::storage::SeriesLog;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ringmond-dump", about = "Inspect ringmon series files")]
struct Cli {
    /// Path to a series file, or a data directory to list completely.
    path: PathBuf,

    /// Also print every stored bucket per level.
    #[arg(long)]
    values: bool,

    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.path.is_dir() {
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(&cli.path) {
            Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(e) => {
                eprintln!("cannot read {}: {e}", cli.path.display());
                process::exit(1);
            }
        };
        entries.sort();
        for entry in entries {
            if entry.is_file() {
                dump_series(&entry, &cli);
            }
        }
    } else {
        dump_series(&cli.path, &cli);
    }
}

// ── Output models ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SeriesDump {
    name: String,
    store_type: &'static str,
    levels: Vec<LevelDump>,
}

#[derive(Serialize)]
struct LevelDump {
    step: u32,
    len: u32,
    period: u64,
    time: u32,
    pos: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    buckets: Option<Vec<BucketDump>>,
}

#[derive(Serialize)]
struct BucketDump {
    time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f32>,
}

fn fmt_ts(ts: u32) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

// ── Dump ─────────────────────────────────────────────────────────────────────

fn dump_series(path: &Path, cli: &Cli) {
    let dir = path.parent().unwrap_or(Path::new("."));
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        eprintln!("bad path: {}", path.display());
        return;
    };
    let log = match SeriesLog::open(dir, name, None) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("{name}: {e}");
            return;
        }
    };

    let dump = SeriesDump {
        name: name.to_string(),
        store_type: match log.store_type() {
            ringmon_core::codec::StoreType::AUint => "AU",
            ringmon_core::codec::StoreType::F16 => "F16",
        },
        levels: log
            .levels()
            .iter()
            .enumerate()
            .map(|(i, l)| LevelDump {
                step: l.step,
                len: l.len,
                period: l.period(),
                time: l.time,
                pos: l.pos,
                buckets: cli.values.then(|| {
                    log.level_buckets(i)
                        .into_iter()
                        .map(|(time, value)| BucketDump {
                            time,
                            value: (!value.is_nan()).then_some(value),
                        })
                        .collect()
                }),
            })
            .collect(),
    };

    if cli.json {
        match serde_json::to_string_pretty(&dump) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("{name}: {e}"),
        }
        return;
    }

    println!("{} ({})", dump.name, dump.store_type);
    for (i, level) in dump.levels.iter().enumerate() {
        println!(
            "  level {i}: step {}s, len {}, period {}s, time {} ({}), pos {}",
            level.step,
            level.len,
            level.period,
            level.time,
            fmt_ts(level.time),
            level.pos
        );
        if let Some(buckets) = &level.buckets {
            for bucket in buckets {
                match bucket.value {
                    Some(v) => println!("    {}\t{:.3}", bucket.time, v),
                    None => println!("    {}\t-", bucket.time),
                }
            }
        }
    }
}
