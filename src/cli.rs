use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;

use crate::collector::PriceRepository;
use crate::domain::{
    CompletenessDistribution, Resolution, RetentionPolicy, SyncCoverageStats, ZeroDataItem,
};
use crate::error::Result;

/// Zero-data items listed per resolution by `status --show-zero`
pub const ZERO_DATA_LIST_LIMIT: usize = 50;

const MAX_BARS: i64 = 20;

#[derive(Parser)]
#[command(name = "ge-collector")]
#[command(version)]
#[command(about = "Grand Exchange price collector: live polling, gap repair and backfill", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus optional environment file)
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,

    /// Skip the item catalog sync before running
    #[arg(long, global = true)]
    pub skip_item_sync: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Poll live prices and keep history repaired until interrupted (default)
    Run,
    /// One-shot historical backfill of every known item
    Backfill {
        /// Only backfill this resolution (5m, 1h, 24h)
        #[arg(short, long, value_parser = parse_resolution)]
        resolution: Option<Resolution>,
    },
    /// Repair items with incomplete history inside the retention windows
    GapFill {
        /// Only repair this resolution (5m, 1h, 24h)
        #[arg(short, long, value_parser = parse_resolution)]
        resolution: Option<Resolution>,
        /// Maximum items per resolution
        #[arg(long)]
        items: Option<usize>,
    },
    /// Refresh item metadata from the mapping endpoint
    SyncItems,
    /// Show per-resolution coverage and completeness
    Status {
        /// Only report this resolution (5m, 1h, 24h)
        #[arg(short, long, value_parser = parse_resolution)]
        resolution: Option<Resolution>,
        /// List items that have no data at all
        #[arg(long)]
        show_zero: bool,
    },
    /// Add or remove items from the volume polling allow-list
    FlagVolume {
        /// Item ids
        #[arg(required = true)]
        ids: Vec<i32>,
        /// Remove the flag instead of setting it
        #[arg(long)]
        unset: bool,
    },
}

fn parse_resolution(s: &str) -> std::result::Result<Resolution, String> {
    s.parse::<Resolution>().map_err(|e| e.to_string())
}

/// Print the status report for one or all resolutions
pub async fn print_status(
    repo: &dyn PriceRepository,
    retention: &RetentionPolicy,
    filter: Option<Resolution>,
    show_zero: bool,
) -> Result<()> {
    let resolutions: Vec<Resolution> = match filter {
        Some(r) => vec![r],
        None => Resolution::ALL.to_vec(),
    };

    for (i, &resolution) in resolutions.iter().enumerate() {
        if i > 0 {
            println!();
        }

        let stats = repo.coverage_stats(resolution).await?;
        let dist = repo
            .completeness_distribution(resolution, retention.retention(resolution))
            .await?;
        let zero_items = if show_zero {
            Some(repo.items_with_zero_data(resolution, ZERO_DATA_LIST_LIMIT).await?)
        } else {
            None
        };

        print!(
            "{}",
            render_status(resolution, retention, &stats, &dist, zero_items.as_deref())
        );
    }

    Ok(())
}

/// Text report for one resolution
pub fn render_status(
    resolution: Resolution,
    retention: &RetentionPolicy,
    stats: &SyncCoverageStats,
    dist: &CompletenessDistribution,
    zero_items: Option<&[ZeroDataItem]>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "SYNC STATUS: {} ({} retention)",
        resolution.table(),
        format_retention(retention.days(resolution))
    );
    let _ = writeln!(out, "{}", "=".repeat(80));

    let _ = writeln!(out, "COVERAGE");
    let _ = writeln!(out, "  Total items:        {}", format_number(stats.total_items));
    let _ = writeln!(
        out,
        "  Items with data:    {} ({:.1}%)",
        format_number(stats.items_with_data),
        stats.coverage_pct()
    );
    let _ = writeln!(
        out,
        "  Items with NO data: {} ({:.1}%)",
        format_number(stats.items_with_no_data),
        stats.missing_pct()
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "DATA RANGE");
    let _ = writeln!(out, "  Oldest: {}", format_bucket_time(stats.oldest_bucket));
    let _ = writeln!(out, "  Newest: {}", format_bucket_time(stats.newest_bucket));

    let _ = writeln!(out);
    let _ = writeln!(out, "COMPLETENESS (% of expected buckets)");
    let max_count = dist.max_count();
    for (label, count) in dist.rows() {
        let _ = writeln!(
            out,
            "  {:<15} {:>6} items {}",
            format!("{label}:"),
            format_number(count),
            completeness_bar(count, max_count)
        );
    }

    if let Some(items) = zero_items {
        let _ = writeln!(out);
        let _ = writeln!(out, "ITEMS WITH ZERO DATA (first {})", ZERO_DATA_LIST_LIMIT);
        let _ = writeln!(out, "{}", "-".repeat(50));
        if items.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for item in items {
            let _ = writeln!(out, "  {:>6}  {}", item.item_id, item.name);
        }
    }

    out
}

/// Bar of up to 20 blocks scaled to `max_count`; any non-zero count gets one
pub fn completeness_bar(count: i64, max_count: i64) -> String {
    let mut bars = if max_count > 0 {
        (count as f64 / max_count as f64 * MAX_BARS as f64) as i64
    } else {
        0
    };
    if count > 0 && bars == 0 {
        bars = 1;
    }
    "\u{2588}".repeat(bars.max(0) as usize)
}

/// Integer with thousands separators, e.g. 1234567 -> "1,234,567"
pub fn format_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_retention(days: i64) -> String {
    match days {
        0 => "unlimited".to_string(),
        d if d >= 365 && d % 365 == 0 => format!("{}y", d / 365),
        d => format!("{d}d"),
    }
}

fn format_bucket_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "(no data)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_number(-45_000), "-45,000");
    }

    #[test]
    fn test_completeness_bar_scaling() {
        assert_eq!(completeness_bar(100, 100).chars().count(), 20);
        assert_eq!(completeness_bar(50, 100).chars().count(), 10);
        assert_eq!(completeness_bar(1, 10_000).chars().count(), 1);
        assert_eq!(completeness_bar(0, 100), "");
        assert_eq!(completeness_bar(0, 0), "");
    }

    #[test]
    fn test_render_status_sections() {
        let stats = SyncCoverageStats {
            total_items: 4_000,
            items_with_data: 3_000,
            items_with_no_data: 1_000,
            oldest_bucket: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            newest_bucket: None,
        };
        let dist = CompletenessDistribution {
            complete_90_plus: 2_500,
            complete_zero: 1_000,
            ..Default::default()
        };
        let zero = vec![ZeroDataItem {
            item_id: 2,
            name: "Cannonball".to_string(),
        }];

        let report = render_status(
            Resolution::OneHour,
            &RetentionPolicy::standard(),
            &stats,
            &dist,
            Some(&zero),
        );

        assert!(report.starts_with("SYNC STATUS: price_buckets_1h (1y retention)"));
        assert!(report.contains("  Total items:        4,000"));
        assert!(report.contains("  Items with data:    3,000 (75.0%)"));
        assert!(report.contains("  Oldest: 2024-03-01 00:00:00 UTC"));
        assert!(report.contains("  Newest: (no data)"));
        assert!(report.contains("90%+ complete:   2,500 items"));
        assert!(report.contains("       2  Cannonball"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "ge-collector",
            "gap-fill",
            "--resolution",
            "5m",
            "--items",
            "20",
        ]);
        match cli.command {
            Some(Commands::GapFill { resolution, items }) => {
                assert_eq!(resolution, Some(Resolution::FiveMinutes));
                assert_eq!(items, Some(20));
            }
            _ => panic!("expected gap-fill"),
        }

        assert!(Cli::try_parse_from(["ge-collector", "backfill", "-r", "15m"]).is_err());
        assert!(Cli::try_parse_from(["ge-collector", "flag-volume"]).is_err());
    }
}
