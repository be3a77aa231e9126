use std::ops::ControlFlow;

use chrono::{Duration, Utc};
use tabled::Table;

use crate::{
    error::Result,
    fod::{Connection, ScanApi},
    header, success,
    types::ScanTableRow,
};

pub async fn scans(conn: &Connection, days: i64, max_results: usize) -> Result<()> {
    let since = Utc::now().date_naive() - Duration::days(days);

    header!("Query scans completed since {since}");
    let mut rows = Vec::new();
    let summary = conn
        .api::<ScanApi>()
        .query_scans()
        .completed_on_start_date(since)
        .max_results(max_results)
        .build()
        .process_all(|scan| {
            rows.push(ScanTableRow {
                id: scan.get_string_lossy("scanId").unwrap_or_default(),
                release: scan.get_string_lossy("releaseName").unwrap_or_default(),
                kind: scan.get_string_lossy("scanType").unwrap_or_default(),
                completed: scan
                    .get_string_lossy("completedDateTime")
                    .unwrap_or_default(),
            });
            ControlFlow::Continue(())
        })
        .await?;

    println!("{}", Table::new(rows));
    success!("{} scans from {} pages", summary.items, summary.pages);
    Ok(())
}
