use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{
    helpers::{parse_datetime, to_u64},
    models::{ClipOutcomeCounts, ClipOutcomeRecord},
    Database,
};

fn row_to_outcome(row: &Row) -> Result<ClipOutcomeRecord> {
    let clip_start: String = row.get("clip_start")?;
    let clip_end: String = row.get("clip_end")?;
    let finished_at: String = row.get("finished_at")?;

    Ok(ClipOutcomeRecord {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        channel: row.get("channel")?,
        clip_start: parse_datetime(&clip_start, "clip_start")?,
        clip_end: parse_datetime(&clip_end, "clip_end")?,
        close_reason: row.get("close_reason")?,
        peak_delta_value: row.get("peak_delta_value")?,
        status: row.get("status")?,
        detail: row.get("detail")?,
        clip_url: row.get("clip_url")?,
        event_recorded: row.get::<_, i64>("event_recorded")? != 0,
        finished_at: parse_datetime(&finished_at, "finished_at")?,
    })
}

impl Database {
    pub async fn insert_clip_outcome(&self, record: &ClipOutcomeRecord) -> Result<i64> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO clip_outcomes (job_id, channel, clip_start, clip_end, close_reason,
                    peak_delta_value, status, detail, clip_url, event_recorded, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.job_id,
                    record.channel,
                    record.clip_start.to_rfc3339(),
                    record.clip_end.to_rfc3339(),
                    record.close_reason,
                    record.peak_delta_value,
                    record.status,
                    record.detail,
                    record.clip_url,
                    record.event_recorded as i64,
                    record.finished_at.to_rfc3339(),
                ],
            )
            .context("failed to insert clip outcome")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Newest first.
    pub async fn recent_clip_outcomes(&self, limit: usize) -> Result<Vec<ClipOutcomeRecord>> {
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, channel, clip_start, clip_end, close_reason, peak_delta_value,
                        status, detail, clip_url, event_recorded, finished_at
                 FROM clip_outcomes
                 ORDER BY finished_at DESC, id DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut outcomes = Vec::new();
            while let Some(row) = rows.next()? {
                outcomes.push(row_to_outcome(row)?);
            }
            Ok(outcomes)
        })
        .await
    }

    pub async fn clip_outcome_counts(&self) -> Result<ClipOutcomeCounts> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(event_recorded), 0)
                 FROM clip_outcomes
                 GROUP BY status",
            )?;

            let mut counts = ClipOutcomeCounts::default();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let total = to_u64(row.get(1)?, "count")?;
                counts.events_recorded += to_u64(row.get(2)?, "event_recorded")?;
                match status.as_str() {
                    "uploaded" => counts.uploaded = total,
                    "dropped" => counts.dropped = total,
                    "failed" => counts.failed = total,
                    _ => {}
                }
            }
            Ok(counts)
        })
        .await
    }
}
