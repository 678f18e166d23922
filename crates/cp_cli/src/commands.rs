//! Subcommand implementations. Each returns `Ok(false)` when it ran but
//! found a problem the exit code should report.

use anyhow::{bail, Context};
use cp_common::{Collection, OwnerScope, Record, RecordBody};
use cp_config::Config;
use cp_sync::{CacheKey, ChangeBus, LocalCache, PendingOp, SqliteBackend};
use std::collections::HashSet;

fn open_cache(config: &Config) -> anyhow::Result<LocalCache> {
    let path = config.cache_path();
    if !path.exists() {
        bail!("No cache found at {}", path.display());
    }
    let backend = SqliteBackend::open(&path)
        .with_context(|| format!("Failed to open cache at {}", path.display()))?;
    Ok(LocalCache::new(backend, ChangeBus::new()))
}

fn scope_arg(owner: &str, class_id: &str) -> anyhow::Result<OwnerScope> {
    let scope = OwnerScope::new(owner, class_id);
    scope.validate()?;
    Ok(scope)
}

pub fn cmd_show(
    config: &Config,
    collection: Collection,
    owner: &str,
    class_id: &str,
    json: bool,
) -> anyhow::Result<bool> {
    let scope = scope_arg(owner, class_id)?;
    let cache = open_cache(config)?;
    let records: Vec<Record> = cache.get(&CacheKey::collection(&scope, collection));

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(true);
    }

    if records.is_empty() {
        eprintln!("No {} cached for {}", collection, scope);
        return Ok(true);
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(true)
}

pub fn cmd_queue(config: &Config, json: bool) -> anyhow::Result<bool> {
    let cache = open_cache(config)?;
    let ops: Vec<PendingOp> = cache.get(&CacheKey::OfflineQueue);

    if json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(true);
    }

    if ops.is_empty() {
        eprintln!("Queue is empty");
        return Ok(true);
    }
    for (i, op) in ops.iter().enumerate() {
        let target = op
            .canonical_id
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| op.local_id.as_ref().map(|id| format!("local {}", id)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}. {:?} {} {} (attempts: {})",
            i + 1,
            op.kind,
            op.path(),
            target,
            op.attempts
        );
    }
    Ok(true)
}

pub fn cmd_scopes(config: &Config) -> anyhow::Result<bool> {
    let cache = open_cache(config)?;
    let scopes = cache.scopes()?;
    if scopes.is_empty() {
        eprintln!("No classes cached");
    }
    for scope in scopes {
        println!("{}", scope);
    }
    Ok(true)
}

pub fn cmd_doctor(config: &Config, owner: &str, class_id: &str) -> anyhow::Result<bool> {
    let scope = scope_arg(owner, class_id)?;
    let cache = open_cache(config)?;

    eprintln!("Checking cached collections for {}...\n", scope);

    let mut healthy = true;
    for collection in Collection::ALL {
        let records: Vec<Record> = cache.get(&CacheKey::collection(&scope, collection));
        let problems = check_records(&scope, &records);
        let provisional = records.iter().filter(|r| r.is_provisional()).count();

        if problems.is_empty() {
            eprintln!(
                "  ✓ {}: {} records ({} unconfirmed)",
                collection,
                records.len(),
                provisional
            );
        } else {
            healthy = false;
            eprintln!("  ✗ {}: {} problems", collection, problems.len());
            for problem in problems.iter().take(5) {
                eprintln!("      {}", problem);
            }
            if problems.len() > 5 {
                eprintln!("      ... and {} more", problems.len() - 5);
            }
        }
    }

    let queued: Vec<PendingOp> = cache.get(&CacheKey::OfflineQueue);
    let queued_here = queued.iter().filter(|op| op.scope == scope).count();
    eprintln!("\n  Offline queue: {} ops ({} for this class)", queued.len(), queued_here);

    Ok(healthy)
}

/// Ordering, id uniqueness and scope violations in one cached list
fn check_records(scope: &OwnerScope, records: &[Record]) -> Vec<String> {
    let mut problems = Vec::new();

    for pair in records.windows(2) {
        if pair[0].created_at < pair[1].created_at {
            problems.push(format!(
                "{} is listed before the newer {}",
                pair[0].local_id, pair[1].local_id
            ));
        }
    }

    let mut seen = HashSet::new();
    for record in records {
        if let Some(id) = &record.canonical_id {
            if !seen.insert(id) {
                problems.push(format!("canonical id {} appears more than once", id));
            }
        }
        if record.scope != *scope {
            problems.push(format!("{} belongs to {}", record.local_id, record.scope));
        }
    }

    problems
}

fn format_record(record: &Record) -> String {
    let when = chrono::DateTime::from_timestamp_millis(record.created_at)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| record.created_at.to_string());
    let id = record
        .canonical_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "(unsynced)".to_string());

    let summary = match &record.body {
        RecordBody::Praise {
            student_id,
            category,
            amount,
            ..
        } => format!("{} {:+} {}", student_id, amount, category),
        RecordBody::EmotionCheckIn {
            student_id,
            emotion,
            turns,
        } => {
            let unread = turns
                .iter()
                .filter(|t| t.teacher_reply.is_some() && !t.read)
                .count();
            format!("{} feels {} ({} turns, {} unread replies)", student_id, emotion, turns.len(), unread)
        }
        RecordBody::Student {
            student_id,
            name,
            points,
            ..
        } => format!("{} {} ({} pts)", student_id, name, points),
        RecordBody::Notification {
            student_id, title, ..
        } => format!("{} {}", student_id, title),
    };

    format!("{}  {:<12} {}", when, id, summary)
}
