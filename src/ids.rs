//! Process-unique identifiers for stages and attachments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static PROCESS_PREFIX: Lazy<String> = Lazy::new(|| {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{:x}-{:x}", std::process::id(), millis)
});

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next execution id, unique for the lifetime of the process.
pub fn next_execution_id() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("exec-{}-{}", *PROCESS_PREFIX, n)
}

/// Next attachment file stem, sharing the same counter space as execution ids.
pub fn next_attachment_id(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", sanitize_name(prefix), *PROCESS_PREFIX, n)
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
