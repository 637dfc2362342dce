//! Retry helpers for SQLite write contention.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: usize = 10;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1_000;

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), or their textual forms.
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let (code, msg) = match sqlx_err {
        sqlx::Error::Database(db_err) => (
            db_err.code().map(Cow::into_owned),
            db_err.message().to_ascii_lowercase(),
        ),
        other => (None, other.to_string().to_ascii_lowercase()),
    };

    matches!(code.as_deref(), Some("5") | Some("6"))
        || msg.contains("database is locked")
        || msg.contains("database is busy")
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// the database as busy or locked. Other errors are returned immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let base = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let jitter = random::<u64>() % (base / 4 + 1);
                let delay = Duration::from_millis((base + jitter).min(BUSY_MAX_DELAY_MS));

                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_non_busy_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_sqlite_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let value = retry_on_sqlite_busy("test", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
