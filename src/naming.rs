/*!
 * Per-run names for temporary artifacts.
 *
 * Every run derives its dump file paths and temporary database names from a
 * single `RunId`, a nanosecond timestamp that is forced to be strictly
 * increasing inside the process.
 */

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// PostgreSQL truncates identifiers longer than this many bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Width of a nanosecond timestamp rendered in decimal
const RUN_ID_DIGITS: usize = 19;

const INTERMEDIATE_INFIX: &str = "_intermediate_";
const RESTORED_INFIX: &str = "_restored_";

static LAST_RUN_ID: AtomicI64 = AtomicI64::new(0);

/// Timestamp-derived identifier shared by all temp artifacts of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(i64);

impl RunId {
    /// Generate a new id from the current time.
    ///
    /// Two ids generated in the same clock tick still differ: the later one
    /// is bumped past the previous value.
    pub fn generate() -> Self {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_micros() * 1_000);

        let mut last = LAST_RUN_ID.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match LAST_RUN_ID.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return RunId(next),
                Err(current) => last = current,
            }
        }
    }

    /// Build an id from a known value
    pub fn from_raw(value: i64) -> Self {
        RunId(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names of every temporary artifact created by one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempNames {
    pub run_id: RunId,
    /// Dump file on the remote host
    pub remote_dump: String,
    /// Credentials file on the remote host, read by `pg_dump`
    pub remote_pgpass: String,
    /// Local copy of the dump
    pub local_dump: PathBuf,
    /// Database used as the connection context while the production db is swapped
    pub intermediate_db: String,
    /// Database receiving the restored dump before it is renamed
    pub restored_db: String,
}

impl TempNames {
    /// Derive the names of one run from the remote and local database names
    pub fn new(run_id: RunId, remote_database: &str, local_database: &str, remote_temp_dir: &str, local_temp_dir: &Path) -> Self {
        let dump_file = format!("{}_{}.dump", remote_database, run_id);
        let remote_dir = remote_temp_dir.trim_end_matches('/');

        Self {
            run_id,
            remote_dump: format!("{}/{}", remote_dir, dump_file),
            remote_pgpass: format!("{}/{}_{}.pgpass", remote_dir, remote_database, run_id),
            local_dump: local_temp_dir.join(&dump_file),
            intermediate_db: format!("{}{}{}", local_database, INTERMEDIATE_INFIX, run_id),
            restored_db: format!("{}{}{}", local_database, RESTORED_INFIX, run_id),
        }
    }
}

/// Length in bytes of the longest temp database name derived from `database`
pub fn longest_temp_database_name_len(database: &str) -> usize {
    database.len() + INTERMEDIATE_INFIX.len().max(RESTORED_INFIX.len()) + RUN_ID_DIGITS
}
