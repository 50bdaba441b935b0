//! Engine-wide constants: record layout, capacities, merge cadence, and
//! transaction retry tuning.

use std::time::Duration;

/// Physical index of the indirection pointer column.
pub const INDIRECTION_COLUMN: usize = 0;
/// Physical index of the record-id column.
pub const RID_COLUMN: usize = 1;
/// Physical index of the insertion/update timestamp column.
pub const TIMESTAMP_COLUMN: usize = 2;
/// Physical index of the schema-encoding bitmap column.
pub const SCHEMA_ENCODING_COLUMN: usize = 3;
/// User columns start after the metadata columns.
pub const NUM_METADATA_COLUMNS: usize = 4;

/// RID 0 is reserved: it terminates indirection chains and tombstones a
/// deleted base record.
pub const DELETED_RID: u64 = 0;

pub const RECORDS_PER_PAGE: usize = strata::PAGE_SLOTS;
pub const PAGES_PER_RANGE: usize = 16;
/// Base-record capacity of one page range.
pub const RANGE_CAPACITY: usize = RECORDS_PER_PAGE * PAGES_PER_RANGE;

pub const BUFFERPOOL_CAPACITY: usize = 8192;

/// Updates accumulated before the background merger runs a pass.
pub const MERGE_THRESHOLD_UPDATES: usize = 100;
/// How often the merger wakes to check the update counter.
pub const MERGE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

pub const MAX_RETRIES: usize = 100;
pub const RETRY_DELAY: Duration = Duration::from_millis(10);
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);
