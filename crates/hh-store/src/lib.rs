mod store;
mod writer;

pub use store::{HistoryBucket, HistoryPoint, ReadingRow, TimeSeriesStore};
pub use writer::{WriteQueue, WriterStats, run_flusher, run_intake};
