// Circular write-ahead log
// Record format, the append cursor and the physical reader used by recovery

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{RecordHeader, RecordType};
pub use reader::{LogReader, LogRecord, RecordRead};
pub use writer::{LogWriter, PendingRecord};
