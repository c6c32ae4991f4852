pub mod integrity;
pub mod loader;
pub mod source;
pub mod types;

pub use integrity::{quote_defect, sanitize_snapshot, IntegrityReport, QuoteDefect};
pub use loader::{LoaderError, ParquetSnapshotSource};
pub use source::{from_snapshots, SnapshotResult, SourceError};
pub use types::{Greeks, MarketSnapshot, OptionQuote, OptionRight, OptionsChain};
