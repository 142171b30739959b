pub mod scan;
pub mod store;

pub use scan::{refresh, ScanStats};
pub use store::{IndexedSession, ProjectStat, SearchIndex, SearchQuery, SearchSort};
