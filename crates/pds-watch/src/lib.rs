//! The Watcher (C2): discovers filesystem changes under the configured
//! sync roots, either by a one-shot recursive scan-diff pass (used at
//! startup and in `--no-watch` / one-shot modes) or by a live `notify`
//! subscription with write-settle debouncing (§4.2).

mod diff;
mod exclude;
mod live;
mod scan;

pub use diff::{diff_live, diff_scan};
pub use exclude::ExcludeSet;
pub use live::LiveWatcher;
pub use scan::scan_dir;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("invalid exclude pattern '{0}': {1}")]
    BadPattern(String, glob::PatternError),
}
