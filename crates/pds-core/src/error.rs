use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Config-layer errors. Each other crate (`pds-store`, `pds-watch`,
/// `pds-classify`, `pds-drive`, `pds-engine`) defines and propagates its own
/// local `Error` type for its boundary; `pdsd` composes them with
/// `anyhow`/`.context()` rather than funneling everything through a single
/// shared enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
}
