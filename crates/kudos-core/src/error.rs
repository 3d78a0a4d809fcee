use thiserror::Error;

pub type KudosResult<T> = anyhow::Result<T>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KudosError {
    /// The counter store could not be reached or rejected the write. The
    /// increment must be treated as not applied.
    #[error("Counter store unavailable: {msg}")]
    StoreUnavailable { msg: String },
    /// The liveness upstream failed to answer.
    #[error("Liveness upstream unavailable: {msg}")]
    UpstreamUnavailable { msg: String },
    /// Subject identifiers must be non-empty and bounded.
    #[error("Invalid subject id: {reason}")]
    InvalidSubject { reason: String },
    /// An empty title was provided for the page.
    #[error("Title cannot be empty")]
    EmptyTitle,
    /// An empty body was provided for the page.
    #[error("Content cannot be empty")]
    EmptyContent,
    #[error("Max allowed size of title: {max_size}, current size: {curr_size}")]
    InvalidTitleLength { max_size: usize, curr_size: usize },
    #[error("Max allowed size of content: {max_size}, current size: {curr_size}")]
    InvalidContentLength { max_size: usize, curr_size: usize },
    #[error("Max allowed size of excerpt: {max_size}, current size: {curr_size}")]
    InvalidExcerptLength { max_size: usize, curr_size: usize },
    /// Slugs are lowercase words joined by single dashes.
    #[error("Invalid slug: {slug:?}")]
    InvalidSlug { slug: String },
    #[error("A page with slug {slug:?} already exists")]
    DuplicateSlug { slug: String },
    /// The requested/specified page does not exist.
    #[error("Page not found")]
    PageNotFound,
    #[error("Unauthorized: {msg}")]
    Unauthorized { msg: String },
    #[error("Config error: {msg}")]
    ConfigError { msg: String },
    #[error("Unable to parse value read from sqlite")]
    SqliteValueParseError,
    #[error("Protocol error: {msg}")]
    ProtocolError { msg: String },
    /// Custom Error type for errors not covered by the above errors.
    #[error("{msg}")]
    CustomError { msg: String },
}

impl KudosError {
    pub fn custom_error(msg: impl Into<String>) -> Self {
        Self::CustomError { msg: msg.into() }
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable { msg: msg.into() }
    }

    pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable { msg: msg.into() }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError { msg: msg.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized { msg: msg.into() }
    }

    /// Whether a caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::UpstreamUnavailable { .. }
        )
    }

    /// Short machine friendly name, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::InvalidSubject { .. } => "invalid_subject",
            Self::EmptyTitle
            | Self::EmptyContent
            | Self::InvalidTitleLength { .. }
            | Self::InvalidContentLength { .. }
            | Self::InvalidExcerptLength { .. }
            | Self::InvalidSlug { .. } => "invalid_page",
            Self::DuplicateSlug { .. } => "duplicate_slug",
            Self::PageNotFound => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ConfigError { .. } => "config",
            Self::SqliteValueParseError => "storage",
            Self::ProtocolError { .. } => "protocol",
            Self::CustomError { .. } => "internal",
        }
    }
}

/// Find a `KudosError` anywhere in an error chain.
pub fn find_kudos_error(err: &anyhow::Error) -> Option<&KudosError> {
    err.chain().find_map(|cause| cause.downcast_ref::<KudosError>())
}
