//! Core of kudos: the like counter behind the blog's like button, the
//! pages it counts likes for, and the cached "is the stream live" signal.
//!
//! The interesting part is [`reconcile::ReconciliationClient`], which gives
//! instant feedback on a click while never letting the displayed count drift
//! from the durable one by more than a single in-flight like.
mod error;
pub mod auth;
pub mod config;
pub mod db;
pub mod liveness;
pub mod page;
pub mod reconcile;
pub mod state;
pub mod store;

use std::fmt::Display;

pub use error::{find_kudos_error, KudosError, KudosResult};

pub mod constant {
    pub const MAX_SUBJECT_LEN: usize = 128;
    pub const MAX_PAGE_TITLE: usize = 100;
    pub const MAX_PAGE_SLUG: usize = 100;
    pub const MAX_PAGE_EXCERPT: usize = 300;
    pub const MAX_PAGE_CONTENT: usize = 100_000;
    pub const CONFIG_DIR: &str = ".kudos";
    pub const CONFIG_FILE: &str = "kudos.toml";
    pub const CONFIG_ENV: &str = "KUDOSCONF";
    pub const DB_NAME: &str = "kudos.db";
    pub const PAGINATION_LIMIT: u32 = 40;
    pub const PAGINATION_DEFAULT: u32 = 20;
    pub const LIVENESS_TTL_SECS: u64 = 60;
    pub const STALENESS_FACTOR: u32 = 5;
    pub const STORE_QUEUE_SIZE: usize = 64;
    pub const BUSY_TIMEOUT_MS: usize = 5_000;
    /// Version of the request/response protocol spoken between cli and server.
    pub const PROTOCOL_VERSION: &str = "0.3.0";
}

/// Used to send acknowledgements back from the store actor.
pub type Responder<T> = tokio::sync::oneshot::Sender<T>;

/// Everything a client can ask the server for.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Like { subject: String },
    Count { subject: String },
    Liveness {},
    ListPages { limit: Option<u32> },
    Highlights {},
    GetPage { slug: String },
    GetPageById { id: u32 },
    CreatePage { token: String, page: page::PageDraft },
    UpdatePage { token: String, id: u32, page: page::PageDraft },
    DeletePage { token: String, id: u32 },
    CorrectCount { token: String, subject: String, count: u64 },
}

/// One request per connection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub version: String,
    pub command: Command,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            version: constant::PROTOCOL_VERSION.to_string(),
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Count { subject: String, count: u64 },
    Liveness { snapshot: state::LivenessSnapshot },
    Pages { pages: Vec<page::Page> },
    /// A page and its stored like count.
    Page { page: page::Page, likes: u64 },
    Done { msg: String },
    Error { kind: String, msg: String },
}

impl Response {
    pub fn done(msg: impl Into<String>) -> Self {
        Self::Done { msg: msg.into() }
    }

    /// Convert a failed operation into an error response, keeping the domain
    /// error kind when there is one.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match find_kudos_error(err) {
            Some(kudos) => Self::Error {
                kind: kudos.kind().to_string(),
                msg: kudos.to_string(),
            },
            None => Self::Error {
                kind: "internal".to_string(),
                msg: format!("{err:#}"),
            },
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Count { subject, count } => write!(f, "{subject}: {count} likes"),
            Response::Liveness { snapshot } => write!(f, "{snapshot}"),
            Response::Pages { pages } => {
                for page in pages {
                    writeln!(f, "{:>5}  {:<30}  {}", page.id(), page.slug, page.title)?;
                }
                Ok(())
            }
            Response::Page { page, likes } => {
                writeln!(f, "{page}")?;
                write!(f, "{likes} likes")
            }
            Response::Done { msg } => write!(f, "{msg}"),
            Response::Error { kind, msg } => write!(f, "ERROR({kind}): {msg}"),
        }
    }
}

pub mod prelude {
    use crate::state::{LiveStatus, SubjectId};
    use crate::KudosResult;

    /// Durable subject -> count mapping.
    ///
    /// `increment` must be atomic: two simultaneous increments of the same
    /// subject always end up as two, never one. A failed call means the
    /// increment must not be assumed applied.
    #[async_trait::async_trait]
    pub trait CounterStore: Send + Sync {
        async fn increment(&self, subject: &SubjectId) -> KudosResult<u64>;
        async fn read(&self, subject: &SubjectId) -> KudosResult<u64>;
    }

    /// Source of truth for whether the configured streamer is live.
    #[async_trait::async_trait]
    pub trait LivenessUpstream: Send + Sync {
        async fn fetch(&self) -> KudosResult<LiveStatus>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let request = Request::new(Command::Like {
            subject: "post-42".into(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            format!(
                r#"{{"version":"{}","command":{{"cmd":"like","subject":"post-42"}}}}"#,
                constant::PROTOCOL_VERSION
            )
        );
    }

    #[test]
    fn error_response_keeps_kind() {
        let err = anyhow::Error::from(KudosError::PageNotFound);
        let response = Response::from_error(&err);
        assert_eq!(
            response,
            Response::Error {
                kind: "not_found".into(),
                msg: "Page not found".into()
            }
        );
    }
}
