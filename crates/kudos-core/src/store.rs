//! Counter stores.
//!
//! [`Database`] is the durable one: a handle to a single actor thread that
//! owns the sqlite connection and works through commands one at a time.
//! [`MemoryCounterStore`] keeps counts in process memory.

use std::{collections::HashMap, path::PathBuf};

use parking_lot::Mutex;
use sqlite::Connection;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use crate::{
    auth::AdminContext,
    constant::STORE_QUEUE_SIZE,
    db,
    page::{Page, PageDraft},
    prelude::CounterStore,
    state::SubjectId,
    KudosError, KudosResult, Responder,
};

/// Requests understood by the database actor.
enum DbCommand {
    Increment {
        subject: SubjectId,
        resp: Responder<KudosResult<u64>>,
    },
    Read {
        subject: SubjectId,
        resp: Responder<KudosResult<u64>>,
    },
    SetCount {
        subject: SubjectId,
        count: u64,
        resp: Responder<KudosResult<()>>,
    },
    ListPages {
        limit: Option<u32>,
        resp: Responder<KudosResult<Vec<Page>>>,
    },
    Highlights {
        resp: Responder<KudosResult<Vec<Page>>>,
    },
    PageBySlug {
        slug: String,
        resp: Responder<KudosResult<Option<Page>>>,
    },
    PageById {
        id: u32,
        resp: Responder<KudosResult<Option<Page>>>,
    },
    CreatePage {
        draft: PageDraft,
        resp: Responder<KudosResult<Page>>,
    },
    UpdatePage {
        id: u32,
        draft: PageDraft,
        resp: Responder<KudosResult<Page>>,
    },
    DeletePage {
        id: u32,
        resp: Responder<KudosResult<()>>,
    },
}

/// Sending a response over a oneshot channel returns the input value
/// as the error when the requester went away. Nothing left to do then.
fn respond<T>(responder: Responder<T>, value: T) {
    let _ = responder.send(value);
}

/// Cloneable handle to the database actor.
#[derive(Clone)]
pub struct Database {
    tx: mpsc::Sender<DbCommand>,
}

impl Database {
    /// Open the database at `path` and start the actor that owns the
    /// connection. The actor stops once every handle has been dropped.
    pub async fn open(path: PathBuf) -> KudosResult<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(STORE_QUEUE_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::task::spawn_blocking(move || {
            let conn = match db::open_db(path) {
                Ok(conn) => {
                    respond(ready_tx, Ok(()));
                    conn
                }
                Err(e) => {
                    respond(ready_tx, Err(e));
                    return;
                }
            };
            run_actor(conn, rx);
        });

        ready_rx
            .await
            .map_err(|_| KudosError::store_unavailable("database actor died while opening"))??;

        Ok((Self { tx }, handle))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<KudosResult<T>>) -> DbCommand,
    ) -> KudosResult<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| KudosError::store_unavailable("database actor is not running"))?;
        rx.await
            .map_err(|_| KudosError::store_unavailable("database actor dropped the request"))?
    }

    /// Administrative correction; the only way a count can go down.
    pub async fn correct_count(
        &self,
        admin: &AdminContext,
        subject: &SubjectId,
        count: u64,
    ) -> KudosResult<()> {
        info!(admin = admin.principal(), %subject, count, "Correcting like count");
        let subject = subject.clone();
        self.request(|resp| DbCommand::SetCount {
            subject,
            count,
            resp,
        })
        .await
    }

    pub async fn list_pages(&self, limit: Option<u32>) -> KudosResult<Vec<Page>> {
        self.request(|resp| DbCommand::ListPages { limit, resp })
            .await
    }

    pub async fn highlighted_pages(&self) -> KudosResult<Vec<Page>> {
        self.request(|resp| DbCommand::Highlights { resp }).await
    }

    pub async fn page_by_slug(&self, slug: &str) -> KudosResult<Page> {
        let slug = slug.to_string();
        self.request(|resp| DbCommand::PageBySlug { slug, resp })
            .await?
            .ok_or_else(|| KudosError::PageNotFound.into())
    }

    pub async fn page_by_id(&self, id: u32) -> KudosResult<Page> {
        self.request(|resp| DbCommand::PageById { id, resp })
            .await?
            .ok_or_else(|| KudosError::PageNotFound.into())
    }

    pub async fn create_page(&self, admin: &AdminContext, draft: PageDraft) -> KudosResult<Page> {
        info!(admin = admin.principal(), slug = %draft.slug, "Creating page");
        self.request(|resp| DbCommand::CreatePage { draft, resp })
            .await
    }

    pub async fn update_page(
        &self,
        admin: &AdminContext,
        id: u32,
        draft: PageDraft,
    ) -> KudosResult<Page> {
        info!(admin = admin.principal(), id, "Updating page");
        self.request(|resp| DbCommand::UpdatePage { id, draft, resp })
            .await
    }

    pub async fn delete_page(&self, admin: &AdminContext, id: u32) -> KudosResult<()> {
        info!(admin = admin.principal(), id, "Deleting page");
        self.request(|resp| DbCommand::DeletePage { id, resp })
            .await
    }
}

/// Any failure to count is reported as the store being unavailable; the
/// caller only needs to know the increment did not (knowingly) happen.
fn as_store_error(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<KudosError>() {
        Some(KudosError::StoreUnavailable { .. }) => err,
        _ => KudosError::store_unavailable(format!("{err:#}")).into(),
    }
}

#[async_trait::async_trait]
impl CounterStore for Database {
    async fn increment(&self, subject: &SubjectId) -> KudosResult<u64> {
        let subject = subject.clone();
        self.request(|resp| DbCommand::Increment { subject, resp })
            .await
            .map_err(as_store_error)
    }

    async fn read(&self, subject: &SubjectId) -> KudosResult<u64> {
        let subject = subject.clone();
        self.request(|resp| DbCommand::Read { subject, resp })
            .await
            .map_err(as_store_error)
    }
}

fn run_actor(conn: Connection, mut rx: mpsc::Receiver<DbCommand>) {
    info!("Database actor running...");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            DbCommand::Increment { subject, resp } => {
                let result = db::increment_count(&conn, &subject);
                match &result {
                    Ok(count) => debug!(%subject, count, "Incremented"),
                    Err(e) => error!(%subject, "Increment failed: {e:#}"),
                }
                respond(resp, result);
            }
            DbCommand::Read { subject, resp } => respond(resp, db::read_count(&conn, &subject)),
            DbCommand::SetCount {
                subject,
                count,
                resp,
            } => respond(resp, db::set_count(&conn, &subject, count)),
            DbCommand::ListPages { limit, resp } => respond(resp, db::query_pages(&conn, limit)),
            DbCommand::Highlights { resp } => respond(resp, db::query_highlighted(&conn)),
            DbCommand::PageBySlug { slug, resp } => {
                respond(resp, db::query_page_by_slug(&conn, &slug))
            }
            DbCommand::PageById { id, resp } => respond(resp, db::query_page_by_id(&conn, id)),
            DbCommand::CreatePage { draft, resp } => respond(resp, db::insert_page(&conn, &draft)),
            DbCommand::UpdatePage { id, draft, resp } => {
                respond(resp, db::update_page(&conn, id, &draft))
            }
            DbCommand::DeletePage { id, resp } => respond(resp, db::delete_page_by_id(&conn, id)),
        }
    }

    info!("Database actor stopped");
}

/// Counts kept in memory; atomic because every operation holds the lock.
#[derive(Default)]
pub struct MemoryCounterStore {
    counts: Mutex<HashMap<SubjectId, u64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counts(counts: impl IntoIterator<Item = (SubjectId, u64)>) -> Self {
        Self {
            counts: Mutex::new(counts.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, subject: &SubjectId) -> KudosResult<u64> {
        let mut counts = self.counts.lock();
        let count = counts.entry(subject.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn read(&self, subject: &SubjectId) -> KudosResult<u64> {
        Ok(self.counts.lock().get(subject).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::generate_temp_db;
    use std::sync::Arc;

    fn subject(raw: &str) -> SubjectId {
        SubjectId::new(raw).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_all_counted() {
        let path = generate_temp_db();
        let (store, actor) = Database::open(path.clone()).await.unwrap();
        let post = subject("post-42");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let post = post.clone();
                tokio::spawn(async move { store.increment(&post).await.unwrap() })
            })
            .collect();
        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
        assert_eq!(store.read(&post).await.unwrap(), 50);

        drop(store);
        actor.await.unwrap();
        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_databases_on_one_file_share_counts() {
        let path = generate_temp_db();
        let (left, left_actor) = Database::open(path.clone()).await.unwrap();
        let (right, right_actor) = Database::open(path.clone()).await.unwrap();
        let post = subject("post-42");

        let mut tasks = Vec::new();
        for i in 0..40 {
            let store = if i % 2 == 0 { left.clone() } else { right.clone() };
            let post = post.clone();
            tasks.push(tokio::spawn(async move { store.increment(&post).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(left.read(&post).await.unwrap(), 40);
        assert_eq!(right.read(&post).await.unwrap(), 40);

        drop((left, right));
        left_actor.await.unwrap();
        right_actor.await.unwrap();
        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[tokio::test]
    async fn stopped_actor_reports_store_unavailable() {
        let (closed_tx, _) = mpsc::channel(1);
        let dead = Database { tx: closed_tx };

        let err = dead.increment(&subject("post-1")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KudosError>(),
            Some(KudosError::StoreUnavailable { .. })
        ));
        assert!(dead.read(&subject("post-1")).await.is_err());
    }

    #[tokio::test]
    async fn admin_correction_and_pages() {
        let path = generate_temp_db();
        let (store, actor) = Database::open(path.clone()).await.unwrap();
        let admin = AdminContext::new("tester");
        let post = subject("hello-world");

        for _ in 0..3 {
            store.increment(&post).await.unwrap();
        }
        store.correct_count(&admin, &post, 1).await.unwrap();
        assert_eq!(store.read(&post).await.unwrap(), 1);

        let draft = PageDraft {
            title: "Hello world".into(),
            slug: "hello-world".into(),
            content: "Some *markdown*".into(),
            ..Default::default()
        };
        let page = store.create_page(&admin, draft.clone()).await.unwrap();
        assert_eq!(store.page_by_slug("hello-world").await.unwrap(), page);
        assert_eq!(store.page_by_id(page.id()).await.unwrap(), page);
        assert_eq!(store.list_pages(None).await.unwrap().len(), 1);
        assert!(store.highlighted_pages().await.unwrap().is_empty());

        store.delete_page(&admin, page.id()).await.unwrap();
        let err = store.page_by_slug("hello-world").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<KudosError>(),
            Some(&KudosError::PageNotFound)
        );
        let err = store.page_by_id(page.id()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<KudosError>(),
            Some(&KudosError::PageNotFound)
        );

        drop(store);
        actor.await.unwrap();
        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[tokio::test]
    async fn memory_store_counts_from_zero() {
        let store = Arc::new(MemoryCounterStore::with_counts([(subject("seeded"), 5)]));
        assert_eq!(store.read(&subject("fresh")).await.unwrap(), 0);
        assert_eq!(store.increment(&subject("fresh")).await.unwrap(), 1);
        assert_eq!(store.increment(&subject("seeded")).await.unwrap(), 6);
    }
}
