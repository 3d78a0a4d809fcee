mod error;
pub mod remote;
pub mod tls;

pub use error::ServerError;

use std::{sync::Arc, time::Duration};

use kudos_core::{
    auth::SessionResolver,
    constant::PROTOCOL_VERSION,
    liveness::StatusCache,
    page::Page,
    prelude::{CounterStore, LivenessUpstream},
    state::SubjectId,
    store::Database,
    Command, KudosError, KudosResult, Request, Response,
};
use semver::{Version, VersionReq};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// 10Kb buffer
pub const BUFFER_SIZE: usize = 10240;
/// Largest request accepted; a page body plus some envelope.
const MAX_REQUEST_SIZE: u64 = 256 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection handler needs, shared by all connections.
pub struct ServerContext {
    pub db: Database,
    pub liveness: StatusCache<dyn LivenessUpstream>,
    pub sessions: Arc<dyn SessionResolver>,
}

impl ServerContext {
    /// Never fails; errors are turned into [`Response::Error`].
    pub async fn dispatch(&self, request: Request) -> Response {
        let result = match check_version(&request.version) {
            Ok(()) => self.execute(request.command).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            debug!("Request failed: {e:#}");
            Response::from_error(&e)
        })
    }

    async fn execute(&self, command: Command) -> KudosResult<Response> {
        let response = match command {
            Command::Like { subject } => {
                let subject = SubjectId::new(subject)?;
                let count = self.db.increment(&subject).await?;
                Response::Count {
                    subject: subject.to_string(),
                    count,
                }
            }
            Command::Count { subject } => {
                let subject = SubjectId::new(subject)?;
                let count = self.db.read(&subject).await?;
                Response::Count {
                    subject: subject.to_string(),
                    count,
                }
            }
            Command::Liveness {} => Response::Liveness {
                snapshot: self.liveness.get_liveness().await,
            },
            Command::ListPages { limit } => Response::Pages {
                pages: self.db.list_pages(limit).await?,
            },
            Command::Highlights {} => Response::Pages {
                pages: self.db.highlighted_pages().await?,
            },
            Command::GetPage { slug } => {
                let page = self.db.page_by_slug(&slug).await?;
                self.page_response(page).await?
            }
            Command::GetPageById { id } => {
                let page = self.db.page_by_id(id).await?;
                self.page_response(page).await?
            }
            Command::CreatePage { token, page } => {
                let admin = self.sessions.resolve(&token).await?;
                let page = self.db.create_page(&admin, page).await?;
                self.page_response(page).await?
            }
            Command::UpdatePage { token, id, page } => {
                let admin = self.sessions.resolve(&token).await?;
                let page = self.db.update_page(&admin, id, page).await?;
                self.page_response(page).await?
            }
            Command::DeletePage { token, id } => {
                let admin = self.sessions.resolve(&token).await?;
                self.db.delete_page(&admin, id).await?;
                Response::done(format!("Deleted page {id}"))
            }
            Command::CorrectCount {
                token,
                subject,
                count,
            } => {
                let admin = self.sessions.resolve(&token).await?;
                let subject = SubjectId::new(subject)?;
                self.db.correct_count(&admin, &subject, count).await?;
                Response::Count {
                    subject: subject.to_string(),
                    count,
                }
            }
        };
        Ok(response)
    }

    async fn page_response(&self, page: Page) -> KudosResult<Response> {
        let likes = self.db.read(&page.subject()).await?;
        Ok(Response::Page { page, likes })
    }
}

/// Requests from any `0.x` client with the same minor version are served.
pub fn check_version(version: &str) -> KudosResult<()> {
    let protocol_error = |msg: String| KudosError::ProtocolError { msg };
    let requirement = VersionReq::parse(&format!("^{PROTOCOL_VERSION}"))
        .map_err(|e| protocol_error(e.to_string()))?;
    let version = Version::parse(version)
        .map_err(|e| protocol_error(format!("bad version {version:?}: {e}")))?;
    if !requirement.matches(&version) {
        return Err(protocol_error(format!(
            "client speaks {version}, server speaks {PROTOCOL_VERSION}"
        ))
        .into());
    }
    Ok(())
}

async fn read_request<S>(conn: &mut S) -> KudosResult<Request>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let bytes = tokio::time::timeout(
        REQUEST_TIMEOUT,
        conn.take(MAX_REQUEST_SIZE).read_to_end(&mut buffer),
    )
    .await
    .map_err(|_| KudosError::ProtocolError {
        msg: "timed out reading request".into(),
    })??;
    debug!("Read {bytes} bytes");

    let request = serde_json::from_slice::<Request>(&buffer).map_err(|e| {
        KudosError::ProtocolError {
            msg: format!("malformed request: {e}"),
        }
    })?;
    Ok(request)
}

/// Serve exactly one request on `conn`, then close it.
pub async fn handle_conn_request<S>(mut conn: S, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_request(&mut conn).await {
        Ok(request) => {
            debug!(command = ?request.command, "Handling request");
            ctx.dispatch(request).await
        }
        Err(e) => {
            warn!("Unreadable request: {e:#}");
            Response::from_error(&e)
        }
    };

    let bytes = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Unable to serialise response: {e}");
            return;
        }
    };
    if let Err(e) = conn.write_all(&bytes).await {
        error!("Error writing response: {e}");
        return;
    }
    if let Err(e) = conn.shutdown().await {
        debug!("Error during shutdown: {e}");
    }
}

/// Accept connections forever, one task per connection. Dropping the
/// returned future aborts every connection still in progress.
pub async fn serve(listener: TcpListener, acceptor: Option<TlsAcceptor>, ctx: Arc<ServerContext>) {
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Unable to accept connection: {e}");
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };
        let ctx = Arc::clone(&ctx);
        let acceptor = acceptor.clone();

        connections.spawn(async move {
            debug!(%peer, "Connected");
            match acceptor {
                Some(acceptor) => {
                    match tokio::time::timeout(REQUEST_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => handle_conn_request(stream, ctx).await,
                        Ok(Err(e)) => warn!(%peer, "TLS handshake failed: {e}"),
                        Err(_) => warn!(%peer, "TLS handshake timed out"),
                    }
                }
                None => handle_conn_request(stream, ctx).await,
            }
        });
    }
}

/// Log where we are listening, then [`serve`].
pub async fn run(listener: TcpListener, acceptor: Option<TlsAcceptor>, ctx: Arc<ServerContext>) {
    match listener.local_addr() {
        Ok(addr) => info!(tls = acceptor.is_some(), "Listening on {addr}..."),
        Err(e) => warn!("Listening on an unknown address: {e}"),
    }
    serve(listener, acceptor, ctx).await
}
