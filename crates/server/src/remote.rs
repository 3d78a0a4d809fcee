//! Client side of the wire protocol.

use std::net::SocketAddr;

use kudos_core::{
    prelude::CounterStore, state::SubjectId, Command, KudosError, KudosResult, Request, Response,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{rustls::pki_types::ServerName, TlsConnector};
use tracing::debug;

use crate::{ServerError, BUFFER_SIZE};

/// Write one request, close our half, read the whole answer.
pub async fn exchange<S>(mut stream: S, request: &Request) -> KudosResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&serde_json::to_vec(request)?).await?;
    stream.shutdown().await?;

    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let bytes = stream.read_to_end(&mut buffer).await?;
    debug!("Read {bytes} bytes");
    let response = serde_json::from_slice::<Response>(&buffer).map_err(|e| {
        ServerError::UnexpectedResponse {
            msg: e.to_string(),
        }
    })?;
    Ok(response)
}

/// A kudos server reached over the network. Also usable as a
/// [`CounterStore`], so a [`kudos_core::reconcile::ReconciliationClient`]
/// can sit in front of it.
pub struct RemoteStore {
    addr: SocketAddr,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl RemoteStore {
    pub fn plain(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    pub fn tls(addr: SocketAddr, connector: TlsConnector, domain: ServerName<'static>) -> Self {
        Self {
            addr,
            tls: Some((connector, domain)),
        }
    }

    pub async fn send(&self, command: Command) -> KudosResult<Response> {
        let request = Request::new(command);
        let stream = TcpStream::connect(self.addr).await?;
        match &self.tls {
            Some((connector, domain)) => {
                let stream = connector.connect(domain.clone(), stream).await?;
                exchange(stream, &request).await
            }
            None => exchange(stream, &request).await,
        }
    }

    async fn count(&self, command: Command) -> KudosResult<u64> {
        let response = self
            .send(command)
            .await
            .map_err(|e| KudosError::store_unavailable(format!("{e:#}")))?;
        match response {
            Response::Count { count, .. } => Ok(count),
            Response::Error { kind, msg } => Err(remote_error(&kind, msg).into()),
            other => Err(ServerError::UnexpectedResponse {
                msg: format!("{other:?}"),
            }
            .into()),
        }
    }
}

/// Rebuild the domain error a server reported, as far as the kind allows.
pub fn remote_error(kind: &str, msg: String) -> KudosError {
    match kind {
        "store_unavailable" => KudosError::StoreUnavailable { msg },
        "upstream_unavailable" => KudosError::UpstreamUnavailable { msg },
        "invalid_subject" => KudosError::InvalidSubject { reason: msg },
        "not_found" => KudosError::PageNotFound,
        "unauthorized" => KudosError::Unauthorized { msg },
        "protocol" => KudosError::ProtocolError { msg },
        _ => KudosError::CustomError { msg },
    }
}

#[async_trait::async_trait]
impl CounterStore for RemoteStore {
    async fn increment(&self, subject: &SubjectId) -> KudosResult<u64> {
        self.count(Command::Like {
            subject: subject.to_string(),
        })
        .await
    }

    async fn read(&self, subject: &SubjectId) -> KudosResult<u64> {
        self.count(Command::Count {
            subject: subject.to_string(),
        })
        .await
    }
}
