use clap::{ArgAction, Args, Parser, Subcommand};
use kudos_core::{
    config::KudosConfig,
    page::PageDraft,
    reconcile::{LikeEvent, LikeRequest, ReconciliationClient},
    state::SubjectId,
    Command, KudosError, KudosResult, Response,
};
use server::{
    remote::{remote_error, RemoteStore},
    tls, ServerError,
};
use std::io::{Read, Write};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    /// Path to config file; defaults to ~/.kudos/kudos.toml
    config: Option<PathBuf>,

    #[arg(short, long)]
    /// The socket address of the kudos server. For ex, 127.0.0.1:8080
    socket_addr: Option<SocketAddr>,

    #[arg(long, action = ArgAction::SetTrue)]
    /// Connect over TLS
    tls: bool,

    #[arg(long)]
    /// CA certificate to trust; implies --tls
    cafile: Option<PathBuf>,

    #[arg(long, default_value = "localhost")]
    /// Server name checked against the certificate
    domain: String,

    #[arg(short, long, action = ArgAction::SetTrue)]
    /// Select if the output should be json
    json: bool,

    #[command(subcommand)]
    command: KudosCommand,
}

#[derive(Args, Clone, Debug)]
struct PageArgs {
    #[arg(short, long)]
    title: String,
    #[arg(short, long)]
    slug: String,
    /// Comma or space separated, e.g. "rust, #gamedev"
    #[arg(long, default_value = "")]
    tags: String,
    #[arg(short, long)]
    excerpt: Option<String>,
    #[arg(long)]
    thumbnail: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    highlight: bool,
    /// Page body; read from stdin when missing
    #[arg(short, long)]
    content: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
enum KudosCommand {
    /// Like a subject and wait for the server to confirm
    Like { subject: String },

    /// Current like count of a subject
    Count { subject: String },

    /// Is the stream live
    Live {},

    /// Latest pages
    Pages { limit: Option<u32> },

    Highlights {},

    /// Show a page by slug
    Get { slug: String },

    /// Show a page by id, e.g. before editing it
    Show { id: u32 },

    New {
        #[command(flatten)]
        page: PageArgs,
        /// Admin token; defaults to the configured one
        #[arg(long)]
        token: Option<String>,
    },

    Update {
        id: u32,
        #[command(flatten)]
        page: PageArgs,
        #[arg(long)]
        token: Option<String>,
    },

    Delete {
        id: u32,
        #[arg(long)]
        token: Option<String>,
    },

    /// Overwrite a like count
    Correct {
        subject: String,
        count: u64,
        #[arg(long)]
        token: Option<String>,
    },
}

impl PageArgs {
    fn into_draft(self) -> KudosResult<PageDraft> {
        let content = match self.content {
            Some(content) => content,
            None => {
                println!("Enter page content(Press Ctrl-d on new line to end): ");
                std::io::stdout().flush()?;
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf.trim().to_string()
            }
        };
        Ok(PageDraft {
            title: self.title,
            slug: self.slug,
            content,
            excerpt: self.excerpt,
            tags: self.tags,
            thumbnail_url: self.thumbnail,
            is_highlight: self.highlight,
        })
    }
}

fn admin_token(token: Option<String>, config: &KudosConfig) -> KudosResult<String> {
    token
        .or_else(|| config.admin_token.clone())
        .ok_or_else(|| KudosError::unauthorized("no admin token given or configured").into())
}

fn print_response(response: &Response, json: bool) -> KudosResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    }
    match response {
        Response::Error { kind, msg } => Err(remote_error(kind, msg.clone()).into()),
        _ if json => Ok(()),
        _ => {
            println!("{response}");
            Ok(())
        }
    }
}

/// Show the stored count, like, then show what the server settled on.
async fn like(remote: RemoteStore, subject: String, json: bool) -> KudosResult<()> {
    let subject = SubjectId::new(subject)?;
    let (client, mut events) = ReconciliationClient::new(Arc::new(remote));

    let before = client.load(&subject).await?;
    if let LikeRequest::Started(token) = client.request_like(&subject) {
        tracing::debug!(%subject, token, "Like sent");
    }
    if !json {
        println!("{subject}: {before} -> {} likes...", client.displayed_count(&subject));
    }

    match events.recv().await {
        Some(LikeEvent::Confirmed { subject, count, .. }) => print_response(
            &Response::Count {
                subject: subject.to_string(),
                count,
            },
            json,
        ),
        Some(LikeEvent::Failed {
            error, displayed, ..
        }) => {
            eprintln!("Like failed, back to {displayed}: {error}");
            Err(error.into())
        }
        None => Err(ServerError::custom_error("like was never resolved").into()),
    }
}

fn connect(cli: &Cli, config: &KudosConfig) -> KudosResult<RemoteStore> {
    let socket = cli.socket_addr.unwrap_or(config.socket);
    if !cli.tls && cli.cafile.is_none() {
        return Ok(RemoteStore::plain(socket));
    }
    let connector = tls::connector(cli.cafile.as_deref())?;
    let domain = tls::server_name(&cli.domain)?;
    Ok(RemoteStore::tls(socket, connector, domain))
}

async fn execute(cli: Cli) -> KudosResult<()> {
    let config = KudosConfig::load(cli.config.clone())?;
    let remote = connect(&cli, &config)?;

    let command = match cli.command {
        KudosCommand::Like { subject } => return like(remote, subject, cli.json).await,
        KudosCommand::Count { subject } => Command::Count { subject },
        KudosCommand::Live {} => Command::Liveness {},
        KudosCommand::Pages { limit } => Command::ListPages { limit },
        KudosCommand::Highlights {} => Command::Highlights {},
        KudosCommand::Get { slug } => Command::GetPage { slug },
        KudosCommand::Show { id } => Command::GetPageById { id },
        KudosCommand::New { page, token } => Command::CreatePage {
            token: admin_token(token, &config)?,
            page: page.into_draft()?,
        },
        KudosCommand::Update { id, page, token } => Command::UpdatePage {
            token: admin_token(token, &config)?,
            id,
            page: page.into_draft()?,
        },
        KudosCommand::Delete { id, token } => Command::DeletePage {
            token: admin_token(token, &config)?,
            id,
        },
        KudosCommand::Correct {
            subject,
            count,
            token,
        } => Command::CorrectCount {
            token: admin_token(token, &config)?,
            subject,
            count,
        },
    };

    let response = remote.send(command).await?;
    print_response(&response, cli.json)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = execute(Cli::parse()).await {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}
