//! Storage destinations.
//!
//! A destination takes one named payload and stores it. Retries and
//! timeouts are not its concern; the dispatcher wraps every call in the
//! destination's [`RetryPolicy`](checkpoint_core::RetryPolicy).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, trace};
use reqwest::{Body, Client};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use checkpoint_core::ftp::{self, FtpReply, ReplyAssembler};

use crate::config::{DestinationConfig, DestinationKind, OutputType};
use crate::device::ByteStream;
use crate::error::CheckpointError;

pub enum UploadBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadBody::Bytes(b) => write!(f, "Bytes({})", b.len()),
            UploadBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

#[async_trait]
pub trait StorageDestination: Send + Sync {
    fn id(&self) -> &str;

    async fn upload(&self, name: &str, body: UploadBody) -> Result<(), CheckpointError>;
}

/// HTTP PUT of the payload to `<url>/<name>`
pub struct HttpDestination {
    id: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
    client: Client,
}

impl HttpDestination {
    pub fn new(
        id: &str,
        url: &str,
        username: Option<String>,
        password: Option<String>,
        connection_timeout: Duration,
    ) -> Result<Self, CheckpointError> {
        let client = Client::builder()
            .connect_timeout(connection_timeout)
            .build()?;
        Ok(HttpDestination {
            id: id.to_string(),
            url: url.trim_end_matches('/').to_string(),
            username,
            password,
            client,
        })
    }
}

#[async_trait]
impl StorageDestination for HttpDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, name: &str, body: UploadBody) -> Result<(), CheckpointError> {
        let url = format!("{}/{}", self.url, name);
        let body = match body {
            UploadBody::Bytes(bytes) => Body::from(bytes),
            UploadBody::Stream(stream) => Body::wrap_stream(stream),
        };
        let mut request = self.client.put(&url).body(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckpointError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        debug!("{}: PUT {} -> {}", self.id, url, status);
        Ok(())
    }
}

/// Copy `body` into `writer`, returning the number of bytes written
async fn write_body<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: UploadBody,
) -> Result<usize, CheckpointError> {
    let mut written = 0usize;
    match body {
        UploadBody::Bytes(bytes) => {
            writer.write_all(&bytes).await?;
            written = bytes.len();
        }
        UploadBody::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await?;
                written += chunk.len();
            }
        }
    }
    Ok(written)
}

/// Write into a local or mounted directory.
///
/// Files are written under a `.part` name and renamed when complete, so a
/// reader of the directory never sees a truncated upload.
pub struct DirectoryDestination {
    id: String,
    path: PathBuf,
}

impl DirectoryDestination {
    pub fn new(id: &str, path: PathBuf) -> Self {
        DirectoryDestination {
            id: id.to_string(),
            path,
        }
    }
}

/// Removes an unfinished `.part` file, including when the upload future is
/// dropped by its attempt timeout.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        PartialFile { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file was renamed into place
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Cannot remove {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl StorageDestination for DirectoryDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, name: &str, body: UploadBody) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.path).await?;
        let target = self.path.join(name);
        let partial = PartialFile::new(self.path.join(format!("{}.part", name)));

        let mut file = tokio::fs::File::create(partial.path()).await?;
        let written = write_body(&mut file, body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(partial.path(), &target).await?;
        partial.disarm();
        debug!("{}: wrote {} bytes to {}", self.id, written, target.display());
        Ok(())
    }
}

/// Passive-mode FTP upload.
///
/// Every upload is one control session: login, `STOR <name>.part` over a
/// passive data connection, then `RNFR`/`RNTO` to the final name. The data
/// connection goes to the control peer; the address in the `227` reply is
/// ignored because servers behind NAT report their internal one. An
/// interrupted transfer leaves the `.part` file on the server.
pub struct FtpDestination {
    id: String,
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    directory: Option<String>,
    connection_timeout: Duration,
}

impl FtpDestination {
    pub fn new(
        id: &str,
        host: &str,
        port: u16,
        username: &str,
        password: Option<String>,
        directory: Option<String>,
        connection_timeout: Duration,
    ) -> Self {
        FtpDestination {
            id: id.to_string(),
            host: host.to_string(),
            port,
            username: username.to_string(),
            password,
            directory,
            connection_timeout,
        }
    }
}

struct FtpSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    replies: ReplyAssembler,
    peer: IpAddr,
}

impl FtpSession {
    async fn connect(host: &str, port: u16, limit: Duration) -> Result<Self, CheckpointError> {
        let unavailable = |reason: String| {
            CheckpointError::DeviceUnavailable(format!("FTP {}:{}: {}", host, port, reason))
        };
        let stream = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| unavailable("connect timeout".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;
        let peer = stream.peer_addr()?.ip();
        let (read, writer) = stream.into_split();
        let mut session = FtpSession {
            lines: BufReader::new(read).lines(),
            writer,
            replies: ReplyAssembler::new(),
            peer,
        };
        let greeting = session.reply().await?;
        expect_reply("connect", greeting, &[ftp::READY])?;
        Ok(session)
    }

    async fn reply(&mut self) -> Result<FtpReply, CheckpointError> {
        loop {
            let line = self.lines.next_line().await?.ok_or_else(|| {
                CheckpointError::DeviceUnavailable("FTP control connection closed".to_string())
            })?;
            trace!("FTP < {}", line);
            if let Some(reply) = self.replies.push(&line) {
                return Ok(reply);
            }
        }
    }

    async fn command(
        &mut self,
        verb: &str,
        argument: Option<&str>,
        expected: &[u16],
    ) -> Result<FtpReply, CheckpointError> {
        trace!("FTP > {}", verb);
        self.writer
            .write_all(ftp::format_command(verb, argument).as_bytes())
            .await?;
        let reply = self.reply().await?;
        expect_reply(verb, reply, expected)
    }
}

fn expect_reply(
    command: &str,
    reply: FtpReply,
    expected: &[u16],
) -> Result<FtpReply, CheckpointError> {
    if expected.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(CheckpointError::FtpReply {
            command: command.to_string(),
            code: reply.code,
            text: reply.text,
        })
    }
}

#[async_trait]
impl StorageDestination for FtpDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, name: &str, body: UploadBody) -> Result<(), CheckpointError> {
        let mut session =
            FtpSession::connect(&self.host, self.port, self.connection_timeout).await?;

        let login = session
            .command(
                "USER",
                Some(&self.username),
                &[ftp::LOGGED_IN, ftp::NEED_PASSWORD],
            )
            .await?;
        if login.code == ftp::NEED_PASSWORD {
            let password = self.password.as_deref().unwrap_or("");
            session
                .command("PASS", Some(password), &[ftp::LOGGED_IN])
                .await?;
        }
        session.command("TYPE", Some("I"), &[ftp::OK]).await?;
        if let Some(directory) = &self.directory {
            session
                .command("CWD", Some(directory), &[ftp::FILE_ACTION_OK])
                .await?;
        }

        let passive = session.command("PASV", None, &[ftp::PASSIVE]).await?;
        let Some((_, data_port)) = ftp::parse_passive(&passive.text) else {
            return Err(CheckpointError::FtpReply {
                command: "PASV".to_string(),
                code: passive.code,
                text: passive.text,
            });
        };
        let mut data = timeout(
            self.connection_timeout,
            TcpStream::connect((session.peer, data_port)),
        )
        .await
        .map_err(|_| CheckpointError::Timeout)??;

        let partial = format!("{}.part", name);
        session
            .command(
                "STOR",
                Some(&partial),
                &[ftp::OPENING_DATA, ftp::TRANSFER_STARTING],
            )
            .await?;
        let written = write_body(&mut data, body).await?;
        data.shutdown().await?;
        drop(data);
        let stored = session.reply().await?;
        expect_reply("STOR", stored, &[ftp::TRANSFER_COMPLETE, ftp::FILE_ACTION_OK])?;

        session
            .command("RNFR", Some(&partial), &[ftp::PENDING])
            .await?;
        session
            .command("RNTO", Some(name), &[ftp::FILE_ACTION_OK])
            .await?;
        if let Err(e) = session.command("QUIT", None, &[ftp::CLOSING]).await {
            debug!("{}: QUIT: {}", self.id, e);
        }
        debug!(
            "{}: stored {} bytes as {} on {}",
            self.id, written, name, self.host
        );
        Ok(())
    }
}

pub fn build_destination(
    config: &DestinationConfig,
) -> Result<Arc<dyn StorageDestination>, CheckpointError> {
    let destination: Arc<dyn StorageDestination> = match &config.kind {
        DestinationKind::Http {
            url,
            username,
            password,
        } => Arc::new(HttpDestination::new(
            &config.id,
            url,
            username.clone(),
            password.clone(),
            Duration::from_secs(config.connection_timeout_s.max(1)),
        )?),
        DestinationKind::Ftp {
            host,
            port,
            username,
            password,
            directory,
        } => Arc::new(FtpDestination::new(
            &config.id,
            host,
            *port,
            username,
            password.clone(),
            directory.clone(),
            Duration::from_secs(config.connection_timeout_s.max(1)),
        )),
        DestinationKind::Directory { path } => {
            Arc::new(DirectoryDestination::new(&config.id, path.clone()))
        }
    };
    info!(
        "{}: {} destination ready{}",
        config.id,
        config.output,
        if config.enabled { "" } else { " (disabled)" }
    );
    Ok(destination)
}

/// File name for an upload: `<code>_<UTC timestamp>_src<source>.<jpg|mkv>`
pub fn upload_name(code: &str, at: DateTime<Utc>, source: u32, output: OutputType) -> String {
    let code: String = code
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let extension = match output {
        OutputType::Image => "jpg",
        OutputType::Video => "mkv",
    };
    format!(
        "{}_{}_src{}.{}",
        code,
        at.format("%Y%m%dT%H%M%SZ"),
        source,
        extension
    )
}
