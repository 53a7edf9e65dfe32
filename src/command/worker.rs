//! Built-in `exec` runtime. Each event runs one process declared in the function's handler
//! manifest: the event payload arrives as JSON on stdin and the exit status settles the event.

use crate::command::grpc::{
    self, database_client::DatabaseClient, firehose_client::FirehoseClient,
    http_client::HttpClient, queue_client::QueueClient,
};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tonic::{Code, transport::Channel};
use tracing::{Instrument as _, debug, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};
use worker::{EXIT_CODE_HANDLER_RESOLUTION, env};

pub(crate) const EVENT_TYPE: &str = "EVENT_TYPE";
pub(crate) const EVENT_ID: &str = "EVENT_ID";
const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecWorkerError {
    #[error("environment variable `{0}` is not set")]
    MissingEnv(&'static str),
    #[error("cannot read handler manifest `{path:?}` - {source}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse handler manifest `{path:?}` - {source}")]
    ManifestParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("handler `{0}` is not declared in the manifest")]
    UnknownHandler(String),
    #[error("cannot execute `{command}` - {source}")]
    Exec {
        command: String,
        source: std::io::Error,
    },
    #[error("cannot connect to `{address}` - {source}")]
    Connect {
        address: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Grpc(#[from] tonic::Status),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecWorkerError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::MissingEnv(_)
            | Self::ManifestRead { .. }
            | Self::ManifestParse { .. }
            | Self::UnknownHandler(_) => EXIT_CODE_HANDLER_RESOLUTION,
            Self::Exec { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                EXIT_CODE_HANDLER_RESOLUTION
            }
            Self::Exec { .. } | Self::Connect { .. } | Self::Grpc(_) | Self::Io(_) => 1,
        }
    }
}

/// Runs until the server stops handing out events, returns the process exit code.
pub(crate) async fn run() -> i32 {
    // Stdout of workers is forwarded by the server, keep it free of log lines.
    fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let settings = match WorkerSettings::from_lookup(|key| std::env::var(key).ok()) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("{err}");
            return err.exit_code();
        }
    };
    let span = info_span!(
        "exec_worker",
        worker_id = %settings.worker_id,
        runtime = %settings.runtime
    );
    match run_internal(settings).instrument(span).await {
        Ok(()) => 0,
        Err(err) => {
            warn!("Worker failed - {err}");
            err.exit_code()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkerSettings {
    grpc_address: String,
    worker_id: String,
    entrypoint: String,
    runtime: String,
    path: Option<String>,
}

impl WorkerSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ExecWorkerError> {
        let required = |key: &'static str| lookup(key).ok_or(ExecWorkerError::MissingEnv(key));
        Ok(Self {
            grpc_address: required(env::FUNCTION_GRPC_ADDRESS)?,
            worker_id: required(env::WORKER_ID)?,
            entrypoint: required(env::ENTRYPOINT)?,
            runtime: required(env::RUNTIME)?,
            path: lookup("PATH"),
        })
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct HandlerManifest {
    #[serde(default)]
    handlers: IndexMap<String, HandlerCommand>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct HandlerCommand {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

impl HandlerManifest {
    fn parse(path: &Path, content: &str) -> Result<Self, ExecWorkerError> {
        toml::from_str(content).map_err(|source| ExecWorkerError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn load(cwd: &Path, entrypoint: &str) -> Result<Self, ExecWorkerError> {
        let path = cwd.join(entrypoint);
        let content = tokio::fs::read_to_string(&path).await.map_err(|source| {
            ExecWorkerError::ManifestRead {
                path: path.clone(),
                source,
            }
        })?;
        Self::parse(&path, &content)
    }

    fn resolve(mut self, handler: &str) -> Result<HandlerCommand, ExecWorkerError> {
        self.handlers
            .swap_remove(handler)
            .ok_or_else(|| ExecWorkerError::UnknownHandler(handler.to_string()))
    }
}

impl HandlerCommand {
    /// Relative paths are resolved against the function directory, bare names against `PATH`.
    fn program(&self, cwd: &Path) -> PathBuf {
        let command = Path::new(&self.command);
        if command.is_relative() && self.command.contains('/') {
            cwd.join(command)
        } else {
            command.to_path_buf()
        }
    }
}

struct Clients {
    queue: QueueClient<Channel>,
    http: HttpClient<Channel>,
    database: DatabaseClient<Channel>,
    firehose: FirehoseClient<Channel>,
}

impl Clients {
    async fn connect(address: &str) -> Result<Self, ExecWorkerError> {
        let to_err = |source: Box<dyn std::error::Error + Send + Sync>| {
            ExecWorkerError::Connect {
                address: address.to_string(),
                source,
            }
        };
        let channel = Channel::from_shared(address.to_string())
            .map_err(|err| to_err(err.into()))?
            .connect()
            .await
            .map_err(|err| to_err(err.into()))?;
        Ok(Self {
            queue: QueueClient::new(channel.clone()),
            http: HttpClient::new(channel.clone()),
            database: DatabaseClient::new(channel.clone()),
            firehose: FirehoseClient::new(channel),
        })
    }
}

async fn run_internal(settings: WorkerSettings) -> Result<(), ExecWorkerError> {
    let mut clients = Clients::connect(&settings.grpc_address).await?;
    info!("Connected to {}", settings.grpc_address);
    loop {
        let event = match clients
            .queue
            .pop(grpc::QueuePopRequest {
                worker_id: settings.worker_id.clone(),
            })
            .await
        {
            Ok(resp) => resp.into_inner().event,
            Err(status) if status.code() == Code::Unavailable => {
                info!("Queue is shutting down");
                return Ok(());
            }
            Err(status) => return Err(status.into()),
        };
        let Some(event) = event else {
            warn!("Queue returned an empty event");
            continue;
        };
        let span = info_span!("event", event_id = %event.id, event_type = %event.event_type);
        handle_event(&mut clients, &settings, event)
            .instrument(span)
            .await?;
    }
}

async fn handle_event(
    clients: &mut Clients,
    settings: &WorkerSettings,
    event: grpc::Event,
) -> Result<(), ExecWorkerError> {
    let Some(payload) = fetch_payload(clients, &event).await? else {
        return Ok(());
    };
    let target = event.target.clone().unwrap_or_default();
    let cwd = PathBuf::from(&target.cwd);
    let handler = HandlerManifest::load(&cwd, &settings.entrypoint)
        .await?
        .resolve(&target.handler)?;
    let mut envs: Vec<(String, String)> = settings
        .path
        .iter()
        .map(|path| ("PATH".to_string(), path.clone()))
        .collect();
    envs.extend(target.env.iter().map(|kv| (kv.key.clone(), kv.value.clone())));
    envs.push((EVENT_TYPE.to_string(), event.event_type.clone()));
    envs.push((EVENT_ID.to_string(), event.id.clone()));
    let input = serde_json::to_vec(&payload).map_err(std::io::Error::from)?;
    let output = execute(&handler, &cwd, envs, input).await?;
    let succeeded = output.status.success();
    debug!(status = %output.status, "Handler finished");

    if succeeded {
        match event.event_type.as_str() {
            "HTTP" => reply_http(clients, &event.id, &output.stdout).await?,
            "FIREHOSE" => reply_firehose(clients, &payload, &output.stdout).await?,
            _ => {}
        }
    }
    match clients
        .queue
        .complete(grpc::CompleteRequest {
            event_id: event.id.clone(),
            succeeded,
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(status) if status.code() == Code::NotFound => {
            warn!("Event was already settled - {}", status.message());
            Ok(())
        }
        Err(status) => Err(status.into()),
    }
}

async fn execute(
    handler: &HandlerCommand,
    cwd: &Path,
    envs: Vec<(String, String)>,
    input: Vec<u8>,
) -> Result<std::process::Output, ExecWorkerError> {
    let program = handler.program(cwd);
    let mut command = Command::new(&program);
    command
        .args(&handler.args)
        .current_dir(cwd)
        .env_clear()
        .envs(envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    debug!("Spawning {command:?}");
    let mut child = command.spawn().map_err(|source| ExecWorkerError::Exec {
        command: handler.command.clone(),
        source,
    })?;
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // A handler that ignores its input may close stdin early.
            if let Err(err) = stdin.write_all(&input).await {
                debug!("Cannot write handler input - {err}");
            }
        });
    }
    Ok(child.wait_with_output().await?)
}

/// Fetches the event's payload as the JSON document handed to the handler.
/// Returns `None` when the payload is gone, meaning the event was settled elsewhere.
async fn fetch_payload(
    clients: &mut Clients,
    event: &grpc::Event,
) -> Result<Option<Value>, ExecWorkerError> {
    let event_id = event.id.clone();
    let fetched = match event.event_type.as_str() {
        "HTTP" => clients
            .http
            .pop(grpc::HttpPopRequest { event_id })
            .await
            .map(|resp| http_payload(resp.into_inner().request.unwrap_or_default())),
        "DATABASE" => clients
            .database
            .pop(grpc::DatabasePopRequest { event_id })
            .await
            .map(|resp| database_payload(resp.into_inner().change.unwrap_or_default())),
        "FIREHOSE" => clients
            .firehose
            .pop(grpc::FirehosePopRequest { event_id })
            .await
            .map(|resp| firehose_payload(resp.into_inner())),
        "SCHEDULE" => Ok(json!({ "scheduled_at": event.created_at })),
        "SYSTEM" => Ok(json!({ "name": enqueuers::system::READY_EVENT })),
        other => {
            debug!("No payload for event type {other}");
            Ok(json!({}))
        }
    };
    match fetched {
        Ok(payload) => Ok(Some(payload)),
        Err(status) if status.code() == Code::NotFound => {
            warn!("Payload is no longer available - {}", status.message());
            Ok(None)
        }
        Err(status) => Err(status.into()),
    }
}

fn key_value_map(pairs: Vec<grpc::KeyValue>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|kv| (kv.key, Value::String(kv.value)))
        .collect()
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

fn http_payload(request: grpc::HttpRequest) -> Value {
    json!({
        "method": request.method,
        "url": request.url,
        "path": request.path,
        "query": request.query,
        "headers": key_value_map(request.headers),
        "params": key_value_map(request.params),
        "body": String::from_utf8_lossy(&request.body),
    })
}

fn database_payload(change: grpc::Change) -> Value {
    json!({
        "kind": change.kind,
        "collection": change.collection,
        "document": change.document.as_deref().map(parse_json),
        "document_key": parse_json(&change.document_key),
        "update_description": change.update_description.map(|description| json!({
            "updated_fields": parse_json(&description.updated_fields),
            "removed_fields": description.removed_fields,
        })),
    })
}

fn firehose_payload(resp: grpc::FirehosePopResponse) -> Value {
    let client = resp.client.unwrap_or_default();
    let message = resp.message.unwrap_or_default();
    json!({
        "client": { "id": client.id, "remote_address": client.remote_address },
        "pool": { "size": resp.pool.unwrap_or_default().size },
        "message": { "name": message.name, "data": parse_json(&message.data) },
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpReplyJson {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    body: Value,
}

const fn default_status() -> u16 {
    200
}

#[derive(Debug, PartialEq, Eq)]
struct HttpReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpReply {
    /// A JSON object with `status`, `headers` or `body` is a structured reply,
    /// anything else is sent verbatim as text.
    fn from_stdout(stdout: &[u8]) -> Self {
        let structured = serde_json::from_slice::<Value>(stdout)
            .ok()
            .filter(Value::is_object)
            .and_then(|value| serde_json::from_value::<HttpReplyJson>(value).ok());
        let Some(reply) = structured else {
            return Self {
                status: default_status(),
                headers: vec![("content-type".to_string(), TEXT_CONTENT_TYPE.to_string())],
                body: stdout.to_vec(),
            };
        };
        let mut headers: Vec<_> = reply.headers.into_iter().collect();
        let has_content_type = headers
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case("content-type"));
        let body = match reply.body {
            Value::Null => Vec::new(),
            Value::String(text) => {
                if !has_content_type {
                    headers.push(("content-type".to_string(), TEXT_CONTENT_TYPE.to_string()));
                }
                text.into_bytes()
            }
            other => {
                if !has_content_type {
                    headers.push(("content-type".to_string(), JSON_CONTENT_TYPE.to_string()));
                }
                other.to_string().into_bytes()
            }
        };
        Self {
            status: reply.status,
            headers,
            body,
        }
    }
}

async fn reply_http(
    clients: &mut Clients,
    event_id: &str,
    stdout: &[u8],
) -> Result<(), ExecWorkerError> {
    let reply = HttpReply::from_stdout(stdout);
    clients
        .http
        .write_head(grpc::WriteHeadRequest {
            event_id: event_id.to_string(),
            status: u32::from(reply.status),
            headers: reply
                .headers
                .into_iter()
                .map(|(key, value)| grpc::KeyValue { key, value })
                .collect(),
        })
        .await?;
    clients
        .http
        .end(grpc::EndRequest {
            event_id: event_id.to_string(),
            data: (!reply.body.is_empty()).then_some(reply.body),
        })
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FirehoseReplyJson {
    name: String,
    #[serde(default)]
    data: Value,
}

fn firehose_reply(stdout: &[u8]) -> Option<grpc::FirehoseMessage> {
    let reply: FirehoseReplyJson = serde_json::from_slice(stdout).ok()?;
    Some(grpc::FirehoseMessage {
        name: reply.name,
        data: reply.data.to_string(),
    })
}

async fn reply_firehose(
    clients: &mut Clients,
    payload: &Value,
    stdout: &[u8],
) -> Result<(), ExecWorkerError> {
    let Some(message) = firehose_reply(stdout) else {
        return Ok(());
    };
    let client_id = payload["client"]["id"].as_str().unwrap_or_default().to_string();
    match clients
        .firehose
        .send(grpc::SendRequest {
            client_id,
            message: Some(message),
        })
        .await
    {
        Ok(_) => Ok(()),
        Err(status) if status.code() == Code::NotFound => {
            warn!("Firehose client disconnected - {}", status.message());
            Ok(())
        }
        Err(status) => Err(status.into()),
    }
}
