use super::grpc;
use crate::config::config_holder::ConfigHolder;
use crate::config::store::FunctionStore;
use crate::config::toml::{ConfigToml, EXEC_RUNTIME, FirehoseConfig, HttpConfig};
use crate::init;
use crate::server::grpc_server::GrpcServer;
use anyhow::{Context as _, bail};
use concepts::{FunctionSpec, TargetChange};
use enqueuers::{EnqueuerRegistry, SubscriptionError};
use enqueuers::database::{DatabaseEnqueuer, InMemoryChangeStream};
use enqueuers::firehose::FirehoseEnqueuer;
use enqueuers::http::HttpEnqueuer;
use enqueuers::schedule::ScheduleEnqueuer;
use enqueuers::system::SystemEnqueuer;
use queue::EventQueue;
use queue::database::DatabaseQueue;
use queue::firehose::FirehoseQueue;
use queue::http::HttpQueue;
use scheduler::{Reconciler, Scheduler, SchedulerConfig};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tonic::codec::CompressionEncoding;
use tracing::{Instrument as _, Span, debug, error, info, info_span, instrument, warn};
use worker::process::{ProcessRuntime, ProcessRuntimeConfig};

const WORKER_SUBCOMMAND: &str = "worker";

pub(crate) async fn run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config_holder = ConfigHolder::new(config)?;
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config);
    Box::pin(run_internal(config, config_holder)).await
}

pub(crate) async fn verify(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config_holder = ConfigHolder::new(config)?;
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config);
    let verified = verify_internal(config, &config_holder)?;
    let invalid = invalid_triggers(&verified.functions);
    for (function_id, handler, err) in &invalid {
        error!("Function `{function_id}`, handler `{handler}`: {err}");
    }
    if !invalid.is_empty() {
        bail!("{} trigger(s) failed verification", invalid.len());
    }
    info!(
        "Verified {} functions with {} triggers",
        verified.functions.len(),
        verified
            .functions
            .iter()
            .map(|function| function.triggers.len())
            .sum::<usize>()
    );
    Ok(())
}

/// Validates the options of every declared trigger, including inactive ones.
fn invalid_triggers(
    functions: &[FunctionSpec],
) -> Vec<(String, String, enqueuers::SubscriptionError)> {
    functions
        .iter()
        .flat_map(|function| {
            function
                .triggers
                .iter()
                .filter_map(move |(handler, trigger)| {
                    enqueuers::validate(&trigger.options)
                        .err()
                        .map(|err| (function.id.to_string(), handler.clone(), err))
                })
        })
        .collect()
}

#[derive(Debug)]
struct ServerVerified {
    api_listening_addr: SocketAddr,
    http: HttpConfig,
    firehose: FirehoseConfig,
    queue_capacity: usize,
    ready_debounce: Duration,
    scheduler: SchedulerConfig,
    runtime: ProcessRuntimeConfig,
    functions: Vec<FunctionSpec>,
}

#[instrument(skip_all, name = "verify")]
fn verify_internal(
    config: ConfigToml,
    config_holder: &ConfigHolder,
) -> anyhow::Result<ServerVerified> {
    let functions = FunctionStore::load(config.functions, config_holder.toml_dir())?;
    let runtime = {
        let (program, args) = match config.runtime.program {
            Some(program) => (program, config.runtime.args),
            None if config.runtime.name == EXEC_RUNTIME => {
                let program =
                    std::env::current_exe().context("cannot determine the current executable")?;
                let args = std::iter::once(WORKER_SUBCOMMAND.to_string())
                    .chain(config.runtime.args)
                    .collect();
                (program, args)
            }
            None => bail!(
                "runtime `{}` requires `program` to be set",
                config.runtime.name
            ),
        };
        let mut env = config
            .runtime
            .env_vars
            .iter()
            .map(crate::config::env_var::EnvVarConfig::resolve)
            .collect::<Result<Vec<_>, _>>()
            .context("cannot resolve `runtime.env_vars`")?;
        if let Some(database) = config.database {
            env.push((worker::env::DATABASE_URI.to_string(), database.uri));
            env.push((worker::env::DATABASE_NAME.to_string(), database.name));
            if let Some(replica_set) = database.replica_set {
                env.push((worker::env::REPLICA_SET.to_string(), replica_set));
            }
        }
        if let Some(public_url) = config.public_url {
            env.push((worker::env::PUBLIC_URL.to_string(), public_url));
        }
        ProcessRuntimeConfig {
            name: config.runtime.name,
            program,
            args,
            cwd: None,
            entrypoint: config.runtime.entrypoint,
            grpc_address: grpc_address(config.api.listening_addr),
            env,
            kill_grace: config.scheduler.kill_grace.into(),
        }
    };
    let scheduler = SchedulerConfig {
        pool_size: config.scheduler.pool_size,
        timeout: config.scheduler.timeout.into(),
        respawn_backoff: config.scheduler.respawn_backoff.into(),
        forward_stdout: config.runtime.forward_stdout.into(),
        forward_stderr: config.runtime.forward_stderr.into(),
    };
    debug!(?runtime, ?scheduler, "Configuration verified");
    Ok(ServerVerified {
        api_listening_addr: config.api.listening_addr,
        http: config.http,
        firehose: config.firehose,
        queue_capacity: config.scheduler.queue_capacity,
        ready_debounce: config.scheduler.ready_debounce.into(),
        scheduler,
        runtime,
        functions: functions.into_functions(),
    })
}

/// Address workers dial. Wildcard listeners are reached through loopback.
fn grpc_address(listening_addr: SocketAddr) -> String {
    let mut addr = listening_addr;
    if addr.ip().is_unspecified() {
        addr.set_ip(if addr.is_ipv4() {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv6Addr::LOCALHOST.into()
        });
    }
    format!("http://{addr}")
}

struct SubQueues {
    http: Arc<HttpQueue>,
    database: Arc<DatabaseQueue>,
    firehose: Arc<FirehoseQueue>,
}

impl SubQueues {
    fn register(queue: &EventQueue) -> Self {
        let sub_queues = Self {
            http: Arc::default(),
            database: Arc::default(),
            firehose: Arc::default(),
        };
        queue.add_queue(sub_queues.http.clone());
        queue.add_queue(sub_queues.database.clone());
        queue.add_queue(sub_queues.firehose.clone());
        sub_queues
    }
}

async fn run_internal(config: ConfigToml, config_holder: ConfigHolder) -> anyhow::Result<()> {
    let verified = verify_internal(config, &config_holder)?;
    let api_listening_addr = verified.api_listening_addr;

    let (queue, messages) = EventQueue::new(verified.queue_capacity);
    let sub_queues = SubQueues::register(&queue);

    let http_enqueuer = Arc::new(
        HttpEnqueuer::new(
            queue.clone(),
            sub_queues.http.clone(),
            &verified.http.path_prefix,
        )
        .with_max_body_size(verified.http.max_body_size),
    );
    let firehose_enqueuer = Arc::new(FirehoseEnqueuer::new(
        queue.clone(),
        sub_queues.firehose.clone(),
    ));
    // Fed through the `Database.Publish` RPC by the change-stream connector.
    let change_stream = Arc::new(InMemoryChangeStream::default());
    let mut registry = EnqueuerRegistry::new();
    registry.register(http_enqueuer.clone());
    registry.register(Arc::new(DatabaseEnqueuer::new(
        queue.clone(),
        sub_queues.database.clone(),
        change_stream.clone(),
    )));
    registry.register(Arc::new(ScheduleEnqueuer::new(queue.clone())));
    registry.register(firehose_enqueuer.clone());
    registry.register(Arc::new(SystemEnqueuer::new(
        queue.clone(),
        verified.ready_debounce,
    )));

    let _listeners = start_listeners(
        &verified.http,
        http_enqueuer,
        &verified.firehose,
        firehose_enqueuer.clone(),
    )
    .await?;

    let runtime = Arc::new(ProcessRuntime::new(verified.runtime));
    let scheduler = Scheduler::spawn(
        verified.scheduler,
        runtime,
        queue.clone(),
        messages,
        registry,
    );

    let mut reconciler = Reconciler::default();
    let reconciliation = reconciler.sync(verified.functions);
    let changes = reconciliation.changes.len();
    let failures = scheduler.reconcile(reconciliation).await;
    info!(
        "Subscribed {} of {changes} triggers",
        changes - failures.len()
    );
    forget_failures(&mut reconciler, &failures);
    let _reloader = AbortOnDropHandle(
        tokio::spawn(
            reload_on_hangup(config_holder, scheduler.clone(), reconciler)
                .instrument(info_span!("reload")),
        )
        .abort_handle(),
    );

    let grpc_server = Arc::new(GrpcServer::new(
        queue,
        sub_queues.http,
        sub_queues.database,
        sub_queues.firehose,
        firehose_enqueuer,
        change_stream,
    ));
    let served = tonic::transport::Server::builder()
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_grpc().make_span_with(make_span)),
        )
        .add_service(
            grpc::queue_server::QueueServer::from_arc(grpc_server.clone())
                .send_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Zstd)
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .add_service(
            grpc::http_server::HttpServer::from_arc(grpc_server.clone())
                .accept_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .add_service(
            grpc::database_server::DatabaseServer::from_arc(grpc_server.clone())
                .send_compressed(CompressionEncoding::Zstd)
                .send_compressed(CompressionEncoding::Gzip),
        )
        .add_service(grpc::firehose_server::FirehoseServer::from_arc(grpc_server))
        .serve_with_shutdown(api_listening_addr, {
            let scheduler = scheduler.clone();
            async move {
                info!("Serving gRPC requests at {api_listening_addr}");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for SIGINT: {err}");
                    return;
                }
                warn!("Received SIGINT, shutting down");
                info!("Pool status: {}", scheduler.pool_status().await);
                scheduler.kill().await;
            }
        })
        .await
        .with_context(|| format!("grpc server error listening on {api_listening_addr}"));
    // Parked pops are cancelled before the server stops, the pool must not outlive it.
    scheduler.kill().await;
    served
}

struct Listeners {
    _http: AbortOnDropHandle,
    _firehose: AbortOnDropHandle,
}

async fn start_listeners(
    http: &HttpConfig,
    http_enqueuer: Arc<HttpEnqueuer>,
    firehose: &FirehoseConfig,
    firehose_enqueuer: Arc<FirehoseEnqueuer>,
) -> anyhow::Result<Listeners> {
    let http_listener = TcpListener::bind(http.listening_addr)
        .await
        .with_context(|| format!("cannot bind HTTP socket {}", http.listening_addr))?;
    info!(
        "HTTP triggers are served at http://{}{}",
        http_listener.local_addr()?,
        http.path_prefix
    );
    let firehose_listener = TcpListener::bind(firehose.listening_addr)
        .await
        .with_context(|| format!("cannot bind firehose socket {}", firehose.listening_addr))?;
    info!(
        "Firehose is listening on ws://{}",
        firehose_listener.local_addr()?
    );
    Ok(Listeners {
        _http: AbortOnDropHandle(
            tokio::spawn(async move {
                if let Err(err) = http_enqueuer.serve(http_listener).await {
                    error!("HTTP server failed: {err}");
                }
            })
            .abort_handle(),
        ),
        _firehose: AbortOnDropHandle(
            tokio::spawn(async move {
                if let Err(err) = firehose_enqueuer.serve(firehose_listener).await {
                    error!("Firehose server failed: {err}");
                }
            })
            .abort_handle(),
        ),
    })
}

#[cfg(unix)]
async fn reload_on_hangup(
    config_holder: ConfigHolder,
    scheduler: Scheduler,
    mut reconciler: Reconciler,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            warn!("Cannot listen for SIGHUP, configuration reloading is disabled: {err}");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading functions");
        if let Err(err) = reload(&config_holder, &scheduler, &mut reconciler).await {
            error!("Cannot reload functions: {err:?}");
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _config_holder: ConfigHolder,
    _scheduler: Scheduler,
    _reconciler: Reconciler,
) {
}

/// Applies the functions currently declared in the configuration file.
/// A configuration that fails to load leaves the running subscriptions untouched.
async fn reload(
    config_holder: &ConfigHolder,
    scheduler: &Scheduler,
    reconciler: &mut Reconciler,
) -> anyhow::Result<()> {
    let config = config_holder.load_config().await?;
    let store = FunctionStore::load(config.functions, config_holder.toml_dir())?;
    let reconciliation = reconciler.sync(store.into_functions());
    if reconciliation.is_empty() {
        info!("Functions are unchanged");
        return Ok(());
    }
    let changes = reconciliation.changes.len();
    let removed = reconciliation.removed.len();
    let failures = scheduler.reconcile(reconciliation).await;
    info!(
        "Reloaded: {changes} trigger changes, {removed} functions removed, {} failures",
        failures.len()
    );
    forget_failures(reconciler, &failures);
    Ok(())
}

/// Unapplied changes are retried by the next reload.
fn forget_failures(reconciler: &mut Reconciler, failures: &[(TargetChange, SubscriptionError)]) {
    for (change, _) in failures {
        reconciler.forget(change);
    }
}

fn make_span<B>(request: &http::Request<B>) -> Span {
    info_span!("incoming gRPC request", uri = %request.uri())
}

struct AbortOnDropHandle(AbortHandle);
impl Drop for AbortOnDropHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
