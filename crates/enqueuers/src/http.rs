use crate::{Enqueuer, SubscriptionError, mismatch};
use async_trait::async_trait;
use bytes::Bytes;
use concepts::{
    EventOutcome, EventType, FailureKind, Target, TargetFilter, TargetKey, TriggerOptions,
    TriggerType,
};
use http_body_util::{
    BodyExt as _, Full, LengthLimitError, Limited, StreamBody, combinators::UnsyncBoxBody,
};
use hyper::body::{Body, Frame};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    HeaderValue,
};
use hyper::server::conn::http1;
use hyper::{Method, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use indexmap::IndexMap;
use itertools::Itertools as _;
use queue::http::{HttpQueue, HttpRequest, ResponsePart};
use queue::{EventQueue, QueueError, SubQueue as _};
use route_recognizer::{Match, Router};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Instrument as _, Level, debug, debug_span, info, instrument, trace};

pub const DEFAULT_PATH_PREFIX: &str = "/fn-execute";
/// Largest request body buffered into an event.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// `ALL` matches any method and is returned as `None`.
pub(crate) fn parse_method(method: &str) -> Result<Option<Method>, SubscriptionError> {
    let upper = method.to_ascii_uppercase();
    if upper == "ALL" {
        return Ok(None);
    }
    SUPPORTED_METHODS
        .iter()
        .find(|supported| supported.as_str() == upper)
        .cloned()
        .map(Some)
        .ok_or_else(|| SubscriptionError::UnsupportedMethod(method.to_string()))
}

pub(crate) fn check_path(path: &str) -> Result<(), SubscriptionError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(SubscriptionError::InvalidPath(path.to_string()))
    }
}

fn method_name(method: Option<&Method>) -> &str {
    method.map_or("ALL", Method::as_str)
}

pub struct MethodAwareRouter<T> {
    method_map: hashbrown::HashMap<Method, Router<T>>,
    fallback: Router<T>, // Routes registered with `ALL`, queried only if no match is found in `method_map`.
}

// Clone only because of potentially registering 2 paths via `route-recognizer`
impl<T: Clone> MethodAwareRouter<T> {
    pub fn add(&mut self, method: Option<Method>, route: &str, dest: T) {
        let mut add = |method, route, dest| {
            if let Some(method) = method {
                self.method_map.entry(method).or_default().add(route, dest);
            } else {
                self.fallback.add(route, dest);
            }
        };

        let prefix_with_slash;
        if let Some(prefix) = route.strip_suffix("/*") {
            // Add {prefix}/ because the library would not match it otherwise.
            prefix_with_slash = format!("{prefix}/");
            add(method.clone(), &prefix_with_slash, dest.clone());
        }
        add(method, route, dest);
    }
}

impl<T> MethodAwareRouter<T> {
    fn find(&self, method: &Method, path: &Uri) -> Option<Match<&T>> {
        let path = path.path();
        self.method_map
            .get(method)
            .and_then(|router| router.recognize(path).ok())
            .or_else(|| self.fallback.recognize(path).ok())
    }
}

impl<T> Default for MethodAwareRouter<T> {
    fn default() -> Self {
        Self {
            method_map: hashbrown::HashMap::default(),
            fallback: Router::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum RouteDest {
    Target(Arc<Target>),
    Preflight { allow_methods: String },
}

#[derive(Debug, Clone)]
struct Registration {
    method: Option<Method>,
    route: String,
    preflight: bool,
    target: Arc<Target>,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("socket error: {0}")]
    SocketError(std::io::Error),
}

#[derive(Debug, thiserror::Error)]
enum HandleRequestError {
    #[error("incoming request error: {0}")]
    IncomingRequest(String),
    #[error("route not found")]
    RouteNotFound,
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error(transparent)]
    Queue(QueueError),
    #[error("response creation error: {0}")]
    ResponseCreation(String),
    #[error("no response was produced")]
    NoResponse,
}

/// Serves function routes on a shared HTTP listener. Each request becomes an
/// `HTTP` event whose response is streamed back from the worker.
pub struct HttpEnqueuer {
    queue: EventQueue,
    http_queue: Arc<HttpQueue>,
    path_prefix: String,
    max_body_size: usize,
    registrations: Mutex<IndexMap<TargetKey, Registration>>,
    router: RwLock<Arc<MethodAwareRouter<RouteDest>>>,
}

impl HttpEnqueuer {
    #[must_use]
    pub fn new(queue: EventQueue, http_queue: Arc<HttpQueue>, path_prefix: &str) -> Self {
        Self {
            queue,
            http_queue,
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            registrations: Mutex::default(),
            router: RwLock::default(),
        }
    }

    /// Requests with a larger body are answered with `413 Payload Too Large`.
    #[must_use]
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    fn rebuild(&self, registrations: &IndexMap<TargetKey, Registration>) {
        let mut router = MethodAwareRouter::default();
        let mut preflights: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for registration in registrations.values() {
            router.add(
                registration.method.clone(),
                &registration.route,
                RouteDest::Target(registration.target.clone()),
            );
            if registration.preflight {
                preflights
                    .entry(&registration.route)
                    .or_default()
                    .push(method_name(registration.method.as_ref()));
            }
        }
        for (route, methods) in preflights {
            let explicit_options = registrations
                .values()
                .any(|other| other.method == Some(Method::OPTIONS) && other.route == route);
            if explicit_options {
                continue;
            }
            let allow_methods = if methods.contains(&"ALL") {
                SUPPORTED_METHODS.iter().map(Method::as_str).join(", ")
            } else {
                methods
                    .into_iter()
                    .chain([Method::OPTIONS.as_str()])
                    .unique()
                    .join(", ")
            };
            router.add(
                Some(Method::OPTIONS),
                route,
                RouteDest::Preflight { allow_methods },
            );
        }
        *self.router.write().unwrap() = Arc::new(router);
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), HttpServerError> {
        loop {
            let (stream, remote_addr) = listener
                .accept()
                .await
                .map_err(HttpServerError::SocketError)?;
            let stream = TokioIo::new(stream);

            // Spawn a tokio task for each TCP stream.
            tokio::task::spawn({
                let enqueuer = self.clone();
                async move {
                    let res = http1::Builder::new()
                        .serve_connection(
                            stream,
                            hyper::service::service_fn(move |req| {
                                let enqueuer = enqueuer.clone();
                                async move { enqueuer.handle_request(req).await }
                            }),
                        )
                        .await;
                    if let Err(err) = res {
                        info!("Error serving connection: {err:?}");
                    }
                }
                .instrument(debug_span!("tcp stream", %remote_addr))
            });
        }
    }

    #[instrument(skip_all, name = "incoming HTTP request", fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle_request<B>(
        &self,
        req: hyper::Request<B>,
    ) -> Result<hyper::Response<ResponseBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Ok(self.handle_request_inner(req).await.unwrap_or_else(|err| {
            debug!("{err:?}");
            match err {
                HandleRequestError::IncomingRequest(err) => resp(
                    &format!("Incoming request error: {err}"),
                    StatusCode::BAD_REQUEST,
                ),
                HandleRequestError::RouteNotFound => resp("Route not found", StatusCode::NOT_FOUND),
                HandleRequestError::BodyTooLarge(max) => resp(
                    &format!("Request body exceeds {max} bytes"),
                    StatusCode::PAYLOAD_TOO_LARGE,
                ),
                HandleRequestError::Queue(_) => {
                    resp("Service is shutting down", StatusCode::SERVICE_UNAVAILABLE)
                }
                HandleRequestError::ResponseCreation(err) => resp(
                    &format!("Cannot create response: {err}"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                ),
                HandleRequestError::NoResponse => {
                    resp("Function failed", StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }))
    }

    async fn handle_request_inner<B>(
        &self,
        req: hyper::Request<B>,
    ) -> Result<hyper::Response<ResponseBody>, HandleRequestError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (dest, params) = {
            let router = self.router.read().unwrap().clone();
            let matched = router
                .find(req.method(), req.uri())
                .ok_or(HandleRequestError::RouteNotFound)?;
            let params: Vec<(String, String)> = matched
                .params()
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            ((*matched.handler()).clone(), params)
        };
        let target = match dest {
            RouteDest::Target(target) => target,
            RouteDest::Preflight { allow_methods } => return Ok(preflight(&allow_methods)),
        };

        let (parts, body) = req.into_parts();
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|err| {
                if err.is::<LengthLimitError>() {
                    HandleRequestError::BodyTooLarge(self.max_body_size)
                } else {
                    HandleRequestError::IncomingRequest(err.to_string())
                }
            })?
            .to_bytes();
        let request = HttpRequest {
            method: parts.method.to_string(),
            url: parts
                .uri
                .path_and_query()
                .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            params,
            body,
        };

        let event = self.queue.new_event(EventType::Http, &target);
        let event_id = event.id;
        debug!(%event_id, handler = %target.handler, "Enqueuing HTTP event");
        let mut receiver = self.http_queue.enqueue(event_id, request);
        if let Err(err) = self.queue.enqueue(event).await {
            self.http_queue
                .settle(&event_id, EventOutcome::Failed(FailureKind::Cancelled));
            return Err(HandleRequestError::Queue(err));
        }
        match receiver.recv().await {
            Some(ResponsePart::Head { status, headers }) => {
                trace!(%event_id, status, "Streaming the response");
                let status = StatusCode::from_u16(status)
                    .map_err(|err| HandleRequestError::ResponseCreation(err.to_string()))?;
                let mut builder = hyper::Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(stream_body(receiver))
                    .map_err(|err| HandleRequestError::ResponseCreation(err.to_string()))
            }
            _ => Err(HandleRequestError::NoResponse),
        }
    }
}

fn stream_body(receiver: mpsc::UnboundedReceiver<ResponsePart>) -> ResponseBody {
    let frames = futures_util::stream::unfold(Some(receiver), |receiver| async move {
        let mut receiver = receiver?;
        let part = loop {
            match receiver.recv().await {
                Some(ResponsePart::Head { .. }) => {}
                other => break other,
            }
        };
        match part {
            Some(ResponsePart::Chunk(chunk)) => Some((Ok(Frame::data(chunk)), Some(receiver))),
            Some(ResponsePart::End) => None,
            Some(ResponsePart::Abort | ResponsePart::Head { .. }) | None => Some((
                Err(std::io::Error::other("response was aborted")),
                None,
            )),
        }
    });
    UnsyncBoxBody::new(StreamBody::new(frames))
}

fn resp(body: &str, status_code: StatusCode) -> hyper::Response<ResponseBody> {
    let body = Full::new(Bytes::copy_from_slice(body.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = hyper::Response::new(body);
    *response.status_mut() = status_code;
    response
}

fn preflight(allow_methods: &str) -> hyper::Response<ResponseBody> {
    let mut response = resp("", StatusCode::NO_CONTENT);
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    if let Ok(value) = HeaderValue::from_str(allow_methods) {
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    response
}

#[async_trait]
impl Enqueuer for HttpEnqueuer {
    fn trigger_type(&self) -> TriggerType {
        TriggerType::Http
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(handler = %target.handler))]
    async fn subscribe(
        &self,
        target: Arc<Target>,
        options: &TriggerOptions,
    ) -> Result<(), SubscriptionError> {
        let TriggerOptions::Http {
            method,
            path,
            preflight,
        } = options
        else {
            return Err(mismatch(TriggerType::Http, options));
        };
        let method = parse_method(method)?;
        check_path(path)?;
        let route = format!("{}{path}", self.path_prefix);
        let key = target.key();

        let mut registrations = self.registrations.lock().unwrap();
        if let Some((existing, _)) = registrations
            .iter()
            .find(|(other, registration)| {
                **other != key && registration.method == method && registration.route == route
            })
        {
            return Err(SubscriptionError::DuplicateRoute {
                method: method_name(method.as_ref()).to_string(),
                route,
                existing: existing.clone(),
            });
        }
        info!(method = method_name(method.as_ref()), %route, "Registering HTTP route");
        registrations.insert(
            key,
            Registration {
                method,
                route,
                preflight: *preflight,
                target,
            },
        );
        self.rebuild(&registrations);
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cwd = ?filter.cwd, handler = ?filter.handler))]
    async fn unsubscribe(&self, filter: &TargetFilter) {
        let mut registrations = self.registrations.lock().unwrap();
        let before = registrations.len();
        registrations.retain(|key, _| !filter.matches_key(key));
        if registrations.len() != before {
            debug!(removed = before - registrations.len(), "Removed HTTP routes");
            self.rebuild(&registrations);
        }
    }
}
