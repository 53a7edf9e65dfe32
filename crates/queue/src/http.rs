use crate::{QueueError, SubQueue};
use bytes::Bytes;
use concepts::{EventId, EventOutcome, EventType, FailureKind};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Path and query as received.
    pub url: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    /// Values captured by `:name` segments of the route.
    pub params: Vec<(String, String)>,
    pub body: Bytes,
}

/// Pieces of the response streamed back to the still-open HTTP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Chunk(Bytes),
    End,
    /// Terminates the connection mid-body.
    Abort,
}

struct Entry {
    request: Option<HttpRequest>,
    responder: mpsc::UnboundedSender<ResponsePart>,
    head_sent: bool,
}

impl Entry {
    fn send(&self, part: ResponsePart) {
        if self.responder.send(part).is_err() {
            trace!("HTTP client is gone, dropping response part");
        }
    }
}

#[derive(Default)]
pub struct HttpQueue {
    entries: Mutex<hashbrown::HashMap<EventId, Entry>>,
}

impl HttpQueue {
    /// Stores the request. The returned receiver yields the response parts.
    pub fn enqueue(
        &self,
        event_id: EventId,
        request: HttpRequest,
    ) -> mpsc::UnboundedReceiver<ResponsePart> {
        let (responder, receiver) = mpsc::unbounded_channel();
        self.entries.lock().unwrap().insert(
            event_id,
            Entry {
                request: Some(request),
                responder,
                head_sent: false,
            },
        );
        receiver
    }

    pub fn pop(&self, event_id: &EventId) -> Result<HttpRequest, QueueError> {
        self.entries
            .lock()
            .unwrap()
            .get_mut(event_id)
            .and_then(|entry| entry.request.take())
            .ok_or(QueueError::NoItem(*event_id))
    }

    pub fn write_head(
        &self,
        event_id: &EventId,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(event_id)
            .ok_or(QueueError::NoItem(*event_id))?;
        if entry.head_sent {
            return Err(QueueError::HeadAlreadySent(*event_id));
        }
        entry.head_sent = true;
        entry.send(ResponsePart::Head { status, headers });
        Ok(())
    }

    /// Writes a body chunk, sending a `200` head first if none was written.
    pub fn write(&self, event_id: &EventId, chunk: Bytes) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(event_id)
            .ok_or(QueueError::NoItem(*event_id))?;
        Self::ensure_head(entry);
        if !chunk.is_empty() {
            entry.send(ResponsePart::Chunk(chunk));
        }
        Ok(())
    }

    pub fn end(&self, event_id: &EventId, chunk: Option<Bytes>) -> Result<(), QueueError> {
        let mut entry = self
            .entries
            .lock()
            .unwrap()
            .remove(event_id)
            .ok_or(QueueError::NoItem(*event_id))?;
        Self::ensure_head(&mut entry);
        if let Some(chunk) = chunk.filter(|chunk| !chunk.is_empty()) {
            entry.send(ResponsePart::Chunk(chunk));
        }
        entry.send(ResponsePart::End);
        Ok(())
    }

    fn ensure_head(entry: &mut Entry) {
        if !entry.head_sent {
            entry.head_sent = true;
            entry.send(ResponsePart::Head {
                status: 200,
                headers: Vec::new(),
            });
        }
    }
}

fn failure_response(outcome: EventOutcome) -> (u16, &'static str) {
    match outcome {
        EventOutcome::Succeeded => (500, "Function completed without a response"),
        EventOutcome::Failed(FailureKind::Timeout) => (504, "Function timed out"),
        EventOutcome::Failed(FailureKind::Cancelled) => (503, "Service is shutting down"),
        EventOutcome::Failed(FailureKind::Handler | FailureKind::WorkerCrash) => {
            (500, "Function failed")
        }
    }
}

impl SubQueue for HttpQueue {
    fn event_type(&self) -> EventType {
        EventType::Http
    }

    fn settle(&self, event_id: &EventId, outcome: EventOutcome) {
        let Some(entry) = self.entries.lock().unwrap().remove(event_id) else {
            return;
        };
        if entry.head_sent {
            debug!(%event_id, %outcome, "Closing unfinished response");
            entry.send(if outcome.is_success() {
                ResponsePart::End
            } else {
                ResponsePart::Abort
            });
        } else {
            let (status, body) = failure_response(outcome);
            debug!(%event_id, %outcome, status, "Responding on behalf of the function");
            entry.send(ResponsePart::Head {
                status,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
            });
            entry.send(ResponsePart::Chunk(Bytes::from_static(body.as_bytes())));
            entry.send(ResponsePart::End);
        }
    }
}
