use crate::command::grpc;
use concepts::{DatabaseOperation, Event, Target};
use queue::database::{Change, UpdateDescription};
use queue::firehose::{FirehosePayload, Message};
use queue::http::HttpRequest;

pub(crate) fn key_values<K: Into<String>, V: Into<String>>(
    pairs: impl IntoIterator<Item = (K, V)>,
) -> Vec<grpc::KeyValue> {
    pairs
        .into_iter()
        .map(|(key, value)| grpc::KeyValue {
            key: key.into(),
            value: value.into(),
        })
        .collect()
}

impl From<&Target> for grpc::Target {
    fn from(target: &Target) -> Self {
        Self {
            function_id: target.id.to_string(),
            handler: target.handler.clone(),
            cwd: target.cwd.to_string_lossy().into_owned(),
            env: key_values(
                target
                    .context
                    .env
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            ),
            timeout: prost_wkt_types::Duration::try_from(target.context.timeout).ok(),
        }
    }
}

impl From<&Event> for grpc::Event {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.to_string(),
            event_type: event.event_type.to_string(),
            target: Some(grpc::Target::from(event.target.as_ref())),
            created_at: Some(prost_wkt_types::Timestamp::from(event.created_at)),
        }
    }
}

impl From<HttpRequest> for grpc::HttpRequest {
    fn from(request: HttpRequest) -> Self {
        Self {
            method: request.method,
            url: request.url,
            path: request.path,
            query: request.query,
            headers: key_values(request.headers),
            params: key_values(request.params),
            body: request.body.to_vec(),
        }
    }
}

impl From<UpdateDescription> for grpc::UpdateDescription {
    fn from(description: UpdateDescription) -> Self {
        Self {
            updated_fields: description.updated_fields.to_string(),
            removed_fields: description.removed_fields,
        }
    }
}

impl From<Change> for grpc::Change {
    fn from(change: Change) -> Self {
        Self {
            kind: change.kind.to_string(),
            collection: change.collection,
            document: change.document.map(|document| document.to_string()),
            document_key: change.document_key.to_string(),
            update_description: change.update_description.map(Into::into),
        }
    }
}

fn json_argument(value: &str, name: &str) -> Result<serde_json::Value, tonic::Status> {
    if value.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(value).map_err(|err| {
        tonic::Status::invalid_argument(format!("argument `{name}` must be JSON encoded - {err}"))
    })
}

impl TryFrom<grpc::Change> for Change {
    type Error = tonic::Status;

    fn try_from(change: grpc::Change) -> Result<Self, Self::Error> {
        let kind = change.kind.parse::<DatabaseOperation>().map_err(|_| {
            tonic::Status::invalid_argument(format!(
                "argument `change.kind` must be one of insert, update, replace, delete, got `{}`",
                change.kind
            ))
        })?;
        if change.collection.is_empty() {
            return Err(tonic::Status::invalid_argument(
                "argument `change.collection` must not be empty",
            ));
        }
        let update_description = change
            .update_description
            .map(|description| {
                Ok::<_, tonic::Status>(UpdateDescription {
                    updated_fields: json_argument(
                        &description.updated_fields,
                        "change.update_description.updated_fields",
                    )?,
                    removed_fields: description.removed_fields,
                })
            })
            .transpose()?;
        Ok(Change {
            kind,
            collection: change.collection,
            document: change
                .document
                .as_deref()
                .map(|document| json_argument(document, "change.document"))
                .transpose()?,
            document_key: json_argument(&change.document_key, "change.document_key")?,
            update_description,
        })
    }
}

impl From<Message> for grpc::FirehoseMessage {
    fn from(message: Message) -> Self {
        Self {
            name: message.name,
            data: message.data.to_string(),
        }
    }
}

impl TryFrom<grpc::FirehoseMessage> for Message {
    type Error = tonic::Status;

    fn try_from(message: grpc::FirehoseMessage) -> Result<Self, Self::Error> {
        let data = if message.data.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&message.data).map_err(|err| {
                tonic::Status::invalid_argument(format!(
                    "argument `message.data` must be JSON encoded - {err}"
                ))
            })?
        };
        Ok(Message::new(message.name, data))
    }
}

impl From<FirehosePayload> for grpc::FirehosePopResponse {
    fn from(payload: FirehosePayload) -> Self {
        Self {
            client: Some(grpc::FirehoseClient {
                id: payload.client.id.to_string(),
                remote_address: payload.client.remote_address,
            }),
            pool: Some(grpc::FirehosePool {
                size: u64::try_from(payload.pool.size).unwrap_or(u64::MAX),
            }),
            message: Some(payload.message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concepts::{Context, EventType, FunctionId};
    use indexmap::IndexMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn event_carries_target_context() {
        let target = Target::new(FunctionId::new("fn1"), "hello", "/functions/fn1").with_context(
            Arc::new(Context {
                env: IndexMap::from([("MODE".to_string(), "dev".to_string())]),
                timeout: Duration::from_millis(1500),
                batch: None,
            }),
        );
        let event = Event::new(EventType::Http, Arc::new(target));
        let grpc_event = grpc::Event::from(&event);
        assert_eq!(event.id.to_string(), grpc_event.id);
        assert_eq!("HTTP", grpc_event.event_type);
        let grpc_target = grpc_event.target.unwrap();
        assert_eq!("fn1", grpc_target.function_id);
        assert_eq!("/functions/fn1", grpc_target.cwd);
        assert_eq!(
            vec![grpc::KeyValue {
                key: "MODE".to_string(),
                value: "dev".to_string()
            }],
            grpc_target.env
        );
        let timeout = grpc_target.timeout.unwrap();
        assert_eq!((1, 500_000_000), (timeout.seconds, timeout.nanos));
    }

    #[test]
    fn change_documents_are_json_strings() {
        let change = grpc::Change::from(Change {
            kind: DatabaseOperation::Update,
            collection: "users".to_string(),
            document: None,
            document_key: serde_json::json!({"_id": 7}),
            update_description: Some(UpdateDescription {
                updated_fields: serde_json::json!({"name": "Ann"}),
                removed_fields: vec!["age".to_string()],
            }),
        });
        assert_eq!("update", change.kind);
        assert_eq!(None, change.document);
        assert_eq!(r#"{"_id":7}"#, change.document_key);
        assert_eq!(
            r#"{"name":"Ann"}"#,
            change.update_description.unwrap().updated_fields
        );
    }

    #[test]
    fn firehose_message_data_must_be_json() {
        let message = Message::try_from(grpc::FirehoseMessage {
            name: "chat".to_string(),
            data: r#"{"text":"hi"}"#.to_string(),
        })
        .unwrap();
        assert_eq!(serde_json::json!({"text": "hi"}), message.data);

        let empty = Message::try_from(grpc::FirehoseMessage {
            name: "ping".to_string(),
            data: String::new(),
        })
        .unwrap();
        assert_eq!(serde_json::Value::Null, empty.data);

        let status = Message::try_from(grpc::FirehoseMessage {
            name: "chat".to_string(),
            data: "not json".to_string(),
        })
        .unwrap_err();
        assert_eq!(tonic::Code::InvalidArgument, status.code());
    }

    #[test]
    fn published_change_is_parsed() {
        let change = Change::try_from(grpc::Change {
            kind: "Insert".to_string(),
            collection: "users".to_string(),
            document: Some(r#"{"_id":7,"name":"Ann"}"#.to_string()),
            document_key: r#"{"_id":7}"#.to_string(),
            update_description: None,
        })
        .unwrap();
        assert_eq!(DatabaseOperation::Insert, change.kind);
        assert_eq!("users", change.collection);
        assert_eq!(
            Some(serde_json::json!({"_id": 7, "name": "Ann"})),
            change.document
        );
        assert_eq!(serde_json::json!({"_id": 7}), change.document_key);
    }

    #[test]
    fn published_change_must_be_well_formed() {
        let valid = grpc::Change {
            kind: "update".to_string(),
            collection: "users".to_string(),
            document: None,
            document_key: r#"{"_id":7}"#.to_string(),
            update_description: Some(grpc::UpdateDescription {
                updated_fields: r#"{"name":"Ann"}"#.to_string(),
                removed_fields: Vec::new(),
            }),
        };
        let unknown_kind = grpc::Change {
            kind: "truncate".to_string(),
            ..valid.clone()
        };
        let no_collection = grpc::Change {
            collection: String::new(),
            ..valid.clone()
        };
        let bad_fields = grpc::Change {
            update_description: Some(grpc::UpdateDescription {
                updated_fields: "{".to_string(),
                removed_fields: Vec::new(),
            }),
            ..valid.clone()
        };
        assert!(Change::try_from(valid).is_ok());
        for change in [unknown_kind, no_collection, bad_fields] {
            let status = Change::try_from(change).unwrap_err();
            assert_eq!(tonic::Code::InvalidArgument, status.code());
        }
    }
}
