//! Handler seam between the consumer loop and a hosting service.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::bus::Record;

/// Failure reported by a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Processing failed; the record is redelivered after backoff.
    #[error("Handler failed: {0}")]
    Retryable(String),

    /// The record can never be processed; the poison policy applies.
    #[error("Poison record: {0}")]
    Poison(String),

    /// The payload does not decode as the expected event. Treated as poison.
    #[error("Failed to decode record: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        HandlerError::Retryable(reason.into())
    }

    pub fn poison(reason: impl Into<String>) -> Self {
        HandlerError::Poison(reason.into())
    }

    pub fn is_poison(&self) -> bool {
        matches!(self, HandlerError::Poison(_) | HandlerError::Decode(_))
    }
}

/// Callback invoked once per delivered record.
///
/// Implementations must be idempotent: the same record can be delivered
/// more than once.
pub trait RecordHandler: Send + Sync {
    fn handle(&self, record: Arc<Record>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> RecordHandler for F
where
    F: Fn(Arc<Record>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, record: Arc<Record>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(record))
    }
}

/// Decodes the payload as JSON `E` before calling the inner function.
///
/// A payload that does not decode fails with `HandlerError::Decode`, so it
/// is routed through the poison policy instead of being retried forever.
pub struct JsonHandler<E, F> {
    f: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> JsonHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E, Arc<Record>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _event: PhantomData,
        }
    }
}

impl<E, F, Fut> RecordHandler for JsonHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E, Arc<Record>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, record: Arc<Record>) -> BoxFuture<'static, Result<(), HandlerError>> {
        match serde_json::from_slice::<E>(&record.payload) {
            Ok(event) => Box::pin((self.f)(event, record)),
            Err(e) => Box::pin(futures::future::ready(Err(HandlerError::Decode(e)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::events::ProgressUpdated;

    fn record(payload: &'static [u8]) -> Arc<Record> {
        Arc::new(Record {
            topic: "progress".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Bytes::from_static(payload),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_error_classification() {
        assert!(!HandlerError::retryable("db down").is_poison());
        assert!(HandlerError::poison("negative score").is_poison());
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(HandlerError::from(decode).is_poison());
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |record: Arc<Record>| async move {
            if record.payload.is_empty() {
                Err(HandlerError::poison("empty"))
            } else {
                Ok(())
            }
        };
        tokio_test::assert_ok!(handler.handle(record(b"{}")).await);
        let err = tokio_test::assert_err!(handler.handle(record(b"")).await);
        assert!(err.is_poison());
    }

    #[tokio::test]
    async fn test_json_handler_decodes_event() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = JsonHandler::new(move |event: ProgressUpdated, _record| {
            let tx = tx.clone();
            async move {
                tx.send(event.score).ok();
                Ok::<(), HandlerError>(())
            }
        });

        handler
            .handle(record(
                br#"{"UserId":"6f1c2a8e-3b9d-4c7e-8f21-0a5b4d3c2e1f","Timestamp":"2024-03-01T07:30:00Z","Score":7}"#,
            ))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_json_handler_decode_failure_is_poison() {
        let handler = JsonHandler::new(|_event: ProgressUpdated, _record| async {
            Ok::<(), HandlerError>(())
        });
        let err = handler.handle(record(b"not json")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }
}
