//! Application-facing publishing API.
//!
//! A publish writes the message to the outbox table, either on its own or
//! inside an [`OutboxTransaction`] shared with the application's business
//! writes. Once the row is durable the dispatcher is nudged so delivery
//! usually starts right away; if the nudge is lost the retry sweep still
//! finds the row.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    error::{Error, Result},
    id::SnowflakeId,
    message::{headers, Headers, MediumMessage, Message, MessageId, MessageKind, Status},
    serializer::Serializer,
    state::to_chrono,
    storage::DataStorage,
};

struct PublisherInner<S> {
    storage: Arc<S>,
    dispatcher: Dispatcher,
    serializer: Arc<dyn Serializer>,
    ids: Arc<SnowflakeId>,
    config: Arc<Config>,
}

pub struct Publisher<S> {
    inner: Arc<PublisherInner<S>>,
}

impl<S> Clone for Publisher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn encode<T: Serialize + ?Sized>(content: &T) -> Result<(Bytes, &'static str)> {
    Ok((
        serde_json::to_vec(content)?.into(),
        std::any::type_name::<T>(),
    ))
}

impl<S: DataStorage> Publisher<S> {
    pub fn new(
        storage: Arc<S>,
        dispatcher: Dispatcher,
        serializer: Arc<dyn Serializer>,
        ids: Arc<SnowflakeId>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                storage,
                dispatcher,
                serializer,
                ids,
                config,
            }),
        }
    }

    /// Publishes `content` as JSON under `name`. Returns the message id.
    pub async fn publish<T>(&self, name: &str, content: &T) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(name, content, Headers::new()).await
    }

    /// Like [`publish`](Self::publish) with extra headers. Well-known headers
    /// already present (id, correlation id, ...) are kept.
    pub async fn publish_with_headers<T>(
        &self,
        name: &str,
        content: &T,
        headers: Headers,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        let (body, type_name) = encode(content)?;
        let message = self.prepare(name, body, headers, Some(type_name), None)?;
        self.store_and_flush(message).await
    }

    /// Publishes and asks the subscriber to publish its return value to
    /// `callback_name`.
    pub async fn publish_with_callback<T>(
        &self,
        name: &str,
        content: &T,
        callback_name: &str,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        let mut headers = Headers::new();
        headers.insert(headers::CALLBACK_NAME.to_owned(), callback_name.to_owned());
        self.publish_with_headers(name, content, headers).await
    }

    /// Publishes an already encoded body.
    pub async fn publish_raw(
        &self,
        name: &str,
        body: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<MessageId> {
        let message = self.prepare(name, body.into(), headers, None, None)?;
        self.store_and_flush(message).await
    }

    /// Publishes `content` for delivery no earlier than `delay` from now.
    pub async fn publish_delay<T>(
        &self,
        delay: Duration,
        name: &str,
        content: &T,
        headers: Headers,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        self.publish_at(Utc::now() + to_chrono(delay), name, content, headers)
            .await
    }

    /// Publishes `content` for delivery no earlier than `at`.
    pub async fn publish_at<T>(
        &self,
        at: DateTime<Utc>,
        name: &str,
        content: &T,
        headers: Headers,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_delay_enabled()?;
        let (body, type_name) = encode(content)?;
        let message = self.prepare(name, body, headers, Some(type_name), Some(at))?;
        self.store_and_flush(message).await
    }

    /// Opens a storage transaction that publishes share with application
    /// writes. Messages become deliverable only after
    /// [`OutboxTransaction::commit`].
    pub async fn begin(&self) -> Result<OutboxTransaction<S>> {
        Ok(OutboxTransaction {
            publisher: self.clone(),
            tx: self.inner.storage.begin().await?,
            pending: Vec::new(),
        })
    }

    fn ensure_delay_enabled(&self) -> Result<()> {
        if self.inner.config.enable_delayed_publish {
            Ok(())
        } else {
            Err(Error::DelayedPublishDisabled)
        }
    }

    fn prepare(
        &self,
        name: &str,
        body: Bytes,
        mut headers: Headers,
        type_name: Option<&str>,
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<MediumMessage> {
        let now = Utc::now();

        let id = match headers.get(headers::MESSAGE_ID) {
            Some(raw) => raw
                .parse::<MessageId>()
                .map_err(|_| Error::invalid_header(headers::MESSAGE_ID))?,
            None => self.inner.ids.next_id(),
        };

        headers.insert(headers::MESSAGE_ID.to_owned(), id.to_string());
        headers.insert(
            headers::MESSAGE_NAME.to_owned(),
            self.inner.config.topic_name(name),
        );
        headers
            .entry(headers::CORRELATION_ID.to_owned())
            .or_insert_with(|| id.to_string());
        headers
            .entry(headers::CORRELATION_SEQUENCE.to_owned())
            .or_insert_with(|| "0".to_owned());
        headers.insert(
            headers::SENT_TIME.to_owned(),
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        if let Some(type_name) = type_name {
            headers
                .entry(headers::TYPE.to_owned())
                .or_insert_with(|| type_name.to_owned());
        }
        if let Some(at) = deliver_at {
            headers.insert(
                headers::DELAY_TIME.to_owned(),
                at.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }

        let origin = Message::new(headers, body);
        let content = self.inner.serializer.serialize_content(&origin)?;

        let (status, due_at) = match deliver_at {
            Some(at) => (Status::Delayed, at),
            None => (Status::Scheduled, now),
        };

        Ok(MediumMessage {
            id,
            origin,
            content,
            added: now,
            expires_at: None,
            due_at,
            retries: 0,
            status,
            exception: None,
        })
    }

    async fn store(&self, message: MediumMessage, tx: Option<&mut S::Transaction>) -> Result<MessageId> {
        let id = message.id;
        self.inner.storage.store_message(&message, tx).await?;

        tracing::debug!(
            message_id = %id,
            name = message.name(),
            status = %message.status,
            "Message stored"
        );

        Ok(id)
    }

    async fn store_and_flush(&self, message: MediumMessage) -> Result<MessageId> {
        let id = self.store(message.clone(), None).await?;
        self.flush(message);
        Ok(id)
    }

    /// Hands freshly committed messages to this node's dispatcher.
    fn flush(&self, message: MediumMessage) {
        let id = message.id;
        let result = match message.status {
            Status::Delayed => {
                let lookahead = Utc::now() + to_chrono(self.inner.config.delayed_lookahead());
                if message.due_at <= lookahead {
                    let due_at = message.due_at;
                    self.inner
                        .dispatcher
                        .enqueue_to_scheduler(MessageKind::Published, message, due_at);
                }
                Ok(())
            }
            _ => self.inner.dispatcher.enqueue_to_publish(message),
        };

        if let Err(e) = result {
            tracing::warn!(message_id = %id, error = %e, "Could not signal dispatcher, leaving message to the retry sweep");
        }
    }
}

/// A storage transaction carrying outbox writes.
///
/// Dropping it without [`commit`](Self::commit) discards the published
/// messages along with everything else written through it.
pub struct OutboxTransaction<S: DataStorage> {
    publisher: Publisher<S>,
    tx: S::Transaction,
    pending: Vec<MediumMessage>,
}

impl<S: DataStorage> OutboxTransaction<S> {
    /// The backend transaction, for the application's own writes.
    pub fn inner(&mut self) -> &mut S::Transaction {
        &mut self.tx
    }

    pub async fn publish<T>(&mut self, name: &str, content: &T) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(name, content, Headers::new()).await
    }

    pub async fn publish_with_headers<T>(
        &mut self,
        name: &str,
        content: &T,
        headers: Headers,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        let (body, type_name) = encode(content)?;
        let message = self
            .publisher
            .prepare(name, body, headers, Some(type_name), None)?;
        self.stage(message).await
    }

    pub async fn publish_delay<T>(
        &mut self,
        delay: Duration,
        name: &str,
        content: &T,
        headers: Headers,
    ) -> Result<MessageId>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.ensure_delay_enabled()?;
        let (body, type_name) = encode(content)?;
        let at = Utc::now() + to_chrono(delay);
        let message = self
            .publisher
            .prepare(name, body, headers, Some(type_name), Some(at))?;
        self.stage(message).await
    }

    async fn stage(&mut self, message: MediumMessage) -> Result<MessageId> {
        let id = self
            .publisher
            .store(message.clone(), Some(&mut self.tx))
            .await?;
        self.pending.push(message);
        Ok(id)
    }

    /// Commits the transaction, then signals the dispatcher for every
    /// message published through it.
    pub async fn commit(self) -> Result<()> {
        let Self {
            publisher,
            tx,
            pending,
        } = self;

        publisher.inner.storage.commit(tx).await?;

        for message in pending {
            publisher.flush(message);
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        let count = self.pending.len();
        self.publisher.inner.storage.rollback(self.tx).await?;
        tracing::debug!(discarded = count, "Outbox transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{serializer::JsonSerializer, storage::memory::InMemoryStorage};

    fn publisher(config: Config) -> (Publisher<InMemoryStorage>, Arc<InMemoryStorage>, Dispatcher) {
        let storage = Arc::new(InMemoryStorage::new());
        let (dispatcher, _queues) = Dispatcher::new(&config, Vec::new());
        let publisher = Publisher::new(
            storage.clone(),
            dispatcher.clone(),
            Arc::new(JsonSerializer),
            Arc::new(SnowflakeId::new(1)),
            Arc::new(config),
        );
        (publisher, storage, dispatcher)
    }

    #[tokio::test]
    async fn publish_stores_scheduled_row_with_headers() {
        let config = Config {
            topic_name_prefix: Some("shop".to_owned()),
            ..Default::default()
        };
        let (publisher, storage, _) = publisher(config);

        let id = publisher
            .publish("order.created", &json!({ "orderId": 123 }))
            .await
            .unwrap();

        let row = storage
            .get_message(MessageKind::Published, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, Status::Scheduled);
        assert_eq!(row.retries, 0);
        assert_eq!(row.expires_at, None);
        assert_eq!(row.name(), "shop.order.created");
        assert_eq!(row.origin.id().unwrap(), id);
        assert_eq!(row.origin.correlation_id(), Some(id.to_string().as_str()));
        assert!(row.origin.header(headers::SENT_TIME).is_some());

        let body: serde_json::Value = row.origin.body_as().unwrap();
        assert_eq!(body, json!({ "orderId": 123 }));
    }

    #[tokio::test]
    async fn rollback_leaves_no_row() {
        let (publisher, storage, dispatcher) = publisher(Config::default());

        let mut tx = publisher.begin().await.unwrap();
        let id = tx.publish("order.created", &json!({ "orderId": 1 })).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(storage
            .get_message(MessageKind::Published, id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(dispatcher.scheduled(), 0);
    }

    #[tokio::test]
    async fn commit_makes_rows_visible() {
        let (publisher, storage, _) = publisher(Config::default());

        let mut tx = publisher.begin().await.unwrap();
        let first = tx.publish("a", &1).await.unwrap();
        let second = tx.publish("b", &2).await.unwrap();
        assert!(tx.inner().len() == 2);
        tx.commit().await.unwrap();

        for id in [first, second] {
            assert!(storage
                .get_message(MessageKind::Published, id)
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn delayed_publish() {
        let (publisher, storage, dispatcher) = publisher(Config::default());

        let id = publisher
            .publish_delay(Duration::from_secs(5), "reminder", &"hi", Headers::new())
            .await
            .unwrap();

        let row = storage
            .get_message(MessageKind::Published, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, Status::Delayed);
        assert!(row.due_at > Utc::now());
        assert!(row.origin.header(headers::DELAY_TIME).is_some());

        // Inside the look-ahead window: parked on this node right away.
        assert_eq!(dispatcher.scheduled(), 1);
    }

    #[tokio::test]
    async fn delayed_publish_can_be_disabled() {
        let config = Config {
            enable_delayed_publish: false,
            ..Default::default()
        };
        let (publisher, _, _) = publisher(config);

        assert!(matches!(
            publisher
                .publish_delay(Duration::from_secs(5), "reminder", &"hi", Headers::new())
                .await,
            Err(Error::DelayedPublishDisabled)
        ));
    }

    #[tokio::test]
    async fn caller_supplied_id_must_be_numeric() {
        let (publisher, _, _) = publisher(Config::default());

        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.to_owned(), "abc".to_owned());
        assert!(matches!(
            publisher.publish_raw("raw", &b"x"[..], headers).await,
            Err(Error::InvalidHeader { .. })
        ));
    }
}
