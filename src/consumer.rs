//! Broker intake.
//!
//! [`ConsumerRegister`] keeps `consumer_thread_count` clients listening per
//! group. Every delivery is persisted as a received row before it is
//! acknowledged, so a crash between the two causes a redelivery that the
//! (message id, group) de-duplication absorbs.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    error::Result,
    id::SnowflakeId,
    message::{headers, MediumMessage, Message, Status, TransportMessage},
    serializer::Serializer,
    state::to_chrono,
    storage::{DataStorage, StoreOutcome},
    transport::{ConsumerClient, ConsumerClientFactory, Delivery},
};

/// Pause before a failed client is recreated.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Deliveries buffered between a client and the intake loop.
const INTAKE_BUFFER: usize = 64;

pub struct ConsumerRegister<S> {
    storage: Arc<S>,
    factory: Arc<dyn ConsumerClientFactory>,
    serializer: Arc<dyn Serializer>,
    dispatcher: Dispatcher,
    ids: Arc<SnowflakeId>,
    config: Arc<Config>,
}

impl<S: DataStorage> ConsumerRegister<S> {
    pub fn new(
        storage: Arc<S>,
        factory: Arc<dyn ConsumerClientFactory>,
        serializer: Arc<dyn Serializer>,
        dispatcher: Dispatcher,
        ids: Arc<SnowflakeId>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            storage,
            factory,
            serializer,
            dispatcher,
            ids,
            config,
        }
    }

    /// Spawns the listeners for every group in `groups` (group name to
    /// topics).
    pub fn start(
        self: Arc<Self>,
        groups: BTreeMap<String, Vec<String>>,
        cancellation: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let clients = self.config.consumer_thread_count.max(1);

        groups
            .into_iter()
            .flat_map(|(group, topics)| {
                tracing::info!(%group, ?topics, clients, "Starting consumers");
                (0..clients).map(move |_| (group.clone(), topics.clone()))
            })
            .map(|(group, topics)| {
                tokio::spawn(self.clone().run(group, topics, cancellation.clone()))
            })
            .collect()
    }

    async fn run(self: Arc<Self>, group: String, topics: Vec<String>, cancellation: CancellationToken) {
        loop {
            match self.listen(&group, &topics, &cancellation).await {
                Ok(()) if cancellation.is_cancelled() => break,
                Ok(()) => tracing::warn!(%group, "Consumer client stopped listening, recreating"),
                Err(e) => tracing::error!(%group, error = %e, "Consumer client failed, recreating"),
            }

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        tracing::debug!(%group, "Consumer stopped");
    }

    async fn listen(&self, group: &str, topics: &[String], cancellation: &CancellationToken) -> Result<()> {
        let client = self.factory.create(group).await?;
        client.subscribe(topics.to_vec()).await?;

        let (sink, mut deliveries) = mpsc::channel(INTAKE_BUFFER);
        let listen = client.listen(self.config.listen_timeout(), sink, cancellation.clone());

        let intake = async {
            while let Some(delivery) = deliveries.recv().await {
                self.accept(client.as_ref(), group, delivery).await;
            }
        };

        let (result, ()) = tokio::join!(listen, intake);
        result
    }

    async fn accept(&self, client: &dyn ConsumerClient, group: &str, delivery: Delivery) {
        let tag = delivery.tag;

        match self.store(group, delivery.message).await {
            Ok(stored) => {
                if let Err(e) = client.commit(tag).await {
                    tracing::warn!(group, tag, error = %e, "Failed to acknowledge delivery");
                }
                if let Some(message) = stored {
                    let id = message.id;
                    if let Err(e) = self.dispatcher.enqueue_to_execute(message) {
                        tracing::warn!(message_id = %id, error = %e, "Could not signal dispatcher, leaving message to the retry sweep");
                    }
                }
            }
            Err(e) => {
                tracing::error!(group, tag, error = %e, "Failed to store received message, rejecting");
                if let Err(e) = client.reject(tag).await {
                    tracing::warn!(group, tag, error = %e, "Failed to reject delivery");
                }
            }
        }
    }

    /// Persists one delivery. Returns the row to execute, or `None` when
    /// nothing is left to do (duplicate or undecodable).
    async fn store(&self, group: &str, transport: TransportMessage) -> Result<Option<MediumMessage>> {
        let now = Utc::now();
        let id = self.ids.next_id();

        let mut origin = match self.serializer.deserialize(transport.clone()) {
            Ok(origin) => origin,
            Err(e) => {
                self.store_exception(group, transport, e.to_string()).await?;
                return Ok(None);
            }
        };
        origin
            .headers
            .insert(headers::GROUP.to_owned(), group.to_owned());

        let message = MediumMessage {
            id,
            content: self.serializer.serialize_content(&origin)?,
            origin,
            added: now,
            expires_at: None,
            due_at: now,
            retries: 0,
            status: Status::Scheduled,
            exception: None,
        };

        match self.storage.store_received_message(&message).await? {
            StoreOutcome::Stored => {
                tracing::debug!(message_id = %message.id, name = message.name(), group, "Message received");
                Ok(Some(message))
            }
            StoreOutcome::Duplicate => {
                tracing::debug!(name = message.name(), group, "Duplicate delivery dropped");
                Ok(None)
            }
        }
    }

    async fn store_exception(&self, group: &str, transport: TransportMessage, reason: String) -> Result<()> {
        let now = Utc::now();

        let mut headers = transport.headers;
        headers.insert(headers::GROUP.to_owned(), group.to_owned());
        headers.insert(headers::EXCEPTION.to_owned(), reason.clone());
        let origin = Message::new(headers, transport.body);

        let message = MediumMessage {
            id: self.ids.next_id(),
            content: self.serializer.serialize_content(&origin)?,
            origin,
            added: now,
            expires_at: Some(now + to_chrono(self.config.failed_message_expired_after())),
            due_at: now,
            retries: self.config.failed_retry_count,
            status: Status::Failed,
            exception: Some(reason),
        };

        tracing::warn!(
            message_id = %message.id,
            group,
            error = message.exception.as_deref().unwrap_or_default(),
            "Undecodable message stored as failed"
        );

        self.storage.store_received_exception_message(&message).await
    }
}
