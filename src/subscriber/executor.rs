use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::{DispatchTarget, Dispatcher},
    error::{Error, Result},
    message::{headers, Headers, MediumMessage, Message, MessageKind, Status},
    publisher::Publisher,
    state::{to_chrono, RetryDecision, StateChanger},
    storage::DataStorage,
    utils::panic_message,
};

use super::{
    filter::{resolve_exception, SubscribeFilter},
    registry::{ConsumerExecutorDescriptor, HandlerContext, SubscriberRegistry},
};

/// Runs the registered handler for each received message.
#[derive(bon::Builder)]
pub struct SubscribeExecutor<S> {
    storage: Arc<S>,
    registry: Arc<SubscriberRegistry>,
    #[builder(default)]
    filters: Vec<Arc<dyn SubscribeFilter>>,
    state: Arc<StateChanger<S>>,
    dispatcher: Dispatcher,
    /// Sends handler replies for messages that asked for a callback.
    publisher: Publisher<S>,
    cancellation: CancellationToken,
    lease: Duration,
}

impl<S: DataStorage> SubscribeExecutor<S> {
    /// Claims the received row and runs its handler once. Losing the claim
    /// is not an error.
    pub async fn execute(&self, message: &MediumMessage) -> Result<()> {
        let now = Utc::now();
        let Some(mut message) = self
            .storage
            .claim_received(message.id, now, now + to_chrono(self.lease))
            .await?
        else {
            tracing::trace!(message_id = %message.id, "Receive claim lost, skipping");
            return Ok(());
        };

        match self.invoke(&message).await {
            Ok(()) => {
                let recorded = self
                    .state
                    .apply(MessageKind::Received, &mut message, Status::Succeeded)
                    .await?;

                tracing::debug!(
                    message_id = %message.id,
                    recorded,
                    name = message.name(),
                    group = message.group(),
                    "Message handled"
                );
            }
            Err(e) => {
                let decision = self
                    .state
                    .fail(MessageKind::Received, &mut message, &e)
                    .await?;

                if let RetryDecision::Retry { due_at } = decision {
                    self.dispatcher
                        .enqueue_to_scheduler(MessageKind::Received, message, due_at);
                }
            }
        }

        Ok(())
    }

    async fn invoke(&self, message: &MediumMessage) -> Result<()> {
        let name = message.name();
        let group = message.group().unwrap_or_default();

        let descriptor = self
            .registry
            .find(name, group)
            .ok_or_else(|| Error::subscriber_not_found(name, group))?;

        let context = HandlerContext {
            message_id: message.id,
            name: name.to_owned(),
            group: group.to_owned(),
            headers: message.origin.headers.clone(),
            cancellation: self.cancellation.child_token(),
        };

        let outcome = AssertUnwindSafe(self.run_pipeline(descriptor, &message.origin, &context))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(report)) => return Err(Error::handler(format!("{report:#}"))),
            Err(panic) => {
                return Err(Error::handler(format!(
                    "filter panicked: {}",
                    panic_message(&*panic)
                )))
            }
        };

        if let Some(callback) = message.origin.callback_name() {
            if !reply.is_null() {
                self.reply(&message.origin, callback, &reply).await?;
            }
        }

        Ok(())
    }

    async fn run_pipeline(
        &self,
        descriptor: &ConsumerExecutorDescriptor,
        message: &Message,
        context: &HandlerContext,
    ) -> eyre::Result<Value> {
        let attempt = async {
            for filter in &self.filters {
                filter.on_subscribe_executing(context, message).await?;
            }

            let call = AssertUnwindSafe(async { descriptor.call(message.clone(), context.clone()).await });
            let reply = call.catch_unwind().await.map_err(|panic| {
                eyre::eyre!("handler panicked: {}", panic_message(&*panic))
            })??;

            for filter in &self.filters {
                filter.on_subscribe_executed(context, &reply).await?;
            }
            Ok::<_, eyre::Report>(reply)
        };

        match attempt.await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                tracing::debug!(message_id = %context.message_id, error = %error, "Handler failed");
                resolve_exception(&self.filters, context, error).await
            }
        }
    }

    async fn reply(&self, origin: &Message, callback: &str, reply: &Value) -> Result<()> {
        let sequence = origin
            .header(headers::CORRELATION_SEQUENCE)
            .and_then(|seq| seq.parse::<u32>().ok())
            .unwrap_or_default();

        let mut headers = Headers::new();
        headers.insert(headers::CORRELATION_ID.to_owned(), origin.id()?.to_string());
        headers.insert(
            headers::CORRELATION_SEQUENCE.to_owned(),
            (sequence + 1).to_string(),
        );

        let id = self
            .publisher
            .publish_raw(callback, serde_json::to_vec(reply)?, headers)
            .await?;

        tracing::debug!(message_id = %id, callback, "Reply published");
        Ok(())
    }
}

impl<S: DataStorage> DispatchTarget for SubscribeExecutor<S> {
    fn dispatch(&self, message: MediumMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.execute(&message).await {
                tracing::error!(message_id = %message.id, error = %e, "Failed to execute message");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        config::Config,
        id::SnowflakeId,
        message::MessageId,
        serializer::{JsonSerializer, Serializer},
        storage::{memory::InMemoryStorage, MessageQuery},
        subscriber::filter::ExceptionVerdict,
    };

    #[derive(Deserialize)]
    struct Order {
        #[serde(rename = "orderId")]
        order_id: u64,
    }

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        dispatcher: Dispatcher,
        executor: SubscribeExecutor<InMemoryStorage>,
    }

    fn fixture(registry: SubscriberRegistry, filters: Vec<Arc<dyn SubscribeFilter>>) -> Fixture {
        let config = Config::default();
        let storage = Arc::new(InMemoryStorage::new());
        let (dispatcher, _queues) = Dispatcher::new(&config, Vec::new());
        let state = Arc::new(StateChanger::new(storage.clone(), &config, None));
        let publisher = Publisher::new(
            storage.clone(),
            dispatcher.clone(),
            Arc::new(JsonSerializer),
            Arc::new(SnowflakeId::new(2)),
            Arc::new(config.clone()),
        );

        let executor = SubscribeExecutor::builder()
            .storage(storage.clone())
            .registry(Arc::new(registry.resolve(&config)))
            .filters(filters)
            .state(state)
            .dispatcher(dispatcher.clone())
            .publisher(publisher)
            .cancellation(CancellationToken::new())
            .lease(config.claim_lease())
            .build();

        Fixture {
            storage,
            dispatcher,
            executor,
        }
    }

    async fn received(storage: &InMemoryStorage, extra: &[(&str, &str)]) -> MediumMessage {
        let mut h = Headers::new();
        h.insert(headers::MESSAGE_ID.to_owned(), "77".to_owned());
        h.insert(headers::MESSAGE_NAME.to_owned(), "order.created".to_owned());
        h.insert(headers::GROUP.to_owned(), "billing.v1".to_owned());
        for (k, v) in extra {
            h.insert((*k).to_owned(), (*v).to_owned());
        }
        let origin = Message::new(h, &br#"{"orderId":123}"#[..]);
        let now = Utc::now();
        let message = MediumMessage {
            id: MessageId::new(1000),
            content: JsonSerializer.serialize_content(&origin).unwrap(),
            origin,
            added: now,
            expires_at: None,
            due_at: now,
            retries: 0,
            status: Status::Scheduled,
            exception: None,
        };
        storage.store_received_message(&message).await.unwrap();
        message
    }

    async fn reload(storage: &InMemoryStorage) -> MediumMessage {
        storage
            .get_message(MessageKind::Received, MessageId::new(1000))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn handler_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = {
            let calls = calls.clone();
            SubscriberRegistry::builder()
                .subscribe("order.created", Some("billing"), move |order: Order, ctx| {
                    let calls = calls.clone();
                    async move {
                        assert_eq!(order.order_id, 123);
                        assert_eq!(ctx.group, "billing.v1");
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build()
        };
        let f = fixture(registry, Vec::new());
        let message = received(&f.storage, &[]).await;

        f.executor.execute(&message).await.unwrap();
        f.executor.execute(&message).await.unwrap();

        let row = reload(&f.storage).await;
        assert_eq!(row.status, Status::Succeeded);
        assert!(row.expires_at.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_and_panic_are_retried() {
        let registry = SubscriberRegistry::builder()
            .subscribe("order.created", Some("billing"), |_: Order, _| async {
                Err::<(), _>(eyre::eyre!("database down"))
            })
            .build();
        let f = fixture(registry, Vec::new());
        let message = received(&f.storage, &[]).await;

        f.executor.execute(&message).await.unwrap();

        let row = reload(&f.storage).await;
        assert_eq!(row.status, Status::Scheduled);
        assert_eq!(row.retries, 1);
        assert!(row.exception.unwrap().contains("database down"));
        assert_eq!(f.dispatcher.scheduled(), 1);

        let registry = SubscriberRegistry::builder()
            .subscribe("order.created", Some("billing"), |_: Order, _| async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            })
            .build();
        let f = fixture(registry, Vec::new());
        let message = received(&f.storage, &[]).await;

        f.executor.execute(&message).await.unwrap();

        let row = reload(&f.storage).await;
        assert_eq!(row.retries, 1);
        assert!(row.exception.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn missing_subscriber_counts_as_failure() {
        let f = fixture(SubscriberRegistry::default(), Vec::new());
        let message = received(&f.storage, &[]).await;

        f.executor.execute(&message).await.unwrap();

        let row = reload(&f.storage).await;
        assert_eq!(row.retries, 1);
        assert!(row.exception.unwrap().contains("No subscriber registered"));
    }

    struct Suppress;

    impl SubscribeFilter for Suppress {
        fn on_subscribe_exception<'a>(
            &'a self,
            _context: &'a HandlerContext,
            _error: &'a eyre::Report,
        ) -> BoxFuture<'a, ExceptionVerdict> {
            Box::pin(async { ExceptionVerdict::Suppressed { result: Value::Null } })
        }
    }

    #[tokio::test]
    async fn suppressed_error_succeeds() {
        let registry = SubscriberRegistry::builder()
            .subscribe("order.created", Some("billing"), |_: Order, _| async {
                Err::<(), _>(eyre::eyre!("ignored"))
            })
            .build();
        let f = fixture(registry, vec![Arc::new(Suppress)]);
        let message = received(&f.storage, &[]).await;

        f.executor.execute(&message).await.unwrap();

        assert_eq!(reload(&f.storage).await.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn reply_is_published_to_callback() {
        let registry = SubscriberRegistry::builder()
            .subscribe("order.created", Some("billing"), |order: Order, _| async move {
                Ok(json!({ "invoiceFor": order.order_id }))
            })
            .build();
        let f = fixture(registry, Vec::new());
        let message = received(
            &f.storage,
            &[
                (headers::CALLBACK_NAME, "invoice.created"),
                (headers::CORRELATION_SEQUENCE, "0"),
            ],
        )
        .await;

        f.executor.execute(&message).await.unwrap();
        assert_eq!(reload(&f.storage).await.status, Status::Succeeded);

        let replies = f
            .storage
            .query_messages(
                MessageKind::Published,
                MessageQuery {
                    name: Some("invoice.created".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);

        let reply = &replies[0].origin;
        assert_eq!(reply.correlation_id(), Some("77"));
        assert_eq!(reply.header(headers::CORRELATION_SEQUENCE), Some("1"));
        assert_eq!(reply.body_as::<Value>().unwrap(), json!({ "invoiceFor": 123 }));
    }
}
