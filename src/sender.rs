use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    dispatcher::{DispatchTarget, Dispatcher},
    error::{Error, Result},
    message::{MediumMessage, MessageKind, Status},
    serializer::Serializer,
    state::{to_chrono, RetryDecision, StateChanger},
    storage::DataStorage,
    transport::{OperateResult, Transport},
    utils::panic_message,
};

/// Delivers published messages to the broker.
pub struct MessageSender<S> {
    storage: Arc<S>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    state: Arc<StateChanger<S>>,
    dispatcher: Dispatcher,
    lease: Duration,
}

impl<S: DataStorage> MessageSender<S> {
    pub fn new(
        storage: Arc<S>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        state: Arc<StateChanger<S>>,
        dispatcher: Dispatcher,
        lease: Duration,
    ) -> Self {
        Self {
            storage,
            transport,
            serializer,
            state,
            dispatcher,
            lease,
        }
    }

    /// Claims the row and attempts one delivery. Returns without doing
    /// anything if another worker owns the message or it is not due.
    pub async fn send(&self, message: &MediumMessage) -> Result<()> {
        let now = Utc::now();
        let Some(mut message) = self
            .storage
            .claim_published(message.id, now, now + to_chrono(self.lease))
            .await?
        else {
            tracing::trace!(message_id = %message.id, "Publish claim lost, skipping");
            return Ok(());
        };

        match self.send_once(&message).await {
            Ok(()) => {
                let recorded = self
                    .state
                    .apply(MessageKind::Published, &mut message, Status::Succeeded)
                    .await?;

                tracing::debug!(
                    message_id = %message.id,
                    recorded,
                    name = message.name(),
                    broker = self.transport.address(),
                    "Message published"
                );
            }
            Err(e) => {
                let decision = self
                    .state
                    .fail(MessageKind::Published, &mut message, &e)
                    .await?;

                if let RetryDecision::Retry { due_at } = decision {
                    self.dispatcher
                        .enqueue_to_scheduler(MessageKind::Published, message, due_at);
                }
            }
        }

        Ok(())
    }

    async fn send_once(&self, message: &MediumMessage) -> Result<()> {
        let transport_message = self.serializer.serialize(&message.origin)?;

        match AssertUnwindSafe(self.transport.send(transport_message))
            .catch_unwind()
            .await
        {
            Ok(OperateResult::Succeeded) => Ok(()),
            Ok(OperateResult::Failed { reason }) => Err(Error::transport(reason)),
            Err(panic) => Err(Error::transport(format!(
                "transport panicked: {}",
                panic_message(&*panic)
            ))),
        }
    }
}

impl<S: DataStorage> DispatchTarget for MessageSender<S> {
    fn dispatch(&self, message: MediumMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.send(&message).await {
                tracing::error!(message_id = %message.id, error = %e, "Failed to publish message");
            }
        })
    }
}
