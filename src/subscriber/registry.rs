//! Handler registration.
//!
//! Handlers are registered once at startup through [`RegistryBuilder`] and
//! looked up by (message name, group) for every received message.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use itertools::Itertools;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    message::{Headers, Message, MessageId},
    transport::{is_pattern, topic_matches},
};

/// What a handler sees besides its payload.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub message_id: MessageId,
    pub name: String,
    pub group: String,
    pub headers: Headers,
    /// Fires when the service shuts down.
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Handler output. `Value::Null` means there is nothing to reply with.
pub type HandlerOutput = eyre::Result<serde_json::Value>;

type ErasedHandler =
    Arc<dyn Fn(Message, HandlerContext) -> BoxFuture<'static, HandlerOutput> + Send + Sync>;

/// Binds a topic (or topic pattern) and a group to a handler.
#[derive(Clone)]
pub struct ConsumerExecutorDescriptor {
    pub topic: String,
    /// `None` until resolved against the configuration; the default group.
    pub group: Option<String>,
    /// Payload type the handler expects.
    pub type_name: &'static str,
    handler: ErasedHandler,
}

impl std::fmt::Debug for ConsumerExecutorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerExecutorDescriptor")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl ConsumerExecutorDescriptor {
    pub fn is_pattern(&self) -> bool {
        is_pattern(&self.topic)
    }

    pub fn matches(&self, name: &str) -> bool {
        topic_matches(&self.topic, name)
    }

    pub fn call(&self, message: Message, context: HandlerContext) -> BoxFuture<'static, HandlerOutput> {
        (self.handler)(message, context)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubscriberRegistry {
    descriptors: Vec<ConsumerExecutorDescriptor>,
}

impl SubscriberRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[ConsumerExecutorDescriptor] {
        &self.descriptors
    }

    /// Applies topic prefix and group naming from `config`.
    pub fn resolve(self, config: &Config) -> Self {
        let descriptors = self
            .descriptors
            .into_iter()
            .map(|d| ConsumerExecutorDescriptor {
                topic: config.topic_name(&d.topic),
                group: Some(config.group_name(d.group.as_deref())),
                ..d
            })
            .collect();
        Self { descriptors }
    }

    /// Topics per group, in registration order, without duplicates.
    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        self.descriptors
            .iter()
            .map(|d| (d.group.clone().unwrap_or_default(), d.topic.clone()))
            .into_group_map()
            .into_iter()
            .map(|(group, topics)| (group, topics.into_iter().unique().collect()))
            .collect()
    }

    /// The handler for `name` in `group`. An exact topic beats a pattern;
    /// otherwise the first registration wins.
    pub fn find(&self, name: &str, group: &str) -> Option<&ConsumerExecutorDescriptor> {
        let mut candidates = self
            .descriptors
            .iter()
            .filter(|d| d.group.as_deref() == Some(group));

        let exact = candidates.clone().find(|d| !d.is_pattern() && d.topic == name);
        exact.or_else(|| candidates.find(|d| d.is_pattern() && d.matches(name)))
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ConsumerExecutorDescriptor>,
}

impl RegistryBuilder {
    /// Registers `handler` for `topic` in `group` (the default group when
    /// `None`). The body is decoded from JSON into `T`; a returned value is
    /// sent back when the publisher asked for a callback.
    pub fn subscribe<T, R, F, Fut>(self, topic: impl Into<String>, group: Option<&str>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<R>> + Send + 'static,
    {
        let handler: ErasedHandler = Arc::new(
            move |message: Message, context: HandlerContext| -> BoxFuture<'static, HandlerOutput> {
                let call = message.body_as::<T>().map(|payload| handler(payload, context));
                Box::pin(async move {
                    let reply = call?.await?;
                    Ok(serde_json::to_value(reply)?)
                })
            },
        );

        self.push(topic.into(), group, std::any::type_name::<T>(), handler)
    }

    /// Registers a handler that receives the undecoded message.
    pub fn subscribe_raw<R, F, Fut>(self, topic: impl Into<String>, group: Option<&str>, handler: F) -> Self
    where
        R: Serialize + Send + 'static,
        F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<R>> + Send + 'static,
    {
        let handler: ErasedHandler = Arc::new(
            move |message: Message, context: HandlerContext| -> BoxFuture<'static, HandlerOutput> {
                let call = handler(message, context);
                Box::pin(async move { Ok(serde_json::to_value(call.await?)?) })
            },
        );

        self.push(topic.into(), group, std::any::type_name::<Message>(), handler)
    }

    fn push(
        mut self,
        topic: String,
        group: Option<&str>,
        type_name: &'static str,
        handler: ErasedHandler,
    ) -> Self {
        self.descriptors.push(ConsumerExecutorDescriptor {
            topic,
            group: group.map(str::to_owned),
            type_name,
            handler,
        });
        self
    }

    pub fn build(self) -> SubscriberRegistry {
        SubscriberRegistry {
            descriptors: self.descriptors,
        }
    }
}
