use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    consumer::ConsumerRegister,
    dispatcher::Dispatcher,
    error::Result,
    id::SnowflakeId,
    processor::ProcessingServer,
    publisher::Publisher,
    sender::MessageSender,
    serializer::{JsonSerializer, Serializer},
    state::{FailedThresholdCallback, StateChanger},
    storage::DataStorage,
    subscriber::{SubscribeExecutor, SubscribeFilter, SubscriberRegistry},
    transport::{ConsumerClientFactory, Transport},
    utils,
};

/// A running engine: worker pools, consumers and background sweeps, all
/// stopped together by [`Service::shutdown`].
pub struct Service<S: DataStorage> {
    storage: Arc<S>,
    publisher: Publisher<S>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[bon::bon]
impl<S: DataStorage> Service<S> {
    /// Returns a builder that wires every component and spawns its tasks.
    ///
    /// Handlers in `registry` need a `consumer_factory`; without one they
    /// are never fed.
    #[builder(finish_fn = start)]
    pub async fn launch(
        #[builder(default)] config: Config,
        storage: S,
        transport: Arc<dyn Transport>,
        consumer_factory: Option<Arc<dyn ConsumerClientFactory>>,
        #[builder(default)] registry: SubscriberRegistry,
        #[builder(default)] filters: Vec<Arc<dyn SubscribeFilter>>,
        serializer: Option<Arc<dyn Serializer>>,
        failed_threshold_callback: Option<FailedThresholdCallback>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let storage = Arc::new(storage);
        let serializer = serializer.unwrap_or_else(|| Arc::new(JsonSerializer));
        let ids = Arc::new(config.worker_id.map_or_else(SnowflakeId::random, SnowflakeId::new));
        let registry = Arc::new(registry.resolve(&config));
        let groups = registry.groups();

        let (dispatcher, queues) = Dispatcher::new(&config, groups.keys().cloned());
        let state = Arc::new(StateChanger::new(
            storage.clone(),
            &config,
            failed_threshold_callback,
        ));
        let publisher = Publisher::new(
            storage.clone(),
            dispatcher.clone(),
            serializer.clone(),
            ids.clone(),
            config.clone(),
        );
        let cancellation = CancellationToken::new();

        let sender = Arc::new(MessageSender::new(
            storage.clone(),
            transport.clone(),
            serializer.clone(),
            state.clone(),
            dispatcher.clone(),
            config.claim_lease(),
        ));
        let executor = Arc::new(
            SubscribeExecutor::builder()
                .storage(storage.clone())
                .registry(registry.clone())
                .filters(filters)
                .state(state)
                .dispatcher(dispatcher.clone())
                .publisher(publisher.clone())
                .cancellation(cancellation.clone())
                .lease(config.claim_lease())
                .build(),
        );

        let mut handles = queues.start(sender, executor, cancellation.clone());

        match consumer_factory {
            Some(factory) if !groups.is_empty() => {
                let register = Arc::new(ConsumerRegister::new(
                    storage.clone(),
                    factory,
                    serializer,
                    dispatcher.clone(),
                    ids.clone(),
                    config.clone(),
                ));
                handles.extend(register.start(groups, cancellation.clone()));
            }
            None if !groups.is_empty() => {
                tracing::warn!("Subscribers registered without a consumer factory, nothing will be consumed");
            }
            _ => {}
        }

        let instance = utils::instance_id();
        let server = Arc::new(ProcessingServer::new(
            storage.clone(),
            dispatcher.clone(),
            config.clone(),
            instance.clone(),
        ));
        handles.extend(server.start(cancellation.clone()));

        tracing::info!(
            %instance,
            worker_id = ids.worker_id(),
            broker = transport.address(),
            subscribers = registry.descriptors().len(),
            "Courier started"
        );

        Ok(Self {
            storage,
            publisher,
            dispatcher,
            config,
            cancellation,
            handles,
        })
    }
}

impl<S: DataStorage> Service<S> {
    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fires when [`shutdown`](Self::shutdown) begins.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Stops taking new work and waits up to `shutdown_grace` for in-flight
    /// work to finish. Tasks still running after that are aborted.
    pub async fn shutdown(mut self) {
        self.cancellation.cancel();

        let grace = self.config.shutdown_grace();
        let finished = tokio::time::timeout(grace, join_all(self.handles.iter_mut())).await;

        match finished {
            Ok(results) => {
                for error in results.into_iter().filter_map(|r| r.err()) {
                    tracing::error!(error = %error, "Task ended abnormally");
                }
                tracing::info!("Courier stopped");
            }
            Err(_) => {
                let remaining = self.handles.iter().filter(|h| !h.is_finished()).count();
                tracing::warn!(remaining, ?grace, "Shutdown grace elapsed, aborting tasks");
                for handle in &self.handles {
                    handle.abort();
                }
            }
        }
    }
}
