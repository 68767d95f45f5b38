//! Inbound side: handler registration, filters and execution.

pub mod executor;
pub mod filter;
pub mod registry;

pub use executor::SubscribeExecutor;
pub use filter::{ExceptionVerdict, SubscribeFilter};
pub use registry::{
    ConsumerExecutorDescriptor, HandlerContext, HandlerOutput, RegistryBuilder, SubscriberRegistry,
};
