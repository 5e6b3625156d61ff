//! Broker adapters implementing [`eventpipe_events::QueueClient`].

pub mod amqp;

pub use amqp::{AmqpProducer, AmqpQueue};
