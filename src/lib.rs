#![doc = include_str!("../README.md")]

pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod headers;
pub mod options;
pub mod outbox;
mod producer;
pub mod topic;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, Message, MessageBuilder, TransportMessage};

#[doc(inline)]
pub use headers::Headers;

#[doc(inline)]
pub use options::Options;

#[doc(inline)]
pub use outbox::{MediumMessage, Outbox, OutboxError};

#[doc(inline)]
pub use transport::{OperateResult, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use producer::{
    DefaultProducerHook, Producer, ProducerHook, ProducerRunError, ProducerRunErrorKind,
};

#[doc(inline)]
pub use consumer::{
    ConsumerClient, ConsumerClientFactory, ConsumerError, ConsumerExecutorDescriptor,
    ConsumerRegister, Outcome,
};
