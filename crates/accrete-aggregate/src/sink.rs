//! Downstream Sinks
//!
//! A sink receives completed aggregates. Returning `Ok` confirms the
//! exchange with the repository; an error leaves it unconfirmed so a
//! recoverable repository can redeliver it later.

use accrete_core::error::DeliveryError;
use accrete_core::Exchange;
use async_trait::async_trait;
use flume::Sender;

/// Consumer of completed aggregates.
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn process(&self, exchange: Exchange) -> Result<(), DeliveryError>;
}

/// Forwards completed aggregates into a flume channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Exchange>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Exchange>) -> Self {
        Self { tx }
    }

    /// Creates an unbounded channel and a sink feeding it.
    pub fn unbounded() -> (Self, flume::Receiver<Exchange>) {
        let (tx, rx) = flume::unbounded();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl AggregateSink for ChannelSink {
    async fn process(&self, exchange: Exchange) -> Result<(), DeliveryError> {
        self.tx
            .send_async(exchange)
            .await
            .map_err(|e| DeliveryError::Closed {
                details: format!("receiver dropped exchange {}", e.into_inner().id()),
            })
    }
}
