// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Open Channel Bookkeeping
//!
//! Every channel the bus opens, for consuming or publishing, is tracked here so
//! that disposing the bus can abort all of them. Channels of a lost connection
//! are dead already and are simply forgotten.

use crate::{
    broker::BrokerChannel,
    connection::ConnectionHandle,
    errors::AmqpError,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
pub struct OpenChannels {
    channels: Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl OpenChannels {
    pub fn new() -> OpenChannels {
        OpenChannels::default()
    }

    /// Opens a channel on `handle` and tracks it.
    pub async fn open(&self, handle: &ConnectionHandle) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = handle.create_channel().await?;
        self.track(channel.clone());
        Ok(channel)
    }

    pub fn track(&self, channel: Arc<dyn BrokerChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.is_open());
        channels.push(channel);
    }

    /// Forgets tracked channels that are no longer open, without closing them.
    pub fn forget_closed(&self) {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| c.is_open());
        debug!(count = before - channels.len(), "forgetting channels of lost connection");
    }

    /// Closes every tracked channel, ignoring channels that already died.
    pub async fn abort_all(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        for result in join_all(channels.iter().map(|c| c.close())).await {
            if let Err(err) = result {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;

    #[tokio::test]
    async fn abort_closes_every_tracked_channel() {
        let open = OpenChannels::new();
        for _ in 0..3 {
            let mut channel = MockBrokerChannel::new();
            channel.expect_is_open().return_const(true);
            channel.expect_close().times(1).returning(|| Ok(()));
            open.track(Arc::new(channel));
        }
        assert_eq!(open.len(), 3);

        open.abort_all().await;

        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn tracking_prunes_dead_channels() {
        let open = OpenChannels::new();
        let mut dead = MockBrokerChannel::new();
        dead.expect_is_open().return_const(false);
        open.track(Arc::new(dead));

        let mut live = MockBrokerChannel::new();
        live.expect_is_open().return_const(true);
        open.track(Arc::new(live));

        assert_eq!(open.len(), 1);
        open.forget_closed();
        assert_eq!(open.len(), 1);
    }
}
