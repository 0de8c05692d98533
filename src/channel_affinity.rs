// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Channel Affinity
//!
//! Channels are not meant to be shared by concurrent publishers. The bus keeps
//! one publish channel per execution context: the tokio task doing the
//! publish, or the OS thread when called outside a task. The channel is
//! created lazily on first use in each connection generation, and a context
//! only ever reads its own slot.
//!
//! Tasks come and go, so slots are leased: once more than `capacity` slots
//! exist, slots of other contexts with no publish in flight are closed and
//! dropped. A context whose slot was dropped simply gets a new channel on its
//! next publish. Workers that want to pin a channel use
//! [`crate::bus::BusPublisher`].

use crate::{
    broker::BrokerChannel, channel::OpenChannels, config::DEFAULT_PUBLISH_CHANNELS,
    connection::ConnectionHandle, errors::AmqpError, topology_cache::GenerationMap,
};
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};
use tokio::task;
use tracing::{debug, warn};

const RETIRED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ExecutionContext {
    Task(task::Id),
    Thread(ThreadId),
}

impl ExecutionContext {
    fn current() -> ExecutionContext {
        match task::try_id() {
            Some(id) => ExecutionContext::Task(id),
            None => ExecutionContext::Thread(thread::current().id()),
        }
    }
}

struct PublishSlot {
    channel: Arc<dyn BrokerChannel>,
    /// Publishes in flight, or `RETIRED` once evicted.
    leases: AtomicUsize,
}

impl PublishSlot {
    fn lease(self: &Arc<Self>) -> Option<PublishChannel> {
        self.leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n != RETIRED).then_some(n + 1)
            })
            .ok()?;
        Some(PublishChannel { slot: self.clone() })
    }

    /// Marks the slot evicted if nothing is publishing on it.
    fn retire(&self) -> bool {
        self.leases
            .compare_exchange(0, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A leased publish channel. The slot cannot be evicted while it is held.
pub struct PublishChannel {
    slot: Arc<PublishSlot>,
}

impl Deref for PublishChannel {
    type Target = Arc<dyn BrokerChannel>;

    fn deref(&self) -> &Self::Target {
        &self.slot.channel
    }
}

impl Drop for PublishChannel {
    fn drop(&mut self) {
        self.slot.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ChannelAffinity {
    slots: GenerationMap<ExecutionContext, Arc<PublishSlot>>,
    capacity: usize,
}

impl Default for ChannelAffinity {
    fn default() -> Self {
        ChannelAffinity::new()
    }
}

impl ChannelAffinity {
    pub fn new() -> ChannelAffinity {
        ChannelAffinity::with_capacity(DEFAULT_PUBLISH_CHANNELS)
    }

    pub fn with_capacity(capacity: usize) -> ChannelAffinity {
        ChannelAffinity {
            slots: GenerationMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Leases the calling context's publish channel for the generation of
    /// `handle`, opening (and tracking) a new one when needed.
    pub async fn get_or_create(
        &self,
        handle: &ConnectionHandle,
        open_channels: &OpenChannels,
    ) -> Result<PublishChannel, AmqpError> {
        let context = ExecutionContext::current();

        // a second round covers a slot closed by the broker or just evicted
        for _ in 0..2 {
            let (slot, created) = self
                .slots
                .get_or_try_init(context, handle.generation, || async {
                    let channel = open_channels.open(handle).await?;
                    Ok(Arc::new(PublishSlot {
                        channel,
                        leases: AtomicUsize::new(0),
                    }))
                })
                .await?;

            if let Some(lease) = slot.lease() {
                if created {
                    debug!(context = ?context, generation = handle.generation, "publish channel created");
                    self.evict_idle(context).await;
                    return Ok(lease);
                }
                if lease.is_open() {
                    return Ok(lease);
                }
            }
            self.slots.invalidate(&context, handle.generation);
        }

        Err(AmqpError::ChannelError)
    }

    async fn evict_idle(&self, current: ExecutionContext) {
        if self.slots.len() <= self.capacity {
            return;
        }

        let evicted = self
            .slots
            .evict(|context, slot| *context != current && slot.retire());
        debug!(count = evicted.len(), "closing idle publish channels");
        for slot in evicted {
            if let Err(err) = slot.channel.close().await {
                warn!(error = err.to_string(), "failure to close publish channel");
            }
        }
    }

    /// Discards every slot; the channels died with the connection.
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Discards slots opened on `generation` or earlier.
    pub fn clear_through(&self, generation: u64) {
        self.slots.clear_through(generation);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
