// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Response Correlation Cache
//!
//! Maps a caller-supplied correlation key to the reply queue allocated for it.
//! The first request for a key creates the reply queue and its consumer; later
//! requests with the same key on the same connection generation reuse them.

use crate::{errors::AmqpError, topology_cache::GenerationMap};
use std::future::Future;

pub struct ResponseCorrelationCache {
    reply_queues: GenerationMap<String, String>,
}

impl Default for ResponseCorrelationCache {
    fn default() -> Self {
        ResponseCorrelationCache::new()
    }
}

impl ResponseCorrelationCache {
    pub fn new() -> ResponseCorrelationCache {
        ResponseCorrelationCache {
            reply_queues: GenerationMap::new(),
        }
    }

    /// Returns the reply queue for `key`, running `create` when this
    /// generation has none yet. Concurrent callers share one creation.
    pub async fn reply_queue<F, Fut>(
        &self,
        key: &str,
        generation: u64,
        create: F,
    ) -> Result<String, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AmqpError>>,
    {
        let (queue, _) = self
            .reply_queues
            .get_or_try_init(key.to_owned(), generation, create)
            .await?;
        Ok(queue)
    }

    pub fn get(&self, key: &str, generation: u64) -> Option<String> {
        self.reply_queues.get(key, generation)
    }

    /// Forgets every reply queue; they died with the previous connection.
    pub fn clear(&self) {
        self.reply_queues.clear();
    }

    /// Forgets reply queues created on `generation` or earlier.
    pub fn clear_through(&self, generation: u64) {
        self.reply_queues.clear_through(generation);
    }

    pub fn len(&self) -> usize {
        self.reply_queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reuses_the_reply_queue_per_key() {
        let cache = ResponseCorrelationCache::new();
        let created = AtomicUsize::new(0);
        let create = || async {
            let n = created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("reply-{n}"))
        };

        let first = join_all((0..8).map(|_| cache.reply_queue("Pong:billing", 1, create))).await;
        let other = cache.reply_queue("Pong:audit", 1, create).await.unwrap();

        assert!(first.iter().all(|q| q.as_deref() == Ok("reply-0")));
        assert_eq!(other, "reply-1");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn clear_drops_reply_queues() {
        let cache = ResponseCorrelationCache::new();
        cache
            .reply_queue("Pong:billing", 1, || async { Ok("reply-a".to_owned()) })
            .await
            .unwrap();

        cache.clear();

        assert!(cache.get("Pong:billing", 1).is_none());
        let queue = cache
            .reply_queue("Pong:billing", 2, || async { Ok("reply-b".to_owned()) })
            .await
            .unwrap();
        assert_eq!(queue, "reply-b");
    }
}
