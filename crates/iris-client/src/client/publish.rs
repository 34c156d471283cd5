// Publish scheme: topic subscription registry and event dispatch.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::client::relay::RelayWriter;
use crate::config::TopicLimits;
use crate::error::{Error, Result};
use crate::handlers::TopicHandler;
use crate::pool::{Terminate, WorkerPool};

struct TopicState {
    handler: Arc<dyn TopicHandler>,
    workers: WorkerPool,
}

pub(crate) struct PublishScheme {
    writer: Arc<RelayWriter>,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

impl PublishScheme {
    pub(crate) fn new(writer: Arc<RelayWriter>) -> Self {
        Self {
            writer,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to a topic with its own worker pool. Event delivery may
    /// lag the call slightly while the subscription propagates through the
    /// network.
    pub(crate) async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
        limits: TopicLimits,
    ) -> Result<()> {
        let state = Arc::new(TopicState {
            handler,
            workers: WorkerPool::new(limits.event_workers, limits.event_memory),
        });
        {
            let mut topics = self.topics.lock().expect("topic registry lock");
            if topics.contains_key(topic) {
                return Err(Error::InvalidArgument(format!(
                    "already subscribed to topic {topic}"
                )));
            }
            // Registration precedes the frame so an early event cannot race
            // the subscription.
            topics.insert(topic.to_string(), state);
        }
        if let Err(err) = self.writer.send_subscribe(topic).await {
            self.topics
                .lock()
                .expect("topic registry lock")
                .remove(topic);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if !self
            .topics
            .lock()
            .expect("topic registry lock")
            .contains_key(topic)
        {
            return Err(Error::InvalidArgument(format!(
                "not subscribed to topic {topic}"
            )));
        }
        self.writer.send_unsubscribe(topic).await?;
        let state = self
            .topics
            .lock()
            .expect("topic registry lock")
            .remove(topic);
        if let Some(state) = state {
            state.workers.terminate(Terminate::Graceful).await;
        }
        Ok(())
    }

    /// Publishes an event to all current subscribers of the topic, best
    /// effort.
    pub(crate) async fn publish(&self, topic: &str, event: &[u8]) -> Result<()> {
        self.writer.send_publish(topic, event).await
    }

    pub(crate) async fn dispatch(&self, topic: &str, event: Bytes) {
        let state = self
            .topics
            .lock()
            .expect("topic registry lock")
            .get(topic)
            .cloned();
        let Some(state) = state else {
            debug!(topic, "event for an unknown topic dropped");
            return;
        };
        let handler = Arc::clone(&state.handler);
        let cost = event.len();
        let admitted = state
            .workers
            .schedule(cost, 0, async move {
                handler.handle_event(event).await;
            })
            .await;
        if !admitted {
            debug!(topic, cost, "event dropped: exceeds the memory allowance");
        }
    }

    pub(crate) async fn shutdown(&self) {
        let states: Vec<_> = self
            .topics
            .lock()
            .expect("topic registry lock")
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in states {
            state.workers.terminate(Terminate::Graceful).await;
        }
    }
}
