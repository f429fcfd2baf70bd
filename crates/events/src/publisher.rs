use crate::channel::Channel;
use crate::error::EventsError;
use crate::messages::FanoutEvent;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// One published event and the channel it was published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: Channel,
    pub event: FanoutEvent,
}

/// The real-time fan-out collaborator.
///
/// Publishing is fire-and-forget and at-most-once. `Err` means nobody was
/// listening on the channel, which callers treat as degraded delivery and
/// never as a failure of the action that triggered the event.
pub trait Publisher: Send + Sync {
    fn publish(&self, channel: Channel, event: FanoutEvent) -> Result<(), EventsError>;
}

/// In-process publisher backed by a tokio broadcast bus.
///
/// Every envelope goes onto the bus (so bus-wide listeners such as the alerter
/// see all traffic), but a publish only counts as delivered when the target
/// channel has at least one live [`ChannelSubscription`].
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Envelope>,
    subscribers: Arc<DashMap<Channel, usize>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: Arc::new(DashMap::new()),
        }
    }

    /// A receiver for every envelope on the bus.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// A receiver filtered to one channel. Counts as a live subscriber until dropped.
    pub fn subscribe(&self, channel: Channel) -> ChannelSubscription {
        *self.subscribers.entry(channel).or_insert(0) += 1;
        ChannelSubscription {
            channel,
            receiver: self.sender.subscribe(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.subscribers.get(&channel).map(|c| *c).unwrap_or(0)
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, channel: Channel, event: FanoutEvent) -> Result<(), EventsError> {
        let listening = self.subscriber_count(channel) > 0;
        let name = event.name();
        // A send error only means the bus has no receivers at all.
        let _ = self.sender.send(Envelope { channel, event });

        if listening {
            tracing::debug!(channel = %channel, event = name, "Event published.");
            Ok(())
        } else {
            tracing::debug!(channel = %channel, event = name, "No subscriber on channel.");
            Err(EventsError::NoSubscribers(channel.to_string()))
        }
    }
}

/// A bus receiver that only yields events for one channel.
pub struct ChannelSubscription {
    channel: Channel,
    receiver: broadcast::Receiver<Envelope>,
    subscribers: Arc<DashMap<Channel, usize>>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Waits for the next event on this channel.
    ///
    /// Returns `RecvError::Lagged` when the subscriber fell behind and events
    /// were dropped; the subscription stays usable afterwards.
    pub async fn recv(&mut self) -> Result<FanoutEvent, RecvError> {
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope.channel == self.channel {
                return Ok(envelope.event);
            }
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(mut count) = self.subscribers.get_mut(&self.channel) {
            *count = count.saturating_sub(1);
        }
        self.subscribers.remove_if(&self.channel, |_, count| *count == 0);
    }
}
