use parking_lot::Mutex;

/// Multi-subscriber event fan-out.
///
/// Producers publish from any thread; each subscriber drains its own channel,
/// typically on the main loop. Subscribers that went away are pruned on the
/// next publish.
pub struct EventBus<E: Clone> {
    senders: Mutex<Vec<crossbeam_channel::Sender<E>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber and returns its receiving end.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<E> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.senders.lock().push(sender);
        receiver
    }

    /// Delivers a clone of `event` to every live subscriber.
    pub fn publish(&self, event: &E) {
        self.senders
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::EventBus;

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(&1);
        bus.publish(&2);

        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(b);
        bus.publish(&7);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![7]);
    }
}
