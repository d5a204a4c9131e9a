use tokio::sync::broadcast;

/// An [`EventsBus`] makes it easy to listen for events from some producer
/// (or several producers).
///
/// - Clone the bus to get another handle.
/// - [`notify`](Self::notify) sends an event onto the bus; a no-op when
///   nobody is listening, which is the common case.
/// - [`subscribe`](Self::subscribe) starts listening. Events emitted before
///   subscribing are not received.
///
/// Built on [`tokio::sync::broadcast`] so waiters that time out don't need
/// to be garbage collected.
#[derive(Clone)]
pub struct EventsBus<T> {
    event_tx: broadcast::Sender<T>,
}

impl<T: Clone> EventsBus<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            event_tx: broadcast::channel(crate::DEFAULT_CHANNEL_SIZE).0,
        }
    }

    /// Send an event onto the bus.
    pub fn notify(&self, event: T) {
        // Returns an error when there are no receivers; that's fine here.
        let _ = self.event_tx.send(event);
    }

    /// Start listening to all events [`notify`](Self::notify)'d after this
    /// point. Tail promptly or events will be dropped on lag.
    pub fn subscribe(&self) -> EventsRx<'_, T> {
        EventsRx {
            _event_tx: &self.event_tx,
            event_rx: self.event_tx.subscribe(),
        }
    }
}

pub struct EventsRx<'a, T> {
    // Keep a sender handle alive so the channel can't close underneath us.
    _event_tx: &'a broadcast::Sender<T>,
    event_rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<'_, T> {
    /// Wait for the next event for which `filter` returns true.
    ///
    /// Waits indefinitely; wrap in a timeout.
    pub async fn next_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) =>
                    if filter(&event) {
                        return event;
                    },
                Err(RecvError::Closed) => unreachable!(
                    "We hold a sender handle; the channel cannot close"
                ),
                // Lagged: we missed some events. Keep going until timeout.
                Err(RecvError::Lagged(_)) => (),
            }
        }
    }
}
