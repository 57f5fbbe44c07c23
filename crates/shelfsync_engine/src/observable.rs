//! Publish/subscribe state cells.

use tokio::sync::watch;

/// A value that publishes every change to its subscribers.
///
/// Subscribers receive a [`watch::Receiver`] and see the latest value; an
/// update that leaves the value equal to the current one is not published.
/// Publishing never blocks and works without any subscriber.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Observable<T> {
    /// Creates an observable with an initial value.
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the value. Returns true if it changed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Modifies the value in place. Returns true if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        self.tx.send_if_modified(|current| {
            let before = current.clone();
            f(current);
            *current != before
        })
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
