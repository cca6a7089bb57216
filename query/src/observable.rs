use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle returned by [`Observable::add_listener`].
    pub struct ListenerKey;
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A settable, subscribable value box.
///
/// Listeners are called with a snapshot of the new value after every change,
/// outside of any internal lock, so they may freely read the observable again.
pub struct Observable<T> {
    value: Arc<RwLock<T>>,
    listeners: Arc<Mutex<SlotMap<ListenerKey, Listener<T>>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            listeners: Arc::new(Mutex::new(SlotMap::with_key())),
        }
    }

    /// Clones the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Reads the current value without cloning.
    pub fn with<R>(&self, func: impl FnOnce(&T) -> R) -> R {
        func(&self.value.read())
    }

    /// Replaces the value and notifies listeners.
    pub fn set(&self, value: T) {
        *self.value.write() = value;
        self.notify();
    }

    /// Mutates the value in place and notifies listeners.
    pub fn update(&self, update_fn: impl FnOnce(&mut T)) {
        update_fn(&mut self.value.write());
        self.notify();
    }

    /// Mutates the value, notifying listeners only if `update_fn` returns true.
    pub fn update_if(&self, update_fn: impl FnOnce(&mut T) -> bool) -> bool {
        let changed = update_fn(&mut self.value.write());
        if changed {
            self.notify();
        }
        changed
    }

    /// Mutates the value without notifying. Pair with [`notify`](Self::notify).
    pub(crate) fn update_quiet<R>(&self, update_fn: impl FnOnce(&mut T) -> R) -> R {
        update_fn(&mut self.value.write())
    }

    /// Calls every listener with the current value.
    pub fn notify(&self) {
        let listeners = self.listeners.lock().values().cloned().collect::<Vec<_>>();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.get();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerKey {
        self.listeners.lock().insert(Arc::new(listener))
    }

    /// Removes a listener. Returns false if it was already removed.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.listeners.lock().remove(key).is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T> std::fmt::Debug for Observable<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.value.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
