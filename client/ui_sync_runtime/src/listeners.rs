use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Handler<E> = Rc<dyn Fn(&E)>;

struct Registry<E> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(u64, Handler<E>)>>,
}

impl<E> Registry<E> {
    fn remove(&self, id: u64) {
        self.entries.borrow_mut().retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Ordered set of handlers for one kind of notification.
///
/// `emit` snapshots the handler list before calling anything, so a handler may
/// register, unregister, or trigger further emits without tripping a borrow.
pub struct Listeners<E: 'static> {
    registry: Rc<Registry<E>>,
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            registry: Rc::new(Registry {
                next_id: Cell::new(1),
                entries: RefCell::new(Vec::new()),
            }),
        }
    }
}

impl<E: 'static> Listeners<E> {
    pub fn add<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + 'static,
    {
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);
        let handler: Handler<E> = Rc::new(handler);
        self.registry.entries.borrow_mut().push((id, handler));

        let registry: Weak<Registry<E>> = Rc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    /// Calls every handler in registration order.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .registry
            .entries
            .borrow()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by every `on_*` registration. Dropping it keeps the
/// handler registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Gives up the ability to unsubscribe. The handler stays registered for
    /// as long as the emitter lives.
    pub fn detach(mut self) {
        self.cancel.take();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
