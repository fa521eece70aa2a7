//! Fan-out of decoded events to whoever registered for them.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::error;

use crate::client::Context;
use crate::event::{self, Event, EventHandler, EventKind};

type Handler = Arc<dyn Fn(Context, Arc<Event>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers are only ever added. Every call runs in its own task, so a slow
/// or panicking handler never holds up the others.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    event_handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Context, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, event| handler(ctx, event).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Starts every handler interested in `event` and returns how many there were.
    pub fn dispatch(&self, ctx: Context, event: Event) -> usize {
        let kind = event.kind();
        let event = Arc::new(event);

        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        let event_handlers = self
            .event_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let started = handlers.len() + event_handlers.len();

        for handler in handlers {
            isolate(kind, handler(ctx.clone(), event.clone()));
        }
        for handler in event_handlers {
            let ctx = ctx.clone();
            let event = event.clone();
            isolate(kind, async move { event::route(handler.as_ref(), ctx, &event).await });
        }
        started
    }
}

fn isolate(kind: EventKind, fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!("{kind:?} handler panicked: {reason}");
        }
    });
}
