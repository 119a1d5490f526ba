use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Error,
    Generated,
    Renewed,
    Skipped,
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Evaluating a domain failed.
    Error(Arc<anyhow::Error>),
    Generated { domain: String, email: String },
    Renewed { domain: String, email: String },
    Skipped { domain: String, email: String },
    Started,
    Stopped,
}

impl MonitorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MonitorEvent::Error(_) => EventKind::Error,
            MonitorEvent::Generated { .. } => EventKind::Generated,
            MonitorEvent::Renewed { .. } => EventKind::Renewed,
            MonitorEvent::Skipped { .. } => EventKind::Skipped,
            MonitorEvent::Started => EventKind::Started,
            MonitorEvent::Stopped => EventKind::Stopped,
        }
    }

    /// The domain the event is about, if any.
    pub fn domain(&self) -> Option<&str> {
        match self {
            MonitorEvent::Generated { domain, .. }
            | MonitorEvent::Renewed { domain, .. }
            | MonitorEvent::Skipped { domain, .. } => Some(domain),
            _ => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Callbacks by event kind, in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    by_kind: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl Listeners {
    /// Register `listener` for `kinds`, or for every kind if `None`.
    pub fn add(&self, kinds: Option<&[EventKind]>, listener: Listener) {
        let kinds = match kinds {
            Some(kinds) => kinds.to_vec(),
            None => EventKind::iter().collect(),
        };
        let mut by_kind = self.by_kind.lock();
        for kind in kinds {
            by_kind.entry(kind).or_default().push(Arc::clone(&listener));
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke the listeners for the event's kind synchronously. Listeners may register further
    /// listeners; those only see later events.
    pub fn emit(&self, event: &MonitorEvent) {
        let listeners = self
            .by_kind
            .lock()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}
