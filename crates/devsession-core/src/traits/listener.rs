// # Event Listener Trait
//
// Listeners are the logical sub-devices behind one session: a meter behind
// a DSMR bridge, a door behind an access hub, a zone behind a receiver.
// Each registered listener sees every dispatched event.

use super::event_source::{Entry, Event};

/// Trait for event listeners
///
/// Callbacks run on the engine task. They must return quickly and must not
/// block; hand heavy work to another task.
pub trait EventListener: Send + Sync {
    /// Called once per entry of every dispatched event
    ///
    /// `event` is the full event the entry belongs to.
    fn on_entry(&self, event: &Event, entry: &Entry);

    /// Called when the session rejects data it received (e.g. an empty telegram)
    fn on_rejected(&self, _detail: &str) {}
}
