//! Table change notifications.
//!
//! The change feed emits one [`TableUpdate`] per committed write that
//! touched local tables, enabling:
//! - Reactive queries in the application
//! - Waking the upload loop when the CRUD queue grows
//!
//! Notifications are emitted only after the transaction commits.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};

/// Name reported when the CRUD queue changed.
pub const CRUD_TABLE: &str = "ps_crud";

/// A set of tables changed by one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUpdate {
    /// Names of the changed tables.
    pub tables: BTreeSet<String>,
}

impl TableUpdate {
    /// Creates an update for the given tables.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the update names the given table.
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Returns true if the CRUD queue changed.
    pub fn touches_crud(&self) -> bool {
        self.contains(CRUD_TABLE)
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

type Listener = Box<dyn Fn(&TableUpdate) + Send + Sync>;

/// Distributes table updates to subscribers.
///
/// Supports channel subscribers and callback listeners. Disconnected
/// channel subscribers are dropped on the next emit.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<TableUpdate>>>,
    listeners: RwLock<Vec<Listener>>,
}

impl ChangeFeed {
    /// Creates an empty change feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a receiver that will receive all future updates.
    pub fn subscribe(&self) -> Receiver<TableUpdate> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a callback invoked synchronously for every update.
    ///
    /// Callbacks must not block.
    pub fn add_listener(&self, listener: impl Fn(&TableUpdate) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Emits an update. Empty updates are ignored.
    pub fn emit(&self, update: TableUpdate) {
        if update.is_empty() {
            return;
        }
        for listener in self.listeners.read().iter() {
            listener(&update);
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Returns the number of channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscribers.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
