use std::collections::VecDeque;
use serde::Serialize;

use crate::models::GenerationItem;

/// Completed generations, most recent first. Grows only through
/// [`GenerationSlots::archive_and_replace`]; nothing is ever evicted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct History {
    items: VecDeque<GenerationItem>,
}

impl History {
    fn archive(&mut self, item: GenerationItem) {
        self.items.push_front(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenerationItem> { self.items.iter() }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn to_vec(&self) -> Vec<GenerationItem> { self.items.iter().cloned().collect() }
}

/// The current result plus the archive of everything it replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSlots {
    current: Option<GenerationItem>,
    history: History,
}

impl GenerationSlots {
    pub fn current(&self) -> Option<&GenerationItem> { self.current.as_ref() }
    pub fn history(&self) -> &History { &self.history }

    /// Installs `next` as the current result, moving the previous one (if
    /// any) unchanged to the head of the history. Returns the archived item.
    pub fn archive_and_replace(&mut self, next: GenerationItem) -> Option<&GenerationItem> {
        let previous = self.current.replace(next)?;
        tracing::info!("📦 Archived {} to history ({} items)", previous.id, self.history.len() + 1);
        self.history.archive(previous);
        self.history.items.front()
    }
}
