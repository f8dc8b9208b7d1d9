//! Identity and whiteboard lookups owned by the surrounding product.
//!
//! User accounts and whiteboard lifecycle live outside this crate; the
//! coordinator only asks the two questions below.

use std::collections::HashSet;
use uuid::Uuid;

pub trait Membership: Send + Sync {
    /// Resolve the author a connection claims to be, or `None` to reject it.
    fn authenticate(&self, claimed_author: &str) -> Option<String>;

    fn whiteboard_exists(&self, whiteboard_id: Uuid) -> bool;
}

/// Accepts any non-blank author on any whiteboard.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenMembership;

impl Membership for OpenMembership {
    fn authenticate(&self, claimed_author: &str) -> Option<String> {
        let author = claimed_author.trim();
        (!author.is_empty()).then(|| author.to_string())
    }

    fn whiteboard_exists(&self, _whiteboard_id: Uuid) -> bool {
        true
    }
}

/// Fixed allow-lists of authors and whiteboards.
#[derive(Debug, Default, Clone)]
pub struct StaticMembership {
    authors: HashSet<String>,
    whiteboards: HashSet<Uuid>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.insert(author.into());
        self
    }

    pub fn with_whiteboard(mut self, whiteboard_id: Uuid) -> Self {
        self.whiteboards.insert(whiteboard_id);
        self
    }
}

impl Membership for StaticMembership {
    fn authenticate(&self, claimed_author: &str) -> Option<String> {
        self.authors.get(claimed_author).cloned()
    }

    fn whiteboard_exists(&self, whiteboard_id: Uuid) -> bool {
        self.whiteboards.contains(&whiteboard_id)
    }
}
