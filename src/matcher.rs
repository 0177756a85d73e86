//! Predicates selecting subsets of workers.
use std::collections::HashSet;

use crate::worker::{Subproc, WorkerStatus};

/// How several explicitly set criteria combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// A worker matches when any set criterion holds.
    #[default]
    Any,
    /// A worker matches only when every set criterion holds.
    All,
}

/// The fields of a worker a predicate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerView<'a> {
    pub id: &'a str,
    pub cmd: &'a str,
    pub status: WorkerStatus,
    pub has_error: bool,
}

/// Selection criteria for manager operations.
///
/// Unset criteria are ignored; a predicate with nothing set matches no worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOptions {
    pub ids: Option<HashSet<String>>,
    pub cmds: Option<HashSet<String>>,
    pub status: Option<WorkerStatus>,
    /// `Some(true)` selects failing workers, `Some(false)` error-free ones.
    pub has_error: Option<bool>,
    pub match_all: bool,
    pub mode: MatchMode,
}

impl MatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches every worker.
    pub fn all() -> Self {
        Self {
            match_all: true,
            ..Self::default()
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cmds<I, S>(mut self, cmds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmds = Some(cmds.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn matches(&self, worker: &Subproc) -> bool {
        self.matches_view(&worker.view())
    }

    pub fn matches_view(&self, view: &WorkerView<'_>) -> bool {
        if self.match_all {
            return true;
        }

        let checks = [
            self.ids.as_ref().map(|ids| ids.contains(view.id)),
            self.cmds.as_ref().map(|cmds| cmds.contains(view.cmd)),
            self.status.map(|status| status == view.status),
            self.has_error.map(|has_error| has_error == view.has_error),
        ];
        let mut set = checks.into_iter().flatten().peekable();
        if set.peek().is_none() {
            return false;
        }

        match self.mode {
            MatchMode::Any => set.any(|hit| hit),
            MatchMode::All => set.all(|hit| hit),
        }
    }
}
