// Aggregation - Per-view vote and timeout collection
//
// Each view gets its own collector behind its own mutex, so views progress
// independently while all mutations of one view's tally are serialized.
// Views at or below the pruning horizon, or too far beyond it, are rejected
// before any validation.

pub mod timeouts;
pub mod votes;

pub use timeouts::{TimeoutAggregator, TimeoutOutcome};
pub use votes::{VoteAggregator, VoteOutcome};

use super::config::MAX_VIEWS_AHEAD;
use super::error::{CommitteeError, EncodingError, ValidationError};
use super::packer::PackerError;
use crate::types::View;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Aggregation failures
///
/// Protocol-invalid input is not an error here: it is reported through the
/// outcome and the notification consumer.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    /// Late message for a pruned view
    #[error("view {view} already processed (lowest retained view {lowest_retained})")]
    ViewAlreadyProcessed { view: View, lowest_retained: View },

    /// Message for a view this node cannot have reached yet
    #[error("view {view} is beyond the highest accepted view {highest_accepted}")]
    ViewTooFarAhead { view: View, highest_accepted: View },

    /// Validator failed for a reason other than invalid input
    #[error("validation failed unexpectedly: {0}")]
    Validation(#[from] ValidationError),

    #[error("committee lookup failed: {0}")]
    Committee(#[from] CommitteeError),

    #[error("could not pack certificate: {0}")]
    Packing(#[from] PackerError),

    #[error("could not encode certificate: {0}")]
    Encoding(#[from] EncodingError),

    /// A message that passed validation cannot be used
    #[error("inconsistent aggregation state: {0}")]
    Inconsistent(String),
}

impl AggregationError {
    pub fn is_view_already_processed(&self) -> bool {
        matches!(self, AggregationError::ViewAlreadyProcessed { .. })
    }
}

/// Collectors keyed by view, with a pruning horizon
pub(crate) struct ViewCollectors<T> {
    lowest_retained: AtomicU64,
    collectors: RwLock<BTreeMap<View, Arc<Mutex<T>>>>,
}

impl<T> ViewCollectors<T> {
    pub(crate) fn new(lowest_retained: View) -> Self {
        Self {
            lowest_retained: AtomicU64::new(lowest_retained),
            collectors: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn lowest_retained(&self) -> View {
        self.lowest_retained.load(Ordering::Acquire)
    }

    /// Cheap horizon check, done before any validation work
    pub(crate) fn check_view(&self, view: View) -> Result<(), AggregationError> {
        let lowest_retained = self.lowest_retained();
        if view < lowest_retained {
            return Err(AggregationError::ViewAlreadyProcessed { view, lowest_retained });
        }
        let highest_accepted = lowest_retained.saturating_add(MAX_VIEWS_AHEAD);
        if view > highest_accepted {
            return Err(AggregationError::ViewTooFarAhead { view, highest_accepted });
        }
        Ok(())
    }

    /// Collector for a view, created on first use
    pub(crate) fn get_or_create(&self, view: View, create: impl FnOnce() -> T) -> Result<Arc<Mutex<T>>, AggregationError> {
        self.check_view(view)?;
        if let Some(existing) = self.collectors.read().unwrap_or_else(|e| e.into_inner()).get(&view) {
            return Ok(existing.clone());
        }

        let mut collectors = self.collectors.write().unwrap_or_else(|e| e.into_inner());
        // pruning may have raced with us
        self.check_view(view)?;
        Ok(collectors
            .entry(view)
            .or_insert_with(|| Arc::new(Mutex::new(create())))
            .clone())
    }

    /// Drop all collectors at or below `view`
    pub(crate) fn prune_up_to_view(&self, view: View) {
        let mut collectors = self.collectors.write().unwrap_or_else(|e| e.into_inner());
        let horizon = view.saturating_add(1);
        if horizon <= self.lowest_retained() {
            return;
        }
        self.lowest_retained.store(horizon, Ordering::Release);
        let retained = collectors.split_off(&horizon);
        let dropped = collectors.len();
        *collectors = retained;
        debug!("Aggregation: pruned {} collectors up to view {}", dropped, view);
    }

    pub(crate) fn len(&self) -> usize {
        self.collectors.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
