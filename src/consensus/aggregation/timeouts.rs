// Timeouts - Timeout collection and TC construction
//
// Per view: dedup by signer, validate, accumulate weight of the view's epoch.
// Crossing the honest-majority threshold announces a partial TC once;
// crossing the quorum threshold builds the TC once.

use super::{AggregationError, ViewCollectors};
use crate::consensus::committee::Committee;
use crate::consensus::metrics::ConsensusMetrics;
use crate::consensus::notifications::Consumer;
use crate::consensus::signer_indices::encode_signer_ids;
use crate::consensus::threshold::{quorum_threshold, timeout_partial_threshold};
use crate::consensus::validator::ConsensusValidator;
use crate::types::{NodeId, QuorumCertificate, TimeoutCertificate, TimeoutObject, View, Weight};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of feeding one timeout to the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Counted; TC either not reached yet or already built
    Accepted { total_weight: Weight },

    /// This timeout completed the quorum
    TcBuilt(TimeoutCertificate),

    Duplicate,

    /// Signer already sent a different timeout for this view
    DoubleTimeout,

    Invalid,
}

enum Event {
    NewQc(QuorumCertificate),
    PartialTc(View, QuorumCertificate, Option<TimeoutCertificate>),
    TcConstructed(TimeoutCertificate),
    DoubleTimeout(TimeoutObject, TimeoutObject),
    InvalidTimeout(TimeoutObject, String),
}

struct TimeoutCollector {
    view: View,
    first_timeouts: HashMap<NodeId, TimeoutObject>,
    total_weight: Weight,
    newest_qc: Option<QuorumCertificate>,
    partial_announced: bool,
    tc: Option<TimeoutCertificate>,
}

impl TimeoutCollector {
    fn new(view: View) -> Self {
        Self {
            view,
            first_timeouts: HashMap::new(),
            total_weight: 0,
            newest_qc: None,
            partial_announced: false,
            tc: None,
        }
    }
}

/// Collects timeouts for all active views
pub struct TimeoutAggregator<V: ConsensusValidator + ?Sized> {
    validator: Arc<V>,
    committee: Arc<dyn Committee>,
    consumer: Arc<dyn Consumer>,
    metrics: Option<Arc<ConsensusMetrics>>,
    collectors: ViewCollectors<TimeoutCollector>,

    /// Highest QC view seen in any timeout
    newest_qc_view: AtomicU64,
}

impl<V: ConsensusValidator + ?Sized> TimeoutAggregator<V> {
    pub fn new(
        validator: Arc<V>,
        committee: Arc<dyn Committee>,
        consumer: Arc<dyn Consumer>,
        lowest_retained_view: View,
    ) -> Self {
        Self {
            validator,
            committee,
            consumer,
            metrics: None,
            collectors: ViewCollectors::new(lowest_retained_view),
            newest_qc_view: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsensusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lowest_retained_view(&self) -> View {
        self.collectors.lowest_retained()
    }

    /// Feed a timeout received from the network (or produced locally)
    pub fn add_timeout(&self, timeout: TimeoutObject) -> Result<TimeoutOutcome, AggregationError> {
        let collector = self
            .collectors
            .get_or_create(timeout.view, || TimeoutCollector::new(timeout.view))?;
        let mut events = Vec::new();
        let outcome = {
            let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
            self.process_timeout(&mut collector, timeout, &mut events)
        };
        self.emit(events);
        outcome
    }

    /// Forget all views up to and including `view`
    pub fn prune_up_to_view(&self, view: View) {
        self.collectors.prune_up_to_view(view);
    }

    fn process_timeout(
        &self,
        collector: &mut TimeoutCollector,
        timeout: TimeoutObject,
        events: &mut Vec<Event>,
    ) -> Result<TimeoutOutcome, AggregationError> {
        if let Some(first) = collector.first_timeouts.get(&timeout.signer_id) {
            if first.newest_qc.view == timeout.newest_qc.view && first.sig_data == timeout.sig_data {
                return Ok(TimeoutOutcome::Duplicate);
            }
            events.push(Event::DoubleTimeout(first.clone(), timeout));
            return Ok(TimeoutOutcome::DoubleTimeout);
        }

        let signer = match self.validator.validate_timeout(&timeout) {
            Ok(signer) => signer,
            Err(e) if e.is_invalid_input() => {
                warn!("🚨 Invalid timeout from {} at view {}: {}", timeout.signer_id, timeout.view, e);
                events.push(Event::InvalidTimeout(timeout, e.to_string()));
                return Ok(TimeoutOutcome::Invalid);
            }
            Err(e) => return Err(e.into()),
        };

        collector.first_timeouts.insert(signer.node_id, timeout.clone());
        collector.total_weight += signer.weight;

        let newest_qc = &timeout.newest_qc;
        if collector.newest_qc.as_ref().map_or(true, |qc| newest_qc.view > qc.view) {
            collector.newest_qc = Some(newest_qc.clone());
        }
        if self.newest_qc_view.fetch_max(newest_qc.view, Ordering::AcqRel) < newest_qc.view {
            events.push(Event::NewQc(newest_qc.clone()));
        }

        let total = self.committee.identities_by_epoch(collector.view)?.total_weight();
        debug!(
            "Timeouts: view {} has weight {}/{} after timeout from {}",
            collector.view,
            collector.total_weight,
            quorum_threshold(total),
            signer.node_id
        );

        if !collector.partial_announced && collector.total_weight >= timeout_partial_threshold(total) {
            collector.partial_announced = true;
            let qc = collector.newest_qc.clone().unwrap_or_else(|| newest_qc.clone());
            info!("⏳ Partial TC for view {} (weight {})", collector.view, collector.total_weight);
            events.push(Event::PartialTc(collector.view, qc, timeout.last_view_tc.clone()));
        }

        if collector.tc.is_some() || collector.total_weight < quorum_threshold(total) {
            return Ok(TimeoutOutcome::Accepted {
                total_weight: collector.total_weight,
            });
        }

        let tc = self.build_tc(collector)?;
        info!(
            "⌛ TC built for view {} with weight {} (newest QC view {})",
            tc.view, collector.total_weight, tc.newest_qc.view
        );
        collector.tc = Some(tc.clone());
        events.push(Event::TcConstructed(tc.clone()));
        if let Some(metrics) = &self.metrics {
            metrics.tc_built();
        }
        Ok(TimeoutOutcome::TcBuilt(tc))
    }

    /// Signers in canonical order, each with its reported newest QC view
    fn build_tc(&self, collector: &TimeoutCollector) -> Result<TimeoutCertificate, AggregationError> {
        let participants = self.committee.identities_by_epoch(collector.view)?;
        let full_members = participants.node_ids();

        let mut signers = Vec::with_capacity(collector.first_timeouts.len());
        let mut newest_qc_views = Vec::with_capacity(signers.capacity());
        let mut sig_data = Vec::new();
        for node_id in &full_members {
            if let Some(timeout) = collector.first_timeouts.get(node_id) {
                signers.push(*node_id);
                newest_qc_views.push(timeout.newest_qc.view);
                sig_data.extend_from_slice(&timeout.sig_data);
            }
        }

        let newest_qc = collector
            .newest_qc
            .clone()
            .ok_or_else(|| AggregationError::Inconsistent(format!("no newest QC at view {}", collector.view)))?;

        Ok(TimeoutCertificate {
            view: collector.view,
            newest_qc_views,
            newest_qc,
            signer_indices: encode_signer_ids(&full_members, &signers)?,
            sig_data,
        })
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::NewQc(qc) => self.consumer.on_new_qc_discovered(&qc),
                Event::PartialTc(view, qc, last_view_tc) => {
                    self.consumer.on_partial_tc_created(view, &qc, last_view_tc.as_ref())
                }
                Event::TcConstructed(tc) => self.consumer.on_tc_constructed_from_timeouts(&tc),
                Event::DoubleTimeout(first, second) => {
                    warn!("🚨 Double timeout by {} at view {}", first.signer_id, first.view);
                    self.consumer.on_double_timeout_detected(&first, &second);
                }
                Event::InvalidTimeout(timeout, reason) => self.consumer.on_invalid_timeout_detected(&timeout, &reason),
            }
        }
    }
}
