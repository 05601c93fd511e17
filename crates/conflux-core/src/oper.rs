//! Operational Composer — on-demand state composition.
//!
//! A read against the operational datastore walks the registered
//! providers in nesting order (parents strictly before children), asks
//! each for its subtree once per existing parent instance, validates and
//! merges the answers over the pushed operational layer, and finally
//! applies the reader's filter.
//!
//! Provider selection is textual and conservative: a provider is skipped
//! only when its path is provably disjoint from the request (plain-name
//! mismatch with no wildcard involved); predicates never disqualify.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::data::{DataTree, SubtreeValidator};
use crate::errinfo::ErrorCode;
use crate::event::{EventPayload, EventPhase, EventRecord, EventState, SessionId};
use crate::store::{EventStore, StoreError};
use crate::subscription::{SubscriptionId, Subscription, SubscriptionRegistry};
use crate::xpath::{PathRelationship, Segment, XPathError, XPathFilter};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from an operational read.
#[derive(Debug, thiserror::Error)]
pub enum OperError {
    /// The request path failed to compile.
    #[error("invalid request path: {0}")]
    Request(#[from] XPathError),
    /// A provider returned data the schema rejected; the whole read
    /// fails.
    #[error("provider {sub} returned invalid data: {message}")]
    Validation {
        /// The offending provider.
        sub: SubscriptionId,
        /// Validator message.
        message: String,
    },
    /// Event store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// OperationalPlan
// ---------------------------------------------------------------------------

/// Ordered provider list of one read: ancestors strictly before
/// descendants, siblings by priority then id. Built per request and
/// discarded with it.
pub struct OperationalPlan {
    steps: Vec<Arc<Subscription>>,
}

impl OperationalPlan {
    /// Selects and orders the providers applicable to `request`.
    #[must_use]
    pub fn build(registry: &SubscriptionRegistry, request: &XPathFilter) -> Self {
        let mut steps: Vec<Arc<Subscription>> = registry
            .oper_targets()
            .into_iter()
            .filter(|s| request.relationship(&s.filter) != PathRelationship::Disjoint)
            .collect();
        // Depth ascending puts every ancestor provider before any of its
        // descendants; relative order of disjoint same-depth providers is
        // irrelevant.
        steps.sort_by(|a, b| {
            a.filter
                .depth()
                .cmp(&b.filter.depth())
                .then(a.priority().cmp(&b.priority()))
                .then(a.id.cmp(&b.id))
        });
        Self { steps }
    }

    /// Providers in invocation order.
    #[must_use]
    pub fn steps(&self) -> &[Arc<Subscription>] {
        &self.steps
    }

    /// Returns `true` when no provider applies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// OperationalComposer
// ---------------------------------------------------------------------------

/// Composes operational data from providers on demand.
pub struct OperationalComposer {
    config: EngineConfig,
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
}

impl OperationalComposer {
    /// Creates a composer over the shared engine state.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<EventStore>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// Serves an operational read.
    ///
    /// `base` is the pushed operational layer the provider answers merge
    /// over. Provider failures other than validation drop that provider's
    /// contribution; validation failures fail the read.
    ///
    /// # Errors
    ///
    /// See [`OperError`].
    pub fn compose(
        &self,
        request_xpath: &str,
        base: DataTree,
        validator: &dyn SubtreeValidator,
        originator: SessionId,
        timeout: Option<Duration>,
    ) -> Result<DataTree, OperError> {
        let request = XPathFilter::parse(request_xpath)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let plan = OperationalPlan::build(&self.registry, &request);
        debug!(request = request_xpath, providers = plan.steps().len(), "operational read");

        let mut composite = base;
        for provider in plan.steps() {
            for parent_path in concrete_parents(&composite, provider.filter.segments()) {
                let deadline = Instant::now() + timeout;
                let record = EventRecord::new(
                    provider.id,
                    EventPhase::OperRequest,
                    EventPayload::Oper {
                        request_xpath: request_xpath.to_string(),
                        parent_path: parent_path.clone(),
                    },
                    originator,
                    deadline,
                );
                let event_id = match self.store.publish(provider.group, record) {
                    Ok(id) => id,
                    Err(StoreError::NoSpace(_) | StoreError::UnknownGroup(_)) => {
                        warn!(sub = %provider.id, "operational request not deliverable");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let states = self
                    .store
                    .wait_terminal(provider.group, &[event_id], deadline)?;
                let _ = self.store.reap_terminal(provider.group);
                let (_, state, verdict) = &states[0];
                match state {
                    EventState::CompletedOk => {
                        let Some(subtree) = verdict.as_ref().and_then(|v| v.output.clone())
                        else {
                            continue;
                        };
                        if let Err(message) = validator.validate(&parent_path, &subtree) {
                            return Err(OperError::Validation {
                                sub: provider.id,
                                message,
                            });
                        }
                        // merge_subtree only fails on an unparsable path,
                        // and parent paths come from the tree itself.
                        let _ = composite.merge_subtree(&parent_path, &subtree);
                    }
                    EventState::TimedOut => {
                        warn!(sub = %provider.id, parent = %parent_path, "provider timed out");
                    }
                    _ => {
                        let code = verdict
                            .as_ref()
                            .and_then(|v| v.error.as_ref())
                            .map_or(ErrorCode::Internal, |e| e.code);
                        if code == ErrorCode::Validation {
                            let message = verdict
                                .as_ref()
                                .and_then(|v| v.error.as_ref())
                                .map_or_else(String::new, |e| e.message.clone());
                            return Err(OperError::Validation {
                                sub: provider.id,
                                message,
                            });
                        }
                        warn!(sub = %provider.id, parent = %parent_path, "provider failed ({code})");
                    }
                }
            }
        }

        Ok(composite.filtered(&request))
    }
}

/// Expands the parent of a provider path into the concrete instances
/// present in `tree`.
///
/// Plain container segments are descended virtually even when absent (a
/// top-level provider must run against an empty tree), but wildcard and
/// predicate-bearing segments require existing instances: a descendant
/// provider is never invoked for a parent its ancestor providers did not
/// produce.
fn concrete_parents(tree: &DataTree, provider_segments: &[Segment]) -> Vec<String> {
    let Some((_, parents)) = provider_segments.split_last() else {
        return Vec::new();
    };
    if parents.is_empty() {
        return vec!["/".to_string()];
    }

    let mut out = Vec::new();
    expand(Some(tree.root()), parents, 0, &mut String::new(), &mut out);
    out
}

fn expand(
    node: Option<&crate::data::DataNode>,
    segments: &[Segment],
    idx: usize,
    path: &mut String,
    out: &mut Vec<String>,
) {
    if idx == segments.len() {
        out.push(path.clone());
        return;
    }
    let seg = &segments[idx];
    let is_plain = seg.name != "*" && seg.predicates.is_empty();

    let mut matched = false;
    if let Some(node) = node {
        for (key, child) in &node.children {
            let Ok(parsed) = Segment::parse(key) else {
                continue;
            };
            if seg.accepts(&parsed) {
                matched = true;
                let len = path.len();
                path.push('/');
                path.push_str(key);
                expand(Some(child), segments, idx + 1, path, out);
                path.truncate(len);
            }
        }
    }

    // Virtual descent through an absent plain container.
    if !matched && is_plain {
        let len = path.len();
        path.push('/');
        path.push_str(&seg.to_string());
        expand(None, segments, idx + 1, path, out);
        path.truncate(len);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
