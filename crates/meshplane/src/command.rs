use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::types::DestinationId;

/// Invocation of a device command, with its parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub invocation_id: String,
    pub command_token: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommandKind {
    RegistrationAck,
    RegistrationFailure,
    DeviceStreamAck,
    DeviceMappingAck,
}

/// Platform-generated message for a device, as opposed to a user command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Where the target device sits relative to the gateway that relays for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestingContext {
    /// Device the command is physically sent to.
    pub gateway_token: Option<String>,
    /// Nested device the command is meant for, when different.
    pub nested_token: Option<String>,
    /// Element path of the nested device within the gateway.
    pub path: Option<String>,
}

/// Assignment of the target device at the time the command is routed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentContext {
    pub assignment_token: String,
    pub device_token: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Exactly one payload per routing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedCommand<'a> {
    Execution(&'a CommandExecution),
    System(&'a SystemCommand),
}

/// Pluggable channel that delivers commands to devices.
#[async_trait]
pub trait CommandDestination: Send + Sync {
    fn destination_id(&self) -> &DestinationId;

    async fn deliver_command(
        &self,
        execution: &CommandExecution,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<(), MeshError>;

    async fn deliver_system_command(
        &self,
        command: &SystemCommand,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<(), MeshError>;
}

/// Ordered set of destinations with unique ids. Built once, read-only
/// afterwards.
pub struct DestinationRegistry {
    destinations: Vec<Arc<dyn CommandDestination>>,
    by_id: HashMap<DestinationId, usize>,
}

impl DestinationRegistry {
    pub fn new(destinations: Vec<Arc<dyn CommandDestination>>) -> Result<Self, MeshError> {
        let mut by_id = HashMap::with_capacity(destinations.len());
        for (index, destination) in destinations.iter().enumerate() {
            let id = destination.destination_id().clone();
            if by_id.insert(id.clone(), index).is_some() {
                return Err(MeshError::DuplicateDestination { destination_id: id });
            }
        }
        Ok(Self {
            destinations,
            by_id,
        })
    }

    /// Exact-match lookup.
    pub fn get(&self, id: &DestinationId) -> Option<&Arc<dyn CommandDestination>> {
        self.by_id.get(id).map(|&i| &self.destinations[i])
    }

    /// Destination ids in registration order.
    pub fn ids(&self) -> Vec<DestinationId> {
        self.destinations
            .iter()
            .map(|d| d.destination_id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// External routing logic. Picks a destination id, or none, for a command.
/// Must not dispatch the command itself.
pub trait DecisionFunction: Send + Sync {
    fn evaluate(
        &self,
        command: RoutedCommand<'_>,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<Option<DestinationId>, MeshError>;
}

/// [`DecisionFunction`] backed by a closure. Built with [`decision_fn`].
pub struct FnDecision<F>(F);

/// Wrap a closure as a [`DecisionFunction`].
pub fn decision_fn<F>(f: F) -> FnDecision<F>
where
    F: Fn(RoutedCommand<'_>, &NestingContext, &AssignmentContext) -> Result<Option<DestinationId>, MeshError>
        + Send
        + Sync,
{
    FnDecision(f)
}

impl<F> DecisionFunction for FnDecision<F>
where
    F: Fn(RoutedCommand<'_>, &NestingContext, &AssignmentContext) -> Result<Option<DestinationId>, MeshError>
        + Send
        + Sync,
{
    fn evaluate(
        &self,
        command: RoutedCommand<'_>,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<Option<DestinationId>, MeshError> {
        (self.0)(command, nesting, assignment)
    }
}

/// How a routing call ended. Only `Delivered` dispatched the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    Delivered(DestinationId),
    /// The decision named a destination that is not registered.
    DestinationNotFound(DestinationId),
    /// The decision named no destination.
    NoDestination,
}

/// Routes commands to a registered destination chosen by the decision
/// function.
pub struct CommandRouter {
    registry: Arc<DestinationRegistry>,
    decision: Arc<dyn DecisionFunction>,
    metrics: Arc<MeshMetrics>,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<DestinationRegistry>,
        decision: Arc<dyn DecisionFunction>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            registry,
            decision,
            metrics,
        }
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    pub async fn route_command(
        &self,
        execution: &CommandExecution,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<RoutingOutcome, MeshError> {
        self.route(RoutedCommand::Execution(execution), nesting, assignment)
            .await
    }

    pub async fn route_system_command(
        &self,
        command: &SystemCommand,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<RoutingOutcome, MeshError> {
        self.route(RoutedCommand::System(command), nesting, assignment)
            .await
    }

    /// Evaluate the decision function once and deliver to the matching
    /// destination. Unknown and absent destinations are logged, not errors.
    #[instrument(skip_all, fields(assignment = %assignment.assignment_token))]
    pub async fn route(
        &self,
        command: RoutedCommand<'_>,
        nesting: &NestingContext,
        assignment: &AssignmentContext,
    ) -> Result<RoutingOutcome, MeshError> {
        let target = self
            .decision
            .evaluate(command, nesting, assignment)
            .map_err(|e| match e {
                MeshError::DecisionFailed { .. } => e,
                other => MeshError::DecisionFailed {
                    reason: other.to_string(),
                    source: Some(Box::new(other)),
                },
            })?;

        let Some(destination_id) = target else {
            tracing::warn!("decision function returned no destination, command not routed");
            self.record("no_destination");
            return Ok(RoutingOutcome::NoDestination);
        };

        let Some(destination) = self.registry.get(&destination_id) else {
            tracing::warn!(destination = %destination_id, "no command destination found for id");
            self.record("destination_not_found");
            return Ok(RoutingOutcome::DestinationNotFound(destination_id));
        };

        let delivered = match command {
            RoutedCommand::Execution(execution) => {
                destination
                    .deliver_command(execution, nesting, assignment)
                    .await
            }
            RoutedCommand::System(system) => {
                destination
                    .deliver_system_command(system, nesting, assignment)
                    .await
            }
        };
        match delivered {
            Ok(()) => {
                tracing::debug!(destination = %destination_id, "command delivered");
                self.record("delivered");
                Ok(RoutingOutcome::Delivered(destination_id))
            }
            Err(e) => {
                self.record("delivery_failed");
                Err(MeshError::DeliveryFailed {
                    destination_id,
                    reason: e.to_string(),
                    source: Some(Box::new(e)),
                })
            }
        }
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .commands_routed
            .with_label_values(&[outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Delivery, RecordingDestination};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn execution() -> CommandExecution {
        CommandExecution {
            invocation_id: "inv-1".into(),
            command_token: "reboot".into(),
            namespace: "http://example.com/device".into(),
            name: "reboot".into(),
            parameters: BTreeMap::new(),
        }
    }

    fn assignment() -> AssignmentContext {
        AssignmentContext {
            assignment_token: "asg-1".into(),
            device_token: "dev-1".into(),
            metadata: BTreeMap::new(),
        }
    }

    struct Fixture {
        router: CommandRouter,
        dest1: Arc<RecordingDestination>,
        dest2: Arc<RecordingDestination>,
        evaluations: Arc<AtomicUsize>,
    }

    fn fixture(target: Option<&str>) -> Fixture {
        let dest1 = Arc::new(RecordingDestination::new("dest-1"));
        let dest2 = Arc::new(RecordingDestination::new("dest-2"));
        let registry = DestinationRegistry::new(vec![dest1.clone(), dest2.clone()]).unwrap();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let target = target.map(DestinationId::new);
        let counter = evaluations.clone();
        let decision = decision_fn(move |_cmd, _nesting, _assignment| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(target.clone())
        });
        Fixture {
            router: CommandRouter::new(
                Arc::new(registry),
                Arc::new(decision),
                Arc::new(MeshMetrics::unregistered()),
            ),
            dest1,
            dest2,
            evaluations,
        }
    }

    #[tokio::test]
    async fn delivers_to_chosen_destination_only() {
        let f = fixture(Some("dest-2"));
        let outcome = f
            .router
            .route_command(&execution(), &NestingContext::default(), &assignment())
            .await
            .unwrap();
        assert_eq!(outcome, RoutingOutcome::Delivered(DestinationId::new("dest-2")));
        assert_eq!(f.dest2.deliveries(), vec![Delivery::Command(execution())]);
        assert!(f.dest1.deliveries().is_empty());
        assert_eq!(f.evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_not_fatal() {
        let f = fixture(Some("dest-9"));
        let outcome = f
            .router
            .route_command(&execution(), &NestingContext::default(), &assignment())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RoutingOutcome::DestinationNotFound(DestinationId::new("dest-9"))
        );
        assert!(f.dest1.deliveries().is_empty());
        assert!(f.dest2.deliveries().is_empty());
        assert_eq!(f.evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_destination_dispatches_nothing() {
        let f = fixture(None);
        let outcome = f
            .router
            .route_command(&execution(), &NestingContext::default(), &assignment())
            .await
            .unwrap();
        assert_eq!(outcome, RoutingOutcome::NoDestination);
        assert!(f.dest1.deliveries().is_empty());
        assert!(f.dest2.deliveries().is_empty());
        assert_eq!(f.evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn system_commands_use_system_delivery() {
        let f = fixture(Some("dest-1"));
        let ack = SystemCommand {
            kind: SystemCommandKind::RegistrationAck,
            reason: None,
        };
        f.router
            .route_system_command(&ack, &NestingContext::default(), &assignment())
            .await
            .unwrap();
        assert_eq!(f.dest1.deliveries(), vec![Delivery::System(ack)]);
    }

    #[tokio::test]
    async fn decision_sees_command_and_contexts() {
        let dest = Arc::new(RecordingDestination::new("gateway"));
        let registry = DestinationRegistry::new(vec![dest.clone()]).unwrap();
        let decision = decision_fn(|cmd, nesting, assignment| {
            let is_reboot = matches!(cmd, RoutedCommand::Execution(e) if e.name == "reboot");
            if is_reboot && nesting.gateway_token.is_some() && assignment.device_token == "dev-1" {
                Ok(Some(DestinationId::new("gateway")))
            } else {
                Ok(None)
            }
        });
        let router = CommandRouter::new(
            Arc::new(registry),
            Arc::new(decision),
            Arc::new(MeshMetrics::unregistered()),
        );
        let nesting = NestingContext {
            gateway_token: Some("gw-1".into()),
            nested_token: Some("dev-1".into()),
            path: Some("/slot/1".into()),
        };
        let outcome = router
            .route_command(&execution(), &nesting, &assignment())
            .await
            .unwrap();
        assert_eq!(outcome, RoutingOutcome::Delivered(DestinationId::new("gateway")));
        assert_eq!(dest.nesting_seen(), vec![nesting]);
    }

    #[tokio::test]
    async fn decision_error_aborts_routing() {
        let dest = Arc::new(RecordingDestination::new("dest-1"));
        let registry = DestinationRegistry::new(vec![dest.clone()]).unwrap();
        let decision = decision_fn(|_, _, _| {
            Err(MeshError::DecisionFailed {
                reason: "script raised".into(),
                source: None,
            })
        });
        let router = CommandRouter::new(
            Arc::new(registry),
            Arc::new(decision),
            Arc::new(MeshMetrics::unregistered()),
        );
        let err = router
            .route_command(&execution(), &NestingContext::default(), &assignment())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::DecisionFailed { .. }));
        assert!(dest.deliveries().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_reported() {
        let dest = Arc::new(RecordingDestination::failing("dest-1"));
        let registry = DestinationRegistry::new(vec![dest.clone()]).unwrap();
        let metrics = Arc::new(MeshMetrics::unregistered());
        let router = CommandRouter::new(
            Arc::new(registry),
            Arc::new(decision_fn(|_, _, _| Ok(Some(DestinationId::new("dest-1"))))),
            metrics.clone(),
        );
        let err = router
            .route_command(&execution(), &NestingContext::default(), &assignment())
            .await
            .unwrap_err();
        assert!(
            matches!(err, MeshError::DeliveryFailed { ref destination_id, .. } if destination_id.as_str() == "dest-1")
        );
        let routed = |outcome: &str| metrics.commands_routed.with_label_values(&[outcome]).get();
        assert_eq!(routed("delivery_failed"), 1);
        assert_eq!(routed("delivered"), 0);
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let err = DestinationRegistry::new(vec![
            Arc::new(RecordingDestination::new("dest-1")),
            Arc::new(RecordingDestination::new("dest-1")),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, MeshError::DuplicateDestination { .. }));
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = DestinationRegistry::new(vec![
            Arc::new(RecordingDestination::new("b")),
            Arc::new(RecordingDestination::new("a")),
        ])
        .unwrap();
        assert_eq!(
            registry.ids(),
            vec![DestinationId::new("b"), DestinationId::new("a")]
        );
        assert!(registry.get(&DestinationId::new("a")).is_some());
        assert!(registry.get(&DestinationId::new("A")).is_none());
    }
}
