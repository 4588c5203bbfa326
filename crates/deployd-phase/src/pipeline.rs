//! Pipeline phase adapters.
//!
//! One entry point, [`execute`], dispatches on the phase input. Each arm
//! calls exactly one collaborator under the context deadline and returns
//! the typed payload the controller appends to the run.

use std::time::Duration;

use tracing::{debug, info};

use deploy_core::{
    BuiltImage, Deployment, DeployedContainer, PhaseKind, PhasePayload, Release, RunId,
};

use crate::contract::{Collaborators, Outcome, bounded};
use crate::health::{HealthWindow, poll_until_healthy};

/// What a phase needs from the phases before it.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseInput {
    Scan,
    Build,
    Deploy { image: BuiltImage },
    HealthCheck {
        container: DeployedContainer,
        /// Timeout of one probe inside the window.
        probe_timeout: Duration,
    },
    Rollback { release: Release },
}

impl PhaseInput {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Scan => PhaseKind::SecurityScan,
            Self::Build => PhaseKind::Build,
            Self::Deploy { .. } => PhaseKind::Deploy,
            Self::HealthCheck { .. } => PhaseKind::HealthCheck,
            Self::Rollback { .. } => PhaseKind::Rollback,
        }
    }
}

/// Everything one phase invocation sees.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: RunId,
    pub deployment: Deployment,
    /// Upper bound on the whole invocation. For health checks this is the
    /// verification window.
    pub deadline: Duration,
    pub input: PhaseInput,
}

/// Run one phase to an outcome. Never retries.
pub async fn execute(ctx: &PhaseContext, collab: &Collaborators) -> Outcome<PhasePayload> {
    let kind = ctx.input.kind();
    let retryable_on_timeout = kind.retryable_on_timeout();
    let deployment = &ctx.deployment;
    debug!(run_id = %ctx.run_id, phase = %kind, deadline = ?ctx.deadline, "executing phase");

    match &ctx.input {
        PhaseInput::Scan => bounded(
            "security scan",
            ctx.deadline,
            retryable_on_timeout,
            collab.scanner.scan(&deployment.repository),
        )
        .await
        .map(PhasePayload::Scan),

        PhaseInput::Build => {
            let tag = deployment.image_tag();
            bounded(
                "image build",
                ctx.deadline,
                retryable_on_timeout,
                collab.builder.build(&deployment.repository, &tag),
            )
            .await
            .map(|image| {
                info!(run_id = %ctx.run_id, image = %image.image_reference, size_bytes = image.size_bytes, "image built");
                PhasePayload::Build(image)
            })
        }

        PhaseInput::Deploy { image } => bounded(
            "deploy",
            ctx.deadline,
            retryable_on_timeout,
            collab.compute.deploy(
                &deployment.instance,
                &image.image_reference,
                deployment.port,
                &deployment.strategy,
            ),
        )
        .await
        .map(|container| {
            info!(
                run_id = %ctx.run_id,
                container = %container.container_reference,
                url = %container.url,
                strategy = deployment.strategy.name(),
                "container deployed"
            );
            PhasePayload::Deploy(container)
        }),

        PhaseInput::HealthCheck {
            container,
            probe_timeout,
        } => {
            let window = HealthWindow {
                url: container.url.clone(),
                path: deployment.health.path.clone(),
                window: ctx.deadline,
                interval: deployment
                    .health
                    .interval()
                    .unwrap_or(Duration::from_secs(5)),
                probe_timeout: *probe_timeout,
                healthy_threshold: deployment.health.healthy_threshold,
            };
            poll_until_healthy(collab.health.as_ref(), &window)
                .await
                .map(PhasePayload::Health)
        }

        PhaseInput::Rollback { release } => bounded(
            "rollback",
            ctx.deadline,
            retryable_on_timeout,
            collab.compute.deploy(
                &deployment.instance,
                &release.image_reference,
                deployment.port,
                &deployment.strategy,
            ),
        )
        .await
        .map(|container| {
            info!(
                run_id = %ctx.run_id,
                image = %release.image_reference,
                container = %container.container_reference,
                "previous release redeployed"
            );
            PhasePayload::Rollback(container)
        }),
    }
}
