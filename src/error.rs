use thiserror::Error;

/// Failures raised while interpreting a flow.
///
/// Only `FlowDefinition` ends a turn early with a user-visible message. The
/// others are contained where they happen: unknown blocks reroute to the error
/// block, malformed conditions evaluate to false, script failures yield empty
/// output and distribution failures leave the ticket unassigned.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow definition: {0}")]
    FlowDefinition(String),

    #[error("unknown block '{0}'")]
    UnknownBlock(String),

    #[error("malformed condition on '{variable}': {reason}")]
    ConditionEvaluation { variable: String, reason: String },

    #[error("script execution failed: {0}")]
    ScriptExecution(String),

    #[error("delivery failed permanently: {0}")]
    DeliveryFatal(String),

    #[error("delivery failed after retries: {0}")]
    DeliveryTransient(String),

    #[error("ticket distribution failed: {0}")]
    TicketDistribution(String),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}
