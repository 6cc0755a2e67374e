use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Typed contents of `challenges.metadata`, one variant per lifecycle stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChallengeMetadata {
    /// Waiting for the local worker to pick up `job_id`.
    Queued { job_id: Uuid },
    /// The issuer's recipe is still being learned.
    AwaitingRecipe {
        issuer_id: String,
        #[serde(default)]
        learn_job_id: Option<String>,
    },
    /// Handed to the remote worker, which reports back through the webhook.
    /// `run_job_id` is `None` until the start call returns.
    RemoteRun {
        #[serde(default)]
        run_job_id: Option<String>,
    },
    Completed {
        completed_steps: usize,
        #[serde(default)]
        evidence: Vec<String>,
        #[serde(default)]
        generated_text: Option<String>,
        #[serde(default)]
        confirmation_reference: Option<String>,
    },
    Failed {
        error: String,
        #[serde(default)]
        failed_step: Option<String>,
        #[serde(default)]
        completed_steps: usize,
    },
}

impl ChallengeMetadata {
    /// Reads stored metadata; rows written before a job reference existed
    /// (an empty object) read as `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ChallengeMetadata::Failed {
            error: error.into(),
            failed_step: None,
            completed_steps: 0,
        }
    }

    /// Whether a PENDING challenge with this metadata has something that will
    /// eventually move it forward. Parked challenges follow their issuer's
    /// automation, which releases or fails them.
    pub fn has_job_reference(&self) -> bool {
        match self {
            ChallengeMetadata::Queued { .. } | ChallengeMetadata::AwaitingRecipe { .. } => true,
            ChallengeMetadata::RemoteRun { run_job_id } => run_job_id.is_some(),
            ChallengeMetadata::Completed { .. } | ChallengeMetadata::Failed { .. } => false,
        }
    }
}
