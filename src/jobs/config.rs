//! `APPLY_DEVICE_CONFIG` job handler

use std::sync::Arc;

use async_trait::async_trait;

use super::{HandlerOutcome, Job, JobHandler, device_config_source};
use crate::manifest::ConfigApplier;
use crate::subscriber::ConfigUpdate;

/// Applies device configuration delivered over the config stream
pub struct ConfigJobHandler {
    applier: Arc<dyn ConfigApplier>,
}

impl ConfigJobHandler {
    /// Create a handler that hands validated updates to `applier`
    #[must_use]
    pub fn new(applier: Arc<dyn ConfigApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl JobHandler for ConfigJobHandler {
    async fn handle(&self, job: &Job) -> HandlerOutcome {
        let Some(source) = device_config_source(job) else {
            return HandlerOutcome::Permanent("job carries no config".to_string());
        };

        let update: ConfigUpdate = match serde_json::from_str(&source) {
            Ok(update) => update,
            Err(e) => return HandlerOutcome::Permanent(format!("malformed config: {e}")),
        };

        if let Err(e) = update.validate() {
            return HandlerOutcome::Permanent(e.to_string());
        }

        match self.applier.apply(&update).await {
            Ok(summary) => {
                tracing::info!(job_id = %job.id, %summary, "device config applied");
                HandlerOutcome::Success
            }
            Err(e) => HandlerOutcome::Transient(format!("failed to apply config: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::Mutex;

    use super::*;
    use crate::jobs::JobKind;
    use crate::{Error, Result};

    #[derive(Default)]
    struct Recording {
        applied: Mutex<Vec<ConfigUpdate>>,
        fail: bool,
    }

    #[async_trait]
    impl ConfigApplier for Recording {
        async fn apply(&self, update: &ConfigUpdate) -> Result<String> {
            if self.fail {
                return Err(Error::Manifest("disk full".to_string()));
            }
            self.applied.lock().await.push(update.clone());
            Ok("ok".to_string())
        }
    }

    fn job(fields: &[(&str, &str)]) -> Job {
        Job {
            id: "cfg-1".to_string(),
            kind: JobKind::ApplyDeviceConfig,
            payload: serde_json::Map::new(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn applies_valid_config() {
        let applier = Arc::new(Recording::default());
        let handler = ConfigJobHandler::new(applier.clone());

        let outcome = handler
            .handle(&job(&[(
                "config",
                r#"{"deviceName":"rig-1","services":["vllm"]}"#,
            )]))
            .await;

        assert_eq!(outcome, HandlerOutcome::Success);
        let applied = applier.applied.lock().await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].device_name, "rig-1");
    }

    #[tokio::test]
    async fn malformed_config_is_permanent() {
        let applier = Arc::new(Recording::default());
        let handler = ConfigJobHandler::new(applier.clone());

        let outcome = handler.handle(&job(&[("config", "{not json")])).await;
        assert!(matches!(outcome, HandlerOutcome::Permanent(_)));

        let outcome = handler.handle(&job(&[])).await;
        assert!(matches!(outcome, HandlerOutcome::Permanent(_)));

        assert!(applier.applied.lock().await.is_empty());
    }

    #[tokio::test]
    async fn over_limit_config_is_rejected_whole() {
        let applier = Arc::new(Recording::default());
        let handler = ConfigJobHandler::new(applier.clone());

        let tags: Vec<String> = (0..101).map(|i| format!("t{i}")).collect();
        let config = serde_json::json!({ "deviceName": "ok", "customTags": tags }).to_string();

        let outcome = handler.handle(&job(&[("config", &config)])).await;
        assert!(matches!(outcome, HandlerOutcome::Permanent(_)));
        assert!(applier.applied.lock().await.is_empty());
    }

    #[tokio::test]
    async fn apply_failure_is_transient() {
        let applier = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let handler = ConfigJobHandler::new(applier);

        let outcome = handler.handle(&job(&[("config", "{}")])).await;
        assert!(matches!(outcome, HandlerOutcome::Transient(_)));
    }
}
