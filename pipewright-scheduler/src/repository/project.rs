//! Project file
//!
//! A JSON document declaring the pipelines and schedules the scheduler
//! starts with:
//!
//! ```json
//! {
//!   "pipelines": [
//!     { "uuid": "etl", "blocks": [
//!         { "uuid": "extract", "command": "./extract.sh" },
//!         { "uuid": "load", "command": "./load.sh", "upstream_blocks": ["extract"] }
//!     ] }
//!   ],
//!   "schedules": [
//!     { "name": "hourly etl", "pipeline_uuid": "etl", "schedule_interval": "@hourly" }
//!   ]
//! }
//! ```

use pipewright_core::domain::pipeline::Pipeline;
use pipewright_core::domain::schedule::PipelineSchedule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDefinition {
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub schedules: Vec<PipelineSchedule>,
}

impl ProjectDefinition {
    /// Reads and validates a project file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let project: Self = serde_json::from_str(&content)?;
        project.validate()?;

        info!(
            "Loaded project {}: {} pipeline(s), {} schedule(s)",
            path.display(),
            project.pipelines.len(),
            project.schedules.len()
        );

        Ok(project)
    }

    /// Checks every pipeline and that every schedule targets a known pipeline
    pub fn validate(&self) -> Result<()> {
        let mut uuids = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline
                .validate()
                .map_err(|source| SchedulerError::InvalidPipeline {
                    pipeline: pipeline.uuid.clone(),
                    source,
                })?;
            uuids.insert(pipeline.uuid.as_str());
        }

        for schedule in &self.schedules {
            if !uuids.contains(schedule.pipeline_uuid.as_str()) {
                return Err(SchedulerError::PipelineNotFound(
                    schedule.pipeline_uuid.clone(),
                ));
            }
            schedule
                .interval()
                .map_err(|source| SchedulerError::InvalidSchedule {
                    schedule: schedule.name.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRunStore, RunStore};

    const PROJECT: &str = r#"{
        "pipelines": [
            {
                "uuid": "etl",
                "concurrency": 2,
                "blocks": [
                    { "uuid": "extract", "command": "echo extract" },
                    { "uuid": "load", "command": "echo load", "upstream_blocks": ["extract"], "retries": 2 }
                ]
            }
        ],
        "schedules": [
            { "name": "hourly etl", "pipeline_uuid": "etl", "schedule_interval": "@hourly" },
            { "name": "weekday etl", "pipeline_uuid": "etl", "schedule_interval": "30 6 * * 1-5", "status": "inactive" }
        ]
    }"#;

    #[tokio::test]
    async fn test_load_project_into_store() {
        let path = std::env::temp_dir().join(format!("pipewright-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, PROJECT).unwrap();

        let project = ProjectDefinition::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let store = InMemoryRunStore::from_project(project).unwrap();
        let pipeline = store.find_pipeline("etl").await.unwrap().unwrap();
        assert_eq!(pipeline.concurrency, Some(2));
        assert_eq!(pipeline.block("load").unwrap().retries, 2);

        let active = store.active_schedules().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "hourly etl");
    }

    #[test]
    fn test_schedule_for_unknown_pipeline() {
        let project: ProjectDefinition = serde_json::from_str(
            r#"{"schedules": [{"name": "s", "pipeline_uuid": "missing", "schedule_interval": "@daily"}]}"#,
        )
        .unwrap();

        assert!(matches!(
            project.validate(),
            Err(SchedulerError::PipelineNotFound(uuid)) if uuid == "missing"
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = ProjectDefinition::load(Path::new("/nonexistent/pipewright.json"));
        assert!(matches!(result, Err(SchedulerError::Io(_))));
    }
}
