use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use rescheduler::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

fn default_date_range() -> String {
    "last-30-days".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub report_type: String,
    #[serde(default = "default_date_range")]
    pub date_range: String,
}

impl ReportData {
    pub fn new(report_type: impl Into<String>) -> Self {
        Self {
            report_type: report_type.into(),
            date_range: default_date_range(),
        }
    }
}

/// A slow job limited to two concurrent runs.
pub struct GenerateReport {
    clock: Arc<dyn Clock>,
}

impl GenerateReport {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Handler for GenerateReport {
    type Data = ReportData;
    const NAME: &'static str = "generate-report";
    const CONCURRENCY: Option<u32> = Some(2);

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
        let ReportData {
            report_type,
            date_range,
        } = job.data;
        tracing::info!(job_id = %job.id, "Generating {report_type} report for {date_range}");
        self.clock.sleep(TimeDelta::seconds(5)).await;

        let generated_at = self.clock.now().timestamp_millis();
        ExecutionResult::with_result(json!({
            "path": format!("/reports/{report_type}_{generated_at}.pdf"),
            "size": "2.5MB",
        }))
    }
}
