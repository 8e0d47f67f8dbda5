//! Client-side reconstruction of the orchestrator's execution plan from update events.
//! Nothing here is authoritative; it only backs the optional plan view.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Planning,
    Executing,
    Completed,
    Failed,
    Replanning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanCondition {
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_: Option<bool>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanAsset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default, rename = "type")]
    pub asset_type: String,
    #[serde(default)]
    pub status: AssetStatus,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<PlanCondition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub target_type: String,
    #[serde(default)]
    pub overall_status: PlanStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub assets: Vec<PlanAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replan_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

impl ExecutionPlan {
    pub fn asset(&self, name: &str) -> Option<&PlanAsset> {
        self.assets.iter().find(|a| a.name == name)
    }

    fn asset_mut(&mut self, name: &str) -> Option<&mut PlanAsset> {
        self.assets.iter_mut().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanUpdateKind {
    PlanCreated,
    PlanUpdated,
    AssetStarted,
    AssetCompleted,
    AssetFailed,
    Replanning,
    PlanCompleted,
    PlanFailed,
}

pub fn is_plan_update_type(kind: &str) -> bool {
    crate::constants::PLAN_UPDATE_TYPES.contains(&kind)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetUpdate {
    pub name: String,
    #[serde(default)]
    pub status: Option<AssetStatus>,
    #[serde(default)]
    pub execution_time: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    #[serde(rename = "type")]
    pub kind: PlanUpdateKind,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub execution_time: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub asset_update: Option<AssetUpdate>,
}

impl PlanUpdate {
    /// Accepts any JSON object whose `type` names a plan update.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let kind = value.get("type").and_then(|t| t.as_str())?;
        if !is_plan_update_type(kind) {
            return None;
        }
        match serde_json::from_value(value.clone()) {
            Ok(update) => Some(update),
            Err(e) => {
                tracing::warn!("Malformed plan update ({}): {}", kind, e);
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct PlanTracker {
    current: Option<ExecutionPlan>,
}

impl PlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ExecutionPlan> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Folds one event into the plan. Returns false when the event could not apply,
    /// e.g. an asset event before any plan exists.
    pub fn apply(&mut self, update: PlanUpdate) -> bool {
        let now = update
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        if let Some(incoming) = update.plan.clone() {
            match self.current.as_mut() {
                Some(existing) if existing.id == incoming.id => {
                    let created_at = existing.created_at;
                    *existing = incoming;
                    if existing.created_at == 0 {
                        existing.created_at = created_at;
                    }
                }
                _ => self.current = Some(incoming),
            }
        }

        let Some(plan) = self.current.as_mut() else {
            tracing::debug!("Plan update {:?} ignored: no current plan", update.kind);
            return false;
        };

        let applied = match update.kind {
            PlanUpdateKind::PlanCreated | PlanUpdateKind::PlanUpdated => update.plan.is_some(),
            PlanUpdateKind::AssetStarted => {
                let Some(name) = update.asset.as_deref() else {
                    return false;
                };
                if plan.overall_status == PlanStatus::Planning
                    || plan.overall_status == PlanStatus::Replanning
                {
                    plan.overall_status = PlanStatus::Executing;
                }
                plan.current_step = Some(name.to_string());
                match plan.asset_mut(name) {
                    Some(asset) => {
                        asset.status = AssetStatus::InProgress;
                        asset.start_time = Some(now);
                        asset.error = None;
                        true
                    }
                    None => false,
                }
            }
            PlanUpdateKind::AssetCompleted => {
                let Some(name) = update.asset.as_deref() else {
                    return false;
                };
                match plan.asset_mut(name) {
                    Some(asset) => {
                        asset.status = AssetStatus::Completed;
                        asset.end_time = Some(now);
                        asset.execution_time = update
                            .execution_time
                            .or_else(|| asset.start_time.map(|start| now - start));
                        true
                    }
                    None => false,
                }
            }
            PlanUpdateKind::AssetFailed => {
                let Some(name) = update.asset.as_deref() else {
                    return false;
                };
                match plan.asset_mut(name) {
                    Some(asset) => {
                        asset.status = AssetStatus::Failed;
                        asset.end_time = Some(now);
                        asset.error = update.error.clone();
                        true
                    }
                    None => false,
                }
            }
            PlanUpdateKind::Replanning => {
                plan.overall_status = PlanStatus::Replanning;
                plan.replan_reason = update.reason.clone();
                plan.attempt = update.attempt.unwrap_or(plan.attempt + 1);
                true
            }
            PlanUpdateKind::PlanCompleted => {
                plan.overall_status = PlanStatus::Completed;
                plan.current_step = None;
                true
            }
            PlanUpdateKind::PlanFailed => {
                plan.overall_status = PlanStatus::Failed;
                plan.error = update.error.clone();
                true
            }
        };

        if let Some(asset_update) = update.asset_update {
            if let Some(asset) = plan.asset_mut(&asset_update.name) {
                if let Some(status) = asset_update.status {
                    asset.status = status;
                }
                if asset_update.execution_time.is_some() {
                    asset.execution_time = asset_update.execution_time;
                }
                if asset_update.error.is_some() {
                    asset.error = asset_update.error;
                }
                if asset_update.result.is_some() {
                    asset.result = asset_update.result;
                }
            }
        }

        plan.updated_at = now;
        applied
    }
}
