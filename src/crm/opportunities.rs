// Opportunity queries and mutations.
// Stage changes update the pipeline views speculatively and revert if the server refuses them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::Query;
use crate::cache::keys::{OPPORTUNITIES, dashboard};
use crate::engine::SyncEngine;
use crate::mutation::{MutationDefinition, Speculation};
use crate::transport::{Method, Payload, RequestBody, RequestOptions};

pub const ENDPOINT: &str = "/opportunities";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageChange {
    pub opportunity_id: String,
    pub stage: String,
}

impl StageChange {
    pub fn new(opportunity_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            opportunity_id: opportunity_id.into(),
            stage: stage.into(),
        }
    }
}

/// The unfiltered opportunity list.
pub fn list_query(engine: &SyncEngine) -> Query {
    engine.query(OPPORTUNITIES.list(Value::Null), ENDPOINT)
}

pub fn detail_query(engine: &SyncEngine, id: &str) -> Query {
    engine.query(OPPORTUNITIES.detail(id), format!("{ENDPOINT}/{id}"))
}

/// Move an opportunity to another pipeline stage.
pub fn update_stage() -> MutationDefinition<StageChange> {
    MutationDefinition::new("opportunities.update_stage", |transport, change: StageChange| async move {
        transport
            .send_json(
                &format!("{ENDPOINT}/{}", change.opportunity_id),
                Method::PATCH,
                json!({ "stage": change.stage }),
            )
            .await
    })
    .validate(|change| {
        if change.opportunity_id.trim().is_empty() {
            return Err("opportunity id is required".to_string());
        }
        if change.stage.trim().is_empty() {
            return Err("stage is required".to_string());
        }
        Ok(())
    })
    .speculate(|change| {
        let list_change = change.clone();
        let detail_stage = change.stage.clone();
        vec![
            Speculation::new(OPPORTUNITIES.list(Value::Null), move |list| {
                list.and_then(|list| {
                    with_stage(list, &list_change.opportunity_id, &list_change.stage)
                })
            }),
            Speculation::new(OPPORTUNITIES.detail(&change.opportunity_id), move |detail| {
                let mut detail = detail?.clone();
                detail.as_object_mut()?.insert("stage".into(), Value::String(detail_stage));
                Some(detail)
            }),
        ]
    })
    .reconcile(|change, response| match response {
        Value::Object(_) => vec![(OPPORTUNITIES.detail(&change.opportunity_id), response.clone())],
        _ => Vec::new(),
    })
    .invalidate(|_| vec![OPPORTUNITIES.all(), dashboard::pipeline()])
}

/// Delete an opportunity. It disappears from the list until the server answers.
pub fn delete() -> MutationDefinition<String> {
    MutationDefinition::new("opportunities.delete", |transport, id: String| async move {
        transport
            .send(
                &format!("{ENDPOINT}/{id}"),
                Method::DELETE,
                RequestBody::Empty,
                RequestOptions::new(),
            )
            .await
            .map(Payload::into_value)
    })
    .validate(|id| match id.trim().is_empty() {
        true => Err("opportunity id is required".to_string()),
        false => Ok(()),
    })
    .speculate(|id| {
        let id = id.clone();
        vec![Speculation::new(OPPORTUNITIES.list(Value::Null), move |list| {
            let rows = list?.as_array()?;
            let kept: Vec<Value> = rows.iter().filter(|row| !has_id(row, &id)).cloned().collect();
            (kept.len() != rows.len()).then(|| Value::Array(kept))
        })]
    })
    .invalidate(|_| vec![OPPORTUNITIES.all(), dashboard::all()])
}

fn has_id(row: &Value, id: &str) -> bool {
    match row.get("id") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}

/// Copy of `list` with the stage of row `id` replaced, or `None` if no row matches.
fn with_stage(list: &Value, id: &str, stage: &str) -> Option<Value> {
    let mut rows = list.as_array()?.clone();
    let row = rows.iter_mut().find(|row| has_id(row, id))?;
    row.as_object_mut()?.insert("stage".into(), Value::String(stage.to_string()));
    Some(Value::Array(rows))
}
