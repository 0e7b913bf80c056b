//! Parsing of stored SubscriptionTopic resources into [`TopicDefinition`]s.
//!
//! Parsing is strict: anything the matcher could misread (unknown codes,
//! triggers without a resource type) rejects the whole topic so the loader
//! can skip it and carry on with the rest.

use serde_json::Value;

use crate::error::TopicParseError;
use crate::types::{
    NotificationShape, QueryCriteria, QueryResultBehavior, TopicDefinition, TopicStatus, Trigger,
    TriggerInteraction,
};

const STRUCTURE_DEFINITION_PREFIX: &str = "http://hl7.org/fhir/StructureDefinition/";

/// Parse a SubscriptionTopic resource.
pub fn parse_topic(resource: &Value) -> Result<TopicDefinition, TopicParseError> {
    let id = resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(TopicParseError::MissingField("id"))?
        .to_string();

    let status_code = resource
        .get("status")
        .and_then(Value::as_str)
        .ok_or(TopicParseError::MissingField("status"))?;
    let status = TopicStatus::parse(status_code)
        .ok_or_else(|| TopicParseError::invalid_code("status", status_code))?;

    let url = resource.get("url").and_then(Value::as_str).map(str::to_string);
    let title = resource
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);

    let resource_triggers = parse_resource_triggers(resource)?;
    let notification_shape = parse_notification_shape(resource)?;

    Ok(TopicDefinition {
        id,
        url,
        title,
        status,
        resource_triggers,
        notification_shape,
    })
}

/// Parse the `resourceTrigger` array.
///
/// A FHIR trigger lists several interactions; each becomes its own
/// [`Trigger`] unless the list covers all three, which maps to `any`.
fn parse_resource_triggers(resource: &Value) -> Result<Vec<Trigger>, TopicParseError> {
    let triggers = resource
        .get("resourceTrigger")
        .and_then(Value::as_array)
        .filter(|arr| !arr.is_empty())
        .ok_or(TopicParseError::NoTriggers)?;

    let mut result = Vec::new();
    for (index, trigger) in triggers.iter().enumerate() {
        let resource_type = trigger
            .get("resource")
            .and_then(Value::as_str)
            .map(|r| r.strip_prefix(STRUCTURE_DEFINITION_PREFIX).unwrap_or(r))
            .filter(|r| !r.is_empty())
            .ok_or_else(|| TopicParseError::invalid_trigger(index, "missing resource"))?;

        let interactions = parse_interactions(trigger)
            .map_err(|code| TopicParseError::invalid_trigger(index, format!("unknown interaction '{code}'")))?;

        let criteria_expression = trigger
            .get("fhirPathCriteria")
            .and_then(Value::as_str)
            .map(str::to_string);

        let query_criteria = trigger
            .get("queryCriteria")
            .map(parse_query_criteria)
            .transpose()
            .map_err(|reason| TopicParseError::invalid_trigger(index, reason))?;

        let description = trigger
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        for interaction in interactions {
            result.push(Trigger {
                resource_type: resource_type.to_string(),
                interaction,
                criteria_expression: criteria_expression.clone(),
                query_criteria: query_criteria.clone(),
                description: description.clone(),
            });
        }
    }

    Ok(result)
}

/// Returns the unknown code on failure.
fn parse_interactions(trigger: &Value) -> Result<Vec<TriggerInteraction>, String> {
    let Some(codes) = trigger.get("supportedInteraction").and_then(Value::as_array) else {
        return Ok(vec![TriggerInteraction::Any]);
    };

    let mut interactions = Vec::with_capacity(codes.len());
    for code in codes {
        let code = code.as_str().unwrap_or_default();
        let interaction = TriggerInteraction::parse(code).ok_or_else(|| code.to_string())?;
        if !interactions.contains(&interaction) {
            interactions.push(interaction);
        }
    }

    if interactions.is_empty() || interactions.len() == 3 {
        Ok(vec![TriggerInteraction::Any])
    } else {
        Ok(interactions)
    }
}

fn parse_query_criteria(qc: &Value) -> Result<QueryCriteria, String> {
    let behavior = |field: &str| -> Result<QueryResultBehavior, String> {
        match qc.get(field).and_then(Value::as_str) {
            Some(code) => QueryResultBehavior::parse(code)
                .ok_or_else(|| format!("unknown {field} '{code}'")),
            None => Ok(QueryResultBehavior::default()),
        }
    };

    Ok(QueryCriteria {
        previous: qc.get("previous").and_then(Value::as_str).map(str::to_string),
        result_for_create: behavior("resultForCreate")?,
        current: qc.get("current").and_then(Value::as_str).map(str::to_string),
        result_for_delete: behavior("resultForDelete")?,
        require_both: qc
            .get("requireBoth")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// The topic's content level comes from the first `notificationShape` entry
/// that declares one.
fn parse_notification_shape(resource: &Value) -> Result<NotificationShape, TopicParseError> {
    let declared = resource
        .get("notificationShape")
        .and_then(Value::as_array)
        .and_then(|shapes| {
            shapes
                .iter()
                .find_map(|s| s.get("content").and_then(Value::as_str))
        });

    match declared {
        Some(code) => NotificationShape::parse(code)
            .ok_or_else(|| TopicParseError::invalid_code("notificationShape.content", code)),
        None => Ok(NotificationShape::default()),
    }
}
