use serde::Serialize;

pub const RESOURCE_API_ENDPOINT: &str = "API_ENDPOINT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Test,
    Execute,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub actor_id: String,
    pub action: AuditAction,
    pub resource: &'static str,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(actor_id: &str, action: AuditAction, resource_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action,
            resource: RESOURCE_API_ENDPOINT,
            resource_id: resource_id.to_string(),
            before_state: None,
            after_state: None,
        }
    }

    pub fn before(mut self, state: impl Serialize) -> Self {
        self.before_state = self.capture("before", state);
        self
    }

    pub fn after(mut self, state: impl Serialize) -> Self {
        self.after_state = self.capture("after", state);
        self
    }

    fn capture(&self, which: &str, state: impl Serialize) -> Option<serde_json::Value> {
        match serde_json::to_value(state) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    "Dropping {} state of {:?} audit event for {}: {}",
                    which,
                    self.action,
                    self.resource_id,
                    e
                );
                None
            }
        }
    }
}

/// Receives audit events. Persistence is up to the implementation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as a JSON line on the `audit` tracing target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => tracing::info!(
                target: "audit",
                actor = %event.actor_id,
                action = ?event.action,
                resource_id = %event.resource_id,
                "{}",
                line
            ),
            Err(e) => tracing::warn!("Failed to serialize audit event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_upper_case_action_and_optional_states() {
        let event = AuditEvent::new("user-1", AuditAction::Execute, "ep-1")
            .after(serde_json::json!({"statusCode": 200}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "EXECUTE");
        assert_eq!(json["resource"], "API_ENDPOINT");
        assert_eq!(json["actorId"], "user-1");
        assert_eq!(json["afterState"]["statusCode"], 200);
        assert!(json.get("beforeState").is_none());
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not representable"))
        }
    }

    #[test]
    fn unserializable_state_is_dropped_without_losing_the_event() {
        let event = AuditEvent::new("user-1", AuditAction::Update, "ep-1")
            .before(Unserializable)
            .after(serde_json::json!({"name": "renamed"}));
        assert!(event.before_state.is_none());
        assert_eq!(event.after_state.unwrap()["name"], "renamed");
        assert_eq!(event.action, AuditAction::Update);
    }
}
