//! Wire contract shared by the publishing and consuming services.
//!
//! Topic names and JSON field names must match existing deployments exactly.
//! Fields may be added but never removed or renamed; decoders ignore fields
//! they do not know.

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic names.
pub mod topics {
    pub const WORKOUT: &str = "workout";
    pub const PROGRESS: &str = "progress";
    /// Misspelled in the first deployment; kept for wire compatibility.
    pub const MANAGEMENT: &str = "managment";
}

/// A typed event bound to the topic it is published on.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic this event type is published to.
    const TOPIC: &'static str;

    /// Partition key. Events for one user share a key so their order is kept.
    fn key(&self) -> Vec<u8>;

    fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A user account was registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserCreated {
    pub user_id: Uuid,
    pub email: String,
}

impl DomainEvent for UserCreated {
    const TOPIC: &'static str = topics::MANAGEMENT;

    fn key(&self) -> Vec<u8> {
        self.user_id.to_string().into_bytes()
    }
}

/// A user finished a workout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkoutLogged {
    pub user_id: Uuid,
    pub started_at: DateTime<FixedOffset>,
    pub duration_minutes: i32,
}

impl DomainEvent for WorkoutLogged {
    const TOPIC: &'static str = topics::WORKOUT;

    fn key(&self) -> Vec<u8> {
        self.user_id.to_string().into_bytes()
    }
}

/// A user's progress score changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressUpdated {
    pub user_id: Uuid,
    pub timestamp: DateTime<FixedOffset>,
    pub score: i32,
}

impl DomainEvent for ProgressUpdated {
    const TOPIC: &'static str = topics::PROGRESS;

    fn key(&self) -> Vec<u8> {
        self.user_id.to_string().into_bytes()
    }
}

/// Topic and consumer group of a hosted consuming service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceProfile {
    pub service: &'static str,
    pub topic: &'static str,
    pub group_id: &'static str,
}

/// Consumer groups of the services that subscribe today.
pub const SERVICE_PROFILES: [ServiceProfile; 4] = [
    ServiceProfile {
        service: "fitcoach-workout",
        topic: topics::WORKOUT,
        group_id: "fitcoach-workout-consumer",
    },
    ServiceProfile {
        service: "fitcoach-progress",
        topic: topics::PROGRESS,
        group_id: "fitcoach-progress-consumer",
    },
    ServiceProfile {
        service: "fitcoach-user",
        topic: topics::MANAGEMENT,
        group_id: "fitcoach-user-consumer",
    },
    ServiceProfile {
        service: "msboilerplate",
        topic: topics::MANAGEMENT,
        group_id: "msboilerplate-consumer",
    },
];

/// Look up a service profile by service name.
pub fn profile(service: &str) -> Option<&'static ServiceProfile> {
    SERVICE_PROFILES.iter().find(|p| p.service == service)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Uuid {
        Uuid::parse_str("6f1c2a8e-3b9d-4c7e-8f21-0a5b4d3c2e1f").unwrap()
    }

    #[test]
    fn test_workout_logged_wire_format() {
        let event = WorkoutLogged {
            user_id: user(),
            started_at: DateTime::parse_from_rfc3339("2024-03-01T07:30:00+01:00").unwrap(),
            duration_minutes: 45,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&event.to_payload().unwrap()).unwrap();
        assert_eq!(json["UserId"], "6f1c2a8e-3b9d-4c7e-8f21-0a5b4d3c2e1f");
        assert_eq!(json["StartedAt"], "2024-03-01T07:30:00+01:00");
        assert_eq!(json["DurationMinutes"], 45);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = br#"{
            "UserId": "6f1c2a8e-3b9d-4c7e-8f21-0a5b4d3c2e1f",
            "Timestamp": "2024-03-01T07:30:00Z",
            "Score": 12,
            "Streak": 4
        }"#;
        let event = ProgressUpdated::from_payload(payload).unwrap();
        assert_eq!(event.score, 12);
        assert_eq!(event.user_id, user());
    }

    #[test]
    fn test_decode_missing_required_field_fails() {
        assert!(UserCreated::from_payload(br#"{"Email":"a@b.c"}"#).is_err());
        assert!(UserCreated::from_payload(b"not json").is_err());
    }

    #[test]
    fn test_events_key_by_user() {
        let created = UserCreated {
            user_id: user(),
            email: "a@b.c".to_string(),
        };
        assert_eq!(created.key(), user().to_string().into_bytes());
        assert_eq!(UserCreated::TOPIC, "managment");
        assert_eq!(WorkoutLogged::TOPIC, "workout");
        assert_eq!(ProgressUpdated::TOPIC, "progress");
    }

    #[test]
    fn test_service_profiles() {
        let user_svc = profile("fitcoach-user").unwrap();
        assert_eq!(user_svc.topic, topics::MANAGEMENT);
        assert_eq!(user_svc.group_id, "fitcoach-user-consumer");
        assert!(profile("unknown").is_none());

        let management_groups: Vec<_> = SERVICE_PROFILES
            .iter()
            .filter(|p| p.topic == topics::MANAGEMENT)
            .map(|p| p.group_id)
            .collect();
        assert_eq!(management_groups.len(), 2);
    }
}
