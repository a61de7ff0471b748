//! Fixed audit-event schema.
//!
//! Mirrors the activity-logging service's published record shape. The
//! schema is fully static: every field is optional (permissive parse),
//! unknown fields are ignored, and a shape mismatch quarantines the
//! record instead of triggering any re-inference. Partition-column types
//! therefore never drift across files.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Batch envelope: raw files wrap events in a named `Records` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordBatch {
    /// The wrapped audit events. `None` when the envelope field is absent.
    #[serde(rename = "Records")]
    pub records: Option<Vec<AuditEvent>>,
}

/// One logged action against cloud resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditEvent {
    /// Record format version published by the logging service.
    pub event_version: Option<String>,
    /// The identity that performed the action.
    pub user_identity: Option<UserIdentity>,
    /// Event timestamp as recorded (RFC 3339 string).
    pub event_time: Option<String>,
    /// Service endpoint the action was issued against.
    pub event_source: Option<String>,
    /// The API action name.
    pub event_name: Option<String>,
    /// Region recorded in the payload. Not trusted for partitioning;
    /// the resolver-derived region always wins.
    pub aws_region: Option<String>,
    /// Source IP of the caller.
    pub source_ip_address: Option<String>,
    /// Caller user agent.
    pub user_agent: Option<String>,
    /// Error code, when the action failed.
    pub error_code: Option<String>,
    /// Error message, when the action failed.
    pub error_message: Option<String>,
    /// Request payload (opaque).
    pub request_parameters: Option<Value>,
    /// Response payload (opaque).
    pub response_elements: Option<Value>,
    /// Additional service-specific data (opaque).
    pub additional_event_data: Option<Value>,
    /// Request identifier.
    pub request_id: Option<String>,
    /// Globally unique event identifier.
    #[serde(rename = "eventID")]
    pub event_id: Option<String>,
    /// Resources affected by the action.
    pub resources: Option<Vec<Resource>>,
    /// Event type classifier.
    pub event_type: Option<String>,
    /// API version of the acted-on service.
    pub api_version: Option<String>,
    /// Whether the action was read-only.
    pub read_only: Option<Value>,
    /// Account that received the event.
    pub recipient_account_id: Option<String>,
    /// Service event payload (opaque).
    pub service_event_details: Option<Value>,
    /// Shared event identifier across accounts.
    #[serde(rename = "sharedEventID")]
    pub shared_event_id: Option<String>,
    /// VPC endpoint the request traversed, if any.
    pub vpc_endpoint_id: Option<String>,
    /// TLS connection details.
    pub tls_details: Option<TlsDetails>,
    /// Whether this is a management event.
    pub management_event: Option<Value>,
    /// Event category (Management, Data, ...).
    pub event_category: Option<String>,
    /// Owning account of the VPC endpoint.
    pub vpc_endpoint_account_id: Option<String>,
}

/// Nested actor identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserIdentity {
    /// Identity type (IAMUser, AssumedRole, ...).
    #[serde(rename = "type")]
    pub identity_type: Option<String>,
    /// Principal identifier.
    pub principal_id: Option<String>,
    /// Full ARN of the identity.
    pub arn: Option<String>,
    /// Owning account.
    pub account_id: Option<String>,
    /// Service that made the call on the identity's behalf.
    pub invoked_by: Option<String>,
    /// Access key used.
    pub access_key_id: Option<String>,
    /// Friendly user name.
    pub user_name: Option<String>,
    /// Session details for temporary credentials.
    pub session_context: Option<SessionContext>,
}

/// Session context for temporary-credential identities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionContext {
    /// Session attributes.
    pub attributes: Option<SessionAttributes>,
    /// The entity that issued the session.
    pub session_issuer: Option<SessionIssuer>,
    /// EC2 role delivery version.
    pub ec2_role_delivery: Option<String>,
    /// Web identity federation details.
    pub web_id_federation_data: Option<WebIdFederationData>,
}

/// Attributes of a credential session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionAttributes {
    /// Whether MFA was used.
    pub mfa_authenticated: Option<String>,
    /// Session creation time.
    pub creation_date: Option<String>,
}

/// The entity that issued a credential session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionIssuer {
    /// Issuer type.
    #[serde(rename = "type")]
    pub issuer_type: Option<String>,
    /// Principal identifier of the issuer.
    pub principal_id: Option<String>,
    /// Full ARN of the issuer.
    pub arn: Option<String>,
    /// Owning account.
    pub account_id: Option<String>,
    /// Issuer user name.
    pub username: Option<String>,
}

/// Web identity federation details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebIdFederationData {
    /// The federated identity provider.
    pub federated_provider: Option<String>,
    /// Provider attributes.
    pub attributes: Option<Value>,
}

/// A resource affected by an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    /// Resource ARN.
    pub arn: Option<String>,
    /// Owning account.
    pub account_id: Option<String>,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
}

/// TLS connection details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsDetails {
    /// Negotiated TLS version.
    pub tls_version: Option<String>,
    /// Negotiated cipher suite.
    pub cipher_suite: Option<String>,
    /// Host header supplied by the client.
    pub client_provided_host_header: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_wrapped_batch() {
        let doc = r#"{
            "Records": [
                {
                    "eventVersion": "1.08",
                    "eventTime": "2025-08-24T12:00:00Z",
                    "eventSource": "s3.amazonaws.com",
                    "eventName": "GetObject",
                    "awsRegion": "us-east-1",
                    "eventID": "abc-123",
                    "sharedEventID": "def-456",
                    "userIdentity": {
                        "type": "IAMUser",
                        "principalId": "AIDA123",
                        "sessionContext": {
                            "attributes": {"mfaAuthenticated": "true"}
                        }
                    },
                    "resources": [{"arn": "arn:aws:s3:::b", "type": "AWS::S3::Bucket"}]
                }
            ]
        }"#;

        let batch: RecordBatch = serde_json::from_str(doc).expect("parse");
        let records = batch.records.expect("records present");
        assert_eq!(records.len(), 1);

        let event = &records[0];
        assert_eq!(event.event_name.as_deref(), Some("GetObject"));
        assert_eq!(event.event_id.as_deref(), Some("abc-123"));
        assert_eq!(event.shared_event_id.as_deref(), Some("def-456"));
        let identity = event.user_identity.as_ref().expect("identity");
        assert_eq!(identity.identity_type.as_deref(), Some("IAMUser"));
        let attrs = identity
            .session_context
            .as_ref()
            .and_then(|c| c.attributes.as_ref())
            .expect("attributes");
        assert_eq!(attrs.mfa_authenticated.as_deref(), Some("true"));
    }

    #[test]
    fn test_missing_envelope_field_is_none() {
        let batch: RecordBatch = serde_json::from_str(r#"{"eventName": "x"}"#).expect("parse");
        assert!(batch.records.is_none());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let event: AuditEvent =
            serde_json::from_str(r#"{"eventName": "PutObject", "futureField": {"a": 1}}"#)
                .expect("parse");
        assert_eq!(event.event_name.as_deref(), Some("PutObject"));
    }

    #[test]
    fn test_read_only_accepts_string_and_bool() {
        // The logging service has emitted both over time.
        let a: AuditEvent = serde_json::from_str(r#"{"readOnly": "true"}"#).unwrap();
        let b: AuditEvent = serde_json::from_str(r#"{"readOnly": false}"#).unwrap();
        assert!(a.read_only.is_some());
        assert!(b.read_only.is_some());
    }

    #[test]
    fn test_opaque_payloads_survive_roundtrip() {
        let doc = r#"{"requestParameters": {"bucketName": "b", "nested": [1, 2]}}"#;
        let event: AuditEvent = serde_json::from_str(doc).unwrap();
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["requestParameters"]["bucketName"], "b");
    }
}
