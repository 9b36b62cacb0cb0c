//! The live-connection descriptor stored in a package's `Connections` entry.
//!
//! The layout and every constant below are dictated by the PowerBI service, which only accepts a
//! package whose descriptor matches these strings exactly. They are not tunable.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// Schema version written in the top-level `Version` field.
pub const CONNECTIONS_FORMAT_VERSION: u32 = 3;

/// Logical name of the single live connection.
pub const CONNECTION_NAME: &str = "EntityDataSource";

/// `Data Source` of a live connection to the hosted service.
pub const DATA_SOURCE: &str = "pbiazure://api.powerbi.com";

/// Identity provider authority, resource and client id, in the order the service expects them
/// inside the quoted `Identity Provider` value. The client id is the service's well-known
/// application id, not ours.
pub const IDENTITY_PROVIDER_AUTHORITY: &str = "https://login.microsoftonline.com/common";
pub const IDENTITY_PROVIDER_RESOURCE: &str = "https://analysis.windows.net/powerbi/api";
pub const IDENTITY_PROVIDER_CLIENT_ID: &str = "929d0ec0-7a41-4b1e-bc7c-b754a28bddcc";

/// `Integrated Security` mode for service-issued claims tokens.
pub const INTEGRATED_SECURITY: &str = "ClaimsToken";

/// Connection mode identifying a live connection to a hosted dataset.
pub const CONNECTION_TYPE: &str = "pbiServiceLive";

/// Service-side model versioning id. Opaque to us; the service rejects other values.
pub const PBI_SERVICE_MODEL_ID: u64 = 6_140_720;

/// Virtual server name the service resolves live connections against.
pub const PBI_MODEL_VIRTUAL_SERVER_NAME: &str = "sobe_wowvirtualserver";

const DATA_SOURCE_KEY: &str = "Data Source";
const INITIAL_CATALOG_KEY: &str = "Initial Catalog";
const IDENTITY_PROVIDER_KEY: &str = "Identity Provider";
const INTEGRATED_SECURITY_KEY: &str = "Integrated Security";

/// A live connection binding a package to one workspace and one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub format_version: u32,
    pub connection_name: String,
    pub connection_string: String,
    pub connection_type: String,
    pub service_model_id: u64,
    pub virtual_server_name: String,
    pub database_name: String,
}

#[derive(Serialize, Deserialize)]
struct ConnectionsDocument<'a> {
    #[serde(rename = "Version")]
    version: u32,
    #[serde(rename = "Connections", borrow)]
    connections: Vec<ConnectionRecord<'a>>,
}

#[derive(Serialize, Deserialize)]
struct ConnectionRecord<'a> {
    #[serde(rename = "Name", borrow)]
    name: Cow<'a, str>,
    #[serde(rename = "ConnectionString", borrow)]
    connection_string: Cow<'a, str>,
    #[serde(rename = "ConnectionType", borrow)]
    connection_type: Cow<'a, str>,
    #[serde(rename = "PbiServiceModelId")]
    service_model_id: u64,
    #[serde(rename = "PbiModelVirtualServerName", borrow)]
    virtual_server_name: Cow<'a, str>,
    #[serde(rename = "PbiModelDatabaseName", borrow)]
    database_name: Cow<'a, str>,
}

impl ConnectionDescriptor {
    /// Build the descriptor for `dataset_id` in `workspace_id`.
    ///
    /// Identifiers are embedded as given; the service validates them on upload.
    pub fn new(workspace_id: &str, dataset_id: &str) -> Self {
        Self {
            format_version: CONNECTIONS_FORMAT_VERSION,
            connection_name: CONNECTION_NAME.to_string(),
            connection_string: live_connection_string(workspace_id),
            connection_type: CONNECTION_TYPE.to_string(),
            service_model_id: PBI_SERVICE_MODEL_ID,
            virtual_server_name: PBI_MODEL_VIRTUAL_SERVER_NAME.to_string(),
            database_name: dataset_id.to_string(),
        }
    }

    /// Serialize to the entry payload: compact UTF-8 JSON, fields in a fixed order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let doc = ConnectionsDocument {
            version: self.format_version,
            connections: vec![ConnectionRecord {
                name: self.connection_name.as_str().into(),
                connection_string: self.connection_string.as_str().into(),
                connection_type: self.connection_type.as_str().into(),
                service_model_id: self.service_model_id,
                virtual_server_name: self.virtual_server_name.as_str().into(),
                database_name: self.database_name.as_str().into(),
            }],
        };
        serde_json::to_vec(&doc).expect("strings and integers always serialize")
    }

    /// Decode an entry payload. A leading UTF-8 byte order mark is tolerated, unknown fields are
    /// ignored, and exactly one connection is required.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let doc: ConnectionsDocument<'_> = serde_json::from_slice(bytes)?;
        let mut connections = doc.connections.into_iter();
        let (Some(record), None) = (connections.next(), connections.next()) else {
            return Err(FormatError::Descriptor(
                "expected exactly one connection".to_string(),
            ));
        };
        Ok(Self {
            format_version: doc.version,
            connection_name: record.name.into_owned(),
            connection_string: record.connection_string.into_owned(),
            connection_type: record.connection_type.into_owned(),
            service_model_id: record.service_model_id,
            virtual_server_name: record.virtual_server_name.into_owned(),
            database_name: record.database_name.into_owned(),
        })
    }

    /// The workspace this descriptor points at (the connection string's `Initial Catalog`).
    pub fn workspace_id(&self) -> Option<String> {
        connection_string_value(&self.connection_string, INITIAL_CATALOG_KEY)
    }

    /// The dataset this descriptor points at.
    pub fn dataset_id(&self) -> &str {
        &self.database_name
    }
}

/// Build the connection string for a live connection to `workspace_id`.
pub fn live_connection_string(workspace_id: &str) -> String {
    format!(
        "{DATA_SOURCE_KEY}={DATA_SOURCE};\
         {INITIAL_CATALOG_KEY}={workspace_id};\
         {IDENTITY_PROVIDER_KEY}=\"{IDENTITY_PROVIDER_AUTHORITY}, {IDENTITY_PROVIDER_RESOURCE}, {IDENTITY_PROVIDER_CLIENT_ID}\";\
         {INTEGRATED_SECURITY_KEY}={INTEGRATED_SECURITY}"
    )
}

/// Split a `key=value;key="quoted;value"` connection string into trimmed pairs.
///
/// Semicolons inside double quotes do not end a pair; `""` inside quotes is a literal quote.
/// Segments without `=` are skipped.
pub fn parse_connection_string(s: &str) -> Vec<(String, String)> {
    fn flush(segment: &mut String, pairs: &mut Vec<(String, String)>) {
        if let Some((key, value)) = segment.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                pairs.push((key.to_string(), unquote(value.trim())));
            }
        }
        segment.clear();
    }

    let mut pairs = Vec::new();
    let mut segment = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                segment.push_str("\"\"");
                chars.next();
            }
            '"' => {
                in_quotes = !in_quotes;
                segment.push(c);
            }
            ';' if !in_quotes => flush(&mut segment, &mut pairs),
            _ => segment.push(c),
        }
    }
    flush(&mut segment, &mut pairs);
    pairs
}

fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => value.to_string(),
    }
}

/// Look up `key` (ASCII case-insensitive) in a connection string.
pub fn connection_string_value(s: &str, key: &str) -> Option<String> {
    parse_connection_string(s)
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// The identifiers an existing package is bound to, as read back from its `Connections` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBinding {
    pub workspace_id: Option<String>,
    pub dataset_id: String,
    pub descriptor: ConnectionDescriptor,
}

impl From<ConnectionDescriptor> for ConnectionBinding {
    fn from(descriptor: ConnectionDescriptor) -> Self {
        Self {
            workspace_id: descriptor.workspace_id(),
            dataset_id: descriptor.database_name.clone(),
            descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn serializes_exact_service_layout() {
        let bytes = ConnectionDescriptor::new("ws-123", "ds-456").to_bytes();
        let expected = concat!(
            r#"{"Version":3,"Connections":[{"Name":"EntityDataSource","#,
            r#""ConnectionString":"Data Source=pbiazure://api.powerbi.com;Initial Catalog=ws-123;"#,
            r#"Identity Provider=\"https://login.microsoftonline.com/common, "#,
            r#"https://analysis.windows.net/powerbi/api, 929d0ec0-7a41-4b1e-bc7c-b754a28bddcc\";"#,
            r#"Integrated Security=ClaimsToken","#,
            r#""ConnectionType":"pbiServiceLive","PbiServiceModelId":6140720,"#,
            r#""PbiModelVirtualServerName":"sobe_wowvirtualserver","#,
            r#""PbiModelDatabaseName":"ds-456"}]}"#,
        );
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = ConnectionDescriptor::new("ws-123", "ds-456").to_bytes();
        let b = ConnectionDescriptor::new("ws-123", "ds-456").to_bytes();
        assert_eq!(a, b);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let descriptor = ConnectionDescriptor::new("ws-123", "ds-456");
        let decoded = ConnectionDescriptor::from_bytes(&descriptor.to_bytes()).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.workspace_id().as_deref(), Some("ws-123"));
        assert_eq!(decoded.dataset_id(), "ds-456");
    }

    #[test]
    fn decodes_with_bom_and_unknown_fields() {
        let json = concat!(
            "\u{feff}",
            r#"{"Version":3,"Extra":true,"Connections":[{"Name":"EntityDataSource","#,
            r#""ConnectionString":"data source=x;initial catalog=\"my;ws\"","#,
            r#""ConnectionType":"pbiServiceLive","PbiServiceModelId":1,"#,
            r#""PbiModelVirtualServerName":"v","PbiModelDatabaseName":"d","Other":1}]}"#,
        );
        let descriptor = ConnectionDescriptor::from_bytes(json.as_bytes()).unwrap();
        let binding = ConnectionBinding::from(descriptor);
        assert_eq!(binding.workspace_id.as_deref(), Some("my;ws"));
        assert_eq!(binding.dataset_id, "d");
    }

    #[test]
    fn rejects_zero_or_many_connections() {
        let empty = br#"{"Version":3,"Connections":[]}"#;
        assert!(matches!(
            ConnectionDescriptor::from_bytes(empty),
            Err(FormatError::Descriptor(_))
        ));

        let one = ConnectionDescriptor::new("w", "d").to_bytes();
        let mut doc: serde_json::Value = serde_json::from_slice(&one).unwrap();
        let conn = doc["Connections"][0].clone();
        doc["Connections"].as_array_mut().unwrap().push(conn);
        let two = serde_json::to_vec(&doc).unwrap();
        assert!(matches!(
            ConnectionDescriptor::from_bytes(&two),
            Err(FormatError::Descriptor(_))
        ));
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            ConnectionDescriptor::from_bytes(b"not json"),
            Err(FormatError::Json(_))
        ));
    }

    #[test]
    fn parses_quoted_connection_string_values() {
        let pairs = parse_connection_string(&live_connection_string("ws-1"));
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "Data Source",
                "Initial Catalog",
                "Identity Provider",
                "Integrated Security"
            ]
        );
        assert_eq!(
            pairs[2].1,
            format!(
                "{IDENTITY_PROVIDER_AUTHORITY}, {IDENTITY_PROVIDER_RESOURCE}, {IDENTITY_PROVIDER_CLIENT_ID}"
            )
        );
        assert_eq!(
            connection_string_value("A=1;;b = \"x\"\"y\" ;junk", "B").as_deref(),
            Some("x\"y")
        );
    }
}
