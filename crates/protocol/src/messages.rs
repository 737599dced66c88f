use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Session payloads
// ---------------------------------------------------------------------------

/// Parameters of `kolibri.login`.
///
/// `client` is the session identifier returned by an earlier login; sending
/// it back resumes that session on the broker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `kolibri.login`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Node payloads
// ---------------------------------------------------------------------------

/// A node addressed by path, with any further protocol fields kept opaque.
///
/// Used as the element type of read, subscribe and unsubscribe params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePath {
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            extra: Map::new(),
        }
    }
}

pub type ReadParams = NodePath;
pub type SubscribeParams = NodePath;
pub type UnsubscribeParams = NodePath;

/// A single node value in a `kolibri.write` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteNode {
    pub path: String,
    pub quality: u8,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of an outbound `kolibri.write`.
///
/// `tid` is set when the write is staged as part of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteParams {
    pub nodes: Vec<WriteNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<u64>,
}

/// Parameters of `kolibri.commit` and `kolibri.cancel`, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParams {
    pub tid: u64,
}

/// Parameters of an inbound `kolibri.write` notification.
///
/// Node changes are partial records; the client merges them onto the
/// properties it cached at subscribe time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteNotifyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<u64>,
    pub nodes: Vec<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_params_keep_unknown_fields() {
        let value = json!({
            "user": "kolibro_01",
            "password": "secret",
            "interval": 60,
            "timeout": 5,
            "lang": "en"
        });
        let params: LoginParams = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(params.user, "kolibro_01");
        assert_eq!(params.interval, Some(60));
        assert!(params.client.is_none());
        assert_eq!(params.extra.get("lang"), Some(&json!("en")));
        assert_eq!(serde_json::to_value(&params).unwrap(), value);
    }

    #[test]
    fn login_result_client_is_optional() {
        let result: LoginResult = serde_json::from_value(json!({"client": "c-1"})).unwrap();
        assert_eq!(result.client.as_deref(), Some("c-1"));
        let result: LoginResult = serde_json::from_value(json!({})).unwrap();
        assert!(result.client.is_none());
    }

    #[test]
    fn write_params_omit_missing_tid() {
        let params = WriteParams {
            nodes: vec![WriteNode {
                path: "/a".into(),
                quality: 1,
                extra: Map::new(),
            }],
            tid: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("tid").is_none());
        assert_eq!(json["nodes"][0]["quality"], 1);
    }

    #[test]
    fn write_notify_params_parse_partial_nodes() {
        let params: WriteNotifyParams = serde_json::from_value(json!({
            "tid": 9,
            "nodes": [{"path": "/a", "value": 3}]
        }))
        .unwrap();
        assert_eq!(params.tid, Some(9));
        assert_eq!(params.nodes[0]["value"], 3);
    }

    #[test]
    fn node_path_flattens_extra() {
        let node: NodePath =
            serde_json::from_value(json!({"path": "/x", "dataType": 1})).unwrap();
        assert_eq!(node.path, "/x");
        assert_eq!(node.extra["dataType"], 1);
        assert_eq!(NodePath::new("/y").extra.len(), 0);
    }
}
