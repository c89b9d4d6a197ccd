//! Loki push and query payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `POST /push` body.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushRequest {
    /// Streams to append to.
    pub streams: Vec<PushStream>,
}

/// Lines appended to one stream.
#[derive(Debug, Clone, Serialize)]
pub struct PushStream {
    /// Stream labels.
    pub stream: BTreeMap<String, String>,
    /// `[timestamp in ns as a string, line]` pairs.
    pub values: Vec<[String; 2]>,
}

/// `GET /query_range` response.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    /// `success` or `error`.
    pub status: String,
    /// Result payload.
    pub data: QueryData,
}

/// Result payload of a query.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryData {
    /// `streams` for log queries.
    #[serde(rename = "resultType")]
    pub result_type: String,
    /// Matching streams.
    #[serde(default)]
    pub result: Vec<StreamResult>,
}

/// Lines of one matching stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamResult {
    /// Stream labels, including those extracted by the query.
    #[serde(default)]
    pub stream: BTreeMap<String, String>,
    /// `(timestamp in ns, line)` pairs.
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_shape() {
        let request = PushRequest {
            streams: vec![PushStream {
                stream: [("service".to_string(), "rating".to_string())].into(),
                values: vec![["1704070800000000000".to_string(), "{}".to_string()]],
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "streams": [{
                    "stream": { "service": "rating" },
                    "values": [["1704070800000000000", "{}"]],
                }]
            })
        );
    }

    #[test]
    fn query_response_decodes_streams() {
        let response: QueryResponse = serde_json::from_value(json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [{
                    "stream": { "project_id": "p1" },
                    "values": [["1704070800000000000", "{\"type\":\"compute\"}"]],
                }],
                "stats": {},
            }
        }))
        .unwrap();
        assert_eq!(response.data.result_type, "streams");
        assert_eq!(response.data.result[0].values[0].1, "{\"type\":\"compute\"}");
    }
}
