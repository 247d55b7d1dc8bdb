//! DynamoDB-backed stores over the JSON wire protocol.
//!
//! Tables:
//! - `access_requests`, partition key `requestId`
//! - `temp_access`, partition key `userId`, sort key `bucket`
//!
//! Records are converted through `serde_json` and then into DynamoDB
//! attribute values, so the on-table names are the serde names of
//! [`AccessRequest`] and [`AccessGrant`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{
    AccessGrant, AccessRequest, GrantStore, RequestStatus, RequestStore, StatusUpdate, StoreError,
    Transition,
};
use crate::Result;
use crate::aws::{AwsClient, AwsCredentials};
use crate::config::StoreConfig;

const TARGET_PREFIX: &str = "DynamoDB_20120810";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const CONDITION_FAILED: &str = "ConditionalCheckFailedException";

/// Failure of a single DynamoDB call.
enum CallError {
    /// A condition expression did not hold; carries the old item when
    /// `ReturnValuesOnConditionCheckFailure=ALL_OLD` was requested.
    ConditionFailed(Option<Value>),
    Store(StoreError),
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<CallError> for StoreError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::ConditionFailed(_) => Self::Unavailable("unexpected condition failure".to_string()),
            CallError::Store(e) => e,
        }
    }
}

/// Signed DynamoDB JSON client shared by both stores.
pub struct DynamoClient {
    aws: AwsClient,
}

impl DynamoClient {
    /// Build a client from the store configuration.
    ///
    /// `default_region` is used when `store.region` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if base credentials are missing or the
    /// endpoint is invalid.
    pub fn from_config(config: &StoreConfig, default_region: &str) -> Result<Self> {
        let region = config.region.as_deref().unwrap_or(default_region);
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://dynamodb.{region}.amazonaws.com"));
        let aws = AwsClient::new(
            "dynamodb",
            region,
            &endpoint,
            AwsCredentials::from_env()?,
            config.timeout,
        )?;
        Ok(Self { aws })
    }

    async fn call(&self, operation: &str, body: &Value) -> std::result::Result<Value, CallError> {
        let target = format!("{TARGET_PREFIX}.{operation}");
        let payload = serde_json::to_vec(body)
            .map_err(|e| StoreError::Unavailable(format!("encode {operation}: {e}")))?;

        let response = self
            .aws
            .post(
                &[("content-type", CONTENT_TYPE), ("x-amz-target", &target)],
                payload,
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("{operation}: {e}")))?;

        let parsed: Value = if response.body.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&response.body)
                .map_err(|e| StoreError::Corrupt(format!("{operation} response: {e}")))?
        };

        if response.status.is_success() {
            return Ok(parsed);
        }

        let error_type = parsed
            .get("__type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if error_type.ends_with(CONDITION_FAILED) {
            return Err(CallError::ConditionFailed(parsed.get("Item").cloned()));
        }
        let message = parsed
            .get("message")
            .or_else(|| parsed.get("Message"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Err(CallError::Store(StoreError::Unavailable(format!(
            "{operation} failed with HTTP {}: {error_type} {message}",
            response.status.as_u16()
        ))))
    }
}

/// Request store on the `access_requests` table.
pub struct DynamoRequestStore {
    client: Arc<DynamoClient>,
    table: String,
}

impl DynamoRequestStore {
    /// Create a store over `table`.
    #[must_use]
    pub fn new(client: Arc<DynamoClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl RequestStore for DynamoRequestStore {
    async fn insert(&self, request: &AccessRequest) -> std::result::Result<(), StoreError> {
        let body = json!({
            "TableName": self.table,
            "Item": to_item(request)?,
            "ConditionExpression": "attribute_not_exists(requestId)",
        });
        match self.client.call("PutItem", &body).await {
            Ok(_) => Ok(()),
            Err(CallError::ConditionFailed(_)) => Err(StoreError::Duplicate(request.id.clone())),
            Err(CallError::Store(e)) => Err(e),
        }
    }

    async fn get(&self, id: &str) -> std::result::Result<Option<AccessRequest>, StoreError> {
        let body = json!({
            "TableName": self.table,
            "Key": { "requestId": { "S": id } },
            "ConsistentRead": true,
        });
        let response = self.client.call("GetItem", &body).await?;
        response.get("Item").map(from_item).transpose()
    }

    async fn transition(
        &self,
        id: &str,
        expected: RequestStatus,
        update: StatusUpdate,
    ) -> std::result::Result<Transition, StoreError> {
        let mut values = Map::new();
        values.insert(":from".to_string(), json!({ "S": expected.as_str() }));
        values.insert(":to".to_string(), json!({ "S": update.status.as_str() }));

        let mut set = vec!["#st = :to"];
        let mut remove = Vec::new();
        match update.decided_by {
            Some(by) => {
                set.push("decidedBy = :by");
                values.insert(":by".to_string(), json!({ "S": by }));
            }
            None => remove.push("decidedBy"),
        }
        match update.decided_at {
            Some(at) => {
                set.push("decidedAt = :at");
                values.insert(":at".to_string(), json!({ "S": at.to_rfc3339() }));
            }
            None => remove.push("decidedAt"),
        }
        let mut expression = format!("SET {}", set.join(", "));
        if !remove.is_empty() {
            expression.push_str(&format!(" REMOVE {}", remove.join(", ")));
        }

        let body = json!({
            "TableName": self.table,
            "Key": { "requestId": { "S": id } },
            "UpdateExpression": expression,
            "ConditionExpression": "#st = :from",
            "ExpressionAttributeNames": { "#st": "status" },
            "ExpressionAttributeValues": values,
            "ReturnValues": "ALL_NEW",
            "ReturnValuesOnConditionCheckFailure": "ALL_OLD",
        });

        match self.client.call("UpdateItem", &body).await {
            Ok(response) => {
                let attributes = response.get("Attributes").ok_or_else(|| {
                    StoreError::Corrupt("UpdateItem returned no attributes".to_string())
                })?;
                Ok(Transition::Applied(from_item(attributes)?))
            }
            Err(CallError::ConditionFailed(None)) => Ok(Transition::Missing),
            Err(CallError::ConditionFailed(Some(old))) => {
                let current: AccessRequest = from_item(&old)?;
                debug!(request_id = %id, status = %current.status, "Conditional transition refused");
                Ok(Transition::Conflict(current.status))
            }
            Err(CallError::Store(e)) => Err(e),
        }
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> std::result::Result<Vec<AccessRequest>, StoreError> {
        let mut out = Vec::new();
        let mut start_key: Option<Value> = None;
        loop {
            let mut body = json!({
                "TableName": self.table,
                "FilterExpression": "#st = :s",
                "ExpressionAttributeNames": { "#st": "status" },
                "ExpressionAttributeValues": { ":s": { "S": status.as_str() } },
            });
            if let Some(key) = start_key.take() {
                body["ExclusiveStartKey"] = key;
            }

            let response = self.client.call("Scan", &body).await?;
            if let Some(items) = response.get("Items").and_then(Value::as_array) {
                for item in items {
                    out.push(from_item(item)?);
                }
            }
            match response.get("LastEvaluatedKey") {
                Some(key) if !key.is_null() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(out)
    }
}

/// Grant store on the `temp_access` table.
pub struct DynamoGrantStore {
    client: Arc<DynamoClient>,
    table: String,
}

impl DynamoGrantStore {
    /// Create a store over `table`.
    #[must_use]
    pub fn new(client: Arc<DynamoClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl GrantStore for DynamoGrantStore {
    async fn get(
        &self,
        subject: &str,
        resource: &str,
    ) -> std::result::Result<Option<AccessGrant>, StoreError> {
        let body = json!({
            "TableName": self.table,
            "Key": {
                "userId": { "S": subject },
                "bucket": { "S": resource },
            },
            "ConsistentRead": true,
        });
        let response = self.client.call("GetItem", &body).await?;
        response.get("Item").map(from_item).transpose()
    }

    async fn upsert(&self, grant: &AccessGrant) -> std::result::Result<(), StoreError> {
        let body = json!({
            "TableName": self.table,
            "Item": to_item(grant)?,
        });
        self.client.call("PutItem", &body).await?;
        Ok(())
    }
}

/// Serialize a record into a DynamoDB item (attribute-value map).
fn to_item<T: Serialize>(record: &T) -> std::result::Result<Value, StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(StoreError::Corrupt("record is not an object".to_string()));
    };
    Ok(Value::Object(
        fields
            .into_iter()
            .map(|(name, v)| (name, to_attribute(v)))
            .collect(),
    ))
}

fn to_attribute(value: Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.into_iter().map(to_attribute).collect::<Vec<_>>() }),
        Value::Object(fields) => json!({
            "M": fields
                .into_iter()
                .map(|(k, v)| (k, to_attribute(v)))
                .collect::<Map<String, Value>>()
        }),
    }
}

/// Decode a DynamoDB item into a record.
fn from_item<T: DeserializeOwned>(item: &Value) -> std::result::Result<T, StoreError> {
    let Value::Object(fields) = item else {
        return Err(StoreError::Corrupt("item is not a map".to_string()));
    };
    let plain = fields
        .iter()
        .map(|(name, attr)| Ok((name.clone(), from_attribute(attr)?)))
        .collect::<std::result::Result<Map<String, Value>, StoreError>>()?;
    serde_json::from_value(Value::Object(plain)).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_attribute(attr: &Value) -> std::result::Result<Value, StoreError> {
    let Some((kind, inner)) = attr.as_object().and_then(|m| m.iter().next()) else {
        return Err(StoreError::Corrupt(format!("bad attribute value: {attr}")));
    };
    match (kind.as_str(), inner) {
        ("S", Value::String(s)) => Ok(Value::String(s.clone())),
        ("N", Value::String(n)) => parse_number(n),
        ("BOOL", Value::Bool(b)) => Ok(Value::Bool(*b)),
        ("NULL", _) => Ok(Value::Null),
        ("L", Value::Array(items)) => items
            .iter()
            .map(from_attribute)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        ("M", Value::Object(fields)) => fields
            .iter()
            .map(|(k, v)| Ok((k.clone(), from_attribute(v)?)))
            .collect::<std::result::Result<Map<String, Value>, StoreError>>()
            .map(Value::Object),
        _ => Err(StoreError::Corrupt(format!("unsupported attribute type {kind}"))),
    }
}

fn parse_number(n: &str) -> std::result::Result<Value, StoreError> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(Value::from(i));
    }
    n.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StoreError::Corrupt(format!("bad number attribute: {n}")))
}
