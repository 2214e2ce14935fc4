//! Flatten notification envelopes into S3 object-created events
//!
//! An envelope is the `{"Records": [...]}` batch a host hands over. Each
//! outer record can be:
//!
//! - an SNS notification, whose `Sns.Message` is a JSON-encoded S3 event
//! - an SQS message, whose `body` is a JSON-encoded S3 event
//! - a bare S3 event record
//!
//! Decoding is forgiving: one bad message logs a warning and is skipped, it
//! never fails the batch.

use serde::Deserialize;
use serde_json::Value;

/// `eventSource` of S3 change records
pub const S3_EVENT_SOURCE: &str = "aws:s3";

/// `eventName` prefix shared by every object-created kind
pub const OBJECT_CREATED_PREFIX: &str = "ObjectCreated";

/// Only keys with this extension get indexed
pub const CAR_EXTENSION: &str = ".car";

/// An outer notification batch
#[derive(Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Records", default)]
    pub records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SnsRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Debug, Deserialize)]
struct SnsMessage {
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "MessageId", default)]
    message_id: Option<String>,
    #[serde(rename = "TopicArn", default)]
    topic_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SqsRecord {
    body: String,
    #[serde(rename = "messageId", default)]
    message_id: Option<String>,
}

/// What an S3 event payload decodes into before the records are checked
#[derive(Debug, Deserialize)]
struct S3EventPayload {
    #[serde(rename = "Records", default)]
    records: Vec<Value>,
}

/// One S3 change record, as S3 sends it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    pub event_source: String,
    pub event_name: String,
    /// empty when the notification leaves it out
    #[serde(default)]
    pub aws_region: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// An object landed in a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCreatedEvent {
    pub bucket: String,
    pub region: String,
    /// exactly as it appeared in the notification
    pub key: String,
    pub event_name: String,
    pub size: Option<u64>,
}

impl From<S3EventRecord> for StorageCreatedEvent {
    fn from(r: S3EventRecord) -> Self {
        Self {
            bucket: r.s3.bucket.name,
            region: r.aws_region,
            key: r.s3.object.key,
            event_name: r.event_name,
            size: r.s3.object.size,
        }
    }
}

impl StorageCreatedEvent {
    /// Is this the creation of a CAR file
    pub fn is_car_created(&self) -> bool {
        self.event_name.starts_with(OBJECT_CREATED_PREFIX) && self.key.ends_with(CAR_EXTENSION)
    }
}

impl Envelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Every S3 change record in the envelope, in order
    pub fn s3_records(&self) -> Vec<S3EventRecord> {
        let mut out = Vec::new();
        for (i, record) in self.records.iter().enumerate() {
            match unwrap_message(i, record) {
                Unwrapped::Payload(payload) => push_s3_records(&payload, &mut out),
                Unwrapped::Skipped => {}
                Unwrapped::Bare if record.get("eventSource").is_some() => {
                    push_s3_record(record, &mut out)
                }
                Unwrapped::Bare => log::warn!("skipping notification record {i} of unknown shape"),
            }
        }
        out
    }

    /// The CAR object-created events worth indexing, in order
    pub fn created_cars(&self) -> Vec<StorageCreatedEvent> {
        self.s3_records()
            .into_iter()
            .map(StorageCreatedEvent::from)
            .filter(StorageCreatedEvent::is_car_created)
            .collect()
    }
}

enum Unwrapped {
    Payload(S3EventPayload),
    /// a wrapper whose payload didn't decode; already logged
    Skipped,
    /// not an SNS or SQS wrapper
    Bare,
}

/// Decode the S3 event carried inside an SNS or SQS record
fn unwrap_message(i: usize, record: &Value) -> Unwrapped {
    let (raw, context) = if record.get("Sns").is_some() {
        match SnsRecord::deserialize(record) {
            Ok(r) => {
                let context = format!(
                    "sns message {} from {}",
                    r.sns.message_id.as_deref().unwrap_or("?"),
                    r.sns.topic_arn.as_deref().unwrap_or("?")
                );
                (r.sns.message, context)
            }
            Err(e) => {
                log::warn!("failed to extract S3 event from notification record {i}: {e}");
                return Unwrapped::Skipped;
            }
        }
    } else if record.get("body").is_some() {
        match SqsRecord::deserialize(record) {
            Ok(r) => {
                let context = format!("sqs message {}", r.message_id.as_deref().unwrap_or("?"));
                (r.body, context)
            }
            Err(e) => {
                log::warn!("failed to extract S3 event from notification record {i}: {e}");
                return Unwrapped::Skipped;
            }
        }
    } else {
        return Unwrapped::Bare;
    };

    match serde_json::from_str::<S3EventPayload>(&raw) {
        Ok(payload) => Unwrapped::Payload(payload),
        Err(e) => {
            log::warn!("failed to extract S3 event from {context} (record {i}): {e}");
            Unwrapped::Skipped
        }
    }
}

fn push_s3_records(payload: &S3EventPayload, out: &mut Vec<S3EventRecord>) {
    for record in &payload.records {
        push_s3_record(record, out);
    }
}

fn push_s3_record(record: &Value, out: &mut Vec<S3EventRecord>) {
    if record.get("eventSource").and_then(Value::as_str) != Some(S3_EVENT_SOURCE) {
        return;
    }
    match S3EventRecord::deserialize(record) {
        Ok(r) => out.push(r),
        Err(e) => log::warn!("skipping malformed S3 event record: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s3_record(source: &str, name: &str, key: &str) -> Value {
        json!({
            "eventSource": source,
            "eventName": name,
            "awsRegion": "us-east-1",
            "s3": { "bucket": { "name": "b" }, "object": { "key": key, "size": 42 } }
        })
    }

    fn sns(records: Vec<Value>) -> Value {
        json!({ "Sns": { "Message": json!({ "Records": records }).to_string(), "MessageId": "m-1" } })
    }

    fn envelope(records: Vec<Value>) -> Envelope {
        Envelope { records }
    }

    #[test]
    fn test_sns_wrapped_car() {
        let env = envelope(vec![sns(vec![s3_record(
            "aws:s3",
            "ObjectCreated:Put",
            "root.car",
        )])]);
        assert_eq!(
            env.created_cars(),
            vec![StorageCreatedEvent {
                bucket: "b".into(),
                region: "us-east-1".into(),
                key: "root.car".into(),
                event_name: "ObjectCreated:Put".into(),
                size: Some(42),
            }]
        );
    }

    #[test]
    fn test_record_without_region() {
        let raw = r#"{"Records":[{"Sns":{"Message":"{\"Records\":[{\"eventSource\":\"aws:s3\",\"eventName\":\"ObjectCreated:Put\",\"s3\":{\"bucket\":{\"name\":\"b\"},\"object\":{\"key\":\"root.car\"}}}]}"}}]}"#;
        let env = Envelope::from_slice(raw.as_bytes()).unwrap();
        let events = env.created_cars();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bucket, "b");
        assert_eq!(events[0].key, "root.car");
        assert_eq!(events[0].region, "");
        assert_eq!(events[0].size, None);
    }

    #[test]
    fn test_empty_envelope() {
        assert!(envelope(vec![]).created_cars().is_empty());
        let env = Envelope::from_slice(b"{}").unwrap();
        assert!(env.created_cars().is_empty());
    }

    #[test]
    fn test_undecodable_message_is_skipped() {
        let env = envelope(vec![
            json!({ "Sns": { "Message": "this is not json" } }),
            sns(vec![s3_record("aws:s3", "ObjectCreated:Put", "ok.car")]),
        ]);
        let keys: Vec<_> = env.created_cars().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["ok.car"]);
    }

    #[test]
    fn test_non_s3_sources_dropped() {
        let env = envelope(vec![sns(vec![
            s3_record("aws:sqs", "ObjectCreated:Put", "a.car"),
            s3_record("aws:dynamodb", "ObjectCreated:Put", "b.car"),
        ])]);
        assert!(env.s3_records().is_empty());
    }

    #[test]
    fn test_only_created_cars_kept() {
        let env = envelope(vec![sns(vec![
            s3_record("aws:s3", "ObjectRemoved:Delete", "gone.car"),
            s3_record("aws:s3", "ObjectCreated:Put", "root.car.idx"),
            s3_record("aws:s3", "ObjectCreated:Copy", "copied.car"),
            s3_record("aws:s3", "ObjectCreated:CompleteMultipartUpload", "big.CAR"),
        ])]);
        assert_eq!(env.s3_records().len(), 4);
        let keys: Vec<_> = env.created_cars().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["copied.car"]);
    }

    #[test]
    fn test_order_and_duplicates_preserved() {
        let env = envelope(vec![
            sns(vec![
                s3_record("aws:s3", "ObjectCreated:Put", "2.car"),
                s3_record("aws:s3", "ObjectCreated:Put", "1.car"),
            ]),
            sns(vec![s3_record("aws:s3", "ObjectCreated:Put", "2.car")]),
        ]);
        let keys: Vec<_> = env.created_cars().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["2.car", "1.car", "2.car"]);
    }

    #[test]
    fn test_sqs_and_bare_records() {
        let env = envelope(vec![
            json!({
                "messageId": "q-1",
                "body": json!({ "Records": [s3_record("aws:s3", "ObjectCreated:Put", "sqs.car")] }).to_string()
            }),
            s3_record("aws:s3", "ObjectCreated:Post", "bare.car"),
        ]);
        let keys: Vec<_> = env.created_cars().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["sqs.car", "bare.car"]);
    }

    #[test]
    fn test_malformed_s3_record_skipped() {
        let env = envelope(vec![sns(vec![
            json!({ "eventSource": "aws:s3", "eventName": "ObjectCreated:Put" }),
            s3_record("aws:s3", "ObjectCreated:Put", "fine.car"),
        ])]);
        let keys: Vec<_> = env.created_cars().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["fine.car"]);
    }

    #[test]
    fn test_unknown_record_shape_skipped() {
        let env = envelope(vec![json!({ "hello": "world" }), json!(17)]);
        assert!(env.s3_records().is_empty());
    }
}
