//! AWS SDK Clients
//!
//! Concrete bindings of the capability traits to the real provider: Kinesis
//! for the stream control plane, CloudWatch for utilisation metrics, SNS for
//! notifications, and S3 for configuration documents. Credentials resolve
//! through the default provider chain; region and endpoint overrides come
//! from the policy or the command line.

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudwatch::model::{Dimension, StandardUnit, Statistic};
use aws_sdk_cloudwatch::types::DateTime as CwDateTime;
use aws_sdk_kinesis::model::{ScalingType, StreamStatus as SdkStreamStatus};
use aws_sdk_kinesis::types::SdkError;
use aws_sdk_kinesis::{Endpoint, Region};
use chrono::{TimeZone, Utc};
use http::Uri;

use crate::hash_math::{format_hash_key, parse_hash_key};
use crate::shard::ShardRecord;

use super::api::{
    ControlError, MetricQuery, MetricsApi, Notifier, Sample, SampleUnit, ShardListing,
    StreamApi, StreamStatus, StreamSummary,
};

/// Metric namespace of the stream service
const METRICS_NAMESPACE: &str = "AWS/Kinesis";

/// Dimension naming the stream in every metric query
const STREAM_DIMENSION: &str = "StreamName";

fn region_chain(region: Option<String>) -> RegionProviderChain {
    RegionProviderChain::first_try(region.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-east-1"))
}

/// Kinesis-backed stream control plane
pub struct AwsStreamApi {
    client: aws_sdk_kinesis::Client,
}

impl AwsStreamApi {
    /// Connect with the default credentials chain, an optional region and an
    /// optional endpoint override (for local stacks)
    pub async fn connect(
        region: Option<String>,
        endpoint: Option<String>,
    ) -> anyhow::Result<Self> {
        let shared = aws_config::from_env()
            .region(region_chain(region))
            .load()
            .await;
        let client = match endpoint {
            Some(raw) => {
                let uri: Uri = raw.parse()?;
                let conf = aws_sdk_kinesis::config::Builder::from(&shared)
                    .endpoint_resolver(Endpoint::immutable(uri))
                    .build();
                aws_sdk_kinesis::Client::from_conf(conf)
            }
            None => aws_sdk_kinesis::Client::new(&shared),
        };
        Ok(AwsStreamApi { client })
    }
}

fn map_kinesis_error<E>(err: SdkError<E>) -> ControlError
where
    aws_sdk_kinesis::Error: From<SdkError<E>>,
{
    use aws_sdk_kinesis::Error;
    match Error::from(err) {
        Error::ResourceInUseException(e) => ControlError::ResourceInUse(e.to_string()),
        Error::LimitExceededException(e) => ControlError::Throttled(e.to_string()),
        Error::ProvisionedThroughputExceededException(e) => {
            ControlError::Throttled(e.to_string())
        }
        Error::InvalidArgumentException(e) => ControlError::InvalidArgument(e.to_string()),
        Error::ResourceNotFoundException(e) => ControlError::NotFound(e.to_string()),
        Error::Unhandled(e) => ControlError::Transient(e.to_string()),
        other => ControlError::Other(other.to_string()),
    }
}

fn convert_shard(shard: &aws_sdk_kinesis::model::Shard) -> Result<ShardRecord, ControlError> {
    let shard_id = shard
        .shard_id
        .clone()
        .ok_or_else(|| ControlError::Other("listed shard carries no id".to_string()))?;
    let range = shard
        .hash_key_range
        .as_ref()
        .ok_or_else(|| ControlError::Other(format!("shard {} has no hash range", shard_id)))?;
    let start_hash = range
        .starting_hash_key
        .as_deref()
        .map(parse_hash_key)
        .transpose()
        .map_err(|e| ControlError::Other(e.to_string()))?
        .ok_or_else(|| ControlError::Other(format!("shard {} has no start hash", shard_id)))?;
    let end_hash = range
        .ending_hash_key
        .as_deref()
        .map(parse_hash_key)
        .transpose()
        .map_err(|e| ControlError::Other(e.to_string()))?
        .ok_or_else(|| ControlError::Other(format!("shard {} has no end hash", shard_id)))?;
    Ok(ShardRecord {
        shard_id,
        parent_shard_id: shard.parent_shard_id.clone(),
        adjacent_parent_shard_id: shard.adjacent_parent_shard_id.clone(),
        start_hash,
        end_hash,
    })
}

#[async_trait]
impl StreamApi for AwsStreamApi {
    async fn describe_stream(&self, stream: &str) -> Result<StreamSummary, ControlError> {
        let output = self
            .client
            .describe_stream_summary()
            .stream_name(stream)
            .send()
            .await
            .map_err(map_kinesis_error)?;
        let summary = output.stream_description_summary.ok_or_else(|| {
            ControlError::Other(format!("empty describe response for stream {}", stream))
        })?;
        let status = match summary.stream_status {
            Some(SdkStreamStatus::Active) => StreamStatus::Active,
            Some(SdkStreamStatus::Creating) => StreamStatus::Creating,
            Some(SdkStreamStatus::Deleting) => StreamStatus::Deleting,
            Some(SdkStreamStatus::Updating) => StreamStatus::Updating,
            other => {
                return Err(ControlError::Other(format!(
                    "stream {} reports unrecognized status {:?}",
                    stream, other
                )))
            }
        };
        Ok(StreamSummary {
            stream_name: stream.to_string(),
            status,
            open_shard_count: summary.open_shard_count.unwrap_or(0) as usize,
        })
    }

    async fn list_shards_page(
        &self,
        stream: &str,
        exclusive_start_shard_id: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<ShardListing, ControlError> {
        // the service forbids mixing a continuation token with the other
        // listing parameters
        let mut request = self.client.list_shards();
        match next_token {
            Some(token) => request = request.next_token(token),
            None => {
                request = request.stream_name(stream);
                if let Some(bound) = exclusive_start_shard_id {
                    request = request.exclusive_start_shard_id(bound);
                }
            }
        }
        let output = request.send().await.map_err(map_kinesis_error)?;
        let shards = output
            .shards
            .unwrap_or_default()
            .iter()
            .map(convert_shard)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ShardListing {
            shards,
            next_token: output.next_token,
        })
    }

    async fn split_shard(
        &self,
        stream: &str,
        shard_id: &str,
        new_starting_hash: u128,
    ) -> Result<(), ControlError> {
        self.client
            .split_shard()
            .stream_name(stream)
            .shard_to_split(shard_id)
            .new_starting_hash_key(format_hash_key(new_starting_hash))
            .send()
            .await
            .map_err(map_kinesis_error)?;
        Ok(())
    }

    async fn merge_shards(
        &self,
        stream: &str,
        shard_id: &str,
        adjacent_shard_id: &str,
    ) -> Result<(), ControlError> {
        self.client
            .merge_shards()
            .stream_name(stream)
            .shard_to_merge(shard_id)
            .adjacent_shard_to_merge(adjacent_shard_id)
            .send()
            .await
            .map_err(map_kinesis_error)?;
        Ok(())
    }

    async fn update_shard_count(&self, stream: &str, target: u64) -> Result<(), ControlError> {
        self.client
            .update_shard_count()
            .stream_name(stream)
            .target_shard_count(target as i32)
            .scaling_type(ScalingType::UniformScaling)
            .send()
            .await
            .map_err(map_kinesis_error)?;
        Ok(())
    }
}

/// CloudWatch-backed metrics reader
pub struct AwsMetricsApi {
    client: aws_sdk_cloudwatch::Client,
}

impl AwsMetricsApi {
    pub async fn connect(region: Option<String>) -> Self {
        let shared = aws_config::from_env()
            .region(region_chain(region))
            .load()
            .await;
        AwsMetricsApi {
            client: aws_sdk_cloudwatch::Client::new(&shared),
        }
    }
}

fn map_cloudwatch_error<E>(err: SdkError<E>) -> ControlError
where
    aws_sdk_cloudwatch::Error: From<SdkError<E>>,
{
    use aws_sdk_cloudwatch::Error;
    match Error::from(err) {
        Error::InternalServiceFault(e) => ControlError::Transient(e.to_string()),
        Error::InvalidParameterCombinationException(e) => {
            ControlError::Validation(e.to_string())
        }
        Error::InvalidParameterValueException(e) => ControlError::Validation(e.to_string()),
        Error::MissingRequiredParameterException(e) => ControlError::Validation(e.to_string()),
        Error::Unhandled(e) => ControlError::Transient(e.to_string()),
        other => ControlError::Other(other.to_string()),
    }
}

#[async_trait]
impl MetricsApi for AwsMetricsApi {
    async fn sum_series(&self, query: &MetricQuery) -> Result<Vec<Sample>, ControlError> {
        let output = self
            .client
            .get_metric_statistics()
            .namespace(METRICS_NAMESPACE)
            .metric_name(&query.metric_name)
            .dimensions(
                Dimension::builder()
                    .name(STREAM_DIMENSION)
                    .value(&query.stream_name)
                    .build(),
            )
            .start_time(CwDateTime::from_secs(query.start.timestamp()))
            .end_time(CwDateTime::from_secs(query.end.timestamp()))
            .period(query.period_secs as i32)
            .statistics(Statistic::Sum)
            .send()
            .await
            .map_err(map_cloudwatch_error)?;

        let mut samples = Vec::new();
        for point in output.datapoints.unwrap_or_default() {
            let (Some(sum), Some(at)) = (point.sum, point.timestamp.as_ref()) else {
                continue;
            };
            let unit = match point.unit {
                Some(StandardUnit::Bytes) => SampleUnit::Bytes,
                Some(StandardUnit::Count) => SampleUnit::Count,
                _ => continue,
            };
            let Some(timestamp) = Utc.timestamp_opt(at.secs(), 0).single() else {
                continue;
            };
            samples.push(Sample {
                timestamp,
                sum,
                unit,
            });
        }
        Ok(samples)
    }
}

/// SNS-backed notification sink
pub struct AwsNotifier {
    client: aws_sdk_sns::Client,
}

impl AwsNotifier {
    pub async fn connect(region: Option<String>) -> Self {
        let shared = aws_config::from_env()
            .region(region_chain(region))
            .load()
            .await;
        AwsNotifier {
            client: aws_sdk_sns::Client::new(&shared),
        }
    }
}

fn map_sns_error<E>(err: SdkError<E>) -> ControlError
where
    aws_sdk_sns::Error: From<SdkError<E>>,
{
    use aws_sdk_sns::Error;
    match Error::from(err) {
        Error::ThrottledException(e) => ControlError::Throttled(e.to_string()),
        Error::InternalErrorException(e) => ControlError::Transient(e.to_string()),
        Error::InvalidParameterException(e) => ControlError::InvalidArgument(e.to_string()),
        Error::NotFoundException(e) => ControlError::NotFound(e.to_string()),
        Error::Unhandled(e) => ControlError::Transient(e.to_string()),
        other => ControlError::Other(other.to_string()),
    }
}

#[async_trait]
impl Notifier for AwsNotifier {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ControlError> {
        self.client
            .publish()
            .topic_arn(target)
            .subject(subject)
            .message(body)
            .send()
            .await
            .map_err(map_sns_error)?;
        Ok(())
    }
}

/// Read one S3 object, for `s3://` configuration handles
pub async fn fetch_s3_object(bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
    let shared = aws_config::from_env().load().await;
    let client = aws_sdk_s3::Client::new(&shared);
    let output = client.get_object().bucket(bucket).key(key).send().await?;
    let body = output.body.collect().await?;
    Ok(body.into_bytes().to_vec())
}
