//! HTTP implementation of [`ClusterApi`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use ondemand_scaler_core::{Allocation, Evaluation, Job, JobSummary, Node, NodeId};
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::api::{ClusterApi, EventStream, NodeStub, QueryMeta, QueryOptions};
use crate::error::{ClusterError, Result};
use crate::wire::{
    decode_event_frame, DrainRequest, WireAllocation, WireEvaluation, WireJob, WireJobSummary,
    WireNamespace, WireNode, WireNodeStub,
};

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Response header with the raft index of the answer.
pub const INDEX_HEADER: &str = "X-Nomad-Index";

/// Response header with milliseconds since the server last heard from the leader.
pub const LAST_CONTACT_HEADER: &str = "X-Nomad-LastContact";

/// Timeout for every request except the event stream.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_TOPICS: [&str; 3] = ["Evaluation:*", "Node:*", "Allocation:*"];

/// HTTP client for the cluster manager API.
///
/// The underlying [`reqwest::Client`] must not carry a total request
/// timeout, or the event stream would be cut off; per-request timeouts are
/// applied to every other call instead.
#[derive(Debug, Clone)]
pub struct HttpClusterClient {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpClusterClient {
    /// Create a client for the API at `address` (e.g. `http://127.0.0.1:4646`).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] if `address` is not an http(s) URL,
    /// or [`ClusterError::Http`] if the HTTP client cannot be built.
    pub fn new(address: impl Into<String>, token: Option<String>) -> Result<Self> {
        let address = address.into();
        if !(address.starts_with("http://") || address.starts_with("https://")) {
            return Err(ClusterError::Config(format!(
                "address must be an http(s) URL: {address}"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, address, token))
    }

    /// Create a client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        address: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let address: String = address.into();
        Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Base address of the API.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{}{path}", self.address));
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn read<W: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        opts: QueryOptions,
    ) -> Result<(W, QueryMeta)> {
        let mut request = self
            .request(Method::GET, path)
            .timeout(self.request_timeout)
            .query(query);
        if opts.allow_stale {
            request = request.query(&[("stale", "")]);
        }

        let response = check_status(request.send().await?, path).await?;
        let meta = query_meta(response.headers());
        let body = response.bytes().await?;
        let value = serde_json::from_slice(&body).map_err(|e| ClusterError::decode(path, e))?;

        debug!(
            path,
            index = meta.last_index,
            last_contact_ms = u64::try_from(meta.last_contact.as_millis()).unwrap_or(u64::MAX),
            "cluster read"
        );
        Ok((value, meta))
    }
}

async fn check_status(response: Response, path: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ClusterError::NotFound(path.to_string()));
    }
    Err(ClusterError::Status {
        status: status.as_u16(),
        path: path.to_string(),
        message: message.trim().to_string(),
    })
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn query_meta(headers: &HeaderMap) -> QueryMeta {
    QueryMeta {
        last_index: header_u64(headers, INDEX_HEADER),
        last_contact: Duration::from_millis(header_u64(headers, LAST_CONTACT_HEADER)),
    }
}

struct LineReader<S> {
    body: S,
    buffer: Vec<u8>,
    finished: bool,
}

/// Split a chunked body into newline-delimited event frames.
pub(crate) fn ndjson_batches<S, B>(body: S) -> EventStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let reader = LineReader {
        body,
        buffer: Vec::new(),
        finished: false,
    };
    futures::stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buffer.drain(..=pos).collect();
                match decode_event_frame(&line) {
                    Ok(Some(batch)) => return Some((Ok(batch), reader)),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), reader)),
                }
            }
            if reader.finished {
                let rest = std::mem::take(&mut reader.buffer);
                return match decode_event_frame(&rest) {
                    Ok(Some(batch)) => Some((Ok(batch), reader)),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), reader)),
                };
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.buffer.clear();
                    return Some((Err(e.into()), reader));
                }
                None => reader.finished = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn list_namespaces(&self, opts: QueryOptions) -> Result<(Vec<String>, QueryMeta)> {
        let (namespaces, meta): (Vec<WireNamespace>, _) =
            self.read("/v1/namespaces", &[], opts).await?;
        Ok((namespaces.into_iter().map(|n| n.name).collect(), meta))
    }

    async fn list_evaluations(
        &self,
        namespace: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)> {
        let (evals, meta): (Vec<WireEvaluation>, _) = self
            .read("/v1/evaluations", &[("namespace", namespace)], opts)
            .await?;
        Ok((evals.into_iter().map(Evaluation::from).collect(), meta))
    }

    async fn list_nodes(&self, opts: QueryOptions) -> Result<(Vec<NodeStub>, QueryMeta)> {
        let (nodes, meta): (Vec<WireNodeStub>, _) = self.read("/v1/nodes", &[], opts).await?;
        Ok((nodes.into_iter().map(NodeStub::from).collect(), meta))
    }

    async fn node(&self, id: &NodeId, opts: QueryOptions) -> Result<(Node, QueryMeta)> {
        let path = format!("/v1/node/{id}");
        let (node, meta): (WireNode, _) = self.read(&path, &[], opts).await?;
        Ok((node.into(), meta))
    }

    async fn node_allocations(
        &self,
        id: &NodeId,
        opts: QueryOptions,
    ) -> Result<(Vec<Allocation>, QueryMeta)> {
        let path = format!("/v1/node/{id}/allocations");
        let (allocs, meta): (Vec<WireAllocation>, _) = self.read(&path, &[], opts).await?;
        Ok((allocs.into_iter().map(Allocation::from).collect(), meta))
    }

    async fn job(&self, namespace: &str, id: &str, opts: QueryOptions) -> Result<(Job, QueryMeta)> {
        let path = format!("/v1/job/{id}");
        let (job, meta): (WireJob, _) = self
            .read(&path, &[("namespace", namespace)], opts)
            .await?;
        Ok((job.into(), meta))
    }

    async fn job_evaluations(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)> {
        let path = format!("/v1/job/{id}/evaluations");
        let (evals, meta): (Vec<WireEvaluation>, _) = self
            .read(&path, &[("namespace", namespace)], opts)
            .await?;
        Ok((evals.into_iter().map(Evaluation::from).collect(), meta))
    }

    async fn job_summary(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(JobSummary, QueryMeta)> {
        let path = format!("/v1/job/{id}/summary");
        let (summary, meta): (WireJobSummary, _) = self
            .read(&path, &[("namespace", namespace)], opts)
            .await?;
        Ok((summary.into(), meta))
    }

    async fn drain_node(&self, id: &NodeId) -> Result<()> {
        let path = format!("/v1/node/{id}/drain");
        let response = self
            .request(Method::POST, &path)
            .timeout(self.request_timeout)
            .json(&DrainRequest::default())
            .send()
            .await?;
        check_status(response, &path).await?;
        info!(node_id = %id, "requested node drain");
        Ok(())
    }

    async fn event_stream(&self, index: u64) -> Result<EventStream> {
        let path = "/v1/event/stream";
        let index = index.to_string();
        let mut query: Vec<(&str, &str)> = vec![("index", index.as_str()), ("namespace", "*")];
        query.extend(EVENT_TOPICS.iter().map(|topic| ("topic", *topic)));

        let response = self.request(Method::GET, path).query(&query).send().await?;
        let response = check_status(response, path).await?;
        info!(index = %index, "subscribed to cluster events");
        Ok(ndjson_batches(response.bytes_stream().boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClusterEvent;

    fn chunks(parts: &[&str]) -> EventStream {
        let parts: Vec<reqwest::Result<Vec<u8>>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        ndjson_batches(futures::stream::iter(parts))
    }

    const EVAL: &str = r#"{"Index":7,"Events":[{"Topic":"Evaluation","Type":"EvaluationUpdated","Payload":{"Evaluation":{"ID":"e1","Namespace":"default","JobID":"shop","Status":"blocked","CreateIndex":7}}}]}"#;

    #[tokio::test]
    async fn frames_split_across_chunks() {
        let (head, tail) = EVAL.split_at(40);
        let second = format!("{tail}\n{{}}\n");
        let batches: Vec<_> = chunks(&[head, &second]).collect().await;

        assert_eq!(batches.len(), 1);
        let batch = batches.into_iter().next().unwrap().unwrap();
        assert_eq!(batch.index, 7);
        assert!(matches!(batch.events[0], ClusterEvent::Evaluation(_)));
    }

    #[tokio::test]
    async fn trailing_frame_without_newline_is_decoded() {
        let batches: Vec<_> = chunks(&["{}\n", EVAL]).collect().await;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_ok());
    }

    #[test]
    fn client_rejects_bad_address() {
        assert!(matches!(
            HttpClusterClient::new("127.0.0.1:4646", None),
            Err(ClusterError::Config(_))
        ));
        let client = HttpClusterClient::new("http://nomad:4646/", Some(String::new())).unwrap();
        assert_eq!(client.address(), "http://nomad:4646");
        assert!(client.token.is_none());
    }
}
