//! JSON-over-HTTP remote authority.
//!
//! - `POST {base}/jobs/{kind}` submits a job with its attachments.
//! - `GET {base}/entities/{entity}/records?since=..&until=..` returns a [`RemoteSnapshot`].

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use fieldqueue_core::{Job, MediaAttachment};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;

use crate::error::{RejectionReason, SubmitError};
use crate::remote::{RecordQuery, RemoteQuery, RemoteReceipt, RemoteSnapshot, SubmitHandler};

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Submission<'a> {
    job: &'a Job,
    attachments: Vec<AttachmentUpload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentUpload<'a> {
    #[serde(flatten)]
    meta: &'a MediaAttachment,
    data: &'a [u8],
}

impl HttpRemote {
    pub fn new(base_url: &str) -> Result<Self, SubmitError> {
        let base = Url::parse(base_url)
            .map_err(|e| SubmitError::network(format!("invalid remote url {base_url}: {e}")))?;
        Ok(Self {
            client: Client::new(),
            base,
            token: None,
        })
    }

    /// Send `Authorization: Bearer {token}` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SubmitError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SubmitError::network(format!("remote url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SubmitHandler for HttpRemote {
    async fn submit(
        &self,
        job: &Job,
        attachments: &[MediaAttachment],
    ) -> Result<RemoteReceipt, SubmitError> {
        let url = self.url(&["jobs", job.kind.as_str()])?;
        let body = Submission {
            job,
            attachments: attachments
                .iter()
                .map(|a| AttachmentUpload {
                    meta: a,
                    data: &a.data,
                })
                .collect(),
        };

        let response = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify(status, message));
        }

        match response.json::<RemoteReceipt>().await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "accepted without a readable receipt");
                Ok(RemoteReceipt {
                    remote_id: None,
                    accepted_at: Utc::now(),
                })
            }
        }
    }
}

#[async_trait]
impl RemoteQuery for HttpRemote {
    async fn confirmed_records(&self, query: &RecordQuery) -> Result<RemoteSnapshot, SubmitError> {
        let url = self.url(&["entities", &query.entity, "records"])?;
        let since = query.since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let until = query.until.to_rfc3339_opts(SecondsFormat::Millis, true);

        let response = self
            .authorize(
                self.client
                    .get(url)
                    .query(&[("since", since.as_str()), ("until", until.as_str())]),
            )
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify(status, message));
        }
        response
            .json::<RemoteSnapshot>()
            .await
            .map_err(|e| SubmitError::network(format!("unreadable remote snapshot: {e}")))
    }
}

fn transport(err: reqwest::Error) -> SubmitError {
    SubmitError::network(err.to_string())
}

/// Map a non-success status to a rejection or a transient failure.
fn classify(status: StatusCode, message: String) -> SubmitError {
    let reason = match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => RejectionReason::Validation,
        StatusCode::CONFLICT => RejectionReason::Duplicate,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            RejectionReason::Capacity
        }
        _ => return SubmitError::network(format!("remote returned {status}: {message}")),
    };
    SubmitError::rejected(reason, message)
}
