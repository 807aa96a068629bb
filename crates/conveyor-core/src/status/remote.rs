//! Remote transport: JSON POSTs to the ingestion endpoint.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::domain::{Id, IdMarker, LogId, StageId};
use crate::status::StatusError;
use crate::status::transport::StatusTransport;
use crate::status::wire::{
    DB_HEADER, LOG_PATH, LogPush, PROGRESS_PATH, ProgressPush, STAGE_PATH, StagePush, TOKEN_HEADER,
};

const BODY_PREVIEW_LIMIT: usize = 512;

pub struct RemoteTransport {
    http: reqwest::Client,
    db: String,
    token: String,
    url_log: String,
    url_stage: String,
    url_progress: String,
}

impl RemoteTransport {
    pub fn new(
        base_url: &str,
        db: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StatusError> {
        let normalized = base_url.trim().trim_end_matches('/');
        if normalized.is_empty() {
            return Err(StatusError::Configuration(
                "Cannot determine base URL".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StatusError::Configuration(format!("http client: {err}")))?;
        Ok(Self {
            http,
            db: db.into(),
            token: token.into(),
            url_log: format!("{normalized}{LOG_PATH}"),
            url_stage: format!("{normalized}{STAGE_PATH}"),
            url_progress: format!("{normalized}{PROGRESS_PATH}"),
        })
    }

    async fn post<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<String, StatusError> {
        let resp = self
            .http
            .post(url)
            .header(DB_HEADER, &self.db)
            .header(TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|err| transport_error(url, err))?;
        if !status.is_success() {
            return Err(StatusError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: preview_body(&text),
            });
        }
        tracing::trace!(url, status = %status, "status push");
        Ok(text)
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> StatusError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "request"
    };
    StatusError::Transport {
        url: url.to_string(),
        message: format!("{kind}: {err}"),
    }
}

fn parse_id<T: IdMarker>(url: &str, body: &str) -> Result<Id<T>, StatusError> {
    body.trim().parse().map_err(|_| StatusError::Protocol {
        url: url.to_string(),
        body: preview_body(body),
    })
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut out: String = trimmed.chars().take(BODY_PREVIEW_LIMIT).collect();
    if trimmed.chars().count() > BODY_PREVIEW_LIMIT {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl StatusTransport for RemoteTransport {
    async fn create_stage(&mut self, push: StagePush) -> Result<StageId, StatusError> {
        let body = self.post(&self.url_stage, &push).await?;
        parse_id(&self.url_stage, &body)
    }

    async fn push_log(&mut self, push: LogPush) -> Result<LogId, StatusError> {
        let body = self.post(&self.url_log, &push).await?;
        parse_id(&self.url_log, &body)
    }

    async fn push_progress(&mut self, push: ProgressPush) -> Result<(), StatusError> {
        self.post(&self.url_progress, &push).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_base_url_is_a_configuration_error() {
        let err = RemoteTransport::new("  ", "db", "tok", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, StatusError::Configuration(_)));
    }

    #[test]
    fn urls_are_normalized() {
        let t = RemoteTransport::new("http://h:8069/conveyor/", "db", "tok", Duration::from_secs(1))
            .unwrap();
        assert_eq!(t.url_log, "http://h:8069/conveyor/log");
        assert_eq!(t.url_stage, "http://h:8069/conveyor/stage");
        assert_eq!(t.url_progress, "http://h:8069/conveyor/progress");
    }

    #[test]
    fn body_preview_is_bounded() {
        assert_eq!(preview_body("  "), "<empty body>");
        let long = "x".repeat(600);
        let preview = preview_body(&long);
        assert_eq!(preview.len(), BODY_PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn ids_must_be_plain_integers() {
        let id: StageId = parse_id("u", "12\n").unwrap();
        assert_eq!(id, StageId::new(12));
        assert!(matches!(
            parse_id::<crate::domain::ids::Stage>("u", "<html>"),
            Err(StatusError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        // port 9 (discard) on localhost is closed on test hosts
        let mut t = RemoteTransport::new("http://127.0.0.1:9", "db", "tok", Duration::from_secs(2))
            .unwrap();
        let err = t
            .push_progress(ProgressPush {
                stage_id: StageId::new(1),
                status: None,
                progress: 10.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::Transport { .. }));
    }
}
