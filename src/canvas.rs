//! Remote data gateway for Canvas-style LMS APIs.
//!
//! One client instance serves every user; each call carries the user's
//! credential. Pagination is followed internally so callers always get a
//! complete snapshot or a typed `GatewayError`, never a silent partial
//! result. Individual malformed records are dropped with a warning so one
//! bad row never sinks a whole snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::traits::{
    CanvasCredential, GatewayError, RemoteAssignment, RemoteCourse, RemoteGateway, Validation,
};

const PER_PAGE: u32 = 100;

pub struct CanvasClient {
    http: reqwest::Client,
}

impl CanvasClient {
    pub fn new(request_timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    async fn get(
        &self,
        credential: &CanvasCredential,
        url: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&credential.token)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GatewayError::AuthInvalid),
            StatusCode::TOO_MANY_REQUESTS => Err(GatewayError::RateLimited),
            status if !status.is_success() => Err(GatewayError::Transient(format!(
                "unexpected status {} from {}",
                status, url
            ))),
            _ => Ok(response),
        }
    }

    /// Fetch every page of a list endpoint, following `Link: rel="next"`.
    async fn get_paginated(
        &self,
        credential: &CanvasCredential,
        first_url: String,
    ) -> Result<Vec<Value>, GatewayError> {
        let mut url = first_url;
        let mut records = Vec::new();

        loop {
            let response = self.get(credential, &url).await?;
            let next = next_page_url(response.headers());

            let page: Vec<Value> = response
                .json()
                .await
                .map_err(|e| GatewayError::Transient(format!("bad response body: {}", e)))?;
            records.extend(page);

            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }

        Ok(records)
    }

    fn api_url(credential: &CanvasCredential, path: &str) -> String {
        format!(
            "{}/api/v1{}",
            credential.base_url.trim_end_matches('/'),
            path
        )
    }
}

#[async_trait]
impl RemoteGateway for CanvasClient {
    async fn validate(&self, credential: &CanvasCredential) -> Result<Validation, GatewayError> {
        let url = Self::api_url(credential, "/users/self");
        match self.get(credential, &url).await {
            Ok(response) => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Transient(format!("bad response body: {}", e)))?;
                Ok(Validation {
                    valid: true,
                    remote_user_id: body.get("id").map(json_id),
                    display_name: body
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            // A rejected credential is a negative validation, not an error.
            Err(GatewayError::AuthInvalid) => Ok(Validation {
                valid: false,
                remote_user_id: None,
                display_name: None,
            }),
            Err(e) => Err(e),
        }
    }

    async fn list_courses(
        &self,
        credential: &CanvasCredential,
    ) -> Result<Vec<RemoteCourse>, GatewayError> {
        let url = format!(
            "{}?enrollment_state=active&per_page={}",
            Self::api_url(credential, "/courses"),
            PER_PAGE
        );
        let records = self.get_paginated(credential, url).await?;

        let courses: Vec<RemoteCourse> = records.iter().filter_map(parse_course).collect();
        debug!(count = courses.len(), "Fetched courses");
        Ok(courses)
    }

    async fn list_assignments(
        &self,
        credential: &CanvasCredential,
    ) -> Result<Vec<RemoteAssignment>, GatewayError> {
        let courses = self.list_courses(credential).await?;

        let mut assignments = Vec::new();
        for course in &courses {
            let url = format!(
                "{}?per_page={}",
                Self::api_url(credential, &format!("/courses/{}/assignments", course.id)),
                PER_PAGE
            );
            let records = self.get_paginated(credential, url).await?;
            assignments.extend(
                records
                    .iter()
                    .filter_map(|record| parse_assignment(record, &course.id)),
            );
        }

        assignments.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        debug!(
            count = assignments.len(),
            courses = courses.len(),
            "Fetched assignments"
        );
        Ok(assignments)
    }
}

/// Canvas ids arrive as JSON numbers; normalize to text for correlation keys.
fn json_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract the `rel="next"` target from an RFC 5988 `Link` header, if any.
fn next_page_url(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let mut sections = part.split(';');
        let target = sections.next()?.trim();
        let is_next = sections
            .any(|param| param.trim().eq_ignore_ascii_case("rel=\"next\""));
        if is_next {
            return Some(
                target
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}

/// Parse one course record. Courses not in the `available` state are skipped.
fn parse_course(record: &Value) -> Option<RemoteCourse> {
    if record.get("workflow_state").and_then(Value::as_str) != Some("available") {
        return None;
    }
    let id = record.get("id").map(json_id)?;
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Untitled course")
        .to_string();
    let code = record
        .get("course_code")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Some(RemoteCourse { id, name, code })
}

/// Parse one assignment record. Unpublished rows and rows without a usable
/// due timestamp are dropped here, one at a time, so the rest of the
/// snapshot survives.
fn parse_assignment(record: &Value, course_id: &str) -> Option<RemoteAssignment> {
    if record.get("workflow_state").and_then(Value::as_str) != Some("published") {
        return None;
    }
    let id = record.get("id").map(json_id)?;
    let due_raw = record.get("due_at").and_then(Value::as_str)?;
    let due_at: DateTime<Utc> = match DateTime::parse_from_rfc3339(due_raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(e) => {
            warn!(assignment = %id, due_at = %due_raw, "Dropping assignment with unparsable due date: {}", e);
            return None;
        }
    };
    let title = record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Untitled assignment")
        .to_string();
    Some(RemoteAssignment {
        id,
        course_id: course_id.to_string(),
        title,
        due_at,
    })
}


/// Contract tests against a mock HTTP server: status mapping, pagination,
/// and record filtering exactly as the upstream API presents them.
#[cfg(test)]
mod contract_tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential(server: &MockServer) -> CanvasCredential {
        CanvasCredential {
            base_url: server.uri(),
            token: "secret-token".to_string(),
        }
    }

    fn client() -> CanvasClient {
        CanvasClient::new(5).unwrap()
    }

    fn course_json(id: u64, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "course_code": "CS305",
            "workflow_state": "available"
        })
    }

    #[tokio::test]
    async fn validate_reports_identity_on_success_and_invalid_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/self"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 4907,
                "name": "Test Student"
            })))
            .mount(&server)
            .await;

        let validation = client().validate(&credential(&server)).await.unwrap();
        assert!(validation.valid);
        assert_eq!(validation.remote_user_id.as_deref(), Some("4907"));
        assert_eq!(validation.display_name.as_deref(), Some("Test Student"));

        let rejecting = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/self"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&rejecting)
            .await;

        let validation = client().validate(&credential(&rejecting)).await.unwrap();
        assert!(!validation.valid);
        assert!(validation.remote_user_id.is_none());
    }

    #[tokio::test]
    async fn list_courses_maps_401_to_auth_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client().list_courses(&credential(&server)).await;
        assert!(matches!(result, Err(GatewayError::AuthInvalid)));
    }

    #[tokio::test]
    async fn list_courses_maps_429_to_rate_limited_and_500_to_transient() {
        let limited = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&limited)
            .await;
        assert!(matches!(
            client().list_courses(&credential(&limited)).await,
            Err(GatewayError::RateLimited)
        ));

        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;
        assert!(matches!(
            client().list_courses(&credential(&broken)).await,
            Err(GatewayError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn list_courses_follows_link_pagination_to_the_end() {
        let server = MockServer::start().await;

        let next = format!(
            "<{}/api/v1/courses?page=2&per_page=100>; rel=\"next\"",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .and(query_param("enrollment_state", "active"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", next.as_str())
                    .set_body_json(json!([course_json(1, "Databases")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                course_json(2, "Compilers")
            ])))
            .mount(&server)
            .await;

        let courses = client().list_courses(&credential(&server)).await.unwrap();
        let names: Vec<&str> = courses.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Databases", "Compilers"]);
    }

    #[tokio::test]
    async fn list_assignments_filters_bad_records_and_keeps_the_rest() {
        let server = MockServer::start().await;
        // Unavailable course: skipped entirely, never queried.
        let mut hidden = course_json(102, "Hidden");
        hidden["workflow_state"] = json!("unpublished");
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                course_json(101, "Databases"),
                hidden
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses/101/assignments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": 7,
                    "name": "Essay",
                    "due_at": "2025-01-10T12:00:00Z",
                    "workflow_state": "published"
                },
                {
                    "id": 8,
                    "name": "Undated quiz",
                    "due_at": null,
                    "workflow_state": "published"
                },
                {
                    "id": 9,
                    "name": "Draft",
                    "due_at": "2025-01-11T12:00:00Z",
                    "workflow_state": "unpublished"
                }
            ])))
            .mount(&server)
            .await;

        let assignments = client()
            .list_assignments(&credential(&server))
            .await
            .unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].id, "7");
        assert_eq!(assignments[0].course_id, "101");
        assert_eq!(
            assignments[0].due_at,
            Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn one_failing_course_page_fails_the_whole_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                course_json(101, "Databases")
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/courses/101/assignments"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        // Never a silent partial snapshot.
        let result = client().list_assignments(&credential(&server)).await;
        assert!(matches!(result, Err(GatewayError::Transient(_))));
    }
}
