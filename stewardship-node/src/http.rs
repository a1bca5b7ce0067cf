//! HTTP API for the stewardship engine
//!
//! ## Policies
//! - `POST /policies` - Commit a policy draft
//! - `GET /policies/{subject}` - Current policy and history
//! - `GET /policies/{subject}/delta?since_version=N` - Policies newer than N
//! - `POST /policies/{id}/review` - Complete a scheduled review
//! - `POST /policies/{id}/revoke` - Revoke a policy
//! - `GET /policies/{subject}/computed` - Content, time and monitoring restrictions merged across stewards
//!
//! ## Grants and subjects
//! - `POST /grants` - Grant stewardship
//! - `POST /grants/{id}/delegate` - Delegate part of a grant
//! - `POST /grants/{id}/revoke` - Revoke a grant and its delegations
//! - `GET /stewards/{id}/grants` - Grants a steward holds
//! - `POST /subjects` - Register a subject
//! - `POST /subjects/{id}/disconnect` - Leave stewardship
//! - `POST /subjects/{id}/erasure` - Erase relationship data
//! - `POST /subjects/{id}/activity` - Report monitored activity
//! - `GET /subjects/{id}/activity?viewer=ID` - Retained activity, for the subject or a steward
//!
//! ## Appeals
//! - `POST /appeals` - File an appeal
//! - `GET /appeals/{id}` - Appeal state
//! - `POST /appeals/{id}/advance` - Move through due gates
//! - `POST /appeals/{id}/rebuttal` - Respondent's answer
//! - `POST /appeals/{id}/withdraw` - Withdraw before a decision
//! - `POST /appeals/{id}/reappeal` - The single re-appeal
//!
//! ## Enforcement and audit
//! - `GET /capabilities/{subject}/{capability_id}/check` - allow / deny / limited
//! - `POST /content/{subject}/check` - Check content against blocked categories, ratings and reach
//! - `POST /sessions/{subject}/check` - Check usage against time limits
//! - `POST /relationships` - Record or flag a relationship edge
//! - `GET /audit/export` - Timestamp-ordered audit events
//! - `GET /health` - Health check
//!
//! Path segments are percent-decoded, so ids may contain reserved
//! characters (`/subjects/ana%2Fb/activity`).
//!
//! Errors are returned as `{"error": "...", "kind": "..."}`.
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:8095/subjects \
//!      -d '{"id": "river", "date_of_birth": "2012-04-01"}'
//!
//! curl http://localhost:8095/capabilities/river/post/check
//!
//! curl "http://localhost:8095/policies/river/delta?since_version=2"
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use stewardship::{
    ActivityReport, AppealFiling, ContentCheck, DelegationRequest, Evidence, GrantRequest,
    InMemoryRelationshipGraph, LimitParams, PolicyDraft, RelationshipEdge,
    ReviewOutcome, SessionUsage, StewardshipEngine, WeightClass,
};

use crate::error::NodeError;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Deserialize)]
struct RegisterSubject {
    id: String,
    #[serde(default)]
    date_of_birth: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    #[serde(flatten)]
    outcome: ReviewOutcome,
    #[serde(default)]
    evidence: Option<Evidence>,
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    actor: String,
}

#[derive(Debug, Deserialize)]
struct RebuttalRequest {
    submitted_by: String,
    statement: String,
    #[serde(default)]
    evidence: Option<Evidence>,
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    by: String,
}

#[derive(Debug, Deserialize)]
struct ReAppealRequest {
    filed_by: String,
    grounds: String,
}

#[derive(Debug, Deserialize)]
struct RelationshipUpdate {
    subject_id: String,
    supporter_id: String,
    weight_class: WeightClass,
    #[serde(default)]
    flagging_concern: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaQuery {
    #[serde(default)]
    since_version: u64,
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    viewer: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
}

/// HTTP server state
pub struct HttpServer {
    engine: Arc<StewardshipEngine>,
    relationships: Arc<InMemoryRelationshipGraph>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server. `relationships` must be the graph the engine
    /// reads from.
    pub fn new(
        engine: Arc<StewardshipEngine>,
        relationships: Arc<InMemoryRelationshipGraph>,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            engine,
            relationships,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<HttpResponse, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let body = req.into_body().collect().await?.to_bytes();
        Ok(self.route(method, &path, query.as_deref(), body).await)
    }

    /// Route a request to its handler. Never fails; errors become JSON bodies.
    pub async fn route(&self, method: Method, path: &str, query: Option<&str>, body: Bytes) -> HttpResponse {
        debug!(method = %method, path = %path, "Incoming request");

        let result = match decode_segments(path) {
            Ok(decoded) => {
                let segments: Vec<&str> = decoded.iter().map(|s| s.as_ref()).collect();
                self.dispatch(&method, &segments, path, query, &body).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!(method = %method, path = %path, error = %e, "Request error");
                } else {
                    debug!(method = %method, path = %path, error = %e, "Request rejected");
                }
                json_response(
                    status,
                    &ErrorBody {
                        error: e.to_string(),
                        kind: e.kind(),
                    },
                )
            }
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        segments: &[&str],
        path: &str,
        query: Option<&str>,
        body: &Bytes,
    ) -> Result<HttpResponse, NodeError> {
        match (method, segments) {
            (&Method::GET, ["health"]) => self.handle_health().await,

            // Policies
            (&Method::POST, ["policies"]) => self.handle_commit(body),
            (&Method::GET, ["policies", subject]) => self.handle_get_policies(subject),
            (&Method::GET, ["policies", subject, "delta"]) => self.handle_delta(subject, query),
            (&Method::POST, ["policies", id, "review"]) => self.handle_review(id, body),
            (&Method::POST, ["policies", id, "revoke"]) => self.handle_revoke_policy(id, body),
            (&Method::GET, ["policies", subject, "computed"]) => self.handle_computed(subject),

            // Grants and subjects
            (&Method::POST, ["grants"]) => self.handle_grant(body),
            (&Method::POST, ["grants", id, "delegate"]) => self.handle_delegate(id, body),
            (&Method::POST, ["grants", id, "revoke"]) => self.handle_revoke_grant(id),
            (&Method::GET, ["stewards", id, "grants"]) => self.handle_steward_grants(id),
            (&Method::POST, ["subjects"]) => self.handle_register_subject(body),
            (&Method::POST, ["subjects", id, "disconnect"]) => self.handle_disconnect(id),
            (&Method::POST, ["subjects", id, "erasure"]) => self.handle_erasure(id).await,
            (&Method::POST, ["subjects", id, "activity"]) => self.handle_log_activity(id, body),
            (&Method::GET, ["subjects", id, "activity"]) => self.handle_activity(id, query),

            // Appeals
            (&Method::POST, ["appeals"]) => self.handle_file_appeal(body),
            (&Method::GET, ["appeals", id]) => self.handle_get_appeal(id),
            (&Method::POST, ["appeals", id, "advance"]) => self.handle_advance(id).await,
            (&Method::POST, ["appeals", id, "rebuttal"]) => self.handle_rebuttal(id, body),
            (&Method::POST, ["appeals", id, "withdraw"]) => self.handle_withdraw(id, body),
            (&Method::POST, ["appeals", id, "reappeal"]) => self.handle_re_appeal(id, body),

            // Enforcement
            (&Method::GET, ["capabilities", subject, capability, "check"]) => {
                self.handle_check(subject, capability, query)
            }
            (&Method::POST, ["content", subject, "check"]) => self.handle_content_check(subject, body),
            (&Method::POST, ["sessions", subject, "check"]) => self.handle_session_check(subject, body),
            (&Method::POST, ["relationships"]) => self.handle_relationship(body),

            (&Method::GET, ["audit", "export"]) => self.handle_audit_export(),

            _ => Err(NodeError::NotFound(format!("{} {}", method, path))),
        }
    }

    /// GET /health
    async fn handle_health(&self) -> Result<HttpResponse, NodeError> {
        let body = serde_json::json!({
            "status": "ok",
            "reviewer": self.engine.appeals().reviewer_id(),
            "open_appeals": self.engine.appeals().open_appeals().len(),
            "audit_events": self.engine.store().audit().len(),
            "graph_available": self.engine.graph().is_available().await,
        });
        Ok(json_response(StatusCode::OK, &body))
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// POST /policies
    fn handle_commit(&self, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let draft: PolicyDraft = parse_body(body)?;
        let policy = self.engine.store().commit(draft)?;
        info!(
            policy = %policy.id,
            subject = %policy.subject_id,
            version = policy.version,
            "Policy committed via API"
        );
        Ok(json_response(StatusCode::CREATED, &policy))
    }

    /// GET /policies/{subject}
    fn handle_get_policies(&self, subject_id: &str) -> Result<HttpResponse, NodeError> {
        let store = self.engine.store();
        let body = serde_json::json!({
            "subject": store.subject(subject_id)?,
            "current": store.current(subject_id)?,
            "history": store.history(subject_id)?,
        });
        Ok(json_response(StatusCode::OK, &body))
    }

    /// GET /policies/{subject}/delta
    fn handle_delta(&self, subject_id: &str, query: Option<&str>) -> Result<HttpResponse, NodeError> {
        let params: DeltaQuery = match query {
            Some(q) => serde_urlencoded::from_str(q)?,
            None => DeltaQuery::default(),
        };
        let policies = self.engine.store().delta(subject_id, params.since_version)?;
        Ok(json_response(StatusCode::OK, &policies))
    }

    /// POST /policies/{id}/review
    fn handle_review(&self, policy_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: ReviewRequest = parse_body(body)?;
        let policy = self
            .engine
            .scheduler()
            .complete_review(policy_id, request.outcome, request.evidence)?;
        Ok(json_response(StatusCode::OK, &policy))
    }

    /// POST /policies/{id}/revoke
    fn handle_revoke_policy(&self, policy_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: RevokeRequest = parse_body(body)?;
        let policy = self.engine.store().revoke(policy_id, &request.actor)?;
        Ok(json_response(StatusCode::OK, &policy))
    }

    /// GET /policies/{subject}/computed
    fn handle_computed(&self, subject_id: &str) -> Result<HttpResponse, NodeError> {
        let computed = self.engine.computed_restrictions(subject_id)?;
        Ok(json_response(StatusCode::OK, &computed))
    }

    // =========================================================================
    // Grants and subjects
    // =========================================================================

    /// POST /grants
    fn handle_grant(&self, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: GrantRequest = parse_body(body)?;
        let grant = self.engine.store().grant(request)?;
        Ok(json_response(StatusCode::CREATED, &grant))
    }

    /// POST /grants/{id}/delegate
    fn handle_delegate(&self, grant_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: DelegationRequest = parse_body(body)?;
        let grant = self.engine.store().delegate(grant_id, request)?;
        Ok(json_response(StatusCode::CREATED, &grant))
    }

    /// POST /grants/{id}/revoke
    fn handle_revoke_grant(&self, grant_id: &str) -> Result<HttpResponse, NodeError> {
        let revoked = self.engine.store().revoke_grant(grant_id)?;
        Ok(json_response(StatusCode::OK, &revoked))
    }

    /// GET /stewards/{id}/grants
    fn handle_steward_grants(&self, steward_id: &str) -> Result<HttpResponse, NodeError> {
        let grants = self.engine.store().grants_for_steward(steward_id)?;
        Ok(json_response(StatusCode::OK, &grants))
    }

    /// POST /subjects
    fn handle_register_subject(&self, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: RegisterSubject = parse_body(body)?;
        if request.id.trim().is_empty() {
            return Err(NodeError::BadRequest("subject id must not be empty".to_string()));
        }
        let subject = self
            .engine
            .store()
            .register_subject(&request.id, request.date_of_birth)?;
        Ok(json_response(StatusCode::CREATED, &subject))
    }

    /// POST /subjects/{id}/disconnect
    fn handle_disconnect(&self, subject_id: &str) -> Result<HttpResponse, NodeError> {
        let report = self.engine.request_disconnection(subject_id)?;
        Ok(json_response(StatusCode::OK, &report))
    }

    /// POST /subjects/{id}/erasure
    async fn handle_erasure(&self, subject_id: &str) -> Result<HttpResponse, NodeError> {
        let report = self.engine.request_erasure(subject_id).await?;
        Ok(json_response(StatusCode::OK, &report))
    }

    /// POST /subjects/{id}/activity
    fn handle_log_activity(&self, subject_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let report: ActivityReport = parse_body(body)?;
        let entry = self.engine.log_activity(subject_id, report)?;
        Ok(json_response(StatusCode::CREATED, &entry))
    }

    /// GET /subjects/{id}/activity?viewer=ID
    fn handle_activity(&self, subject_id: &str, query: Option<&str>) -> Result<HttpResponse, NodeError> {
        let Some(query) = query.filter(|q| !q.is_empty()) else {
            return Err(NodeError::BadRequest("viewer is required".to_string()));
        };
        let params: ActivityQuery = serde_urlencoded::from_str(query)?;
        let entries = self.engine.activity_for(subject_id, &params.viewer)?;
        Ok(json_response(StatusCode::OK, &entries))
    }

    // =========================================================================
    // Appeals
    // =========================================================================

    /// POST /appeals
    fn handle_file_appeal(&self, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let filing: AppealFiling = parse_body(body)?;
        let id = self.engine.appeals().file(filing);
        let appeal = self.engine.appeals().require(&id)?;
        Ok(json_response(StatusCode::CREATED, &appeal))
    }

    /// GET /appeals/{id}
    fn handle_get_appeal(&self, appeal_id: &str) -> Result<HttpResponse, NodeError> {
        let appeal = self.engine.appeals().require(appeal_id)?;
        Ok(json_response(StatusCode::OK, &appeal))
    }

    /// POST /appeals/{id}/advance
    async fn handle_advance(&self, appeal_id: &str) -> Result<HttpResponse, NodeError> {
        let appeal = self.engine.appeals().advance(appeal_id).await?;
        Ok(json_response(StatusCode::OK, &appeal))
    }

    /// POST /appeals/{id}/rebuttal
    fn handle_rebuttal(&self, appeal_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: RebuttalRequest = parse_body(body)?;
        let appeal = self.engine.appeals().submit_rebuttal(
            appeal_id,
            &request.submitted_by,
            &request.statement,
            request.evidence,
        )?;
        Ok(json_response(StatusCode::OK, &appeal))
    }

    /// POST /appeals/{id}/withdraw
    fn handle_withdraw(&self, appeal_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: WithdrawRequest = parse_body(body)?;
        let appeal = self.engine.appeals().withdraw(appeal_id, &request.by)?;
        Ok(json_response(StatusCode::OK, &appeal))
    }

    /// POST /appeals/{id}/reappeal
    fn handle_re_appeal(&self, appeal_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let request: ReAppealRequest = parse_body(body)?;
        let id = self
            .engine
            .appeals()
            .re_appeal(appeal_id, &request.filed_by, &request.grounds)?;
        let appeal = self.engine.appeals().require(&id)?;
        Ok(json_response(StatusCode::CREATED, &appeal))
    }

    // =========================================================================
    // Enforcement
    // =========================================================================

    /// GET /capabilities/{subject}/{capability_id}/check
    ///
    /// Query parameters are the requested limits, e.g. `?max_per_day=20`.
    fn handle_check(
        &self,
        subject_id: &str,
        capability_id: &str,
        query: Option<&str>,
    ) -> Result<HttpResponse, NodeError> {
        let requested: BTreeMap<String, u64> = match query {
            Some(q) if !q.is_empty() => serde_urlencoded::from_str(q)?,
            _ => BTreeMap::new(),
        };
        let decision = self
            .engine
            .check(subject_id, capability_id, &LimitParams(requested))?;
        Ok(json_response(StatusCode::OK, &decision))
    }

    /// POST /content/{subject}/check
    fn handle_content_check(&self, subject_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let check: ContentCheck = parse_body(body)?;
        let decision = self.engine.check_content(subject_id, &check)?;
        Ok(json_response(StatusCode::OK, &decision))
    }

    /// POST /sessions/{subject}/check
    ///
    /// An empty body checks a session that has not used any time yet.
    fn handle_session_check(&self, subject_id: &str, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let usage: SessionUsage = if body.is_empty() {
            SessionUsage::default()
        } else {
            serde_json::from_slice(body)?
        };
        let decision = self.engine.check_session(subject_id, &usage)?;
        Ok(json_response(StatusCode::OK, &decision))
    }

    /// POST /relationships
    fn handle_relationship(&self, body: &Bytes) -> Result<HttpResponse, NodeError> {
        let update: RelationshipUpdate = parse_body(body)?;
        if update.subject_id == update.supporter_id {
            return Err(NodeError::BadRequest(
                "an agent cannot hold a relationship with themselves".to_string(),
            ));
        }
        let now = self.engine.store().clock().now();
        let edge = RelationshipEdge {
            subject_id: update.subject_id,
            supporter_id: update.supporter_id,
            weight_class: update.weight_class,
            flagging_concern: update.flagging_concern,
            flagged_at: update.flagging_concern.then_some(now),
        };
        self.relationships.record(edge.clone());
        Ok(json_response(StatusCode::OK, &edge))
    }

    /// GET /audit/export
    fn handle_audit_export(&self) -> Result<HttpResponse, NodeError> {
        let events = self.engine.store().audit().export()?;
        Ok(json_response(StatusCode::OK, &events))
    }
}

/// Split a request path into percent-decoded segments.
fn decode_segments(path: &str) -> Result<Vec<Cow<'_, str>>, NodeError> {
    path.trim_matches('/')
        .split('/')
        .map(|segment| {
            urlencoding::decode(segment).map_err(|_| {
                NodeError::BadRequest(format!("path segment '{}' is not valid UTF-8", segment))
            })
        })
        .collect()
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, NodeError> {
    if body.is_empty() {
        return Err(NodeError::BadRequest("request body is required".to_string()));
    }
    Ok(serde_json::from_slice(body)?)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    let body = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, message: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}
