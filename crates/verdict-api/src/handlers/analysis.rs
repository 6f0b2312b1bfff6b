//! Incident analysis handlers.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use verdict_core::events::ProgressEvent;
use verdict_core::state::RawAnalysisRequest;
use verdict_core::Error;

use crate::AppState;

/// Error envelope returned to clients.
pub struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::RunTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({"error": self.0.to_string()}));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

/// `POST /api/v1/analyze`: run the full pipeline on one request.
pub async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<RawAnalysisRequest>,
) -> Result<Json<verdict_core::response::AnalysisResponse>, ApiError> {
    info!(query = %request.query, "analysis requested");
    let response = state.orchestrator.analyze(request).await?;
    state
        .runs
        .insert(response.analysis_id.clone(), response.clone());
    Ok(Json(response))
}

/// `GET /api/v1/analyze/{id}`: fetch a finished run.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<verdict_core::response::AnalysisResponse>, StatusCode> {
    state
        .runs
        .get(&id)
        .map(|entry| Json(entry.value().clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /api/v1/analyze/{id}/events`: stream this run's stage events.
/// A run that already finished replays its terminal event.
pub async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let analysis_id: Uuid = id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    // Replay for finished runs.
    let replay = state.runs.get(&id).map(|entry| ProgressEvent::Completed {
        analysis_id,
        response: Box::new(entry.value().clone()),
    });

    let receiver = state.orchestrator.subscribe();
    let stream = event_stream(analysis_id, receiver, replay);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_stream(
    analysis_id: Uuid,
    receiver: broadcast::Receiver<ProgressEvent>,
    replay: Option<ProgressEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    enum StreamState {
        Replay(ProgressEvent),
        Live(broadcast::Receiver<ProgressEvent>),
        Done,
    }

    let initial = match replay {
        Some(event) => StreamState::Replay(event),
        None => StreamState::Live(receiver),
    };

    futures::stream::unfold(initial, move |stream_state| async move {
        match stream_state {
            StreamState::Done => None,
            StreamState::Replay(event) => {
                let sse = to_sse_event(&event)?;
                Some((Ok(sse), StreamState::Done))
            }
            StreamState::Live(mut receiver) => loop {
                match receiver.recv().await {
                    Ok(event) if event.analysis_id() == analysis_id => {
                        let terminal = matches!(event, ProgressEvent::Completed { .. });
                        let Some(sse) = to_sse_event(&event) else {
                            continue;
                        };
                        let next = if terminal {
                            StreamState::Done
                        } else {
                            StreamState::Live(receiver)
                        };
                        return Some((Ok(sse), next));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    })
}

fn to_sse_event(event: &ProgressEvent) -> Option<Event> {
    let name = match event {
        ProgressEvent::Stage(_) => "stage",
        ProgressEvent::Completed { .. } => "completed",
    };
    Event::default().event(name).json_data(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use verdict_core::events::{Stage, StageEvent, StageStatus};
    use verdict_core::response::{AnalysisResponse, Decision};

    fn response(analysis_id: Uuid) -> AnalysisResponse {
        AnalysisResponse {
            analysis_id: analysis_id.to_string(),
            status: Decision::Refuse,
            confidence: 0.0,
            root_cause: None,
            evidence: None,
            timeline: None,
            recommended_actions: None,
            alternative_hypotheses: None,
            missing_evidence: None,
            processing_time_ms: 1,
            agent_history: vec![],
            errors: None,
        }
    }

    #[tokio::test]
    async fn stream_filters_by_analysis_id_and_ends_on_terminal() {
        let (sender, receiver) = broadcast::channel(16);
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();

        sender
            .send(ProgressEvent::Stage(StageEvent {
                analysis_id: other,
                stage: Stage::Planner,
                status: StageStatus::Completed,
                evidence_count: None,
                confidence: None,
                error: None,
            }))
            .unwrap();
        sender
            .send(ProgressEvent::Stage(StageEvent {
                analysis_id: target,
                stage: Stage::Planner,
                status: StageStatus::Completed,
                evidence_count: None,
                confidence: None,
                error: None,
            }))
            .unwrap();
        sender
            .send(ProgressEvent::Completed {
                analysis_id: target,
                response: Box::new(response(target)),
            })
            .unwrap();

        let events: Vec<_> = event_stream(target, receiver, None).collect().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn finished_run_replays_terminal_event() {
        let (_sender, receiver) = broadcast::channel(16);
        let target = Uuid::new_v4();
        let replay = ProgressEvent::Completed {
            analysis_id: target,
            response: Box::new(response(target)),
        };

        let events: Vec<_> = event_stream(target, receiver, Some(replay)).collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn error_mapping() {
        let bad = ApiError(Error::invalid_request("empty query")).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let internal = ApiError(Error::invariant("bug")).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
