use crate::subsystems::orchestrator::{CreateSessionRequest, Orchestrator, SessionLaunch};
use subbot_core::ipc::{SubbotRequest, SubbotResponse, PROTOCOL_VERSION};
use subbot_core::models::{EventFilter, SessionRecord};
use subbot_core::SubbotError;

const DEFAULT_ACTOR: &str = "operator";

pub async fn handle_request(request: SubbotRequest, orchestrator: &Orchestrator) -> SubbotResponse {
    match dispatch(request, orchestrator).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Request failed ({}): {}", e.kind(), e);
            SubbotResponse::from_error(&e)
        }
    }
}

async fn dispatch(
    request: SubbotRequest,
    orchestrator: &Orchestrator,
) -> Result<SubbotResponse, SubbotError> {
    let response = match request {
        SubbotRequest::Ping => SubbotResponse::pong(),
        SubbotRequest::Health => {
            let backend = match orchestrator.store().health_check().await {
                Ok(v) => v,
                Err(e) => return Ok(SubbotResponse::err(format!("Store health check failed: {}", e))),
            };
            SubbotResponse::ok(
                "healthy",
                serde_json::json!({
                    "status": "healthy",
                    "store": backend,
                    "live_sessions": orchestrator.live_sessions(),
                    "capacity_in_use": orchestrator.supervisor().registry().limiter().in_use(),
                    "protocol": PROTOCOL_VERSION,
                }),
            )
        }
        SubbotRequest::CreateSession {
            owner,
            display_name,
            method,
            phone_number,
        } => {
            let launch = orchestrator
                .create_session(CreateSessionRequest {
                    owner,
                    display_name,
                    method,
                    phone_number,
                })
                .await?;
            SubbotResponse::ok(
                format!("Session {} created", launch.session.code),
                launch_json(&launch),
            )
        }
        SubbotRequest::GetSession { code } => {
            let record = orchestrator.get_session(&code).await?;
            SubbotResponse::ok(format!("Session {}", code), session_json(&record))
        }
        SubbotRequest::ListSessions { owner } => {
            let records = orchestrator.list_sessions(&owner).await?;
            SubbotResponse::ok(
                format!("{} sessions for {}", records.len(), owner),
                sessions_json(&records),
            )
        }
        SubbotRequest::ListAllSessions => {
            let records = orchestrator.list_all_sessions().await?;
            SubbotResponse::ok(format!("{} sessions", records.len()), sessions_json(&records))
        }
        SubbotRequest::DeactivateSession { code, actor } => {
            let actor = actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
            let record = orchestrator.deactivate_session(&code, &actor).await?;
            SubbotResponse::ok(format!("Session {} deactivated", code), session_json(&record))
        }
        SubbotRequest::RevokeSession { code, actor } => {
            let actor = actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
            orchestrator.revoke_session(&code, &actor).await?;
            SubbotResponse::ok(
                format!("Session {} revoked", code),
                serde_json::json!({ "code": code, "revoked": true }),
            )
        }
        SubbotRequest::ReauthenticateSession {
            code,
            method,
            phone_number,
            actor,
        } => {
            let actor = actor.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
            let launch = orchestrator
                .reauthenticate_session(&code, method, phone_number, &actor)
                .await?;
            SubbotResponse::ok(
                format!("Session {} re-authenticating", code),
                launch_json(&launch),
            )
        }
        SubbotRequest::RelaunchSession { code } => {
            let record = orchestrator.relaunch_session(&code).await?;
            SubbotResponse::ok(
                format!("Session {} relaunched ({})", code, record.status),
                session_json(&record),
            )
        }
        SubbotRequest::RecordMessage { code } => {
            let count = orchestrator.record_message(&code).await?;
            SubbotResponse::ok(
                format!("Session {} has handled {} messages", code, count),
                serde_json::json!({ "code": code, "message_count": count }),
            )
        }
        SubbotRequest::Events {
            code,
            event_kind,
            limit,
            offset,
        } => {
            let filter = EventFilter {
                code,
                event_kind,
                limit,
                offset,
            };
            let events = orchestrator.events(&filter).await?;
            SubbotResponse::ok(
                format!("{} events", events.len()),
                serde_json::json!({
                    "count": events.len(),
                    "limit": filter.effective_limit(),
                    "offset": filter.effective_offset(),
                    "events": events,
                }),
            )
        }
        SubbotRequest::GlobalActivation => {
            let state = orchestrator.global_activation().await?;
            SubbotResponse::ok(
                if state.is_on { "Bot is on" } else { "Bot is off" },
                to_json(&state),
            )
        }
        SubbotRequest::SetGlobalActivation { is_on, actor } => {
            let state = orchestrator.set_global_activation(is_on, &actor).await?;
            SubbotResponse::ok(
                format!("Bot turned {} by {}", if is_on { "on" } else { "off" }, actor),
                to_json(&state),
            )
        }
        SubbotRequest::GroupActivation { group } => {
            let state = orchestrator.group_activation(&group).await?;
            SubbotResponse::ok(format!("Group {}", group), to_json(&state))
        }
        SubbotRequest::SetGroupActivation {
            group,
            is_active,
            actor,
        } => {
            let state = orchestrator
                .set_group_activation(&group, is_active, &actor)
                .await?;
            SubbotResponse::ok(
                format!(
                    "Group {} {}",
                    group,
                    if is_active { "enabled" } else { "disabled" }
                ),
                to_json(&state),
            )
        }
    };
    Ok(response)
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Public view of a record. The credential handle never leaves the process.
pub fn session_json(record: &SessionRecord) -> serde_json::Value {
    let mut value = to_json(record);
    if let Some(map) = value.as_object_mut() {
        map.remove("auth_data_path");
        map.insert(
            "has_credentials".to_string(),
            serde_json::Value::Bool(record.has_credentials()),
        );
    }
    value
}

fn sessions_json(records: &[SessionRecord]) -> serde_json::Value {
    serde_json::json!({
        "count": records.len(),
        "sessions": records.iter().map(session_json).collect::<Vec<_>>(),
    })
}

fn launch_json(launch: &SessionLaunch) -> serde_json::Value {
    serde_json::json!({
        "session": session_json(&launch.session),
        "challenge": to_json(&launch.challenge),
    })
}
