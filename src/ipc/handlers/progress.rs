use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{required_str, to_json, with_read, with_write_tx};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, Level};
use serde_json::json;

fn handle_courses_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let course_id = required_str(req, "courseId")?;
        let status = progress::enroll(conn, profile_id, course_id)?;
        tracing::info!(profile_id, course_id, "course started");
        Ok(json!({ "status": status }))
    })
}

fn handle_courses_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let course_id = required_str(req, "courseId")?;
        let status = progress::complete_course(conn, profile_id, course_id)?;
        Ok(json!({ "status": status }))
    })
}

fn handle_steps_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let step_id = required_str(req, "stepId")?;
        to_json(progress::open_step(conn, profile_id, step_id))
    })
}

fn handle_steps_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let step_id = required_str(req, "stepId")?;
        to_json(progress::mark_step_complete(conn, profile_id, step_id))
    })
}

fn handle_progress_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_read(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let raw_level = required_str(req, "level")?;
        let Some(level) = Level::parse(raw_level) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "params.level must be step, lesson, theme or course".to_string(),
                details: Some(json!({ "level": raw_level })),
            });
        };
        let node_id = required_str(req, "nodeId")?;
        to_json(progress::node_progress(conn, profile_id, level, node_id))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.start" => Some(handle_courses_start(state, req)),
        "courses.complete" => Some(handle_courses_complete(state, req)),
        "steps.open" => Some(handle_steps_open(state, req)),
        "steps.complete" => Some(handle_steps_complete(state, req)),
        "progress.get" => Some(handle_progress_get(state, req)),
        _ => None,
    }
}
