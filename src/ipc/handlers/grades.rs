use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{optional_str, required_i64, required_str, to_json, with_read, with_write_tx};
use crate::ipc::types::{AppState, Request};
use crate::rating::{self, RatedKind, RatingOutcome};
use serde_json::json;

fn entity_param(req: &Request) -> Result<(RatedKind, &str), HandlerErr> {
    let raw = required_str(req, "entity")?;
    let Some(kind) = RatedKind::parse(raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "params.entity must be \"course\" or \"collection\"".to_string(),
            details: Some(json!({ "entity": raw })),
        });
    };
    Ok((kind, required_str(req, "entityId")?))
}

fn outcome_json(outcome: RatingOutcome) -> serde_json::Value {
    json!({
        "rating": outcome.rating,
        "stars": outcome.stars.breakdown_json(),
    })
}

fn handle_grades_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let (kind, entity_id) = entity_param(req)?;
        let profile_id = required_str(req, "profileId")?;
        let value = required_i64(req, "value")?;
        rating::reject_self_rating(conn, kind, entity_id, profile_id)?;
        let outcome = rating::add_grade(conn, kind, entity_id, profile_id, value)?;
        Ok(outcome_json(outcome))
    })
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let (kind, entity_id) = entity_param(req)?;
        let profile_id = required_str(req, "profileId")?;
        let value = required_i64(req, "value")?;
        let outcome = rating::update_grade(conn, kind, entity_id, profile_id, value)?;
        Ok(outcome_json(outcome))
    })
}

fn handle_grades_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let (kind, entity_id) = entity_param(req)?;
        let profile_id = required_str(req, "profileId")?;
        let outcome = rating::remove_grade(conn, kind, entity_id, profile_id)?;
        Ok(outcome_json(outcome))
    })
}

fn handle_ratings_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_read(state, req, |conn| {
        let (kind, entity_id) = entity_param(req)?;
        let viewer = optional_str(req, "profileId")?;
        to_json(rating::rating_summary(conn, kind, entity_id, viewer))
    })
}

fn handle_ratings_stars(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_read(state, req, |conn| {
        let (kind, entity_id) = entity_param(req)?;
        Ok(rating::star_breakdown(conn, kind, entity_id)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.add" => Some(handle_grades_add(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.remove" => Some(handle_grades_remove(state, req)),
        "ratings.summary" => Some(handle_ratings_summary(state, req)),
        "ratings.stars" => Some(handle_ratings_stars(state, req)),
        _ => None,
    }
}
