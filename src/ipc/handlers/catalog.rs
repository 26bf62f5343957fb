use crate::catalog::{self, StepPatch};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{optional_i64, optional_str, required_str, with_write_tx};
use crate::ipc::types::{AppState, Request};
use crate::progress::{self, Level};
use serde_json::json;

fn handle_profiles_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let username = required_str(req, "username")?;
        let id = catalog::create_profile(conn, username)?;
        Ok(json!({ "profileId": id }))
    })
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let owner = required_str(req, "ownerId")?;
        let title = required_str(req, "title")?;
        let id = catalog::create_course(conn, owner, title)?;
        Ok(json!({ "courseId": id }))
    })
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let id = required_str(req, "courseId")?;
        catalog::delete_course(conn, id)?;
        Ok(json!({ "ok": true }))
    })
}

fn handle_collections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let owner = required_str(req, "ownerId")?;
        let title = required_str(req, "title")?;
        let id = catalog::create_collection(conn, owner, title)?;
        Ok(json!({ "collectionId": id }))
    })
}

fn handle_collections_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let id = required_str(req, "collectionId")?;
        catalog::delete_collection(conn, id)?;
        Ok(json!({ "ok": true }))
    })
}

fn handle_collections_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let collection_id = required_str(req, "collectionId")?;
        let added_at = catalog::add_collection(conn, profile_id, collection_id)?;
        Ok(json!({ "collectionId": collection_id, "addedAt": added_at }))
    })
}

fn handle_collections_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let profile_id = required_str(req, "profileId")?;
        let collection_id = required_str(req, "collectionId")?;
        let outcome = catalog::remove_collection(conn, profile_id, collection_id)?;
        Ok(json!({
            "collectionId": collection_id,
            "rating": outcome.rating,
            "stars": outcome.stars.breakdown_json(),
        }))
    })
}

fn handle_themes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let course = required_str(req, "courseId")?;
        let title = required_str(req, "title")?;
        let id = catalog::create_theme(conn, course, title)?;
        Ok(json!({ "themeId": id }))
    })
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let theme = required_str(req, "themeId")?;
        let title = required_str(req, "title")?;
        let id = catalog::create_lesson(conn, theme, title)?;
        Ok(json!({ "lessonId": id }))
    })
}

fn handle_node_delete(
    state: &mut AppState,
    req: &Request,
    level: Level,
    key: &'static str,
) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let id = required_str(req, key)?;
        progress::delete_node(conn, level, id)?;
        Ok(json!({ "ok": true }))
    })
}

fn handle_steps_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let lesson = required_str(req, "lessonId")?;
        let title = required_str(req, "title")?;
        let content = optional_str(req, "content")?.unwrap_or("");
        let capacity = optional_i64(req, "capacity")?.unwrap_or(catalog::DEFAULT_STEP_CAPACITY);
        let id = catalog::create_step(conn, lesson, title, content, capacity)?;
        Ok(json!({ "stepId": id, "capacity": capacity }))
    })
}

fn handle_steps_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_write_tx(state, req, |conn| {
        let id = required_str(req, "stepId")?;
        let patch = StepPatch {
            title: optional_str(req, "title")?,
            content: optional_str(req, "content")?,
            capacity: optional_i64(req, "capacity")?,
        };
        if patch.title.is_none() && patch.content.is_none() && patch.capacity.is_none() {
            return Err(HandlerErr::bad_params(
                "steps.update needs title, content or capacity",
            ));
        }
        let capacity = catalog::update_step(conn, id, &patch)?;
        Ok(json!({ "stepId": id, "capacity": capacity }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "profiles.create" => Some(handle_profiles_create(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "collections.create" => Some(handle_collections_create(state, req)),
        "collections.delete" => Some(handle_collections_delete(state, req)),
        "collections.add" => Some(handle_collections_add(state, req)),
        "collections.remove" => Some(handle_collections_remove(state, req)),
        "themes.create" => Some(handle_themes_create(state, req)),
        "themes.delete" => Some(handle_node_delete(state, req, Level::Theme, "themeId")),
        "lessons.create" => Some(handle_lessons_create(state, req)),
        "lessons.delete" => Some(handle_node_delete(state, req, Level::Lesson, "lessonId")),
        "steps.create" => Some(handle_steps_create(state, req)),
        "steps.update" => Some(handle_steps_update(state, req)),
        "steps.delete" => Some(handle_node_delete(state, req, Level::Step, "stepId")),
        _ => None,
    }
}
