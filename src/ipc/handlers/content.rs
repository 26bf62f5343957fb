use crate::catalog;
use crate::content;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, with_read};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn nodes_json(html: &str) -> serde_json::Value {
    json!({ "nodes": content::parse(html) })
}

// Parsing needs no workspace. An empty document is valid input.
fn handle_content_parse(req: &Request) -> serde_json::Value {
    match req.params.get("html").and_then(|v| v.as_str()) {
        Some(html) => ok(&req.id, nodes_json(html)),
        None => err(&req.id, "bad_params", "missing params.html", None),
    }
}

fn handle_steps_content(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_read(state, req, |conn| {
        let step_id = required_str(req, "stepId")?;
        let html = catalog::step_content(conn, step_id)?;
        Ok(nodes_json(&html))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "content.parse" => Some(handle_content_parse(req)),
        "steps.content" => Some(handle_steps_content(state, req)),
        _ => None,
    }
}
