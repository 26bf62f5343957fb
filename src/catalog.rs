use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::progress::{self, Level};
use crate::rating::{self, RatedKind, RatingOutcome};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

pub const DEFAULT_STEP_CAPACITY: i64 = 1;

fn require(conn: &Connection, table: &str, what: &'static str, id: &str) -> CoreResult<()> {
    if !db::row_exists(conn, table, id)? {
        return Err(CoreError::not_found(what, id));
    }
    Ok(())
}

fn require_title(title: &str) -> CoreResult<()> {
    if title.trim().is_empty() {
        return Err(CoreError::BadParams("title must not be empty".to_string()));
    }
    Ok(())
}

pub fn create_profile(conn: &Connection, username: &str) -> CoreResult<String> {
    let username = username.trim();
    if username.is_empty() {
        return Err(CoreError::BadParams("username must not be empty".to_string()));
    }
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM profiles WHERE username = ?",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(CoreError::BadParams(format!(
            "username already taken: {username}"
        )));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO profiles(id, username, created_at) VALUES(?, ?, ?)",
        (&id, username, db::now_stamp()),
    )?;
    Ok(id)
}

/// Creates a course with zeroed star buckets and the owner's membership row.
/// The owner is not studying the course until it starts it explicitly.
pub fn create_course(conn: &Connection, owner_id: &str, title: &str) -> CoreResult<String> {
    require_title(title)?;
    require(conn, "profiles", "profile", owner_id)?;
    let id = Uuid::new_v4().to_string();
    let now = db::now_stamp();
    conn.execute(
        "INSERT INTO courses(id, owner_id, title, created_at) VALUES(?, ?, ?, ?)",
        (&id, owner_id, title.trim(), &now),
    )?;
    rating::create_buckets(conn, RatedKind::Course, &id)?;
    conn.execute(
        "INSERT INTO enrollments(profile_id, course_id, status, added_at) VALUES(?, ?, NULL, ?)",
        (owner_id, &id, &now),
    )?;
    Ok(id)
}

pub fn create_collection(conn: &Connection, owner_id: &str, title: &str) -> CoreResult<String> {
    require_title(title)?;
    require(conn, "profiles", "profile", owner_id)?;
    let id = Uuid::new_v4().to_string();
    let now = db::now_stamp();
    conn.execute(
        "INSERT INTO collections(id, owner_id, title, created_at) VALUES(?, ?, ?, ?)",
        (&id, owner_id, title.trim(), &now),
    )?;
    rating::create_buckets(conn, RatedKind::Collection, &id)?;
    conn.execute(
        "INSERT INTO collection_members(profile_id, collection_id, added_at) VALUES(?, ?, ?)",
        (owner_id, &id, &now),
    )?;
    Ok(id)
}

pub fn delete_course(conn: &Connection, course_id: &str) -> CoreResult<()> {
    require(conn, "courses", "course", course_id)?;
    progress::delete_node(conn, Level::Course, course_id)?;
    rating::delete_buckets(conn, RatedKind::Course, course_id)?;
    Ok(())
}

pub fn delete_collection(conn: &Connection, collection_id: &str) -> CoreResult<()> {
    require(conn, "collections", "collection", collection_id)?;
    conn.execute(
        "DELETE FROM collection_members WHERE collection_id = ?",
        [collection_id],
    )?;
    rating::delete_buckets(conn, RatedKind::Collection, collection_id)?;
    conn.execute("DELETE FROM collections WHERE id = ?", [collection_id])?;
    Ok(())
}

/// Adds a collection to the profile's shelf. A profile that only rated the
/// collection so far gets its membership row marked as added.
pub fn add_collection(conn: &Connection, profile_id: &str, collection_id: &str) -> CoreResult<String> {
    require(conn, "profiles", "profile", profile_id)?;
    require(conn, "collections", "collection", collection_id)?;
    let added: Option<Option<String>> = conn
        .query_row(
            "SELECT added_at FROM collection_members WHERE profile_id = ? AND collection_id = ?",
            (profile_id, collection_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(Some(_)) = added {
        return Err(CoreError::BadParams(format!(
            "collection already added: {collection_id}"
        )));
    }
    let now = db::now_stamp();
    conn.execute(
        "INSERT INTO collection_members(profile_id, collection_id, added_at) VALUES(?, ?, ?)
         ON CONFLICT(profile_id, collection_id) DO UPDATE SET added_at = excluded.added_at",
        (profile_id, collection_id, &now),
    )?;
    Ok(now)
}

/// Drops the profile's membership row. A grade held on that row is taken
/// out of the star buckets first.
pub fn remove_collection(
    conn: &Connection,
    profile_id: &str,
    collection_id: &str,
) -> CoreResult<RatingOutcome> {
    require(conn, "collections", "collection", collection_id)?;
    let member: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM collection_members WHERE profile_id = ? AND collection_id = ?)",
        (profile_id, collection_id),
        |r| r.get(0),
    )?;
    if !member {
        return Err(CoreError::BadParams(format!(
            "collection already removed: {collection_id}"
        )));
    }
    let outcome = rating::remove_grade(conn, RatedKind::Collection, collection_id, profile_id)?;
    conn.execute(
        "DELETE FROM collection_members WHERE profile_id = ? AND collection_id = ?",
        (profile_id, collection_id),
    )?;
    Ok(outcome)
}

pub fn create_theme(conn: &Connection, course_id: &str, title: &str) -> CoreResult<String> {
    require_title(title)?;
    require(conn, "courses", "course", course_id)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO themes(id, course_id, title) VALUES(?, ?, ?)",
        (&id, course_id, title.trim()),
    )?;
    Ok(id)
}

pub fn create_lesson(conn: &Connection, theme_id: &str, title: &str) -> CoreResult<String> {
    require_title(title)?;
    require(conn, "themes", "theme", theme_id)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO lessons(id, theme_id, title) VALUES(?, ?, ?)",
        (&id, theme_id, title.trim()),
    )?;
    Ok(id)
}

/// New steps start empty and receive their capacity through propagation so
/// the ancestors pick it up.
pub fn create_step(
    conn: &Connection,
    lesson_id: &str,
    title: &str,
    content: &str,
    capacity: i64,
) -> CoreResult<String> {
    require_title(title)?;
    require(conn, "lessons", "lesson", lesson_id)?;
    if capacity < 0 {
        return Err(CoreError::BadParams(format!(
            "capacity must be >= 0, got {capacity}"
        )));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO steps(id, lesson_id, title, content, capacity) VALUES(?, ?, ?, ?, 0)",
        (&id, lesson_id, title.trim(), content),
    )?;
    progress::change_step_capacity(conn, &id, capacity)?;
    Ok(id)
}

#[derive(Debug, Default)]
pub struct StepPatch<'a> {
    pub title: Option<&'a str>,
    pub content: Option<&'a str>,
    pub capacity: Option<i64>,
}

pub fn update_step(conn: &Connection, step_id: &str, patch: &StepPatch<'_>) -> CoreResult<i64> {
    require(conn, "steps", "step", step_id)?;
    if let Some(title) = patch.title {
        require_title(title)?;
        conn.execute(
            "UPDATE steps SET title = ? WHERE id = ?",
            (title.trim(), step_id),
        )?;
    }
    if let Some(content) = patch.content {
        conn.execute(
            "UPDATE steps SET content = ? WHERE id = ?",
            (content, step_id),
        )?;
    }
    let capacity = match patch.capacity {
        Some(c) => progress::change_step_capacity(conn, step_id, c)?,
        None => conn.query_row("SELECT capacity FROM steps WHERE id = ?", [step_id], |r| {
            r.get(0)
        })?,
    };
    Ok(capacity)
}

pub fn step_content(conn: &Connection, step_id: &str) -> CoreResult<String> {
    conn.query_row("SELECT content FROM steps WHERE id = ?", [step_id], |r| {
        r.get(0)
    })
    .optional()?
    .ok_or_else(|| CoreError::not_found("step", step_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_course_has_owner_membership_and_empty_buckets() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("profile");
        let course = create_course(&conn, &owner, "Intro").expect("course");

        let stars = rating::load_buckets(&conn, RatedKind::Course, &course).expect("stars");
        assert_eq!(stars.total(), 0);
        let (status, added): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT status, added_at FROM enrollments WHERE profile_id = ? AND course_id = ?",
                (&owner, &course),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("membership");
        assert_eq!(status, None);
        assert!(added.is_some());
    }

    #[test]
    fn duplicate_username_and_blank_titles_are_rejected() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("profile");
        assert!(matches!(
            create_profile(&conn, "ada").unwrap_err(),
            CoreError::BadParams(_)
        ));
        assert!(matches!(
            create_course(&conn, &owner, "   ").unwrap_err(),
            CoreError::BadParams(_)
        ));
        assert!(matches!(
            create_theme(&conn, "nope", "T").unwrap_err(),
            CoreError::NotFound { what: "course", .. }
        ));
    }

    #[test]
    fn step_update_moves_capacity_and_keeps_content() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("profile");
        let course = create_course(&conn, &owner, "Intro").expect("course");
        let theme = create_theme(&conn, &course, "T").expect("theme");
        let lesson = create_lesson(&conn, &theme, "L").expect("lesson");
        let step = create_step(&conn, &lesson, "S", "<p>x</p>", DEFAULT_STEP_CAPACITY)
            .expect("step");

        let cap = update_step(
            &conn,
            &step,
            &StepPatch {
                title: Some("S2"),
                capacity: Some(3),
                ..StepPatch::default()
            },
        )
        .expect("update");
        assert_eq!(cap, 3);
        assert_eq!(step_content(&conn, &step).expect("content"), "<p>x</p>");
        let course_cap: i64 = conn
            .query_row("SELECT capacity FROM courses WHERE id = ?", [&course], |r| {
                r.get(0)
            })
            .expect("course capacity");
        assert_eq!(course_cap, 3);
    }

    #[test]
    fn deleting_course_removes_tree_and_buckets() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("profile");
        let course = create_course(&conn, &owner, "Intro").expect("course");
        let theme = create_theme(&conn, &course, "T").expect("theme");
        let lesson = create_lesson(&conn, &theme, "L").expect("lesson");
        create_step(&conn, &lesson, "S", "", 2).expect("step");

        delete_course(&conn, &course).expect("delete");
        assert!(!db::row_exists(&conn, "courses", &course).expect("exists"));
        assert!(!db::row_exists(&conn, "themes", &theme).expect("exists"));
        assert!(matches!(
            rating::load_buckets(&conn, RatedKind::Course, &course).unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[test]
    fn collection_shelf_add_marks_rated_row_and_rejects_repeats() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("owner");
        let reader = create_profile(&conn, "bob").expect("reader");
        let collection = create_collection(&conn, &owner, "Systems").expect("collection");

        rating::add_grade(&conn, RatedKind::Collection, &collection, &reader, 4).expect("grade");
        let added_at = |conn: &Connection| -> Option<String> {
            conn.query_row(
                "SELECT added_at FROM collection_members WHERE profile_id = ? AND collection_id = ?",
                (&reader, &collection),
                |r| r.get(0),
            )
            .expect("member row")
        };
        assert_eq!(added_at(&conn), None);

        add_collection(&conn, &reader, &collection).expect("add");
        assert!(added_at(&conn).is_some());
        assert!(matches!(
            add_collection(&conn, &reader, &collection).unwrap_err(),
            CoreError::BadParams(_)
        ));
        assert!(matches!(
            add_collection(&conn, &owner, &collection).unwrap_err(),
            CoreError::BadParams(_)
        ));
    }

    #[test]
    fn collection_shelf_remove_takes_grade_out_of_buckets() {
        let conn = db::open_memory();
        let owner = create_profile(&conn, "ada").expect("owner");
        let reader = create_profile(&conn, "bob").expect("reader");
        let other = create_profile(&conn, "cy").expect("other");
        let collection = create_collection(&conn, &owner, "Systems").expect("collection");

        add_collection(&conn, &reader, &collection).expect("add");
        rating::add_grade(&conn, RatedKind::Collection, &collection, &reader, 5).expect("grade");
        rating::add_grade(&conn, RatedKind::Collection, &collection, &other, 3).expect("grade");

        let outcome = remove_collection(&conn, &reader, &collection).expect("remove");
        assert_eq!(outcome.stars.five, 0);
        assert_eq!(outcome.stars.total(), 1);
        assert!((outcome.rating - 3.0).abs() < 1e-9);
        assert!(matches!(
            remove_collection(&conn, &reader, &collection).unwrap_err(),
            CoreError::BadParams(_)
        ));

        // Rating again after removal starts from a clean row.
        rating::add_grade(&conn, RatedKind::Collection, &collection, &reader, 2).expect("regrade");
        let stars = rating::load_buckets(&conn, RatedKind::Collection, &collection).expect("stars");
        assert_eq!(stars.total(), 2);
    }
}
