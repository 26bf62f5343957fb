use crate::db;
use crate::error::{CoreError, CoreResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

pub const STATUS_STUDYING: &str = "studying";
pub const STATUS_COMPLETED: &str = "completed";

/// One level of the course tree, leaf first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Step,
    Lesson,
    Theme,
    Course,
}

impl Level {
    /// Propagation order: every level's parent comes right after it.
    pub const ORDER: [Level; 4] = [Level::Step, Level::Lesson, Level::Theme, Level::Course];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "step" => Some(Level::Step),
            "lesson" => Some(Level::Lesson),
            "theme" => Some(Level::Theme),
            "course" => Some(Level::Course),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Step => "step",
            Level::Lesson => "lesson",
            Level::Theme => "theme",
            Level::Course => "course",
        }
    }

    fn index(self) -> usize {
        match self {
            Level::Step => 0,
            Level::Lesson => 1,
            Level::Theme => 2,
            Level::Course => 3,
        }
    }

    fn table(self) -> &'static str {
        match self {
            Level::Step => "steps",
            Level::Lesson => "lessons",
            Level::Theme => "themes",
            Level::Course => "courses",
        }
    }

    fn parent_column(self) -> Option<&'static str> {
        match self {
            Level::Step => Some("lesson_id"),
            Level::Lesson => Some("theme_id"),
            Level::Theme => Some("course_id"),
            Level::Course => None,
        }
    }

    fn child(self) -> Option<Level> {
        match self {
            Level::Step => None,
            Level::Lesson => Some(Level::Step),
            Level::Theme => Some(Level::Lesson),
            Level::Course => Some(Level::Theme),
        }
    }

    /// Table holding per-profile achieved progress and its node column.
    fn achieved_table(self) -> (&'static str, &'static str) {
        match self {
            Level::Step => ("profile_steps", "step_id"),
            Level::Lesson => ("profile_lessons", "lesson_id"),
            Level::Theme => ("profile_themes", "theme_id"),
            Level::Course => ("enrollments", "course_id"),
        }
    }
}

/// Node ids indexed by level. Used both for what a caller supplies and for
/// what resolution produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    ids: [Option<String>; 4],
}

impl Chain {
    pub fn at(level: Level, id: impl Into<String>) -> Self {
        let mut chain = Chain::default();
        chain.set(level, Some(id.into()));
        chain
    }

    #[cfg(test)]
    pub fn with(mut self, level: Level, id: impl Into<String>) -> Self {
        self.set(level, Some(id.into()));
        self
    }

    pub fn get(&self, level: Level) -> Option<&str> {
        self.ids[level.index()].as_deref()
    }

    fn set(&mut self, level: Level, id: Option<String>) {
        self.ids[level.index()] = id;
    }

    pub fn levels(&self) -> impl Iterator<Item = (Level, &str)> {
        Level::ORDER
            .into_iter()
            .filter_map(move |level| self.get(level).map(|id| (level, id)))
    }
}

/// Caller-supplied starting points for a propagation.
pub type Anchor = Chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter<'a> {
    Capacity,
    Achieved { profile_id: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub status: String,
    pub achieved: i64,
    pub capacity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProgress {
    pub achieved: i64,
    pub capacity: i64,
    pub is_complete: bool,
    pub over_achieved: bool,
}

fn parent_of(conn: &Connection, level: Level, id: &str) -> CoreResult<Option<String>> {
    let found: Option<Option<String>> = match level.parent_column() {
        Some(col) => {
            let sql = format!("SELECT {col} FROM {} WHERE id = ?", level.table());
            conn.query_row(&sql, [id], |r| r.get::<_, String>(0).map(Some))
                .optional()?
        }
        None => db::row_exists(conn, level.table(), id)?.then_some(None),
    };
    found.ok_or_else(|| CoreError::not_found(level.as_str(), id))
}

/// Decides which node receives the delta at each level, leaf to root: an id
/// the caller supplied wins, otherwise the parent of the node resolved one
/// level below, otherwise the level is skipped.
pub fn resolve_chain(conn: &Connection, anchor: &Anchor) -> CoreResult<Chain> {
    let mut chain = Chain::default();
    let mut derived: Option<String> = None;
    for level in Level::ORDER {
        let resolved = match anchor.get(level) {
            Some(id) => Some(id.to_string()),
            None => derived.take(),
        };
        derived = match &resolved {
            Some(id) => parent_of(conn, level, id)?,
            None => None,
        };
        chain.set(level, resolved);
    }
    Ok(chain)
}

fn read_capacity(conn: &Connection, level: Level, id: &str) -> CoreResult<i64> {
    let sql = format!("SELECT capacity FROM {} WHERE id = ?", level.table());
    conn.query_row(&sql, [id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| CoreError::not_found(level.as_str(), id))
}

fn ensure_achieved_row(conn: &Connection, level: Level, id: &str, profile_id: &str) -> CoreResult<()> {
    let (table, fk) = level.achieved_table();
    let sql = format!(
        "INSERT INTO {table}(profile_id, {fk}) VALUES(?, ?) ON CONFLICT(profile_id, {fk}) DO NOTHING"
    );
    conn.execute(&sql, (profile_id, id))?;
    Ok(())
}

fn read_achieved(conn: &Connection, level: Level, id: &str, profile_id: &str) -> CoreResult<Option<i64>> {
    let (table, fk) = level.achieved_table();
    let sql = format!("SELECT achieved FROM {table} WHERE profile_id = ? AND {fk} = ?");
    Ok(conn
        .query_row(&sql, (profile_id, id), |r| r.get(0))
        .optional()?)
}

fn apply_delta(
    conn: &Connection,
    level: Level,
    id: &str,
    delta: i64,
    counter: Counter<'_>,
) -> CoreResult<()> {
    match counter {
        Counter::Capacity => {
            let sql = format!("UPDATE {} SET capacity = capacity + ? WHERE id = ?", level.table());
            conn.execute(&sql, (delta, id))?;
            let value = read_capacity(conn, level, id)?;
            if value < 0 {
                return Err(CoreError::invariant(format!(
                    "capacity of {} {} would become {}",
                    level.as_str(),
                    id,
                    value
                )));
            }
        }
        Counter::Achieved { profile_id } => {
            ensure_achieved_row(conn, level, id, profile_id)?;
            let (table, fk) = level.achieved_table();
            let sql = format!(
                "UPDATE {table} SET achieved = achieved + ? WHERE profile_id = ? AND {fk} = ?"
            );
            conn.execute(&sql, (delta, profile_id, id))?;
            let value = read_achieved(conn, level, id, profile_id)?.unwrap_or(0);
            if value < 0 {
                return Err(CoreError::invariant(format!(
                    "achieved of profile {} at {} {} would become {}",
                    profile_id,
                    level.as_str(),
                    id,
                    value
                )));
            }
            // A shrink may leave a step over-achieved; a credit may not.
            if level == Level::Step && delta > 0 {
                let capacity = read_capacity(conn, level, id)?;
                if value > capacity {
                    return Err(CoreError::invariant(format!(
                        "achieved of profile {} at step {} would become {} over capacity {}",
                        profile_id, id, value, capacity
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Adds `delta` once at every node `resolve_chain` picks for `anchor`.
///
/// Must run inside a write transaction; on error the caller drops it so no
/// partial update survives.
pub fn propagate_delta(
    conn: &Connection,
    anchor: &Anchor,
    delta: i64,
    counter: Counter<'_>,
) -> CoreResult<Chain> {
    let chain = resolve_chain(conn, anchor)?;
    if delta == 0 {
        return Ok(chain);
    }
    for (level, id) in chain.levels() {
        apply_delta(conn, level, id, delta, counter)?;
    }
    tracing::debug!(?counter, delta, ?chain, "progress delta propagated");
    Ok(chain)
}

pub fn course_of(conn: &Connection, level: Level, id: &str) -> CoreResult<String> {
    let chain = resolve_chain(conn, &Chain::at(level, id))?;
    chain
        .get(Level::Course)
        .map(str::to_string)
        .ok_or_else(|| CoreError::not_found(level.as_str(), id))
}

fn enrollment_status(conn: &Connection, profile_id: &str, course_id: &str) -> CoreResult<Option<String>> {
    let status: Option<Option<String>> = conn
        .query_row(
            "SELECT status FROM enrollments WHERE profile_id = ? AND course_id = ?",
            (profile_id, course_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(status.flatten())
}

pub fn require_enrolled(conn: &Connection, profile_id: &str, course_id: &str) -> CoreResult<()> {
    if enrollment_status(conn, profile_id, course_id)?.is_none() {
        return Err(CoreError::NotEnrolled {
            profile: profile_id.to_string(),
            course: course_id.to_string(),
        });
    }
    Ok(())
}

/// Starts (or restarts) studying a course.
pub fn enroll(conn: &Connection, profile_id: &str, course_id: &str) -> CoreResult<String> {
    if !db::row_exists(conn, "profiles", profile_id)? {
        return Err(CoreError::not_found("profile", profile_id));
    }
    if !db::row_exists(conn, "courses", course_id)? {
        return Err(CoreError::not_found("course", course_id));
    }
    conn.execute(
        "INSERT INTO enrollments(profile_id, course_id, status, added_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(profile_id, course_id) DO UPDATE SET
           status = excluded.status,
           added_at = COALESCE(enrollments.added_at, excluded.added_at)",
        (profile_id, course_id, STATUS_STUDYING, db::now_stamp()),
    )?;
    Ok(STATUS_STUDYING.to_string())
}

pub fn complete_course(conn: &Connection, profile_id: &str, course_id: &str) -> CoreResult<String> {
    require_enrolled(conn, profile_id, course_id)?;
    conn.execute(
        "UPDATE enrollments SET status = ? WHERE profile_id = ? AND course_id = ?",
        (STATUS_COMPLETED, profile_id, course_id),
    )?;
    Ok(STATUS_COMPLETED.to_string())
}

fn step_progress(conn: &Connection, profile_id: &str, step_id: &str) -> CoreResult<StepProgress> {
    let capacity = read_capacity(conn, Level::Step, step_id)?;
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT status, achieved FROM profile_steps WHERE profile_id = ? AND step_id = ?",
            (profile_id, step_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (status, achieved) = row.unwrap_or_else(|| (STATUS_STUDYING.to_string(), 0));
    Ok(StepProgress {
        status,
        achieved,
        capacity,
    })
}

/// Records that the profile is working through a step of a course it studies.
pub fn open_step(conn: &Connection, profile_id: &str, step_id: &str) -> CoreResult<StepProgress> {
    let course_id = course_of(conn, Level::Step, step_id)?;
    require_enrolled(conn, profile_id, &course_id)?;
    ensure_achieved_row(conn, Level::Step, step_id, profile_id)?;
    step_progress(conn, profile_id, step_id)
}

/// Gives the profile full credit for a step. Completing a step twice changes
/// nothing; a completed step whose capacity has since grown is topped up.
pub fn mark_step_complete(conn: &Connection, profile_id: &str, step_id: &str) -> CoreResult<StepProgress> {
    let course_id = course_of(conn, Level::Step, step_id)?;
    require_enrolled(conn, profile_id, &course_id)?;
    ensure_achieved_row(conn, Level::Step, step_id, profile_id)?;

    let current = step_progress(conn, profile_id, step_id)?;
    if current.status == STATUS_COMPLETED && current.achieved >= current.capacity {
        return Ok(current);
    }

    propagate_delta(
        conn,
        &Chain::at(Level::Step, step_id),
        current.capacity - current.achieved,
        Counter::Achieved { profile_id },
    )?;
    conn.execute(
        "UPDATE profile_steps SET status = ? WHERE profile_id = ? AND step_id = ?",
        (STATUS_COMPLETED, profile_id, step_id),
    )?;
    tracing::info!(profile_id, step_id, course_id, "step completed");
    step_progress(conn, profile_id, step_id)
}

/// Sets a step's capacity and moves every ancestor by the difference.
/// Achieved progress already held against the step is left as it is.
pub fn change_step_capacity(conn: &Connection, step_id: &str, new_capacity: i64) -> CoreResult<i64> {
    if new_capacity < 0 {
        return Err(CoreError::BadParams(format!(
            "capacity must be >= 0, got {new_capacity}"
        )));
    }
    let old = read_capacity(conn, Level::Step, step_id)?;
    propagate_delta(
        conn,
        &Chain::at(Level::Step, step_id),
        new_capacity - old,
        Counter::Capacity,
    )?;
    Ok(new_capacity)
}

/// Withdraws a node's capacity and every profile's achieved progress from its
/// ancestors, then removes the node and everything below it.
pub fn delete_node(conn: &Connection, level: Level, id: &str) -> CoreResult<()> {
    let capacity = read_capacity(conn, level, id)?;
    let anchor = Chain::at(level, id);
    propagate_delta(conn, &anchor, -capacity, Counter::Capacity)?;

    let (table, fk) = level.achieved_table();
    let sql = format!("SELECT profile_id, achieved FROM {table} WHERE {fk} = ? AND achieved != 0");
    let holders = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (profile_id, achieved) in holders {
        propagate_delta(
            conn,
            &anchor,
            -achieved,
            Counter::Achieved {
                profile_id: &profile_id,
            },
        )?;
    }

    delete_subtree(conn, level, id)?;
    tracing::info!(level = level.as_str(), id, "progress node deleted");
    Ok(())
}

fn delete_subtree(conn: &Connection, level: Level, id: &str) -> CoreResult<()> {
    if let Some(child) = level.child() {
        let parent_col = child.parent_column().unwrap_or("id");
        let sql = format!("SELECT id FROM {} WHERE {parent_col} = ?", child.table());
        let children = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for child_id in children {
            delete_subtree(conn, child, &child_id)?;
        }
    }
    let (table, fk) = level.achieved_table();
    conn.execute(&format!("DELETE FROM {table} WHERE {fk} = ?"), [id])?;
    conn.execute(&format!("DELETE FROM {} WHERE id = ?", level.table()), [id])?;
    Ok(())
}

pub fn node_progress(
    conn: &Connection,
    profile_id: &str,
    level: Level,
    id: &str,
) -> CoreResult<NodeProgress> {
    let capacity = read_capacity(conn, level, id)?;
    let achieved = read_achieved(conn, level, id, profile_id)?;
    let is_complete = match level {
        Level::Step => step_progress(conn, profile_id, id)?.status == STATUS_COMPLETED,
        _ => achieved.is_some_and(|a| a >= capacity),
    };
    let achieved = achieved.unwrap_or(0);
    Ok(NodeProgress {
        achieved,
        capacity,
        is_complete,
        over_achieved: achieved > capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    struct Tree {
        owner: String,
        course: String,
        theme: String,
        lesson: String,
        steps: Vec<String>,
    }

    fn build_tree(conn: &Connection, name: &str, step_caps: &[i64]) -> Tree {
        let owner = catalog::create_profile(conn, &format!("{name}-owner")).expect("owner");
        let course = catalog::create_course(conn, &owner, name).expect("course");
        let theme = catalog::create_theme(conn, &course, "T").expect("theme");
        let lesson = catalog::create_lesson(conn, &theme, "L").expect("lesson");
        let steps = step_caps
            .iter()
            .enumerate()
            .map(|(i, cap)| {
                catalog::create_step(conn, &lesson, &format!("S{i}"), "", *cap).expect("step")
            })
            .collect();
        Tree {
            owner,
            course,
            theme,
            lesson,
            steps,
        }
    }

    fn cap(conn: &Connection, level: Level, id: &str) -> i64 {
        read_capacity(conn, level, id).expect("capacity")
    }

    fn achieved(conn: &Connection, profile: &str, level: Level, id: &str) -> i64 {
        read_achieved(conn, level, id, profile)
            .expect("achieved")
            .unwrap_or(0)
    }

    fn sum(conn: &Connection, sql: &str, id: &str) -> i64 {
        conn.query_row(sql, [id], |r| r.get(0)).expect("sum")
    }

    fn assert_capacity_consistent(conn: &Connection, course: &str) {
        let course_cap = cap(conn, Level::Course, course);
        let themes = sum(
            conn,
            "SELECT COALESCE(SUM(capacity), 0) FROM themes WHERE course_id = ?",
            course,
        );
        let lessons = sum(
            conn,
            "SELECT COALESCE(SUM(l.capacity), 0) FROM lessons l
             JOIN themes t ON t.id = l.theme_id WHERE t.course_id = ?",
            course,
        );
        let steps = sum(
            conn,
            "SELECT COALESCE(SUM(s.capacity), 0) FROM steps s
             JOIN lessons l ON l.id = s.lesson_id
             JOIN themes t ON t.id = l.theme_id WHERE t.course_id = ?",
            course,
        );
        assert_eq!(course_cap, themes);
        assert_eq!(themes, lessons);
        assert_eq!(lessons, steps);
    }

    #[test]
    fn resolve_with_nothing_given_touches_nothing() {
        let conn = db::open_memory();
        build_tree(&conn, "a", &[1]);
        let chain = resolve_chain(&conn, &Chain::default()).expect("resolve");
        assert_eq!(chain.levels().count(), 0);
    }

    #[test]
    fn resolve_from_step_derives_every_ancestor() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let chain = resolve_chain(&conn, &Chain::at(Level::Step, &t.steps[0])).expect("resolve");
        assert_eq!(chain.get(Level::Step), Some(t.steps[0].as_str()));
        assert_eq!(chain.get(Level::Lesson), Some(t.lesson.as_str()));
        assert_eq!(chain.get(Level::Theme), Some(t.theme.as_str()));
        assert_eq!(chain.get(Level::Course), Some(t.course.as_str()));
    }

    #[test]
    fn resolve_with_all_given_uses_explicit_ids() {
        let conn = db::open_memory();
        let a = build_tree(&conn, "a", &[1]);
        let b = build_tree(&conn, "b", &[1]);
        let anchor = Chain::at(Level::Step, &a.steps[0])
            .with(Level::Lesson, &b.lesson)
            .with(Level::Theme, &a.theme)
            .with(Level::Course, &b.course);
        let chain = resolve_chain(&conn, &anchor).expect("resolve");
        assert_eq!(chain, anchor);
    }

    #[test]
    fn resolve_with_partial_given_derives_from_resolved_level() {
        let conn = db::open_memory();
        let a = build_tree(&conn, "a", &[1]);
        let b = build_tree(&conn, "b", &[1]);
        // The explicit lesson wins over the step's own lesson, and the levels
        // above follow the explicit lesson rather than the step.
        let anchor = Chain::at(Level::Step, &a.steps[0]).with(Level::Lesson, &b.lesson);
        let chain = resolve_chain(&conn, &anchor).expect("resolve");
        assert_eq!(chain.get(Level::Step), Some(a.steps[0].as_str()));
        assert_eq!(chain.get(Level::Lesson), Some(b.lesson.as_str()));
        assert_eq!(chain.get(Level::Theme), Some(b.theme.as_str()));
        assert_eq!(chain.get(Level::Course), Some(b.course.as_str()));

        let from_theme = resolve_chain(&conn, &Chain::at(Level::Theme, &a.theme)).expect("theme");
        assert_eq!(from_theme.get(Level::Step), None);
        assert_eq!(from_theme.get(Level::Lesson), None);
        assert_eq!(from_theme.get(Level::Course), Some(a.course.as_str()));
    }

    #[test]
    fn resolve_unknown_node_is_not_found() {
        let conn = db::open_memory();
        let e = resolve_chain(&conn, &Chain::at(Level::Lesson, "missing")).unwrap_err();
        assert!(matches!(e, CoreError::NotFound { what: "lesson", .. }));
    }

    #[test]
    fn propagate_applies_delta_once_per_level() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[2, 3]);
        assert_eq!(cap(&conn, Level::Course, &t.course), 5);
        propagate_delta(&conn, &Chain::at(Level::Step, &t.steps[0]), 4, Counter::Capacity)
            .expect("propagate");
        assert_eq!(cap(&conn, Level::Step, &t.steps[0]), 6);
        assert_eq!(cap(&conn, Level::Lesson, &t.lesson), 9);
        assert_eq!(cap(&conn, Level::Theme, &t.theme), 9);
        assert_eq!(cap(&conn, Level::Course, &t.course), 9);
    }

    #[test]
    fn capacity_stays_consistent_across_changes() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1, 1, 1]);
        let theme2 = catalog::create_theme(&conn, &t.course, "T2").expect("theme");
        let lesson2 = catalog::create_lesson(&conn, &theme2, "L2").expect("lesson");
        let s = catalog::create_step(&conn, &lesson2, "x", "", 4).expect("step");

        for (step, c) in [
            (&t.steps[0], 5),
            (&s, 0),
            (&t.steps[2], 7),
            (&t.steps[0], 2),
            (&s, 3),
        ] {
            change_step_capacity(&conn, step, c).expect("change");
            assert_capacity_consistent(&conn, &t.course);
        }
        assert_eq!(cap(&conn, Level::Course, &t.course), 2 + 1 + 7 + 3);

        let e = change_step_capacity(&conn, &s, -1).unwrap_err();
        assert!(matches!(e, CoreError::BadParams(_)));
    }

    #[test]
    fn negative_capacity_is_an_invariant_violation() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let e = propagate_delta(&conn, &Chain::at(Level::Lesson, &t.lesson), -2, Counter::Capacity)
            .unwrap_err();
        assert!(matches!(e, CoreError::Invariant(_)));
    }

    #[test]
    fn completing_requires_enrolment() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        let e = mark_step_complete(&conn, &learner, &t.steps[0]).unwrap_err();
        assert!(matches!(e, CoreError::NotEnrolled { .. }));
        let e = open_step(&conn, &learner, &t.steps[0]).unwrap_err();
        assert!(matches!(e, CoreError::NotEnrolled { .. }));

        // The owner's membership row alone does not mean it studies the course.
        let e = mark_step_complete(&conn, &t.owner, &t.steps[0]).unwrap_err();
        assert!(matches!(e, CoreError::NotEnrolled { .. }));
    }

    #[test]
    fn completing_rolls_achieved_up_and_is_idempotent() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[2, 3]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        enroll(&conn, &learner, &t.course).expect("enroll");

        let first = mark_step_complete(&conn, &learner, &t.steps[1]).expect("complete");
        assert_eq!(first.status, STATUS_COMPLETED);
        assert_eq!(first.achieved, 3);
        let second = mark_step_complete(&conn, &learner, &t.steps[1]).expect("again");
        assert_eq!(first, second);

        for (level, id) in [
            (Level::Lesson, &t.lesson),
            (Level::Theme, &t.theme),
            (Level::Course, &t.course),
        ] {
            assert_eq!(achieved(&conn, &learner, level, id), 3);
            let p = node_progress(&conn, &learner, level, id).expect("progress");
            assert!(!p.is_complete);
            assert!(p.achieved <= p.capacity);
        }

        mark_step_complete(&conn, &learner, &t.steps[0]).expect("complete first");
        let course = node_progress(&conn, &learner, Level::Course, &t.course).expect("course");
        assert_eq!(course.achieved, 5);
        assert!(course.is_complete);
        assert!(!course.over_achieved);
    }

    #[test]
    fn shrinking_a_completed_step_leaves_it_over_achieved() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[3, 2]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        enroll(&conn, &learner, &t.course).expect("enroll");
        mark_step_complete(&conn, &learner, &t.steps[0]).expect("complete");

        change_step_capacity(&conn, &t.steps[0], 1).expect("shrink");
        assert_capacity_consistent(&conn, &t.course);

        let step = node_progress(&conn, &learner, Level::Step, &t.steps[0]).expect("step");
        assert_eq!(step.achieved, 3);
        assert_eq!(step.capacity, 1);
        assert!(step.over_achieved);
        assert!(step.is_complete);

        let lesson = node_progress(&conn, &learner, Level::Lesson, &t.lesson).expect("lesson");
        assert_eq!(lesson.achieved, 3);
        assert_eq!(lesson.capacity, 3);
        assert!(!lesson.over_achieved);

        // Re-completing an over-achieved step does not claw credit back.
        let again = mark_step_complete(&conn, &learner, &t.steps[0]).expect("again");
        assert_eq!(again.achieved, 3);
    }

    #[test]
    fn crediting_a_step_past_its_capacity_is_an_invariant_violation() {
        let mut conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        enroll(&conn, &learner, &t.course).expect("enroll");

        let tx = conn.transaction().expect("tx");
        let e = propagate_delta(
            &tx,
            &Chain::at(Level::Step, &t.steps[0]),
            10,
            Counter::Achieved {
                profile_id: &learner,
            },
        )
        .unwrap_err();
        assert!(matches!(e, CoreError::Invariant(_)));
        drop(tx);

        assert_eq!(achieved(&conn, &learner, Level::Step, &t.steps[0]), 0);
        assert_eq!(achieved(&conn, &learner, Level::Course, &t.course), 0);
        let p = mark_step_complete(&conn, &learner, &t.steps[0]).expect("complete");
        assert_eq!(p.achieved, 1);
    }

    #[test]
    fn growing_a_completed_step_tops_it_up_on_next_completion() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        enroll(&conn, &learner, &t.course).expect("enroll");
        mark_step_complete(&conn, &learner, &t.steps[0]).expect("complete");
        change_step_capacity(&conn, &t.steps[0], 4).expect("grow");

        let p = mark_step_complete(&conn, &learner, &t.steps[0]).expect("top up");
        assert_eq!(p.achieved, 4);
        assert_eq!(achieved(&conn, &learner, Level::Course, &t.course), 4);
    }

    #[test]
    fn deleting_a_lesson_withdraws_capacity_and_achieved() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[2, 3]);
        let lesson2 = catalog::create_lesson(&conn, &t.theme, "L2").expect("lesson");
        let other = catalog::create_step(&conn, &lesson2, "o", "", 4).expect("step");
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        enroll(&conn, &learner, &t.course).expect("enroll");
        mark_step_complete(&conn, &learner, &t.steps[0]).expect("complete");
        mark_step_complete(&conn, &learner, &other).expect("complete other");
        assert_eq!(achieved(&conn, &learner, Level::Course, &t.course), 6);

        delete_node(&conn, Level::Lesson, &t.lesson).expect("delete");

        assert_capacity_consistent(&conn, &t.course);
        assert_eq!(cap(&conn, Level::Course, &t.course), 4);
        assert_eq!(achieved(&conn, &learner, Level::Theme, &t.theme), 4);
        assert_eq!(achieved(&conn, &learner, Level::Course, &t.course), 4);
        assert!(!db::row_exists(&conn, "lessons", &t.lesson).expect("exists"));
        assert!(!db::row_exists(&conn, "steps", &t.steps[1]).expect("exists"));
        let leftover: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM profile_steps WHERE step_id = ?",
                [&t.steps[0]],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(leftover, 0);
    }

    #[test]
    fn deleting_a_step_matches_zeroing_its_capacity() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[2, 5]);
        delete_node(&conn, Level::Step, &t.steps[1]).expect("delete");
        assert_eq!(cap(&conn, Level::Lesson, &t.lesson), 2);
        assert_eq!(cap(&conn, Level::Course, &t.course), 2);
        assert_capacity_consistent(&conn, &t.course);
    }

    #[test]
    fn complete_course_requires_enrolment() {
        let conn = db::open_memory();
        let t = build_tree(&conn, "a", &[1]);
        let learner = catalog::create_profile(&conn, "learner").expect("learner");
        let e = complete_course(&conn, &learner, &t.course).unwrap_err();
        assert!(matches!(e, CoreError::NotEnrolled { .. }));
        enroll(&conn, &learner, &t.course).expect("enroll");
        assert_eq!(
            complete_course(&conn, &learner, &t.course).expect("complete"),
            STATUS_COMPLETED
        );
        assert_eq!(enroll(&conn, &learner, &t.course).expect("restart"), STATUS_STUDYING);
    }
}
