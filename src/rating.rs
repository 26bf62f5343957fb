use crate::db;
use crate::error::{CoreError, CoreResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

pub const MIN_GRADE: i64 = 1;
pub const MAX_GRADE: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatedKind {
    Course,
    Collection,
}

impl RatedKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "course" => Some(RatedKind::Course),
            "collection" => Some(RatedKind::Collection),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatedKind::Course => "course",
            RatedKind::Collection => "collection",
        }
    }

    fn entity_table(self) -> &'static str {
        match self {
            RatedKind::Course => "courses",
            RatedKind::Collection => "collections",
        }
    }

    fn membership_table(self) -> &'static str {
        match self {
            RatedKind::Course => "enrollments",
            RatedKind::Collection => "collection_members",
        }
    }

    fn membership_fk(self) -> &'static str {
        match self {
            RatedKind::Course => "course_id",
            RatedKind::Collection => "collection_id",
        }
    }
}

/// Count of active grades at each star level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StarBuckets {
    pub one: i64,
    pub two: i64,
    pub three: i64,
    pub four: i64,
    pub five: i64,
}

impl StarBuckets {
    pub fn get(&self, value: i64) -> i64 {
        match value {
            1 => self.one,
            2 => self.two,
            3 => self.three,
            4 => self.four,
            5 => self.five,
            _ => 0,
        }
    }

    pub fn total(&self) -> i64 {
        self.one + self.two + self.three + self.four + self.five
    }

    pub fn weighted_sum(&self) -> i64 {
        self.one + 2 * self.two + 3 * self.three + 4 * self.four + 5 * self.five
    }

    pub fn breakdown_json(&self) -> serde_json::Value {
        json!({
            "five": self.five,
            "four": self.four,
            "three": self.three,
            "two": self.two,
            "one": self.one,
            "totalNumber": self.total(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingOutcome {
    pub rating: f64,
    pub stars: StarBuckets,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub value: f64,
    pub grade: Option<i64>,
    pub reviews_count: i64,
}

/// Mean of the active grades; an entity nobody has rated yet reads as 0.
pub fn recompute_rating(stars: &StarBuckets) -> f64 {
    let count = stars.total();
    if count == 0 {
        return 0.0;
    }
    stars.weighted_sum() as f64 / count as f64
}

pub fn check_grade_value(value: i64) -> CoreResult<i64> {
    if !(MIN_GRADE..=MAX_GRADE).contains(&value) {
        return Err(CoreError::BadParams(format!(
            "grade must be between {MIN_GRADE} and {MAX_GRADE}, got {value}"
        )));
    }
    Ok(value)
}

fn bucket_column(value: i64) -> &'static str {
    match value {
        1 => "stars_1",
        2 => "stars_2",
        3 => "stars_3",
        4 => "stars_4",
        _ => "stars_5",
    }
}

pub fn create_buckets(conn: &Connection, kind: RatedKind, entity_id: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO star_buckets(entity_kind, entity_id) VALUES(?, ?)
         ON CONFLICT(entity_kind, entity_id) DO NOTHING",
        (kind.as_str(), entity_id),
    )?;
    Ok(())
}

pub fn delete_buckets(conn: &Connection, kind: RatedKind, entity_id: &str) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM star_buckets WHERE entity_kind = ? AND entity_id = ?",
        (kind.as_str(), entity_id),
    )?;
    Ok(())
}

pub fn load_buckets(conn: &Connection, kind: RatedKind, entity_id: &str) -> CoreResult<StarBuckets> {
    let stars = conn
        .query_row(
            "SELECT stars_1, stars_2, stars_3, stars_4, stars_5
             FROM star_buckets WHERE entity_kind = ? AND entity_id = ?",
            (kind.as_str(), entity_id),
            |r| {
                Ok(StarBuckets {
                    one: r.get(0)?,
                    two: r.get(1)?,
                    three: r.get(2)?,
                    four: r.get(3)?,
                    five: r.get(4)?,
                })
            },
        )
        .optional()?;
    stars.ok_or_else(|| CoreError::not_found(kind.as_str(), entity_id))
}

pub fn entity_owner(conn: &Connection, kind: RatedKind, entity_id: &str) -> CoreResult<String> {
    let sql = format!("SELECT owner_id FROM {} WHERE id = ?", kind.entity_table());
    let owner: Option<String> = conn
        .query_row(&sql, [entity_id], |r| r.get(0))
        .optional()?;
    owner.ok_or_else(|| CoreError::not_found(kind.as_str(), entity_id))
}

/// Owners may not grade what they publish.
pub fn reject_self_rating(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
) -> CoreResult<()> {
    if entity_owner(conn, kind, entity_id)? == rater_id {
        return Err(CoreError::SelfRating {
            entity: kind.as_str(),
            rater: rater_id.to_string(),
        });
    }
    Ok(())
}

/// `None` when the profile never interacted with the entity, `Some(None)` for
/// a membership row without a grade.
fn current_grade(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
) -> CoreResult<Option<Option<i64>>> {
    let sql = format!(
        "SELECT grade FROM {} WHERE profile_id = ? AND {} = ?",
        kind.membership_table(),
        kind.membership_fk()
    );
    let grade = conn
        .query_row(&sql, (rater_id, entity_id), |r| r.get::<_, Option<i64>>(0))
        .optional()?;
    Ok(grade)
}

fn write_grade(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
    grade: Option<i64>,
) -> CoreResult<()> {
    // Membership rows created here have no added_at: the profile rated the
    // entity without adding it.
    let sql = format!(
        "INSERT INTO {table}(profile_id, {fk}, grade, added_at) VALUES(?, ?, ?, NULL)
         ON CONFLICT(profile_id, {fk}) DO UPDATE SET grade = excluded.grade",
        table = kind.membership_table(),
        fk = kind.membership_fk()
    );
    conn.execute(&sql, (rater_id, entity_id, grade))?;
    Ok(())
}

fn bump_bucket(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    value: i64,
    delta: i64,
) -> CoreResult<()> {
    let stars = load_buckets(conn, kind, entity_id)?;
    let next = stars.get(value) + delta;
    if next < 0 {
        return Err(CoreError::invariant(format!(
            "{} star bucket {} of {} would become {}",
            kind.as_str(),
            value,
            entity_id,
            next
        )));
    }
    let column = bucket_column(value);
    let sql = format!(
        "UPDATE star_buckets SET {column} = {column} + ? WHERE entity_kind = ? AND entity_id = ?"
    );
    conn.execute(&sql, (delta, kind.as_str(), entity_id))?;
    Ok(())
}

fn store_rating(conn: &Connection, kind: RatedKind, entity_id: &str) -> CoreResult<RatingOutcome> {
    let stars = load_buckets(conn, kind, entity_id)?;
    let rating = recompute_rating(&stars);
    let sql = format!("UPDATE {} SET rating = ? WHERE id = ?", kind.entity_table());
    conn.execute(&sql, (rating, entity_id))?;
    Ok(RatingOutcome { rating, stars })
}

fn require_rater(conn: &Connection, rater_id: &str) -> CoreResult<()> {
    if !db::row_exists(conn, "profiles", rater_id)? {
        return Err(CoreError::not_found("profile", rater_id));
    }
    Ok(())
}

/// Records a first grade from `rater_id`. The caller is expected to run this
/// inside a write transaction and to have rejected self-rating already.
pub fn add_grade(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
    value: i64,
) -> CoreResult<RatingOutcome> {
    let value = check_grade_value(value)?;
    require_rater(conn, rater_id)?;
    load_buckets(conn, kind, entity_id)?;

    if let Some(Some(_)) = current_grade(conn, kind, entity_id, rater_id)? {
        return Err(CoreError::DuplicateGrade {
            entity: kind.as_str(),
            rater: rater_id.to_string(),
        });
    }

    bump_bucket(conn, kind, entity_id, value, 1)?;
    write_grade(conn, kind, entity_id, rater_id, Some(value))?;
    let outcome = store_rating(conn, kind, entity_id)?;
    tracing::debug!(
        entity = kind.as_str(),
        entity_id,
        rater_id,
        value,
        rating = outcome.rating,
        "grade added"
    );
    Ok(outcome)
}

pub fn update_grade(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
    value: i64,
) -> CoreResult<RatingOutcome> {
    let value = check_grade_value(value)?;
    load_buckets(conn, kind, entity_id)?;

    let Some(Some(old)) = current_grade(conn, kind, entity_id, rater_id)? else {
        return Err(CoreError::NotGraded {
            entity: kind.as_str(),
            rater: rater_id.to_string(),
        });
    };
    if old == value {
        return store_rating(conn, kind, entity_id);
    }

    bump_bucket(conn, kind, entity_id, old, -1)?;
    bump_bucket(conn, kind, entity_id, value, 1)?;
    write_grade(conn, kind, entity_id, rater_id, Some(value))?;
    let outcome = store_rating(conn, kind, entity_id)?;
    tracing::debug!(
        entity = kind.as_str(),
        entity_id,
        rater_id,
        old,
        value,
        rating = outcome.rating,
        "grade changed"
    );
    Ok(outcome)
}

/// Clears the rater's grade. Removing a grade that does not exist leaves the
/// entity untouched and reports its current rating.
pub fn remove_grade(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    rater_id: &str,
) -> CoreResult<RatingOutcome> {
    load_buckets(conn, kind, entity_id)?;

    let Some(Some(old)) = current_grade(conn, kind, entity_id, rater_id)? else {
        return store_rating(conn, kind, entity_id);
    };

    bump_bucket(conn, kind, entity_id, old, -1)?;
    write_grade(conn, kind, entity_id, rater_id, None)?;
    let outcome = store_rating(conn, kind, entity_id)?;
    tracing::debug!(
        entity = kind.as_str(),
        entity_id,
        rater_id,
        old,
        rating = outcome.rating,
        "grade removed"
    );
    Ok(outcome)
}

pub fn rating_summary(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
    viewer_id: Option<&str>,
) -> CoreResult<RatingSummary> {
    let stars = load_buckets(conn, kind, entity_id)?;
    let sql = format!("SELECT rating FROM {} WHERE id = ?", kind.entity_table());
    let value: f64 = conn
        .query_row(&sql, [entity_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| CoreError::not_found(kind.as_str(), entity_id))?;
    let grade = match viewer_id {
        Some(v) => current_grade(conn, kind, entity_id, v)?.flatten(),
        None => None,
    };
    Ok(RatingSummary {
        value,
        grade,
        reviews_count: stars.total(),
    })
}

pub fn star_breakdown(
    conn: &Connection,
    kind: RatedKind,
    entity_id: &str,
) -> CoreResult<serde_json::Value> {
    Ok(load_buckets(conn, kind, entity_id)?.breakdown_json())
}
