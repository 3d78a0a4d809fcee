use crate::{
    constant::{BUSY_TIMEOUT_MS, DB_NAME, PAGINATION_DEFAULT, PAGINATION_LIMIT},
    page::{Page, PageDraft},
    state::{time_in_sec, SubjectId},
    KudosError, KudosResult,
};
use rand::{thread_rng, Rng};
use sqlite::{Connection, State};
use std::{path::PathBuf, time::SystemTime};
use tracing::{debug, info, warn};

pub const LIKES_TABLE: &str = "likes";
pub const PAGES_TABLE: &str = "pages";

pub fn setup_tables(conn: &Connection) -> KudosResult<()> {
    let statement = format!(
        "
        CREATE TABLE IF NOT EXISTS {LIKES_TABLE}
        (page_id TEXT PRIMARY KEY,
        count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0));

        CREATE TABLE IF NOT EXISTS {PAGES_TABLE}
        (id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        excerpt TEXT,
        content TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '',
        thumbnail_url TEXT,
        is_highlight BOOLEAN NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER);
    "
    );

    conn.execute(statement)?;

    Ok(())
}

pub fn query_table_info(conn: &Connection, table_name: &str) -> KudosResult<Vec<sqlite::Row>> {
    let statement = format!("PRAGMA table_info({table_name});");

    let mut stmt = conn.prepare(statement)?;

    let result = stmt.iter().collect::<Result<Vec<sqlite::Row>, _>>()?;

    Ok(result)
}

/// path - Can be either a complete file path(with .db suffix) or
///        a directory name which will then be appended with default
///        db name.
pub fn resolve_db_path(path: PathBuf) -> PathBuf {
    let is_db_file = path.extension().map(|ext| ext == "db").unwrap_or(false);
    if path.is_dir() || !is_db_file {
        path.join(DB_NAME)
    } else {
        path
    }
}

/// Open (creating if needed) the database at `path` with the tables in
/// place and a busy timeout, so that writers from other processes queue up
/// instead of failing right away.
pub fn open_db(path: PathBuf) -> KudosResult<Connection> {
    let path = resolve_db_path(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut conn = sqlite::open(path.as_path())?;
    conn.set_busy_timeout(BUSY_TIMEOUT_MS)?;
    setup_tables(&conn)?;
    info!(db = %path.display(), "Database ready");

    Ok(conn)
}

// ***
// Likes
// ***

/// Atomically add one like to `subject`, creating the counter if needed,
/// and return the new count. `BEGIN IMMEDIATE` takes the write lock up
/// front so concurrent writers on the same file serialize on it.
pub fn increment_count(conn: &Connection, subject: &SubjectId) -> KudosResult<u64> {
    conn.execute("BEGIN IMMEDIATE;")?;
    let result = bump_and_read(conn, subject).and_then(|count| {
        conn.execute("COMMIT;")?;
        Ok(count)
    });
    if result.is_err() {
        if let Err(e) = conn.execute("ROLLBACK;") {
            warn!(%subject, "Rollback after failed increment failed: {e}");
        }
    }
    result
}

fn bump_and_read(conn: &Connection, subject: &SubjectId) -> KudosResult<u64> {
    {
        let mut stmt = conn.prepare(format!(
            "INSERT INTO {LIKES_TABLE} (page_id, count) VALUES (?, 1)
            ON CONFLICT(page_id) DO UPDATE SET count = count + 1;"
        ))?;
        stmt.bind((1, subject.as_str()))?;
        stmt.next()?;
    }
    read_count(conn, subject)
}

/// Current count of `subject`; 0 if it was never liked.
pub fn read_count(conn: &Connection, subject: &SubjectId) -> KudosResult<u64> {
    let mut stmt = conn.prepare(format!(
        "SELECT count FROM {LIKES_TABLE} WHERE page_id = ?;"
    ))?;
    stmt.bind((1, subject.as_str()))?;

    match stmt.next()? {
        State::Row => Ok(stmt.read::<i64, _>("count")?.try_into()?),
        State::Done => Ok(0),
    }
}

/// Overwrite a counter. Only reachable through an admin context.
pub fn set_count(conn: &Connection, subject: &SubjectId, count: u64) -> KudosResult<()> {
    let count: i64 = count.try_into()?;
    let mut stmt = conn.prepare(format!(
        "INSERT INTO {LIKES_TABLE} (page_id, count) VALUES (?, ?)
        ON CONFLICT(page_id) DO UPDATE SET count = excluded.count;"
    ))?;
    stmt.bind((1, subject.as_str()))?;
    stmt.bind((2, count))?;
    stmt.next()?;

    Ok(())
}

// ***
// Pages
// ***

pub fn insert_page(conn: &Connection, draft: &PageDraft) -> KudosResult<Page> {
    let page = Page::from_draft(0, draft)?;
    if query_page_by_slug(conn, &page.slug)?.is_some() {
        return Err(KudosError::DuplicateSlug { slug: page.slug }.into());
    }

    {
        let mut stmt = conn.prepare(format!(
            "INSERT INTO {PAGES_TABLE}
            (title, slug, excerpt, content, tags, thumbnail_url, is_highlight, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?);"
        ))?;
        stmt.bind((1, page.title.as_str()))?;
        stmt.bind((2, page.slug.as_str()))?;
        stmt.bind((3, page.excerpt.as_deref()))?;
        stmt.bind((4, page.content.as_str()))?;
        stmt.bind((5, page.tags.join(",").as_str()))?;
        stmt.bind((6, page.thumbnail_url.as_deref()))?;
        stmt.bind((7, page.is_highlight as i64))?;
        stmt.bind((8, i64::try_from(page.created_at)?))?;
        stmt.next()?;
    }

    let mut stmt = conn.prepare("SELECT last_insert_rowid() AS id;")?;
    let id = match stmt.next()? {
        State::Row => stmt.read::<i64, _>("id")?.try_into()?,
        State::Done => return Err(KudosError::SqliteValueParseError.into()),
    };
    debug!(id, slug = %page.slug, "Inserted page");

    Ok(page.with_id(id))
}

pub fn update_page(conn: &Connection, id: u32, draft: &PageDraft) -> KudosResult<Page> {
    let updated = Page::from_draft(id, draft)?;
    if query_page_by_id(conn, id)?.is_none() {
        return Err(KudosError::PageNotFound.into());
    }
    if let Some(other) = query_page_by_slug(conn, &updated.slug)? {
        if other.id() != id {
            return Err(KudosError::DuplicateSlug { slug: updated.slug }.into());
        }
    }

    {
        let mut stmt = conn.prepare(format!(
            "UPDATE {PAGES_TABLE} SET
            title = ?, slug = ?, excerpt = ?, content = ?, tags = ?,
            thumbnail_url = ?, is_highlight = ?, updated_at = ?
            WHERE id = ?;"
        ))?;
        stmt.bind((1, updated.title.as_str()))?;
        stmt.bind((2, updated.slug.as_str()))?;
        stmt.bind((3, updated.excerpt.as_deref()))?;
        stmt.bind((4, updated.content.as_str()))?;
        stmt.bind((5, updated.tags.join(",").as_str()))?;
        stmt.bind((6, updated.thumbnail_url.as_deref()))?;
        stmt.bind((7, updated.is_highlight as i64))?;
        stmt.bind((8, i64::try_from(time_in_sec(SystemTime::now())?)?))?;
        stmt.bind((9, i64::from(id)))?;
        stmt.next()?;
    }

    query_page_by_id(conn, id)?.ok_or_else(|| KudosError::PageNotFound.into())
}

pub fn delete_page_by_id(conn: &Connection, page_id: u32) -> KudosResult<()> {
    if query_page_by_id(conn, page_id)?.is_none() {
        return Err(KudosError::PageNotFound.into());
    }

    let mut stmt = conn.prepare(format!("DELETE FROM {PAGES_TABLE} WHERE id = ?;"))?;
    stmt.bind((1, i64::from(page_id)))?;
    stmt.next()?;

    Ok(())
}

/// Newest pages first.
pub fn query_pages(conn: &Connection, pages_limit: Option<u32>) -> KudosResult<Vec<Page>> {
    let limit = pages_limit
        .unwrap_or(PAGINATION_DEFAULT)
        .clamp(1, PAGINATION_LIMIT);
    let mut stmt = conn.prepare(format!(
        "SELECT * FROM {PAGES_TABLE} ORDER BY created_at DESC, id DESC LIMIT ?;"
    ))?;
    stmt.bind((1, i64::from(limit)))?;

    let pages = stmt
        .iter()
        .map(|row| Page::parse_sqlite_row(row?))
        .collect::<KudosResult<Vec<Page>>>()?;

    Ok(pages)
}

pub fn query_highlighted(conn: &Connection) -> KudosResult<Vec<Page>> {
    let mut stmt = conn.prepare(format!(
        "SELECT * FROM {PAGES_TABLE} WHERE is_highlight = 1 ORDER BY created_at DESC, id DESC;"
    ))?;

    let pages = stmt
        .iter()
        .map(|row| Page::parse_sqlite_row(row?))
        .collect::<KudosResult<Vec<Page>>>()?;

    Ok(pages)
}

pub fn query_page_by_slug(conn: &Connection, slug: &str) -> KudosResult<Option<Page>> {
    let mut stmt = conn.prepare(format!("SELECT * FROM {PAGES_TABLE} WHERE slug = ?;"))?;
    stmt.bind((1, slug))?;

    single_page(&mut stmt)
}

pub fn query_page_by_id(conn: &Connection, page_id: u32) -> KudosResult<Option<Page>> {
    let mut stmt = conn.prepare(format!("SELECT * FROM {PAGES_TABLE} WHERE id = ?;"))?;
    stmt.bind((1, i64::from(page_id)))?;

    single_page(&mut stmt)
}

fn single_page(stmt: &mut sqlite::Statement<'_>) -> KudosResult<Option<Page>> {
    let mut result = stmt
        .iter()
        .map(|row| Page::parse_sqlite_row(row?))
        .collect::<KudosResult<Vec<Page>>>()?;

    if result.len() > 1 {
        return Err(KudosError::custom_error(
            "BROKEN Db: Multiple pages found with the same key",
        )
        .into());
    }

    Ok(result.pop())
}

/// Generates a random db name with four 16-bit fields, such that when generating
/// random numbers, the range of each 16 bit field is 0-65536. Hence,
/// each random db name is `prefix-xxxxx-xxxxx-xxxxx-xxxxx.db`
/// The generated digits are padded with zeroes to ensure standardised
/// length of each field.
pub fn generate_random_db_name() -> String {
    let mut buffer = [0u16; 4];
    thread_rng().fill(&mut buffer);
    let mut result = buffer
        .into_iter()
        .map(|val| format!("{:05}", val.to_be()))
        .collect::<Vec<String>>()
        .join("-");
    result.insert_str(0, "kudos-");
    result.push_str(".db");
    result
}

pub fn generate_temp_db() -> PathBuf {
    std::env::temp_dir().join(generate_random_db_name())
}

#[cfg(test)]
mod test {
    use super::*;
    use sqlite::Value;

    fn subject(raw: &str) -> SubjectId {
        SubjectId::new(raw).unwrap()
    }

    fn draft(slug: &str) -> PageDraft {
        PageDraft {
            title: format!("Post {slug}"),
            slug: slug.into(),
            content: "Hello there, this is my first post".into(),
            tags: "rust, blog".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_random_db_name() {
        for _ in 0..5 {
            let db_name = generate_random_db_name();
            assert!(db_name.starts_with("kudos-"));
            assert!(db_name.ends_with(".db"));
            assert!(db_name.len() == 32);
        }
    }

    #[test]
    fn test_resolve_db_path() {
        let dir = std::env::temp_dir();
        assert_eq!(resolve_db_path(dir.clone()), dir.join(DB_NAME));
        let file = dir.join("likes.db");
        assert_eq!(resolve_db_path(file.clone()), file);
    }

    #[test]
    fn test_setup_tables() {
        let path = generate_temp_db();
        let conn = open_db(path.clone()).unwrap();

        assert!(path.exists(), "Db creation failed at expected path");

        let result = query_table_info(&conn, LIKES_TABLE);
        assert!(result.is_ok(), "{:?}", result.unwrap_err());

        //----- Expected values
        let expected_columns = [Value::String("page_id".into()), Value::String("count".into())];
        //-----

        let actual_columns: Vec<Value> = result
            .unwrap()
            .into_iter()
            .map(|mut row| row.take(1))
            .collect();
        assert_eq!(actual_columns, expected_columns);

        let result = query_table_info(&conn, PAGES_TABLE).unwrap();
        assert_eq!(result.len(), 10, "Number of page columns don't match");

        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[test]
    fn test_increment_creates_and_counts() {
        let path = generate_temp_db();
        let conn = open_db(path.clone()).unwrap();
        let post = subject("post-42");

        assert_eq!(read_count(&conn, &post).unwrap(), 0);
        assert_eq!(increment_count(&conn, &post).unwrap(), 1);
        assert_eq!(increment_count(&conn, &post).unwrap(), 2);
        assert_eq!(read_count(&conn, &post).unwrap(), 2);
        assert_eq!(read_count(&conn, &subject("post-1")).unwrap(), 0);

        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[test]
    fn test_set_count_can_lower() {
        let path = generate_temp_db();
        let conn = open_db(path.clone()).unwrap();
        let post = subject("post-7");

        for _ in 0..5 {
            increment_count(&conn, &post).unwrap();
        }
        set_count(&conn, &post, 2).unwrap();
        assert_eq!(read_count(&conn, &post).unwrap(), 2);
        assert_eq!(increment_count(&conn, &post).unwrap(), 3);

        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[test]
    fn test_increments_from_separate_connections_are_not_lost() {
        let path = generate_temp_db();
        drop(open_db(path.clone()).unwrap());
        let post = subject("post-42");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let post = post.clone();
                std::thread::spawn(move || {
                    let conn = open_db(path).unwrap();
                    for _ in 0..25 {
                        increment_count(&conn, &post).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let conn = open_db(path.clone()).unwrap();
        assert_eq!(read_count(&conn, &post).unwrap(), 100);

        std::fs::remove_file(path).expect("Db cleanup failed");
    }

    #[test]
    fn test_page_crud() {
        let path = generate_temp_db();
        let conn = open_db(path.clone()).unwrap();

        let first = insert_page(&conn, &draft("first-post")).unwrap();
        let mut highlighted = draft("second-post");
        highlighted.is_highlight = true;
        let second = insert_page(&conn, &highlighted).unwrap();
        assert_ne!(first.id(), second.id());

        let err = insert_page(&conn, &draft("first-post")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KudosError>(),
            Some(KudosError::DuplicateSlug { .. })
        ));

        let pages = query_pages(&conn, None).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].id(), second.id(), "newest page comes first");

        let highlights = query_highlighted(&conn).unwrap();
        assert_eq!(highlights, vec![second.clone()]);

        let found = query_page_by_slug(&conn, "first-post").unwrap().unwrap();
        assert_eq!(found, first);
        assert_eq!(found.tags, vec!["rust", "blog"]);

        let mut edit = draft("first-post-edited");
        edit.title = "Edited".into();
        let updated = update_page(&conn, first.id(), &edit).unwrap();
        assert_eq!(updated.title, "Edited");
        assert!(updated.updated_at.is_some());
        assert!(query_page_by_slug(&conn, "first-post").unwrap().is_none());

        let err = update_page(&conn, first.id(), &draft("second-post")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KudosError>(),
            Some(KudosError::DuplicateSlug { .. })
        ));

        delete_page_by_id(&conn, first.id()).unwrap();
        assert!(query_page_by_id(&conn, first.id()).unwrap().is_none());
        assert_eq!(
            delete_page_by_id(&conn, first.id())
                .unwrap_err()
                .downcast_ref::<KudosError>(),
            Some(&KudosError::PageNotFound)
        );

        std::fs::remove_file(path).expect("Db cleanup failed");
    }
}
