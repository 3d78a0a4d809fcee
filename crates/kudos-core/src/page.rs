//! This module defines `Page`, one blog post as stored and served, and
//! `PageDraft`, the editable part submitted from the admin panel.

use crate::{
    constant,
    state::{time_in_sec, SubjectId},
    KudosError, KudosResult,
};
use regex::Regex;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;
use textwrap::core::display_width;
use textwrap::{self, wrap};

const SLUG_PATTERN: &str = r"^[a-z0-9]+(?:-[a-z0-9]+)*$";
const TAG_SEPARATOR: &str = r"[,\s]+";

/// Every time the admin publishes a post, this is the struct that stores
/// all the necessary data.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Page {
    id: u32,
    pub title: String,
    pub slug: String,
    pub excerpt: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub is_highlight: bool,
    pub created_at: u64,
    pub updated_at: Option<u64>,
}

/// The fields the admin form edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PageDraft {
    pub title: String,
    pub slug: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    /// Raw tag list as typed, e.g. `"rust, #gamedev blog"`.
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub is_highlight: bool,
}

impl PageDraft {
    /// Run every field check; the first failure wins.
    pub fn validate(&self) -> KudosResult<()> {
        verify_title(&self.title)?;
        verify_slug(&self.slug)?;
        verify_content(&self.content)?;
        if let Some(excerpt) = &self.excerpt {
            verify_excerpt(excerpt)?;
        }
        Ok(())
    }

    /// Empty optional strings from a form mean "not set".
    pub(crate) fn excerpt(&self) -> Option<&str> {
        non_blank(self.excerpt.as_deref())
    }

    pub(crate) fn thumbnail_url(&self) -> Option<&str> {
        non_blank(self.thumbnail_url.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|val| !val.is_empty())
}

impl Page {
    /// Build a fresh page out of a validated draft.
    pub fn from_draft(id: u32, draft: &PageDraft) -> KudosResult<Self> {
        draft.validate()?;
        Ok(Page {
            id,
            title: draft.title.trim().to_string(),
            slug: draft.slug.clone(),
            excerpt: draft.excerpt().map(str::to_string),
            content: draft.content.clone(),
            tags: parse_tags(&draft.tags)?,
            thumbnail_url: draft.thumbnail_url().map(str::to_string),
            is_highlight: draft.is_highlight,
            created_at: time_in_sec(SystemTime::now())?,
            updated_at: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Likes are counted per page id.
    pub fn subject(&self) -> SubjectId {
        SubjectId::from_page_id(self.id)
    }

    pub(crate) fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn parse_sqlite_row(mut record: sqlite::Row) -> KudosResult<Self> {
        let id = match record.take("id") {
            sqlite::Value::Integer(val) => val.try_into()?,
            _ => return Err(KudosError::SqliteValueParseError.into()),
        };

        let title = take_string(&mut record, "title")?;
        let slug = take_string(&mut record, "slug")?;
        let excerpt = take_optional_string(&mut record, "excerpt")?;
        let content = take_string(&mut record, "content")?;
        let tags = take_string(&mut record, "tags")?
            .split(',')
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        let thumbnail_url = take_optional_string(&mut record, "thumbnail_url")?;

        let is_highlight = match record.take("is_highlight") {
            sqlite::Value::Integer(val) => val != 0, // 0: false, 1: true; in sqlite
            _ => return Err(KudosError::SqliteValueParseError.into()),
        };

        let created_at = match record.take("created_at") {
            sqlite::Value::Integer(val) => val.try_into()?,
            _ => return Err(KudosError::SqliteValueParseError.into()),
        };

        let updated_at = match record.take("updated_at") {
            sqlite::Value::Integer(val) => Some(val.try_into()?),
            sqlite::Value::Null => None,
            _ => return Err(KudosError::SqliteValueParseError.into()),
        };

        Ok(Page {
            id,
            title,
            slug,
            excerpt,
            content,
            tags,
            thumbnail_url,
            is_highlight,
            created_at,
            updated_at,
        })
    }
}

fn take_string(record: &mut sqlite::Row, column: &str) -> KudosResult<String> {
    match record.take(column) {
        sqlite::Value::String(val) => Ok(val),
        _ => Err(KudosError::SqliteValueParseError.into()),
    }
}

fn take_optional_string(record: &mut sqlite::Row, column: &str) -> KudosResult<Option<String>> {
    match record.take(column) {
        sqlite::Value::String(val) => Ok(Some(val)),
        sqlite::Value::Null => Ok(None),
        _ => Err(KudosError::SqliteValueParseError.into()),
    }
}

/// Split a free form tag list into normalized tags: lowercased, without a
/// leading `#`, de-duplicated in first-seen order.
pub fn parse_tags(raw: &str) -> KudosResult<Vec<String>> {
    let separator = Regex::new(TAG_SEPARATOR)?;
    let mut tags: Vec<String> = Vec::new();
    for tag in separator.split(raw) {
        let tag = tag.trim_start_matches('#').to_lowercase();
        if tag.is_empty() || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    Ok(tags)
}

/// Some necessary checks for page's title.
fn verify_title(title: &str) -> KudosResult<()> {
    let title = title.trim();
    if title.is_empty() {
        return Err(KudosError::EmptyTitle.into());
    }
    if title.len() > constant::MAX_PAGE_TITLE {
        return Err(KudosError::InvalidTitleLength {
            max_size: constant::MAX_PAGE_TITLE,
            curr_size: title.len(),
        }
        .into());
    }
    Ok(())
}

/// Slugs end up in urls, so only lowercase words joined by dashes.
pub fn verify_slug(slug: &str) -> KudosResult<()> {
    let pattern = Regex::new(SLUG_PATTERN)?;
    if slug.len() > constant::MAX_PAGE_SLUG || !pattern.is_match(slug) {
        return Err(KudosError::InvalidSlug { slug: slug.into() }.into());
    }
    Ok(())
}

fn verify_content(content: &str) -> KudosResult<()> {
    if content.trim().is_empty() {
        return Err(KudosError::EmptyContent.into());
    }
    if content.len() > constant::MAX_PAGE_CONTENT {
        return Err(KudosError::InvalidContentLength {
            max_size: constant::MAX_PAGE_CONTENT,
            curr_size: content.len(),
        }
        .into());
    }
    Ok(())
}

fn verify_excerpt(excerpt: &str) -> KudosResult<()> {
    if excerpt.len() > constant::MAX_PAGE_EXCERPT {
        return Err(KudosError::InvalidExcerptLength {
            max_size: constant::MAX_PAGE_EXCERPT,
            curr_size: excerpt.len(),
        }
        .into());
    }
    Ok(())
}

impl Display for Page {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:-<54}\n", "")?;
        write!(f, "\\ {:^50} /\n/ {:^50} \\\n", self.title, self.slug)?;
        let mut count = 0u8;
        let content_width = 50;
        let wrapping_config = textwrap::Options::new(content_width).break_words(true);
        let body = self.excerpt.as_deref().unwrap_or(&self.content);
        for line in wrap(&format!("{}\n", body), wrapping_config) {
            let (left_closure, right_closure) = if count % 2 == 0 {
                ("\\ ", " /")
            } else {
                ("/ ", " \\")
            };
            let text_width = display_width(&line);
            let whitespace = content_width.saturating_sub(text_width);
            write!(
                f,
                "{left_closure}{}{}{right_closure}\n",
                line,
                " ".repeat(whitespace)
            )?;
            count = count.wrapping_add(1);
        }
        if !self.tags.is_empty() {
            writeln!(f, "  #{}", self.tags.join(" #"))?;
        }
        write!(f, "{:-<54}", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> PageDraft {
        PageDraft {
            title: "First Post".into(),
            slug: "first-post".into(),
            content: "# Hello\n\nThis is a demo post with emojis to test formatting 😃😃".into(),
            excerpt: Some("   ".into()),
            tags: "Rust, #blog rust".into(),
            thumbnail_url: None,
            is_highlight: true,
        }
    }

    #[test]
    fn page_from_draft_normalizes_fields() {
        let page = Page::from_draft(7, &draft()).unwrap();
        assert_eq!(page.id(), 7);
        assert_eq!(page.subject().as_str(), "7");
        assert_eq!(page.excerpt, None);
        assert_eq!(page.tags, vec!["rust".to_string(), "blog".to_string()]);
        assert!(page.updated_at.is_none());
        println!("{}", page);
    }

    #[test]
    fn tags_are_split_on_commas_and_whitespace() {
        assert_eq!(
            parse_tags(" #GameDev,, twitch\nlive  ").unwrap(),
            vec!["gamedev", "twitch", "live"]
        );
        assert!(parse_tags("  , ,").unwrap().is_empty());
    }

    #[test]
    fn slug_rules() {
        assert!(verify_slug("hello-world-2").is_ok());
        for bad in ["", "Hello", "double--dash", "-leading", "trailing-", "sp ace"] {
            let err = verify_slug(bad).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<KudosError>(),
                    Some(KudosError::InvalidSlug { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn draft_validation_reports_first_problem() {
        let mut bad = draft();
        bad.title = "  ".into();
        assert_eq!(
            bad.validate().unwrap_err().downcast_ref::<KudosError>(),
            Some(&KudosError::EmptyTitle)
        );

        let mut bad = draft();
        bad.title = "t".repeat(constant::MAX_PAGE_TITLE + 1);
        assert!(matches!(
            bad.validate().unwrap_err().downcast_ref::<KudosError>(),
            Some(KudosError::InvalidTitleLength { .. })
        ));

        let mut bad = draft();
        bad.content = "\n".into();
        assert_eq!(
            bad.validate().unwrap_err().downcast_ref::<KudosError>(),
            Some(&KudosError::EmptyContent)
        );
    }
}
