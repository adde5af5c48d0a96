//! HTML field extraction for answer pages.
//!
//! Best effort: a missing element yields an empty string or zero, never an error.

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::domain::SubmittedRecord;

static DATE_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").ok());
static NUMBER_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").ok());
static TITLE_SELECTOR: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("title").ok());

/// Fields read from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub title: String,
    pub content: String,
    pub publish_time: String,
    pub author: String,
    pub author_url: String,
    pub author_field: String,
    pub author_cert: String,
    pub author_fans: i64,
}

impl ExtractedPage {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.content.is_empty()
    }

    /// Producer payload for a page captured by a crawl job.
    pub fn into_submission(self, url: &str, task_id: i64) -> SubmittedRecord {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        SubmittedRecord {
            title: self.title,
            url: url.to_string(),
            content: non_empty(self.content),
            author: non_empty(self.author),
            author_url: non_empty(self.author_url),
            author_field: non_empty(self.author_field),
            author_cert: non_empty(self.author_cert),
            author_fans: Some(self.author_fans),
            publish_time: non_empty(self.publish_time),
            task_id: Some(task_id),
            ..Default::default()
        }
    }
}

pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str) -> ExtractedPage;
}

/// CSS selectors for answer pages
#[derive(Debug, Clone)]
pub struct AnswerSelectors {
    pub title: String,
    pub content: String,
    pub publish_time: String,
    pub author_block: String,
    pub author_link: String,
    pub author_cert: String,
    pub author_field: String,
    pub author_fans: String,
}

impl Default for AnswerSelectors {
    fn default() -> Self {
        Self {
            title: "h1.QuestionHeader-title".to_string(),
            content: "div.RichContent-inner".to_string(),
            publish_time: "span.ContentItem-time".to_string(),
            author_block: "div.AuthorInfo".to_string(),
            author_link: "a.UserLink-link".to_string(),
            author_cert: "div.AuthorInfo-badgeText".to_string(),
            author_field: "div.AuthorInfo-headline".to_string(),
            author_fans: "div.NumberBoard-itemValue".to_string(),
        }
    }
}

struct CompiledSelectors {
    title: Selector,
    content: Selector,
    publish_time: Selector,
    author_block: Selector,
    author_link: Selector,
    author_cert: Selector,
    author_field: Selector,
    author_fans: Selector,
}

pub struct AnswerPageExtractor {
    selectors: CompiledSelectors,
    /// Prefix for relative profile links
    base_url: String,
}

impl AnswerPageExtractor {
    pub fn new(selectors: &AnswerSelectors, base_url: impl Into<String>) -> Result<Self> {
        let parse = |css: &str| Selector::parse(css).map_err(|e| anyhow!("Invalid selector '{}': {:?}", css, e));
        Ok(Self {
            selectors: CompiledSelectors {
                title: parse(&selectors.title)?,
                content: parse(&selectors.content)?,
                publish_time: parse(&selectors.publish_time)?,
                author_block: parse(&selectors.author_block)?,
                author_link: parse(&selectors.author_link)?,
                author_cert: parse(&selectors.author_cert)?,
                author_field: parse(&selectors.author_field)?,
                author_fans: parse(&selectors.author_fans)?,
            },
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn first_text(root: ElementRef<'_>, selector: &Selector) -> String {
        root.select(selector).next().map(element_text).unwrap_or_default()
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(rest) = href.strip_prefix("//") {
            format!("https://{rest}")
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }
}

impl PageExtractor for AnswerPageExtractor {
    fn extract(&self, html: &str) -> ExtractedPage {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let s = &self.selectors;

        let publish_raw = Self::first_text(root, &s.publish_time);
        let publish_time = DATE_PATTERN
            .as_ref()
            .and_then(|re| re.find(&publish_raw))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let mut page = ExtractedPage {
            title: Self::first_text(root, &s.title),
            content: Self::first_text(root, &s.content),
            publish_time,
            author_fans: root
                .select(&s.author_fans)
                .next()
                .map(|el| parse_follower_count(&element_text(el)))
                .unwrap_or(0),
            ..Default::default()
        };

        if let Some(block) = root.select(&s.author_block).next() {
            if let Some(link) = block.select(&s.author_link).next() {
                page.author = element_text(link);
                page.author_url = link
                    .value()
                    .attr("href")
                    .map(|href| self.absolute_url(href))
                    .unwrap_or_default();
            }
            page.author_cert = Self::first_text(block, &s.author_cert);
            page.author_field = Self::first_text(block, &s.author_field);
        }
        page
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses follower counts such as `1,234` or `1.5万` (ten-thousands).
pub fn parse_follower_count(raw: &str) -> i64 {
    let cleaned = raw.replace(',', "");
    let Some(number) = NUMBER_PATTERN
        .as_ref()
        .and_then(|re| re.find(&cleaned))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    else {
        return 0;
    };
    let scaled = if cleaned.contains('万') { number * 10_000.0 } else { number };
    scaled.round() as i64
}

/// Text of the document `<title>`, empty when absent.
pub fn page_title(html: &str) -> String {
    let Some(selector) = TITLE_SELECTOR.as_ref() else {
        return String::new();
    };
    let document = Html::parse_document(html);
    document
        .select(selector)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ANSWER_PAGE: &str = r#"
        <html><head><title>Why is the sky blue? - Zhihu</title></head>
        <body>
          <h1 class="QuestionHeader-title">Why is the sky blue?</h1>
          <div class="AuthorInfo">
            <a class="UserLink-link" href="/people/optics-fan">Optics Fan</a>
            <div class="AuthorInfo-badgeText">Physics PhD</div>
            <div class="AuthorInfo-headline">Atmospheric optics</div>
          </div>
          <div class="NumberBoard-itemValue">1.5万</div>
          <div class="RichContent-inner"><p>Rayleigh</p><p>scattering.</p></div>
          <span class="ContentItem-time">Published 2021-03-04 10:22</span>
        </body></html>
    "#;

    fn extractor() -> AnswerPageExtractor {
        AnswerPageExtractor::new(&AnswerSelectors::default(), "https://www.zhihu.com/").unwrap()
    }

    #[test]
    fn extracts_answer_fields() {
        let page = extractor().extract(ANSWER_PAGE);
        assert_eq!(page.title, "Why is the sky blue?");
        assert_eq!(page.content, "Rayleigh scattering.");
        assert_eq!(page.publish_time, "2021-03-04");
        assert_eq!(page.author, "Optics Fan");
        assert_eq!(page.author_url, "https://www.zhihu.com/people/optics-fan");
        assert_eq!(page.author_cert, "Physics PhD");
        assert_eq!(page.author_field, "Atmospheric optics");
        assert_eq!(page.author_fans, 15_000);
    }

    #[test]
    fn missing_fields_are_empty() {
        let page = extractor().extract("<html><body><p>nothing here</p></body></html>");
        assert!(page.is_empty());
        assert_eq!(page, ExtractedPage::default());
    }

    #[rstest]
    #[case("1,234", 1_234)]
    #[case("1.5万", 15_000)]
    #[case("12 followers", 12)]
    #[case("none", 0)]
    fn follower_counts(#[case] raw: &str, #[case] expected: i64) {
        assert_eq!(parse_follower_count(raw), expected);
    }

    #[test]
    fn reads_document_title() {
        assert_eq!(page_title(ANSWER_PAGE), "Why is the sky blue? - Zhihu");
        assert_eq!(page_title("<p>untitled</p>"), "");
    }

    #[test]
    fn submission_carries_job_and_address() {
        let submission = extractor().extract(ANSWER_PAGE).into_submission("https://www.zhihu.com/question/1", 9);
        assert_eq!(submission.task_id, Some(9));
        assert_eq!(submission.url, "https://www.zhihu.com/question/1");
        assert_eq!(submission.publish_time.as_deref(), Some("2021-03-04"));
        assert!(submission.comments_structured.is_empty());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = AnswerSelectors {
            title: "h1[".to_string(),
            ..Default::default()
        };
        assert!(AnswerPageExtractor::new(&selectors, "https://example.com").is_err());
    }
}
