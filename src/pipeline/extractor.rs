use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound, in characters, for stored raw HTML and page text
pub const MAX_STORED_CHARS: usize = 1_000_000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("response body is binary, not markup")]
    BinaryContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenGraph {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadingGroup {
    pub tag: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub src: String,
    pub alt: String,
}

/// Structured fields pulled out of a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub og: OpenGraph,
    pub headings: Vec<HeadingGroup>,
    pub links: Vec<Link>,
    pub images: Vec<Image>,
}

/// Everything the extractor produces for one page, already truncated for storage
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPage {
    pub structured: StructuredContent,
    pub raw_html: String,
    pub raw_text: String,
}

const HEADING_TAGS: [&str; 3] = ["h1", "h2", "h3"];

/// HTML parser with precompiled selectors
pub struct HtmlExtractor {
    title: Selector,
    description: Selector,
    og_title: Selector,
    og_description: Selector,
    og_image: Selector,
    og_url: Selector,
    og_type: Selector,
    headings: Vec<(&'static str, Selector)>,
    links: Selector,
    images: Selector,
    body: Selector,
}

impl HtmlExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        let mut headings = Vec::with_capacity(HEADING_TAGS.len());
        for tag in HEADING_TAGS {
            headings.push((tag, selector(tag)?));
        }

        Ok(Self {
            title: selector("head title")?,
            description: selector(r#"meta[name="description"]"#)?,
            og_title: selector(r#"meta[property="og:title"]"#)?,
            og_description: selector(r#"meta[property="og:description"]"#)?,
            og_image: selector(r#"meta[property="og:image"]"#)?,
            og_url: selector(r#"meta[property="og:url"]"#)?,
            og_type: selector(r#"meta[property="og:type"]"#)?,
            headings,
            links: selector("a[href]")?,
            images: selector("img[src]")?,
            body: selector("body")?,
        })
    }

    /// Parse `html` and pull out the structured fields and page text
    pub fn extract(&self, html: &str) -> Result<ExtractedPage, ExtractError> {
        if html.contains('\0') {
            return Err(ExtractError::BinaryContent);
        }

        let document = Html::parse_document(html);

        let og = OpenGraph {
            title: meta_content(&document, &self.og_title),
            description: meta_content(&document, &self.og_description),
            image: meta_content(&document, &self.og_image),
            url: meta_content(&document, &self.og_url),
            kind: meta_content(&document, &self.og_type),
        };

        let title = document
            .select(&self.title)
            .next()
            .map(|el| element_text(&el).trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| og.title.clone());

        let description = meta_content(&document, &self.description).or_else(|| og.description.clone());

        let headings = self
            .headings
            .iter()
            .map(|(tag, sel)| HeadingGroup {
                tag: tag.to_string(),
                values: document
                    .select(sel)
                    .map(|el| element_text(&el).trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
            })
            .collect();

        let links = document
            .select(&self.links)
            .map(|el| Link {
                href: el.value().attr("href").unwrap_or_default().to_string(),
                text: element_text(&el).trim().to_string(),
            })
            .collect();

        let images = document
            .select(&self.images)
            .map(|el| Image {
                src: el.value().attr("src").unwrap_or_default().to_string(),
                alt: el.value().attr("alt").unwrap_or_default().to_string(),
            })
            .collect();

        let text = document
            .select(&self.body)
            .next()
            .map(|body| collapse_whitespace(&element_text(&body)))
            .unwrap_or_default();

        Ok(ExtractedPage {
            structured: StructuredContent {
                title,
                description,
                og,
                headings,
                links,
                images,
            },
            raw_html: truncate_chars(html, MAX_STORED_CHARS).to_string(),
            raw_text: truncate_chars(&text, MAX_STORED_CHARS).to_string(),
        })
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect()
}

/// `content` of the first matching meta tag; empty counts as missing
fn meta_content(document: &Html, sel: &Selector) -> Option<String> {
    document
        .select(sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Every whitespace run becomes one space, ends trimmed
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max` characters of `text`, never splitting a code point
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(html: &str) -> ExtractedPage {
        HtmlExtractor::new().unwrap().extract(html).unwrap()
    }

    const PAGE: &str = r#"<!doctype html>
<html>
<head>
  <title>  Home Page </title>
  <meta name="description" content="A page">
  <meta property="og:title" content="OG Home">
  <meta property="og:image" content="https://a.test/img.png">
  <meta property="og:type" content="website">
</head>
<body>
  <h1> Welcome </h1>
  <h2>First</h2><h2>   </h2><h2>Second</h2>
  <p>Some    text
     across lines</p>
  <a href="/about"> About us </a>
  <a href="">Empty</a>
  <a>No href</a>
  <img src="/a.png" alt="A">
  <img src="/b.png">
  <img alt="no src">
</body>
</html>"#;

    #[test]
    fn test_extracts_structured_fields() {
        let page = extract(PAGE);
        let s = &page.structured;

        assert_eq!(s.title.as_deref(), Some("Home Page"));
        assert_eq!(s.description.as_deref(), Some("A page"));
        assert_eq!(s.og.title.as_deref(), Some("OG Home"));
        assert_eq!(s.og.image.as_deref(), Some("https://a.test/img.png"));
        assert_eq!(s.og.kind.as_deref(), Some("website"));
        assert_eq!(s.og.description, None);
        assert_eq!(s.og.url, None);

        assert_eq!(s.headings.len(), 3);
        assert_eq!(s.headings[0].tag, "h1");
        assert_eq!(s.headings[0].values, vec!["Welcome"]);
        assert_eq!(s.headings[1].values, vec!["First", "Second"]);
        assert!(s.headings[2].values.is_empty());

        assert_eq!(
            s.links,
            vec![
                Link { href: "/about".to_string(), text: "About us".to_string() },
                Link { href: String::new(), text: "Empty".to_string() },
            ]
        );
        assert_eq!(
            s.images,
            vec![
                Image { src: "/a.png".to_string(), alt: "A".to_string() },
                Image { src: "/b.png".to_string(), alt: String::new() },
            ]
        );
    }

    #[test]
    fn test_page_text_is_collapsed() {
        let page = extract(PAGE);
        assert!(page.raw_text.contains("Some text across lines"));
        assert!(!page.raw_text.starts_with(' '));
        assert!(!page.raw_text.contains("  "));
        assert!(!page.raw_text.contains('\n'));
    }

    #[test]
    fn test_title_falls_back_to_og_title() {
        let html = r#"<html><head><title>  </title><meta property="og:title" content="From OG"></head></html>"#;
        assert_eq!(extract(html).structured.title.as_deref(), Some("From OG"));

        let html = "<html><head></head><body>x</body></html>";
        assert_eq!(extract(html).structured.title, None);
    }

    #[test]
    fn test_description_falls_back_to_og_description() {
        let html = r#"<html><head>
            <meta name="description" content="">
            <meta property="og:description" content="OG desc">
        </head></html>"#;
        assert_eq!(extract(html).structured.description.as_deref(), Some("OG desc"));
    }

    #[test]
    fn test_bare_title_fragment() {
        let page = extract("<title>A</title>");
        assert_eq!(page.structured.title.as_deref(), Some("A"));
        assert_eq!(page.raw_text, "");
    }

    #[test]
    fn test_html_and_text_truncated_at_same_bound() {
        let body = "a".repeat(MAX_STORED_CHARS + 1);
        let page = extract(&body);

        assert_eq!(page.raw_html.chars().count(), MAX_STORED_CHARS);
        assert_eq!(page.raw_text.chars().count(), MAX_STORED_CHARS);
    }

    #[test]
    fn test_truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_binary_body_rejected() {
        let err = HtmlExtractor::new().unwrap().extract("PNG\0\0\u{1}").unwrap_err();
        assert_eq!(err, ExtractError::BinaryContent);
    }
}
