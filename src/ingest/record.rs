//! Crawl records and their delimited wire form.
//!
//! ```text
//! url|title|description|word|word|...       page record
//! FATHER_URLS|father_url|child_url|...      backlink record
//! ```

use crate::error::IngestError;

/// First field of a backlink message.
pub const BACKLINK_TAG: &str = "FATHER_URLS";

/// A fetched page and the words found on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    /// Page address.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Page description.
    pub description: String,
    /// Words to index under this page. May repeat.
    pub words: Vec<String>,
}

/// Outgoing links of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklinkRecord {
    /// The linking page.
    pub father_url: String,
    /// Pages it links to.
    pub child_urls: Vec<String>,
}

/// One unit of crawl output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlRecord {
    /// A fetched page.
    Page(PageRecord),
    /// Links found on a page.
    Backlinks(BacklinkRecord),
}

impl CrawlRecord {
    /// Parse a delimited crawl message.
    pub fn parse(message: &str, delimiter: char) -> Result<Self, IngestError> {
        let message = message.trim_end_matches(['\r', '\n']);
        let mut fields = message.split(delimiter);
        let first = fields.next().unwrap_or_default();

        if first == BACKLINK_TAG {
            let father_url = fields
                .next()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| IngestError::Malformed("backlink message without father url".into()))?;
            let child_urls: Vec<String> = fields.filter(|f| !f.is_empty()).map(str::to_owned).collect();
            if child_urls.is_empty() {
                return Err(IngestError::Malformed(format!(
                    "backlink message for {} lists no children",
                    father_url
                )));
            }
            return Ok(CrawlRecord::Backlinks(BacklinkRecord {
                father_url: father_url.to_owned(),
                child_urls,
            }));
        }

        if first.is_empty() {
            return Err(IngestError::Malformed("page message without url".into()));
        }
        let (Some(title), Some(description)) = (fields.next(), fields.next()) else {
            return Err(IngestError::Malformed(format!(
                "page message for {} needs title and description",
                first
            )));
        };
        let words: Vec<String> = fields.filter(|w| !w.is_empty()).map(str::to_owned).collect();
        if words.is_empty() {
            return Err(IngestError::Malformed(format!("page message for {} has no words", first)));
        }
        Ok(CrawlRecord::Page(PageRecord {
            url: first.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            words,
        }))
    }

    /// Render back into the delimited form.
    pub fn to_message(&self, delimiter: char) -> String {
        let fields: Vec<&str> = match self {
            CrawlRecord::Page(page) => [page.url.as_str(), page.title.as_str(), page.description.as_str()]
                .into_iter()
                .chain(page.words.iter().map(String::as_str))
                .collect(),
            CrawlRecord::Backlinks(links) => [BACKLINK_TAG, links.father_url.as_str()]
                .into_iter()
                .chain(links.child_urls.iter().map(String::as_str))
                .collect(),
        };
        fields.join(&delimiter.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page() {
        let record = CrawlRecord::parse("http://a.com|A title|About a|cat|dog|cat\n", '|').unwrap();
        assert_eq!(
            record,
            CrawlRecord::Page(PageRecord {
                url: "http://a.com".into(),
                title: "A title".into(),
                description: "About a".into(),
                words: vec!["cat".into(), "dog".into(), "cat".into()],
            })
        );
        assert_eq!(record.to_message('|'), "http://a.com|A title|About a|cat|dog|cat");
    }

    #[test]
    fn test_parse_backlinks() {
        let record = CrawlRecord::parse("FATHER_URLS;f.com;c1.com;;c2.com", ';').unwrap();
        assert_eq!(
            record,
            CrawlRecord::Backlinks(BacklinkRecord {
                father_url: "f.com".into(),
                child_urls: vec!["c1.com".into(), "c2.com".into()],
            })
        );
        assert_eq!(record.to_message(';'), "FATHER_URLS;f.com;c1.com;c2.com");
    }

    #[test]
    fn test_empty_title_allowed() {
        let record = CrawlRecord::parse("a.com|||word", '|').unwrap();
        match record {
            CrawlRecord::Page(page) => {
                assert!(page.title.is_empty());
                assert_eq!(page.words, vec!["word".to_owned()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_messages() {
        for message in ["", "a.com", "a.com|t", "a.com|t|d", "a.com|t|d|", "FATHER_URLS", "FATHER_URLS|f.com", "|t|d|w"] {
            assert!(
                matches!(CrawlRecord::parse(message, '|'), Err(IngestError::Malformed(_))),
                "{:?} should be rejected",
                message
            );
        }
    }
}
