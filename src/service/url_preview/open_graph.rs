//! Open Graph metadata extraction

use once_cell::sync::Lazy;
use regex::Regex;

static HEAD_END_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</head\s*>").expect("head end regex should be valid")
});
static META_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<meta\s[^>]*>").expect("meta regex should be valid")
});
static ATTRIBUTE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9:_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("attribute regex should be valid")
});
static TITLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
        .expect("title regex should be valid")
});
static WHITESPACE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+").expect("whitespace regex should be valid")
});

/// The subset of Open Graph properties used for link previews
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct OpenGraph {
    pub(crate) title: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) kind: Option<String>,
    pub(crate) url: Option<String>,
    /// Possibly relative to the page
    pub(crate) image: Option<String>,
}

fn clean(text: &str) -> Option<String> {
    let decoded = html_escape::decode_html_entities(text);
    let collapsed = WHITESPACE_REGEX.replace_all(decoded.trim(), " ");
    (!collapsed.is_empty()).then(|| collapsed.into_owned())
}

/// Reads Open Graph properties from a page's `<head>`, falling back to the
/// `<title>` and description meta tags
pub(crate) fn parse(html: &str) -> OpenGraph {
    let head = HEAD_END_REGEX
        .find(html)
        .and_then(|end| html.get(..end.start()))
        .unwrap_or(html);

    let mut graph = OpenGraph::default();
    let mut description = None;
    let mut image = None;
    let mut image_url = None;
    let mut secure_image_url = None;

    for tag in META_REGEX.find_iter(head) {
        let mut key = None;
        let mut content = None;

        for attribute in ATTRIBUTE_REGEX.captures_iter(tag.as_str()) {
            let value = attribute.get(2).or_else(|| attribute.get(3));
            let (Some(name), Some(value)) = (attribute.get(1), value) else {
                continue;
            };

            match name.as_str().to_ascii_lowercase().as_str() {
                "property" | "name" => {
                    key.get_or_insert(value.as_str().to_ascii_lowercase());
                }
                "content" => content = clean(value.as_str()),
                _ => {}
            }
        }

        let (Some(key), Some(content)) = (key, content) else {
            continue;
        };

        let slot = match key.as_str() {
            "og:title" => &mut graph.title,
            "og:description" => &mut graph.description,
            "og:type" => &mut graph.kind,
            "og:url" => &mut graph.url,
            "og:image" => &mut image,
            "og:image:url" => &mut image_url,
            "og:image:secure_url" => &mut secure_image_url,
            "description" => &mut description,
            _ => continue,
        };
        slot.get_or_insert(content);
    }

    graph.image = secure_image_url.or(image).or(image_url);
    graph.description = graph.description.or(description);
    if graph.title.is_none() {
        graph.title = TITLE_REGEX
            .captures(head)
            .and_then(|c| c.get(1))
            .and_then(|m| clean(m.as_str()));
    }

    graph
}
