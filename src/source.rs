use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::pagination::{NextPageSignal, PaginationController, PaginationSettings, Paginator};

/// One rendered gallery page for a single search term.
///
/// Implementations drive whatever renders the page (headless browser, static HTML
/// fetcher, test stub). Every method observes or acts on the page as it is *now*.
/// Dropping the page ends its session.
#[async_trait]
pub trait GalleryPage: Send {
    /// Base URL used to resolve relative `src` values.
    fn base_url(&self) -> &Url;
    /// `src` attributes of every image tag currently rendered, in document order.
    async fn image_sources(&mut self) -> Result<Vec<String>>;
    /// Number of image tags currently rendered.
    async fn tag_count(&mut self) -> Result<usize>;
    /// Wait for an actionable "load more" control and trigger it.
    /// `Ok(false)` when the page has no such control.
    async fn load_more(&mut self) -> Result<bool>;
    async fn scroll_to_bottom(&mut self) -> Result<()>;
}

/// Opens gallery pages for search terms.
#[async_trait]
pub trait GallerySource: Send + Sync {
    async fn open(&self, term: &str) -> Result<Box<dyn GalleryPage>>;

    /// Termination policy for pages from this source. Defaults to the tag-count heuristic.
    fn paginator(&self, settings: &PaginationSettings) -> Box<dyn Paginator> {
        Box::new(PaginationController::new(settings.clone()))
    }
}

pub fn search_url(template: &str, term: &str) -> Result<Url> {
    let encoded = url::form_urlencoded::byte_serialize(term.as_bytes()).collect::<String>();
    let raw = template.replace("{search_term}", &encoded);
    Url::parse(&raw).with_context(|| format!("invalid search url: {raw}"))
}

/// Static-HTML gallery source: fetches the search page over HTTP and follows
/// `rel="next"` links as its "load more" control.
pub struct HttpGallerySource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpGallerySource {
    pub fn new(client: reqwest::Client, url_template: impl Into<String>) -> Self {
        Self { client, url_template: url_template.into() }
    }
}

#[async_trait]
impl GallerySource for HttpGallerySource {
    async fn open(&self, term: &str) -> Result<Box<dyn GalleryPage>> {
        let url = search_url(&self.url_template, term)?;
        let mut page = HttpGalleryPage {
            client: self.client.clone(),
            base: url.clone(),
            sources: Vec::new(),
            next: None,
        };
        page.fetch_and_append(&url).await?;
        Ok(Box::new(page))
    }

    fn paginator(&self, settings: &PaginationSettings) -> Box<dyn Paginator> {
        Box::new(NextPageSignal::new(settings.clone()))
    }
}

struct HttpGalleryPage {
    client: reqwest::Client,
    base: Url,
    sources: Vec<String>,
    next: Option<Url>,
}

impl HttpGalleryPage {
    async fn fetch_and_append(&mut self, url: &Url) -> Result<()> {
        let resp = self.client.get(url.clone()).send().await
            .with_context(|| format!("fetching gallery page {url}"))?
            .error_for_status()
            .with_context(|| format!("gallery page {url}"))?;
        let body = resp.text().await.with_context(|| format!("reading gallery page {url}"))?;
        let (sources, next) = parse_gallery(&body, url);
        debug!(%url, tags = sources.len(), has_next = next.is_some(), "parsed gallery page");
        self.sources.extend(sources);
        self.next = next;
        Ok(())
    }
}

/// Extracts image sources (resolved against `page_url`) and the next-page link.
/// `Html` is not `Send`, so parsing stays in this synchronous helper.
fn parse_gallery(body: &str, page_url: &Url) -> (Vec<String>, Option<Url>) {
    let doc = Html::parse_document(body);
    let img = Selector::parse("img[src]");
    let next = Selector::parse(r#"a[rel~="next"][href], link[rel~="next"][href]"#);
    let (Ok(img), Ok(next)) = (img, next) else {
        return (Vec::new(), None);
    };
    let sources = doc
        .select(&img)
        .filter_map(|e| e.value().attr("src"))
        .map(|src| page_url.join(src).map(|u| u.to_string()).unwrap_or_else(|_| src.to_string()))
        .collect();
    let next = doc
        .select(&next)
        .filter_map(|e| e.value().attr("href"))
        .find_map(|href| page_url.join(href).ok());
    (sources, next)
}

#[async_trait]
impl GalleryPage for HttpGalleryPage {
    fn base_url(&self) -> &Url { &self.base }

    async fn image_sources(&mut self) -> Result<Vec<String>> { Ok(self.sources.clone()) }

    async fn tag_count(&mut self) -> Result<usize> { Ok(self.sources.len()) }

    async fn load_more(&mut self) -> Result<bool> {
        let Some(next) = self.next.take() else { return Ok(false) };
        self.fetch_and_append(&next).await?;
        Ok(true)
    }

    // Static pages have nothing lazily loaded.
    async fn scroll_to_bottom(&mut self) -> Result<()> { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_term() {
        let u = search_url("https://www.flickr.com/search/?text={search_term}", "snow leopard").unwrap();
        assert_eq!(u.as_str(), "https://www.flickr.com/search/?text=snow+leopard");
    }

    #[test]
    fn parse_gallery_resolves_sources_and_next() {
        let page = Url::parse("https://gallery.example/search?q=cat").unwrap();
        let html = r#"<html><body>
            <img src="/a_m.jpg"><img alt="no src"><img src="https://cdn.example/b.png">
            <a rel="next" href="/search?q=cat&page=2">more</a>
        </body></html>"#;
        let (sources, next) = parse_gallery(html, &page);
        assert_eq!(sources, vec!["https://gallery.example/a_m.jpg", "https://cdn.example/b.png"]);
        assert_eq!(next.unwrap().as_str(), "https://gallery.example/search?q=cat&page=2");
    }

    #[test]
    fn parse_gallery_without_next_link() {
        let page = Url::parse("https://gallery.example/").unwrap();
        let (sources, next) = parse_gallery("<p>nothing here</p>", &page);
        assert!(sources.is_empty());
        assert!(next.is_none());
    }
}
