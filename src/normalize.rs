use std::collections::HashSet;
use tracing::warn;
use url::Url;

/// Turns raw `src` attribute values into canonical absolute image URLs.
///
/// Low-resolution suffix tokens are rewritten to a single high-resolution token and
/// denylisted assets (logos, placeholders) are dropped. The transform is idempotent.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    low_res: Vec<String>,
    high_res: String,
    denylist: HashSet<String>,
}

impl UrlNormalizer {
    pub fn new<S: AsRef<str>>(low_res: &[S], high_res: &str, denylist: &[S]) -> Self {
        // A low token that is a suffix of the high token, or ends with it, would match
        // its own output on a second pass.
        let low_res = low_res
            .iter()
            .map(|s| s.as_ref().to_string())
            .filter(|t| !t.is_empty() && !high_res.ends_with(t.as_str()) && !t.ends_with(high_res))
            .collect();
        // Compared against serialized URLs, so entries are stored in the same form.
        let denylist = denylist
            .iter()
            .filter_map(|s| match Url::parse(s.as_ref().trim()) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    warn!(entry = s.as_ref(), error = %e, "ignoring unparsable denylist entry");
                    None
                }
            })
            .collect();
        Self { low_res, high_res: high_res.to_string(), denylist }
    }

    /// Returns `None` for empty, non-http(s), unparsable or denylisted values.
    pub fn normalize(&self, base: &Url, raw: &str) -> Option<Url> {
        let raw = raw.trim();
        if raw.is_empty() { return None; }
        let mut url = base.join(raw).ok()?;
        match url.scheme() { "http" | "https" => {}, _ => return None }

        let path = url.path().to_string();
        if let Some(token) = self.low_res.iter().find(|t| path.ends_with(t.as_str())) {
            let stem = &path[..path.len() - token.len()];
            url.set_path(&format!("{stem}{}", self.high_res));
        }

        if self.denylist.contains(url.as_str()) { return None; }
        Some(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerConfig;

    fn normalizer() -> UrlNormalizer {
        let cfg = NormalizerConfig::default();
        UrlNormalizer::new(&cfg.low_res_suffixes, &cfg.high_res_suffix, &cfg.denylist)
    }

    fn base() -> Url { Url::parse("https://www.flickr.com/search/?text=cat").unwrap() }

    #[test]
    fn joins_relative_and_protocol_relative_sources() {
        let n = normalizer();
        assert_eq!(
            n.normalize(&base(), "//live.staticflickr.com/65535/1_abc_m.jpg").unwrap().as_str(),
            "https://live.staticflickr.com/65535/1_abc_b.jpg"
        );
        assert_eq!(
            n.normalize(&base(), "/photos/2_def.png").unwrap().as_str(),
            "https://www.flickr.com/photos/2_def.png"
        );
    }

    #[test]
    fn rewrites_every_low_res_token() {
        let n = normalizer();
        for token in ["_m.jpg", "_n.jpg", "_w.jpg"] {
            let out = n.normalize(&base(), &format!("https://img.example/a/1{token}")).unwrap();
            assert_eq!(out.as_str(), "https://img.example/a/1_b.jpg");
        }
    }

    #[test]
    fn is_idempotent() {
        let n = normalizer();
        for raw in [
            "//live.staticflickr.com/65535/1_abc_m.jpg",
            "https://img.example/x_n.jpg?size=small",
            "relative/pic_w.jpg",
            "https://img.example/already_b.jpg",
        ] {
            let once = n.normalize(&base(), raw).unwrap();
            let twice = n.normalize(&base(), once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn denylisted_urls_never_come_out() {
        let n = normalizer();
        let logo = "https://combo.staticflickr.com/ap/build/images/getty/IStock_corporate_logo.svg";
        assert!(n.normalize(&base(), logo).is_none());
        let relative = "//combo.staticflickr.com/ap/build/images/getty/IStock_corporate_logo.svg";
        assert!(n.normalize(&base(), relative).is_none());
    }

    #[test]
    fn denylist_applies_after_rewrite() {
        let n = UrlNormalizer::new(&["_m.jpg"], "_b.jpg", &["https://img.example/ph_b.jpg"]);
        assert!(n.normalize(&base(), "https://img.example/ph_m.jpg").is_none());
    }

    #[test]
    fn rejects_empty_and_non_http() {
        let n = normalizer();
        assert!(n.normalize(&base(), "   ").is_none());
        assert!(n.normalize(&base(), "data:image/gif;base64,R0lGODlhAQABAAAAACw=").is_none());
        assert!(n.normalize(&base(), "javascript:void(0)").is_none());
    }

    #[test]
    fn drops_tokens_that_would_break_idempotency() {
        let n = UrlNormalizer::new(&[".jpg", "_b.jpg", "_m.jpg", "s_b.jpg"], "_b.jpg", &[] as &[&str]);
        let inputs = ["https://img.example/a_m.jpg", "https://img.example/cats_m.jpg", "https://img.example/cats_b.jpg"];
        for raw in inputs {
            let once = n.normalize(&base(), raw).unwrap();
            assert_eq!(n.normalize(&base(), once.as_str()).unwrap(), once, "not idempotent for {raw}");
        }
        assert_eq!(
            n.normalize(&base(), "https://img.example/cats_m.jpg").unwrap().as_str(),
            "https://img.example/cats_b.jpg"
        );
    }

    #[test]
    fn denylist_entries_match_in_canonical_form() {
        let n = UrlNormalizer::new(
            &["_m.jpg"],
            "_b.jpg",
            &["  HTTPS://IMG.Example/logo.svg ", "https://img.example", "not a url"],
        );
        assert!(n.normalize(&base(), "https://img.example/logo.svg").is_none());
        assert!(n.normalize(&base(), "https://img.example/").is_none());
        assert!(n.normalize(&base(), "https://img.example/cat.jpg").is_some());
    }
}
