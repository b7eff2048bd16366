/// Link entities and their discovery lineage.
///
/// Links form a tree (each link points at the link whose document referenced
/// it), so they are stored in an arena and refer to each other by index.
/// That keeps lineage walks (`depth`, `path-distance-to-original`, ...) cheap
/// and avoids reference cycles between parents and children.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::network::{FetchError, FetchedResponse};
use crate::urlnorm::{self, InvalidUrl, LossyData};

pub type LinkId = usize;

/// Discovery metadata attached to a link by whatever found it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkOpts {
    /// Page requisite: rendering the referencing document needs this URL
    /// (images, stylesheets, scripts, frames).
    #[serde(default)]
    pub inline: bool,
    /// Where the link came from: "user" for seeds, "http-header" for
    /// `Link:` headers, unset for document links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Extracted for storage-side knowledge but never crawled
    /// (e.g. form targets).
    #[serde(default)]
    pub do_not_follow: bool,
    /// Originating element, e.g. "a.href" or "link.href".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl LinkOpts {
    pub fn user() -> Self {
        LinkOpts {
            source: Some("user".to_string()),
            ..LinkOpts::default()
        }
    }
}

/// Cached outcome of resolving a link against the network.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Connection-class failure (DNS, refused, timeout). Retryable.
    Failed(FetchError),
    Fetched(FetchedResponse),
}

#[derive(Debug, Clone)]
pub struct Link {
    /// The URL exactly as discovered, before normalization.
    pub original_url: String,
    /// Canonical comparison form.
    pub url: String,
    pub lossy: LossyData,
    /// Parsed canonical form, for the rule tests that pick URLs apart.
    pub parsed: Url,
    pub previous: Option<LinkId>,
    pub root: LinkId,
    pub depth: u32,
    /// Steps since the last host change along the lineage.
    pub domain_depth: u32,
    pub info: LinkOpts,
    pub retries: u32,
    pub resolution: Option<Resolution>,
}

impl Link {
    /// The URL to put on the wire: canonical form with the original
    /// scheme restored.
    pub fn request_url(&self) -> String {
        urlnorm::request_url(&self.url, &self.lossy)
    }

    /// Forget a failed resolution so the next resolve retries the fetch.
    pub fn retry(&mut self) {
        self.retries += 1;
        self.resolution = None;
    }

    pub fn response(&self) -> Option<&FetchedResponse> {
        match &self.resolution {
            Some(Resolution::Fetched(r)) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkArena {
    links: Vec<Link>,
}

impl LinkArena {
    pub fn new() -> Self {
        LinkArena::default()
    }

    pub fn get(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    pub fn get_mut(&mut self, id: LinkId) -> &mut Link {
        &mut self.links[id]
    }

    /// Add a user-supplied seed. Seeds are their own root.
    pub fn add_seed(&mut self, raw: &str) -> Result<LinkId, InvalidUrl> {
        let (url, lossy) = urlnorm::normalize(raw)?;
        let parsed = Url::parse(&url)?;
        let id = self.links.len();
        self.links.push(Link {
            original_url: raw.to_string(),
            url,
            lossy,
            parsed,
            previous: None,
            root: id,
            depth: 0,
            domain_depth: 0,
            info: LinkOpts::user(),
            retries: 0,
            resolution: None,
        });
        Ok(id)
    }

    /// Add a link discovered in the document of `previous`.
    pub fn add_child(
        &mut self,
        raw: &str,
        previous: LinkId,
        mut info: LinkOpts,
    ) -> Result<LinkId, InvalidUrl> {
        // Requisites of a requisite are requisites themselves: the frameset
        // page needs the frame, the frame needs its images.
        if self.links[previous].info.inline {
            info.inline = true;
        }
        let (url, lossy) = urlnorm::normalize(raw)?;
        let parsed = Url::parse(&url)?;
        let id = self.links.len();
        let mut link = Link {
            original_url: raw.to_string(),
            url,
            lossy,
            parsed,
            previous: Some(previous),
            root: 0,
            depth: 0,
            domain_depth: 0,
            info,
            retries: 0,
            resolution: None,
        };
        self.reparent(&mut link, Some(previous));
        self.links.push(link);
        Ok(id)
    }

    /// Add the final target of a redirect chain. The new link keeps the
    /// *original* link's discovery info and parent, so rule state (depth,
    /// requisite, source) carries across the redirect.
    pub fn add_redirect_target(
        &mut self,
        raw: &str,
        original: LinkId,
    ) -> Result<LinkId, InvalidUrl> {
        let (url, lossy) = urlnorm::normalize(raw)?;
        let parsed = Url::parse(&url)?;
        let previous = self.links[original].previous;
        let info = self.links[original].info.clone();
        let id = self.links.len();
        let mut link = Link {
            original_url: raw.to_string(),
            url,
            lossy,
            parsed,
            previous,
            root: id,
            depth: 0,
            domain_depth: 0,
            info,
            retries: 0,
            resolution: None,
        };
        self.reparent(&mut link, previous);
        self.links.push(link);
        Ok(id)
    }

    /// Recompute lineage-derived fields of `link` for a new parent.
    fn reparent(&self, link: &mut Link, previous: Option<LinkId>) {
        link.previous = previous;
        match previous {
            Some(pid) => {
                let prev = &self.links[pid];
                link.root = prev.root;
                link.depth = prev.depth + 1;
                link.domain_depth = if prev.parsed.host_str() == link.parsed.host_str() {
                    prev.domain_depth + 1
                } else {
                    0
                };
            }
            None => {
                link.depth = 0;
                link.domain_depth = 0;
                // root was preset to the link's own id by the caller
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_its_own_root() {
        let mut arena = LinkArena::new();
        let id = arena.add_seed("http://example.org/").unwrap();
        let link = arena.get(id);
        assert_eq!(link.root, id);
        assert_eq!(link.depth, 0);
        assert_eq!(link.info.source.as_deref(), Some("user"));
    }

    #[test]
    fn test_child_depth_and_root() {
        let mut arena = LinkArena::new();
        let seed = arena.add_seed("http://example.org/").unwrap();
        let a = arena
            .add_child("http://example.org/a", seed, LinkOpts::default())
            .unwrap();
        let b = arena
            .add_child("http://example.org/a/b", a, LinkOpts::default())
            .unwrap();
        assert_eq!(arena.get(a).depth, 1);
        assert_eq!(arena.get(b).depth, 2);
        assert_eq!(arena.get(b).root, seed);
    }

    #[test]
    fn test_domain_depth_resets_on_host_change() {
        let mut arena = LinkArena::new();
        let seed = arena.add_seed("http://example.org/").unwrap();
        let a = arena
            .add_child("http://example.org/a", seed, LinkOpts::default())
            .unwrap();
        let other = arena
            .add_child("http://other.org/", a, LinkOpts::default())
            .unwrap();
        let deeper = arena
            .add_child("http://other.org/x", other, LinkOpts::default())
            .unwrap();
        assert_eq!(arena.get(a).domain_depth, 1);
        assert_eq!(arena.get(other).domain_depth, 0);
        assert_eq!(arena.get(deeper).domain_depth, 1);
    }

    #[test]
    fn test_inline_propagates_to_children() {
        let mut arena = LinkArena::new();
        let seed = arena.add_seed("http://example.org/").unwrap();
        let css = arena
            .add_child(
                "http://example.org/style.css",
                seed,
                LinkOpts {
                    inline: true,
                    ..LinkOpts::default()
                },
            )
            .unwrap();
        let img = arena
            .add_child("http://example.org/bg.png", css, LinkOpts::default())
            .unwrap();
        assert!(arena.get(img).info.inline);
    }

    #[test]
    fn test_redirect_target_inherits_lineage() {
        let mut arena = LinkArena::new();
        let seed = arena.add_seed("http://example.org/").unwrap();
        let child = arena
            .add_child(
                "http://example.org/old",
                seed,
                LinkOpts {
                    inline: true,
                    tag: Some("img.src".to_string()),
                    ..LinkOpts::default()
                },
            )
            .unwrap();
        let target = arena
            .add_redirect_target("http://example.org/new", child)
            .unwrap();
        let t = arena.get(target);
        assert_eq!(t.previous, Some(seed));
        assert_eq!(t.depth, 1);
        assert!(t.info.inline);
        assert_eq!(t.info.tag.as_deref(), Some("img.src"));
    }

    #[test]
    fn test_redirected_seed_still_counts_as_seed() {
        let mut arena = LinkArena::new();
        let seed = arena.add_seed("http://example.org/").unwrap();
        let target = arena
            .add_redirect_target("http://www.example.org/", seed)
            .unwrap();
        let t = arena.get(target);
        assert_eq!(t.previous, None);
        assert_eq!(t.depth, 0);
        assert_eq!(t.info.source.as_deref(), Some("user"));
        assert_eq!(t.root, target);
    }
}
