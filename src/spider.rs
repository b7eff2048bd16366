/// The crawl loop: a LIFO work queue of links, the three rule chains
/// deciding what to follow, save and stop at, and the glue between the
/// transport, the parsers and the mirror.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::link::{Link, LinkArena, LinkId, LinkOpts, Resolution};
use crate::mirror::{Mirror, MirrorError};
use crate::network::{FetchError, FetchKind, Resolver, Transport};
use crate::parsers::{header_links, parser_for};
use crate::rules::{EvalCtx, RuleSet, RuleVerdict};
use crate::urlnorm::normalize;

#[derive(Debug, Error)]
pub enum SpiderError {
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// When to skip downloading a URL the mirror already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadSkip {
    /// Always revalidate (conditional requests still avoid the body).
    #[default]
    Never,
    /// Anything stored is good enough.
    Exists,
    /// Stored and its `Expires` header lies in the future.
    TrustExpires,
}

/// Progress callbacks. The console implementation prints one line per
/// link; tests record what they need.
pub trait SpiderEvents {
    fn queued(&mut self, _link: &Link) {}
    fn taken(&mut self, _link: &Link) {}
    fn skipped(&mut self, _link: &Link, _reason: &str) {}
    fn retried(&mut self, _link: &Link, _attempt: u32) {}
    fn failed(&mut self, _link: &Link, _reason: &str) {}
    fn saved(&mut self, _link: &Link, _saved: bool, _verdict: Option<&RuleVerdict>) {}
    fn bailed(&mut self, _link: &Link, _verdict: &RuleVerdict) {}
    fn followed(&mut self, _link: &Link, _followed: usize, _total: usize) {}
    fn completed(&mut self, _processed: usize, _saved: usize) {}
}

/// Streams one status line per processed link to stdout.
#[derive(Debug, Default)]
pub struct ConsoleEvents;

impl SpiderEvents for ConsoleEvents {
    fn queued(&mut self, link: &Link) {
        debug!(url = %link.url, "queued");
    }

    fn skipped(&mut self, link: &Link, reason: &str) {
        println!("skip  {} ({reason})", link.url);
    }

    fn retried(&mut self, link: &Link, attempt: u32) {
        println!("retry {} (attempt {attempt})", link.url);
    }

    fn failed(&mut self, link: &Link, reason: &str) {
        println!("fail  {} ({reason})", link.url);
    }

    fn saved(&mut self, link: &Link, saved: bool, verdict: Option<&RuleVerdict>) {
        let rule = verdict
            .and_then(|v| v.deciding_rule())
            .map(|r| format!(" [{r}]"))
            .unwrap_or_default();
        if saved {
            println!("save  {}{rule}", link.url);
        } else {
            println!("pass  {}{rule}", link.url);
        }
    }

    fn bailed(&mut self, link: &Link, verdict: &RuleVerdict) {
        let rule = verdict
            .deciding_rule()
            .map(|r| format!(" [{r}]"))
            .unwrap_or_default();
        println!("bail  {}{rule}", link.url);
    }

    fn followed(&mut self, link: &Link, followed: usize, total: usize) {
        if total > 0 {
            println!("      {} +{followed}/{total} links", link.url);
        }
    }

    fn completed(&mut self, processed: usize, saved: usize) {
        println!("done: {processed} processed, {saved} saved");
    }
}

/// The rule chains, in evaluation roles.
pub struct SpiderRules {
    pub follow: RuleSet,
    pub save: RuleSet,
    pub stop: RuleSet,
}

/// Resolution outcome reduced to what the loop dispatches on, so the
/// borrow of the link can end before the queue and mirror are touched.
enum Outcome {
    Failed(FetchError),
    Redirected { first_status: u16, target: String },
    HttpError(u16),
    NotModified,
    Document,
}

pub struct Spider {
    arena: LinkArena,
    mirror: Mirror,
    transport: Arc<dyn Transport>,
    rules: SpiderRules,
    skip: DownloadSkip,
    events: Box<dyn SpiderEvents>,
    queue: VecDeque<LinkId>,
    known: HashSet<String>,
    processed: usize,
    saved: usize,
}

impl Spider {
    pub fn new(
        mirror: Mirror,
        transport: Arc<dyn Transport>,
        rules: SpiderRules,
        skip: DownloadSkip,
        events: Box<dyn SpiderEvents>,
    ) -> Spider {
        Spider {
            arena: LinkArena::new(),
            mirror,
            transport,
            rules,
            skip,
            events,
            queue: VecDeque::new(),
            known: HashSet::new(),
            processed: 0,
            saved: 0,
        }
    }

    /// Queue a user-supplied starting point.
    pub fn add_seed(&mut self, raw: &str) -> Result<LinkId, crate::urlnorm::InvalidUrl> {
        let id = self.arena.add_seed(raw)?;
        self.queue.push_back(id);
        self.events.queued(self.arena.get(id));
        Ok(id)
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Hand the mirror back for end-of-run work.
    pub fn into_mirror(self) -> Mirror {
        self.mirror
    }

    /// Drain the queue. Newest work first, so one branch of the site is
    /// finished before the next one starts.
    pub async fn run(&mut self) -> Result<(), SpiderError> {
        while let Some(id) = self.queue.pop_back() {
            self.processed += 1;
            self.process_one(id).await?;
        }
        self.events.completed(self.processed, self.saved);
        Ok(())
    }

    async fn process_one(&mut self, id: LinkId) -> Result<(), SpiderError> {
        let url = self.arena.get(id).url.clone();
        self.events.taken(self.arena.get(id));

        if self.arena.get(id).info.do_not_follow {
            self.events.skipped(self.arena.get(id), "no-download");
            return Ok(());
        }
        if self.known.contains(&url) {
            self.events.skipped(self.arena.get(id), "duplicate");
            return Ok(());
        }

        // Seeds are wanted by definition; only discovered links answer
        // to the follow chain.
        if self.arena.get(id).info.source.as_deref() != Some("user") {
            let verdict = {
                let mut ctx = EvalCtx {
                    arena: &mut self.arena,
                    mirror: Some(&self.mirror),
                    resolver: Resolver::new(self.transport.as_ref()),
                };
                self.rules.follow.apply(id, &mut ctx).await
            };
            if !verdict.allow {
                self.events.skipped(self.arena.get(id), "rule-deny");
                return Ok(());
            }
        }

        if self.should_skip_download(&url) {
            return self.revisit(id, &url).await;
        }

        let validators = self.mirror.validators_for(&url);
        let outcome = {
            let resolver = Resolver::new(self.transport.as_ref());
            let link = self.arena.get_mut(id);
            let resolution = resolver
                .resolve(link, FetchKind::Full, validators.as_ref())
                .await;
            match resolution {
                Resolution::Failed(e) => Outcome::Failed(e.clone()),
                Resolution::Fetched(r) => {
                    if let Some((first, _)) = r.redirects.first() {
                        match r.redirects.last() {
                            Some((_, target)) => Outcome::Redirected {
                                first_status: *first,
                                target: target.clone(),
                            },
                            None => Outcome::HttpError(r.status),
                        }
                    } else if r.is_redirect() {
                        // Redirect status but no usable Location.
                        Outcome::HttpError(r.status)
                    } else if r.status == 304 {
                        Outcome::NotModified
                    } else if r.status >= 400 {
                        Outcome::HttpError(r.status)
                    } else {
                        Outcome::Document
                    }
                }
            }
        };

        match outcome {
            Outcome::Failed(e) => {
                let retries = self.arena.get(id).retries;
                if e.is_retryable() && retries < Config::MAX_RETRIES {
                    self.arena.get_mut(id).retry();
                    self.queue.push_back(id);
                    self.events.retried(self.arena.get(id), retries + 1);
                } else {
                    self.events.failed(self.arena.get(id), "connect-error");
                }
                Ok(())
            }
            Outcome::Redirected {
                first_status,
                target,
            } => {
                let canonical = match normalize(&target) {
                    Ok((canonical, _)) => canonical,
                    Err(_) => {
                        self.events.failed(self.arena.get(id), "redirect");
                        return Ok(());
                    }
                };
                if canonical == url {
                    self.events.failed(self.arena.get(id), "self-redirect");
                    return Ok(());
                }
                self.mirror.add_redirect(&url, first_status, &canonical);
                match self.arena.add_redirect_target(&target, id) {
                    Ok(new_id) => {
                        self.queue.push_back(new_id);
                        self.events.queued(self.arena.get(new_id));
                    }
                    Err(e) => debug!(url = %target, error = %e, "redirect target dropped"),
                }
                self.events.failed(self.arena.get(id), "redirect");
                Ok(())
            }
            Outcome::HttpError(status) => {
                debug!(url = %url, status, "http error");
                self.events.failed(self.arena.get(id), "http-error");
                Ok(())
            }
            Outcome::NotModified => self.revisit(id, &url).await,
            Outcome::Document => self.store_and_follow(id, &url).await,
        }
    }

    fn should_skip_download(&self, url: &str) -> bool {
        match self.skip {
            DownloadSkip::Never => false,
            DownloadSkip::Exists => self.mirror.has_stored(url),
            DownloadSkip::TrustExpires => self
                .mirror
                .stored_info(url)
                .and_then(|info| info.expires.as_deref())
                .and_then(parse_http_date)
                .map(|expires| expires > Utc::now())
                .unwrap_or(false),
        }
    }

    /// The not-modified path: the stored copy stands in for the body, so
    /// children come from the stored link list instead of a parse.
    async fn revisit(&mut self, id: LinkId, url: &str) -> Result<(), SpiderError> {
        self.events.failed(self.arena.get(id), "not-modified");
        if !self.mirror.encounter_url(url) {
            // Metadata without a file: nothing to revisit.
            return Ok(());
        }
        self.known.insert(url.to_string());

        let verdict = {
            let mut ctx = EvalCtx {
                arena: &mut self.arena,
                mirror: Some(&self.mirror),
                resolver: Resolver::new(self.transport.as_ref()),
            };
            self.rules.stop.apply(id, &mut ctx).await
        };
        if verdict.allow {
            self.events.bailed(self.arena.get(id), &verdict);
            return Ok(());
        }

        let links = self
            .mirror
            .stored_info(url)
            .map(|info| info.links.clone())
            .unwrap_or_default();
        self.enqueue_children(id, &links);
        Ok(())
    }

    async fn store_and_follow(&mut self, id: LinkId, url: &str) -> Result<(), SpiderError> {
        let found = self.collect_links(id);

        let verdict = {
            let mut ctx = EvalCtx {
                arena: &mut self.arena,
                mirror: Some(&self.mirror),
                resolver: Resolver::new(self.transport.as_ref()),
            };
            self.rules.save.apply(id, &mut ctx).await
        };
        if verdict.allow {
            let link = self.arena.get(id);
            if let Some(response) = link.response() {
                self.mirror.add(link, response, &found)?;
                self.known.insert(url.to_string());
                self.saved += 1;
                self.events.saved(self.arena.get(id), true, Some(&verdict));
            }
        } else {
            // Not saved and not marked known: another discovery path may
            // still want this URL under different rule state.
            self.events.saved(self.arena.get(id), false, Some(&verdict));
        }

        let verdict = {
            let mut ctx = EvalCtx {
                arena: &mut self.arena,
                mirror: Some(&self.mirror),
                resolver: Resolver::new(self.transport.as_ref()),
            };
            self.rules.stop.apply(id, &mut ctx).await
        };
        if verdict.allow {
            self.events.bailed(self.arena.get(id), &verdict);
            return Ok(());
        }

        self.enqueue_children(id, &found);
        Ok(())
    }

    /// Links from the body (when a parser claims the mimetype) plus any
    /// `Link:` response headers.
    fn collect_links(&self, id: LinkId) -> Vec<(String, LinkOpts)> {
        let link = self.arena.get(id);
        let Some(response) = link.response() else {
            return Vec::new();
        };
        let Ok(base) = Url::parse(&link.request_url()) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        if let Some(kind) = response.mimetype().as_deref().and_then(parser_for) {
            if let Some(body) = &response.body {
                match kind.extract(body, &base) {
                    Ok(links) => found.extend(links),
                    Err(e) => warn!(url = %link.url, error = %e, "parse failed"),
                }
            }
        }
        found.extend(header_links(&response.link_headers, &base));
        found
    }

    fn enqueue_children(&mut self, id: LinkId, links: &[(String, LinkOpts)]) {
        let total = links.len();
        let mut followed = 0;
        for (raw, opts) in links {
            // Documents are full of strings that only look like URLs;
            // those are dropped without ceremony.
            let Ok(child) = self.arena.add_child(raw, id, opts.clone()) else {
                continue;
            };
            if self.known.contains(&self.arena.get(child).url) {
                continue;
            }
            self.queue.push_back(child);
            followed += 1;
            self.events.queued(self.arena.get(child));
        }
        self.events.followed(self.arena.get(id), followed, total);
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
