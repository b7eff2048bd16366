use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use trawl::mirror::MirrorOptions;
use trawl::network::{FetchError, Method, RawResponse, Transport};
use trawl::spider::{ConsoleEvents, DownloadSkip, SpiderRules};
use trawl::{Mirror, RuleSet, Spider};

#[derive(Default)]
struct FakeTransport {
    pages: HashMap<String, RawResponse>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn page(mut self, url: &str, content_type: &str, body: &[u8]) -> Self {
        self.pages.insert(
            url.to_string(),
            RawResponse {
                url: url.to_string(),
                status: 200,
                headers: vec![("content-type".to_string(), content_type.to_string())],
                body: body.to_vec(),
            },
        );
        self
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| *u == url)
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        _headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.pages.get(url) {
            Some(page) => {
                let mut response = page.clone();
                if method == Method::Head {
                    response.body = Vec::new();
                }
                Ok(response)
            }
            None => Ok(RawResponse {
                url: url.to_string(),
                status: 404,
                ..RawResponse::default()
            }),
        }
    }
}

fn rules(follow: &[&str], save: &[&str], stop: &[&str]) -> SpiderRules {
    let parse = |texts: &[&str]| {
        RuleSet::parse(&texts.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    };
    SpiderRules {
        follow: parse(follow),
        save: parse(save),
        stop: parse(stop),
    }
}

fn spider(root: &Path, transport: Arc<FakeTransport>, rules: SpiderRules) -> Spider {
    let mirror = Mirror::open(root, MirrorOptions::default()).unwrap();
    Spider::new(
        mirror,
        transport,
        rules,
        DownloadSkip::Never,
        Box::new(ConsoleEvents),
    )
}

fn site() -> FakeTransport {
    FakeTransport::default()
        .page(
            "http://example.org/",
            "text/html",
            br#"<img src="/logo.png"><a href="/next">next</a>"#,
        )
        .page("http://example.org/logo.png", "image/png", b"\x89PNG")
        .page("http://example.org/next", "text/html", b"next page")
}

#[tokio::test]
async fn test_default_rules_take_page_and_requisites_only() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(site());
    let mut spider = spider(
        dir.path(),
        transport.clone(),
        rules(&["-", "+requisite"], &["+"], &["-"]),
    );
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();
    spider.into_mirror().finish().unwrap();

    // The page and its image come down; the plain link does not.
    assert!(dir.path().join("example.org/index.html").is_file());
    assert!(dir.path().join("example.org/logo.png").is_file());
    assert_eq!(transport.requests_for("http://example.org/next"), 0);

    // The stored page points at the local copy of the image; the
    // unfetched link is pinned to its absolute form.
    let page = std::fs::read_to_string(dir.path().join("example.org/index.html")).unwrap();
    assert_eq!(
        page,
        r#"<img src="./logo.png"><a href="http://example.org/next">next</a>"#
    );
}

#[tokio::test]
async fn test_hard_requisite_rule_allows_and_halts() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(site());
    let mut spider = spider(
        dir.path(),
        transport.clone(),
        // The doubled sign ends evaluation at the match; the verdict is
        // the same as with the soft form.
        rules(&["-", "++requisite"], &["+"], &["-"]),
    );
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();

    assert!(dir.path().join("example.org/logo.png").is_file());
    assert_eq!(transport.requests_for("http://example.org/next"), 0);
}

#[tokio::test]
async fn test_unsaved_page_provides_no_requisites() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(site());
    let mut spider = spider(
        dir.path(),
        transport.clone(),
        // Everything downloads but nothing is kept, so the image never
        // becomes the requisite of a mirrored page.
        rules(&["-", "+requisite"], &["-"], &["-"]),
    );
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();

    assert_eq!(transport.requests_for("http://example.org/logo.png"), 0);
    assert!(!dir.path().join("example.org/logo.png").exists());
}

#[tokio::test]
async fn test_second_run_with_delete_prunes_gone_pages() {
    let dir = TempDir::new().unwrap();
    let follow = &["-", "+same-domain"];

    let transport = Arc::new(
        FakeTransport::default()
            .page(
                "http://example.org/",
                "text/html",
                br#"<a href="/a">a</a><a href="/b">b</a>"#,
            )
            .page("http://example.org/a", "text/html", b"a")
            .page("http://example.org/b", "text/html", b"b"),
    );
    let mut spider = spider(dir.path(), transport, rules(follow, &["+"], &["-"]));
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();
    spider.into_mirror().finish().unwrap();
    assert!(dir.path().join("example.org/b.html").is_file());

    // The site dropped /b; a delete-enabled update removes the file.
    let transport = Arc::new(
        FakeTransport::default()
            .page(
                "http://example.org/",
                "text/html",
                br#"<a href="/a">a</a>"#,
            )
            .page("http://example.org/a", "text/html", b"a"),
    );
    let mirror = Mirror::open(
        dir.path(),
        MirrorOptions {
            write_at_once: false,
            ..MirrorOptions::default()
        },
    )
    .unwrap();
    let mut spider = Spider::new(
        mirror,
        transport,
        rules(follow, &["+"], &["-"]),
        DownloadSkip::Never,
        Box::new(ConsoleEvents),
    );
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();
    let mut mirror = spider.into_mirror();
    let deleted = mirror.delete_unencountered().unwrap();
    mirror.finish().unwrap();

    assert_eq!(deleted, vec!["example.org/b.html".to_string()]);
    assert!(dir.path().join("example.org/a.html").is_file());
    assert!(!dir.path().join("example.org/b.html").exists());
}

#[tokio::test]
async fn test_stop_rule_limits_depth() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(
        FakeTransport::default()
            .page(
                "http://example.org/",
                "text/html",
                br#"<a href="/one">x</a>"#,
            )
            .page(
                "http://example.org/one",
                "text/html",
                br#"<a href="/two">x</a>"#,
            )
            .page("http://example.org/two", "text/html", b"deep"),
    );
    let mut spider = spider(
        dir.path(),
        transport.clone(),
        rules(&["-", "+same-domain"], &["+"], &["-", "+depth>0"]),
    );
    spider.add_seed("http://example.org/").unwrap();
    spider.run().await.unwrap();

    // Depth 1 is saved but bailed at, so depth 2 is never requested.
    assert!(dir.path().join("example.org/one.html").is_file());
    assert_eq!(transport.requests_for("http://example.org/two"), 0);
}
