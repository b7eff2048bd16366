/// The local mirror: files on disk plus the link database that makes the
/// copy browsable offline and updatable later.
///
/// Three maps survive between runs inside a redb database under
/// `<mirror>/.track/`: `urls` (URL to the files it was stored as),
/// `url_info` (per-URL metadata: mimetype, cache validators and the
/// outgoing links with their discovery options) and `info` (mirror-level
/// key/values such as the original command line). Every mutation commits
/// its own write transaction, so an interrupted run leaves a usable
/// mirror behind.
///
/// The in-memory `url_usage` reverse index (who references whom) is
/// rebuilt from `url_info` at open and drives incremental link rewriting:
/// saving one page only rewrites that page and its referrers, not the
/// whole tree.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::link::{Link, LinkOpts};
use crate::network::{is_permanent_redirect, FetchedResponse};
use crate::parsers::{parser_for, ParseError};
use crate::urlnorm::normalize;

const URLS: TableDefinition<'_, &str, &str> = TableDefinition::new("urls");
const URL_INFO: TableDefinition<'_, &str, &str> = TableDefinition::new("url_info");
const INFO: TableDefinition<'_, &str, &str> = TableDefinition::new("info");

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("rewrite failed for {url}: {source}")]
    Rewrite { url: String, source: ParseError },
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Rewrite links in stored documents at all.
    pub convert_links: bool,
    /// Rewrite incrementally after every save instead of once at the end.
    pub write_at_once: bool,
    /// Keep pristine copies under `.originals/`.
    pub backups: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            convert_links: true,
            write_at_once: true,
            backups: false,
        }
    }
}

/// Persisted per-URL metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlInfo {
    pub mimetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    /// Request URL with the original scheme, the base for rewrites.
    pub base_url: String,
    /// Outgoing links exactly as discovered, with their options.
    #[serde(default)]
    pub links: Vec<(String, LinkOpts)>,
}

/// Extensions by mimetype; first entry per mimetype is the canonical one,
/// later entries are accepted aliases.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("text/html", "html"),
    ("text/html", "htm"),
    ("application/xhtml+xml", "html"),
    ("text/css", "css"),
    ("text/plain", "txt"),
    ("text/javascript", "js"),
    ("application/javascript", "js"),
    ("application/json", "json"),
    ("application/pdf", "pdf"),
    ("application/xml", "xml"),
    ("text/xml", "xml"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/jpeg", "jpeg"),
    ("image/gif", "gif"),
    ("image/svg+xml", "svg"),
    ("image/x-icon", "ico"),
    ("image/vnd.microsoft.icon", "ico"),
    ("image/webp", "webp"),
    ("font/woff", "woff"),
    ("font/woff2", "woff2"),
];

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    MIME_EXTENSIONS.iter().find(|(m, _)| *m == mime).map(|(_, e)| *e)
}

fn ext_matches_mime(ext: &str, mime: &str) -> bool {
    MIME_EXTENSIONS
        .iter()
        .any(|(m, e)| *m == mime && e.eq_ignore_ascii_case(ext))
}

fn split_ext(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx + 1..]),
        _ => (filename, ""),
    }
}

fn truncate_segment(segment: &str) -> &str {
    if segment.len() <= Config::MAX_SEGMENT_BYTES {
        return segment;
    }
    let mut end = Config::MAX_SEGMENT_BYTES;
    while !segment.is_char_boundary(end) {
        end -= 1;
    }
    &segment[..end]
}

pub struct Mirror {
    root: PathBuf,
    options: MirrorOptions,
    db: Database,
    stored_urls: BTreeMap<String, BTreeSet<String>>,
    url_info: BTreeMap<String, UrlInfo>,
    /// URL -> filename used in this run.
    encountered: BTreeMap<String, String>,
    /// Target URL -> URLs whose documents reference it.
    url_usage: BTreeMap<String, BTreeSet<String>>,
    /// Run-scoped: URL -> (status of first hop, final target).
    redirects: HashMap<String, (u16, String)>,
}

impl Mirror {
    /// A directory is a mirror if it carries the data directory.
    pub fn is_valid_mirror(root: &Path) -> bool {
        root.join(Config::DATA_DIR).is_dir()
    }

    pub fn open(root: &Path, options: MirrorOptions) -> Result<Mirror, MirrorError> {
        let data_dir = root.join(Config::DATA_DIR);
        fs::create_dir_all(&data_dir)?;
        let db = Database::create(data_dir.join(Config::DB_FILE))?;

        // Make sure all tables exist before the first read.
        let txn = db.begin_write()?;
        {
            txn.open_table(URLS)?;
            txn.open_table(URL_INFO)?;
            txn.open_table(INFO)?;
        }
        txn.commit()?;

        let mut mirror = Mirror {
            root: root.to_path_buf(),
            options,
            db,
            stored_urls: BTreeMap::new(),
            url_info: BTreeMap::new(),
            encountered: BTreeMap::new(),
            url_usage: BTreeMap::new(),
            redirects: HashMap::new(),
        };
        mirror.load()?;
        Ok(mirror)
    }

    fn load(&mut self) -> Result<(), MirrorError> {
        let txn = self.db.begin_read()?;
        {
            let table = txn.open_table(URLS)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let files: BTreeSet<String> = serde_json::from_str(value.value())?;
                self.stored_urls.insert(key.value().to_string(), files);
            }
        }
        {
            let table = txn.open_table(URL_INFO)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let info: UrlInfo = serde_json::from_str(value.value())?;
                self.url_info.insert(key.value().to_string(), info);
            }
        }
        self.rebuild_usage();
        Ok(())
    }

    fn rebuild_usage(&mut self) {
        self.url_usage.clear();
        for (url, info) in &self.url_info {
            for (target, _) in &info.links {
                if let Ok((canonical, _)) = normalize(target) {
                    self.url_usage
                        .entry(canonical)
                        .or_default()
                        .insert(url.clone());
                }
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Swap the behaviour flags after open. `--update` needs this: the
    /// stored option set only becomes readable once the mirror is open.
    pub fn set_options(&mut self, options: MirrorOptions) {
        self.options = options;
    }

    pub fn stored_count(&self) -> usize {
        self.stored_urls.len()
    }

    pub fn encountered_count(&self) -> usize {
        self.encountered.len()
    }

    pub fn is_encountered(&self, url: &str) -> bool {
        self.encountered.contains_key(url)
    }

    pub fn has_stored(&self, url: &str) -> bool {
        self.url_info.contains_key(url)
    }

    pub fn stored_info(&self, url: &str) -> Option<&UrlInfo> {
        self.url_info.get(url)
    }

    pub fn validators_for(&self, url: &str) -> Option<crate::network::Validators> {
        let info = self.url_info.get(url)?;
        let validators = crate::network::Validators {
            etag: info.etag.clone(),
            last_modified: info.last_modified.clone(),
        };
        (!validators.is_empty()).then_some(validators)
    }

    /// Derive the storage path for a URL. Deterministic: host directory
    /// (with the port when explicit), the URL path, `index` for a
    /// trailing slash, the extension fixed up from the mimetype, and an
    /// 8-hex query digest so distinct query strings get distinct files.
    pub fn get_filename(url: &Url, mimetype: &str) -> String {
        let host = url.host_str().unwrap_or("unknown-host");
        let host_dir = match url.port() {
            Some(port) => format!("{host}_{port}"),
            None => host.to_string(),
        };

        let mut segments: Vec<String> = url
            .path()
            .split('/')
            .skip(1)
            .map(str::to_string)
            .collect();
        let last = segments.pop().unwrap_or_default();
        let filename = if last.is_empty() { "index".to_string() } else { last };

        let (stem, ext) = split_ext(&filename);
        let mut stem = stem.to_string();
        let mut ext = ext.to_string();
        if let Some(canonical) = ext_for_mime(mimetype) {
            if ext.is_empty() || !ext_matches_mime(&ext, mimetype) {
                ext = canonical.to_string();
            }
        }
        if let Some(query) = url.query() {
            if !query.is_empty() {
                let digest = format!("{:x}", Sha256::digest(query.as_bytes()));
                stem = format!("{stem}_{}", &digest[..Config::QUERY_HASH_LEN]);
            }
        }
        let filename = if ext.is_empty() {
            stem
        } else {
            format!("{stem}.{ext}")
        };

        let mut parts = vec![host_dir];
        parts.extend(segments);
        parts.push(filename);
        parts
            .iter()
            .map(|s| truncate_segment(s))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Store a fetched document: write the file (and its backup), record
    /// the maps, register usage for every outgoing link, persist, and in
    /// live-update mode rewrite the affected files right away.
    pub fn add(
        &mut self,
        link: &Link,
        response: &FetchedResponse,
        links: &[(String, LinkOpts)],
    ) -> Result<(), MirrorError> {
        let mimetype = response
            .mimetype()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = Self::get_filename(&link.parsed, &mimetype);
        let body = response.body.as_deref().unwrap_or_default();

        let path = self.root.join(&filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body)?;
        if self.options.backups {
            let backup = self.root.join(Config::BACKUP_DIR).join(&filename);
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&backup, body)?;
        }

        let url = link.url.clone();
        self.stored_urls
            .entry(url.clone())
            .or_default()
            .insert(filename.clone());
        self.encountered.insert(url.clone(), filename);
        self.url_info.insert(
            url.clone(),
            UrlInfo {
                mimetype,
                etag: response.etag.clone(),
                last_modified: response.last_modified.clone(),
                expires: response.expires.clone(),
                base_url: link.request_url(),
                links: links.to_vec(),
            },
        );
        for (target, _) in links {
            if let Ok((canonical, _)) = normalize(target) {
                self.url_usage
                    .entry(canonical)
                    .or_default()
                    .insert(url.clone());
            }
        }
        self.persist_url(&url)?;

        if self.options.convert_links && self.options.write_at_once {
            self.convert_links(Some(&url))?;
        }
        Ok(())
    }

    /// Mark a stored URL as seen in this run without re-downloading it.
    /// Returns false when nothing is stored for the URL.
    pub fn encounter_url(&mut self, url: &str) -> bool {
        let Some(files) = self.stored_urls.get(url) else {
            return false;
        };
        let Some(filename) = files.iter().next() else {
            return false;
        };
        self.encountered.insert(url.to_string(), filename.clone());
        true
    }

    /// Record a redirect seen during the crawl, keyed by the status of
    /// the first hop.
    pub fn add_redirect(&mut self, from: &str, status: u16, target: &str) {
        self.redirects
            .insert(from.to_string(), (status, target.to_string()));
    }

    fn persist_url(&self, url: &str) -> Result<(), MirrorError> {
        let (Some(files), Some(info)) = (self.stored_urls.get(url), self.url_info.get(url))
        else {
            return Ok(());
        };
        let files = serde_json::to_string(files)?;
        let info = serde_json::to_string(info)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(URLS)?;
            table.insert(url, files.as_str())?;
            let mut table = txn.open_table(URL_INFO)?;
            table.insert(url, info.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn persist_all(&self) -> Result<(), MirrorError> {
        let txn = self.db.begin_write()?;
        {
            txn.delete_table(URLS)?;
            txn.delete_table(URL_INFO)?;
            let mut table = txn.open_table(URLS)?;
            for (url, files) in &self.stored_urls {
                table.insert(url.as_str(), serde_json::to_string(files)?.as_str())?;
            }
            let mut table = txn.open_table(URL_INFO)?;
            for (url, info) in &self.url_info {
                table.insert(url.as_str(), serde_json::to_string(info)?.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Mirror-level key/value storage (used for `--update` replay).
    pub fn set_info(&self, key: &str, value: &str) -> Result<(), MirrorError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INFO)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_info(&self, key: &str) -> Result<Option<String>, MirrorError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INFO)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    fn filename_for(&self, url: &str) -> Option<&str> {
        if let Some(filename) = self.encountered.get(url) {
            return Some(filename);
        }
        self.stored_urls
            .get(url)
            .and_then(|files| files.iter().next())
            .map(String::as_str)
    }

    /// Decide the replacement for one absolutized URL found in the file
    /// stored for a document living in `from_dir`.
    fn replacement_for(&self, absolute: &str, from_dir: &str) -> Option<String> {
        let (canonical, lossy) = normalize(absolute).ok()?;
        let fragment = lossy
            .fragment
            .map(|f| format!("#{f}"))
            .unwrap_or_default();

        if let Some(filename) = self.filename_for(&canonical) {
            return Some(format!("./{}{}", rel_path(filename, from_dir), fragment));
        }

        // A permanently redirected URL whose target we stored can point
        // straight at the stored copy. Temporary redirects are not
        // collapsed; the real URL stays authoritative and falls through
        // to the absolutized form below.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = canonical.as_str();
        while let Some((status, target)) = self.redirects.get(current) {
            if !is_permanent_redirect(*status) {
                break;
            }
            if !seen.insert(current) {
                break;
            }
            current = target;
            if let Some(filename) = self.filename_for(current) {
                return Some(format!("./{}{}", rel_path(filename, from_dir), fragment));
            }
        }

        // Not stored, but known: pin the absolutized form so links that
        // were relative still work offline. Unknown URLs are left alone;
        // in particular links already rewritten by an earlier run must
        // not be mangled a second time.
        if self.url_usage.contains_key(&canonical) {
            return Some(absolute.to_string());
        }
        None
    }

    /// Rewrite links in stored files. With `for_url`, only that document
    /// and the documents referencing it are touched; with `None`, every
    /// URL encountered this run is. Returns how many files changed.
    pub fn convert_links(&self, for_url: Option<&str>) -> Result<usize, MirrorError> {
        let targets: Vec<String> = match for_url {
            Some(url) => {
                let mut set: BTreeSet<String> = BTreeSet::new();
                set.insert(url.to_string());
                if let Some(referrers) = self.url_usage.get(url) {
                    set.extend(referrers.iter().cloned());
                }
                set.into_iter()
                    .filter(|u| self.encountered.contains_key(u))
                    .collect()
            }
            None => self.encountered.keys().cloned().collect(),
        };

        let mut changed = 0;
        for url in targets {
            if self.convert_file(&url)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn convert_file(&self, url: &str) -> Result<bool, MirrorError> {
        let Some(info) = self.url_info.get(url) else {
            return Ok(false);
        };
        let Some(kind) = parser_for(&info.mimetype) else {
            return Ok(false);
        };
        let Some(filename) = self.filename_for(url) else {
            return Ok(false);
        };
        let path = self.root.join(filename);
        if !path.is_file() {
            return Ok(false);
        }
        let data = fs::read(&path)?;

        let base = Url::parse(&info.base_url)
            .or_else(|_| Url::parse(url))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "unusable base url")
            })?;
        let from_dir = match filename.rfind('/') {
            Some(idx) => filename[..idx].to_string(),
            None => String::new(),
        };
        let replacer = |absolute: &str| self.replacement_for(absolute, &from_dir);
        let rewritten = kind
            .rewrite(&data, &base, &replacer)
            .map_err(|source| MirrorError::Rewrite {
                url: url.to_string(),
                source,
            })?;

        if rewritten != data {
            fs::write(&path, rewritten)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove every stored file that was not encountered in this run,
    /// prune emptied directories, and bring the maps and the reverse
    /// index back in line. Afterwards the stored URLs are exactly the
    /// encountered ones.
    pub fn delete_unencountered(&mut self) -> Result<Vec<String>, MirrorError> {
        let mut deleted = Vec::new();
        for (url, files) in &self.stored_urls {
            let keep = self.encountered.get(url);
            for file in files {
                if Some(file) != keep {
                    self.remove_file(file)?;
                    deleted.push(file.clone());
                }
            }
        }

        let mut stored = BTreeMap::new();
        let mut info = BTreeMap::new();
        for url in self.stored_urls.keys() {
            if let Some(kept) = self.encountered.get(url) {
                stored.insert(url.clone(), BTreeSet::from([kept.clone()]));
                if let Some(i) = self.url_info.get(url) {
                    info.insert(url.clone(), i.clone());
                }
            }
        }
        self.stored_urls = stored;
        self.url_info = info;
        self.rebuild_usage();
        self.persist_all()?;
        Ok(deleted)
    }

    fn remove_file(&self, filename: &str) -> Result<(), MirrorError> {
        for root in [
            self.root.clone(),
            self.root.join(Config::BACKUP_DIR),
        ] {
            let path = root.join(filename);
            match fs::remove_file(&path) {
                Ok(()) => self.prune_empty_dirs(path.parent(), &root),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn prune_empty_dirs(&self, mut dir: Option<&Path>, stop: &Path) {
        while let Some(d) = dir {
            if d == stop || !d.starts_with(stop) {
                break;
            }
            let empty = fs::read_dir(d).map(|mut it| it.next().is_none()).unwrap_or(false);
            if !empty || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Generate a root `index.html` listing everything in the mirror.
    pub fn write_index(&self) -> Result<(), MirrorError> {
        let mut html = String::from(
            "<!DOCTYPE html>\n<html>\n<head><title>Mirror index</title></head>\n<body>\n<ol>\n",
        );
        for (url, files) in &self.stored_urls {
            if let Some(filename) = files.iter().next() {
                html.push_str(&format!(
                    "<li><a href=\"{filename}\">{url}</a></li>\n"
                ));
            }
        }
        html.push_str("</ol>\n</body>\n</html>\n");
        fs::write(self.root.join(Config::INDEX_FILE), html)?;
        Ok(())
    }

    /// End-of-run work: the full conversion pass and the index page.
    pub fn finish(&self) -> Result<(), MirrorError> {
        if self.options.convert_links {
            self.convert_links(None)?;
        }
        self.write_index()?;
        Ok(())
    }
}

/// Relative path from a directory (given as a `/`-joined mirror-relative
/// string, empty for the mirror root) to a target file.
fn rel_path(target: &str, from_dir: &str) -> String {
    let target_parts: Vec<&str> = target.split('/').collect();
    let from_parts: Vec<&str> = if from_dir.is_empty() {
        Vec::new()
    } else {
        from_dir.split('/').collect()
    };
    let shared = target_parts
        .iter()
        .zip(from_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    // Never let the filename itself count as a shared directory.
    let shared = shared.min(target_parts.len().saturating_sub(1));
    let mut parts: Vec<&str> = Vec::new();
    for _ in shared..from_parts.len() {
        parts.push("..");
    }
    parts.extend(&target_parts[shared..]);
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkArena;
    use crate::network::FetchKind;
    use tempfile::TempDir;

    fn response(mimetype: &str, body: &[u8]) -> FetchedResponse {
        FetchedResponse {
            url: "http://example.org/".into(),
            status: 200,
            kind: FetchKind::Full,
            content_type: Some(mimetype.to_string()),
            content_length: Some(body.len() as u64),
            etag: None,
            last_modified: None,
            expires: None,
            link_headers: vec![],
            redirects: vec![],
            body: Some(body.to_vec()),
        }
    }

    fn filename(url: &str, mimetype: &str) -> String {
        Mirror::get_filename(&Url::parse(url).unwrap(), mimetype)
    }

    #[test]
    fn test_get_filename() {
        assert_eq!(filename("http://example.org/", "text/html"), "example.org/index.html");
        assert_eq!(
            filename("http://example.org/foo.html", "text/html"),
            "example.org/foo.html"
        );
        // A mismatched extension is fixed from the mimetype.
        assert_eq!(
            filename("http://example.org/foo.php", "text/html"),
            "example.org/foo.html"
        );
        // An alias extension is left alone.
        assert_eq!(
            filename("http://example.org/foo.htm", "text/html"),
            "example.org/foo.htm"
        );
        assert_eq!(
            filename("http://example.org/dir/sub/", "text/html"),
            "example.org/dir/sub/index.html"
        );
        // Unknown mimetypes change nothing.
        assert_eq!(
            filename("http://example.org/data.bin", "application/x-thing"),
            "example.org/data.bin"
        );
        assert_eq!(
            filename("http://example.org:8080/x", "text/css"),
            "example.org_8080/x.css"
        );
    }

    #[test]
    fn test_get_filename_query_hash() {
        let a = filename("http://example.org/page?x=1", "text/html");
        let b = filename("http://example.org/page?x=2", "text/html");
        assert_ne!(a, b);
        assert!(a.starts_with("example.org/page_"));
        assert!(a.ends_with(".html"));
        assert_eq!(
            filename("http://example.org/page?x=1", "text/html"),
            a,
            "deterministic"
        );
    }

    #[test]
    fn test_rel_path() {
        assert_eq!(rel_path("example.org/index.html", "example.org"), "index.html");
        assert_eq!(rel_path("example.org/a/b.css", "example.org"), "a/b.css");
        assert_eq!(rel_path("example.org/x.png", "example.org/a"), "../x.png");
        assert_eq!(rel_path("other.org/x.png", "example.org"), "../other.org/x.png");
        assert_eq!(rel_path("index.html", ""), "index.html");
    }

    fn seed_link(arena: &mut LinkArena, url: &str) -> Link {
        let id = arena.add_seed(url).unwrap();
        arena.get(id).clone()
    }

    #[test]
    fn test_add_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        {
            let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
            let link = seed_link(&mut arena, "http://example.org/");
            let links = vec![(
                "http://example.org/a".to_string(),
                LinkOpts::default(),
            )];
            mirror
                .add(&link, &response("text/html", b"<a href=\"/a\">x</a>"), &links)
                .unwrap();
            assert!(mirror.is_encountered("http://example.org/"));
            assert!(dir.path().join("example.org/index.html").is_file());
        }
        // A fresh instance sees the persisted maps; encounters are
        // run-scoped and start empty.
        let mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert_eq!(mirror.stored_count(), 1);
        assert!(!mirror.is_encountered("http://example.org/"));
        assert!(mirror.has_stored("http://example.org/"));
        assert!(mirror
            .url_usage
            .get("http://example.org/a")
            .map(|refs| refs.contains("http://example.org/"))
            .unwrap_or(false));
    }

    #[test]
    fn test_stored_links_rewritten_relative_with_fragment() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();

        let body = br#"<a href="https://EXAMPLE.ORG/#FOO">x</a>"#;
        let link = seed_link(&mut arena, "https://example.org/");
        let links = vec![("https://EXAMPLE.ORG/#FOO".to_string(), LinkOpts::default())];
        mirror.add(&link, &response("text/html", body), &links).unwrap();
        mirror.finish().unwrap();

        let stored = fs::read_to_string(dir.path().join("example.org/index.html")).unwrap();
        assert_eq!(stored, r#"<a href="./index.html#FOO">x</a>"#);
    }

    #[test]
    fn test_unstored_links_absolutized_with_original_scheme() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();

        let body = br#"<a href="/PATH#FOO">x</a>"#;
        let link = seed_link(&mut arena, "https://example.org/");
        let links = vec![("https://example.org/PATH#FOO".to_string(), LinkOpts::default())];
        mirror.add(&link, &response("text/html", body), &links).unwrap();
        mirror.finish().unwrap();

        let stored = fs::read_to_string(dir.path().join("example.org/index.html")).unwrap();
        assert_eq!(stored, r#"<a href="https://example.org/PATH#FOO">x</a>"#);
    }

    #[test]
    fn test_unknown_links_left_alone() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();

        // The document claims no outgoing links, so the one in the body
        // is unknown to url_usage and must not be touched. This is what
        // protects already-relativized links on a second run.
        let body = br#"<a href="./index.html#FOO">x</a>"#;
        let link = seed_link(&mut arena, "http://example.org/");
        mirror.add(&link, &response("text/html", body), &[]).unwrap();
        mirror.finish().unwrap();

        let stored = fs::read_to_string(dir.path().join("example.org/index.html")).unwrap();
        assert_eq!(stored, r#"<a href="./index.html#FOO">x</a>"#);
    }

    #[test]
    fn test_permanent_redirect_to_stored_file() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();

        let target = seed_link(&mut arena, "http://example.org/new");
        mirror
            .add(&target, &response("text/html", b"target"), &[])
            .unwrap();

        let body = br#"<a href="/old">x</a><a href="/moved">y</a>"#;
        let page = seed_link(&mut arena, "http://example.org/");
        let links = vec![
            ("http://example.org/old".to_string(), LinkOpts::default()),
            ("http://example.org/moved".to_string(), LinkOpts::default()),
        ];
        mirror.add(&page, &response("text/html", body), &links).unwrap();
        mirror.add_redirect("http://example.org/old", 301, "http://example.org/new");
        mirror.add_redirect("http://example.org/moved", 302, "http://example.org/new");
        mirror.finish().unwrap();

        let stored = fs::read_to_string(dir.path().join("example.org/index.html")).unwrap();
        // 301 points at the stored copy; 302 is not collapsed, but the
        // link is absolutized so it still works from the mirrored file.
        assert_eq!(
            stored,
            r#"<a href="./new.html">x</a><a href="http://example.org/moved">y</a>"#
        );
    }

    #[test]
    fn test_convert_links_bounded_to_referrers() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(
            dir.path(),
            MirrorOptions {
                write_at_once: false,
                ..MirrorOptions::default()
            },
        )
        .unwrap();

        // A references B; C references only D.
        let a = seed_link(&mut arena, "http://example.org/a");
        mirror
            .add(
                &a,
                &response("text/html", br#"<a href="/b">b</a>"#),
                &[("http://example.org/b".to_string(), LinkOpts::default())],
            )
            .unwrap();
        let b = seed_link(&mut arena, "http://example.org/b");
        mirror.add(&b, &response("text/html", b"leaf"), &[]).unwrap();
        let c = seed_link(&mut arena, "http://example.org/c");
        mirror
            .add(
                &c,
                &response("text/html", br#"<a href="/d">d</a>"#),
                &[("http://example.org/d".to_string(), LinkOpts::default())],
            )
            .unwrap();

        mirror.convert_links(Some("http://example.org/b")).unwrap();

        let a_file = fs::read_to_string(dir.path().join("example.org/a.html")).unwrap();
        let c_file = fs::read_to_string(dir.path().join("example.org/c.html")).unwrap();
        assert_eq!(a_file, r#"<a href="./b.html">b</a>"#);
        // C is not a referrer of B and keeps its raw bytes.
        assert_eq!(c_file, r#"<a href="/d">d</a>"#);
    }

    #[test]
    fn test_delete_unencountered() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        {
            let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
            let a = seed_link(&mut arena, "http://example.org/keep");
            mirror.add(&a, &response("text/html", b"keep"), &[]).unwrap();
            let b = seed_link(&mut arena, "http://example.org/sub/drop");
            mirror.add(&b, &response("text/html", b"drop"), &[]).unwrap();
        }

        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert!(mirror.encounter_url("http://example.org/keep"));
        let deleted = mirror.delete_unencountered().unwrap();

        assert_eq!(deleted, vec!["example.org/sub/drop.html".to_string()]);
        assert!(dir.path().join("example.org/keep.html").is_file());
        assert!(!dir.path().join("example.org/sub").exists(), "pruned");
        assert_eq!(mirror.stored_count(), 1);

        // The pruning survives a reload.
        drop(mirror);
        let mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert_eq!(mirror.stored_count(), 1);
        assert!(!mirror.has_stored("http://example.org/sub/drop"));
    }

    #[test]
    fn test_backups_keep_pristine_copies() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(
            dir.path(),
            MirrorOptions {
                backups: true,
                ..MirrorOptions::default()
            },
        )
        .unwrap();

        let body = br#"<a href="/b">b</a>"#;
        let a = seed_link(&mut arena, "http://example.org/a");
        mirror
            .add(
                &a,
                &response("text/html", body),
                &[("http://example.org/b".to_string(), LinkOpts::default())],
            )
            .unwrap();
        let b = seed_link(&mut arena, "http://example.org/b");
        mirror.add(&b, &response("text/html", b"leaf"), &[]).unwrap();
        mirror.finish().unwrap();

        let converted =
            fs::read_to_string(dir.path().join("example.org/a.html")).unwrap();
        let backup = fs::read(
            dir.path()
                .join(Config::BACKUP_DIR)
                .join("example.org/a.html"),
        )
        .unwrap();
        assert_eq!(converted, r#"<a href="./b.html">b</a>"#);
        assert_eq!(backup, body);
    }

    #[test]
    fn test_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert_eq!(mirror.get_info("options").unwrap(), None);
        mirror.set_info("options", "{\"x\":1}").unwrap();
        drop(mirror);
        let mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert_eq!(
            mirror.get_info("options").unwrap().as_deref(),
            Some("{\"x\":1}")
        );
    }

    #[test]
    fn test_is_valid_mirror() {
        let dir = TempDir::new().unwrap();
        assert!(!Mirror::is_valid_mirror(dir.path()));
        let _ = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        assert!(Mirror::is_valid_mirror(dir.path()));
    }

    #[test]
    fn test_write_index() {
        let dir = TempDir::new().unwrap();
        let mut arena = LinkArena::new();
        let mut mirror = Mirror::open(dir.path(), MirrorOptions::default()).unwrap();
        let a = seed_link(&mut arena, "http://example.org/a");
        mirror.add(&a, &response("text/html", b"x"), &[]).unwrap();
        mirror.write_index().unwrap();
        let index = fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(index.contains(r#"<a href="example.org/a.html">http://example.org/a</a>"#));
    }
}
