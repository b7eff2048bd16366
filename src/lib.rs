//! trawl mirrors websites into a local directory.
//!
//! A crawl walks outward from user-supplied urls, with three rule chains
//! deciding what gets downloaded (`follow`), what gets kept (`save`) and
//! where the walk ends (`stop`). Stored documents are rewritten so the
//! copy is browsable offline, and the link database under `.track/`
//! makes later runs incremental: unchanged files are revalidated, not
//! re-downloaded.

pub mod cli;
pub mod config;
pub mod link;
pub mod logging;
pub mod mirror;
pub mod network;
pub mod parsers;
pub mod rules;
pub mod spider;
pub mod urlnorm;

pub use link::{Link, LinkArena, LinkId, LinkOpts};
pub use mirror::{Mirror, MirrorOptions};
pub use network::{FetchError, HttpTransport, Transport};
pub use rules::{RuleError, RuleSet};
pub use spider::{ConsoleEvents, DownloadSkip, Spider, SpiderEvents, SpiderRules};
pub use urlnorm::{normalize, InvalidUrl};
