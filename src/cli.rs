use std::fs;

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::mirror::MirrorOptions;
use crate::rules::{RuleError, RuleSet};
use crate::spider::{DownloadSkip, SpiderRules};

/// Shortcuts accepted by `--user-agent`.
const USER_AGENTS: &[(&str, &str)] = &[
    (
        "chrome",
        "Mozilla/5.0 (Windows NT 6.2; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/30.0.1599.17 Safari/537.36",
    ),
    (
        "firefox",
        "Mozilla/5.0 (Windows NT 6.1; Win64; x64; rv:25.0) Gecko/20100101 Firefox/25.0",
    ),
    (
        "ie",
        "Mozilla/5.0 (compatible; MSIE 10.6; Windows NT 6.1; Trident/5.0; InfoPath.2; SLCC1; .NET CLR 3.0.4506.2152; .NET CLR 3.5.30729; .NET CLR 2.0.50727) 3gpp-gba UNTRUSTED/1.0",
    ),
    (
        "safari",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_6_8) AppleWebKit/537.13+ (KHTML, like Gecko) Version/5.1.7 Safari/534.57.2",
    ),
];

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("at least one starting url is required")]
    NoSeeds,
    #[error("stored options could not be read: {0}")]
    Options(#[from] serde_json::Error),
}

/// The option surface. The whole struct is serialized into the mirror's
/// `info` table so `--update` can replay a run without repeating it.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "trawl")]
#[command(about = "Mirror websites into a local directory, driven by rules")]
#[command(version)]
pub struct Cli {
    /// Urls added to the queue as starting points.
    #[arg(value_name = "url")]
    pub urls: Vec<String>,

    /// Add urls from a file, one per line; can be given multiple times.
    #[arg(short = 'F', long, value_name = "FILE", action = ArgAction::Append)]
    pub from_file: Vec<String>,

    /// Output directory for the mirror.
    #[arg(short = 'O', long, default_value = "tracked")]
    pub path: String,

    /// Do not modify urls in the local copy in any way.
    #[arg(long)]
    pub no_link_conversion: bool,

    /// Store an unmodified copy of each file, unaffected by link
    /// conversion and deletion.
    #[arg(long)]
    pub backups: bool,

    /// Delay local mirror modifications until the spider is done.
    #[arg(long)]
    pub no_live_update: bool,

    /// Use the command line options stored when the mirror was created.
    #[arg(short = 'U', long)]
    pub update: bool,

    /// Delete local files the spider no longer encounters.
    #[arg(long)]
    pub enable_delete: bool,

    /// Do not check whether an existing file changed on the server.
    #[arg(long)]
    pub no_modified_check: bool,

    /// Skip checking files for updates while the Expires header allows.
    #[arg(long)]
    pub trust_expires: bool,

    /// User agent string; 'chrome', 'firefox', 'ie' and 'safari' are
    /// recognized shortcuts.
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Rules deciding whether a url is downloaded. Default: only the
    /// starting urls and their page requisites.
    #[arg(
        long,
        value_name = "RULE",
        action = ArgAction::Append,
        allow_hyphen_values = true,
        default_values = ["-", "+requisite"]
    )]
    pub follow: Vec<String>,

    /// Rules deciding whether a downloaded url is kept.
    #[arg(
        long,
        value_name = "RULE",
        action = ArgAction::Append,
        allow_hyphen_values = true,
        default_values = ["+"]
    )]
    pub save: Vec<String>,

    /// Rules that stop a url's links from being walked.
    #[arg(
        long,
        value_name = "RULE",
        action = ArgAction::Append,
        allow_hyphen_values = true,
        default_values = ["-"]
    )]
    pub stop: Vec<String>,
}

impl Cli {
    /// Expand user-agent shortcuts; fall back to our own identity.
    pub fn resolved_user_agent(&self) -> String {
        match &self.user_agent {
            Some(choice) => USER_AGENTS
                .iter()
                .find(|(name, _)| name == choice)
                .map(|(_, ua)| ua.to_string())
                .unwrap_or_else(|| choice.clone()),
            None => Config::DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Starting urls from the command line plus any `--from-file` lists.
    pub fn load_seeds(&self) -> Result<Vec<String>, CliError> {
        let mut seeds: Vec<String> = self.urls.clone();
        for filename in &self.from_file {
            let content = fs::read_to_string(filename)?;
            seeds.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }
        if seeds.is_empty() {
            return Err(CliError::NoSeeds);
        }
        Ok(seeds)
    }

    pub fn skip_mode(&self) -> DownloadSkip {
        if self.no_modified_check {
            DownloadSkip::Exists
        } else if self.trust_expires {
            DownloadSkip::TrustExpires
        } else {
            DownloadSkip::Never
        }
    }

    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            convert_links: !self.no_link_conversion,
            // With deletion active, rewriting waits for the end of the
            // run; otherwise links could point at files deleted later.
            write_at_once: !self.no_live_update && !self.enable_delete,
            backups: self.backups,
        }
    }

    /// Parse the three rule chains. Bad rules are reported before any
    /// network traffic happens.
    pub fn rule_sets(&self) -> Result<SpiderRules, RuleError> {
        Ok(SpiderRules {
            follow: RuleSet::parse(&self.follow)?,
            save: RuleSet::parse(&self.save)?,
            stop: RuleSet::parse(&self.stop)?,
        })
    }

    /// Adopt a stored option set, keeping the mirror location from the
    /// current invocation.
    pub fn replay(self, stored: Cli) -> Cli {
        Cli {
            path: self.path,
            update: true,
            ..stored
        }
    }
}
