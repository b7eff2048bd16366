// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // HTTP/Network config
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MAX_RETRIES: u32 = 5;
    pub const MAX_REDIRECTS: usize = 10;
    pub const DEFAULT_USER_AGENT: &'static str = concat!("trawl/", env!("CARGO_PKG_VERSION"));

    // Mirror layout
    pub const DATA_DIR: &'static str = ".track";
    pub const BACKUP_DIR: &'static str = ".originals";
    pub const DB_FILE: &'static str = "mirror.redb";
    pub const INDEX_FILE: &'static str = "index.html";
    pub const MAX_SEGMENT_BYTES: usize = 255;
    pub const QUERY_HASH_LEN: usize = 8;
}
