/// The rule DSL that decides which links to follow, save and stop at.
///
/// A rule is `[+-][+-]?<test><op><value>`: an action sign, an optional
/// second sign marking a hard rule, a named test, and an optional
/// comparison. Rule sets evaluate left to right with last-match-wins; a
/// matching hard rule ends evaluation immediately. Tests that cannot
/// produce a value for a link (a probe hit a redirect) short-circuit to
/// "matched, allow" so the link is not lost before the spider has seen
/// the redirect itself.
use regex::Regex;
use thiserror::Error;

use crate::link::{LinkArena, LinkId, Resolution};
use crate::mirror::Mirror;
use crate::network::{FetchKind, Resolver};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule must start with + or -: '{0}'")]
    MissingAction(String),
    #[error("unknown test '{test}' in rule '{rule}'")]
    UnknownTest { test: String, rule: String },
    #[error("unknown operator '{op}' in rule '{rule}'")]
    UnknownOperator { op: String, rule: String },
    #[error("bad pattern in rule '{rule}': {source}")]
    BadPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Everything a rule test may need besides the link itself.
pub struct EvalCtx<'a> {
    pub arena: &'a mut LinkArena,
    pub mirror: Option<&'a Mirror>,
    pub resolver: Resolver<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Truth,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// A value produced by a named test, compared against the user's string.
#[derive(Debug, Clone, PartialEq)]
pub enum TestValue {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Value(TestValue),
    /// The test cannot answer for this link (e.g. a probe ran into a
    /// redirect; the target will be re-evaluated on its own).
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTest {
    Default,
    Requisite,
    Depth,
    DomainDepth,
    OriginalDomain,
    SameDomain,
    Down,
    PathLevel,
    PathDistance,
    PathDistanceToOriginal,
    Url,
    Protocol,
    Domain,
    Port,
    Path,
    Filename,
    Extension,
    Querystring,
    Fragment,
    Tag,
    ContentType,
    Size,
    Content,
}

impl RuleTest {
    fn by_name(name: &str) -> Option<RuleTest> {
        Some(match name {
            "" => RuleTest::Default,
            "requisite" => RuleTest::Requisite,
            "depth" => RuleTest::Depth,
            "domain-depth" => RuleTest::DomainDepth,
            "original-domain" => RuleTest::OriginalDomain,
            "same-domain" => RuleTest::SameDomain,
            "down" => RuleTest::Down,
            "path-level" => RuleTest::PathLevel,
            "path-distance" => RuleTest::PathDistance,
            "path-distance-to-original" => RuleTest::PathDistanceToOriginal,
            "url" => RuleTest::Url,
            "protocol" => RuleTest::Protocol,
            "domain" => RuleTest::Domain,
            "port" => RuleTest::Port,
            "path" => RuleTest::Path,
            "filename" => RuleTest::Filename,
            "extension" => RuleTest::Extension,
            "querystring" => RuleTest::Querystring,
            "fragment" => RuleTest::Fragment,
            "tag" => RuleTest::Tag,
            "content-type" => RuleTest::ContentType,
            "size" => RuleTest::Size,
            "content" => RuleTest::Content,
            _ => return None,
        })
    }

    async fn eval(&self, id: LinkId, ctx: &mut EvalCtx<'_>) -> TestOutcome {
        use TestOutcome::Value;
        use TestValue::{Bool, Int, Str};

        let link = ctx.arena.get(id);
        match self {
            RuleTest::Default => Value(Bool(true)),
            RuleTest::Requisite => {
                // The url only counts as a requisite if the document that
                // inlined it actually made it into the mirror.
                if !link.info.inline {
                    return Value(Bool(false));
                }
                let Some(prev) = link.previous else {
                    return Value(Bool(false));
                };
                let prev_url = ctx.arena.get(prev).url.clone();
                let saved = ctx
                    .mirror
                    .map_or(false, |m| m.is_encountered(&prev_url));
                Value(Bool(saved))
            }
            RuleTest::Depth => Value(Int(link.depth as i64)),
            RuleTest::DomainDepth => Value(Int(link.domain_depth as i64)),
            RuleTest::OriginalDomain => {
                let root = ctx.arena.get(link.root);
                Value(Bool(netloc(&link.parsed) == netloc(&root.parsed)))
            }
            RuleTest::SameDomain => match link.previous {
                None => Value(Bool(true)),
                Some(prev) => {
                    let prev = ctx.arena.get(prev);
                    Value(Bool(netloc(&link.parsed) == netloc(&prev.parsed)))
                }
            },
            RuleTest::Down => {
                if link.previous.is_none() {
                    return Value(Bool(true));
                }
                let root = ctx.arena.get(link.root);
                match path_distance(&link.parsed, &root.parsed) {
                    Some(d) => Value(Bool(d >= 0)),
                    None => Value(Bool(false)),
                }
            }
            RuleTest::PathLevel => Value(Int(path_level(link.parsed.path()))),
            RuleTest::PathDistance => {
                let Some(prev) = link.previous else {
                    return Value(Int(0));
                };
                let prev = ctx.arena.get(prev);
                match path_distance(&link.parsed, &prev.parsed) {
                    Some(d) => Value(Int(d)),
                    None => Value(Bool(false)),
                }
            }
            RuleTest::PathDistanceToOriginal => {
                if link.previous.is_none() {
                    return Value(Int(0));
                }
                let root = ctx.arena.get(link.root);
                match path_distance(&link.parsed, &root.parsed) {
                    Some(d) => Value(Int(d)),
                    None => Value(Bool(false)),
                }
            }
            RuleTest::Url => Value(Str(link.url.clone())),
            RuleTest::Protocol => Value(Str(link.lossy.protocol.clone())),
            RuleTest::Domain => Value(Str(netloc(&link.parsed))),
            RuleTest::Port => Value(Int(link.parsed.port().map(i64::from).unwrap_or(80))),
            RuleTest::Path => {
                let path = link.parsed.path();
                Value(Str(if path.is_empty() { "/" } else { path }.to_string()))
            }
            RuleTest::Filename => Value(Str(basename(link.parsed.path()).to_string())),
            RuleTest::Extension => {
                Value(Str(extension(basename(link.parsed.path())).to_string()))
            }
            RuleTest::Querystring => {
                Value(Str(link.parsed.query().unwrap_or("").to_string()))
            }
            RuleTest::Fragment => {
                Value(Str(link.lossy.fragment.clone().unwrap_or_default()))
            }
            RuleTest::Tag => Value(match &link.info.tag {
                Some(tag) => Str(tag.clone()),
                None => Str(String::new()),
            }),
            RuleTest::ContentType => {
                let EvalCtx { arena, resolver, .. } = ctx;
                match resolver
                    .resolve(arena.get_mut(id), FetchKind::Head, None)
                    .await
                {
                    Resolution::Failed(_) => Value(TestValue::None),
                    Resolution::Fetched(r) => match r.mimetype() {
                        Some(m) => Value(Str(m)),
                        None => Value(TestValue::None),
                    },
                }
            }
            RuleTest::Size => {
                let EvalCtx { arena, resolver, .. } = ctx;
                let (redirected, length) = {
                    match resolver
                        .resolve(arena.get_mut(id), FetchKind::Head, None)
                        .await
                    {
                        Resolution::Failed(_) => return Value(TestValue::None),
                        Resolution::Fetched(r) => (r.is_redirect(), r.content_length),
                    }
                };
                if redirected {
                    return TestOutcome::Unavailable;
                }
                if let Some(len) = length {
                    return Value(Int(len as i64));
                }
                // No length in the headers; the body has to be fetched.
                match resolver
                    .resolve(arena.get_mut(id), FetchKind::Full, None)
                    .await
                {
                    Resolution::Failed(_) => Value(TestValue::None),
                    Resolution::Fetched(r) => {
                        if r.is_redirect() {
                            return TestOutcome::Unavailable;
                        }
                        match (&r.body, r.content_length) {
                            (Some(body), _) => Value(Int(body.len() as i64)),
                            (_, Some(len)) => Value(Int(len as i64)),
                            _ => Value(TestValue::None),
                        }
                    }
                }
            }
            RuleTest::Content => {
                let EvalCtx { arena, resolver, .. } = ctx;
                match resolver
                    .resolve(arena.get_mut(id), FetchKind::Full, None)
                    .await
                {
                    Resolution::Failed(_) => Value(TestValue::None),
                    Resolution::Fetched(r) => {
                        let text = r
                            .body
                            .as_deref()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default();
                        Value(Str(text))
                    }
                }
            }
        }
    }
}

fn netloc(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

fn extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[idx + 1..],
        _ => "",
    }
}

/// Directory level of a path: `/` and `/foo` are 0, `/foo/` and `/foo/bar`
/// are 1 and so on.
fn path_level(path: &str) -> i64 {
    (path.split('/').count() as i64) - 2
}

/// Segment chain of a path; a trailing filename counts as a potential
/// directory so that `/foo` can be the ancestor of `/foo/bar`.
fn path_chain(path: &str) -> (Vec<&str>, i64) {
    let parts: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();
    match parts.last() {
        Some(&"") => {
            let dirs: Vec<&str> = parts[..parts.len() - 1].to_vec();
            let level = dirs.len() as i64;
            (dirs, level)
        }
        _ => {
            let level = parts.len() as i64 - 1;
            (parts, level)
        }
    }
}

/// Distance in directory levels between two URLs, or `None` when it is not
/// defined: different hosts, or paths that diverge (`/foo` vs `/bar`), or
/// paths sharing nothing at all.
fn path_distance(a: &url::Url, b: &url::Url) -> Option<i64> {
    if netloc(a) != netloc(b) {
        return None;
    }
    let (chain_a, level_a) = path_chain(a.path());
    let (chain_b, level_b) = path_chain(b.path());
    let shared = chain_a
        .iter()
        .zip(chain_b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    // One chain must be an ancestor of the other, and they must actually
    // share ground (the bare root is nobody's ancestor here).
    if shared < chain_a.len() && shared < chain_b.len() {
        return None;
    }
    if shared == 0 && !(chain_a.is_empty() && chain_b.is_empty()) {
        return None;
    }
    Some(level_a - level_b)
}

// --- Operators ---------------------------------------------------------

fn truthy(value: &TestValue) -> bool {
    match value {
        TestValue::None => false,
        TestValue::Bool(b) => *b,
        TestValue::Int(i) => *i != 0,
        TestValue::Str(s) => !s.is_empty(),
    }
}

/// False and None act as one "no value" entity: equal to each other,
/// unequal to everything else. This keeps `0` and `false` apart.
fn as_number(value: &TestValue) -> Option<f64> {
    match value {
        TestValue::None | TestValue::Bool(false) => None,
        TestValue::Bool(true) => Some(1.0),
        TestValue::Int(i) => Some(*i as f64),
        TestValue::Str(_) => None,
    }
}

/// Parse the user side of a comparison, honoring K/M/G suffixes
/// (case-insensitive, decimal units).
fn parse_user_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, factor) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1e3),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1e6),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1e9),
        _ => (value, 1.0),
    };
    digits.parse::<f64>().ok().map(|n| n * factor)
}

/// Translate a glob with `*` and `?` wildcards into an anchored regex.
fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut translated = String::with_capacity(pattern.len() * 2 + 2);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    glob_regex(pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn equality(system: &TestValue, user: &str) -> bool {
    if let TestValue::Str(s) = system {
        return glob_match(user, s);
    }
    numeric_equality(system, user)
}

fn numeric_equality(system: &TestValue, user: &str) -> bool {
    match (as_number(system), parse_user_number(user)) {
        (Option::None, Option::None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(system: &TestValue, user: &str, op: Op) -> bool {
    let system = match system {
        // Strings that carry numbers still compare numerically.
        TestValue::Str(s) => match s.parse::<f64>() {
            Ok(n) => Some(n),
            Err(_) => Option::None,
        },
        other => as_number(other),
    };
    match (system, parse_user_number(user)) {
        (Some(a), Some(b)) => match op {
            Op::Lt => a < b,
            Op::Gt => a > b,
            Op::Le => a <= b,
            Op::Ge => a >= b,
            _ => false,
        },
        _ => false,
    }
}

impl Op {
    pub fn apply(&self, system: &TestValue, user: &str) -> bool {
        match self {
            Op::Truth => truthy(system),
            Op::Eq => equality(system, user),
            Op::Ne => !equality(system, user),
            Op::Lt | Op::Gt | Op::Le | Op::Ge => compare(system, user, *self),
        }
    }
}

// --- Rules -------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Rule {
    pub allow: bool,
    /// A matching hard rule (doubled sign) ends evaluation.
    pub is_hard: bool,
    pub test: RuleTest,
    pub op: Op,
    pub value: String,
    /// Compiled once at parse time for `=`/`!=` rules; string values are
    /// matched against this instead of recompiling the glob per link.
    pattern: Option<Regex>,
    text: String,
}

impl Rule {
    /// Parse a single rule. The sign is mandatory, everything after it
    /// optional: `-`, `+depth<=3`, `++requisite`, `-url=*.pdf`.
    pub fn parse(text: &str) -> Result<Rule, RuleError> {
        let mut chars = text.chars().peekable();
        let sign = match chars.next() {
            Some(c @ ('+' | '-')) => c,
            _ => return Err(RuleError::MissingAction(text.to_string())),
        };
        let allow = sign == '+';
        // Only a doubled sign (`++`, `--`) marks a hard rule.
        let is_hard = chars.peek() == Some(&sign);
        if is_hard {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if matches!(c, '<' | '>' | '=' | '!' | '~') {
                break;
            }
            name.push(c);
            chars.next();
        }
        let mut op_text = String::new();
        while let Some(&c) = chars.peek() {
            if !matches!(c, '<' | '>' | '=' | '!' | '~') {
                break;
            }
            op_text.push(c);
            chars.next();
        }
        let value: String = chars.collect();

        let test = RuleTest::by_name(&name).ok_or_else(|| RuleError::UnknownTest {
            test: name.clone(),
            rule: text.to_string(),
        })?;
        let op = match op_text.as_str() {
            "" => Op::Truth,
            "=" => Op::Eq,
            "!=" => Op::Ne,
            "<" => Op::Lt,
            ">" => Op::Gt,
            "<=" => Op::Le,
            ">=" => Op::Ge,
            other => {
                return Err(RuleError::UnknownOperator {
                    op: other.to_string(),
                    rule: text.to_string(),
                })
            }
        };
        let pattern = match op {
            Op::Eq | Op::Ne => {
                Some(glob_regex(&value).map_err(|source| RuleError::BadPattern {
                    rule: text.to_string(),
                    source,
                })?)
            }
            _ => None,
        };
        Ok(Rule {
            allow,
            is_hard,
            test,
            op,
            value,
            pattern,
            text: text.to_string(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this rule's comparison holds for `system`.
    fn matches(&self, system: &TestValue) -> bool {
        let eq = |system: &TestValue| {
            if let TestValue::Str(s) = system {
                return self
                    .pattern
                    .as_ref()
                    .map_or(false, |re| re.is_match(s));
            }
            numeric_equality(system, &self.value)
        };
        match self.op {
            Op::Eq => eq(system),
            Op::Ne => !eq(system),
            _ => self.op.apply(system, &self.value),
        }
    }
}

/// One evaluated rule in a verdict trace.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: String,
    pub matched: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RuleVerdict {
    pub allow: bool,
    pub trace: Vec<RuleMatch>,
}

impl RuleVerdict {
    /// The rule that decided the verdict: the last one that matched.
    pub fn deciding_rule(&self) -> Option<&str> {
        self.trace
            .iter()
            .rev()
            .find(|m| m.matched)
            .map(|m| m.rule.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn parse(texts: &[String]) -> Result<RuleSet, RuleError> {
        let rules = texts
            .iter()
            .map(|t| Rule::parse(t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSet { rules })
    }

    /// Evaluate all rules against a link. No matching rule means deny.
    pub async fn apply(&self, id: LinkId, ctx: &mut EvalCtx<'_>) -> RuleVerdict {
        let mut verdict = RuleVerdict::default();
        for rule in &self.rules {
            match rule.test.eval(id, ctx).await {
                TestOutcome::Unavailable => {
                    // The link cannot be judged yet; let it through so the
                    // spider gets to see what it really is.
                    verdict.allow = true;
                    verdict.trace.push(RuleMatch {
                        rule: rule.text.clone(),
                        matched: true,
                    });
                }
                TestOutcome::Value(value) => {
                    let matched = rule.matches(&value);
                    verdict.trace.push(RuleMatch {
                        rule: rule.text.clone(),
                        matched,
                    });
                    if matched {
                        verdict.allow = rule.allow;
                        if rule.is_hard {
                            break;
                        }
                    }
                }
            }
        }
        verdict
    }
}
