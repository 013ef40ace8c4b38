use std::collections::HashMap;

use crate::event::browser::BrowserClassifier;
use crate::event::referrer::split_referrer;
use crate::event::RequestEvent;

/// Which tuple layout a buffer key carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Page,
    Browser,
}

impl EventKind {
    /// Number of fields in the tuple for this kind.
    pub const fn arity(self) -> usize {
        match self {
            Self::Page => PageDimension::ARITY,
            Self::Browser => BrowserDimension::ARITY,
        }
    }

    /// Field positions holding host names, which are case-folded.
    pub const fn host_positions(self) -> &'static [usize] {
        match self {
            Self::Page => &[0, 2],
            Self::Browser => &[0],
        }
    }

    /// Returns the label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Browser => "browser",
        }
    }
}

/// Marketing campaign parameters taken from the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

impl UtmParams {
    /// Query parameter names recognised as campaign dimensions.
    pub const KEYS: [&'static str; 5] = [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
    ];

    /// Extracts the five campaign parameters, ignoring every other key.
    /// Empty values are treated as absent.
    pub fn from_query(query: Option<&HashMap<String, String>>) -> Self {
        let Some(query) = query else {
            return Self::default();
        };
        let get = |key: &str| present(query.get(key).map(String::as_str));

        Self {
            source: get("utm_source"),
            medium: get("utm_medium"),
            campaign: get("utm_campaign"),
            term: get("utm_term"),
            content: get("utm_content"),
        }
    }

    /// Returns true when no campaign parameter is set.
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }
}

/// Dimension tuple for a page view.
///
/// Field order is fixed: site, page, referrer host, referrer path, then
/// the five UTM fields. Every position is always encoded, so a null in
/// one position can never shift the meaning of the fields after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PageDimension {
    pub site: Option<String>,
    pub page: Option<String>,
    pub referrer_host: Option<String>,
    pub referrer_path: Option<String>,
    pub utm: UtmParams,
}

impl PageDimension {
    pub const ARITY: usize = 9;

    /// Builds the page tuple from an inbound request. Extraction never
    /// fails: anything that cannot be read becomes a null dimension.
    pub fn from_request(event: &RequestEvent) -> Self {
        let (referrer_host, referrer_path) = event
            .referrer
            .as_deref()
            .map(split_referrer)
            .unwrap_or((None, None));

        Self {
            site: Some(event.host.clone()),
            page: Some(event.path.clone()),
            referrer_host,
            referrer_path,
            utm: UtmParams::from_query(event.query.as_ref()),
        }
        .normalized()
    }

    /// Borrowed view of the fields in wire order.
    pub fn fields(&self) -> [Option<&str>; Self::ARITY] {
        [
            self.site.as_deref(),
            self.page.as_deref(),
            self.referrer_host.as_deref(),
            self.referrer_path.as_deref(),
            self.utm.source.as_deref(),
            self.utm.medium.as_deref(),
            self.utm.campaign.as_deref(),
            self.utm.term.as_deref(),
            self.utm.content.as_deref(),
        ]
    }

    /// Rebuilds a tuple from fields in wire order. Missing trailing
    /// fields are null.
    pub fn from_fields(fields: Vec<Option<String>>) -> Self {
        let mut it = fields.into_iter();
        let mut next = || it.next().flatten();

        Self {
            site: next(),
            page: next(),
            referrer_host: next(),
            referrer_path: next(),
            utm: UtmParams {
                source: next(),
                medium: next(),
                campaign: next(),
                term: next(),
                content: next(),
            },
        }
    }

    /// Applies the normalization rules used by both write paths.
    pub fn normalized(&self) -> Self {
        Self::from_fields(normalize_fields(EventKind::Page, &self.fields()))
    }
}

/// Dimension tuple for a browser identity: site, browser name, version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BrowserDimension {
    pub site: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

impl BrowserDimension {
    pub const ARITY: usize = 3;

    /// Builds the browser tuple from an inbound request.
    pub fn from_request(event: &RequestEvent, classifier: &dyn BrowserClassifier) -> Self {
        let info = classifier.classify(event.user_agent.as_deref().unwrap_or_default());

        Self {
            site: Some(event.host.clone()),
            name: Some(info.name),
            version: Some(info.version),
        }
        .normalized()
    }

    pub fn fields(&self) -> [Option<&str>; Self::ARITY] {
        [
            self.site.as_deref(),
            self.name.as_deref(),
            self.version.as_deref(),
        ]
    }

    pub fn from_fields(fields: Vec<Option<String>>) -> Self {
        let mut it = fields.into_iter();
        let mut next = || it.next().flatten();

        Self {
            site: next(),
            name: next(),
            version: next(),
        }
    }

    pub fn normalized(&self) -> Self {
        Self::from_fields(normalize_fields(EventKind::Browser, &self.fields()))
    }
}

/// A decoded or freshly extracted tuple of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimensionRecord {
    Page(PageDimension),
    Browser(BrowserDimension),
}

impl DimensionRecord {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Page(_) => EventKind::Page,
            Self::Browser(_) => EventKind::Browser,
        }
    }

    /// Field values in wire order.
    pub fn fields(&self) -> Vec<Option<&str>> {
        match self {
            Self::Page(d) => d.fields().to_vec(),
            Self::Browser(d) => d.fields().to_vec(),
        }
    }

    pub fn normalized(&self) -> Self {
        match self {
            Self::Page(d) => Self::Page(d.normalized()),
            Self::Browser(d) => Self::Browser(d.normalized()),
        }
    }

    /// Rebuilds a record of the given kind from wire-order fields.
    pub fn from_fields(kind: EventKind, fields: Vec<Option<String>>) -> Self {
        match kind {
            EventKind::Page => Self::Page(PageDimension::from_fields(fields)),
            EventKind::Browser => Self::Browser(BrowserDimension::from_fields(fields)),
        }
    }
}

/// Lowercases host positions and maps empty strings to null.
pub fn normalize_fields(kind: EventKind, fields: &[Option<&str>]) -> Vec<Option<String>> {
    let hosts = kind.host_positions();
    fields
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            present(*value).map(|v| {
                if hosts.contains(&idx) {
                    v.to_lowercase()
                } else {
                    v
                }
            })
        })
        .collect()
}

/// Returns an owned value only when the input is non-empty.
fn present(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
