//! Campaign breakdowns over persisted page rows.
//!
//! Every ratio here returns 0 for an empty denominator.

use std::collections::{BTreeSet, HashMap};

use crate::queue::dimension::UtmParams;
use crate::store::PageRow;

/// Share of `part` in `total` as a percentage rounded to one decimal.
pub fn percentage(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round1(part as f64 / total as f64 * 100.0)
}

/// `total / count` rounded to one decimal.
pub fn average(total: i64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    round1(total as f64 / count as f64)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// One campaign parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtmField {
    Source,
    Medium,
    Campaign,
    Term,
    Content,
}

impl UtmField {
    pub const ALL: [UtmField; 5] = [
        Self::Source,
        Self::Medium,
        Self::Campaign,
        Self::Term,
        Self::Content,
    ];

    pub fn value(self, utm: &UtmParams) -> Option<&str> {
        match self {
            Self::Source => utm.source.as_deref(),
            Self::Medium => utm.medium.as_deref(),
            Self::Campaign => utm.campaign.as_deref(),
            Self::Term => utm.term.as_deref(),
            Self::Content => utm.content.as_deref(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "utm_source",
            Self::Medium => "utm_medium",
            Self::Campaign => "utm_campaign",
            Self::Term => "utm_term",
            Self::Content => "utm_content",
        }
    }
}

/// Views for one value of a campaign parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct UtmShare {
    pub value: String,
    pub total: i64,
    /// Share among rows where the parameter is set.
    pub percentage: f64,
}

/// Groups rows by one campaign parameter, ignoring rows without it.
/// Highest total first.
pub fn utm_breakdown(rows: &[PageRow], field: UtmField) -> Vec<UtmShare> {
    let mut totals: HashMap<&str, i64> = HashMap::new();
    for row in rows {
        if let Some(value) = field.value(&row.dimension.utm) {
            *totals.entry(value).or_default() += row.total;
        }
    }

    let sum: i64 = totals.values().sum();
    let mut shares: Vec<UtmShare> = totals
        .into_iter()
        .map(|(value, total)| UtmShare {
            value: value.to_string(),
            total,
            percentage: percentage(total, sum),
        })
        .collect();
    shares.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.value.cmp(&b.value)));
    shares
}

/// Views for one (campaign, source, medium) combination.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignPerformance {
    pub campaign: String,
    pub source: Option<String>,
    pub medium: Option<String>,
    pub total: i64,
    /// Distinct pages reached by the campaign.
    pub pages_count: u64,
    pub avg_per_page: f64,
}

impl CampaignPerformance {
    /// "source / medium", dropping a missing side, or "Direct" if both
    /// are missing.
    pub fn source_medium(&self) -> String {
        match (self.source.as_deref(), self.medium.as_deref()) {
            (Some(s), Some(m)) => format!("{s} / {m}"),
            (Some(v), None) | (None, Some(v)) => v.to_string(),
            (None, None) => "Direct".to_string(),
        }
    }
}

/// Per-campaign totals for rows with a campaign set. Highest total first.
pub fn campaign_performance(rows: &[PageRow]) -> Vec<CampaignPerformance> {
    type Key<'a> = (&'a str, Option<&'a str>, Option<&'a str>);

    let mut groups: HashMap<Key<'_>, (i64, BTreeSet<Option<&str>>)> = HashMap::new();
    for row in rows {
        let utm = &row.dimension.utm;
        let Some(campaign) = utm.campaign.as_deref() else {
            continue;
        };
        let entry = groups
            .entry((campaign, utm.source.as_deref(), utm.medium.as_deref()))
            .or_default();
        entry.0 += row.total;
        entry.1.insert(row.dimension.page.as_deref());
    }

    let mut out: Vec<CampaignPerformance> = groups
        .into_iter()
        .map(|((campaign, source, medium), (total, pages))| {
            let pages_count = pages.len() as u64;
            CampaignPerformance {
                campaign: campaign.to_string(),
                source: source.map(str::to_string),
                medium: medium.map(str::to_string),
                total,
                pages_count,
                avg_per_page: average(total, pages_count),
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.total
            .cmp(&a.total)
            .then_with(|| a.campaign.cmp(&b.campaign))
    });
    out
}

/// Headline campaign numbers for a set of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct UtmOverview {
    pub total_views: i64,
    /// Views carrying a utm_source.
    pub utm_views: i64,
    pub utm_percentage: f64,
    pub unique_campaigns: usize,
    pub unique_sources: usize,
    /// Page with the most views carrying a utm_source.
    pub top_landing_page: Option<String>,
}

pub fn utm_overview(rows: &[PageRow]) -> UtmOverview {
    let total_views: i64 = rows.iter().map(|r| r.total).sum();

    let mut utm_views = 0;
    let mut campaigns = BTreeSet::new();
    let mut sources = BTreeSet::new();
    let mut landing: HashMap<&str, i64> = HashMap::new();

    for row in rows {
        let utm = &row.dimension.utm;
        if let Some(campaign) = utm.campaign.as_deref() {
            campaigns.insert(campaign);
        }
        if let Some(source) = utm.source.as_deref() {
            sources.insert(source);
            utm_views += row.total;
            if let Some(page) = row.dimension.page.as_deref() {
                *landing.entry(page).or_default() += row.total;
            }
        }
    }

    let top_landing_page = landing
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(page, _)| page.to_string());

    UtmOverview {
        total_views,
        utm_views,
        utm_percentage: percentage(utm_views, total_views),
        unique_campaigns: campaigns.len(),
        unique_sources: sources.len(),
        top_landing_page,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::queue::dimension::PageDimension;

    fn row(page: &str, source: Option<&str>, medium: Option<&str>, campaign: Option<&str>, total: i64) -> PageRow {
        PageRow {
            date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date"),
            dimension: PageDimension {
                site: Some("site.test".to_string()),
                page: Some(page.to_string()),
                utm: UtmParams {
                    source: source.map(str::to_string),
                    medium: medium.map(str::to_string),
                    campaign: campaign.map(str::to_string),
                    ..Default::default()
                },
                ..Default::default()
            },
            total,
        }
    }

    #[test]
    fn test_percentage_zero_denominator() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(0, 0), 0.0);
        assert!(percentage(1, 0).is_finite());
    }

    #[test]
    fn test_percentage_rounds_to_one_decimal() {
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(3, 3), 100.0);
    }

    #[test]
    fn test_average_zero_count() {
        assert_eq!(average(10, 0), 0.0);
        assert_eq!(average(10, 4), 2.5);
    }

    #[test]
    fn test_utm_breakdown_ignores_unset() {
        let rows = vec![
            row("/", Some("google"), None, None, 3),
            row("/a", Some("google"), None, None, 1),
            row("/", Some("newsletter"), None, None, 4),
            row("/", None, None, None, 100),
        ];

        let shares = utm_breakdown(&rows, UtmField::Source);
        assert_eq!(
            shares,
            vec![
                UtmShare {
                    value: "google".to_string(),
                    total: 4,
                    percentage: 50.0
                },
                UtmShare {
                    value: "newsletter".to_string(),
                    total: 4,
                    percentage: 50.0
                },
            ]
        );

        assert!(utm_breakdown(&rows, UtmField::Term).is_empty());
    }

    #[test]
    fn test_campaign_performance() {
        let rows = vec![
            row("/a", Some("google"), Some("cpc"), Some("summer"), 6),
            row("/b", Some("google"), Some("cpc"), Some("summer"), 3),
            row("/a", None, None, Some("winter"), 2),
            row("/", Some("google"), Some("cpc"), None, 50),
        ];

        let perf = campaign_performance(&rows);
        assert_eq!(perf.len(), 2);

        assert_eq!(perf[0].campaign, "summer");
        assert_eq!(perf[0].total, 9);
        assert_eq!(perf[0].pages_count, 2);
        assert_eq!(perf[0].avg_per_page, 4.5);
        assert_eq!(perf[0].source_medium(), "google / cpc");

        assert_eq!(perf[1].campaign, "winter");
        assert_eq!(perf[1].source_medium(), "Direct");
    }

    #[test]
    fn test_source_medium_single_side() {
        let perf = CampaignPerformance {
            campaign: "c".to_string(),
            source: None,
            medium: Some("email".to_string()),
            total: 0,
            pages_count: 0,
            avg_per_page: average(0, 0),
        };
        assert_eq!(perf.source_medium(), "email");
        assert_eq!(perf.avg_per_page, 0.0);
    }

    #[test]
    fn test_utm_overview() {
        let rows = vec![
            row("/landing", Some("google"), None, Some("summer"), 3),
            row("/other", Some("bing"), None, None, 1),
            row("/", None, None, None, 6),
        ];

        let overview = utm_overview(&rows);
        assert_eq!(overview.total_views, 10);
        assert_eq!(overview.utm_views, 4);
        assert_eq!(overview.utm_percentage, 40.0);
        assert_eq!(overview.unique_campaigns, 1);
        assert_eq!(overview.unique_sources, 2);
        assert_eq!(overview.top_landing_page.as_deref(), Some("/landing"));
    }

    #[test]
    fn test_utm_overview_empty() {
        let overview = utm_overview(&[]);
        assert_eq!(overview.total_views, 0);
        assert_eq!(overview.utm_percentage, 0.0);
        assert!(overview.top_landing_page.is_none());
    }
}
